//! Tool surface exposed to the realtime voice model.
//!
//! Each function call delegates to the same agent pool the text bridge
//! uses. Results come back as JSON for the model plus a short rendered
//! markdown of the assistant's latest reply, so the voice assistant can
//! speak what the coding agent wrote.

use crate::agent::types::{MessageWithParts, PromptPart};
use crate::agent::AgentClient;
use crate::bridge::cancel::AbortReason;
use crate::state::SharedState;
use crate::voice::realtime::FunctionCall;
use serde_json::{json, Value};
use std::path::Path;

/// Cap on the spoken summary passed back to the model.
const SUMMARY_CHAR_LIMIT: usize = 1200;

/// Function declarations for the realtime session setup.
pub fn declarations() -> Vec<Value> {
    vec![
        json!({
            "name": "submit_message",
            "description": "Send a prompt to the coding agent. Uses the given chat, or the most recent one.",
            "parameters": {
                "type": "object",
                "properties": {
                    "message": {"type": "string", "description": "The prompt to send"},
                    "chat_id": {"type": "string", "description": "Optional chat (session) id"}
                },
                "required": ["message"]
            }
        }),
        json!({
            "name": "create_new_chat",
            "description": "Start a fresh chat (agent session) for this project.",
            "parameters": {
                "type": "object",
                "properties": {
                    "title": {"type": "string", "description": "Optional chat title"}
                }
            }
        }),
        json!({
            "name": "list_chats",
            "description": "List recent chats (agent sessions) for this project.",
            "parameters": {"type": "object", "properties": {}}
        }),
        json!({
            "name": "read_session_messages",
            "description": "Read the assistant's latest answer in a chat.",
            "parameters": {
                "type": "object",
                "properties": {
                    "chat_id": {"type": "string", "description": "Chat (session) id"}
                },
                "required": ["chat_id"]
            }
        }),
        json!({
            "name": "search_files",
            "description": "Fuzzy-search file paths in the project.",
            "parameters": {
                "type": "object",
                "properties": {
                    "query": {"type": "string", "description": "Path fragment to search for"}
                },
                "required": ["query"]
            }
        }),
        json!({
            "name": "abort_chat",
            "description": "Abort the running turn in a chat.",
            "parameters": {
                "type": "object",
                "properties": {
                    "chat_id": {"type": "string", "description": "Chat (session) id"}
                },
                "required": ["chat_id"]
            }
        }),
        json!({
            "name": "get_models",
            "description": "List the models the coding agent can use.",
            "parameters": {"type": "object", "properties": {}}
        }),
    ]
}

/// Execute one tool call. Returns the JSON response for the model and an
/// optional spoken-summary back-channel note.
pub async fn execute(
    state: &SharedState,
    directory: &Path,
    call: &FunctionCall,
) -> (Value, Option<String>) {
    match execute_inner(state, directory, call).await {
        Ok((value, summary)) => (json!({"result": value}), summary),
        Err(error) => {
            tracing::warn!(%error, tool = %call.name, "voice tool failed");
            (json!({"error": error.to_string()}), None)
        }
    }
}

async fn execute_inner(
    state: &SharedState,
    directory: &Path,
    call: &FunctionCall,
) -> crate::Result<(Value, Option<String>)> {
    let client = state.agents.client_for(directory).await?;
    let args = &call.args;

    match call.name.as_str() {
        "submit_message" => {
            let message = args["message"].as_str().unwrap_or_default().to_owned();
            let session_id = match args["chat_id"].as_str() {
                Some(id) => id.to_owned(),
                None => latest_session_id(&client).await?,
            };
            client
                .prompt(
                    &session_id,
                    vec![PromptPart::Text { text: message }],
                    None,
                )
                .await?;
            let summary = last_assistant_markdown(&client, &session_id).await?;
            Ok((
                json!({"chat_id": session_id, "status": "completed"}),
                Some(summary),
            ))
        }
        "create_new_chat" => {
            let title = args["title"].as_str();
            let session = client.create_session(title).await?;
            Ok((json!({"chat_id": session.id, "title": session.title}), None))
        }
        "list_chats" => {
            let mut sessions = client.list_sessions().await?;
            sessions.sort_by_key(|s| std::cmp::Reverse(s.time.updated));
            let list: Vec<Value> = sessions
                .iter()
                .take(10)
                .map(|s| json!({"chat_id": s.id, "title": s.title}))
                .collect();
            Ok((json!(list), None))
        }
        "read_session_messages" => {
            let session_id = args["chat_id"].as_str().unwrap_or_default();
            let summary = last_assistant_markdown(&client, session_id).await?;
            Ok((json!({"text": summary.clone()}), Some(summary)))
        }
        "search_files" => {
            let query = args["query"].as_str().unwrap_or_default();
            let files = client.find_files(query).await?;
            Ok((json!(files), None))
        }
        "abort_chat" => {
            let session_id = args["chat_id"].as_str().unwrap_or_default();
            state.aborts.abort(session_id, AbortReason::UserAbort);
            client.abort(session_id).await?;
            Ok((json!({"status": "aborted"}), None))
        }
        "get_models" => {
            let catalog = client.providers().await?;
            let models: Vec<String> = catalog
                .providers
                .iter()
                .flat_map(|provider| {
                    provider
                        .models
                        .keys()
                        .map(move |model| format!("{}/{model}", provider.id))
                })
                .collect();
            Ok((json!(models), None))
        }
        other => Err(anyhow::anyhow!("unknown tool: {other}").into()),
    }
}

async fn latest_session_id(client: &AgentClient) -> crate::Result<String> {
    let mut sessions = client.list_sessions().await?;
    sessions.sort_by_key(|s| std::cmp::Reverse(s.time.updated));
    match sessions.into_iter().next() {
        Some(session) => Ok(session.id),
        None => Ok(client.create_session(None).await?.id),
    }
}

/// Short rendered markdown of the assistant's last message in a session.
async fn last_assistant_markdown(
    client: &AgentClient,
    session_id: &str,
) -> crate::Result<String> {
    let messages = client.messages(session_id).await?;
    let rendered = render_last_assistant(&messages);
    Ok(crate::truncate_chars(&rendered, SUMMARY_CHAR_LIMIT).to_owned())
}

fn render_last_assistant(messages: &[MessageWithParts]) -> String {
    let Some(last) = messages
        .iter()
        .rev()
        .find(|message| message.info.role == "assistant")
    else {
        return "No assistant reply yet.".to_owned();
    };

    let rendered: Vec<String> = last
        .parts
        .iter()
        .map(crate::format::render_part)
        .filter(|text| !text.is_empty())
        .collect();
    if rendered.is_empty() {
        "The assistant has not replied with text yet.".to_owned()
    } else {
        rendered.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::types::{MessageInfo, Part, PartDetail};

    fn message(role: &str, text: &str) -> MessageWithParts {
        MessageWithParts {
            info: MessageInfo {
                id: "msg".into(),
                session_id: "ses".into(),
                role: role.into(),
                model_id: None,
                provider_id: None,
                tokens: None,
            },
            parts: vec![Part {
                id: "prt".into(),
                message_id: "msg".into(),
                session_id: "ses".into(),
                detail: PartDetail::Text { text: text.into() },
            }],
        }
    }

    #[test]
    fn declarations_cover_the_whole_surface() {
        let names: Vec<String> = declarations()
            .iter()
            .map(|d| d["name"].as_str().unwrap().to_owned())
            .collect();
        assert_eq!(
            names,
            vec![
                "submit_message",
                "create_new_chat",
                "list_chats",
                "read_session_messages",
                "search_files",
                "abort_chat",
                "get_models",
            ]
        );
    }

    #[test]
    fn last_assistant_reply_wins() {
        let messages = vec![
            message("assistant", "older"),
            message("user", "question"),
            message("assistant", "newest"),
        ];
        assert_eq!(render_last_assistant(&messages), "newest");
    }

    #[test]
    fn missing_assistant_reply_is_reported() {
        let messages = vec![message("user", "hello")];
        assert_eq!(render_last_assistant(&messages), "No assistant reply yet.");
    }
}
