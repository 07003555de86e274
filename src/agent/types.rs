//! Wire types for the opencode HTTP API and its event stream.
//!
//! Field names mirror the server's JSON exactly (`sessionID`, `messageID`,
//! `callID`). Unknown event types and part types deserialize into catch-all
//! variants so a newer agent never breaks the bridge.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// An agent-owned session.
#[derive(Debug, Clone, Deserialize)]
pub struct Session {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub directory: String,
    #[serde(default)]
    pub version: String,
    pub time: TimeInfo,
    #[serde(default)]
    pub share: Option<ShareInfo>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct TimeInfo {
    #[serde(default)]
    pub created: i64,
    #[serde(default)]
    pub updated: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ShareInfo {
    pub url: String,
}

/// A project known to the agent.
#[derive(Debug, Clone, Deserialize)]
pub struct Project {
    pub id: String,
    #[serde(default)]
    pub worktree: String,
    #[serde(default)]
    pub time: TimeInfo,
}

/// Message metadata, without its parts.
#[derive(Debug, Clone, Deserialize)]
pub struct MessageInfo {
    pub id: String,
    #[serde(rename = "sessionID")]
    pub session_id: String,
    pub role: String,
    #[serde(default, rename = "modelID")]
    pub model_id: Option<String>,
    #[serde(default, rename = "providerID")]
    pub provider_id: Option<String>,
    #[serde(default)]
    pub tokens: Option<TokenUsage>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub input: u64,
    #[serde(default)]
    pub output: u64,
    #[serde(default)]
    pub reasoning: u64,
    #[serde(default)]
    pub cache: CacheUsage,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct CacheUsage {
    #[serde(default)]
    pub read: u64,
    #[serde(default)]
    pub write: u64,
}

impl TokenUsage {
    /// Total tokens counted against the model's context window.
    pub fn total(&self) -> u64 {
        self.input + self.output + self.reasoning + self.cache.read + self.cache.write
    }
}

/// A message with its ordered parts, as returned by
/// `GET /session/{id}/message`.
#[derive(Debug, Clone, Deserialize)]
pub struct MessageWithParts {
    pub info: MessageInfo,
    #[serde(default)]
    pub parts: Vec<Part>,
}

/// One typed fragment of a message.
#[derive(Debug, Clone, Deserialize)]
pub struct Part {
    pub id: String,
    #[serde(rename = "messageID")]
    pub message_id: String,
    #[serde(rename = "sessionID")]
    pub session_id: String,
    #[serde(flatten)]
    pub detail: PartDetail,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum PartDetail {
    Text {
        #[serde(default)]
        text: String,
    },
    Reasoning {
        #[serde(default)]
        text: String,
    },
    File {
        #[serde(default)]
        filename: Option<String>,
        #[serde(default)]
        mime: String,
        #[serde(default)]
        url: String,
    },
    Tool {
        tool: String,
        #[serde(default, rename = "callID")]
        call_id: String,
        state: ToolState,
    },
    Agent {
        #[serde(default)]
        name: String,
    },
    Snapshot {
        #[serde(default)]
        snapshot: String,
    },
    StepStart,
    StepFinish,
    Patch,
    #[serde(other)]
    Unknown,
}

/// Lifecycle state of a tool invocation.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ToolState {
    Pending {
        #[serde(default)]
        input: Value,
    },
    Running {
        #[serde(default)]
        input: Value,
        #[serde(default)]
        title: Option<String>,
    },
    Completed {
        #[serde(default)]
        input: Value,
        #[serde(default)]
        output: String,
        #[serde(default)]
        title: Option<String>,
        #[serde(default)]
        metadata: Value,
    },
    Error {
        #[serde(default)]
        input: Value,
        #[serde(default)]
        error: String,
    },
}

impl ToolState {
    pub fn input(&self) -> &Value {
        match self {
            ToolState::Pending { input }
            | ToolState::Running { input, .. }
            | ToolState::Completed { input, .. }
            | ToolState::Error { input, .. } => input,
        }
    }
}

/// A pending permission request surfaced by the agent.
#[derive(Debug, Clone, Deserialize)]
pub struct PermissionInfo {
    pub id: String,
    #[serde(rename = "sessionID")]
    pub session_id: String,
    #[serde(default, rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub pattern: Option<Value>,
    #[serde(default)]
    pub metadata: Value,
}

impl PermissionInfo {
    /// Pattern rendered for humans; handles both string and list shapes.
    pub fn pattern_text(&self) -> Option<String> {
        match self.pattern.as_ref()? {
            Value::String(s) => Some(s.clone()),
            Value::Array(items) => {
                let parts: Vec<&str> = items.iter().filter_map(Value::as_str).collect();
                if parts.is_empty() {
                    None
                } else {
                    Some(parts.join(", "))
                }
            }
            _ => None,
        }
    }
}

/// Events from `GET /event`, filtered down to what the bridge consumes.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", content = "properties")]
pub enum AgentEvent {
    #[serde(rename = "message.updated")]
    MessageUpdated { info: MessageInfo },
    #[serde(rename = "message.part.updated")]
    PartUpdated { part: Part },
    #[serde(rename = "session.error")]
    SessionError {
        #[serde(default, rename = "sessionID")]
        session_id: Option<String>,
        #[serde(default)]
        error: Option<SessionError>,
    },
    #[serde(rename = "permission.updated")]
    PermissionUpdated(PermissionInfo),
    #[serde(rename = "permission.replied")]
    PermissionReplied {
        #[serde(rename = "sessionID")]
        session_id: String,
    },
    #[serde(rename = "session.idle")]
    SessionIdle {
        #[serde(rename = "sessionID")]
        session_id: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SessionError {
    #[serde(default)]
    pub data: SessionErrorData,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SessionErrorData {
    #[serde(default)]
    pub message: String,
}

/// Input parts accepted by `POST /session/{id}/message`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PromptPart {
    Text { text: String },
    File {
        mime: String,
        filename: String,
        url: String,
    },
}

/// Provider catalog from `GET /config/providers`.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderList {
    #[serde(default)]
    pub providers: Vec<Provider>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Provider {
    pub id: String,
    #[serde(default)]
    pub models: HashMap<String, Model>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Model {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub limit: ModelLimit,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct ModelLimit {
    #[serde(default)]
    pub context: u64,
    #[serde(default)]
    pub output: u64,
}

impl ProviderList {
    /// Context window for `provider/model`, if the catalog knows it.
    pub fn context_limit(&self, provider_id: &str, model_id: &str) -> Option<u64> {
        let provider = self.providers.iter().find(|p| p.id == provider_id)?;
        let model = provider.models.get(model_id)?;
        (model.limit.context > 0).then_some(model.limit.context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_tool_part() {
        let raw = serde_json::json!({
            "id": "prt_1",
            "messageID": "msg_1",
            "sessionID": "ses_1",
            "type": "tool",
            "callID": "call_1",
            "tool": "bash",
            "state": {"status": "running", "input": {"command": "ls"}, "time": {"start": 1}}
        });
        let part: Part = serde_json::from_value(raw).unwrap();
        match part.detail {
            PartDetail::Tool { ref tool, ref state, .. } => {
                assert_eq!(tool, "bash");
                assert!(matches!(state, ToolState::Running { .. }));
            }
            ref other => panic!("expected tool part, got {other:?}"),
        }
    }

    #[test]
    fn unknown_part_types_do_not_fail() {
        let raw = serde_json::json!({
            "id": "prt_2",
            "messageID": "msg_1",
            "sessionID": "ses_1",
            "type": "some-future-part"
        });
        let part: Part = serde_json::from_value(raw).unwrap();
        assert!(matches!(part.detail, PartDetail::Unknown));
    }

    #[test]
    fn deserializes_part_updated_event() {
        let raw = serde_json::json!({
            "type": "message.part.updated",
            "properties": {
                "part": {
                    "id": "prt_3",
                    "messageID": "msg_2",
                    "sessionID": "ses_1",
                    "type": "text",
                    "text": "hello"
                },
                "sessionID": "ses_1"
            }
        });
        let event: AgentEvent = serde_json::from_value(raw).unwrap();
        match event {
            AgentEvent::PartUpdated { part } => {
                assert_eq!(part.id, "prt_3");
            }
            other => panic!("expected PartUpdated, got {other:?}"),
        }
    }

    #[test]
    fn unknown_events_map_to_other() {
        let raw = serde_json::json!({"type": "lsp.client.diagnostics", "properties": {}});
        let event: AgentEvent = serde_json::from_value(raw).unwrap();
        assert!(matches!(event, AgentEvent::Other));
    }

    #[test]
    fn token_usage_total_includes_cache() {
        let usage = TokenUsage {
            input: 10,
            output: 5,
            reasoning: 2,
            cache: CacheUsage { read: 100, write: 3 },
        };
        assert_eq!(usage.total(), 120);
    }

    #[test]
    fn permission_pattern_handles_both_shapes() {
        let one = PermissionInfo {
            id: "p1".into(),
            session_id: "s".into(),
            kind: "bash".into(),
            title: String::new(),
            pattern: Some(serde_json::json!("rm -rf *")),
            metadata: Value::Null,
        };
        assert_eq!(one.pattern_text().as_deref(), Some("rm -rf *"));

        let many = PermissionInfo {
            pattern: Some(serde_json::json!(["a", "b"])),
            ..one
        };
        assert_eq!(many.pattern_text().as_deref(), Some("a, b"));
    }
}
