//! Rendering of agent message parts into Discord lines.
//!
//! Every part maps to a short one-liner (or nothing). An empty return value
//! means the part is suppressed entirely.

use crate::agent::types::{Part, PartDetail, ToolState};
use serde_json::Value;

/// Maximum characters shown per input value in the fallback tool summary.
const SUMMARY_VALUE_LIMIT: usize = 300;

/// Render one part to its Discord representation. Empty string → suppress.
pub fn render_part(part: &Part) -> String {
    match &part.detail {
        PartDetail::Text { text } => text.clone(),
        PartDetail::Reasoning { text } => {
            if text.trim().is_empty() {
                String::new()
            } else {
                "◼︎ thinking".to_owned()
            }
        }
        PartDetail::File { filename, .. } => {
            format!("📄 {}", filename.as_deref().unwrap_or("File"))
        }
        PartDetail::StepStart | PartDetail::StepFinish | PartDetail::Patch => String::new(),
        PartDetail::Agent { name } => format!("◼︎ agent {name}"),
        PartDetail::Snapshot { snapshot } => format!("◼︎ snapshot {snapshot}"),
        PartDetail::Tool { tool, state, .. } => render_tool(tool, state),
        PartDetail::Unknown => String::new(),
    }
}

fn render_tool(tool: &str, state: &ToolState) -> String {
    if tool == "todowrite" {
        return render_todo(state.input());
    }

    match state {
        ToolState::Pending { .. } => String::new(),
        ToolState::Running { input, title } => {
            let line = format!(
                "◼︎ {tool} {} {}",
                title.as_deref().unwrap_or(""),
                tool_summary(tool, input)
            );
            collapse_spaces(&line)
        }
        ToolState::Completed { input, title, metadata, .. } => {
            let line = format!(
                "◼︎ {tool} {} {}",
                title.as_deref().unwrap_or(""),
                tool_summary_with_metadata(tool, input, metadata)
            );
            collapse_spaces(&line)
        }
        ToolState::Error { input, error } => {
            let line = format!("⨯ {tool} _{error}_ {}", tool_summary(tool, input));
            collapse_spaces(&line)
        }
    }
}

/// Render the first in-progress todo as `{n}. **{content}**`.
fn render_todo(input: &Value) -> String {
    let todos = input.get("todos").and_then(Value::as_array);
    let Some(todos) = todos else {
        return String::new();
    };
    for (index, todo) in todos.iter().enumerate() {
        let status = todo.get("status").and_then(Value::as_str).unwrap_or("");
        if status == "in_progress" {
            let content = todo.get("content").and_then(Value::as_str).unwrap_or("");
            return format!("{}. **{content}**", index + 1);
        }
    }
    String::new()
}

fn tool_summary(tool: &str, input: &Value) -> String {
    tool_summary_with_metadata(tool, input, &Value::Null)
}

/// Short per-tool summary appended to the rendered line.
fn tool_summary_with_metadata(tool: &str, input: &Value, metadata: &Value) -> String {
    match tool {
        "edit" => {
            let filename = basename(str_field(input, "filePath"));
            let additions = metadata
                .get("additions")
                .and_then(Value::as_u64)
                .unwrap_or(0);
            let removals = metadata
                .get("removals")
                .and_then(Value::as_u64)
                .unwrap_or(0);
            format!("*{filename}* (+{additions}-{removals})")
        }
        "write" => {
            let filename = basename(str_field(input, "filePath"));
            let lines = str_field(input, "content").lines().count();
            let plural = if lines == 1 { "" } else { "s" };
            format!("*{filename}* ({lines} line{plural})")
        }
        "webfetch" => {
            let url = str_field(input, "url");
            let url = url
                .strip_prefix("https://")
                .or_else(|| url.strip_prefix("http://"))
                .unwrap_or(url);
            format!("*{url}*")
        }
        "read" | "list" | "glob" | "grep" => {
            let subject = ["filePath", "path", "pattern"]
                .iter()
                .map(|key| str_field(input, key))
                .find(|value| !value.is_empty())
                .unwrap_or("");
            if subject.is_empty() {
                String::new()
            } else {
                format!("*{subject}*")
            }
        }
        "bash" | "todoread" | "todowrite" => String::new(),
        "task" | "skill" => {
            let label = ["description", "name"]
                .iter()
                .map(|key| str_field(input, key))
                .find(|value| !value.is_empty())
                .unwrap_or("");
            if label.is_empty() {
                String::new()
            } else {
                format!("_{label}_")
            }
        }
        _ => generic_summary(input),
    }
}

/// Fallback: input key/value pairs, each value capped at 300 chars.
fn generic_summary(input: &Value) -> String {
    let Some(map) = input.as_object() else {
        return String::new();
    };
    let mut pairs: Vec<String> = Vec::with_capacity(map.len());
    for (key, value) in map {
        let rendered = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        let rendered = crate::truncate_chars(&rendered, SUMMARY_VALUE_LIMIT);
        pairs.push(format!("{key}={rendered}"));
    }
    pairs.join(" ")
}

fn str_field<'a>(input: &'a Value, key: &str) -> &'a str {
    input.get(key).and_then(Value::as_str).unwrap_or("")
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn collapse_spaces(line: &str) -> String {
    let collapsed = line.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed.trim_end().to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::types::PartDetail;

    fn part(detail: PartDetail) -> Part {
        Part {
            id: "prt_test".into(),
            message_id: "msg_test".into(),
            session_id: "ses_test".into(),
            detail,
        }
    }

    #[test]
    fn text_parts_render_verbatim() {
        let rendered = render_part(&part(PartDetail::Text {
            text: "hello **world**".into(),
        }));
        assert_eq!(rendered, "hello **world**");
    }

    #[test]
    fn empty_reasoning_is_suppressed() {
        assert_eq!(
            render_part(&part(PartDetail::Reasoning { text: "  ".into() })),
            ""
        );
        assert_eq!(
            render_part(&part(PartDetail::Reasoning {
                text: "pondering".into()
            })),
            "◼︎ thinking"
        );
    }

    #[test]
    fn file_part_falls_back_to_generic_label() {
        assert_eq!(
            render_part(&part(PartDetail::File {
                filename: None,
                mime: "image/png".into(),
                url: String::new(),
            })),
            "📄 File"
        );
    }

    #[test]
    fn step_markers_are_suppressed() {
        assert_eq!(render_part(&part(PartDetail::StepStart)), "");
        assert_eq!(render_part(&part(PartDetail::StepFinish)), "");
        assert_eq!(render_part(&part(PartDetail::Patch)), "");
    }

    #[test]
    fn pending_tool_is_suppressed() {
        let detail = PartDetail::Tool {
            tool: "bash".into(),
            call_id: "c1".into(),
            state: ToolState::Pending {
                input: serde_json::json!({}),
            },
        };
        assert_eq!(render_part(&part(detail)), "");
    }

    #[test]
    fn failed_tool_shows_the_error() {
        let detail = PartDetail::Tool {
            tool: "webfetch".into(),
            call_id: "c1".into(),
            state: ToolState::Error {
                input: serde_json::json!({"url": "https://example.com/x"}),
                error: "timed out".into(),
            },
        };
        assert_eq!(
            render_part(&part(detail)),
            "⨯ webfetch _timed out_ *example.com/x*"
        );
    }

    #[test]
    fn edit_summary_shows_diff_counts() {
        let detail = PartDetail::Tool {
            tool: "edit".into(),
            call_id: "c1".into(),
            state: ToolState::Completed {
                input: serde_json::json!({"filePath": "/proj/src/main.rs"}),
                output: String::new(),
                title: Some("Edit".into()),
                metadata: serde_json::json!({"additions": 4, "removals": 1}),
            },
        };
        assert_eq!(render_part(&part(detail)), "◼︎ edit Edit *main.rs* (+4-1)");
    }

    #[test]
    fn write_summary_counts_lines() {
        let detail = PartDetail::Tool {
            tool: "write".into(),
            call_id: "c1".into(),
            state: ToolState::Completed {
                input: serde_json::json!({
                    "filePath": "notes.md",
                    "content": "one\ntwo\nthree"
                }),
                output: String::new(),
                title: None,
                metadata: Value::Null,
            },
        };
        assert_eq!(render_part(&part(detail)), "◼︎ write *notes.md* (3 lines)");
    }

    #[test]
    fn bash_has_no_summary() {
        let detail = PartDetail::Tool {
            tool: "bash".into(),
            call_id: "c1".into(),
            state: ToolState::Running {
                input: serde_json::json!({"command": "cargo check"}),
                title: Some("Run cargo check".into()),
            },
        };
        assert_eq!(render_part(&part(detail)), "◼︎ bash Run cargo check");
    }

    #[test]
    fn todowrite_renders_first_in_progress_entry() {
        let detail = PartDetail::Tool {
            tool: "todowrite".into(),
            call_id: "c1".into(),
            state: ToolState::Completed {
                input: serde_json::json!({"todos": [
                    {"content": "done thing", "status": "completed"},
                    {"content": "current thing", "status": "in_progress"},
                    {"content": "later thing", "status": "pending"}
                ]}),
                output: String::new(),
                title: None,
                metadata: Value::Null,
            },
        };
        assert_eq!(render_part(&part(detail)), "2. **current thing**");
    }

    #[test]
    fn unknown_tool_lists_truncated_inputs() {
        let detail = PartDetail::Tool {
            tool: "customtool".into(),
            call_id: "c1".into(),
            state: ToolState::Running {
                input: serde_json::json!({"query": "x".repeat(400)}),
                title: None,
            },
        };
        let rendered = render_part(&part(detail));
        assert!(rendered.starts_with("◼︎ customtool query="));
        assert!(rendered.len() < 400);
    }
}
