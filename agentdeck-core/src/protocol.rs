//! Typed view of the agent's newline-delimited JSON output.
//!
//! Each stdout line is one document with a `type` discriminator:
//!
//! | `type` | Meaning |
//! |--------|---------|
//! | `thread.started` | Announces `thread_id` for later resumption |
//! | `turn.started` / `turn.completed` / `turn.failed` | Turn lifecycle |
//! | `error` | Stream-level error |
//! | `item.started` / `item.updated` / `item.completed` | Item lifecycle with a typed `item` |
//!
//! The event log always stores the original JSON; this module only
//! classifies it. Anything unrecognised (or recognised but malformed) maps
//! to an `Unknown` variant carrying the raw value so nothing is lost.

use serde::Deserialize;
use serde_json::Value;

/// One classified stdout document.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentMessage {
    ThreadStarted { thread_id: String },
    TurnStarted,
    TurnCompleted { usage: Option<Value> },
    TurnFailed { message: Option<String> },
    Error { message: String },
    Item { phase: ItemPhase, item: ThreadItem },
    Unknown(Value),
}

/// Lifecycle phase of an item event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemPhase {
    Started,
    Updated,
    Completed,
}

/// One entry of a todo list item, normalized.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, Deserialize)]
pub struct TodoItem {
    pub text: String,
    #[serde(default)]
    pub completed: bool,
}

/// Typed payload of `item.*` events.
#[derive(Debug, Clone, PartialEq)]
pub enum ThreadItem {
    AgentMessage {
        id: Option<String>,
        text: String,
    },
    Reasoning {
        id: Option<String>,
        text: String,
    },
    CommandExecution {
        id: Option<String>,
        command: String,
        status: Option<String>,
        exit_code: Option<i64>,
    },
    FileChange {
        id: Option<String>,
        paths: Vec<String>,
    },
    McpToolCall {
        id: Option<String>,
        server: Option<String>,
        tool: Option<String>,
    },
    WebSearch {
        id: Option<String>,
        query: Option<String>,
    },
    TodoList {
        id: Option<String>,
        items: Vec<TodoItem>,
    },
    Error {
        id: Option<String>,
        message: String,
    },
    Unknown(Value),
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct RawItem {
    id: Option<String>,
    text: Option<String>,
    command: Option<String>,
    status: Option<String>,
    exit_code: Option<i64>,
    changes: Vec<RawChange>,
    server: Option<String>,
    tool: Option<String>,
    query: Option<String>,
    items: Vec<RawTodo>,
    message: Option<String>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct RawChange {
    path: Option<String>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct RawTodo {
    text: Option<String>,
    completed: Option<bool>,
}

fn str_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(str::to_string)
}

impl AgentMessage {
    /// Classify a parsed stdout document.
    pub fn classify(value: &Value) -> Self {
        let Some(kind) = value.get("type").and_then(Value::as_str) else {
            return AgentMessage::Unknown(value.clone());
        };

        match kind {
            "thread.started" => match str_field(value, "thread_id") {
                Some(thread_id) if !thread_id.is_empty() => {
                    AgentMessage::ThreadStarted { thread_id }
                }
                _ => AgentMessage::Unknown(value.clone()),
            },
            "turn.started" => AgentMessage::TurnStarted,
            "turn.completed" => AgentMessage::TurnCompleted {
                usage: value.get("usage").cloned(),
            },
            "turn.failed" => AgentMessage::TurnFailed {
                message: value
                    .get("error")
                    .and_then(|e| str_field(e, "message"))
                    .or_else(|| str_field(value, "message")),
            },
            "error" => AgentMessage::Error {
                message: str_field(value, "message").unwrap_or_default(),
            },
            "item.started" | "item.updated" | "item.completed" => {
                let phase = match kind {
                    "item.started" => ItemPhase::Started,
                    "item.updated" => ItemPhase::Updated,
                    _ => ItemPhase::Completed,
                };
                match value.get("item") {
                    Some(item) => AgentMessage::Item {
                        phase,
                        item: ThreadItem::classify(item),
                    },
                    None => AgentMessage::Unknown(value.clone()),
                }
            }
            _ => AgentMessage::Unknown(value.clone()),
        }
    }
}

impl ThreadItem {
    pub fn classify(value: &Value) -> Self {
        let kind = value
            .get("type")
            .or_else(|| value.get("item_type"))
            .and_then(Value::as_str)
            .unwrap_or_default();
        let Ok(raw) = serde_json::from_value::<RawItem>(value.clone()) else {
            return ThreadItem::Unknown(value.clone());
        };
        let id = raw.id;

        match kind {
            "agent_message" => ThreadItem::AgentMessage {
                id,
                text: raw.text.unwrap_or_default(),
            },
            "reasoning" => ThreadItem::Reasoning {
                id,
                text: raw.text.unwrap_or_default(),
            },
            "command_execution" => ThreadItem::CommandExecution {
                id,
                command: raw.command.unwrap_or_default(),
                status: raw.status,
                exit_code: raw.exit_code,
            },
            "file_change" => ThreadItem::FileChange {
                id,
                paths: raw.changes.into_iter().filter_map(|c| c.path).collect(),
            },
            "mcp_tool_call" => ThreadItem::McpToolCall {
                id,
                server: raw.server,
                tool: raw.tool,
            },
            "web_search" => ThreadItem::WebSearch {
                id,
                query: raw.query,
            },
            "todo_list" => ThreadItem::TodoList {
                id,
                items: normalize_todos(raw.items),
            },
            "error" => ThreadItem::Error {
                id,
                message: raw.message.unwrap_or_default(),
            },
            _ => ThreadItem::Unknown(value.clone()),
        }
    }
}

/// Trim text, drop blank entries, default `completed` to false.
fn normalize_todos(items: Vec<RawTodo>) -> Vec<TodoItem> {
    items
        .into_iter()
        .filter_map(|item| {
            let text = item.text?.trim().to_string();
            if text.is_empty() {
                return None;
            }
            Some(TodoItem {
                text,
                completed: item.completed.unwrap_or(false),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_thread_started() {
        let msg = AgentMessage::classify(&json!({"type": "thread.started", "thread_id": "t-1"}));
        assert_eq!(
            msg,
            AgentMessage::ThreadStarted {
                thread_id: "t-1".into()
            }
        );
    }

    #[test]
    fn test_thread_started_without_id_is_unknown() {
        let raw = json!({"type": "thread.started"});
        assert_eq!(AgentMessage::classify(&raw), AgentMessage::Unknown(raw));
    }

    #[test]
    fn test_turn_failed_message() {
        let msg = AgentMessage::classify(
            &json!({"type": "turn.failed", "error": {"message": "quota exceeded"}}),
        );
        assert_eq!(
            msg,
            AgentMessage::TurnFailed {
                message: Some("quota exceeded".into())
            }
        );
    }

    #[test]
    fn test_todo_list_is_normalized() {
        let msg = AgentMessage::classify(&json!({
            "type": "item.updated",
            "item": {
                "id": "item_3",
                "type": "todo_list",
                "items": [
                    {"text": "  write tests ", "completed": true},
                    {"text": ""},
                    {"text": "ship"}
                ]
            }
        }));
        assert_eq!(
            msg,
            AgentMessage::Item {
                phase: ItemPhase::Updated,
                item: ThreadItem::TodoList {
                    id: Some("item_3".into()),
                    items: vec![
                        TodoItem {
                            text: "write tests".into(),
                            completed: true
                        },
                        TodoItem {
                            text: "ship".into(),
                            completed: false
                        },
                    ],
                },
            }
        );
    }

    #[test]
    fn test_file_change_paths() {
        let item = ThreadItem::classify(&json!({
            "id": "item_1",
            "type": "file_change",
            "changes": [{"path": "src/lib.rs", "kind": "update"}, {"kind": "add"}]
        }));
        assert_eq!(
            item,
            ThreadItem::FileChange {
                id: Some("item_1".into()),
                paths: vec!["src/lib.rs".into()]
            }
        );
    }

    #[test]
    fn test_unknown_discriminators_are_preserved() {
        let raw = json!({"type": "session.configured", "model": "gpt-5"});
        assert_eq!(AgentMessage::classify(&raw), AgentMessage::Unknown(raw.clone()));

        let item = json!({"type": "image_view", "path": "a.png"});
        assert_eq!(ThreadItem::classify(&item), ThreadItem::Unknown(item.clone()));
    }
}
