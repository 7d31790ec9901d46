//! Chat/branch/checkpoint/message-node record types (spec.md §3).

use serde_json::Value;

use crate::memory::uuid6;

fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// `{ id, userId, title?, metadata?, createdAt, updatedAt }` (spec.md §3).
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Chat {
    pub id: String,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Chat {
    pub fn new(user_id: impl Into<String>) -> Self {
        let now = now_millis();
        Chat {
            id: uuid6::uuid6().to_string(),
            user_id: user_id.into(),
            title: None,
            metadata: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// An immutable message node: `{ id, chatId, parentId | null, name, type?, data, createdAt }`.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct MessageNode {
    pub id: String,
    pub chat_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<crate::fragment::FragmentKind>,
    pub data: Value,
    pub created_at: i64,
}

impl MessageNode {
    pub fn new(
        id: impl Into<String>,
        chat_id: impl Into<String>,
        parent_id: Option<String>,
        name: impl Into<String>,
        data: Value,
    ) -> Self {
        MessageNode {
            id: id.into(),
            chat_id: chat_id.into(),
            parent_id,
            name: name.into(),
            kind: Some(crate::fragment::FragmentKind::Message),
            data,
            created_at: now_millis(),
        }
    }
}

/// `{ id, chatId, name, headMessageId | null, isActive, createdAt }`.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Branch {
    pub id: String,
    pub chat_id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub head_message_id: Option<String>,
    pub is_active: bool,
    pub created_at: i64,
}

impl Branch {
    pub fn new(chat_id: impl Into<String>, name: impl Into<String>, is_active: bool) -> Self {
        Branch {
            id: uuid6::uuid6().to_string(),
            chat_id: chat_id.into(),
            name: name.into(),
            head_message_id: None,
            is_active,
            created_at: now_millis(),
        }
    }
}

/// `{ id, chatId, name, messageId, createdAt }`, unique by `(chatId, name)`.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Checkpoint {
    pub id: String,
    pub chat_id: String,
    pub name: String,
    pub message_id: String,
    pub created_at: i64,
}

impl Checkpoint {
    pub fn new(chat_id: impl Into<String>, name: impl Into<String>, message_id: impl Into<String>) -> Self {
        Checkpoint {
            id: uuid6::uuid6().to_string(),
            chat_id: chat_id.into(),
            name: name.into(),
            message_id: message_id.into(),
            created_at: now_millis(),
        }
    }
}

/// A full-text search hit: the matched message, a rank, and a short snippet (spec.md §4.1).
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SearchHit {
    pub message: MessageNode,
    pub rank: f64,
    pub snippet: String,
}

/// One message node in a [`GraphDump`]: parent, role, truncated preview, timestamp.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct GraphNode {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    pub role: String,
    pub content_preview: String,
    pub created_at: i64,
    pub deleted: bool,
}

/// The chat's complete message set plus branch/checkpoint pointers, for ASCII-art
/// visualization (spec.md §4.1 `getGraph`).
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct GraphDump {
    pub nodes: Vec<GraphNode>,
    pub branches: Vec<Branch>,
    pub checkpoints: Vec<Checkpoint>,
}

pub(crate) fn content_preview(data: &Value, max_len: usize) -> String {
    let text = data
        .get("text")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| data.to_string());
    if text.chars().count() <= max_len {
        text
    } else {
        text.chars().take(max_len).collect()
    }
}

pub(crate) fn snippet(text: &str, max_len: usize) -> String {
    if text.chars().count() <= max_len {
        text.to_string()
    } else {
        text.chars().take(max_len).collect()
    }
}
