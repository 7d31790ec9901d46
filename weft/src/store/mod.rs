//! Context Store (spec.md §4.1): the persistence layer behind the context engine.
//!
//! One narrow `ContextStore` async-trait; two backends ship, an in-memory map for tests
//! and the embedded default, and a `rusqlite`-backed embedded relational store. Both must
//! be transactional across multi-row operations, enforce `messageId != parentId` on
//! insert, bound chain walks to 10,000 hops, and cascade-delete a chat's messages,
//! branches, checkpoints, and FTS entries.

mod memory;
mod sqlite;

pub use memory::InMemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use serde_json::Value;

use crate::chat::{Branch, Chat, Checkpoint, GraphDump, MessageNode, SearchHit};
use crate::error::StoreError;

/// Chain walks bounded to this many hops guard against cycles introduced by backend bugs
/// (spec.md §4.1).
pub const MAX_CHAIN_DEPTH: usize = 10_000;

#[async_trait]
pub trait ContextStore: Send + Sync {
    async fn create_chat(&self, user_id: &str, metadata: Option<Value>) -> Result<Chat, StoreError>;
    async fn get_chat(&self, chat_id: &str) -> Result<Option<Chat>, StoreError>;
    /// Merges `metadata` into the chat's existing metadata only if it has never been
    /// merged before (spec.md §3: "merges initial options on first touch only").
    async fn merge_initial_metadata(
        &self,
        chat_id: &str,
        metadata: Value,
    ) -> Result<(), StoreError>;
    /// Deep-merges numeric usage fields additively into the chat's metadata.
    async fn track_usage(&self, chat_id: &str, usage: &Value) -> Result<(), StoreError>;
    /// Cascades to messages, branches, checkpoints, and FTS entries.
    async fn delete_chat(&self, chat_id: &str) -> Result<(), StoreError>;

    async fn create_branch(
        &self,
        chat_id: &str,
        name: &str,
        is_active: bool,
    ) -> Result<Branch, StoreError>;
    async fn get_branch(&self, chat_id: &str, name: &str) -> Result<Option<Branch>, StoreError>;
    async fn get_active_branch(&self, chat_id: &str) -> Result<Option<Branch>, StoreError>;
    async fn list_branches(&self, chat_id: &str) -> Result<Vec<Branch>, StoreError>;
    /// Deactivates every branch in the chat and activates `branch_id`, in one transaction.
    async fn set_active_branch(&self, chat_id: &str, branch_id: &str) -> Result<(), StoreError>;
    async fn update_branch_head(
        &self,
        branch_id: &str,
        message_id: &str,
    ) -> Result<(), StoreError>;

    /// Enforces `id != parent_id` on insert (spec.md invariant).
    async fn insert_message(&self, node: MessageNode) -> Result<(), StoreError>;
    async fn get_message(&self, message_id: &str) -> Result<Option<MessageNode>, StoreError>;
    /// Overwrites a persisted message's `data` in place. The one documented exception to
    /// message immutability (spec.md §4.2): the guardrail retry protocol's self-correction
    /// write targets the same id it started from.
    async fn update_message_data(&self, message_id: &str, data: Value) -> Result<(), StoreError>;
    /// Root-first chronological order; bounded to [`MAX_CHAIN_DEPTH`] hops.
    async fn get_message_chain(&self, head_id: &str) -> Result<Vec<MessageNode>, StoreError>;

    /// Unique by `(chat_id, name)`; a duplicate name overwrites the target.
    async fn upsert_checkpoint(&self, checkpoint: Checkpoint) -> Result<(), StoreError>;
    async fn get_checkpoint(
        &self,
        chat_id: &str,
        name: &str,
    ) -> Result<Option<Checkpoint>, StoreError>;

    /// Full-text search when the backend supports it; `LIKE`-style fallback with
    /// `rank = 1` otherwise. Snippets are capped at 200 characters.
    async fn search(&self, chat_id: &str, query: &str) -> Result<Vec<SearchHit>, StoreError>;

    async fn get_graph(&self, chat_id: &str) -> Result<GraphDump, StoreError>;
}
