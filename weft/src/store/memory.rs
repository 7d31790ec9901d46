//! In-memory `ContextStore`: the embedded default and the backend used by tests.
//!
//! One `Mutex`-guarded state struct serializes every mutation, which trivially satisfies
//! the "transactional across multi-row operations" requirement (spec.md §4.1) for a
//! single-process backend.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use super::{ContextStore, MAX_CHAIN_DEPTH};
use crate::chat::{self, Branch, Chat, Checkpoint, GraphDump, GraphNode, MessageNode, SearchHit};
use crate::error::StoreError;

#[derive(Default)]
struct State {
    chats: HashMap<String, Chat>,
    metadata_merged: HashSet<String>,
    messages: HashMap<String, MessageNode>,
    branches: HashMap<String, Branch>,
    checkpoints: HashMap<(String, String), Checkpoint>,
}

/// Embedded in-process `ContextStore`. Data does not survive process restart.
#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<State>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn merge_numeric_additive(base: &mut Value, delta: &Value) {
    match (base, delta) {
        (Value::Object(base_map), Value::Object(delta_map)) => {
            for (k, v) in delta_map {
                match base_map.get_mut(k) {
                    Some(existing) => merge_numeric_additive(existing, v),
                    None => {
                        base_map.insert(k.clone(), v.clone());
                    }
                }
            }
        }
        (base @ Value::Number(_), Value::Number(delta_n)) => {
            let existing = base.as_f64().unwrap_or(0.0);
            let add = delta_n.as_f64().unwrap_or(0.0);
            *base = serde_json::json!(existing + add);
        }
        (base_slot, delta_val) => {
            *base_slot = delta_val.clone();
        }
    }
}

#[async_trait]
impl ContextStore for InMemoryStore {
    async fn create_chat(&self, user_id: &str, metadata: Option<Value>) -> Result<Chat, StoreError> {
        let mut chat = Chat::new(user_id);
        chat.metadata = metadata;
        let mut state = self.state.lock().unwrap();
        state.chats.insert(chat.id.clone(), chat.clone());
        let main = Branch::new(chat.id.clone(), "main", true);
        state.branches.insert(main.id.clone(), main);
        Ok(chat)
    }

    async fn get_chat(&self, chat_id: &str) -> Result<Option<Chat>, StoreError> {
        Ok(self.state.lock().unwrap().chats.get(chat_id).cloned())
    }

    async fn merge_initial_metadata(
        &self,
        chat_id: &str,
        metadata: Value,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        if !state.metadata_merged.insert(chat_id.to_string()) {
            return Ok(());
        }
        let chat = state
            .chats
            .get_mut(chat_id)
            .ok_or_else(|| StoreError::ChatNotFound(chat_id.to_string()))?;
        match chat.metadata.as_mut() {
            Some(existing) => merge_numeric_additive(existing, &metadata),
            None => chat.metadata = Some(metadata),
        }
        Ok(())
    }

    async fn track_usage(&self, chat_id: &str, usage: &Value) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        let chat = state
            .chats
            .get_mut(chat_id)
            .ok_or_else(|| StoreError::ChatNotFound(chat_id.to_string()))?;
        match chat.metadata.as_mut() {
            Some(existing) => merge_numeric_additive(existing, usage),
            None => chat.metadata = Some(usage.clone()),
        }
        Ok(())
    }

    async fn delete_chat(&self, chat_id: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        state.chats.remove(chat_id);
        state.messages.retain(|_, m| m.chat_id != chat_id);
        state.branches.retain(|_, b| b.chat_id != chat_id);
        state
            .checkpoints
            .retain(|(cid, _), _| cid != chat_id);
        Ok(())
    }

    async fn create_branch(
        &self,
        chat_id: &str,
        name: &str,
        is_active: bool,
    ) -> Result<Branch, StoreError> {
        let mut state = self.state.lock().unwrap();
        if state
            .branches
            .values()
            .any(|b| b.chat_id == chat_id && b.name == name)
        {
            return Err(StoreError::DuplicateBranchName(name.to_string()));
        }
        if is_active {
            for b in state.branches.values_mut() {
                if b.chat_id == chat_id {
                    b.is_active = false;
                }
            }
        }
        let branch = Branch::new(chat_id, name, is_active);
        state.branches.insert(branch.id.clone(), branch.clone());
        Ok(branch)
    }

    async fn get_branch(&self, chat_id: &str, name: &str) -> Result<Option<Branch>, StoreError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .branches
            .values()
            .find(|b| b.chat_id == chat_id && b.name == name)
            .cloned())
    }

    async fn get_active_branch(&self, chat_id: &str) -> Result<Option<Branch>, StoreError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .branches
            .values()
            .find(|b| b.chat_id == chat_id && b.is_active)
            .cloned())
    }

    async fn list_branches(&self, chat_id: &str) -> Result<Vec<Branch>, StoreError> {
        let mut out: Vec<Branch> = self
            .state
            .lock()
            .unwrap()
            .branches
            .values()
            .filter(|b| b.chat_id == chat_id)
            .cloned()
            .collect();
        out.sort_by_key(|b| b.created_at);
        Ok(out)
    }

    async fn set_active_branch(&self, chat_id: &str, branch_id: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        if !state.branches.contains_key(branch_id) {
            return Err(StoreError::BranchNotFound(branch_id.to_string()));
        }
        for (id, b) in state.branches.iter_mut() {
            if b.chat_id == chat_id {
                b.is_active = id == branch_id;
            }
        }
        Ok(())
    }

    async fn update_branch_head(
        &self,
        branch_id: &str,
        message_id: &str,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        let branch = state
            .branches
            .get_mut(branch_id)
            .ok_or_else(|| StoreError::BranchNotFound(branch_id.to_string()))?;
        branch.head_message_id = Some(message_id.to_string());
        Ok(())
    }

    async fn insert_message(&self, node: MessageNode) -> Result<(), StoreError> {
        if node.parent_id.as_deref() == Some(node.id.as_str()) {
            return Err(StoreError::SelfReferencingMessage(node.id));
        }
        let mut state = self.state.lock().unwrap();
        state.messages.insert(node.id.clone(), node);
        Ok(())
    }

    async fn get_message(&self, message_id: &str) -> Result<Option<MessageNode>, StoreError> {
        Ok(self.state.lock().unwrap().messages.get(message_id).cloned())
    }

    async fn update_message_data(&self, message_id: &str, data: Value) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        let node = state
            .messages
            .get_mut(message_id)
            .ok_or_else(|| StoreError::MessageNotFound(message_id.to_string()))?;
        node.data = data;
        Ok(())
    }

    async fn get_message_chain(&self, head_id: &str) -> Result<Vec<MessageNode>, StoreError> {
        let state = self.state.lock().unwrap();
        let mut chain = Vec::new();
        let mut current = Some(head_id.to_string());
        let mut hops = 0usize;
        while let Some(id) = current {
            if hops >= MAX_CHAIN_DEPTH {
                return Err(StoreError::ChainTooDeep(head_id.to_string()));
            }
            let node = state
                .messages
                .get(&id)
                .ok_or_else(|| StoreError::MessageNotFound(id.clone()))?;
            chain.push(node.clone());
            current = node.parent_id.clone();
            hops += 1;
        }
        chain.reverse();
        Ok(chain)
    }

    async fn upsert_checkpoint(&self, checkpoint: Checkpoint) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        state
            .checkpoints
            .insert((checkpoint.chat_id.clone(), checkpoint.name.clone()), checkpoint);
        Ok(())
    }

    async fn get_checkpoint(
        &self,
        chat_id: &str,
        name: &str,
    ) -> Result<Option<Checkpoint>, StoreError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .checkpoints
            .get(&(chat_id.to_string(), name.to_string()))
            .cloned())
    }

    async fn search(&self, chat_id: &str, query: &str) -> Result<Vec<SearchHit>, StoreError> {
        let needle = query.to_lowercase();
        let state = self.state.lock().unwrap();
        let mut hits: Vec<SearchHit> = state
            .messages
            .values()
            .filter(|m| m.chat_id == chat_id)
            .filter_map(|m| {
                let text = chat::content_preview(&m.data, usize::MAX);
                if text.to_lowercase().contains(&needle) {
                    Some(SearchHit {
                        message: m.clone(),
                        rank: 1.0,
                        snippet: chat::snippet(&text, 200),
                    })
                } else {
                    None
                }
            })
            .collect();
        hits.sort_by_key(|h| h.message.created_at);
        Ok(hits)
    }

    async fn get_graph(&self, chat_id: &str) -> Result<GraphDump, StoreError> {
        let state = self.state.lock().unwrap();
        let mut nodes: Vec<GraphNode> = state
            .messages
            .values()
            .filter(|m| m.chat_id == chat_id)
            .map(|m| GraphNode {
                id: m.id.clone(),
                parent_id: m.parent_id.clone(),
                role: m.name.clone(),
                content_preview: chat::content_preview(&m.data, 50),
                created_at: m.created_at,
                deleted: false,
            })
            .collect();
        nodes.sort_by_key(|n| n.created_at);
        let mut branches: Vec<Branch> = state
            .branches
            .values()
            .filter(|b| b.chat_id == chat_id)
            .cloned()
            .collect();
        branches.sort_by_key(|b| b.created_at);
        let checkpoints: Vec<Checkpoint> = state
            .checkpoints
            .values()
            .filter(|c| c.chat_id == chat_id)
            .cloned()
            .collect();
        Ok(GraphDump {
            nodes,
            branches,
            checkpoints,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::MessageNode;
    use serde_json::json;

    #[tokio::test]
    async fn create_chat_creates_main_branch() {
        let store = InMemoryStore::new();
        let chat = store.create_chat("u1", None).await.unwrap();
        let main = store.get_branch(&chat.id, "main").await.unwrap().unwrap();
        assert!(main.is_active);
    }

    #[tokio::test]
    async fn insert_message_rejects_self_parent() {
        let store = InMemoryStore::new();
        let node = MessageNode::new("m1", "c1", Some("m1".to_string()), "user", json!({}));
        let err = store.insert_message(node).await.unwrap_err();
        assert!(matches!(err, StoreError::SelfReferencingMessage(_)));
    }

    #[tokio::test]
    async fn chain_is_root_first_chronological() {
        let store = InMemoryStore::new();
        let chat = store.create_chat("u1", None).await.unwrap();
        let m1 = MessageNode::new("m1", chat.id.clone(), None, "user", json!({"text": "hi"}));
        store.insert_message(m1).await.unwrap();
        let m2 = MessageNode::new(
            "m2",
            chat.id.clone(),
            Some("m1".to_string()),
            "assistant",
            json!({"text": "hey"}),
        );
        store.insert_message(m2).await.unwrap();

        let chain = store.get_message_chain("m2").await.unwrap();
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[0].id, "m1");
        assert_eq!(chain[1].id, "m2");
    }

    #[tokio::test]
    async fn set_active_branch_deactivates_others() {
        let store = InMemoryStore::new();
        let chat = store.create_chat("u1", None).await.unwrap();
        let v2 = store.create_branch(&chat.id, "main-v2", true).await.unwrap();
        let main = store.get_branch(&chat.id, "main").await.unwrap().unwrap();
        assert!(!main.is_active);
        assert!(v2.is_active);

        store.set_active_branch(&chat.id, &main.id).await.unwrap();
        let branches = store.list_branches(&chat.id).await.unwrap();
        let actives: Vec<_> = branches.iter().filter(|b| b.is_active).collect();
        assert_eq!(actives.len(), 1);
        assert_eq!(actives[0].id, main.id);
    }

    #[tokio::test]
    async fn duplicate_branch_name_errors() {
        let store = InMemoryStore::new();
        let chat = store.create_chat("u1", None).await.unwrap();
        let err = store
            .create_branch(&chat.id, "main", false)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateBranchName(_)));
    }

    #[tokio::test]
    async fn delete_chat_cascades() {
        let store = InMemoryStore::new();
        let chat = store.create_chat("u1", None).await.unwrap();
        let m1 = MessageNode::new("m1", chat.id.clone(), None, "user", json!({"text": "hi"}));
        store.insert_message(m1).await.unwrap();
        store
            .upsert_checkpoint(Checkpoint::new(chat.id.clone(), "start", "m1"))
            .await
            .unwrap();

        store.delete_chat(&chat.id).await.unwrap();

        assert!(store.get_chat(&chat.id).await.unwrap().is_none());
        assert!(store.get_message("m1").await.unwrap().is_none());
        assert!(store.list_branches(&chat.id).await.unwrap().is_empty());
        assert!(store
            .get_checkpoint(&chat.id, "start")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn search_returns_snippet_and_rank_one() {
        let store = InMemoryStore::new();
        let chat = store.create_chat("u1", None).await.unwrap();
        let m1 = MessageNode::new(
            "m1",
            chat.id.clone(),
            None,
            "user",
            json!({"text": "the quick brown fox"}),
        );
        store.insert_message(m1).await.unwrap();

        let hits = store.search(&chat.id, "quick").await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].rank, 1.0);
        assert_eq!(hits[0].snippet, "the quick brown fox");
    }

    #[tokio::test]
    async fn checkpoint_upsert_overwrites_target() {
        let store = InMemoryStore::new();
        let chat = store.create_chat("u1", None).await.unwrap();
        store
            .upsert_checkpoint(Checkpoint::new(chat.id.clone(), "cp", "m1"))
            .await
            .unwrap();
        store
            .upsert_checkpoint(Checkpoint::new(chat.id.clone(), "cp", "m2"))
            .await
            .unwrap();
        let cp = store.get_checkpoint(&chat.id, "cp").await.unwrap().unwrap();
        assert_eq!(cp.message_id, "m2");
    }

    #[tokio::test]
    async fn track_usage_merges_numeric_fields_additively() {
        let store = InMemoryStore::new();
        let chat = store.create_chat("u1", Some(json!({"tokens": 10}))).await.unwrap();
        store
            .track_usage(&chat.id, &json!({"tokens": 5}))
            .await
            .unwrap();
        let chat = store.get_chat(&chat.id).await.unwrap().unwrap();
        assert_eq!(chat.metadata.unwrap()["tokens"], 15.0);
    }
}
