//! Context Engine (spec.md §4.2): the per-conversation façade over a [`ContextStore`] —
//! `set`/`resolve`/`save`/`rewind`/`checkpoint`/`restore`/`switchBranch`/`btw`/`estimate`/
//! `trackUsage`/`inspect`.
//!
//! Chat and branch are lazily materialized on first use, not in a constructor: the engine
//! can be built with only a `userId` and an optional `chatId`, and the first operation that
//! needs persisted state creates the chat (and its `main` branch) if `chatId` was `None`.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Mutex;

use crate::chat::{Branch, Checkpoint, GraphDump, MessageNode};
use crate::codec::{CodecRegistry, DecodedMessage};
use crate::error::{EngineError, StoreError};
use crate::fragment::{CodecHandle, Fragment, LazyTag};
use crate::memory::uuid6;
use crate::registry::{fragment_text, Estimate, FragmentBreakdown, TokenRegistry};
use crate::renderer::FragmentRenderer;
use crate::store::ContextStore;

fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// The rendered system prompt plus the decoded message chain, ready to hand to a model
/// client (spec.md §4.2 `resolve`).
#[derive(Clone, Debug, PartialEq)]
pub struct Resolved {
    pub system_prompt: String,
    pub messages: Vec<DecodedMessage>,
}

/// The id of the last message written by `save()`, or the unchanged head if nothing was
/// pending.
#[derive(Clone, Debug, PartialEq)]
pub struct SaveResult {
    pub head_message_id: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct BranchInfo {
    pub branch: Branch,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CheckpointInfo {
    pub checkpoint: Checkpoint,
}

/// An `estimate()`/`inspect()` result: the joint estimate against the full resolved
/// context, plus the per-fragment breakdown (spec.md §4.4 "Estimate linearity").
#[derive(Clone, Debug, PartialEq)]
pub struct EngineEstimate {
    pub estimate: Estimate,
    pub breakdown: FragmentBreakdown,
}

/// A debugging snapshot: rendered system prompt, in-memory fragments, the persisted chain,
/// the full chat graph, and (if a model/registry were given) a token/cost estimate
/// (spec.md §4.2 `inspect`).
#[derive(Clone, Debug)]
pub struct Inspection {
    pub estimate: Option<EngineEstimate>,
    pub system_prompt: String,
    pub context_fragments: Vec<Fragment>,
    pub pending_fragments: Vec<Fragment>,
    pub persisted: Vec<MessageNode>,
    pub graph: GraphDump,
    pub chat_id: String,
    pub branch_name: String,
    pub timestamp: i64,
}

struct EngineState {
    chat_id: Option<String>,
    initial_metadata: Option<Value>,
    branch: Option<Branch>,
    system_fragments: Vec<Fragment>,
    pending: Vec<Fragment>,
}

/// The per-conversation context engine (spec.md §4.2). One instance is expected per chat
/// session; `Arc<dyn ContextStore>` lets many engines share one backend.
pub struct ContextEngine {
    store: Arc<dyn ContextStore>,
    codecs: CodecRegistry,
    user_id: String,
    state: Mutex<EngineState>,
}

impl ContextEngine {
    pub fn new(
        store: Arc<dyn ContextStore>,
        codecs: CodecRegistry,
        user_id: impl Into<String>,
        chat_id: Option<String>,
        initial_metadata: Option<Value>,
    ) -> Self {
        ContextEngine {
            store,
            codecs,
            user_id: user_id.into(),
            state: Mutex::new(EngineState {
                chat_id,
                initial_metadata,
                branch: None,
                system_fragments: Vec::new(),
                pending: Vec::new(),
            }),
        }
    }

    /// Lazily creates the chat/`main` branch on first touch and merges `initial_metadata`
    /// exactly once per engine instance (the store additionally guards this cross-instance).
    async fn ensure_initialized(
        &self,
        state: &mut EngineState,
    ) -> Result<(String, Branch), EngineError> {
        let chat_id = match &state.chat_id {
            Some(id) => {
                if self.store.get_chat(id).await?.is_none() {
                    return Err(StoreError::ChatNotFound(id.clone()).into());
                }
                id.clone()
            }
            None => {
                let chat = self.store.create_chat(&self.user_id, None).await?;
                tracing::debug!(chat_id = %chat.id, user_id = %self.user_id, "lazily created chat on first use");
                state.chat_id = Some(chat.id.clone());
                chat.id
            }
        };
        if let Some(meta) = state.initial_metadata.take() {
            self.store.merge_initial_metadata(&chat_id, meta).await?;
        }
        let branch = match &state.branch {
            Some(b) => b.clone(),
            None => {
                let b = self
                    .store
                    .get_active_branch(&chat_id)
                    .await?
                    .ok_or_else(|| StoreError::BranchNotFound("main".to_string()))?;
                state.branch = Some(b.clone());
                b
            }
        };
        Ok((chat_id, branch))
    }

    /// Queues fragments for the next `resolve()`/`save()`: message fragments go to the
    /// pending queue, everything else joins the system-prompt fragment list (spec.md §4.2
    /// `set`).
    pub async fn set(&self, fragments: impl IntoIterator<Item = Fragment>) {
        let mut state = self.state.lock().await;
        for f in fragments {
            if f.is_message() {
                state.pending.push(f);
            } else {
                state.system_fragments.push(f);
            }
        }
    }

    /// Materializes every lazy pending fragment's id/codec in place (spec.md §4.2.2).
    /// `last-assistant` searches the pending queue most-recent-first (skipping other
    /// lazies), then the persisted chain; if nothing is found a fresh id is minted.
    async fn resolve_lazies(
        &self,
        state: &mut EngineState,
        branch: &Branch,
    ) -> Result<(), EngineError> {
        let mut persisted_chain: Option<Vec<MessageNode>> = None;
        for i in 0..state.pending.len() {
            if state.pending[i].lazy.is_none() {
                continue;
            }
            let LazyTag::LastAssistant = state.pending[i].lazy.as_ref().unwrap().tag;

            let mut found_id = None;
            for j in (0..state.pending.len()).rev() {
                if j == i {
                    continue;
                }
                let candidate = &state.pending[j];
                if candidate.lazy.is_some() {
                    continue;
                }
                if candidate.name == "assistant" {
                    found_id = candidate.id.clone();
                    break;
                }
            }
            if found_id.is_none() {
                if persisted_chain.is_none() {
                    let chain = match &branch.head_message_id {
                        Some(head) => self.store.get_message_chain(head).await?,
                        None => Vec::new(),
                    };
                    persisted_chain = Some(chain);
                }
                found_id = persisted_chain
                    .as_ref()
                    .unwrap()
                    .iter()
                    .rev()
                    .find(|m| m.name == "assistant")
                    .map(|m| m.id.clone());
            }

            let data = state.pending[i].data.clone();
            let codec = CodecHandle::new("assistant");
            let id = found_id.unwrap_or_else(|| uuid6::uuid6().to_string());
            state.pending[i] = Fragment::message_with_id(id, "assistant", data, codec);
        }
        Ok(())
    }

    fn codec_for(&self, name: &str) -> Result<&Arc<dyn crate::codec::Codec>, EngineError> {
        self.codecs
            .get(name)
            .ok_or_else(|| EngineError::UnresolvedCodec(name.to_string()))
    }

    /// Renders the system prompt and decodes the full message chain plus any still-pending
    /// fragments, without persisting anything (spec.md §4.2 `resolve`).
    pub async fn resolve(&self, renderer: &dyn FragmentRenderer) -> Result<Resolved, EngineError> {
        let mut state = self.state.lock().await;
        let (_chat_id, branch) = self.ensure_initialized(&mut state).await?;
        self.resolve_lazies(&mut state, &branch).await?;

        let system_prompt = renderer.render(&state.system_fragments);
        let mut messages = Vec::new();
        if let Some(head) = &branch.head_message_id {
            for node in self.store.get_message_chain(head).await? {
                let codec = self.codec_for(&node.name)?;
                messages.push(codec.decode(&node.data)?);
            }
        }
        for frag in &state.pending {
            let codec_name = frag
                .codec
                .as_ref()
                .ok_or_else(|| EngineError::UnresolvedCodec(frag.name.clone()))?;
            let codec = self.codec_for(&codec_name.0)?;
            let encoded = codec.encode(&frag.data)?;
            messages.push(codec.decode(&encoded)?);
        }
        Ok(Resolved {
            system_prompt,
            messages,
        })
    }

    /// Branch-name rewind/`btw` convention: `{root}-v{n}`, `n` one more than the count of
    /// existing branches already matching that prefix (spec.md §4.2 "Branch naming").
    fn next_branch_name(branches: &[Branch], active_name: &str) -> String {
        let root = active_name.split("-v").next().unwrap_or(active_name);
        let prefix = format!("{root}-v");
        let count = branches.iter().filter(|b| b.name.starts_with(&prefix)).count();
        format!("{root}-v{}", count + 1)
    }

    async fn do_rewind(
        &self,
        chat_id: &str,
        msg_id: &str,
        active_branch_name: &str,
    ) -> Result<Branch, EngineError> {
        let msg = self
            .store
            .get_message(msg_id)
            .await?
            .ok_or_else(|| StoreError::MessageNotFound(msg_id.to_string()))?;
        if msg.chat_id != chat_id {
            return Err(EngineError::CrossChatRewind);
        }
        let branches = self.store.list_branches(chat_id).await?;
        let new_name = Self::next_branch_name(&branches, active_branch_name);
        let mut branch = self.store.create_branch(chat_id, &new_name, true).await?;
        self.store.update_branch_head(&branch.id, msg_id).await?;
        branch.head_message_id = Some(msg_id.to_string());
        tracing::info!(chat_id, from = active_branch_name, to = %new_name, at = msg_id, "forked branch on rewind");
        Ok(branch)
    }

    /// Persists every pending fragment after resolving lazies (spec.md §4.2 `save`).
    ///
    /// `branch = None`/`Some(true)` (the default): if a pending fragment's id already
    /// identifies a persisted message with a parent, the engine rewinds to that parent,
    /// creates a new branch, and reissues the fragment with a fresh id instead of
    /// overwriting history. `branch = Some(false)`: the matching fragment's id is updated
    /// in place (the guardrail retry protocol's self-correction write) rather than forked.
    pub async fn save(&self, branch: Option<bool>) -> Result<SaveResult, EngineError> {
        let mut state = self.state.lock().await;
        let (chat_id, mut active_branch) = self.ensure_initialized(&mut state).await?;
        self.resolve_lazies(&mut state, &active_branch).await?;
        let pending = std::mem::take(&mut state.pending);
        if pending.is_empty() {
            return Ok(SaveResult {
                head_message_id: active_branch.head_message_id.clone(),
            });
        }

        let do_branch = branch.unwrap_or(true);
        tracing::debug!(chat_id, branch = %active_branch.name, pending = pending.len(), do_branch, "saving pending fragments");
        let mut parent_cursor = active_branch.head_message_id.clone();
        let mut last_id = parent_cursor.clone();

        for frag in pending {
            let codec_name = frag
                .codec
                .clone()
                .ok_or_else(|| EngineError::UnresolvedCodec(frag.name.clone()))?
                .0;
            let codec = self.codec_for(&codec_name)?;
            let encoded = codec.encode(&frag.data)?;

            let existing = match &frag.id {
                Some(id) => self.store.get_message(id).await?,
                None => None,
            };

            match existing {
                Some(existing) if existing.chat_id != chat_id => {
                    return Err(EngineError::CrossChatRewind);
                }
                Some(existing) if do_branch => {
                    let existing_parent = existing.parent_id.ok_or(EngineError::CannotRewindRoot)?;
                    active_branch = self
                        .do_rewind(&chat_id, &existing_parent, &active_branch.name)
                        .await?;
                    let new_id = uuid6::uuid6().to_string();
                    let node = MessageNode::new(
                        new_id.clone(),
                        chat_id.clone(),
                        Some(existing_parent),
                        frag.name.clone(),
                        encoded,
                    );
                    self.store.insert_message(node).await?;
                    self.store.update_branch_head(&active_branch.id, &new_id).await?;
                    active_branch.head_message_id = Some(new_id.clone());
                    parent_cursor = Some(new_id.clone());
                    last_id = Some(new_id);
                }
                Some(existing) => {
                    // branch: false — rewrite the matching node's content in place. Its
                    // position in the chain (and the branch head, if something was
                    // appended after it) is untouched; only a correction targeting the
                    // current head should move `last_id`/the head pointer.
                    self.store.update_message_data(&existing.id, encoded).await?;
                    if active_branch.head_message_id.as_deref() == Some(existing.id.as_str()) {
                        parent_cursor = Some(existing.id.clone());
                        last_id = Some(existing.id);
                    }
                }
                None => {
                    let id = frag.id.clone().unwrap_or_else(|| uuid6::uuid6().to_string());
                    let node = MessageNode::new(
                        id.clone(),
                        chat_id.clone(),
                        parent_cursor.clone(),
                        frag.name.clone(),
                        encoded,
                    );
                    self.store.insert_message(node).await?;
                    parent_cursor = Some(id.clone());
                    last_id = Some(id);
                }
            }
        }

        if let Some(id) = &last_id {
            self.store.update_branch_head(&active_branch.id, id).await?;
            active_branch.head_message_id = Some(id.clone());
        }
        state.branch = Some(active_branch);
        Ok(SaveResult {
            head_message_id: last_id,
        })
    }

    /// Forks a new branch rooted at `msg_id` and switches to it, discarding any unsaved
    /// pending fragments (spec.md §4.2 `rewind`). Rewinding to a message with no parent
    /// (the chain root) is rejected.
    pub async fn rewind(&self, msg_id: &str) -> Result<BranchInfo, EngineError> {
        let mut state = self.state.lock().await;
        let (chat_id, active_branch) = self.ensure_initialized(&mut state).await?;
        let new_branch = self.do_rewind(&chat_id, msg_id, &active_branch.name).await?;
        state.branch = Some(new_branch.clone());
        state.pending.clear();
        Ok(BranchInfo { branch: new_branch })
    }

    /// Names the active branch's current head `name` (spec.md §4.2 `checkpoint`). Fails if
    /// the branch has no messages yet.
    pub async fn checkpoint(&self, name: &str) -> Result<CheckpointInfo, EngineError> {
        let mut state = self.state.lock().await;
        let (chat_id, active_branch) = self.ensure_initialized(&mut state).await?;
        let head = active_branch
            .head_message_id
            .clone()
            .ok_or(EngineError::NoMessagesOnBranch)?;
        let checkpoint = Checkpoint::new(chat_id, name, head);
        self.store.upsert_checkpoint(checkpoint.clone()).await?;
        tracing::debug!(name, at = %checkpoint.message_id, "wrote checkpoint");
        Ok(CheckpointInfo { checkpoint })
    }

    /// Rewinds to the message a named checkpoint points at (spec.md §4.2 `restore`).
    pub async fn restore(&self, name: &str) -> Result<BranchInfo, EngineError> {
        let mut state = self.state.lock().await;
        let (chat_id, active_branch) = self.ensure_initialized(&mut state).await?;
        let checkpoint = self
            .store
            .get_checkpoint(&chat_id, name)
            .await?
            .ok_or_else(|| StoreError::CheckpointNotFound(name.to_string()))?;
        let new_branch = self
            .do_rewind(&chat_id, &checkpoint.message_id, &active_branch.name)
            .await?;
        tracing::info!(chat_id, checkpoint = name, to = %new_branch.name, "restored checkpoint");
        state.branch = Some(new_branch.clone());
        state.pending.clear();
        Ok(BranchInfo { branch: new_branch })
    }

    /// Switches the active branch by name, discarding unsaved pending fragments (spec.md
    /// §4.2 `switchBranch`).
    pub async fn switch_branch(&self, name: &str) -> Result<BranchInfo, EngineError> {
        let mut state = self.state.lock().await;
        let (chat_id, _active_branch) = self.ensure_initialized(&mut state).await?;
        let mut target = self
            .store
            .get_branch(&chat_id, name)
            .await?
            .ok_or_else(|| StoreError::BranchNotFound(name.to_string()))?;
        self.store.set_active_branch(&chat_id, &target.id).await?;
        target.is_active = true;
        tracing::debug!(chat_id, branch = name, "switched active branch");
        state.branch = Some(target.clone());
        state.pending.clear();
        Ok(BranchInfo { branch: target })
    }

    /// Forks a new branch at the current head without switching the engine onto it
    /// (spec.md §4.2 `btw`, "by the way" — a side branch for an aside the caller doesn't
    /// want in the main line).
    pub async fn btw(&self) -> Result<BranchInfo, EngineError> {
        let mut state = self.state.lock().await;
        let (chat_id, active_branch) = self.ensure_initialized(&mut state).await?;
        let branches = self.store.list_branches(&chat_id).await?;
        let new_name = Self::next_branch_name(&branches, &active_branch.name);
        let mut new_branch = self.store.create_branch(&chat_id, &new_name, false).await?;
        if let Some(head) = &active_branch.head_message_id {
            self.store.update_branch_head(&new_branch.id, head).await?;
            new_branch.head_message_id = Some(head.clone());
        }
        tracing::debug!(chat_id, from = %active_branch.name, to = %new_branch.name, "forked side branch (btw)");
        Ok(BranchInfo { branch: new_branch })
    }

    async fn estimate_with(
        &self,
        state: &EngineState,
        branch: &Branch,
        model: &str,
        registry: &TokenRegistry,
        renderer: &dyn FragmentRenderer,
    ) -> Result<EngineEstimate, EngineError> {
        let mut full_text = renderer.render(&state.system_fragments);
        if let Some(head) = &branch.head_message_id {
            for node in self.store.get_message_chain(head).await? {
                full_text.push(' ');
                full_text.push_str(&crate::chat::content_preview(&node.data, usize::MAX));
            }
        }
        for frag in &state.pending {
            full_text.push(' ');
            full_text.push_str(&fragment_text(frag));
        }
        let (estimate, breakdown) = registry
            .estimate_fragments(model, &state.system_fragments, &full_text)
            .await?;
        Ok(EngineEstimate { estimate, breakdown })
    }

    /// Estimates token count and cost for the currently resolvable context against `model`
    /// (spec.md §4.4).
    pub async fn estimate(
        &self,
        model: &str,
        registry: &TokenRegistry,
        renderer: &dyn FragmentRenderer,
    ) -> Result<EngineEstimate, EngineError> {
        let mut state = self.state.lock().await;
        let (_chat_id, branch) = self.ensure_initialized(&mut state).await?;
        self.estimate_with(&state, &branch, model, registry, renderer).await
    }

    /// Merges usage deltas into the chat's metadata, writing even a zero delta (spec.md
    /// §4.2 `trackUsage`; resolved Open Question in SPEC_FULL.md §9).
    pub async fn track_usage(&self, usage: Value) -> Result<(), EngineError> {
        let mut state = self.state.lock().await;
        let (chat_id, _branch) = self.ensure_initialized(&mut state).await?;
        self.store.track_usage(&chat_id, &usage).await?;
        tracing::debug!(chat_id, "tracked usage delta");
        Ok(())
    }

    /// A debugging snapshot of the engine's current state (spec.md §4.2 `inspect`).
    /// `model` is optional; when given alongside `registry`, the snapshot includes a
    /// token/cost estimate.
    pub async fn inspect(
        &self,
        model: Option<(&str, &TokenRegistry)>,
        renderer: &dyn FragmentRenderer,
    ) -> Result<Inspection, EngineError> {
        let mut state = self.state.lock().await;
        let (chat_id, branch) = self.ensure_initialized(&mut state).await?;
        let system_prompt = renderer.render(&state.system_fragments);
        let persisted = match &branch.head_message_id {
            Some(head) => self.store.get_message_chain(head).await?,
            None => Vec::new(),
        };
        let graph = self.store.get_graph(&chat_id).await?;
        let estimate = match model {
            Some((model_id, registry)) => Some(
                self.estimate_with(&state, &branch, model_id, registry, renderer)
                    .await?,
            ),
            None => None,
        };
        Ok(Inspection {
            estimate,
            system_prompt,
            context_fragments: state.system_fragments.clone(),
            pending_fragments: state.pending.clone(),
            persisted,
            graph,
            chat_id,
            branch_name: branch.name.clone(),
            timestamp: now_millis(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fragment::FragmentData;
    use crate::renderer::XmlFragmentRenderer;
    use crate::store::InMemoryStore;

    fn engine(store: Arc<dyn ContextStore>) -> ContextEngine {
        ContextEngine::new(store, CodecRegistry::default(), "u1", None, None)
    }

    #[tokio::test]
    async fn lazy_init_creates_chat_and_main_branch_on_first_resolve() {
        let store: Arc<dyn ContextStore> = Arc::new(InMemoryStore::new());
        let engine = engine(store);
        let renderer = XmlFragmentRenderer::default();
        let resolved = engine.resolve(&renderer).await.unwrap();
        assert_eq!(resolved.system_prompt, "");
        assert!(resolved.messages.is_empty());
    }

    #[tokio::test]
    async fn set_and_save_appends_user_then_assistant() {
        let store: Arc<dyn ContextStore> = Arc::new(InMemoryStore::new());
        let engine = engine(store);
        engine
            .set([Fragment::message(
                "user",
                FragmentData::text("hello"),
                CodecHandle::new("user"),
            )])
            .await;
        let first = engine.save(None).await.unwrap();
        assert!(first.head_message_id.is_some());

        engine
            .set([Fragment::message(
                "assistant",
                FragmentData::text("hi there"),
                CodecHandle::new("assistant"),
            )])
            .await;
        let second = engine.save(None).await.unwrap();
        assert_ne!(second.head_message_id, first.head_message_id);

        let renderer = XmlFragmentRenderer::default();
        let resolved = engine.resolve(&renderer).await.unwrap();
        assert_eq!(resolved.messages.len(), 2);
        assert_eq!(resolved.messages[0].role, "user");
        assert_eq!(resolved.messages[1].role, "assistant");
    }

    #[tokio::test]
    async fn lazy_last_assistant_finds_persisted_turn_and_updates_in_place() {
        let store: Arc<dyn ContextStore> = Arc::new(InMemoryStore::new());
        let engine = engine(store);
        engine
            .set([Fragment::message(
                "user",
                FragmentData::text("hi"),
                CodecHandle::new("user"),
            )])
            .await;
        engine.save(None).await.unwrap();
        engine
            .set([Fragment::message(
                "assistant",
                FragmentData::text("partial"),
                CodecHandle::new("assistant"),
            )])
            .await;
        let first_save = engine.save(None).await.unwrap();

        engine
            .set([Fragment::lazy_message(
                "assistant",
                FragmentData::text("partial corrected"),
                LazyTag::LastAssistant,
            )])
            .await;
        let second_save = engine.save(Some(false)).await.unwrap();

        assert_eq!(first_save.head_message_id, second_save.head_message_id);
        let renderer = XmlFragmentRenderer::default();
        let resolved = engine.resolve(&renderer).await.unwrap();
        assert_eq!(resolved.messages.len(), 2);
        assert_eq!(resolved.messages[1].joined_text(), "partial corrected");
    }

    #[tokio::test]
    async fn rewind_forks_a_new_branch_from_a_non_root_message() {
        let store: Arc<dyn ContextStore> = Arc::new(InMemoryStore::new());
        let engine = engine(store);
        engine
            .set([Fragment::message(
                "user",
                FragmentData::text("one"),
                CodecHandle::new("user"),
            )])
            .await;
        engine.save(None).await.unwrap();
        engine
            .set([Fragment::message(
                "assistant",
                FragmentData::text("two"),
                CodecHandle::new("assistant"),
            )])
            .await;
        let second = engine.save(None).await.unwrap();
        let second_id = second.head_message_id.unwrap();

        let branch_info = engine.rewind(&second_id).await.unwrap();
        assert_eq!(branch_info.branch.name, "main-v2");
        assert_eq!(branch_info.branch.head_message_id, Some(second_id));
    }

    #[tokio::test]
    async fn rewind_to_root_message_is_rejected() {
        let store: Arc<dyn ContextStore> = Arc::new(InMemoryStore::new());
        let engine = engine(store);
        engine
            .set([Fragment::message(
                "user",
                FragmentData::text("one"),
                CodecHandle::new("user"),
            )])
            .await;
        let first = engine.save(None).await.unwrap();
        let root_id = first.head_message_id.unwrap();

        let err = engine.rewind(&root_id).await.unwrap_err();
        assert!(matches!(err, EngineError::CannotRewindRoot));
    }

    #[tokio::test]
    async fn checkpoint_and_restore_round_trip() {
        let store: Arc<dyn ContextStore> = Arc::new(InMemoryStore::new());
        let engine = engine(store);
        engine
            .set([Fragment::message(
                "user",
                FragmentData::text("one"),
                CodecHandle::new("user"),
            )])
            .await;
        engine.save(None).await.unwrap();
        engine.checkpoint("start").await.unwrap();
        engine
            .set([Fragment::message(
                "assistant",
                FragmentData::text("two"),
                CodecHandle::new("assistant"),
            )])
            .await;
        engine.save(None).await.unwrap();

        let branch_info = engine.restore("start").await.unwrap();
        assert!(branch_info.branch.name.starts_with("main-v"));
        let renderer = XmlFragmentRenderer::default();
        let resolved = engine.resolve(&renderer).await.unwrap();
        assert_eq!(resolved.messages.len(), 1);
    }

    #[tokio::test]
    async fn checkpoint_without_messages_fails() {
        let store: Arc<dyn ContextStore> = Arc::new(InMemoryStore::new());
        let engine = engine(store);
        let err = engine.checkpoint("start").await.unwrap_err();
        assert!(matches!(err, EngineError::NoMessagesOnBranch));
    }

    #[tokio::test]
    async fn btw_forks_without_switching_active_branch() {
        let store: Arc<dyn ContextStore> = Arc::new(InMemoryStore::new());
        let engine = engine(store);
        engine
            .set([Fragment::message(
                "user",
                FragmentData::text("one"),
                CodecHandle::new("user"),
            )])
            .await;
        engine.save(None).await.unwrap();
        let aside = engine.btw().await.unwrap();
        assert!(aside.branch.name.starts_with("main-v"));

        let renderer = XmlFragmentRenderer::default();
        let resolved = engine.resolve(&renderer).await.unwrap();
        assert_eq!(resolved.messages.len(), 1);
        let graph = engine
            .inspect(None, &renderer)
            .await
            .unwrap();
        assert_eq!(graph.branch_name, "main");
    }
}
