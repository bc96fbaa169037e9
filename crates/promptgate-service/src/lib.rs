//! Live request editing and interception service.
//!
//! Sits between prompt rendering and model invocation: projects the outgoing
//! message list into editable sections, optionally holds the send until a
//! human resumes or cancels it, captures recurring edits as auto-overrides,
//! and builds versioned replay snapshots for auditing.
//!
//! # Module structure
//!
//! - [`types`] — Public types, callback signatures, status snapshots
//! - [`editing`] — Section/leaf edits, undo/redo, delete/restore, validation
//! - [`intercept`] — Pending-intercept lifecycle and suspension
//! - [`overrides`] — Auto-override capture and replay
//! - [`replay`] — Versioned replay snapshot builder
//!
//! All mutation is synchronous per session key; the only suspending call is
//! `wait_for_interception_approval`, which parks the send pipeline on a
//! single-slot channel resolved from the UI flow.

pub mod types;

mod editing;
mod intercept;
mod overrides;
mod replay;

pub use types::*;

use chrono::Utc;
use indexmap::IndexMap;
use promptgate_core::{
    AutoOverrideEntry, ChatMessage, EditableChatRequest, EventEnvelope, EventKind,
    InterceptDecision, LiveEditorConfig, LiveRequestReplaySnapshot, PendingInterceptSummary,
    RenderedPrompt, RequestMetadata, SectionKind, SessionKey, build_sections,
    estimate_token_count, payload_hash, render_message_content,
};
use promptgate_store::Store;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, mpsc};
use uuid::Uuid;

/// Identity of an override target within a scope: section kind plus the
/// identity label (name hint, or a content digest for hint-less sections).
/// Never a message index.
pub(crate) type OverrideIdentity = (SectionKind, String);

pub(crate) struct PendingState {
    pub(crate) summary: PendingInterceptSummary,
    /// Single-slot resolver; taken exactly once.
    pub(crate) resolver: Option<mpsc::Sender<InterceptDecision>>,
    /// Used if the request disappears before resolution.
    pub(crate) fallback_messages: Vec<ChatMessage>,
    /// Whether a resume of this intercept captures auto-override entries.
    pub(crate) capture: bool,
}

pub(crate) struct ReplaySlot {
    pub(crate) current: Option<LiveRequestReplaySnapshot>,
    /// Single-slot restore buffer; consumed by `restore_previous_replay`.
    pub(crate) previous: Option<LiveRequestReplaySnapshot>,
    pub(crate) next_version: u64,
}

pub(crate) struct ServiceState {
    pub(crate) requests: HashMap<SessionKey, EditableChatRequest>,
    pub(crate) undo: HashMap<SessionKey, Vec<LeafEdit>>,
    pub(crate) redo: HashMap<SessionKey, Vec<LeafEdit>>,
    pub(crate) pending: HashMap<SessionKey, PendingState>,
    pub(crate) capture_marked: HashSet<SessionKey>,
    pub(crate) session_overrides: HashMap<Uuid, IndexMap<OverrideIdentity, AutoOverrideEntry>>,
    pub(crate) workspace_overrides: IndexMap<OverrideIdentity, AutoOverrideEntry>,
    /// Bounded diff history for inspection; oldest evicted first.
    pub(crate) previews: VecDeque<AutoOverrideEntry>,
    pub(crate) replays: HashMap<SessionKey, ReplaySlot>,
}

impl ServiceState {
    fn new() -> Self {
        Self {
            requests: HashMap::new(),
            undo: HashMap::new(),
            redo: HashMap::new(),
            pending: HashMap::new(),
            capture_marked: HashSet::new(),
            session_overrides: HashMap::new(),
            workspace_overrides: IndexMap::new(),
            previews: VecDeque::new(),
            replays: HashMap::new(),
        }
    }
}

#[derive(Default)]
struct Listeners {
    request_updated: Mutex<Vec<RequestUpdatedCallback>>,
    request_removed: Mutex<Vec<RequestRemovedCallback>>,
    intercept_changed: Mutex<Vec<InterceptChangedCallback>>,
    metadata_changed: Mutex<Vec<MetadataChangedCallback>>,
    replay_changed: Mutex<Vec<ReplayChangedCallback>>,
    event: Mutex<Vec<EventCallback>>,
}

/// The interception/editing/replay core. One instance per process; all
/// per-request state is addressed by [`SessionKey`].
pub struct LiveRequestService {
    pub(crate) config: Mutex<LiveEditorConfig>,
    pub(crate) state: Mutex<ServiceState>,
    store: Option<Store>,
    listeners: Listeners,
    warn_cb: Option<WarnCallback>,
    seq_no: AtomicU64,
    pub(crate) nonce: AtomicU64,
}

impl LiveRequestService {
    #[must_use]
    pub fn new(config: LiveEditorConfig) -> Self {
        Self {
            config: Mutex::new(config),
            state: Mutex::new(ServiceState::new()),
            store: None,
            listeners: Listeners::default(),
            warn_cb: None,
            seq_no: AtomicU64::new(0),
            nonce: AtomicU64::new(0),
        }
    }

    /// Attach a durable store. Workspace-scope overrides are rehydrated
    /// immediately; request snapshots are rehydrated lazily on first touch.
    #[must_use]
    pub fn with_store(mut self, store: Store) -> Self {
        match store.load_workspace_overrides() {
            Ok(entries) => {
                let mut state = self.state_lock();
                for entry in entries {
                    state
                        .workspace_overrides
                        .insert((entry.kind, entry.label.clone()), entry);
                }
            }
            Err(err) => self.warn(&format!(
                "workspace override rehydration failed, continuing in-memory: {err}"
            )),
        }
        self.store = Some(store);
        self
    }

    #[must_use]
    pub fn with_warn_callback(mut self, cb: WarnCallback) -> Self {
        self.warn_cb = Some(cb);
        self
    }

    pub fn on_request_updated(&self, cb: RequestUpdatedCallback) {
        self.lock_poison_ok(&self.listeners.request_updated).push(cb);
    }

    pub fn on_request_removed(&self, cb: RequestRemovedCallback) {
        self.lock_poison_ok(&self.listeners.request_removed).push(cb);
    }

    pub fn on_intercept_changed(&self, cb: InterceptChangedCallback) {
        self.lock_poison_ok(&self.listeners.intercept_changed).push(cb);
    }

    pub fn on_metadata_changed(&self, cb: MetadataChangedCallback) {
        self.lock_poison_ok(&self.listeners.metadata_changed).push(cb);
    }

    pub fn on_replay_changed(&self, cb: ReplayChangedCallback) {
        self.lock_poison_ok(&self.listeners.replay_changed).push(cb);
    }

    pub fn on_event(&self, cb: EventCallback) {
        self.lock_poison_ok(&self.listeners.event).push(cb);
    }

    /// Track a freshly rendered prompt as an editable request, applying any
    /// matching auto-overrides before it is ever shown. A prior request for
    /// the same key is superseded, along with its pending intercept and
    /// replay snapshot.
    pub fn prepare_request(
        &self,
        key: SessionKey,
        prompt: RenderedPrompt,
        debug_name: impl Into<String>,
    ) -> EditableChatRequest {
        self.cancel_intercept_for_context_change(key, "new-request");
        self.mark_replay_stale_internal(key, None, "new-request");

        let mut request = EditableChatRequest {
            id: Uuid::now_v7(),
            key,
            debug_name: debug_name.into(),
            model: prompt.model,
            messages: prompt.messages.clone(),
            original_messages: prompt.messages,
            sections: Vec::new(),
            metadata: RequestMetadata {
                request_id: Uuid::now_v7(),
                intent_id: prompt.intent_id,
                endpoint_url: prompt.endpoint_url,
                model_family: prompt.model_family,
                token_count: prompt.token_count,
                max_prompt_tokens: prompt.max_prompt_tokens,
                request_options: prompt.request_options,
                created_at: Utc::now(),
                last_logged_hash: None,
                subagent: prompt.subagent,
            },
            is_dirty: false,
        };
        request.sections = build_sections(&request.original_messages);

        let snapshot = {
            let mut state = self.state_lock();
            self.apply_overrides_to_request(&mut state, &mut request);
            editing::recompute(&mut request);
            let snapshot = request.clone();
            state.requests.insert(key, request);
            state.undo.remove(&key);
            state.redo.remove(&key);
            snapshot
        };
        self.notify_request_updated(&snapshot);
        snapshot
    }

    /// Current request for a key, rehydrating lazily from the store so edit
    /// state from a prior process is visible shortly after startup.
    pub fn get_request(&self, key: SessionKey) -> Option<EditableChatRequest> {
        {
            let state = self.state_lock();
            if let Some(request) = state.requests.get(&key) {
                return Some(request.clone());
            }
        }
        let store = self.store.as_ref()?;
        match store.load_request_snapshot(&key.storage_key()) {
            Ok(Some(request)) => {
                let mut state = self.state_lock();
                state.requests.entry(key).or_insert_with(|| request.clone());
                Some(request)
            }
            Ok(None) => None,
            Err(err) => {
                self.warn(&format!("request cache read failed for {key}: {err}"));
                None
            }
        }
    }

    pub fn all_requests(&self) -> Vec<EditableChatRequest> {
        let state = self.state_lock();
        let mut requests: Vec<_> = state.requests.values().cloned().collect();
        requests.sort_by_key(|r| r.metadata.created_at);
        requests
    }

    /// Drop a tracked request. The durable cache entry is left in place so
    /// it can outlive the session for persistence.
    pub fn remove_request(&self, key: SessionKey) -> bool {
        let removed = {
            let mut state = self.state_lock();
            state.undo.remove(&key);
            state.redo.remove(&key);
            state.requests.remove(&key).is_some()
        };
        if removed {
            self.notify_request_removed(key);
        }
        removed
    }

    /// Compare the payload a caller logged as sent against the current
    /// edited payload. A mismatch is the signature of a silent divergence
    /// bug and is always recorded.
    pub fn record_logged_payload(&self, key: SessionKey, logged_hash: &str) -> bool {
        let outcome = {
            let mut state = self.state_lock();
            let Some(request) = state.requests.get_mut(&key) else {
                return false;
            };
            let expected = payload_hash(&request.messages);
            request.metadata.last_logged_hash = Some(logged_hash.to_string());
            let request_id = request.metadata.request_id;
            (expected, request_id)
        };
        let (expected, request_id) = outcome;
        let matches = expected == logged_hash;
        if !matches {
            self.emit_event(
                key,
                EventKind::ParityMismatchV1 {
                    request_id,
                    expected_hash: expected,
                    logged_hash: logged_hash.to_string(),
                },
            );
        }
        self.notify_metadata_changed(key);
        matches
    }

    /// Attach token-trace data from the rendering collaborator after the
    /// fact.
    pub fn update_token_trace(&self, key: SessionKey, token_count: u32) -> bool {
        {
            let mut state = self.state_lock();
            let Some(request) = state.requests.get_mut(&key) else {
                return false;
            };
            request.metadata.token_count = token_count;
        }
        self.notify_metadata_changed(key);
        true
    }

    pub fn get_metadata(&self, key: SessionKey) -> Option<RequestMetadata> {
        let state = self.state_lock();
        state.requests.get(&key).map(|r| r.metadata.clone())
    }

    /// Owning chat session went away: cancel its pending intercepts, evict
    /// transient state, and discard its session-scope overrides. Durable
    /// cache entries survive.
    pub fn handle_session_disposed(&self, session_id: Uuid) {
        let keys: Vec<SessionKey> = {
            let state = self.state_lock();
            state
                .requests
                .keys()
                .chain(state.pending.keys())
                .chain(state.replays.keys())
                .filter(|k| k.session_id == session_id)
                .copied()
                .collect::<HashSet<_>>()
                .into_iter()
                .collect()
        };
        for key in keys {
            self.cancel_intercept_session_disposed(key);
            self.mark_replay_stale_internal(key, None, "session-disposed");
            self.remove_request(key);
        }
        let mut state = self.state_lock();
        state.session_overrides.remove(&session_id);
        state.capture_marked.retain(|k| k.session_id != session_id);
        state.replays.retain(|k, _| k.session_id != session_id);
    }

    /// Model change, tool configuration change, or any other context shift
    /// that invalidates the paused request and its replay.
    pub fn handle_context_changed(&self, key: SessionKey, cause: &str) {
        self.cancel_intercept_for_context_change(key, cause);
        self.mark_replay_stale_internal(key, None, cause);
    }

    /// Persist one request's editable state.
    pub fn persist(&self, key: SessionKey) {
        let Some(store) = self.store.as_ref() else {
            return;
        };
        let snapshot = {
            let state = self.state_lock();
            state.requests.get(&key).cloned()
        };
        let Some(request) = snapshot else { return };
        if let Err(err) = store.save_request_snapshot(&request) {
            self.warn(&format!("request cache write failed for {key}: {err}"));
        }
    }

    /// Persist every tracked request (lifecycle hook, e.g. deactivation).
    pub fn persist_all(&self) {
        let keys: Vec<SessionKey> = {
            let state = self.state_lock();
            state.requests.keys().copied().collect()
        };
        for key in keys {
            self.persist(key);
        }
    }

    pub fn config_snapshot(&self) -> LiveEditorConfig {
        self.lock_poison_ok(&self.config).clone()
    }

    /// Toggle the whole editor feature. Disabling cancels every pending
    /// intercept across all keys.
    pub fn set_feature_enabled(&self, enabled: bool) {
        {
            let mut config = self.lock_poison_ok(&self.config);
            config.enabled = enabled;
        }
        if !enabled {
            self.cancel_all_intercepts(promptgate_core::CancelReason::EditorDisabled);
        }
    }

    /// Toggle interception. Disabling cancels every pending intercept.
    pub fn set_interception_enabled(&self, enabled: bool) {
        {
            let mut config = self.lock_poison_ok(&self.config);
            config.interception_enabled = enabled;
        }
        if !enabled {
            self.cancel_all_intercepts(promptgate_core::CancelReason::ModeDisabled);
        }
    }

    pub(crate) fn state_lock(&self) -> MutexGuard<'_, ServiceState> {
        self.lock_poison_ok(&self.state)
    }

    // A poisoned lock only means a panic elsewhere; the state itself is
    // still the best available.
    pub(crate) fn lock_poison_ok<'a, T>(&'a self, mutex: &'a Mutex<T>) -> MutexGuard<'a, T> {
        mutex.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn warn(&self, msg: &str) {
        if let Some(cb) = &self.warn_cb {
            cb(msg);
        }
    }

    pub(crate) fn emit_event(&self, key: SessionKey, kind: EventKind) {
        let envelope = EventEnvelope {
            seq_no: self.seq_no.fetch_add(1, Ordering::SeqCst) + 1,
            at: Utc::now(),
            session_key: key,
            kind,
        };
        let callbacks: Vec<EventCallback> =
            self.lock_poison_ok(&self.listeners.event).clone();
        for cb in callbacks {
            cb(envelope.clone());
        }
    }

    pub(crate) fn notify_request_updated(&self, request: &EditableChatRequest) {
        let callbacks: Vec<RequestUpdatedCallback> =
            self.lock_poison_ok(&self.listeners.request_updated).clone();
        for cb in callbacks {
            cb(request);
        }
    }

    pub(crate) fn notify_request_removed(&self, key: SessionKey) {
        let callbacks: Vec<RequestRemovedCallback> =
            self.lock_poison_ok(&self.listeners.request_removed).clone();
        for cb in callbacks {
            cb(key);
        }
    }

    pub(crate) fn notify_intercept_changed(&self) {
        let summaries = self.pending_intercepts();
        let callbacks: Vec<InterceptChangedCallback> =
            self.lock_poison_ok(&self.listeners.intercept_changed).clone();
        for cb in callbacks {
            cb(&summaries);
        }
    }

    pub(crate) fn notify_metadata_changed(&self, key: SessionKey) {
        let callbacks: Vec<MetadataChangedCallback> =
            self.lock_poison_ok(&self.listeners.metadata_changed).clone();
        for cb in callbacks {
            cb(key);
        }
    }

    pub(crate) fn notify_replay_changed(&self, snapshot: &LiveRequestReplaySnapshot) {
        let callbacks: Vec<ReplayChangedCallback> =
            self.lock_poison_ok(&self.listeners.replay_changed).clone();
        for cb in callbacks {
            cb(snapshot);
        }
    }

    pub(crate) fn store(&self) -> Option<&Store> {
        self.store.as_ref()
    }

    pub(crate) fn update_section_render(request: &mut EditableChatRequest, section_index: usize) {
        let section = &mut request.sections[section_index];
        if let Some(edited) = &section.edited_message {
            let rendered = render_message_content(edited);
            section.token_count = estimate_token_count(&rendered);
            section.edited_content = Some(rendered);
        } else {
            section.token_count = estimate_token_count(&section.content);
            section.edited_content = None;
        }
    }
}
