//! Public types, callback signatures, and status snapshots for the live
//! request service.

use promptgate_core::{
    EditableChatRequest, EventEnvelope, LiveRequestReplaySnapshot, OverrideMode, OverrideScope,
    PendingInterceptSummary, SessionKey,
};
use std::sync::Arc;

/// Poll interval while a send pipeline is suspended on an intercept.
pub const INTERCEPT_POLL_INTERVAL_MS: u64 = 25;

/// Display cap for replay timelines. Bounds the rendered bubble count only;
/// the payload is never truncated.
pub const REPLAY_SECTION_DISPLAY_CAP: usize = 30;

/// Fired with the full request after any mutation.
pub type RequestUpdatedCallback = Arc<dyn Fn(&EditableChatRequest) + Send + Sync>;

/// Fired when a tracked request is evicted.
pub type RequestRemovedCallback = Arc<dyn Fn(SessionKey) + Send + Sync>;

/// Fired whenever the set of pending intercepts changes.
pub type InterceptChangedCallback = Arc<dyn Fn(&[PendingInterceptSummary]) + Send + Sync>;

/// Fired when request metadata (token trace, logged hash) changes.
pub type MetadataChangedCallback = Arc<dyn Fn(SessionKey) + Send + Sync>;

/// Fired when a replay snapshot is built, restored, or transitioned.
pub type ReplayChangedCallback = Arc<dyn Fn(&LiveRequestReplaySnapshot) + Send + Sync>;

/// Receives every diagnostic event record. Wire this to an observer; the
/// service itself never does I/O for diagnostics.
pub type EventCallback = Arc<dyn Fn(EventEnvelope) + Send + Sync>;

/// Receives non-fatal degradation notices (e.g. persistence failures).
pub type WarnCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// One undo-stack entry: a single scalar mutation at a leaf path. The
/// owning section is pinned by id at edit time, so undo/redo keep landing
/// on the same section after deletions shift message positions.
#[derive(Debug, Clone)]
pub struct LeafEdit {
    pub section_id: String,
    pub path: String,
    pub previous: serde_json::Value,
    pub next: serde_json::Value,
}

/// Snapshot of the auto-override machinery for UI display.
#[derive(Debug, Clone)]
pub struct AutoOverrideStatus {
    pub mode: OverrideMode,
    pub scope: OverrideScope,
    pub session_entries: usize,
    pub workspace_entries: usize,
    pub preview_count: usize,
}
