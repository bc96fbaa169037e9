use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use uuid::Uuid;

pub type Result<T> = anyhow::Result<T>;

/// Maximum characters of JSON shown when rendering an opaque content part.
pub const OPAQUE_PREVIEW_MAX_CHARS: usize = 200;

pub fn runtime_dir(workspace: &Path) -> PathBuf {
    workspace.join(".promptgate")
}

/// Chat surface a request originates from. Mirrors the host's chat
/// location taxonomy; `Other` absorbs surfaces added after this was written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChatLocation {
    Panel,
    Editor,
    Terminal,
    Notebook,
    Other,
}

impl fmt::Display for ChatLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChatLocation::Panel => "panel",
            ChatLocation::Editor => "editor",
            ChatLocation::Terminal => "terminal",
            ChatLocation::Notebook => "notebook",
            ChatLocation::Other => "other",
        };
        f.write_str(s)
    }
}

/// Compound identity addressing all per-request state: one conversation
/// session plus the surface it runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey {
    pub session_id: Uuid,
    pub location: ChatLocation,
}

impl SessionKey {
    #[must_use]
    pub fn new(session_id: Uuid, location: ChatLocation) -> Self {
        Self {
            session_id,
            location,
        }
    }

    /// String form used as the durable-storage key.
    #[must_use]
    pub fn storage_key(&self) -> String {
        format!("{}@{}", self.session_id, self.location)
    }

    /// Key for events that concern no particular session, e.g. clearing
    /// workspace-scope overrides.
    #[must_use]
    pub fn unscoped() -> Self {
        Self {
            session_id: Uuid::nil(),
            location: ChatLocation::Panel,
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.session_id, self.location)
    }
}

/// One piece of a message body. Messages are part lists so that edits can
/// preserve non-text parts (images, cache breakpoints) positionally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text {
        text: String,
    },
    Image {
        mime: String,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        alt: Option<String>,
    },
    CacheBreakpoint {
        cache_type: String,
    },
    /// Provider-specific part this core does not understand. Carried through
    /// untouched; rendered via best-effort heuristics only.
    Opaque {
        value: serde_json::Value,
    },
}

impl ContentPart {
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    #[must_use]
    pub fn is_text(&self) -> bool {
        matches!(self, ContentPart::Text { .. })
    }
}

/// A tool (function) call attached to an assistant message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmToolCall {
    pub id: String,
    pub name: String,
    /// Raw JSON argument string, exactly as the model produced it.
    pub arguments: String,
}

/// A message in a multi-turn conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role")]
pub enum ChatMessage {
    #[serde(rename = "system")]
    System { content: Vec<ContentPart> },
    #[serde(rename = "user")]
    User {
        content: Vec<ContentPart>,
        /// Prompt-element hint from the renderer (e.g. "history", "context").
        /// Drives section-kind inference; absent for plain user turns.
        #[serde(skip_serializing_if = "Option::is_none", default)]
        name: Option<String>,
    },
    #[serde(rename = "assistant")]
    Assistant {
        content: Vec<ContentPart>,
        #[serde(skip_serializing_if = "Vec::is_empty", default)]
        tool_calls: Vec<LlmToolCall>,
    },
    #[serde(rename = "tool")]
    Tool {
        tool_call_id: String,
        content: Vec<ContentPart>,
    },
}

impl ChatMessage {
    #[must_use]
    pub fn system(text: impl Into<String>) -> Self {
        Self::System {
            content: vec![ContentPart::text(text)],
        }
    }

    #[must_use]
    pub fn user(text: impl Into<String>) -> Self {
        Self::User {
            content: vec![ContentPart::text(text)],
            name: None,
        }
    }

    #[must_use]
    pub fn named_user(text: impl Into<String>, name: impl Into<String>) -> Self {
        Self::User {
            content: vec![ContentPart::text(text)],
            name: Some(name.into()),
        }
    }

    #[must_use]
    pub fn assistant(text: impl Into<String>) -> Self {
        Self::Assistant {
            content: vec![ContentPart::text(text)],
            tool_calls: vec![],
        }
    }

    #[must_use]
    pub fn role_name(&self) -> &'static str {
        match self {
            ChatMessage::System { .. } => "system",
            ChatMessage::User { .. } => "user",
            ChatMessage::Assistant { .. } => "assistant",
            ChatMessage::Tool { .. } => "tool",
        }
    }

    #[must_use]
    pub fn content(&self) -> &[ContentPart] {
        match self {
            ChatMessage::System { content }
            | ChatMessage::User { content, .. }
            | ChatMessage::Assistant { content, .. }
            | ChatMessage::Tool { content, .. } => content,
        }
    }

    pub fn set_content(&mut self, parts: Vec<ContentPart>) {
        match self {
            ChatMessage::System { content }
            | ChatMessage::User { content, .. }
            | ChatMessage::Assistant { content, .. }
            | ChatMessage::Tool { content, .. } => *content = parts,
        }
    }

    /// The renderer's prompt-element hint, when present (user messages only).
    #[must_use]
    pub fn name_hint(&self) -> Option<&str> {
        match self {
            ChatMessage::User { name, .. } => name.as_deref(),
            _ => None,
        }
    }
}

/// Classification of one editable section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SectionKind {
    System,
    User,
    Assistant,
    Context,
    History,
    Tool,
    Prediction,
    Metadata,
    Other,
}

impl SectionKind {
    /// System and metadata sections anchor the request and cannot be removed.
    #[must_use]
    pub fn deletable(self) -> bool {
        !matches!(self, SectionKind::System | SectionKind::Metadata)
    }
}

impl fmt::Display for SectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SectionKind::System => "system",
            SectionKind::User => "user",
            SectionKind::Assistant => "assistant",
            SectionKind::Context => "context",
            SectionKind::History => "history",
            SectionKind::Tool => "tool",
            SectionKind::Prediction => "prediction",
            SectionKind::Metadata => "metadata",
            SectionKind::Other => "other",
        };
        f.write_str(s)
    }
}

/// Infer the section kind for a message. Role decides directly except for
/// user messages, where the renderer's name hint is inspected for known
/// prompt-element substrings. The substring check is deliberately fuzzy and
/// kept here as a pure function so it can be tested and swapped in isolation.
#[must_use]
pub fn infer_section_kind(message: &ChatMessage) -> SectionKind {
    match message {
        ChatMessage::System { .. } => SectionKind::System,
        ChatMessage::Assistant { .. } => SectionKind::Assistant,
        ChatMessage::Tool { .. } => SectionKind::Tool,
        ChatMessage::User { name, .. } => {
            let Some(name) = name else {
                return SectionKind::User;
            };
            let lower = name.to_ascii_lowercase();
            if lower.contains("history") {
                SectionKind::History
            } else if lower.contains("context") {
                SectionKind::Context
            } else if lower.contains("prediction") {
                SectionKind::Prediction
            } else if lower.contains("metadata") {
                SectionKind::Metadata
            } else {
                SectionKind::User
            }
        }
    }
}

/// Structured tool-invocation details attached to a tool section by
/// cross-referencing the assistant message that issued the call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocationInfo {
    pub call_id: String,
    pub function_name: String,
    /// Pretty-printed JSON arguments, or the raw string when unparseable.
    pub pretty_args: String,
}

/// Scope an auto-override entry applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OverrideScope {
    Session,
    Workspace,
}

impl fmt::Display for OverrideScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OverrideScope::Session => f.write_str("session"),
            OverrideScope::Workspace => f.write_str("workspace"),
        }
    }
}

/// Whether captured edits are replayed onto future requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OverrideMode {
    #[default]
    Off,
    AutoOverride,
}

/// Provenance tag on a section that an auto-override patched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverrideState {
    pub scope: OverrideScope,
    pub label: String,
}

/// A captured edit or deletion applied to one section during an
/// interception, replayed onto later requests whose projection yields a
/// section with the same identity. Identity is (scope, kind, label), never
/// a message index — indices are not stable across distinct requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoOverrideEntry {
    pub scope: OverrideScope,
    pub kind: SectionKind,
    pub label: String,
    pub original_content: String,
    /// Absent when the override is a deletion.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub override_content: Option<String>,
    pub deleted: bool,
    /// Position in the bounded preview history.
    pub slot: usize,
}

/// Replay lifecycle. `Ready` snapshots render as timelines; `Stale` ones
/// are kept for display but no longer track the request; `ForkActive` marks
/// the hand-off into a live continuable session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReplayStateKind {
    Ready,
    Stale,
    ForkActive,
}

/// Section-count summary for timeline display. The display cap bounds the
/// rendered bubble count only, never the payload itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayProjection {
    pub total: usize,
    pub edited: usize,
    pub deleted: usize,
    /// Sections beyond the display cap.
    pub overflow: usize,
}

/// A versioned, display-only projection of the current edited payload.
/// Immutable once built; rebuilds produce a new snapshot with a higher
/// version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveRequestReplaySnapshot {
    pub key: SessionKey,
    pub request_id: Uuid,
    pub state: ReplayStateKind,
    /// Monotonic per key; strictly increases on every rebuild or restore.
    pub version: u64,
    /// Byte-identical to what `messages_for_send` returned at build time.
    pub payload: Vec<ChatMessage>,
    pub payload_hash: String,
    pub projection: ReplayProjection,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub stale_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub fork_session_id: Option<Uuid>,
    /// Set when produced by "restore previous replay".
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub restore_of_version: Option<u64>,
}

/// One editable unit of a chat request, derived from exactly one message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveRequestSection {
    /// Stable for the life of the request: `<kind>-<source index>`.
    pub id: String,
    pub kind: SectionKind,
    pub label: String,
    /// String rendering of the original message, for editing.
    pub content: String,
    /// Present only once the section has been mutated.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub edited_content: Option<String>,
    /// The effective message carrying edits from either granularity.
    /// `edited_content` is always the rendering of this when present.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub edited_message: Option<ChatMessage>,
    pub deleted: bool,
    /// UI hint only; never affects the send payload.
    pub collapsed: bool,
    pub editable: bool,
    pub deletable: bool,
    /// Position in `original_messages`; stable across delete/restore cycles.
    pub source_message_index: usize,
    pub token_count: u32,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub tool_invocation: Option<ToolInvocationInfo>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub override_state: Option<OverrideState>,
}

/// Display label for a section: the renderer's name hint when present,
/// else the kind name.
#[must_use]
pub fn section_label(kind: SectionKind, message: &ChatMessage) -> String {
    match message.name_hint() {
        Some(name) => name.to_string(),
        None => kind.to_string(),
    }
}

/// Identity label for override matching. Message indices are not used
/// because they are not stable across distinct requests, and the bare kind
/// name is not enough either: two plain user turns would collide. Sections
/// with a real name hint use it; hint-less ones fall back to a digest of
/// the original content, so an override only ever matches a section that
/// started out identical.
#[must_use]
pub fn override_identity_label(section: &LiveRequestSection) -> String {
    if section.label != section.kind.to_string() {
        return section.label.clone();
    }
    let digest = Sha256::digest(section.content.as_bytes());
    let hex = format!("{digest:x}");
    format!("{}#{}", section.kind, &hex[..16])
}

/// Map each message to exactly one section, preserving order. A second pass
/// annotates tool sections with invocation details by cross-referencing
/// assistant tool-call lists earlier in the array.
#[must_use]
pub fn build_sections(messages: &[ChatMessage]) -> Vec<LiveRequestSection> {
    let mut sections: Vec<LiveRequestSection> = messages
        .iter()
        .enumerate()
        .map(|(index, message)| {
            let kind = infer_section_kind(message);
            let content = render_message_content(message);
            let token_count = estimate_token_count(&content);
            LiveRequestSection {
                id: format!("{kind}-{index}"),
                kind,
                label: section_label(kind, message),
                content,
                edited_content: None,
                edited_message: None,
                deleted: false,
                collapsed: false,
                editable: true,
                deletable: kind.deletable(),
                source_message_index: index,
                token_count,
                tool_invocation: None,
                override_state: None,
            }
        })
        .collect();

    for section in &mut sections {
        if section.kind != SectionKind::Tool {
            continue;
        }
        let ChatMessage::Tool { tool_call_id, .. } = &messages[section.source_message_index]
        else {
            continue;
        };
        let info = messages[..section.source_message_index]
            .iter()
            .rev()
            .find_map(|m| match m {
                ChatMessage::Assistant { tool_calls, .. } => tool_calls
                    .iter()
                    .find(|tc| &tc.id == tool_call_id)
                    .map(|tc| ToolInvocationInfo {
                        call_id: tc.id.clone(),
                        function_name: tc.name.clone(),
                        pretty_args: pretty_print_arguments(&tc.arguments),
                    }),
                _ => None,
            });
        if let Some(info) = info {
            section.label = info.function_name.clone();
            section.tool_invocation = Some(info);
        }
    }

    sections
}

fn pretty_print_arguments(raw: &str) -> String {
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(value) => serde_json::to_string_pretty(&value).unwrap_or_else(|_| raw.to_string()),
        Err(_) => raw.to_string(),
    }
}

/// String rendering of a message for the editor view. Multi-part messages
/// join with a blank line; images become a markdown placeholder; opaque
/// parts degrade to a bounded preview. Must never panic — a failure here
/// would drop the user's prompt silently.
#[must_use]
pub fn render_message_content(message: &ChatMessage) -> String {
    let rendered: Vec<String> = message
        .content()
        .iter()
        .map(render_content_part)
        .filter(|s| !s.is_empty())
        .collect();
    rendered.join("\n\n")
}

fn render_content_part(part: &ContentPart) -> String {
    match part {
        ContentPart::Text { text } => text.clone(),
        ContentPart::Image { mime, alt } => {
            let alt = alt.as_deref().unwrap_or("image");
            format!("![{alt}](attachment:{mime})")
        }
        ContentPart::CacheBreakpoint { cache_type } => {
            format!("[cache breakpoint: {cache_type}]")
        }
        ContentPart::Opaque { value } => render_opaque_value(value),
    }
}

/// Best-effort rendering of a part shape this core does not know: a
/// type/id/label field triple when present, else a bounded JSON preview,
/// else a generic placeholder.
fn render_opaque_value(value: &serde_json::Value) -> String {
    if let serde_json::Value::Object(map) = value {
        let picked: Vec<&str> = ["type", "id", "label", "name"]
            .iter()
            .filter_map(|field| map.get(*field).and_then(|v| v.as_str()))
            .collect();
        if !picked.is_empty() {
            return format!("[{}]", picked.join(" "));
        }
    }
    match serde_json::to_string(value) {
        Ok(json) if json.chars().count() > OPAQUE_PREVIEW_MAX_CHARS => {
            let preview: String = json.chars().take(OPAQUE_PREVIEW_MAX_CHARS).collect();
            format!("[opaque: {preview}…]")
        }
        Ok(json) => format!("[opaque: {json}]"),
        Err(_) => "[opaque part]".to_string(),
    }
}

/// Rough token estimate (~4 chars per token). Good enough for section
/// badges; real counts come from the rendering collaborator when available.
#[must_use]
pub fn estimate_token_count(text: &str) -> u32 {
    (text.chars().count() as u32).div_ceil(4)
}

/// Deterministic digest of a message list, used for replay auditing and
/// send-parity checks.
#[must_use]
pub fn payload_hash(messages: &[ChatMessage]) -> String {
    let json = serde_json::to_string(messages).unwrap_or_default();
    let digest = Sha256::digest(json.as_bytes());
    format!("{digest:x}")
}

/// Per-request metadata from the rendering collaborator plus bookkeeping
/// maintained by the service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestMetadata {
    pub request_id: Uuid,
    pub intent_id: Option<String>,
    pub endpoint_url: Option<String>,
    pub model_family: Option<String>,
    pub token_count: u32,
    pub max_prompt_tokens: Option<u32>,
    #[serde(default)]
    pub request_options: serde_json::Value,
    pub created_at: DateTime<Utc>,
    /// Digest of the payload the caller ultimately logged as sent; compared
    /// against the edited payload to detect silent divergence.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub last_logged_hash: Option<String>,
    /// Sub-agent requests are never intercepted: no human is attached.
    #[serde(default)]
    pub subagent: bool,
}

/// The root aggregate for one in-flight or completed chat turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EditableChatRequest {
    pub id: Uuid,
    pub key: SessionKey,
    pub debug_name: String,
    pub model: String,
    /// Current, possibly edited, message list. Always reproducible by
    /// replaying non-deleted sections against `original_messages`.
    pub messages: Vec<ChatMessage>,
    /// Immutable snapshot at creation.
    pub original_messages: Vec<ChatMessage>,
    pub sections: Vec<LiveRequestSection>,
    pub metadata: RequestMetadata,
    pub is_dirty: bool,
}

/// What the prompt-rendering collaborator hands over for one turn.
#[derive(Debug, Clone)]
pub struct RenderedPrompt {
    pub messages: Vec<ChatMessage>,
    pub model: String,
    pub token_count: u32,
    pub intent_id: Option<String>,
    pub endpoint_url: Option<String>,
    pub model_family: Option<String>,
    pub request_options: serde_json::Value,
    pub max_prompt_tokens: Option<u32>,
    pub subagent: bool,
}

impl RenderedPrompt {
    #[must_use]
    pub fn new(messages: Vec<ChatMessage>, model: impl Into<String>) -> Self {
        Self {
            messages,
            model: model.into(),
            token_count: 0,
            intent_id: None,
            endpoint_url: None,
            model_family: None,
            request_options: serde_json::Value::Null,
            max_prompt_tokens: None,
            subagent: false,
        }
    }
}

/// How a pending intercept was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InterceptAction {
    Resume,
    Cancel,
}

/// Why a pending intercept was cancelled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CancelReason {
    /// The caller's cancellation token fired.
    Token,
    /// A newer intercept for the same key replaced this one.
    Superseded,
    /// Resume was requested but the payload no longer validates.
    Invalid,
    SessionDisposed,
    ContextChanged { cause: String },
    ModeDisabled,
    EditorDisabled,
    Timeout,
    Unspecified,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelReason::Token => f.write_str("token"),
            CancelReason::Superseded => f.write_str("superseded"),
            CancelReason::Invalid => f.write_str("invalid"),
            CancelReason::SessionDisposed => f.write_str("session-disposed"),
            CancelReason::ContextChanged { cause } => write!(f, "context-changed:{cause}"),
            CancelReason::ModeDisabled => f.write_str("mode-disabled"),
            CancelReason::EditorDisabled => f.write_str("editor-disabled"),
            CancelReason::Timeout => f.write_str("timeout"),
            CancelReason::Unspecified => f.write_str("unspecified"),
        }
    }
}

/// Outcome handed back to the suspended send pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum InterceptDecision {
    /// Approved; carries the exact message list to send.
    Resume(Vec<ChatMessage>),
    /// The send must be aborted. Editing state survives cancellation.
    Cancel(CancelReason),
}

/// Snapshot of one outstanding intercept, for UI display.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingInterceptSummary {
    pub key: SessionKey,
    pub request_id: Uuid,
    pub debug_name: String,
    pub requested_at: DateTime<Utc>,
    /// Monotonically increasing across the process; a UI holding an older
    /// nonce knows its intercept was superseded.
    pub nonce: u64,
}

/// Validation failures reported as data, never thrown. Callers of
/// `messages_for_send` must check and react.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("request payload is empty")]
    Empty,
}

impl ValidationError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            ValidationError::Empty => "empty",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub seq_no: u64,
    pub at: DateTime<Utc>,
    pub session_key: SessionKey,
    pub kind: EventKind,
}

/// Diagnostic records emitted by the service. This is the subsystem's only
/// wire format; a telemetry layer forwards these verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum EventKind {
    /// Emitted exactly once per intercept resolution, on every exit path.
    InterceptResolvedV1 {
        request_id: Uuid,
        debug_name: String,
        action: InterceptAction,
        reason: Option<CancelReason>,
    },
    /// The payload logged as sent differs from the edited payload.
    ParityMismatchV1 {
        request_id: Uuid,
        expected_hash: String,
        logged_hash: String,
    },
    OverrideTrimmedV1 {
        scope: OverrideScope,
        evicted_label: String,
    },
    OverrideClearedV1 {
        scope: Option<OverrideScope>,
        removed: usize,
    },
    ReplayBuiltV1 {
        request_id: Uuid,
        version: u64,
        payload_hash: String,
    },
}

impl EventKind {
    /// Short name for log lines and telemetry routing.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::InterceptResolvedV1 { .. } => "intercept_resolved",
            EventKind::ParityMismatchV1 { .. } => "parity_mismatch",
            EventKind::OverrideTrimmedV1 { .. } => "override_trimmed",
            EventKind::OverrideClearedV1 { .. } => "override_cleared",
            EventKind::ReplayBuiltV1 { .. } => "replay_built",
        }
    }
}

/// Advisory cancellation flag for the caller's wait. Cancelling aborts the
/// send, not the editing session.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

fn default_preview_limit() -> usize {
    20
}

/// Feature flags and knobs for the live request editor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LiveEditorConfig {
    pub enabled: bool,
    pub interception_enabled: bool,
    pub replay_enabled: bool,
    #[serde(default = "default_preview_limit")]
    pub auto_override_preview_limit: usize,
    /// When set, pending intercepts auto-cancel after this many seconds.
    pub intercept_timeout_secs: Option<u64>,
    pub override_mode: OverrideMode,
    pub override_scope: OverrideScope,
}

impl Default for LiveEditorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interception_enabled: false,
            replay_enabled: true,
            auto_override_preview_limit: default_preview_limit(),
            intercept_timeout_secs: None,
            override_mode: OverrideMode::Off,
            override_scope: OverrideScope::Session,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct TelemetryConfig {
    pub enabled: bool,
    pub endpoint: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub editor: LiveEditorConfig,
    pub telemetry: TelemetryConfig,
}

impl AppConfig {
    pub fn user_settings_path() -> Option<PathBuf> {
        let home = std::env::var("HOME")
            .ok()
            .or_else(|| std::env::var("USERPROFILE").ok())?;
        Some(Path::new(&home).join(".promptgate/settings.json"))
    }

    pub fn project_settings_path(workspace: &Path) -> PathBuf {
        runtime_dir(workspace).join("settings.json")
    }

    pub fn project_local_settings_path(workspace: &Path) -> PathBuf {
        runtime_dir(workspace).join("settings.local.json")
    }

    pub fn legacy_toml_path(workspace: &Path) -> PathBuf {
        runtime_dir(workspace).join("config.toml")
    }

    /// Settings files in overlay order, lowest precedence first. Later
    /// entries win key-by-key.
    fn overlay_paths(workspace: &Path) -> Vec<PathBuf> {
        let mut paths = vec![Self::legacy_toml_path(workspace)];
        if let Some(user) = Self::user_settings_path() {
            paths.push(user);
        }
        paths.push(Self::project_settings_path(workspace));
        paths.push(Self::project_local_settings_path(workspace));
        paths
    }

    /// Read one settings file into a raw JSON overlay. Missing files are
    /// not an error; the legacy TOML file is carried over as-is.
    fn read_overlay(path: &Path) -> Result<Option<serde_json::Value>> {
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(path)?;
        let value = if path.extension().is_some_and(|ext| ext == "toml") {
            serde_json::to_value(toml::from_str::<toml::Value>(&raw)?)?
        } else {
            serde_json::from_str(&raw)?
        };
        Ok(Some(value))
    }

    pub fn load(workspace: &Path) -> Result<Self> {
        let mut merged = serde_json::to_value(Self::default())?;
        for path in Self::overlay_paths(workspace) {
            if let Some(overlay) = Self::read_overlay(&path)? {
                merge_settings(&mut merged, &overlay);
            }
        }
        Ok(serde_json::from_value(merged)?)
    }

    pub fn ensure(workspace: &Path) -> Result<Self> {
        if Self::overlay_paths(workspace).iter().any(|p| p.exists()) {
            return Self::load(workspace);
        }
        let cfg = Self::default();
        cfg.save(workspace)?;
        Ok(cfg)
    }

    pub fn save(&self, workspace: &Path) -> Result<()> {
        let path = Self::project_settings_path(workspace);
        fs::create_dir_all(
            path.parent()
                .ok_or_else(|| anyhow::anyhow!("invalid config path"))?,
        )?;
        fs::write(path, serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }
}

/// Deep-merge `overlay` into `base`: objects merge key-by-key, everything
/// else is replaced by the overlay value.
pub fn merge_settings(base: &mut serde_json::Value, overlay: &serde_json::Value) {
    match (base, overlay) {
        (serde_json::Value::Object(base_obj), serde_json::Value::Object(overlay_obj)) => {
            for (key, overlay_value) in overlay_obj {
                if let Some(base_value) = base_obj.get_mut(key) {
                    merge_settings(base_value, overlay_value);
                } else {
                    base_obj.insert(key.clone(), overlay_value.clone());
                }
            }
        }
        (base_slot, overlay_value) => {
            *base_slot = overlay_value.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn kind_inference_maps_roles_and_name_hints() {
        assert_eq!(
            infer_section_kind(&ChatMessage::system("s")),
            SectionKind::System
        );
        assert_eq!(
            infer_section_kind(&ChatMessage::assistant("a")),
            SectionKind::Assistant
        );
        assert_eq!(
            infer_section_kind(&ChatMessage::user("u")),
            SectionKind::User
        );
        assert_eq!(
            infer_section_kind(&ChatMessage::named_user("u", "conversation-history")),
            SectionKind::History
        );
        assert_eq!(
            infer_section_kind(&ChatMessage::named_user("u", "WorkspaceContext")),
            SectionKind::Context
        );
        assert_eq!(
            infer_section_kind(&ChatMessage::named_user("u", "edit-prediction")),
            SectionKind::Prediction
        );
        assert_eq!(
            infer_section_kind(&ChatMessage::Tool {
                tool_call_id: "c1".to_string(),
                content: vec![ContentPart::text("out")],
            }),
            SectionKind::Tool
        );
    }

    #[test]
    fn sections_are_one_per_message_in_order_with_capability_flags() {
        let messages = vec![
            ChatMessage::system("sys"),
            ChatMessage::user("u1"),
            ChatMessage::named_user("ctx", "context"),
        ];
        let sections = build_sections(&messages);
        assert_eq!(sections.len(), 3);
        assert_eq!(sections[0].id, "system-0");
        assert!(!sections[0].deletable);
        assert!(sections[1].deletable);
        assert_eq!(sections[2].kind, SectionKind::Context);
        assert_eq!(sections[2].label, "context");
        assert_eq!(sections[2].source_message_index, 2);
    }

    #[test]
    fn override_identity_separates_hintless_sections_of_one_kind() {
        let sections = build_sections(&[
            ChatMessage::user("first turn"),
            ChatMessage::user("second turn"),
            ChatMessage::named_user("ctx", "workspace-context"),
        ]);
        let first = override_identity_label(&sections[0]);
        let second = override_identity_label(&sections[1]);
        assert_ne!(first, second);
        assert!(first.starts_with("user#"));
        // A real name hint is used as-is.
        assert_eq!(override_identity_label(&sections[2]), "workspace-context");

        // Identity follows original content, not position.
        let shifted = build_sections(&[
            ChatMessage::system("sys"),
            ChatMessage::user("first turn"),
        ]);
        assert_eq!(override_identity_label(&shifted[1]), first);
    }

    #[test]
    fn tool_sections_are_annotated_from_earlier_assistant_calls() {
        let messages = vec![
            ChatMessage::user("run it"),
            ChatMessage::Assistant {
                content: vec![],
                tool_calls: vec![LlmToolCall {
                    id: "call-7".to_string(),
                    name: "read_file".to_string(),
                    arguments: r#"{"path":"src/lib.rs"}"#.to_string(),
                }],
            },
            ChatMessage::Tool {
                tool_call_id: "call-7".to_string(),
                content: vec![ContentPart::text("contents")],
            },
        ];
        let sections = build_sections(&messages);
        let info = sections[2].tool_invocation.as_ref().expect("annotated");
        assert_eq!(info.call_id, "call-7");
        assert_eq!(info.function_name, "read_file");
        assert!(info.pretty_args.contains("src/lib.rs"));
        assert_eq!(sections[2].label, "read_file");
    }

    #[test]
    fn rendering_joins_parts_and_degrades_opaque_shapes() {
        let message = ChatMessage::User {
            content: vec![
                ContentPart::text("hello"),
                ContentPart::Image {
                    mime: "image/png".to_string(),
                    alt: None,
                },
                ContentPart::Opaque {
                    value: json!({"type": "reference", "id": "f1"}),
                },
                ContentPart::Opaque { value: json!(42) },
            ],
            name: None,
        };
        let rendered = render_message_content(&message);
        assert_eq!(
            rendered,
            "hello\n\n![image](attachment:image/png)\n\n[reference f1]\n\n[opaque: 42]"
        );
    }

    #[test]
    fn oversized_opaque_parts_are_bounded() {
        let big = "x".repeat(OPAQUE_PREVIEW_MAX_CHARS * 3);
        let message = ChatMessage::User {
            content: vec![ContentPart::Opaque {
                value: json!({ "blob": big }),
            }],
            name: None,
        };
        let rendered = render_message_content(&message);
        assert!(rendered.chars().count() < OPAQUE_PREVIEW_MAX_CHARS + 32);
        assert!(rendered.ends_with("…]"));
    }

    #[test]
    fn payload_hash_is_stable_and_content_sensitive() {
        let a = vec![ChatMessage::user("hi")];
        let b = vec![ChatMessage::user("hi")];
        let c = vec![ChatMessage::user("bye")];
        assert_eq!(payload_hash(&a), payload_hash(&b));
        assert_ne!(payload_hash(&a), payload_hash(&c));
    }

    #[test]
    fn cancel_reasons_render_with_cause() {
        assert_eq!(CancelReason::Token.to_string(), "token");
        assert_eq!(
            CancelReason::ContextChanged {
                cause: "model".to_string()
            }
            .to_string(),
            "context-changed:model"
        );
    }

    #[test]
    fn event_kinds_round_trip_via_serde() {
        let events = vec![
            EventKind::InterceptResolvedV1 {
                request_id: Uuid::now_v7(),
                debug_name: "chat".to_string(),
                action: InterceptAction::Cancel,
                reason: Some(CancelReason::SessionDisposed),
            },
            EventKind::ParityMismatchV1 {
                request_id: Uuid::now_v7(),
                expected_hash: "aa".to_string(),
                logged_hash: "bb".to_string(),
            },
            EventKind::OverrideClearedV1 {
                scope: Some(OverrideScope::Workspace),
                removed: 3,
            },
        ];
        for event in events {
            let serialized = serde_json::to_string(&event).expect("serialize");
            let deserialized: EventKind = serde_json::from_str(&serialized).expect("deserialize");
            let re_serialized = serde_json::to_string(&deserialized).expect("re-serialize");
            assert_eq!(serialized, re_serialized);
        }
    }

    #[test]
    fn config_round_trips_through_workspace_files() {
        let workspace = tempfile::tempdir().expect("tempdir");
        let mut cfg = AppConfig::ensure(workspace.path()).expect("ensure");
        assert!(!cfg.editor.interception_enabled);
        cfg.editor.interception_enabled = true;
        cfg.editor.auto_override_preview_limit = 5;
        cfg.save(workspace.path()).expect("save");
        let reloaded = AppConfig::load(workspace.path()).expect("load");
        assert!(reloaded.editor.interception_enabled);
        assert_eq!(reloaded.editor.auto_override_preview_limit, 5);
    }

    #[test]
    fn legacy_toml_is_overlaid_below_project_settings() {
        let workspace = tempfile::tempdir().expect("tempdir");
        let dir = runtime_dir(workspace.path());
        fs::create_dir_all(&dir).expect("runtime dir");
        fs::write(
            AppConfig::legacy_toml_path(workspace.path()),
            "[editor]\ninterception_enabled = true\nauto_override_preview_limit = 7\n",
        )
        .expect("write toml");
        fs::write(
            AppConfig::project_settings_path(workspace.path()),
            r#"{"editor":{"auto_override_preview_limit":3}}"#,
        )
        .expect("write json");

        let cfg = AppConfig::load(workspace.path()).expect("load");
        // The TOML flag survives; the JSON layer wins the contested key.
        assert!(cfg.editor.interception_enabled);
        assert_eq!(cfg.editor.auto_override_preview_limit, 3);
    }

    fn part_strategy() -> impl Strategy<Value = ContentPart> {
        prop_oneof![
            ".{0,40}".prop_map(|text| ContentPart::Text { text }),
            Just(ContentPart::Image {
                mime: "image/png".to_string(),
                alt: None,
            }),
            Just(ContentPart::CacheBreakpoint {
                cache_type: "ephemeral".to_string(),
            }),
            any::<i64>().prop_map(|n| ContentPart::Opaque { value: json!(n) }),
        ]
    }

    proptest! {
        #[test]
        fn rendering_never_panics_on_arbitrary_parts(
            parts in prop::collection::vec(part_strategy(), 0..8),
            name in prop::option::of("[a-z-]{0,16}"),
        ) {
            let message = ChatMessage::User { content: parts, name };
            let _ = render_message_content(&message);
            let _ = infer_section_kind(&message);
        }

        #[test]
        fn merging_settings_twice_changes_nothing(
            base in prop::collection::btree_map("[a-z]{1,8}", any::<i64>(), 0..12),
            overlay in prop::collection::btree_map("[a-z]{1,8}", any::<i64>(), 0..12),
        ) {
            let mut base_value = json!(base);
            let overlay_value = json!(overlay);
            merge_settings(&mut base_value, &overlay_value);
            let once = base_value.clone();
            merge_settings(&mut base_value, &overlay_value);
            prop_assert_eq!(base_value, once);
        }
    }
}
