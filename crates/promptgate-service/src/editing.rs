//! Section-level and leaf-level edits, delete/restore, undo/redo, and send
//! validation.
//!
//! Two edit granularities stay mutually consistent by sharing one effective
//! message per section: section edits replace it wholesale (collapse rule),
//! leaf edits mutate a single scalar inside it, and the derived message
//! list is always recomputed from non-deleted sections in original order.

use crate::{LeafEdit, LiveRequestService, ServiceState};
use anyhow::{Result, anyhow, bail};
use promptgate_core::{
    ChatMessage, ContentPart, EditableChatRequest, SessionKey, ValidationError, build_sections,
};

/// Rebuild `messages` from the section projection and refresh `is_dirty`.
/// Runs after every mutation; everything else leans on this staying true.
pub(crate) fn recompute(request: &mut EditableChatRequest) {
    request.messages = request
        .sections
        .iter()
        .filter(|s| !s.deleted)
        .map(|s| {
            s.edited_message
                .clone()
                .unwrap_or_else(|| request.original_messages[s.source_message_index].clone())
        })
        .collect();
    request.is_dirty = request.messages != request.original_messages;
}

/// Build the section-edit replacement for a message: one collapsed text
/// part carrying the new content, followed by the original non-text parts
/// in original order. Multiple original text parts deliberately collapse to
/// one — leaf edits are the precision tool that preserves them.
pub(crate) fn collapse_with_text(original: &ChatMessage, new_content: &str) -> ChatMessage {
    let mut message = original.clone();
    let mut parts = vec![ContentPart::text(new_content)];
    parts.extend(original.content().iter().filter(|p| !p.is_text()).cloned());
    message.set_content(parts);
    message
}

#[derive(Debug, Clone, PartialEq)]
enum PathSeg {
    Field(String),
    Index(usize),
}

/// Parse a dotted/indexed leaf path such as `messages[1].content[0].text`
/// into the addressed message index and the segments below it.
fn parse_leaf_path(path: &str) -> Result<(usize, Vec<PathSeg>)> {
    let mut segments = Vec::new();
    for raw in path.split('.') {
        if raw.is_empty() {
            bail!("empty segment in leaf path {path:?}");
        }
        let mut rest = raw;
        let field_end = rest.find('[').unwrap_or(rest.len());
        let field = &rest[..field_end];
        if !field.is_empty() {
            segments.push(PathSeg::Field(field.to_string()));
        }
        rest = &rest[field_end..];
        while let Some(stripped) = rest.strip_prefix('[') {
            let close = stripped
                .find(']')
                .ok_or_else(|| anyhow!("unclosed index in leaf path {path:?}"))?;
            let index: usize = stripped[..close]
                .parse()
                .map_err(|_| anyhow!("non-numeric index in leaf path {path:?}"))?;
            segments.push(PathSeg::Index(index));
            rest = &stripped[close + 1..];
        }
        if !rest.is_empty() {
            bail!("malformed segment in leaf path {path:?}");
        }
    }

    let mut iter = segments.into_iter();
    match (iter.next(), iter.next()) {
        (Some(PathSeg::Field(root)), Some(PathSeg::Index(message_index))) if root == "messages" => {
            Ok((message_index, iter.collect()))
        }
        _ => bail!("leaf path must start with messages[<index>]: {path:?}"),
    }
}

fn is_scalar(value: &serde_json::Value) -> bool {
    matches!(
        value,
        serde_json::Value::String(_) | serde_json::Value::Number(_) | serde_json::Value::Bool(_)
    )
}

/// Walk `segs` into the message value and replace the addressed scalar,
/// returning the previous value.
fn set_scalar_at(
    message_value: &mut serde_json::Value,
    segs: &[PathSeg],
    new_value: &serde_json::Value,
) -> Result<serde_json::Value> {
    if !is_scalar(new_value) {
        bail!("leaf edits only accept scalar values");
    }
    let mut slot = message_value;
    for seg in segs {
        slot = match seg {
            PathSeg::Field(name) => slot
                .get_mut(name.as_str())
                .ok_or_else(|| anyhow!("leaf path field {name:?} does not exist"))?,
            PathSeg::Index(index) => slot
                .get_mut(*index)
                .ok_or_else(|| anyhow!("leaf path index {index} is out of bounds"))?,
        };
    }
    if !is_scalar(slot) {
        bail!("leaf path does not address a scalar field");
    }
    let previous = slot.clone();
    *slot = new_value.clone();
    Ok(previous)
}

impl LiveRequestService {
    /// Replace the entire rendered content of a section with one text
    /// block. Clears the deleted flag. Returns false for unknown keys or
    /// section ids.
    pub fn update_section_content(
        &self,
        key: SessionKey,
        section_id: &str,
        new_content: &str,
    ) -> bool {
        let snapshot = {
            let mut state = self.state_lock();
            let Some(request) = state.requests.get_mut(&key) else {
                return false;
            };
            let Some(index) = request.sections.iter().position(|s| s.id == section_id) else {
                return false;
            };
            if !request.sections[index].editable {
                return false;
            }
            let original = &request.original_messages[request.sections[index].source_message_index];
            let edited = collapse_with_text(original, new_content);
            request.sections[index].edited_message = Some(edited);
            request.sections[index].deleted = false;
            Self::update_section_render(request, index);
            recompute(request);
            request.clone()
        };
        self.notify_request_updated(&snapshot);
        true
    }

    /// Mutate a single scalar field addressed by a leaf path into the
    /// current message list (e.g. `messages[1].content[0].text`). Sibling
    /// parts and tool-call fields are untouched. Pushes an undo entry
    /// pinned to the owning section's id and clears the redo stack.
    pub fn update_leaf_by_path(
        &self,
        key: SessionKey,
        path: &str,
        value: serde_json::Value,
    ) -> Result<bool> {
        let (message_index, segs) = parse_leaf_path(path)?;
        let snapshot = {
            let mut state = self.state_lock();
            let Some(request) = state.requests.get_mut(&key) else {
                return Ok(false);
            };
            // The path addresses the current message list: the owning
            // section is the nth non-deleted one, captured by id so the
            // stack entry survives later deletions.
            let Some(section_index) = request
                .sections
                .iter()
                .enumerate()
                .filter(|(_, s)| !s.deleted)
                .map(|(i, _)| i)
                .nth(message_index)
            else {
                return Ok(false);
            };
            let section_id = request.sections[section_index].id.clone();
            let previous = Self::apply_leaf_in_section(request, section_index, &segs, &value)?;
            let snapshot = request.clone();
            state.undo.entry(key).or_default().push(LeafEdit {
                section_id,
                path: path.to_string(),
                previous,
                next: value,
            });
            state.redo.remove(&key);
            snapshot
        };
        self.notify_request_updated(&snapshot);
        Ok(true)
    }

    /// Revert the most recent leaf edit for a key. One call, one scalar.
    pub fn undo_last_edit(&self, key: SessionKey) -> bool {
        let Some(edit) = self.state_lock().undo.entry(key).or_default().pop() else {
            return false;
        };
        match self.replay_leaf_edit(key, &edit, &edit.previous) {
            Ok(true) => {
                self.state_lock().redo.entry(key).or_default().push(edit);
                true
            }
            // Structure changed underneath the stack entry; put it back.
            Ok(false) | Err(_) => {
                self.state_lock().undo.entry(key).or_default().push(edit);
                false
            }
        }
    }

    /// Reapply the most recently undone leaf edit for a key.
    pub fn redo_last_edit(&self, key: SessionKey) -> bool {
        let Some(edit) = self.state_lock().redo.entry(key).or_default().pop() else {
            return false;
        };
        match self.replay_leaf_edit(key, &edit, &edit.next) {
            Ok(true) => {
                self.state_lock().undo.entry(key).or_default().push(edit);
                true
            }
            Ok(false) | Err(_) => {
                self.state_lock().redo.entry(key).or_default().push(edit);
                false
            }
        }
    }

    /// Replay a recorded leaf edit with the given scalar. The section is
    /// resolved by the id captured at edit time, never by position, so
    /// deletions between the edit and its undo cannot redirect it.
    fn replay_leaf_edit(
        &self,
        key: SessionKey,
        edit: &LeafEdit,
        value: &serde_json::Value,
    ) -> Result<bool> {
        let (_, segs) = parse_leaf_path(&edit.path)?;
        let snapshot = {
            let mut state = self.state_lock();
            let Some(request) = state.requests.get_mut(&key) else {
                return Ok(false);
            };
            let Some(section_index) = request
                .sections
                .iter()
                .position(|s| s.id == edit.section_id)
            else {
                return Ok(false);
            };
            Self::apply_leaf_in_section(request, section_index, &segs, value)?;
            request.clone()
        };
        self.notify_request_updated(&snapshot);
        Ok(true)
    }

    /// Leaf-apply core: mutate one scalar inside the section's effective
    /// message and refresh the projection. Returns the replaced scalar and
    /// leaves the request untouched on error.
    fn apply_leaf_in_section(
        request: &mut EditableChatRequest,
        section_index: usize,
        segs: &[PathSeg],
        value: &serde_json::Value,
    ) -> Result<serde_json::Value> {
        let effective = request.sections[section_index]
            .edited_message
            .clone()
            .unwrap_or_else(|| {
                request.original_messages[request.sections[section_index].source_message_index]
                    .clone()
            });
        let mut message_value = serde_json::to_value(&effective)?;
        let previous = set_scalar_at(&mut message_value, segs, value)?;
        let edited: ChatMessage = serde_json::from_value(message_value)?;
        request.sections[section_index].edited_message = Some(edited);
        Self::update_section_render(request, section_index);
        recompute(request);
        Ok(previous)
    }

    /// Mark a section deleted. No-op (false) when the section is not
    /// deletable or already deleted.
    pub fn delete_section(&self, key: SessionKey, section_id: &str) -> bool {
        let snapshot = {
            let mut state = self.state_lock();
            let Some(request) = state.requests.get_mut(&key) else {
                return false;
            };
            let Some(index) = request.sections.iter().position(|s| s.id == section_id) else {
                return false;
            };
            if !request.sections[index].deletable || request.sections[index].deleted {
                return false;
            }
            request.sections[index].deleted = true;
            recompute(request);
            request.clone()
        };
        self.notify_request_updated(&snapshot);
        true
    }

    /// Clear a section's deleted flag. No-op (false) when not deleted.
    pub fn restore_section(&self, key: SessionKey, section_id: &str) -> bool {
        let snapshot = {
            let mut state = self.state_lock();
            let Some(request) = state.requests.get_mut(&key) else {
                return false;
            };
            let Some(index) = request.sections.iter().position(|s| s.id == section_id) else {
                return false;
            };
            if !request.sections[index].deleted {
                return false;
            }
            request.sections[index].deleted = false;
            recompute(request);
            request.clone()
        };
        self.notify_request_updated(&snapshot);
        true
    }

    /// Discard every edit, deletion, and the undo/redo stacks; back to a
    /// fresh projection of the original messages.
    pub fn reset_request(&self, key: SessionKey) -> bool {
        let snapshot = {
            let mut state = self.state_lock();
            state.undo.remove(&key);
            state.redo.remove(&key);
            let Some(request) = state.requests.get_mut(&key) else {
                return false;
            };
            request.sections = build_sections(&request.original_messages);
            request.messages = request.original_messages.clone();
            request.is_dirty = false;
            request.clone()
        };
        self.notify_request_updated(&snapshot);
        true
    }

    /// Recompute and return the live message list for a key, or `fallback`
    /// when no request is tracked. An empty result is a validation error
    /// the caller must surface — silently sending nothing is never allowed.
    pub fn messages_for_send(
        &self,
        key: SessionKey,
        fallback: Option<&[ChatMessage]>,
    ) -> Result<Vec<ChatMessage>, ValidationError> {
        let mut state = self.state_lock();
        Self::messages_for_send_locked(&mut state, key, fallback)
    }

    pub(crate) fn messages_for_send_locked(
        state: &mut ServiceState,
        key: SessionKey,
        fallback: Option<&[ChatMessage]>,
    ) -> Result<Vec<ChatMessage>, ValidationError> {
        let messages = match state.requests.get_mut(&key) {
            Some(request) => {
                recompute(request);
                request.messages.clone()
            }
            None => fallback.map(<[ChatMessage]>::to_vec).unwrap_or_default(),
        };
        if messages.is_empty() {
            return Err(ValidationError::Empty);
        }
        Ok(messages)
    }
}
