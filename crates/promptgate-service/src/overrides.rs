//! Auto-override capture and replay.
//!
//! When a resumed intercept was marked for capture, every section the user
//! edited or deleted becomes an [`AutoOverrideEntry`] keyed by kind plus
//! the identity label (`override_identity_label`). Later requests whose
//! projection yields a section with the same identity get the entry
//! replayed onto them before they are ever shown. Workspace scope writes
//! through to the store; session scope dies with its session.

use crate::{LiveRequestService, ServiceState, editing, types::AutoOverrideStatus};
use promptgate_core::{
    AutoOverrideEntry, EditableChatRequest, EventKind, OverrideMode, OverrideScope, OverrideState,
    SessionKey, override_identity_label,
};

impl LiveRequestService {
    pub fn set_override_mode(&self, mode: OverrideMode, scope: OverrideScope) {
        let mut config = self.lock_poison_ok(&self.config);
        config.override_mode = mode;
        config.override_scope = scope;
    }

    /// Mark a request so that resuming its next intercept captures the
    /// edits made while paused. Returns false for unknown keys.
    pub fn begin_auto_override_capture(&self, key: SessionKey) -> bool {
        let mut state = self.state_lock();
        if !state.requests.contains_key(&key) {
            return false;
        }
        state.capture_marked.insert(key);
        true
    }

    /// Drop stored overrides for one scope, or both when `scope` is `None`.
    /// Returns how many entries were removed. Previews from the cleared
    /// scope are dropped too.
    pub fn clear_auto_overrides(&self, scope: Option<OverrideScope>) -> usize {
        let removed = {
            let mut state = self.state_lock();
            let mut removed = 0;
            if scope.is_none() || scope == Some(OverrideScope::Session) {
                removed += state
                    .session_overrides
                    .drain()
                    .map(|(_, entries)| entries.len())
                    .sum::<usize>();
            }
            if scope.is_none() || scope == Some(OverrideScope::Workspace) {
                removed += state.workspace_overrides.len();
                state.workspace_overrides.clear();
                if let Some(store) = self.store()
                    && let Err(err) = store.clear_workspace_overrides()
                {
                    self.warn(&format!("workspace override clear failed: {err}"));
                }
            }
            match scope {
                Some(cleared) => state.previews.retain(|e| e.scope != cleared),
                None => state.previews.clear(),
            }
            removed
        };
        self.emit_event(
            SessionKey::unscoped(),
            EventKind::OverrideClearedV1 { scope, removed },
        );
        removed
    }

    /// Shrink (or grow) the bounded preview history.
    pub fn configure_auto_override_preview_limit(&self, limit: usize) {
        let evicted = {
            let mut config = self.lock_poison_ok(&self.config);
            config.auto_override_preview_limit = limit;
            drop(config);
            let mut state = self.state_lock();
            let mut evicted = Vec::new();
            while state.previews.len() > limit {
                if let Some(old) = state.previews.pop_front() {
                    evicted.push(old);
                }
            }
            evicted
        };
        for entry in evicted {
            self.emit_event(
                SessionKey::unscoped(),
                EventKind::OverrideTrimmedV1 {
                    scope: entry.scope,
                    evicted_label: entry.label,
                },
            );
        }
    }

    /// The bounded diff history, oldest first.
    pub fn override_previews(&self) -> Vec<AutoOverrideEntry> {
        let state = self.state_lock();
        state.previews.iter().cloned().collect()
    }

    pub fn auto_override_status(&self) -> AutoOverrideStatus {
        let (mode, scope) = {
            let config = self.lock_poison_ok(&self.config);
            (config.override_mode, config.override_scope)
        };
        let state = self.state_lock();
        AutoOverrideStatus {
            mode,
            scope,
            session_entries: state.session_overrides.values().map(|m| m.len()).sum(),
            workspace_entries: state.workspace_overrides.len(),
            preview_count: state.previews.len(),
        }
    }

    /// Replay stored overrides onto a freshly projected request. Identity
    /// match is (kind, label); session-scope entries win over workspace
    /// ones because they are more specific. Runs before the request is
    /// first shown, so replayed sections already carry their provenance
    /// tag.
    pub(crate) fn apply_overrides_to_request(
        &self,
        state: &mut ServiceState,
        request: &mut EditableChatRequest,
    ) {
        let mode = self.lock_poison_ok(&self.config).override_mode;
        if mode != OverrideMode::AutoOverride {
            return;
        }
        for index in 0..request.sections.len() {
            let identity = (
                request.sections[index].kind,
                override_identity_label(&request.sections[index]),
            );
            let entry = state
                .session_overrides
                .get(&request.key.session_id)
                .and_then(|entries| entries.get(&identity))
                .or_else(|| state.workspace_overrides.get(&identity))
                .cloned();
            let Some(entry) = entry else { continue };
            if entry.deleted {
                if !request.sections[index].deletable {
                    continue;
                }
                request.sections[index].deleted = true;
            } else if let Some(content) = &entry.override_content {
                let original =
                    &request.original_messages[request.sections[index].source_message_index];
                request.sections[index].edited_message =
                    Some(editing::collapse_with_text(original, content));
                Self::update_section_render(request, index);
            } else {
                continue;
            }
            request.sections[index].override_state = Some(OverrideState {
                scope: entry.scope,
                label: entry.label,
            });
        }
    }

    /// Capture every edited or deleted section of a resuming request as
    /// override entries under the configured scope. Returns the events to
    /// emit once the state lock is released.
    pub(crate) fn capture_overrides_locked(
        &self,
        state: &mut ServiceState,
        key: SessionKey,
    ) -> Vec<EventKind> {
        let (mode, scope, preview_limit) = {
            let config = self.lock_poison_ok(&self.config);
            (
                config.override_mode,
                config.override_scope,
                config.auto_override_preview_limit,
            )
        };
        if mode != OverrideMode::AutoOverride {
            return Vec::new();
        }
        let Some(request) = state.requests.get(&key) else {
            return Vec::new();
        };
        let captured: Vec<AutoOverrideEntry> = request
            .sections
            .iter()
            .filter(|s| s.deleted || s.edited_content.is_some())
            .map(|s| AutoOverrideEntry {
                scope,
                kind: s.kind,
                label: override_identity_label(s),
                original_content: s.content.clone(),
                // Deletion wins over any pending edit on the same section.
                override_content: if s.deleted {
                    None
                } else {
                    s.edited_content.clone()
                },
                deleted: s.deleted,
                slot: 0,
            })
            .collect();

        let mut events = Vec::new();
        for mut entry in captured {
            entry.slot = state.previews.back().map_or(0, |e| e.slot + 1);
            state.previews.push_back(entry.clone());
            while state.previews.len() > preview_limit {
                if let Some(old) = state.previews.pop_front() {
                    events.push(EventKind::OverrideTrimmedV1 {
                        scope: old.scope,
                        evicted_label: old.label,
                    });
                }
            }
            let identity = (entry.kind, entry.label.clone());
            match scope {
                OverrideScope::Session => {
                    state
                        .session_overrides
                        .entry(key.session_id)
                        .or_default()
                        .insert(identity, entry);
                }
                OverrideScope::Workspace => {
                    if let Some(store) = self.store()
                        && let Err(err) = store.save_workspace_override(&entry)
                    {
                        self.warn(&format!(
                            "workspace override write failed for {}: {err}",
                            entry.label
                        ));
                    }
                    state.workspace_overrides.insert(identity, entry);
                }
            }
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use promptgate_core::{
        CancellationToken, ChatMessage, InterceptAction, LiveEditorConfig, RenderedPrompt,
    };
    use promptgate_store::Store;
    use promptgate_testkit::{sample_rendered_prompt, scratch_workspace, test_session_key};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn capture_service(scope: OverrideScope) -> Arc<LiveRequestService> {
        let config = LiveEditorConfig {
            interception_enabled: true,
            override_mode: OverrideMode::AutoOverride,
            override_scope: scope,
            ..LiveEditorConfig::default()
        };
        Arc::new(LiveRequestService::new(config))
    }

    /// Suspend an intercept, apply `edit` while it is pending, then resume.
    /// Does not mark the key for capture.
    fn suspend_edit_resume(
        svc: &Arc<LiveRequestService>,
        key: SessionKey,
        edit: impl FnOnce(&LiveRequestService),
    ) {
        let waiter = {
            let svc = Arc::clone(svc);
            thread::spawn(move || {
                svc.wait_for_interception_approval(key, None::<CancellationToken>)
            })
        };
        for _ in 0..400 {
            if svc.pending_intercept(key).is_some() {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        assert!(svc.pending_intercept(key).is_some(), "never became pending");
        edit(svc.as_ref());
        assert!(svc.resolve_pending_intercept(key, InterceptAction::Resume, None));
        waiter.join().expect("join").expect("decision");
    }

    /// Drive the full capture flow: mark, suspend, apply `edit`, resume.
    fn resume_with_capture(
        svc: &Arc<LiveRequestService>,
        key: SessionKey,
        edit: impl FnOnce(&LiveRequestService),
    ) {
        assert!(svc.begin_auto_override_capture(key));
        suspend_edit_resume(svc, key, edit);
    }

    #[test]
    fn captured_edit_replays_onto_the_next_request() {
        let svc = capture_service(OverrideScope::Session);
        let key = test_session_key();
        let request = svc.prepare_request(key, sample_rendered_prompt(), "chat");
        let section_id = request.sections[2].id.clone();
        resume_with_capture(&svc, key, |svc| {
            assert!(svc.update_section_content(key, &section_id, "patched"));
        });

        let next = svc.prepare_request(key, sample_rendered_prompt(), "chat");
        assert_eq!(next.sections[2].edited_content.as_deref(), Some("patched"));
        let tag = next.sections[2].override_state.as_ref().expect("tag");
        assert_eq!(tag.scope, OverrideScope::Session);
        assert!(next.is_dirty);
        assert_eq!(
            promptgate_core::render_message_content(&next.messages[2]),
            "patched"
        );
    }

    #[test]
    fn captured_deletion_replays_as_deletion() {
        let svc = capture_service(OverrideScope::Session);
        let key = test_session_key();
        let request = svc.prepare_request(key, sample_rendered_prompt(), "chat");
        let section_id = request.sections[1].id.clone();
        resume_with_capture(&svc, key, |svc| {
            assert!(svc.delete_section(key, &section_id));
        });

        let next = svc.prepare_request(key, sample_rendered_prompt(), "chat");
        assert!(next.sections[1].deleted);
        assert_eq!(next.messages.len(), 2);
    }

    #[test]
    fn hintless_sections_of_one_kind_do_not_share_an_identity() {
        let svc = capture_service(OverrideScope::Session);
        let key = test_session_key();
        // Two plain user turns: same kind, no name hints.
        let request = svc.prepare_request(key, sample_rendered_prompt(), "chat");
        let u1_id = request.sections[1].id.clone();
        let u2_id = request.sections[2].id.clone();
        resume_with_capture(&svc, key, |svc| {
            assert!(svc.delete_section(key, &u1_id));
            assert!(svc.update_section_content(key, &u2_id, "only-u2"));
        });

        let next = svc.prepare_request(key, sample_rendered_prompt(), "chat");
        // The deletion hits only the turn it was captured from.
        assert!(next.sections[1].deleted);
        assert!(!next.sections[2].deleted);
        // The edit hits only its own turn.
        assert_eq!(next.sections[2].edited_content.as_deref(), Some("only-u2"));
        assert!(next.sections[0].edited_content.is_none());
        assert_eq!(next.messages.len(), 2);
        assert_eq!(
            promptgate_core::render_message_content(&next.messages[1]),
            "only-u2"
        );
    }

    #[test]
    fn identity_is_label_not_index() {
        let svc = capture_service(OverrideScope::Session);
        let key = test_session_key();
        let prompt = RenderedPrompt::new(
            vec![
                ChatMessage::system("sys"),
                ChatMessage::named_user("original context", "context-files"),
            ],
            "test-model",
        );
        let request = svc.prepare_request(key, prompt, "chat");
        let section_id = request.sections[1].id.clone();
        resume_with_capture(&svc, key, |svc| {
            assert!(svc.update_section_content(key, &section_id, "trimmed context"));
        });

        // Same label lands at a different index in the next projection.
        let shifted = RenderedPrompt::new(
            vec![
                ChatMessage::system("sys"),
                ChatMessage::user("interjection"),
                ChatMessage::named_user("original context", "context-files"),
            ],
            "test-model",
        );
        let next = svc.prepare_request(key, shifted, "chat");
        assert_eq!(next.sections[1].edited_content, None);
        assert_eq!(
            next.sections[2].edited_content.as_deref(),
            Some("trimmed context")
        );
    }

    #[test]
    fn session_disposal_clears_an_unconsumed_capture_mark() {
        let svc = capture_service(OverrideScope::Session);
        let key = test_session_key();
        svc.prepare_request(key, sample_rendered_prompt(), "chat");
        assert!(svc.begin_auto_override_capture(key));

        svc.handle_session_disposed(key.session_id);

        // The same key comes back; its old mark must not turn this plain
        // resume into a capture.
        let request = svc.prepare_request(key, sample_rendered_prompt(), "chat");
        let section_id = request.sections[2].id.clone();
        suspend_edit_resume(&svc, key, |svc| {
            assert!(svc.update_section_content(key, &section_id, "not-captured"));
        });

        assert_eq!(svc.auto_override_status().session_entries, 0);
        let next = svc.prepare_request(key, sample_rendered_prompt(), "chat");
        assert!(next.sections.iter().all(|s| s.edited_content.is_none()));
        assert!(!next.is_dirty);
    }

    #[test]
    fn session_overrides_do_not_leak_across_sessions() {
        let svc = capture_service(OverrideScope::Session);
        let key = test_session_key();
        let request = svc.prepare_request(key, sample_rendered_prompt(), "chat");
        let section_id = request.sections[2].id.clone();
        resume_with_capture(&svc, key, |svc| {
            assert!(svc.update_section_content(key, &section_id, "mine"));
        });

        let other = test_session_key();
        let next = svc.prepare_request(other, sample_rendered_prompt(), "chat");
        assert!(next.sections.iter().all(|s| s.edited_content.is_none()));
        assert!(!next.is_dirty);
    }

    #[test]
    fn workspace_overrides_survive_a_service_restart() {
        let workspace = scratch_workspace();
        let key = test_session_key();
        let config = LiveEditorConfig {
            interception_enabled: true,
            override_mode: OverrideMode::AutoOverride,
            override_scope: OverrideScope::Workspace,
            ..LiveEditorConfig::default()
        };
        {
            let svc = Arc::new(
                LiveRequestService::new(config.clone())
                    .with_store(Store::new(workspace.path()).expect("store")),
            );
            let request = svc.prepare_request(key, sample_rendered_prompt(), "chat");
            let section_id = request.sections[2].id.clone();
            resume_with_capture(&svc, key, |svc| {
                assert!(svc.update_section_content(key, &section_id, "durable"));
            });
        }

        let fresh = LiveRequestService::new(config)
            .with_store(Store::new(workspace.path()).expect("store"));
        let next = fresh.prepare_request(test_session_key(), sample_rendered_prompt(), "chat");
        assert_eq!(next.sections[2].edited_content.as_deref(), Some("durable"));
        assert_eq!(
            next.sections[2].override_state.as_ref().expect("tag").scope,
            OverrideScope::Workspace
        );
    }

    #[test]
    fn overrides_are_inert_while_the_mode_is_off() {
        let svc = capture_service(OverrideScope::Session);
        let key = test_session_key();
        let request = svc.prepare_request(key, sample_rendered_prompt(), "chat");
        let section_id = request.sections[2].id.clone();
        resume_with_capture(&svc, key, |svc| {
            assert!(svc.update_section_content(key, &section_id, "patched"));
        });

        svc.set_override_mode(OverrideMode::Off, OverrideScope::Session);
        let next = svc.prepare_request(key, sample_rendered_prompt(), "chat");
        assert!(next.sections.iter().all(|s| s.edited_content.is_none()));

        // Entries were kept, not discarded; re-enabling replays them again.
        svc.set_override_mode(OverrideMode::AutoOverride, OverrideScope::Session);
        let again = svc.prepare_request(key, sample_rendered_prompt(), "chat");
        assert_eq!(again.sections[2].edited_content.as_deref(), Some("patched"));
    }

    #[test]
    fn clearing_removes_entries_and_reports_the_count() {
        let svc = capture_service(OverrideScope::Session);
        let key = test_session_key();
        let request = svc.prepare_request(key, sample_rendered_prompt(), "chat");
        let section_id = request.sections[2].id.clone();
        resume_with_capture(&svc, key, |svc| {
            assert!(svc.update_section_content(key, &section_id, "patched"));
        });
        assert_eq!(svc.auto_override_status().session_entries, 1);

        assert_eq!(svc.clear_auto_overrides(Some(OverrideScope::Session)), 1);
        assert_eq!(svc.auto_override_status().session_entries, 0);
        assert!(svc.override_previews().is_empty());

        let next = svc.prepare_request(key, sample_rendered_prompt(), "chat");
        assert!(!next.is_dirty);
    }

    #[test]
    fn preview_history_is_bounded_and_trims_oldest_first() {
        let svc = capture_service(OverrideScope::Session);
        svc.configure_auto_override_preview_limit(2);
        let key = test_session_key();
        for (round, content) in ["one", "two", "three"].iter().enumerate() {
            let prompt = RenderedPrompt::new(
                vec![
                    ChatMessage::system("sys"),
                    ChatMessage::named_user("body", format!("turn-{round}")),
                ],
                "test-model",
            );
            let request = svc.prepare_request(key, prompt, "chat");
            let section_id = request.sections[1].id.clone();
            resume_with_capture(&svc, key, |svc| {
                assert!(svc.update_section_content(key, &section_id, content));
            });
        }

        let previews = svc.override_previews();
        assert_eq!(previews.len(), 2);
        assert_eq!(previews[0].label, "turn-1");
        assert_eq!(previews[1].label, "turn-2");
        assert!(previews[0].slot < previews[1].slot);
        assert_eq!(svc.auto_override_status().preview_count, 2);
    }
}
