//! Versioned replay snapshots.
//!
//! A replay is a display-only projection of the current edited payload,
//! immutable once built. Each key carries one current snapshot plus a
//! single-slot restore buffer holding the snapshot the latest build
//! replaced; versions are monotonic per key across builds, restores, and
//! fork transitions.

use crate::{LiveRequestService, ReplaySlot, types::REPLAY_SECTION_DISPLAY_CAP};
use promptgate_core::{
    EventKind, LiveRequestReplaySnapshot, ReplayProjection, ReplayStateKind, SessionKey,
    payload_hash,
};
use uuid::Uuid;

impl LiveRequestService {
    /// Build a fresh snapshot of the request's current payload. Returns
    /// `None` when replays are disabled or the key is unknown. The payload
    /// captured here is exactly what `messages_for_send` would return at
    /// this moment, including an empty one — a replay of an emptied request
    /// is still a faithful record.
    pub fn build_replay_for_request(&self, key: SessionKey) -> Option<LiveRequestReplaySnapshot> {
        {
            let config = self.lock_poison_ok(&self.config);
            if !config.enabled || !config.replay_enabled {
                return None;
            }
        }
        let (snapshot, event) = {
            let mut state = self.state_lock();
            let request = state.requests.get_mut(&key)?;
            crate::editing::recompute(request);
            let payload = request.messages.clone();
            let request_id = request.metadata.request_id;
            let total = request.sections.len();
            let edited = request
                .sections
                .iter()
                .filter(|s| s.edited_content.is_some())
                .count();
            let deleted = request.sections.iter().filter(|s| s.deleted).count();

            let slot = state.replays.entry(key).or_insert_with(|| ReplaySlot {
                current: None,
                previous: None,
                next_version: 1,
            });
            let version = slot.next_version;
            slot.next_version += 1;
            let hash = payload_hash(&payload);
            let snapshot = LiveRequestReplaySnapshot {
                key,
                request_id,
                state: ReplayStateKind::Ready,
                version,
                payload,
                payload_hash: hash.clone(),
                projection: ReplayProjection {
                    total,
                    edited,
                    deleted,
                    overflow: total.saturating_sub(REPLAY_SECTION_DISPLAY_CAP),
                },
                stale_reason: None,
                fork_session_id: None,
                restore_of_version: None,
            };
            slot.previous = slot.current.replace(snapshot.clone());
            (
                snapshot,
                EventKind::ReplayBuiltV1 {
                    request_id,
                    version,
                    payload_hash: hash,
                },
            )
        };
        self.emit_event(key, event);
        self.notify_replay_changed(&snapshot);
        Some(snapshot)
    }

    /// Bring back the snapshot the latest build replaced. The buffer holds
    /// one snapshot and is consumed by this call, so a second consecutive
    /// restore returns `None`. The restored copy gets a fresh version and
    /// records which version it restores.
    pub fn restore_previous_replay(&self, key: SessionKey) -> Option<LiveRequestReplaySnapshot> {
        let (snapshot, event) = {
            let mut state = self.state_lock();
            let slot = state.replays.get_mut(&key)?;
            let previous = slot.previous.take()?;
            let version = slot.next_version;
            slot.next_version += 1;
            let snapshot = LiveRequestReplaySnapshot {
                version,
                state: ReplayStateKind::Ready,
                stale_reason: None,
                restore_of_version: Some(previous.version),
                ..previous
            };
            slot.current = Some(snapshot.clone());
            (
                snapshot.clone(),
                EventKind::ReplayBuiltV1 {
                    request_id: snapshot.request_id,
                    version,
                    payload_hash: snapshot.payload_hash.clone(),
                },
            )
        };
        self.emit_event(key, event);
        self.notify_replay_changed(&snapshot);
        Some(snapshot)
    }

    pub fn get_replay(&self, key: SessionKey) -> Option<LiveRequestReplaySnapshot> {
        let state = self.state_lock();
        state.replays.get(&key).and_then(|slot| slot.current.clone())
    }

    /// Mark the current snapshot stale. When `request_id` is given, the
    /// snapshot is only staled if it was built for that request.
    pub fn mark_replay_stale(&self, key: SessionKey, request_id: Option<Uuid>, reason: &str) {
        self.mark_replay_stale_internal(key, request_id, reason);
    }

    pub(crate) fn mark_replay_stale_internal(
        &self,
        key: SessionKey,
        request_id: Option<Uuid>,
        reason: &str,
    ) {
        let snapshot = {
            let mut state = self.state_lock();
            let Some(slot) = state.replays.get_mut(&key) else {
                return;
            };
            let Some(current) = slot.current.as_mut() else {
                return;
            };
            if request_id.is_some_and(|id| id != current.request_id) {
                return;
            }
            if current.state == ReplayStateKind::Stale {
                return;
            }
            current.state = ReplayStateKind::Stale;
            current.stale_reason = Some(reason.to_string());
            // A stale timeline has nothing meaningful to restore to.
            slot.previous = None;
            current.clone()
        };
        self.notify_replay_changed(&snapshot);
    }

    /// Hand the replay off into a live continuable session. Bumps the
    /// version so observers see the transition as a distinct state.
    pub fn mark_replay_fork_active(&self, key: SessionKey, fork_session_id: Uuid) -> bool {
        let snapshot = {
            let mut state = self.state_lock();
            let Some(slot) = state.replays.get_mut(&key) else {
                return false;
            };
            let Some(current) = slot.current.as_mut() else {
                return false;
            };
            current.state = ReplayStateKind::ForkActive;
            current.fork_session_id = Some(fork_session_id);
            current.version = slot.next_version;
            slot.next_version += 1;
            current.clone()
        };
        self.notify_replay_changed(&snapshot);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use promptgate_core::{ChatMessage, LiveEditorConfig, RenderedPrompt};
    use promptgate_testkit::{sample_rendered_prompt, test_session_key};

    fn service() -> LiveRequestService {
        LiveRequestService::new(LiveEditorConfig::default())
    }

    #[test]
    fn build_projects_counts_and_versions_monotonically() {
        let svc = service();
        let key = test_session_key();
        let request = svc.prepare_request(key, sample_rendered_prompt(), "chat");
        let first = svc.build_replay_for_request(key).expect("snapshot");
        assert_eq!(first.version, 1);
        assert_eq!(first.state, ReplayStateKind::Ready);
        assert_eq!(first.projection.total, 3);
        assert_eq!(first.projection.edited, 0);
        assert_eq!(first.projection.deleted, 0);
        assert_eq!(first.payload, request.messages);

        let section_id = request.sections[1].id.clone();
        svc.delete_section(key, &section_id);
        let second = svc.build_replay_for_request(key).expect("snapshot");
        assert_eq!(second.version, 2);
        assert_eq!(second.projection.deleted, 1);
        assert_eq!(second.payload.len(), 2);
        assert_ne!(second.payload_hash, first.payload_hash);
        assert_eq!(svc.get_replay(key).expect("current").version, 2);
    }

    #[test]
    fn replay_payload_matches_messages_for_send() {
        let svc = service();
        let key = test_session_key();
        let request = svc.prepare_request(key, sample_rendered_prompt(), "chat");
        let section_id = request.sections[2].id.clone();
        svc.update_section_content(key, &section_id, "edited");

        let snapshot = svc.build_replay_for_request(key).expect("snapshot");
        let sent = svc.messages_for_send(key, None).expect("payload");
        assert_eq!(snapshot.payload, sent);
        assert_eq!(snapshot.projection.edited, 1);
    }

    #[test]
    fn restore_consumes_the_single_restore_slot() {
        let svc = service();
        let key = test_session_key();
        let request = svc.prepare_request(key, sample_rendered_prompt(), "chat");
        let first = svc.build_replay_for_request(key).expect("snapshot");

        let section_id = request.sections[2].id.clone();
        svc.update_section_content(key, &section_id, "edited");
        svc.build_replay_for_request(key).expect("snapshot");

        let restored = svc.restore_previous_replay(key).expect("restored");
        assert_eq!(restored.version, 3);
        assert_eq!(restored.restore_of_version, Some(1));
        assert_eq!(restored.payload, first.payload);
        assert_eq!(svc.get_replay(key).expect("current").version, 3);

        assert!(svc.restore_previous_replay(key).is_none());
    }

    #[test]
    fn disabled_replays_build_nothing() {
        let config = LiveEditorConfig {
            replay_enabled: false,
            ..LiveEditorConfig::default()
        };
        let svc = LiveRequestService::new(config);
        let key = test_session_key();
        svc.prepare_request(key, sample_rendered_prompt(), "chat");
        assert!(svc.build_replay_for_request(key).is_none());
    }

    #[test]
    fn staling_keeps_the_snapshot_but_drops_the_restore_buffer() {
        let svc = service();
        let key = test_session_key();
        svc.prepare_request(key, sample_rendered_prompt(), "chat");
        svc.build_replay_for_request(key);
        svc.build_replay_for_request(key);

        svc.mark_replay_stale(key, None, "model-changed");

        let current = svc.get_replay(key).expect("current");
        assert_eq!(current.state, ReplayStateKind::Stale);
        assert_eq!(current.stale_reason.as_deref(), Some("model-changed"));
        assert!(svc.restore_previous_replay(key).is_none());
    }

    #[test]
    fn stale_with_mismatched_request_id_is_ignored() {
        let svc = service();
        let key = test_session_key();
        svc.prepare_request(key, sample_rendered_prompt(), "chat");
        svc.build_replay_for_request(key);

        svc.mark_replay_stale(key, Some(uuid::Uuid::now_v7()), "not-mine");
        assert_eq!(
            svc.get_replay(key).expect("current").state,
            ReplayStateKind::Ready
        );
    }

    #[test]
    fn preparing_a_new_request_stales_the_old_replay() {
        let svc = service();
        let key = test_session_key();
        svc.prepare_request(key, sample_rendered_prompt(), "chat");
        svc.build_replay_for_request(key);

        svc.prepare_request(key, sample_rendered_prompt(), "chat");

        let current = svc.get_replay(key).expect("current");
        assert_eq!(current.state, ReplayStateKind::Stale);
        assert_eq!(current.stale_reason.as_deref(), Some("new-request"));
    }

    #[test]
    fn session_disposal_evicts_the_replay_slot() {
        let svc = service();
        let key = test_session_key();
        svc.prepare_request(key, sample_rendered_prompt(), "chat");
        svc.build_replay_for_request(key).expect("snapshot");
        svc.build_replay_for_request(key).expect("snapshot");

        svc.handle_session_disposed(key.session_id);

        assert!(svc.get_replay(key).is_none());
        assert!(svc.restore_previous_replay(key).is_none());
        // A later request for the same key starts a fresh version line.
        svc.prepare_request(key, sample_rendered_prompt(), "chat");
        let rebuilt = svc.build_replay_for_request(key).expect("snapshot");
        assert_eq!(rebuilt.version, 1);
    }

    #[test]
    fn fork_transition_bumps_the_version() {
        let svc = service();
        let key = test_session_key();
        svc.prepare_request(key, sample_rendered_prompt(), "chat");
        svc.build_replay_for_request(key);

        let fork_id = uuid::Uuid::now_v7();
        assert!(svc.mark_replay_fork_active(key, fork_id));

        let current = svc.get_replay(key).expect("current");
        assert_eq!(current.state, ReplayStateKind::ForkActive);
        assert_eq!(current.fork_session_id, Some(fork_id));
        assert_eq!(current.version, 2);
    }

    #[test]
    fn timelines_past_the_display_cap_report_overflow() {
        let svc = service();
        let key = test_session_key();
        let mut messages = vec![ChatMessage::system("sys")];
        for i in 0..34 {
            messages.push(ChatMessage::user(format!("turn {i}")));
        }
        svc.prepare_request(key, RenderedPrompt::new(messages, "test-model"), "long");

        let snapshot = svc.build_replay_for_request(key).expect("snapshot");
        assert_eq!(snapshot.projection.total, 35);
        assert_eq!(snapshot.projection.overflow, 5);
        // Payload is never truncated by the display cap.
        assert_eq!(snapshot.payload.len(), 35);
    }

    #[test]
    fn build_events_carry_the_payload_hash() {
        use std::sync::{Arc, Mutex};
        let svc = service();
        let key = test_session_key();
        svc.prepare_request(key, sample_rendered_prompt(), "chat");
        let events = Arc::new(Mutex::new(Vec::new()));
        let events_in_cb = Arc::clone(&events);
        svc.on_event(Arc::new(move |envelope| {
            events_in_cb.lock().expect("events lock").push(envelope);
        }));

        let snapshot = svc.build_replay_for_request(key).expect("snapshot");

        let recorded = events.lock().expect("events lock");
        let built: Vec<_> = recorded
            .iter()
            .filter_map(|e| match &e.kind {
                EventKind::ReplayBuiltV1 {
                    version,
                    payload_hash,
                    ..
                } => Some((*version, payload_hash.clone())),
                _ => None,
            })
            .collect();
        assert_eq!(built, vec![(1, snapshot.payload_hash.clone())]);
    }
}
