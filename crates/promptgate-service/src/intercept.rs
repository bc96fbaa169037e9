//! Pending-intercept lifecycle: idle → pending → resumed/cancelled → idle.
//!
//! At most one pending intercept exists per session key; creating a new one
//! synchronously supersedes the old one, so two waiters for one key never
//! race. The suspended caller parks on a single-slot channel polled against
//! its cancellation token and the configured timeout. Every resolution, on
//! every exit path, emits one diagnostic record.

use crate::{LiveRequestService, PendingState, types::INTERCEPT_POLL_INTERVAL_MS};
use chrono::Utc;
use promptgate_core::{
    CancelReason, CancellationToken, EventKind, InterceptAction, InterceptDecision,
    PendingInterceptSummary, SessionKey,
};
use std::sync::atomic::Ordering;
use std::sync::mpsc;
use std::time::{Duration, Instant};

impl LiveRequestService {
    /// Suspend the send pipeline until a human resumes or cancels the
    /// request. Returns `None` immediately when interception is off or the
    /// request is a sub-agent request — interception is a human-in-the-loop
    /// feature and sub-agents have no human attached.
    pub fn wait_for_interception_approval(
        &self,
        key: SessionKey,
        token: Option<CancellationToken>,
    ) -> Option<InterceptDecision> {
        let (enabled, interception_enabled, timeout_secs) = {
            let config = self.lock_poison_ok(&self.config);
            (
                config.enabled,
                config.interception_enabled,
                config.intercept_timeout_secs,
            )
        };
        if !enabled || !interception_enabled {
            return None;
        }

        let (rx, nonce, superseded) = {
            let mut state = self.state_lock();
            let request = state.requests.get(&key)?;
            if request.metadata.subagent {
                return None;
            }
            let request_id = request.metadata.request_id;
            let debug_name = request.debug_name.clone();
            let fallback_messages = request.messages.clone();
            let capture = state.capture_marked.remove(&key);
            let superseded = state.pending.remove(&key);
            let nonce = self.nonce.fetch_add(1, Ordering::SeqCst) + 1;
            let (tx, rx) = mpsc::channel();
            state.pending.insert(
                key,
                PendingState {
                    summary: PendingInterceptSummary {
                        key,
                        request_id,
                        debug_name,
                        requested_at: Utc::now(),
                        nonce,
                    },
                    resolver: Some(tx),
                    fallback_messages,
                    capture,
                },
            );
            (rx, nonce, superseded)
        };
        if let Some(old) = superseded {
            self.finish_resolution(
                key,
                old,
                InterceptDecision::Cancel(CancelReason::Superseded),
            );
        }
        self.notify_intercept_changed();

        let deadline = timeout_secs.map(|secs| Instant::now() + Duration::from_secs(secs));
        loop {
            match rx.recv_timeout(Duration::from_millis(INTERCEPT_POLL_INTERVAL_MS)) {
                Ok(decision) => return Some(decision),
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    if token.as_ref().is_some_and(CancellationToken::is_cancelled) {
                        self.cancel_if_nonce(key, nonce, CancelReason::Token);
                    } else if deadline.is_some_and(|d| Instant::now() >= d) {
                        self.cancel_if_nonce(key, nonce, CancelReason::Timeout);
                    }
                }
                // The resolver can only disappear without sending if state
                // was torn down mid-wait; treat it as a cancel.
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    return Some(InterceptDecision::Cancel(CancelReason::Unspecified));
                }
            }
        }
    }

    /// Resolve the pending intercept for a key. A resume is re-validated
    /// first: if the payload no longer validates (e.g. every section was
    /// deleted while paused), the resolution silently downgrades to a
    /// cancel with reason `invalid` — resuming with zero messages is never
    /// allowed. Returns false when nothing is pending.
    pub fn resolve_pending_intercept(
        &self,
        key: SessionKey,
        action: InterceptAction,
        reason: Option<CancelReason>,
    ) -> bool {
        let (pending, decision, capture_events) = {
            let mut state = self.state_lock();
            let Some(pending) = state.pending.remove(&key) else {
                return false;
            };
            let decision = match action {
                InterceptAction::Resume => {
                    match Self::messages_for_send_locked(
                        &mut state,
                        key,
                        Some(&pending.fallback_messages),
                    ) {
                        Ok(messages) => InterceptDecision::Resume(messages),
                        Err(_) => InterceptDecision::Cancel(CancelReason::Invalid),
                    }
                }
                InterceptAction::Cancel => {
                    InterceptDecision::Cancel(reason.unwrap_or(CancelReason::Unspecified))
                }
            };
            let capture_events =
                if pending.capture && matches!(decision, InterceptDecision::Resume(_)) {
                    self.capture_overrides_locked(&mut state, key)
                } else {
                    Vec::new()
                };
            (pending, decision, capture_events)
        };
        for kind in capture_events {
            self.emit_event(key, kind);
        }
        self.finish_resolution(key, pending, decision);
        true
    }

    /// Summaries of every outstanding intercept, oldest first.
    pub fn pending_intercepts(&self) -> Vec<PendingInterceptSummary> {
        let state = self.state_lock();
        let mut summaries: Vec<_> = state.pending.values().map(|p| p.summary.clone()).collect();
        summaries.sort_by_key(|s| s.nonce);
        summaries
    }

    pub fn pending_intercept(&self, key: SessionKey) -> Option<PendingInterceptSummary> {
        let state = self.state_lock();
        state.pending.get(&key).map(|p| p.summary.clone())
    }

    /// Cancel every pending intercept across all keys (feature toggled off).
    pub fn cancel_all_intercepts(&self, reason: CancelReason) {
        let drained: Vec<(SessionKey, PendingState)> = {
            let mut state = self.state_lock();
            state.pending.drain().collect()
        };
        for (key, pending) in drained {
            self.finish_resolution(key, pending, InterceptDecision::Cancel(reason.clone()));
        }
    }

    pub(crate) fn cancel_intercept_for_context_change(&self, key: SessionKey, cause: &str) {
        let pending = {
            let mut state = self.state_lock();
            state.pending.remove(&key)
        };
        if let Some(pending) = pending {
            self.finish_resolution(
                key,
                pending,
                InterceptDecision::Cancel(CancelReason::ContextChanged {
                    cause: cause.to_string(),
                }),
            );
        }
    }

    pub(crate) fn cancel_intercept_session_disposed(&self, key: SessionKey) {
        let pending = {
            let mut state = self.state_lock();
            state.pending.remove(&key)
        };
        if let Some(pending) = pending {
            self.finish_resolution(
                key,
                pending,
                InterceptDecision::Cancel(CancelReason::SessionDisposed),
            );
        }
    }

    /// Cancel only if the pending intercept is still the one the waiter
    /// created (a superseding intercept must not be cancelled by the old
    /// waiter's token or timeout).
    fn cancel_if_nonce(&self, key: SessionKey, nonce: u64, reason: CancelReason) {
        let pending = {
            let mut state = self.state_lock();
            if state.pending.get(&key).map(|p| p.summary.nonce) != Some(nonce) {
                return;
            }
            state.pending.remove(&key)
        };
        if let Some(pending) = pending {
            self.finish_resolution(key, pending, InterceptDecision::Cancel(reason));
        }
    }

    /// Deliver a decision to the suspended waiter and emit the diagnostic
    /// record. Called exactly once per pending intercept.
    fn finish_resolution(
        &self,
        key: SessionKey,
        mut pending: PendingState,
        decision: InterceptDecision,
    ) {
        if let Some(tx) = pending.resolver.take() {
            // The waiter may already have given up; the record below still
            // documents the outcome.
            let _ = tx.send(decision.clone());
        }
        let (action, reason) = match decision {
            InterceptDecision::Resume(_) => (InterceptAction::Resume, None),
            InterceptDecision::Cancel(reason) => (InterceptAction::Cancel, Some(reason)),
        };
        self.emit_event(
            key,
            EventKind::InterceptResolvedV1 {
                request_id: pending.summary.request_id,
                debug_name: pending.summary.debug_name,
                action,
                reason,
            },
        );
        self.notify_intercept_changed();
    }
}
