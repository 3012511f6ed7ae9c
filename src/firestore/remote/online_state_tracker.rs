use std::time::Duration;

use crate::firestore::core::{TimerId, TimerRegistry};
use crate::firestore::error::FirestoreError;

/// Whether the client believes it can reach the backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OnlineState {
    /// Not yet known; queries wait briefly before raising from-cache snapshots.
    Unknown,
    Online,
    /// Views are marked from-cache and stop waiting for the backend.
    Offline,
}

/// Watch stream failures tolerated before declaring the client offline.
const MAX_WATCH_STREAM_FAILURES: u32 = 1;

/// Derives the online state from watch stream health.
///
/// The client goes offline after a watch stream failure, or when the stream has not
/// produced a message within the online-state timeout. Any watch message puts it online.
#[derive(Debug)]
pub struct OnlineStateTracker {
    state: OnlineState,
    watch_stream_failures: u32,
    timeout: Duration,
    should_warn_client_is_offline: bool,
}

impl OnlineStateTracker {
    pub fn new(timeout: Duration) -> Self {
        Self {
            state: OnlineState::Unknown,
            watch_stream_failures: 0,
            timeout,
            should_warn_client_is_offline: true,
        }
    }

    pub fn state(&self) -> OnlineState {
        self.state
    }

    /// Returns the new state if it changed.
    pub fn handle_watch_stream_start(&mut self, timers: &mut TimerRegistry) -> Option<OnlineState> {
        if self.watch_stream_failures != 0 {
            return None;
        }
        let changed = self.set_state(OnlineState::Unknown);
        timers.schedule(TimerId::OnlineStateTimeout, self.timeout);
        changed
    }

    pub fn handle_watch_stream_failure(
        &mut self,
        error: Option<&FirestoreError>,
        timers: &mut TimerRegistry,
    ) -> Option<OnlineState> {
        if self.state == OnlineState::Online {
            // One failure after being online only makes us unsure.
            return self.set_state(OnlineState::Unknown);
        }
        self.watch_stream_failures += 1;
        if self.watch_stream_failures >= MAX_WATCH_STREAM_FAILURES {
            timers.cancel(TimerId::OnlineStateTimeout);
            let reason = match error {
                Some(err) => format!("connection failed {} times, most recent error: {err}", self.watch_stream_failures),
                None => format!("connection failed {} times", self.watch_stream_failures),
            };
            self.log_offline_warning(&reason);
            return self.set_state(OnlineState::Offline);
        }
        None
    }

    pub fn handle_online_state_timeout(&mut self) -> Option<OnlineState> {
        if self.state != OnlineState::Unknown {
            return None;
        }
        let reason = format!(
            "backend didn't respond within {} seconds",
            self.timeout.as_secs()
        );
        self.log_offline_warning(&reason);
        self.set_state(OnlineState::Offline)
    }

    /// Explicit transition (a watch message arrived, or the network was toggled).
    pub fn update_state(&mut self, state: OnlineState, timers: &mut TimerRegistry) -> Option<OnlineState> {
        timers.cancel(TimerId::OnlineStateTimeout);
        self.watch_stream_failures = 0;
        if state == OnlineState::Online {
            // A later disconnect deserves a fresh warning.
            self.should_warn_client_is_offline = false;
        }
        self.set_state(state)
    }

    fn set_state(&mut self, state: OnlineState) -> Option<OnlineState> {
        if state == self.state {
            return None;
        }
        log::debug!("firestore::online_state: {:?} -> {:?}", self.state, state);
        self.state = state;
        Some(state)
    }

    fn log_offline_warning(&mut self, reason: &str) {
        let message = format!(
            "firestore::online_state: could not reach the backend ({reason}); operating in offline mode"
        );
        if self.should_warn_client_is_offline {
            log::warn!("{message}");
            self.should_warn_client_is_offline = false;
        } else {
            log::debug!("{message}");
        }
    }
}
