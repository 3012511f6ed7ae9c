use std::time::Duration;

use crate::firestore::core::{TimerId, TimerRegistry};
use crate::firestore::error::{FirestoreError, FirestoreErrorCode};
use crate::firestore::remote::connection::RemoteConnection;
use crate::util::{BackoffSettings, ExponentialBackoff};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamKind {
    Watch,
    Write,
}

/// Lifecycle of one logical stream.
///
/// `Disconnected -> Connecting` when started, `Connecting -> Open` once the transport
/// reports the stream open, and back to `Disconnected` on close. A start after a failed
/// stream goes through `Backoff` first.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamState {
    Disconnected,
    Connecting,
    Open,
    Backoff,
}

/// Connection state machine shared by the watch and write streams.
///
/// The stream does not own the transport; every transition that needs it takes the
/// connection and the timer registry as arguments.
#[derive(Debug)]
pub struct PersistentStream {
    kind: StreamKind,
    state: StreamState,
    backoff: ExponentialBackoff,
    idle_timeout: Duration,
    /// The last close was an error, so the next start waits for the backoff delay.
    failed: bool,
}

impl PersistentStream {
    pub fn new(kind: StreamKind, backoff: BackoffSettings, idle_timeout: Duration) -> Self {
        Self {
            kind,
            state: StreamState::Disconnected,
            backoff: ExponentialBackoff::new(backoff),
            idle_timeout,
            failed: false,
        }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn is_started(&self) -> bool {
        self.state != StreamState::Disconnected
    }

    pub fn is_open(&self) -> bool {
        self.state == StreamState::Open
    }

    pub fn start(&mut self, connection: &mut dyn RemoteConnection, timers: &mut TimerRegistry) {
        if self.is_started() {
            return;
        }
        if self.failed {
            let delay = self.backoff.next_delay();
            log::debug!(
                "firestore::stream: {:?} stream backing off for {} ms",
                self.kind,
                delay.as_millis()
            );
            self.state = StreamState::Backoff;
            timers.schedule(self.backoff_timer(), delay);
        } else {
            self.open(connection);
        }
    }

    /// The backoff delay elapsed.
    pub fn handle_backoff_elapsed(&mut self, connection: &mut dyn RemoteConnection) {
        if self.state == StreamState::Backoff {
            self.open(connection);
        }
    }

    /// Returns false if the notification is stale (the stream was not connecting).
    pub fn handle_open(&mut self) -> bool {
        if self.state != StreamState::Connecting {
            return false;
        }
        log::debug!("firestore::stream: {:?} stream open", self.kind);
        self.state = StreamState::Open;
        true
    }

    /// A message arrived, so the connection is healthy again.
    pub fn handle_message(&mut self) {
        self.backoff.reset();
    }

    /// Returns false if the stream was already disconnected.
    pub fn handle_close(&mut self, error: Option<&FirestoreError>, timers: &mut TimerRegistry) -> bool {
        if !self.is_started() {
            return false;
        }
        timers.cancel(self.idle_timer());
        timers.cancel(self.backoff_timer());
        match error {
            None => {
                self.failed = false;
                self.backoff.reset();
            }
            Some(err) => {
                log::debug!("firestore::stream: {:?} stream closed with error: {err}", self.kind);
                self.failed = true;
                if err.code == FirestoreErrorCode::ResourceExhausted {
                    self.backoff.reset_to_max();
                }
            }
        }
        self.state = StreamState::Disconnected;
        true
    }

    /// Closes the stream from our side. Returns false if it was not started.
    pub fn stop(&mut self, connection: &mut dyn RemoteConnection, timers: &mut TimerRegistry) -> bool {
        if !self.is_started() {
            return false;
        }
        if matches!(self.state, StreamState::Connecting | StreamState::Open) {
            match self.kind {
                StreamKind::Watch => connection.close_watch_stream(),
                StreamKind::Write => connection.close_write_stream(),
            }
        }
        self.handle_close(None, timers)
    }

    /// Lets the next start skip the backoff delay, e.g. after a permanent write error
    /// that was handled by dropping the offending batch.
    pub fn inhibit_backoff(&mut self) {
        self.failed = false;
        self.backoff.reset();
    }

    /// Schedules an idle shutdown unless one is already pending.
    pub fn mark_idle(&mut self, timers: &mut TimerRegistry) {
        if self.is_open() && !timers.is_scheduled(self.idle_timer()) {
            timers.schedule(self.idle_timer(), self.idle_timeout);
        }
    }

    pub fn cancel_idle(&mut self, timers: &mut TimerRegistry) {
        timers.cancel(self.idle_timer());
    }

    pub fn backoff_timer(&self) -> TimerId {
        match self.kind {
            StreamKind::Watch => TimerId::ListenStreamConnectionBackoff,
            StreamKind::Write => TimerId::WriteStreamConnectionBackoff,
        }
    }

    pub fn idle_timer(&self) -> TimerId {
        match self.kind {
            StreamKind::Watch => TimerId::ListenStreamIdle,
            StreamKind::Write => TimerId::WriteStreamIdle,
        }
    }

    fn open(&mut self, connection: &mut dyn RemoteConnection) {
        self.state = StreamState::Connecting;
        match self.kind {
            StreamKind::Watch => connection.open_watch_stream(),
            StreamKind::Write => connection.open_write_stream(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::error::unavailable;
    use crate::firestore::remote::connection::{ChannelConnection, StreamRequest};

    fn watch_stream() -> PersistentStream {
        PersistentStream::new(StreamKind::Watch, BackoffSettings::default(), Duration::from_secs(60))
    }

    #[test]
    fn opens_immediately_then_backs_off_after_failure() {
        let (mut connection, requests) = ChannelConnection::new();
        let mut timers = TimerRegistry::default();
        let mut stream = watch_stream();

        stream.start(&mut connection, &mut timers);
        assert_eq!(stream.state(), StreamState::Connecting);
        assert_eq!(requests.try_recv().unwrap(), StreamRequest::OpenWatch);
        assert!(stream.handle_open());

        let err = unavailable("reset");
        assert!(stream.handle_close(Some(&err), &mut timers));
        stream.start(&mut connection, &mut timers);
        assert_eq!(stream.state(), StreamState::Backoff);
        assert!(requests.try_recv().is_err());

        let task = timers.drain_scheduled().pop().unwrap();
        assert_eq!(task.timer_id, TimerId::ListenStreamConnectionBackoff);
        assert!(timers.fire(&task));
        stream.handle_backoff_elapsed(&mut connection);
        assert_eq!(stream.state(), StreamState::Connecting);
        assert_eq!(requests.try_recv().unwrap(), StreamRequest::OpenWatch);
    }

    #[test]
    fn stale_notifications_are_ignored() {
        let mut timers = TimerRegistry::default();
        let mut stream = watch_stream();
        assert!(!stream.handle_open());
        assert!(!stream.handle_close(None, &mut timers));
    }

    #[test]
    fn idle_stream_schedules_shutdown_once() {
        let (mut connection, requests) = ChannelConnection::new();
        let mut timers = TimerRegistry::default();
        let mut stream = watch_stream();
        stream.start(&mut connection, &mut timers);
        stream.handle_open();
        stream.mark_idle(&mut timers);
        stream.mark_idle(&mut timers);
        assert_eq!(timers.drain_scheduled().len(), 1);

        assert!(stream.stop(&mut connection, &mut timers));
        assert!(!timers.is_scheduled(TimerId::ListenStreamIdle));
        let sent: Vec<StreamRequest> = std::iter::from_fn(|| requests.try_recv().ok()).collect();
        assert_eq!(sent, vec![StreamRequest::OpenWatch, StreamRequest::CloseWatch]);
    }
}
