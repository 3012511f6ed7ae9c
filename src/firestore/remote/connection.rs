use async_channel::{Receiver, Sender};

use crate::firestore::error::FirestoreError;
use crate::firestore::local::TargetData;
use crate::firestore::model::mutation::{Mutation, MutationResult};
use crate::firestore::model::SnapshotVersion;
use crate::firestore::remote::watch_change::WatchChange;

/// Outbound side of the transport.
///
/// Calls are fire-and-forget: the transport reports the outcome later through
/// [`StreamEvent`]s (open, messages, close). Implementations must preserve call order.
pub trait RemoteConnection: Send {
    fn open_watch_stream(&mut self);

    fn close_watch_stream(&mut self);

    /// Starts listening to a target, resuming from its resume token when it has one.
    fn send_watch_request(&mut self, target: &TargetData);

    fn send_unwatch_request(&mut self, target_id: i32);

    fn open_write_stream(&mut self);

    fn close_write_stream(&mut self);

    /// First message on a fresh write stream; answered by a handshake response with a
    /// stream token.
    fn send_handshake(&mut self);

    fn send_mutations(&mut self, batch_id: i32, stream_token: &[u8], mutations: &[Mutation]);
}

/// A recorded call on a [`RemoteConnection`].
#[derive(Clone, Debug, PartialEq)]
pub enum StreamRequest {
    OpenWatch,
    CloseWatch,
    Watch(TargetData),
    Unwatch(i32),
    OpenWrite,
    CloseWrite,
    Handshake,
    Write {
        batch_id: i32,
        stream_token: Vec<u8>,
        mutations: Vec<Mutation>,
    },
}

/// Inbound transport notification, applied to the client in arrival order.
#[derive(Clone, Debug)]
pub enum StreamEvent {
    WatchOpen,
    WatchChange(WatchChange),
    /// `None` is a clean close.
    WatchClose(Option<FirestoreError>),
    WriteOpen,
    WriteHandshake {
        stream_token: Vec<u8>,
    },
    WriteResponse {
        stream_token: Vec<u8>,
        commit_version: SnapshotVersion,
        results: Vec<MutationResult>,
    },
    WriteClose(Option<FirestoreError>),
}

/// Connection that forwards every request over an unbounded channel to a transport task.
#[derive(Clone, Debug)]
pub struct ChannelConnection {
    sender: Sender<StreamRequest>,
}

impl ChannelConnection {
    /// Returns the connection and the receiving end the transport drains.
    pub fn new() -> (Self, Receiver<StreamRequest>) {
        let (sender, receiver) = async_channel::unbounded();
        (Self { sender }, receiver)
    }

    fn send(&self, request: StreamRequest) {
        if let Err(err) = self.sender.try_send(request) {
            // The transport is gone; streams will never open, so the engine stays offline.
            log::warn!("firestore::connection: dropping request, transport closed: {err}");
        }
    }
}

impl RemoteConnection for ChannelConnection {
    fn open_watch_stream(&mut self) {
        self.send(StreamRequest::OpenWatch);
    }

    fn close_watch_stream(&mut self) {
        self.send(StreamRequest::CloseWatch);
    }

    fn send_watch_request(&mut self, target: &TargetData) {
        self.send(StreamRequest::Watch(target.clone()));
    }

    fn send_unwatch_request(&mut self, target_id: i32) {
        self.send(StreamRequest::Unwatch(target_id));
    }

    fn open_write_stream(&mut self) {
        self.send(StreamRequest::OpenWrite);
    }

    fn close_write_stream(&mut self) {
        self.send(StreamRequest::CloseWrite);
    }

    fn send_handshake(&mut self) {
        self.send(StreamRequest::Handshake);
    }

    fn send_mutations(&mut self, batch_id: i32, stream_token: &[u8], mutations: &[Mutation]) {
        self.send(StreamRequest::Write {
            batch_id,
            stream_token: stream_token.to_vec(),
            mutations: mutations.to_vec(),
        });
    }
}
