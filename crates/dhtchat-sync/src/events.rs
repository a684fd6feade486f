//! Listener interface for engine events.
//!
//! All callbacks run on the engine task and must not block. Implementations
//! that need to do real work should hand events off, as [`ChannelListener`]
//! does.

use tokio::sync::mpsc;

use dhtchat_core::{DeviceId, Message, MessageHash, PeerKey, Timestamp};

use crate::error::SyncError;

/// Outcome of publishing one of our own messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageStatus {
    /// The immutable item was accepted by the DHT.
    Published,
    /// The DHT rejected or dropped the put.
    Failed,
}

/// Receives notifications from the engine. Every method defaults to a no-op.
pub trait EventListener: Send + Sync {
    /// A friend's presence timestamp advanced.
    fn on_presence(&self, _peer: &PeerKey, _timestamp: Timestamp) {}

    /// A new message from `peer` was persisted.
    fn on_message(&self, _peer: &PeerKey, _message: &Message) {}

    /// `peer` confirmed holding one of our messages.
    fn on_read_receipt(&self, _peer: &PeerKey, _hash: &MessageHash, _timestamp: Timestamp) {}

    /// Another installation of our identity appeared on the self channel.
    fn on_new_device(&self, _device: &DeviceId) {}

    fn on_message_status(&self, _peer: &PeerKey, _hash: &MessageHash, _status: MessageStatus) {}

    /// A tick failed; the engine will retry after its minimum interval.
    fn on_error(&self, _error: &SyncError) {}
}

/// Listener that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopListener;

impl EventListener for NoopListener {}

/// An engine event, as delivered by [`ChannelListener`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Presence {
        peer: PeerKey,
        timestamp: Timestamp,
    },
    Message {
        peer: PeerKey,
        message: Message,
    },
    ReadReceipt {
        peer: PeerKey,
        hash: MessageHash,
        timestamp: Timestamp,
    },
    NewDevice(DeviceId),
    MessageStatus {
        peer: PeerKey,
        hash: MessageHash,
        status: MessageStatus,
    },
    Error(String),
}

/// Forwards every callback as an [`Event`] on an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelListener {
    tx: mpsc::UnboundedSender<Event>,
}

impl ChannelListener {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn emit(&self, event: Event) {
        // Receiver gone means nobody is listening anymore.
        let _ = self.tx.send(event);
    }
}

impl EventListener for ChannelListener {
    fn on_presence(&self, peer: &PeerKey, timestamp: Timestamp) {
        self.emit(Event::Presence {
            peer: *peer,
            timestamp,
        });
    }

    fn on_message(&self, peer: &PeerKey, message: &Message) {
        self.emit(Event::Message {
            peer: *peer,
            message: message.clone(),
        });
    }

    fn on_read_receipt(&self, peer: &PeerKey, hash: &MessageHash, timestamp: Timestamp) {
        self.emit(Event::ReadReceipt {
            peer: *peer,
            hash: *hash,
            timestamp,
        });
    }

    fn on_new_device(&self, device: &DeviceId) {
        self.emit(Event::NewDevice(*device));
    }

    fn on_message_status(&self, peer: &PeerKey, hash: &MessageHash, status: MessageStatus) {
        self.emit(Event::MessageStatus {
            peer: *peer,
            hash: *hash,
            status,
        });
    }

    fn on_error(&self, error: &SyncError) {
        self.emit(Event::Error(error.to_string()));
    }
}
