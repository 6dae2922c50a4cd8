use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::session::{PeerMeta, PeerSession, PeerUri};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport channel closed")]
    Closed,
    #[error("relay error: {0}")]
    Relay(String),
}

/// One event emitted by a live peer channel.
///
/// Events for a single uri arrive in the order the peer sent them; events
/// across different uris carry no ordering guarantee.
#[derive(Debug, Clone)]
pub struct ChannelEvent {
    pub uri: PeerUri,
    pub kind: ChannelEventKind,
}

#[derive(Debug, Clone)]
pub enum ChannelEventKind {
    /// The peer completed session negotiation and proposed its own view of
    /// accounts/chain. The wallet approves with its active identity instead.
    SessionNegotiated {
        peer_meta: PeerMeta,
        proposed_accounts: Vec<String>,
        proposed_chain_id: u64,
    },
    /// The peer asked the wallet to sign or send something.
    CallRequested {
        id: u64,
        method: String,
        params: Value,
    },
    /// The channel is gone; terminal for this transport.
    Disconnected { reason: Option<String> },
}

impl ChannelEvent {
    pub fn new(uri: PeerUri, kind: ChannelEventKind) -> Self {
        Self { uri, kind }
    }
}

/// Handle to one live peer channel.
///
/// Calls enqueue outbound relay traffic and return without waiting for the
/// peer; delivery failures surface later as [`ChannelEventKind::Disconnected`]
/// events, never as return values here. An error from these methods means the
/// local channel is already unusable, not that the peer refused anything.
pub trait SessionTransport: Send + Sync {
    fn approve_session(&self, accounts: &[String], chain_id: u64) -> Result<(), TransportError>;
    fn update_session(&self, accounts: &[String], chain_id: u64) -> Result<(), TransportError>;
    fn approve_request(&self, id: u64, result: Value) -> Result<(), TransportError>;
    fn reject_request(&self, id: u64, error: &str) -> Result<(), TransportError>;
    fn kill(&self) -> Result<(), TransportError>;
}

/// Opens peer channels from relay uris.
///
/// `restored` carries the last persisted session when the channel is being
/// rebuilt after a restart, so the implementation can resume instead of
/// renegotiating. Channel events are delivered through `events`; the
/// implementation must tag every event with the channel's uri.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn open(
        &self,
        uri: &PeerUri,
        restored: Option<&PeerSession>,
        events: mpsc::UnboundedSender<ChannelEvent>,
    ) -> Result<Arc<dyn SessionTransport>, TransportError>;
}
