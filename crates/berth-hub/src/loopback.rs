//! In-process transport with a drivable peer side.
//!
//! No relay, no crypto: both halves live in the same process. Tests and the
//! console binary use it to feed negotiation, call and disconnect events into
//! the hub and to observe what the wallet sent back.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::session::{PeerMeta, PeerSession, PeerUri};
use crate::transport::{
    ChannelEvent, ChannelEventKind, SessionTransport, TransportError, TransportFactory,
};

/// Everything the wallet sent toward one loopback peer.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerCall {
    ApproveSession { accounts: Vec<String>, chain_id: u64 },
    UpdateSession { accounts: Vec<String>, chain_id: u64 },
    ApproveRequest { id: u64, result: Value },
    RejectRequest { id: u64, error: String },
    Kill,
}

/// The peer half of a loopback channel.
pub struct LoopbackPeer {
    uri: PeerUri,
    events: mpsc::UnboundedSender<ChannelEvent>,
    calls: Mutex<Vec<PeerCall>>,
    killed: Mutex<bool>,
}

impl LoopbackPeer {
    fn new(uri: PeerUri, events: mpsc::UnboundedSender<ChannelEvent>) -> Self {
        Self {
            uri,
            events,
            calls: Mutex::new(Vec::new()),
            killed: Mutex::new(false),
        }
    }

    pub fn uri(&self) -> &PeerUri {
        &self.uri
    }

    /// Drive the peer: complete session negotiation.
    pub fn negotiate(
        &self,
        peer_meta: PeerMeta,
        proposed_accounts: Vec<String>,
        proposed_chain_id: u64,
    ) -> Result<(), TransportError> {
        self.emit(ChannelEventKind::SessionNegotiated {
            peer_meta,
            proposed_accounts,
            proposed_chain_id,
        })
    }

    /// Drive the peer: send an inbound call request.
    pub fn request(&self, id: u64, method: &str, params: Value) -> Result<(), TransportError> {
        self.emit(ChannelEventKind::CallRequested {
            id,
            method: method.to_string(),
            params,
        })
    }

    /// Drive the peer: drop the channel from the remote side.
    pub fn drop_channel(&self, reason: Option<&str>) -> Result<(), TransportError> {
        self.emit(ChannelEventKind::Disconnected {
            reason: reason.map(str::to_string),
        })
    }

    /// Calls the wallet has issued on this channel so far.
    pub fn calls(&self) -> Vec<PeerCall> {
        self.calls.lock().clone()
    }

    pub fn update_session_count(&self) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|call| matches!(call, PeerCall::UpdateSession { .. }))
            .count()
    }

    fn emit(&self, kind: ChannelEventKind) -> Result<(), TransportError> {
        self.events
            .send(ChannelEvent::new(self.uri.clone(), kind))
            .map_err(|_| TransportError::Closed)
    }

    fn record(&self, call: PeerCall) -> Result<(), TransportError> {
        if *self.killed.lock() {
            return Err(TransportError::Closed);
        }
        self.calls.lock().push(call);
        Ok(())
    }
}

impl SessionTransport for LoopbackPeer {
    fn approve_session(&self, accounts: &[String], chain_id: u64) -> Result<(), TransportError> {
        self.record(PeerCall::ApproveSession {
            accounts: accounts.to_vec(),
            chain_id,
        })
    }

    fn update_session(&self, accounts: &[String], chain_id: u64) -> Result<(), TransportError> {
        self.record(PeerCall::UpdateSession {
            accounts: accounts.to_vec(),
            chain_id,
        })
    }

    fn approve_request(&self, id: u64, result: Value) -> Result<(), TransportError> {
        self.record(PeerCall::ApproveRequest { id, result })
    }

    fn reject_request(&self, id: u64, error: &str) -> Result<(), TransportError> {
        self.record(PeerCall::RejectRequest {
            id,
            error: error.to_string(),
        })
    }

    fn kill(&self) -> Result<(), TransportError> {
        self.record(PeerCall::Kill)?;
        *self.killed.lock() = true;
        Ok(())
    }
}

/// Factory producing loopback channels, one peer handle per uri.
#[derive(Default)]
pub struct LoopbackFactory {
    peers: Mutex<HashMap<String, Arc<LoopbackPeer>>>,
    refused: Mutex<Vec<String>>,
    /// When set, fresh (non-restored) channels negotiate immediately with
    /// this peer identity.
    auto_meta: Option<PeerMeta>,
}

impl LoopbackFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Factory whose fresh channels auto-negotiate, for demo wiring where
    /// nobody drives the peer side by hand.
    pub fn auto_negotiating(peer_name: &str) -> Self {
        Self {
            auto_meta: Some(PeerMeta::named(peer_name)),
            ..Self::default()
        }
    }

    /// Make the next `open` of this uri fail, as a relay connect failure.
    pub fn refuse(&self, uri: &str) {
        self.refused.lock().push(uri.to_string());
    }

    /// Peer handle for a previously opened uri.
    pub fn peer(&self, uri: &str) -> Option<Arc<LoopbackPeer>> {
        self.peers.lock().get(uri).cloned()
    }
}

#[async_trait]
impl TransportFactory for LoopbackFactory {
    async fn open(
        &self,
        uri: &PeerUri,
        restored: Option<&PeerSession>,
        events: mpsc::UnboundedSender<ChannelEvent>,
    ) -> Result<Arc<dyn SessionTransport>, TransportError> {
        {
            let mut refused = self.refused.lock();
            if let Some(pos) = refused.iter().position(|r| r == uri.as_str()) {
                refused.remove(pos);
                return Err(TransportError::Relay(format!(
                    "connection refused: {uri}"
                )));
            }
        }

        let peer = Arc::new(LoopbackPeer::new(uri.clone(), events));
        self.peers
            .lock()
            .insert(uri.as_str().to_string(), peer.clone());

        if restored.is_none() {
            if let Some(meta) = &self.auto_meta {
                peer.negotiate(meta.clone(), Vec::new(), 1)?;
            }
        }

        Ok(peer)
    }
}
