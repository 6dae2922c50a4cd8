//! Connection registry: the authoritative mapping from peer uri to live
//! transport and negotiated session.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use crate::session::{ConnectionRecord, ConnectionSet, PeerMeta, PeerSession, PeerUri};
use crate::transport::{ChannelEvent, SessionTransport, TransportError, TransportFactory};

/// Per-channel lifecycle. `Disconnected` is terminal: the channel is evicted
/// and a peer wanting back in must go through a fresh `connect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Negotiating,
    Connected,
    Disconnected,
}

impl std::fmt::Display for ChannelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Negotiating => "negotiating",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
        };
        f.write_str(label)
    }
}

/// Whether `connect` created a channel or found one already present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectStatus {
    New,
    Existing,
}

/// One addressable connection to a peer. Exactly one transport exists per
/// uri at any time; the registry enforces this.
pub struct PeerChannel {
    uri: PeerUri,
    state: ChannelState,
    session: Option<PeerSession>,
    transport: Option<Arc<dyn SessionTransport>>,
    opened_at: Instant,
    slow_noticed: bool,
}

impl PeerChannel {
    pub fn uri(&self) -> &PeerUri {
        &self.uri
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn session(&self) -> Option<&PeerSession> {
        self.session.as_ref()
    }
}

/// Read-only projection of a channel for UI snapshots.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionView {
    pub uri: PeerUri,
    pub state: ChannelState,
    pub session: Option<PeerSession>,
}

pub struct ConnectionRegistry {
    factory: Arc<dyn TransportFactory>,
    events: mpsc::UnboundedSender<ChannelEvent>,
    channels: Vec<PeerChannel>,
}

impl ConnectionRegistry {
    pub fn new(
        factory: Arc<dyn TransportFactory>,
        events: mpsc::UnboundedSender<ChannelEvent>,
    ) -> Self {
        Self {
            factory,
            events,
            channels: Vec::new(),
        }
    }

    /// Open a channel to `uri`. Idempotent: a uri with a live transport is
    /// left untouched and reported as [`ConnectStatus::Existing`].
    ///
    /// A channel restored from storage starts `Connected` with its persisted
    /// session; a fresh one starts `Negotiating` and completes on the
    /// transport's negotiation event. Factory failures reach the caller and
    /// never touch registry state.
    pub async fn connect(
        &mut self,
        uri: PeerUri,
        prior: Option<PeerSession>,
    ) -> Result<ConnectStatus, TransportError> {
        if self.position(&uri).is_some() {
            tracing::debug!(target = "berth::registry", uri = %uri, "channel already present");
            return Ok(ConnectStatus::Existing);
        }

        let transport = self
            .factory
            .open(&uri, prior.as_ref(), self.events.clone())
            .await?;

        let state = if prior.is_some() {
            ChannelState::Connected
        } else {
            ChannelState::Negotiating
        };
        tracing::info!(target = "berth::registry", uri = %uri, state = %state, "channel opened");
        self.channels.push(PeerChannel {
            uri,
            state,
            session: prior,
            transport: Some(transport),
            opened_at: Instant::now(),
            slow_noticed: false,
        });
        Ok(ConnectStatus::New)
    }

    /// Stop tracking `uri`. The transport is killed best-effort; a kill
    /// failure is logged and the channel is evicted regardless, so the local
    /// intent always succeeds. Returns false when the uri was not present.
    pub fn disconnect(&mut self, uri: &PeerUri) -> bool {
        let Some(pos) = self.position(uri) else {
            return false;
        };
        let mut channel = self.channels.remove(pos);
        channel.state = ChannelState::Disconnected;
        if let Some(transport) = channel.transport.take() {
            if let Err(err) = transport.kill() {
                tracing::warn!(target = "berth::registry", uri = %uri, error = %err, "kill failed");
            }
        }
        tracing::info!(target = "berth::registry", uri = %uri, "channel disconnected");
        true
    }

    /// Handle the transport's negotiation event: store the session and
    /// auto-approve with the wallet's active account/chain. The peer's own
    /// proposal is not echoed back; being the active identity is the
    /// approval in this design.
    pub fn apply_negotiated(
        &mut self,
        uri: &PeerUri,
        peer_meta: PeerMeta,
        account: &str,
        chain_id: u64,
    ) -> bool {
        let Some(channel) = self.channel_mut(uri) else {
            tracing::debug!(target = "berth::registry", uri = %uri, "negotiation for unknown channel");
            return false;
        };
        channel.session = Some(PeerSession::new(peer_meta, account, chain_id));
        channel.state = ChannelState::Connected;
        if let Some(transport) = &channel.transport {
            if let Err(err) = transport.approve_session(&[account.to_string()], chain_id) {
                tracing::warn!(target = "berth::registry", uri = %uri, error = %err, "approve failed");
            }
        }
        tracing::info!(target = "berth::registry", uri = %uri, chain_id, "session approved");
        true
    }

    /// Handle the transport's disconnect event. The transport is already
    /// gone, so it is dropped without a kill.
    pub fn apply_disconnected(&mut self, uri: &PeerUri) -> bool {
        let Some(pos) = self.position(uri) else {
            return false;
        };
        self.channels.remove(pos);
        tracing::info!(target = "berth::registry", uri = %uri, "peer dropped channel");
        true
    }

    /// Push the active account/chain into every connected channel whose
    /// session disagrees. The local session copy is retargeted as soon as
    /// the update is handed to the transport, so a second pass with no
    /// intervening change issues no further calls. Transport failures leave
    /// the session as-is and are retried by the next pass.
    pub fn reconcile(&mut self, account: &str, chain_id: u64) -> usize {
        let mut updated = 0;
        for channel in &mut self.channels {
            if channel.state != ChannelState::Connected {
                continue;
            }
            let Some(session) = channel.session.as_mut() else {
                continue;
            };
            if session.matches(account, chain_id) {
                continue;
            }
            let Some(transport) = &channel.transport else {
                continue;
            };
            match transport.update_session(&[account.to_string()], chain_id) {
                Ok(()) => {
                    session.retarget(account, chain_id);
                    updated += 1;
                    tracing::debug!(
                        target = "berth::registry",
                        uri = %channel.uri,
                        chain_id,
                        "session update pushed"
                    );
                }
                Err(err) => {
                    tracing::warn!(
                        target = "berth::registry",
                        uri = %channel.uri,
                        error = %err,
                        "session update failed, will retry next pass"
                    );
                }
            }
        }
        updated
    }

    /// Negotiating channels older than `window` that have not been flagged
    /// yet. Advisory: the channel stays `Negotiating` and may still complete.
    pub fn negotiating_overdue(&mut self, window: Duration) -> Vec<PeerUri> {
        let mut overdue = Vec::new();
        for channel in &mut self.channels {
            if channel.state == ChannelState::Negotiating
                && !channel.slow_noticed
                && channel.opened_at.elapsed() >= window
            {
                channel.slow_noticed = true;
                overdue.push(channel.uri.clone());
            }
        }
        overdue
    }

    pub fn channel(&self, uri: &PeerUri) -> Option<&PeerChannel> {
        self.channels.iter().find(|c| &c.uri == uri)
    }

    pub fn transport(&self, uri: &PeerUri) -> Option<Arc<dyn SessionTransport>> {
        self.channel(uri).and_then(|c| c.transport.clone())
    }

    /// Durable projection: channels with a negotiated session, in insertion
    /// order. Channels still negotiating have nothing worth persisting.
    pub fn connection_set(&self) -> ConnectionSet {
        ConnectionSet::new(
            self.channels
                .iter()
                .filter_map(|c| {
                    c.session.as_ref().map(|session| ConnectionRecord {
                        uri: c.uri.clone(),
                        session: session.clone(),
                    })
                })
                .collect(),
        )
    }

    pub fn views(&self) -> Vec<ConnectionView> {
        self.channels
            .iter()
            .map(|c| ConnectionView {
                uri: c.uri.clone(),
                state: c.state,
                session: c.session.clone(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    fn position(&self, uri: &PeerUri) -> Option<usize> {
        self.channels.iter().position(|c| &c.uri == uri)
    }

    fn channel_mut(&mut self, uri: &PeerUri) -> Option<&mut PeerChannel> {
        self.channels.iter_mut().find(|c| &c.uri == uri)
    }
}
