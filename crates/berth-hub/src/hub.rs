//! The coordinator task: one logical thread of control owning the connection
//! registry and the request queue.
//!
//! Every UI command and every transport event is one discrete step. After
//! each step the hub reconciles channel sessions against the active
//! account/chain, rewrites the persisted records, and publishes a consistent
//! snapshot for readers. Nothing here blocks on a peer: transport calls hand
//! traffic to the adapter and return, and their failures only ever affect
//! their own channel.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

use crate::queue::{
    CallMethod, Outcome, PendingRequest, RequestKey, RequestQueue, RequestSet,
    METHOD_NOT_SUPPORTED, REQUEST_SET_VERSION,
};
use crate::registry::{ConnectStatus, ConnectionRegistry, ConnectionView};
use crate::session::{ConnectionSet, InvalidUri, PeerUri, CONNECTION_SET_VERSION};
use crate::store::WalletStore;
use crate::transport::{ChannelEvent, ChannelEventKind, TransportError, TransportFactory};

const NEGOTIATION_SWEEP: Duration = Duration::from_millis(250);

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error(transparent)]
    InvalidUri(#[from] InvalidUri),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("hub is not running")]
    Closed,
}

/// User-visible happenings, one variant per condition the UI reports
/// distinctly. Advisory stream: losing a notice never loses state.
#[derive(Debug, Clone)]
pub enum Notice {
    SessionConnected { uri: PeerUri, peer: String },
    ConnectFailed { uri: String, reason: String },
    ChannelDisconnected { uri: PeerUri },
    UnsupportedMethod { uri: PeerUri, method: String },
    RequestQueued { key: RequestKey, method: CallMethod },
    NegotiationPending { uri: PeerUri },
}

/// Consistent point-in-time view published between steps.
#[derive(Debug, Clone)]
pub struct HubSnapshot {
    pub account: String,
    pub chain_id: u64,
    pub connections: Vec<ConnectionView>,
    pub requests: Vec<PendingRequest>,
}

#[derive(Debug, Clone)]
pub struct HubConfig {
    pub account: String,
    pub chain_id: u64,
    pub negotiation_window: Duration,
}

impl HubConfig {
    pub fn new(account: impl Into<String>, chain_id: u64) -> Self {
        Self {
            account: account.into(),
            chain_id,
            negotiation_window: Duration::from_secs(30),
        }
    }

    pub fn with_negotiation_window(mut self, window: Duration) -> Self {
        self.negotiation_window = window;
        self
    }
}

enum Command {
    Connect {
        raw_uri: String,
        reply: oneshot::Sender<Result<ConnectStatus, ConnectError>>,
    },
    Disconnect {
        uri: String,
    },
    ResolveMany {
        keys: Vec<RequestKey>,
        outcome: Outcome,
    },
    SetAccount {
        account: String,
    },
    SetChain {
        chain_id: u64,
    },
    Shutdown,
}

/// Cheap cloneable front door to a running [`Hub`].
#[derive(Clone)]
pub struct HubHandle {
    commands: mpsc::UnboundedSender<Command>,
    notices: broadcast::Sender<Notice>,
    snapshot: watch::Receiver<HubSnapshot>,
}

impl HubHandle {
    /// Open a channel to a peer uri. Resolves once the hub has admitted or
    /// refused the attempt; session negotiation continues in the background.
    pub async fn connect(&self, raw_uri: &str) -> Result<ConnectStatus, ConnectError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Connect {
                raw_uri: raw_uri.to_string(),
                reply,
            })
            .map_err(|_| ConnectError::Closed)?;
        response.await.map_err(|_| ConnectError::Closed)?
    }

    pub fn disconnect(&self, uri: &str) {
        let _ = self.commands.send(Command::Disconnect {
            uri: uri.to_string(),
        });
    }

    /// Resolve a batch of queued requests with one shared outcome.
    pub fn resolve_many(&self, keys: Vec<RequestKey>, outcome: Outcome) {
        let _ = self.commands.send(Command::ResolveMany { keys, outcome });
    }

    pub fn set_account(&self, account: impl Into<String>) {
        let _ = self.commands.send(Command::SetAccount {
            account: account.into(),
        });
    }

    pub fn set_chain(&self, chain_id: u64) {
        let _ = self.commands.send(Command::SetChain { chain_id });
    }

    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }

    pub fn notices(&self) -> broadcast::Receiver<Notice> {
        self.notices.subscribe()
    }

    pub fn snapshot(&self) -> HubSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Receiver that wakes whenever a new snapshot is published.
    pub fn watch(&self) -> watch::Receiver<HubSnapshot> {
        self.snapshot.clone()
    }
}

pub struct Hub {
    registry: ConnectionRegistry,
    queue: RequestQueue,
    store: Arc<dyn WalletStore>,
    account: String,
    chain_id: u64,
    negotiation_window: Duration,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedReceiver<ChannelEvent>,
    notices: broadcast::Sender<Notice>,
    snapshot_tx: watch::Sender<HubSnapshot>,
}

impl Hub {
    pub fn new(
        factory: Arc<dyn TransportFactory>,
        store: Arc<dyn WalletStore>,
        config: HubConfig,
    ) -> (Self, HubHandle) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (notices_tx, _) = broadcast::channel(256);
        let (snapshot_tx, snapshot_rx) = watch::channel(HubSnapshot {
            account: config.account.clone(),
            chain_id: config.chain_id,
            connections: Vec::new(),
            requests: Vec::new(),
        });

        let handle = HubHandle {
            commands: commands_tx,
            notices: notices_tx.clone(),
            snapshot: snapshot_rx,
        };
        let hub = Self {
            registry: ConnectionRegistry::new(factory, events_tx),
            queue: RequestQueue::new(),
            store,
            account: config.account,
            chain_id: config.chain_id,
            negotiation_window: config.negotiation_window,
            commands: commands_rx,
            events: events_rx,
            notices: notices_tx,
            snapshot_tx,
        };
        (hub, handle)
    }

    /// Run until `shutdown` or until every handle is dropped.
    pub async fn run(mut self) {
        self.restore().await;
        self.settle().await;

        let mut sweep = tokio::time::interval(NEGOTIATION_SWEEP);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                maybe = self.commands.recv() => {
                    let Some(command) = maybe else { break };
                    let done = self.handle_command(command).await;
                    self.settle().await;
                    if done {
                        break;
                    }
                }
                maybe = self.events.recv() => {
                    // The registry holds a sender clone, so this arm only
                    // ever yields live events.
                    if let Some(event) = maybe {
                        self.handle_event(event);
                        self.settle().await;
                    }
                }
                _ = sweep.tick() => self.sweep_negotiations(),
            }
        }
        tracing::info!(target = "berth::hub", "hub stopped");
    }

    /// Rebuild channels and the queue from the persisted records.
    async fn restore(&mut self) {
        let connections = match self.store.load_connections().await {
            Ok(set) => set,
            Err(err) => {
                tracing::error!(
                    target = "berth::hub",
                    error = %err,
                    "failed to load connections, starting empty"
                );
                ConnectionSet::default()
            }
        };
        if connections.version != CONNECTION_SET_VERSION {
            tracing::warn!(
                target = "berth::hub",
                version = connections.version,
                "unexpected connection record version"
            );
        }
        for record in connections.connections {
            if let Err(err) = self
                .registry
                .connect(record.uri.clone(), Some(record.session))
                .await
            {
                tracing::warn!(
                    target = "berth::hub",
                    uri = %record.uri,
                    error = %err,
                    "failed to restore channel"
                );
                self.notify(Notice::ConnectFailed {
                    uri: record.uri.to_string(),
                    reason: err.to_string(),
                });
            }
        }

        let requests = match self.store.load_requests().await {
            Ok(set) => set,
            Err(err) => {
                tracing::error!(
                    target = "berth::hub",
                    error = %err,
                    "failed to load pending requests, starting empty"
                );
                RequestSet::default()
            }
        };
        if requests.version != REQUEST_SET_VERSION {
            tracing::warn!(
                target = "berth::hub",
                version = requests.version,
                "unexpected request record version"
            );
        }
        for request in requests.requests {
            self.queue.ingest(request);
        }
    }

    async fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::Connect { raw_uri, reply } => {
                let result = self.connect(&raw_uri).await;
                let _ = reply.send(result);
            }
            Command::Disconnect { uri } => match PeerUri::parse(&uri) {
                Ok(uri) => {
                    if self.registry.disconnect(&uri) {
                        self.notify(Notice::ChannelDisconnected { uri });
                    }
                }
                Err(err) => {
                    tracing::debug!(target = "berth::hub", error = %err, "disconnect for invalid uri")
                }
            },
            Command::ResolveMany { keys, outcome } => self.resolve_many(&keys, outcome),
            Command::SetAccount { account } => {
                tracing::info!(target = "berth::hub", account = %account, "active account switched");
                self.account = account;
            }
            Command::SetChain { chain_id } => {
                tracing::info!(target = "berth::hub", chain_id, "active chain switched");
                self.chain_id = chain_id;
            }
            Command::Shutdown => return true,
        }
        false
    }

    async fn connect(&mut self, raw_uri: &str) -> Result<ConnectStatus, ConnectError> {
        let uri = PeerUri::parse(raw_uri)?;
        match self.registry.connect(uri.clone(), None).await {
            Ok(status) => Ok(status),
            Err(err) => {
                self.notify(Notice::ConnectFailed {
                    uri: uri.to_string(),
                    reason: err.to_string(),
                });
                Err(err.into())
            }
        }
    }

    fn handle_event(&mut self, event: ChannelEvent) {
        let ChannelEvent { uri, kind } = event;
        match kind {
            ChannelEventKind::SessionNegotiated {
                peer_meta,
                proposed_accounts,
                proposed_chain_id,
            } => {
                tracing::debug!(
                    target = "berth::hub",
                    uri = %uri,
                    proposed_accounts = ?proposed_accounts,
                    proposed_chain_id,
                    "session negotiated"
                );
                let peer = peer_meta.name.clone();
                if self
                    .registry
                    .apply_negotiated(&uri, peer_meta, &self.account, self.chain_id)
                {
                    self.notify(Notice::SessionConnected { uri, peer });
                }
            }
            ChannelEventKind::CallRequested { id, method, params } => {
                self.ingest_call(uri, id, method, params)
            }
            ChannelEventKind::Disconnected { reason } => {
                tracing::info!(
                    target = "berth::hub",
                    uri = %uri,
                    reason = reason.as_deref().unwrap_or("none"),
                    "channel closed by peer"
                );
                if self.registry.apply_disconnected(&uri) {
                    self.notify(Notice::ChannelDisconnected { uri });
                }
            }
        }
    }

    fn ingest_call(&mut self, uri: PeerUri, id: u64, method: String, params: Value) {
        let Some(call_method) = CallMethod::parse(&method) else {
            if let Some(transport) = self.registry.transport(&uri) {
                if let Err(err) = transport.reject_request(id, METHOD_NOT_SUPPORTED) {
                    tracing::warn!(
                        target = "berth::hub",
                        uri = %uri,
                        id,
                        error = %err,
                        "unsupported-method reject failed"
                    );
                }
            }
            tracing::info!(target = "berth::hub", uri = %uri, method = %method, "unsupported method rejected");
            self.notify(Notice::UnsupportedMethod { uri, method });
            return;
        };

        // Freeze the channel's view of account/chain now; a later switch must
        // not redirect a request already in flight.
        let (account, chain_id) = match self.registry.channel(&uri).and_then(|c| c.session()) {
            Some(session) => (
                session
                    .accounts
                    .first()
                    .cloned()
                    .unwrap_or_else(|| self.account.clone()),
                session.chain_id,
            ),
            None => (self.account.clone(), self.chain_id),
        };
        let request = PendingRequest {
            uri,
            id,
            method: call_method,
            account,
            chain_id,
            params,
        };
        let key = request.key();
        if self.queue.ingest(request) {
            self.notify(Notice::RequestQueued {
                key,
                method: call_method,
            });
        }
    }

    fn resolve_many(&mut self, keys: &[RequestKey], outcome: Outcome) {
        for request in self.queue.resolve_many(keys) {
            let Some(transport) = self.registry.transport(&request.uri) else {
                tracing::debug!(
                    target = "berth::hub",
                    uri = %request.uri,
                    id = request.id,
                    "channel gone, dropping resolution forward"
                );
                continue;
            };
            let forwarded = match &outcome {
                Outcome::Approved(result) => transport.approve_request(request.id, result.clone()),
                Outcome::Rejected(message) => transport.reject_request(request.id, message),
            };
            if let Err(err) = forwarded {
                tracing::warn!(
                    target = "berth::hub",
                    uri = %request.uri,
                    id = request.id,
                    error = %err,
                    "resolution forward failed"
                );
            }
        }
    }

    /// Reconcile, persist, publish: the tail of every step.
    async fn settle(&mut self) {
        self.registry.reconcile(&self.account, self.chain_id);
        if let Err(err) = self
            .store
            .save_connections(&self.registry.connection_set())
            .await
        {
            tracing::error!(target = "berth::hub", error = %err, "failed to persist connections");
        }
        if let Err(err) = self.store.save_requests(&self.queue.to_set()).await {
            tracing::error!(target = "berth::hub", error = %err, "failed to persist requests");
        }
        self.publish();
    }

    fn publish(&self) {
        self.snapshot_tx.send_replace(HubSnapshot {
            account: self.account.clone(),
            chain_id: self.chain_id,
            connections: self.registry.views(),
            requests: self.queue.snapshot(),
        });
    }

    fn sweep_negotiations(&mut self) {
        for uri in self.registry.negotiating_overdue(self.negotiation_window) {
            tracing::warn!(target = "berth::hub", uri = %uri, "session negotiation still pending");
            self.notify(Notice::NegotiationPending { uri });
        }
    }

    fn notify(&self, notice: Notice) {
        // Nobody listening is fine; notices are advisory.
        let _ = self.notices.send(notice);
    }
}
