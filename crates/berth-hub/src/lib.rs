//! Peer-session and call-request coordination for a single-identity wallet.
//!
//! The wallet holds one active account and chain; any number of external
//! peers (dApps) connect over a relayed session protocol and send signing
//! requests. This crate owns the pieces between the relay adapter and the
//! approval UI: the connection registry, the FIFO request queue, the
//! account/chain reconciliation pass, and the persistence of both across
//! restarts. The relay itself, the cryptographic handshake, and signature
//! production are external collaborators behind the [`transport`] and
//! [`store`] contracts.

pub mod hub;
pub mod loopback;
pub mod queue;
pub mod registry;
pub mod session;
pub mod store;
pub mod transport;

pub use hub::{ConnectError, Hub, HubConfig, HubHandle, HubSnapshot, Notice};
pub use queue::{
    CallMethod, Outcome, PendingRequest, RequestKey, RequestQueue, RequestSet,
    METHOD_NOT_SUPPORTED,
};
pub use registry::{
    ChannelState, ConnectStatus, ConnectionRegistry, ConnectionView, PeerChannel,
};
pub use session::{
    ConnectionRecord, ConnectionSet, InvalidUri, PeerMeta, PeerSession, PeerUri,
};
pub use store::{JsonFileStore, MemoryStore, StoreError, WalletStore};
pub use transport::{
    ChannelEvent, ChannelEventKind, SessionTransport, TransportError, TransportFactory,
};
