use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

/// Connection identifier for one peer channel.
///
/// The string is opaque relay addressing (`wc:<topic>@<version>?...`); the
/// wallet never interprets anything past the scheme and topic. The uri is
/// immutable for the channel's lifetime and unique within the registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerUri(String);

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid peer uri `{raw}`: {reason}")]
pub struct InvalidUri {
    pub raw: String,
    pub reason: String,
}

impl PeerUri {
    pub fn parse(raw: &str) -> Result<Self, InvalidUri> {
        let trimmed = raw.trim();
        let parsed = Url::parse(trimmed).map_err(|err| InvalidUri {
            raw: raw.to_string(),
            reason: err.to_string(),
        })?;
        if parsed.scheme() != "wc" {
            return Err(InvalidUri {
                raw: raw.to_string(),
                reason: format!("unsupported scheme `{}`", parsed.scheme()),
            });
        }
        if parsed.path().is_empty() {
            return Err(InvalidUri {
                raw: raw.to_string(),
                reason: "missing topic".to_string(),
            });
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for PeerUri {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity a peer advertises during session negotiation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerMeta {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub icons: Vec<String>,
}

impl PeerMeta {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

/// Negotiated metadata for one channel: who the peer is and which
/// account/chain the wallet currently exposes to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerSession {
    #[serde(default)]
    pub peer_meta: PeerMeta,
    pub accounts: Vec<String>,
    pub chain_id: u64,
}

impl PeerSession {
    pub fn new(peer_meta: PeerMeta, account: impl Into<String>, chain_id: u64) -> Self {
        Self {
            peer_meta,
            accounts: vec![account.into()],
            chain_id,
        }
    }

    /// Whether the session already exposes the given account and chain.
    pub fn matches(&self, account: &str, chain_id: u64) -> bool {
        self.accounts.first().map(String::as_str) == Some(account) && self.chain_id == chain_id
    }

    /// Point the session at a new account/chain pair.
    pub fn retarget(&mut self, account: &str, chain_id: u64) {
        self.accounts = vec![account.to_string()];
        self.chain_id = chain_id;
    }
}

/// Durable projection of one peer channel. The live transport is never
/// persisted, only the last negotiated session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionRecord {
    pub uri: PeerUri,
    pub session: PeerSession,
}

pub const CONNECTION_SET_VERSION: u32 = 1;

/// The persisted connection list, in registry insertion order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionSet {
    pub version: u32,
    pub connections: Vec<ConnectionRecord>,
}

impl Default for ConnectionSet {
    fn default() -> Self {
        Self {
            version: CONNECTION_SET_VERSION,
            connections: Vec::new(),
        }
    }
}

impl ConnectionSet {
    pub fn new(connections: Vec<ConnectionRecord>) -> Self {
        Self {
            version: CONNECTION_SET_VERSION,
            connections,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_relay_uris() {
        let uri = PeerUri::parse("wc:f3a1b2@1?bridge=https%3A%2F%2Fbridge.example&key=ab").unwrap();
        assert_eq!(
            uri.as_str(),
            "wc:f3a1b2@1?bridge=https%3A%2F%2Fbridge.example&key=ab"
        );
    }

    #[test]
    fn trims_surrounding_whitespace() {
        let uri = PeerUri::parse("  wc:topic@1  ").unwrap();
        assert_eq!(uri.as_str(), "wc:topic@1");
    }

    #[test]
    fn rejects_foreign_schemes() {
        let err = PeerUri::parse("https://dapp.example").unwrap_err();
        assert!(err.reason.contains("unsupported scheme"));
    }

    #[test]
    fn rejects_missing_topic() {
        assert!(PeerUri::parse("wc:").is_err());
        assert!(PeerUri::parse("not a uri").is_err());
    }

    #[test]
    fn session_match_checks_primary_account_and_chain() {
        let session = PeerSession::new(PeerMeta::named("dapp"), "0xabc", 1);
        assert!(session.matches("0xabc", 1));
        assert!(!session.matches("0xabc", 137));
        assert!(!session.matches("0xdef", 1));
    }

    #[test]
    fn retarget_replaces_exposed_accounts() {
        let mut session = PeerSession::new(PeerMeta::named("dapp"), "0xabc", 1);
        session.retarget("0xdef", 137);
        assert_eq!(session.accounts, vec!["0xdef".to_string()]);
        assert_eq!(session.chain_id, 137);
    }

    #[test]
    fn connection_set_round_trips_through_json() {
        let set = ConnectionSet::new(vec![ConnectionRecord {
            uri: PeerUri::parse("wc:topic@1").unwrap(),
            session: PeerSession::new(PeerMeta::named("dapp"), "0xabc", 1),
        }]);
        let raw = serde_json::to_string(&set).unwrap();
        let restored: ConnectionSet = serde_json::from_str(&raw).unwrap();
        assert_eq!(restored, set);
    }
}
