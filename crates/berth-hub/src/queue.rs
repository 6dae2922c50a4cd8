//! Pending-request queue: every inbound call a peer has asked the wallet to
//! resolve, in arrival order, until the user approves or rejects it.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::session::PeerUri;

/// Error string sent back to a peer whose call is outside the allow-list.
pub const METHOD_NOT_SUPPORTED: &str = "METHOD_NOT_SUPPORTED";

/// The only methods a peer may ask the wallet to perform. Anything else is
/// rejected at ingestion and never queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallMethod {
    #[serde(rename = "eth_sendTransaction")]
    SendTransaction,
    #[serde(rename = "gs_multi_send")]
    MultiSend,
    #[serde(rename = "personal_sign")]
    PersonalSign,
    #[serde(rename = "eth_sign")]
    EthSign,
}

impl CallMethod {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "eth_sendTransaction" => Some(Self::SendTransaction),
            "gs_multi_send" => Some(Self::MultiSend),
            "personal_sign" => Some(Self::PersonalSign),
            "eth_sign" => Some(Self::EthSign),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::SendTransaction => "eth_sendTransaction",
            Self::MultiSend => "gs_multi_send",
            Self::PersonalSign => "personal_sign",
            Self::EthSign => "eth_sign",
        }
    }
}

impl std::fmt::Display for CallMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Correlation key for one request. Peer-assigned ids are only unique within
/// their channel, so the uri is part of the key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestKey {
    pub uri: PeerUri,
    pub id: u64,
}

/// One inbound, unresolved call.
///
/// `account` and `chain_id` are frozen copies of the channel's session at
/// ingestion; a later account or chain switch does not redirect a request
/// already in flight. `params` pass through untouched to the signer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingRequest {
    pub uri: PeerUri,
    pub id: u64,
    pub method: CallMethod,
    pub account: String,
    pub chain_id: u64,
    pub params: Value,
}

impl PendingRequest {
    pub fn key(&self) -> RequestKey {
        RequestKey {
            uri: self.uri.clone(),
            id: self.id,
        }
    }
}

/// Shared result applied to a whole resolution batch. Callers must not mix
/// unrelated requests in one batch: every member gets this same outcome.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Approved(Value),
    Rejected(String),
}

pub const REQUEST_SET_VERSION: u32 = 1;

/// Persisted projection of the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestSet {
    pub version: u32,
    pub requests: Vec<PendingRequest>,
}

impl Default for RequestSet {
    fn default() -> Self {
        Self {
            version: REQUEST_SET_VERSION,
            requests: Vec::new(),
        }
    }
}

impl RequestSet {
    pub fn new(requests: Vec<PendingRequest>) -> Self {
        Self {
            version: REQUEST_SET_VERSION,
            requests,
        }
    }
}

/// Strict-FIFO queue of unresolved requests. Single-writer: all mutation
/// happens on the hub task.
#[derive(Default)]
pub struct RequestQueue {
    requests: Vec<PendingRequest>,
}

impl RequestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a request. Returns false (and keeps the queue unchanged) when
    /// the key is already present; the channel guarantees at-most-once
    /// delivery, so a duplicate means a misbehaving transport.
    pub fn ingest(&mut self, request: PendingRequest) -> bool {
        if self.contains(&request.key()) {
            tracing::warn!(
                target = "berth::queue",
                uri = %request.uri,
                id = request.id,
                "duplicate request id from channel, dropping"
            );
            return false;
        }
        tracing::debug!(
            target = "berth::queue",
            uri = %request.uri,
            id = request.id,
            method = %request.method,
            "request queued"
        );
        self.requests.push(request);
        true
    }

    /// Remove and return the requests matching `keys`, in the order the keys
    /// were given. Keys with no matching request are skipped silently, which
    /// makes double-resolution a no-op.
    pub fn resolve_many(&mut self, keys: &[RequestKey]) -> Vec<PendingRequest> {
        let mut removed = Vec::new();
        for key in keys {
            if let Some(pos) = self
                .requests
                .iter()
                .position(|r| r.uri == key.uri && r.id == key.id)
            {
                removed.push(self.requests.remove(pos));
            }
        }
        removed
    }

    pub fn contains(&self, key: &RequestKey) -> bool {
        self.requests
            .iter()
            .any(|r| r.uri == key.uri && r.id == key.id)
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PendingRequest> {
        self.requests.iter()
    }

    pub fn snapshot(&self) -> Vec<PendingRequest> {
        self.requests.clone()
    }

    pub fn to_set(&self) -> RequestSet {
        RequestSet::new(self.requests.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(uri: &str, id: u64) -> PendingRequest {
        PendingRequest {
            uri: PeerUri::parse(uri).unwrap(),
            id,
            method: CallMethod::SendTransaction,
            account: "0xabc".into(),
            chain_id: 1,
            params: json!([{ "to": "0xdef" }]),
        }
    }

    #[test]
    fn allow_list_matches_source_methods() {
        for raw in ["eth_sendTransaction", "gs_multi_send", "personal_sign", "eth_sign"] {
            let method = CallMethod::parse(raw).unwrap();
            assert_eq!(method.as_str(), raw);
        }
        assert!(CallMethod::parse("eth_signTypedData").is_none());
        assert!(CallMethod::parse("wallet_switchEthereumChain").is_none());
    }

    #[test]
    fn preserves_arrival_order() {
        let mut queue = RequestQueue::new();
        queue.ingest(request("wc:a@1", 2));
        queue.ingest(request("wc:b@1", 1));
        queue.ingest(request("wc:a@1", 1));
        let ids: Vec<(String, u64)> = queue
            .iter()
            .map(|r| (r.uri.as_str().to_string(), r.id))
            .collect();
        assert_eq!(
            ids,
            vec![
                ("wc:a@1".to_string(), 2),
                ("wc:b@1".to_string(), 1),
                ("wc:a@1".to_string(), 1),
            ]
        );
    }

    #[test]
    fn same_id_on_different_channels_coexists() {
        let mut queue = RequestQueue::new();
        assert!(queue.ingest(request("wc:a@1", 1)));
        assert!(queue.ingest(request("wc:b@1", 1)));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn duplicate_key_is_dropped() {
        let mut queue = RequestQueue::new();
        assert!(queue.ingest(request("wc:a@1", 1)));
        assert!(!queue.ingest(request("wc:a@1", 1)));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn resolve_many_removes_in_key_order_and_skips_missing() {
        let mut queue = RequestQueue::new();
        queue.ingest(request("wc:a@1", 1));
        queue.ingest(request("wc:a@1", 2));
        queue.ingest(request("wc:b@1", 5));

        let keys = vec![
            RequestKey {
                uri: PeerUri::parse("wc:b@1").unwrap(),
                id: 5,
            },
            RequestKey {
                uri: PeerUri::parse("wc:a@1").unwrap(),
                id: 99,
            },
            RequestKey {
                uri: PeerUri::parse("wc:a@1").unwrap(),
                id: 1,
            },
        ];
        let removed = queue.resolve_many(&keys);
        let removed_ids: Vec<u64> = removed.iter().map(|r| r.id).collect();
        assert_eq!(removed_ids, vec![5, 1]);
        assert_eq!(queue.len(), 1);
        assert!(queue.iter().all(|r| r.id == 2));
    }

    #[test]
    fn resolving_twice_is_a_no_op() {
        let mut queue = RequestQueue::new();
        queue.ingest(request("wc:a@1", 1));
        let key = RequestKey {
            uri: PeerUri::parse("wc:a@1").unwrap(),
            id: 1,
        };
        assert_eq!(queue.resolve_many(std::slice::from_ref(&key)).len(), 1);
        assert!(queue.resolve_many(std::slice::from_ref(&key)).is_empty());
        assert!(queue.is_empty());
    }

    #[test]
    fn request_set_round_trips_through_json() {
        let set = RequestSet::new(vec![request("wc:a@1", 1), request("wc:b@1", 2)]);
        let raw = serde_json::to_string(&set).unwrap();
        let restored: RequestSet = serde_json::from_str(&raw).unwrap();
        assert_eq!(restored, set);
    }
}
