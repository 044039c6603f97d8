//! # Heartbeat Module
//!
//! Monitored nodes keep one long-lived stream open to an aggregator and
//! write a [`Heartbeat`] on it every few seconds. The aggregator decodes
//! each one into a [`HeartbeatEvent`] and hands it to the tracker and the
//! event queue.
//!
//! ## Architecture
//!
//! ```text
//! mod.rs     — Heartbeat record and the event built from it
//! ingest.rs  — aggregator side: per-stream decode loop
//! service.rs — node side: periodic sender with reconnect
//! ```

pub mod ingest;
pub mod service;

use chrono::{DateTime, Utc};
use libp2p::PeerId;
use serde::{Deserialize, Serialize};

pub use ingest::HeartbeatIngestor;
pub use service::{HeartbeatConfig, HeartbeatService};

/// One self-report from a monitored node.
///
/// Only `head` and `height` carry meaning for the aggregator; the rest are
/// passed through to dashboards untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Heartbeat {
    /// Canonical head descriptor, see [`crate::chain::TipSet::key`].
    pub head: String,
    pub height: u64,
    pub nickname: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub miner_address: Option<String>,
    pub commit: String,
}

/// A decoded heartbeat plus who sent it and when it arrived.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatEvent {
    #[serde(with = "peer_id_str")]
    pub from_peer: PeerId,
    pub received_at: DateTime<Utc>,
    pub heartbeat: Heartbeat,
}

/// `PeerId` as its base58 string form.
pub(crate) mod peer_id_str {
    use libp2p::PeerId;
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(peer: &PeerId, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(peer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<PeerId, D::Error> {
        let raw = String::deserialize(d)?;
        raw.parse().map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn miner_address_is_optional_on_the_wire() {
        let json = r#"{"head":"{c1}","height":1,"nickname":"n1","commit":"abc"}"#;
        let hb: Heartbeat = serde_json::from_str(json).unwrap();
        assert!(hb.miner_address.is_none());

        let out = serde_json::to_value(&hb).unwrap();
        assert!(out.get("minerAddress").is_none());
    }

    #[test]
    fn event_carries_peer_as_string() {
        let peer = PeerId::random();
        let event = HeartbeatEvent {
            from_peer: peer,
            received_at: Utc::now(),
            heartbeat: Heartbeat {
                head: "{c1}".into(),
                height: 1,
                nickname: "n1".into(),
                miner_address: Some("t0101".into()),
                commit: "abc".into(),
            },
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["fromPeer"], peer.to_string());
        assert_eq!(json["heartbeat"]["minerAddress"], "t0101");

        let back: HeartbeatEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }
}
