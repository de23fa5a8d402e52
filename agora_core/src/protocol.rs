//! Wire protocol between the match authority and replicas.
//!
//! Messages are JSON-encoded and carried as the payload of a
//! [`PacketEnvelope`]. No per-generation state is ever sent: after
//! `MatchStart` replicas only send periodic reports, and the authority
//! only sends informational flags and stop notices.
//!
//! ```text
//!  authority                               replica
//!     │ ── MatchStart ─────────────────────▶ │
//!     │ ◀──────────── SnapshotReport (100) ─ │
//!     │ ◀──────────── ResourceReport (500) ─ │
//!     │ ◀──────────── HashReport    (1000) ─ │
//!     │ ── DesyncFlag ─────────────────────▶ │  (informational)
//!     │ ── Stop ───────────────────────────▶ │
//!     │ ◀──────────────────── FinalReport ── │
//! ```

use crate::config::{MatchConfig, ReportSchedule, StatsConfig, ValidationConfig};
use crate::engine::EngineConfig;
use crate::fixed::Resource;
use crate::grid::CellPlacement;
use crate::policy::{PolicyId, PolicyRecord};
use crate::simulation::Termination;
use crate::stats::Snapshot;
use agora_env::{NodeId, PacketEnvelope};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Errors encoding or decoding wire messages.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Failed to encode message: {0}")]
    Encode(String),

    #[error("Failed to decode message: {0}")]
    Decode(String),
}

/// Identifier of one match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MatchId(pub Uuid);

impl MatchId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Deterministic id for simulation.
    pub fn from_seed(seed: u64) -> Self {
        let mut bytes = [0u8; 16];
        bytes[0..8].copy_from_slice(&seed.to_be_bytes());
        bytes[8..16].copy_from_slice(&seed.wrapping_mul(0x9e3779b97f4a7c15).to_le_bytes());
        Self(Uuid::from_bytes(bytes))
    }
}

impl Default for MatchId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// SHA-256 of a grid's canonical encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateHash(pub [u8; 32]);

impl fmt::Display for StateHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0[..8] {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

// ============================================================================
// MESSAGES
// ============================================================================

/// Authority -> replica: everything needed to run the match locally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchStart {
    pub match_id: MatchId,
    pub seed: u32,
    pub grid_width: u32,
    pub grid_height: u32,
    pub policies: Vec<PolicyRecord>,
    pub placement_density: f64,
    pub placements: Option<Vec<CellPlacement>>,
    pub starting_resource: Resource,
    pub generation_limit: u64,
    pub engine: EngineConfig,
    pub stats: StatsConfig,
    pub reports: ReportSchedule,
}

impl MatchStart {
    pub fn from_config(match_id: MatchId, config: &MatchConfig) -> Self {
        Self {
            match_id,
            seed: config.seed,
            grid_width: config.width,
            grid_height: config.height,
            policies: config.policies.clone(),
            placement_density: config.placement_density,
            placements: config.placements.clone(),
            starting_resource: config.starting_resource,
            generation_limit: config.generation_limit,
            engine: config.engine.clone(),
            stats: config.stats.clone(),
            reports: config.reports.clone(),
        }
    }

    /// Rebuilds the replica-side configuration. Validation settings are
    /// authority-only and take their defaults.
    pub fn to_config(&self) -> MatchConfig {
        MatchConfig {
            seed: self.seed,
            width: self.grid_width,
            height: self.grid_height,
            policies: self.policies.clone(),
            placement_density: self.placement_density,
            placements: self.placements.clone(),
            starting_resource: self.starting_resource,
            generation_limit: self.generation_limit,
            engine: self.engine.clone(),
            stats: self.stats.clone(),
            reports: self.reports.clone(),
            validation: ValidationConfig::default(),
        }
    }
}

/// Replica -> authority: scalar check input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceReport {
    pub match_id: MatchId,
    pub generation: u64,
    pub total_resource: Resource,
    pub per_policy_totals: BTreeMap<PolicyId, Resource>,
}

/// Replica -> authority: checksum check input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashReport {
    pub match_id: MatchId,
    pub generation: u64,
    pub state_hash: StateHash,
}

/// Replica -> authority: a sampled snapshot, kept for diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotReport {
    pub match_id: MatchId,
    pub snapshot: Snapshot,
}

/// Replica -> authority: the replica has stopped advancing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalReport {
    pub match_id: MatchId,
    pub generation: u64,
    pub state_hash: StateHash,
    pub final_snapshot: Snapshot,
    pub termination: Termination,
}

impl FinalReport {
    pub fn extinct(&self) -> bool {
        self.termination == Termination::Extinct
    }
}

/// Which check detected a divergence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckKind {
    Scalar,
    Checksum,
    Final,
}

impl fmt::Display for CheckKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CheckKind::Scalar => "scalar",
            CheckKind::Checksum => "checksum",
            CheckKind::Final => "final",
        };
        f.write_str(name)
    }
}

/// Authority -> replica: informational, carries no corrective payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesyncFlag {
    pub match_id: MatchId,
    pub replica_id: NodeId,
    pub generation: u64,
    pub check: CheckKind,
}

/// Why the authority stopped a match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Only one replica is still connected
    AllButOneDisconnected,
    /// The authority gave up on the match
    Aborted,
}

/// Authority -> replica: end the match at the next generation boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopNotice {
    pub match_id: MatchId,
    pub reason: StopReason,
}

/// All protocol messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    MatchStart(MatchStart),
    ResourceReport(ResourceReport),
    HashReport(HashReport),
    SnapshotReport(SnapshotReport),
    FinalReport(FinalReport),
    DesyncFlag(DesyncFlag),
    Stop(StopNotice),
}

impl Message {
    /// Match this message belongs to.
    pub fn match_id(&self) -> MatchId {
        match self {
            Message::MatchStart(m) => m.match_id,
            Message::ResourceReport(m) => m.match_id,
            Message::HashReport(m) => m.match_id,
            Message::SnapshotReport(m) => m.match_id,
            Message::FinalReport(m) => m.match_id,
            Message::DesyncFlag(m) => m.match_id,
            Message::Stop(m) => m.match_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Message::MatchStart(_) => "match_start",
            Message::ResourceReport(_) => "resource_report",
            Message::HashReport(_) => "hash_report",
            Message::SnapshotReport(_) => "snapshot_report",
            Message::FinalReport(_) => "final_report",
            Message::DesyncFlag(_) => "desync_flag",
            Message::Stop(_) => "stop",
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(bytes).map_err(|e| ProtocolError::Decode(e.to_string()))
    }

    /// Wraps the encoded message in a transport envelope.
    pub fn to_envelope(&self, timestamp_ms: u64) -> Result<PacketEnvelope, ProtocolError> {
        Ok(PacketEnvelope::new(self.encode()?, timestamp_ms))
    }

    pub fn from_envelope(envelope: &PacketEnvelope) -> Result<Self, ProtocolError> {
        Self::decode(&envelope.payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_match_start_carries_config() {
        let config = MatchConfig {
            seed: 1234,
            width: 8,
            height: 6,
            policies: vec![PolicyRecord::new(1, "a").with_openness(0.5)],
            placement_density: 0.25,
            generation_limit: 900,
            ..MatchConfig::default()
        };
        let start = MatchStart::from_config(MatchId::from_seed(1), &config);
        let msg = Message::MatchStart(start);

        let decoded = Message::decode(&msg.encode().unwrap()).unwrap();
        let Message::MatchStart(start) = decoded else {
            panic!("wrong variant");
        };
        let rebuilt = start.to_config();
        assert_eq!(rebuilt.seed, 1234);
        assert_eq!(rebuilt.width, 8);
        assert_eq!(rebuilt.generation_limit, 900);
        assert_eq!(rebuilt.policies, config.policies);
    }

    #[test]
    fn test_type_tag_on_the_wire() {
        let msg = Message::Stop(StopNotice {
            match_id: MatchId::from_seed(2),
            reason: StopReason::AllButOneDisconnected,
        });
        let json = String::from_utf8(msg.encode().unwrap()).unwrap();
        assert!(json.contains(r#""type":"stop""#));
        assert!(json.contains(r#""reason":"all_but_one_disconnected""#));
        assert_eq!(msg.kind(), "stop");
        assert_eq!(msg.match_id(), MatchId::from_seed(2));
    }

    #[test]
    fn test_envelope_wrapping() {
        let mut totals = BTreeMap::new();
        totals.insert(PolicyId(3), Resource::from_raw(12_345));
        let msg = Message::ResourceReport(ResourceReport {
            match_id: MatchId::from_seed(9),
            generation: 500,
            total_resource: Resource::from_raw(12_345),
            per_policy_totals: totals,
        });

        let envelope = msg.to_envelope(77).unwrap();
        assert_eq!(envelope.timestamp_ms, 77);
        assert_eq!(Message::from_envelope(&envelope).unwrap(), msg);
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(matches!(Message::decode(b"{\"type\":\"nope\"}"), Err(ProtocolError::Decode(_))));
        assert!(Message::decode(b"\xff\x00").is_err());
    }

    #[test]
    fn test_match_id_from_seed_is_stable() {
        assert_eq!(MatchId::from_seed(5), MatchId::from_seed(5));
        assert_ne!(MatchId::from_seed(5), MatchId::from_seed(6));
        assert_eq!(MatchId::from_seed(5).to_string().len(), 8);
    }
}
