//! Replica Runtime - runs one match locally and reports to the authority.
//!
//! This module is the integration layer between the pure [`Simulation`]
//! and the environment abstraction ([`AgoraContext`] + [`MessageTransport`]).
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       ReplicaAgent                          │
//! │  ┌──────────────────────────────────────────────────────┐   │
//! │  │ inbox (polled only at generation boundaries)         │   │
//! │  │  • MatchStart  -> build Simulation                   │   │
//! │  │  • DesyncFlag  -> remember, keep running             │   │
//! │  │  • Stop        -> finish at this boundary            │   │
//! │  └──────────────────────────────────────────────────────┘   │
//! │                              │                              │
//! │  ┌───────────────────────────▼──────────────────────────┐   │
//! │  │ Simulation::step  (one whole generation, atomic)     │   │
//! │  └───────────────────────────┬──────────────────────────┘   │
//! │                              ▼                              │
//! │     SnapshotReport / ResourceReport / HashReport / Final    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use agora_core::replica_runtime::{ReplicaAgent, ReplicaConfig};
//! use agora_env::TokioContext;
//!
//! let ctx = TokioContext::shared();
//! let mut replica = ReplicaAgent::new(ctx, network, authority_id, ReplicaConfig::default());
//!
//! // Waits for MatchStart, then runs to the end
//! let termination = replica.run().await?;
//! ```

use crate::config::ReportSchedule;
use crate::engine::GenerationOutcome;
use crate::protocol::{
    DesyncFlag, FinalReport, HashReport, MatchId, MatchStart, Message, ProtocolError,
    ResourceReport, SnapshotReport, StateHash, StopReason,
};
use crate::simulation::{MatchError, Simulation, Termination};
use agora_env::{AgoraContext, EnvError, MessageTransport, NodeId};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors that end a replica's run.
#[derive(Debug, Error)]
pub enum ReplicaError {
    #[error("Transport failure: {0}")]
    Env(#[from] EnvError),

    #[error("Protocol failure: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Rejected match configuration: {0}")]
    Match(#[from] MatchError),

    #[error("Channel closed before the match started")]
    NotStarted,
}

/// Configuration for a replica.
#[derive(Debug, Clone)]
pub struct ReplicaConfig {
    /// Replica's logical name (for logging)
    pub name: String,

    /// Pause between generations in [`ReplicaAgent::run`] (default: 10 ms)
    pub generation_pause: Duration,
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        Self {
            name: "agora-replica".to_string(),
            generation_pause: Duration::from_millis(10),
        }
    }
}

/// One participant's local execution of a match.
///
/// Generic over the context and network implementations, so the same
/// replica code runs in production (tokio) or in the simulation harness.
pub struct ReplicaAgent<Ctx, Net>
where
    Ctx: AgoraContext,
    Net: MessageTransport,
{
    /// Node identifier
    pub node_id: NodeId,

    /// Environment context
    pub context: Arc<Ctx>,

    /// Network interface
    pub network: Arc<Net>,

    /// Configuration
    pub config: ReplicaConfig,

    /// Where reports go
    authority: NodeId,

    match_id: Option<MatchId>,
    simulation: Option<Simulation>,
    reports: ReportSchedule,

    /// Last desync flag received (informational only)
    desync: Option<DesyncFlag>,

    /// Stop requested by the authority, honoured at the next boundary
    stop: Option<StopReason>,

    final_sent: bool,
    messages_sent: u64,
}

impl<Ctx, Net> ReplicaAgent<Ctx, Net>
where
    Ctx: AgoraContext,
    Net: MessageTransport,
{
    /// Creates an idle replica waiting for `MatchStart`.
    pub fn new(context: Arc<Ctx>, network: Arc<Net>, authority: NodeId, config: ReplicaConfig) -> Self {
        Self {
            node_id: network.local_id(),
            context,
            network,
            config,
            authority,
            match_id: None,
            simulation: None,
            reports: ReportSchedule::default(),
            desync: None,
            stop: None,
            final_sent: false,
            messages_sent: 0,
        }
    }

    fn now_ms(&self) -> u64 {
        self.context.now().as_millis() as u64
    }

    async fn send(&mut self, message: Message) -> Result<(), ReplicaError> {
        let envelope = message.to_envelope(self.now_ms())?;
        self.network.send(self.authority, envelope).await?;
        self.messages_sent += 1;
        Ok(())
    }

    /// Builds generation 0 from the authority's configuration.
    pub async fn start(&mut self, start: &MatchStart) -> Result<(), ReplicaError> {
        let simulation = Simulation::new(start.to_config())?;
        info!(
            replica = %self.node_id,
            match_id = %start.match_id,
            alive = simulation.grid().alive_count(),
            "Match started"
        );

        self.match_id = Some(start.match_id);
        self.reports = start.reports.clone();
        self.simulation = Some(simulation);
        self.desync = None;
        self.stop = None;
        self.final_sent = false;

        if self.reports.forward_snapshots {
            self.send_snapshot().await?;
        }
        if self.simulation.as_ref().map_or(false, |s| s.is_finished()) {
            self.finish().await?;
        }
        Ok(())
    }

    /// Drains delivered messages. Called only between generations.
    pub async fn poll_inbox(&mut self) -> Result<(), ReplicaError> {
        while let Some((sender, envelope)) = self.network.try_recv() {
            let message = match Message::from_envelope(&envelope) {
                Ok(m) => m,
                Err(e) => {
                    warn!(replica = %self.node_id, from = %sender, error = %e, "Dropping undecodable message");
                    continue;
                }
            };
            self.handle(message).await?;
        }
        Ok(())
    }

    async fn handle(&mut self, message: Message) -> Result<(), ReplicaError> {
        match message {
            Message::MatchStart(start) => {
                if self.simulation.is_none() || self.final_sent {
                    self.start(&start).await?;
                }
            }
            Message::DesyncFlag(flag) if Some(flag.match_id) == self.match_id => {
                if flag.replica_id == self.node_id {
                    warn!(
                        replica = %self.node_id,
                        generation = flag.generation,
                        check = %flag.check,
                        "Authority flagged this replica as desynchronized"
                    );
                    self.desync = Some(flag);
                }
            }
            Message::Stop(notice) if Some(notice.match_id) == self.match_id => {
                info!(replica = %self.node_id, reason = ?notice.reason, "Stop requested");
                self.stop = Some(notice.reason);
            }
            other => {
                debug!(replica = %self.node_id, kind = other.kind(), "Ignoring message");
            }
        }
        Ok(())
    }

    /// Advances one generation and sends the reports that fall due.
    ///
    /// Returns `None` when there is nothing to advance (not started, or finished).
    pub async fn tick(&mut self) -> Result<Option<GenerationOutcome>, ReplicaError> {
        self.poll_inbox().await?;
        if self.final_sent {
            return Ok(None);
        }

        let Some(simulation) = self.simulation.as_mut() else {
            return Ok(None);
        };

        if self.stop.is_some() {
            simulation.stop();
            self.finish().await?;
            return Ok(None);
        }

        let Some(outcome) = simulation.step() else {
            self.finish().await?;
            return Ok(None);
        };
        let finished = simulation.is_finished();

        self.send_due_reports(outcome.generation).await?;
        if finished {
            self.finish().await?;
        }
        Ok(Some(outcome))
    }

    async fn send_due_reports(&mut self, generation: u64) -> Result<(), ReplicaError> {
        let Some(simulation) = self.simulation.as_ref() else {
            return Ok(());
        };
        let Some(match_id) = self.match_id else {
            return Ok(());
        };

        let mut outgoing = Vec::new();
        if self.reports.forward_snapshots && simulation.config().stats.is_sample(generation) {
            outgoing.push(Message::SnapshotReport(SnapshotReport {
                match_id,
                snapshot: simulation.current_snapshot(),
            }));
        }
        if self.reports.resource_due(generation) {
            outgoing.push(Message::ResourceReport(ResourceReport {
                match_id,
                generation,
                total_resource: simulation.grid().total_resource(),
                per_policy_totals: simulation.current_snapshot().policy_totals(),
            }));
        }
        if self.reports.hash_due(generation) {
            outgoing.push(Message::HashReport(HashReport {
                match_id,
                generation,
                state_hash: StateHash(simulation.state_hash()),
            }));
        }

        for message in outgoing {
            self.send(message).await?;
        }
        Ok(())
    }

    async fn send_snapshot(&mut self) -> Result<(), ReplicaError> {
        let (Some(simulation), Some(match_id)) = (self.simulation.as_ref(), self.match_id) else {
            return Ok(());
        };
        let message = Message::SnapshotReport(SnapshotReport {
            match_id,
            snapshot: simulation.current_snapshot(),
        });
        self.send(message).await
    }

    /// Sends the final report once.
    pub async fn finish(&mut self) -> Result<(), ReplicaError> {
        if self.final_sent {
            return Ok(());
        }
        let (Some(simulation), Some(match_id)) = (self.simulation.as_ref(), self.match_id) else {
            return Ok(());
        };

        let report = FinalReport {
            match_id,
            generation: simulation.generation(),
            state_hash: StateHash(simulation.state_hash()),
            final_snapshot: simulation.current_snapshot(),
            termination: simulation.termination().unwrap_or(Termination::Stopped),
        };
        info!(
            replica = %self.node_id,
            generation = report.generation,
            termination = ?report.termination,
            hash = %report.state_hash,
            "Replica finished"
        );

        self.send(Message::FinalReport(report)).await?;
        self.final_sent = true;
        Ok(())
    }

    /// Waits for `MatchStart`, then runs the match to its end.
    pub async fn run(&mut self) -> Result<Termination, ReplicaError> {
        while self.simulation.is_none() {
            let (_, envelope) = self.network.recv().await.ok_or(ReplicaError::NotStarted)?;
            match Message::from_envelope(&envelope) {
                Ok(message) => self.handle(message).await?,
                Err(e) => warn!(replica = %self.node_id, error = %e, "Dropping undecodable message"),
            }
        }

        while !self.final_sent {
            self.tick().await?;
            self.context.sleep(self.config.generation_pause).await;
        }
        Ok(self.termination().unwrap_or(Termination::Stopped))
    }

    pub fn match_id(&self) -> Option<MatchId> {
        self.match_id
    }

    pub fn simulation(&self) -> Option<&Simulation> {
        self.simulation.as_ref()
    }

    /// Mutable access to the local run (fault injection in tests).
    pub fn simulation_mut(&mut self) -> Option<&mut Simulation> {
        self.simulation.as_mut()
    }

    pub fn generation(&self) -> u64 {
        self.simulation.as_ref().map_or(0, |s| s.generation())
    }

    pub fn termination(&self) -> Option<Termination> {
        self.simulation.as_ref().and_then(|s| s.termination())
    }

    pub fn is_finished(&self) -> bool {
        self.final_sent
    }

    pub fn desync_flag(&self) -> Option<&DesyncFlag> {
        self.desync.as_ref()
    }

    pub fn messages_sent(&self) -> u64 {
        self.messages_sent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MatchConfig;
    use crate::fixed::Resource;
    use crate::policy::PolicyRecord;
    use agora_env::{PacketEnvelope, TokioContext};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// In-memory transport that records everything sent.
    struct LoopbackNet {
        id: NodeId,
        inbox: Mutex<VecDeque<(NodeId, PacketEnvelope)>>,
        sent: Mutex<Vec<(NodeId, Message)>>,
    }

    impl LoopbackNet {
        fn new(id: NodeId) -> Self {
            Self {
                id,
                inbox: Mutex::new(VecDeque::new()),
                sent: Mutex::new(Vec::new()),
            }
        }

        fn deliver(&self, from: NodeId, message: &Message) {
            let envelope = message.to_envelope(0).unwrap();
            self.inbox.lock().unwrap().push_back((from, envelope));
        }

        fn sent_kinds(&self) -> Vec<&'static str> {
            self.sent.lock().unwrap().iter().map(|(_, m)| m.kind()).collect()
        }
    }

    #[async_trait]
    impl MessageTransport for LoopbackNet {
        async fn send(&self, target: NodeId, packet: PacketEnvelope) -> Result<(), EnvError> {
            let message = Message::from_envelope(&packet).map_err(|e| EnvError::serialization(e.to_string()))?;
            self.sent.lock().unwrap().push((target, message));
            Ok(())
        }

        async fn recv(&self) -> Option<(NodeId, PacketEnvelope)> {
            self.inbox.lock().unwrap().pop_front()
        }

        fn try_recv(&self) -> Option<(NodeId, PacketEnvelope)> {
            self.inbox.lock().unwrap().pop_front()
        }

        fn local_id(&self) -> NodeId {
            self.id
        }
    }

    fn start_message(limit: u64) -> MatchStart {
        let config = MatchConfig {
            seed: 4,
            width: 12,
            height: 12,
            policies: vec![PolicyRecord::new(1, "saver").with_accumulation(1.0).with_investment(1.0)],
            placement_density: 0.4,
            starting_resource: Resource::from_units(60),
            generation_limit: limit,
            ..MatchConfig::default()
        };
        MatchStart::from_config(MatchId::from_seed(1), &config)
    }

    #[test]
    fn test_replica_config_default() {
        let config = ReplicaConfig::default();
        assert_eq!(config.generation_pause, Duration::from_millis(10));
    }

    #[tokio::test]
    async fn test_replica_runs_and_reports_on_schedule() {
        let authority = NodeId::from_seed(0);
        let net = Arc::new(LoopbackNet::new(NodeId::from_seed(1)));
        net.deliver(authority, &Message::MatchStart(start_message(1_000)));

        let mut replica = ReplicaAgent::new(TokioContext::shared(), net.clone(), authority, ReplicaConfig {
            generation_pause: Duration::ZERO,
            ..ReplicaConfig::default()
        });
        let termination = replica.run().await.unwrap();

        assert_eq!(termination, Termination::GenerationLimit);
        assert_eq!(replica.generation(), 1_000);

        let kinds = net.sent_kinds();
        assert_eq!(kinds.iter().filter(|k| **k == "snapshot_report").count(), 11); // 0, 100, ..., 1000
        assert_eq!(kinds.iter().filter(|k| **k == "resource_report").count(), 2);
        assert_eq!(kinds.iter().filter(|k| **k == "hash_report").count(), 1);
        assert_eq!(kinds.last(), Some(&"final_report"));
        assert!(net.sent.lock().unwrap().iter().all(|(target, _)| *target == authority));
    }

    #[tokio::test]
    async fn test_stop_honoured_at_boundary() {
        let authority = NodeId::from_seed(0);
        let net = Arc::new(LoopbackNet::new(NodeId::from_seed(1)));
        net.deliver(authority, &Message::MatchStart(start_message(1_000)));

        let mut replica = ReplicaAgent::new(TokioContext::shared(), net.clone(), authority, ReplicaConfig::default());
        for _ in 0..10 {
            replica.tick().await.unwrap();
        }
        // The first tick consumed MatchStart and advanced once
        assert_eq!(replica.generation(), 10);

        net.deliver(
            authority,
            &Message::Stop(crate::protocol::StopNotice {
                match_id: MatchId::from_seed(1),
                reason: StopReason::AllButOneDisconnected,
            }),
        );
        assert!(replica.tick().await.unwrap().is_none());
        assert!(replica.is_finished());
        assert_eq!(replica.termination(), Some(Termination::Stopped));
        assert_eq!(replica.generation(), 10);
        assert_eq!(net.sent_kinds().last(), Some(&"final_report"));
    }

    #[tokio::test]
    async fn test_desync_flag_is_informational() {
        let authority = NodeId::from_seed(0);
        let me = NodeId::from_seed(1);
        let net = Arc::new(LoopbackNet::new(me));
        net.deliver(authority, &Message::MatchStart(start_message(50)));

        let mut replica = ReplicaAgent::new(TokioContext::shared(), net.clone(), authority, ReplicaConfig::default());
        replica.tick().await.unwrap();

        net.deliver(
            authority,
            &Message::DesyncFlag(DesyncFlag {
                match_id: MatchId::from_seed(1),
                replica_id: me,
                generation: 1,
                check: crate::protocol::CheckKind::Scalar,
            }),
        );
        let outcome = replica.tick().await.unwrap();
        assert!(outcome.is_some());
        assert!(replica.desync_flag().is_some());
        assert_eq!(replica.generation(), 2);
    }
}
