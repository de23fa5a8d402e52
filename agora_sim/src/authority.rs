//! Match Authority - distributes matches and validates replica reports.
//!
//! # Architecture
//!
//! ```text
//!   replicas ──reports──▶ AuthorityNode::pump ──Command──▶ match worker (one per match)
//!                               │                          owns ValidationSession
//!                               ◀──────── verdicts ─────────┘
//!   replicas ◀──DesyncFlag / Stop──┘
//! ```
//!
//! Each match has exactly one worker task owning its `ValidationSession`,
//! so reports for a match are applied by a single writer no matter how
//! many arrive at once. Callers talk to workers over an mpsc command
//! channel and get answers back on oneshot channels.

use agora_core::config::MatchConfig;
use agora_core::protocol::{DesyncFlag, MatchId, MatchStart, Message, ProtocolError, StopNotice, StopReason};
use agora_core::validation::{MatchAction, MatchOutcome, ReportRejection, SweepOutcome, ValidationSession, Verdict};
use agora_env::{AgoraContext, EnvError, MessageTransport, NodeId};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Authority-side failures. Report rejections are not errors.
#[derive(Debug, Error)]
pub enum AuthorityError {
    #[error("Unknown match {0}")]
    UnknownMatch(MatchId),

    #[error("Worker for match {0} has stopped")]
    WorkerGone(MatchId),

    #[error("Transport failure: {0}")]
    Env(#[from] EnvError),

    #[error("Protocol failure: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Read-only view of a session's progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStatus {
    pub complete: bool,
    pub aborted: bool,
    pub flagged: Vec<NodeId>,
    pub disconnected: Vec<NodeId>,
    pub rejected: u64,
}

enum Command {
    Report {
        from: NodeId,
        message: Message,
        now_ms: u64,
        reply: oneshot::Sender<Result<Vec<Verdict>, ReportRejection>>,
    },
    Sweep {
        now_ms: u64,
        reply: oneshot::Sender<SweepOutcome>,
    },
    Status {
        reply: oneshot::Sender<SessionStatus>,
    },
    Finalize {
        now_ms: u64,
        reply: oneshot::Sender<MatchOutcome>,
    },
}

async fn match_worker(mut session: ValidationSession, mut rx: mpsc::Receiver<Command>) {
    let match_id = session.match_id();
    debug!(%match_id, "Match worker started");

    while let Some(command) = rx.recv().await {
        match command {
            Command::Report { from, message, now_ms, reply } => {
                let _ = reply.send(session.handle(from, &message, now_ms));
            }
            Command::Sweep { now_ms, reply } => {
                let _ = reply.send(session.sweep(now_ms));
            }
            Command::Status { reply } => {
                let _ = reply.send(SessionStatus {
                    complete: session.is_complete(),
                    aborted: session.is_aborted(),
                    flagged: session.flagged(),
                    disconnected: session.disconnected(),
                    rejected: session.rejected_count(),
                });
            }
            Command::Finalize { now_ms, reply } => {
                let _ = reply.send(session.finalize(now_ms));
                break;
            }
        }
    }
    debug!(%match_id, "Match worker stopped");
}

// ============================================================================
// AUTHORITY SERVICE
// ============================================================================

/// Registry of match workers.
pub struct AuthorityService<Ctx: AgoraContext> {
    context: Arc<Ctx>,
    workers: BTreeMap<MatchId, mpsc::Sender<Command>>,
}

impl<Ctx: AgoraContext> AuthorityService<Ctx> {
    pub fn new(context: Arc<Ctx>) -> Self {
        Self {
            context,
            workers: BTreeMap::new(),
        }
    }

    fn now_ms(&self) -> u64 {
        self.context.now().as_millis() as u64
    }

    /// Spawns the worker that owns this match's session.
    pub fn open(&mut self, match_id: MatchId, config: &MatchConfig, replicas: &[NodeId]) {
        let session = ValidationSession::new(match_id, config, replicas, self.now_ms());
        let (tx, rx) = mpsc::channel(1024);
        self.context.spawn(&format!("match-{}", match_id), match_worker(session, rx));
        self.workers.insert(match_id, tx);
    }

    async fn call<T>(
        &self,
        match_id: MatchId,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, AuthorityError> {
        let worker = self.workers.get(&match_id).ok_or(AuthorityError::UnknownMatch(match_id))?;
        let (reply, answer) = oneshot::channel();
        worker
            .send(command(reply))
            .await
            .map_err(|_| AuthorityError::WorkerGone(match_id))?;
        answer.await.map_err(|_| AuthorityError::WorkerGone(match_id))
    }

    /// Hands one replica message to its match's worker.
    pub async fn report(
        &self,
        from: NodeId,
        message: Message,
    ) -> Result<Result<Vec<Verdict>, ReportRejection>, AuthorityError> {
        let now_ms = self.now_ms();
        self.call(message.match_id(), |reply| Command::Report { from, message, now_ms, reply })
            .await
    }

    pub async fn sweep(&self, match_id: MatchId) -> Result<SweepOutcome, AuthorityError> {
        let now_ms = self.now_ms();
        self.call(match_id, |reply| Command::Sweep { now_ms, reply }).await
    }

    pub async fn status(&self, match_id: MatchId) -> Result<SessionStatus, AuthorityError> {
        self.call(match_id, |reply| Command::Status { reply }).await
    }

    /// Closes the match; its worker exits afterwards.
    pub async fn finalize(&mut self, match_id: MatchId) -> Result<MatchOutcome, AuthorityError> {
        let now_ms = self.now_ms();
        let outcome = self.call(match_id, |reply| Command::Finalize { now_ms, reply }).await?;
        self.workers.remove(&match_id);
        Ok(outcome)
    }

    pub fn is_open(&self, match_id: MatchId) -> bool {
        self.workers.contains_key(&match_id)
    }
}

// ============================================================================
// AUTHORITY NODE
// ============================================================================

/// Counters kept by the authority node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AuthorityStats {
    pub reports_accepted: u64,
    pub reports_rejected: u64,
    pub undecodable: u64,
    pub desync_flags_sent: u64,
    pub unresolved_checks: u64,
    pub stops_sent: u64,
}

/// The authority as a network node.
pub struct AuthorityNode<Ctx, Net>
where
    Ctx: AgoraContext,
    Net: MessageTransport,
{
    pub node_id: NodeId,
    context: Arc<Ctx>,
    network: Arc<Net>,
    service: AuthorityService<Ctx>,
    matches: BTreeMap<MatchId, Vec<NodeId>>,
    stats: AuthorityStats,
}

impl<Ctx, Net> AuthorityNode<Ctx, Net>
where
    Ctx: AgoraContext,
    Net: MessageTransport,
{
    pub fn new(context: Arc<Ctx>, network: Arc<Net>) -> Self {
        Self {
            node_id: network.local_id(),
            service: AuthorityService::new(context.clone()),
            context,
            network,
            matches: BTreeMap::new(),
            stats: AuthorityStats::default(),
        }
    }

    fn now_ms(&self) -> u64 {
        self.context.now().as_millis() as u64
    }

    async fn send(&self, to: NodeId, message: &Message) -> Result<(), AuthorityError> {
        let envelope = message.to_envelope(self.now_ms())?;
        self.network.send(to, envelope).await?;
        Ok(())
    }

    /// Opens a match and sends `MatchStart` to every replica.
    pub async fn start_match(
        &mut self,
        match_id: MatchId,
        config: &MatchConfig,
        replicas: &[NodeId],
    ) -> Result<MatchStart, AuthorityError> {
        self.service.open(match_id, config, replicas);
        self.matches.insert(match_id, replicas.to_vec());

        let start = MatchStart::from_config(match_id, config);
        let message = Message::MatchStart(start.clone());
        for &replica in replicas {
            self.send(replica, &message).await?;
        }
        info!(%match_id, replicas = replicas.len(), seed = config.seed, "Match distributed");
        Ok(start)
    }

    /// Processes every delivered message.
    pub async fn pump(&mut self) -> Result<(), AuthorityError> {
        while let Some((from, envelope)) = self.network.try_recv() {
            let message = match Message::from_envelope(&envelope) {
                Ok(m) => m,
                Err(e) => {
                    self.stats.undecodable += 1;
                    warn!(replica = %from, error = %e, "Dropping undecodable report");
                    continue;
                }
            };

            let match_id = message.match_id();
            if !self.service.is_open(match_id) {
                self.stats.reports_rejected += 1;
                warn!(replica = %from, %match_id, "Report for unknown or closed match");
                continue;
            }

            let kind = message.kind();
            match self.service.report(from, message).await? {
                Ok(verdicts) => {
                    self.stats.reports_accepted += 1;
                    self.apply_verdicts(match_id, verdicts).await?;
                }
                Err(rejection) => {
                    self.stats.reports_rejected += 1;
                    warn!(%match_id, replica = %from, kind, %rejection, "Report rejected");
                }
            }
        }
        Ok(())
    }

    async fn apply_verdicts(&mut self, match_id: MatchId, verdicts: Vec<Verdict>) -> Result<(), AuthorityError> {
        for verdict in verdicts {
            match verdict {
                Verdict::Desync { replica, generation, check } => {
                    warn!(%match_id, %replica, generation, %check, "Replica desynchronized");
                    let flag = Message::DesyncFlag(DesyncFlag {
                        match_id,
                        replica_id: replica,
                        generation,
                        check,
                    });
                    self.send(replica, &flag).await?;
                    self.stats.desync_flags_sent += 1;
                }
                Verdict::Unresolved { generation, check } => {
                    info!(%match_id, generation, %check, "No reference value; check unresolved");
                    self.stats.unresolved_checks += 1;
                }
            }
        }
        Ok(())
    }

    /// Applies silence deadlines; sends stop notices when the match calls for it.
    pub async fn sweep(&mut self, match_id: MatchId) -> Result<SweepOutcome, AuthorityError> {
        let outcome = self.service.sweep(match_id).await?;
        self.apply_verdicts(match_id, outcome.verdicts.clone()).await?;

        if let Some(action) = outcome.action {
            let reason = match action {
                MatchAction::Stop(reason) => reason,
                MatchAction::Abort => StopReason::Aborted,
            };
            let notice = Message::Stop(StopNotice { match_id, reason });
            let replicas = self.matches.get(&match_id).cloned().unwrap_or_default();
            for replica in replicas {
                self.send(replica, &notice).await?;
                self.stats.stops_sent += 1;
            }
        }
        Ok(outcome)
    }

    pub async fn status(&self, match_id: MatchId) -> Result<SessionStatus, AuthorityError> {
        self.service.status(match_id).await
    }

    /// Closes the match and returns the authority's result.
    pub async fn finalize(&mut self, match_id: MatchId) -> Result<MatchOutcome, AuthorityError> {
        let outcome = self.service.finalize(match_id).await?;
        self.matches.remove(&match_id);
        Ok(outcome)
    }

    pub fn stats(&self) -> &AuthorityStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::SimContext;
    use crate::network::SimNetwork;
    use agora_core::config::ReportSchedule;
    use agora_core::policy::PolicyRecord;
    use agora_core::protocol::ResourceReport;
    use agora_core::{Resource, Simulation};

    fn config() -> MatchConfig {
        MatchConfig {
            seed: 3,
            width: 10,
            height: 10,
            policies: vec![PolicyRecord::new(1, "saver").with_accumulation(1.0).with_investment(1.0)],
            generation_limit: 1_000,
            ..MatchConfig::default()
        }
    }

    fn resource_report(match_id: MatchId, sim: &Simulation) -> Message {
        Message::ResourceReport(ResourceReport {
            match_id,
            generation: sim.generation(),
            total_resource: sim.grid().total_resource(),
            per_policy_totals: sim.grid().policy_totals(),
        })
    }

    #[tokio::test]
    async fn test_worker_is_single_writer_per_match() {
        let ctx = SimContext::shared(1);
        let mut service = AuthorityService::new(ctx.clone());
        let replicas = [NodeId::from_seed(1), NodeId::from_seed(2), NodeId::from_seed(3)];
        let match_id = MatchId::from_seed(1);
        service.open(match_id, &config(), &replicas);

        let mut sim = Simulation::new(config()).unwrap();
        for _ in 0..ReportSchedule::default().resource_interval {
            sim.step();
        }
        let honest = resource_report(match_id, &sim);
        let target = *sim.grid().iter().next().unwrap().0;
        sim.grid_mut().perturb_resource(target, Resource::from_units(3)).unwrap();
        let skewed = resource_report(match_id, &sim);

        assert_eq!(service.report(replicas[0], honest.clone()).await.unwrap(), Ok(vec![]));
        assert_eq!(service.report(replicas[1], skewed).await.unwrap(), Ok(vec![]));
        let verdicts = service.report(replicas[2], honest).await.unwrap().unwrap();
        assert_eq!(verdicts.len(), 1);
        assert!(matches!(verdicts[0], Verdict::Desync { replica, .. } if replica == replicas[1]));

        let status = service.status(match_id).await.unwrap();
        assert_eq!(status.flagged, vec![replicas[1]]);
        assert!(!status.complete);

        service.finalize(match_id).await.unwrap();
        assert!(!service.is_open(match_id));
        assert!(matches!(service.status(match_id).await, Err(AuthorityError::UnknownMatch(_))));
    }

    #[tokio::test]
    async fn test_rejection_is_not_an_error() {
        let ctx = SimContext::shared(1);
        let mut service = AuthorityService::new(ctx);
        let match_id = MatchId::from_seed(4);
        service.open(match_id, &config(), &[NodeId::from_seed(1)]);

        let stranger = NodeId::from_seed(99);
        let sim = Simulation::new(config()).unwrap();
        let result = service.report(stranger, resource_report(match_id, &sim)).await.unwrap();
        assert_eq!(result, Err(ReportRejection::UnknownReplica(stranger)));
        assert_eq!(service.status(match_id).await.unwrap().rejected, 1);
    }

    #[tokio::test]
    async fn test_node_distributes_match_start() {
        let ctx = SimContext::shared(1);
        let net = Arc::new(SimNetwork::new_stub(NodeId::from_seed(0)));
        let mut node = AuthorityNode::new(ctx, net);

        // Stub network's router is closed, so distribution fails cleanly
        let result = node
            .start_match(MatchId::from_seed(1), &config(), &[NodeId::from_seed(1)])
            .await;
        assert!(matches!(result, Err(AuthorityError::Env(_))));
    }
}
