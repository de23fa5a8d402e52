//! Core environment context trait for Agora replicas and authorities.

use async_trait::async_trait;
use std::future::Future;
use std::time::{Duration, SystemTime};

/// The central interface for Environment Interaction.
///
/// Abstracts the "real world" so the replica runtime and the match
/// authority can run in both production (tokio) and simulation
/// (virtual clock) environments.
///
/// # Implementations
///
/// - **Production**: `TokioContext` - wraps `tokio::time`
/// - **Simulation**: `SimContext` - manually advanced virtual clock
///
/// # Determinism
///
/// The context only ever influences *when* things happen (report
/// deadlines, persistence backoff), never *what* the update engine
/// computes. Simulation results depend on the match seed alone.
#[async_trait]
pub trait AgoraContext: Send + Sync + 'static {
    /// Returns the current monotonic time since context creation.
    ///
    /// Used for report silence deadlines and retry backoff.
    /// In simulation, this is the virtual clock time.
    fn now(&self) -> Duration;

    /// Returns the wall-clock time for match records.
    ///
    /// In simulation, this is derived from virtual clock + epoch offset.
    fn system_time(&self) -> SystemTime;

    /// Suspends execution for the given duration.
    ///
    /// In production: wraps `tokio::time::sleep`
    /// In simulation: advances the virtual clock
    async fn sleep(&self, duration: Duration);

    /// Spawns a background task.
    fn spawn<F>(&self, name: &str, future: F)
    where
        F: Future<Output = ()> + Send + 'static;

    /// Returns the context's seed (for logging/debugging).
    ///
    /// In production, returns 0 (not seeded).
    /// In simulation, returns the harness seed.
    fn seed(&self) -> u64;
}
