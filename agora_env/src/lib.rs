//! Agora Environment Abstraction Layer
//!
//! This crate provides the "Sans-IO" abstraction that lets the Agora
//! replica runtime and match authority run in both **Production** (tokio)
//! and **Simulation** (virtual clock) environments.
//!
//! # Core Concept: The Reactor Pattern
//!
//! Replicas must stay bit-identical, so nothing inside the update engine may
//! read ambient state. Everything that touches the outside world goes
//! through this crate:
//! - Time (`now()`, `sleep()`)
//! - Network (`send()`, `recv()`, `try_recv()`)
//! - Task spawning (`spawn()`)
//!
//! The match seed itself travels inside the protocol, never through the
//! context, so a production replica and a simulated one produce the same
//! grid for the same `MatchStart`.
//!
//! # Example
//!
//! ```ignore
//! use agora_env::{AgoraContext, MessageTransport};
//!
//! async fn replica_loop<Ctx: AgoraContext, Net: MessageTransport>(
//!     ctx: &Ctx,
//!     net: &Net,
//! ) {
//!     loop {
//!         while let Some((from, packet)) = net.try_recv() {
//!             handle_control(from, packet);
//!         }
//!         step_generation();
//!         ctx.sleep(Duration::from_millis(10)).await;
//!     }
//! }
//! ```

mod context;
mod network;
mod types;
mod error;
mod tokio_impl;

pub use context::AgoraContext;
pub use network::{MessageTransport, NetworkController};
pub use types::{NodeId, PacketEnvelope};
pub use error::EnvError;
pub use tokio_impl::TokioContext;
