//! Teleflux Simulation - in-memory protocol backend for deterministic tests.
//!
//! Provides mock bots that implement the engine's protocol traits over a
//! shared [`MediaStore`], with configurable latency, seeded jitter, bandwidth
//! caps and failure modes, plus a [`SimulatedCluster`] builder that wires
//! them into an [`Engine`](teleflux_core::Engine).
//!
//! ```rust,no_run
//! use teleflux_core::{DcId, RangeRequest};
//! use teleflux_sim::SimulatedCluster;
//!
//! # async fn demo() -> Result<(), teleflux_core::TelefluxError> {
//! let cluster = SimulatedCluster::builder().healthy_bots(2, DcId(4)).build();
//! let (message, _) = cluster.add_seeded_file(1, DcId(4), 1 << 20);
//! let engine = cluster.engine();
//! let opened = engine.open_stream(RangeRequest::new(message, 0, 1023)).await?;
//! # drop(opened);
//! # Ok(())
//! # }
//! ```

pub mod bot;
pub mod cluster;
pub mod sink;
pub mod store;

pub use bot::{BotStats, FetchBehavior, MockBot, MockBotBuilder, MockSession};
pub use cluster::{SimulatedCluster, SimulatedClusterBuilder};
pub use sink::MemoryStatsSink;
pub use store::{MediaStore, StoredFile, seeded_content};
