//! Integration tests for Teleflux
//!
//! These tests drive the full engine (pool, pipeline, registry, speed test)
//! against the simulated backend and check the observable contracts: exact
//! bytes in order, bounded read-ahead, failover, and stream bookkeeping.

#[path = "integration/support.rs"]
mod support;

#[path = "integration/backpressure.rs"]
mod backpressure;
#[path = "integration/engine_lifecycle.rs"]
mod engine_lifecycle;
#[path = "integration/failover.rs"]
mod failover;
#[path = "integration/health_tracking.rs"]
mod health_tracking;
#[path = "integration/speed_test.rs"]
mod speed_test;
#[path = "integration/streaming.rs"]
mod streaming;
