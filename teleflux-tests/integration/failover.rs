//! Per-chunk retry, fallback bots, and cross-datacenter session setup.

use teleflux_core::protocol::{BotIndex, DcId};
use teleflux_core::{RangeRequest, StreamError, StreamStatus};
use teleflux_sim::{FetchBehavior, SimulatedCluster};

use crate::support::drain;

const KIB: usize = 1024;
