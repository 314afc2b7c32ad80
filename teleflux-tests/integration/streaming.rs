//! End-to-end range streaming against the simulated backend.

use std::collections::BTreeMap;
use std::time::Duration;

use futures::StreamExt;
use teleflux_core::protocol::{BotIndex, DcId};
use teleflux_core::{RangePlan, RangeRequest, StreamRequest, StreamStatus};
use teleflux_sim::SimulatedCluster;
use tokio_util::sync::CancellationToken;

use crate::support::{drain, eventually};

const KIB: usize = 1024;
const MIB: usize = 1024 * KIB;
