//! Read-ahead bounds and downstream disconnects.

use std::time::Duration;

use futures::StreamExt;
use teleflux_core::protocol::{BotIndex, DcId};
use teleflux_core::{RangeRequest, StreamStatus};
use teleflux_sim::{FetchBehavior, SimulatedCluster};
use tokio_util::sync::CancellationToken;

use crate::support::{drain, eventually, take_pieces};

const KIB: usize = 1024;
const MIB: usize = 1024 * KIB;
