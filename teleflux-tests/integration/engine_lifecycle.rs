//! Request validation, concurrent streams, and shutdown.

use std::time::Duration;

use futures::StreamExt;
use teleflux_core::protocol::{DcId, MessageRef};
use teleflux_core::{LocatorError, RangeRequest, StreamError, StreamStatus, TelefluxError};
use teleflux_sim::{FetchBehavior, SimulatedCluster};

use crate::support::drain;

const MIB: usize = 1024 * 1024;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_message_is_a_user_error() {
        let cluster = SimulatedCluster::builder().healthy_bots(1, DcId(4)).build();
        let engine = cluster.engine();

        let missing = MessageRef::new(-100_777, 404);
        let Err(error) = engine.open_stream(RangeRequest::new(missing, 0, 10)).await else {
            panic!("expected missing message to fail");
        };

        assert!(matches!(
            error,
            TelefluxError::Locator(LocatorError::NotFound { .. })
        ));
        assert!(error.is_user_error());
        assert_eq!(error.user_message(), "File -100777/404 not found");
        assert_eq!(engine.registry().active_count(), 0);
    }

    #[tokio::test]
    async fn test_unsatisfiable_ranges_are_rejected() {
        let cluster = SimulatedCluster::builder().healthy_bots(1, DcId(4)).build();
        let (message, data) = cluster.add_seeded_file(1, DcId(4), MIB);
        let engine = cluster.engine();
        let len = data.len() as u64;

        for (from, until) in [(0, len), (500, 100)] {
            let Err(error) = engine.open_stream(RangeRequest::new(message, from, until)).await
            else {
                panic!("range {from}-{until} should be rejected");
            };
            assert!(matches!(
                error,
                TelefluxError::Stream(StreamError::InvalidRange { .. })
            ));
            assert!(error.is_user_error());
        }
        assert_eq!(cluster.bot(0).unwrap().stats().fetches(), 0);
    }

    #[tokio::test]
    async fn test_empty_pool_cannot_stream() {
        let cluster = SimulatedCluster::builder().build();
        let (message, _) = cluster.add_seeded_file(2, DcId(4), 1024);
        let engine = cluster.engine();

        let Err(error) = engine.open_stream(RangeRequest::new(message, 0, 10)).await else {
            panic!("expected an empty pool to fail");
        };
        assert!(matches!(error, TelefluxError::NoBots));
    }

    #[tokio::test]
    async fn test_concurrent_streams_each_get_their_own_bytes() {
        let cluster = SimulatedCluster::builder().healthy_bots(2, DcId(4)).build();
        let (first_message, first) = cluster.add_seeded_file(3, DcId(4), 2 * MIB);
        let (second_message, second) = cluster.add_seeded_file(4, DcId(4), 3 * MIB);
        let engine = cluster.engine();

        let a = engine
            .open_stream(RangeRequest::new(first_message, 0, first.len() as u64 - 1))
            .await
            .unwrap();
        let b = engine
            .open_stream(RangeRequest::new(second_message, 0, second.len() as u64 - 1))
            .await
            .unwrap();
        assert_eq!(engine.registry().active_count(), 2);

        let ((received_a, error_a), (received_b, error_b)) =
            tokio::join!(drain(a.bytes), drain(b.bytes));

        assert_eq!((error_a, error_b), (None, None));
        assert!(received_a == first);
        assert!(received_b == second);
    }

    #[tokio::test]
    async fn test_shutdown_stops_in_flight_streams() {
        let cluster = SimulatedCluster::builder()
            .bot(|bot| bot.home_dc(DcId(4)).fetch_behavior(FetchBehavior::Hang))
            .tune(|config| config.streaming.fetch_timeout = Duration::from_secs(60))
            .build();
        let (message, _) = cluster.add_seeded_file(5, DcId(4), MIB);
        let engine = cluster.engine();
        engine.start();

        let opened = engine
            .open_stream(RangeRequest::new(message, 0, 1023))
            .await
            .unwrap();
        let id = opened.id.clone();
        let mut bytes = opened.bytes;

        tokio::time::timeout(Duration::from_secs(1), engine.shutdown())
            .await
            .expect("shutdown should not wait on hung fetches");

        assert_eq!(
            bytes.next().await,
            Some(Err(StreamError::ProducerFailed))
        );
        assert!(bytes.next().await.is_none());
        assert_eq!(
            engine.registry().stream(&id).unwrap().status,
            StreamStatus::Error
        );
    }
}
