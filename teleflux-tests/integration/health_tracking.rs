//! Bot health feedback: selection, chunk sizing, and stream history.

use std::collections::HashSet;
use std::time::Duration;

use teleflux_core::protocol::{BotIndex, DcId};
use teleflux_core::{HealthStatus, RangeRequest};
use teleflux_sim::SimulatedCluster;

use crate::support::{drain, eventually};

const KIB: usize = 1024;
const MIB: usize = 1024 * KIB;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_chunk_size_follows_measured_throughput() {
        let cluster = SimulatedCluster::builder().healthy_bots(1, DcId(4)).build();
        let (message, data) = cluster.add_seeded_file(1, DcId(4), 6 * MIB);
        let engine = cluster.engine();
        let bot = BotIndex::new(0);

        assert_eq!(engine.pool().chunk_size_for(bot), 512 * KIB);
        engine.pool().bot(bot).unwrap().health().fold_throughput(25.0);
        assert_eq!(engine.pool().chunk_size_for(bot), 2 * MIB);

        let opened = engine
            .open_stream(RangeRequest::new(message, 0, data.len() as u64 - 1))
            .await
            .unwrap();
        let id = opened.id.clone();
        let (received, error) = drain(opened.bytes).await;

        assert_eq!(error, None);
        assert!(received == data);
        let state = engine.registry().stream(&id).unwrap();
        assert_eq!(state.params.plan.chunk_size, 2 * MIB);
        assert_eq!(state.params.plan.part_count, 3);
        assert_eq!(cluster.bot(0).unwrap().stats().fetches(), 3);

        let folded = engine.pool().bot(bot).unwrap().health().avg_mbps();
        assert!((folded - (0.7 * 25.0 + 0.3 * state.avg_mbps)).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_new_streams_go_to_least_loaded_bot() {
        let cluster = SimulatedCluster::builder().healthy_bots(2, DcId(4)).build();
        let (message, _) = cluster.add_seeded_file(2, DcId(4), 4 * MIB);
        let engine = cluster.engine();

        let first = engine
            .open_stream(RangeRequest::new(message, 0, 1023))
            .await
            .unwrap();
        let second = engine
            .open_stream(RangeRequest::new(message, 0, 1023))
            .await
            .unwrap();

        let registry = engine.registry();
        assert_eq!(registry.stream(&first.id).unwrap().bot, BotIndex::new(0));
        assert_eq!(registry.stream(&second.id).unwrap().bot, BotIndex::new(1));

        let loads: Vec<_> = engine.bot_snapshot().iter().map(|bot| bot.current_load).collect();
        assert_eq!(loads, [1, 1]);

        drop(first);
        drop(second);
        let released = eventually(Duration::from_secs(1), || {
            engine.bot_snapshot().iter().all(|bot| bot.current_load == 0)
        })
        .await;
        assert!(released);
    }

    #[tokio::test]
    async fn test_failures_steer_selection_and_status() {
        let cluster = SimulatedCluster::builder().healthy_bots(2, DcId(4)).build();
        let (message, _) = cluster.add_seeded_file(3, DcId(4), MIB);
        let engine = cluster.engine();

        let flaky = engine.pool().bot(BotIndex::new(0)).unwrap().health();
        for _ in 0..6 {
            flaky.record_failure();
        }

        let opened = engine
            .open_stream(RangeRequest::new(message, 0, 1023))
            .await
            .unwrap();
        assert_eq!(
            engine.registry().stream(&opened.id).unwrap().bot,
            BotIndex::new(1)
        );

        let snapshot = engine.bot_snapshot();
        assert_eq!(snapshot[0].display_name, "Bot 1");
        assert_eq!(snapshot[0].status, HealthStatus::Degraded);
        assert_eq!(snapshot[1].status, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn test_recent_history_keeps_last_three_streams() {
        let cluster = SimulatedCluster::builder().healthy_bots(1, DcId(4)).build();
        let (message, _) = cluster.add_seeded_file(4, DcId(4), MIB);
        let engine = cluster.engine();

        let mut ids = Vec::new();
        for _ in 0..5 {
            let opened = engine
                .open_stream(RangeRequest::new(message, 0, 64 * KIB as u64 - 1))
                .await
                .unwrap();
            ids.push(opened.id.clone());
            let (_, error) = drain(opened.bytes).await;
            assert_eq!(error, None);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let registry = engine.registry().clone();
        assert!(eventually(Duration::from_secs(1), || registry.active_count() == 0).await);

        let recent: HashSet<_> = registry
            .snapshot()
            .recent
            .into_iter()
            .map(|state| state.id)
            .collect();
        let expected: HashSet<_> = ids[2..].iter().cloned().collect();
        assert_eq!(recent, expected);
        assert!(registry.stream(&ids[0]).is_none());

        let sink = cluster.sink().clone();
        assert!(eventually(Duration::from_secs(1), || sink.len() == 5).await);
    }

    #[tokio::test]
    async fn test_maintenance_prewarms_foreign_datacenters() {
        let cluster = SimulatedCluster::builder().healthy_bots(2, DcId(2)).build();
        let (message, _) = cluster.add_seeded_file(5, DcId(4), MIB);
        let engine = cluster.engine();
        engine.start();

        let pool = engine.pool().clone();
        let warmed = eventually(Duration::from_secs(1), || {
            pool.bots()
                .iter()
                .all(|bot| bot.sessions().session_count() == 3)
        })
        .await;
        assert!(warmed, "expected sessions for DC1, DC4 and DC5");

        let opened = engine
            .open_stream(RangeRequest::new(message, 0, 1023))
            .await
            .unwrap();
        drain(opened.bytes).await;
        assert_eq!(cluster.bot(0).unwrap().stats().sessions_started(), 3);
        assert_eq!(engine.pool().cached_locator_count(), 1);
        assert_eq!(engine.clear_locator_caches(), 1);
        assert_eq!(engine.pool().cached_locator_count(), 0);

        engine.shutdown().await;
    }
}
