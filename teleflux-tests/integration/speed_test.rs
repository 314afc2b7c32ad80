//! On-demand benchmarking across the pool.

use teleflux_core::protocol::{BotIndex, DcId};
use teleflux_core::{SpeedTestError, SpeedTestEvent, TelefluxError};
use teleflux_sim::SimulatedCluster;

const MIB: u64 = 1024 * 1024;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_benchmark_sorts_by_throughput_with_failures_last() {
        let cluster = SimulatedCluster::builder()
            .bot(|bot| bot.home_dc(DcId(4)).bandwidth(40 * MIB))
            .bot(|bot| bot.home_dc(DcId(4)).fail_resolve())
            .bot(|bot| bot.home_dc(DcId(4)).bandwidth(8 * MIB))
            .build();
        let (message, _) = cluster.add_seeded_file(1, DcId(4), MIB as usize);
        let engine = cluster.engine();

        let results = engine.benchmark_all(message).await.unwrap();

        assert_eq!(results.len(), 3);
        let order: Vec<_> = results.iter().map(|result| result.bot).collect();
        assert_eq!(order, [BotIndex::new(0), BotIndex::new(2), BotIndex::new(1)]);

        let fastest = &results[0];
        assert_eq!(fastest.error, None);
        assert_eq!(fastest.bytes_downloaded, MIB);
        assert_eq!(fastest.home_dc, Some(DcId(4)));
        assert!(fastest.ping_ms.is_some());
        assert!(fastest.mbps > results[1].mbps);

        let failed = &results[2];
        assert_eq!(failed.display_name, "Bot 2");
        assert!(failed.error.is_some());
        assert_eq!(failed.mbps, None);
        assert_eq!(failed.bytes_downloaded, 0);
    }

    #[tokio::test]
    async fn test_benchmark_uses_fresh_locators() {
        let cluster = SimulatedCluster::builder().healthy_bots(2, DcId(4)).build();
        let (message, _) = cluster.add_seeded_file(2, DcId(4), MIB as usize);
        let engine = cluster.engine();

        engine.benchmark_all(message).await.unwrap();
        engine.benchmark_all(message).await.unwrap();

        assert_eq!(engine.pool().cached_locator_count(), 0);
        for bot in cluster.bots() {
            assert_eq!(bot.stats().resolves(), 2);
        }
    }

    #[tokio::test]
    async fn test_event_stream_reports_every_bot() {
        let cluster = SimulatedCluster::builder()
            .bot(|bot| bot.home_dc(DcId(4)).bandwidth(8 * MIB))
            .bot(|bot| bot.home_dc(DcId(4)).bandwidth(8 * MIB))
            .build();
        let (message, _) = cluster.add_seeded_file(3, DcId(4), MIB as usize);
        let engine = cluster.engine();

        let mut receiver = engine.benchmark_all_with_events(message).unwrap();
        let mut events = Vec::new();
        while let Some(event) = receiver.recv().await {
            events.push(event);
        }

        assert_eq!(
            events.first(),
            Some(&SpeedTestEvent::Start {
                total: 2,
                target_dc: Some(DcId(4))
            })
        );
        assert_eq!(events.last(), Some(&SpeedTestEvent::Done { total: 2 }));

        let completed: Vec<_> = events
            .iter()
            .filter_map(|event| match event {
                SpeedTestEvent::Result {
                    completed, total, ..
                } => Some((*completed, *total)),
                _ => None,
            })
            .collect();
        assert_eq!(completed, [(1, 2), (2, 2)]);

        let progress = events
            .iter()
            .filter(|event| matches!(event, SpeedTestEvent::Progress { .. }))
            .count();
        assert!(progress > 0);

        let json = serde_json::to_value(&events[0]).unwrap();
        assert_eq!(json["type"], "start");
        assert_eq!(json["total"], 2);
    }

    #[tokio::test]
    async fn test_empty_pool_cannot_benchmark() {
        let cluster = SimulatedCluster::builder().build();
        let (message, _) = cluster.add_seeded_file(4, DcId(4), 1024);
        let engine = cluster.engine();

        let error = engine.benchmark_all(message).await.unwrap_err();
        assert!(matches!(
            error,
            TelefluxError::SpeedTest(SpeedTestError::NoBots)
        ));
        assert_eq!(error.user_message(), "No bot clients connected");
        assert!(engine.benchmark_all_with_events(message).is_err());
    }
}
