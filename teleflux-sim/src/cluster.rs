//! Builder wiring mock bots, a shared media store and an engine together.

use std::sync::Arc;

use bytes::Bytes;
use teleflux_core::Engine;
use teleflux_core::config::TelefluxConfig;
use teleflux_core::protocol::{DcId, MessageRef, ProtocolClient};
use teleflux_core::registry::StatsSink;

use crate::bot::{MockBot, MockBotBuilder};
use crate::sink::MemoryStatsSink;
use crate::store::{MediaStore, seeded_content};

/// A set of simulated bots sharing one catalog of files.
pub struct SimulatedCluster {
    store: Arc<MediaStore>,
    bots: Vec<MockBot>,
    sink: Arc<MemoryStatsSink>,
    config: TelefluxConfig,
}

impl SimulatedCluster {
    pub fn builder() -> SimulatedClusterBuilder {
        SimulatedClusterBuilder::default()
    }

    pub fn store(&self) -> &Arc<MediaStore> {
        &self.store
    }

    pub fn bots(&self) -> &[MockBot] {
        &self.bots
    }

    pub fn bot(&self, index: usize) -> Option<&MockBot> {
        self.bots.get(index)
    }

    pub fn sink(&self) -> &Arc<MemoryStatsSink> {
        &self.sink
    }

    pub fn config(&self) -> &TelefluxConfig {
        &self.config
    }

    /// Stores `data` as message `message_id` of a fixed test chat.
    pub fn add_file(&self, message_id: i32, dc: DcId, data: Bytes) -> MessageRef {
        let message = MessageRef::new(-100_777, message_id);
        self.store.insert(message, dc, data);
        message
    }

    /// Stores `len` bytes of seeded content and returns the message and bytes.
    pub fn add_seeded_file(&self, message_id: i32, dc: DcId, len: usize) -> (MessageRef, Bytes) {
        let data = seeded_content(len, message_id as u64);
        (self.add_file(message_id, dc, data.clone()), data)
    }

    /// Protocol clients in pool order.
    pub fn clients(&self) -> Vec<Arc<dyn ProtocolClient>> {
        self.bots
            .iter()
            .map(|bot| Arc::new(bot.clone()) as Arc<dyn ProtocolClient>)
            .collect()
    }

    /// Engine over this cluster's bots. Background maintenance is not started.
    pub fn engine(&self) -> Engine {
        Engine::new(
            self.clients(),
            self.config.clone(),
            Arc::clone(&self.sink) as Arc<dyn StatsSink>,
        )
    }
}

/// Builder for [`SimulatedCluster`].
pub struct SimulatedClusterBuilder {
    bots: Vec<MockBotBuilder>,
    config: TelefluxConfig,
}

impl Default for SimulatedClusterBuilder {
    fn default() -> Self {
        Self {
            bots: Vec::new(),
            config: TelefluxConfig::for_testing(),
        }
    }
}

impl SimulatedClusterBuilder {
    /// Adds a bot configured by `configure`, named after its position.
    pub fn bot(mut self, configure: impl FnOnce(MockBotBuilder) -> MockBotBuilder) -> Self {
        let name = format!("bot{}", self.bots.len());
        self.bots.push(configure(MockBot::builder(name)));
        self
    }

    /// Adds `count` healthy bots homed on `dc`.
    pub fn healthy_bots(mut self, count: usize, dc: DcId) -> Self {
        for _ in 0..count {
            self = self.bot(|bot| bot.home_dc(dc));
        }
        self
    }

    pub fn config(mut self, config: TelefluxConfig) -> Self {
        self.config = config;
        self
    }

    /// Adjusts the testing configuration in place.
    pub fn tune(mut self, adjust: impl FnOnce(&mut TelefluxConfig)) -> Self {
        adjust(&mut self.config);
        self
    }

    pub fn build(self) -> SimulatedCluster {
        let store = Arc::new(MediaStore::new());
        let bots = self
            .bots
            .into_iter()
            .map(|builder| builder.build(Arc::clone(&store)))
            .collect();
        SimulatedCluster {
            store,
            bots,
            sink: Arc::new(MemoryStatsSink::new()),
            config: self.config,
        }
    }
}
