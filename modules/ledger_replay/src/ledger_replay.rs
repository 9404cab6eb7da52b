//! Bakehouse ledger replay module for Caryatid
//! Applies node block documents to the ledger, reverts them on rollback,
//! and publishes the ledger head after every change

pub mod commits;
pub mod configuration;
pub mod context;
pub mod ledger_cache;
pub mod pipeline;
pub mod protocols;
pub mod rights_generator;
pub mod sampler;

#[cfg(test)]
mod test_utils;

use std::sync::Arc;

use anyhow::Result;
use caryatid_sdk::{module, Context};
use config::Config;
use tracing::{debug, error, info};

use bakehouse_common::{
    messages::{ChainMessage, LedgerHeadMessage, Message},
    BlockInfo, ReplayError,
};
use bakehouse_module_ledger_store::{
    fjall::FjallLedgerStore, memory::InMemoryLedgerStore, LedgerStore,
};

use crate::{
    configuration::{ReplayConfig, StoreKind},
    pipeline::Pipeline,
    protocols::ProtocolRegistry,
};

/// Ledger replay module
#[module(
    message_type(Message),
    name = "ledger-replay",
    description = "Protocol replay engine"
)]
pub struct LedgerReplay;

/// Message handling around the pipeline; stops for good at the first failure
pub struct ReplayState {
    pipeline: Pipeline,
    halted: bool,
}

impl ReplayState {
    pub fn new(pipeline: Pipeline) -> Self {
        Self {
            pipeline,
            halted: false,
        }
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// Process one chain message, returning the head to publish if it was handled
    pub fn handle(&mut self, message: &ChainMessage) -> Option<LedgerHeadMessage> {
        if self.halted {
            debug!("{}", ReplayError::Halted(self.pipeline.head().level));
            return None;
        }
        let result = match message {
            ChainMessage::NodeBlock(node) => self.pipeline.apply_block(node).map(|_| ()),
            ChainMessage::Rollback(rollback) => self
                .pipeline
                .rollback_to(rollback.level, &rollback.hash)
                .map(|_| ()),
            ChainMessage::LedgerHead(_) => return None,
        };
        if let Err(e) = result {
            error!(
                level = self.pipeline.head().level,
                "Ledger replay halted: {e:#}"
            );
            self.halted = true;
        }
        Some(self.head_message())
    }

    fn head_message(&self) -> LedgerHeadMessage {
        let head = self.pipeline.head();
        LedgerHeadMessage {
            level: head.level,
            hash: head.hash.clone(),
            cycle: head.cycle,
            statistics: self.pipeline.head_statistics().cloned(),
            halted: self.halted,
        }
    }

    fn block_info(&self) -> BlockInfo {
        let head = self.pipeline.head();
        BlockInfo {
            level: head.level,
            hash: head.hash.clone().unwrap_or_default(),
            cycle: head.cycle,
            timestamp: head.timestamp.unwrap_or_default(),
        }
    }
}

impl LedgerReplay {
    pub async fn init(&self, context: Arc<Context<Message>>, config: Arc<Config>) -> Result<()> {
        let cfg = ReplayConfig::try_load(&config)?;
        let store: Arc<dyn LedgerStore> = match cfg.store {
            StoreKind::Fjall => Arc::new(FjallLedgerStore::new(config.clone())?),
            StoreKind::Memory => Arc::new(InMemoryLedgerStore::new()),
        };
        let registry = ProtocolRegistry::new(&cfg.protocols);
        let pipeline = Pipeline::new(store, registry, cfg.settings())?;
        info!(
            protocols = cfg.protocols.len(),
            head = pipeline.head().level,
            "Ledger replay ready"
        );

        let mut state = ReplayState::new(pipeline);
        let mut subscription = context.subscribe(&cfg.subscribe_topic).await?;
        let publish_topic = cfg.publish_topic.clone();
        context.clone().run(async move {
            loop {
                let Ok((_, message)) = subscription.read().await else {
                    return;
                };
                let Message::Chain((_, chain)) = message.as_ref() else {
                    continue;
                };
                let Some(head) = state.handle(chain) else {
                    continue;
                };
                let message = Message::Chain((state.block_info(), ChainMessage::LedgerHead(head)));
                context
                    .message_bus
                    .publish(&publish_topic, Arc::new(message))
                    .await
                    .unwrap_or_else(|e| error!("Failed to publish ledger head: {e}"));
            }
        });

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        pipeline::PipelineSettings,
        test_utils::{block_hash, test_params, ChainBuilder},
    };
    use bakehouse_common::{messages::RollbackMessage, protocol_params::ProtocolVersion, Seed};

    fn state() -> (Arc<InMemoryLedgerStore>, ReplayState, ChainBuilder) {
        let params = test_params(ProtocolVersion::Tenderbake);
        let store = Arc::new(InMemoryLedgerStore::new());
        let settings = PipelineSettings {
            max_reorg_depth: 10,
            initial_seed: Seed::default(),
            check_supply: true,
            cache_max_accounts: 1_000,
        };
        let pipeline = Pipeline::new(
            store.clone(),
            ProtocolRegistry::new(std::slice::from_ref(&params)),
            settings,
        )
        .unwrap();
        (store, ReplayState::new(pipeline), ChainBuilder::new(params))
    }

    fn block(chain: &ChainBuilder, store: &InMemoryLedgerStore, level: i32) -> ChainMessage {
        let node = if level == 1 {
            chain.genesis()
        } else {
            chain.next(store, level, block_hash(level - 1, &chain.branch))
        };
        ChainMessage::NodeBlock(Box::new(node))
    }

    #[test]
    fn publishes_head_after_apply_and_rollback() {
        let (store, mut state, chain) = state();
        for level in 1..=4 {
            let head = state.handle(&block(&chain, &store, level)).unwrap();
            assert_eq!(head.level, level);
            assert!(!head.halted);
            assert!(head.statistics.is_some());
        }

        let rollback = ChainMessage::Rollback(RollbackMessage {
            level: 2,
            hash: block_hash(2, "main"),
        });
        let head = state.handle(&rollback).unwrap();
        assert_eq!(head.level, 2);
        assert_eq!(head.hash, Some(block_hash(2, "main")));
        assert_eq!(state.block_info().level, 2);
    }

    #[test]
    fn halts_at_the_first_failure() {
        let (store, mut state, chain) = state();
        state.handle(&block(&chain, &store, 1)).unwrap();
        state.handle(&block(&chain, &store, 2)).unwrap();

        // Level 4 does not extend level 2
        let gap = block(&chain, &store, 4);
        let head = state.handle(&gap).unwrap();
        assert!(head.halted);
        assert_eq!(head.level, 2);
        assert!(state.is_halted());

        assert!(state.handle(&block(&chain, &store, 3)).is_none());
    }
}
