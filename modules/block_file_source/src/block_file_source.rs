//! Bakehouse block file source module for Caryatid
//! Publishes node block documents stored as JSON files once the process has started

use bakehouse_common::{
    messages::{ChainMessage, Message, RollbackMessage},
    node::NodeBlock,
    BlockInfo, Level,
};
use anyhow::{anyhow, Context as _, Result};
use caryatid_sdk::{module, Context};
use config::Config;
use glob::glob;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};

const CONFIG_STARTUP_TOPIC: (&str, &str) = ("startup-topic", "bakehouse.sequence.start");
const CONFIG_BLOCK_PUBLISH_TOPIC: (&str, &str) = ("publish-topic", "bakehouse.chain.block");
const CONFIG_BLOCK_FILES: &str = "block-files";

/// Block file source module
#[module(
    message_type(Message),
    name = "block-file-source",
    description = "Node block documents from files"
)]
pub struct BlockFileSource;

/// Turns a stream of node blocks into chain messages, inserting a rollback
/// whenever a block does not sit above the previous one
#[derive(Default)]
pub struct BlockSequencer {
    last_level: Option<Level>,
}

impl BlockSequencer {
    pub fn messages(&mut self, block: NodeBlock) -> Vec<(BlockInfo, ChainMessage)> {
        let level = block.level();
        let mut messages = Vec::with_capacity(2);

        if self.last_level.is_some_and(|last| level <= last) {
            let target = RollbackMessage {
                level: level - 1,
                hash: block.header.predecessor.clone(),
            };
            let info = BlockInfo {
                level: target.level,
                hash: target.hash.clone(),
                ..Default::default()
            };
            messages.push((info, ChainMessage::Rollback(target)));
        }

        let info = BlockInfo {
            level,
            hash: block.hash.clone(),
            cycle: block.metadata.level_info.cycle,
            timestamp: block.header.timestamp,
        };
        messages.push((info, ChainMessage::NodeBlock(Box::new(block))));
        self.last_level = Some(level);
        messages
    }
}

/// Files matching the pattern, in lexicographic order
pub fn scan(pattern: &str) -> Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = glob(pattern)
        .map_err(|e| anyhow!("Bad block-files pattern '{pattern}': {}", e.msg))?
        .collect::<Result<_, _>>()?;
    files.sort();
    Ok(files)
}

pub fn read_block(path: &Path) -> Result<NodeBlock> {
    let raw = fs::read(path)?;
    serde_json::from_slice(&raw).with_context(|| format!("Malformed block file {}", path.display()))
}

impl BlockFileSource {
    /// Read and publish all the blocks
    async fn process_blocks(context: Arc<Context<Message>>, config: Arc<Config>) -> Result<()> {
        let publish_topic = config
            .get_string(CONFIG_BLOCK_PUBLISH_TOPIC.0)
            .unwrap_or(CONFIG_BLOCK_PUBLISH_TOPIC.1.to_string());
        info!("Publishing blocks on '{publish_topic}'");

        let Ok(pattern) = config.get_string(CONFIG_BLOCK_FILES) else {
            error!("No block-files pattern given");
            return Err(anyhow!("No block-files"));
        };

        let files = scan(&pattern)?;
        if files.is_empty() {
            warn!("No files match '{pattern}'");
        }

        let mut sequencer = BlockSequencer::default();
        for path in files {
            let block = read_block(&path)?;
            info!(level = block.level(), "  {}", path.display());
            for (block_info, chain) in sequencer.messages(block) {
                let message = Message::Chain((block_info, chain));
                context
                    .message_bus
                    .publish(&publish_topic, Arc::new(message))
                    .await
                    .unwrap_or_else(|e| error!("Failed to publish block message: {e}"));
            }
        }

        Ok(())
    }

    /// Main init function
    pub async fn init(&self, context: Arc<Context<Message>>, config: Arc<Config>) -> Result<()> {
        let startup_topic = config
            .get_string(CONFIG_STARTUP_TOPIC.0)
            .unwrap_or(CONFIG_STARTUP_TOPIC.1.to_string());
        info!("Creating startup subscriber on '{startup_topic}'");
        let mut startup_subscription = context.subscribe(&startup_topic).await?;

        context.clone().run(async move {
            let Ok(_) = startup_subscription.read().await else {
                return;
            };
            info!("Received startup message");

            if let Err(e) = Self::process_blocks(context, config).await {
                error!("Failed to process blocks: {e:#}");
            }
        });

        Ok(())
    }
}
