use anyhow::{bail, Result};
use config::Config;

use bakehouse_common::{protocol_params::ProtocolParams, Seed};

use crate::pipeline::PipelineSettings;

#[derive(Clone, Debug, serde::Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum StoreKind {
    Fjall,
    Memory,
}

#[derive(Clone, Debug, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ReplayConfig {
    pub subscribe_topic: String,
    pub publish_topic: String,
    pub store: StoreKind,
    pub max_reorg_depth: i32,
    pub initial_seed: Seed,
    pub check_supply: bool,
    pub cache_max_accounts: usize,
    #[serde(default)]
    pub protocols: Vec<ProtocolParams>,
}

impl ReplayConfig {
    pub fn try_load(config: &Config) -> Result<Self> {
        let full_config = Config::builder()
            .add_source(config::File::from_str(
                include_str!("../config.default.toml"),
                config::FileFormat::Toml,
            ))
            .add_source(config.clone())
            .build()?;
        let cfg: Self = full_config.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        if self.protocols.is_empty() {
            bail!("No protocols configured");
        }
        if self.max_reorg_depth < 1 {
            bail!("max-reorg-depth must be positive, got {}", self.max_reorg_depth);
        }
        for (i, p) in self.protocols.iter().enumerate() {
            let c = &p.constants;
            if c.blocks_per_cycle < 1 || c.blocks_per_snapshot < 1 || c.endorsers_per_block < 1 {
                bail!("Protocol {} has empty cycles, snapshots or committees", p.hash);
            }
            if self.protocols[..i].iter().any(|q| q.hash == p.hash || q.code == p.code) {
                bail!("Protocol {} ({}) configured twice", p.hash, p.code);
            }
        }
        Ok(())
    }

    pub fn settings(&self) -> PipelineSettings {
        PipelineSettings {
            max_reorg_depth: self.max_reorg_depth,
            initial_seed: self.initial_seed,
            check_supply: self.check_supply,
            cache_max_accounts: self.cache_max_accounts,
        }
    }
}
