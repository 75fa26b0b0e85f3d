use alloy::providers::{DynProvider, Provider, ProviderBuilder};
use anyhow::{Context, Result};
use clonewatch_core::config::ChainConfig;
use tracing::info;

/// `ws` carries the new-heads subscription, `http` the per-block lookups.
#[derive(Clone)]
pub struct NodeClient {
    pub ws: DynProvider,
    pub http: DynProvider,
}

impl NodeClient {
    pub async fn connect(cfg: &ChainConfig) -> Result<Self> {
        let http = Self::connect_http(cfg).await?;
        let ws = ProviderBuilder::new()
            .connect(&cfg.rpc_ws)
            .await
            .context("connecting websocket rpc")?
            .erased();
        info!(chain_id = cfg.chain_id, "connected to node");
        Ok(Self { ws, http })
    }

    pub async fn connect_http(cfg: &ChainConfig) -> Result<DynProvider> {
        let http = ProviderBuilder::new()
            .connect(&cfg.rpc_http)
            .await
            .context("connecting http rpc")?
            .erased();
        Ok(http)
    }
}
