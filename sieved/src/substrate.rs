use crate::decode::{call_name, composite_to_json, module_name, timestamp_millis};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use serde_json::Value as Json;
use sieve_core::{
    Block, BlockContent, BlockHash, BlockHeight, ChainClient, Event, Extrinsic, IndexerError,
    NetworkMeta, Phase, Result,
};
use std::{
    collections::HashMap,
    fmt::Display,
    sync::{Mutex, PoisonError},
};
use subxt::{
    backend::{
        legacy::{rpc_methods::NumberOrHex, LegacyRpcMethods},
        rpc::RpcClient,
    },
    config::Header,
    events::Phase as EventPhase,
    utils::H256,
    Metadata, OnlineClient, PolkadotConfig,
};
use tracing::{debug, info};

fn chain_err(context: &str, e: impl Display) -> IndexerError {
    IndexerError::Chain(format!("{}: {}", context, e))
}

fn to_hash(hash: H256) -> BlockHash {
    BlockHash(hash.0)
}

/// Substrate node client over a jsonrpsee WebSocket connection.
pub struct SubxtChainClient {
    client: OnlineClient<PolkadotConfig>,
    rpc: LegacyRpcMethods<PolkadotConfig>,
    network: NetworkMeta,
    metadata: Mutex<HashMap<u32, Metadata>>,
    /// Held while blocks are decoded against the client's current metadata.
    decode_lock: tokio::sync::Mutex<()>,
}

impl SubxtChainClient {
    pub async fn connect(url: &str) -> Result<Self> {
        info!("Connecting to blockchain at {}", url);
        let rpc_client = RpcClient::from_url(url)
            .await
            .map_err(|e| chain_err("connect", e))?;
        let client = OnlineClient::<PolkadotConfig>::from_rpc_client(rpc_client.clone())
            .await
            .map_err(|e| chain_err("connect", e))?;
        let rpc = LegacyRpcMethods::<PolkadotConfig>::new(rpc_client);

        let chain = rpc
            .system_chain()
            .await
            .map_err(|e| chain_err("system_chain", e))?;
        let version = rpc
            .state_get_runtime_version(None)
            .await
            .map_err(|e| chain_err("runtime version", e))?;
        let spec_name = version
            .other
            .get("specName")
            .and_then(Json::as_str)
            .unwrap_or_default()
            .to_string();
        let network = NetworkMeta {
            chain,
            spec_name,
            genesis_hash: format!("0x{}", hex::encode(client.genesis_hash().0)),
        };
        info!(
            chain = %network.chain,
            spec_name = %network.spec_name,
            genesis = %network.genesis_hash,
            "Connected to chain"
        );

        let mut metadata = HashMap::new();
        metadata.insert(version.spec_version, client.metadata());
        Ok(Self {
            client,
            rpc,
            network,
            metadata: Mutex::new(metadata),
            decode_lock: tokio::sync::Mutex::new(()),
        })
    }

    async fn block_hash(&self, height: BlockHeight) -> Result<H256> {
        self.rpc
            .chain_get_block_hash(Some(NumberOrHex::Number(height)))
            .await
            .map_err(|e| chain_err("chain_getBlockHash", e))?
            .ok_or_else(|| IndexerError::Chain(format!("block {} not found", height)))
    }

    async fn version_at_hash(&self, hash: H256) -> Result<u32> {
        let version = self
            .rpc
            .state_get_runtime_version(Some(hash))
            .await
            .map_err(|e| chain_err("state_getRuntimeVersion", e))?;
        Ok(version.spec_version)
    }

    fn cached_metadata(&self, spec_version: u32) -> Option<Metadata> {
        self.metadata
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&spec_version)
            .cloned()
    }

    /// Metadata of `spec_version`, downloaded at `at` when not cached.
    async fn metadata_for(&self, spec_version: u32, at: H256) -> Result<Metadata> {
        if let Some(metadata) = self.cached_metadata(spec_version) {
            return Ok(metadata);
        }
        // `state_get_metadata` already SCALE-decodes the response.
        let metadata = self
            .rpc
            .state_get_metadata(Some(at))
            .await
            .map_err(|e| chain_err("state_getMetadata", e))?;
        debug!(spec_version, "Cached runtime metadata");
        self.metadata
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(spec_version, metadata.clone());
        Ok(metadata)
    }

    async fn fetch_block(&self, height: BlockHeight, spec_version: u32) -> Result<BlockContent> {
        let hash = self.block_hash(height).await?;
        let block = self
            .client
            .blocks()
            .at(hash)
            .await
            .map_err(|e| chain_err("fetch block", e))?;
        let header = block.header();

        let mut extrinsics = Vec::new();
        let mut timestamp = None;
        let body = block
            .extrinsics()
            .await
            .map_err(|e| chain_err("fetch extrinsics", e))?;
        for ext in body.iter() {
            let ext = ext.map_err(|e| chain_err("decode extrinsic", e))?;
            let pallet = ext
                .pallet_name()
                .map_err(|e| chain_err("decode extrinsic", e))?;
            let variant = ext
                .variant_name()
                .map_err(|e| chain_err("decode extrinsic", e))?;
            let args = ext
                .field_values()
                .map(|fields| composite_to_json(&fields))
                .map_err(|e| chain_err("decode call args", e))?;
            if pallet == "Timestamp" && variant == "set" {
                timestamp = timestamp_millis(&args).and_then(DateTime::<Utc>::from_timestamp_millis);
            }
            let mut extrinsic =
                Extrinsic::new(ext.index(), module_name(pallet), call_name(variant), args);
            extrinsic.payload = ext.bytes().to_vec();
            extrinsic.is_signed = ext.is_signed();
            extrinsics.push(extrinsic);
        }

        let mut events = Vec::new();
        let records = block
            .events()
            .await
            .map_err(|e| chain_err("fetch events", e))?;
        for (position, event) in records.iter().enumerate() {
            let event = event.map_err(|e| chain_err("decode event", e))?;
            let phase = match event.phase() {
                EventPhase::ApplyExtrinsic(idx) => Phase::ApplyExtrinsic(idx),
                EventPhase::Finalization => Phase::Finalization,
                EventPhase::Initialization => Phase::Initialization,
            };
            let args = event
                .field_values()
                .map(|fields| composite_to_json(&fields))
                .map_err(|e| chain_err("decode event args", e))?;
            events.push(Event::new(
                position as u32,
                module_name(event.pallet_name()),
                event.variant_name(),
                phase,
                args,
            ));
        }

        let block = Block {
            height,
            hash: to_hash(block.hash()),
            parent_hash: to_hash(header.parent_hash),
            timestamp,
            spec_version,
        };
        Ok(BlockContent::assemble(block, extrinsics, events))
    }

    /// Decodes `heights`, all executed under `spec_version`, with its metadata installed.
    async fn fetch_group(&self, heights: &[BlockHeight], spec_version: u32) -> Result<Vec<BlockContent>> {
        let parent = self.block_hash(heights[0].saturating_sub(1)).await?;
        let metadata = self.metadata_for(spec_version, parent).await?;
        let _guard = self.decode_lock.lock().await;
        self.client.set_metadata(metadata);
        try_join_all(heights.iter().map(|h| self.fetch_block(*h, spec_version))).await
    }
}

#[async_trait]
impl ChainClient for SubxtChainClient {
    fn network_meta(&self) -> &NetworkMeta {
        &self.network
    }

    async fn finalized_height(&self) -> Result<BlockHeight> {
        let hash = self
            .rpc
            .chain_get_finalized_head()
            .await
            .map_err(|e| chain_err("chain_getFinalizedHead", e))?;
        let header = self
            .rpc
            .chain_get_header(Some(hash))
            .await
            .map_err(|e| chain_err("chain_getHeader", e))?
            .ok_or_else(|| IndexerError::Chain("finalized header missing".into()))?;
        Ok(header.number().into())
    }

    async fn best_height(&self) -> Result<BlockHeight> {
        let header = self
            .rpc
            .chain_get_header(None)
            .await
            .map_err(|e| chain_err("chain_getHeader", e))?
            .ok_or_else(|| IndexerError::Chain("best header missing".into()))?;
        Ok(header.number().into())
    }

    async fn runtime_version(&self, height: BlockHeight) -> Result<u32> {
        let hash = self.block_hash(height).await?;
        self.version_at_hash(hash).await
    }

    async fn fetch_blocks_batch(
        &self,
        heights: &[BlockHeight],
        spec_version_hint: Option<u32>,
    ) -> Result<Vec<BlockContent>> {
        if heights.is_empty() {
            return Ok(Vec::new());
        }
        if let Some(version) = spec_version_hint {
            return self.fetch_group(heights, version).await;
        }

        // A batch may straddle an upgrade: group heights by the runtime they ran under.
        let versions = try_join_all(
            heights
                .iter()
                .map(|h| self.runtime_version(h.saturating_sub(1))),
        )
        .await?;
        let mut groups: Vec<(u32, Vec<BlockHeight>)> = Vec::new();
        for (height, version) in heights.iter().zip(versions) {
            match groups.last_mut() {
                Some((v, group)) if *v == version => group.push(*height),
                _ => groups.push((version, vec![*height])),
            }
        }

        let mut blocks = Vec::with_capacity(heights.len());
        for (version, group) in groups {
            blocks.extend(self.fetch_group(&group, version).await?);
        }
        Ok(blocks)
    }

    async fn prefetch_metadata(&self, height: BlockHeight) -> Result<()> {
        let parent = self.block_hash(height.saturating_sub(1)).await?;
        let version = self.version_at_hash(parent).await?;
        self.metadata_for(version, parent).await?;
        Ok(())
    }

    async fn storage_at(&self, key: &[u8], at: BlockHash) -> Result<Option<Vec<u8>>> {
        let data = self
            .rpc
            .state_get_storage(key, Some(H256::from(at.0)))
            .await
            .map_err(|e| chain_err("state_getStorage", e))?;
        Ok(data.map(|bytes| bytes.to_vec()))
    }
}
