//! Mappings compiled into the daemon, registered under their entry names.

use anyhow::{bail, Context};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sieve_core::{BlockContent, HandlerContext, HandlerInput, Mapping, MappingRegistry};
use std::sync::Arc;

pub const BALANCES_ENTRY: &str = "balances";

pub fn builtin_registry() -> MappingRegistry {
    MappingRegistry::new().with(BALANCES_ENTRY, Arc::new(BalancesMapping))
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BlockRecord {
    height: u64,
    hash: String,
    spec_version: u32,
    timestamp: Option<i64>,
    extrinsic_count: usize,
    event_count: usize,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TransferRecord {
    height: u64,
    from: String,
    to: String,
    amount: String,
    extrinsic: Option<u32>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AccountRecord {
    transfers_in: u64,
    transfers_out: u64,
    last_active: u64,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CallRecord {
    height: u64,
    module: String,
    method: String,
    signed: bool,
    success: bool,
}

#[derive(Deserialize)]
struct TransferArgs {
    from: String,
    to: String,
    amount: Value,
}

fn amount_string(amount: &Value) -> String {
    match amount {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Blocks, balance transfers and per-account transfer counts.
pub struct BalancesMapping;

impl BalancesMapping {
    fn handle_block(ctx: &mut HandlerContext<'_, '_>, content: &BlockContent) -> anyhow::Result<()> {
        let block = &content.block;
        let record = BlockRecord {
            height: block.height,
            hash: block.hash.to_string(),
            spec_version: block.spec_version,
            timestamp: block.timestamp.map(|t| t.timestamp_millis()),
            extrinsic_count: content.extrinsics.len(),
            event_count: content.events.len(),
        };
        ctx.store.set_as("Block", &block.height.to_string(), &record)?;
        Ok(())
    }

    async fn touch_account(
        ctx: &mut HandlerContext<'_, '_>,
        account: &str,
        height: u64,
        incoming: bool,
    ) -> anyhow::Result<()> {
        let mut record: AccountRecord = ctx
            .store
            .get_as("Account", account)
            .await?
            .unwrap_or_default();
        if incoming {
            record.transfers_in += 1;
        } else {
            record.transfers_out += 1;
        }
        record.last_active = height;
        ctx.store.set_as("Account", account, &record)?;
        Ok(())
    }
}

#[async_trait]
impl Mapping for BalancesMapping {
    async fn handle(
        &self,
        handler: &str,
        ctx: &mut HandlerContext<'_, '_>,
        input: HandlerInput<'_>,
    ) -> anyhow::Result<()> {
        match (handler, input) {
            ("handleBlock", HandlerInput::Block(content)) => Self::handle_block(ctx, content),
            ("handleTransfer", HandlerInput::Event { event, content }) => {
                let args: TransferArgs = serde_json::from_value(event.args.clone())
                    .with_context(|| format!("unexpected {}.{} arguments", event.module, event.method))?;
                let height = content.height();
                let record = TransferRecord {
                    height,
                    from: args.from.clone(),
                    to: args.to.clone(),
                    amount: amount_string(&args.amount),
                    extrinsic: content.extrinsic_of(event).map(|ext| ext.index),
                };
                ctx.store
                    .set_as("Transfer", &format!("{}-{}", height, event.index), &record)?;
                Self::touch_account(ctx, &args.from, height, false).await?;
                Self::touch_account(ctx, &args.to, height, true).await
            }
            ("handleCall", HandlerInput::Call { extrinsic, content }) => {
                let record = CallRecord {
                    height: content.height(),
                    module: extrinsic.module.clone(),
                    method: extrinsic.method.clone(),
                    signed: extrinsic.is_signed,
                    success: extrinsic.success,
                };
                ctx.store.set_as(
                    "Call",
                    &format!("{}-{}", content.height(), extrinsic.index),
                    &record,
                )?;
                Ok(())
            }
            (handler, input) => bail!(
                "{} has no handler {} for {} input",
                BALANCES_ENTRY,
                handler,
                match input {
                    HandlerInput::Block(_) => "block",
                    HandlerInput::Call { .. } => "call",
                    HandlerInput::Event { .. } => "event",
                    HandlerInput::Custom { .. } => "custom",
                }
            ),
        }
    }
}
