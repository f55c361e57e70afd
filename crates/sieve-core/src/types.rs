use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub type BlockHeight = u64;

/// 32-byte block hash, shown as `0x`-prefixed hex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct BlockHash(pub [u8; 32]);

impl BlockHash {
    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s.trim_start_matches("0x")).ok()?;
        let array: [u8; 32] = bytes.try_into().ok()?;
        Some(Self(array))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

/// Chain identity as reported by the node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkMeta {
    pub chain: String,
    pub spec_name: String,
    pub genesis_hash: String,
}

/// Genesis hashes are hex, compared without regard to letter case.
pub fn same_genesis(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    pub height: BlockHeight,
    pub hash: BlockHash,
    pub parent_hash: BlockHash,
    pub timestamp: Option<DateTime<Utc>>,
    /// Spec version of the parent block, the runtime this block executed under.
    pub spec_version: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    ApplyExtrinsic(u32),
    Finalization,
    Initialization,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Position in the block's event list
    pub index: u32,
    pub module: String,
    pub method: String,
    pub phase: Phase,
    pub args: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Extrinsic {
    /// Position in the block body
    pub index: u32,
    pub module: String,
    pub method: String,
    pub args: serde_json::Value,
    #[serde(with = "hex_bytes")]
    pub payload: Vec<u8>,
    pub is_signed: bool,
    /// Set during assembly: one of the extrinsic's events is `ExtrinsicSuccess`.
    pub success: bool,
    /// Indices into [`BlockContent::events`] emitted while applying this extrinsic.
    pub events: Vec<u32>,
}

impl Extrinsic {
    pub fn new(
        index: u32,
        module: impl Into<String>,
        method: impl Into<String>,
        args: serde_json::Value,
    ) -> Self {
        Self {
            index,
            module: module.into(),
            method: method.into(),
            args,
            payload: Vec::new(),
            is_signed: false,
            success: false,
            events: Vec::new(),
        }
    }
}

impl Event {
    pub fn new(
        index: u32,
        module: impl Into<String>,
        method: impl Into<String>,
        phase: Phase,
        args: serde_json::Value,
    ) -> Self {
        Self {
            index,
            module: module.into(),
            method: method.into(),
            phase,
            args,
        }
    }
}

/// A decoded block with its extrinsics and events, immutable once assembled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockContent {
    pub block: Block,
    pub extrinsics: Vec<Extrinsic>,
    pub events: Vec<Event>,
}

impl BlockContent {
    /// Links events to the extrinsics they were emitted by and derives
    /// each extrinsic's success flag.
    pub fn assemble(block: Block, mut extrinsics: Vec<Extrinsic>, events: Vec<Event>) -> Self {
        for ext in &mut extrinsics {
            ext.events.clear();
        }
        for (position, event) in events.iter().enumerate() {
            if let Phase::ApplyExtrinsic(idx) = event.phase {
                if let Some(ext) = extrinsics.get_mut(idx as usize) {
                    ext.events.push(position as u32);
                }
            }
        }
        for ext in &mut extrinsics {
            ext.success = ext
                .events
                .iter()
                .filter_map(|i| events.get(*i as usize))
                .any(|e| e.method == "ExtrinsicSuccess");
        }
        Self {
            block,
            extrinsics,
            events,
        }
    }

    pub fn height(&self) -> BlockHeight {
        self.block.height
    }

    pub fn events_of<'a>(&'a self, extrinsic: &'a Extrinsic) -> impl Iterator<Item = &'a Event> {
        extrinsic
            .events
            .iter()
            .filter_map(|i| self.events.get(*i as usize))
    }

    pub fn extrinsic_of(&self, event: &Event) -> Option<&Extrinsic> {
        match event.phase {
            Phase::ApplyExtrinsic(idx) => self.extrinsics.get(idx as usize),
            _ => None,
        }
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format!("0x{}", hex::encode(bytes)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        hex::decode(s.trim_start_matches("0x")).map_err(serde::de::Error::custom)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_assemble_links_events() {
        let content = fixtures::transfer_block(10, 1);
        let transfer = &content.extrinsics[1];

        assert_eq!(transfer.events, vec![1, 2]);
        assert!(transfer.success);
        let methods: Vec<_> = content.events_of(transfer).map(|e| e.method.as_str()).collect();
        assert_eq!(methods, vec!["Transfer", "ExtrinsicSuccess"]);

        let back = content.extrinsic_of(&content.events[1]).unwrap();
        assert_eq!(back.method, "transfer");
        assert!(content.extrinsic_of(&content.events[3]).is_none());
    }

    #[test]
    fn test_failed_extrinsic() {
        let extrinsics = vec![Extrinsic::new(0, "balances", "transfer", json!({}))];
        let events = vec![Event::new(
            0,
            "system",
            "ExtrinsicFailed",
            Phase::ApplyExtrinsic(0),
            json!({}),
        )];
        let content = BlockContent::assemble(fixtures::block(1, 1), extrinsics, events);
        assert!(!content.extrinsics[0].success);
    }

    #[test]
    fn test_block_hash_hex() {
        let hash = BlockHash([0xab; 32]);
        let text = hash.to_string();
        assert!(text.starts_with("0xabab"));
        assert_eq!(BlockHash::from_hex(&text), Some(hash));
        assert_eq!(BlockHash::from_hex("0x1234"), None);
    }
}
