use crate::{
    error::{IndexerError, Result},
    storage::StorageTransaction,
};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// A buffered entity mutation, applied when the block commits.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreOperation {
    Set {
        entity: String,
        id: String,
        data: Value,
    },
    Remove {
        entity: String,
        id: String,
    },
}

/// Entity store handed to handlers for the duration of one block.
///
/// Writes are buffered and reads observe them, so a handler sees the
/// effects of earlier handlers in the same block.
pub struct Store<'a> {
    tx: &'a mut dyn StorageTransaction,
    operations: Vec<StoreOperation>,
    overlay: HashMap<(String, String), Option<Value>>,
    query_limit: usize,
}

fn with_id(id: &str, mut data: Value) -> Value {
    if let Value::Object(map) = &mut data {
        map.insert("id".into(), Value::String(id.to_string()));
    }
    data
}

fn id_of(data: &Value) -> Option<&str> {
    data.get("id").and_then(Value::as_str)
}

impl<'a> Store<'a> {
    pub fn new(tx: &'a mut dyn StorageTransaction, query_limit: usize) -> Self {
        Self {
            tx,
            operations: Vec::new(),
            overlay: HashMap::new(),
            query_limit,
        }
    }

    pub async fn get(&mut self, entity: &str, id: &str) -> Result<Option<Value>> {
        if let Some(buffered) = self.overlay.get(&(entity.to_string(), id.to_string())) {
            return Ok(buffered.clone());
        }
        self.tx.get_entity(entity, id).await
    }

    pub async fn get_by_field(
        &mut self,
        entity: &str,
        field: &str,
        value: &Value,
    ) -> Result<Vec<Value>> {
        let stored = self
            .tx
            .find_entities(entity, field, value, self.query_limit + self.overlay.len())
            .await?;

        let mut found: Vec<Value> = stored
            .into_iter()
            .filter(|data| {
                id_of(data).map_or(true, |id| {
                    !self
                        .overlay
                        .contains_key(&(entity.to_string(), id.to_string()))
                })
            })
            .collect();

        let mut buffered: Vec<&Value> = self
            .overlay
            .iter()
            .filter(|((e, _), _)| e == entity)
            .filter_map(|(_, data)| data.as_ref())
            .filter(|data| data.get(field) == Some(value))
            .collect();
        buffered.sort_by(|a, b| id_of(a).cmp(&id_of(b)));
        found.extend(buffered.into_iter().cloned());

        found.truncate(self.query_limit);
        Ok(found)
    }

    pub async fn get_one_by_field(
        &mut self,
        entity: &str,
        field: &str,
        value: &Value,
    ) -> Result<Option<Value>> {
        Ok(self
            .get_by_field(entity, field, value)
            .await?
            .into_iter()
            .next())
    }

    pub fn set(&mut self, entity: &str, id: &str, data: Value) {
        let data = with_id(id, data);
        self.overlay
            .insert((entity.to_string(), id.to_string()), Some(data.clone()));
        self.operations.push(StoreOperation::Set {
            entity: entity.to_string(),
            id: id.to_string(),
            data,
        });
    }

    pub fn remove(&mut self, entity: &str, id: &str) {
        self.overlay
            .insert((entity.to_string(), id.to_string()), None);
        self.operations.push(StoreOperation::Remove {
            entity: entity.to_string(),
            id: id.to_string(),
        });
    }

    pub async fn get_as<T: DeserializeOwned>(&mut self, entity: &str, id: &str) -> Result<Option<T>> {
        match self.get(entity, id).await? {
            Some(data) => serde_json::from_value(data)
                .map(Some)
                .map_err(|e| IndexerError::Storage(format!("decode {entity} {id}: {e}"))),
            None => Ok(None),
        }
    }

    pub fn set_as<T: Serialize>(&mut self, entity: &str, id: &str, value: &T) -> Result<()> {
        let data = serde_json::to_value(value)
            .map_err(|e| IndexerError::Storage(format!("encode {entity} {id}: {e}")))?;
        self.set(entity, id, data);
        Ok(())
    }

    pub fn pending(&self) -> usize {
        self.operations.len()
    }

    /// Buffered operations, in the order handlers issued them.
    pub fn into_operations(self) -> Vec<StoreOperation> {
        self.operations
    }
}
