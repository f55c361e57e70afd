//! Conversion of dynamically decoded SCALE values into the JSON handed to mappings.

use serde_json::{json, Map, Value as Json};
use subxt::ext::scale_value::{Composite, Primitive, Value, ValueDef};

/// `TransactionPayment` -> `transactionPayment`
pub fn module_name(pallet: &str) -> String {
    let mut chars = pallet.chars();
    match chars.next() {
        Some(first) => first.to_lowercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// `transfer_keep_alive` -> `transferKeepAlive`
pub fn call_name(variant: &str) -> String {
    let mut out = String::with_capacity(variant.len());
    let mut upper = false;
    for c in variant.chars() {
        if c == '_' {
            upper = !out.is_empty();
        } else if upper {
            out.extend(c.to_uppercase());
            upper = false;
        } else {
            out.push(c);
        }
    }
    out
}

fn as_byte<T>(value: &Value<T>) -> Option<u8> {
    match &value.value {
        ValueDef::Primitive(Primitive::U128(n)) => u8::try_from(*n).ok(),
        _ => None,
    }
}

fn hex_json(bytes: &[u8]) -> Json {
    json!(format!("0x{}", hex::encode(bytes)))
}

pub fn composite_to_json<T>(composite: &Composite<T>) -> Json {
    match composite {
        Composite::Named(fields) => {
            let map: Map<String, Json> = fields
                .iter()
                .map(|(name, value)| (name.clone(), value_to_json(value)))
                .collect();
            Json::Object(map)
        }
        Composite::Unnamed(values) => {
            if values.len() == 1 {
                return value_to_json(&values[0]);
            }
            if values.len() == 32 {
                let bytes: Option<Vec<u8>> = values.iter().map(as_byte).collect();
                if let Some(bytes) = bytes {
                    return hex_json(&bytes);
                }
            }
            Json::Array(values.iter().map(value_to_json).collect())
        }
    }
}

pub fn value_to_json<T>(value: &Value<T>) -> Json {
    match &value.value {
        ValueDef::Composite(composite) => composite_to_json(composite),
        ValueDef::Variant(variant) => {
            if variant.values.is_empty() {
                json!(variant.name)
            } else {
                let mut map = Map::new();
                map.insert(variant.name.clone(), composite_to_json(&variant.values));
                Json::Object(map)
            }
        }
        ValueDef::BitSequence(bits) => Json::Array(bits.iter().map(Json::Bool).collect()),
        ValueDef::Primitive(primitive) => primitive_to_json(primitive),
    }
}

fn primitive_to_json(primitive: &Primitive) -> Json {
    match primitive {
        Primitive::Bool(b) => json!(b),
        Primitive::Char(c) => json!(c.to_string()),
        Primitive::String(s) => json!(s),
        Primitive::U128(n) => match u64::try_from(*n) {
            Ok(n) => json!(n),
            Err(_) => json!(n.to_string()),
        },
        Primitive::I128(n) => match i64::try_from(*n) {
            Ok(n) => json!(n),
            Err(_) => json!(n.to_string()),
        },
        Primitive::U256(bytes) | Primitive::I256(bytes) => hex_json(bytes),
    }
}

/// Millisecond timestamp carried by a `timestamp.set` call.
pub fn timestamp_millis(args: &Json) -> Option<i64> {
    match args.get("now")? {
        Json::Number(n) => n.as_i64(),
        Json::String(s) => s.parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names() {
        assert_eq!(module_name("Balances"), "balances");
        assert_eq!(module_name("TransactionPayment"), "transactionPayment");
        assert_eq!(call_name("transfer_keep_alive"), "transferKeepAlive");
        assert_eq!(call_name("set"), "set");
        assert_eq!(call_name("_private"), "private");
    }

    #[test]
    fn test_account_ids_render_as_hex() {
        let account = Value::unnamed_composite(vec![Value::unnamed_composite(
            (0..32u8).map(|b| Value::u128(b as u128)).collect::<Vec<_>>(),
        )]);
        let rendered = value_to_json(&account);
        assert_eq!(rendered, json!(format!("0x{}", hex::encode((0..32u8).collect::<Vec<_>>()))));
    }

    #[test]
    fn test_named_fields_and_variants() {
        let value = Value::named_composite(vec![
            ("amount", Value::u128(u128::MAX)),
            ("ok", Value::bool(true)),
            ("status", Value::unnamed_variant("Free", vec![])),
            ("small", Value::unnamed_composite(vec![Value::u128(1), Value::u128(2)])),
        ]);
        let rendered = value_to_json(&value);
        assert_eq!(
            rendered,
            json!({
                "amount": u128::MAX.to_string(),
                "ok": true,
                "status": "Free",
                "small": [1, 2],
            })
        );
    }

    #[test]
    fn test_timestamp_millis() {
        assert_eq!(timestamp_millis(&json!({ "now": 1_700_000_000_000u64 })), Some(1_700_000_000_000));
        assert_eq!(timestamp_millis(&json!({ "then": 1 })), None);
    }
}
