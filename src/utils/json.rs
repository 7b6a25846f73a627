//! Typed accessors over JSON object tables. Accessors remove the key from
//! the table, so whatever remains after parsing the known fields is the
//! side-car of unknown keys to re-emit on serialization.

use anyhow::{anyhow, Result};
use serde_json::{Map, Value};

pub(crate) type Table = Map<String, Value>;

pub(crate) fn get_value(table: &mut Table, key: &str, path: &str) -> Result<Value> {
    table
        .remove(key)
        .ok_or_else(|| anyhow!("missing key: '{}{}'", path, key))
}

pub(crate) fn get_string(table: &mut Table, key: &str, path: &str) -> Result<String> {
    get_value(table, key, path).and_then(|v| {
        if let Value::String(s) = v {
            Ok(s)
        } else {
            Err(expected_type("string", path, key))
        }
    })
}

pub(crate) fn get_opt_string(table: &mut Table, key: &str, path: &str) -> Result<Option<String>> {
    match table.remove(key) {
        Some(Value::String(s)) => Ok(Some(s)),
        Some(Value::Null) | None => Ok(None),
        Some(_) => Err(expected_type("string", path, key)),
    }
}

pub(crate) fn get_opt_u64(table: &mut Table, key: &str, path: &str) -> Result<Option<u64>> {
    match table.remove(key) {
        Some(Value::Number(n)) => n
            .as_u64()
            .map(Some)
            .ok_or_else(|| expected_type("unsigned integer", path, key)),
        Some(Value::Null) | None => Ok(None),
        Some(_) => Err(expected_type("unsigned integer", path, key)),
    }
}

pub(crate) fn get_table(table: &mut Table, key: &str, path: &str) -> Result<Table> {
    match table.remove(key) {
        Some(Value::Object(t)) => Ok(t),
        Some(Value::Null) | None => Ok(Table::new()),
        Some(_) => Err(expected_type("object", path, key)),
    }
}

pub(crate) fn get_array(table: &mut Table, key: &str, path: &str) -> Result<Vec<Value>> {
    match table.remove(key) {
        Some(Value::Array(a)) => Ok(a),
        Some(Value::Null) | None => Ok(Vec::new()),
        Some(_) => Err(expected_type("array", path, key)),
    }
}

fn expected_type(kind: &'static str, path: &str, key: &str) -> anyhow::Error {
    anyhow!("expected type: '{}' for '{}{}'", kind, path, key)
}
