// Rendering of script results for the terminal and for --json.

use lunabridge::{Table, Value};
use serde_json::{json, Map};

/// Nested tables deeper than this render as a marker. Also stops cycles.
const MAX_DEPTH: usize = 32;

pub fn plain(value: &Value) -> String {
    match value {
        Value::Nil => "nil".to_string(),
        Value::Boolean(b) => b.to_string(),
        Value::Integer(i) => i.to_string(),
        Value::Number(n) => float_text(*n),
        Value::String(s) => s.to_string_lossy().into_owned(),
        Value::Table(t) => match table_to_json(t, 0) {
            Ok(json) => json.to_string(),
            Err(_) => marker(value),
        },
        other => marker(other),
    }
}

pub fn to_json(value: &Value) -> serde_json::Value {
    value_to_json(value, 0)
}

fn value_to_json(value: &Value, depth: usize) -> serde_json::Value {
    match value {
        Value::Nil => serde_json::Value::Null,
        Value::Boolean(b) => json!(b),
        Value::Integer(i) => json!(i),
        Value::Number(n) => match serde_json::Number::from_f64(*n) {
            Some(n) => serde_json::Value::Number(n),
            None => json!(float_text(*n)),
        },
        Value::String(s) => json!(s.to_string_lossy()),
        Value::Table(t) => table_to_json(t, depth).unwrap_or_else(|_| json!(marker(value))),
        other => json!(marker(other)),
    }
}

/// Sequences become arrays, anything else an object with stringified keys.
fn table_to_json(table: &Table, depth: usize) -> lunabridge::Result<serde_json::Value> {
    if depth >= MAX_DEPTH {
        return Ok(json!("<table>"));
    }
    let len = table.raw_len()?;
    let pairs = table.pairs()?;
    if len > 0 && pairs.len() == len {
        let items = table.sequence_values()?;
        return Ok(serde_json::Value::Array(
            items.iter().map(|v| value_to_json(v, depth + 1)).collect(),
        ));
    }

    let mut object = Map::new();
    for (key, value) in &pairs {
        object.insert(plain_key(key), value_to_json(value, depth + 1));
    }
    Ok(serde_json::Value::Object(object))
}

fn plain_key(key: &Value) -> String {
    match key {
        Value::String(s) => s.to_string_lossy().into_owned(),
        Value::Table(_) => marker(key),
        other => plain(other),
    }
}

fn marker(value: &Value) -> String {
    format!("<{}>", value.type_name())
}

/// Engine style: integral floats keep a trailing `.0`.
fn float_text(n: f64) -> String {
    if n.is_nan() {
        "nan".to_string()
    } else if n.is_infinite() {
        if n > 0.0 { "inf" } else { "-inf" }.to_string()
    } else if n.fract() == 0.0 && n.abs() < 1e16 {
        format!("{:.1}", n)
    } else {
        n.to_string()
    }
}
