//! Command execution.

use crate::Commands;
use colored::Colorize;
use iproto_client::{tuples, Client, WatchEvent};
use iproto_protocol::constants::body_key;
use rmpv::Value;
use serde_json::Value as Json;

/// Executes a command and returns the formatted output.
pub async fn execute(client: &Client, cmd: Commands) -> Result<String, Box<dyn std::error::Error>> {
    match cmd {
        Commands::Ping => {
            let version = client.ping().await?;
            Ok(format!("{} (schema version {})", "PONG".green(), version))
        }

        Commands::Eval { expr, args } => {
            let result = client.eval(&expr, parse_args(args.as_deref())?).await?;
            Ok(format_value(&result))
        }

        Commands::Call { function, args } => {
            let result = client
                .call(&function, parse_args(args.as_deref())?)
                .await?;
            Ok(format_value(&result))
        }

        Commands::Sql { query, binds } => {
            let response = client
                .execute(&query, parse_args(binds.as_deref())?)
                .await?;

            if let Some(info) = response.field(body_key::SQL_INFO)? {
                return Ok(format!("{} {}", "OK".green(), format_value(&info)));
            }

            let mut output = String::new();
            if let Some(Value::Array(columns)) = response.field(body_key::METADATA)? {
                let names: Vec<String> = columns.iter().map(column_name).collect();
                output.push_str(&format!("{}\n", names.join(" | ").bold()));
            }
            let rows = tuples(&response)?;
            if rows.is_empty() {
                output.push_str(&"No rows".yellow().to_string());
            }
            for row in rows {
                output.push_str(&format!("{}\n", to_json(&row)));
            }
            Ok(output.trim_end().to_string())
        }

        Commands::Spaces => {
            let schema = client
                .schema()
                .ok_or("schema fetching is disabled")?
                .cache();
            let mut output = format!(
                "{}\n",
                format!("Schema version {}", schema.version).bold()
            );
            for space in schema.spaces() {
                let indexes = space
                    .indexes
                    .iter()
                    .map(|i| i.name.as_str())
                    .collect::<Vec<_>>()
                    .join(", ");
                output.push_str(&format!(
                    "  {:>6} {} ({}) [indexes: {}]\n",
                    space.id,
                    space.name.cyan(),
                    space.engine,
                    indexes
                ));
            }
            Ok(output.trim_end().to_string())
        }

        // streams events, handled in main.rs
        Commands::Watch { .. } => unreachable!(),
    }
}

/// Formats a watcher notification as one line of JSON.
pub fn format_event(event: &WatchEvent) -> String {
    let data = event.data.as_ref().map(to_json).unwrap_or(Json::Null);
    serde_json::json!({ "key": event.key, "data": data }).to_string()
}

fn column_name(column: &Value) -> String {
    // metadata maps use integer keys, 0 being the column name
    column
        .as_map()
        .and_then(|entries| {
            entries
                .iter()
                .find(|(k, _)| k.as_u64() == Some(0))
                .and_then(|(_, v)| v.as_str())
        })
        .unwrap_or("?")
        .to_string()
}

/// Parses an argument list given as JSON (inline or @file.json). Absent
/// arguments mean an empty list.
fn parse_args(arg: Option<&str>) -> Result<Value, Box<dyn std::error::Error>> {
    let Some(arg) = arg else {
        return Ok(Value::Array(Vec::new()));
    };
    let json: Json = if let Some(path) = arg.strip_prefix('@') {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content)?
    } else {
        serde_json::from_str(arg)?
    };
    match from_json(&json) {
        args @ Value::Array(_) => Ok(args),
        single => Ok(Value::Array(vec![single])),
    }
}

/// Converts JSON into MessagePack, preferring integers over floats.
fn from_json(json: &Json) -> Value {
    match json {
        Json::Null => Value::Nil,
        Json::Bool(b) => Value::Boolean(*b),
        Json::Number(n) => {
            if let Some(u) = n.as_u64() {
                Value::from(u)
            } else if let Some(i) = n.as_i64() {
                Value::from(i)
            } else {
                Value::F64(n.as_f64().unwrap_or_default())
            }
        }
        Json::String(s) => Value::from(s.as_str()),
        Json::Array(items) => Value::Array(items.iter().map(from_json).collect()),
        Json::Object(entries) => Value::Map(
            entries
                .iter()
                .map(|(k, v)| (Value::from(k.as_str()), from_json(v)))
                .collect(),
        ),
    }
}

/// Converts MessagePack into JSON. Non-string map keys are stringified and
/// binary data becomes an array of bytes.
fn to_json(value: &Value) -> Json {
    match value {
        Value::Nil => Json::Null,
        Value::Boolean(b) => Json::Bool(*b),
        Value::Integer(i) => {
            if let Some(u) = i.as_u64() {
                Json::from(u)
            } else {
                Json::from(i.as_i64().unwrap_or_default())
            }
        }
        Value::F32(f) => Json::from(f64::from(*f)),
        Value::F64(f) => Json::from(*f),
        Value::String(s) => match s.as_str() {
            Some(s) => Json::from(s),
            None => Json::from(String::from_utf8_lossy(s.as_bytes()).into_owned()),
        },
        Value::Binary(bytes) => Json::from(bytes.clone()),
        Value::Array(items) => Json::Array(items.iter().map(to_json).collect()),
        Value::Map(entries) => Json::Object(
            entries
                .iter()
                .map(|(k, v)| {
                    let key = match k.as_str() {
                        Some(s) => s.to_string(),
                        None => k.to_string(),
                    };
                    (key, to_json(v))
                })
                .collect(),
        ),
        Value::Ext(tag, data) => serde_json::json!({ "ext": tag, "data": data }),
    }
}

/// Formats a MessagePack value as pretty JSON for display.
fn format_value(value: &Value) -> String {
    let json = to_json(value);
    serde_json::to_string_pretty(&json).unwrap_or_else(|_| json.to_string())
}
