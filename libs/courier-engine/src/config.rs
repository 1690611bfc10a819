use std::collections::{HashMap, HashSet};
use std::path::Path;

use serde::Deserialize;

use courier_api::config::{ConfigParam, ConfigValues, ParamType, ParamValue};

use crate::error::ProducerError;

/// Producer keys that only apply to async producers.
///
/// They are stripped from the config handed to one-shot sync producers.
pub const ASYNC_ONLY_PARAMS: &[&str] = &["max_queue_size", "delivery_threshold", "delivery_interval"];

const COMPRESSION_CODECS: &[&str] = &["gzip", "snappy", "lz4", "zstd"];
const REQUIRED_ACKS: &[&str] = &["all", "-1", "0", "1"];

/// On-disk layout: two free-form tables validated against declared params.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    #[serde(default)]
    client: Option<toml::Value>,
    #[serde(default)]
    producer: Option<toml::Value>,
}

/// Root configuration, parsed from TOML.
///
/// ```toml
/// [client]
/// client_id = "billing"
/// seed_brokers = ["kafka-1:9092", "kafka-2:9092"]
///
/// [producer]
/// required_acks = "all"
/// delivery_threshold = 100
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct CourierConfig {
    /// Passed to `ClientFactory::create_client`.
    pub client: ConfigValues,
    pub producer: ProducerSettings,
}

/// Producer configuration, pre-split for sync and async producers.
#[derive(Debug, Clone, PartialEq)]
pub struct ProducerSettings {
    sync_values: ConfigValues,
    async_values: ConfigValues,
}

impl ProducerSettings {
    pub fn new(values: ConfigValues) -> Self {
        Self {
            sync_values: values.without(ASYNC_ONLY_PARAMS),
            async_values: values,
        }
    }

    /// Config for one-shot producers: async-only keys removed.
    pub fn for_sync(&self) -> &ConfigValues {
        &self.sync_values
    }

    /// Full producer config.
    pub fn for_async(&self) -> &ConfigValues {
        &self.async_values
    }
}

impl Default for CourierConfig {
    fn default() -> Self {
        Self {
            client: defaults(&client_params()),
            producer: ProducerSettings::new(defaults(&producer_params())),
        }
    }
}

impl CourierConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ProducerError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ProducerError::Config(format!("{}: {e}", path.display())))?;
        Self::parse(&content).map_err(|e| e.with_context(path.display()))
    }

    /// Parse configuration from a TOML string.
    pub fn parse(toml_str: &str) -> Result<Self, ProducerError> {
        let raw: RawConfig =
            toml::from_str(toml_str).map_err(|e| ProducerError::Config(e.to_string()))?;

        let client_params = client_params();
        let parsed = parse_params(raw.client.as_ref(), &client_params)
            .map_err(|e| e.with_context("[client]"))?;
        let client =
            validate_and_build(&parsed, &client_params).map_err(|e| e.with_context("[client]"))?;

        let producer_params = producer_params();
        let parsed = parse_params(raw.producer.as_ref(), &producer_params)
            .map_err(|e| e.with_context("[producer]"))?;
        let producer = validate_and_build(&parsed, &producer_params)
            .map_err(|e| e.with_context("[producer]"))?;

        check_one_of(&producer, "required_acks", REQUIRED_ACKS)
            .and_then(|()| check_one_of(&producer, "compression_codec", COMPRESSION_CODECS))
            .map_err(|e| e.with_context("[producer]"))?;

        Ok(Self {
            client,
            producer: ProducerSettings::new(producer),
        })
    }
}

/// Parameters accepted in the `[client]` table.
pub fn client_params() -> Vec<ConfigParam> {
    vec![
        ConfigParam::with_default(
            "client_id",
            ParamType::Str,
            ParamValue::Str("courier".into()),
            "Client id reported to the broker",
        ),
        ConfigParam::with_default(
            "seed_brokers",
            ParamType::StrList,
            ParamValue::StrList(vec!["localhost:9092".into()]),
            "Bootstrap broker addresses",
        ),
        ConfigParam::optional("connect_timeout", ParamType::U64, "Connect timeout, seconds"),
        ConfigParam::optional("socket_timeout", ParamType::U64, "Socket read/write timeout, seconds"),
    ]
}

/// Parameters accepted in the `[producer]` table.
pub fn producer_params() -> Vec<ConfigParam> {
    vec![
        ConfigParam::with_default(
            "ack_timeout",
            ParamType::U64,
            ParamValue::U64(5),
            "Seconds a broker waits for replicas before failing a write",
        ),
        ConfigParam::with_default(
            "required_acks",
            ParamType::Str,
            ParamValue::Str("all".into()),
            "Replicas that must acknowledge a write: all, -1, 0 or 1",
        ),
        ConfigParam::with_default(
            "max_retries",
            ParamType::U64,
            ParamValue::U64(2),
            "Delivery retries performed by the broker client",
        ),
        ConfigParam::with_default(
            "retry_backoff",
            ParamType::F64,
            ParamValue::F64(1.0),
            "Seconds between delivery retries",
        ),
        ConfigParam::with_default(
            "max_buffer_size",
            ParamType::U64,
            ParamValue::U64(1000),
            "Messages a producer may buffer before delivery",
        ),
        ConfigParam::with_default(
            "max_buffer_bytesize",
            ParamType::U64,
            ParamValue::U64(10_000_000),
            "Bytes a producer may buffer before delivery",
        ),
        ConfigParam::optional(
            "compression_codec",
            ParamType::Str,
            "gzip, snappy, lz4 or zstd; uncompressed when absent",
        ),
        ConfigParam::with_default(
            "compression_threshold",
            ParamType::U64,
            ParamValue::U64(1),
            "Minimum messages in a batch before compression kicks in",
        ),
        ConfigParam::with_default(
            "max_queue_size",
            ParamType::U64,
            ParamValue::U64(1000),
            "Async only: messages queued before produce fails",
        ),
        ConfigParam::with_default(
            "delivery_threshold",
            ParamType::U64,
            ParamValue::U64(0),
            "Async only: deliver automatically after this many messages (0 = off)",
        ),
        ConfigParam::with_default(
            "delivery_interval",
            ParamType::U64,
            ParamValue::U64(0),
            "Async only: deliver automatically every N seconds (0 = off)",
        ),
    ]
}

/// Parse a config table into format-independent values.
///
/// Rejects keys not declared in `params` and values of the wrong type.
pub fn parse_params(
    config: Option<&toml::Value>,
    params: &[ConfigParam],
) -> Result<HashMap<String, ParamValue>, ProducerError> {
    let table = match config {
        Some(toml::Value::Table(t)) => t,
        Some(_) => return Err(ProducerError::Config("section must be a table".into())),
        None => return Ok(HashMap::new()),
    };

    let known: HashSet<&str> = params.iter().map(|p| p.name.as_str()).collect();
    for key in table.keys() {
        if !known.contains(key.as_str()) {
            return Err(ProducerError::Config(format!("unknown parameter '{key}'")));
        }
    }

    let mut result = HashMap::new();
    for param in params {
        if let Some(v) = table.get(&param.name) {
            result.insert(param.name.clone(), value_to_param_value(v, param)?);
        }
    }
    Ok(result)
}

/// Build `ConfigValues` from parsed key-value pairs.
///
/// For each declared param:
/// - If present in `parsed`: use the value.
/// - If absent with default: use default value.
/// - If absent and required: return error.
pub fn validate_and_build(
    parsed: &HashMap<String, ParamValue>,
    params: &[ConfigParam],
) -> Result<ConfigValues, ProducerError> {
    let mut values = ConfigValues::new();
    for param in params {
        match parsed.get(&param.name) {
            Some(v) => values.set(&param.name, v.clone()),
            None => {
                if let Some(ref default) = param.default {
                    values.set(&param.name, default.clone());
                } else if param.required {
                    return Err(ProducerError::Config(format!(
                        "missing required parameter '{}'",
                        param.name
                    )));
                }
            }
        }
    }
    Ok(values)
}

fn defaults(params: &[ConfigParam]) -> ConfigValues {
    let mut values = ConfigValues::new();
    for param in params {
        if let Some(ref default) = param.default {
            values.set(&param.name, default.clone());
        }
    }
    values
}

fn check_one_of(values: &ConfigValues, name: &str, allowed: &[&str]) -> Result<(), ProducerError> {
    match values.get_str(name) {
        Some(v) if !allowed.contains(&v) => Err(ProducerError::Config(format!(
            "parameter '{name}': expected one of {}, got '{v}'",
            allowed.join(", ")
        ))),
        _ => Ok(()),
    }
}

/// Convert a single TOML value to a ParamValue according to the declared type.
fn value_to_param_value(val: &toml::Value, param: &ConfigParam) -> Result<ParamValue, ProducerError> {
    let mismatch = |expected: &str| {
        ProducerError::Config(format!("parameter '{}': expected {expected}", param.name))
    };

    match param.param_type {
        ParamType::U64 => {
            let i = val.as_integer().ok_or_else(|| mismatch("integer"))?;
            if i < 0 {
                return Err(ProducerError::Config(format!(
                    "parameter '{}': expected non-negative integer, got {i}",
                    param.name
                )));
            }
            Ok(ParamValue::U64(i as u64))
        }
        ParamType::F64 => match val {
            toml::Value::Float(f) => Ok(ParamValue::F64(*f)),
            toml::Value::Integer(i) => Ok(ParamValue::F64(*i as f64)),
            _ => Err(mismatch("number")),
        },
        ParamType::Str => flatten_scalar(val).map(ParamValue::Str).ok_or_else(|| mismatch("scalar")),
        ParamType::StrList => match val {
            toml::Value::Array(items) => items
                .iter()
                .map(|item| flatten_scalar(item).ok_or_else(|| mismatch("list of scalars")))
                .collect::<Result<Vec<_>, _>>()
                .map(ParamValue::StrList),
            // A single broker address is accepted as a one-element list.
            other => flatten_scalar(other)
                .map(|s| ParamValue::StrList(vec![s]))
                .ok_or_else(|| mismatch("list of strings")),
        },
    }
}

/// Scalars are converted to strings directly (no quoting).
fn flatten_scalar(val: &toml::Value) -> Option<String> {
    match val {
        toml::Value::String(s) => Some(s.clone()),
        toml::Value::Integer(i) => Some(i.to_string()),
        toml::Value::Float(f) => Some(f.to_string()),
        toml::Value::Boolean(b) => Some(b.to_string()),
        toml::Value::Datetime(d) => Some(d.to_string()),
        toml::Value::Array(_) | toml::Value::Table(_) => None,
    }
}
