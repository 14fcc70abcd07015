//! Network plugin configuration, as carried in a ConfigMap's `plugin-config` key.

use serde::{Deserialize, Deserializer};
use std::{collections::BTreeMap, fmt, str::FromStr};

/// Free-form plugin options. Values are normalized to strings when decoded.
pub type OptionMap = BTreeMap<String, String>;

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct PluginConfig {
    #[serde(default, deserialize_with = "null_as_default")]
    pub base_services: Vec<BaseService>,

    #[serde(default, deserialize_with = "null_as_default")]
    pub base_ports: Vec<BasePort>,
}

/// An upstream dependency of the workload.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct BaseService {
    pub depend_service_alias: String,

    #[serde(default)]
    pub depend_service_id: String,

    #[serde(default)]
    pub port: u16,

    #[serde(default)]
    pub protocol: String,

    #[serde(default, deserialize_with = "string_map")]
    pub options: OptionMap,
}

/// A local port the workload exposes to the mesh.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct BasePort {
    pub port: u16,

    /// The port the inbound listener binds. Defaults to `port`.
    #[serde(default)]
    pub listen_port: Option<u16>,

    #[serde(default)]
    pub protocol: String,

    #[serde(default, deserialize_with = "string_map")]
    pub options: OptionMap,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum PluginModel {
    Upstream,
    Downstream,
    InAndOut,
}

#[derive(Debug, thiserror::Error)]
pub enum PluginConfigError {
    #[error("missing label {0}")]
    MissingLabel(&'static str),

    #[error("unsupported plugin model {0:?}")]
    UnsupportedModel(String),

    #[error("missing data key {0}")]
    MissingData(&'static str),

    #[error("malformed plugin config: {0}")]
    Malformed(#[from] serde_json::Error),
}

// === impl PluginConfig ===

impl PluginConfig {
    pub fn from_json(json: &str) -> Result<Self, PluginConfigError> {
        serde_json::from_str(json).map_err(Into::into)
    }

    /// Returns true if there is nothing to configure for this workload.
    pub fn is_empty(&self) -> bool {
        self.base_services.is_empty() && self.base_ports.is_empty()
    }

    pub fn depend_service_ids(&self) -> impl Iterator<Item = &str> + '_ {
        self.base_services
            .iter()
            .map(|svc| svc.depend_service_id.as_str())
            .filter(|id| !id.is_empty())
    }
}

// === impl BasePort ===

impl BasePort {
    pub fn listen_port(&self) -> u16 {
        self.listen_port.filter(|p| *p != 0).unwrap_or(self.port)
    }
}

// === impl PluginModel ===

impl FromStr for PluginModel {
    type Err = PluginConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "net-plugin:up" => Ok(Self::Upstream),
            "net-plugin:down" => Ok(Self::Downstream),
            "net-plugin:in-and-out" => Ok(Self::InAndOut),
            s => Err(PluginConfigError::UnsupportedModel(s.to_string())),
        }
    }
}

impl fmt::Display for PluginModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Upstream => "net-plugin:up".fmt(f),
            Self::Downstream => "net-plugin:down".fmt(f),
            Self::InAndOut => "net-plugin:in-and-out".fmt(f),
        }
    }
}

fn null_as_default<'de, D, T>(d: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(d)?.unwrap_or_default())
}

/// Options are written by several producers; some encode numbers and booleans
/// natively rather than as strings.
fn string_map<'de, D>(d: D) -> Result<OptionMap, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<BTreeMap<String, serde_json::Value>>::deserialize(d)?;
    Ok(raw
        .into_iter()
        .flatten()
        .filter_map(|(k, v)| {
            let v = match v {
                serde_json::Value::Null => return None,
                serde_json::Value::String(s) => s,
                v => v.to_string(),
            };
            Some((k, v))
        })
        .collect())
}
