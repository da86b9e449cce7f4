use serde::{Deserialize, Serialize};

/// The fields every plugin configuration document carries.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct NetConf {
    #[serde(rename = "cniVersion", default)]
    pub cni_version: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub _type: String,
}

/// A parsed configuration document together with the exact bytes that are
/// handed to the plugin on stdin.
#[derive(Debug, Default, Clone)]
pub struct NetworkConfig {
    pub network: NetConf,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub dst: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gw: Option<String>,
}

impl Route {
    pub fn new(dst: impl Into<String>) -> Self {
        Route {
            dst: dst.into(),
            gw: None,
        }
    }
}
