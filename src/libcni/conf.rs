// Copyright (c) 2024 https://github.com/divinerapier/cni-rs
use serde::Serialize;

use super::{
    types::{NetConf, NetworkConfig},
    CNIError, ResultCNI,
};

pub struct ConfigFile {}

impl ConfigFile {
    pub fn config_from_bytes(datas: &[u8]) -> ResultCNI<NetworkConfig> {
        let network: NetConf =
            serde_json::from_slice(datas).map_err(|e| CNIError::Config(e.to_string()))?;
        if network._type.is_empty() {
            return Err(CNIError::Config("missing plugin type".to_string()));
        }
        Ok(NetworkConfig {
            network,
            bytes: datas.to_vec(),
        })
    }

    /// Serialize a typed plugin configuration into the document handed to
    /// the plugin.
    pub fn config_from_plugin<T: Serialize>(conf: &T) -> ResultCNI<NetworkConfig> {
        let bytes = serde_json::to_vec(conf).map_err(|e| CNIError::Config(e.to_string()))?;
        Self::config_from_bytes(&bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_from_bytes() {
        let conf = ConfigFile::config_from_bytes(
            br#"{"type":"ecs-ipam","cniVersion":"0.3.0","ipv4-subnet":"169.254.172.0/22"}"#,
        )
        .unwrap();
        assert_eq!(conf.network._type, "ecs-ipam");
        assert_eq!(conf.network.cni_version, "0.3.0");
        assert!(conf.network.name.is_empty());
    }

    #[test]
    fn test_config_without_type() {
        assert!(ConfigFile::config_from_bytes(br#"{"cniVersion":"0.3.0"}"#).is_err());
        assert!(ConfigFile::config_from_bytes(b"{").is_err());
    }
}
