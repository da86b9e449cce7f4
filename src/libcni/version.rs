use std::fmt;

use serde::{Deserialize, Serialize};

use super::{CNIError, ResultCNI};

/// Flag passed to a plugin binary to print its build version.
pub const VERSION_COMMAND: &str = "--version";

/// Build information printed by a plugin for `--version`.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginVersion {
    pub version: String,
    #[serde(default)]
    pub dirty: bool,
    #[serde(rename = "gitShortHash", default)]
    pub git_short_hash: String,
}

impl PluginVersion {
    pub fn parse(plugin: &str, data: &[u8]) -> ResultCNI<PluginVersion> {
        let decode_err = |reason: String| CNIError::Decode {
            plugin: plugin.to_string(),
            reason,
            output: String::from_utf8_lossy(data).to_string(),
        };
        let version: PluginVersion =
            serde_json::from_slice(data).map_err(|e| decode_err(e.to_string()))?;
        if version.version.is_empty() {
            return Err(decode_err("empty version".to_string()));
        }
        Ok(version)
    }
}

// "@" marks a build from a dirty tree
impl fmt::Display for PluginVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.dirty {
            write!(f, "@")?;
        }
        write!(f, "{}-{}", self.git_short_hash, self.version)
    }
}

/// Output of the CNI `VERSION` command.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfo {
    #[serde(rename = "cniVersion", default)]
    pub cni_version: String,
    #[serde(rename = "supportedVersions", default)]
    pub supported_versions: Vec<String>,
}

impl VersionInfo {
    pub fn parse(plugin: &str, data: &[u8]) -> ResultCNI<VersionInfo> {
        serde_json::from_slice(data).map_err(|e| CNIError::Decode {
            plugin: plugin.to_string(),
            reason: e.to_string(),
            output: String::from_utf8_lossy(data).to_string(),
        })
    }

    pub fn supports(&self, cni_version: &str) -> bool {
        self.supported_versions.iter().any(|v| v == cni_version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plugin_version_string() {
        let v = PluginVersion::parse(
            "ecs-bridge",
            br#"{"version":"2017.06.0","dirty":true,"gitShortHash":"226db36"}"#,
        )
        .unwrap();
        assert_eq!(v.to_string(), "@226db36-2017.06.0");

        let v = PluginVersion::parse(
            "ecs-bridge",
            br#"{"version":"2017.06.0","dirty":false,"gitShortHash":"226db36"}"#,
        )
        .unwrap();
        assert_eq!(v.to_string(), "226db36-2017.06.0");
    }

    #[test]
    fn test_plugin_version_unparseable() {
        assert!(PluginVersion::parse("ecs-eni", b"v1.0").is_err());
        assert!(PluginVersion::parse("ecs-eni", br#"{"dirty":false}"#).is_err());
    }

    #[test]
    fn test_version_info_supports() {
        let info = VersionInfo::parse(
            "ecs-ipam",
            br#"{"cniVersion":"0.3.0","supportedVersions":["0.1.0","0.2.0","0.3.0"]}"#,
        )
        .unwrap();
        assert!(info.supports("0.3.0"));
        assert!(!info.supports("0.4.0"));
    }
}
