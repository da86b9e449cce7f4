use std::fmt::Debug;

use serde::Serialize;

use super::{CNIError, ResultCNI};

const LEGACY_VERSIONS: [&str; 2] = ["0.1.0", "0.2.0"];

pub trait APIResult: Debug + Send + Sync {
    fn version(&self) -> String;
    fn get_json(&self) -> json::JsonValue;
    /// The result expressed in the current (0.3.0 and later) layout.
    fn to_current(&self) -> result100::Result;
}

fn to_json<T: Serialize>(value: &T) -> json::JsonValue {
    serde_json::to_string(value)
        .ok()
        .and_then(|s| json::parse(&s).ok())
        .unwrap_or(json::JsonValue::Null)
}

/// Decode the stdout of a successful ADD. The layout is chosen by the
/// `cniVersion` the plugin reports, falling back to the version that was
/// requested in the configuration.
pub fn parse_result(plugin: &str, requested: &str, data: &[u8]) -> ResultCNI<Box<dyn APIResult>> {
    let decode_err = |reason: String| CNIError::Decode {
        plugin: plugin.to_string(),
        reason,
        output: String::from_utf8_lossy(data).to_string(),
    };

    let value: serde_json::Value =
        serde_json::from_slice(data).map_err(|e| decode_err(e.to_string()))?;
    if !value.is_object() {
        return Err(decode_err("result is not a json object".to_string()));
    }
    let version = value
        .get("cniVersion")
        .and_then(|v| v.as_str())
        .unwrap_or(requested)
        .to_string();

    if LEGACY_VERSIONS.contains(&version.as_str()) {
        let mut r: result020::Result =
            serde_json::from_value(value).map_err(|e| decode_err(e.to_string()))?;
        r.cni_version = version;
        Ok(Box::new(r))
    } else {
        let mut r: result100::Result =
            serde_json::from_value(value).map_err(|e| decode_err(e.to_string()))?;
        r.cni_version = version;
        Ok(Box::new(r))
    }
}

pub mod result100 {
    use ipnetwork::Ipv4Network;
    use serde::{Deserialize, Serialize};

    use crate::libcni::types::Route;

    #[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Interface {
        pub name: String,
        #[serde(default, skip_serializing_if = "String::is_empty")]
        pub mac: String,
        #[serde(default, skip_serializing_if = "String::is_empty")]
        pub sandbox: String,
    }

    #[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
    pub struct IPConfig {
        /// Only present in 0.3.x results.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub version: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub interface: Option<usize>,
        pub address: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub gateway: Option<String>,
    }

    #[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
    pub struct DNS {
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        pub nameservers: Vec<String>,
        #[serde(default, skip_serializing_if = "String::is_empty")]
        pub domain: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        pub search: Vec<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        pub options: Vec<String>,
    }

    #[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Result {
        #[serde(rename = "cniVersion", default)]
        pub cni_version: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        pub interfaces: Vec<Interface>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        pub ips: Vec<IPConfig>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        pub routes: Vec<Route>,
        #[serde(default)]
        pub dns: DNS,
    }

    impl Result {
        /// First address in the result that parses as an IPv4 CIDR.
        pub fn first_ipv4(&self) -> Option<(Ipv4Network, Option<String>)> {
            self.ips.iter().find_map(|ip| {
                ip.address
                    .parse::<Ipv4Network>()
                    .ok()
                    .map(|net| (net, ip.gateway.clone()))
            })
        }
    }

    impl super::APIResult for Result {
        fn version(&self) -> String {
            self.cni_version.clone()
        }

        fn get_json(&self) -> json::JsonValue {
            super::to_json(self)
        }

        fn to_current(&self) -> Result {
            self.clone()
        }
    }
}

pub mod result020 {
    use serde::{Deserialize, Serialize};

    use super::result100;
    use crate::libcni::types::Route;

    #[derive(Debug, Default, Clone, Serialize, Deserialize)]
    pub struct IPConfig {
        pub ip: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub gateway: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        pub routes: Vec<Route>,
    }

    #[derive(Debug, Default, Clone, Serialize, Deserialize)]
    pub struct Result {
        #[serde(rename = "cniVersion", default)]
        pub cni_version: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub ip4: Option<IPConfig>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub ip6: Option<IPConfig>,
        #[serde(default)]
        pub dns: result100::DNS,
    }

    impl super::APIResult for Result {
        fn version(&self) -> String {
            self.cni_version.clone()
        }

        fn get_json(&self) -> json::JsonValue {
            super::to_json(self)
        }

        fn to_current(&self) -> result100::Result {
            let mut current = result100::Result {
                cni_version: self.cni_version.clone(),
                dns: self.dns.clone(),
                ..Default::default()
            };
            for (family, ip) in [("4", &self.ip4), ("6", &self.ip6)] {
                if let Some(ip) = ip {
                    current.ips.push(result100::IPConfig {
                        version: Some(family.to_string()),
                        interface: None,
                        address: ip.ip.clone(),
                        gateway: ip.gateway.clone(),
                    });
                    current.routes.extend(ip.routes.iter().cloned());
                }
            }
            current
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_current_result() {
        let out = br#"{
            "cniVersion": "0.3.0",
            "interfaces": [{"name": "ecs-eth0", "sandbox": "/proc/1234/ns/net"}],
            "ips": [{"version": "4", "address": "169.254.172.5/22", "gateway": "169.254.172.1"}],
            "routes": [{"dst": "169.254.170.2/32"}]
        }"#;
        let r = parse_result("ecs-ipam", "0.3.0", out).unwrap();
        assert_eq!(r.version(), "0.3.0");
        let current = r.to_current();
        let (addr, gw) = current.first_ipv4().unwrap();
        assert_eq!(addr.to_string(), "169.254.172.5/22");
        assert_eq!(gw.as_deref(), Some("169.254.172.1"));
        assert_eq!(current.routes[0].dst, "169.254.170.2/32");
        assert_eq!(r.get_json()["interfaces"][0]["name"], "ecs-eth0");
    }

    #[test]
    fn test_parse_legacy_result() {
        let out = br#"{
            "cniVersion": "0.2.0",
            "ip4": {"ip": "169.254.172.9/22", "gateway": "169.254.172.1",
                    "routes": [{"dst": "0.0.0.0/0"}]}
        }"#;
        let r = parse_result("ecs-bridge", "0.3.0", out).unwrap();
        assert_eq!(r.version(), "0.2.0");
        let current = r.to_current();
        assert_eq!(current.ips.len(), 1);
        assert_eq!(current.ips[0].version.as_deref(), Some("4"));
        assert_eq!(current.ips[0].address, "169.254.172.9/22");
        assert_eq!(current.routes, vec![crate::libcni::types::Route::new("0.0.0.0/0")]);
    }

    #[test]
    fn test_missing_version_uses_requested() {
        let r = parse_result("ecs-eni", "0.3.0", br#"{"ips": []}"#).unwrap();
        assert_eq!(r.version(), "0.3.0");
    }

    #[test]
    fn test_malformed_result() {
        for out in [&b""[..], b"not json", b"[1, 2]"] {
            match parse_result("ecs-ipam", "0.3.0", out) {
                Err(CNIError::Decode { plugin, .. }) => assert_eq!(plugin, "ecs-ipam"),
                other => panic!("expected decode error, got {:?}", other),
            }
        }
    }
}
