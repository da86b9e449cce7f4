//! Plugin configuration documents and the per-task config they are built
//! from.

use std::net::{Ipv4Addr, Ipv6Addr};

use ipnetwork::{IpNetwork, Ipv4Network};
use macaddr::MacAddr6;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::libcni::types::Route;

/// Name of the veth end inside the task namespace.
pub const DEFAULT_ETH_NAME: &str = "ecs-eth0";
/// Name the ENI gets once it is moved into the task namespace.
pub const DEFAULT_ENI_NAME: &str = "eth0";
/// Bridge created on the host for tasks to reach the agent.
pub const DEFAULT_BRIDGE_NAME: &str = "ecs-bridge";
pub const NETNS_FORMAT: &str = "/proc/{}/ns/net";
/// Addresses handed out to task namespaces.
pub const ECS_SUBNET: &str = "169.254.172.0/22";
/// Agent endpoint serving task IAM role credentials.
pub const TASK_IAM_ROLE_ENDPOINT: &str = "169.254.170.2/32";
pub const NETWORK_NAME: &str = "ecs-task-network";

pub const ECS_IPAM_PLUGIN_NAME: &str = "ecs-ipam";
pub const ECS_BRIDGE_PLUGIN_NAME: &str = "ecs-bridge";
pub const ECS_ENI_PLUGIN_NAME: &str = "ecs-eni";

pub const DEFAULT_PLUGINS_PATH: &str = "/amazon-ecs-cni-plugins";
pub const DEFAULT_CNI_VERSION: &str = "0.3.0";

pub fn netns_path(pid: &str) -> String {
    NETNS_FORMAT.replace("{}", pid)
}

fn invalid(msg: impl Into<String>) -> Error {
    Error::Validation(msg.into())
}

fn require(value: &str, field: &str) -> Result<()> {
    if value.is_empty() {
        return Err(invalid(format!("{} is required", field)));
    }
    Ok(())
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IPAMConfig {
    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub _type: String,
    /// Stored by the ipam plugin next to the address.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(rename = "cniVersion", default, skip_serializing_if = "String::is_empty")]
    pub cni_version: String,
    #[serde(rename = "ipv4-subnet", default, skip_serializing_if = "String::is_empty")]
    pub ipv4_subnet: String,
    /// Address to assign or release. Empty asks the plugin to allocate one.
    #[serde(rename = "ipv4-address", default, skip_serializing_if = "String::is_empty")]
    pub ipv4_address: String,
    #[serde(rename = "ipv4-gateway", default, skip_serializing_if = "String::is_empty")]
    pub ipv4_gateway: String,
    #[serde(rename = "ipv4-routes", default, skip_serializing_if = "Vec::is_empty")]
    pub ipv4_routes: Vec<Route>,
}

impl IPAMConfig {
    pub fn validate(&self) -> Result<()> {
        require(&self._type, "ipam type")?;
        require(&self.cni_version, "ipam cniVersion")?;
        let subnet: Ipv4Network = self
            .ipv4_subnet
            .parse()
            .map_err(|e| invalid(format!("ipam subnet {:?}: {}", self.ipv4_subnet, e)))?;

        if !self.ipv4_address.is_empty() {
            let addr = parse_ipv4(&self.ipv4_address)
                .ok_or_else(|| invalid(format!("ipam address {:?}", self.ipv4_address)))?;
            if !subnet.contains(addr) {
                return Err(invalid(format!(
                    "ipam address {} is outside {}",
                    self.ipv4_address, subnet
                )));
            }
        }
        if !self.ipv4_gateway.is_empty() && self.ipv4_gateway.parse::<Ipv4Addr>().is_err() {
            return Err(invalid(format!("ipam gateway {:?}", self.ipv4_gateway)));
        }
        for route in &self.ipv4_routes {
            route
                .dst
                .parse::<IpNetwork>()
                .map_err(|e| invalid(format!("route {:?}: {}", route.dst, e)))?;
        }
        Ok(())
    }

    /// Checks for a document that releases an address. The address only has
    /// to parse: whatever ipam handed out must be releasable.
    pub fn validate_release(&self) -> Result<()> {
        require(&self._type, "ipam type")?;
        require(&self.cni_version, "ipam cniVersion")?;
        if !self.ipv4_address.is_empty() && parse_ipv4(&self.ipv4_address).is_none() {
            return Err(invalid(format!("ipam address {:?}", self.ipv4_address)));
        }
        Ok(())
    }
}

/// Accepts either a bare address or an address with prefix length.
fn parse_ipv4(s: &str) -> Option<Ipv4Addr> {
    s.parse::<Ipv4Addr>()
        .ok()
        .or_else(|| s.parse::<Ipv4Network>().ok().map(|n| n.ip()))
}

/// First host address of a subnet, the default gateway.
pub fn first_host(subnet: &Ipv4Network) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(subnet.network()).wrapping_add(1))
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub _type: String,
    #[serde(rename = "cniVersion", default, skip_serializing_if = "String::is_empty")]
    pub cni_version: String,
    #[serde(rename = "bridge")]
    pub bridge_name: String,
    /// The bridge gets an address and acts as gateway for the namespace.
    #[serde(rename = "isGateway")]
    pub is_gw: bool,
    #[serde(rename = "isDefaultGateway")]
    pub is_default_gw: bool,
    /// Replace a different address already set on the bridge.
    #[serde(rename = "forceAddress")]
    pub force_address: bool,
    #[serde(rename = "ipMasq")]
    pub ip_masq: bool,
    pub mtu: i32,
    #[serde(rename = "hairpinMode")]
    pub hairpin_mode: bool,
    pub ipam: IPAMConfig,
}

impl BridgeConfig {
    pub fn validate(&self) -> Result<()> {
        require(&self._type, "bridge type")?;
        require(&self.cni_version, "bridge cniVersion")?;
        require(&self.bridge_name, "bridge name")?;
        if self.mtu < 0 {
            return Err(invalid(format!("bridge mtu {}", self.mtu)));
        }
        self.ipam.validate()
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ENIConfig {
    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub _type: String,
    #[serde(rename = "cniVersion", default, skip_serializing_if = "String::is_empty")]
    pub cni_version: String,
    #[serde(rename = "eni")]
    pub eni_id: String,
    #[serde(rename = "ipv4-address")]
    pub ipv4_address: String,
    #[serde(rename = "ipv6-address", default, skip_serializing_if = "String::is_empty")]
    pub ipv6_address: String,
    #[serde(rename = "mac")]
    pub mac_address: String,
}

impl ENIConfig {
    pub fn validate(&self) -> Result<()> {
        require(&self._type, "eni type")?;
        require(&self.cni_version, "eni cniVersion")?;
        require(&self.eni_id, "eni id")?;
        require(&self.ipv4_address, "eni ipv4 address")?;
        require(&self.mac_address, "eni mac address")?;
        self.ipv4_address
            .parse::<Ipv4Addr>()
            .map_err(|e| invalid(format!("eni ipv4 address {:?}: {}", self.ipv4_address, e)))?;
        if !self.ipv6_address.is_empty() {
            self.ipv6_address.parse::<Ipv6Addr>().map_err(|e| {
                invalid(format!("eni ipv6 address {:?}: {}", self.ipv6_address, e))
            })?;
        }
        self.mac_address
            .parse::<MacAddr6>()
            .map_err(|e| invalid(format!("eni mac address {:?}: {}", self.mac_address, e)))?;
        Ok(())
    }
}

/// Everything needed to set up or clean up one task namespace.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Config {
    pub plugins_path: String,
    pub min_supported_cni_version: String,
    pub eni_id: String,
    pub container_id: String,
    /// Locates the namespace as `/proc/<pid>/ns/net`.
    pub container_pid: String,
    pub eni_ipv4_address: String,
    pub eni_ipv6_address: String,
    pub eni_mac_address: String,
    /// Empty selects `ecs-bridge`.
    pub bridge_name: String,
    /// Address held in ipam for this task; empty on first setup.
    pub ipam_v4_address: String,
    /// Key stored with the address in ipam.
    pub id: String,
}

impl Config {
    pub fn has_eni(&self) -> bool {
        !self.eni_id.is_empty()
    }

    pub fn effective_bridge_name(&self) -> &str {
        if self.bridge_name.is_empty() {
            DEFAULT_BRIDGE_NAME
        } else {
            &self.bridge_name
        }
    }

    pub fn validate(&self) -> Result<()> {
        require(&self.container_pid, "container pid")?;
        if !self.container_pid.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid(format!("container pid {:?}", self.container_pid)));
        }
        require(&self.min_supported_cni_version, "cni version")?;
        Ok(())
    }

    pub fn netns(&self) -> String {
        netns_path(&self.container_pid)
    }

    /// The ipam document. Carries `ipam_v4_address` when set, which pins
    /// the allocation (or names the address to release).
    pub fn build_ipam_config(&self) -> Result<IPAMConfig> {
        let subnet: Ipv4Network = ECS_SUBNET
            .parse()
            .map_err(|e| invalid(format!("subnet {}: {}", ECS_SUBNET, e)))?;
        let ipam = IPAMConfig {
            _type: ECS_IPAM_PLUGIN_NAME.to_string(),
            id: self.id.clone(),
            cni_version: self.min_supported_cni_version.clone(),
            ipv4_subnet: ECS_SUBNET.to_string(),
            ipv4_address: self.ipam_v4_address.clone(),
            ipv4_gateway: first_host(&subnet).to_string(),
            ipv4_routes: Vec::new(),
        };
        ipam.validate()?;
        Ok(ipam)
    }

    /// The ipam document naming the address to release, which may lie
    /// outside the task subnet.
    pub fn build_ipam_release_config(&self) -> Result<IPAMConfig> {
        let ipam = IPAMConfig {
            _type: ECS_IPAM_PLUGIN_NAME.to_string(),
            id: self.id.clone(),
            cni_version: self.min_supported_cni_version.clone(),
            ipv4_subnet: ECS_SUBNET.to_string(),
            ipv4_address: self.ipam_v4_address.clone(),
            ipv4_gateway: String::new(),
            ipv4_routes: Vec::new(),
        };
        ipam.validate_release()?;
        Ok(ipam)
    }

    /// The bridge document around `ipam`, with the credentials endpoint
    /// routed into the namespace.
    pub fn build_bridge_config(&self, mut ipam: IPAMConfig) -> Result<BridgeConfig> {
        if !ipam.ipv4_routes.iter().any(|r| r.dst == TASK_IAM_ROLE_ENDPOINT) {
            ipam.ipv4_routes.push(Route::new(TASK_IAM_ROLE_ENDPOINT));
        }
        let bridge = BridgeConfig {
            _type: ECS_BRIDGE_PLUGIN_NAME.to_string(),
            cni_version: self.min_supported_cni_version.clone(),
            bridge_name: self.effective_bridge_name().to_string(),
            is_gw: true,
            is_default_gw: false,
            force_address: true,
            ip_masq: false,
            mtu: 0,
            hairpin_mode: false,
            ipam,
        };
        bridge.validate()?;
        Ok(bridge)
    }

    pub fn build_eni_config(&self) -> Result<ENIConfig> {
        if !self.has_eni() {
            return Err(invalid("no eni in task config"));
        }
        let eni = ENIConfig {
            _type: ECS_ENI_PLUGIN_NAME.to_string(),
            cni_version: self.min_supported_cni_version.clone(),
            eni_id: self.eni_id.clone(),
            ipv4_address: self.eni_ipv4_address.clone(),
            ipv6_address: self.eni_ipv6_address.clone(),
            mac_address: self.eni_mac_address.clone(),
        };
        eni.validate()?;
        Ok(eni)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        Config {
            min_supported_cni_version: DEFAULT_CNI_VERSION.to_string(),
            container_id: "container".to_string(),
            container_pid: "1234".to_string(),
            id: "task-arn".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_ipam_config() {
        let ipam = config().build_ipam_config().unwrap();
        assert_eq!(ipam._type, "ecs-ipam");
        assert_eq!(ipam.ipv4_subnet, "169.254.172.0/22");
        assert_eq!(ipam.ipv4_gateway, "169.254.172.1");
        assert_eq!(ipam.id, "task-arn");
        assert!(ipam.ipv4_address.is_empty());
        assert!(ipam.ipv4_routes.is_empty());

        let json = serde_json::to_value(&ipam).unwrap();
        assert_eq!(json["ipv4-subnet"], "169.254.172.0/22");
        assert!(json.get("ipv4-address").is_none());
    }

    #[test]
    fn test_ipam_config_release_address() {
        let mut cfg = config();
        cfg.ipam_v4_address = "169.254.172.20/22".to_string();
        let ipam = cfg.build_ipam_config().unwrap();
        assert_eq!(ipam.ipv4_address, "169.254.172.20/22");

        cfg.ipam_v4_address = "10.0.0.1".to_string();
        assert!(matches!(cfg.build_ipam_config(), Err(Error::Validation(_))));
    }

    #[test]
    fn test_ipam_release_config_outside_subnet() {
        let mut cfg = config();
        cfg.ipam_v4_address = "10.1.2.3/24".to_string();
        let ipam = cfg.build_ipam_release_config().unwrap();
        assert_eq!(ipam.ipv4_address, "10.1.2.3/24");
        assert_eq!(ipam.id, "task-arn");

        cfg.ipam_v4_address = "not-an-address".to_string();
        assert!(matches!(
            cfg.build_ipam_release_config(),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_bridge_config() {
        let cfg = config();
        let bridge = cfg
            .build_bridge_config(cfg.build_ipam_config().unwrap())
            .unwrap();
        assert_eq!(bridge.bridge_name, DEFAULT_BRIDGE_NAME);
        assert!(bridge.is_gw);
        assert!(!bridge.is_default_gw);
        assert!(bridge.force_address);
        assert!(!bridge.ip_masq);
        assert_eq!(bridge.ipam.ipv4_subnet, ECS_SUBNET);
        assert_eq!(
            bridge.ipam.ipv4_routes,
            vec![Route::new(TASK_IAM_ROLE_ENDPOINT)]
        );

        let json = serde_json::to_value(&bridge).unwrap();
        assert_eq!(json["bridge"], "ecs-bridge");
        assert_eq!(json["isGateway"], true);
        assert_eq!(json["forceAddress"], true);
        assert_eq!(json["ipMasq"], false);
        assert_eq!(json["ipam"]["ipv4-routes"][0]["dst"], "169.254.170.2/32");
    }

    #[test]
    fn test_bridge_route_not_duplicated() {
        let mut cfg = config();
        cfg.bridge_name = "br-custom".to_string();
        let mut ipam = cfg.build_ipam_config().unwrap();
        ipam.ipv4_routes.push(Route::new(TASK_IAM_ROLE_ENDPOINT));
        let bridge = cfg.build_bridge_config(ipam).unwrap();
        assert_eq!(bridge.bridge_name, "br-custom");
        assert_eq!(bridge.ipam.ipv4_routes.len(), 1);
    }

    #[test]
    fn test_eni_config() {
        let mut cfg = config();
        cfg.eni_id = "eni-123".to_string();
        cfg.eni_ipv4_address = "10.0.0.5".to_string();
        cfg.eni_mac_address = "02:7b:64:49:b1:40".to_string();
        let eni = cfg.build_eni_config().unwrap();
        assert_eq!(eni._type, "ecs-eni");

        let json = serde_json::to_value(&eni).unwrap();
        assert_eq!(json["eni"], "eni-123");
        assert_eq!(json["mac"], "02:7b:64:49:b1:40");
        assert!(json.get("ipv6-address").is_none());
    }

    #[test]
    fn test_eni_config_requires_mac() {
        let mut cfg = config();
        cfg.eni_id = "eni-123".to_string();
        cfg.eni_ipv4_address = "10.0.0.5".to_string();
        match cfg.build_eni_config() {
            Err(Error::Validation(msg)) => assert!(msg.contains("mac"), "{}", msg),
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn test_eni_config_bad_addresses() {
        let mut cfg = config();
        cfg.eni_id = "eni-123".to_string();
        cfg.eni_mac_address = "02:7b:64:49:b1:40".to_string();
        cfg.eni_ipv4_address = "10.0.0.300".to_string();
        assert!(cfg.build_eni_config().is_err());

        cfg.eni_ipv4_address = "10.0.0.5".to_string();
        cfg.eni_ipv6_address = "10.0.0.6".to_string();
        assert!(cfg.build_eni_config().is_err());

        cfg.eni_ipv6_address = "2001:db8::5".to_string();
        assert!(cfg.build_eni_config().is_ok());

        cfg.eni_mac_address = "02:7b:64".to_string();
        assert!(cfg.build_eni_config().is_err());
    }

    #[test]
    fn test_config_validate() {
        assert!(config().validate().is_ok());

        let mut cfg = config();
        cfg.container_pid = String::new();
        assert!(cfg.validate().is_err());
        cfg.container_pid = "12a".to_string();
        assert!(cfg.validate().is_err());
        assert_eq!(netns_path("1234"), "/proc/1234/ns/net");
    }
}
