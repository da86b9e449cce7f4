use crate::libcni::api::RuntimeConf;
use crate::types::{netns_path, Config};

/// The network namespace of one task container.
#[derive(Debug, Clone, Default)]
pub struct Namespace {
    id: String,
    path: String,
}

impl Namespace {
    pub fn new(id: String, path: String) -> Self {
        Self { id, path }
    }

    pub fn from_config(cfg: &Config) -> Self {
        Self::new(cfg.container_id.clone(), netns_path(&cfg.container_pid))
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn config(&self, ifname: &str) -> RuntimeConf {
        RuntimeConf {
            container_id: self.id.clone(),
            net_ns: self.path.clone(),
            if_name: ifname.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_conf() {
        let cfg = Config {
            container_id: "c1".to_string(),
            container_pid: "1234".to_string(),
            ..Default::default()
        };
        let ns = Namespace::from_config(&cfg);
        assert_eq!(ns.path(), "/proc/1234/ns/net");

        let rt = ns.config("ecs-eth0");
        assert_eq!(rt.container_id, "c1");
        assert_eq!(rt.net_ns, "/proc/1234/ns/net");
        assert_eq!(rt.if_name, "ecs-eth0");
    }
}
