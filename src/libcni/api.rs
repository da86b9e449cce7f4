use log::{debug, info};

use super::exec::RawExec;
use super::CNIError;
use crate::libcni::exec::{Exec, ExecArgs};
use crate::libcni::result::{parse_result, APIResult};
use crate::libcni::types::NetworkConfig;
use crate::libcni::version::{PluginVersion, VersionInfo};
use crate::libcni::ResultCNI;

pub trait CNI {
    fn add_network(
        &self,
        name: &str,
        cni_version: &str,
        net: &NetworkConfig,
        rt: &RuntimeConf,
    ) -> ResultCNI<Box<dyn APIResult>>;

    fn delete_network(
        &self,
        name: &str,
        cni_version: &str,
        net: &NetworkConfig,
        rt: &RuntimeConf,
    ) -> ResultCNI<()>;

    /// Build version of a plugin binary, from `<plugin> --version`.
    fn plugin_version(&self, plugin: &str) -> ResultCNI<PluginVersion>;

    /// CNI versions a plugin speaks, from the CNI `VERSION` command.
    fn get_version_info(&self, plugin: &str) -> ResultCNI<VersionInfo>;
}

#[derive(Debug, Default, Clone)]
pub struct RuntimeConf {
    pub container_id: String,
    pub net_ns: String,
    pub if_name: String,
}

#[derive(Debug, Default)]
pub struct CNIConfig {
    pub path: Vec<String>,
    pub exec: RawExec,
}

impl CNIConfig {
    fn build_new_config(
        &self,
        name: &str,
        cni_version: &str,
        orig: &NetworkConfig,
    ) -> ResultCNI<NetworkConfig> {
        let config_err = |e: json::Error| CNIError::Config(e.to_string());
        let mut json_object =
            json::parse(String::from_utf8_lossy(&orig.bytes).as_ref()).map_err(config_err)?;

        json_object.insert("name", name).map_err(config_err)?;
        json_object
            .insert("cniVersion", cni_version)
            .map_err(config_err)?;

        let mut network = orig.network.clone();
        network.name = name.to_string();
        network.cni_version = cni_version.to_string();
        Ok(NetworkConfig {
            network,
            bytes: json_object.dump().into_bytes(),
        })
    }

    fn exec_args(&self, command: &str, rt: &RuntimeConf) -> ExecArgs {
        ExecArgs {
            command: command.to_string(),
            containerd_id: rt.container_id.clone(),
            netns: rt.net_ns.clone(),
            ifname: rt.if_name.clone(),
            path: self.path.join(":"),
        }
    }
}

impl CNI for CNIConfig {
    fn add_network(
        &self,
        name: &str,
        cni_version: &str,
        net: &NetworkConfig,
        rt: &RuntimeConf,
    ) -> ResultCNI<Box<dyn APIResult>> {
        let plugin_path = self.exec.find_in_path(&net.network._type, &self.path)?;
        let environ = self.exec_args("ADD", rt);
        let new_conf = self.build_new_config(name, cni_version, net)?;

        let r_result = self
            .exec
            .exec_plugins(&plugin_path, &new_conf.bytes, environ.to_env())?;
        let result = parse_result(&net.network._type, cni_version, &r_result)?;
        info!(
            "plugin {} added {} in {}: {}",
            net.network._type,
            rt.if_name,
            rt.net_ns,
            result.get_json().dump()
        );
        Ok(result)
    }

    fn delete_network(
        &self,
        name: &str,
        cni_version: &str,
        net: &NetworkConfig,
        rt: &RuntimeConf,
    ) -> ResultCNI<()> {
        let plugin_path = self.exec.find_in_path(&net.network._type, &self.path)?;
        let environ = self.exec_args("DEL", rt);
        let new_conf = self.build_new_config(name, cni_version, net)?;

        self.exec
            .exec_plugins(&plugin_path, &new_conf.bytes, environ.to_env())?;
        debug!(
            "plugin {} deleted {} in {}",
            net.network._type, rt.if_name, rt.net_ns
        );
        Ok(())
    }

    fn plugin_version(&self, plugin: &str) -> ResultCNI<PluginVersion> {
        let plugin_path = self.exec.find_in_path(plugin, &self.path)?;
        let out = self.exec.exec_version(&plugin_path)?;
        PluginVersion::parse(plugin, &out)
    }

    fn get_version_info(&self, plugin: &str) -> ResultCNI<VersionInfo> {
        let plugin_path = self.exec.find_in_path(plugin, &self.path)?;
        let environ = ExecArgs {
            command: "VERSION".to_string(),
            path: self.path.join(":"),
            ..Default::default()
        };
        let out = self
            .exec
            .exec_plugins(&plugin_path, b"{}", environ.to_env())?;
        VersionInfo::parse(plugin, &out)
    }
}
