use std::fmt;
use std::time::Duration;

use log::{debug, error, info, warn};
use serde::Serialize;

use crate::error::{Error, Result, StepFailure};
use crate::libcni::{
    api::{CNIConfig, CNI},
    conf::ConfigFile,
    exec::RawExec,
    result::APIResult,
    types::NetworkConfig,
};
use crate::namespace::Namespace;
use crate::types::{
    Config, ENIConfig, IPAMConfig, DEFAULT_CNI_VERSION, DEFAULT_ENI_NAME, DEFAULT_ETH_NAME,
    DEFAULT_PLUGINS_PATH, ECS_BRIDGE_PLUGIN_NAME, ECS_ENI_PLUGIN_NAME, ECS_IPAM_PLUGIN_NAME,
    NETWORK_NAME,
};

/// Bound on a single plugin run unless the caller picks another.
pub const DEFAULT_PLUGIN_TIMEOUT: Duration = Duration::from_secs(60);

/// Task network operations used by the agent.
pub trait CNIClient {
    /// Build version of a plugin, `[@]<hash>-<version>`.
    fn version(&self, plugin: &str) -> Result<String>;
    fn setup_ns(&self, cfg: &Config) -> Result<()>;
    fn cleanup_ns(&self, cfg: &Config) -> Result<()>;
    /// Release the task address from ipam without touching any device.
    fn release_ip_resource(&self, cfg: &Config) -> Result<()>;
}

/// One plugin invocation in the task network pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginStep {
    IPAM,
    Bridge,
    ENI,
}

impl PluginStep {
    pub fn plugin_type(&self) -> &'static str {
        match self {
            PluginStep::IPAM => ECS_IPAM_PLUGIN_NAME,
            PluginStep::Bridge => ECS_BRIDGE_PLUGIN_NAME,
            PluginStep::ENI => ECS_ENI_PLUGIN_NAME,
        }
    }

    pub fn if_name(&self) -> &'static str {
        match self {
            PluginStep::IPAM | PluginStep::Bridge => DEFAULT_ETH_NAME,
            PluginStep::ENI => DEFAULT_ENI_NAME,
        }
    }
}

impl fmt::Display for PluginStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PluginStep::IPAM => write!(f, "ipam"),
            PluginStep::Bridge => write!(f, "bridge"),
            PluginStep::ENI => write!(f, "eni"),
        }
    }
}

/// Setup order. Cleanup walks it backwards.
pub fn steps(cfg: &Config) -> Vec<PluginStep> {
    let mut steps = vec![PluginStep::IPAM, PluginStep::Bridge];
    if cfg.has_eni() {
        steps.push(PluginStep::ENI);
    }
    steps
}

fn raw_cni(plugins_path: &str, timeout: Duration) -> CNIConfig {
    CNIConfig {
        path: vec![plugins_path.to_string()],
        exec: RawExec::new(Some(timeout)),
    }
}

fn to_network<T: Serialize>(conf: &T) -> Result<NetworkConfig> {
    ConfigFile::config_from_plugin(conf).map_err(|e| Error::Validation(e.to_string()))
}

/// Documents validated before the first plugin runs.
struct Plan {
    ipam: IPAMConfig,
    eni: Option<ENIConfig>,
}

/// What a setup call has done so far.
#[derive(Default)]
struct SetupState {
    completed: Vec<PluginStep>,
    address: String,
    gateway: Option<String>,
}

impl SetupState {
    /// The ipam section for the bridge, pinned to what ipam handed out.
    fn pinned(&self, mut ipam: IPAMConfig) -> IPAMConfig {
        if !self.address.is_empty() {
            ipam.ipv4_address = self.address.clone();
        }
        if let Some(gateway) = &self.gateway {
            ipam.ipv4_gateway = gateway.clone();
        }
        ipam
    }

    fn record(&mut self, step: PluginStep, result: &dyn APIResult) -> Result<()> {
        self.completed.push(step);
        if step != PluginStep::IPAM {
            return Ok(());
        }
        match result.to_current().first_ipv4() {
            Some((address, gateway)) => {
                self.address = address.to_string();
                self.gateway = gateway;
                Ok(())
            }
            None => Err(Error::from_cni(
                step,
                crate::libcni::CNIError::Decode {
                    plugin: step.plugin_type().to_string(),
                    reason: "no ipv4 address in ipam result".to_string(),
                    output: result.get_json().dump(),
                },
            )),
        }
    }
}

/// Drives the ecs plugins for task namespaces. Holds no per-task state, so
/// one client serves concurrent calls for different containers.
pub struct Client {
    cni_version: String,
    /// Plugin directory of the built-in invoker, `None` when one was injected.
    plugins_path: Option<String>,
    timeout: Duration,
    libcni: Box<dyn CNI + Send + Sync>,
}

impl Default for Client {
    fn default() -> Self {
        Self::new(None, None, None)
    }
}

impl Client {
    pub fn new(
        plugins_path: Option<String>,
        cni_version: Option<String>,
        timeout: Option<Duration>,
    ) -> Self {
        let plugins_path = plugins_path.unwrap_or_else(|| DEFAULT_PLUGINS_PATH.to_string());
        let timeout = timeout.unwrap_or(DEFAULT_PLUGIN_TIMEOUT);
        let mut client = Self::with_cni(cni_version, Box::new(raw_cni(&plugins_path, timeout)));
        client.plugins_path = Some(plugins_path);
        client.timeout = timeout;
        client
    }

    /// Client for the plugin directory and cni version named in `cfg`.
    pub fn from_config(cfg: &Config, timeout: Option<Duration>) -> Self {
        let non_empty = |s: &str| (!s.is_empty()).then(|| s.to_string());
        Self::new(
            non_empty(&cfg.plugins_path),
            non_empty(&cfg.min_supported_cni_version),
            timeout,
        )
    }

    pub fn with_cni(cni_version: Option<String>, libcni: Box<dyn CNI + Send + Sync>) -> Self {
        Client {
            cni_version: cni_version.unwrap_or_else(|| DEFAULT_CNI_VERSION.to_string()),
            plugins_path: None,
            timeout: DEFAULT_PLUGIN_TIMEOUT,
            libcni,
        }
    }

    /// Fails unless `plugin` speaks the minimum cni version of `cfg`, or the
    /// client's version when `cfg` names none.
    pub fn check_cni_version(&self, plugin: &str, cfg: &Config) -> Result<()> {
        let wanted = if cfg.min_supported_cni_version.is_empty() {
            &self.cni_version
        } else {
            &cfg.min_supported_cni_version
        };
        let local = self.invoker(cfg);
        let info = self
            .cni(&local)
            .get_version_info(plugin)
            .map_err(|source| Error::Version {
                plugin: plugin.to_string(),
                source,
            })?;
        if !info.supports(wanted) {
            return Err(Error::Validation(format!(
                "plugin {} does not support cni version {}, supported: {:?}",
                plugin, wanted, info.supported_versions
            )));
        }
        Ok(())
    }

    /// An invoker for `cfg.plugins_path` when it differs from the client's
    /// own directory.
    fn invoker(&self, cfg: &Config) -> Option<CNIConfig> {
        if cfg.plugins_path.is_empty() {
            return None;
        }
        match &self.plugins_path {
            Some(path) if *path == cfg.plugins_path => None,
            Some(_) => Some(raw_cni(&cfg.plugins_path, self.timeout)),
            None => {
                warn!(
                    "ignoring plugins path {} for an injected plugin invoker",
                    cfg.plugins_path
                );
                None
            }
        }
    }

    fn cni<'a>(&'a self, local: &'a Option<CNIConfig>) -> &'a dyn CNI {
        match local {
            Some(cni) => cni,
            None => self.libcni.as_ref(),
        }
    }

    fn effective(&self, cfg: &Config) -> Result<Config> {
        let mut cfg = cfg.clone();
        if cfg.min_supported_cni_version.is_empty() {
            cfg.min_supported_cni_version = self.cni_version.clone();
        }
        cfg.validate()?;
        Ok(cfg)
    }

    fn plan(cfg: &Config) -> Result<Plan> {
        let eni = if cfg.has_eni() {
            Some(cfg.build_eni_config()?)
        } else {
            None
        };
        Ok(Plan {
            ipam: cfg.build_ipam_config()?,
            eni,
        })
    }

    fn setup_config(
        &self,
        step: PluginStep,
        cfg: &Config,
        plan: &Plan,
        state: &SetupState,
    ) -> Result<NetworkConfig> {
        match step {
            PluginStep::IPAM => to_network(&plan.ipam),
            PluginStep::Bridge => {
                to_network(&cfg.build_bridge_config(state.pinned(plan.ipam.clone()))?)
            }
            PluginStep::ENI => match &plan.eni {
                Some(eni) => to_network(eni),
                None => Err(Error::Validation("no eni in task config".to_string())),
            },
        }
    }

    fn cleanup_config(step: PluginStep, cfg: &Config) -> Result<NetworkConfig> {
        match step {
            PluginStep::IPAM => to_network(&cfg.build_ipam_release_config()?),
            PluginStep::Bridge => to_network(&cfg.build_bridge_config(cfg.build_ipam_config()?)?),
            PluginStep::ENI => to_network(&cfg.build_eni_config()?),
        }
    }

    fn add(
        cni: &dyn CNI,
        step: PluginStep,
        net: &NetworkConfig,
        ns: &Namespace,
    ) -> Result<Box<dyn APIResult>> {
        debug!("adding {} to {}", step, ns.path());
        cni.add_network(
            NETWORK_NAME,
            &net.network.cni_version,
            net,
            &ns.config(step.if_name()),
        )
        .map_err(|e| Error::from_cni(step, e))
    }

    fn delete(cni: &dyn CNI, step: PluginStep, cfg: &Config, ns: &Namespace) -> Result<()> {
        let net = Self::cleanup_config(step, cfg)?;
        debug!("deleting {} from {}", step, ns.path());
        match cni.delete_network(
            NETWORK_NAME,
            &net.network.cni_version,
            &net,
            &ns.config(step.if_name()),
        ) {
            Ok(()) => Ok(()),
            Err(e) if e.is_absent() => {
                info!("{} already released in {}: {}", step, ns.path(), e);
                Ok(())
            }
            Err(e) => Err(Error::from_cni(step, e)),
        }
    }

    /// Runs every step even when an earlier one fails.
    fn teardown<I>(cni: &dyn CNI, cfg: &Config, ns: &Namespace, steps: I) -> Vec<StepFailure>
    where
        I: IntoIterator<Item = PluginStep>,
    {
        let mut failures = Vec::new();
        for step in steps {
            if let Err(error) = Self::delete(cni, step, cfg, ns) {
                warn!("failed to delete {} from {}: {}", step, ns.path(), error);
                failures.push(StepFailure { step, error });
            }
        }
        failures
    }

    fn unwind(
        cni: &dyn CNI,
        cfg: &Config,
        ns: &Namespace,
        state: &SetupState,
        original: Error,
    ) -> Error {
        warn!(
            "setting up {} failed, unwinding {:?}: {}",
            ns.path(),
            state.completed,
            original
        );
        let mut release = cfg.clone();
        if !state.address.is_empty() {
            release.ipam_v4_address = state.address.clone();
        }
        let failures = Self::teardown(cni, &release, ns, state.completed.iter().rev().copied());
        if failures.is_empty() {
            return original;
        }
        error!(
            "unwinding {} left {} step(s) behind",
            ns.path(),
            failures.len()
        );
        Error::Unwind {
            original: Box::new(original),
            failures,
        }
    }
}

impl CNIClient for Client {
    fn version(&self, plugin: &str) -> Result<String> {
        let version = self
            .libcni
            .plugin_version(plugin)
            .map_err(|source| Error::Version {
                plugin: plugin.to_string(),
                source,
            })?;
        Ok(version.to_string())
    }

    fn setup_ns(&self, cfg: &Config) -> Result<()> {
        let cfg = self.effective(cfg)?;
        let plan = Self::plan(&cfg)?;
        let ns = Namespace::from_config(&cfg);
        let local = self.invoker(&cfg);
        let cni = self.cni(&local);
        info!(
            "setting up task network for container {} in {}",
            cfg.container_id,
            ns.path()
        );

        let mut state = SetupState {
            address: cfg.ipam_v4_address.clone(),
            ..Default::default()
        };
        for step in steps(&cfg) {
            let result = self
                .setup_config(step, &cfg, &plan, &state)
                .and_then(|net| Self::add(cni, step, &net, &ns))
                .and_then(|r| state.record(step, r.as_ref()));
            if let Err(e) = result {
                return Err(Self::unwind(cni, &cfg, &ns, &state, e));
            }
        }

        info!(
            "task network ready in {} with address {}",
            ns.path(),
            state.address
        );
        Ok(())
    }

    fn cleanup_ns(&self, cfg: &Config) -> Result<()> {
        let cfg = self.effective(cfg)?;
        let ns = Namespace::from_config(&cfg);
        info!(
            "cleaning up task network for container {} in {}",
            cfg.container_id,
            ns.path()
        );

        let local = self.invoker(&cfg);
        let failures = Self::teardown(self.cni(&local), &cfg, &ns, steps(&cfg).into_iter().rev());
        if !failures.is_empty() {
            return Err(Error::Cleanup { failures });
        }
        Ok(())
    }

    fn release_ip_resource(&self, cfg: &Config) -> Result<()> {
        let cfg = self.effective(cfg)?;
        let ns = Namespace::from_config(&cfg);
        let local = self.invoker(&cfg);
        let failures = Self::teardown(self.cni(&local), &cfg, &ns, [PluginStep::IPAM]);
        if !failures.is_empty() {
            return Err(Error::Cleanup { failures });
        }
        Ok(())
    }
}
