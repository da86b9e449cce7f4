pub mod api;
pub mod conf;
pub mod exec;
pub mod result;
pub mod types;
pub mod version;

use std::time::Duration;
use thiserror::Error;

/// CNI error code for "container unknown or does not exist".
pub const ERR_UNKNOWN_CONTAINER: u32 = 3;

pub type ResultCNI<T> = std::result::Result<T, CNIError>;

#[derive(Debug, Error)]
pub enum CNIError {
    #[error("plugin {plugin} not found in {paths:?}")]
    NotFound { plugin: String, paths: Vec<String> },

    #[error("failed to run plugin {plugin}: {source}")]
    Io {
        plugin: String,
        #[source]
        source: std::io::Error,
    },

    #[error("plugin {plugin} failed: {msg}")]
    Execute {
        plugin: String,
        code: Option<u32>,
        msg: String,
        stdout: String,
        stderr: String,
    },

    #[error("plugin {plugin} did not finish within {timeout:?}")]
    Timeout { plugin: String, timeout: Duration },

    #[error("malformed output from plugin {plugin}: {reason}")]
    Decode {
        plugin: String,
        reason: String,
        output: String,
    },

    #[error("invalid network config: {0}")]
    Config(String),
}

impl CNIError {
    /// Whether the plugin reported that the resource it was asked to
    /// release was never held.
    pub fn is_absent(&self) -> bool {
        match self {
            CNIError::Execute { code, msg, .. } => {
                if *code == Some(ERR_UNKNOWN_CONTAINER) {
                    return true;
                }
                let msg = msg.to_lowercase();
                ["not found", "does not exist", "no such"]
                    .iter()
                    .any(|m| msg.contains(m))
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn execute(code: Option<u32>, msg: &str) -> CNIError {
        CNIError::Execute {
            plugin: "ecs-ipam".to_string(),
            code,
            msg: msg.to_string(),
            stdout: String::new(),
            stderr: String::new(),
        }
    }

    #[test]
    fn test_is_absent() {
        assert!(execute(Some(3), "whatever").is_absent());
        assert!(execute(Some(999), "ip 169.254.172.2 Not Found in db").is_absent());
        assert!(execute(None, "link ecs-eth0 does not exist").is_absent());
        assert!(!execute(Some(11), "permission denied").is_absent());
        assert!(!CNIError::Timeout {
            plugin: "ecs-eni".to_string(),
            timeout: Duration::from_secs(1)
        }
        .is_absent());
    }
}
