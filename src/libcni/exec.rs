// Copyright (c) 2024 https://github.com/divinerapier/cni-rs
use log::{debug, warn};
use serde::Deserialize;

use crate::libcni::version::VERSION_COMMAND;
use crate::libcni::{CNIError, ResultCNI};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Default, Clone)]
pub struct ExecArgs {
    pub(crate) command: String,
    pub(crate) containerd_id: String,
    pub(crate) netns: String,
    pub(crate) ifname: String,
    pub(crate) path: String,
}

impl ExecArgs {
    /// The CNI_* variables for the plugin process. They are only set on the
    /// child, never on the calling process.
    pub fn to_env(&self) -> Vec<(String, String)> {
        vec![
            ("CNI_COMMAND".to_string(), self.command.clone()),
            ("CNI_CONTAINERID".to_string(), self.containerd_id.clone()),
            ("CNI_NETNS".to_string(), self.netns.clone()),
            ("CNI_IFNAME".to_string(), self.ifname.clone()),
            ("CNI_PATH".to_string(), self.path.clone()),
        ]
    }
}

pub trait Exec {
    fn exec_plugins(
        &self,
        plugin_path: &Path,
        stdin_data: &[u8],
        environ: Vec<(String, String)>,
    ) -> ResultCNI<Vec<u8>>;
    fn exec_version(&self, plugin_path: &Path) -> ResultCNI<Vec<u8>>;
    fn find_in_path(&self, plugin: &str, paths: &[String]) -> ResultCNI<PathBuf>;
}

/// Error document a plugin prints on stdout when it fails.
#[derive(Deserialize)]
struct PluginError {
    code: u32,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    details: String,
}

#[derive(Debug, Default, Clone)]
pub struct RawExec {
    /// Upper bound for a single plugin run; `None` waits forever.
    pub timeout: Option<Duration>,
}

struct Output {
    status: ExitStatus,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

fn plugin_name(plugin_path: &Path) -> String {
    plugin_path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| plugin_path.to_string_lossy().to_string())
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        buf
    })
}

/// Feeds the config on its own thread so a plugin that never reads stdin
/// cannot hold the caller past the timeout. Dropping the pipe closes stdin.
fn feed<W: Write + Send + 'static>(
    pipe: Option<W>,
    data: Vec<u8>,
) -> thread::JoinHandle<std::io::Result<()>> {
    thread::spawn(move || {
        let Some(mut pipe) = pipe else {
            return Ok(());
        };
        match pipe.write_all(&data) {
            // a plugin that exits without reading its config is judged by its exit status
            Err(e) if e.kind() == ErrorKind::BrokenPipe => Ok(()),
            other => other,
        }
    })
}

impl RawExec {
    pub fn new(timeout: Option<Duration>) -> Self {
        RawExec { timeout }
    }

    fn run(&self, plugin: &str, mut cmd: Command, stdin_data: Option<&[u8]>) -> ResultCNI<Output> {
        let io_err = |source: std::io::Error| CNIError::Io {
            plugin: plugin.to_string(),
            source,
        };

        cmd.stdin(if stdin_data.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(io_err)?;

        let config = stdin_data.map(<[u8]>::to_vec).unwrap_or_default();
        let stdin = feed(child.stdin.take(), config);
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let status = match self.timeout {
            None => child.wait().map_err(io_err)?,
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                loop {
                    if let Some(status) = child.try_wait().map_err(io_err)? {
                        break status;
                    }
                    if Instant::now() >= deadline {
                        warn!("plugin {} timed out after {:?}, killing it", plugin, timeout);
                        let _ = child.kill();
                        let _ = child.wait();
                        // the pipe threads are left detached, a grandchild may still hold the pipes
                        return Err(CNIError::Timeout {
                            plugin: plugin.to_string(),
                            timeout,
                        });
                    }
                    thread::sleep(POLL_INTERVAL);
                }
            }
        };

        match stdin.join() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(io_err(e)),
            Err(_) => warn!("stdin writer for plugin {} panicked", plugin),
        }
        Ok(Output {
            status,
            stdout: stdout.join().unwrap_or_default(),
            stderr: stderr.join().unwrap_or_default(),
        })
    }

    fn check(plugin: &str, output: Output) -> ResultCNI<Vec<u8>> {
        if output.status.success() {
            return Ok(output.stdout);
        }

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        let (code, msg) = match serde_json::from_slice::<PluginError>(&output.stdout) {
            Ok(e) if e.details.is_empty() => (Some(e.code), e.msg),
            Ok(e) => (Some(e.code), format!("{}; {}", e.msg, e.details)),
            Err(_) => (None, format!("{}: {}", output.status, stderr.trim())),
        };
        debug!("plugin {} failed, stdout: {} stderr: {}", plugin, stdout, stderr);
        Err(CNIError::Execute {
            plugin: plugin.to_string(),
            code,
            msg,
            stdout,
            stderr,
        })
    }
}

impl Exec for RawExec {
    fn exec_plugins(
        &self,
        plugin_path: &Path,
        stdin_data: &[u8],
        environ: Vec<(String, String)>,
    ) -> ResultCNI<Vec<u8>> {
        let plugin = plugin_name(plugin_path);
        debug!(
            "send plugin {} config {}",
            plugin,
            String::from_utf8_lossy(stdin_data)
        );

        let mut cmd = Command::new(plugin_path);
        cmd.envs(environ);
        let output = self.run(&plugin, cmd, Some(stdin_data))?;
        Self::check(&plugin, output)
    }

    fn exec_version(&self, plugin_path: &Path) -> ResultCNI<Vec<u8>> {
        let plugin = plugin_name(plugin_path);
        let mut cmd = Command::new(plugin_path);
        cmd.arg(VERSION_COMMAND);
        let output = self.run(&plugin, cmd, None)?;
        Self::check(&plugin, output)
    }

    fn find_in_path(&self, plugin: &str, paths: &[String]) -> ResultCNI<PathBuf> {
        paths
            .iter()
            .map(|dir| Path::new(dir).join(plugin))
            .find(|p| p.is_file())
            .ok_or_else(|| CNIError::NotFound {
                plugin: plugin.to_string(),
                paths: paths.to_vec(),
            })
    }
}
