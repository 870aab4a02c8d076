//! Remote transport (C8): outbound SSH command exec, SCP upload, host
//! architecture probing, and worker-binary caching.
//!
//! All remote operations shell out to the system `ssh`/`scp` binaries with
//! strict host-key checking disabled (permissive by design for lab VMs, see
//! spec.md §9 open question (a)) and a 10s connect timeout.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{LabError, Result};

const CONNECT_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Os {
    Linux,
    Darwin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arch {
    Amd64,
    Arm64,
}

/// Tracks which remote hosts already have a current worker binary cached,
/// so repeated deploys don't re-upload it.
#[derive(Default)]
struct BinaryCache {
    uploaded: HashMap<String, String>,
}

#[derive(Clone)]
pub struct Transport {
    bin_dir: std::path::PathBuf,
    local_version: String,
    cache: Arc<Mutex<BinaryCache>>,
}

fn ssh_opts() -> Vec<&'static str> {
    vec![
        "-o",
        "StrictHostKeyChecking=no",
        "-o",
        "UserKnownHostsFile=/dev/null",
        "-o",
        "ConnectTimeout=10",
    ]
}

fn quote_arg(arg: &str) -> String {
    if arg.starts_with("~/") {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r#"'\''"#))
    }
}

impl Transport {
    pub fn new(bin_dir: std::path::PathBuf, local_version: String) -> Self {
        Self {
            bin_dir,
            local_version,
            cache: Arc::new(Mutex::new(BinaryCache::default())),
        }
    }

    /// Run a single remote command via `ssh host -- cmd args...`, returning
    /// stdout on success.
    pub async fn exec(&self, host: &str, cmd: &str, args: &[String]) -> Result<String> {
        self.exec_on(host, None, None, cmd, args).await
    }

    /// Like `exec`, but against a specific port — used for VM guests reachable
    /// only via a forwarded port on `127.0.0.1`. `identity`, when set, selects
    /// the lab's generated key instead of the operator's default identity.
    pub async fn exec_port(
        &self,
        host: &str,
        port: u16,
        identity: Option<&Path>,
        cmd: &str,
        args: &[String],
    ) -> Result<String> {
        self.exec_on(host, Some(port), identity, cmd, args).await
    }

    async fn exec_on(
        &self,
        host: &str,
        port: Option<u16>,
        identity: Option<&Path>,
        cmd: &str,
        args: &[String],
    ) -> Result<String> {
        let remote_cmd = shell_join(cmd, args);
        let mut command = Command::new("ssh");
        command.args(ssh_opts());
        if let Some(port) = port {
            command.arg("-p").arg(port.to_string());
        }
        if let Some(identity) = identity {
            command.arg("-i").arg(identity);
        }
        let output = command
            .arg(host)
            .arg(&remote_cmd)
            .output()
            .await
            .map_err(|e| LabError::RemoteSshError {
                host: host.to_string(),
                reason: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(LabError::RemoteSshError {
                host: host.to_string(),
                reason: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Upload a local file via `scp`.
    pub async fn upload(&self, host: &str, local: &Path, remote: &str) -> Result<()> {
        let dest = format!("{host}:{remote}");
        let output = Command::new("scp")
            .args(ssh_opts())
            .arg(local)
            .arg(&dest)
            .output()
            .await
            .map_err(|e| LabError::RemoteSshError {
                host: host.to_string(),
                reason: e.to_string(),
            })?;
        if !output.status.success() {
            return Err(LabError::RemoteSshError {
                host: host.to_string(),
                reason: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }
        Ok(())
    }

    /// Probe `uname -s -m` and map to a recognized (os, arch) pair.
    pub async fn probe_arch(&self, host: &str) -> Result<(Os, Arch)> {
        let out = self.exec(host, "uname", &["-s".to_string(), "-m".to_string()]).await?;
        let mut parts = out.split_whitespace();
        let os = parts.next().unwrap_or_default();
        let arch = parts.next().unwrap_or_default();

        let os = match os {
            "Linux" => Os::Linux,
            "Darwin" => Os::Darwin,
            other => {
                return Err(LabError::RemoteSshError {
                    host: host.to_string(),
                    reason: format!("unrecognized remote OS {other:?}"),
                })
            }
        };
        let arch = match arch {
            "x86_64" | "amd64" => Arch::Amd64,
            "arm64" | "aarch64" => Arch::Arm64,
            other => {
                return Err(LabError::RemoteSshError {
                    host: host.to_string(),
                    reason: format!("unrecognized remote arch {other:?}"),
                })
            }
        };
        Ok((os, arch))
    }

    fn local_binary_path(&self, os: Os, arch: Arch) -> std::path::PathBuf {
        let os_name = match os {
            Os::Linux => "linux",
            Os::Darwin => "darwin",
        };
        let arch_name = match arch {
            Arch::Amd64 => "amd64",
            Arch::Arm64 => "arm64",
        };
        self.bin_dir.join(format!("newtlink-{os_name}-{arch_name}"))
    }

    /// Ensure the cross-compiled bridge-worker binary is present and current
    /// at `~/.newtlab/bin/newtlink` on `host`; uploads only if missing or
    /// out of date.
    pub async fn ensure_worker_binary(&self, host: &str) -> Result<()> {
        {
            let cache = self.cache.lock().await;
            if cache.uploaded.get(host) == Some(&self.local_version) {
                return Ok(());
            }
        }

        let (os, arch) = self.probe_arch(host).await?;
        let local_path = self.local_binary_path(os, arch);

        self.exec(host, "mkdir", &["-p".to_string(), "~/.newtlab/bin".to_string()])
            .await?;

        let remote_version = self
            .exec(
                host,
                "sh",
                &["-c".to_string(), "~/.newtlab/bin/newtlink --version 2>/dev/null || true".to_string()],
            )
            .await
            .unwrap_or_default();

        if remote_version.trim() == self.local_version {
            debug!(host, "worker binary already current, skipping upload");
        } else if !remote_version.trim().is_empty() && remote_version.trim() != self.local_version {
            return Err(LabError::VersionMismatch {
                host: host.to_string(),
                local: self.local_version.clone(),
                remote: remote_version.trim().to_string(),
            });
        } else {
            self.upload(host, &local_path, "~/.newtlab/bin/newtlink").await?;
            self.exec(host, "chmod", &["+x".to_string(), "~/.newtlab/bin/newtlink".to_string()])
                .await?;
            info!(host, "uploaded bridge worker binary");
        }

        self.cache
            .lock()
            .await
            .uploaded
            .insert(host.to_string(), self.local_version.clone());
        Ok(())
    }

    /// Start a long-running process on `host` behind `nohup`, cd-ing into
    /// the lab's remote directory first, returning the parsed remote PID.
    pub async fn start_remote(&self, host: &str, bin: &str, args: &[String]) -> Result<u32> {
        let remote_cmd = shell_join(bin, args);
        let wrapped = format!(
            "cd ~/.newtlab/labs && nohup {remote_cmd} >/dev/null 2>&1 & echo $!"
        );
        let output = Command::new("ssh")
            .args(ssh_opts())
            .arg(host)
            .arg(&wrapped)
            .output()
            .await
            .map_err(|e| LabError::RemoteSshError {
                host: host.to_string(),
                reason: e.to_string(),
            })?;
        if !output.status.success() {
            return Err(LabError::RemoteSshError {
                host: host.to_string(),
                reason: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }
        String::from_utf8_lossy(&output.stdout)
            .trim()
            .parse()
            .map_err(|_| LabError::RemoteSshError {
                host: host.to_string(),
                reason: "could not parse remote pid from nohup output".to_string(),
            })
    }

    pub async fn is_running(&self, host: &str, pid: u32) -> Result<bool> {
        let result = self
            .exec(host, "kill", &["-0".to_string(), pid.to_string()])
            .await;
        Ok(result.is_ok())
    }

    pub async fn kill(&self, host: &str, pid: u32, force: bool) -> Result<()> {
        let signal = if force { "-9" } else { "-15" };
        self.exec(host, "kill", &[signal.to_string(), pid.to_string()])
            .await?;
        Ok(())
    }

    pub async fn mkdirs(&self, host: &str, dirs: &[String]) -> Result<()> {
        let mut args = vec!["-p".to_string()];
        args.extend(dirs.iter().cloned());
        self.exec(host, "mkdir", &args).await?;
        Ok(())
    }

    pub async fn remove_dir(&self, host: &str, dir: &str) -> Result<()> {
        self.exec(host, "rm", &["-rf".to_string(), dir.to_string()])
            .await?;
        Ok(())
    }

    pub fn connect_timeout() -> Duration {
        Duration::from_secs(CONNECT_TIMEOUT_SECS)
    }
}

fn shell_join(cmd: &str, args: &[String]) -> String {
    let mut parts = vec![cmd.to_string()];
    parts.extend(args.iter().map(|a| quote_arg(a)));
    parts.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quote_preserves_tilde_expansion() {
        assert_eq!(quote_arg("~/.newtlab/bin/newtlink"), "~/.newtlab/bin/newtlink");
    }

    #[test]
    fn quote_wraps_other_args() {
        assert_eq!(quote_arg("hello world"), "'hello world'");
    }

    #[test]
    fn shell_join_quotes_each_argument() {
        let joined = shell_join("ss", &["-tlnH".to_string(), "( sport = :20000 )".to_string()]);
        assert_eq!(joined, "ss '-tlnH' '( sport = :20000 )'");
    }
}
