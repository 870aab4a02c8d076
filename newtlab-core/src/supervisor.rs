//! Process supervisor (C7): builds the QEMU command line for a `NodeConfig`
//! and drives local or SSH-remote process lifecycle.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::process::Command;
use tracing::{info, warn};

use crate::error::{LabError, Result};
use crate::transport::Transport;
use crate::types::NodeConfig;

const QEMU_BIN: &str = "qemu-system-x86_64";
const GRACE_PERIOD: Duration = Duration::from_secs(10);

pub struct Supervisor {
    transport: Transport,
}

#[derive(Debug, Clone)]
pub struct LaunchPaths {
    pub overlay: PathBuf,
    pub base_image: PathBuf,
    pub monitor_sock: PathBuf,
    pub pid_file: PathBuf,
    pub log_file: PathBuf,
}

impl Supervisor {
    pub fn new(transport: Transport) -> Self {
        Self { transport }
    }

    /// Build the QEMU argument vector for `node`. Argument *presence* is the
    /// contract (spec.md §9 open question (b)); positional order is not
    /// asserted on by callers.
    pub fn build_args(node: &NodeConfig, paths: &LaunchPaths, kvm_available: bool) -> Vec<String> {
        let mut args = vec![
            "-name".to_string(),
            node.name.clone(),
            "-m".to_string(),
            node.memory.to_string(),
            "-smp".to_string(),
            node.cpus.to_string(),
            "-nographic".to_string(),
            "-boot".to_string(),
            "order=c".to_string(),
            "-pidfile".to_string(),
            paths.pid_file.display().to_string(),
            "-monitor".to_string(),
            format!("unix:{},server,nowait", paths.monitor_sock.display()),
            "-serial".to_string(),
            format!("telnet:127.0.0.1:{},server,nowait", node.console_port),
        ];

        let cpu_model = match &node.cpu_features {
            Some(features) => format!("host,{features}"),
            None => "host".to_string(),
        };
        args.push("-cpu".to_string());
        args.push(cpu_model);

        if kvm_available {
            args.push("-enable-kvm".to_string());
        }

        args.push("-drive".to_string());
        args.push(format!(
            "file={},if=virtio,format=qcow2",
            paths.overlay.display()
        ));

        // Management NIC: user-mode networking, SSH port-forwarded, ROM
        // disabled to skip PXE boot delay.
        args.push("-device".to_string());
        args.push(format!(
            "{},netdev=mgmt0,mac={},romfile=",
            node.nic_driver, node.nics[0].mac
        ));
        args.push("-netdev".to_string());
        args.push(format!(
            "user,id=mgmt0,hostfwd=tcp::{}-:22",
            node.ssh_port
        ));

        for nic in node.nics.iter().skip(1) {
            let connect = nic
                .connect_addr
                .as_deref()
                .unwrap_or("127.0.0.1:0");
            args.push("-device".to_string());
            args.push(format!(
                "{},netdev={},mac={}",
                node.nic_driver, nic.netdev_id, nic.mac
            ));
            args.push("-netdev".to_string());
            args.push(format!("socket,id={},connect={}", nic.netdev_id, connect));
        }

        args
    }

    /// Create the overlay disk (`qemu-img create -f qcow2 -b <base> -F qcow2
    /// <overlay>`), local or over SSH.
    pub async fn create_overlay(&self, node: &NodeConfig, paths: &LaunchPaths) -> Result<()> {
        let args = vec![
            "create".to_string(),
            "-f".to_string(),
            "qcow2".to_string(),
            "-b".to_string(),
            paths.base_image.display().to_string(),
            "-F".to_string(),
            "qcow2".to_string(),
            paths.overlay.display().to_string(),
        ];

        let result = if node.is_local() {
            run_local("qemu-img", &args).await
        } else {
            self.transport.exec(&node.host, "qemu-img", &args).await
        };

        result.map_err(|e| LabError::OverlayCreate {
            node: node.name.clone(),
            reason: e.to_string(),
        })
    }

    /// Start QEMU for `node`. Local: detach into its own process group with
    /// stdout/stderr to `logs/<name>.log`. Remote: run behind `nohup` over
    /// SSH, returning the PID parsed from stdout.
    pub async fn start(&self, node: &NodeConfig, paths: &LaunchPaths, kvm_available: bool) -> Result<u32> {
        let args = Self::build_args(node, paths, kvm_available);

        if node.is_local() {
            self.start_local(node, &args, &paths.log_file).await
        } else {
            self.transport
                .start_remote(&node.host, QEMU_BIN, &args)
                .await
                .map_err(|e| LabError::QemuLaunch {
                    node: node.name.clone(),
                    reason: e.to_string(),
                })
        }
    }

    async fn start_local(&self, node: &NodeConfig, args: &[String], log_file: &Path) -> Result<u32> {
        let log = std::fs::File::create(log_file).map_err(|e| LabError::QemuLaunch {
            node: node.name.clone(),
            reason: format!("opening log file: {e}"),
        })?;
        let log_err = log.try_clone().map_err(|e| LabError::QemuLaunch {
            node: node.name.clone(),
            reason: e.to_string(),
        })?;

        let mut cmd = Command::new(QEMU_BIN);
        cmd.args(args);
        cmd.stdout(log);
        cmd.stderr(log_err);
        // Detach into its own process group so it survives this process.
        unsafe {
            cmd.pre_exec(|| {
                nix::unistd::setsid().map_err(std::io::Error::other)?;
                Ok(())
            });
        }

        let child = cmd.spawn().map_err(|e| LabError::QemuLaunch {
            node: node.name.clone(),
            reason: e.to_string(),
        })?;
        let pid = child.id().ok_or_else(|| LabError::QemuLaunch {
            node: node.name.clone(),
            reason: "failed to obtain child pid".to_string(),
        })?;

        // Intentionally drop the Child handle: this process is fully
        // detached and supervised by PID alone from here on.
        std::mem::forget(child);

        info!(node = %node.name, pid, "qemu launched");
        Ok(pid)
    }

    /// Send graceful termination, poll liveness for `GRACE_PERIOD`, then
    /// force-kill.
    pub async fn stop(&self, pid: u32, host: &str) -> Result<()> {
        if host.is_empty() {
            if is_local_process_alive(pid) {
                let _ = nix::sys::signal::kill(
                    nix::unistd::Pid::from_raw(pid as i32),
                    nix::sys::signal::Signal::SIGTERM,
                );
            }
        } else if let Err(e) = self.transport.kill(host, pid, false).await {
            warn!(host, pid, error = %e, "graceful remote kill failed");
        }

        let deadline = tokio::time::Instant::now() + GRACE_PERIOD;
        loop {
            if !self.is_running(pid, host).await {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }

        if host.is_empty() {
            let _ = nix::sys::signal::kill(
                nix::unistd::Pid::from_raw(pid as i32),
                nix::sys::signal::Signal::SIGKILL,
            );
        } else {
            self.transport
                .kill(host, pid, true)
                .await
                .map_err(|e| LabError::RemoteSshError {
                    host: host.to_string(),
                    reason: e.to_string(),
                })?;
        }
        Ok(())
    }

    pub async fn is_running(&self, pid: u32, host: &str) -> bool {
        if host.is_empty() {
            is_local_process_alive(pid)
        } else {
            self.transport.is_running(host, pid).await.unwrap_or(false)
        }
    }

    /// Cheap local probe for hardware acceleration (`/dev/kvm`).
    pub fn kvm_available() -> bool {
        Path::new("/dev/kvm").exists()
    }
}

fn is_local_process_alive(pid: u32) -> bool {
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), None).is_ok()
}

async fn run_local(bin: &str, args: &[String]) -> std::result::Result<(), String> {
    let output = Command::new(bin)
        .args(args)
        .output()
        .await
        .map_err(|e| e.to_string())?;
    if !output.status.success() {
        return Err(String::from_utf8_lossy(&output.stderr).to_string());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::naming::InterfaceMap;
    use crate::resolver::generate_mac;
    use crate::types::{Nic, ResolvedDeviceType};

    fn node() -> NodeConfig {
        NodeConfig {
            name: "spine1".to_string(),
            platform: "sonic-vpp".to_string(),
            device_type: ResolvedDeviceType::Switch,
            image: "sonic-vpp.img".to_string(),
            memory: 4096,
            cpus: 2,
            nic_driver: "e1000".to_string(),
            interface_map: InterfaceMap::Stride4,
            cpu_features: Some("pdpe1gb".to_string()),
            ssh_user: "admin".to_string(),
            ssh_pass: "pw".to_string(),
            console_user: "admin".to_string(),
            console_pass: "pw".to_string(),
            boot_timeout_secs: 180,
            host: String::new(),
            ssh_port: 40000,
            console_port: 30000,
            nics: vec![
                Nic::mgmt(generate_mac("spine1", 0)),
                Nic {
                    index: 1,
                    netdev_id: "eth1".to_string(),
                    interface: "Ethernet0".to_string(),
                    connect_addr: Some("127.0.0.1:20000".to_string()),
                    mac: generate_mac("spine1", 1),
                },
            ],
        }
    }

    fn paths() -> LaunchPaths {
        LaunchPaths {
            overlay: PathBuf::from("/tmp/lab/disks/spine1.qcow2"),
            base_image: PathBuf::from("/images/sonic-vpp.img"),
            monitor_sock: PathBuf::from("/tmp/lab/qemu/spine1.mon"),
            pid_file: PathBuf::from("/tmp/lab/qemu/spine1.pid"),
            log_file: PathBuf::from("/tmp/lab/logs/spine1.log"),
        }
    }

    #[test]
    fn args_contain_memory_cpu_and_mgmt_forward() {
        let args = Supervisor::build_args(&node(), &paths(), false);
        assert!(args.windows(2).any(|w| w == ["-m", "4096"]));
        assert!(args.windows(2).any(|w| w == ["-smp", "2"]));
        assert!(args.iter().any(|a| a.contains("hostfwd=tcp::40000-:22")));
        assert!(args.iter().any(|a| a.contains("romfile=")));
    }

    #[test]
    fn args_attach_data_nic_as_socket_netdev() {
        let args = Supervisor::build_args(&node(), &paths(), false);
        assert!(args
            .iter()
            .any(|a| a.contains("socket,id=eth1,connect=127.0.0.1:20000")));
    }

    #[test]
    fn kvm_flag_only_present_when_available() {
        let with_kvm = Supervisor::build_args(&node(), &paths(), true);
        let without_kvm = Supervisor::build_args(&node(), &paths(), false);
        assert!(with_kvm.iter().any(|a| a == "-enable-kvm"));
        assert!(!without_kvm.iter().any(|a| a == "-enable-kvm"));
    }
}
