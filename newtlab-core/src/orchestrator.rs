//! Lab orchestrator (C12): the `Deploy` / `Destroy` / `Status` / `Start` /
//! `Stop` / `Provision` state machine that drives every other component in
//! the order spec.md §4.12 lays out.
//!
//! Topology/platform/profile JSON files are read by the caller (§1); this
//! module only ever receives already-parsed structs. The one exception is
//! `ProfileStore`, a small trait the caller implements so Deploy/Destroy can
//! patch and restore per-device profile documents without this crate owning
//! their file layout.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::net::TcpStream;
use tokio::process::Command;
use tokio::sync::{watch, Mutex, Semaphore};
use tokio::time::Instant;
use tracing::warn;

use crate::bootstrap;
use crate::bridge::{BridgeConfig, BridgeLinkConfig};
use crate::error::{join_errors, LabError, PhaseError, Result};
use crate::keys;
use crate::patch::{self, PatchVars};
use crate::plan::{self, new_lab};
use crate::portprobe::{self, PortRequirements};
use crate::spec::{DeviceProfile, PlatformSpec, TopologySpec};
use crate::state::{self, BridgeState, LabState, LinkState, NodeState, NodeStatus, NodePhase};
use crate::supervisor::{LaunchPaths, Supervisor};
use crate::transport::Transport;
use crate::types::{LinkConfig, NodeConfig};

/// Fixed TCP port the bridge's stats endpoint listens on when it runs on a
/// remote host (local bridges are only reachable over their Unix socket).
const STATS_PORT: u16 = 19999;
const BRIDGE_READY_TIMEOUT: Duration = Duration::from_secs(15);

/// Persistence for per-device profile documents, implemented by the caller
/// (the JSON file layout for profiles is out of scope for this crate).
/// Deploy patches allocated `mgmt_ip`/ports into a profile; Destroy restores
/// the prior values.
pub trait ProfileStore: Send + Sync {
    fn read_profile(&self, device: &str) -> Result<DeviceProfile>;
    fn write_profile(&self, device: &str, profile: &DeviceProfile) -> Result<()>;
}

/// Checked at every phase boundary in `deploy`/`destroy`/`provision` (spec.md
/// §5 "checked at each phase boundary"). `None` means the caller opted out of
/// cancellation support entirely.
fn check_cancelled(cancel: Option<&watch::Receiver<bool>>, phase: &str) -> Result<()> {
    if cancel.map(|c| *c.borrow()).unwrap_or(false) {
        return Err(LabError::Cancelled { phase: phase.to_string() });
    }
    Ok(())
}

pub struct Orchestrator {
    transport: Transport,
    supervisor: Supervisor,
}

impl Orchestrator {
    pub fn new(transport: Transport) -> Self {
        let supervisor = Supervisor::new(transport.clone());
        Self { transport, supervisor }
    }

    fn launch_paths(&self, lab: &str, node: &NodeConfig) -> LaunchPaths {
        let base = if node.is_local() {
            state::lab_dir(lab)
        } else {
            PathBuf::from(format!("~/.newtlab/labs/{lab}"))
        };
        LaunchPaths {
            overlay: base.join("disks").join(format!("{}.qcow2", node.name)),
            base_image: PathBuf::from(&node.image),
            monitor_sock: base.join("qemu").join(format!("{}.mon", node.name)),
            pid_file: base.join("qemu").join(format!("{}.pid", node.name)),
            log_file: base.join("logs").join(format!("{}.log", node.name)),
        }
    }

    fn sibling_or_path(bin_name: &str) -> PathBuf {
        if let Ok(exe) = std::env::current_exe() {
            if let Some(dir) = exe.parent() {
                let candidate = dir.join(bin_name);
                if candidate.is_file() {
                    return candidate;
                }
            }
        }
        PathBuf::from(bin_name)
    }

    /// Write a worker-host's bridge config and launch its process, local or
    /// remote, returning the spawned PID.
    async fn launch_bridge(&self, lab: &str, host: &str, config: &BridgeConfig) -> Result<u32> {
        let json = serde_json::to_string_pretty(config).map_err(|e| LabError::BridgeListen {
            host: host.to_string(),
            reason: e.to_string(),
        })?;

        if host.is_empty() {
            let dir = state::lab_dir(lab);
            let config_path = dir.join("bridge.json");
            std::fs::write(&config_path, &json).map_err(|e| LabError::BridgeListen {
                host: "local".to_string(),
                reason: e.to_string(),
            })?;
            let pid_path = dir.join("bridge.pid");
            let sock_path = dir.join("bridge.sock");
            let log_path = dir.join("logs").join("bridge.log");
            let bin = Self::sibling_or_path("newtlab-bridge");
            let args = vec![
                "--config".to_string(),
                config_path.display().to_string(),
                "--pidfile".to_string(),
                pid_path.display().to_string(),
                "--sock".to_string(),
                sock_path.display().to_string(),
            ];
            spawn_detached(&bin, &args, &log_path)
        } else {
            let local_tmp = state::lab_dir(lab).join(format!("bridge-{}.json.upload", sanitize(host)));
            std::fs::write(&local_tmp, &json).map_err(|e| LabError::BridgeListen {
                host: host.to_string(),
                reason: e.to_string(),
            })?;
            let remote_config = format!("~/.newtlab/labs/{lab}/bridge.json");
            self.transport.upload(host, &local_tmp, &remote_config).await?;
            let _ = std::fs::remove_file(&local_tmp);
            self.transport.ensure_worker_binary(host).await?;
            let args = vec![
                "--config".to_string(),
                remote_config,
                "--pidfile".to_string(),
                format!("~/.newtlab/labs/{lab}/bridge.pid"),
                "--sock".to_string(),
                format!("~/.newtlab/labs/{lab}/bridge.sock"),
            ];
            self.transport
                .start_remote(host, "~/.newtlab/bin/newtlink", &args)
                .await
        }
    }

    /// Poll until a link's listener accepts a TCP connect: locally via a
    /// direct connect, remotely via a single SSH-side retry loop (the
    /// orchestrator cannot reach a loopback-bound remote socket itself).
    async fn wait_link_ready(&self, host: Option<&str>, port: u16) -> Result<()> {
        match host {
            None => {
                let deadline = Instant::now() + BRIDGE_READY_TIMEOUT;
                loop {
                    match TcpStream::connect(("127.0.0.1", port)).await {
                        Ok(_) => return Ok(()),
                        Err(e) => {
                            if Instant::now() >= deadline {
                                return Err(LabError::BridgeNotReady {
                                    host: format!("127.0.0.1:{port}"),
                                    reason: e.to_string(),
                                });
                            }
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                    }
                }
            }
            Some(h) => {
                let probe_cmd = format!(
                    "for i in $(seq 1 75); do (exec 3<>/dev/tcp/127.0.0.1/{port}) 2>/dev/null && exit 0; sleep 0.2; done; exit 1"
                );
                self.transport
                    .exec(h, "sh", &["-c".to_string(), probe_cmd])
                    .await
                    .map(|_| ())
                    .map_err(|e| LabError::BridgeNotReady {
                        host: format!("{h}:{port}"),
                        reason: e.to_string(),
                    })
            }
        }
    }

    async fn apply_patches(
        &self,
        nodes: &[NodeConfig],
        platforms: &HashMap<String, PlatformSpec>,
        patches_root: &Path,
        identity: Option<&Path>,
    ) -> Vec<PhaseError> {
        let mut errors = Vec::new();
        for node in nodes {
            let platform = platforms.get(&node.platform).cloned().unwrap_or_default();
            let dataplane = platform.dataplane.clone().unwrap_or_else(|| "vpp".to_string());
            let release = platform.vm_image_release.clone().unwrap_or_else(|| "default".to_string());

            let descriptors = match patch::load_patches(patches_root, &dataplane, &release) {
                Ok(d) => d,
                Err(e) => {
                    errors.push(PhaseError::new("patching", Some(node.name.clone()), e));
                    continue;
                }
            };

            let num_ports = node.nics.len().saturating_sub(1) as u32;
            let vars = PatchVars::new(
                num_ports,
                4,
                platform.hw_sku.clone().unwrap_or_default(),
                platform.default_speed.clone().unwrap_or_default(),
                node.platform.clone(),
                dataplane.clone(),
                release.clone(),
            );
            let guest_host = bootstrap::guest_host_arg(node);

            for (descriptor, templates) in &descriptors {
                if let Err(e) = patch::apply(
                    &node.name,
                    &guest_host,
                    node.ssh_port,
                    identity,
                    descriptor,
                    templates,
                    &vars,
                    &self.transport,
                )
                .await
                {
                    errors.push(e);
                    break;
                }
            }
        }
        errors
    }

    /// Fold each coalesced host's data NIC into its own network namespace
    /// inside the synthetic VM, and materialize its `NodeState`.
    async fn setup_host_namespaces(
        &self,
        topology: &TopologySpec,
        profiles: &HashMap<String, DeviceProfile>,
        lab_plan: &crate::types::LabPlan,
        key_path: &Path,
        lab_state: &mut LabState,
        errors: &mut Vec<PhaseError>,
    ) {
        let original_links = plan::derive_links(topology);

        for group in &lab_plan.host_groups {
            let Some(vm_node) = lab_plan.nodes.get(&group.vm_name) else { continue };
            let guest_host = bootstrap::guest_host_arg(vm_node);
            let (vm_pid, vm_status) = lab_state
                .nodes
                .get(&group.vm_name)
                .map(|n| (n.pid, n.status))
                .unwrap_or((0, NodeStatus::Error));

            for (ordinal, host_name) in group.hosts.iter().enumerate() {
                let peer_endpoint = original_links.iter().find_map(|l| {
                    if l.a.starts_with(&format!("{host_name}:")) {
                        Some(l.z.clone())
                    } else if l.z.starts_with(&format!("{host_name}:")) {
                        Some(l.a.clone())
                    } else {
                        None
                    }
                });

                let Some(peer_endpoint) = peer_endpoint else {
                    errors.push(PhaseError::new(
                        "namespace-setup",
                        Some(host_name.clone()),
                        "no link found for folded host",
                    ));
                    continue;
                };
                let Some((peer_device, peer_iface)) = peer_endpoint.split_once(':') else {
                    continue;
                };
                let switch_cidr = topology
                    .devices
                    .get(peer_device)
                    .and_then(|d| d.interfaces.iter().find(|i| i.name == peer_iface))
                    .and_then(|i| i.ip.clone());

                let profile = profiles.get(host_name).cloned().unwrap_or_default();
                let address = match switch_cidr {
                    Some(cidr) => derive_host_address(
                        &cidr,
                        (ordinal + 1) as u32,
                        profile.host_ip.as_deref(),
                        profile.host_gateway.as_deref(),
                    ),
                    None => match (&profile.host_ip, &profile.host_gateway) {
                        (Some(ip), Some(gw)) => Ok((ip.clone(), gw.clone())),
                        _ => Err(LabError::SpecInvalid(
                            "no peer switch address and no HostIP/HostGateway override".to_string(),
                        )),
                    },
                };
                let (host_addr, gateway) = match address {
                    Ok(v) => v,
                    Err(e) => {
                        errors.push(PhaseError::new("namespace-setup", Some(host_name.clone()), e));
                        continue;
                    }
                };

                let eth_src = format!("eth{}", group.nic_base[host_name]);
                let cmd = format!(
                    "sudo ip netns add {ns} 2>/dev/null; \
                     sudo ip link set {eth_src} netns {ns}; \
                     sudo ip netns exec {ns} ip link set {eth_src} name eth0; \
                     sudo ip netns exec {ns} ip link set eth0 up; \
                     sudo ip netns exec {ns} ip addr add {addr} dev eth0; \
                     sudo ip netns exec {ns} ip route add default via {gw}",
                    ns = host_name,
                    eth_src = eth_src,
                    addr = host_addr,
                    gw = gateway,
                );

                if let Err(e) = self
                    .transport
                    .exec_port(&guest_host, vm_node.ssh_port, Some(key_path), "sh", &["-c".to_string(), cmd])
                    .await
                {
                    errors.push(PhaseError::new("namespace-setup", Some(host_name.clone()), e));
                    continue;
                }

                lab_state.nodes.insert(
                    host_name.clone(),
                    NodeState {
                        pid: vm_pid,
                        status: vm_status,
                        phase: NodePhase::None,
                        ssh_user: vm_node.ssh_user.clone(),
                        ssh_port: vm_node.ssh_port,
                        console_port: vm_node.console_port,
                        host: vm_node.host.clone(),
                        host_ip: Some(host_addr.split('/').next().unwrap_or(&host_addr).to_string()),
                        original_mgmt_ip: None,
                        vm_name: Some(group.vm_name.clone()),
                        namespace: Some(host_name.clone()),
                    },
                );
            }
        }
    }

    /// Run the full 13-step lab deployment (spec.md §4.12).
    #[allow(clippy::too_many_arguments)]
    pub async fn deploy(
        &self,
        name: &str,
        spec_dir: &str,
        topology: &TopologySpec,
        platforms: &HashMap<String, PlatformSpec>,
        profiles: &HashMap<String, DeviceProfile>,
        patches_root: &Path,
        profile_store: &dyn ProfileStore,
        force: bool,
        cancel: Option<&watch::Receiver<bool>>,
    ) -> Result<(LabState, Vec<PhaseError>)> {
        let mut errors = Vec::new();

        // Step 0.
        if state::state_exists(name) {
            if !force {
                return Err(LabError::StateWriteError {
                    lab: name.to_string(),
                    reason: "lab already deployed; pass force to redeploy".to_string(),
                });
            }
            if let Err(e) = self.destroy(name, profile_store, cancel).await {
                warn!(lab = name, error = %e, "ignoring errors destroying prior deployment");
            }
        }

        let mut plan = new_lab(topology, platforms, profiles)?;
        let orchestration = topology.orchestration.clone().unwrap_or_default();

        // resolve_node leaves ssh_port/console_port at zero; only Deploy
        // knows the orchestration's base ports, assigned in sorted name
        // order (S1).
        for (i, node) in plan.nodes.values_mut().enumerate() {
            node.ssh_port = orchestration.ssh_port_base + i as u16;
            node.console_port = orchestration.console_port_base + i as u16;
        }

        // Step 1: port probe.
        let mut requirements: PortRequirements = BTreeMap::new();
        for node in plan.nodes.values() {
            requirements
                .entry(node.host.clone())
                .or_default()
                .extend([node.ssh_port, node.console_port]);
        }
        let mut by_worker: BTreeMap<String, Vec<&LinkConfig>> = BTreeMap::new();
        for link in &plan.links {
            by_worker.entry(link.worker_host.clone()).or_default().push(link);
            requirements
                .entry(link.worker_host.clone())
                .or_default()
                .extend([link.a_port, link.z_port]);
        }
        for host in by_worker.keys() {
            if !host.is_empty() {
                requirements.entry(host.clone()).or_default().push(STATS_PORT);
            }
        }
        portprobe::probe(&requirements, &self.transport).await?;
        check_cancelled(cancel, "port-probe")?;

        // Step 2: local state dirs.
        state::ensure_layout(name)?;
        let dir = state::lab_dir(name);

        // Step 3: lab keypair.
        let keypair = keys::generate();
        let key_path = keys::persist(&keypair, &dir)?;

        // Step 4: initial state.json.
        let mut lab_state = LabState::new(name, spec_dir, Utc::now());
        lab_state.ssh_key_path = Some(key_path.display().to_string());
        for link in &plan.links {
            lab_state.links.push(LinkState {
                a: link.a.device.clone(),
                z: link.z.device.clone(),
                a_port: link.a_port,
                z_port: link.z_port,
                worker_host: link.worker_host.clone(),
            });
        }
        state::save_state(&lab_state)?;

        // Step 5: remote mkdirs.
        let mut remote_hosts: BTreeSet<String> = plan
            .nodes
            .values()
            .map(|n| n.host.clone())
            .filter(|h| !h.is_empty())
            .collect();
        remote_hosts.extend(by_worker.keys().filter(|h| !h.is_empty()).cloned());
        for host in &remote_hosts {
            self.transport.mkdirs(host, &state::remote_lab_dirs(name)).await?;
        }

        if let Err(e) = check_cancelled(cancel, "overlays") {
            state::save_state(&lab_state)?;
            return Err(e);
        }

        // Step 6: overlays.
        for node in plan.nodes.values() {
            let paths = self.launch_paths(name, node);
            self.supervisor.create_overlay(node, &paths).await?;
        }

        if let Err(e) = check_cancelled(cancel, "bridges") {
            state::save_state(&lab_state)?;
            return Err(e);
        }

        // Step 7: bridges.
        let host_addresses: HashMap<String, String> = orchestration
            .servers
            .iter()
            .map(|s| (s.name.clone(), s.address.clone()))
            .collect();
        for (host, links) in &by_worker {
            let stats_addr = if host.is_empty() { String::new() } else { format!("0.0.0.0:{STATS_PORT}") };
            let bridge_cfg = BridgeConfig {
                links: links
                    .iter()
                    .map(|l| BridgeLinkConfig {
                        a: format!("{}:{}", l.a.device, l.a.interface),
                        z: format!("{}:{}", l.z.device, l.z.interface),
                        a_port: l.a_port,
                        z_port: l.z_port,
                        a_bind: l.a_bind.as_str().to_string(),
                        z_bind: l.z_bind.as_str().to_string(),
                    })
                    .collect(),
                stats_addr: stats_addr.clone(),
            };
            let pid = self.launch_bridge(name, host, &bridge_cfg).await?;

            let probe_host = if host.is_empty() { None } else { Some(host.as_str()) };
            for l in links {
                self.wait_link_ready(probe_host, l.a_port).await?;
                self.wait_link_ready(probe_host, l.z_port).await?;
            }

            lab_state.bridges.insert(
                host.clone(),
                BridgeState {
                    pid,
                    host_ip: host_addresses.get(host).cloned(),
                    stats_addr,
                },
            );
        }
        state::save_state(&lab_state)?;
        if let Err(e) = check_cancelled(cancel, "launch") {
            return Err(e);
        }

        // Step 9: start qemus in sorted name order; per-node failure is
        // recorded but does not abort the deploy.
        let mut names: Vec<String> = plan.nodes.keys().cloned().collect();
        names.sort();
        let kvm = Supervisor::kvm_available();
        for node_name in &names {
            let node = &plan.nodes[node_name];
            let paths = self.launch_paths(name, node);
            let entry = match self.supervisor.start(node, &paths, kvm).await {
                Ok(pid) => NodeState {
                    pid,
                    status: NodeStatus::Running,
                    phase: NodePhase::Booting,
                    ssh_user: node.ssh_user.clone(),
                    ssh_port: node.ssh_port,
                    console_port: node.console_port,
                    host: node.host.clone(),
                    host_ip: orchestration.hosts.get(&node.host).cloned(),
                    original_mgmt_ip: None,
                    vm_name: None,
                    namespace: None,
                },
                Err(e) => {
                    warn!(node = node_name.as_str(), error = %e, "qemu launch failed, node marked error");
                    errors.push(PhaseError::new("launch", Some(node_name.clone()), e));
                    NodeState {
                        pid: 0,
                        status: NodeStatus::Error,
                        phase: NodePhase::None,
                        ssh_user: node.ssh_user.clone(),
                        ssh_port: node.ssh_port,
                        console_port: node.console_port,
                        host: node.host.clone(),
                        host_ip: None,
                        original_mgmt_ip: None,
                        vm_name: None,
                        namespace: None,
                    }
                }
            };
            lab_state.nodes.insert(node_name.clone(), entry);
            state::save_state(&lab_state)?;
        }

        let running_nodes: Vec<NodeConfig> = names
            .iter()
            .filter(|n| lab_state.nodes[*n].status == NodeStatus::Running)
            .map(|n| plan.nodes[n].clone())
            .collect();

        if let Err(e) = check_cancelled(cancel, "bootstrapping") {
            state::save_state(&lab_state)?;
            return Err(e);
        }

        // Step 10: console bootstrap.
        for n in &running_nodes {
            if let Some(s) = lab_state.nodes.get_mut(&n.name) {
                s.phase = NodePhase::Bootstrapping;
            }
        }
        state::save_state(&lab_state)?;
        errors.extend(
            bootstrap::bootstrap_all(&running_nodes, &keypair.public_openssh, &self.transport, Some(key_path.as_path()))
                .await,
        );
        for n in &running_nodes {
            if let Some(s) = lab_state.nodes.get_mut(&n.name) {
                s.phase = NodePhase::None;
            }
        }
        state::save_state(&lab_state)?;
        if let Err(e) = check_cancelled(cancel, "patching") {
            return Err(e);
        }

        // Step 11: patch application plus profile persistence.
        for n in &running_nodes {
            if let Some(s) = lab_state.nodes.get_mut(&n.name) {
                s.phase = NodePhase::Patching;
            }
        }
        state::save_state(&lab_state)?;

        errors.extend(
            self.apply_patches(&running_nodes, platforms, patches_root, Some(key_path.as_path()))
                .await,
        );

        for n in &running_nodes {
            let mut profile = profiles.get(&n.name).cloned().unwrap_or_default();
            let original = profile.mgmt_ip.clone();
            profile.mgmt_ip = Some("127.0.0.1".to_string());
            profile.ssh_port = Some(n.ssh_port);
            profile.console_port = Some(n.console_port);
            if let Err(e) = profile_store.write_profile(&n.name, &profile) {
                errors.push(PhaseError::new("patching", Some(n.name.clone()), e));
            }
            if let Some(s) = lab_state.nodes.get_mut(&n.name) {
                s.original_mgmt_ip = original;
                s.phase = NodePhase::None;
            }
        }
        state::save_state(&lab_state)?;
        if let Err(e) = check_cancelled(cancel, "namespace-setup") {
            return Err(e);
        }

        // Steps 12-13: coalesced host namespaces.
        if !plan.host_groups.is_empty() {
            self.setup_host_namespaces(topology, profiles, &plan, &key_path, &mut lab_state, &mut errors)
                .await;
        }
        state::save_state(&lab_state)?;

        Ok((lab_state, errors))
    }

    /// Stop every node and bridge, remove every remote state directory,
    /// restore profiles, and remove local state. Never aborts early; every
    /// failure is collected and joined into the returned error.
    pub async fn destroy(
        &self,
        name: &str,
        profile_store: &dyn ProfileStore,
        cancel: Option<&watch::Receiver<bool>>,
    ) -> Result<()> {
        let lab_state = state::load_state(name)?;
        let mut errors = Vec::new();

        for (node_name, node_state) in &lab_state.nodes {
            if node_state.vm_name.is_some() {
                continue; // folded host: no process of its own to stop
            }
            if let Err(e) = self.supervisor.stop(node_state.pid, &node_state.host).await {
                errors.push(PhaseError::new("destroy", Some(node_name.clone()), e));
            }
        }

        check_cancelled(cancel, "destroy-nodes")?;

        for (host, bridge_state) in &lab_state.bridges {
            if let Err(e) = self.supervisor.stop(bridge_state.pid, host).await {
                errors.push(PhaseError::new("destroy", Some(format!("bridge:{host}")), e));
            }
        }

        check_cancelled(cancel, "destroy-bridges")?;

        let mut remote_hosts: BTreeSet<String> = lab_state
            .nodes
            .values()
            .map(|n| n.host.clone())
            .filter(|h| !h.is_empty())
            .collect();
        remote_hosts.extend(lab_state.bridges.keys().filter(|h| !h.is_empty()).cloned());
        for host in &remote_hosts {
            for remote_dir in state::remote_lab_dirs(name) {
                if let Err(e) = self.transport.remove_dir(host, &remote_dir).await {
                    errors.push(PhaseError::new("destroy", Some(host.clone()), e));
                }
            }
        }

        check_cancelled(cancel, "destroy-cleanup")?;

        for (device, node_state) in &lab_state.nodes {
            let Ok(mut profile) = profile_store.read_profile(device) else {
                continue;
            };
            profile.mgmt_ip = node_state.original_mgmt_ip.clone();
            profile.ssh_port = None;
            profile.console_port = None;
            if let Err(e) = profile_store.write_profile(device, &profile) {
                errors.push(PhaseError::new("destroy", Some(device.clone()), e));
            }
        }

        state::remove_state(name)?;

        if errors.is_empty() {
            Ok(())
        } else {
            Err(LabError::StateWriteError {
                lab: name.to_string(),
                reason: join_errors(&errors),
            })
        }
    }

    /// Load state, probe liveness for every node marked running, and
    /// downgrade stale entries to `stopped`.
    pub async fn status(&self, name: &str) -> Result<LabState> {
        let mut lab_state = state::load_state(name)?;
        for node_state in lab_state.nodes.values_mut() {
            if node_state.status == NodeStatus::Running && !self.supervisor.is_running(node_state.pid, &node_state.host).await {
                node_state.status = NodeStatus::Stopped;
            }
        }
        Ok(lab_state)
    }

    /// Graceful-then-force stop of a single node.
    pub async fn stop_node(&self, name: &str, node_name: &str) -> Result<()> {
        let mut lab_state = state::load_state(name)?;
        let node_state = lab_state
            .nodes
            .get_mut(node_name)
            .ok_or_else(|| LabError::StateMissing(format!("{name}/{node_name}")))?;
        self.supervisor.stop(node_state.pid, &node_state.host).await?;
        node_state.status = NodeStatus::Stopped;
        state::save_state(&lab_state)
    }

    /// Restart a single node: restores its previously allocated ports from
    /// state, skips the launch if the old PID is somehow still alive, then
    /// waits for SSH. `node` must already carry the image/platform fields
    /// resolved by the caller (topology/platform/profile re-reading is out
    /// of scope here).
    pub async fn start_node(&self, name: &str, node: &NodeConfig) -> Result<()> {
        let mut lab_state = state::load_state(name)?;
        let existing = lab_state
            .nodes
            .get(&node.name)
            .ok_or_else(|| LabError::StateMissing(format!("{name}/{}", node.name)))?
            .clone();

        if self.supervisor.is_running(existing.pid, &existing.host).await {
            return Ok(());
        }

        let mut node = node.clone();
        node.ssh_port = existing.ssh_port;
        node.console_port = existing.console_port;
        node.host = existing.host.clone();

        let paths = self.launch_paths(name, &node);
        let pid = self.supervisor.start(&node, &paths, Supervisor::kvm_available()).await?;

        if let Some(entry) = lab_state.nodes.get_mut(&node.name) {
            entry.pid = pid;
            entry.status = NodeStatus::Running;
            entry.phase = NodePhase::Bootstrapping;
        }
        state::save_state(&lab_state)?;

        let identity = lab_state.ssh_key_path.clone().map(PathBuf::from);
        let ssh_result = bootstrap::poll_ssh_ready(&self.transport, &node, identity.as_deref()).await;

        let mut lab_state = state::load_state(name)?;
        if let Some(entry) = lab_state.nodes.get_mut(&node.name) {
            entry.phase = NodePhase::None;
            if ssh_result.is_err() {
                entry.status = NodeStatus::Error;
            }
        }
        state::save_state(&lab_state)
    }

    /// Invoke the downstream per-device provisioning binary with bounded
    /// parallelism, skipping host/host-vm devices, then trigger a best-effort
    /// BGP soft-clear on every switch after `bgp_refresh_delay`.
    pub async fn provision(
        &self,
        name: &str,
        topology: &TopologySpec,
        devices: Option<&[String]>,
        parallel: usize,
        bgp_refresh_delay: Duration,
        cancel: Option<&watch::Receiver<bool>>,
    ) -> Result<Vec<PhaseError>> {
        let lab_state = state::load_state(name)?;
        let provision_bin = Self::sibling_or_path("newtlab-provision");

        let mut targets: Vec<String> = topology.devices.keys().cloned().collect();
        targets.sort();
        if let Some(filter) = devices {
            targets.retain(|d| filter.iter().any(|x| x == d));
        }

        let semaphore = Arc::new(Semaphore::new(parallel.max(1)));
        let errors: Arc<Mutex<Vec<PhaseError>>> = Arc::new(Mutex::new(Vec::new()));
        let mut tasks = Vec::new();

        for device in targets {
            let Some(node_state) = lab_state.nodes.get(&device) else { continue };
            if node_state.vm_name.is_some() || device.starts_with("hostvm-") {
                continue; // host/host-vm devices are not provisioned
            }
            let sem = semaphore.clone();
            let bin = provision_bin.clone();
            let errors = errors.clone();
            let ssh_port = node_state.ssh_port;
            tasks.push(tokio::spawn(async move {
                let _permit = sem.acquire().await.unwrap();
                let output = Command::new(&bin)
                    .arg("--device")
                    .arg(&device)
                    .arg("--port")
                    .arg(ssh_port.to_string())
                    .output()
                    .await;
                match output {
                    Ok(out) if out.status.success() => {}
                    Ok(out) => errors.lock().await.push(PhaseError::new(
                        "provision",
                        Some(device.clone()),
                        String::from_utf8_lossy(&out.stderr).to_string(),
                    )),
                    Err(e) => errors.lock().await.push(PhaseError::new("provision", Some(device.clone()), e)),
                }
            }));
        }
        for t in tasks {
            let _ = t.await;
        }

        check_cancelled(cancel, "provision")?;

        tokio::time::sleep(bgp_refresh_delay).await;

        let identity = lab_state.ssh_key_path.clone().map(PathBuf::from);
        for (device, node_state) in &lab_state.nodes {
            if node_state.vm_name.is_some() || device.starts_with("hostvm-") {
                continue;
            }
            let guest_host = "admin@127.0.0.1".to_string();
            if let Err(e) = self
                .transport
                .exec_port(
                    &guest_host,
                    node_state.ssh_port,
                    identity.as_deref(),
                    "vtysh",
                    &["-c".to_string(), "clear bgp * soft".to_string()],
                )
                .await
            {
                warn!(device = device.as_str(), error = %e, "best-effort bgp soft-clear failed");
            }
        }

        Ok(Arc::try_unwrap(errors).unwrap().into_inner())
    }
}

fn sanitize(host: &str) -> String {
    host.chars().map(|c| if c.is_alphanumeric() { c } else { '-' }).collect()
}

fn spawn_detached(bin: &Path, args: &[String], log_path: &Path) -> Result<u32> {
    if let Some(parent) = log_path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    let log = std::fs::File::create(log_path).map_err(|e| LabError::BridgeListen {
        host: "local".to_string(),
        reason: format!("opening bridge log: {e}"),
    })?;
    let log_err = log.try_clone().map_err(|e| LabError::BridgeListen {
        host: "local".to_string(),
        reason: e.to_string(),
    })?;

    let mut cmd = Command::new(bin);
    cmd.args(args);
    cmd.stdout(log);
    cmd.stderr(log_err);
    unsafe {
        cmd.pre_exec(|| {
            nix::unistd::setsid().map_err(std::io::Error::other)?;
            Ok(())
        });
    }

    let child = cmd.spawn().map_err(|e| LabError::BridgeListen {
        host: "local".to_string(),
        reason: e.to_string(),
    })?;
    let pid = child.id().ok_or_else(|| LabError::BridgeListen {
        host: "local".to_string(),
        reason: "failed to obtain child pid".to_string(),
    })?;
    std::mem::forget(child);
    Ok(pid)
}

/// Derive a folded host's address from its peer switch interface's CIDR
/// (spec.md §4.12 step 12): `/31` toggles parity, `/30` adds one, wider
/// subnets hand out `.10, .20, .30, ...` by ordinal. An explicit
/// `HostIP`/`HostGateway` profile override always wins.
fn derive_host_address(
    switch_cidr: &str,
    ordinal: u32,
    override_ip: Option<&str>,
    override_gateway: Option<&str>,
) -> Result<(String, String)> {
    if let (Some(ip), Some(gw)) = (override_ip, override_gateway) {
        return Ok((ip.to_string(), gw.to_string()));
    }

    let (ip_str, prefix_str) = switch_cidr.split_once('/').ok_or_else(|| {
        LabError::SpecInvalid(format!("switch interface address {switch_cidr:?} is not in CIDR form"))
    })?;
    let switch_ip: std::net::Ipv4Addr = ip_str
        .parse()
        .map_err(|_| LabError::SpecInvalid(format!("invalid address {ip_str:?}")))?;
    let prefix: u8 = prefix_str
        .parse()
        .map_err(|_| LabError::SpecInvalid(format!("invalid prefix {prefix_str:?}")))?;

    let switch_u32 = u32::from(switch_ip);
    let gateway = switch_ip.to_string();

    let host_u32 = match prefix {
        31 => switch_u32 ^ 1,
        30 => switch_u32 + 1,
        p if p <= 24 => {
            let mask: u32 = if p == 0 { 0 } else { !0u32 << (32 - p) };
            let network = switch_u32 & mask;
            network + ordinal * 10
        }
        other => return Err(LabError::SpecInvalid(format!("unsupported switch interface prefix length /{other}"))),
    };
    let host_ip = std::net::Ipv4Addr::from(host_u32);
    Ok((format!("{host_ip}/{prefix}"), gateway))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_host_address_toggles_parity_on_slash_31() {
        let (addr, gw) = derive_host_address("10.0.0.0/31", 1, None, None).unwrap();
        assert_eq!(addr, "10.0.0.1/31");
        assert_eq!(gw, "10.0.0.0");
    }

    #[test]
    fn derive_host_address_adds_one_on_slash_30() {
        let (addr, gw) = derive_host_address("10.0.0.1/30", 1, None, None).unwrap();
        assert_eq!(addr, "10.0.0.2/30");
        assert_eq!(gw, "10.0.0.1");
    }

    #[test]
    fn derive_host_address_uses_tens_ordinal_on_wide_subnets() {
        let (addr, _) = derive_host_address("10.0.0.1/24", 1, None, None).unwrap();
        assert_eq!(addr, "10.0.0.10/24");
        let (addr, _) = derive_host_address("10.0.0.1/24", 2, None, None).unwrap();
        assert_eq!(addr, "10.0.0.20/24");
    }

    #[test]
    fn derive_host_address_override_wins() {
        let (addr, gw) = derive_host_address("10.0.0.0/31", 1, Some("192.168.1.5/24"), Some("192.168.1.1")).unwrap();
        assert_eq!(addr, "192.168.1.5/24");
        assert_eq!(gw, "192.168.1.1");
    }
}
