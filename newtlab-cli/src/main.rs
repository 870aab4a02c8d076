//! newtlab - operator front-end for the lab lifecycle engine.
//!
//! Reads topology/platform/profile JSON from a lab directory, drives
//! `newtlab_core::orchestrator::Orchestrator`, and renders state as tables.
//! All JSON parsing and the `ProfileStore` implementation live here: the
//! engine crate never touches a file path of its own choosing (spec.md §1).

use std::collections::HashMap;
use std::io::Read as _;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use tabled::{Table, Tabled};

use newtlab_core::bridge::{human_bytes, StatsSnapshot};
use newtlab_core::error::{LabError, Result as LabResult};
use newtlab_core::orchestrator::{Orchestrator, ProfileStore};
use newtlab_core::resolver::resolve_node;
use newtlab_core::spec::{DeviceProfile, PlatformSpec, TopologySpec};
use newtlab_core::state;
use newtlab_core::transport::Transport;

#[derive(Parser)]
#[command(name = "newtlab", version, about = "QEMU virtual network lab orchestrator")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List every known lab.
    List,
    /// Deploy a lab from a topology directory.
    Deploy {
        topology: PathBuf,
        /// Redeploy over an existing lab of the same name.
        #[arg(long)]
        force: bool,
        /// Place every unpinned device on this single host instead of the
        /// topology's configured server pool.
        #[arg(long)]
        host: Option<String>,
        /// Run `provision` immediately after deploy succeeds.
        #[arg(long)]
        provision: bool,
        #[arg(long, default_value_t = 4)]
        parallel: usize,
    },
    /// Tear down a deployed lab.
    Destroy { topology: PathBuf },
    /// Print per-node and per-link status for a deployed lab.
    Status { topology: PathBuf },
    /// SSH into a node of a deployed lab.
    Ssh { lab: String, node: String },
    /// Open the node's serial console.
    Console { lab: String, node: String },
    /// Stop a single node.
    Stop { lab: String, node: String },
    /// Restart a single node.
    Start { topology: PathBuf, node: String },
    /// Invoke per-device network provisioning.
    Provision {
        topology: PathBuf,
        #[arg(long)]
        device: Option<String>,
        #[arg(long, default_value_t = 4)]
        parallel: usize,
    },
    /// Print live bridge splice counters for a deployed lab.
    BridgeStats {
        lab: String,
        /// Query the bridge on this worker host over TCP instead of the
        /// local Unix socket.
        #[arg(long)]
        host: Option<String>,
    },
}

fn bin_dir() -> PathBuf {
    std::env::var("NEWTLAB_BIN_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
}

fn resolve_topology_dir(arg: &Path) -> PathBuf {
    if arg.is_dir() {
        return arg.to_path_buf();
    }
    if let Ok(root) = std::env::var("NEWTRUN_TOPOLOGIES") {
        return PathBuf::from(root).join(arg);
    }
    arg.to_path_buf()
}

fn lab_name(topology_dir: &Path) -> String {
    topology_dir
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "lab".to_string())
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> LabResult<T> {
    let body = std::fs::read_to_string(path).map_err(|e| LabError::SpecMissing(format!("{}: {e}", path.display())))?;
    serde_json::from_str(&body).map_err(|e| LabError::SpecInvalid(format!("{}: {e}", path.display())))
}

fn load_topology(dir: &Path) -> LabResult<TopologySpec> {
    read_json(&dir.join("topology.json"))
}

fn load_platforms(dir: &Path) -> LabResult<HashMap<String, PlatformSpec>> {
    read_json(&dir.join("platforms.json"))
}

fn load_profiles(dir: &Path) -> LabResult<HashMap<String, DeviceProfile>> {
    let path = dir.join("profiles.json");
    if !path.is_file() {
        return Ok(HashMap::new());
    }
    read_json(&path)
}

fn patches_root(dir: &Path) -> PathBuf {
    dir.join("patches")
}

/// Persists per-device profiles back into the lab directory's single
/// `profiles.json` document. The engine never sees this file path; it only
/// calls through the `ProfileStore` trait.
struct JsonProfileStore {
    path: PathBuf,
}

impl JsonProfileStore {
    fn new(topology_dir: &Path) -> Self {
        Self { path: topology_dir.join("profiles.json") }
    }

    fn load_all(&self) -> LabResult<HashMap<String, DeviceProfile>> {
        if !self.path.is_file() {
            return Ok(HashMap::new());
        }
        read_json(&self.path)
    }
}

impl ProfileStore for JsonProfileStore {
    fn read_profile(&self, device: &str) -> LabResult<DeviceProfile> {
        self.load_all()?
            .remove(device)
            .ok_or_else(|| LabError::StateMissing(format!("profile for {device}")))
    }

    fn write_profile(&self, device: &str, profile: &DeviceProfile) -> LabResult<()> {
        let mut all = self.load_all()?;
        all.insert(device.to_string(), profile.clone());
        let body = serde_json::to_string_pretty(&all)
            .map_err(|e| LabError::StateWriteError { lab: device.to_string(), reason: e.to_string() })?;
        std::fs::write(&self.path, body)
            .map_err(|e| LabError::StateWriteError { lab: device.to_string(), reason: e.to_string() })
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(
            "newtlab=info".parse().expect("static directive"),
        ))
        .init();

    let cli = Cli::parse();

    if let Err(e) = run(cli.command).await {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

fn transport() -> Transport {
    Transport::new(bin_dir(), env!("CARGO_PKG_VERSION").to_string())
}

async fn run(command: Commands) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Commands::List => cmd_list(),
        Commands::Deploy { topology, force, host, provision, parallel } => {
            cmd_deploy(topology, force, host, provision, parallel).await
        }
        Commands::Destroy { topology } => cmd_destroy(topology).await,
        Commands::Status { topology } => cmd_status(topology).await,
        Commands::Ssh { lab, node } => cmd_ssh(lab, node).await,
        Commands::Console { lab, node } => cmd_console(lab, node).await,
        Commands::Stop { lab, node } => cmd_stop(lab, node).await,
        Commands::Start { topology, node } => cmd_start(topology, node).await,
        Commands::Provision { topology, device, parallel } => cmd_provision(topology, device, parallel).await,
        Commands::BridgeStats { lab, host } => cmd_bridge_stats(lab, host).await,
    }
}

fn cmd_list() -> Result<(), Box<dyn std::error::Error>> {
    #[derive(Tabled)]
    struct Row {
        name: String,
    }
    let labs = state::list_labs()?;
    let rows: Vec<Row> = labs.into_iter().map(|name| Row { name }).collect();
    println!("{}", Table::new(rows));
    Ok(())
}

async fn cmd_deploy(
    topology: PathBuf,
    force: bool,
    host: Option<String>,
    provision: bool,
    parallel: usize,
) -> Result<(), Box<dyn std::error::Error>> {
    let dir = resolve_topology_dir(&topology);
    let name = lab_name(&dir);
    let mut spec = load_topology(&dir)?;
    let platforms = load_platforms(&dir)?;
    let profiles = load_profiles(&dir)?;

    if let Some(h) = host {
        let orch = spec.orchestration.get_or_insert_with(Default::default);
        if orch.servers.is_empty() {
            orch.servers.push(newtlab_core::spec::Server { name: h.clone(), address: h, max_nodes: u32::MAX });
        }
    }

    let orchestrator = Orchestrator::new(transport());
    let store = JsonProfileStore::new(&dir);
    let (lab_state, errors) = orchestrator
        .deploy(&name, &dir.display().to_string(), &spec, &platforms, &profiles, &patches_root(&dir), &store, force, None)
        .await?;

    print_node_table(&lab_state.nodes);
    for e in &errors {
        eprintln!("warning: {e}");
    }

    if provision {
        let errors = orchestrator
            .provision(&name, &spec, None, parallel, std::time::Duration::from_secs(5), None)
            .await?;
        for e in &errors {
            eprintln!("warning: {e}");
        }
    }

    Ok(())
}

async fn cmd_destroy(topology: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let dir = resolve_topology_dir(&topology);
    let name = lab_name(&dir);
    let store = JsonProfileStore::new(&dir);
    Orchestrator::new(transport()).destroy(&name, &store, None).await?;
    println!("destroyed {name}");
    Ok(())
}

async fn cmd_status(topology: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let dir = resolve_topology_dir(&topology);
    let name = lab_name(&dir);
    let lab_state = Orchestrator::new(transport()).status(&name).await?;
    print_node_table(&lab_state.nodes);
    Ok(())
}

fn print_node_table(nodes: &std::collections::BTreeMap<String, newtlab_core::state::NodeState>) {
    #[derive(Tabled)]
    struct Row {
        node: String,
        status: String,
        phase: String,
        host: String,
        ssh_port: u16,
        console_port: u16,
    }
    let rows: Vec<Row> = nodes
        .iter()
        .map(|(name, n)| Row {
            node: name.clone(),
            status: format!("{:?}", n.status),
            phase: format!("{:?}", n.phase),
            host: if n.host.is_empty() { "local".to_string() } else { n.host.clone() },
            ssh_port: n.ssh_port,
            console_port: n.console_port,
        })
        .collect();
    println!("{}", Table::new(rows));
}

async fn cmd_ssh(lab: String, node: String) -> Result<(), Box<dyn std::error::Error>> {
    let lab_state = state::load_state(&lab)?;
    let node_state = lab_state
        .nodes
        .get(&node)
        .ok_or_else(|| LabError::StateMissing(format!("{lab}/{node}")))?;

    let mut cmd = tokio::process::Command::new("ssh");
    cmd.arg("-p").arg(node_state.ssh_port.to_string());
    if let Some(key) = &lab_state.ssh_key_path {
        cmd.arg("-i").arg(key);
    }
    cmd.arg(format!("{}@127.0.0.1", node_state.ssh_user));
    cmd.status().await?;
    Ok(())
}

async fn cmd_console(lab: String, node: String) -> Result<(), Box<dyn std::error::Error>> {
    let lab_state = state::load_state(&lab)?;
    let node_state = lab_state
        .nodes
        .get(&node)
        .ok_or_else(|| LabError::StateMissing(format!("{lab}/{node}")))?;

    tokio::process::Command::new("telnet")
        .arg("127.0.0.1")
        .arg(node_state.console_port.to_string())
        .status()
        .await?;
    Ok(())
}

async fn cmd_stop(lab: String, node: String) -> Result<(), Box<dyn std::error::Error>> {
    Orchestrator::new(transport()).stop_node(&lab, &node).await?;
    println!("stopped {node}");
    Ok(())
}

async fn cmd_start(topology: PathBuf, node: String) -> Result<(), Box<dyn std::error::Error>> {
    let dir = resolve_topology_dir(&topology);
    let name = lab_name(&dir);
    let platforms = load_platforms(&dir)?;
    let profiles = load_profiles(&dir)?;

    let default_profile = DeviceProfile::default();
    let profile = profiles.get(&node).unwrap_or(&default_profile);
    let default_platform = PlatformSpec::default();
    let platform = platforms.get(&profile.platform).unwrap_or(&default_platform);
    let node_config = resolve_node(&node, profile, platform)?;

    Orchestrator::new(transport()).start_node(&name, &node_config).await?;
    println!("started {node}");
    Ok(())
}

async fn cmd_provision(topology: PathBuf, device: Option<String>, parallel: usize) -> Result<(), Box<dyn std::error::Error>> {
    let dir = resolve_topology_dir(&topology);
    let name = lab_name(&dir);
    let spec = load_topology(&dir)?;
    let devices = device.map(|d| vec![d]);

    let errors = Orchestrator::new(transport())
        .provision(&name, &spec, devices.as_deref(), parallel, std::time::Duration::from_secs(5), None)
        .await?;
    for e in &errors {
        eprintln!("warning: {e}");
    }
    if errors.is_empty() {
        println!("provisioned");
    }
    Ok(())
}

async fn cmd_bridge_stats(lab: String, host: Option<String>) -> Result<(), Box<dyn std::error::Error>> {
    let snapshot = match host {
        Some(h) => {
            let lab_state = state::load_state(&lab)?;
            let bridge = lab_state
                .bridges
                .get(&h)
                .ok_or_else(|| LabError::StateMissing(format!("bridge on {h}")))?;
            fetch_tcp_stats(&bridge.stats_addr)?
        }
        None => {
            let sock = state::lab_dir(&lab).join("bridge.sock");
            fetch_unix_stats(&sock)?
        }
    };

    #[derive(Tabled)]
    struct Row {
        a: String,
        z: String,
        a_to_z: String,
        z_to_a: String,
        sessions: u64,
        connected: bool,
    }
    let rows: Vec<Row> = snapshot
        .links
        .into_iter()
        .map(|l| Row {
            a: l.a,
            z: l.z,
            a_to_z: human_bytes(l.a_to_z_bytes),
            z_to_a: human_bytes(l.z_to_a_bytes),
            sessions: l.sessions,
            connected: l.connected,
        })
        .collect();
    println!("{}", Table::new(rows));
    Ok(())
}

fn fetch_unix_stats(sock: &Path) -> Result<StatsSnapshot, Box<dyn std::error::Error>> {
    let mut stream = UnixStream::connect(sock)?;
    let mut body = Vec::new();
    stream.read_to_end(&mut body)?;
    Ok(serde_json::from_slice(&body)?)
}

fn fetch_tcp_stats(addr: &str) -> Result<StatsSnapshot, Box<dyn std::error::Error>> {
    use std::net::TcpStream;
    let mut stream = TcpStream::connect(addr)?;
    let mut body = Vec::new();
    stream.read_to_end(&mut body)?;
    Ok(serde_json::from_slice(&body)?)
}
