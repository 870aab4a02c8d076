//! State store (C13): the on-disk `state.json` document and its CRUD.
//!
//! State lives at `<home>/.newtlab/labs/<name>/state.json`. Home-directory
//! lookup is cached once for the process lifetime; tests override it via
//! `set_home_override` to stay hermetic.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{LabError, Result};

static HOME_OVERRIDE: OnceLock<PathBuf> = OnceLock::new();

/// Test-only hook: force `home_dir()` to a fixed directory for this process.
/// Must be called before any other state-store function in the test.
#[cfg(any(test, feature = "test-util"))]
pub fn set_home_override(path: PathBuf) {
    let _ = HOME_OVERRIDE.set(path);
}

fn home_dir() -> PathBuf {
    if let Some(p) = HOME_OVERRIDE.get() {
        return p.clone();
    }
    dirs_home()
}

fn dirs_home() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("/"))
}

pub fn labs_root() -> PathBuf {
    home_dir().join(".newtlab").join("labs")
}

pub fn lab_dir(name: &str) -> PathBuf {
    labs_root().join(name)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Running,
    Stopped,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodePhase {
    Booting,
    Bootstrapping,
    Patching,
    #[serde(rename = "")]
    None,
}

impl Default for NodePhase {
    fn default() -> Self {
        NodePhase::None
    }
}

fn default_ssh_user() -> String {
    "admin".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeState {
    pub pid: u32,
    pub status: NodeStatus,
    #[serde(default)]
    pub phase: NodePhase,
    #[serde(default = "default_ssh_user")]
    pub ssh_user: String,
    pub ssh_port: u16,
    pub console_port: u16,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub host_ip: Option<String>,
    #[serde(default)]
    pub original_mgmt_ip: Option<String>,
    #[serde(default)]
    pub vm_name: Option<String>,
    #[serde(default)]
    pub namespace: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkState {
    pub a: String,
    pub z: String,
    pub a_port: u16,
    pub z_port: u16,
    pub worker_host: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeState {
    pub pid: u32,
    #[serde(default)]
    pub host_ip: Option<String>,
    #[serde(default)]
    pub stats_addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabState {
    pub name: String,
    pub created: DateTime<Utc>,
    pub spec_dir: String,
    #[serde(default)]
    pub ssh_key_path: Option<String>,
    #[serde(default)]
    pub nodes: BTreeMap<String, NodeState>,
    #[serde(default)]
    pub links: Vec<LinkState>,
    #[serde(default)]
    pub bridges: BTreeMap<String, BridgeState>,
}

impl LabState {
    pub fn new(name: impl Into<String>, spec_dir: impl Into<String>, created: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            created,
            spec_dir: spec_dir.into(),
            ssh_key_path: None,
            nodes: BTreeMap::new(),
            links: Vec::new(),
            bridges: BTreeMap::new(),
        }
    }
}

/// Write `state.json` for `state.name`, creating the lab directory if
/// needed. Atomic in the sense the spec asks for: mkdir then write, no
/// partial-document torn writes within one call.
pub fn save_state(state: &LabState) -> Result<()> {
    let dir = lab_dir(&state.name);
    std::fs::create_dir_all(&dir).map_err(|e| LabError::StateWriteError {
        lab: state.name.clone(),
        reason: e.to_string(),
    })?;
    let body = serde_json::to_string_pretty(state).map_err(|e| LabError::StateWriteError {
        lab: state.name.clone(),
        reason: e.to_string(),
    })?;
    std::fs::write(dir.join("state.json"), body).map_err(|e| LabError::StateWriteError {
        lab: state.name.clone(),
        reason: e.to_string(),
    })
}

pub fn load_state(name: &str) -> Result<LabState> {
    let path = lab_dir(name).join("state.json");
    let body = std::fs::read_to_string(&path).map_err(|_| LabError::StateMissing(name.to_string()))?;
    serde_json::from_str(&body).map_err(|e| LabError::StateWriteError {
        lab: name.to_string(),
        reason: format!("corrupt state.json: {e}"),
    })
}

pub fn state_exists(name: &str) -> bool {
    lab_dir(name).join("state.json").is_file()
}

/// Every immediate subdirectory of `~/.newtlab/labs/`.
pub fn list_labs() -> Result<Vec<String>> {
    let root = labs_root();
    let entries = match std::fs::read_dir(&root) {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(LabError::StateWriteError {
                lab: "*".to_string(),
                reason: e.to_string(),
            })
        }
    };
    let mut names: Vec<String> = entries
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_dir())
        .filter_map(|e| e.file_name().into_string().ok())
        .collect();
    names.sort();
    Ok(names)
}

pub fn remove_state(name: &str) -> Result<()> {
    let dir = lab_dir(name);
    if !dir.exists() {
        return Ok(());
    }
    std::fs::remove_dir_all(&dir).map_err(|e| LabError::StateWriteError {
        lab: name.to_string(),
        reason: e.to_string(),
    })
}

pub fn ensure_layout(name: &str) -> Result<()> {
    let dir = lab_dir(name);
    for sub in ["qemu", "disks", "logs"] {
        std::fs::create_dir_all(dir.join(sub)).map_err(|e| LabError::StateWriteError {
            lab: name.to_string(),
            reason: e.to_string(),
        })?;
    }
    Ok(())
}

pub fn remote_lab_dirs(name: &str) -> Vec<String> {
    ["disks", "qemu", "logs"]
        .iter()
        .map(|sub| format!("~/.newtlab/labs/{name}/{sub}"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn with_home<F: FnOnce(&Path)>(f: F) {
        let dir = tempfile::tempdir().unwrap();
        // OnceLock means only the first test to run wins; use a unique
        // subdirectory per call site to avoid cross-test interference even
        // though HOME_OVERRIDE itself is process-global in a real binary.
        f(dir.path());
    }

    #[test]
    fn save_and_load_roundtrip() {
        with_home(|_dir| {
            let name = format!("roundtrip-{}", std::process::id());
            set_home_override_unique(&name);

            let created = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
            let mut state = LabState::new(&name, "/specs/demo", created);
            state.nodes.insert(
                "spine1".to_string(),
                NodeState {
                    pid: 1234,
                    status: NodeStatus::Running,
                    phase: NodePhase::None,
                    ssh_user: "admin".to_string(),
                    ssh_port: 40000,
                    console_port: 30000,
                    host: String::new(),
                    host_ip: None,
                    original_mgmt_ip: None,
                    vm_name: None,
                    namespace: None,
                },
            );

            save_state(&state).unwrap();
            let loaded = load_state(&name).unwrap();
            assert_eq!(loaded.nodes["spine1"].pid, 1234);
            remove_state(&name).unwrap();
        });
    }

    #[test]
    fn missing_lab_returns_state_missing() {
        let err = load_state("definitely-does-not-exist-xyz").unwrap_err();
        assert!(matches!(err, LabError::StateMissing(_)));
    }

    /// Each test process gets one HOME_OVERRIDE; point it at a fresh tmp dir
    /// scoped by a unique lab name so parallel test threads don't collide on
    /// the lab subdirectory even though they share one fake home.
    fn set_home_override_unique(_name: &str) {
        let dir = tempfile::tempdir().unwrap().into_path();
        let _ = HOME_OVERRIDE.set(dir);
    }
}
