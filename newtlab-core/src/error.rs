//! Error taxonomy for the lab lifecycle engine.
//!
//! Every variant carries enough context (phase, node or link name) that an
//! operator-visible failure can always point at what went wrong and where,
//! per the propagation policy: phase errors are collected, not discarded.

use std::fmt;

#[derive(Debug, thiserror::Error)]
pub enum LabError {
    #[error("spec missing: {0}")]
    SpecMissing(String),

    #[error("spec invalid: {0}")]
    SpecInvalid(String),

    #[error("invalid interface {interface:?} under {scheme} mapping: {reason}")]
    InvalidInterface {
        scheme: String,
        interface: String,
        reason: String,
    },

    #[error("device {device:?} has no image (profile nor platform supplies VMImage)")]
    MissingImage { device: String },

    #[error("server {server:?} over capacity (max {max_nodes}, would carry {requested})")]
    PlacementOverCapacity {
        server: String,
        max_nodes: u32,
        requested: u32,
    },

    #[error("device {device:?} pinned to unknown server {server:?}")]
    PlacementUnknownServer { device: String, server: String },

    #[error("port(s) in use: {0:?}")]
    PortInUse(Vec<PortConflict>),

    #[error("failed to create overlay for node {node:?}: {reason}")]
    OverlayCreate { node: String, reason: String },

    #[error("failed to launch qemu for node {node:?}: {reason}")]
    QemuLaunch { node: String, reason: String },

    #[error("bridge failed to listen on {host:?}: {reason}")]
    BridgeListen { host: String, reason: String },

    #[error("bridge on {host:?} did not become ready: {reason}")]
    BridgeNotReady { host: String, reason: String },

    #[error("console login timed out for node {node:?} after {timeout_secs}s")]
    ConsoleLoginTimeout { node: String, timeout_secs: u64 },

    #[error("ssh readiness timed out for node {node:?} after {timeout_secs}s")]
    SshTimeout { node: String, timeout_secs: u64 },

    #[error("patch command failed for node {node:?}: {reason}")]
    PatchCommand { node: String, reason: String },

    #[error("remote ssh error on host {host:?}: {reason}")]
    RemoteSshError { host: String, reason: String },

    #[error("lab state not found: {0:?}")]
    StateMissing(String),

    #[error("failed to write state for lab {lab:?}: {reason}")]
    StateWriteError { lab: String, reason: String },

    #[error("worker binary version mismatch on host {host:?}: local {local} remote {remote}")]
    VersionMismatch {
        host: String,
        local: String,
        remote: String,
    },

    #[error("operation cancelled during phase {phase:?}")]
    Cancelled { phase: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortConflict {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for PortConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

pub type Result<T> = std::result::Result<T, LabError>;

/// A single failure attributed to a phase and, where applicable, a node or
/// link. Used by phases that latch the first error but keep processing
/// siblings (console bootstrap, patch application, destroy).
#[derive(Debug, Clone)]
pub struct PhaseError {
    pub phase: String,
    pub target: Option<String>,
    pub message: String,
}

impl fmt::Display for PhaseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.target {
            Some(t) => write!(f, "[{}:{}] {}", self.phase, t, self.message),
            None => write!(f, "[{}] {}", self.phase, self.message),
        }
    }
}

impl PhaseError {
    pub fn new(phase: impl Into<String>, target: Option<String>, err: impl fmt::Display) -> Self {
        Self {
            phase: phase.into(),
            target,
            message: err.to_string(),
        }
    }
}

/// Join a list of phase errors into a single displayable error, used by
/// `Destroy` which never aborts early and instead joins everything it saw.
pub fn join_errors(errors: &[PhaseError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_errors_formats_phase_and_target() {
        let errs = vec![
            PhaseError::new("destroy", Some("leaf1".to_string()), "boom"),
            PhaseError::new("destroy", None, "bridge stop failed"),
        ];
        let joined = join_errors(&errs);
        assert_eq!(joined, "[destroy:leaf1] boom; [destroy] bridge stop failed");
    }
}
