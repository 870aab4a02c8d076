//! Patch applier (C11): load, render, and apply post-boot patch descriptors
//! over SSH.
//!
//! Descriptor authoring is a data-driven input format (spec.md §6); this
//! module resolves a node's applicable descriptors in order, renders their
//! templates against a `PatchVars` struct, and runs the resulting commands.

use std::collections::HashMap;
use std::path::Path;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{LabError, PhaseError, Result};
use crate::transport::Transport;

/// Variables a patch descriptor's templates resolve against (spec.md §6).
#[derive(Debug, Clone, Serialize)]
pub struct PatchVars {
    pub num_ports: u32,
    pub pci_addrs: Vec<String>,
    pub port_stride: u32,
    pub hw_sku_dir: String,
    pub port_speed: String,
    pub platform: String,
    pub dataplane: String,
    pub release: String,
}

impl PatchVars {
    /// Data NICs occupy PCI slots starting at 4 (slot 0-3 reserved for the
    /// chipset and the management NIC).
    pub fn new(
        num_ports: u32,
        port_stride: u32,
        hw_sku_dir: impl Into<String>,
        port_speed: impl Into<String>,
        platform: impl Into<String>,
        dataplane: impl Into<String>,
        release: impl Into<String>,
    ) -> Self {
        let pci_addrs = (0..num_ports)
            .map(|i| format!("0000:00:{:02x}.0", 4 + i))
            .collect();
        Self {
            num_ports,
            pci_addrs,
            port_stride,
            hw_sku_dir: hw_sku_dir.into(),
            port_speed: port_speed.into(),
            platform: platform.into(),
            dataplane: dataplane.into(),
            release: release.into(),
        }
    }

    fn lookup(&self, name: &str) -> Option<String> {
        match name {
            "NumPorts" => Some(self.num_ports.to_string()),
            "PortStride" => Some(self.port_stride.to_string()),
            "HWSkuDir" => Some(self.hw_sku_dir.clone()),
            "PortSpeed" => Some(self.port_speed.clone()),
            "Platform" => Some(self.platform.clone()),
            "Dataplane" => Some(self.dataplane.clone()),
            "Release" => Some(self.release.clone()),
            other if other.starts_with("PCIAddrs[") && other.ends_with(']') => {
                let idx: usize = other["PCIAddrs[".len()..other.len() - 1].parse().ok()?;
                self.pci_addrs.get(idx).cloned()
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FileEntry {
    pub template: String,
    pub dest: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisEntry {
    pub db: u32,
    pub template: String,
}

/// One resolved `(dataplane, release)` patch descriptor (spec.md §4.11, §6).
#[derive(Debug, Clone, Deserialize)]
pub struct PatchDescriptor {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub pre_commands: Vec<String>,
    #[serde(default)]
    pub disable_files: Vec<String>,
    #[serde(default)]
    pub files: Vec<FileEntry>,
    #[serde(default)]
    pub redis: Vec<RedisEntry>,
    #[serde(default)]
    pub post_commands: Vec<String>,
}

/// Resolve descriptor application order for a node: `always/*.json` in
/// lexical order, then `<release>/*.json` in lexical order. Both optional.
pub fn resolution_order(descriptor_dir: &Path, release: &str) -> Vec<std::path::PathBuf> {
    let mut paths = Vec::new();
    for sub in ["always", release] {
        let dir = descriptor_dir.join(sub);
        let Ok(mut entries) = std::fs::read_dir(&dir).map(|rd| {
            rd.filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
                .collect::<Vec<_>>()
        }) else {
            continue;
        };
        entries.sort();
        paths.extend(entries);
    }
    paths
}

/// Load every descriptor applicable to `(dataplane, release)` in resolution
/// order, along with the template files it references (sibling filenames
/// within the same directory as the descriptor).
pub fn load_patches(
    patches_root: &Path,
    dataplane: &str,
    release: &str,
) -> Result<Vec<(PatchDescriptor, HashMap<String, String>)>> {
    let dataplane_dir = patches_root.join(dataplane);
    let mut out = Vec::new();

    for path in resolution_order(&dataplane_dir, release) {
        let body = std::fs::read_to_string(&path).map_err(|e| LabError::PatchCommand {
            node: String::new(),
            reason: format!("reading patch descriptor {}: {e}", path.display()),
        })?;
        let descriptor: PatchDescriptor = serde_json::from_str(&body).map_err(|e| LabError::PatchCommand {
            node: String::new(),
            reason: format!("parsing patch descriptor {}: {e}", path.display()),
        })?;

        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let mut templates = HashMap::new();
        for file in &descriptor.files {
            let template_path = dir.join(&file.template);
            let contents = std::fs::read_to_string(&template_path).map_err(|e| LabError::PatchCommand {
                node: String::new(),
                reason: format!("reading template {}: {e}", template_path.display()),
            })?;
            templates.insert(file.template.clone(), contents);
        }

        out.push((descriptor, templates));
    }
    Ok(out)
}

/// Render a template against `vars`. Supports bare `{{Var}}` / `{{PCIAddrs[i]}}`
/// substitution and the `add(a,b)` / `mul(a,b)` helpers, where `a`/`b` are
/// variable names or integer literals (spec.md §6 — no loops or conditionals
/// in patch templates).
pub fn render(template: &str, vars: &PatchVars) -> Result<String> {
    let re = Regex::new(r"\{\{\s*([^}]+?)\s*\}\}").expect("static pattern is valid");
    let mut err = None;
    let rendered = re.replace_all(template, |caps: &regex::Captures| {
        let expr = caps[1].trim();
        match eval_expr(expr, vars) {
            Ok(v) => v,
            Err(e) => {
                err.get_or_insert(e);
                String::new()
            }
        }
    });
    match err {
        Some(e) => Err(e),
        None => Ok(rendered.into_owned()),
    }
}

fn eval_expr(expr: &str, vars: &PatchVars) -> Result<String> {
    if let Some(inner) = expr.strip_prefix("add(").and_then(|s| s.strip_suffix(')')) {
        let (a, b) = split_args(inner)?;
        let a = resolve_int(&a, vars)?;
        let b = resolve_int(&b, vars)?;
        return Ok((a + b).to_string());
    }
    if let Some(inner) = expr.strip_prefix("mul(").and_then(|s| s.strip_suffix(')')) {
        let (a, b) = split_args(inner)?;
        let a = resolve_int(&a, vars)?;
        let b = resolve_int(&b, vars)?;
        return Ok((a * b).to_string());
    }
    vars.lookup(expr)
        .ok_or_else(|| LabError::PatchCommand {
            node: String::new(),
            reason: format!("unresolved template variable {expr:?}"),
        })
}

fn split_args(inner: &str) -> Result<(String, String)> {
    let mut parts = inner.splitn(2, ',');
    let a = parts.next().unwrap_or_default().trim().to_string();
    let b = parts
        .next()
        .ok_or_else(|| LabError::PatchCommand {
            node: String::new(),
            reason: format!("malformed helper arguments {inner:?}"),
        })?
        .trim()
        .to_string();
    Ok((a, b))
}

fn resolve_int(token: &str, vars: &PatchVars) -> Result<i64> {
    if let Ok(n) = token.parse::<i64>() {
        return Ok(n);
    }
    vars.lookup(token)
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| LabError::PatchCommand {
            node: String::new(),
            reason: format!("{token:?} is not an integer or known variable"),
        })
}

/// Apply one descriptor to `node` over `transport`: pre-commands, disabled
/// files, rendered files, rendered Redis commands, post-commands, in order.
/// A failing command aborts the remaining stream for this node. `guest_host`
/// and `ssh_port` address the node's forwarded management port.
pub async fn apply(
    node: &str,
    guest_host: &str,
    ssh_port: u16,
    identity: Option<&Path>,
    descriptor: &PatchDescriptor,
    templates: &HashMap<String, String>,
    vars: &PatchVars,
    transport: &Transport,
) -> std::result::Result<(), PhaseError> {
    let run = |cmd: String| {
        let guest_host = guest_host.to_string();
        let node = node.to_string();
        let transport = transport;
        async move {
            transport
                .exec_port(&guest_host, ssh_port, identity, "sh", &["-c".to_string(), cmd])
                .await
                .map_err(|e| PhaseError::new("patching", Some(node), e))
        }
    };

    for cmd in &descriptor.pre_commands {
        run(cmd.clone()).await?;
    }

    for path in &descriptor.disable_files {
        run(format!("sudo mv {path} {path}.disabled")).await?;
    }

    for file in &descriptor.files {
        let body = templates.get(&file.template).ok_or_else(|| {
            PhaseError::new(
                "patching",
                Some(node.to_string()),
                format!("template {:?} not found in descriptor directory", file.template),
            )
        })?;
        let rendered_body =
            render(body, vars).map_err(|e| PhaseError::new("patching", Some(node.to_string()), e))?;
        let rendered_dest = render(&file.dest, vars)
            .map_err(|e| PhaseError::new("patching", Some(node.to_string()), e))?;
        let cmd = format!(
            "printf '%s' {} | sudo tee {} >/dev/null",
            shell_single_quote(&rendered_body),
            rendered_dest
        );
        run(cmd).await?;
    }

    for entry in &descriptor.redis {
        let rendered_line = render(&entry.template, vars)
            .map_err(|e| PhaseError::new("patching", Some(node.to_string()), e))?;
        let cmd = format!("redis-cli -n {} {}", entry.db, rendered_line);
        run(cmd).await?;
    }

    for cmd in &descriptor.post_commands {
        run(cmd.clone()).await?;
    }

    Ok(())
}

fn shell_single_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r#"'\''"#))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars() -> PatchVars {
        PatchVars::new(4, 2, "/usr/share/sonic/hwsku/generic", "100G", "sonic-vpp", "vpp", "202311")
    }

    #[test]
    fn renders_plain_variables() {
        let out = render("platform={{Platform}} release={{Release}}", &vars()).unwrap();
        assert_eq!(out, "platform=sonic-vpp release=202311");
    }

    #[test]
    fn renders_pci_addr_index() {
        let out = render("addr={{PCIAddrs[0]}}", &vars()).unwrap();
        assert_eq!(out, "addr=0000:00:04.0");
    }

    #[test]
    fn renders_add_and_mul_helpers() {
        assert_eq!(render("{{add(NumPorts, 1)}}", &vars()).unwrap(), "5");
        assert_eq!(render("{{mul(NumPorts, PortStride)}}", &vars()).unwrap(), "8");
    }

    #[test]
    fn unknown_variable_errors() {
        let err = render("{{Bogus}}", &vars()).unwrap_err();
        assert!(matches!(err, LabError::PatchCommand { .. }));
    }

    #[test]
    fn resolution_order_lists_always_then_release_lexically() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("always")).unwrap();
        std::fs::create_dir_all(dir.path().join("202311")).unwrap();
        std::fs::write(dir.path().join("always/b.json"), "{}").unwrap();
        std::fs::write(dir.path().join("always/a.json"), "{}").unwrap();
        std::fs::write(dir.path().join("202311/z.json"), "{}").unwrap();

        let order = resolution_order(dir.path(), "202311");
        let names: Vec<_> = order
            .iter()
            .map(|p| p.file_name().unwrap().to_str().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["a.json", "b.json", "z.json"]);
    }

    #[tokio::test]
    async fn failing_precommand_aborts_remaining_stream() {
        let descriptor = PatchDescriptor {
            description: "test".to_string(),
            pre_commands: vec!["false".to_string()],
            disable_files: vec![],
            files: vec![],
            redis: vec![],
            post_commands: vec!["echo should-not-run".to_string()],
        };
        let transport = Transport::new(std::path::PathBuf::from("/tmp"), "v1".to_string());
        let err = apply(
            "spine1",
            "admin@127.0.0.1",
            40000,
            None,
            &descriptor,
            &HashMap::new(),
            &vars(),
            &transport,
        )
        .await
        .unwrap_err();
        assert_eq!(err.phase, "patching");
    }
}
