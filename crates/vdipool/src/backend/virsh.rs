//! libvirt adapter driven through the `virsh` and `virt-clone` tools.
//!
//! Machines are libvirt domains identified by name. Pool tags are kept one
//! per line in the domain description; templates are shut-off domains whose
//! description carries the [`TEMPLATE_TAG`] line. A clone's first network
//! interface is moved onto the pool's network.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, warn};
use vdipool_core::{
    AdapterCapabilities, AdapterError, AdapterResult, HypervisorAdapter, MachineId, MachineInfo,
    MachineSpec, PoolId, PowerState, Template,
};

pub const DEFAULT_URI: &str = "qemu:///system";

/// Description line marking a domain as a template.
pub const TEMPLATE_TAG: &str = "vdipool:template";

const POOL_TAG_PREFIX: &str = "vdipool:pool=";
const SOURCE_TAG_PREFIX: &str = "vdipool:source=";

pub struct VirshAdapter {
    virsh_path: Option<PathBuf>,
    virt_clone_path: Option<PathBuf>,
    uri: String,
    capabilities: AdapterCapabilities,
}

impl VirshAdapter {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            virsh_path: which::which("virsh").ok(),
            virt_clone_path: which::which("virt-clone").ok(),
            uri: uri.into(),
            capabilities: AdapterCapabilities {
                rebuild: false,
                domain_join: false,
                static_addressing: false,
                tagging: true,
            },
        }
    }

    #[cfg(test)]
    fn with_tools(virsh: PathBuf, virt_clone: PathBuf) -> Self {
        Self {
            virsh_path: Some(virsh),
            virt_clone_path: Some(virt_clone),
            ..Self::new("test:///default")
        }
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    fn unavailable(tool: &str) -> AdapterError {
        AdapterError::Permanent(format!("{tool} binary not found in PATH"))
    }

    async fn exec(&self, program: &Path, args: &[&str]) -> AdapterResult<String> {
        debug!(program = %program.display(), ?args, "running libvirt tool");
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| AdapterError::Transient(format!("failed to run {}: {e}", program.display())))?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(classify_error(&String::from_utf8_lossy(&output.stderr)))
        }
    }

    async fn virsh(&self, args: &[&str]) -> AdapterResult<String> {
        let virsh = self.virsh_path.as_ref().ok_or_else(|| Self::unavailable("virsh"))?;
        let mut full = vec!["--connect", self.uri.as_str(), "--quiet"];
        full.extend_from_slice(args);
        self.exec(virsh, &full).await
    }

    async fn domains(&self) -> AdapterResult<Vec<String>> {
        Ok(parse_lines(&self.virsh(&["list", "--all", "--name"]).await?))
    }

    async fn tags(&self, domain: &str) -> AdapterResult<Vec<String>> {
        Ok(parse_lines(&self.virsh(&["desc", domain]).await?))
    }

    async fn set_tags(&self, domain: &str, tags: &[String]) -> AdapterResult<()> {
        let desc = tags.join("\n");
        self.virsh(&["desc", domain, "--config", "--new-desc", desc.as_str()])
            .await
            .map(|_| ())
    }

    async fn set_network(&self, domain: &str, network: &str) -> AdapterResult<()> {
        let interfaces = parse_domiflist(&self.virsh(&["domiflist", domain]).await?);
        for command in network_commands(domain, &interfaces, network) {
            let args: Vec<&str> = command.iter().map(String::as_str).collect();
            self.virsh(&args).await?;
        }
        Ok(())
    }

    /// Applies the pool's network and tags to a fresh clone.
    async fn customize(&self, spec: &MachineSpec) -> AdapterResult<()> {
        self.set_network(&spec.name, &spec.network).await?;
        let mut tags = spec.tags.clone();
        tags.push(format!("{SOURCE_TAG_PREFIX}{}", spec.template));
        self.set_tags(&spec.name, &tags).await
    }

    async fn address(&self, domain: &str) -> Option<String> {
        let sources = ["lease", "agent", "arp"];
        for source in sources {
            if let Ok(out) = self.virsh(&["domifaddr", domain, "--source", source]).await {
                if let Some(addr) = parse_ipv4(&out) {
                    return Some(addr);
                }
            }
        }
        None
    }
}

impl Default for VirshAdapter {
    fn default() -> Self {
        Self::new(DEFAULT_URI)
    }
}

#[async_trait]
impl HypervisorAdapter for VirshAdapter {
    fn name(&self) -> &'static str {
        "virsh"
    }

    fn capabilities(&self) -> &AdapterCapabilities {
        &self.capabilities
    }

    fn is_available(&self) -> bool {
        self.virsh_path.is_some() && self.virt_clone_path.is_some()
    }

    async fn list_machines(&self, tags: &[String]) -> AdapterResult<Vec<MachineId>> {
        let mut ids = Vec::new();
        for domain in self.domains().await? {
            let domain_tags = match self.tags(&domain).await {
                Ok(t) => t,
                // Undefined between the listing and now.
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            };
            if tags.iter().all(|t| domain_tags.contains(t)) {
                ids.push(MachineId::new(domain));
            }
        }
        Ok(ids)
    }

    async fn get_machine(&self, id: &MachineId) -> AdapterResult<MachineInfo> {
        let state = self.virsh(&["domstate", id.as_str()]).await?;
        let power = parse_power(&state);
        let tags = self.tags(id.as_str()).await?;
        let address = if power == PowerState::On {
            self.address(id.as_str()).await
        } else {
            None
        };
        Ok(MachineInfo {
            id: id.clone(),
            name: id.as_str().to_string(),
            pool: tags
                .iter()
                .find_map(|t| t.strip_prefix(POOL_TAG_PREFIX))
                .map(PoolId::new),
            template: tags
                .iter()
                .find_map(|t| t.strip_prefix(SOURCE_TAG_PREFIX))
                .map(str::to_string),
            power,
            address,
            tags,
        })
    }

    async fn list_templates(&self, _folder: Option<&str>) -> AdapterResult<Vec<Template>> {
        let mut templates = Vec::new();
        for domain in self.domains().await? {
            let tags = match self.tags(&domain).await {
                Ok(t) => t,
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            };
            if !tags.iter().any(|t| t == TEMPLATE_TAG) {
                continue;
            }
            let snapshots = self
                .virsh(&["snapshot-list", domain.as_str(), "--name"])
                .await
                .map(|out| parse_lines(&out))
                .unwrap_or_default();
            let mut template = Template::new(domain.clone(), domain);
            template.snapshots = snapshots;
            templates.push(template);
        }
        Ok(templates)
    }

    async fn storage(&self) -> AdapterResult<BTreeMap<String, String>> {
        let out = self.virsh(&["pool-list", "--all", "--name"]).await?;
        Ok(parse_lines(&out).into_iter().map(|n| (n.clone(), n)).collect())
    }

    async fn networks(&self) -> AdapterResult<BTreeMap<String, String>> {
        let out = self.virsh(&["net-list", "--all", "--name"]).await?;
        Ok(parse_lines(&out).into_iter().map(|n| (n.clone(), n)).collect())
    }

    async fn create_machine(&self, spec: &MachineSpec) -> AdapterResult<MachineId> {
        if spec.snapshot.is_some() {
            return Err(AdapterError::Unsupported(
                "cloning from a snapshot".to_string(),
            ));
        }
        if spec.domain_join.is_some() {
            return Err(AdapterError::Unsupported("domain join".to_string()));
        }
        if spec.addressing.is_static() {
            return Err(AdapterError::Unsupported("static addressing".to_string()));
        }
        let virt_clone = self
            .virt_clone_path
            .as_ref()
            .ok_or_else(|| Self::unavailable("virt-clone"))?;

        self.exec(
            virt_clone,
            &[
                "--connect",
                self.uri.as_str(),
                "--original",
                spec.template.as_str(),
                "--name",
                spec.name.as_str(),
                "--auto-clone",
            ],
        )
        .await?;

        // An untagged clone is invisible to reconciliation, so it must not
        // outlive a failed setup.
        if let Err(e) = self.customize(spec).await {
            warn!(machine = %spec.name, error = %e, "clone setup failed, removing clone");
            let name = spec.name.as_str();
            if let Err(cleanup) = self.virsh(&["undefine", name, "--remove-all-storage"]).await {
                warn!(machine = %spec.name, error = %cleanup, "failed to remove clone");
            }
            return Err(e);
        }
        Ok(MachineId::new(spec.name.clone()))
    }

    async fn destroy_machine(&self, id: &MachineId) -> AdapterResult<()> {
        match self.virsh(&["destroy", id.as_str()]).await {
            Ok(_) => {}
            Err(AdapterError::Permanent(msg)) if msg.contains("not running") => {}
            Err(e) => return Err(e),
        }
        self.virsh(&["undefine", id.as_str(), "--remove-all-storage"])
            .await
            .map(|_| ())
    }

    async fn start_machine(&self, id: &MachineId) -> AdapterResult<()> {
        match self.virsh(&["start", id.as_str()]).await {
            Ok(_) => Ok(()),
            Err(AdapterError::Permanent(msg)) if msg.contains("already active") => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn stop_machine(&self, id: &MachineId, clean: bool) -> AdapterResult<()> {
        let command = if clean { "shutdown" } else { "destroy" };
        self.virsh(&[command, id.as_str()]).await.map(|_| ())
    }

    async fn restart_machine(&self, id: &MachineId, clean: bool) -> AdapterResult<()> {
        let command = if clean { "reboot" } else { "reset" };
        self.virsh(&[command, id.as_str()]).await.map(|_| ())
    }

    async fn rebuild_machine(&self, _id: &MachineId) -> AdapterResult<()> {
        Err(AdapterError::Unsupported("rebuild".to_string()))
    }
}

fn parse_lines(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

/// One row of `virsh domiflist`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Interface {
    kind: String,
    source: String,
    model: String,
    mac: String,
}

fn parse_domiflist(output: &str) -> Vec<Interface> {
    output
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            match fields.as_slice() {
                [_, kind, source, model, mac] if *kind != "Type" && mac.contains(':') => {
                    Some(Interface {
                        kind: kind.to_string(),
                        source: source.to_string(),
                        model: model.to_string(),
                        mac: mac.to_string(),
                    })
                }
                _ => None,
            }
        })
        .collect()
}

/// virsh invocations that put the domain's first interface on `network`,
/// keeping its MAC address and model. A domain without interfaces gets one.
fn network_commands(domain: &str, interfaces: &[Interface], network: &str) -> Vec<Vec<String>> {
    let owned = |args: &[&str]| args.iter().map(|a| a.to_string()).collect::<Vec<_>>();
    if network.is_empty() {
        return Vec::new();
    }
    let Some(nic) = interfaces.first() else {
        return vec![owned(&[
            "attach-interface",
            domain,
            "network",
            network,
            "--model",
            "virtio",
            "--config",
        ])];
    };
    if nic.kind == "network" && nic.source == network {
        return Vec::new();
    }
    let model = if nic.model == "-" { "virtio" } else { nic.model.as_str() };
    vec![
        owned(&[
            "detach-interface",
            domain,
            nic.kind.as_str(),
            "--mac",
            nic.mac.as_str(),
            "--config",
        ]),
        owned(&[
            "attach-interface",
            domain,
            "network",
            network,
            "--model",
            model,
            "--mac",
            nic.mac.as_str(),
            "--config",
        ]),
    ]
}

fn parse_power(state: &str) -> PowerState {
    match state.trim() {
        "running" | "idle" | "in shutdown" => PowerState::On,
        "shut off" | "crashed" => PowerState::Off,
        "paused" | "pmsuspended" => PowerState::Suspended,
        _ => PowerState::Unknown,
    }
}

/// First IPv4 address in `virsh domifaddr` output, without its prefix length.
fn parse_ipv4(output: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let mut fields = line.split_whitespace();
        fields.find(|f| *f == "ipv4")?;
        let addr = fields.next()?;
        Some(addr.split('/').next().unwrap_or(addr).to_string())
    })
}

/// Maps libvirt error text to an adapter error kind.
fn classify_error(stderr: &str) -> AdapterError {
    let message = stderr
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("unknown libvirt error")
        .trim_start_matches("error: ")
        .to_string();
    let lower = stderr.to_ascii_lowercase();

    if lower.contains("domain not found")
        || lower.contains("no domain with matching")
        || lower.contains("failed to get domain")
    {
        AdapterError::NotFound(message)
    } else if lower.contains("authentication failed") || lower.contains("access denied") {
        AdapterError::AuthFailure(message)
    } else if lower.contains("timed out") {
        AdapterError::Timeout(message)
    } else if lower.contains("no space left")
        || lower.contains("cannot allocate memory")
        || lower.contains("quota")
    {
        AdapterError::QuotaExceeded(message)
    } else if lower.contains("failed to connect")
        || lower.contains("cannot recv data")
        || lower.contains("connection reset")
        || lower.contains("resource busy")
        || lower.contains("is locked")
    {
        AdapterError::Transient(message)
    } else {
        AdapterError::Permanent(message)
    }
}
