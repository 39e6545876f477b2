//! Thin client used by every CLI command except `server start`.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use flotilla_proto::{ChannelImages, DaemonInfo, MacAssignment, Operation, VmInfo};

use crate::config::DaemonConfig;
use crate::daemon::{self, DaemonClient};
use crate::error::FleetError;
use crate::vm_state::BootState;

pub struct Session {
    addr: SocketAddr,
    client: DaemonClient,
    timeout: Duration,
    info: DaemonInfo,
}

impl Session {
    /// Probe the daemon and keep a client for follow-up calls.
    pub async fn open(config: &DaemonConfig) -> Result<Self, FleetError> {
        let addr = config.listen_addr()?;
        let info = daemon::probe(addr, config.probe_timeout()).await?;
        Ok(Self {
            addr,
            client: daemon::connect(addr),
            timeout: config.call_timeout(),
            info,
        })
    }

    pub fn info(&self) -> &DaemonInfo {
        &self.info
    }

    pub async fn images_list(&self) -> Result<Vec<ChannelImages>, FleetError> {
        daemon::call(self.addr, Operation::ImagesList, self.timeout, self.client.images_list()).await
    }

    pub async fn images_remove(
        &self,
        channel: &str,
        version: &str,
    ) -> Result<Vec<ChannelImages>, FleetError> {
        let request = self
            .client
            .images_remove(channel.to_string(), version.to_string());
        daemon::call(self.addr, Operation::ImagesRemove, self.timeout, request).await
    }

    pub async fn vm_list(&self) -> Result<Vec<VmInfo>, FleetError> {
        daemon::call(self.addr, Operation::VmList, self.timeout, self.client.vm_list()).await
    }

    pub async fn vm_run(&self, draft: VmInfo) -> Result<VmInfo, FleetError> {
        daemon::call(self.addr, Operation::VmRun, self.timeout, self.client.vm_run(draft)).await
    }

    pub async fn vm_stop(&self, targets: Vec<String>) -> Result<Vec<String>, FleetError> {
        daemon::call(self.addr, Operation::VmStop, self.timeout, self.client.vm_stop(targets)).await
    }

    pub async fn vm_uuid2mac(&self, uuid: &str) -> Result<MacAssignment, FleetError> {
        let request = self.client.vm_uuid2mac(uuid.to_string(), uuid.to_string());
        daemon::call(self.addr, Operation::VmUuid2Mac, self.timeout, request).await
    }

    pub async fn server_stop(&self) -> Result<String, FleetError> {
        daemon::call(self.addr, Operation::ServerStop, self.timeout, self.client.server_stop()).await
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

/// Newest listed version of `channel`.
pub fn latest_version(images: &[ChannelImages], channel: &str) -> Option<String> {
    images
        .iter()
        .find(|c| c.channel == channel)
        .and_then(|c| c.versions.last().cloned())
}

/// Channels shown by `images ls`: every version of `channel`, or of every
/// channel with `all`.
pub fn browse(mut images: Vec<ChannelImages>, channel: &str, all: bool) -> Vec<ChannelImages> {
    if !all {
        images.retain(|c| c.channel == channel);
    }
    images
}

/// Every listed version of `channel` except the newest.
pub fn old_versions(images: &[ChannelImages], channel: &str) -> Vec<String> {
    match images.iter().find(|c| c.channel == channel) {
        Some(c) if c.versions.len() > 1 => c.versions[..c.versions.len() - 1].to_vec(),
        _ => Vec::new(),
    }
}

/// A VM by UUID first, then by name.
pub fn find_vm<'a>(vms: &'a [VmInfo], target: &str) -> Option<&'a VmInfo> {
    vms.iter()
        .find(|vm| vm.uuid == target)
        .or_else(|| vms.iter().find(|vm| vm.name == target))
}

/// Volumes are resolved on the client so the daemon never depends on the
/// caller's working directory.
pub fn absolutize(path: &Path) -> Result<String, FleetError> {
    let abs: PathBuf = std::fs::canonicalize(path)
        .map_err(|e| FleetError::io(format!("resolving {}", path.display()), e))?;
    Ok(abs.display().to_string())
}

pub fn ps_table(vms: &[VmInfo], all: bool) -> String {
    let mut out = format!(
        "{:<36}  {:<16}  {:<15}  {:>6}  {:>4}  {:<16}  {}\n",
        "UUID", "NAME", "IP", "MEM", "CPUS", "STATE", "IMAGE"
    );
    for vm in vms
        .iter()
        .filter(|vm| all || vm.state == BootState::Running)
    {
        let ip = if vm.public_ip.is_empty() {
            "-"
        } else {
            &vm.public_ip
        };
        out.push_str(&format!(
            "{:<36}  {:<16}  {:<15}  {:>6}  {:>4}  {:<16}  {}/{}\n",
            vm.uuid,
            vm.name,
            ip,
            vm.memory_mb,
            vm.cpus,
            vm.state.as_str(),
            vm.channel,
            vm.version
        ));
    }
    out
}
