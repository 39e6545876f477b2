use facet::Facet;

/// Well-known loopback endpoint the daemon listens on.
pub const DEFAULT_ADDR: &str = "127.0.0.1:2511";

/// Placeholder UUID a client sends to ask the daemon for a fresh identity.
pub const RANDOM_UUID: &str = "random";

/// Sentinel pid of a VM whose runner has not been spawned yet.
pub const NO_PID: i64 = -1;

#[derive(Debug, Clone, Facet)]
pub struct DaemonInfo {
    pub name: String,
    pub version: String,
    pub pid: u32,
    /// Unix seconds.
    pub started_at: u64,
}

/// Where a VM is in its boot-supervision lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Facet)]
#[repr(u8)]
pub enum BootState {
    Reserved,
    Spawning,
    AwaitingAddress,
    Running,
    Halting,
    Reaped,
    Failed,
}

impl BootState {
    pub fn as_str(self) -> &'static str {
        match self {
            BootState::Reserved => "reserved",
            BootState::Spawning => "spawning",
            BootState::AwaitingAddress => "awaiting-address",
            BootState::Running => "running",
            BootState::Halting => "halting",
            BootState::Reaped => "reaped",
            BootState::Failed => "failed",
        }
    }
}

/// One VM instance as seen over the wire.
///
/// A client sends a draft (identity possibly `"random"`, pid `-1`, no
/// address) to `vm_run`; the daemon answers with the populated record.
#[derive(Debug, Clone, Facet)]
pub struct VmInfo {
    pub uuid: String,
    pub name: String,
    pub mac_address: String,
    pub channel: String,
    pub version: String,
    pub cpus: u32,
    pub memory_mb: u64,
    pub public_ip: String,
    pub pid: i64,
    /// Unix seconds.
    pub creation_time: u64,
    /// Attached volumes; the first entry is the root volume.
    pub storage: Vec<String>,
    pub cdrom: Option<String>,
    pub extra_kernel_args: String,
    pub extra_runner_args: Vec<String>,
    pub state: BootState,
}

impl VmInfo {
    pub fn draft(channel: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            uuid: RANDOM_UUID.into(),
            name: String::new(),
            mac_address: String::new(),
            channel: channel.into(),
            version: version.into(),
            cpus: 1,
            memory_mb: 1024,
            public_ip: String::new(),
            pid: NO_PID,
            creation_time: 0,
            storage: Vec::new(),
            cdrom: None,
            extra_kernel_args: String::new(),
            extra_runner_args: Vec::new(),
            state: BootState::Reserved,
        }
    }

    /// Spawned and reachable.
    pub fn is_operational(&self) -> bool {
        !self.public_ip.is_empty() && self.pid != NO_PID
    }
}

/// Versions of one channel, ascending in semantic-version order.
#[derive(Debug, Clone, PartialEq, Eq, Facet)]
pub struct ChannelImages {
    pub channel: String,
    pub versions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Facet)]
pub struct MacAssignment {
    pub mac: String,
    /// The identity actually used; differs from the request when the
    /// requested UUID was taken or unusable.
    pub uuid: String,
}

/// Named daemon operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Echo,
    ImagesList,
    ImagesRemove,
    VmList,
    VmRun,
    VmStop,
    VmUuid2Mac,
    ServerStop,
}

impl Operation {
    pub const ALL: [Operation; 8] = [
        Operation::Echo,
        Operation::ImagesList,
        Operation::ImagesRemove,
        Operation::VmList,
        Operation::VmRun,
        Operation::VmStop,
        Operation::VmUuid2Mac,
        Operation::ServerStop,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Operation::Echo => "echo",
            Operation::ImagesList => "images:list",
            Operation::ImagesRemove => "images:remove",
            Operation::VmList => "vm:list",
            Operation::VmRun => "vm:run",
            Operation::VmStop => "vm:stop",
            Operation::VmUuid2Mac => "vm:uuid2mac",
            Operation::ServerStop => "server:stop",
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[roam::service]
pub trait Fleet {
    async fn echo(&self) -> Result<DaemonInfo, String>;
    async fn images_list(&self) -> Result<Vec<ChannelImages>, String>;
    async fn images_remove(
        &self,
        channel: String,
        version: String,
    ) -> Result<Vec<ChannelImages>, String>;
    async fn vm_list(&self) -> Result<Vec<VmInfo>, String>;
    async fn vm_run(&self, draft: VmInfo) -> Result<VmInfo, String>;
    /// Returns the UUIDs that were asked to halt.
    async fn vm_stop(&self, targets: Vec<String>) -> Result<Vec<String>, String>;
    async fn vm_uuid2mac(&self, uuid: String, original: String) -> Result<MacAssignment, String>;
    async fn server_stop(&self) -> Result<String, String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_names_are_unique() {
        let mut names: Vec<_> = Operation::ALL.iter().map(|op| op.name()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), Operation::ALL.len());
    }

    #[test]
    fn draft_is_not_operational() {
        let draft = VmInfo::draft("alpha", "latest");
        assert_eq!(draft.uuid, RANDOM_UUID);
        assert_eq!(draft.pid, NO_PID);
        assert!(!draft.is_operational());
    }
}
