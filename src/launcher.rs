//! Boundaries to the outside world the supervisor depends on.
//!
//! The daemon never talks to the hypervisor, the image pipeline or the host
//! network stack directly; it goes through these traits so tests can swap in
//! fakes.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use flotilla_proto::VmInfo;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::error::FleetError;
use crate::image::ImageStore;
use crate::paths;

/// Line prefix the runner prints once the guest has an address.
pub const ADDRESS_MARKER: &str = "public-ip:";

/// How long a halted runner gets between SIGTERM and SIGKILL.
const HALT_ESCALATION: Duration = Duration::from_secs(10);

// ── Run directory ───────────────────────────────────────────────────

/// Files a running VM owns under the run root.
#[derive(Debug, Clone)]
pub struct RunDir {
    pub dir: PathBuf,
    pub tty: PathBuf,
    pub log: PathBuf,
}

impl RunDir {
    pub fn for_vm(run_root: &Path, uuid: &str) -> Self {
        Self {
            dir: paths::vm_dir(run_root, uuid),
            tty: paths::tty_path(run_root, uuid),
            log: paths::log_path(run_root, uuid),
        }
    }

    /// Create the directory and clear a console link left by a previous VM
    /// with the same identity.
    pub fn prepare(&self) -> Result<(), FleetError> {
        std::fs::create_dir_all(&self.dir)
            .map_err(|e| FleetError::io(format!("creating {}", self.dir.display()), e))?;
        match std::fs::remove_file(&self.tty) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(FleetError::io(format!("removing {}", self.tty.display()), e)),
        }
    }
}

// ── Boot planning ───────────────────────────────────────────────────

/// A fully resolved runner invocation.
#[derive(Debug, Clone)]
pub struct BootPlan {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub log: PathBuf,
}

pub trait BootPlanner: Send + Sync {
    /// Validate the VM's image and volumes and assemble the runner command line.
    fn plan(&self, vm: &VmInfo, run: &RunDir) -> Result<BootPlan, FleetError>;
}

/// Plans boots against the local image store.
pub struct StoreBootPlanner {
    store: ImageStore,
    runner: PathBuf,
}

impl StoreBootPlanner {
    pub fn new(store: ImageStore, runner: impl Into<PathBuf>) -> Self {
        Self {
            store,
            runner: runner.into(),
        }
    }
}

impl BootPlanner for StoreBootPlanner {
    fn plan(&self, vm: &VmInfo, run: &RunDir) -> Result<BootPlan, FleetError> {
        let image = self.store.version_dir(&vm.channel, &vm.version);
        if !self.store.is_complete(&image) {
            return Err(FleetError::ImageNotFound {
                channel: vm.channel.clone(),
                version: vm.version.clone(),
            });
        }

        for volume in &vm.storage {
            if !Path::new(volume).exists() {
                return Err(FleetError::Validation {
                    message: format!("volume '{volume}' does not exist"),
                });
            }
        }
        if let Some(cdrom) = &vm.cdrom
            && !Path::new(cdrom).is_file()
        {
            return Err(FleetError::Validation {
                message: format!("cdrom image '{cdrom}' does not exist"),
            });
        }

        let artifacts = self.store.artifacts();
        let kernel = artifacts
            .first()
            .map(|a| image.join(a))
            .ok_or_else(|| FleetError::Validation {
                message: "image store has no boot artifacts configured".into(),
            })?;
        let initrd = artifacts.get(1).map(|a| image.join(a));

        let mut cmdline = format!("console=ttyS0 uuid={}", vm.uuid);
        if !vm.extra_kernel_args.is_empty() {
            cmdline.push(' ');
            cmdline.push_str(&vm.extra_kernel_args);
        }

        let mut args = vec![
            "--uuid".into(),
            vm.uuid.clone(),
            "--mac".into(),
            vm.mac_address.clone(),
            "--memory".into(),
            vm.memory_mb.to_string(),
            "--cpus".into(),
            vm.cpus.to_string(),
            "--kernel".into(),
            kernel.display().to_string(),
        ];
        if let Some(initrd) = initrd {
            args.push("--initrd".into());
            args.push(initrd.display().to_string());
        }
        args.extend([
            "--cmdline".into(),
            cmdline,
            "--tty".into(),
            run.tty.display().to_string(),
        ]);
        for volume in &vm.storage {
            args.push("--disk".into());
            args.push(volume.clone());
        }
        if let Some(cdrom) = &vm.cdrom {
            args.push("--cdrom".into());
            args.push(cdrom.clone());
        }
        args.extend(vm.extra_runner_args.iter().cloned());

        Ok(BootPlan {
            program: self.runner.clone(),
            args,
            log: run.log.clone(),
        })
    }
}

// ── MAC derivation ──────────────────────────────────────────────────

pub trait NetworkResolver: Send + Sync {
    fn mac_from_uuid(&self, uuid: &str) -> Result<String, FleetError>;
}

/// Derives a locally administered unicast MAC from the leading UUID bytes.
pub struct LocalMacResolver;

impl NetworkResolver for LocalMacResolver {
    fn mac_from_uuid(&self, uuid: &str) -> Result<String, FleetError> {
        let parsed = uuid::Uuid::parse_str(uuid).map_err(|e| FleetError::Validation {
            message: format!("'{uuid}' is not a valid UUID: {e}"),
        })?;
        if parsed.is_nil() {
            return Err(FleetError::Validation {
                message: "the nil UUID cannot identify a VM".into(),
            });
        }
        let b = parsed.as_bytes();
        let first = (b[0] | 0x02) & 0xfe;
        Ok(format!(
            "{first:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[1], b[2], b[3], b[4], b[5]
        ))
    }
}

// ── Host setup ──────────────────────────────────────────────────────

pub trait HostSetup: Send + Sync {
    /// Prepare host networking and exports before any VM boots.
    fn prepare(&self) -> Result<(), FleetError>;
}

pub struct NoopHostSetup;

impl HostSetup for NoopHostSetup {
    fn prepare(&self) -> Result<(), FleetError> {
        tracing::debug!("no host network/export setup configured");
        Ok(())
    }
}

// ── Process launching ───────────────────────────────────────────────

/// A runner that has been started.
pub struct Spawned {
    pub pid: u32,
    /// Fires once with the guest address. Dropped without a value if the
    /// runner never reports one.
    pub address: oneshot::Receiver<String>,
    /// Fires once the process has exited, with its exit code if any.
    pub exited: oneshot::Receiver<Option<i32>>,
}

pub trait Launcher: Send + Sync {
    /// Start the runner. Cancelling `halt` asks it to terminate.
    fn spawn(&self, plan: &BootPlan, halt: CancellationToken) -> Result<Spawned, FleetError>;
}

/// Runs the plan as a child process of the daemon.
pub struct ProcessLauncher;

impl Launcher for ProcessLauncher {
    fn spawn(&self, plan: &BootPlan, halt: CancellationToken) -> Result<Spawned, FleetError> {
        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&plan.log)
            .map_err(|e| FleetError::io(format!("opening {}", plan.log.display()), e))?;
        let stderr = log
            .try_clone()
            .map_err(|e| FleetError::io(format!("duplicating {}", plan.log.display()), e))?;

        let mut child = tokio::process::Command::new(&plan.program)
            .args(&plan.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::from(stderr))
            .spawn()
            .map_err(|e| FleetError::io(format!("spawning {}", plan.program.display()), e))?;

        let pid = child.id().ok_or_else(|| FleetError::Validation {
            message: "runner exited before its pid could be read".into(),
        })?;

        let (address_tx, address_rx) = oneshot::channel();
        let (exit_tx, exit_rx) = oneshot::channel();

        if let Some(stdout) = child.stdout.take() {
            let log = tokio::fs::File::from_std(log);
            tokio::spawn(pump_output(stdout, log, address_tx));
        }

        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = halt.cancelled() => {
                    tracing::debug!(pid, "sending SIGTERM to runner");
                    send_signal(pid, libc::SIGTERM);
                    match tokio::time::timeout(HALT_ESCALATION, child.wait()).await {
                        Ok(status) => status,
                        Err(_) => {
                            tracing::warn!(pid, "runner ignored SIGTERM, killing");
                            let _ = child.start_kill();
                            child.wait().await
                        }
                    }
                }
            };
            let code = match status {
                Ok(s) => s.code(),
                Err(e) => {
                    tracing::error!(pid, "waiting on runner failed: {e}");
                    None
                }
            };
            let _ = exit_tx.send(code);
        });

        Ok(Spawned {
            pid,
            address: address_rx,
            exited: exit_rx,
        })
    }
}

/// Copy runner output into its log, watching for the address report.
async fn pump_output(
    stdout: tokio::process::ChildStdout,
    mut log: tokio::fs::File,
    address_tx: oneshot::Sender<String>,
) {
    let mut address_tx = Some(address_tx);
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if let Some(addr) = parse_address(&line)
                    && let Some(tx) = address_tx.take()
                {
                    let _ = tx.send(addr);
                }
                let _ = log.write_all(line.as_bytes()).await;
                let _ = log.write_all(b"\n").await;
            }
            Ok(None) => break,
            Err(e) => {
                tracing::debug!("runner output closed: {e}");
                break;
            }
        }
    }
    let _ = log.flush().await;
}

/// Extract the address from a `public-ip: <addr>` line.
pub fn parse_address(line: &str) -> Option<String> {
    let rest = line.trim().strip_prefix(ADDRESS_MARKER)?.trim();
    rest.parse::<IpAddr>().ok().map(|ip| ip.to_string())
}

/// Send `sig` to `pid`; returns whether delivery succeeded.
pub fn send_signal(pid: u32, sig: libc::c_int) -> bool {
    unsafe { libc::kill(pid as i32, sig) == 0 }
}

/// Whether the daemon runs with an effective uid of root.
pub fn is_privileged() -> bool {
    unsafe { libc::geteuid() == 0 }
}

/// Production collaborators wired from config.
#[derive(Clone)]
pub struct Collaborators {
    pub launcher: Arc<dyn Launcher>,
    pub planner: Arc<dyn BootPlanner>,
    pub resolver: Arc<dyn NetworkResolver>,
    pub host: Arc<dyn HostSetup>,
}

impl Collaborators {
    pub fn system(store: ImageStore, runner: impl Into<PathBuf>) -> Self {
        Self {
            launcher: Arc::new(ProcessLauncher),
            planner: Arc::new(StoreBootPlanner::new(store, runner)),
            resolver: Arc::new(LocalMacResolver),
            host: Arc::new(NoopHostSetup),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::tests::{build_image, store_at};

    fn draft_for(channel: &str, version: &str) -> VmInfo {
        let mut vm = VmInfo::draft(channel, version);
        vm.uuid = "6f1c2a44-0b7e-4c55-9d1a-3c2b1a0f9e88".into();
        vm.mac_address = "6e:1c:2a:44:0b:7e".into();
        vm
    }

    #[test]
    fn mac_is_stable_and_locally_administered() {
        let uuid = "6f1c2a44-0b7e-4c55-9d1a-3c2b1a0f9e88";
        let mac = LocalMacResolver.mac_from_uuid(uuid).unwrap();
        assert_eq!(mac, LocalMacResolver.mac_from_uuid(uuid).unwrap());
        assert_eq!(mac, "6e:1c:2a:44:0b:7e");
        let first = u8::from_str_radix(&mac[..2], 16).unwrap();
        assert_eq!(first & 0x02, 0x02);
        assert_eq!(first & 0x01, 0);
    }

    #[test]
    fn mac_rejects_garbage() {
        assert!(LocalMacResolver.mac_from_uuid("not-a-uuid").is_err());
        assert!(
            LocalMacResolver
                .mac_from_uuid("00000000-0000-0000-0000-000000000000")
                .is_err()
        );
    }

    #[test]
    fn parse_address_lines() {
        assert_eq!(
            parse_address("public-ip: 192.168.64.7"),
            Some("192.168.64.7".into())
        );
        assert_eq!(parse_address("  public-ip:fd00::2 "), Some("fd00::2".into()));
        assert_eq!(parse_address("public-ip: soon"), None);
        assert_eq!(parse_address("booting kernel"), None);
    }

    #[test]
    fn plan_includes_image_and_volumes() {
        let tmp = tempfile::tempdir().unwrap();
        let store_root = tmp.path().join("images");
        build_image(&store_root, "alpha", "1.2.3");
        let disk = tmp.path().join("root.img");
        std::fs::write(&disk, b"").unwrap();

        let planner = StoreBootPlanner::new(store_at(&store_root), "/usr/libexec/runner");
        let mut vm = draft_for("alpha", "1.2.3");
        vm.storage = vec![disk.display().to_string()];
        vm.extra_kernel_args = "quiet".into();
        let run = RunDir::for_vm(&tmp.path().join("run"), &vm.uuid);

        let plan = planner.plan(&vm, &run).unwrap();
        assert_eq!(plan.program, PathBuf::from("/usr/libexec/runner"));
        assert_eq!(plan.log, run.log);
        let joined = plan.args.join(" ");
        assert!(joined.contains("--mac 6e:1c:2a:44:0b:7e"));
        assert!(joined.contains("alpha/1.2.3/vmlinuz"));
        assert!(joined.contains("--disk"));
        assert!(joined.contains("quiet"));
    }

    #[test]
    fn plan_rejects_missing_image() {
        let tmp = tempfile::tempdir().unwrap();
        let planner = StoreBootPlanner::new(store_at(tmp.path()), "runner");
        let vm = draft_for("alpha", "4.0.0");
        let run = RunDir::for_vm(tmp.path(), &vm.uuid);
        let err = planner.plan(&vm, &run).unwrap_err();
        assert!(matches!(err, FleetError::ImageNotFound { .. }));
    }

    #[test]
    fn plan_rejects_missing_volume() {
        let tmp = tempfile::tempdir().unwrap();
        build_image(tmp.path(), "alpha", "1.2.3");
        let planner = StoreBootPlanner::new(store_at(tmp.path()), "runner");
        let mut vm = draft_for("alpha", "1.2.3");
        vm.storage = vec!["/definitely/not/here.img".into()];
        let run = RunDir::for_vm(tmp.path(), &vm.uuid);
        assert!(matches!(
            planner.plan(&vm, &run).unwrap_err(),
            FleetError::Validation { .. }
        ));
    }

    #[test]
    fn plan_without_artifacts_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        build_image(tmp.path(), "alpha", "1.2.3");
        let store = ImageStore::new(
            tmp.path(),
            vec!["alpha".into()],
            Vec::new(),
            std::time::SystemTime::UNIX_EPOCH,
        );
        let planner = StoreBootPlanner::new(store, "runner");
        let vm = draft_for("alpha", "1.2.3");
        let run = RunDir::for_vm(tmp.path(), &vm.uuid);
        assert!(matches!(
            planner.plan(&vm, &run).unwrap_err(),
            FleetError::Validation { .. }
        ));
    }

    #[test]
    fn run_dir_prepare_clears_old_tty() {
        let tmp = tempfile::tempdir().unwrap();
        let run = RunDir::for_vm(tmp.path(), "abc");
        run.prepare().unwrap();
        std::fs::write(&run.tty, b"").unwrap();
        run.prepare().unwrap();
        assert!(run.dir.is_dir());
        assert!(!run.tty.exists());
    }

    #[tokio::test]
    async fn process_launcher_reports_address_and_exit() {
        let tmp = tempfile::tempdir().unwrap();
        let plan = BootPlan {
            program: PathBuf::from("/bin/sh"),
            args: vec![
                "-c".into(),
                "echo booting; echo 'public-ip: 10.0.0.9'; exit 3".into(),
            ],
            log: tmp.path().join("log"),
        };
        let spawned = ProcessLauncher.spawn(&plan, CancellationToken::new()).unwrap();
        assert!(spawned.pid > 0);
        assert_eq!(spawned.address.await.unwrap(), "10.0.0.9");
        assert_eq!(spawned.exited.await.unwrap(), Some(3));
    }

    #[tokio::test]
    async fn process_launcher_halts_on_cancel() {
        let tmp = tempfile::tempdir().unwrap();
        let plan = BootPlan {
            program: PathBuf::from("/bin/sh"),
            args: vec!["-c".into(), "exec sleep 30".into()],
            log: tmp.path().join("log"),
        };
        let halt = CancellationToken::new();
        let spawned = ProcessLauncher.spawn(&plan, halt.clone()).unwrap();
        halt.cancel();
        let code = tokio::time::timeout(Duration::from_secs(5), spawned.exited)
            .await
            .unwrap()
            .unwrap();
        // terminated by signal: no exit code
        assert_eq!(code, None);
    }
}
