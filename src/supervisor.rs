//! Boot supervision.
//!
//! A `run` request walks a VM through
//! `Reserved → Spawning → AwaitingAddress → Running`, with `Failed` on
//! timeout or early exit. Two tracked tasks follow each spawned runner: the
//! address race, which settles the VM's [`BootSignal`], and the reaper, which
//! is the only place a spawned VM leaves the registry.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use flotilla_proto::{NO_PID, VmInfo};
use tokio::sync::{Mutex, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::DaemonConfig;
use crate::error::{FleetError, wire};
use crate::launcher::{Collaborators, RunDir, Spawned};
use crate::registry::State;
use crate::vm_state::BootState;

// ── Boot signal ─────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum BootStatus {
    Pending,
    Ready(Box<VmInfo>),
    TimedOut,
    TerminatedEarly,
}

/// Single-assignment boot result shared by the `run` caller, the address
/// race and the reaper. The first settlement wins; later ones are no-ops.
#[derive(Clone)]
pub struct BootSignal {
    tx: Arc<watch::Sender<BootStatus>>,
}

impl Default for BootSignal {
    fn default() -> Self {
        let (tx, _) = watch::channel(BootStatus::Pending);
        Self { tx: Arc::new(tx) }
    }
}

impl BootSignal {
    /// Settle the signal; returns false if it was already settled.
    pub fn settle(&self, status: BootStatus) -> bool {
        self.tx.send_if_modified(|current| {
            if matches!(current, BootStatus::Pending) {
                *current = status;
                true
            } else {
                false
            }
        })
    }

    pub fn is_settled(&self) -> bool {
        !matches!(*self.tx.borrow(), BootStatus::Pending)
    }

    /// Wait until settled and return the outcome.
    pub async fn outcome(&self) -> BootStatus {
        let mut rx = self.tx.subscribe();
        match rx.wait_for(|s| !matches!(s, BootStatus::Pending)).await {
            Ok(status) => status.clone(),
            Err(_) => BootStatus::TerminatedEarly,
        }
    }
}

// ── Settings ────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Settings {
    pub run_root: PathBuf,
    pub boot_timeout: Duration,
    pub reap_grace: Duration,
    pub min_memory_mb: u64,
    pub max_memory_mb: u64,
    /// Ceiling on the memory of all registered VMs together.
    pub memory_ceiling_mb: u64,
}

impl Settings {
    pub fn from_config(config: &DaemonConfig) -> Self {
        Self {
            run_root: config.run_root(),
            boot_timeout: config.boot_timeout(),
            reap_grace: config.reap_grace(),
            min_memory_mb: config.resources.min_memory_mb,
            max_memory_mb: config.resources.max_memory_mb,
            memory_ceiling_mb: memory_ceiling_mb(config),
        }
    }
}

/// Aggregate memory ceiling: the configured value, else a share of host RAM.
pub fn memory_ceiling_mb(config: &DaemonConfig) -> u64 {
    if let Some(fixed) = config.resources.max_total_memory_mb {
        return fixed;
    }
    let mut sys = sysinfo::System::new();
    sys.refresh_memory();
    sys.total_memory() / 1024 / 1024 * config.resources.host_memory_share_pct / 100
}

/// Clamp requested memory into `[min, max]`, warning when it moves.
pub fn clamp_memory(requested: u64, min: u64, max: u64) -> u64 {
    if requested < min {
        tracing::warn!(requested, "'{requested}' not a reasonable memory value, using {min}");
        min
    } else if requested > max {
        tracing::warn!(
            requested,
            "VMs are limited to {max}MB of RAM, clamping '{requested}' to {max}"
        );
        max
    } else {
        requested
    }
}

pub(crate) fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

// ── Supervisor ──────────────────────────────────────────────────────

#[derive(Clone)]
pub struct Supervisor {
    state: Arc<Mutex<State>>,
    collaborators: Collaborators,
    jobs: TaskTracker,
    settings: Settings,
}

enum Race {
    Address(String),
    Closed,
    Deadline,
    Settled,
}

impl Supervisor {
    pub fn new(state: Arc<Mutex<State>>, collaborators: Collaborators, settings: Settings) -> Self {
        Self {
            state,
            collaborators,
            jobs: TaskTracker::new(),
            settings,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Background jobs still running (address races and reapers).
    pub fn pending_jobs(&self) -> usize {
        self.jobs.len()
    }

    /// Boot a VM and return once it has an address or has failed.
    pub async fn run(&self, draft: VmInfo) -> Result<VmInfo, FleetError> {
        // keeps `drain` waiting until this request has spawned or rolled back
        let _job = self.jobs.token();
        let (vm, halt) = self.reserve(draft).await?;
        let name = vm.name.clone();

        let run_dir = RunDir::for_vm(&self.settings.run_root, &vm.uuid);
        let plan = match run_dir
            .prepare()
            .and_then(|()| self.collaborators.planner.plan(&vm, &run_dir))
        {
            Ok(plan) => plan,
            Err(e) => {
                self.rollback(&vm.uuid).await;
                return Err(e);
            }
        };

        self.state
            .lock()
            .await
            .registry
            .set_state(&vm.uuid, BootState::Spawning);

        let spawned = match self.collaborators.launcher.spawn(&plan, halt.clone()) {
            Ok(spawned) => spawned,
            Err(e) => {
                self.rollback(&vm.uuid).await;
                return Err(FleetError::SpawnFailed {
                    name,
                    message: wire(e),
                });
            }
        };

        let signal = BootSignal::default();
        self.supervise(vm.uuid.clone(), spawned, halt, run_dir, signal.clone())
            .await;

        match signal.outcome().await {
            BootStatus::Ready(info) => Ok(*info),
            BootStatus::TimedOut => Err(FleetError::BootTimeout {
                name,
                secs: self.settings.boot_timeout.as_secs(),
            }),
            BootStatus::Pending | BootStatus::TerminatedEarly => {
                Err(FleetError::TerminatedEarly { name })
            }
        }
    }

    /// Clamp resources, pick an identity and insert the record, all under
    /// one lock so concurrent requests cannot claim the same UUID.
    async fn reserve(&self, draft: VmInfo) -> Result<(VmInfo, CancellationToken), FleetError> {
        let mut vm = draft;
        vm.memory_mb = clamp_memory(
            vm.memory_mb,
            self.settings.min_memory_mb,
            self.settings.max_memory_mb,
        );
        if vm.cpus == 0 {
            tracing::warn!("0 vCPUs requested, using 1");
            vm.cpus = 1;
        }

        let halt = CancellationToken::new();
        let mut state = self.state.lock().await;
        if state.closing {
            return Err(FleetError::Validation {
                message: "daemon is shutting down".into(),
            });
        }

        let total = state.registry.committed_memory_mb() + vm.memory_mb;
        if total > self.settings.memory_ceiling_mb {
            return Err(FleetError::ResourceBound {
                requested_mb: total,
                ceiling_mb: self.settings.memory_ceiling_mb,
            });
        }

        let identity = state
            .registry
            .resolve_identity(&vm.uuid, self.collaborators.resolver.as_ref())?;
        vm.uuid = identity.uuid;
        vm.mac_address = identity.mac;
        if vm.name.is_empty() {
            vm.name = vm.uuid.clone();
        }
        vm.pid = NO_PID;
        vm.public_ip.clear();
        vm.state = BootState::Reserved;
        vm.creation_time = now_unix();

        state.registry.reserve(vm.clone(), halt.clone())?;
        tracing::info!(uuid = %vm.uuid, name = %vm.name, memory_mb = vm.memory_mb, "reserved VM");
        Ok((vm, halt))
    }

    /// Undo a reservation whose runner was never started.
    async fn rollback(&self, uuid: &str) {
        self.state.lock().await.registry.remove(uuid);
        tracing::debug!(uuid, "reservation rolled back");
    }

    async fn supervise(
        &self,
        uuid: String,
        spawned: Spawned,
        halt: CancellationToken,
        run_dir: RunDir,
        signal: BootSignal,
    ) {
        let Spawned {
            pid,
            address,
            exited,
        } = spawned;

        {
            let mut state = self.state.lock().await;
            state.registry.update(&uuid, |vm| vm.pid = i64::from(pid));
            state
                .registry
                .set_state(&uuid, BootState::AwaitingAddress);
        }

        let deadline = Instant::now() + self.settings.boot_timeout;

        let race = self.clone();
        let race_uuid = uuid.clone();
        let race_signal = signal.clone();
        let race_halt = halt.clone();
        self.jobs.spawn(async move {
            race.await_address(race_uuid, pid, address, deadline, race_halt, race_signal)
                .await;
        });

        let reaper = self.clone();
        self.jobs.spawn(async move {
            let code = exited.await.ok().flatten();
            reaper.reap(&uuid, code, &run_dir, &signal).await;
        });
    }

    async fn await_address(
        &self,
        uuid: String,
        pid: u32,
        address: tokio::sync::oneshot::Receiver<String>,
        deadline: Instant,
        halt: CancellationToken,
        signal: BootSignal,
    ) {
        let first = tokio::select! {
            res = address => match res {
                Ok(ip) => Race::Address(ip),
                Err(_) => Race::Closed,
            },
            _ = tokio::time::sleep_until(deadline) => Race::Deadline,
            _ = signal.outcome() => Race::Settled,
        };
        // the runner stopped talking; only the deadline or its exit can settle now
        let outcome = match first {
            Race::Closed => tokio::select! {
                _ = tokio::time::sleep_until(deadline) => Race::Deadline,
                _ = signal.outcome() => Race::Settled,
            },
            other => other,
        };

        match outcome {
            Race::Address(ip) => {
                let mut state = self.state.lock().await;
                let registry = &mut state.registry;
                let recorded = registry.update(&uuid, |vm| {
                    vm.public_ip = ip.clone();
                    vm.pid = i64::from(pid);
                });
                registry.set_state(&uuid, BootState::Running);
                let ready = registry.get(&uuid).filter(|_| recorded).cloned();
                drop(state);
                match ready {
                    Some(info) => {
                        tracing::info!(
                            uuid,
                            name = %info.name,
                            ip = %info.public_ip,
                            pid,
                            "started VM in background"
                        );
                        signal.settle(BootStatus::Ready(Box::new(info)));
                    }
                    None => {
                        signal.settle(BootStatus::TerminatedEarly);
                    }
                }
            }
            Race::Deadline => {
                if signal.settle(BootStatus::TimedOut) {
                    tracing::warn!(
                        uuid,
                        pid,
                        secs = self.settings.boot_timeout.as_secs(),
                        "no address reported before the deadline, halting"
                    );
                    self.state
                        .lock()
                        .await
                        .registry
                        .set_state(&uuid, BootState::Failed);
                    halt.cancel();
                }
            }
            Race::Closed | Race::Settled => {}
        }
    }

    async fn reap(&self, uuid: &str, code: Option<i32>, run_dir: &RunDir, signal: &BootSignal) {
        let removed = self.state.lock().await.registry.remove(uuid);
        if signal.settle(BootStatus::TerminatedEarly) {
            tracing::warn!(uuid, ?code, "runner exited before reporting an address");
        }

        match std::fs::remove_file(&run_dir.tty) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(uuid, "removing {}: {e}", run_dir.tty.display()),
        }

        match removed {
            Some(mut entry) => {
                entry.info.state = BootState::Reaped;
                tracing::info!(
                    uuid,
                    name = %entry.info.name,
                    state = entry.info.state.as_str(),
                    ?code,
                    "VM exited"
                );
            }
            None => tracing::debug!(uuid, "reaped VM was already deregistered"),
        }

        // trailing runner output
        tokio::time::sleep(self.settings.reap_grace).await;
    }

    /// Ask matching VMs to halt; returns the UUIDs signalled.
    pub async fn stop(&self, targets: &[String]) -> Vec<String> {
        let mut state = self.state.lock().await;
        let uuids = state.registry.select(targets);
        let halted = state.registry.halt(&uuids);
        tracing::info!(count = halted.len(), "halt requested");
        halted
    }

    /// Refuse further reservations and halt every registered VM, in one
    /// critical section. Returns the UUIDs signalled.
    pub async fn shutdown(&self) -> Vec<String> {
        let mut state = self.state.lock().await;
        state.closing = true;
        let uuids = state.registry.select(&[]);
        let halted = state.registry.halt(&uuids);
        tracing::info!(count = halted.len(), "closed to new VMs, halting the fleet");
        halted
    }

    /// Wait for every in-flight run, race and reaper to finish.
    pub async fn drain(&self) {
        self.jobs.close();
        self.jobs.wait().await;
    }
}
