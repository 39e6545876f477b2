#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, SystemTime};

use flotilla::config::DaemonConfig;
use flotilla::error::FleetError;
use flotilla::image::ImageStore;
use flotilla::launcher::{
    BootPlan, Collaborators, Launcher, LocalMacResolver, NoopHostSetup, Spawned, StoreBootPlanner,
};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// How a fake runner behaves once spawned.
#[derive(Clone, Copy, Debug)]
pub enum Runner {
    /// Reports `10.0.0.<pid>` and runs until halted.
    Boots,
    /// Never reports an address; runs until halted.
    Hangs,
    /// Exits immediately without an address.
    Crashes,
}

pub struct FakeLauncher {
    runner: Runner,
    next_pid: AtomicU32,
    pub plans: std::sync::Mutex<Vec<BootPlan>>,
}

impl FakeLauncher {
    pub fn new(runner: Runner) -> Self {
        Self {
            runner,
            next_pid: AtomicU32::new(1000),
            plans: std::sync::Mutex::new(Vec::new()),
        }
    }
}

impl Launcher for FakeLauncher {
    fn spawn(&self, plan: &BootPlan, halt: CancellationToken) -> Result<Spawned, FleetError> {
        self.plans.lock().unwrap().push(plan.clone());
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        let (address_tx, address) = oneshot::channel();
        let (exit_tx, exited) = oneshot::channel();
        let runner = self.runner;
        tokio::spawn(async move {
            match runner {
                Runner::Boots => {
                    let _ = address_tx.send(format!("10.0.0.{}", pid % 250));
                    halt.cancelled().await;
                }
                Runner::Hangs => {
                    let _held = address_tx;
                    halt.cancelled().await;
                }
                Runner::Crashes => drop(address_tx),
            }
            let _ = exit_tx.send(Some(0));
        });
        Ok(Spawned {
            pid,
            address,
            exited,
        })
    }
}

/// Config rooted in `root`, listening on an ephemeral port.
pub fn config(root: &Path) -> DaemonConfig {
    let mut config = DaemonConfig::default();
    config.listen = "127.0.0.1:0".into();
    config.store_root = Some(root.join("images").display().to_string());
    config.run_root = Some(root.join("run").display().to_string());
    config.channels = Some(vec!["alpha".into(), "beta".into()]);
    config.resources.max_total_memory_mb = Some(32 * 1024);
    config.timeouts.reap_grace_s = 0;
    config
}

pub fn store(config: &DaemonConfig) -> ImageStore {
    ImageStore::from_config(config)
}

pub fn collaborators(store: &ImageStore, launcher: Arc<dyn Launcher>) -> Collaborators {
    Collaborators {
        launcher,
        planner: Arc::new(StoreBootPlanner::new(store.clone(), "flotilla-runner")),
        resolver: Arc::new(LocalMacResolver),
        host: Arc::new(NoopHostSetup),
    }
}

/// Lay down a complete image directory.
pub fn build_image(store: &ImageStore, channel: &str, version: &str) -> PathBuf {
    let dir = store.version_dir(channel, version);
    std::fs::create_dir_all(&dir).unwrap();
    for artifact in store.artifacts() {
        std::fs::write(dir.join(artifact), b"x").unwrap();
    }
    dir
}

/// Push a directory's mtime before the format cutoff.
pub fn backdate(dir: &Path) {
    let old = SystemTime::UNIX_EPOCH + Duration::from_secs(1_400_000_000);
    std::fs::File::open(dir).unwrap().set_modified(old).unwrap();
}
