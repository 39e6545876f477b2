//! In-memory registry of live VMs.
//!
//! Everything here is synchronous and expects the caller to hold the daemon
//! lock; a `Registry` never outlives the daemon process.

use std::collections::BTreeMap;

use flotilla_proto::{MacAssignment, RANDOM_UUID, VmInfo};
use tokio_util::sync::CancellationToken;

use crate::error::FleetError;
use crate::image::MediaAssets;
use crate::launcher::NetworkResolver;
use crate::vm_state::{self, BootState};

/// Upper bound on fresh identities drawn for one request.
pub const MAX_IDENTITY_ATTEMPTS: usize = 8;

/// Everything behind the daemon's exclusive lock.
#[derive(Default)]
pub struct State {
    pub registry: Registry,
    /// Advisory copy of the image index, refreshed by every rescan.
    pub media: MediaAssets,
    /// Set once teardown starts; no reservation succeeds after.
    pub closing: bool,
}

pub struct VmEntry {
    pub info: VmInfo,
    /// Cancelled to ask the runner to terminate.
    pub halt: CancellationToken,
}

#[derive(Default)]
pub struct Registry {
    active: BTreeMap<String, VmEntry>,
}

impl Registry {
    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    pub fn contains(&self, uuid: &str) -> bool {
        self.active.contains_key(uuid)
    }

    pub fn get(&self, uuid: &str) -> Option<&VmInfo> {
        self.active.get(uuid).map(|e| &e.info)
    }

    /// Copy of every record, oldest first.
    pub fn snapshot(&self) -> Vec<VmInfo> {
        let mut all: Vec<VmInfo> = self.active.values().map(|e| e.info.clone()).collect();
        all.sort_by(|a, b| {
            a.creation_time
                .cmp(&b.creation_time)
                .then_with(|| a.uuid.cmp(&b.uuid))
        });
        all
    }

    /// Memory claimed by every registered VM.
    pub fn committed_memory_mb(&self) -> u64 {
        self.active.values().map(|e| e.info.memory_mb).sum()
    }

    /// Pick the identity a new VM will use.
    ///
    /// `requested` is kept when it is a well-formed UUID that is not active
    /// and yields a MAC; otherwise random UUIDs are drawn, at most
    /// `MAX_IDENTITY_ATTEMPTS` candidates in total.
    pub fn resolve_identity(
        &self,
        requested: &str,
        resolver: &dyn NetworkResolver,
    ) -> Result<MacAssignment, FleetError> {
        let mut candidate = normalize(requested);

        for attempt in 0..MAX_IDENTITY_ATTEMPTS {
            if candidate != RANDOM_UUID && !self.contains(&candidate) {
                match resolver.mac_from_uuid(&candidate) {
                    Ok(mac) => {
                        return Ok(MacAssignment {
                            mac,
                            uuid: candidate,
                        });
                    }
                    Err(e) => tracing::debug!(uuid = %candidate, "MAC derivation failed: {e}"),
                }
            }
            if attempt == 0 && requested != RANDOM_UUID {
                tracing::warn!(
                    requested,
                    "unable to use the requested UUID, using a randomly generated one"
                );
            }
            candidate = uuid::Uuid::new_v4().to_string();
        }

        Err(FleetError::IdentityExhausted {
            attempts: MAX_IDENTITY_ATTEMPTS,
        })
    }

    /// Insert a freshly reserved VM.
    pub fn reserve(&mut self, info: VmInfo, halt: CancellationToken) -> Result<(), FleetError> {
        if self.contains(&info.uuid) {
            return Err(FleetError::Validation {
                message: format!("UUID {} is already active", info.uuid),
            });
        }
        self.active.insert(info.uuid.clone(), VmEntry { info, halt });
        Ok(())
    }

    /// Move a VM to `next`; illegal transitions are ignored and reported.
    pub fn set_state(&mut self, uuid: &str, next: BootState) -> bool {
        let Some(entry) = self.active.get_mut(uuid) else {
            return false;
        };
        let current = entry.info.state;
        if vm_state::is_terminal(current) || !vm_state::can_transition(current, next) {
            tracing::debug!(uuid, ?current, ?next, "ignoring state change");
            return false;
        }
        entry.info.state = next;
        true
    }

    pub fn update(&mut self, uuid: &str, f: impl FnOnce(&mut VmInfo)) -> bool {
        match self.active.get_mut(uuid) {
            Some(entry) => {
                f(&mut entry.info);
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, uuid: &str) -> Option<VmEntry> {
        self.active.remove(uuid)
    }

    /// Resolve stop targets to UUIDs. Empty targets select every VM; each
    /// target matches a UUID or a name, first match wins.
    pub fn select(&self, targets: &[String]) -> Vec<String> {
        if targets.is_empty() {
            return self.active.keys().cloned().collect();
        }
        let mut picked: Vec<String> = Vec::new();
        for target in targets {
            let hit = self
                .active
                .get(target)
                .map(|e| e.info.uuid.clone())
                .or_else(|| {
                    self.snapshot()
                        .into_iter()
                        .find(|vm| &vm.name == target)
                        .map(|vm| vm.uuid)
                });
            match hit {
                Some(uuid) if !picked.contains(&uuid) => picked.push(uuid),
                Some(_) => {}
                None => tracing::warn!(target = %target, "no active VM matches"),
            }
        }
        picked
    }

    /// Request termination of the given VMs. Deregistration is left to the
    /// reaper.
    pub fn halt(&mut self, uuids: &[String]) -> Vec<String> {
        let mut halted = Vec::new();
        for uuid in uuids {
            if let Some(entry) = self.active.get_mut(uuid) {
                if vm_state::can_transition(entry.info.state, BootState::Halting) {
                    entry.info.state = BootState::Halting;
                }
                entry.halt.cancel();
                halted.push(uuid.clone());
            }
        }
        halted
    }
}

/// Canonical hyphenated lowercase form for anything that parses as a UUID.
fn normalize(requested: &str) -> String {
    match uuid::Uuid::parse_str(requested) {
        Ok(u) => u.hyphenated().to_string(),
        Err(_) => requested.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launcher::LocalMacResolver;

    const FIXED: &str = "6f1c2a44-0b7e-4c55-9d1a-3c2b1a0f9e88";

    fn record(uuid: &str, name: &str, created: u64) -> VmInfo {
        let mut vm = VmInfo::draft("alpha", "1.2.3");
        vm.uuid = uuid.into();
        vm.name = name.into();
        vm.creation_time = created;
        vm
    }

    struct FlakyResolver;

    impl NetworkResolver for FlakyResolver {
        fn mac_from_uuid(&self, _uuid: &str) -> Result<String, FleetError> {
            Err(FleetError::Validation {
                message: "no vmnet".into(),
            })
        }
    }

    #[test]
    fn free_uuid_is_kept() {
        let reg = Registry::default();
        let got = reg.resolve_identity(FIXED, &LocalMacResolver).unwrap();
        assert_eq!(got.uuid, FIXED);
        assert_eq!(got.mac, "6e:1c:2a:44:0b:7e");
    }

    #[test]
    fn uppercase_uuid_is_normalized() {
        let reg = Registry::default();
        let got = reg
            .resolve_identity(&FIXED.to_uppercase(), &LocalMacResolver)
            .unwrap();
        assert_eq!(got.uuid, FIXED);
    }

    #[test]
    fn random_placeholder_draws_fresh_identity() {
        let mut reg = Registry::default();
        for i in 0..5 {
            let got = reg.resolve_identity(RANDOM_UUID, &LocalMacResolver).unwrap();
            assert_ne!(got.uuid, RANDOM_UUID);
            assert!(!reg.contains(&got.uuid));
            uuid::Uuid::parse_str(&got.uuid).unwrap();
            reg.reserve(record(&got.uuid, "", i), CancellationToken::new())
                .unwrap();
        }
        assert_eq!(reg.len(), 5);
    }

    #[test]
    fn active_uuid_is_never_reused() {
        let mut reg = Registry::default();
        reg.reserve(record(FIXED, "web", 1), CancellationToken::new())
            .unwrap();
        let got = reg.resolve_identity(FIXED, &LocalMacResolver).unwrap();
        assert_ne!(got.uuid, FIXED);
    }

    #[test]
    fn invalid_uuid_is_replaced() {
        let reg = Registry::default();
        let got = reg.resolve_identity("my-box", &LocalMacResolver).unwrap();
        assert_ne!(got.uuid, "my-box");
    }

    #[test]
    fn retry_is_bounded() {
        let reg = Registry::default();
        let err = reg.resolve_identity(FIXED, &FlakyResolver).unwrap_err();
        assert!(matches!(
            err,
            FleetError::IdentityExhausted {
                attempts: MAX_IDENTITY_ATTEMPTS
            }
        ));
    }

    #[test]
    fn duplicate_reservation_rejected() {
        let mut reg = Registry::default();
        reg.reserve(record(FIXED, "a", 1), CancellationToken::new())
            .unwrap();
        assert!(
            reg.reserve(record(FIXED, "b", 2), CancellationToken::new())
                .is_err()
        );
        assert_eq!(reg.get(FIXED).unwrap().name, "a");
    }

    #[test]
    fn select_matches_uuid_or_name() {
        let mut reg = Registry::default();
        reg.reserve(record("u1", "web", 1), CancellationToken::new())
            .unwrap();
        reg.reserve(record("u2", "db", 2), CancellationToken::new())
            .unwrap();
        reg.reserve(record("u3", "cache", 3), CancellationToken::new())
            .unwrap();

        assert_eq!(reg.select(&["db".into(), "u1".into()]), ["u2", "u1"]);
        assert_eq!(reg.select(&["web".into(), "u1".into()]), ["u1"]);
        assert!(reg.select(&["nope".into()]).is_empty());
        assert_eq!(reg.select(&[]).len(), 3);
    }

    #[test]
    fn halt_cancels_but_keeps_entry() {
        let mut reg = Registry::default();
        let token = CancellationToken::new();
        let mut vm = record("u1", "web", 1);
        vm.state = BootState::Running;
        reg.reserve(vm, token.clone()).unwrap();

        let halted = reg.halt(&["u1".into(), "ghost".into()]);
        assert_eq!(halted, ["u1"]);
        assert!(token.is_cancelled());
        assert!(reg.contains("u1"));
        assert_eq!(reg.get("u1").unwrap().state, BootState::Halting);
    }

    #[test]
    fn set_state_refuses_illegal_moves() {
        let mut reg = Registry::default();
        reg.reserve(record("u1", "", 1), CancellationToken::new())
            .unwrap();
        assert!(!reg.set_state("u1", BootState::Running));
        assert!(reg.set_state("u1", BootState::Spawning));
        assert!(!reg.set_state("ghost", BootState::Spawning));
    }

    #[test]
    fn snapshot_is_oldest_first_and_memory_sums() {
        let mut reg = Registry::default();
        let mut late = record("b", "", 20);
        late.memory_mb = 2048;
        reg.reserve(late, CancellationToken::new()).unwrap();
        reg.reserve(record("a", "", 10), CancellationToken::new())
            .unwrap();
        let uuids: Vec<_> = reg.snapshot().into_iter().map(|v| v.uuid).collect();
        assert_eq!(uuids, ["a", "b"]);
        assert_eq!(reg.committed_memory_mb(), 3072);
    }
}
