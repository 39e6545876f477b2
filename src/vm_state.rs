//! Shared vocabulary for VM boot-supervision state.
//!
//! `BootState` itself lives in `flotilla-proto` because it travels inside
//! `VmInfo`; this module owns the legal transitions between states.

pub use flotilla_proto::BootState;

/// Whether the supervisor may move a VM from `from` to `to`.
pub fn can_transition(from: BootState, to: BootState) -> bool {
    use BootState::*;

    if from == to {
        return false;
    }
    match (from, to) {
        (Reserved, Spawning) => true,
        (Spawning, AwaitingAddress) | (Spawning, Failed) => true,
        (AwaitingAddress, Running) | (AwaitingAddress, Failed) => true,
        // halt may be requested at any point before the reaper ran
        (Reserved | Spawning | AwaitingAddress | Running | Failed, Halting) => true,
        // the reaper ends every path once the process exits
        (Spawning | AwaitingAddress | Running | Halting | Failed, Reaped) => true,
        _ => false,
    }
}

/// States that end a VM's life; nothing follows them.
pub fn is_terminal(state: BootState) -> bool {
    matches!(state, BootState::Reaped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use BootState::*;

    #[test]
    fn happy_path_is_legal() {
        let path = [Reserved, Spawning, AwaitingAddress, Running, Halting, Reaped];
        for pair in path.windows(2) {
            assert!(can_transition(pair[0], pair[1]), "{:?} -> {:?}", pair[0], pair[1]);
        }
    }

    #[test]
    fn failure_still_gets_reaped() {
        assert!(can_transition(AwaitingAddress, Failed));
        assert!(can_transition(Failed, Reaped));
    }

    #[test]
    fn no_way_back() {
        assert!(!can_transition(Running, AwaitingAddress));
        assert!(!can_transition(Reaped, Running));
        assert!(!can_transition(Halting, Running));
        assert!(!can_transition(Running, Running));
        assert!(!can_transition(Reserved, Running));
    }

    #[test]
    fn only_reaped_is_terminal() {
        assert!(is_terminal(Reaped));
        assert!(!is_terminal(Failed));
    }
}
