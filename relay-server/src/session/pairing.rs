//! Env-runner placement.
//!
//! Pure functions over a [`RoutingTable`]: given a trainer's request and the
//! simulators available to its account, decide which simulator hosts each
//! env-runner slot. Runner `r` always belongs to worker `r % num_workers`.
//! A runner goes to the simulator with the smallest current load that still
//! has spare capacity; ties go to the simulator that registered first.
//! Runners that fit nowhere stay pending until capacity shows up.

use std::collections::{BTreeMap, BTreeSet};

use remoterl_common::{SlotAssignment, SlotId};

use super::ConnectionId;

/// Topology a trainer asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PairingRequest {
    pub num_workers: u32,
    pub num_env_runners: u32,
}

/// One env-runner slot bound to a simulator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvRunnerSlot {
    pub slot_id: SlotId,
    pub worker_index: u32,
    pub simulator: ConnectionId,
    /// Hosting simulator is parked. The slot stays reserved.
    pub suspended: bool,
}

/// A simulator that may receive runners.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub connection_id: ConnectionId,
    /// Registration order.
    pub seq: u64,
    /// Runners already hosted, across all sessions.
    pub load: u32,
    pub capacity: u32,
}

/// Slot layout of one session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutingTable {
    slots: BTreeMap<SlotId, EnvRunnerSlot>,
    /// Worker indexes of runners waiting for a simulator, oldest first.
    pending: Vec<u32>,
}

impl RoutingTable {
    pub fn slots(&self) -> impl Iterator<Item = &EnvRunnerSlot> {
        self.slots.values()
    }

    pub fn get(&self, slot_id: SlotId) -> Option<&EnvRunnerSlot> {
        self.slots.get(&slot_id)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn pending(&self) -> &[u32] {
        &self.pending
    }

    /// Every simulator hosting at least one slot.
    pub fn simulators(&self) -> BTreeSet<ConnectionId> {
        self.slots.values().map(|s| s.simulator.clone()).collect()
    }

    /// Simulators hosting at least one slot that is not suspended.
    pub fn active_simulators(&self) -> BTreeSet<ConnectionId> {
        self.slots
            .values()
            .filter(|s| !s.suspended)
            .map(|s| s.simulator.clone())
            .collect()
    }

    /// Slot count per hosting simulator.
    pub fn load_by_simulator(&self) -> BTreeMap<ConnectionId, u32> {
        let mut loads = BTreeMap::new();
        for slot in self.slots.values() {
            *loads.entry(slot.simulator.clone()).or_insert(0) += 1;
        }
        loads
    }

    /// Mark every slot on `simulator` suspended or not. Returns how many changed.
    pub fn set_suspended(&mut self, simulator: &str, suspended: bool) -> usize {
        let mut changed = 0;
        for slot in self.slots.values_mut() {
            if slot.simulator == simulator && slot.suspended != suspended {
                slot.suspended = suspended;
                changed += 1;
            }
        }
        changed
    }

    /// Wire view of every slot, for the trainer.
    pub fn assignments(&self) -> Vec<SlotAssignment> {
        self.slots.values().map(to_assignment).collect()
    }

    /// Wire view of the slots one simulator hosts.
    pub fn assignments_for(&self, simulator: &str) -> Vec<SlotAssignment> {
        self.slots
            .values()
            .filter(|s| s.simulator == simulator)
            .map(to_assignment)
            .collect()
    }

    fn place(&mut self, slot: EnvRunnerSlot) {
        self.slots.insert(slot.slot_id, slot);
    }
}

fn to_assignment(slot: &EnvRunnerSlot) -> SlotAssignment {
    SlotAssignment {
        slot_id: slot.slot_id,
        worker_index: slot.worker_index,
        simulator_id: slot.simulator.clone(),
        suspended: slot.suspended,
    }
}

/// What a repair did to a table.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Repair {
    /// Slots that kept their id and moved to another simulator.
    pub moved: Vec<SlotId>,
    /// Slots removed because no simulator could take them; now pending.
    pub orphaned: Vec<SlotId>,
}

/// Least-loaded picker over a local copy of the candidate loads.
struct Picker {
    candidates: Vec<Candidate>,
}

impl Picker {
    fn new(candidates: &[Candidate]) -> Self {
        Self {
            candidates: candidates.to_vec(),
        }
    }

    fn pick(&mut self) -> Option<ConnectionId> {
        let chosen = self
            .candidates
            .iter_mut()
            .filter(|c| c.load < c.capacity)
            .min_by_key(|c| (c.load, c.seq))?;
        chosen.load += 1;
        Some(chosen.connection_id.clone())
    }
}

/// Lay out a fresh session.
pub fn plan(
    request: &PairingRequest,
    candidates: &[Candidate],
    mut next_slot: impl FnMut() -> SlotId,
) -> RoutingTable {
    let mut table = RoutingTable::default();
    let workers = request.num_workers.max(1);
    let mut picker = Picker::new(candidates);

    for runner in 0..request.num_env_runners {
        let worker_index = runner % workers;
        match picker.pick() {
            Some(simulator) => table.place(EnvRunnerSlot {
                slot_id: next_slot(),
                worker_index,
                simulator,
                suspended: false,
            }),
            None => table.pending.push(worker_index),
        }
    }
    table
}

/// Move the slots of a lost simulator to the remaining candidates.
///
/// Slots on other simulators are not touched. `candidates` must not include
/// the lost simulator.
pub fn reassign(table: &mut RoutingTable, lost: &str, candidates: &[Candidate]) -> Repair {
    let mut picker = Picker::new(candidates);
    let mut repair = Repair::default();

    let affected: Vec<SlotId> = table
        .slots
        .values()
        .filter(|s| s.simulator == lost)
        .map(|s| s.slot_id)
        .collect();

    for slot_id in affected {
        match picker.pick() {
            Some(simulator) => {
                if let Some(slot) = table.slots.get_mut(&slot_id) {
                    slot.simulator = simulator;
                    slot.suspended = false;
                }
                repair.moved.push(slot_id);
            }
            None => {
                if let Some(slot) = table.slots.remove(&slot_id) {
                    table.pending.push(slot.worker_index);
                }
                repair.orphaned.push(slot_id);
            }
        }
    }
    repair
}

/// Place pending runners on spare capacity. Returns the new slot ids.
pub fn fill_pending(
    table: &mut RoutingTable,
    candidates: &[Candidate],
    mut next_slot: impl FnMut() -> SlotId,
) -> Vec<SlotId> {
    let mut picker = Picker::new(candidates);
    let mut placed = Vec::new();

    while let Some(&worker_index) = table.pending.first() {
        let Some(simulator) = picker.pick() else {
            break;
        };
        table.pending.remove(0);
        let slot_id = next_slot();
        table.place(EnvRunnerSlot {
            slot_id,
            worker_index,
            simulator,
            suspended: false,
        });
        placed.push(slot_id);
    }
    placed
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn candidate(id: &str, seq: u64, load: u32, capacity: u32) -> Candidate {
        Candidate {
            connection_id: id.to_string(),
            seq,
            load,
            capacity,
        }
    }

    fn counter() -> impl FnMut() -> SlotId {
        let mut next = 0;
        move || {
            next += 1;
            next
        }
    }

    #[rstest]
    #[case(2, 8, &[4, 4])]
    #[case(1, 3, &[2, 1])]
    #[case(4, 5, &[3, 2])]
    fn test_plan_spreads_evenly(
        #[case] workers: u32,
        #[case] runners: u32,
        #[case] expected: &[u32],
    ) {
        let candidates = vec![candidate("a", 1, 0, 32), candidate("b", 2, 0, 32)];
        let request = PairingRequest {
            num_workers: workers,
            num_env_runners: runners,
        };
        let table = plan(&request, &candidates, counter());

        let loads = table.load_by_simulator();
        assert_eq!(loads.get("a").copied().unwrap_or(0), expected[0]);
        assert_eq!(loads.get("b").copied().unwrap_or(0), expected[1]);
        assert!(table.pending().is_empty());
    }

    #[test]
    fn test_plan_worker_index_is_runner_mod_workers() {
        let candidates = vec![candidate("a", 1, 0, 32)];
        let request = PairingRequest {
            num_workers: 3,
            num_env_runners: 7,
        };
        let table = plan(&request, &candidates, counter());
        let workers: Vec<u32> = table.slots().map(|s| s.worker_index).collect();
        assert_eq!(workers, vec![0, 1, 2, 0, 1, 2, 0]);
    }

    #[test]
    fn test_plan_alternates_between_equal_simulators() {
        let candidates = vec![candidate("a", 1, 0, 32), candidate("b", 2, 0, 32)];
        let request = PairingRequest {
            num_workers: 2,
            num_env_runners: 4,
        };
        let table = plan(&request, &candidates, counter());
        let hosts: Vec<&str> = table.slots().map(|s| s.simulator.as_str()).collect();
        assert_eq!(hosts, vec!["a", "b", "a", "b"]);
    }

    #[test]
    fn test_plan_prefers_less_loaded_simulator() {
        let candidates = vec![candidate("busy", 1, 10, 32), candidate("idle", 2, 0, 32)];
        let request = PairingRequest {
            num_workers: 1,
            num_env_runners: 4,
        };
        let table = plan(&request, &candidates, counter());
        assert_eq!(table.load_by_simulator().get("idle"), Some(&4));
        assert!(!table.simulators().contains("busy"));
    }

    #[test]
    fn test_plan_respects_capacity_and_leaves_pending() {
        let candidates = vec![candidate("a", 1, 0, 2), candidate("b", 2, 1, 2)];
        let request = PairingRequest {
            num_workers: 2,
            num_env_runners: 5,
        };
        let table = plan(&request, &candidates, counter());
        assert_eq!(table.len(), 3);
        assert_eq!(table.pending(), &[1, 0]);
    }

    #[test]
    fn test_plan_without_candidates_is_all_pending() {
        let request = PairingRequest {
            num_workers: 1,
            num_env_runners: 2,
        };
        let table = plan(&request, &[], counter());
        assert!(table.is_empty());
        assert_eq!(table.pending().len(), 2);
    }

    #[test]
    fn test_reassign_only_touches_lost_simulator() {
        let candidates = vec![candidate("a", 1, 0, 32), candidate("b", 2, 0, 32)];
        let request = PairingRequest {
            num_workers: 2,
            num_env_runners: 8,
        };
        let mut table = plan(&request, &candidates, counter());
        let before: Vec<EnvRunnerSlot> = table
            .slots()
            .filter(|s| s.simulator == "a")
            .cloned()
            .collect();

        let survivors = vec![candidate("a", 1, 4, 32), candidate("c", 3, 0, 32)];
        let repair = reassign(&mut table, "b", &survivors);

        assert_eq!(repair.moved.len(), 4);
        assert!(repair.orphaned.is_empty());
        for slot in &before {
            assert_eq!(table.get(slot.slot_id), Some(slot));
        }
        // the new, empty simulator takes all four
        assert_eq!(table.load_by_simulator().get("c"), Some(&4));
        for slot_id in &repair.moved {
            let slot = table.get(*slot_id).unwrap();
            assert_eq!(slot.worker_index, (*slot_id as u32 - 1) % 2);
        }
    }

    #[test]
    fn test_reassign_orphans_become_pending() {
        let candidates = vec![candidate("a", 1, 0, 32)];
        let request = PairingRequest {
            num_workers: 1,
            num_env_runners: 3,
        };
        let mut table = plan(&request, &candidates, counter());

        let repair = reassign(&mut table, "a", &[]);
        assert!(repair.moved.is_empty());
        assert_eq!(repair.orphaned.len(), 3);
        assert!(table.is_empty());
        assert_eq!(table.pending(), &[0, 0, 0]);
    }

    #[test]
    fn test_fill_pending_uses_new_capacity() {
        let request = PairingRequest {
            num_workers: 2,
            num_env_runners: 3,
        };
        let mut next = counter();
        let mut table = plan(&request, &[candidate("a", 1, 0, 1)], &mut next);
        assert_eq!(table.pending(), &[1, 0]);

        let placed = fill_pending(&mut table, &[candidate("b", 2, 0, 32)], &mut next);
        assert_eq!(placed, vec![2, 3]);
        assert!(table.pending().is_empty());
        assert_eq!(table.get(2).unwrap().worker_index, 1);
        assert_eq!(table.get(3).unwrap().simulator, "b");
    }

    #[test]
    fn test_suspension_tracks_active_simulators() {
        let candidates = vec![candidate("a", 1, 0, 32), candidate("b", 2, 0, 32)];
        let request = PairingRequest {
            num_workers: 1,
            num_env_runners: 2,
        };
        let mut table = plan(&request, &candidates, counter());

        assert_eq!(table.set_suspended("a", true), 1);
        assert_eq!(table.active_simulators().len(), 1);
        assert_eq!(table.simulators().len(), 2);
        assert!(table.assignments_for("a")[0].suspended);

        table.set_suspended("a", false);
        assert_eq!(table.active_simulators().len(), 2);
    }
}
