//! Registry of vehicle states.
//!
//! Each vehicle's state sits behind its own mutex so reports for different
//! vehicles proceed in parallel while reports for one vehicle serialize. The
//! registry itself is only write-locked to insert a vehicle seen for the
//! first time; states are never removed.
//!
//! Block holders are indexed separately so exclusive-assignment checks never
//! need to lock another vehicle. When a vehicle loses its block to another
//! while its own lock is busy, the revocation is parked here and applied by
//! whoever next holds that vehicle's lock.

use crate::avl_report::VehicleId;
use crate::vehicle_state::VehicleState;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use tracing::debug;

/// (service id, block id)
pub type BlockKey = (String, String);

pub type SharedVehicleState = Arc<Mutex<VehicleState>>;

/// A block revocation waiting for the vehicle's lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingGrab {
    pub block: BlockKey,
    pub grabbed_by: VehicleId,
    pub time_ms: i64,
}

#[derive(Default)]
pub struct VehicleStateManager {
    states: RwLock<HashMap<VehicleId, SharedVehicleState>>,
    block_holders: Mutex<HashMap<BlockKey, VehicleId>>,
    pending_grabs: Mutex<HashMap<VehicleId, PendingGrab>>,
}

impl VehicleStateManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Existing state or a fresh unassigned one.
    pub fn get_or_create(&self, vehicle_id: &VehicleId, match_history_size: usize, avl_history_size: usize) -> SharedVehicleState {
        if let Some(state) = self.get(vehicle_id) {
            return state;
        }
        let mut states = self.states.write().unwrap_or_else(|e| e.into_inner());
        Arc::clone(states.entry(vehicle_id.clone()).or_insert_with(|| {
            debug!(%vehicle_id, "creating vehicle state");
            Arc::new(Mutex::new(VehicleState::new(
                vehicle_id.clone(),
                match_history_size,
                avl_history_size,
            )))
        }))
    }

    pub fn get(&self, vehicle_id: &VehicleId) -> Option<SharedVehicleState> {
        self.states
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(vehicle_id)
            .cloned()
    }

    /// Ids of every vehicle seen so far, sorted.
    pub fn snapshot_ids(&self) -> Vec<VehicleId> {
        let mut ids: Vec<VehicleId> = self
            .states
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.states.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ========================================================================
    // Block holders
    // ========================================================================

    /// Vehicles currently holding the block.
    pub fn vehicles_for_block(&self, block: &BlockKey) -> Vec<VehicleId> {
        self.block_holders
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(block)
            .cloned()
            .into_iter()
            .collect()
    }

    /// Records `vehicle_id` as holder of `block`, dropping any other block it
    /// held. Returns the previous holder if it was another vehicle.
    pub fn set_block_holder(&self, block: BlockKey, vehicle_id: &VehicleId) -> Option<VehicleId> {
        let mut holders = self.block_holders.lock().unwrap_or_else(|e| e.into_inner());
        holders.retain(|key, holder| holder != vehicle_id || *key == block);
        holders
            .insert(block, vehicle_id.clone())
            .filter(|previous| previous != vehicle_id)
    }

    /// Forgets whatever block `vehicle_id` held.
    pub fn release_blocks(&self, vehicle_id: &VehicleId) {
        self.block_holders
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|_, holder| holder != vehicle_id);
    }

    // ========================================================================
    // Deferred revocations
    // ========================================================================

    pub fn defer_grab(&self, vehicle_id: VehicleId, grab: PendingGrab) {
        debug!(%vehicle_id, grabbed_by = %grab.grabbed_by, "deferring block revocation");
        self.pending_grabs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(vehicle_id, grab);
    }

    pub fn take_pending_grab(&self, vehicle_id: &VehicleId) -> Option<PendingGrab> {
        self.pending_grabs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(vehicle_id)
    }

    pub fn pending_grab_ids(&self) -> Vec<VehicleId> {
        self.pending_grabs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }
}

/// Locks a vehicle state, recovering from a poisoned lock.
pub fn lock_state(state: &SharedVehicleState) -> MutexGuard<'_, VehicleState> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(block: &str) -> BlockKey {
        ("svc".to_string(), block.to_string())
    }

    #[test]
    fn test_get_or_create_is_stable() {
        let manager = VehicleStateManager::new();
        let v1 = VehicleId::new("v1");
        let a = manager.get_or_create(&v1, 5, 5);
        let b = manager.get_or_create(&v1, 5, 5);
        assert!(Arc::ptr_eq(&a, &b));
        manager.get_or_create(&VehicleId::new("v0"), 5, 5);
        assert_eq!(manager.snapshot_ids(), vec![VehicleId::new("v0"), v1]);
    }

    #[test]
    fn test_block_holders() {
        let manager = VehicleStateManager::new();
        let v1 = VehicleId::new("v1");
        let v2 = VehicleId::new("v2");
        assert_eq!(manager.set_block_holder(key("b1"), &v1), None);
        assert_eq!(manager.set_block_holder(key("b1"), &v1), None);
        assert_eq!(manager.set_block_holder(key("b1"), &v2), Some(v1.clone()));
        assert_eq!(manager.vehicles_for_block(&key("b1")), vec![v2.clone()]);

        // Moving to another block drops the old one
        manager.set_block_holder(key("b2"), &v2);
        assert!(manager.vehicles_for_block(&key("b1")).is_empty());
        manager.release_blocks(&v2);
        assert!(manager.vehicles_for_block(&key("b2")).is_empty());
    }

    #[test]
    fn test_pending_grabs_taken_once() {
        let manager = VehicleStateManager::new();
        let v1 = VehicleId::new("v1");
        manager.defer_grab(
            v1.clone(),
            PendingGrab {
                block: key("b1"),
                grabbed_by: VehicleId::new("v2"),
                time_ms: 5,
            },
        );
        assert_eq!(manager.pending_grab_ids(), vec![v1.clone()]);
        assert!(manager.take_pending_grab(&v1).is_some());
        assert!(manager.take_pending_grab(&v1).is_none());
    }

    #[test]
    fn test_parallel_creation_yields_one_state() {
        let manager = Arc::new(VehicleStateManager::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let m = Arc::clone(&manager);
                std::thread::spawn(move || m.get_or_create(&VehicleId::new("v"), 5, 5))
            })
            .collect();
        let states: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(states.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        assert_eq!(manager.len(), 1);
    }
}
