//! In-flight GATT operations keyed by device and characteristic

use std::collections::{HashMap, VecDeque};

use tokio::sync::oneshot;
use uuid::Uuid;

use tether_core::{DeviceId, Result, TetherError};

/// Composite key for one characteristic on one device
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GattKey {
    pub device_id: DeviceId,
    pub characteristic: Uuid,
}

impl GattKey {
    pub fn new(device_id: DeviceId, characteristic: Uuid) -> Self {
        Self {
            device_id,
            characteristic,
        }
    }
}

/// FIFO of responders per key; completions resolve the oldest
#[derive(Debug)]
pub struct PendingOps<T> {
    ops: HashMap<GattKey, VecDeque<oneshot::Sender<Result<T>>>>,
}

impl<T> Default for PendingOps<T> {
    fn default() -> Self {
        Self {
            ops: HashMap::new(),
        }
    }
}

impl<T> PendingOps<T> {
    pub fn push(&mut self, key: GattKey, respond: oneshot::Sender<Result<T>>) {
        self.ops.entry(key).or_default().push_back(respond);
    }

    /// Resolve the oldest operation for `key`; false when none was waiting
    pub fn resolve(&mut self, key: &GattKey, result: Result<T>) -> bool {
        let Some(queue) = self.ops.get_mut(key) else {
            return false;
        };
        let Some(respond) = queue.pop_front() else {
            return false;
        };
        if queue.is_empty() {
            self.ops.remove(key);
        }
        // The caller may have given up
        let _ = respond.send(result);
        true
    }

    /// Fail every operation on `device_id`, returning how many were failed
    pub fn fail_device<F>(&mut self, device_id: &DeviceId, error: F) -> usize
    where
        F: Fn() -> TetherError,
    {
        let keys: Vec<GattKey> = self
            .ops
            .keys()
            .filter(|key| &key.device_id == device_id)
            .cloned()
            .collect();

        let mut failed = 0;
        for key in keys {
            if let Some(queue) = self.ops.remove(&key) {
                for respond in queue {
                    let _ = respond.send(Err(error()));
                    failed += 1;
                }
            }
        }
        failed
    }

    pub fn len(&self) -> usize {
        self.ops.values().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}
