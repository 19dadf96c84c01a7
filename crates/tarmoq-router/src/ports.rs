//! Fixed-range TCP port pool

use std::collections::{HashSet, VecDeque};
use std::ops::RangeInclusive;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::registry::AllocationError;

struct PoolState {
    /// FIFO of free ports; released ports go to the back
    queue: VecDeque<u16>,
    /// Mirror of `queue` so a port is never queued twice
    free: HashSet<u16>,
}

/// Dispenses ports from a closed range under mutual exclusion
pub struct PortPool {
    range: RangeInclusive<u16>,
    state: Mutex<PoolState>,
}

impl PortPool {
    pub fn new(range: RangeInclusive<u16>) -> Self {
        let queue: VecDeque<u16> = range.clone().collect();
        let free = queue.iter().copied().collect();

        Self {
            range,
            state: Mutex::new(PoolState { queue, free }),
        }
    }

    fn state(&self) -> MutexGuard<'_, PoolState> {
        // No invariant can be left half-updated by a panicking holder
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn acquire(&self) -> Result<u16, AllocationError> {
        let mut state = self.state();
        let port = state.queue.pop_front().ok_or(AllocationError::NoAvailablePorts)?;
        state.free.remove(&port);
        debug!("Acquired port {} ({} left)", port, state.queue.len());
        Ok(port)
    }

    /// Return a port to the pool. Ports outside the range or already free are ignored.
    pub fn release(&self, port: u16) -> bool {
        if !self.range.contains(&port) {
            warn!("Ignoring release of port {} outside pool range", port);
            return false;
        }

        let mut state = self.state();
        if !state.free.insert(port) {
            warn!("Ignoring duplicate release of port {}", port);
            return false;
        }
        state.queue.push_back(port);
        debug!("Released port {}", port);
        true
    }

    pub fn is_free(&self, port: u16) -> bool {
        self.state().free.contains(&port)
    }

    pub fn available(&self) -> usize {
        self.state().queue.len()
    }

    pub fn capacity(&self) -> usize {
        self.range.clone().count()
    }

    pub fn range(&self) -> &RangeInclusive<u16> {
        &self.range
    }
}
