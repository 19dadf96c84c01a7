//! Task tracking for listener accept loops
//!
//! Keyed by tunnel port so a tunnel's accept loop can be aborted on teardown.

use std::collections::HashMap;
use std::sync::Mutex;
use tokio::task::JoinHandle;

/// Tracks background tasks associated with tunnel ports
pub struct TaskTracker {
    tasks: Mutex<HashMap<u16, JoinHandle<()>>>,
}

impl TaskTracker {
    pub fn new() -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Register a task for a port, aborting any task previously registered for it
    pub fn register(&self, port: u16, handle: JoinHandle<()>) {
        if let Ok(mut tasks) = self.tasks.lock() {
            if let Some(old_handle) = tasks.insert(port, handle) {
                old_handle.abort();
            }
        }
    }

    /// Abort the task for a port and hand back its handle so the caller can
    /// wait for it to wind down
    pub fn unregister(&self, port: u16) -> Option<JoinHandle<()>> {
        let handle = self.tasks.lock().ok()?.remove(&port)?;
        handle.abort();
        Some(handle)
    }

    pub fn contains(&self, port: u16) -> bool {
        self.tasks
            .lock()
            .map(|tasks| tasks.contains_key(&port))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().map(|tasks| tasks.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for TaskTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_and_unregister() {
        let tracker = TaskTracker::new();

        let handle =
            tokio::spawn(async { tokio::time::sleep(std::time::Duration::from_secs(10)).await });
        tracker.register(50000, handle);
        assert!(tracker.contains(50000));

        let handle = tracker.unregister(50000).unwrap();
        assert!(handle.await.unwrap_err().is_cancelled());
        assert!(tracker.is_empty());
        assert!(tracker.unregister(50000).is_none());
    }

    #[tokio::test]
    async fn test_replacing_task() {
        let tracker = TaskTracker::new();

        let handle1 =
            tokio::spawn(async { tokio::time::sleep(std::time::Duration::from_secs(10)).await });
        tracker.register(50000, handle1);

        let handle2 =
            tokio::spawn(async { tokio::time::sleep(std::time::Duration::from_secs(10)).await });
        tracker.register(50000, handle2);

        // Still only one task for the port
        assert_eq!(tracker.len(), 1);
    }
}
