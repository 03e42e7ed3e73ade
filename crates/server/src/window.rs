//! Per-device bounded history of recent LDR readings.
//!
//! The map lock is only held long enough to find or create a device's
//! window; each window then has its own lock, so readings from different
//! devices never contend and readings for the same device are appended in
//! lock-acquisition order.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Number of most recent readings kept per device.
pub const WINDOW_SIZE: usize = 15;

type DeviceWindow = Arc<Mutex<VecDeque<f64>>>;

#[derive(Default)]
pub struct WindowStore {
    devices: Mutex<HashMap<String, DeviceWindow>>,
}

impl WindowStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `ldr` to the device's window and return the window contents
    /// after the append, oldest first. Unknown devices get a fresh window.
    pub fn record(&self, device: &str, ldr: f64) -> Vec<f64> {
        let window = self.window_for(device);
        let mut values = lock(&window);

        values.push_back(ldr);
        if values.len() > WINDOW_SIZE {
            values.pop_front();
        }

        values.iter().copied().collect()
    }

    /// Current window for a device without mutating it.
    pub fn snapshot(&self, device: &str) -> Option<Vec<f64>> {
        let window = lock(&self.devices).get(device).cloned()?;
        let values = lock(&window);
        Some(values.iter().copied().collect())
    }

    fn window_for(&self, device: &str) -> DeviceWindow {
        let mut devices = lock(&self.devices);
        if let Some(w) = devices.get(device) {
            return Arc::clone(w);
        }
        let w: DeviceWindow = Arc::new(Mutex::new(VecDeque::with_capacity(WINDOW_SIZE + 1)));
        devices.insert(device.to_string(), Arc::clone(&w));
        w
    }
}

// Push and pop happen under one guard, so a poisoned window still holds at
// most WINDOW_SIZE values.
fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ===========================================================================
// Tests
// ===========================================================================
