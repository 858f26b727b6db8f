//! Vector clocks and the replicated value wrapper.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::types::DeviceId;

/// Causal relation between two vector clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockOrdering {
    /// Identical clocks.
    Equal,
    /// Self happened strictly before the other clock.
    Before,
    /// Self happened strictly after the other clock.
    After,
    /// Neither dominates; the writes are concurrent.
    Concurrent,
}

/// Per-device logical counters.
///
/// Missing components are treated as zero, so `{a: 1}` and `{a: 1, b: 0}`
/// compare equal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorClock {
    counters: BTreeMap<DeviceId, u64>,
}

impl VectorClock {
    /// Create an empty clock.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current counter for a device.
    pub fn get(&self, device: &DeviceId) -> u64 {
        self.counters.get(device).copied().unwrap_or(0)
    }

    /// Advance the device's own component and return its new value.
    pub fn increment(&mut self, device: &DeviceId) -> u64 {
        let counter = self.counters.entry(device.clone()).or_insert(0);
        *counter += 1;
        *counter
    }

    /// Take the component-wise maximum with another clock.
    pub fn merge(&mut self, other: &VectorClock) {
        for (device, &count) in &other.counters {
            let entry = self.counters.entry(device.clone()).or_insert(0);
            *entry = (*entry).max(count);
        }
    }

    /// Component-wise maximum of two clocks, leaving both untouched.
    pub fn merged(&self, other: &VectorClock) -> VectorClock {
        let mut clock = self.clone();
        clock.merge(other);
        clock
    }

    /// Determine the causal relation between `self` and `other`.
    pub fn compare(&self, other: &VectorClock) -> ClockOrdering {
        let mut less = false;
        let mut greater = false;

        for device in self.counters.keys().chain(other.counters.keys()) {
            let mine = self.get(device);
            let theirs = other.get(device);
            if mine < theirs {
                less = true;
            } else if mine > theirs {
                greater = true;
            }
            if less && greater {
                return ClockOrdering::Concurrent;
            }
        }

        match (less, greater) {
            (false, false) => ClockOrdering::Equal,
            (true, false) => ClockOrdering::Before,
            (false, true) => ClockOrdering::After,
            (true, true) => ClockOrdering::Concurrent,
        }
    }

    /// Iterate over non-zero components.
    pub fn iter(&self) -> impl Iterator<Item = (&DeviceId, u64)> {
        self.counters.iter().map(|(d, c)| (d, *c))
    }
}

/// The unit of replication: a value plus the causal context of its write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimestampedValue<T> {
    pub value: T,
    pub vector_clock: VectorClock,
    pub device_id: DeviceId,
    pub updated_at: DateTime<Utc>,
}

impl<T> TimestampedValue<T> {
    /// Wrap a value written by `device_id` at `vector_clock`.
    pub fn new(value: T, vector_clock: VectorClock, device_id: DeviceId) -> Self {
        Self {
            value,
            vector_clock,
            device_id,
            updated_at: Utc::now(),
        }
    }

    /// Causal relation of this write to another.
    pub fn compare(&self, other: &TimestampedValue<T>) -> ClockOrdering {
        self.vector_clock.compare(&other.vector_clock)
    }
}
