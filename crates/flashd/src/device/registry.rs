//! In-memory registry of observed serial devices.

use std::collections::HashMap;
use std::fmt;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::identity::{DeviceIdentity, HardwareSerialPolicy, IdentityPolicy};
use crate::error::EngineError;
use crate::hotplug::{HotplugEvent, HotplugKind, PortInfo};

/// Lifecycle state of one device record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceState {
    Discovered,
    Idle,
    Queued,
    Flashing,
    Verifying,
    Succeeded,
    Failed,
    Disconnected,
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeviceState::Discovered => "discovered",
            DeviceState::Idle => "idle",
            DeviceState::Queued => "queued",
            DeviceState::Flashing => "flashing",
            DeviceState::Verifying => "verifying",
            DeviceState::Succeeded => "succeeded",
            DeviceState::Failed => "failed",
            DeviceState::Disconnected => "disconnected",
        };
        write!(f, "{}", s)
    }
}

/// One physical serial endpoint observation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub identity: DeviceIdentity,
    /// Registry-assigned record number, increasing per record.
    pub instance: u64,
    pub port_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vendor_id: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product_id: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub serial_number: Option<String>,
    pub state: DeviceState,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl Device {
    pub fn is_live(&self) -> bool {
        self.state != DeviceState::Disconnected
    }

    fn observe(&mut self, port: &PortInfo, now: DateTime<Utc>) {
        self.port_path = port.port_path.clone();
        self.vendor_id = port.vendor_id;
        self.product_id = port.product_id;
        self.serial_number = port.serial_number.clone();
        self.last_seen = now;
    }
}

/// Disconnected records kept by default.
pub const DEFAULT_HISTORY_LIMIT: usize = 500;

#[derive(Default)]
struct RegistryState {
    /// Live records plus recent disconnected history, in creation order.
    records: Vec<Device>,
    /// Index into `records` of the live record per identity.
    live: HashMap<DeviceIdentity, usize>,
    next_instance: u64,
}

impl RegistryState {
    fn disconnect_at(&mut self, idx: usize, now: DateTime<Utc>) -> Device {
        let device = &mut self.records[idx];
        device.state = DeviceState::Disconnected;
        device.last_seen = now;
        let device = device.clone();
        self.live.remove(&device.identity);
        device
    }

    /// Drops the oldest disconnected records beyond `limit`. Indices shift,
    /// so the live index is rebuilt.
    fn prune_closed(&mut self, limit: usize) {
        let closed = self.records.iter().filter(|d| !d.is_live()).count();
        if closed <= limit {
            return;
        }

        let mut excess = closed - limit;
        self.records.retain(|device| {
            if excess > 0 && !device.is_live() {
                excess -= 1;
                false
            } else {
                true
            }
        });
        self.live = self
            .records
            .iter()
            .enumerate()
            .filter(|(_, device)| device.is_live())
            .map(|(idx, device)| (device.identity.clone(), idx))
            .collect();
        log::debug!("Pruned {} disconnected device records", closed - limit);
    }

    fn live_index_by_path(&self, port_path: &str) -> Option<usize> {
        self.live
            .values()
            .copied()
            .find(|&idx| self.records[idx].port_path == port_path)
    }
}

/// Owns all [`Device`] records.
///
/// Writers are the hotplug consumer and the scheduler's [`mark`](Self::mark);
/// every read takes a consistent snapshot under one lock.
pub struct DeviceRegistry {
    policy: Box<dyn IdentityPolicy>,
    state: RwLock<RegistryState>,
    history_limit: usize,
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::with_policy(Box::new(HardwareSerialPolicy))
    }

    pub fn with_policy(policy: Box<dyn IdentityPolicy>) -> Self {
        Self {
            policy,
            state: RwLock::new(RegistryState::default()),
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }

    /// Caps how many disconnected records [`list`](Self::list) keeps.
    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }

    fn read(&self) -> RwLockReadGuard<'_, RegistryState> {
        match self.state.read() {
            Ok(guard) => guard,
            Err(poisoned) => {
                log::warn!("DeviceRegistry lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryState> {
        match self.state.write() {
            Ok(guard) => guard,
            Err(poisoned) => {
                log::warn!("DeviceRegistry lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    pub fn identity_for(&self, port: &PortInfo) -> DeviceIdentity {
        self.policy.identify(port)
    }

    /// Records a connect observation.
    ///
    /// A live record with the same identity absorbs the new port path and
    /// attributes; otherwise a fresh record is created in `Discovered`.
    /// A different live record still claiming this port path is closed
    /// first, since one path cannot host two devices.
    pub fn upsert(&self, event: &HotplugEvent) -> Device {
        let identity = self.policy.identify(&event.port);
        let now = Utc::now();
        let mut state = self.write();

        if let Some(&idx) = state.live.get(&identity) {
            let device = &mut state.records[idx];
            if device.port_path != event.port.port_path {
                log::info!(
                    "Device {} moved from {} to {}",
                    identity,
                    device.port_path,
                    event.port.port_path
                );
            }
            device.observe(&event.port, now);
            return device.clone();
        }

        if let Some(stale) = state.live_index_by_path(&event.port.port_path) {
            let old = state.disconnect_at(stale, now);
            log::debug!(
                "Port {} now hosts {}, closing record for {}",
                event.port.port_path,
                identity,
                old.identity
            );
            state.prune_closed(self.history_limit);
        }

        let instance = state.next_instance;
        state.next_instance += 1;
        let device = Device {
            identity: identity.clone(),
            instance,
            port_path: event.port.port_path.clone(),
            vendor_id: event.port.vendor_id,
            product_id: event.port.product_id,
            serial_number: event.port.serial_number.clone(),
            state: DeviceState::Discovered,
            first_seen: now,
            last_seen: now,
        };
        let idx = state.records.len();
        state.records.push(device.clone());
        state.live.insert(identity.clone(), idx);

        log::info!("Discovered device {} on {}", identity, device.port_path);
        device
    }

    /// Records a disconnect observation. The matching live record becomes
    /// `Disconnected` and is kept for history. Falls back to matching by
    /// port path when the event carries no usable attributes.
    pub fn remove(&self, event: &HotplugEvent) -> Option<Device> {
        let identity = self.policy.identify(&event.port);
        let now = Utc::now();
        let mut state = self.write();

        let idx = match state.live.get(&identity) {
            Some(&idx) => Some(idx),
            None => state.live_index_by_path(&event.port.port_path),
        }?;

        let device = state.disconnect_at(idx, now);
        state.prune_closed(self.history_limit);
        log::info!("Device {} disconnected from {}", device.identity, device.port_path);
        Some(device)
    }

    /// Applies a hotplug event; returns the affected record.
    pub fn apply(&self, event: &HotplugEvent) -> Option<Device> {
        match event.kind {
            HotplugKind::Connect => Some(self.upsert(event)),
            HotplugKind::Disconnect => self.remove(event),
        }
    }

    /// Every live record plus retained disconnected history, in creation order.
    pub fn list(&self) -> Vec<Device> {
        self.read().records.clone()
    }

    /// Live records only, in creation order.
    pub fn active(&self) -> Vec<Device> {
        let state = self.read();
        let mut indices: Vec<usize> = state.live.values().copied().collect();
        indices.sort_unstable();
        indices
            .into_iter()
            .map(|idx| state.records[idx].clone())
            .collect()
    }

    /// The live record for `identity`.
    pub fn resolve(&self, identity: &DeviceIdentity) -> Result<Device, EngineError> {
        let state = self.read();
        state
            .live
            .get(identity)
            .map(|&idx| state.records[idx].clone())
            .ok_or_else(|| EngineError::DeviceNotFound {
                identity: identity.to_string(),
            })
    }

    /// Moves a live record to `new_state`.
    ///
    /// Returns `false` without changing anything when the identity's live
    /// record is a different instance (the device reconnected), when no
    /// live record exists, or when `new_state` is `Disconnected`.
    pub fn mark(&self, identity: &DeviceIdentity, instance: u64, new_state: DeviceState) -> bool {
        if new_state == DeviceState::Disconnected {
            return false;
        }

        let mut state = self.write();
        let Some(&idx) = state.live.get(identity) else {
            return false;
        };
        let device = &mut state.records[idx];
        if device.instance != instance {
            return false;
        }

        log::debug!("Device {} {} -> {}", identity, device.state, new_state);
        device.state = new_state;
        true
    }
}
