//! Turns successive enumerations into connect/disconnect events.

use std::collections::BTreeMap;

use super::{HotplugEvent, PortInfo};

/// Remembers the previous enumeration. Starts empty, so the first
/// observation reports every attached port as a connect.
#[derive(Debug, Default)]
pub struct PortTracker {
    previous: BTreeMap<String, PortInfo>,
}

impl PortTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Diffs `current` against the previous enumeration.
    ///
    /// Disconnects come first, then connects, each sorted by port path.
    /// A port whose USB attributes changed is reported as a disconnect of
    /// the old attributes and a connect of the new ones.
    pub fn observe(&mut self, current: Vec<PortInfo>) -> Vec<HotplugEvent> {
        let current: BTreeMap<String, PortInfo> = current
            .into_iter()
            .map(|p| (p.port_path.clone(), p))
            .collect();

        let mut disconnects = Vec::new();
        let mut connects = Vec::new();

        for (path, old) in &self.previous {
            match current.get(path) {
                None => disconnects.push(HotplugEvent::disconnect(old.clone())),
                Some(new) if new != old => {
                    disconnects.push(HotplugEvent::disconnect(old.clone()));
                    connects.push(HotplugEvent::connect(new.clone()));
                }
                Some(_) => {}
            }
        }
        for (path, new) in &current {
            if !self.previous.contains_key(path) {
                connects.push(HotplugEvent::connect(new.clone()));
            }
        }
        connects.sort_by(|a, b| a.port.port_path.cmp(&b.port.port_path));

        self.previous = current;
        disconnects.extend(connects);
        disconnects
    }

    pub fn known(&self) -> impl Iterator<Item = &PortInfo> {
        self.previous.values()
    }
}
