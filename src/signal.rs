//! Signal slots and the per-channel signal table.
//!
//! Each bus channel of an adapter model holds a table of signal slots.
//! A slot stores the current scalar (`val`), the pending outbound
//! scalar (`final_val`), and a binary payload buffer. A scalar written
//! by a model becomes `final_val` during marshalling and only turns
//! into `val` after the next bus exchange, so peers never observe
//! in-tick writes. A non-empty binary buffer means "new data present";
//! whichever side copies the data out clears the buffer (the consumed
//! convention), retaining its capacity for later ticks.

use std::collections::HashMap;

use crate::types::Uid;

/// Storage for one signal on a channel.
#[derive(Clone, Debug, Default)]
pub struct SignalSlot {
    /// Signal name, unique within the channel.
    pub name: String,

    /// Bus-assigned signal UID; zero until registration.
    pub uid: Uid,

    /// Current scalar value, as of the last bus exchange.
    pub val: f64,

    /// Pending outbound scalar, written by marshalling and published
    /// on the next exchange.
    pub final_val: f64,

    /// Binary payload. The length is the payload size; capacity is
    /// retained across ticks to avoid reallocation.
    pub bin: Vec<u8>,
}

impl SignalSlot {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Appends payload bytes, growing the buffer as needed.
    pub fn append_bin(&mut self, data: &[u8]) {
        self.bin.extend_from_slice(data);
    }

    /// Marks the payload consumed. Capacity is retained.
    pub fn consume_bin(&mut self) {
        self.bin.clear();
    }
}

/// A named channel: ordered signal slots plus a name index.
///
/// Slots keep their insertion order so signal UIDs and bus exchanges
/// are deterministic; lookups go through the index.
#[derive(Debug, Default)]
pub struct Channel {
    name: String,
    slots: Vec<SignalSlot>,
    index: HashMap<String, usize>,
}

impl Channel {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            slots: Vec::new(),
            index: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Returns the slot index for `signal`, creating a slot if the
    /// signal has not been seen on this channel before.
    pub fn slot_index(&mut self, signal: &str) -> usize {
        if let Some(&idx) = self.index.get(signal) {
            return idx;
        }
        let idx = self.slots.len();
        self.slots.push(SignalSlot::new(signal));
        self.index.insert(signal.to_string(), idx);
        idx
    }

    /// Looks up a slot index without creating it.
    pub fn lookup(&self, signal: &str) -> Option<usize> {
        self.index.get(signal).copied()
    }

    pub fn slot(&self, idx: usize) -> &SignalSlot {
        &self.slots[idx]
    }

    pub fn slot_mut(&mut self, idx: usize) -> &mut SignalSlot {
        &mut self.slots[idx]
    }

    pub fn slots(&self) -> &[SignalSlot] {
        &self.slots
    }

    pub fn slots_mut(&mut self) -> &mut [SignalSlot] {
        &mut self.slots
    }

    /// Ensures a slot exists for every name, in the given order.
    pub fn ensure_signals(&mut self, names: &[String]) {
        for name in names {
            self.slot_index(name);
        }
    }

    /// Builds a transient signal map: for each binding index the
    /// corresponding slot index, creating slots for unseen signals.
    ///
    /// The map is valid until the slot set changes; marshalling builds
    /// one per channel per direction pass.
    pub fn signal_map(&mut self, names: &[String]) -> Vec<usize> {
        names.iter().map(|n| self.slot_index(n)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_creation_on_demand() {
        let mut ch = Channel::new("data");
        assert!(ch.is_empty());

        let a = ch.slot_index("alpha");
        let b = ch.slot_index("beta");
        let a2 = ch.slot_index("alpha");

        assert_eq!(a, a2);
        assert_ne!(a, b);
        assert_eq!(ch.len(), 2);
        assert_eq!(ch.slot(a).name, "alpha");
    }

    #[test]
    fn test_lookup_does_not_create() {
        let ch = Channel::new("data");
        assert!(ch.lookup("ghost").is_none());
        assert!(ch.is_empty());
    }

    #[test]
    fn test_signal_map_order_matches_bindings() {
        let mut ch = Channel::new("data");
        ch.ensure_signals(&["x".to_string(), "y".to_string(), "z".to_string()]);

        let map = ch.signal_map(&["z".to_string(), "x".to_string()]);
        assert_eq!(map.len(), 2);
        assert_eq!(ch.slot(map[0]).name, "z");
        assert_eq!(ch.slot(map[1]).name, "x");
    }

    #[test]
    fn test_bin_append_and_consume_retains_capacity() {
        let mut slot = SignalSlot::new("payload");
        slot.append_bin(&[0xDE, 0xAD]);
        slot.append_bin(&[0xBE, 0xEF]);
        assert_eq!(slot.bin, vec![0xDE, 0xAD, 0xBE, 0xEF]);

        let cap = slot.bin.capacity();
        slot.consume_bin();
        assert!(slot.bin.is_empty());
        assert_eq!(slot.bin.capacity(), cap);
    }
}
