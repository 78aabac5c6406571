//! In-process loopback bus.
//!
//! The loopback variant implements the bus protocol without a wire: an
//! internal bus-side signal table consolidates the deltas every model
//! publishes on `ready`, and `start` grants the next step immediately,
//! advancing `stop_time` by one step size and distributing the
//! consolidated state. Scalar state reaches every model; binary
//! payloads reach every model except their producer, and pending
//! payloads are dropped once all models have taken the grant.

use std::collections::BTreeMap;

use crate::adapter::{AdapterModel, AdapterVtable};
use crate::error::Result;
use crate::types::{SimTime, Uid};

/// FNV-1a hash, the loopback's signal UID assignment.
fn fnv1a(name: &str) -> Uid {
    let mut h: u32 = 2166136261;
    for b in name.as_bytes() {
        h ^= u32::from(*b);
        h = h.wrapping_mul(16777619);
    }
    h
}

#[derive(Debug, Default)]
struct BusSignal {
    uid: Uid,
    val: f64,
    /// Payloads published this exchange, tagged with the producer.
    pending: Vec<(Uid, Vec<u8>)>,
}

#[derive(Debug, Default)]
struct BusChannel {
    signals: BTreeMap<String, BusSignal>,
}

/// Loopback implementation of the bus protocol.
#[derive(Debug, Default)]
pub struct LoopbackAdapter {
    step_size: SimTime,
    model_count: usize,
    started: usize,
    bus: BTreeMap<String, BusChannel>,
}

impl LoopbackAdapter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AdapterVtable for LoopbackAdapter {
    fn connect(
        &mut self,
        am: &mut AdapterModel,
        step_size: SimTime,
        _timeout: SimTime,
    ) -> Result<()> {
        self.step_size = step_size;
        self.model_count += 1;
        tracing::debug!(model_uid = am.model_uid, step_size, "loopback connect");
        Ok(())
    }

    fn register(&mut self, am: &mut AdapterModel) -> Result<()> {
        for ch in am.channels_mut() {
            let bus_ch = self.bus.entry(ch.name().to_string()).or_default();
            for slot in ch.slots_mut() {
                slot.uid = fnv1a(&slot.name);
                let sig = bus_ch.signals.entry(slot.name.clone()).or_default();
                sig.uid = slot.uid;
                tracing::debug!(signal = %slot.name, uid = slot.uid, "SignalLookup");
            }
        }
        Ok(())
    }

    fn ready(&mut self, am: &mut AdapterModel) -> Result<()> {
        let model_uid = am.model_uid;
        for ch in am.channels_mut() {
            let bus_ch = self.bus.entry(ch.name().to_string()).or_default();
            for slot in ch.slots_mut() {
                if slot.uid == 0 {
                    continue;
                }
                let sig = bus_ch.signals.entry(slot.name.clone()).or_default();
                if !slot.bin.is_empty() {
                    tracing::trace!(
                        signal = %slot.name,
                        len = slot.bin.len(),
                        "SignalWrite <binary>"
                    );
                    sig.pending.push((model_uid, slot.bin.clone()));
                    slot.consume_bin();
                } else if slot.val != slot.final_val {
                    tracing::trace!(signal = %slot.name, value = slot.final_val, "SignalWrite");
                    sig.val = slot.final_val;
                }
            }
        }
        Ok(())
    }

    fn start(&mut self, am: &mut AdapterModel) -> Result<()> {
        am.stop_time = am.model_time + self.step_size;

        let model_uid = am.model_uid;
        for ch in am.channels_mut() {
            let Some(bus_ch) = self.bus.get(ch.name()) else {
                continue;
            };
            for slot in ch.slots_mut() {
                if slot.uid == 0 {
                    continue;
                }
                let Some(sig) = bus_ch.signals.get(&slot.name) else {
                    continue;
                };
                slot.val = sig.val;
                for (producer, payload) in &sig.pending {
                    if *producer != model_uid {
                        slot.append_bin(payload);
                    }
                }
            }
        }

        self.started += 1;
        if self.started >= self.model_count {
            self.started = 0;
            for bus_ch in self.bus.values_mut() {
                for sig in bus_ch.signals.values_mut() {
                    sig.pending.clear();
                }
            }
        }
        Ok(())
    }
}
