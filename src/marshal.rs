//! Signal marshalling between function bindings and the signal table.
//!
//! Two symmetric direction passes run around every bus exchange:
//!
//! - model → adapter: binding scalars become the slots' pending
//!   `final_val`; binding payloads are appended to the slots' buffers
//!   and the binding side is marked consumed.
//! - adapter → model: slot `val`s are copied into the binding scalars;
//!   slot payloads are appended to the binding buffers and the slot
//!   side is marked consumed.
//!
//! Bindings resolve through a transient signal map (binding index to
//! slot index) built per channel for the duration of one direction
//! pass.

use crate::adapter::Adapter;
use crate::error::{Error, Result};
use crate::runtime::ModelInstance;

/// Direction of one marshalling pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum MarshalDir {
    ModelToAdapter,
    AdapterToModel,
}

/// Runs one direction pass over every instance, function, and channel
/// binding, in configured instance order.
pub(crate) fn marshal(
    dir: MarshalDir,
    instances: &mut [ModelInstance],
    adapter: &mut Adapter,
) -> Result<()> {
    for inst in instances.iter_mut() {
        let am = adapter
            .model_mut(inst.uid)
            .ok_or_else(|| Error::Config(format!("no adapter model for uid {}", inst.uid)))?;
        for mf in inst.controller_model.functions.values_mut() {
            for fc in mf.channels.values_mut() {
                let ch = am.channel_entry(fc.channel_name());
                let map = ch.signal_map(fc.signal_names());

                match dir {
                    MarshalDir::ModelToAdapter => {
                        if let Some(scalars) = fc.scalars() {
                            for (i, &slot_idx) in map.iter().enumerate() {
                                ch.slot_mut(slot_idx).final_val = scalars[i];
                            }
                        }
                        if fc.is_binary() {
                            for (i, &slot_idx) in map.iter().enumerate() {
                                let slot = ch.slot_mut(slot_idx);
                                slot.append_bin(fc.binary(i));
                                fc.reset_binary(i);
                            }
                        }
                    }
                    MarshalDir::AdapterToModel => {
                        if fc.is_binary() {
                            for (i, &slot_idx) in map.iter().enumerate() {
                                let slot = ch.slot_mut(slot_idx);
                                fc.append_binary(i, &slot.bin);
                                slot.consume_bin();
                            }
                        } else {
                            for (i, &slot_idx) in map.iter().enumerate() {
                                fc.set_scalar(i, ch.slot(slot_idx).val);
                            }
                        }
                    }
                }
            }
        }
    }
    Ok(())
}
