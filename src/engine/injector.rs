use super::bus::{read_cell, write_cell, GuestBus, GuestMemoryError};

/// Everything the injector needs to apply one mutation, filled in by the
/// evaluators. Exactly one of the three shapes is armed per application:
/// a single-bit flip (`bit_flip`), a whole-word replacement (`new_value`
/// with the word in `bit_value`), or a single stuck bit (neither flag,
/// position in `injected_bit`, polarity in `bit_value`).
#[derive(Debug, Clone, Copy, Default)]
pub struct FaultInjectionInfo {
    /// The mutation applies to the in-flight value of the current access
    /// rather than to a cell behind the bus.
    pub access_triggered_content_fault: bool,
    pub bit_flip: bool,
    pub new_value: bool,
    pub fault_on_register: bool,
    pub fault_on_address: bool,
    pub injected_bit: u32,
    pub bit_value: u32,
}

impl FaultInjectionInfo {
    /// Apply the armed mutation to one word.
    pub(crate) fn mutate_word(&self, word: u32) -> u32 {
        if self.bit_flip {
            word ^ 1u32 << self.injected_bit
        } else if self.new_value {
            self.bit_value
        } else if self.bit_value & 1 != 0 {
            word | 1u32 << self.injected_bit
        } else {
            word & !(1u32 << self.injected_bit)
        }
    }
}

/// Apply one mutation through the bus.
///
/// Address faults hijack `*addr` before the access happens; register and
/// memory faults read-modify-write the targeted cell. `guard` is the
/// engine's reentrancy sentinel: it names the cell being mutated for as
/// long as the bus write is in flight.
pub(crate) fn do_inject(
    bus: &mut dyn GuestBus,
    guard: &mut Option<u64>,
    addr: &mut u64,
    fi_info: FaultInjectionInfo,
) -> Result<(), GuestMemoryError> {
    if fi_info.fault_on_address {
        let hijacked = fi_info.mutate_word(*addr as u32);
        tracing::trace!(from = *addr, to = hijacked, "address decoder fault");
        *addr = hijacked as u64;
        return Ok(());
    }

    *guard = Some(*addr);
    let new = if fi_info.new_value {
        fi_info.bit_value
    } else {
        fi_info.mutate_word(read_cell(bus, fi_info.fault_on_register, *addr)?)
    };
    tracing::trace!(addr = *addr, new, register = fi_info.fault_on_register, "inject");
    write_cell(bus, fi_info.fault_on_register, *addr, new)
}
