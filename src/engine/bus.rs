use std::fmt;

use super::WORD_BYTES;

/// Kind of guest access that reached one of the emulator hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessType {
    Read,
    Write,
    Exec,
}

/// Where in the emulator the hook fired. Mirrors the places an emulator
/// calls out to the engine: the softmmu path (memory address/content),
/// the register file accessors, the decoder, and the per-block time tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectionSite {
    MemAddr,
    MemContent,
    RegAddr,
    RegContent,
    Insn,
    Time,
}

/// The guest cell read by `GuestBus::mem_rw` was not mapped or not
/// readable. Faults on such cells are skipped for the current event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuestMemoryError;

impl fmt::Display for GuestMemoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "guest memory not accessible")
    }
}

impl std::error::Error for GuestMemoryError {}

/// Everything the engine needs from the host emulator: guest RAM,
/// the register file, TLB maintenance and the virtual clock.
///
/// One implementation per guest CPU. The engine never assumes a
/// particular architecture; register indices are whatever the host's
/// register accessors accept.
pub trait GuestBus {
    /// Read or write `buf.len()` bytes of guest memory at `addr`.
    fn mem_rw(&mut self, addr: u64, buf: &mut [u8], is_write: bool) -> Result<(), GuestMemoryError>;

    /// Read one register of the bound CPU.
    fn reg_read(&mut self, regno: u64) -> u32;

    /// Overwrite one register of the bound CPU.
    fn reg_write(&mut self, regno: u64, value: u32);

    /// Drop any cached translation for the page containing `vaddr` so the
    /// guest observes engine writes on its next access.
    fn tlb_flush_page(&mut self, vaddr: u64);

    /// Monotonic virtual time in nanoseconds.
    fn clock_ns(&mut self) -> i64;
}

/// Read one MEMORY_WIDTH cell, little-endian.
pub(crate) fn read_cell(
    bus: &mut dyn GuestBus,
    on_register: bool,
    addr: u64,
) -> Result<u32, GuestMemoryError> {
    if on_register {
        return Ok(bus.reg_read(addr));
    }
    let mut bytes = [0u8; WORD_BYTES];
    bus.mem_rw(addr, &mut bytes, false)?;
    Ok(u32::from_le_bytes(bytes))
}

/// Write one MEMORY_WIDTH cell, little-endian.
pub(crate) fn write_cell(
    bus: &mut dyn GuestBus,
    on_register: bool,
    addr: u64,
    value: u32,
) -> Result<(), GuestMemoryError> {
    if on_register {
        bus.reg_write(addr, value);
        return Ok(());
    }
    let mut bytes = value.to_le_bytes();
    bus.mem_rw(addr, &mut bytes, true)
}
