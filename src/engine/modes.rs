//! The bit-level mutation algebra: single-cell modes, dynamic modes keyed
//! on the previous cell operation, and the two-cell coupling families.
//!
//! Every function here assumes the dispatch layer already matched the
//! accessed address and the trigger already fired. Each returns how many
//! injector applications it performed (0 when the mode's own access-type
//! or aggressor/victim condition did not hold), so the dispatcher can
//! charge the statistics.
//!
//! Throughout, the corrupted word is folded with
//! `(faulty & mask) | (original & !mask)`: bits outside the configured
//! mask always keep their original value.

use super::bus::{read_cell, GuestBus, GuestMemoryError};
use super::catalog::Fault;
use super::history::{CellOp, CellOpHistory};
use super::injector::{do_inject, FaultInjectionInfo};
use super::{AccessType, MEMORY_WIDTH};

/// Mask-fold: corrupted bits where `mask` is set, original elsewhere.
pub(crate) fn combine(faulty: u32, mask: u32, original: u32) -> u32 {
    (faulty & mask) | (original & !mask)
}

/// What a simple mode mutates through the bus: the in-flight address
/// (decoder faults) or a cell. In-flight values go through
/// [`apply_simple_value`] instead, which needs no bus at all.
pub(crate) enum ApplyTo<'v> {
    Address(&'v mut u64),
    Cell(u64),
}

/// Bus access shared by every mode application: which address space the
/// cells live in, plus the reentrancy sentinel that names the cell
/// currently being rewritten.
pub(crate) struct CellCtx<'a> {
    pub bus: &'a mut dyn GuestBus,
    pub guard: &'a mut Option<u64>,
    pub on_register: bool,
}

impl CellCtx<'_> {
    fn read(&mut self, addr: u64) -> Result<u32, GuestMemoryError> {
        *self.guard = Some(addr);
        read_cell(self.bus, self.on_register, addr)
    }

    /// Replace a whole cell behind the bus.
    fn store(&mut self, addr: u64, word: u32) -> Result<(), GuestMemoryError> {
        let mut target = addr;
        do_inject(
            self.bus,
            self.guard,
            &mut target,
            FaultInjectionInfo {
                new_value: true,
                bit_value: word,
                fault_on_register: self.on_register,
                ..Default::default()
            },
        )
    }
}

/// BIT-FLIP, NEW VALUE and SF. These are the only modes that can target
/// an address decoder or a cell directly (time-triggered faults), so the
/// destination is explicit.
pub(crate) fn apply_simple(
    ctx: &mut CellCtx<'_>,
    fault: &Fault,
    to: ApplyTo<'_>,
    flip: bool,
    stuck: bool,
) -> Result<u32, GuestMemoryError> {
    let mask = fault.params.mask;
    let set_bit = fault.params.set_bit;

    if !flip && !stuck {
        // NEW VALUE: the mask field is the literal replacement word.
        match to {
            ApplyTo::Address(addr) => {
                do_inject(
                    ctx.bus,
                    ctx.guard,
                    addr,
                    FaultInjectionInfo {
                        new_value: true,
                        bit_value: mask,
                        fault_on_address: true,
                        ..Default::default()
                    },
                )?;
            }
            ApplyTo::Cell(addr) => ctx.store(addr, mask)?,
        }
        return Ok(1);
    }

    // BIT-FLIP and SF walk the set bits of the mask lowest-first and
    // apply one injection per bit.
    let mut applied = 0;
    match to {
        ApplyTo::Address(addr) => {
            let mut remaining = mask;
            while remaining != 0 {
                let bit = remaining & remaining.wrapping_neg();
                remaining ^= bit;
                do_inject(
                    ctx.bus,
                    ctx.guard,
                    addr,
                    FaultInjectionInfo {
                        bit_flip: flip,
                        fault_on_address: true,
                        injected_bit: bit.trailing_zeros(),
                        bit_value: (set_bit & bit != 0) as u32,
                        ..Default::default()
                    },
                )?;
                applied += 1;
            }
        }
        ApplyTo::Cell(cell) => {
            let mut remaining = mask;
            while remaining != 0 {
                let bit = remaining & remaining.wrapping_neg();
                remaining ^= bit;
                let mut target = cell;
                do_inject(
                    ctx.bus,
                    ctx.guard,
                    &mut target,
                    FaultInjectionInfo {
                        bit_flip: flip,
                        fault_on_register: ctx.on_register,
                        injected_bit: bit.trailing_zeros(),
                        bit_value: (set_bit & bit != 0) as u32,
                        ..Default::default()
                    },
                )?;
                applied += 1;
            }
        }
    }
    Ok(applied)
}

/// BIT-FLIP, NEW VALUE and SF on a word already in flight: no bus
/// involved, the caller's copy is mutated directly.
pub(crate) fn apply_simple_value(fault: &Fault, value: &mut u32, flip: bool, stuck: bool) -> u32 {
    let mask = fault.params.mask;
    if !flip && !stuck {
        *value = mask;
        return 1;
    }
    let mut applied = 0;
    let mut remaining = mask;
    while remaining != 0 {
        let bit = remaining & remaining.wrapping_neg();
        remaining ^= bit;
        if flip {
            *value ^= bit;
        } else if fault.params.set_bit & bit != 0 {
            *value |= bit;
        } else {
            *value &= !bit;
        }
        applied += 1;
    }
    applied
}

/// TFx: the cell refuses the forbidden transition on a write.
pub(crate) fn transition(
    ctx: &mut CellCtx<'_>,
    fault: &Fault,
    one: bool,
    addr: u64,
    value: &mut u32,
    access: AccessType,
) -> Result<u32, GuestMemoryError> {
    if access == AccessType::Read {
        return Ok(0);
    }
    let old = ctx.read(addr)?;
    let faulty = if one { old & *value } else { old | *value };
    *value = combine(faulty, fault.params.mask, *value);
    Ok(1)
}

/// RDFx: the read returns the corrupted word and leaves it in the cell.
pub(crate) fn read_disturb(
    ctx: &mut CellCtx<'_>,
    fault: &Fault,
    one: bool,
    addr: u64,
    value: &mut u32,
    access: AccessType,
) -> Result<u32, GuestMemoryError> {
    if access == AccessType::Write {
        return Ok(0);
    }
    let faulty = if one { 0 } else { u32::MAX };
    let corrupted = combine(faulty, fault.params.mask, *value);
    *value = corrupted;
    ctx.store(addr, corrupted)?;
    Ok(1)
}

/// WDFx: the non-transition write at level x disturbs the cell.
pub(crate) fn write_disturb(
    ctx: &mut CellCtx<'_>,
    fault: &Fault,
    one: bool,
    addr: u64,
    value: &mut u32,
    access: AccessType,
) -> Result<u32, GuestMemoryError> {
    if access == AccessType::Read {
        return Ok(0);
    }
    let old = ctx.read(addr)?;
    let faulty = if one { !old & *value } else { !(old & !*value) };
    *value = combine(faulty, fault.params.mask, *value);
    Ok(1)
}

/// IRFx: the read lies, the cell stays clean.
pub(crate) fn incorrect_read(
    fault: &Fault,
    one: bool,
    value: &mut u32,
    access: AccessType,
) -> u32 {
    if access == AccessType::Write {
        return 0;
    }
    let faulty = if one { 0 } else { u32::MAX };
    *value = combine(faulty, fault.params.mask, *value);
    1
}

/// DRDFx: the read is truthful but the corrupted word is left behind.
pub(crate) fn deceptive_read(
    ctx: &mut CellCtx<'_>,
    fault: &Fault,
    one: bool,
    addr: u64,
    value: &u32,
    access: AccessType,
) -> Result<u32, GuestMemoryError> {
    if access == AccessType::Write {
        return Ok(0);
    }
    let faulty = if one { 0 } else { u32::MAX };
    let corrupted = combine(faulty, fault.params.mask, *value);
    ctx.store(addr, corrupted)?;
    Ok(1)
}

/// Which of the three read-path behaviors a dynamic mode has.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DynKind {
    ReadDisturb,
    IncorrectRead,
    DeceptiveRead,
}

/// Dynamic RDF/IRF/DRDF: a bit is disturbed only when the last recorded
/// operation on it matches the mode's tag; every other bit reads true.
#[allow(clippy::too_many_arguments)]
pub(crate) fn dynamic_read(
    ctx: &mut CellCtx<'_>,
    fault: &Fault,
    kind: DynKind,
    op: CellOp,
    history: &CellOpHistory,
    addr: u64,
    value: &mut u32,
    access: AccessType,
) -> Result<u32, GuestMemoryError> {
    if access == AccessType::Write {
        return Ok(0);
    }
    let mut faulty = 0u32;
    for bit_index in 0..MEMORY_WIDTH as u32 {
        let bit = 1u32 << bit_index;
        if history.get(fault.id, bit_index) == Some(op) {
            if op.disturbs_high() {
                faulty |= bit;
            }
        } else {
            faulty |= *value & bit;
        }
    }
    let corrupted = combine(faulty, fault.params.mask, *value);
    match kind {
        DynKind::ReadDisturb => {
            *value = corrupted;
            ctx.store(addr, corrupted)?;
        }
        DynKind::IncorrectRead => *value = corrupted,
        DynKind::DeceptiveRead => ctx.store(addr, corrupted)?,
    }
    Ok(1)
}

/// Iterate the set bits of `mask` lowest-first, skipping the positions
/// flagged as aggressor bits for intra-cell coupling.
fn victim_bits(mask: u32, skip: u32) -> impl Iterator<Item = u32> {
    std::iter::successors(Some(mask & !skip), |m| Some(m & (m.wrapping_sub(1))))
        .take_while(|m| *m != 0)
        .map(|m| m & m.wrapping_neg())
}

/// CFST: the aggressor's level forces victim bits. Works from both
/// directions: accessed victim corrupts the in-flight word, accessed
/// aggressor rewrites the victim cell behind the bus.
pub(crate) fn coupling_state(
    ctx: &mut CellCtx<'_>,
    fault: &Fault,
    aggressor_one: bool,
    drive_high: bool,
    accessed_is_victim: bool,
    value: &mut u32,
) -> Result<u32, GuestMemoryError> {
    let mask = fault.params.mask;
    let set_bit = fault.params.set_bit;
    let cf_address = fault.params.cf_address as u64;
    let intra = fault.params.address == fault.params.cf_address;

    let aggressor = if accessed_is_victim {
        ctx.read(fault.params.address as u64)?
    } else {
        *value
    };
    let victim = ctx.read(cf_address)?;

    let faulty = if intra {
        let armed = if aggressor_one {
            set_bit & aggressor != 0
        } else {
            set_bit & aggressor == 0
        };
        if !armed {
            return Ok(0);
        }
        let mut faulty = aggressor;
        for bit in victim_bits(mask, set_bit) {
            if drive_high {
                if aggressor & bit == 0 {
                    faulty |= bit;
                }
            } else if aggressor & bit != 0 {
                faulty &= !bit;
            }
        }
        faulty
    } else {
        match (aggressor_one, drive_high) {
            (false, true) => !(aggressor & !victim),
            (false, false) => aggressor & victim,
            (true, true) => aggressor | victim,
            (true, false) => !aggressor & victim,
        }
    };

    let corrupted = combine(faulty, mask, victim);
    if accessed_is_victim {
        *value = corrupted;
    } else {
        ctx.store(cf_address, corrupted)?;
    }
    Ok(1)
}

/// CFDS: an operation on the aggressor disturbs the victim. The accessed
/// cell is the aggressor; transition tags only fire on writes.
#[allow(clippy::too_many_arguments)]
pub(crate) fn coupling_disturb(
    ctx: &mut CellCtx<'_>,
    fault: &Fault,
    before_one: bool,
    after_one: bool,
    drive_high: bool,
    addr: u64,
    value: &mut u32,
    access: AccessType,
) -> Result<u32, GuestMemoryError> {
    if before_one != after_one && access == AccessType::Read {
        return Ok(0);
    }
    let mask = fault.params.mask;
    let set_bit = fault.params.set_bit;
    let cf_address = fault.params.cf_address as u64;
    let intra = fault.params.address == fault.params.cf_address;

    let aggr_before = ctx.read(addr)?;
    let aggr_after = *value;
    let victim = ctx.read(cf_address)?;

    let faulty = if intra {
        let armed = match (before_one, after_one) {
            (false, false) => set_bit & (aggr_before | aggr_after) == 0,
            (true, true) => set_bit & !(aggr_before & aggr_after) == 0,
            (false, true) => set_bit & !(!aggr_before & aggr_after) == 0,
            (true, false) => set_bit & !(aggr_before & !aggr_after) == 0,
        };
        if !armed {
            return Ok(0);
        }
        let mut faulty = victim;
        for bit in victim_bits(mask, set_bit) {
            if drive_high {
                if victim & bit == 0 {
                    faulty |= bit;
                }
            } else if victim & bit != 0 {
                faulty &= !bit;
            }
        }
        faulty
    } else {
        let condition = match (before_one, after_one) {
            (false, false) => !aggr_before & !aggr_after,
            (true, true) => aggr_before & aggr_after,
            (false, true) => !aggr_before & aggr_after,
            (true, false) => aggr_before & !aggr_after,
        };
        if drive_high {
            (condition & !victim) | victim
        } else {
            !(condition & victim) & victim
        }
    };

    let corrupted = combine(faulty, mask, victim);
    ctx.store(cf_address, corrupted)?;
    // Intra-cell: the accessed word and the victim cell are the same
    // cell, so the in-flight value picks up the corruption too.
    if intra {
        *value = corrupted;
        return Ok(2);
    }
    Ok(1)
}

/// CFTR: the victim's own transition fails while the aggressor holds the
/// tag level. Accessed cell is the victim; writes only.
pub(crate) fn coupling_transition(
    ctx: &mut CellCtx<'_>,
    fault: &Fault,
    aggressor_one: bool,
    to_one: bool,
    value: &mut u32,
    access: AccessType,
) -> Result<u32, GuestMemoryError> {
    if access == AccessType::Read {
        return Ok(0);
    }
    let mask = fault.params.mask;
    let set_bit = fault.params.set_bit;
    let intra = fault.params.address == fault.params.cf_address;

    let aggressor = ctx.read(fault.params.address as u64)?;
    let victim_before = ctx.read(fault.params.cf_address as u64)?;
    let victim_write = *value;

    let faulty = if intra {
        let armed = if to_one {
            set_bit & !(!victim_before & victim_write) == 0
        } else {
            set_bit & !(victim_before & !victim_write) == 0
        };
        if !armed {
            return Ok(0);
        }
        let mut faulty = victim_write;
        for bit in victim_bits(mask, set_bit) {
            let level = aggressor & bit != 0;
            if level == aggressor_one {
                if to_one {
                    faulty &= !bit;
                } else {
                    faulty |= bit;
                }
            }
        }
        faulty
    } else {
        let aggressor_match = if aggressor_one { aggressor } else { !aggressor };
        if to_one {
            !(aggressor_match & !victim_before & victim_write) & victim_write
        } else {
            (aggressor_match & victim_before & !victim_write) | victim_write
        }
    };

    *value = combine(faulty, mask, victim_write);
    Ok(1)
}

/// CFWD: writing the victim disturbs it while the aggressor holds the
/// tag level. Accessed cell is the victim; writes only.
pub(crate) fn coupling_write_disturb(
    ctx: &mut CellCtx<'_>,
    fault: &Fault,
    aggressor_one: bool,
    drive_high: bool,
    value: &mut u32,
    access: AccessType,
) -> Result<u32, GuestMemoryError> {
    if access == AccessType::Read {
        return Ok(0);
    }
    let mask = fault.params.mask;
    let set_bit = fault.params.set_bit;
    let intra = fault.params.address == fault.params.cf_address;

    let aggressor = ctx.read(fault.params.address as u64)?;
    let victim_before = ctx.read(fault.params.cf_address as u64)?;
    let victim_write = *value;

    let faulty = if intra {
        let armed = if drive_high {
            set_bit & (victim_before | victim_write) == 0
        } else {
            set_bit & !(victim_before & victim_write) == 0
        };
        if !armed {
            return Ok(0);
        }
        let mut faulty = victim_write;
        for bit in victim_bits(mask, set_bit) {
            let level = aggressor & bit != 0;
            if level == aggressor_one {
                if drive_high {
                    faulty |= bit;
                } else {
                    faulty &= !bit;
                }
            }
        }
        faulty
    } else {
        let aggressor_match = if aggressor_one { aggressor } else { !aggressor };
        if drive_high {
            (aggressor_match & !victim_before & !victim_write) | victim_write
        } else {
            !(aggressor_match & victim_before & victim_write) & victim_write
        }
    };

    *value = combine(faulty, mask, victim_write);
    Ok(1)
}

/// Shared shape of CFRD/CFIR/CFDR: reading the victim disturbs it while
/// the aggressor holds the tag level. They differ only in where the
/// corrupted word ends up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReadCouplingKind {
    /// CFRD: corrupt value returned and stored.
    Disturb,
    /// CFIR: corrupt value returned, cell clean.
    Incorrect,
    /// CFDR: correct value returned, cell corrupted.
    Deceptive,
}

pub(crate) fn coupling_read(
    ctx: &mut CellCtx<'_>,
    fault: &Fault,
    kind: ReadCouplingKind,
    aggressor_one: bool,
    drive_high: bool,
    value: &mut u32,
    access: AccessType,
) -> Result<u32, GuestMemoryError> {
    if access == AccessType::Write {
        return Ok(0);
    }
    let mask = fault.params.mask;
    let set_bit = fault.params.set_bit;
    let cf_address = fault.params.cf_address as u64;
    let intra = fault.params.address == fault.params.cf_address;

    let aggressor = ctx.read(fault.params.address as u64)?;
    let victim = *value;

    let faulty = if intra {
        let armed = if aggressor_one {
            set_bit & !victim == 0
        } else {
            set_bit & victim == 0
        };
        if !armed {
            return Ok(0);
        }
        let mut faulty = victim;
        for bit in victim_bits(mask, set_bit) {
            if drive_high {
                if aggressor & bit == 0 {
                    faulty |= bit;
                }
            } else if aggressor & bit != 0 {
                faulty &= !bit;
            }
        }
        faulty
    } else {
        let aggressor_match = if aggressor_one { aggressor } else { !aggressor };
        if drive_high {
            (aggressor_match & !victim) | victim
        } else {
            !(aggressor_match & victim) & victim
        }
    };

    let corrupted = combine(faulty, mask, victim);
    match kind {
        ReadCouplingKind::Disturb => {
            *value = corrupted;
            ctx.store(cf_address, corrupted)?;
        }
        ReadCouplingKind::Incorrect => *value = corrupted,
        ReadCouplingKind::Deceptive => ctx.store(cf_address, corrupted)?,
    }
    Ok(1)
}
