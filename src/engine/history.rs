use super::MEMORY_WIDTH;

/// The last operation observed on one bit of a faulty cell: the bit held
/// the first value and was written with the second. Dynamic fault modes
/// fire only when the recorded operation matches their tag digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellOp {
    ZeroWroteZero,
    ZeroWroteOne,
    OneWroteZero,
    OneWroteOne,
}

impl CellOp {
    pub fn from_digits(pre_one: bool, wrote_one: bool) -> CellOp {
        match (pre_one, wrote_one) {
            (false, false) => CellOp::ZeroWroteZero,
            (false, true) => CellOp::ZeroWroteOne,
            (true, false) => CellOp::OneWroteZero,
            (true, true) => CellOp::OneWroteOne,
        }
    }

    /// Direction a dynamic fault drives the bit: an operation that wrote 0
    /// is disturbed up to 1, one that wrote 1 is disturbed down to 0.
    pub fn disturbs_high(self) -> bool {
        matches!(self, CellOp::ZeroWroteZero | CellOp::OneWroteZero)
    }
}

/// Per-fault-id, per-bit record of the most recent cell operation.
/// Rows are indexed `id - 1` and sized to the catalog's maximum id, so a
/// reload with a different catalog reallocates the table.
#[derive(Debug, Default)]
pub struct CellOpHistory {
    ops: Vec<[Option<CellOp>; MEMORY_WIDTH]>,
}

impl CellOpHistory {
    /// Drop everything and size the table for ids `1..=max_id`.
    pub fn reset(&mut self, max_id: i32) {
        self.ops.clear();
        self.ops
            .resize(max_id.max(0) as usize, [None; MEMORY_WIDTH]);
    }

    pub fn get(&self, fault_id: i32, bit: u32) -> Option<CellOp> {
        let row = self.ops.get(fault_id.checked_sub(1)? as usize)?;
        *row.get(bit as usize)?
    }

    /// Record the operation a guest write performs on every masked bit.
    pub fn record_write(&mut self, fault_id: i32, mask: u32, old_word: u32, new_word: u32) {
        if fault_id < 1 {
            return;
        }
        let Some(row) = self.ops.get_mut(fault_id as usize - 1) else {
            return;
        };
        let mut remaining = mask;
        while remaining != 0 {
            let bit_mask = remaining & remaining.wrapping_neg();
            remaining ^= bit_mask;
            let bit = bit_mask.trailing_zeros();
            row[bit as usize] = Some(CellOp::from_digits(
                old_word & bit_mask != 0,
                new_word & bit_mask != 0,
            ));
        }
    }

    /// True when no operation has been recorded anywhere. Used by tests
    /// and the monitor to confirm a reload started clean.
    pub fn is_unset(&self) -> bool {
        self.ops
            .iter()
            .all(|row| row.iter().all(|op| op.is_none()))
    }
}
