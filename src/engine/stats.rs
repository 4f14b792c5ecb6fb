/// Accounting category for one applied mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatClass {
    RamTransient,
    RamPermanent,
    RegisterTransient,
    RegisterPermanent,
    CpuTransient,
    CpuPermanent,
}

/// Counters for the monitor. Purely observational: nothing in the engine
/// reads them back to decide behavior. Reset atomically on catalog load.
#[derive(Debug, Default)]
pub struct InjectionStats {
    ram_transient: u64,
    ram_permanent: u64,
    register_transient: u64,
    register_permanent: u64,
    cpu_transient: u64,
    cpu_permanent: u64,
    per_fault: Vec<u64>,
}

impl InjectionStats {
    /// Zero every counter and size the per-fault table for `max_id` ids.
    pub fn reset(&mut self, max_id: i32) {
        *self = InjectionStats {
            per_fault: vec![0; max_id.max(0) as usize],
            ..InjectionStats::default()
        };
    }

    pub(crate) fn record(&mut self, fault_id: i32, class: StatClass) {
        match class {
            StatClass::RamTransient => self.ram_transient += 1,
            StatClass::RamPermanent => self.ram_permanent += 1,
            StatClass::RegisterTransient => self.register_transient += 1,
            StatClass::RegisterPermanent => self.register_permanent += 1,
            StatClass::CpuTransient => self.cpu_transient += 1,
            StatClass::CpuPermanent => self.cpu_permanent += 1,
        }
        if fault_id >= 1 {
            if let Some(slot) = self.per_fault.get_mut(fault_id as usize - 1) {
                *slot += 1;
            }
        }
    }

    /// Charge several applications from one event in one go.
    pub(crate) fn record_n(&mut self, fault_id: i32, class: StatClass, count: u32) {
        for _ in 0..count {
            self.record(fault_id, class);
        }
    }

    pub fn total(&self) -> u64 {
        self.ram_transient
            + self.ram_permanent
            + self.register_transient
            + self.register_permanent
            + self.cpu_transient
            + self.cpu_permanent
    }

    pub fn ram(&self) -> (u64, u64) {
        (self.ram_transient, self.ram_permanent)
    }

    pub fn register(&self) -> (u64, u64) {
        (self.register_transient, self.register_permanent)
    }

    pub fn cpu(&self) -> (u64, u64) {
        (self.cpu_transient, self.cpu_permanent)
    }

    /// Applications charged to one fault id, 0 for unknown ids.
    pub fn applied(&self, fault_id: i32) -> u64 {
        if fault_id < 1 {
            return 0;
        }
        self.per_fault
            .get(fault_id as usize - 1)
            .copied()
            .unwrap_or(0)
    }
}
