/// Host capability trait and access/site enums
pub mod bus;
/// Fault model, catalog XML parsing and validation
pub mod catalog;
/// Per-bit record of previous cell operations, feeds the dynamic modes
pub mod history;
/// Lazy per-access log files
pub mod profiler;
/// Injection counters for the monitor
pub mod stats;
/// Permanent XOR patterns and the refresh pass
pub mod stuckat;

mod injector;
mod modes;
mod trigger;

#[cfg(test)]
/// Tests for the whole dispatch path
mod tests;

use std::path::{Path, PathBuf};

pub use bus::{AccessType, GuestBus, GuestMemoryError, InjectionSite};
pub use catalog::{CatalogError, Fault, FaultCatalog, FaultMode, LoadReport};
pub use injector::FaultInjectionInfo;
pub use stats::InjectionStats;

use catalog::{Component, CouplingMode, Target, Trigger};
use history::CellOpHistory;
use modes::{ApplyTo, CellCtx, DynKind, ReadCouplingKind};
use profiler::Profiler;
use stats::StatClass;
use stuckat::StuckAtTable;

/// Width of one corruptible cell in bits. Masks, set_bit selectors and
/// the cell-operation history are all sized to this.
pub const MEMORY_WIDTH: usize = 32;
/// Bytes moved per cell access.
pub const WORD_BYTES: usize = MEMORY_WIDTH / 8;

/// The fault-injection engine. The host owns one of these and calls
/// [`Engine::on_access`] from its memory, register and instruction hooks;
/// everything the engine touches in the guest goes through the
/// [`GuestBus`] the host passes in.
#[derive(Default)]
pub struct Engine {
    catalog: FaultCatalog,
    mem_history: CellOpHistory,
    reg_history: CellOpHistory,
    stuckat: StuckAtTable,
    stats: InjectionStats,
    profiler: Profiler,
    /// Virtual time at catalog load; lazily captured on the first event
    /// after a reload so loading does not need a CPU.
    clock_base: Option<i64>,
    /// Cell currently being rewritten by the injector. A hook call for
    /// this address is the engine's own write coming back around and
    /// returns untouched.
    address_in_use: Option<u64>,
    exit_request: bool,
    last_catalog: Option<PathBuf>,
    auto_test_armed: bool,
}

impl Engine {
    pub fn new() -> Engine {
        Engine::default()
    }

    /// Load a catalog file, replacing the previous experiment wholesale.
    /// Returns what was loaded plus validation findings; parse failures
    /// leave the previous catalog in place.
    pub fn reload(&mut self, path: &Path) -> Result<LoadReport, CatalogError> {
        let (catalog, report) = FaultCatalog::load(path)?;
        self.install(catalog, &report);
        self.last_catalog = Some(path.to_path_buf());
        Ok(report)
    }

    /// As [`Engine::reload`], from XML already in memory.
    pub fn reload_from_str(&mut self, xml: &str) -> Result<LoadReport, CatalogError> {
        let (catalog, report) = FaultCatalog::from_str(xml)?;
        self.install(catalog, &report);
        Ok(report)
    }

    /// Monitor-compatible wrapper: true on success, diagnostics go to the
    /// log.
    pub fn load_catalog(&mut self, path: &Path) -> bool {
        match self.reload(path) {
            Ok(report) => {
                tracing::info!(
                    loaded = report.loaded,
                    skipped = report.skipped,
                    "fault catalog loaded"
                );
                true
            }
            Err(err) => {
                tracing::error!(%err, "fault catalog not loaded");
                false
            }
        }
    }

    fn install(&mut self, catalog: FaultCatalog, report: &LoadReport) {
        for diag in &report.diagnostics {
            tracing::warn!("{diag}");
        }
        self.catalog = catalog;
        let max_id = self.catalog.max_id();
        self.mem_history.reset(max_id);
        self.reg_history.reset(max_id);
        self.stats.reset(max_id);
        self.stuckat.clear();
        self.clock_base = None;
        self.address_in_use = None;
        self.profiler
            .set_profile_memory(self.catalog.wants_address_profile());
    }

    pub fn catalog(&self) -> &FaultCatalog {
        &self.catalog
    }

    pub fn stats(&self) -> &InjectionStats {
        &self.stats
    }

    pub fn profiler_mut(&mut self) -> &mut Profiler {
        &mut self.profiler
    }

    /// Ask the multi-CPU walk in [`Engine::on_access_all`] to stop.
    pub fn request_exit(&mut self) {
        self.exit_request = true;
    }

    pub fn exit_requested(&self) -> bool {
        self.exit_request
    }

    // --- stuck-at table -------------------------------------------------

    pub fn stuckat_insert(&mut self, vaddr: u64, pattern: &[u8]) {
        self.stuckat.insert(vaddr, pattern);
    }

    pub fn stuckat_remove(&mut self, vaddr: u64) -> bool {
        self.stuckat.remove(vaddr)
    }

    pub fn stuckat_clear(&mut self) {
        self.stuckat.clear();
    }

    pub fn stuckat_len(&self) -> usize {
        self.stuckat.len()
    }

    /// Re-assert every permanent pattern. The host calls this on its own
    /// schedule, typically once per CPU step.
    pub fn stuckat_refresh(&mut self, bus: &mut dyn GuestBus) {
        self.stuckat.refresh(bus);
    }

    /// Flush translations for every patched page, so re-injected values
    /// become visible after a reload.
    pub fn stuckat_flush_pages(&mut self, bus: &mut dyn GuestBus) {
        self.stuckat.flush_pages(bus);
    }

    /// Hook for self-test hosts. The first call re-arms the current
    /// catalog; experiment termination stays under host control, so
    /// nothing else happens here.
    pub fn start_automatic_test_process(&mut self) {
        if self.auto_test_armed {
            return;
        }
        self.auto_test_armed = true;
        if let Some(path) = self.last_catalog.clone() {
            self.load_catalog(&path);
        }
    }

    // --- dispatch -------------------------------------------------------

    /// Single entry point for every emulator hook.
    ///
    /// `addr` is the accessed guest physical address (or register index,
    /// or PC for the instruction site) and may be rewritten by
    /// address-decoder faults; `value` is the in-flight word and may be
    /// rewritten by content faults. This call never fails: guest-memory
    /// trouble degrades to skipping the affected fault.
    pub fn on_access(
        &mut self,
        bus: &mut dyn GuestBus,
        addr: &mut u64,
        value: &mut u32,
        site: InjectionSite,
        access: AccessType,
    ) {
        match site {
            InjectionSite::MemAddr | InjectionSite::MemContent | InjectionSite::Insn => {
                self.profiler.log_memory(*addr, *value, access)
            }
            InjectionSite::RegAddr | InjectionSite::RegContent => {
                self.profiler.log_register(*addr, *value, access)
            }
            InjectionSite::Time => {}
        }

        if self.address_in_use == Some(*addr) {
            tracing::trace!(addr = *addr, "reentered on cell under injection, ignored");
            return;
        }

        let base = *self.clock_base.get_or_insert_with(|| bus.clock_ns());
        let now = bus.clock_ns() - base;

        match site {
            InjectionSite::MemAddr => self.address_access(bus, addr, now, false),
            InjectionSite::MemContent => self.content_access(bus, addr, value, access, false, now),
            InjectionSite::RegAddr => self.address_access(bus, addr, now, true),
            InjectionSite::RegContent => self.content_access(bus, addr, value, access, true, now),
            InjectionSite::Insn => self.insn_access(*addr, value, now),
            InjectionSite::Time => self.time_tick(bus, now),
        }

        self.address_in_use = None;
    }

    /// Content access with no bound CPU: walk the CPUs in the order the
    /// host hands them over, stopping early once an exit was requested.
    pub fn on_access_all<'a, I>(
        &mut self,
        cpus: I,
        addr: &mut u64,
        value: &mut u32,
        site: InjectionSite,
        access: AccessType,
    ) where
        I: IntoIterator<Item = &'a mut dyn GuestBus>,
    {
        for bus in cpus {
            if self.exit_request {
                tracing::debug!("exit requested, cpu walk stopped");
                break;
            }
            self.on_access(bus, addr, value, site, access);
        }
    }

    /// Address-decoder faults: rewrite the in-flight address before the
    /// access resolves. Memory and register flavors share everything but
    /// the matched component.
    fn address_access(
        &mut self,
        bus: &mut dyn GuestBus,
        addr: &mut u64,
        now: i64,
        on_register: bool,
    ) {
        if !on_register {
            bus.tlb_flush_page(*addr);
        }
        let wanted = if on_register {
            Component::Register
        } else {
            Component::Ram
        };
        for i in 0..self.catalog.len() {
            let fault = &mut self.catalog.faults_mut()[i];
            // Later faults compare against the possibly already hijacked
            // address, in catalog order.
            if fault.trigger != Trigger::Access
                || fault.component != wanted
                || fault.target != Target::AddressDecoder
                || fault.params.address != *addr as i64
            {
                continue;
            }
            let fired = trigger::fires(fault, now, None);
            fault.is_active = fired;
            if !fired {
                continue;
            }
            let fault: &Fault = fault;
            let (flip, stuck) = match fault.mode {
                FaultMode::BitFlip => (true, false),
                FaultMode::NewValue => (false, false),
                FaultMode::StuckAt => (false, true),
                _ => continue,
            };
            let mut ctx = CellCtx {
                bus: &mut *bus,
                guard: &mut self.address_in_use,
                on_register,
            };
            match modes::apply_simple(&mut ctx, fault, ApplyTo::Address(addr), flip, stuck) {
                Ok(applied) if applied > 0 => {
                    tracing::debug!(id = fault.id, addr = *addr, "address decoder fault applied");
                    self.stats
                        .record_n(fault.id, class_for(on_register, fault), applied);
                }
                Ok(_) => {}
                Err(_) => tracing::debug!(id = fault.id, "cell unreadable, fault skipped"),
            }
        }
    }

    /// The main path: faults on the content of memory cells or registers.
    fn content_access(
        &mut self,
        bus: &mut dyn GuestBus,
        addr: &mut u64,
        value: &mut u32,
        access: AccessType,
        on_register: bool,
        now: i64,
    ) {
        let positions: Vec<usize> = self.catalog.positions_at(*addr).to_vec();
        for i in positions {
            let fault = &mut self.catalog.faults_mut()[i];
            if fault.trigger != Trigger::Access {
                continue;
            }

            // Condition-flag faults ride the register-content hook but
            // select by flag mode rather than by cell address.
            if on_register
                && fault.component == Component::Cpu
                && fault.target == Target::ConditionFlags
            {
                let FaultMode::ConditionFlag(flag) = &fault.mode else {
                    continue;
                };
                let flag = *flag;
                let fired = trigger::fires(fault, now, None);
                fault.is_active = fired;
                if !fired {
                    continue;
                }
                let bit = 1u32 << flag.bit();
                if fault.params.set_bit & 1 != 0 {
                    *value |= bit;
                } else {
                    *value &= !bit;
                }
                let id = fault.id;
                let class = class_for_component(Component::Cpu, fault.is_permanent());
                self.stats.record_n(id, class, 1);
                continue;
            }

            let component_ok = if on_register {
                fault.component == Component::Register && fault.target == Target::RegisterCell
            } else {
                fault.component == Component::Ram
                    && matches!(fault.target, Target::MemoryCell | Target::RwLogic)
            };
            if !component_ok {
                continue;
            }

            if !on_register {
                bus.tlb_flush_page(*addr);
            }

            // Every write on a faulty cell is recorded, fired or not; the
            // dynamic modes consult this on later reads.
            let history = if on_register {
                &mut self.reg_history
            } else {
                &mut self.mem_history
            };
            if access == AccessType::Write {
                if let Ok(old) = bus::read_cell(bus, on_register, *addr) {
                    history.record_write(fault.id, fault.params.mask, old, *value);
                }
            }

            let fired = trigger::fires(fault, now, None);
            fault.is_active = fired;
            if !fired {
                continue;
            }

            if !fault.mode.is_coupling() && fault.params.cf_address == *addr as i64 {
                tracing::error!(
                    id = fault.id,
                    "CF address defined without CF-mode, fault skipped"
                );
                continue;
            }

            let fault: &Fault = fault;
            let history: &CellOpHistory = history;
            let mut ctx = CellCtx {
                bus: &mut *bus,
                guard: &mut self.address_in_use,
                on_register,
            };

            let applied = match &fault.mode {
                FaultMode::BitFlip => Ok(modes::apply_simple_value(fault, value, true, false)),
                FaultMode::NewValue => Ok(modes::apply_simple_value(fault, value, false, false)),
                FaultMode::StuckAt => Ok(modes::apply_simple_value(fault, value, false, true)),
                FaultMode::Transition { one } => {
                    modes::transition(&mut ctx, fault, *one, *addr, value, access)
                }
                FaultMode::ReadDisturb { one } => {
                    modes::read_disturb(&mut ctx, fault, *one, *addr, value, access)
                }
                FaultMode::WriteDisturb { one } => {
                    modes::write_disturb(&mut ctx, fault, *one, *addr, value, access)
                }
                FaultMode::IncorrectRead { one } => {
                    Ok(modes::incorrect_read(fault, *one, value, access))
                }
                FaultMode::DeceptiveRead { one } => {
                    modes::deceptive_read(&mut ctx, fault, *one, *addr, value, access)
                }
                FaultMode::DynReadDisturb(op) => modes::dynamic_read(
                    &mut ctx,
                    fault,
                    DynKind::ReadDisturb,
                    *op,
                    history,
                    *addr,
                    value,
                    access,
                ),
                FaultMode::DynIncorrectRead(op) => modes::dynamic_read(
                    &mut ctx,
                    fault,
                    DynKind::IncorrectRead,
                    *op,
                    history,
                    *addr,
                    value,
                    access,
                ),
                FaultMode::DynDeceptiveRead(op) => modes::dynamic_read(
                    &mut ctx,
                    fault,
                    DynKind::DeceptiveRead,
                    *op,
                    history,
                    *addr,
                    value,
                    access,
                ),
                FaultMode::Coupling(coupling) => {
                    let inter = fault.params.address != fault.params.cf_address;
                    let on_victim_cell = fault.params.cf_address == *addr as i64;
                    let on_aggressor_cell = fault.params.address == *addr as i64;
                    match *coupling {
                        CouplingMode::State {
                            aggressor_one,
                            drive_high,
                        } => modes::coupling_state(
                            &mut ctx,
                            fault,
                            aggressor_one,
                            drive_high,
                            on_victim_cell,
                            value,
                        ),
                        CouplingMode::Disturb {
                            before_one,
                            after_one,
                            drive_high,
                            ..
                        } => {
                            // disturb is keyed on the aggressor cell
                            if on_victim_cell && inter {
                                Ok(0)
                            } else {
                                modes::coupling_disturb(
                                    &mut ctx, fault, before_one, after_one, drive_high, *addr,
                                    value, access,
                                )
                            }
                        }
                        CouplingMode::Transition {
                            aggressor_one,
                            to_one,
                        } => {
                            if on_aggressor_cell && inter {
                                Ok(0)
                            } else {
                                modes::coupling_transition(
                                    &mut ctx,
                                    fault,
                                    aggressor_one,
                                    to_one,
                                    value,
                                    access,
                                )
                            }
                        }
                        CouplingMode::WriteDisturb {
                            aggressor_one,
                            drive_high,
                        } => {
                            if on_aggressor_cell && inter {
                                Ok(0)
                            } else {
                                modes::coupling_write_disturb(
                                    &mut ctx,
                                    fault,
                                    aggressor_one,
                                    drive_high,
                                    value,
                                    access,
                                )
                            }
                        }
                        CouplingMode::ReadDisturb {
                            aggressor_one,
                            drive_high,
                        } => {
                            if on_aggressor_cell && inter {
                                Ok(0)
                            } else {
                                modes::coupling_read(
                                    &mut ctx,
                                    fault,
                                    ReadCouplingKind::Disturb,
                                    aggressor_one,
                                    drive_high,
                                    value,
                                    access,
                                )
                            }
                        }
                        CouplingMode::IncorrectRead {
                            aggressor_one,
                            drive_high,
                        } => {
                            if on_aggressor_cell && inter {
                                Ok(0)
                            } else {
                                modes::coupling_read(
                                    &mut ctx,
                                    fault,
                                    ReadCouplingKind::Incorrect,
                                    aggressor_one,
                                    drive_high,
                                    value,
                                    access,
                                )
                            }
                        }
                        CouplingMode::DeceptiveRead {
                            aggressor_one,
                            drive_high,
                        } => {
                            if on_aggressor_cell && inter {
                                Ok(0)
                            } else {
                                modes::coupling_read(
                                    &mut ctx,
                                    fault,
                                    ReadCouplingKind::Deceptive,
                                    aggressor_one,
                                    drive_high,
                                    value,
                                    access,
                                )
                            }
                        }
                    }
                }
                FaultMode::ConditionFlag(_) | FaultMode::Unrecognized(_) => Ok(0),
            };

            match applied {
                Ok(applied) => {
                    if applied > 0 {
                        tracing::debug!(
                            id = fault.id,
                            addr = *addr,
                            value = *value,
                            "fault applied"
                        );
                        let id = fault.id;
                        let class = class_for(on_register, fault);
                        let record_pattern = !on_register
                            && fault.is_permanent()
                            && fault.mode == FaultMode::BitFlip;
                        let mask = fault.params.mask;
                        self.stats.record_n(id, class, applied);
                        // A permanent flip must outlive guest rewrites of
                        // the cell; the refresh pass re-asserts it from
                        // this pattern.
                        if record_pattern {
                            self.stuckat.insert(*addr, &mask.to_le_bytes());
                        }
                    }
                }
                Err(_) => {
                    tracing::debug!(id = fault.id, "cell unreadable, fault skipped");
                }
            }
        }
    }

    /// Faults on the fetched instruction word: decoder and execution
    /// faults, including PC-triggered ones.
    fn insn_access(&mut self, pc: u64, value: &mut u32, now: i64) {
        for i in 0..self.catalog.len() {
            let fault = &mut self.catalog.faults_mut()[i];
            if fault.component != Component::Cpu
                || !matches!(
                    fault.target,
                    Target::InstructionExecution | Target::InstructionDecoder
                )
            {
                continue;
            }
            let fired = match fault.trigger {
                Trigger::Access => {
                    fault.params.address == pc as i64 && trigger::fires(fault, now, None)
                }
                Trigger::Pc => trigger::fires(fault, now, Some(pc)),
                Trigger::Time => false,
            };
            fault.is_active = fired;
            if !fired {
                continue;
            }
            let fault: &Fault = fault;
            let (flip, stuck) = match fault.mode {
                FaultMode::BitFlip => (true, false),
                FaultMode::NewValue => (false, false),
                FaultMode::StuckAt => (false, true),
                _ => continue,
            };
            let applied = modes::apply_simple_value(fault, value, flip, stuck);
            if applied > 0 {
                tracing::debug!(id = fault.id, pc, insn = *value, "instruction fault applied");
                let class = class_for_component(Component::Cpu, fault.is_permanent());
                self.stats.record_n(fault.id, class, applied);
            }
        }
    }

    /// Time-triggered faults are applied straight to their configured
    /// cell whenever the hook runs inside the fault's window.
    fn time_tick(&mut self, bus: &mut dyn GuestBus, now: i64) {
        for i in 0..self.catalog.len() {
            let fault = &mut self.catalog.faults_mut()[i];
            if fault.trigger != Trigger::Time {
                continue;
            }
            let on_register = fault.component == Component::Register;
            if !on_register {
                for cell in [fault.params.address, fault.params.cf_address] {
                    if cell >= 0 {
                        bus.tlb_flush_page(cell as u64);
                    }
                }
            }
            let fired = trigger::fires(fault, now, None);
            fault.is_active = fired;
            if !fired || fault.params.address < 0 {
                continue;
            }
            let fault: &Fault = fault;
            let (flip, stuck) = match fault.mode {
                FaultMode::BitFlip => (true, false),
                FaultMode::NewValue => (false, false),
                FaultMode::StuckAt => (false, true),
                _ => {
                    tracing::debug!(
                        id = fault.id,
                        "mode needs a guest access, skipped on the time path"
                    );
                    continue;
                }
            };
            let cell = fault.params.address as u64;
            let mut ctx = CellCtx {
                bus: &mut *bus,
                guard: &mut self.address_in_use,
                on_register,
            };
            match modes::apply_simple(&mut ctx, fault, ApplyTo::Cell(cell), flip, stuck) {
                Ok(applied) if applied > 0 => {
                    tracing::debug!(id = fault.id, cell, "time-triggered fault applied");
                    let class = class_for_component(fault.component, fault.is_permanent());
                    self.stats.record_n(fault.id, class, applied);
                }
                Ok(_) => {}
                Err(_) => tracing::debug!(id = fault.id, "cell unreadable, fault skipped"),
            }
        }
    }
}

fn class_for(on_register: bool, fault: &Fault) -> StatClass {
    let component = if on_register {
        Component::Register
    } else {
        Component::Ram
    };
    class_for_component(component, fault.is_permanent())
}

fn class_for_component(component: Component, permanent: bool) -> StatClass {
    match (component, permanent) {
        (Component::Ram, false) => StatClass::RamTransient,
        (Component::Ram, true) => StatClass::RamPermanent,
        (Component::Register, false) => StatClass::RegisterTransient,
        (Component::Register, true) => StatClass::RegisterPermanent,
        (Component::Cpu, false) => StatClass::CpuTransient,
        (Component::Cpu, true) => StatClass::CpuPermanent,
    }
}

