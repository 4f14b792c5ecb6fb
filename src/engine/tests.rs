use rustc_hash::{FxHashMap, FxHashSet};
use tracing_test::traced_test;

use super::*;

/// Flat little guest: byte-addressable memory, sixteen registers and a
/// hand-cranked virtual clock.
struct TestBus {
    mem: FxHashMap<u64, u8>,
    regs: [u32; 16],
    now: i64,
    flushed: Vec<u64>,
    unreadable: FxHashSet<u64>,
}

impl TestBus {
    fn new() -> TestBus {
        TestBus {
            mem: FxHashMap::default(),
            regs: [0; 16],
            now: 0,
            flushed: Vec::new(),
            unreadable: FxHashSet::default(),
        }
    }

    fn poke_word(&mut self, addr: u64, word: u32) {
        for (i, byte) in word.to_le_bytes().iter().enumerate() {
            self.mem.insert(addr + i as u64, *byte);
        }
    }

    fn peek_word(&self, addr: u64) -> u32 {
        let mut bytes = [0u8; WORD_BYTES];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = self.mem.get(&(addr + i as u64)).copied().unwrap_or(0);
        }
        u32::from_le_bytes(bytes)
    }
}

impl GuestBus for TestBus {
    fn mem_rw(&mut self, addr: u64, buf: &mut [u8], is_write: bool) -> Result<(), GuestMemoryError> {
        for offset in 0..buf.len() as u64 {
            if self.unreadable.contains(&(addr + offset)) {
                return Err(GuestMemoryError);
            }
        }
        for (offset, slot) in buf.iter_mut().enumerate() {
            let at = addr + offset as u64;
            if is_write {
                self.mem.insert(at, *slot);
            } else {
                *slot = self.mem.get(&at).copied().unwrap_or(0);
            }
        }
        Ok(())
    }

    fn reg_read(&mut self, regno: u64) -> u32 {
        self.regs[regno as usize]
    }

    fn reg_write(&mut self, regno: u64, value: u32) {
        self.regs[regno as usize] = value;
    }

    fn tlb_flush_page(&mut self, vaddr: u64) {
        self.flushed.push(vaddr);
    }

    fn clock_ns(&mut self) -> i64 {
        self.now
    }
}

fn engine_with(faults: &str) -> Engine {
    let mut engine = Engine::new();
    let report = engine
        .reload_from_str(&format!("<injection>{faults}</injection>"))
        .expect("catalog should parse");
    assert_eq!(report.skipped, 0, "catalog fragment should be representable");
    engine
}

/// One RAM memory-cell fault with the given mode fragment.
fn ram_fault(id: i32, mode: &str, temporal: &str, addr: u64, params: &str) -> String {
    format!(
        "<fault><id>{id}</id><component>RAM</component><target>MEMORY CELL</target>\
         <mode>{mode}</mode><trigger>ACCESS</trigger><type>{temporal}</type>\
         <params><address>0x{addr:x}</address>{params}</params></fault>"
    )
}

fn write_mem(engine: &mut Engine, bus: &mut TestBus, addr: u64, value: u32) -> u32 {
    let mut addr = addr;
    let mut value = value;
    engine.on_access(
        bus,
        &mut addr,
        &mut value,
        InjectionSite::MemContent,
        AccessType::Write,
    );
    // the host commits whatever survived the hook
    bus.poke_word(addr, value);
    value
}

fn read_mem(engine: &mut Engine, bus: &mut TestBus, addr: u64) -> u32 {
    let mut addr = addr;
    let mut value = bus.peek_word(addr);
    engine.on_access(
        bus,
        &mut addr,
        &mut value,
        InjectionSite::MemContent,
        AccessType::Read,
    );
    value
}

#[traced_test]
#[test]
fn bit_flip_on_ram_write() {
    tracing::info!("write through a permanent BIT-FLIP fault");
    let mut engine = engine_with(&ram_fault(
        1,
        "BIT-FLIP",
        "PERMANENT",
        0x1000,
        "<mask>0xF</mask>",
    ));
    let mut bus = TestBus::new();

    let written = write_mem(&mut engine, &mut bus, 0x1000, 0xAA);
    assert_eq!(written, 0xA5);
    assert_eq!(bus.peek_word(0x1000), 0xA5);
    assert!(engine.catalog().get(0).unwrap().is_active);
    assert_eq!(engine.stats().ram().1, 4); // one application per mask bit

    // the permanent flip leaves its pattern for the refresh pass
    assert_eq!(engine.stuckat_len(), 1);
}

#[traced_test]
#[test]
fn bit_flip_twice_restores_the_original() {
    let mut engine = engine_with(&ram_fault(
        1,
        "BIT-FLIP",
        "PERMANENT",
        0x1000,
        "<mask>0xFF00FF</mask>",
    ));
    let mut bus = TestBus::new();

    let once = write_mem(&mut engine, &mut bus, 0x1000, 0x12345678);
    let twice = write_mem(&mut engine, &mut bus, 0x1000, once);
    assert_eq!(twice, 0x12345678);
}

#[traced_test]
#[test]
fn new_value_on_register_read() {
    let fault = "<fault><id>1</id><component>REGISTER</component>\
                 <target>REGISTER CELL</target><mode>NEW VALUE</mode>\
                 <trigger>ACCESS</trigger><type>PERMANENT</type>\
                 <params><address>0x2</address><mask>0xDEADBEEF</mask></params></fault>";
    let mut engine = engine_with(fault);
    let mut bus = TestBus::new();
    bus.regs[2] = 0x1234_5678;

    let mut regno = 2u64;
    let mut value = bus.regs[2];
    engine.on_access(
        &mut bus,
        &mut regno,
        &mut value,
        InjectionSite::RegContent,
        AccessType::Read,
    );
    assert_eq!(value, 0xDEAD_BEEF);

    // a different register stays clean
    let mut regno = 3u64;
    let mut value = bus.regs[3];
    engine.on_access(
        &mut bus,
        &mut regno,
        &mut value,
        InjectionSite::RegContent,
        AccessType::Read,
    );
    assert_eq!(value, 0);
}

#[traced_test]
#[test]
fn stuck_at_one_holds_through_writes() {
    let mut engine = engine_with(&ram_fault(
        1,
        "SF",
        "PERMANENT",
        0x1000,
        "<mask>0xF0</mask><set_bit>0xF0</set_bit>",
    ));
    let mut bus = TestBus::new();

    assert_eq!(write_mem(&mut engine, &mut bus, 0x1000, 0x00), 0xF0);
    assert_eq!(write_mem(&mut engine, &mut bus, 0x1000, 0xFF), 0xFF);
    // idempotent: a second pass over the same value changes nothing
    assert_eq!(write_mem(&mut engine, &mut bus, 0x1000, 0xF0), 0xF0);
}

#[traced_test]
#[test]
fn stuck_at_zero_clears_masked_bits() {
    let mut engine = engine_with(&ram_fault(
        1,
        "SF",
        "PERMANENT",
        0x1000,
        "<mask>0x0F</mask><set_bit>0x0</set_bit>",
    ));
    let mut bus = TestBus::new();
    assert_eq!(write_mem(&mut engine, &mut bus, 0x1000, 0xFF), 0xF0);
}

#[traced_test]
#[test]
fn transient_window_gates_the_fault() {
    tracing::info!("three writes around a 100us..300us window");
    let fault = "<fault><id>1</id><component>RAM</component><target>MEMORY CELL</target>\
                 <mode>NEW VALUE</mode><trigger>ACCESS</trigger><type>TRANSIENT</type>\
                 <timer>100US</timer><duration>200US</duration>\
                 <params><address>0x1000</address><mask>0xCAFE</mask></params></fault>";
    let mut engine = engine_with(fault);
    let mut bus = TestBus::new();
    bus.now = 5_000_000;

    // pin the clock baseline with an access nothing matches
    write_mem(&mut engine, &mut bus, 0x9999, 0);

    bus.now = 5_000_000 + 50_000;
    assert_eq!(write_mem(&mut engine, &mut bus, 0x1000, 0x1111), 0x1111);
    assert!(!engine.catalog().get(0).unwrap().is_active);

    bus.now = 5_000_000 + 150_000;
    assert_eq!(write_mem(&mut engine, &mut bus, 0x1000, 0x1111), 0xCAFE);
    assert!(engine.catalog().get(0).unwrap().is_active);

    bus.now = 5_000_000 + 350_000;
    assert_eq!(write_mem(&mut engine, &mut bus, 0x1000, 0x1111), 0x1111);
    assert!(!engine.catalog().get(0).unwrap().is_active);
}

#[traced_test]
#[test]
fn intermittent_interval_uses_its_own_unit() {
    // 500US parity period: live on [0,500us), silent on [500us,1ms), ...
    let fault = "<fault><id>1</id><component>RAM</component><target>MEMORY CELL</target>\
                 <mode>NEW VALUE</mode><trigger>ACCESS</trigger><type>INTERMITTENT</type>\
                 <timer>1NS</timer><duration>900MS</duration><interval>500US</interval>\
                 <params><address>0x1000</address><mask>0xCAFE</mask></params></fault>";
    let mut engine = engine_with(fault);
    let mut bus = TestBus::new();
    write_mem(&mut engine, &mut bus, 0x9999, 0);

    bus.now = 250_000;
    assert_eq!(write_mem(&mut engine, &mut bus, 0x1000, 0x1111), 0xCAFE);

    bus.now = 750_000;
    assert_eq!(write_mem(&mut engine, &mut bus, 0x1000, 0x1111), 0x1111);

    bus.now = 1_250_000;
    assert_eq!(write_mem(&mut engine, &mut bus, 0x1000, 0x1111), 0xCAFE);
}

#[traced_test]
#[test]
fn transition_fault_refuses_the_down_write() {
    // TF0: a 1-cell cannot be written back to 0
    let mut engine = engine_with(&ram_fault(
        1,
        "TF0",
        "PERMANENT",
        0x1000,
        "<mask>0xFF</mask>",
    ));
    let mut bus = TestBus::new();
    bus.poke_word(0x1000, 0xFF);

    assert_eq!(write_mem(&mut engine, &mut bus, 0x1000, 0x0F), 0xFF);
    // reads pass through untouched
    assert_eq!(read_mem(&mut engine, &mut bus, 0x1000), 0xFF);
}

#[traced_test]
#[test]
fn write_disturb_flips_the_static_write() {
    // WDF0: writing 0 over 0 leaves a 1 behind
    let mut engine = engine_with(&ram_fault(
        1,
        "WDF0",
        "PERMANENT",
        0x1000,
        "<mask>0x1</mask>",
    ));
    let mut bus = TestBus::new();
    bus.poke_word(0x1000, 0x0);
    assert_eq!(write_mem(&mut engine, &mut bus, 0x1000, 0x0), 0x1);
}

#[traced_test]
#[test]
fn incorrect_read_leaves_the_cell_clean() {
    let mut engine = engine_with(&ram_fault(
        1,
        "IRF0",
        "PERMANENT",
        0x1000,
        "<mask>0xF0</mask>",
    ));
    let mut bus = TestBus::new();
    bus.poke_word(0x1000, 0x0A);

    assert_eq!(read_mem(&mut engine, &mut bus, 0x1000), 0xFA);
    assert_eq!(bus.peek_word(0x1000), 0x0A);
}

#[traced_test]
#[test]
fn read_disturb_corrupts_cell_and_value() {
    let mut engine = engine_with(&ram_fault(
        1,
        "RDF0",
        "PERMANENT",
        0x1000,
        "<mask>0xF0</mask>",
    ));
    let mut bus = TestBus::new();
    bus.poke_word(0x1000, 0x0A);

    assert_eq!(read_mem(&mut engine, &mut bus, 0x1000), 0xFA);
    assert_eq!(bus.peek_word(0x1000), 0xFA);
}

#[traced_test]
#[test]
fn deceptive_read_lies_about_nothing_but_disturbs_the_cell() {
    let mut engine = engine_with(&ram_fault(
        1,
        "DRDF1",
        "PERMANENT",
        0x1000,
        "<mask>0xFF</mask>",
    ));
    let mut bus = TestBus::new();
    bus.poke_word(0x1000, 0xAB);

    // the guest still sees the truth on this read
    assert_eq!(read_mem(&mut engine, &mut bus, 0x1000), 0xAB);
    // but the cell is now all-zeroes under the mask
    assert_eq!(bus.peek_word(0x1000), 0x00);
}

#[traced_test]
#[test]
fn dynamic_rdf00_fires_after_a_zero_over_zero_write() {
    tracing::info!("0w0 write then read: bit 0 reads and stores as 1");
    let mut engine = engine_with(&ram_fault(
        1,
        "RDF00",
        "PERMANENT",
        0x1000,
        "<mask>0x1</mask>",
    ));
    let mut bus = TestBus::new();

    write_mem(&mut engine, &mut bus, 0x1000, 0x0); // cell 0, writes 0
    let seen = read_mem(&mut engine, &mut bus, 0x1000);
    assert_eq!(seen & 0x1, 0x1);
    assert_eq!(bus.peek_word(0x1000) & 0x1, 0x1);
}

#[traced_test]
#[test]
fn dynamic_rdf00_stays_quiet_after_other_operations() {
    let mut engine = engine_with(&ram_fault(
        1,
        "RDF00",
        "PERMANENT",
        0x1000,
        "<mask>0x1</mask>",
    ));
    let mut bus = TestBus::new();

    write_mem(&mut engine, &mut bus, 0x1000, 0x1); // 0w1, not the keyed op
    assert_eq!(read_mem(&mut engine, &mut bus, 0x1000) & 0x1, 0x1);
    assert_eq!(bus.peek_word(0x1000), 0x1);
}

fn coupling_fault(id: i32, mode: &str, addr: u64, cf: u64, params: &str) -> String {
    format!(
        "<fault><id>{id}</id><component>RAM</component><target>MEMORY CELL</target>\
         <mode>{mode}</mode><trigger>ACCESS</trigger><type>PERMANENT</type>\
         <params><address>0x{addr:x}</address><cf_address>0x{cf:x}</cf_address>{params}</params></fault>"
    )
}

#[traced_test]
#[test]
fn cfst10_forces_victim_high_while_aggressor_is_high() {
    tracing::info!("aggressor bit 0 high: victim masked bits are driven to 1");
    let mut engine = engine_with(&coupling_fault(
        1,
        "CFST10",
        0x2000,
        0x3000,
        "<mask>0xFF</mask><set_bit>0x1</set_bit>",
    ));
    let mut bus = TestBus::new();
    bus.poke_word(0x2000, 0x01);
    bus.poke_word(0x3000, 0x00);

    // touching the aggressor pushes the coupling into the victim cell
    let seen = read_mem(&mut engine, &mut bus, 0x2000);
    assert_eq!(seen, 0x01);
    assert_eq!(bus.peek_word(0x3000), 0x01);
}

#[traced_test]
#[test]
fn cfst_from_the_victim_side_corrupts_the_read() {
    // CFST11: aggressor high clears victim bits
    let mut engine = engine_with(&coupling_fault(
        1,
        "CFST11",
        0x2000,
        0x3000,
        "<mask>0xFF</mask><set_bit>0x1</set_bit>",
    ));
    let mut bus = TestBus::new();
    bus.poke_word(0x2000, 0xFF);
    bus.poke_word(0x3000, 0xAB);

    let seen = read_mem(&mut engine, &mut bus, 0x3000);
    assert_eq!(seen, 0x00);
}

#[traced_test]
#[test]
fn victim_side_families_ignore_aggressor_only_accesses() {
    // CFWD00 keys on the victim cell; the aggressor address alone is a no-op
    let mut engine = engine_with(&coupling_fault(
        1,
        "CFWD00",
        0x2000,
        0x3000,
        "<mask>0xFF</mask>",
    ));
    let mut bus = TestBus::new();
    bus.poke_word(0x3000, 0x55);

    assert_eq!(write_mem(&mut engine, &mut bus, 0x2000, 0x77), 0x77);
    assert_eq!(bus.peek_word(0x3000), 0x55);
    assert_eq!(engine.stats().total(), 0);
}

#[traced_test]
#[test]
fn cfwd_disturbs_the_victim_write() {
    // CFWD10: aggressor high, victim 0-bits are driven high during its write
    let mut engine = engine_with(&coupling_fault(
        1,
        "CFWD10",
        0x2000,
        0x3000,
        "<mask>0xFF</mask>",
    ));
    let mut bus = TestBus::new();
    bus.poke_word(0x2000, 0xFF);
    bus.poke_word(0x3000, 0x00);

    assert_eq!(write_mem(&mut engine, &mut bus, 0x3000, 0x00), 0xFF);
}

#[traced_test]
#[test]
fn cftr_blocks_the_victim_up_transition() {
    // CFTR11: while the aggressor is high, the victim's 0->1 write fails
    let mut engine = engine_with(&coupling_fault(
        1,
        "CFTR11",
        0x2000,
        0x3000,
        "<mask>0xFF</mask>",
    ));
    let mut bus = TestBus::new();
    bus.poke_word(0x2000, 0xFF);
    bus.poke_word(0x3000, 0x00);

    assert_eq!(write_mem(&mut engine, &mut bus, 0x3000, 0xFF), 0x00);
}

#[traced_test]
#[test]
fn cfds_write_transition_disturbs_the_victim() {
    // CFDS0W10: aggressor 0->1 write drives victim masked bits high
    let mut engine = engine_with(&coupling_fault(
        1,
        "CFDS0W10",
        0x2000,
        0x3000,
        "<mask>0xFF</mask>",
    ));
    let mut bus = TestBus::new();
    bus.poke_word(0x2000, 0x00);
    bus.poke_word(0x3000, 0x00);

    write_mem(&mut engine, &mut bus, 0x2000, 0xFF);
    assert_eq!(bus.peek_word(0x3000), 0xFF);

    // a read of the aggressor is not a transition: no further disturb
    bus.poke_word(0x3000, 0x00);
    read_mem(&mut engine, &mut bus, 0x2000);
    assert_eq!(bus.peek_word(0x3000), 0x00);
}

#[traced_test]
#[test]
fn cfir_lies_on_victim_reads_without_touching_the_cell() {
    // CFIR01: aggressor low clears victim bits on its read
    let mut engine = engine_with(&coupling_fault(
        1,
        "CFIR01",
        0x2000,
        0x3000,
        "<mask>0xFF</mask>",
    ));
    let mut bus = TestBus::new();
    bus.poke_word(0x2000, 0x00);
    bus.poke_word(0x3000, 0xAB);

    assert_eq!(read_mem(&mut engine, &mut bus, 0x3000), 0x00);
    assert_eq!(bus.peek_word(0x3000), 0xAB);
}

#[traced_test]
#[test]
fn mask_preservation_across_modes() {
    tracing::info!("bits outside the mask never change");
    for mode in ["BIT-FLIP", "SF", "TF1", "WDF1", "RDF0", "IRF1", "DRDF0"] {
        let mut engine = engine_with(&ram_fault(
            1,
            mode,
            "PERMANENT",
            0x1000,
            "<mask>0x00FF00</mask><set_bit>0xFF00</set_bit>",
        ));
        let mut bus = TestBus::new();
        bus.poke_word(0x1000, 0xA5A5_A5A5);

        let written = write_mem(&mut engine, &mut bus, 0x1000, 0x5A5A_5A5A);
        assert_eq!(written & !0x00FF00, 0x5A5A_5A5A & !0x00FF00, "mode {mode} write");

        let seen = read_mem(&mut engine, &mut bus, 0x1000);
        let stored = bus.peek_word(0x1000);
        assert_eq!(seen & !0x00FF00, stored & !0x00FF00, "mode {mode} read");
    }
}

#[traced_test]
#[test]
fn reentrant_call_on_the_cell_under_injection_is_a_no_op() {
    let mut engine = engine_with(&ram_fault(
        1,
        "BIT-FLIP",
        "PERMANENT",
        0x1000,
        "<mask>0xFF</mask>",
    ));
    let mut bus = TestBus::new();

    engine.address_in_use = Some(0x1000);
    let mut addr = 0x1000u64;
    let mut value = 0xAA;
    engine.on_access(
        &mut bus,
        &mut addr,
        &mut value,
        InjectionSite::MemContent,
        AccessType::Write,
    );
    assert_eq!(value, 0xAA);
    assert_eq!(engine.stats().total(), 0);
}

#[traced_test]
#[test]
fn reload_resets_history_and_statistics() {
    let catalog = ram_fault(1, "BIT-FLIP", "PERMANENT", 0x1000, "<mask>0xF</mask>");
    let mut engine = engine_with(&catalog);
    let mut bus = TestBus::new();

    write_mem(&mut engine, &mut bus, 0x1000, 0xAA);
    assert!(engine.stats().total() > 0);
    assert!(!engine.mem_history.is_unset());
    assert_eq!(engine.stuckat_len(), 1);

    engine
        .reload_from_str(&format!("<injection>{catalog}</injection>"))
        .unwrap();
    assert_eq!(engine.stats().total(), 0);
    assert!(engine.mem_history.is_unset());
    assert!(engine.reg_history.is_unset());
    assert_eq!(engine.stuckat_len(), 0);
}

#[traced_test]
#[test]
fn address_decoder_fault_hijacks_the_address() {
    let fault = "<fault><id>1</id><component>RAM</component><target>ADDRESS DECODER</target>\
                 <mode>BIT-FLIP</mode><trigger>ACCESS</trigger><type>PERMANENT</type>\
                 <params><address>0x1000</address><mask>0x4</mask></params></fault>";
    let mut engine = engine_with(fault);
    let mut bus = TestBus::new();

    let mut addr = 0x1000u64;
    let mut value = 0u32;
    engine.on_access(
        &mut bus,
        &mut addr,
        &mut value,
        InjectionSite::MemAddr,
        AccessType::Read,
    );
    assert_eq!(addr, 0x1004);
    assert_eq!(value, 0);
}

#[traced_test]
#[test]
fn instruction_fault_replaces_the_fetched_word() {
    let fault = "<fault><id>1</id><component>CPU</component>\
                 <target>INSTRUCTION DECODER</target><mode>NEW VALUE</mode>\
                 <trigger>PC</trigger>\
                 <params><instruction>0x8000</instruction><mask>0xE1A00000</mask></params></fault>";
    let mut engine = engine_with(fault);
    let mut bus = TestBus::new();

    let mut pc = 0x8000u64;
    let mut insn = 0xE59F_0010u32;
    engine.on_access(
        &mut bus,
        &mut pc,
        &mut insn,
        InjectionSite::Insn,
        AccessType::Exec,
    );
    assert_eq!(insn, 0xE1A0_0000);

    // a different pc fetches untouched
    let mut pc = 0x8004u64;
    let mut insn = 0xE59F_0010u32;
    engine.on_access(
        &mut bus,
        &mut pc,
        &mut insn,
        InjectionSite::Insn,
        AccessType::Exec,
    );
    assert_eq!(insn, 0xE59F_0010);
}

#[traced_test]
#[test]
fn time_triggered_fault_rewrites_its_cell_on_the_tick() {
    let fault = "<fault><id>1</id><component>RAM</component><target>MEMORY CELL</target>\
                 <mode>NEW VALUE</mode><trigger>TIME</trigger><type>TRANSIENT</type>\
                 <timer>100US</timer><duration>200US</duration>\
                 <params><address>0x1000</address><mask>0x42</mask></params></fault>";
    let mut engine = engine_with(fault);
    let mut bus = TestBus::new();
    bus.poke_word(0x1000, 0x11);

    let mut addr = 0u64;
    let mut value = 0u32;
    engine.on_access(
        &mut bus,
        &mut addr,
        &mut value,
        InjectionSite::Time,
        AccessType::Exec,
    );
    // baseline pinned at the first tick: still before the window
    assert_eq!(bus.peek_word(0x1000), 0x11);

    bus.now += 150_000;
    engine.on_access(
        &mut bus,
        &mut addr,
        &mut value,
        InjectionSite::Time,
        AccessType::Exec,
    );
    assert_eq!(bus.peek_word(0x1000), 0x42);
    assert!(bus.flushed.contains(&0x1000));
}

#[traced_test]
#[test]
fn condition_flag_fault_drives_the_status_bit() {
    let fault = "<fault><id>1</id><component>CPU</component>\
                 <target>CONDITION FLAGS</target><mode>ZF</mode>\
                 <trigger>ACCESS</trigger><type>PERMANENT</type>\
                 <params><address>0x10</address><mask>0x1</mask><set_bit>0x1</set_bit></params></fault>";
    let mut engine = engine_with(fault);
    let mut bus = TestBus::new();

    let mut regno = 0x10u64;
    let mut cpsr = 0u32;
    engine.on_access(
        &mut bus,
        &mut regno,
        &mut cpsr,
        InjectionSite::RegContent,
        AccessType::Read,
    );
    assert_eq!(cpsr, 1 << 30);
}

#[traced_test]
#[test]
fn unreadable_cells_skip_the_fault_without_mutation() {
    let mut engine = engine_with(&ram_fault(
        1,
        "TF0",
        "PERMANENT",
        0x1000,
        "<mask>0xFF</mask>",
    ));
    let mut bus = TestBus::new();
    bus.unreadable.insert(0x1000);

    let mut addr = 0x1000u64;
    let mut value = 0x0Fu32;
    engine.on_access(
        &mut bus,
        &mut addr,
        &mut value,
        InjectionSite::MemContent,
        AccessType::Write,
    );
    assert_eq!(value, 0x0F);
    assert_eq!(engine.stats().total(), 0);
}

#[traced_test]
#[test]
fn exit_request_short_circuits_the_cpu_walk() {
    let mut engine = engine_with(&ram_fault(
        1,
        "BIT-FLIP",
        "PERMANENT",
        0x1000,
        "<mask>0xFF</mask>",
    ));
    let mut cpu0 = TestBus::new();
    let mut cpu1 = TestBus::new();
    engine.request_exit();

    let mut addr = 0x1000u64;
    let mut value = 0xAAu32;
    let cpus: Vec<&mut dyn GuestBus> = vec![&mut cpu0, &mut cpu1];
    engine.on_access_all(
        cpus,
        &mut addr,
        &mut value,
        InjectionSite::MemContent,
        AccessType::Write,
    );
    assert_eq!(value, 0xAA);
    assert_eq!(engine.stats().total(), 0);
}

#[traced_test]
#[test]
fn stuckat_refresh_reasserts_the_pattern() {
    let mut engine = Engine::new();
    let mut bus = TestBus::new();
    bus.poke_word(0x1000, 0xAA);

    engine.stuckat_insert(0x1000, &0x0Fu32.to_le_bytes());
    engine.stuckat_refresh(&mut bus);
    assert_eq!(bus.peek_word(0x1000), 0xA5);

    // guest restores the cell; the next pass corrupts it again
    bus.poke_word(0x1000, 0xAA);
    engine.stuckat_refresh(&mut bus);
    assert_eq!(bus.peek_word(0x1000), 0xA5);

    engine.stuckat_flush_pages(&mut bus);
    assert!(bus.flushed.contains(&0x1000));

    // unreadable mappings are skipped without complaint
    bus.unreadable.insert(0x1000);
    engine.stuckat_refresh(&mut bus);

    assert!(engine.stuckat_remove(0x1000));
    assert!(!engine.stuckat_remove(0x1000));
}

#[traced_test]
#[test]
fn stuckat_insert_replaces_by_address() {
    let mut engine = Engine::new();
    engine.stuckat_insert(0x1000, &[0xFF; 4]);
    engine.stuckat_insert(0x1000, &[0x0F, 0, 0, 0]);
    assert_eq!(engine.stuckat_len(), 1);

    let mut bus = TestBus::new();
    engine.stuckat_refresh(&mut bus);
    assert_eq!(bus.peek_word(0x1000), 0x0F);
}

#[traced_test]
#[test]
fn catalog_problems_are_reported_not_fatal() {
    let mut engine = Engine::new();
    let report = engine
        .reload_from_str(
            "<injection>\
             <fault><id>1</id><component>RAM</component><target>MEMORY CELL</target>\
             <mode>WOBBLE</mode><trigger>ACCESS</trigger><type>PERMANENT</type>\
             <params><address>0x10</address><mask>0x1</mask></params></fault>\
             <fault><id>2</id><target>MEMORY CELL</target><mode>SF</mode>\
             <trigger>ACCESS</trigger></fault>\
             </injection>",
        )
        .unwrap();

    // the unknown mode is retained but inert, the component-less fault is skipped
    assert_eq!(report.loaded, 1);
    assert_eq!(report.skipped, 1);
    assert!(report.diagnostics.iter().any(|d| d.contains("WOBBLE")));

    let mut bus = TestBus::new();
    assert_eq!(write_mem(&mut engine, &mut bus, 0x10, 0xAA), 0xAA);
    assert_eq!(engine.stats().total(), 0);
}

#[traced_test]
#[test]
fn bad_root_fails_the_load() {
    let mut engine = Engine::new();
    let err = engine.reload_from_str("<faults></faults>").unwrap_err();
    assert!(matches!(err, CatalogError::BadRoot(_)));
}

#[traced_test]
#[test]
fn print_addresses_target_arms_the_profiler() {
    let fault = "<fault><id>1</id><component>RAM</component>\
                 <target>PRINT ADDRESSES TO FILE</target><mode>BIT-FLIP</mode>\
                 <trigger>ACCESS</trigger><type>PERMANENT</type>\
                 <params><address>0x0</address><mask>0x1</mask></params></fault>";
    let mut engine = Engine::new();
    engine
        .reload_from_str(&format!("<injection>{fault}</injection>"))
        .unwrap();
    assert!(engine.profiler_mut().memory_profiling_enabled());
}

#[traced_test]
#[test]
fn faults_on_one_address_apply_in_catalog_order() {
    // first the flip, then stuck-at pins the low nibble
    let faults = format!(
        "{}{}",
        ram_fault(1, "BIT-FLIP", "PERMANENT", 0x1000, "<mask>0xFF</mask>"),
        ram_fault(
            2,
            "SF",
            "PERMANENT",
            0x1000,
            "<mask>0x0F</mask><set_bit>0x0F</set_bit>"
        ),
    );
    let mut engine = engine_with(&faults);
    let mut bus = TestBus::new();

    // 0x00 -> flip -> 0xFF -> stuck-at-1 low nibble -> 0xFF
    assert_eq!(write_mem(&mut engine, &mut bus, 0x1000, 0x00), 0xFF);
    // 0xFF -> flip -> 0x00 -> stuck-at-1 low nibble -> 0x0F
    assert_eq!(write_mem(&mut engine, &mut bus, 0x1000, 0xFF), 0x0F);
}
