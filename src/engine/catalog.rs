use std::fmt;
use std::path::Path;

use rustc_hash::FxHashMap;
use thiserror::Error;

use super::history::CellOp;

/// Hardware component a fault lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Component {
    Cpu,
    Ram,
    Register,
}

/// The structure inside the component that is corrupted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    RegisterCell,
    MemoryCell,
    /// Accepted alongside MEMORY CELL for old catalogs; behaves the same.
    RwLogic,
    ConditionFlags,
    InstructionExecution,
    InstructionDecoder,
    AddressDecoder,
    /// Does not corrupt anything; arms the access profiler.
    PrintAddressesToFile,
}

/// What makes the fault fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Access,
    Time,
    Pc,
}

/// Temporal behavior of an ACCESS- or TIME-triggered fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemporalType {
    Permanent,
    Transient,
    Intermittent,
}

/// ARM-style status flag driven by a condition-flag fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpsrFlag {
    Negative,
    Zero,
    Carry,
    Overflow,
    Saturation,
}

impl CpsrFlag {
    /// Bit position inside the status word (CPSR layout).
    pub fn bit(self) -> u32 {
        match self {
            CpsrFlag::Negative => 31,
            CpsrFlag::Zero => 30,
            CpsrFlag::Carry => 29,
            CpsrFlag::Overflow => 28,
            CpsrFlag::Saturation => 27,
        }
    }
}

/// A two-cell coupling fault, decoded from its catalog tag. `aggressor_one`
/// is the aggressor level the tag names; `drive_high` is the direction the
/// victim bit is forced (tag digit 0 drives the bit to 1, digit 1 to 0).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CouplingMode {
    /// CFSTab: victim forced while the aggressor holds a level.
    State { aggressor_one: bool, drive_high: bool },
    /// CFDS aWbc / aRbc: victim disturbed when the aggressor goes from
    /// level `a` to level `b` under a write (or is read/written at a
    /// steady level, for the R tags).
    Disturb {
        before_one: bool,
        after_one: bool,
        drive_high: bool,
        on_read: bool,
    },
    /// CFTRab: the victim transition `!b -> b` fails while the aggressor
    /// holds level `a`.
    Transition { aggressor_one: bool, to_one: bool },
    /// CFWDab: victim disturbed during its own write.
    WriteDisturb { aggressor_one: bool, drive_high: bool },
    /// CFRDab: victim disturbed during its own read; the corrupt value is
    /// both returned and stored.
    ReadDisturb { aggressor_one: bool, drive_high: bool },
    /// CFIRab: victim read returns the corrupt value, cell stays clean.
    IncorrectRead { aggressor_one: bool, drive_high: bool },
    /// CFDRab: victim read returns the correct value, cell is corrupted.
    DeceptiveRead { aggressor_one: bool, drive_high: bool },
}

/// Parsed fault mode. Catalog tags are matched case-sensitively once at
/// load time; the hot path only ever dispatches on this enum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FaultMode {
    BitFlip,
    NewValue,
    /// SF: drive each masked bit to the polarity in `params.set_bit`.
    StuckAt,
    /// TFx: transition fault. Digit 0 keeps a 1-cell stuck high across a
    /// down-write, digit 1 keeps a 0-cell stuck low across an up-write.
    Transition { one: bool },
    /// RDFx: read disturb, corrupt value returned and written back.
    ReadDisturb { one: bool },
    /// WDFx: the non-transition write at level x flips the cell.
    WriteDisturb { one: bool },
    /// IRFx: incorrect read, cell stays clean.
    IncorrectRead { one: bool },
    /// DRDFx: correct value returned, corrupt value left in the cell.
    DeceptiveRead { one: bool },
    /// RDFxy keyed on the previous cell operation.
    DynReadDisturb(CellOp),
    /// IRFxy keyed on the previous cell operation.
    DynIncorrectRead(CellOp),
    /// DRDFxy keyed on the previous cell operation.
    DynDeceptiveRead(CellOp),
    /// Drive one status-register flag to `params.set_bit & 1`.
    ConditionFlag(CpsrFlag),
    Coupling(CouplingMode),
    /// Tag we could not decode. The fault stays visible in the catalog
    /// but never fires.
    Unrecognized(Box<str>),
}

impl FaultMode {
    pub fn is_coupling(&self) -> bool {
        matches!(self, FaultMode::Coupling(_))
    }
}

/// A duration from the catalog: the raw text plus the normalized
/// nanosecond value (`None` when the suffix or number did not parse; the
/// trigger evaluator treats that as "never inside the window").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeSpec {
    pub raw: String,
    pub ns: Option<i64>,
}

impl TimeSpec {
    pub(crate) fn parse(raw: &str) -> TimeSpec {
        let trimmed = raw.trim();
        let scale = if trimmed.ends_with("NS") {
            Some(1)
        } else if trimmed.ends_with("US") {
            Some(1_000)
        } else if trimmed.ends_with("MS") {
            Some(1_000_000)
        } else {
            None
        };
        let ns = scale.and_then(|scale| {
            trimmed[..trimmed.len() - 2]
                .parse::<i64>()
                .ok()
                .filter(|n| *n > 0)
                .map(|n| n * scale)
        });
        TimeSpec {
            raw: trimmed.to_string(),
            ns,
        }
    }
}

/// The `<params>` block. Addresses are -1 when absent so that "unset"
/// never collides with a real guest address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultParams {
    pub address: i64,
    pub cf_address: i64,
    pub mask: u32,
    pub instruction: i64,
    pub set_bit: u32,
}

impl Default for FaultParams {
    fn default() -> Self {
        FaultParams {
            address: -1,
            cf_address: -1,
            mask: 0,
            instruction: -1,
            set_bit: 0,
        }
    }
}

/// One configured fault.
#[derive(Debug, Clone)]
pub struct Fault {
    pub id: i32,
    pub component: Component,
    pub target: Target,
    pub mode: FaultMode,
    pub trigger: Trigger,
    pub temporal: Option<TemporalType>,
    pub timer: Option<TimeSpec>,
    pub duration: Option<TimeSpec>,
    pub interval: Option<TimeSpec>,
    pub params: FaultParams,
    /// Set by the trigger evaluator on every event, purely for the
    /// monitor; never consulted when deciding whether to fire.
    pub is_active: bool,
}

impl Fault {
    pub fn is_permanent(&self) -> bool {
        matches!(self.temporal, Some(TemporalType::Permanent))
    }

    /// The address a PC-triggered fault compares the live PC against.
    pub fn pc_target(&self) -> i64 {
        if self.params.instruction != -1 {
            self.params.instruction
        } else {
            self.params.address
        }
    }

    /// True when `addr` is one of the cells this fault is keyed on.
    pub fn matches_cell(&self, addr: u64) -> bool {
        self.params.address == addr as i64 || self.params.cf_address == addr as i64
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "fault {}: {:?}/{:?} {:?} trigger={:?}",
            self.id, self.component, self.target, self.mode, self.trigger
        )?;
        if let Some(temporal) = self.temporal {
            write!(f, " type={temporal:?}")?;
        }
        write!(
            f,
            " addr={:#x} cf={:#x} mask={:#010x} set_bit={:#010x}",
            self.params.address, self.params.cf_address, self.params.mask, self.params.set_bit
        )
    }
}

/// Errors that abort a catalog load outright. Validation problems do not
/// abort; they are collected into [`LoadReport::diagnostics`].
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("cannot read catalog file: {0}")]
    Io(#[from] std::io::Error),
    #[error("catalog is not well-formed XML: {0}")]
    Parse(#[from] roxmltree::Error),
    #[error("catalog root element is <{0}>, expected <injection>")]
    BadRoot(String),
}

/// Outcome of a successful (possibly imperfect) catalog load.
#[derive(Debug, Default)]
pub struct LoadReport {
    /// Faults now in the catalog.
    pub loaded: usize,
    /// `<fault>` elements that could not be represented at all.
    pub skipped: usize,
    /// Human-readable validation findings, one per problem.
    pub diagnostics: Vec<String>,
}

/// The parsed catalog: faults in file order plus an address index so the
/// per-access scan only ever touches faults keyed on the accessed cell.
#[derive(Debug, Default)]
pub struct FaultCatalog {
    faults: Vec<Fault>,
    by_address: FxHashMap<u64, Vec<usize>>,
    max_id: i32,
}

impl FaultCatalog {
    pub fn len(&self) -> usize {
        self.faults.len()
    }

    pub fn is_empty(&self) -> bool {
        self.faults.is_empty()
    }

    pub fn get(&self, i: usize) -> Option<&Fault> {
        self.faults.get(i)
    }

    pub fn max_id(&self) -> i32 {
        self.max_id
    }

    pub fn iter(&self) -> impl Iterator<Item = &Fault> {
        self.faults.iter()
    }

    pub(crate) fn faults_mut(&mut self) -> &mut [Fault] {
        &mut self.faults
    }

    /// Catalog positions (file order) of every fault keyed on `addr`,
    /// either as its primary or its coupling address.
    pub(crate) fn positions_at(&self, addr: u64) -> &[usize] {
        self.by_address.get(&addr).map_or(&[], Vec::as_slice)
    }

    /// True when any loaded fault asks for the address profiler.
    pub fn wants_address_profile(&self) -> bool {
        self.faults
            .iter()
            .any(|f| f.target == Target::PrintAddressesToFile)
    }

    fn rebuild_index(&mut self) {
        self.by_address.clear();
        self.max_id = 0;
        for (i, fault) in self.faults.iter().enumerate() {
            self.max_id = self.max_id.max(fault.id);
            for addr in [fault.params.address, fault.params.cf_address] {
                if addr >= 0 {
                    let slot = self.by_address.entry(addr as u64).or_default();
                    if slot.last() != Some(&i) {
                        slot.push(i);
                    }
                }
            }
        }
    }

    /// Parse and validate a catalog file.
    pub fn load(path: &Path) -> Result<(FaultCatalog, LoadReport), CatalogError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_str(&text)
    }

    /// Parse and validate catalog XML held in memory.
    pub fn from_str(xml: &str) -> Result<(FaultCatalog, LoadReport), CatalogError> {
        let span = tracing::info_span!("catalog_parse", bytes = xml.len());
        let _guard = span.enter();

        let doc = roxmltree::Document::parse(xml)?;
        let root = doc.root_element();
        if root.tag_name().name() != "injection" {
            return Err(CatalogError::BadRoot(root.tag_name().name().to_string()));
        }

        let mut catalog = FaultCatalog::default();
        let mut report = LoadReport::default();

        for node in root.children().filter(|n| n.has_tag_name("fault")) {
            match parse_fault(node, &mut report) {
                Some(fault) => {
                    tracing::debug!(id = fault.id, "parsed {fault}");
                    catalog.faults.push(fault);
                }
                None => report.skipped += 1,
            }
        }

        catalog.rebuild_index();
        validate(&catalog, &mut report);
        report.loaded = catalog.faults.len();

        tracing::info!(
            loaded = report.loaded,
            skipped = report.skipped,
            problems = report.diagnostics.len(),
            "catalog parsed"
        );
        Ok((catalog, report))
    }
}

fn child_text<'a>(node: roxmltree::Node<'a, 'a>, name: &str) -> Option<&'a str> {
    node.children()
        .find(|n| n.has_tag_name(name))
        .and_then(|n| n.text())
        .map(str::trim)
}

fn parse_hex(text: &str) -> Option<i64> {
    let digits = text
        .trim()
        .strip_prefix("0x")
        .or_else(|| text.trim().strip_prefix("0X"))
        .unwrap_or_else(|| text.trim());
    i64::from_str_radix(digits, 16).ok()
}

/// Build one `Fault` out of a `<fault>` element. Structural problems
/// (missing or unknown component/target/trigger) make the element
/// unrepresentable: diagnostic plus `None`. An unknown mode tag is kept
/// as `FaultMode::Unrecognized` so the monitor can still show it.
fn parse_fault(node: roxmltree::Node<'_, '_>, report: &mut LoadReport) -> Option<Fault> {
    let id = child_text(node, "id")
        .and_then(|t| t.parse::<i32>().ok())
        .unwrap_or(-1);

    let component = match child_text(node, "component") {
        Some("CPU") => Component::Cpu,
        Some("RAM") => Component::Ram,
        Some("REGISTER") => Component::Register,
        other => {
            report.diagnostics.push(format!(
                "component has to be CPU, REGISTER or RAM (fault id: {id}, got {other:?})"
            ));
            return None;
        }
    };

    let target = match child_text(node, "target") {
        Some("REGISTER CELL") => Target::RegisterCell,
        Some("MEMORY CELL") => Target::MemoryCell,
        Some("R/W LOGIC") => Target::RwLogic,
        Some("CONDITION FLAGS") => Target::ConditionFlags,
        Some("INSTRUCTION EXECUTION") => Target::InstructionExecution,
        Some("INSTRUCTION DECODER") => Target::InstructionDecoder,
        Some("ADDRESS DECODER") => Target::AddressDecoder,
        Some("PRINT ADDRESSES TO FILE") => Target::PrintAddressesToFile,
        other => {
            report.diagnostics.push(format!(
                "unknown target (fault id: {id}, got {other:?})"
            ));
            return None;
        }
    };

    let trigger = match child_text(node, "trigger") {
        Some("ACCESS") => Trigger::Access,
        Some("TIME") => Trigger::Time,
        Some("PC") => Trigger::Pc,
        other => {
            report.diagnostics.push(format!(
                "trigger has to be ACCESS, TIME or PC (fault id: {id}, got {other:?})"
            ));
            return None;
        }
    };

    let temporal = match child_text(node, "type") {
        Some("PERMANENT") => Some(TemporalType::Permanent),
        Some("TRANSIENT") => Some(TemporalType::Transient),
        // The historical catalog grammar spelled it with a D.
        Some("INTERMITTENT") | Some("INTERMITTEND") => Some(TemporalType::Intermittent),
        Some(other) => {
            report.diagnostics.push(format!(
                "type has to be PERMANENT, TRANSIENT or INTERMITTENT (fault id: {id}, got {other:?})"
            ));
            None
        }
        None => None,
    };

    let mode = child_text(node, "mode")
        .map(parse_mode)
        .unwrap_or_else(|| FaultMode::Unrecognized("".into()));

    let mut params = FaultParams::default();
    if let Some(params_node) = node.children().find(|n| n.has_tag_name("params")) {
        if let Some(addr) = child_text(params_node, "address").and_then(parse_hex) {
            params.address = addr;
        }
        if let Some(cf) = child_text(params_node, "cf_address").and_then(parse_hex) {
            params.cf_address = cf;
        }
        if let Some(mask) = child_text(params_node, "mask").and_then(parse_hex) {
            if mask > u32::MAX as i64 {
                report.diagnostics.push(format!(
                    "mask {mask:#x} does not fit the memory width (fault id: {id})"
                ));
            }
            params.mask = mask as u32;
        }
        if let Some(insn) = child_text(params_node, "instruction").and_then(parse_hex) {
            params.instruction = insn;
        }
        if let Some(set_bit) = child_text(params_node, "set_bit").and_then(parse_hex) {
            params.set_bit = set_bit as u32;
        }
    }

    Some(Fault {
        id,
        component,
        target,
        mode,
        trigger,
        temporal,
        timer: child_text(node, "timer").map(TimeSpec::parse),
        duration: child_text(node, "duration").map(TimeSpec::parse),
        interval: child_text(node, "interval").map(TimeSpec::parse),
        params,
        is_active: false,
    })
}

fn parse_mode(tag: &str) -> FaultMode {
    decode_mode(tag).unwrap_or_else(|| FaultMode::Unrecognized(tag.into()))
}

fn decode_mode(tag: &str) -> Option<FaultMode> {
    fn digit(byte: u8) -> Option<bool> {
        match byte {
            b'0' => Some(false),
            b'1' => Some(true),
            _ => None,
        }
    }

    let bytes = tag.as_bytes();
    match tag {
        "BIT-FLIP" => Some(FaultMode::BitFlip),
        "NEW VALUE" => Some(FaultMode::NewValue),
        "SF" => Some(FaultMode::StuckAt),
        "NF" => Some(FaultMode::ConditionFlag(CpsrFlag::Negative)),
        "ZF" => Some(FaultMode::ConditionFlag(CpsrFlag::Zero)),
        "CF" => Some(FaultMode::ConditionFlag(CpsrFlag::Carry)),
        "VF" => Some(FaultMode::ConditionFlag(CpsrFlag::Overflow)),
        "QF" => Some(FaultMode::ConditionFlag(CpsrFlag::Saturation)),
        _ if tag.len() == 3 && tag.starts_with("TF") => {
            Some(FaultMode::Transition { one: digit(bytes[2])? })
        }
        _ if tag.len() == 4 && tag.starts_with("RDF") => {
            Some(FaultMode::ReadDisturb { one: digit(bytes[3])? })
        }
        _ if tag.len() == 4 && tag.starts_with("WDF") => {
            Some(FaultMode::WriteDisturb { one: digit(bytes[3])? })
        }
        _ if tag.len() == 4 && tag.starts_with("IRF") => {
            Some(FaultMode::IncorrectRead { one: digit(bytes[3])? })
        }
        _ if tag.len() == 5 && tag.starts_with("DRDF") => {
            Some(FaultMode::DeceptiveRead { one: digit(bytes[4])? })
        }
        _ if tag.len() == 5 && tag.starts_with("RDF") => Some(FaultMode::DynReadDisturb(
            CellOp::from_digits(digit(bytes[3])?, digit(bytes[4])?),
        )),
        _ if tag.len() == 5 && tag.starts_with("IRF") => Some(FaultMode::DynIncorrectRead(
            CellOp::from_digits(digit(bytes[3])?, digit(bytes[4])?),
        )),
        _ if tag.len() == 6 && tag.starts_with("DRDF") => Some(FaultMode::DynDeceptiveRead(
            CellOp::from_digits(digit(bytes[4])?, digit(bytes[5])?),
        )),
        _ if tag.len() == 6 && tag.starts_with("CFST") => {
            Some(FaultMode::Coupling(CouplingMode::State {
                aggressor_one: digit(bytes[4])?,
                drive_high: !digit(bytes[5])?,
            }))
        }
        _ if tag.len() == 6 && tag.starts_with("CFTR") => {
            Some(FaultMode::Coupling(CouplingMode::Transition {
                aggressor_one: digit(bytes[4])?,
                to_one: digit(bytes[5])?,
            }))
        }
        _ if tag.len() == 6 && tag.starts_with("CFWD") => {
            Some(FaultMode::Coupling(CouplingMode::WriteDisturb {
                aggressor_one: digit(bytes[4])?,
                drive_high: !digit(bytes[5])?,
            }))
        }
        _ if tag.len() == 6 && tag.starts_with("CFRD") => {
            Some(FaultMode::Coupling(CouplingMode::ReadDisturb {
                aggressor_one: digit(bytes[4])?,
                drive_high: !digit(bytes[5])?,
            }))
        }
        _ if tag.len() == 6 && tag.starts_with("CFIR") => {
            Some(FaultMode::Coupling(CouplingMode::IncorrectRead {
                aggressor_one: digit(bytes[4])?,
                drive_high: !digit(bytes[5])?,
            }))
        }
        _ if tag.len() == 6 && tag.starts_with("CFDR") => {
            Some(FaultMode::Coupling(CouplingMode::DeceptiveRead {
                aggressor_one: digit(bytes[4])?,
                drive_high: !digit(bytes[5])?,
            }))
        }
        _ if tag.len() == 8 && tag.starts_with("CFDS") => {
            let before = digit(bytes[4])?;
            let on_read = match bytes[5] {
                b'W' => false,
                b'R' => true,
                _ => return None,
            };
            let after = digit(bytes[6])?;
            let drive_high = !digit(bytes[7])?;
            // The R tags only exist for a steady aggressor level.
            if on_read && before != after {
                return None;
            }
            Some(FaultMode::Coupling(CouplingMode::Disturb {
                before_one: before,
                after_one: after,
                drive_high,
                on_read,
            }))
        }
        _ => None,
    }
}

/// Post-parse validation per the catalog rules. Findings never remove a
/// fault; they are reported so the operator can fix the file.
fn validate(catalog: &FaultCatalog, report: &mut LoadReport) {
    for fault in catalog.iter() {
        let id = fault.id;
        if id < 1 {
            report
                .diagnostics
                .push(format!("fault id is not a positive, real number (got {id})"));
        }

        if let FaultMode::Unrecognized(tag) = &fault.mode {
            report
                .diagnostics
                .push(format!("unknown mode {tag:?} (fault id: {id})"));
        }

        if fault.params.mask == 0 {
            report
                .diagnostics
                .push(format!("fault mask is zero, nothing to corrupt (fault id: {id})"));
        }

        match fault.trigger {
            Trigger::Pc => {
                if fault.pc_target() == -1 {
                    report.diagnostics.push(format!(
                        "PC-triggered fault needs <instruction> or <address> (fault id: {id})"
                    ));
                }
            }
            Trigger::Access | Trigger::Time => {
                if fault.temporal.is_none() {
                    report.diagnostics.push(format!(
                        "type has to be PERMANENT, TRANSIENT or INTERMITTENT for \
                         time- or access-triggered faults (fault id: {id})"
                    ));
                }
            }
        }

        if fault.mode.is_coupling() && fault.params.cf_address == -1 {
            report.diagnostics.push(format!(
                "coupling fault needs a cf_address (fault id: {id})"
            ));
        }

        let needs_window = fault.trigger == Trigger::Time
            || matches!(
                fault.temporal,
                Some(TemporalType::Transient) | Some(TemporalType::Intermittent)
            );
        if needs_window {
            for (name, spec) in [("timer", &fault.timer), ("duration", &fault.duration)] {
                match spec {
                    Some(spec) if spec.ns.is_some() => {}
                    Some(spec) => report.diagnostics.push(format!(
                        "{name} has to be a positive, real number in ns, us or ms \
                         (fault id: {id}, got {:?})",
                        spec.raw
                    )),
                    None => report
                        .diagnostics
                        .push(format!("{name} is required for this fault (fault id: {id})")),
                }
            }
        }
        if matches!(fault.temporal, Some(TemporalType::Intermittent)) {
            match &fault.interval {
                Some(spec) if spec.ns.is_some() => {
                    // The historical engine scaled every interval by the
                    // milliseconds factor; catalogs written against that
                    // behavior need their interval values adjusted.
                    if !spec.raw.ends_with("MS") {
                        tracing::warn!(
                            id,
                            interval = %spec.raw,
                            "interval is scaled by its own unit suffix; older \
                             engines scaled it as milliseconds"
                        );
                    }
                }
                Some(spec) => report.diagnostics.push(format!(
                    "interval has to be a positive, real number in ns, us or ms \
                     (fault id: {id}, got {:?})",
                    spec.raw
                )),
                None => report.diagnostics.push(format!(
                    "interval is required for INTERMITTENT faults (fault id: {id})"
                )),
            }
        }
    }
}
