use std::fs::File;
use std::io::{BufWriter, Write};

use super::bus::AccessType;

const MEMORY_FILE: &str = "profiling_memory.txt";
const REGISTER_FILE: &str = "profiling_registers.txt";
const GENERIC_FILE: &str = "profiling_generic.txt";

/// Records every observed guest access to flat text files, one line per
/// access. Disabled unless armed (the memory log is armed by a catalog
/// entry with target PRINT ADDRESSES TO FILE); files open lazily on the
/// first write so an idle profiler touches nothing on disk.
#[derive(Debug, Default)]
pub struct Profiler {
    profile_memory: bool,
    profile_registers: bool,
    profile_generic: bool,
    memory_file: Option<BufWriter<File>>,
    register_file: Option<BufWriter<File>>,
    generic_file: Option<BufWriter<File>>,
}

impl Profiler {
    pub fn set_profile_memory(&mut self, on: bool) {
        self.profile_memory = on;
    }

    pub fn memory_profiling_enabled(&self) -> bool {
        self.profile_memory
    }

    pub fn set_profile_registers(&mut self, on: bool) {
        self.profile_registers = on;
    }

    pub fn set_profile_generic(&mut self, on: bool) {
        self.profile_generic = on;
    }

    pub(crate) fn log_memory(&mut self, addr: u64, value: u32, access: AccessType) {
        if !self.profile_memory {
            return;
        }
        let file = match lazy_open(&mut self.memory_file, MEMORY_FILE) {
            Some(file) => file,
            None => return,
        };
        let _ = match access {
            AccessType::Write => writeln!(file, "{addr:x} w 0x{value:x}"),
            AccessType::Read => writeln!(file, "{addr:x} r"),
            AccessType::Exec => writeln!(file, "{addr:x} e"),
        };
    }

    pub(crate) fn log_register(&mut self, regno: u64, value: u32, access: AccessType) {
        if !self.profile_registers {
            return;
        }
        let file = match lazy_open(&mut self.register_file, REGISTER_FILE) {
            Some(file) => file,
            None => return,
        };
        let _ = match access {
            AccessType::Write => writeln!(file, "{regno:x} w 0x{value:x}"),
            AccessType::Read => writeln!(file, "{regno:x} r"),
            AccessType::Exec => writeln!(file, "{regno:x} e"),
        };
    }

    /// Free-form line for host instrumentation.
    pub fn log_generic(&mut self, line: &str) {
        if !self.profile_generic {
            return;
        }
        if let Some(file) = lazy_open(&mut self.generic_file, GENERIC_FILE) {
            let _ = writeln!(file, "{line}");
        }
    }

    pub fn flush_files(&mut self) {
        for file in [
            self.memory_file.as_mut(),
            self.register_file.as_mut(),
            self.generic_file.as_mut(),
        ]
        .into_iter()
        .flatten()
        {
            let _ = file.flush();
        }
    }

    pub fn close_files(&mut self) {
        self.flush_files();
        self.memory_file = None;
        self.register_file = None;
        self.generic_file = None;
    }
}

impl Drop for Profiler {
    fn drop(&mut self) {
        self.close_files();
    }
}

fn lazy_open<'a>(
    slot: &'a mut Option<BufWriter<File>>,
    name: &str,
) -> Option<&'a mut BufWriter<File>> {
    if slot.is_none() {
        match File::create(name) {
            Ok(file) => *slot = Some(BufWriter::new(file)),
            Err(err) => {
                tracing::error!(name, %err, "cannot open profiler output");
                return None;
            }
        }
    }
    slot.as_mut()
}
