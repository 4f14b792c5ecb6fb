#![warn(clippy::all, rust_2018_idioms)]

//! Catalog inspector: parse and validate a fault catalog without an
//! emulator attached, printing what the engine would load. The exit code
//! tells scripts whether the file is clean.

use std::path::Path;
use std::process::ExitCode;

use bitfault::engine::catalog::FaultCatalog;

fn main() -> ExitCode {
    env_logger::init(); // Log to stderr (if you run with `RUST_LOG=debug`).

    let mut args = std::env::args().skip(1);
    let Some(path) = args.next() else {
        eprintln!("usage: bitfault <catalog.xml>");
        return ExitCode::from(2);
    };

    match FaultCatalog::load(Path::new(&path)) {
        Ok((catalog, report)) => {
            for fault in catalog.iter() {
                println!("{fault}");
            }
            for diag in &report.diagnostics {
                eprintln!("warning: {diag}");
            }
            println!(
                "{} faults loaded, {} skipped, max id {}",
                report.loaded,
                report.skipped,
                catalog.max_id()
            );
            if report.skipped > 0 || !report.diagnostics.is_empty() {
                return ExitCode::FAILURE;
            }
            ExitCode::SUCCESS
        }
        Err(err) => {
            log::error!("cannot load {path}: {err}");
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}
