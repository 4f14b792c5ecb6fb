use super::catalog::{Fault, TemporalType, Trigger};

/// Decide whether `fault` fires for the current event.
///
/// `now_ns` is virtual time measured from the catalog-load baseline; `pc`
/// is the live program counter when the event comes from the instruction
/// path. Address and component/target matching has already happened at
/// the dispatch layer; this is purely the temporal/PC gate.
pub(crate) fn fires(fault: &Fault, now_ns: i64, pc: Option<u64>) -> bool {
    match fault.trigger {
        Trigger::Pc => {
            let target = fault.pc_target();
            target >= 0 && pc == Some(target as u64)
        }
        Trigger::Access | Trigger::Time => match fault.temporal {
            Some(TemporalType::Permanent) => true,
            Some(TemporalType::Transient) => in_window(fault, now_ns),
            Some(TemporalType::Intermittent) => {
                in_window(fault, now_ns) && interval_open(fault, now_ns)
            }
            None => false,
        },
    }
}

/// `start <= now < start + duration`. A fault whose timer or duration did
/// not normalize is never inside its window.
fn in_window(fault: &Fault, now_ns: i64) -> bool {
    let Some(start) = fault.timer.as_ref().and_then(|t| t.ns) else {
        return false;
    };
    let Some(duration) = fault.duration.as_ref().and_then(|t| t.ns) else {
        return false;
    };
    now_ns >= start && now_ns < start + duration
}

/// Intermittent faults are live on every other interval tick.
fn interval_open(fault: &Fault, now_ns: i64) -> bool {
    match fault.interval.as_ref().and_then(|t| t.ns) {
        Some(interval) if interval > 0 => (now_ns / interval) % 2 == 0,
        _ => false,
    }
}
