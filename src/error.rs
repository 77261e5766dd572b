use std::fmt;

use crate::registry::RegionHandle;

/// Recoverable conditions surfaced by the measurement substrate's internal
/// components. None of these ever cross the host ABI boundary: the
/// callback shims in `host::callbacks` log and discard them (§7 of the
/// design: callbacks always return void and never propagate exceptions).
#[derive(Debug)]
pub enum SubstrateError {
    ConfigParse { var: &'static str, value: String },
    ZeroThreshold,
    PermissionChange { addr: usize, errno: i32 },
    UnrecognizedCallsite { addr: usize },
    DuplicateRegion { region_id: RegionHandle },
    LocationSlotsExhausted,
}

impl fmt::Display for SubstrateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubstrateError::ConfigParse { var, value } => {
                write!(f, "could not parse {} = {:?}", var, value)
            }
            SubstrateError::ZeroThreshold => write!(f, "threshold must be a positive integer"),
            SubstrateError::PermissionChange { addr, errno } => write!(
                f,
                "mprotect failed for call-site at {:#x} (errno {})",
                addr, errno
            ),
            SubstrateError::UnrecognizedCallsite { addr } => write!(
                f,
                "byte pattern at {:#x} is not a recognized CALL encoding",
                addr
            ),
            SubstrateError::DuplicateRegion { region_id } => {
                write!(f, "region {} already defined", region_id)
            }
            SubstrateError::LocationSlotsExhausted => {
                write!(f, "no free shadow-table slots remain")
            }
        }
    }
}

impl std::error::Error for SubstrateError {}
