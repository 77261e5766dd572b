use std::ffi::CString;

use crate::error::SubstrateError;

/// A recognized instrumentation hook symbol pair (§6). The enter symbol
/// is discovered the first time the substrate is invoked; both names are
/// then fixed for the run.
#[derive(Copy, Clone, Debug)]
pub struct HookFamily {
    pub enter_name: &'static str,
    pub exit_name: &'static str,
}

pub const HOOK_FAMILIES: &[HookFamily] = &[
    HookFamily {
        enter_name: "__cyg_profile_func_enter",
        exit_name: "__cyg_profile_func_exit",
    },
    HookFamily {
        enter_name: "scorep_plugin_enter_region",
        exit_name: "scorep_plugin_exit_region",
    },
    HookFamily {
        enter_name: "__VT_IntelEntry",
        exit_name: "__VT_IntelExit",
    },
];

/// Walks the current call stack looking for a frame whose resolved
/// symbol matches one of the known hook names. Runs once per process,
/// the first time any enter/exit event reaches the statistics engine.
pub fn find_active_hook_family() -> Option<&'static HookFamily> {
    let mut found: Option<&'static HookFamily> = None;
    backtrace::trace(|frame| {
        let mut stop = false;
        backtrace::resolve_frame(frame, |symbol| {
            if let Some(name) = symbol.name() {
                let name = name.to_string();
                for family in HOOK_FAMILIES {
                    if name.contains(family.enter_name) {
                        found = Some(family);
                        stop = true;
                    }
                }
            }
        });
        !stop
    });
    found
}

/// Walks frames outward until the first frame whose procedure name
/// equals `hook_symbol`, then continues until the procedure name changes.
/// The instruction pointer of that outer frame minus 5 bytes is the
/// candidate call-site (§4.3 steps 1-2).
pub fn resolve_callsite(hook_symbol: &str) -> Option<usize> {
    let mut past_hook = false;
    let mut candidate: Option<usize> = None;

    backtrace::trace(|frame| {
        let ip = frame.ip() as usize;
        let mut matches_hook = false;
        backtrace::resolve_frame(frame, |symbol| {
            if let Some(name) = symbol.name() {
                if name.to_string().contains(hook_symbol) {
                    matches_hook = true;
                }
            }
        });

        if !past_hook {
            if matches_hook {
                past_hook = true;
            }
            true
        } else if matches_hook {
            // Still unwinding through the hook's own call chain.
            true
        } else {
            candidate = Some(ip.wrapping_sub(5));
            false
        }
    });

    candidate
}

/// Resolves the entry address of a named, globally visible symbol via
/// the dynamic linker. Used once to pin down the hook's own entry point
/// so later exit call-sites can be validated against it.
pub fn symbol_entry_address(symbol: &str) -> Option<usize> {
    let cname = CString::new(symbol).ok()?;
    let ptr = unsafe { libc::dlsym(libc::RTLD_DEFAULT, cname.as_ptr()) };
    if ptr.is_null() {
        None
    } else {
        Some(ptr as usize)
    }
}

fn read_bytes(addr: usize, len: usize) -> Vec<u8> {
    // Safety: callers only invoke this on addresses already known to lie
    // in mapped executable text (resolved from a live stack frame).
    unsafe { std::slice::from_raw_parts(addr as *const u8, len) }.to_vec()
}

/// Validates that the candidate exit call-site actually transfers
/// control to the hook's entry point, directly or through one level of
/// PLT/GOT indirection (§4.3 step 4, §6). Accepts `E8` direct near
/// CALL, `FF /2` or `FF /3` indirect CALL, and `EA` legacy far CALL.
/// Only the direct-CALL and one-hop-PLT cases can be checked against
/// `hook_entry`; indirect/far forms are accepted on encoding shape alone,
/// matching the weaker guarantee the unwinder can offer for those forms.
pub fn validate_exit_callsite(addr: usize, hook_entry: usize) -> Result<(), SubstrateError> {
    let bytes = read_bytes(addr, 5);
    match bytes[0] {
        0xE8 => {
            let disp = i32::from_le_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);
            let target = (addr as i64 + 5 + disp as i64) as usize;
            if target == hook_entry {
                Ok(())
            } else {
                follow_plt(target, hook_entry, addr)
            }
        }
        0xFF => {
            let modrm = bytes[1];
            let reg_field = (modrm >> 3) & 0x7;
            if reg_field == 2 || reg_field == 3 {
                Ok(())
            } else {
                Err(SubstrateError::UnrecognizedCallsite { addr })
            }
        }
        0xEA => Ok(()),
        _ => Err(SubstrateError::UnrecognizedCallsite { addr }),
    }
}

/// Resolves the effective target of a direct near CALL at `addr`, for
/// bootstrapping the hook's entry address from the very first successful
/// exit resolution when `dlsym` cannot find the hook symbol (§4.3).
pub fn direct_call_target(addr: usize) -> Option<usize> {
    let bytes = read_bytes(addr, 5);
    if bytes[0] != 0xE8 {
        return None;
    }
    let disp = i32::from_le_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);
    Some((addr as i64 + 5 + disp as i64) as usize)
}

fn follow_plt(target: usize, hook_entry: usize, original_addr: usize) -> Result<(), SubstrateError> {
    let bytes = read_bytes(target, 6);
    if bytes[0] == 0xFF && bytes[1] == 0x25 {
        let disp = i32::from_le_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]);
        let got_addr = (target as i64 + 6 + disp as i64) as usize;
        let got_entry = unsafe { std::ptr::read_unaligned(got_addr as *const usize) };
        if got_entry == hook_entry {
            return Ok(());
        }
    }
    Err(SubstrateError::UnrecognizedCallsite { addr: original_addr })
}

#[cfg(test)]
mod test {
    use super::*;

    fn hook_fn() {}

    #[test]
    fn direct_call_matching_hook_entry_is_accepted() {
        let hook_entry = hook_fn as usize;
        let mut buf = [0u8; 5];
        buf[0] = 0xE8;
        // Displacement chosen so addr + 5 + disp == hook_entry.
        let addr = &buf as *const u8 as usize;
        let disp = (hook_entry as i64 - (addr as i64 + 5)) as i32;
        buf[1..5].copy_from_slice(&disp.to_le_bytes());
        assert!(validate_exit_callsite(addr, hook_entry).is_ok());
    }

    #[test]
    fn direct_call_to_unrelated_target_is_rejected() {
        let hook_entry = hook_fn as usize;
        let mut buf = [0u8; 5];
        buf[0] = 0xE8;
        buf[1..5].copy_from_slice(&1i32.to_le_bytes());
        let addr = &buf as *const u8 as usize;
        assert!(validate_exit_callsite(addr, hook_entry).is_err());
    }

    #[test]
    fn indirect_call_slash_2_is_accepted_on_shape_alone() {
        let mut buf = [0u8; 5];
        buf[0] = 0xFF;
        buf[1] = 0x10; // ModR/M with reg field == 2 (/2), mod == 00, rm == 0
        let addr = &buf as *const u8 as usize;
        assert!(validate_exit_callsite(addr, 0).is_ok());
    }

    #[test]
    fn unrecognized_opcode_is_rejected() {
        let buf = [0x90u8; 5];
        let addr = &buf as *const u8 as usize;
        assert!(validate_exit_callsite(addr, 0).is_err());
    }

    #[test]
    fn known_hook_families_pair_enter_and_exit_names() {
        assert_eq!(HOOK_FAMILIES.len(), 3);
        for family in HOOK_FAMILIES {
            assert!(!family.enter_name.is_empty());
            assert!(!family.exit_name.is_empty());
        }
    }
}
