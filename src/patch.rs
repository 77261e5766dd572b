use std::os::raw::c_void;

use nix::sys::mman::{mprotect, ProtFlags};

use crate::error::SubstrateError;
use crate::log::LogLevel::*;
use crate::registry::{RegionHandle, Registry};

/// The canonical five-byte multi-byte NOP (§6): `nop DWORD PTR
/// [rax+rax*1+0x0]`, encoded `0F 1F 44 00 00`. No other width is ever
/// written.
pub const NOP5: [u8; 5] = [0x0f, 0x1f, 0x44, 0x00, 0x00];

static_assertions::const_assert_eq!(NOP5.len(), 5);

lazy_static! {
    static ref PAGE_SIZE: usize = unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize };
}

fn page_size() -> usize {
    *PAGE_SIZE
}

fn page_start(addr: usize, page_size: usize) -> usize {
    addr & !(page_size - 1)
}

fn errno_of(err: nix::Error) -> i32 {
    err.as_errno().map(|e| e as i32).unwrap_or(-1)
}

fn set_page_protection(page_addr: usize, page_size: usize, writable: bool) -> Result<(), SubstrateError> {
    let prot = if writable {
        ProtFlags::PROT_READ | ProtFlags::PROT_WRITE | ProtFlags::PROT_EXEC
    } else {
        ProtFlags::PROT_READ | ProtFlags::PROT_EXEC
    };
    unsafe { mprotect(page_addr as *mut c_void, page_size, prot) }
        .map_err(|e| SubstrateError::PermissionChange { addr: page_addr, errno: errno_of(e) })
}

/// Overwrites the five bytes at `addr` with [`NOP5`], flipping page
/// permissions to RWX for the duration of the write and restoring them
/// to RX afterward (§4.4). If raising permissions fails the write is
/// never attempted and an error is returned so the caller leaves the
/// region `deletable` for a retry on the next patch window (§7).
pub fn patch_callsite(addr: usize) -> Result<(), SubstrateError> {
    let psize = page_size();
    let first_page = page_start(addr, psize);
    let second_page = page_start(addr + NOP5.len() - 1, psize);

    set_page_protection(first_page, psize, true)?;
    if second_page != first_page {
        set_page_protection(second_page, psize, true)?;
    }

    // Safety: addr was resolved from a live call-site on the current
    // process's executable text and validated by the unwinder adapter.
    unsafe {
        std::ptr::copy_nonoverlapping(NOP5.as_ptr(), addr as *mut u8, NOP5.len());
    }

    if let Err(e) = set_page_protection(first_page, psize, false) {
        log!(LogError, "failed to restore permissions on page {:#x}: {}", first_page, e);
    }
    if second_page != first_page {
        if let Err(e) = set_page_protection(second_page, psize, false) {
            log!(LogError, "failed to restore permissions on page {:#x}: {}", second_page, e);
        }
    }

    Ok(())
}

/// Patches both call-sites of a region independently, each surrounded by
/// its own permission flip (§4.4: "No attempt is made to batch distinct
/// patches"). Returns true only if both succeeded.
pub fn patch_region(enter_addr: usize, exit_addr: usize) -> bool {
    let enter_ok = patch_callsite(enter_addr)
        .map_err(|e| log!(LogError, "failed to patch enter call-site {:#x}: {}", enter_addr, e))
        .is_ok();
    let exit_ok = patch_callsite(exit_addr)
        .map_err(|e| log!(LogError, "failed to patch exit call-site {:#x}: {}", exit_addr, e))
        .is_ok();
    enter_ok && exit_ok
}

/// Iterates regions, skipping those that are `inactive`, not
/// `deletable`, `optimized_out`, currently nested (`depth > 0`), or
/// missing either call-site address. For the remainder, patches both
/// call-sites and marks the region `inactive` (§4.4).
pub fn apply_all_pending(registry: &Registry) {
    registry.for_each_region(|id, record| {
        apply_one(id, record);
    });
}

fn apply_one(id: RegionHandle, record: &mut crate::registry::RegionRecord) {
    if record.inactive || !record.deletable || record.optimized_out || record.depth > 0 {
        return;
    }
    let (enter, exit) = match (record.enter_callsite, record.exit_callsite) {
        (Some(e), Some(x)) => (e, x),
        _ => return,
    };
    if patch_region(enter, exit) {
        record.inactive = true;
        log!(
            LogInfo,
            "region {} ({}) patched out: enter {:#x}, exit {:#x}",
            id,
            record.region_name,
            enter,
            exit
        );
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn page_start_aligns_down() {
        let ps = 4096;
        assert_eq!(page_start(4096, ps), 4096);
        assert_eq!(page_start(4097, ps), 4096);
        assert_eq!(page_start(8191, ps), 4096);
        assert_eq!(page_start(8192, ps), 8192);
    }

    #[test]
    fn nop5_is_five_bytes_of_the_canonical_encoding() {
        assert_eq!(NOP5, [0x0f, 0x1f, 0x44, 0x00, 0x00]);
    }

    /// Patches a NOP-sled in an executable-and-writable mmap region and
    /// checks the five bytes land exactly, leaving the surrounding bytes
    /// untouched, matching the round-trip law in the testable properties.
    #[test]
    fn patch_callsite_writes_exactly_five_bytes() {
        let psize = page_size();
        let map = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                psize,
                libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        assert_ne!(map, libc::MAP_FAILED);
        let base = map as usize;

        unsafe {
            let slice = std::slice::from_raw_parts_mut(map as *mut u8, 16);
            slice[0] = 0xAA;
            slice[1] = 0xE8;
            slice[2] = 0x01;
            slice[3] = 0x02;
            slice[4] = 0x03;
            slice[5] = 0x04;
            slice[6] = 0xBB;
        }

        patch_callsite(base + 1).unwrap();

        unsafe {
            let slice = std::slice::from_raw_parts(map as *const u8, 16);
            assert_eq!(slice[0], 0xAA);
            assert_eq!(&slice[1..6], &NOP5);
            assert_eq!(slice[6], 0xBB);
        }

        unsafe {
            libc::munmap(map, psize);
        }
    }
}
