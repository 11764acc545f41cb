//! Region enumeration backed by `VirtualQuery`.

use std::ffi::CStr;
use std::mem::{size_of, MaybeUninit};
use std::os::raw::c_char;
use std::path::PathBuf;

use region::Protection;
use winapi::shared::minwindef::{HMODULE, MAX_PATH};
use winapi::um::libloaderapi::GetModuleFileNameA;
use winapi::um::memoryapi::VirtualQuery;
use winapi::um::winnt::{
    MEMORY_BASIC_INFORMATION, MEM_COMMIT, MEM_IMAGE, MEM_PRIVATE, PAGE_EXECUTE,
    PAGE_EXECUTE_READ, PAGE_EXECUTE_READWRITE, PAGE_EXECUTE_WRITECOPY, PAGE_GUARD, PAGE_READONLY,
    PAGE_READWRITE, PAGE_WRITECOPY,
};

use super::{MemoryRegion, RegionKind};
use crate::addr::Address;

/// Walks the address space from `start` to `end`, one `VirtualQuery` step
/// per region.
pub fn enumerate(start: Address, end: Address) -> Vec<MemoryRegion> {
    let mut regions = Vec::new();
    let mut cursor = start;

    while cursor < end {
        let mut info = MaybeUninit::<MEMORY_BASIC_INFORMATION>::uninit();
        let written = unsafe {
            VirtualQuery(
                cursor.as_ptr(),
                info.as_mut_ptr(),
                size_of::<MEMORY_BASIC_INFORMATION>(),
            )
        };
        if written == 0 {
            break;
        }
        let info = unsafe { info.assume_init() };

        let base = Address::from_ptr(info.BaseAddress);
        let kind = if info.Type == MEM_PRIVATE {
            RegionKind::Private
        } else if info.Type == MEM_IMAGE {
            match module_path(info.AllocationBase as HMODULE) {
                Some(path) => RegionKind::Image(path),
                None => RegionKind::Other,
            }
        } else {
            RegionKind::Other
        };

        regions.push(MemoryRegion {
            base,
            size: info.RegionSize,
            protection: convert_protection(info.Protect),
            kind,
            committed: info.State == MEM_COMMIT,
            guarded: info.Protect & PAGE_GUARD != 0,
        });

        cursor = base + info.RegionSize;
    }

    regions
}

/// File path of the module owning `handle`, if any.
fn module_path(handle: HMODULE) -> Option<PathBuf> {
    let mut buffer = [0 as c_char; MAX_PATH];
    let len = unsafe { GetModuleFileNameA(handle, buffer.as_mut_ptr(), MAX_PATH as u32) };
    if len == 0 {
        return None;
    }
    let path = unsafe { CStr::from_ptr(buffer.as_ptr()) };
    Some(PathBuf::from(path.to_string_lossy().into_owned()))
}

/// Maps a Windows page-protection value onto the crate-wide representation.
fn convert_protection(protect: u32) -> Protection {
    // Strip the modifier bits; only the base protection class matters here.
    match protect & 0xff {
        PAGE_READONLY => Protection::READ,
        PAGE_READWRITE | PAGE_WRITECOPY => Protection::READ_WRITE,
        PAGE_EXECUTE => Protection::EXECUTE,
        PAGE_EXECUTE_READ => Protection::READ_EXECUTE,
        PAGE_EXECUTE_READWRITE | PAGE_EXECUTE_WRITECOPY => Protection::READ_WRITE_EXECUTE,
        _ => Protection::NONE,
    }
}
