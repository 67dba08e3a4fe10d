use crate::util::Address;
use std::io::Result;

/// Demand-zero anonymous mmap at a kernel-chosen address. Used for the heap
/// range and the metadata tables (card table, mark map, remembered-set
/// payloads). The kernel guarantees the mapping is zeroed.
pub fn dzmmap_anywhere(size: usize) -> Result<Address> {
    let prot = libc::PROT_READ | libc::PROT_WRITE;
    let flags = libc::MAP_ANON | libc::MAP_PRIVATE;
    let ret = unsafe { libc::mmap(std::ptr::null_mut(), size, prot, flags, -1, 0) };
    if ret == libc::MAP_FAILED {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(Address::from_ptr(ret))
    }
}

/// Unmap the given range.
pub fn munmap(start: Address, size: usize) -> Result<()> {
    wrap_libc_call(&|| unsafe { libc::munmap(start.to_mut_ptr(), size) }, 0)
}

/// Zero the given memory range.
pub fn zero(start: Address, len: usize) {
    unsafe {
        std::ptr::write_bytes::<u8>(start.to_mut_ptr(), 0, len);
    }
}

/// Total physical memory of the machine in bytes. Only the memory component
/// of `sysinfo` is loaded; a full `System` takes long enough to build that it
/// shows up in start-up time.
pub fn get_system_total_memory() -> u64 {
    use sysinfo::{MemoryRefreshKind, RefreshKind, System};

    let sys = System::new_with_specifics(
        RefreshKind::nothing().with_memory(MemoryRefreshKind::nothing().with_ram()),
    );
    sys.total_memory()
}

fn wrap_libc_call<T: PartialEq>(f: &dyn Fn() -> T, expect: T) -> Result<()> {
    let ret = f();
    if ret == expect {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}
