//! Guest physical memory.
//!
//! The guest sees one contiguous physical address space backed by a single
//! anonymous private mapping in the hypervisor. Nothing is ever remapped
//! after creation; every component works on borrowed views of this region.
//!
//! # The 32-bit MMIO hole
//!
//! On x86 the platform reserves the top 768 MiB below 4 GiB for MMIO
//! (IOAPIC, LAPIC, flash). Guests larger than 3.25 GiB therefore skip that
//! window: the backing mapping is grown by the hole size and the hole itself
//! is protected `PROT_NONE`, so a stray host access faults loudly instead of
//! corrupting guest state. The hole is also excluded from the accelerator
//! memory slots and from every bounds-checked access below.
//!
//! ```text
//! 0x0000_0000 ┌──────────────────┐
//!             │ guest RAM (slot 0)│
//! 0xC000_0000 ├──────────────────┤
//!             │ hole, PROT_NONE  │  768 MiB, unreachable
//! 0x1_0000_0000 ├────────────────┤
//!             │ guest RAM (slot 1)│
//!             └──────────────────┘
//! ```
//!
//! # Safety
//!
//! The region is plain mmap'd memory shared with a running guest, so the
//! usual Rust aliasing guarantees do not hold across hypercalls: the guest
//! may write a page while the dirty-page scanner reads it. That is by
//! design (pre-copy tolerates torn pages; they are resent), and all raw
//! pointer work is confined to this module.

use std::io;

use thiserror::Error;
use vm_memory::ByteValued;

/// Guest page size (4 KiB).
pub const PAGE_SIZE: u64 = 1 << PAGE_BITS;
/// Page offset bits.
pub const PAGE_BITS: u64 = 12;
/// Large (2 MiB) page offset bits.
pub const PAGE_2M_BITS: u64 = 21;

/// Top of the 32-bit physical address space.
pub const KVM_32BIT_MAX_MEM_SIZE: u64 = 1 << 32;
/// Size of the MMIO hole below 4 GiB.
pub const KVM_32BIT_GAP_SIZE: u64 = 768 << 20;
/// First guest physical address inside the hole (3.25 GiB).
pub const KVM_32BIT_GAP_START: u64 = KVM_32BIT_MAX_MEM_SIZE - KVM_32BIT_GAP_SIZE;

/// Errors raised by guest memory setup and access.
#[derive(Error, Debug)]
pub enum MemError {
    #[error("failed to allocate guest memory: {0}")]
    Allocation(#[source] io::Error),

    /// A guest-supplied address fell outside guest RAM or inside the MMIO
    /// hole. Hypercall handlers treat this as fatal.
    #[error("guest fault: {len:#x} byte access at guest address {addr:#x}")]
    GuestFault { addr: u64, len: u64 },
}

/// A contiguous non-hole range of guest physical memory.
///
/// Small guests have exactly one chunk; x86 guests straddling the MMIO hole
/// have two.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemChunk {
    /// Guest physical base address.
    pub gpa: u64,
    /// Length in bytes.
    pub size: u64,
}

/// The backing region for guest physical memory.
pub struct GuestMemory {
    base: *mut u8,
    /// Total mapped size; includes the hole when `has_gap` is set.
    size: u64,
    has_gap: bool,
}

// The raw pointer is to process-lifetime mmap'd memory.
unsafe impl Send for GuestMemory {}
unsafe impl Sync for GuestMemory {}

impl GuestMemory {
    /// Map a guest memory region of `requested` bytes.
    ///
    /// For x86 guests reaching into the MMIO window the mapping is grown by
    /// the hole size and the hole protected `PROT_NONE`. `mergeable` and
    /// `hugepage` are pure madvise hints; failure to apply them never fails
    /// startup.
    pub fn new(requested: u64, mergeable: bool, hugepage: bool) -> Result<Self, MemError> {
        let has_gap = cfg!(target_arch = "x86_64") && requested >= KVM_32BIT_GAP_START;
        let size = if has_gap {
            requested + KVM_32BIT_GAP_SIZE
        } else {
            requested
        };

        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size as usize,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(MemError::Allocation(io::Error::last_os_error()));
        }
        let base = base.cast::<u8>();

        if has_gap {
            // Stray host access into the hole should fault the hypervisor,
            // not silently land in backing memory.
            let ret = unsafe {
                libc::mprotect(
                    base.add(KVM_32BIT_GAP_START as usize).cast(),
                    KVM_32BIT_GAP_SIZE as usize,
                    libc::PROT_NONE,
                )
            };
            if ret != 0 {
                let err = io::Error::last_os_error();
                unsafe { libc::munmap(base.cast(), size as usize) };
                return Err(MemError::Allocation(err));
            }
        }

        let mem = Self {
            base,
            size,
            has_gap,
        };

        if mergeable {
            mem.advise(libc::MADV_MERGEABLE, "mergeable");
        }
        if hugepage {
            mem.advise(libc::MADV_HUGEPAGE, "hugepage");
        }

        Ok(mem)
    }

    fn advise(&self, advice: libc::c_int, name: &str) {
        let ret = unsafe { libc::madvise(self.base.cast(), self.size as usize, advice) };
        if ret != 0 {
            tracing::warn!(
                "madvise {name} not applied: {}",
                io::Error::last_os_error()
            );
        } else {
            tracing::debug!("guest memory advised as {name}");
        }
    }

    /// Total guest physical size, including the hole when present.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// The size that was requested, hole excluded. This is the value that
    /// travels in manifests and migration metadata; the receiving side
    /// re-derives the hole for itself.
    pub fn requested_size(&self) -> u64 {
        if self.has_gap {
            self.size - KVM_32BIT_GAP_SIZE
        } else {
            self.size
        }
    }

    /// Host virtual base address, for accelerator slot registration.
    pub fn host_base(&self) -> u64 {
        self.base as u64
    }

    /// The non-hole ranges of the guest physical space, in address order.
    pub fn chunks(&self) -> Vec<MemChunk> {
        chunk_list(self.size, self.has_gap)
    }

    /// Validate that `[addr, addr+len)` lies inside guest RAM and outside
    /// the MMIO hole.
    pub fn check_range(&self, addr: u64, len: u64) -> Result<(), MemError> {
        if range_ok(addr, len, self.size, self.has_gap) {
            Ok(())
        } else {
            Err(MemError::GuestFault { addr, len })
        }
    }

    /// Read a fixed-layout value from a guest physical address.
    pub fn read_obj<T: ByteValued>(&self, addr: u64) -> Result<T, MemError> {
        self.check_range(addr, std::mem::size_of::<T>() as u64)?;
        // Range checked; guest structures are not necessarily aligned.
        Ok(unsafe { std::ptr::read_unaligned(self.base.add(addr as usize).cast::<T>()) })
    }

    /// Write a fixed-layout value at a guest physical address.
    pub fn write_obj<T: ByteValued>(&self, addr: u64, val: &T) -> Result<(), MemError> {
        self.check_range(addr, std::mem::size_of::<T>() as u64)?;
        unsafe { std::ptr::write_unaligned(self.base.add(addr as usize).cast::<T>(), *val) };
        Ok(())
    }

    /// Copy guest memory into a host buffer.
    pub fn read_bytes(&self, addr: u64, buf: &mut [u8]) -> Result<(), MemError> {
        self.check_range(addr, buf.len() as u64)?;
        unsafe {
            std::ptr::copy_nonoverlapping(self.base.add(addr as usize), buf.as_mut_ptr(), buf.len())
        };
        Ok(())
    }

    /// Copy a host buffer into guest memory.
    pub fn write_bytes(&self, addr: u64, buf: &[u8]) -> Result<(), MemError> {
        self.check_range(addr, buf.len() as u64)?;
        unsafe {
            std::ptr::copy_nonoverlapping(buf.as_ptr(), self.base.add(addr as usize), buf.len())
        };
        Ok(())
    }

    /// Borrow guest memory as a byte slice.
    ///
    /// The guest may mutate the range concurrently; callers must tolerate
    /// torn reads the same way the pre-copy scanner does.
    pub fn slice(&self, addr: u64, len: u64) -> Result<&[u8], MemError> {
        self.check_range(addr, len)?;
        Ok(unsafe { std::slice::from_raw_parts(self.base.add(addr as usize), len as usize) })
    }

    /// Borrow guest memory as a mutable byte slice.
    #[allow(clippy::mut_from_ref)]
    pub fn slice_mut(&self, addr: u64, len: u64) -> Result<&mut [u8], MemError> {
        self.check_range(addr, len)?;
        Ok(unsafe { std::slice::from_raw_parts_mut(self.base.add(addr as usize), len as usize) })
    }

    /// Volatile read of a guest-written u32, for spin-waiting on boot
    /// rendezvous slots.
    pub fn read_u32_volatile(&self, addr: u64) -> Result<u32, MemError> {
        self.check_range(addr, 4)?;
        Ok(unsafe { std::ptr::read_volatile(self.base.add(addr as usize).cast::<u32>()) })
    }

    /// Volatile read of an aligned page-table entry.
    pub fn read_entry(&self, addr: u64) -> Result<u64, MemError> {
        self.check_range(addr, 8)?;
        Ok(unsafe { std::ptr::read_volatile(self.base.add(addr as usize).cast::<u64>()) })
    }

    /// Volatile write of an aligned page-table entry.
    pub fn write_entry(&self, addr: u64, entry: u64) -> Result<(), MemError> {
        self.check_range(addr, 8)?;
        unsafe { std::ptr::write_volatile(self.base.add(addr as usize).cast::<u64>(), entry) };
        Ok(())
    }

    /// Read a NUL-terminated guest string, bounded by guest memory.
    pub fn read_cstring(&self, addr: u64) -> Result<Vec<u8>, MemError> {
        let mut out = Vec::new();
        let mut cur = addr;
        loop {
            let byte: u8 = self.read_obj(cur)?;
            if byte == 0 {
                return Ok(out);
            }
            out.push(byte);
            cur += 1;
        }
    }
}

impl Drop for GuestMemory {
    fn drop(&mut self) {
        unsafe { libc::munmap(self.base.cast(), self.size as usize) };
    }
}

fn chunk_list(size: u64, has_gap: bool) -> Vec<MemChunk> {
    if !has_gap {
        return vec![MemChunk { gpa: 0, size }];
    }
    let gap_end = KVM_32BIT_GAP_START + KVM_32BIT_GAP_SIZE;
    vec![
        MemChunk {
            gpa: 0,
            size: KVM_32BIT_GAP_START,
        },
        MemChunk {
            gpa: gap_end,
            size: size - gap_end,
        },
    ]
}

fn range_ok(addr: u64, len: u64, size: u64, has_gap: bool) -> bool {
    let Some(end) = addr.checked_add(len) else {
        return false;
    };
    if end > size {
        return false;
    }
    if has_gap {
        let gap_end = KVM_32BIT_GAP_START + KVM_32BIT_GAP_SIZE;
        // Any overlap with the hole is a fault.
        if addr < gap_end && end > KVM_32BIT_GAP_START {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_write_obj() {
        let mem = GuestMemory::new(2 * PAGE_SIZE, false, false).unwrap();
        mem.write_obj(0x100, &0xdead_beef_u32).unwrap();
        assert_eq!(mem.read_obj::<u32>(0x100).unwrap(), 0xdead_beef);
        // Unaligned access is allowed.
        mem.write_obj(0x101, &0x1122_3344_5566_7788_u64).unwrap();
        assert_eq!(mem.read_obj::<u64>(0x101).unwrap(), 0x1122_3344_5566_7788);
    }

    #[test]
    fn test_out_of_bounds_faults() {
        let mem = GuestMemory::new(PAGE_SIZE, false, false).unwrap();
        assert!(mem.read_obj::<u64>(PAGE_SIZE - 4).is_err());
        assert!(mem.write_bytes(PAGE_SIZE, &[0]).is_err());
        assert!(mem.check_range(u64::MAX, 8).is_err());
    }

    #[test]
    fn test_read_cstring() {
        let mem = GuestMemory::new(PAGE_SIZE, false, false).unwrap();
        mem.write_bytes(0x40, b"/tmp/t\0").unwrap();
        assert_eq!(mem.read_cstring(0x40).unwrap(), b"/tmp/t");
    }

    #[test]
    fn test_chunk_list_small_guest() {
        let chunks = chunk_list(0x2000_0000, false);
        assert_eq!(
            chunks,
            vec![MemChunk {
                gpa: 0,
                size: 0x2000_0000
            }]
        );
    }

    #[test]
    fn test_chunk_list_straddles_hole() {
        // 8 GiB guest: the mapping is inflated by the hole size.
        let total = (8 << 30) + KVM_32BIT_GAP_SIZE;
        let chunks = chunk_list(total, true);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].gpa, 0);
        assert_eq!(chunks[0].size, KVM_32BIT_GAP_START);
        assert_eq!(chunks[1].gpa, KVM_32BIT_MAX_MEM_SIZE);
        assert_eq!(chunks[1].size, total - KVM_32BIT_MAX_MEM_SIZE);
        assert_eq!(chunks[0].size + chunks[1].size + KVM_32BIT_GAP_SIZE, total);
    }

    #[test]
    fn test_range_excludes_hole() {
        let total = (8 << 30) + KVM_32BIT_GAP_SIZE;
        assert!(range_ok(0, KVM_32BIT_GAP_START, total, true));
        assert!(range_ok(KVM_32BIT_MAX_MEM_SIZE, 0x1000, total, true));
        // Touching the hole from either side is rejected.
        assert!(!range_ok(KVM_32BIT_GAP_START, 1, total, true));
        assert!(!range_ok(KVM_32BIT_GAP_START - 1, 2, total, true));
        assert!(!range_ok(KVM_32BIT_MAX_MEM_SIZE - 1, 2, total, true));
    }
}
