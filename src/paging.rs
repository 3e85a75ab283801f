//! Guest page-table walking.
//!
//! The guest installs its own 4-level page tables inside its image, rooted
//! one page after the entry point. The hypervisor walks those tables for two
//! jobs: translating guest-virtual hypercall buffers to guest-physical
//! addresses, and enumerating the pages the guest has touched or dirtied for
//! incremental checkpoints and live-migration passes.
//!
//! Both supported architectures use four levels with 9-bit indices over
//! 4 KiB tables; they differ only in flag layout and which levels may hold
//! block (large-page) leaves. That difference is captured by
//! [`PageTableLayout`] so x86-64 and ARMv8 share one walk implementation.

use std::io;
use std::marker::PhantomData;
use std::ops::Range;

use thiserror::Error;

use crate::mem::{GuestMemory, MemError, PAGE_2M_BITS, PAGE_BITS, PAGE_SIZE};

/// Index bits per level.
pub const PAGE_MAP_BITS: u64 = 9;
/// Index mask per level.
pub const PAGE_MAP_MASK: u64 = 0x1ff;
/// Number of page-table levels.
pub const PAGE_LEVELS: usize = 4;

/// x86-64 page-table entry bits.
pub mod x86 {
    /// Page is present.
    pub const PG_PRESENT: u64 = 1 << 0;
    /// Page is read- and writable.
    pub const PG_RW: u64 = 1 << 1;
    /// Page was recently accessed (set by the CPU).
    pub const PG_ACCESSED: u64 = 1 << 5;
    /// Page is dirty due to a recent write (set by the CPU).
    pub const PG_DIRTY: u64 = 1 << 6;
    /// Block leaf (2 MiB at the PD level). At the 4 KiB leaf level this very
    /// bit is the PAT flag instead.
    pub const PG_PSE: u64 = 1 << 7;
    /// Execution disabled.
    pub const PG_XD: u64 = 1 << 63;

    /// Mask of a 4 KiB-aligned physical address, excluding flag bits.
    pub const PAGE_MASK: u64 = (!0u64 << super::PAGE_BITS) & !PG_XD;
    /// Mask of a 2 MiB-aligned physical address, excluding flag bits.
    pub const PAGE_2M_MASK: u64 = (!0u64 << super::PAGE_2M_BITS) & !PG_XD;
}

/// Architecture-specific page-table flag layout.
///
/// Implementations describe how entries encode presence, block leaves and
/// the accessed/dirty state; the generic walker supplies the traversal.
pub trait PageTableLayout {
    /// Physical-address mask for an entry pointing at the next-level table.
    const TABLE_MASK: u64;

    /// Whether marked-page enumeration is supported. Architectures without
    /// it still get address translation.
    const SCAN_SUPPORTED: bool;

    fn is_present(entry: u64) -> bool;

    /// Whether `entry` is a block (large-page) leaf. `level` counts from the
    /// leaf upwards: 0 is the 4 KiB level, 1 maps 2 MiB blocks.
    fn is_block(level: usize, entry: u64) -> bool;

    /// Physical-address mask for a leaf at `level`, flags stripped.
    fn leaf_mask(level: usize) -> u64;

    /// Accessed/dirty test for the enumeration filter.
    fn is_marked(entry: u64, filter: ScanFilter) -> bool;

    /// Clear the accessed and dirty state from an entry.
    fn clear_marks(entry: u64) -> u64;

    /// Strip bits from a leaf entry that would be ambiguous in a saved
    /// record (x86: PAT aliases the block bit at the 4 KiB level).
    fn sanitize_record(level: usize, entry: u64) -> u64;
}

/// The x86-64 long-mode layout (4 KiB and 2 MiB pages).
pub struct X86_64Layout;

impl PageTableLayout for X86_64Layout {
    const TABLE_MASK: u64 = x86::PAGE_MASK;
    const SCAN_SUPPORTED: bool = true;

    fn is_present(entry: u64) -> bool {
        entry & x86::PG_PRESENT != 0
    }

    fn is_block(level: usize, entry: u64) -> bool {
        // 1 GiB blocks exist architecturally but the guest never maps them.
        (level == 1 || level == 2) && entry & x86::PG_PSE != 0
    }

    fn leaf_mask(level: usize) -> u64 {
        (!0u64 << PAGE_BITS << (level as u64 * PAGE_MAP_BITS)) & !x86::PG_XD
    }

    fn is_marked(entry: u64, filter: ScanFilter) -> bool {
        let bit = match filter {
            ScanFilter::Accessed => x86::PG_ACCESSED,
            ScanFilter::Dirty => x86::PG_DIRTY,
        };
        entry & bit != 0
    }

    fn clear_marks(entry: u64) -> u64 {
        entry & !(x86::PG_DIRTY | x86::PG_ACCESSED)
    }

    fn sanitize_record(level: usize, entry: u64) -> u64 {
        if level == 0 {
            // PAT occupies the PSE bit position at the leaf level; a decoder
            // would misread it as a 2 MiB record.
            entry & !x86::PG_PSE
        } else {
            entry
        }
    }
}

/// The ARMv8 4 KiB-granule layout.
///
/// Translation only: the accelerator-visible dirty state needed for
/// incremental transfer is not tracked on this architecture, so
/// checkpointing and migration stay disabled there.
pub struct Aarch64Layout;

impl Aarch64Layout {
    /// Output-address mask of a descriptor (bits 47:12).
    pub const PT_ADDR_MASK: u64 = 0xffff_ffff_f000;
    /// Access flag.
    pub const PT_AF: u64 = 1 << 10;
}

impl PageTableLayout for Aarch64Layout {
    const TABLE_MASK: u64 = Self::PT_ADDR_MASK;
    const SCAN_SUPPORTED: bool = false;

    fn is_present(entry: u64) -> bool {
        entry != 0
    }

    fn is_block(_level: usize, _entry: u64) -> bool {
        // The guest maps 4 KiB pages only.
        false
    }

    fn leaf_mask(level: usize) -> u64 {
        (!0u64 << PAGE_BITS << (level as u64 * PAGE_MAP_BITS)) & 0xffff_ffff_ffff
    }

    fn is_marked(entry: u64, _filter: ScanFilter) -> bool {
        entry & Self::PT_AF != 0
    }

    fn clear_marks(entry: u64) -> u64 {
        entry
    }

    fn sanitize_record(_level: usize, entry: u64) -> u64 {
        entry
    }
}

/// The page-table layout of the build target.
#[cfg(target_arch = "x86_64")]
pub type ArchLayout = X86_64Layout;
#[cfg(target_arch = "aarch64")]
pub type ArchLayout = Aarch64Layout;

/// Which mark bit [`PageWalker::scan_marked`] filters on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanFilter {
    /// Pages the guest ever touched.
    Accessed,
    /// Pages written since the marks were last cleared.
    Dirty,
}

/// Errors from a marked-page scan.
#[derive(Error, Debug)]
pub enum WalkError {
    #[error(transparent)]
    Mem(#[from] MemError),

    #[error("page sink failed: {0}")]
    Sink(#[from] io::Error),

    #[error("marked-page enumeration is not supported on this architecture")]
    Unsupported,
}

/// A walker over the guest-installed page tables.
pub struct PageWalker<'a, L: PageTableLayout> {
    mem: &'a GuestMemory,
    /// Guest-physical address of the root table (`elf_entry` + 4 KiB).
    root: u64,
    /// Boot-time translations resolve before the guest installs its tables;
    /// addresses inside the static image range map to themselves.
    identity: Option<Range<u64>>,
    _layout: PhantomData<L>,
}

impl<'a, L: PageTableLayout> PageWalker<'a, L> {
    pub fn new(mem: &'a GuestMemory, elf_entry: u64) -> Self {
        Self {
            mem,
            root: elf_entry + PAGE_SIZE,
            identity: None,
            _layout: PhantomData,
        }
    }

    /// Use an identity fast path for the given guest-physical range.
    pub fn with_identity(mut self, range: Range<u64>) -> Self {
        self.identity = Some(range);
        self
    }

    /// Translate a guest-virtual address.
    ///
    /// Returns `(paddr, page_end)` where `page_end` is the first physical
    /// address past the containing page, or `(0, 0)` when the address is not
    /// mapped yet. Callers must treat zeroes as "not mapped".
    pub fn translate(&self, vaddr: u64) -> (u64, u64) {
        if let Some(identity) = &self.identity {
            if identity.contains(&vaddr) {
                return (vaddr, identity.end);
            }
        }

        let mut table = self.root;
        for level in (0..PAGE_LEVELS).rev() {
            let index = (vaddr >> PAGE_BITS >> (level as u64 * PAGE_MAP_BITS)) & PAGE_MAP_MASK;
            let Ok(entry) = self.mem.read_entry(table + index * 8) else {
                return (0, 0);
            };
            if !L::is_present(entry) {
                return (0, 0);
            }

            if level == 0 || L::is_block(level, entry) {
                let mask = L::leaf_mask(level);
                let page_size = PAGE_SIZE << (level as u64 * PAGE_MAP_BITS);
                let phys = entry & mask;
                return (phys | (vaddr & !mask & 0xffff_ffff_ffff), phys + page_size);
            }

            table = entry & L::TABLE_MASK;
        }

        (0, 0)
    }

    /// Enumerate present 4 KiB and 2 MiB leaves whose `filter` bit is set,
    /// handing `(entry, page contents)` to `emit`.
    ///
    /// With `clear` set, the accessed and dirty marks of every emitted entry
    /// are reset in place so the next scan only sees pages touched since;
    /// the emitted entry carries the cleared value. Returns the number of
    /// pages emitted.
    pub fn scan_marked(
        &self,
        filter: ScanFilter,
        clear: bool,
        emit: &mut dyn FnMut(u64, &[u8]) -> io::Result<()>,
    ) -> Result<usize, WalkError> {
        if !L::SCAN_SUPPORTED {
            return Err(WalkError::Unsupported);
        }
        let mut emitted = 0;
        self.scan_table(self.root, PAGE_LEVELS - 1, filter, clear, emit, &mut emitted)?;
        Ok(emitted)
    }

    fn scan_table(
        &self,
        table: u64,
        level: usize,
        filter: ScanFilter,
        clear: bool,
        emit: &mut dyn FnMut(u64, &[u8]) -> io::Result<()>,
        emitted: &mut usize,
    ) -> Result<(), WalkError> {
        for index in 0..(1u64 << PAGE_MAP_BITS) {
            let entry_addr = table + index * 8;
            let entry = self.mem.read_entry(entry_addr)?;
            if !L::is_present(entry) {
                continue;
            }

            let leaf = level == 0 || L::is_block(level, entry);
            if !leaf {
                self.scan_table(entry & L::TABLE_MASK, level - 1, filter, clear, emit, emitted)?;
                continue;
            }
            if !L::is_marked(entry, filter) {
                continue;
            }

            let entry = if clear {
                let cleared = L::clear_marks(entry);
                self.mem.write_entry(entry_addr, cleared)?;
                cleared
            } else {
                entry
            };

            let mask = L::leaf_mask(level);
            let page_size = PAGE_SIZE << (level as u64 * PAGE_MAP_BITS);
            let page = self.mem.slice(entry & mask, page_size)?;
            emit(L::sanitize_record(level, entry), page)?;
            *emitted += 1;
        }
        Ok(())
    }
}

/// Destination offset of a saved page record, derived from its entry.
pub fn record_dest_offset(entry: u64) -> u64 {
    if entry & x86::PG_PSE != 0 {
        entry & x86::PAGE_2M_MASK
    } else {
        entry & x86::PAGE_MASK
    }
}

/// Page size of a saved page record (4 KiB or 2 MiB).
pub fn record_page_size(entry: u64) -> u64 {
    if entry & x86::PG_PSE != 0 {
        1 << PAGE_2M_BITS
    } else {
        1 << PAGE_BITS
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ELF_ENTRY: u64 = 0x20_0000;
    const ROOT: u64 = ELF_ENTRY + PAGE_SIZE;
    const PDPT: u64 = ELF_ENTRY + 2 * PAGE_SIZE;
    const PD: u64 = ELF_ENTRY + 3 * PAGE_SIZE;
    const PT: u64 = ELF_ENTRY + 4 * PAGE_SIZE;

    const P_RW: u64 = x86::PG_PRESENT | x86::PG_RW;

    /// An 8 MiB guest with tables mapping a 4 KiB page at 0x5000 and a
    /// 2 MiB block at 4 MiB.
    fn guest_with_tables() -> GuestMemory {
        let mem = GuestMemory::new(8 << 20, false, false).unwrap();
        mem.write_entry(ROOT, PDPT | P_RW).unwrap();
        mem.write_entry(PDPT, PD | P_RW).unwrap();
        mem.write_entry(PD, PT | P_RW).unwrap();
        mem.write_entry(PD + 2 * 8, 0x40_0000 | P_RW | x86::PG_PSE)
            .unwrap();
        mem.write_entry(PT + 5 * 8, 0x5000 | P_RW).unwrap();
        mem
    }

    fn walker(mem: &GuestMemory) -> PageWalker<'_, X86_64Layout> {
        PageWalker::new(mem, ELF_ENTRY)
    }

    #[test]
    fn test_translate_4k() {
        let mem = guest_with_tables();
        let (paddr, end) = walker(&mem).translate(0x5123);
        assert_eq!(paddr, 0x5123);
        assert_eq!(end, 0x6000);
    }

    #[test]
    fn test_translate_2m_block() {
        let mem = guest_with_tables();
        // PD index 2 covers virtual [4 MiB, 6 MiB).
        let (paddr, end) = walker(&mem).translate(0x40_0000 + 0x1_2345);
        assert_eq!(paddr, 0x41_2345);
        assert_eq!(end, 0x60_0000);
    }

    #[test]
    fn test_translate_unmapped_is_zero() {
        let mem = guest_with_tables();
        assert_eq!(walker(&mem).translate(0x7000), (0, 0));
        assert_eq!(walker(&mem).translate(0x4000_0000), (0, 0));
    }

    #[test]
    fn test_identity_fast_path() {
        let mem = guest_with_tables();
        let walker = PageWalker::<Aarch64Layout>::new(&mem, ELF_ENTRY)
            .with_identity(0x20_0000..0x30_0000);
        assert_eq!(walker.translate(0x25_0000), (0x25_0000, 0x30_0000));
    }

    fn collect_marked(
        mem: &GuestMemory,
        filter: ScanFilter,
        clear: bool,
    ) -> Vec<(u64, usize)> {
        let mut pages = Vec::new();
        walker(mem)
            .scan_marked(filter, clear, &mut |entry, page| {
                pages.push((entry, page.len()));
                Ok(())
            })
            .unwrap();
        pages
    }

    #[test]
    fn test_scan_dirty_and_clear() {
        let mem = guest_with_tables();
        mem.write_entry(PT + 5 * 8, 0x5000 | P_RW | x86::PG_ACCESSED | x86::PG_DIRTY)
            .unwrap();
        mem.write_entry(
            PD + 2 * 8,
            0x40_0000 | P_RW | x86::PG_PSE | x86::PG_DIRTY,
        )
        .unwrap();

        let pages = collect_marked(&mem, ScanFilter::Dirty, true);
        assert_eq!(pages.len(), 2);
        assert_eq!(pages[0], (0x5000 | P_RW, PAGE_SIZE as usize));
        assert_eq!(
            pages[1],
            (0x40_0000 | P_RW | x86::PG_PSE, (2 << 20) as usize)
        );

        // Marks were consumed; a second pass sees nothing.
        assert!(collect_marked(&mem, ScanFilter::Dirty, true).is_empty());
    }

    #[test]
    fn test_scan_accessed_keeps_marks() {
        let mem = guest_with_tables();
        mem.write_entry(PT + 5 * 8, 0x5000 | P_RW | x86::PG_ACCESSED)
            .unwrap();

        assert_eq!(collect_marked(&mem, ScanFilter::Accessed, false).len(), 1);
        assert_eq!(collect_marked(&mem, ScanFilter::Accessed, false).len(), 1);
    }

    #[test]
    fn test_scan_strips_pat_from_4k_records() {
        let mem = guest_with_tables();
        // PG_PSE at the leaf level is PAT, not a block marker.
        mem.write_entry(
            PT + 5 * 8,
            0x5000 | P_RW | x86::PG_PSE | x86::PG_DIRTY,
        )
        .unwrap();

        let pages = collect_marked(&mem, ScanFilter::Dirty, false);
        assert_eq!(pages.len(), 1);
        let (entry, len) = pages[0];
        assert_eq!(entry & x86::PG_PSE, 0);
        assert_eq!(len, PAGE_SIZE as usize);
    }

    #[test]
    fn test_record_offsets() {
        assert_eq!(record_dest_offset(0x5000 | P_RW | x86::PG_DIRTY), 0x5000);
        assert_eq!(record_page_size(0x5000 | P_RW), PAGE_SIZE);
        let block = 0x40_0000 | P_RW | x86::PG_PSE;
        assert_eq!(record_dest_offset(block), 0x40_0000);
        assert_eq!(record_page_size(block), 2 << 20);
    }

    #[test]
    fn test_aarch64_translate() {
        let mem = GuestMemory::new(8 << 20, false, false).unwrap();
        // Same geometry, ARM descriptors: presence is any non-zero entry.
        mem.write_entry(ROOT, PDPT | 0x3).unwrap();
        mem.write_entry(PDPT, PD | 0x3).unwrap();
        mem.write_entry(PD, PT | 0x3).unwrap();
        mem.write_entry(PT + 5 * 8, 0x5000 | 0x403).unwrap();

        let walker = PageWalker::<Aarch64Layout>::new(&mem, ELF_ENTRY);
        assert_eq!(walker.translate(0x5678), (0x5678, 0x6000));
        assert_eq!(walker.translate(0x9000), (0, 0));

        let err = walker
            .scan_marked(ScanFilter::Dirty, false, &mut |_, _| Ok(()))
            .unwrap_err();
        assert!(matches!(err, WalkError::Unsupported));
    }
}
