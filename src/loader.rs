//! Guest image loading.
//!
//! Guests are statically-linked 64-bit ELF executables carrying the
//! project's vendor OSABI tag. Loading is identity placement: every LOAD
//! segment is copied to its physical address in guest memory, no
//! relocation, no interpreter. The first page of the image doubles as the
//! boot header — a fixed-layout block the hypervisor fills in before the
//! first instruction runs and the guest reads during early boot
//! (zero-copy configuration passing).
//!
//! Only the ELF fields needed for that are parsed; everything else in the
//! image is opaque.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

use thiserror::Error;
use vm_memory::ByteValued;

use crate::config::Config;
use crate::mem::{GuestMemory, MemError};

/// ELF identification bytes.
const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];
/// 64-bit class.
const ELFCLASS64: u8 = 2;
/// The project's vendor OSABI tag; anything else is not a guest image.
const VENDOR_OSABI: u8 = 0x42;
/// Executable object file.
const ET_EXEC: u16 = 2;
/// Loadable segment.
const PT_LOAD: u32 = 1;

#[cfg(target_arch = "x86_64")]
const EXPECTED_MACHINE: u16 = 62; // EM_X86_64
#[cfg(target_arch = "aarch64")]
const EXPECTED_MACHINE: u16 = 183; // EM_AARCH64

/// Boot header offsets, relative to the image base.
///
/// The layout is bit-exact guest ABI; the guest kernel reads these fields
/// during early boot and the vCPU bring-up uses `CPU_ONLINE`/`CORE_ID` as
/// its rendezvous slots.
#[cfg(target_arch = "x86_64")]
pub mod hdr {
    /// u64: physical address of the image base.
    pub const PHYS_BASE: u64 = 0x08;
    /// u64: physical memory limit.
    pub const PHYS_LIMIT: u64 = 0x10;
    /// u32: CPU frequency in MHz.
    pub const CPU_FREQ: u64 = 0x18;
    /// u32: cores the guest may bring online.
    pub const NCORES: u64 = 0x24;
    /// u32: cores the guest has brought online so far (guest-written).
    pub const CPU_ONLINE: u64 = 0x20;
    /// u32: id slot of the core currently booting.
    pub const CORE_ID: u64 = 0x30;
    /// u64: total image size, from base to the end of the last segment.
    pub const IMAGE_SIZE: u64 = 0x38;
    /// u32: NUMA node count.
    pub const NUMA_NODES: u64 = 0x60;
    /// u32: hypervisor-present announcement flag.
    pub const ANNOUNCE: u64 = 0x94;
    /// u64: UART hypercall port, written only in verbose runs.
    pub const UART_PORT: u64 = 0x98;
    /// 4 bytes: guest IPv4 address.
    pub const IP: u64 = 0xb0;
    /// 4 bytes: gateway address.
    pub const GATEWAY: u64 = 0xb4;
    /// 4 bytes: network mask.
    pub const MASK: u64 = 0xb8;
    /// u64: host-virtual base of guest memory.
    pub const HOST_BASE: u64 = 0xbc;

    /// Diagnostic log buffer offset from the image base.
    pub const KLOG_OFFSET: u64 = 0x5000;
}

/// Boot header offsets, relative to the image base (ARMv8 layout).
#[cfg(target_arch = "aarch64")]
pub mod hdr {
    pub const PHYS_BASE: u64 = 0x100;
    pub const PHYS_LIMIT: u64 = 0x108;
    pub const CPU_FREQ: u64 = 0x110;
    pub const CPU_ONLINE: u64 = 0x120;
    pub const NCORES: u64 = 0x128;
    pub const CORE_ID: u64 = 0x130;
    pub const ANNOUNCE: u64 = 0x148;
    pub const IMAGE_SIZE: u64 = 0x158;
    pub const IP: u64 = 0xb0;
    pub const GATEWAY: u64 = 0xb4;
    pub const MASK: u64 = 0xb8;
    pub const HOST_BASE: u64 = 0xbc;
    /// u32 on this layout.
    pub const UART_PORT: u64 = 0x174;

    pub const KLOG_OFFSET: u64 = 0x1000;
}

/// Errors while loading a guest image.
#[derive(Error, Debug)]
pub enum LoaderError {
    #[error("unable to read guest image: {0}")]
    Read(#[source] io::Error),

    #[error("invalid guest image: {0}")]
    InvalidImage(&'static str),

    #[error("segment does not fit into guest memory: {0}")]
    Placement(#[from] MemError),
}

#[repr(C)]
#[derive(Debug, Copy, Clone, Default)]
struct Elf64Ehdr {
    e_ident: [u8; 16],
    e_type: u16,
    e_machine: u16,
    e_version: u32,
    e_entry: u64,
    e_phoff: u64,
    e_shoff: u64,
    e_flags: u32,
    e_ehsize: u16,
    e_phentsize: u16,
    e_phnum: u16,
    e_shentsize: u16,
    e_shnum: u16,
    e_shstrndx: u16,
}

#[repr(C)]
#[derive(Debug, Copy, Clone, Default)]
struct Elf64Phdr {
    p_type: u32,
    p_flags: u32,
    p_offset: u64,
    p_vaddr: u64,
    p_paddr: u64,
    p_filesz: u64,
    p_memsz: u64,
    p_align: u64,
}

unsafe impl ByteValued for Elf64Ehdr {}
unsafe impl ByteValued for Elf64Phdr {}

/// What the loader learned about the image it placed.
#[derive(Debug, Clone)]
pub struct LoadedImage {
    /// Guest entry address; the boot header sits on this page and the
    /// guest's page tables one page after it.
    pub entry: u64,
    /// Physical range of the static image, for the walker's identity fast
    /// path (boot-time translations happen before tables exist).
    pub static_mem_start: u64,
    pub static_mem_size: u64,
    /// Guest-physical address of the boot header (image base).
    pub mboot: u64,
    /// Guest-physical address of the early diagnostic log buffer.
    pub klog: u64,
}

/// Load a guest image and populate its boot header.
pub fn load_image(
    mem: &GuestMemory,
    path: &Path,
    config: &Config,
) -> Result<LoadedImage, LoaderError> {
    let mut file = File::open(path).map_err(LoaderError::Read)?;

    let ehdr: Elf64Ehdr = read_obj(&mut file, 0)?;
    validate(&ehdr)?;

    let entry = ehdr.e_entry;
    let mut image = None;
    let mut static_end = 0u64;

    for i in 0..ehdr.e_phnum as u64 {
        let phdr: Elf64Phdr = read_obj(&mut file, ehdr.e_phoff + i * ehdr.e_phentsize as u64)?;
        if phdr.p_type != PT_LOAD {
            continue;
        }

        let dest = mem.slice_mut(phdr.p_paddr, phdr.p_filesz)?;
        file.seek(SeekFrom::Start(phdr.p_offset))
            .map_err(LoaderError::Read)?;
        file.read_exact(dest).map_err(LoaderError::Read)?;
        tracing::debug!(
            paddr = format_args!("{:#x}", phdr.p_paddr),
            filesz = phdr.p_filesz,
            memsz = phdr.p_memsz,
            "loaded segment"
        );

        let loaded = image.get_or_insert_with(|| LoadedImage {
            entry,
            static_mem_start: phdr.p_paddr,
            static_mem_size: 0,
            mboot: phdr.p_paddr,
            klog: phdr.p_paddr + hdr::KLOG_OFFSET,
        });
        static_end = static_end.max(phdr.p_paddr + phdr.p_memsz);

        // The running total lands in the header so the guest knows where
        // its static image ends.
        mem.write_obj(
            loaded.mboot + hdr::IMAGE_SIZE,
            &(static_end - loaded.static_mem_start),
        )?;
    }

    let mut loaded = image.ok_or(LoaderError::InvalidImage("no loadable segments"))?;
    loaded.static_mem_size = static_end - loaded.static_mem_start;

    write_boot_header(mem, loaded.mboot, config)?;

    Ok(loaded)
}

fn validate(ehdr: &Elf64Ehdr) -> Result<(), LoaderError> {
    if ehdr.e_ident[..4] != ELF_MAGIC {
        return Err(LoaderError::InvalidImage("bad magic"));
    }
    if ehdr.e_ident[4] != ELFCLASS64 {
        return Err(LoaderError::InvalidImage("not a 64-bit image"));
    }
    if ehdr.e_ident[7] != VENDOR_OSABI {
        return Err(LoaderError::InvalidImage("wrong OSABI tag"));
    }
    if ehdr.e_type != ET_EXEC {
        return Err(LoaderError::InvalidImage("not an executable"));
    }
    if ehdr.e_machine != EXPECTED_MACHINE {
        return Err(LoaderError::InvalidImage("wrong machine type"));
    }
    Ok(())
}

fn read_obj<T: ByteValued + Default>(file: &mut File, offset: u64) -> Result<T, LoaderError> {
    let mut value = T::default();
    file.seek(SeekFrom::Start(offset))
        .map_err(LoaderError::Read)?;
    file.read_exact(value.as_mut_slice())
        .map_err(LoaderError::Read)?;
    Ok(value)
}

/// Fill the boot header at the image base.
///
/// `NCORES` is seeded with 1 here and overwritten with the real core count
/// right before the vCPUs start (restores skip the loader entirely, the
/// overwrite must happen either way).
fn write_boot_header(mem: &GuestMemory, mboot: u64, config: &Config) -> Result<(), MemError> {
    mem.write_obj(mboot + hdr::PHYS_BASE, &mboot)?;
    #[cfg(target_arch = "x86_64")]
    mem.write_obj(mboot + hdr::PHYS_LIMIT, &mem.size())?;
    #[cfg(target_arch = "aarch64")]
    mem.write_obj(mboot + hdr::PHYS_LIMIT, &(mem.size() - crate::mem::PAGE_SIZE))?;
    mem.write_obj(mboot + hdr::CPU_FREQ, &cpu_freq_mhz())?;
    mem.write_obj(mboot + hdr::NCORES, &1u32)?;
    mem.write_obj(mboot + hdr::CORE_ID, &0u32)?;
    #[cfg(target_arch = "x86_64")]
    mem.write_obj(mboot + hdr::NUMA_NODES, &1u32)?;
    mem.write_obj(mboot + hdr::ANNOUNCE, &1u32)?;
    if config.verbose {
        #[cfg(target_arch = "x86_64")]
        mem.write_obj(mboot + hdr::UART_PORT, &crate::hypercall::PORT_UART)?;
        #[cfg(target_arch = "aarch64")]
        mem.write_obj(mboot + hdr::UART_PORT, &(crate::hypercall::PORT_UART as u32))?;
    }

    if let Some(ip) = config.ip {
        mem.write_bytes(mboot + hdr::IP, &ip.octets())?;
    }
    if let Some(gateway) = config.gateway {
        mem.write_bytes(mboot + hdr::GATEWAY, &gateway.octets())?;
    }
    if let Some(mask) = config.mask {
        mem.write_bytes(mboot + hdr::MASK, &mask.octets())?;
    }

    mem.write_obj(mboot + hdr::HOST_BASE, &mem.host_base())?;

    Ok(())
}

/// Host CPU frequency in MHz, for the guest's timer calibration.
fn cpu_freq_mhz() -> u32 {
    // cpufreq sysfs reports kHz.
    if let Ok(text) =
        std::fs::read_to_string("/sys/devices/system/cpu/cpu0/cpufreq/cpuinfo_max_freq")
    {
        if let Ok(khz) = text.trim().parse::<u64>() {
            return (khz / 1000) as u32;
        }
    }
    if let Ok(text) = std::fs::read_to_string("/proc/cpuinfo") {
        for line in text.lines() {
            if let Some(value) = line.strip_prefix("cpu MHz") {
                if let Ok(mhz) = value.trim_start_matches([' ', '\t', ':']).parse::<f64>() {
                    return mhz as u32;
                }
            }
        }
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const ENTRY: u64 = 0x20_0000;

    fn test_config() -> Config {
        Config {
            guest_size: 8 << 20,
            ncores: 1,
            verbose: false,
            netif: None,
            ip: Some("10.0.5.2".parse().unwrap()),
            gateway: None,
            mask: None,
            checkpoint_interval: 0,
            full_checkpoint: false,
            migration_server: false,
            migration_target: None,
            migration_params: Default::default(),
            debug: false,
            mergeable: false,
            hugepage: false,
        }
    }

    /// A minimal valid image: one LOAD segment with a recognizable payload.
    fn write_test_image(payload: &[u8]) -> tempfile::NamedTempFile {
        let mut ehdr = Elf64Ehdr::default();
        ehdr.e_ident[..4].copy_from_slice(&ELF_MAGIC);
        ehdr.e_ident[4] = ELFCLASS64;
        ehdr.e_ident[7] = VENDOR_OSABI;
        ehdr.e_type = ET_EXEC;
        ehdr.e_machine = EXPECTED_MACHINE;
        ehdr.e_entry = ENTRY;
        ehdr.e_phoff = std::mem::size_of::<Elf64Ehdr>() as u64;
        ehdr.e_phentsize = std::mem::size_of::<Elf64Phdr>() as u16;
        ehdr.e_phnum = 1;

        let phdr = Elf64Phdr {
            p_type: PT_LOAD,
            p_offset: ehdr.e_phoff + std::mem::size_of::<Elf64Phdr>() as u64,
            p_vaddr: ENTRY,
            p_paddr: ENTRY,
            p_filesz: payload.len() as u64,
            p_memsz: payload.len() as u64 + 0x1000, // trailing BSS
            ..Default::default()
        };

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(ehdr.as_slice()).unwrap();
        file.write_all(phdr.as_slice()).unwrap();
        file.write_all(payload).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_load_image_places_segment() {
        let mem = GuestMemory::new(8 << 20, false, false).unwrap();
        let image = write_test_image(b"unikernel text");

        let loaded = load_image(&mem, image.path(), &test_config()).unwrap();
        assert_eq!(loaded.entry, ENTRY);
        assert_eq!(loaded.mboot, ENTRY);
        assert_eq!(loaded.klog, ENTRY + hdr::KLOG_OFFSET);
        assert_eq!(loaded.static_mem_start, ENTRY);
        assert_eq!(loaded.static_mem_size, 14 + 0x1000);

        let mut buf = [0u8; 14];
        mem.read_bytes(ENTRY, &mut buf).unwrap();
        assert_eq!(&buf, b"unikernel text");
    }

    #[test]
    fn test_boot_header_contents() {
        let mem = GuestMemory::new(8 << 20, false, false).unwrap();
        let image = write_test_image(b"x");
        load_image(&mem, image.path(), &test_config()).unwrap();

        assert_eq!(mem.read_obj::<u64>(ENTRY + hdr::PHYS_BASE).unwrap(), ENTRY);
        assert_eq!(
            mem.read_obj::<u64>(ENTRY + hdr::PHYS_LIMIT).unwrap(),
            8 << 20
        );
        assert_eq!(mem.read_obj::<u32>(ENTRY + hdr::NCORES).unwrap(), 1);
        assert_eq!(mem.read_obj::<u32>(ENTRY + hdr::ANNOUNCE).unwrap(), 1);
        assert_eq!(
            mem.read_obj::<u64>(ENTRY + hdr::IMAGE_SIZE).unwrap(),
            1 + 0x1000
        );
        assert_eq!(
            mem.read_obj::<u64>(ENTRY + hdr::HOST_BASE).unwrap(),
            mem.host_base()
        );
        let mut ip = [0u8; 4];
        mem.read_bytes(ENTRY + hdr::IP, &mut ip).unwrap();
        assert_eq!(ip, [10, 0, 5, 2]);
    }

    #[test]
    fn test_rejects_foreign_images() {
        let mem = GuestMemory::new(8 << 20, false, false).unwrap();

        let mut bad_magic = write_test_image(b"x");
        bad_magic.as_file_mut().seek(SeekFrom::Start(0)).unwrap();
        bad_magic.as_file_mut().write_all(b"\x7fBAD").unwrap();
        assert!(matches!(
            load_image(&mem, bad_magic.path(), &test_config()),
            Err(LoaderError::InvalidImage("bad magic"))
        ));

        // A plain Linux binary (OSABI 0) is not a guest image.
        let mut wrong_abi = write_test_image(b"x");
        wrong_abi.as_file_mut().seek(SeekFrom::Start(7)).unwrap();
        wrong_abi.as_file_mut().write_all(&[0]).unwrap();
        assert!(matches!(
            load_image(&mem, wrong_abi.path(), &test_config()),
            Err(LoaderError::InvalidImage("wrong OSABI tag"))
        ));
    }
}
