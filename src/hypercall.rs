//! The hypercall ABI and its host-side handlers.
//!
//! A hypercall is a guest I/O write to one of the reserved ports below. The
//! written value is the guest-physical address of a per-call argument
//! structure; the handler materializes it from guest memory, performs the
//! host-side effect and writes results back through the same structure.
//!
//! Buffer pointers inside WRITE/READ arguments are guest-*virtual*: the
//! guest hands out heap addresses, so every buffer traversal goes through
//! the page walker and is chunked at page boundaries. One logical transfer
//! may issue several host syscalls when the underlying mappings are not
//! physically contiguous. All other pointer fields (path names, argv/envp
//! destinations) are guest-physical by ABI.
//!
//! Argument structures are `#[repr(C, packed)]` and byte-compatible with
//! the guest's declarations; sizes are pinned by tests at the bottom.

use std::io::{self, Write as _};

use thiserror::Error;
use vm_memory::ByteValued;

use crate::hypervisor::Hypervisor;
use crate::mem::MemError;
use crate::paging::{ArchLayout, PageWalker};

pub const PORT_WRITE: u64 = 0x400;
pub const PORT_OPEN: u64 = 0x440;
pub const PORT_CLOSE: u64 = 0x480;
pub const PORT_READ: u64 = 0x500;
pub const PORT_EXIT: u64 = 0x540;
pub const PORT_LSEEK: u64 = 0x580;
pub const PORT_NETINFO: u64 = 0x600;
pub const PORT_NETWRITE: u64 = 0x640;
pub const PORT_NETREAD: u64 = 0x680;
pub const PORT_NETSTAT: u64 = 0x700;
pub const PORT_CMDSIZE: u64 = 0x740;
pub const PORT_CMDVAL: u64 = 0x780;
pub const PORT_UART: u64 = 0x800;

/// Most argv entries / environment variables forwarded to the guest.
pub const MAX_ARGC_ENVC: usize = 128;

/// Errors that terminate the hypervisor from inside a hypercall.
///
/// Host syscall failures do NOT land here; they are reported to the guest
/// through the argument structure's return field.
#[derive(Error, Debug)]
pub enum HypercallError {
    #[error(transparent)]
    Mem(#[from] MemError),

    /// The guest handed us a virtual buffer address its page tables do not
    /// map.
    #[error("unmapped guest buffer address {0:#x}")]
    UnmappedBuffer(u64),

    #[error("unhandled hypercall port {0:#x}")]
    UnhandledPort(u64),
}

/// Outcome of a dispatched hypercall.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HypercallResult {
    /// Re-enter the guest.
    Continue,
    /// The guest requested exit with this code (EXIT hypercall).
    GuestExit(i32),
}

#[repr(C, packed)]
#[derive(Debug, Copy, Clone)]
struct WriteArgs {
    fd: i32,
    buf: u64,
    len: u64,
}

#[repr(C, packed)]
#[derive(Debug, Copy, Clone)]
struct ReadArgs {
    fd: i32,
    buf: u64,
    len: u64,
    ret: i64,
}

#[repr(C, packed)]
#[derive(Debug, Copy, Clone)]
struct OpenArgs {
    name: u64,
    flags: i32,
    mode: i32,
    ret: i32,
}

#[repr(C, packed)]
#[derive(Debug, Copy, Clone)]
struct CloseArgs {
    fd: i32,
    ret: i32,
}

#[repr(C, packed)]
#[derive(Debug, Copy, Clone)]
struct LseekArgs {
    fd: i32,
    offset: i64,
    whence: i32,
}

#[repr(C, packed)]
#[derive(Copy, Clone)]
struct NetinfoArgs {
    mac_str: [u8; 18],
}

#[repr(C, packed)]
#[derive(Debug, Copy, Clone)]
struct NetwriteArgs {
    data: u64,
    len: u64,
    ret: i32,
}

#[repr(C, packed)]
#[derive(Debug, Copy, Clone)]
struct NetreadArgs {
    data: u64,
    len: u64,
    ret: i32,
}

#[repr(C, packed)]
#[derive(Debug, Copy, Clone)]
struct NetstatArgs {
    status: i32,
}

#[repr(C, packed)]
#[derive(Copy, Clone)]
struct CmdsizeArgs {
    argc: i32,
    argsz: [i32; MAX_ARGC_ENVC],
    envc: i32,
    envsz: [i32; MAX_ARGC_ENVC],
}

#[repr(C, packed)]
#[derive(Debug, Copy, Clone)]
struct CmdvalArgs {
    argv: u64,
    envp: u64,
}

// Packed plain-data ABI structs.
unsafe impl ByteValued for WriteArgs {}
unsafe impl ByteValued for ReadArgs {}
unsafe impl ByteValued for OpenArgs {}
unsafe impl ByteValued for CloseArgs {}
unsafe impl ByteValued for LseekArgs {}
unsafe impl ByteValued for NetinfoArgs {}
unsafe impl ByteValued for NetwriteArgs {}
unsafe impl ByteValued for NetreadArgs {}
unsafe impl ByteValued for NetstatArgs {}
unsafe impl ByteValued for CmdsizeArgs {}
unsafe impl ByteValued for CmdvalArgs {}

/// Dispatch one hypercall exit.
///
/// `data` is the value the guest wrote to `port`: the guest-physical
/// address of the argument structure (or, for UART, the byte itself).
pub fn dispatch(
    hv: &Hypervisor,
    core_id: u32,
    port: u64,
    data: u32,
) -> Result<HypercallResult, HypercallError> {
    let addr = data as u64;

    match port {
        PORT_UART => {
            if hv.config.verbose {
                let _ = io::stderr().write_all(&[data as u8]);
            }
        }
        PORT_WRITE => handle_write(hv, addr)?,
        PORT_READ => handle_read(hv, addr)?,
        PORT_OPEN => handle_open(hv, addr)?,
        PORT_CLOSE => handle_close(hv, addr)?,
        PORT_LSEEK => handle_lseek(hv, addr)?,
        PORT_EXIT => {
            let code: i32 = hv.mem.read_obj(addr)?;
            tracing::debug!(core_id, code, "guest exit hypercall");
            return Ok(HypercallResult::GuestExit(code));
        }
        PORT_NETINFO => handle_netinfo(hv, addr)?,
        PORT_NETWRITE => handle_netwrite(hv, addr)?,
        PORT_NETREAD => handle_netread(hv, addr)?,
        PORT_NETSTAT => handle_netstat(hv, addr)?,
        PORT_CMDSIZE => handle_cmdsize(hv, addr)?,
        PORT_CMDVAL => handle_cmdval(hv, addr)?,
        other => return Err(HypercallError::UnhandledPort(other)),
    }

    Ok(HypercallResult::Continue)
}

fn walker(hv: &Hypervisor) -> PageWalker<'_, ArchLayout> {
    hv.page_walker()
}

fn handle_write(hv: &Hypervisor, addr: u64) -> Result<(), HypercallError> {
    let mut args: WriteArgs = hv.mem.read_obj(addr)?;
    let walker = walker(hv);

    let mut remaining = args.len;
    let mut written: u64 = 0;
    while remaining > 0 {
        let vaddr = args.buf + written;
        let (paddr, page_end) = walker.translate(vaddr);
        if page_end == 0 {
            return Err(HypercallError::UnmappedBuffer(vaddr));
        }

        let step = remaining.min(page_end - paddr);
        let chunk = hv.mem.slice(paddr, step)?;
        let n = host_write(args.fd, chunk);
        if n < 0 {
            break;
        }
        written += n as u64;
        if (n as u64) < step {
            break;
        }
        remaining -= step;
    }

    args.len = written;
    hv.mem.write_obj(addr, &args)?;
    Ok(())
}

fn handle_read(hv: &Hypervisor, addr: u64) -> Result<(), HypercallError> {
    let mut args: ReadArgs = hv.mem.read_obj(addr)?;
    let walker = walker(hv);

    let mut remaining = args.len;
    let mut read: u64 = 0;
    while remaining > 0 {
        let vaddr = args.buf + read;
        let (paddr, page_end) = walker.translate(vaddr);
        if page_end == 0 {
            return Err(HypercallError::UnmappedBuffer(vaddr));
        }

        let step = remaining.min(page_end - paddr);
        let chunk = hv.mem.slice_mut(paddr, step)?;
        let n = host_read(args.fd, chunk);
        if n < 0 {
            if read == 0 {
                args.ret = -1;
                hv.mem.write_obj(addr, &args)?;
                return Ok(());
            }
            break;
        }
        read += n as u64;
        if (n as u64) < step {
            break;
        }
        remaining -= step;
    }

    args.ret = read as i64;
    hv.mem.write_obj(addr, &args)?;
    Ok(())
}

fn handle_open(hv: &Hypervisor, addr: u64) -> Result<(), HypercallError> {
    use std::os::unix::ffi::OsStrExt;

    let mut args: OpenArgs = hv.mem.read_obj(addr)?;
    let name = hv.mem.read_cstring(args.name)?;
    let path = std::path::Path::new(std::ffi::OsStr::from_bytes(&name));

    // The guest never gets a handle to its own accelerator.
    args.ret = if opens_accelerator(path) {
        -1
    } else {
        let mut cname = name.clone();
        cname.push(0);
        unsafe { libc::open(cname.as_ptr().cast(), args.flags, args.mode as libc::c_uint) }
    };

    hv.mem.write_obj(addr, &args)?;
    Ok(())
}

/// Whether a guest-supplied path resolves to the accelerator device.
fn opens_accelerator(path: &std::path::Path) -> bool {
    match std::fs::canonicalize(path) {
        Ok(resolved) => resolved == std::path::Path::new("/dev/kvm"),
        // Nonexistent paths cannot be the device node.
        Err(_) => false,
    }
}

fn handle_close(hv: &Hypervisor, addr: u64) -> Result<(), HypercallError> {
    let mut args: CloseArgs = hv.mem.read_obj(addr)?;
    // The guest shares our stdio; closing it is a silent no-op.
    args.ret = if args.fd > 2 {
        unsafe { libc::close(args.fd) }
    } else {
        0
    };
    hv.mem.write_obj(addr, &args)?;
    Ok(())
}

fn handle_lseek(hv: &Hypervisor, addr: u64) -> Result<(), HypercallError> {
    let mut args: LseekArgs = hv.mem.read_obj(addr)?;
    args.offset = unsafe { libc::lseek(args.fd, args.offset, args.whence) };
    hv.mem.write_obj(addr, &args)?;
    Ok(())
}

fn handle_netinfo(hv: &Hypervisor, addr: u64) -> Result<(), HypercallError> {
    let mut args: NetinfoArgs = hv.mem.read_obj(addr)?;
    args.mac_str = hv.net.mac_string();
    hv.mem.write_obj(addr, &args)?;
    // The guest is configuring its interface; time to deliver interrupts.
    hv.net.start_poll_thread(&hv.vm);
    Ok(())
}

fn handle_netwrite(hv: &Hypervisor, addr: u64) -> Result<(), HypercallError> {
    let mut args: NetwriteArgs = hv.mem.read_obj(addr)?;
    let Some(netfd) = hv.net.fd() else {
        args.ret = -1;
        hv.mem.write_obj(addr, &args)?;
        return Ok(());
    };

    let frame = hv.mem.slice(args.data, args.len)?;
    let mut sent = 0usize;
    while sent < frame.len() {
        let n = host_write(netfd, &frame[sent..]);
        if n < 0 {
            break;
        }
        sent += n as usize;
    }
    args.ret = 0;
    args.len = sent as u64;
    hv.mem.write_obj(addr, &args)?;
    Ok(())
}

fn handle_netread(hv: &Hypervisor, addr: u64) -> Result<(), HypercallError> {
    let mut args: NetreadArgs = hv.mem.read_obj(addr)?;
    let Some(netfd) = hv.net.fd() else {
        args.ret = -1;
        hv.mem.write_obj(addr, &args)?;
        return Ok(());
    };

    let buf = hv.mem.slice_mut(args.data, args.len)?;
    let n = host_read(netfd, buf);
    if n > 0 {
        args.len = n as u64;
        args.ret = 0;
    } else {
        // Queue drained; let the poll thread arm the next interrupt edge.
        args.ret = -1;
        hv.net.queue_drained();
    }
    hv.mem.write_obj(addr, &args)?;
    Ok(())
}

fn handle_netstat(hv: &Hypervisor, addr: u64) -> Result<(), HypercallError> {
    let mut args: NetstatArgs = hv.mem.read_obj(addr)?;
    args.status = i32::from(hv.config.netif.is_some());
    hv.mem.write_obj(addr, &args)?;
    Ok(())
}

fn handle_cmdsize(hv: &Hypervisor, addr: u64) -> Result<(), HypercallError> {
    let mut args: CmdsizeArgs = hv.mem.read_obj(addr)?;

    let mut argsz = [0i32; MAX_ARGC_ENVC];
    for (i, arg) in hv.guest_argv.iter().enumerate() {
        argsz[i] = arg.len() as i32 + 1;
    }
    let mut envsz = [0i32; MAX_ARGC_ENVC];
    for (i, var) in hv.guest_envp.iter().enumerate() {
        envsz[i] = var.len() as i32 + 1;
    }
    args.argc = hv.guest_argv.len() as i32;
    args.argsz = argsz;
    args.envc = hv.guest_envp.len() as i32;
    args.envsz = envsz;

    hv.mem.write_obj(addr, &args)?;
    Ok(())
}

fn handle_cmdval(hv: &Hypervisor, addr: u64) -> Result<(), HypercallError> {
    let args: CmdvalArgs = hv.mem.read_obj(addr)?;

    // argv/envp point to guest-physical arrays of guest-physical string
    // destinations the guest allocated after CMDSIZE.
    copy_string_table(hv, args.argv, &hv.guest_argv)?;
    copy_string_table(hv, args.envp, &hv.guest_envp)?;
    Ok(())
}

fn copy_string_table(
    hv: &Hypervisor,
    table: u64,
    strings: &[Vec<u8>],
) -> Result<(), HypercallError> {
    for (i, string) in strings.iter().enumerate() {
        let dest: u64 = hv.mem.read_obj(table + (i as u64) * 8)?;
        hv.mem.write_bytes(dest, string)?;
        hv.mem.write_obj(dest + string.len() as u64, &0u8)?;
    }
    Ok(())
}

/// write(2) with EINTR retry; returns -1 on failure like the raw syscall.
fn host_write(fd: i32, buf: &[u8]) -> isize {
    loop {
        let n = unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) };
        if n < 0 && io::Error::last_os_error().raw_os_error() == Some(libc::EINTR) {
            continue;
        }
        return n;
    }
}

/// read(2) with EINTR retry.
fn host_read(fd: i32, buf: &mut [u8]) -> isize {
    loop {
        let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
        if n < 0 && io::Error::last_os_error().raw_os_error() == Some(libc::EINTR) {
            continue;
        }
        return n;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// The guest compiles these structures from its own headers; the sizes
    /// are ABI.
    #[test]
    fn test_argument_struct_sizes() {
        assert_eq!(std::mem::size_of::<WriteArgs>(), 20);
        assert_eq!(std::mem::size_of::<ReadArgs>(), 28);
        assert_eq!(std::mem::size_of::<OpenArgs>(), 20);
        assert_eq!(std::mem::size_of::<CloseArgs>(), 8);
        assert_eq!(std::mem::size_of::<LseekArgs>(), 16);
        assert_eq!(std::mem::size_of::<NetinfoArgs>(), 18);
        assert_eq!(std::mem::size_of::<NetwriteArgs>(), 20);
        assert_eq!(std::mem::size_of::<NetreadArgs>(), 20);
        assert_eq!(std::mem::size_of::<NetstatArgs>(), 4);
        assert_eq!(
            std::mem::size_of::<CmdsizeArgs>(),
            8 + 2 * 4 * MAX_ARGC_ENVC
        );
        assert_eq!(std::mem::size_of::<CmdvalArgs>(), 16);
    }

    #[test]
    fn test_opens_accelerator() {
        use std::path::Path;

        if Path::new("/dev/kvm").exists() {
            assert!(opens_accelerator(Path::new("/dev/kvm")));
            // Path tricks resolve before the comparison.
            assert!(opens_accelerator(Path::new("/dev/../dev/kvm")));
        }
        assert!(!opens_accelerator(Path::new("/dev/null")));
        assert!(!opens_accelerator(Path::new("/no/such/file")));
    }
}
