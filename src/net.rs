//! TAP network bridge.
//!
//! Guest networking rides on a host TAP interface named by `HERMIT_NETIF`.
//! Frames move through the NETREAD/NETWRITE hypercalls; what this module
//! adds is the interrupt path for host→guest traffic:
//!
//! 1. a dedicated poll thread blocks on the TAP fd,
//! 2. on readability it raises an edge by writing to an eventfd that is
//!    wired to guest IRQ 11 through `KVM_IRQFD`,
//! 3. it then sleeps on a semaphore until the guest's NETREAD drains the
//!    queue and posts it.
//!
//! That gives at-most-once interrupt delivery per readability edge; the
//! guest polls the remaining frames itself.

use std::fs::File;
use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use thiserror::Error;
use vmm_sys_util::eventfd::EventFd;
use vmm_sys_util::ioctl::ioctl_with_mut_ref;
use vmm_sys_util::{ioctl_ioc_nr, ioctl_iow_nr};

use crate::kvm::VmHandle;

/// Guest interrupt line for incoming frames.
pub const IRQ_NET: u32 = 11;

// See linux/if_tun.h; 'T' is the TUN/TAP ioctl type.
ioctl_iow_nr!(TUNSETIFF, 84, 202, libc::c_int);

/// Errors from the network bridge.
#[derive(Error, Debug)]
pub enum NetError {
    #[error("failed to open /dev/net/tun: {0}")]
    OpenTun(#[source] io::Error),

    #[error("failed to attach TAP interface '{0}': {1}")]
    Attach(String, #[source] io::Error),

    #[error("failed to query the MAC of '{0}': {1}")]
    QueryMac(String, #[source] io::Error),
}

/// A counting semaphore; the poll thread waits, NETREAD posts.
struct Semaphore {
    count: Mutex<u32>,
    cond: Condvar,
}

impl Semaphore {
    fn new() -> Self {
        Self {
            count: Mutex::new(0),
            cond: Condvar::new(),
        }
    }

    fn post(&self) {
        let mut count = self.count.lock().unwrap();
        *count += 1;
        self.cond.notify_one();
    }

    fn wait(&self) {
        let mut count = self.count.lock().unwrap();
        while *count == 0 {
            count = self.cond.wait(count).unwrap();
        }
        *count -= 1;
    }
}

/// An attached host TAP device.
struct TapDevice {
    file: File,
    name: String,
    mac_str: [u8; 18],
}

impl TapDevice {
    /// Open `/dev/net/tun` and attach to the named interface, non-blocking.
    fn open(name: &str) -> Result<Self, NetError> {
        let fd = unsafe {
            libc::open(
                c"/dev/net/tun".as_ptr(),
                libc::O_RDWR | libc::O_NONBLOCK | libc::O_CLOEXEC,
            )
        };
        if fd < 0 {
            return Err(NetError::OpenTun(io::Error::last_os_error()));
        }
        let file = unsafe { File::from_raw_fd(fd) };

        let mut req: libc::ifreq = unsafe { std::mem::zeroed() };
        let name_bytes = name.as_bytes();
        if name_bytes.len() >= req.ifr_name.len() {
            return Err(NetError::Attach(
                name.to_string(),
                io::Error::from(io::ErrorKind::InvalidInput),
            ));
        }
        for (dst, src) in req.ifr_name.iter_mut().zip(name_bytes) {
            *dst = *src as libc::c_char;
        }
        req.ifr_ifru.ifru_flags = (libc::IFF_TAP | libc::IFF_NO_PI) as libc::c_short;

        let ret = unsafe { ioctl_with_mut_ref(&file, TUNSETIFF(), &mut req) };
        if ret < 0 {
            return Err(NetError::Attach(
                name.to_string(),
                io::Error::last_os_error(),
            ));
        }

        let mac_str = query_mac(name)?;
        Ok(Self {
            file,
            name: name.to_string(),
            mac_str,
        })
    }
}

/// Read the interface MAC and format it as the NUL-terminated
/// `xx:xx:xx:xx:xx:xx` string the NETINFO hypercall returns.
fn query_mac(name: &str) -> Result<[u8; 18], NetError> {
    let sock = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
    if sock < 0 {
        return Err(NetError::QueryMac(
            name.to_string(),
            io::Error::last_os_error(),
        ));
    }

    let mut req: libc::ifreq = unsafe { std::mem::zeroed() };
    for (dst, src) in req.ifr_name.iter_mut().zip(name.as_bytes()) {
        *dst = *src as libc::c_char;
    }
    let ret = unsafe { libc::ioctl(sock, libc::SIOCGIFHWADDR, &mut req) };
    unsafe { libc::close(sock) };
    if ret < 0 {
        return Err(NetError::QueryMac(
            name.to_string(),
            io::Error::last_os_error(),
        ));
    }

    let hwaddr = unsafe { req.ifr_ifru.ifru_hwaddr };
    let mut mac = [0u8; 6];
    for (dst, src) in mac.iter_mut().zip(&hwaddr.sa_data[..6]) {
        *dst = *src as u8;
    }
    Ok(format_mac(&mac))
}

fn format_mac(mac: &[u8; 6]) -> [u8; 18] {
    let text = format!(
        "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
    );
    let mut out = [0u8; 18];
    out[..17].copy_from_slice(text.as_bytes());
    out
}

/// The guest-facing network bridge. Present but inert when `HERMIT_NETIF`
/// is unset: NETSTAT then reports "no interface" and reads/writes fail
/// into the guest's return fields.
pub struct NetworkBridge {
    tap: Option<TapDevice>,
    poll_started: AtomicBool,
    drained: Arc<Semaphore>,
}

impl NetworkBridge {
    pub fn new(netif: Option<&str>) -> Result<Self, NetError> {
        let tap = match netif {
            Some(name) => {
                let tap = TapDevice::open(name)?;
                tracing::info!(interface = %tap.name, "network bridge attached");
                Some(tap)
            }
            None => None,
        };
        Ok(Self {
            tap,
            poll_started: AtomicBool::new(false),
            drained: Arc::new(Semaphore::new()),
        })
    }

    /// The TAP fd for NETREAD/NETWRITE, if networking is configured.
    pub fn fd(&self) -> Option<RawFd> {
        self.tap.as_ref().map(|t| t.file.as_raw_fd())
    }

    /// The NUL-terminated MAC string (all zeroes without an interface).
    pub fn mac_string(&self) -> [u8; 18] {
        self.tap.as_ref().map(|t| t.mac_str).unwrap_or([0; 18])
    }

    /// The guest drained the receive queue; re-arm the poll thread.
    pub fn queue_drained(&self) {
        self.drained.post();
    }

    /// Wire the interrupt eventfd and start the poll thread. Idempotent;
    /// called from the first NETINFO hypercall.
    pub fn start_poll_thread(&self, vm: &VmHandle) {
        let Some(tap) = &self.tap else {
            return;
        };
        if self.poll_started.swap(true, Ordering::SeqCst) {
            return;
        }

        let event = match EventFd::new(0) {
            Ok(fd) => fd,
            Err(e) => {
                tracing::error!("interrupt eventfd unavailable: {e}");
                return;
            }
        };
        if let Err(e) = vm.register_irqfd(&event, IRQ_NET) {
            tracing::error!("failed to wire network irqfd: {e}");
            return;
        }

        let tap_fd = tap.file.as_raw_fd();
        let drained = Arc::clone(&self.drained);
        std::thread::Builder::new()
            .name("net-poll".into())
            .spawn(move || poll_loop(tap_fd, event, drained))
            .expect("spawning the network poll thread");
    }
}

/// Wait for TAP readability, kick the guest, sleep until it drained.
fn poll_loop(tap_fd: RawFd, event: EventFd, drained: Arc<Semaphore>) {
    use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

    // The fd stays open for the process lifetime; the bridge never drops
    // its TAP while this thread runs.
    let borrowed = unsafe { BorrowedFd::borrow_raw(tap_fd) };
    loop {
        let mut fds = [PollFd::new(borrowed, PollFlags::POLLIN)];
        match poll(&mut fds, PollTimeout::NONE) {
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => {
                tracing::error!("network poll failed: {e}");
                return;
            }
            Ok(0) => continue,
            Ok(_) => {
                if let Err(e) = event.write(1) {
                    tracing::error!("failed to raise network irq: {e}");
                    return;
                }
                drained.wait();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_mac() {
        let mac = format_mac(&[0xde, 0xad, 0xbe, 0xef, 0x00, 0x42]);
        assert_eq!(&mac[..17], b"de:ad:be:ef:00:42");
        assert_eq!(mac[17], 0);
    }

    #[test]
    fn test_unconfigured_bridge_is_inert() {
        let bridge = NetworkBridge::new(None).unwrap();
        assert!(bridge.fd().is_none());
        assert_eq!(bridge.mac_string(), [0u8; 18]);
    }

    #[test]
    fn test_semaphore_counts() {
        let sem = Semaphore::new();
        sem.post();
        sem.post();
        sem.wait();
        sem.wait();
        // A third wait would block; counting is exact.
        assert_eq!(*sem.count.lock().unwrap(), 0);
    }
}
