//! Live/cold migration of a running guest to a peer instance.
//!
//! The source connects to the destination (port 1337), exchanges a
//! parameter block and a metadata record, then moves guest memory as
//! `(entry, page)` records — the same encoding checkpoints use, so the
//! destination places each page at the offset its entry encodes.
//!
//! **Live** migrations run up to [`MIG_ITERS`] pre-copy passes over the
//! dirty-page scan while the guest keeps running; every pass clears the
//! marks it consumed and the loop stops early when a pass comes up empty.
//! Pre-copy makes no freshness promise beyond "every page modified before
//! the freeze is delivered at least once" — duplicates are fine, the
//! destination applies last-writer-wins by address.
//!
//! **Stop-and-copy** freezes every vCPU through the migration signal, takes
//! the final memory pass (dirty scan for live; complete or accessed-only
//! dump for cold), then ships the per-core register snapshots and the guest
//! clock. The source process exits once the destination has everything.
//!
//! Transports implement [`Transport`]: a TCP byte stream
//! ([`stream::StreamTransport`]) and, behind the `rdma` feature, one-sided
//! RDMA writes ([`rdma::RdmaTransport`]).

pub mod stream;

#[cfg(feature = "rdma")]
pub mod rdma;

use std::io::{self, Write as _};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use vm_memory::ByteValued;

use crate::checkpoint::ClockRecord;
use crate::config::{MigrationMode, MigrationParams, MigrationType, MIGRATION_PORT};
use crate::hypervisor::{sig_migration, Hypervisor};
use crate::kvm::{KvmError, VcpuState, VmHandle};
use crate::mem::{GuestMemory, MemError, PAGE_2M_BITS, PAGE_SIZE};
use crate::paging::{x86, ScanFilter, WalkError};

/// Upper bound on pre-copy passes before stop-and-copy.
pub const MIG_ITERS: u32 = 4;

#[derive(Error, Debug)]
pub enum MigrationError {
    #[error("migration transport failed: {0}")]
    Transport(#[source] io::Error),

    #[error("malformed migration stream: {0}")]
    Protocol(String),

    #[error(transparent)]
    Mem(#[from] MemError),

    #[error(transparent)]
    Kvm(#[from] KvmError),

    #[error(transparent)]
    Walk(#[from] WalkError),

    #[error("no vCPU threads to migrate")]
    NotRunning,
}

/// First record on the wire: how the peers will talk.
#[repr(C)]
#[derive(Debug, Copy, Clone, Default)]
pub struct WireParams {
    type_: u32,
    mode: u32,
    use_odp: u8,
    prefetch: u8,
    _pad: [u8; 2],
}

unsafe impl ByteValued for WireParams {}

impl From<MigrationParams> for WireParams {
    fn from(params: MigrationParams) -> Self {
        Self {
            type_: match params.type_ {
                MigrationType::Cold => 0,
                MigrationType::Live => 1,
            },
            mode: match params.mode {
                MigrationMode::CompleteDump => 0,
                MigrationMode::IncrementalDump => 1,
            },
            use_odp: u8::from(params.use_odp),
            prefetch: u8::from(params.prefetch),
            _pad: [0; 2],
        }
    }
}

impl From<WireParams> for MigrationParams {
    fn from(wire: WireParams) -> Self {
        Self {
            type_: if wire.type_ == 1 {
                MigrationType::Live
            } else {
                MigrationType::Cold
            },
            mode: if wire.mode == 1 {
                MigrationMode::IncrementalDump
            } else {
                MigrationMode::CompleteDump
            },
            use_odp: wire.use_odp != 0,
            prefetch: wire.prefetch != 0,
        }
    }
}

/// Second record: what the destination must allocate and restore.
#[repr(C)]
#[derive(Debug, Copy, Clone, Default)]
pub struct MigrationMetadata {
    pub ncores: u32,
    _pad0: u32,
    /// Guest size as requested (hole excluded); the destination re-derives
    /// the hole itself.
    pub guest_size: u64,
    pub no_checkpoint: u32,
    _pad1: u32,
    pub elf_entry: u64,
    pub full_checkpoint: u32,
    _pad2: u32,
}

unsafe impl ByteValued for MigrationMetadata {}

/// One entry of the memory-region descriptor list: a non-hole range of
/// guest physical memory.
#[repr(C)]
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct MemRegionRecord {
    pub gpa: u64,
    pub size: u64,
}

unsafe impl ByteValued for MemRegionRecord {}

/// A migration transport: how bytes and page records reach the peer.
///
/// Implementations separate the wire mechanics from the engine's protocol
/// staging; the engine never sees sockets or queue pairs.
pub trait Transport: Send {
    /// Send a raw record, completely.
    fn send(&mut self, bytes: &[u8]) -> Result<(), MigrationError>;

    /// Receive a raw record, completely.
    fn recv(&mut self, bytes: &mut [u8]) -> Result<(), MigrationError>;

    /// Stream one `(entry, page)` record.
    fn send_page(&mut self, entry: u64, page: &[u8]) -> Result<(), MigrationError>;

    /// Terminate the page stream with the last-page marker.
    fn finish_pages(&mut self) -> Result<(), MigrationError>;

    /// Receive one page record into guest memory at its entry-derived
    /// offset. `Ok(false)` when the last-page marker arrived instead.
    fn recv_page(&mut self, mem: &GuestMemory) -> Result<bool, MigrationError>;

    /// Whether pages can be transferred while the guest still runs.
    fn supports_live(&self) -> bool;
}

/// Slots the frozen vCPUs drop their snapshots into during stop-and-copy.
pub struct MigrationController {
    states: Mutex<Vec<Option<VcpuState>>>,
}

impl MigrationController {
    pub fn new(ncores: u32) -> Self {
        Self {
            states: Mutex::new(vec![None; ncores as usize]),
        }
    }

    /// Called by each vCPU at the migration rendezvous.
    pub fn store_state(&self, core_id: u32, state: VcpuState) {
        self.states.lock().unwrap()[core_id as usize] = Some(state);
    }

    /// Collect all snapshots; every core must have checked in (guaranteed
    /// by the migration barrier).
    fn take_states(&self) -> Vec<VcpuState> {
        self.states
            .lock()
            .unwrap()
            .iter_mut()
            .map(|slot| slot.take().expect("migration barrier released early"))
            .collect()
    }
}

/// Run an outgoing migration. On success the guest lives on the peer and
/// the caller must terminate this process.
pub fn initiate(
    hv: &Arc<Hypervisor>,
    target: &str,
    params: MigrationParams,
) -> Result<(), MigrationError> {
    if !hv.threads.all_registered() {
        return Err(MigrationError::NotRunning);
    }

    let mut transport = stream::StreamTransport::connect(target, MIGRATION_PORT)?;
    tracing::info!(target, ?params, "starting migration");

    transport.send(WireParams::from(params).as_slice())?;

    let metadata = MigrationMetadata {
        ncores: hv.config.ncores,
        guest_size: hv.mem.requested_size(),
        no_checkpoint: 0,
        elf_entry: hv.elf_entry,
        full_checkpoint: u32::from(hv.checkpoint.default_full()),
        ..Default::default()
    };
    transport.send(metadata.as_slice())?;

    send_region_list(&mut transport, hv)?;

    // With the rdma feature both sides upgrade to one-sided writes here;
    // control records keep using the stream underneath.
    #[cfg(feature = "rdma")]
    let mut transport = rdma::RdmaTransport::from_control(transport, &hv.mem, params.use_odp)?;

    // Pre-copy: only meaningful when the transport can race the guest.
    let live = params.type_ == MigrationType::Live && transport.supports_live();
    if params.type_ == MigrationType::Live && !live {
        tracing::warn!("live migration not supported on this transport; falling back to cold");
    }
    if live {
        for pass in 0..MIG_ITERS {
            let pages = stream_dirty_pages(&mut transport, hv)?;
            tracing::debug!(pass, pages, "pre-copy pass");
            if pages == 0 {
                break;
            }
        }
    }

    // Freeze every vCPU and meet them at the migration barrier.
    hv.rendezvous.migration.store(true, Ordering::SeqCst);
    hv.threads.signal_all(sig_migration());
    hv.migration_barrier.wait();

    // Final memory pass, guest frozen.
    if live {
        stream_dirty_pages(&mut transport, hv)?;
    } else {
        match params.mode {
            MigrationMode::CompleteDump => stream_complete_memory(&mut transport, hv)?,
            MigrationMode::IncrementalDump => {
                let walker = hv.page_walker();
                walker.scan_marked(ScanFilter::Accessed, false, &mut |entry, page| {
                    transport
                        .send_page(entry, page)
                        .map_err(|e| io::Error::other(e.to_string()))
                })?;
            }
        }
    }
    transport.finish_pages()?;

    for state in hv.migration.take_states() {
        transport.send(state.as_bytes())?;
    }

    let clock = ClockRecord(hv.vm.get_clock()?);
    transport.send(clock.as_slice())?;

    tracing::info!("migration complete; guest now runs on {target}");
    Ok(())
}

fn send_region_list(
    transport: &mut dyn Transport,
    hv: &Arc<Hypervisor>,
) -> Result<(), MigrationError> {
    let chunks = hv.mem.chunks();
    transport.send(&(chunks.len() as u64).to_le_bytes())?;
    for chunk in chunks {
        let record = MemRegionRecord {
            gpa: chunk.gpa,
            size: chunk.size,
        };
        transport.send(record.as_slice())?;
    }
    Ok(())
}

/// One dirty-scan pass streamed to the destination; clears consumed marks.
fn stream_dirty_pages(
    transport: &mut dyn Transport,
    hv: &Arc<Hypervisor>,
) -> Result<usize, MigrationError> {
    let walker = hv.page_walker();
    let pages = walker.scan_marked(ScanFilter::Dirty, true, &mut |entry, page| {
        transport
            .send_page(entry, page)
            .map_err(|e| io::Error::other(e.to_string()))
    })?;
    Ok(pages)
}

/// Ship every byte of guest memory as synthetic page records: 2 MiB blocks
/// where the chunk geometry allows, 4 KiB records for the remainder.
fn stream_complete_memory(
    transport: &mut dyn Transport,
    hv: &Arc<Hypervisor>,
) -> Result<(), MigrationError> {
    const BLOCK: u64 = 1 << PAGE_2M_BITS;
    for chunk in hv.mem.chunks() {
        let mut offset = chunk.gpa;
        let end = chunk.gpa + chunk.size;
        while offset + BLOCK <= end {
            let entry = offset | x86::PG_PRESENT | x86::PG_RW | x86::PG_PSE;
            transport.send_page(entry, hv.mem.slice(offset, BLOCK)?)?;
            offset += BLOCK;
        }
        while offset < end {
            let entry = offset | x86::PG_PRESENT | x86::PG_RW;
            transport.send_page(entry, hv.mem.slice(offset, PAGE_SIZE)?)?;
            offset += PAGE_SIZE;
        }
    }
    Ok(())
}

/// Destination: everything learned from the handshake.
pub struct IncomingMigration {
    pub params: MigrationParams,
    pub metadata: MigrationMetadata,
    transport: stream::StreamTransport,
}

/// Listen for a migration source and complete the handshake.
pub fn wait_for_incoming(port: u16) -> Result<IncomingMigration, MigrationError> {
    let mut transport = stream::StreamTransport::listen(port)?;

    let mut params = WireParams::default();
    transport.recv(params.as_mut_slice())?;
    let mut metadata = MigrationMetadata::default();
    transport.recv(metadata.as_mut_slice())?;

    if metadata.ncores == 0 || metadata.guest_size == 0 {
        return Err(MigrationError::Protocol(
            "metadata with zero cores or empty guest".into(),
        ));
    }

    let params = MigrationParams::from(params);
    tracing::info!(?params, ncores = metadata.ncores, "incoming migration");
    Ok(IncomingMigration {
        params,
        metadata,
        transport,
    })
}

impl IncomingMigration {
    /// Receive regions, pages, vCPU states and the clock into a prepared
    /// guest. Returns the per-core snapshots to restore from.
    pub fn receive_guest(
        self,
        mem: &GuestMemory,
        vm: &VmHandle,
    ) -> Result<Vec<VcpuState>, MigrationError> {
        let Self {
            params,
            metadata,
            mut transport,
        } = self;

        let mut count_bytes = [0u8; 8];
        transport.recv(&mut count_bytes)?;
        let count = u64::from_le_bytes(count_bytes);
        if count > 2 {
            return Err(MigrationError::Protocol(format!(
                "unreasonable region count {count}"
            )));
        }
        for _ in 0..count {
            let mut region = MemRegionRecord::default();
            transport.recv(region.as_mut_slice())?;
            mem.check_range(region.gpa, region.size)?;
            tracing::debug!(?region, "memory region announced");
        }

        #[cfg(feature = "rdma")]
        let mut transport = rdma::RdmaTransport::from_control(transport, mem, params.use_odp)?;
        #[cfg(not(feature = "rdma"))]
        let _ = params;

        let mut pages = 0usize;
        while transport.recv_page(mem)? {
            pages += 1;
        }
        tracing::debug!(pages, "guest memory received");

        let mut states = Vec::with_capacity(metadata.ncores as usize);
        let mut buf = vec![0u8; std::mem::size_of::<VcpuState>()];
        for _ in 0..metadata.ncores {
            transport.recv(&mut buf)?;
            states
                .push(VcpuState::read_from(&mut buf.as_slice()).map_err(MigrationError::Transport)?);
        }

        let mut clock = ClockRecord(Default::default());
        transport.recv(clock.as_mut_slice())?;
        if vm.caps().adjust_clock_stable {
            vm.set_clock(&clock.0)?;
        }

        Ok(states)
    }
}

/// Block SIGUSR1 process-wide; must run before any thread is spawned so
/// the mask is inherited everywhere.
pub fn block_trigger_signal() {
    unsafe {
        let mut set: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, libc::SIGUSR1);
        libc::pthread_sigmask(libc::SIG_BLOCK, &set, std::ptr::null_mut());
    }
}

/// Outgoing-migration trigger thread (`HERMIT_MIGRATION_SUPPORT`): waits
/// for SIGUSR1, then migrates and ends the process.
pub fn spawn_signal_initiator(hv: Arc<Hypervisor>, target: String, params: MigrationParams) {
    std::thread::Builder::new()
        .name("mig-trigger".into())
        .spawn(move || {
            unsafe {
                let mut set: libc::sigset_t = std::mem::zeroed();
                libc::sigemptyset(&mut set);
                libc::sigaddset(&mut set, libc::SIGUSR1);
                let mut sig = 0;
                libc::sigwait(&set, &mut sig);
            }

            match initiate(&hv, &target, params) {
                Ok(()) => {
                    let _ = io::stdout().flush();
                    std::process::exit(0);
                }
                Err(e) => {
                    tracing::error!("migration failed: {e}");
                    std::process::exit(1);
                }
            }
        })
        .expect("spawning the migration trigger thread");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_record_sizes() {
        // Both peers must agree on these byte-for-byte.
        assert_eq!(std::mem::size_of::<WireParams>(), 12);
        assert_eq!(std::mem::size_of::<MigrationMetadata>(), 40);
        assert_eq!(std::mem::size_of::<MemRegionRecord>(), 16);
    }

    #[test]
    fn test_params_wire_roundtrip() {
        let params = MigrationParams {
            mode: MigrationMode::IncrementalDump,
            type_: MigrationType::Live,
            use_odp: true,
            prefetch: false,
        };
        let round: MigrationParams = WireParams::from(params).into();
        assert_eq!(round.mode, MigrationMode::IncrementalDump);
        assert_eq!(round.type_, MigrationType::Live);
        assert!(round.use_odp);
        assert!(!round.prefetch);
    }
}
