//! Checkpoint engine: stop-the-world snapshots on disk, and their restore.
//!
//! A checkpoint is a numbered generation inside one directory:
//!
//! ```text
//! checkpoint/
//!   chk_config.txt      six key: value lines, rewritten per checkpoint
//!   chkN_coreK.dat      raw VcpuState of core K at generation N
//!   chkN_mem.dat        guest clock record, then (entry, page) records
//! ```
//!
//! Incremental checkpoints dump only pages whose dirty bit is set and clear
//! the marks they consume, so generation N+1 captures exactly the writes
//! since N. Restore replays generations 0..=N in order (last writer wins
//! per page); a full checkpoint needs only generation N. The guest clock is
//! taken from the final generation alone.
//!
//! The protocol is driven from the vCPU loop (see
//! `VcpuWorker::checkpoint_rendezvous`): the initiator publishes a request,
//! kicks every core out of the guest, and cores meet at a barrier. Each
//! core serializes its own register file; core 0 dumps memory strictly
//! between the two barrier waits, then rewrites the manifest. No two
//! checkpoints ever interleave — initiators serialize on the request slot.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Instant;

use kvm_bindings::kvm_clock_data;
use thiserror::Error;
use vm_memory::ByteValued;

use crate::hypervisor::{sig_checkpoint, Hypervisor};
use crate::kvm::{KvmError, VcpuState, VmHandle};
use crate::mem::{GuestMemory, MemError};
use crate::paging::{record_dest_offset, record_page_size, ScanFilter, WalkError};

/// Default checkpoint directory, relative to the working directory.
pub const DEFAULT_DIR: &str = "checkpoint";
const MANIFEST_NAME: &str = "chk_config.txt";

#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("checkpoint I/O failed: {0}")]
    Io(#[from] io::Error),

    #[error("malformed checkpoint manifest: {0}")]
    Manifest(String),

    #[error(transparent)]
    Kvm(#[from] KvmError),

    #[error(transparent)]
    Walk(#[from] WalkError),

    #[error(transparent)]
    Mem(#[from] MemError),

    #[error("no vCPU threads to checkpoint")]
    NotRunning,
}

/// Raw-serializable wrapper for the guest clock record.
#[repr(transparent)]
#[derive(Copy, Clone)]
pub(crate) struct ClockRecord(pub kvm_clock_data);

// kvm_clock_data is a padded plain kernel struct.
unsafe impl ByteValued for ClockRecord {}

impl ClockRecord {
    pub(crate) fn read_from(reader: &mut impl Read) -> io::Result<Self> {
        let mut record = Self(kvm_clock_data::default());
        reader.read_exact(record.as_mut_slice())?;
        Ok(record)
    }
}

/// The plain-text manifest describing the newest checkpoint generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    pub application: PathBuf,
    pub ncores: u32,
    pub guest_size: u64,
    pub checkpoint_number: u32,
    pub entry_point: u64,
    pub full: bool,
}

impl Manifest {
    /// Load `chk_config.txt` from a checkpoint directory. `Ok(None)` when
    /// the directory holds no checkpoint.
    pub fn load(dir: &Path) -> Result<Option<Self>, CheckpointError> {
        let path = dir.join(MANIFEST_NAME);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut application = None;
        let mut ncores = None;
        let mut guest_size = None;
        let mut checkpoint_number = None;
        let mut entry_point = None;
        let mut full = None;

        for line in text.lines() {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim();
            match key.trim() {
                "application path" => application = Some(PathBuf::from(value)),
                "number of cores" => ncores = value.parse().ok(),
                "memory size" => guest_size = parse_hex(value),
                "checkpoint number" => checkpoint_number = value.parse().ok(),
                "entry point" => entry_point = parse_hex(value),
                "full checkpoint" => full = Some(value != "0"),
                _ => {}
            }
        }

        let missing = |what: &str| CheckpointError::Manifest(format!("missing {what}"));
        Ok(Some(Self {
            application: application.ok_or_else(|| missing("application path"))?,
            ncores: ncores.ok_or_else(|| missing("number of cores"))?,
            guest_size: guest_size.ok_or_else(|| missing("memory size"))?,
            checkpoint_number: checkpoint_number.ok_or_else(|| missing("checkpoint number"))?,
            entry_point: entry_point.ok_or_else(|| missing("entry point"))?,
            full: full.ok_or_else(|| missing("full checkpoint"))?,
        }))
    }

    /// Rewrite the manifest.
    pub fn store(&self, dir: &Path) -> Result<(), CheckpointError> {
        let mut file = File::create(dir.join(MANIFEST_NAME))?;
        writeln!(file, "application path: {}", self.application.display())?;
        writeln!(file, "number of cores: {}", self.ncores)?;
        writeln!(file, "memory size: {:#x}", self.guest_size)?;
        writeln!(file, "checkpoint number: {}", self.checkpoint_number)?;
        writeln!(file, "entry point: {:#x}", self.entry_point)?;
        write!(file, "full checkpoint: {}", if self.full { 1 } else { 0 })?;
        Ok(())
    }
}

fn parse_hex(value: &str) -> Option<u64> {
    let digits = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value);
    u64::from_str_radix(digits, 16).ok()
}

/// One checkpoint request, published by an initiator.
#[derive(Debug, Clone)]
pub struct CheckpointRequest {
    pub path: PathBuf,
    pub full: bool,
}

/// Serializes checkpoint initiators and carries the generation counter.
pub struct CheckpointController {
    dir: PathBuf,
    counter: AtomicU32,
    default_full: bool,
    pending: Mutex<Option<CheckpointRequest>>,
    done: Condvar,
}

impl CheckpointController {
    pub fn new(dir: PathBuf, counter: u32, default_full: bool) -> Self {
        Self {
            dir,
            counter: AtomicU32::new(counter),
            default_full,
            pending: Mutex::new(None),
            done: Condvar::new(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn counter(&self) -> u32 {
        self.counter.load(Ordering::SeqCst)
    }

    pub fn bump_counter(&self) {
        self.counter.fetch_add(1, Ordering::SeqCst);
    }

    pub fn default_full(&self) -> bool {
        self.default_full
    }

    /// The request the current rendezvous serves.
    pub fn pending_request(&self) -> CheckpointRequest {
        self.pending
            .lock()
            .unwrap()
            .clone()
            .expect("checkpoint rendezvous without a pending request")
    }

    /// Initiate a checkpoint and block until it is on disk.
    ///
    /// Runs on the timer thread or a monitor connection, never on a vCPU
    /// thread. Concurrent initiators queue up on the request slot.
    pub fn request(
        &self,
        hv: &Hypervisor,
        path: PathBuf,
        full: bool,
    ) -> Result<(), CheckpointError> {
        if !hv.threads.all_registered() {
            return Err(CheckpointError::NotRunning);
        }
        fs::create_dir_all(&path)?;

        let started = Instant::now();
        let number;
        {
            let mut pending = self.pending.lock().unwrap();
            while pending.is_some() {
                pending = self.done.wait(pending).unwrap();
            }
            number = self.counter();
            *pending = Some(CheckpointRequest { path, full });

            hv.rendezvous.checkpoint.store(true, Ordering::SeqCst);
            hv.threads.signal_all(sig_checkpoint());

            while pending.is_some() {
                pending = self.done.wait(pending).unwrap();
            }
        }

        tracing::debug!(
            number,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "checkpoint created"
        );
        Ok(())
    }

    /// Mark the pending request complete and wake its initiator.
    fn complete(&self) {
        *self.pending.lock().unwrap() = None;
        self.done.notify_all();
    }
}

fn core_file(dir: &Path, number: u32, core_id: u32) -> PathBuf {
    dir.join(format!("chk{number}_core{core_id}.dat"))
}

fn mem_file(dir: &Path, number: u32) -> PathBuf {
    dir.join(format!("chk{number}_mem.dat"))
}

/// Write one core's register snapshot (called by every vCPU at rendezvous).
pub fn write_core_state(
    dir: &Path,
    number: u32,
    core_id: u32,
    state: &VcpuState,
) -> Result<(), CheckpointError> {
    let mut file = File::create(core_file(dir, number, core_id))?;
    file.write_all(state.as_bytes())?;
    Ok(())
}

/// Read one core's register snapshot back.
pub fn read_core_state(
    dir: &Path,
    number: u32,
    core_id: u32,
) -> Result<VcpuState, CheckpointError> {
    let mut file = File::open(core_file(dir, number, core_id))?;
    Ok(VcpuState::read_from(&mut file)?)
}

/// Dump the guest clock and the marked pages (core 0, between barriers).
pub fn write_memory_dump(
    hv: &Hypervisor,
    request: &CheckpointRequest,
) -> Result<(), CheckpointError> {
    let number = hv.checkpoint.counter();
    let mut writer = BufWriter::new(File::create(mem_file(&request.path, number))?);

    let clock = ClockRecord(hv.vm.get_clock()?);
    writer.write_all(clock.as_slice())?;

    // First incremental generation has no cleared marks to filter on yet;
    // it scans for accessed pages, later generations for dirty ones.
    let filter = if !request.full && number > 0 {
        ScanFilter::Dirty
    } else {
        ScanFilter::Accessed
    };
    let clear = !request.full;

    let walker = hv.page_walker();
    let pages = walker.scan_marked(filter, clear, &mut |entry, page| {
        writer.write_all(&entry.to_le_bytes())?;
        writer.write_all(page)
    })?;
    writer.flush()?;

    tracing::debug!(number, pages, ?filter, "memory dump written");
    Ok(())
}

/// Rewrite the manifest, advance the generation counter and release the
/// initiator (core 0, after the final barrier).
pub fn finalize(hv: &Hypervisor, request: &CheckpointRequest) -> Result<(), CheckpointError> {
    let manifest = Manifest {
        application: hv
            .guest_argv
            .first()
            .map(|raw| PathBuf::from(String::from_utf8_lossy(raw).into_owned()))
            .unwrap_or_default(),
        ncores: hv.config.ncores,
        guest_size: hv.mem.requested_size(),
        checkpoint_number: hv.checkpoint.counter(),
        entry_point: hv.elf_entry,
        full: request.full,
    };
    manifest.store(&request.path)?;

    hv.checkpoint.bump_counter();
    hv.checkpoint.complete();
    Ok(())
}

/// Replay checkpoint memory into a fresh guest address space.
///
/// Full checkpoints read generation N only; incremental ones overlay
/// 0..=N in order. The clock is restored from the final generation.
pub fn restore_memory(
    mem: &GuestMemory,
    vm: Option<&VmHandle>,
    dir: &Path,
    manifest: &Manifest,
) -> Result<(), CheckpointError> {
    let started = Instant::now();
    let last = manifest.checkpoint_number;
    let first = if manifest.full { last } else { 0 };

    for number in first..=last {
        let mut reader = BufReader::new(File::open(mem_file(dir, number))?);

        let clock = ClockRecord::read_from(&mut reader)?;
        if number == last {
            if let Some(vm) = vm {
                if vm.caps().adjust_clock_stable {
                    vm.set_clock(&clock.0)?;
                }
            }
        }

        loop {
            let mut entry_bytes = [0u8; 8];
            match reader.read_exact(&mut entry_bytes) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }
            let entry = u64::from_le_bytes(entry_bytes);
            let offset = record_dest_offset(entry);
            let size = record_page_size(entry);
            reader.read_exact(mem.slice_mut(offset, size)?)?;
        }
    }

    tracing::debug!(
        number = last,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "checkpoint restored"
    );
    Ok(())
}

/// Periodic checkpoint initiator (`HERMIT_CHECKPOINT=N` seconds).
pub fn spawn_interval_initiator(hv: std::sync::Arc<Hypervisor>, interval_secs: u32) {
    std::thread::Builder::new()
        .name("chk-timer".into())
        .spawn(move || loop {
            std::thread::sleep(std::time::Duration::from_secs(interval_secs as u64));
            let path = hv.checkpoint.dir().to_path_buf();
            let full = hv.checkpoint.default_full();
            match hv.checkpoint.request(&hv, path, full) {
                Ok(()) => {}
                Err(CheckpointError::NotRunning) => {}
                Err(e) => tracing::error!("interval checkpoint failed: {e}"),
            }
        })
        .expect("spawning the checkpoint timer thread");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paging::x86;

    fn test_manifest() -> Manifest {
        Manifest {
            application: PathBuf::from("/tmp/app"),
            ncores: 2,
            guest_size: 0x2000_0000,
            checkpoint_number: 3,
            entry_point: 0x20_0000,
            full: false,
        }
    }

    #[test]
    fn test_manifest_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = test_manifest();
        manifest.store(dir.path()).unwrap();

        let loaded = Manifest::load(dir.path()).unwrap().unwrap();
        assert_eq!(loaded, manifest);
    }

    #[test]
    fn test_manifest_absent() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Manifest::load(dir.path()).unwrap().is_none());
    }

    #[test]
    fn test_manifest_rejects_partial() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(MANIFEST_NAME), "number of cores: 1\n").unwrap();
        assert!(matches!(
            Manifest::load(dir.path()),
            Err(CheckpointError::Manifest(_))
        ));
    }

    #[test]
    fn test_core_state_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = VcpuState::default();
        state.regs.rip = 0xcafe;
        state.nmsrs = 7;

        write_core_state(dir.path(), 2, 1, &state).unwrap();
        let loaded = read_core_state(dir.path(), 2, 1).unwrap();
        assert_eq!(loaded.regs.rip, 0xcafe);
        assert_eq!(loaded.nmsrs, 7);
    }

    /// Hand-write a chkN_mem.dat with the given page records.
    fn write_mem_generation(dir: &Path, number: u32, records: &[(u64, u8)]) {
        let mut file = File::create(mem_file(dir, number)).unwrap();
        let clock = ClockRecord(kvm_clock_data::default());
        file.write_all(clock.as_slice()).unwrap();
        for &(entry, fill) in records {
            file.write_all(&entry.to_le_bytes()).unwrap();
            let size = record_page_size(entry) as usize;
            file.write_all(&vec![fill; size]).unwrap();
        }
    }

    #[test]
    fn test_restore_replays_generations_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let mem = GuestMemory::new(8 << 20, false, false).unwrap();

        let page = 0x5000 | x86::PG_PRESENT | x86::PG_RW;
        let block = 0x40_0000 | x86::PG_PRESENT | x86::PG_RW | x86::PG_PSE;
        // Generation 0 writes both pages; generation 1 overwrites the
        // 4 KiB one. Replay must end with the generation-1 contents.
        write_mem_generation(dir.path(), 0, &[(page, 0x11), (block, 0x22)]);
        write_mem_generation(dir.path(), 1, &[(page, 0x33)]);

        let manifest = Manifest {
            checkpoint_number: 1,
            full: false,
            ..test_manifest()
        };
        restore_memory(&mem, None, dir.path(), &manifest).unwrap();

        assert_eq!(mem.read_obj::<u8>(0x5000).unwrap(), 0x33);
        assert_eq!(mem.read_obj::<u8>(0x5fff).unwrap(), 0x33);
        assert_eq!(mem.read_obj::<u8>(0x40_0000).unwrap(), 0x22);
        assert_eq!(mem.read_obj::<u8>(0x40_0000 + (2 << 20) - 1).unwrap(), 0x22);
    }

    #[test]
    fn test_restore_full_reads_last_generation_only() {
        let dir = tempfile::tempdir().unwrap();
        let mem = GuestMemory::new(8 << 20, false, false).unwrap();

        let page = 0x5000 | x86::PG_PRESENT | x86::PG_RW;
        // Generation 0 is absent on purpose; a full restore must not look
        // for it.
        write_mem_generation(dir.path(), 2, &[(page, 0x44)]);

        let manifest = Manifest {
            checkpoint_number: 2,
            full: true,
            ..test_manifest()
        };
        restore_memory(&mem, None, dir.path(), &manifest).unwrap();
        assert_eq!(mem.read_obj::<u8>(0x5000).unwrap(), 0x44);
    }
}
