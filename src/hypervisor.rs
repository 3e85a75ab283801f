//! The hypervisor context.
//!
//! The [`Hypervisor`] owns everything with process lifetime — guest memory,
//! the accelerator VM handle, the network bridge, the rendezvous machinery —
//! and is shared as one `Arc` by the vCPU workers, the monitor, the timer
//! and the migration initiator. Per-core mutable state lives in
//! [`crate::vcpu::VcpuWorker`], not here.
//!
//! # Interrupting vCPUs
//!
//! Checkpoint and migration need every core out of the blocking run ioctl.
//! Thread-directed realtime signals remain the only mechanism for that; the
//! handlers themselves do nothing but force the ioctl out (EINTR, plus the
//! accelerator's immediate-exit flag against the signal-before-entry race).
//! The actual rendezvous — barriers, state capture, the memory dump — runs
//! in ordinary thread context from the vCPU loop, driven by the flags in
//! [`Rendezvous`].

use std::io;
use std::ops::Range;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Barrier, Mutex};

use thiserror::Error;

use crate::checkpoint::{CheckpointController, CheckpointError};
use crate::config::Config;
use crate::hypercall::{HypercallError, MAX_ARGC_ENVC};
use crate::kvm::{KvmError, VcpuState, VmHandle};
use crate::loader::LoaderError;
use crate::mem::{GuestMemory, MemError};
use crate::migration::{MigrationController, MigrationError};
use crate::net::{NetError, NetworkBridge};
use crate::paging::{ArchLayout, PageWalker};

/// Thread-directed signal requesting a checkpoint rendezvous.
pub fn sig_checkpoint() -> libc::c_int {
    libc::SIGRTMIN()
}

/// Thread-directed signal requesting a migration rendezvous.
pub fn sig_migration() -> libc::c_int {
    libc::SIGRTMIN() + 1
}

/// Top-level error type; everything fatal funnels here and exits non-zero.
#[derive(Error, Debug)]
pub enum HypervisorError {
    #[error(transparent)]
    Kvm(#[from] KvmError),

    #[error(transparent)]
    Mem(#[from] MemError),

    #[error(transparent)]
    Loader(#[from] LoaderError),

    #[error(transparent)]
    Net(#[from] NetError),

    #[error(transparent)]
    Hypercall(#[from] HypercallError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Migration(#[from] MigrationError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("unhandled accelerator exit: {0}")]
    UnhandledExit(&'static str),

    #[error("guest entry failure: hardware reason {0:#x}")]
    EntryFailure(u64),

    #[error("accelerator-internal error")]
    InternalError,
}

/// How the guest comes to life.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartMode {
    /// Fresh boot from a loaded image.
    Boot,
    /// Every core restores its state from this checkpoint generation.
    RestoreCheckpoint { generation: u32 },
    /// Every core restores from a received migration snapshot.
    RestoreMigration,
}

/// pthread identities of the vCPU threads, for directed signals.
pub struct ThreadRegistry {
    threads: Vec<AtomicU64>,
}

impl ThreadRegistry {
    fn new(ncores: u32) -> Self {
        Self {
            threads: (0..ncores).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    /// Called by each worker before the first barrier.
    pub fn register(&self, core_id: u32) {
        let tid = unsafe { libc::pthread_self() };
        self.threads[core_id as usize].store(tid, Ordering::SeqCst);
    }

    /// Signal every registered vCPU thread.
    pub fn signal_all(&self, sig: libc::c_int) {
        for slot in &self.threads {
            let tid = slot.load(Ordering::SeqCst);
            if tid != 0 {
                unsafe { libc::pthread_kill(tid, sig) };
            }
        }
    }

    pub fn all_registered(&self) -> bool {
        self.threads
            .iter()
            .all(|slot| slot.load(Ordering::SeqCst) != 0)
    }
}

/// Pending-rendezvous flags, checked by every vCPU loop iteration.
///
/// Set by the initiator *before* it signals the threads; cleared by core 0
/// before it releases the final barrier of the rendezvous.
#[derive(Default)]
pub struct Rendezvous {
    pub checkpoint: AtomicBool,
    pub migration: AtomicBool,
}

/// Everything needed to assemble a [`Hypervisor`].
pub struct HypervisorParts {
    pub config: Config,
    pub mem: GuestMemory,
    pub vm: VmHandle,
    pub elf_entry: u64,
    /// Guest-physical address of the boot header.
    pub mboot: u64,
    /// Guest-physical address of the guest's early log buffer.
    pub klog: u64,
    /// Identity-translation fast path for boot-time addresses (ARMv8).
    pub identity_range: Option<Range<u64>>,
    pub start_mode: StartMode,
    /// Command line forwarded to the guest, image path first.
    pub guest_args: Vec<String>,
    /// Per-core snapshots from an incoming migration.
    pub restore_states: Option<Vec<VcpuState>>,
    /// Checkpoint directory (the default, or the monitor-selected one).
    pub checkpoint_dir: PathBuf,
    /// Checkpoint counter to resume from.
    pub checkpoint_counter: u32,
}

/// The shared hypervisor context.
pub struct Hypervisor {
    pub config: Config,
    pub mem: GuestMemory,
    pub vm: VmHandle,
    pub elf_entry: u64,
    pub mboot: u64,
    pub klog: u64,
    pub identity_range: Option<Range<u64>>,
    pub start_mode: StartMode,
    pub guest_argv: Vec<Vec<u8>>,
    pub guest_envp: Vec<Vec<u8>>,
    pub net: NetworkBridge,
    /// Checkpoint rendezvous barrier, one slot per core.
    pub barrier: Barrier,
    /// Migration barrier: every core plus the initiator.
    pub migration_barrier: Barrier,
    pub threads: ThreadRegistry,
    pub rendezvous: Rendezvous,
    pub checkpoint: CheckpointController,
    pub migration: MigrationController,
    pub restore_states: Mutex<Option<Vec<VcpuState>>>,
    /// System-register template built by the boot core; all cores start
    /// from identical system state.
    pub boot_sregs: std::sync::OnceLock<kvm_bindings::kvm_sregs>,
    /// Guards accelerator teardown so racing fatal exits close things once.
    teardown: Mutex<bool>,
}

impl Hypervisor {
    pub fn new(parts: HypervisorParts) -> Result<Arc<Self>, HypervisorError> {
        let ncores = parts.config.ncores;
        let net = NetworkBridge::new(parts.config.netif.as_deref())?;

        let mut guest_argv: Vec<Vec<u8>> =
            parts.guest_args.iter().map(|s| s.clone().into_bytes()).collect();
        if guest_argv.len() > MAX_ARGC_ENVC {
            tracing::warn!(
                "forwarding only {MAX_ARGC_ENVC} of {} guest arguments",
                guest_argv.len()
            );
            guest_argv.truncate(MAX_ARGC_ENVC);
        }

        let mut guest_envp: Vec<Vec<u8>> = std::env::vars()
            .map(|(k, v)| format!("{k}={v}").into_bytes())
            .collect();
        if guest_envp.len() > MAX_ARGC_ENVC - 1 {
            tracing::warn!(
                "forwarding only {} of {} environment variables",
                MAX_ARGC_ENVC - 1,
                guest_envp.len()
            );
            guest_envp.truncate(MAX_ARGC_ENVC - 1);
        }

        let checkpoint = CheckpointController::new(
            parts.checkpoint_dir,
            parts.checkpoint_counter,
            parts.config.full_checkpoint,
        );

        Ok(Arc::new(Self {
            net,
            guest_argv,
            guest_envp,
            barrier: Barrier::new(ncores as usize),
            migration_barrier: Barrier::new(ncores as usize + 1),
            threads: ThreadRegistry::new(ncores),
            rendezvous: Rendezvous::default(),
            checkpoint,
            migration: MigrationController::new(ncores),
            restore_states: Mutex::new(parts.restore_states),
            boot_sregs: std::sync::OnceLock::new(),
            teardown: Mutex::new(false),
            config: parts.config,
            mem: parts.mem,
            vm: parts.vm,
            elf_entry: parts.elf_entry,
            mboot: parts.mboot,
            klog: parts.klog,
            identity_range: parts.identity_range,
            start_mode: parts.start_mode,
        }))
    }

    /// A walker over the guest's page tables.
    pub fn page_walker(&self) -> PageWalker<'_, ArchLayout> {
        let walker = PageWalker::new(&self.mem, self.elf_entry);
        match &self.identity_range {
            Some(range) => walker.with_identity(range.clone()),
            None => walker,
        }
    }

    /// Start the guest: core 0 runs on the calling thread, one worker
    /// thread per further core. Returns the guest exit code.
    pub fn run(self: &Arc<Self>) -> Result<i32, HypervisorError> {
        crate::vcpu::install_signal_handlers()?;

        // The boot processor comes first; secondary cores are created on
        // their own threads and meet it at the barrier.
        let worker0 = crate::vcpu::VcpuWorker::new(Arc::clone(self), 0)?;

        for core_id in 1..self.config.ncores {
            let hv = Arc::clone(self);
            std::thread::Builder::new()
                .name(format!("vcpu{core_id}"))
                .spawn(move || {
                    let result = crate::vcpu::VcpuWorker::new(hv, core_id)
                        .and_then(|worker| worker.run());
                    if let Err(e) = result {
                        tracing::error!("vcpu {core_id} failed: {e}");
                        std::process::exit(1);
                    }
                })
                .map_err(HypervisorError::Io)?;
        }

        worker0.run()
    }

    /// Print the guest's early log buffer, best effort, for fatal exits.
    pub fn dump_guest_log(&self) {
        if self.klog == 0 {
            return;
        }
        let mut buf = [0u8; 2048];
        if self.mem.read_bytes(self.klog, &mut buf).is_err() {
            return;
        }
        let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
        if end == 0 {
            return;
        }
        eprintln!("guest log:\n{}", String::from_utf8_lossy(&buf[..end]));
    }

    /// One-shot teardown guard. The first caller wins; everyone else
    /// returns false and must not touch the accelerator again.
    pub fn begin_teardown(&self) -> bool {
        let mut torn_down = self.teardown.lock().unwrap();
        let previous = *torn_down;
        *torn_down = true;
        !previous
    }
}
