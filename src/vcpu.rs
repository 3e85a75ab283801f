//! Per-core vCPU workers.
//!
//! One worker per guest core; core 0 runs on the main thread, the rest on
//! their own threads. Each worker creates its accelerator vCPU, meets the
//! others at the start barrier, brings its core up (fresh long-mode init,
//! or a snapshot restore after a checkpoint restart / incoming migration)
//! and then drives the run loop until the guest halts or exits.
//!
//! # Boot ordering
//!
//! All cores share one system-register template, so only the boot core
//! builds it (GDT, boot page tables, long-mode control bits). Secondary
//! cores serialize behind the guest's own bring-up: core k+1 spins until
//! the guest reports k cores online in the boot header, then claims its id
//! slot. By the time any secondary core initializes, the template exists.
//!
//! # Rendezvous
//!
//! The loop begins every iteration by servicing pending checkpoint or
//! migration rendezvous. The realtime-signal handlers themselves only kick
//! the core out of the run ioctl; all rendezvous work happens here, in
//! ordinary thread context.

use std::cell::Cell;
use std::io;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use kvm_bindings::{kvm_regs, kvm_segment, kvm_sregs};

use crate::checkpoint;
use crate::hypercall::{self, HypercallResult};
use crate::hypervisor::{sig_checkpoint, sig_migration, Hypervisor, HypervisorError, StartMode};
use crate::kvm::{KvmError, VcpuExit, VcpuHandle};
use crate::loader::hdr;
use crate::paging::x86;

/// Boot GDT location in guest memory.
const BOOT_GDT: u64 = 0x1000;
/// Boot page-table pages; the guest replaces these with its own tables.
const BOOT_PML4: u64 = 0x1_0000;
const BOOT_PDPTE: u64 = 0x1_1000;
const BOOT_PDE: u64 = 0x1_2000;
/// The boot tables identity-map this much of guest memory with 2 MiB pages.
const IDENTITY_MAP_SIZE: u64 = 0x2000_0000;
/// 2 MiB.
const LARGE_PAGE_SIZE: u64 = 0x20_0000;

const X86_CR0_PE: u64 = 1 << 0;
const X86_CR0_PG: u64 = 1 << 31;
const X86_CR4_PAE: u64 = 1 << 5;
const EFER_LME: u64 = 1 << 8;
const EFER_LMA: u64 = 1 << 10;

/// GDT layout: null, code, data.
const BOOT_GDT_CODE: usize = 1;
const BOOT_GDT_DATA: usize = 2;
const GDT_TABLE: [u64; 3] = [
    gdt_entry(0, 0, 0),
    gdt_entry(0xa09b, 0, 0xfffff), // 64-bit code, execute/read
    gdt_entry(0xc093, 0, 0xfffff), // data, read/write
];

thread_local! {
    /// The vCPU whose run loop owns this thread, for the signal handler.
    static ACTIVE_VCPU: Cell<*const VcpuHandle> = const { Cell::new(std::ptr::null()) };
}

/// Signal handler body: arm the immediate-exit flag of this thread's vCPU.
/// Everything here must stay async-signal-safe.
extern "C" fn rendezvous_interrupt(_sig: libc::c_int) {
    let vcpu = ACTIVE_VCPU.with(|cell| cell.get());
    if !vcpu.is_null() {
        unsafe { (*vcpu).set_immediate_exit(true) };
    }
}

/// Install the process-wide checkpoint/migration signal handlers.
///
/// No SA_RESTART: the whole point of these signals is forcing EINTR out of
/// the run ioctl.
pub fn install_signal_handlers() -> io::Result<()> {
    for sig in [sig_checkpoint(), sig_migration()] {
        let mut action: libc::sigaction = unsafe { std::mem::zeroed() };
        action.sa_sigaction = rendezvous_interrupt as usize;
        unsafe { libc::sigemptyset(&mut action.sa_mask) };
        let ret = unsafe { libc::sigaction(sig, &action, std::ptr::null_mut()) };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// The per-core worker.
pub struct VcpuWorker {
    hv: Arc<Hypervisor>,
    vcpu: VcpuHandle,
    core_id: u32,
}

impl VcpuWorker {
    pub fn new(hv: Arc<Hypervisor>, core_id: u32) -> Result<Self, HypervisorError> {
        let vcpu = hv.vm.create_vcpu(core_id)?;
        Ok(Self { hv, vcpu, core_id })
    }

    /// Bring the core up and run it. Returns the guest exit code.
    pub fn run(mut self) -> Result<i32, HypervisorError> {
        self.hv.threads.register(self.core_id);
        // `self` does not move again after this point; the pointer stays
        // valid for the thread lifetime.
        ACTIVE_VCPU.with(|cell| cell.set(&self.vcpu as *const _));

        // First barrier: every vCPU exists and is signalable.
        self.hv.barrier.wait();

        if self.core_id == 0 {
            // The loader seeded 1; tell the guest how many cores it owns.
            self.hv
                .mem
                .write_obj(self.hv.mboot + hdr::NCORES, &self.hv.config.ncores)?;
        }

        // Second barrier: boot header complete, start together.
        self.hv.barrier.wait();

        let snapshot = {
            let states = self.hv.restore_states.lock().unwrap();
            states.as_ref().map(|v| v[self.core_id as usize])
        };

        match (&self.hv.start_mode, snapshot) {
            (StartMode::RestoreCheckpoint { generation }, _) => {
                let state = checkpoint::read_core_state(
                    self.hv.checkpoint.dir(),
                    *generation,
                    self.core_id,
                )?;
                self.restore(&state)?;
            }
            (StartMode::RestoreMigration, Some(state)) => {
                self.restore(&state)?;
            }
            (StartMode::RestoreMigration, None) => {
                return Err(KvmError::InvalidState("migration snapshot for this core").into());
            }
            (StartMode::Boot, _) => self.init_cpu_state()?,
        }

        self.dispatch_loop()
    }

    /// Cold-boot initialization: CPUID, MSRs, long mode, boot tables.
    fn init_cpu_state(&self) -> Result<(), HypervisorError> {
        let caps = self.hv.vm.caps();
        self.vcpu.setup_cpuid(&caps)?;
        self.vcpu.set_mp_runnable()?;
        self.vcpu.init_msrs()?;

        // Only one core may run the guest's startup code at a time; wait
        // until the predecessor reports in, then claim our id slot.
        let online = self.hv.mboot + hdr::CPU_ONLINE;
        while self.hv.mem.read_u32_volatile(online)? < self.core_id {
            std::thread::yield_now();
        }
        self.hv
            .mem
            .write_obj(self.hv.mboot + hdr::CORE_ID, &self.core_id)?;

        if self.core_id == 0 {
            let template = self.build_boot_sregs()?;
            let _ = self.hv.boot_sregs.set(template);
        }
        let sregs = self
            .hv
            .boot_sregs
            .get()
            .copied()
            .ok_or(KvmError::InvalidState("boot system-register template"))?;
        self.vcpu.set_sregs(&sregs)?;

        let regs = kvm_regs {
            rip: self.hv.elf_entry,
            rflags: 0x2, // power-on value, reserved bit 1
            ..Default::default()
        };
        self.vcpu.set_regs(&regs)?;
        Ok(())
    }

    /// Build the shared system-register template: GDT, boot page tables
    /// with a 2 MiB identity map, long mode enabled.
    fn build_boot_sregs(&self) -> Result<kvm_sregs, HypervisorError> {
        let mem = &self.hv.mem;
        let mut sregs = self.vcpu.get_sregs()?;

        for (i, entry) in GDT_TABLE.iter().enumerate() {
            mem.write_obj(BOOT_GDT + (i as u64) * 8, entry)?;
        }
        sregs.gdt.base = BOOT_GDT;
        sregs.gdt.limit = (GDT_TABLE.len() * 8 - 1) as u16;

        let code = kvm_segment_from_gdt(GDT_TABLE[BOOT_GDT_CODE], BOOT_GDT_CODE as u8);
        let data = kvm_segment_from_gdt(GDT_TABLE[BOOT_GDT_DATA], BOOT_GDT_DATA as u8);
        sregs.cs = code;
        sregs.ds = data;
        sregs.es = data;
        sregs.fs = data;
        sregs.gs = data;
        sregs.ss = data;

        for table in [BOOT_PML4, BOOT_PDPTE, BOOT_PDE] {
            mem.slice_mut(table, 4096)?.fill(0);
        }
        mem.write_entry(BOOT_PML4, BOOT_PDPTE | x86::PG_PRESENT | x86::PG_RW)?;
        mem.write_entry(BOOT_PDPTE, BOOT_PDE | x86::PG_PRESENT | x86::PG_RW)?;
        let mapped = IDENTITY_MAP_SIZE.min(mem.size());
        let mut index = 0u64;
        let mut paddr = 0u64;
        while paddr < mapped {
            mem.write_entry(
                BOOT_PDE + index * 8,
                paddr | x86::PG_PRESENT | x86::PG_RW | x86::PG_PSE,
            )?;
            index += 1;
            paddr += LARGE_PAGE_SIZE;
        }

        sregs.cr3 = BOOT_PML4;
        sregs.cr4 |= X86_CR4_PAE;
        sregs.cr0 |= X86_CR0_PE | X86_CR0_PG;
        sregs.efer |= EFER_LME | EFER_LMA;

        Ok(sregs)
    }

    /// Revive the core from a snapshot.
    fn restore(&self, state: &crate::kvm::VcpuState) -> Result<(), HypervisorError> {
        let caps = self.hv.vm.caps();
        self.vcpu.setup_cpuid(&caps)?;
        self.vcpu.restore_state(state)?;
        Ok(())
    }

    /// The run loop: service rendezvous, enter the guest, dispatch exits.
    fn dispatch_loop(&mut self) -> Result<i32, HypervisorError> {
        loop {
            if self.hv.rendezvous.checkpoint.load(Ordering::SeqCst) {
                self.checkpoint_rendezvous()?;
            }
            if self.hv.rendezvous.migration.load(Ordering::SeqCst) {
                // Diverges: the migration initiator ends the process.
                self.migration_rendezvous()?;
            }
            self.vcpu.set_immediate_exit(false);

            match self.vcpu.run() {
                Ok(VcpuExit::Hypercall { port, data }) => {
                    match hypercall::dispatch(&self.hv, self.core_id, port, data)? {
                        HypercallResult::Continue => {}
                        HypercallResult::GuestExit(code) => {
                            if self.core_id == 0 {
                                tracing::info!(code, "guest requested exit");
                            }
                            return Ok(code);
                        }
                    }
                }
                Ok(VcpuExit::Halt) => {
                    tracing::info!(core = self.core_id, "guest halted; normal exit");
                    return Ok(0);
                }
                Ok(VcpuExit::Interrupted) => continue,
                Ok(VcpuExit::Shutdown) => {
                    if self.hv.begin_teardown() {
                        eprintln!("guest shutdown (triple fault?)");
                        self.vcpu.dump_registers();
                        self.hv.dump_guest_log();
                    }
                    std::process::exit(1);
                }
                Ok(VcpuExit::Debug) => {
                    if self.hv.begin_teardown() {
                        eprintln!("debug trap without an attached debugger");
                        self.vcpu.dump_registers();
                    }
                    std::process::exit(1);
                }
                Ok(VcpuExit::FailEntry(reason)) => {
                    return Err(HypervisorError::EntryFailure(reason));
                }
                Ok(VcpuExit::InternalError) => {
                    if self.hv.begin_teardown() {
                        self.vcpu.dump_registers();
                    }
                    return Err(HypervisorError::InternalError);
                }
                Ok(VcpuExit::Unknown(what)) => {
                    return Err(HypervisorError::UnhandledExit(what));
                }
                Err(e) => {
                    if matches!(e, KvmError::TranslationFault { .. }) && self.hv.begin_teardown() {
                        self.vcpu.dump_registers();
                        self.hv.dump_guest_log();
                    }
                    return Err(e.into());
                }
            }
        }
    }

    /// Stop-the-world checkpoint: two barrier waits, the memory dump
    /// strictly between them, on core 0.
    fn checkpoint_rendezvous(&self) -> Result<(), HypervisorError> {
        let request = self.hv.checkpoint.pending_request();

        self.hv.barrier.wait();

        let state = self.vcpu.save_state()?;
        checkpoint::write_core_state(
            &request.path,
            self.hv.checkpoint.counter(),
            self.core_id,
            &state,
        )?;

        if self.core_id == 0 {
            checkpoint::write_memory_dump(&self.hv, &request)?;
            // Clear before releasing the barrier so no core re-enters.
            self.hv.rendezvous.checkpoint.store(false, Ordering::SeqCst);
        }

        self.hv.barrier.wait();

        if self.core_id == 0 {
            checkpoint::finalize(&self.hv, &request)?;
        }
        Ok(())
    }

    /// Freeze for stop-and-copy. Does not return: once the state is handed
    /// to the migration initiator this process only waits for it to exit.
    fn migration_rendezvous(&self) -> Result<(), HypervisorError> {
        self.hv.barrier.wait();

        let state = self.vcpu.save_state()?;
        self.hv.migration.store_state(self.core_id, state);
        if self.core_id == 0 {
            self.hv.rendezvous.migration.store(false, Ordering::SeqCst);
        }

        // Hand over to the initiator thread.
        self.hv.migration_barrier.wait();

        loop {
            std::thread::park();
        }
    }
}

/// Pack a GDT entry from (flags, base, limit), the architectural bit salad.
const fn gdt_entry(flags: u16, base: u32, limit: u32) -> u64 {
    ((base as u64 & 0xff00_0000) << 32)
        | ((base as u64 & 0x00ff_ffff) << 16)
        | (limit as u64 & 0x0000_ffff)
        | (((limit as u64 & 0x000f_0000) >> 16) << 48)
        | ((flags as u64) << 40)
}

/// Expand a packed GDT entry into the accelerator's segment descriptor.
fn kvm_segment_from_gdt(entry: u64, table_index: u8) -> kvm_segment {
    kvm_segment {
        base: ((entry >> 16) & 0xff_ffff) | (((entry >> 56) & 0xff) << 24),
        limit: ((entry & 0xffff) | (((entry >> 48) & 0xf) << 16)) as u32,
        selector: u16::from(table_index) * 8,
        type_: ((entry >> 40) & 0xf) as u8,
        present: ((entry >> 47) & 0x1) as u8,
        dpl: ((entry >> 45) & 0x3) as u8,
        db: ((entry >> 54) & 0x1) as u8,
        s: ((entry >> 44) & 0x1) as u8,
        l: ((entry >> 53) & 0x1) as u8,
        g: ((entry >> 55) & 0x1) as u8,
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gdt_entry_packing() {
        // The null descriptor is all zeroes.
        assert_eq!(gdt_entry(0, 0, 0), 0);

        let code = kvm_segment_from_gdt(GDT_TABLE[BOOT_GDT_CODE], BOOT_GDT_CODE as u8);
        assert_eq!(code.selector, 0x08);
        assert_eq!(code.l, 1); // long mode
        assert_eq!(code.present, 1);
        assert_eq!(code.type_, 0xb); // execute/read, accessed

        let data = kvm_segment_from_gdt(GDT_TABLE[BOOT_GDT_DATA], BOOT_GDT_DATA as u8);
        assert_eq!(data.selector, 0x10);
        assert_eq!(data.l, 0);
        assert_eq!(data.db, 1);
        assert_eq!(data.type_, 0x3); // read/write, accessed
    }
}
