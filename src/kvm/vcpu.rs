//! vCPU-scoped accelerator operations.
//!
//! A [`VcpuHandle`] wraps one KVM vCPU fd. It owns three jobs:
//!
//! - **CPUID filtering** — the host-reported CPUID table is adjusted before
//!   it reaches the guest (hypervisor bit on, PMU off; see
//!   [`CPUID_ADJUSTMENTS`]).
//! - **The run loop** — [`VcpuHandle::run`] enters the guest and maps the
//!   raw accelerator exit onto the small set of exits the dispatch loop
//!   cares about. Port and MMIO writes both surface as [`VcpuExit::Hypercall`].
//! - **State snapshots** — [`VcpuState`] captures everything needed to
//!   freeze a core for a checkpoint or migration and to revive it later:
//!   general-purpose and system registers, the MSR set, FPU state, extended
//!   control registers, the local APIC, pending interrupt/event state and
//!   the multiprocessor run state. The snapshot is one fixed-layout record,
//!   written raw to checkpoint files and the migration stream.

use std::io::{self, Read};

use kvm_bindings::{
    kvm_cpuid_entry2, kvm_fpu, kvm_lapic_state, kvm_mp_state, kvm_msr_entry, kvm_regs, kvm_sregs,
    kvm_vcpu_events, kvm_xcrs, CpuId, Msrs, KVM_MP_STATE_RUNNABLE,
};
use kvm_ioctls::VcpuExit as RawExit;
use vm_memory::ByteValued;

use super::{KvmCaps, KvmError};

/// Model-specific register indices used for snapshots and boot setup.
pub mod msr {
    pub const IA32_APICBASE: u32 = 0x1b;
    pub const IA32_SYSENTER_CS: u32 = 0x174;
    pub const IA32_SYSENTER_ESP: u32 = 0x175;
    pub const IA32_SYSENTER_EIP: u32 = 0x176;
    pub const IA32_CR_PAT: u32 = 0x277;
    pub const IA32_MISC_ENABLE: u32 = 0x1a0;
    pub const IA32_TSC: u32 = 0x10;
    pub const EFER: u32 = 0xc000_0080;
    pub const STAR: u32 = 0xc000_0081;
    pub const LSTAR: u32 = 0xc000_0082;
    pub const CSTAR: u32 = 0xc000_0083;
    pub const FS_BASE: u32 = 0xc000_0100;
    pub const GS_BASE: u32 = 0xc000_0101;
    pub const KERNEL_GS_BASE: u32 = 0xc000_0102;

    /// IA32_MISC_ENABLE bit 0: fast string operations.
    pub const MISC_ENABLE_FAST_STRING: u64 = 1;
}

/// Capacity of the MSR table inside a [`VcpuState`] record.
pub const MAX_MSR_ENTRIES: usize = 25;

/// CPUID leaf of the architectural performance monitor.
const CPUID_FUNC_PERFMON: u32 = 0x0a;

/// One entry of the CPUID adjustment table.
struct CpuidAdjustment {
    function: u32,
    note: &'static str,
    apply: fn(&mut kvm_cpuid_entry2, &KvmCaps),
}

/// Adjustments applied to the host CPUID table before a vCPU sees it.
const CPUID_ADJUSTMENTS: &[CpuidAdjustment] = &[
    CpuidAdjustment {
        function: 1,
        note: "advertise hypervisor, MSRs and (when available) TSC deadline",
        apply: |entry, caps| {
            entry.ecx |= 1 << 31; // running under a hypervisor
            if caps.tsc_deadline {
                entry.ecx |= 1 << 24; // TSC deadline timer usable
            }
            entry.edx |= 1 << 5; // RDMSR/WRMSR supported
        },
    },
    CpuidAdjustment {
        function: CPUID_FUNC_PERFMON,
        note: "no performance monitoring inside the guest",
        apply: |entry, _| entry.eax = 0,
    },
];

/// Complete serializable register state of one vCPU.
///
/// Written raw (host-endian, host-ABI) to `chkN_coreK.dat` files and the
/// migration stream; both ends of a transfer run the same build.
#[repr(C)]
#[derive(Copy, Clone)]
pub struct VcpuState {
    pub nmsrs: u32,
    _pad: u32,
    pub msrs: [kvm_msr_entry; MAX_MSR_ENTRIES],
    pub regs: kvm_regs,
    pub sregs: kvm_sregs,
    pub fpu: kvm_fpu,
    pub xcrs: kvm_xcrs,
    pub lapic: kvm_lapic_state,
    pub events: kvm_vcpu_events,
    pub mp_state: kvm_mp_state,
}

// Plain aggregate of plain kernel ABI structs.
unsafe impl ByteValued for VcpuState {}

impl Default for VcpuState {
    fn default() -> Self {
        // All-zero is a valid (if empty) snapshot.
        unsafe { std::mem::zeroed() }
    }
}

impl VcpuState {
    /// The raw on-disk/on-wire representation.
    pub fn as_bytes(&self) -> &[u8] {
        self.as_slice()
    }

    /// Read one record back from a file or stream.
    pub fn read_from(reader: &mut impl Read) -> io::Result<Self> {
        let mut buf = vec![0u8; std::mem::size_of::<Self>()];
        reader.read_exact(&mut buf)?;
        // The buffer is exactly one record; alignment is handled by the copy.
        Ok(unsafe { std::ptr::read_unaligned(buf.as_ptr().cast::<Self>()) })
    }
}

/// Exits surfaced to the vCPU dispatch loop.
#[derive(Debug)]
pub enum VcpuExit {
    /// The guest wrote `data` to `port` — a hypercall (PIO or MMIO).
    Hypercall { port: u64, data: u32 },
    /// Normal guest halt.
    Halt,
    /// Triple fault or explicit shutdown request.
    Shutdown,
    /// Debug trap; fatal without an attached debugger stub.
    Debug,
    /// Hardware refused to enter the guest.
    FailEntry(u64),
    /// Accelerator-internal error.
    InternalError,
    /// The run ioctl was interrupted by a signal. Service pending
    /// rendezvous requests and re-enter.
    Interrupted,
    /// An exit this hypervisor does not handle.
    Unknown(&'static str),
}

/// Handle to one accelerator vCPU.
pub struct VcpuHandle {
    vcpu: kvm_ioctls::VcpuFd,
    id: u32,
    cpuid: CpuId,
}

impl VcpuHandle {
    pub(super) fn new(vcpu: kvm_ioctls::VcpuFd, id: u32, supported_cpuid: &CpuId) -> Self {
        Self {
            vcpu,
            id,
            cpuid: supported_cpuid.clone(),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Arm or clear the accelerator's immediate-exit flag.
    ///
    /// Async-signal-safe (a store into the shared run mapping); the
    /// rendezvous signal handler arms it so a signal delivered just before
    /// KVM_RUN cannot leave the thread blocked in the guest.
    pub fn set_immediate_exit(&self, value: bool) {
        // `set_kvm_immediate_exit` takes `&mut self` but only performs a
        // store into the shared kvm_run mmap; the signal handler calls this
        // through a raw `*const VcpuHandle`, so we recover mutability here
        // rather than widen the signature to `&mut self`.
        let vcpu = &self.vcpu as *const kvm_ioctls::VcpuFd as *mut kvm_ioctls::VcpuFd;
        unsafe { (*vcpu).set_kvm_immediate_exit(u8::from(value)) };
    }

    /// Apply the adjusted CPUID table to this vCPU.
    pub fn setup_cpuid(&self, caps: &KvmCaps) -> Result<(), KvmError> {
        let mut cpuid = self.cpuid.clone();
        for entry in cpuid.as_mut_slice() {
            for adj in CPUID_ADJUSTMENTS {
                if entry.function == adj.function {
                    (adj.apply)(entry, caps);
                    tracing::trace!(function = adj.function, "cpuid: {}", adj.note);
                }
            }
        }
        self.vcpu
            .set_cpuid2(&cpuid)
            .map_err(KvmError::SetVcpuState)
    }

    /// Mark the core runnable in the accelerator's MP state machine.
    pub fn set_mp_runnable(&self) -> Result<(), KvmError> {
        let state = kvm_mp_state {
            mp_state: KVM_MP_STATE_RUNNABLE,
        };
        self.vcpu
            .set_mp_state(state)
            .map_err(KvmError::SetVcpuState)
    }

    /// MSR setup for a cold boot: fast string operations on.
    pub fn init_msrs(&self) -> Result<(), KvmError> {
        let entries = [kvm_msr_entry {
            index: msr::IA32_MISC_ENABLE,
            data: msr::MISC_ENABLE_FAST_STRING,
            ..Default::default()
        }];
        let msrs = Msrs::from_entries(&entries).map_err(|_| KvmError::InvalidState("msr table"))?;
        self.vcpu.set_msrs(&msrs).map_err(KvmError::SetVcpuState)?;
        Ok(())
    }

    pub fn set_regs(&self, regs: &kvm_regs) -> Result<(), KvmError> {
        self.vcpu.set_regs(regs).map_err(KvmError::SetVcpuState)
    }

    pub fn get_sregs(&self) -> Result<kvm_sregs, KvmError> {
        self.vcpu.get_sregs().map_err(KvmError::GetVcpuState)
    }

    pub fn set_sregs(&self, sregs: &kvm_sregs) -> Result<(), KvmError> {
        self.vcpu.set_sregs(sregs).map_err(KvmError::SetVcpuState)
    }

    /// Snapshot the full register state for a checkpoint or migration.
    ///
    /// Only called while the core is frozen at a rendezvous barrier.
    pub fn save_state(&self) -> Result<VcpuState, KvmError> {
        let mut state = VcpuState::default();

        let indices = [
            msr::IA32_APICBASE,
            msr::IA32_SYSENTER_CS,
            msr::IA32_SYSENTER_ESP,
            msr::IA32_SYSENTER_EIP,
            msr::IA32_CR_PAT,
            msr::IA32_MISC_ENABLE,
            msr::IA32_TSC,
            msr::CSTAR,
            msr::STAR,
            msr::EFER,
            msr::LSTAR,
            msr::GS_BASE,
            msr::FS_BASE,
            msr::KERNEL_GS_BASE,
        ];
        let entries: Vec<kvm_msr_entry> = indices
            .iter()
            .map(|&index| kvm_msr_entry {
                index,
                ..Default::default()
            })
            .collect();
        let mut msrs =
            Msrs::from_entries(&entries).map_err(|_| KvmError::InvalidState("msr table"))?;
        let nmsrs = self.vcpu.get_msrs(&mut msrs).map_err(KvmError::GetVcpuState)?;

        state.nmsrs = nmsrs as u32;
        state.msrs[..nmsrs].copy_from_slice(&msrs.as_slice()[..nmsrs]);
        state.regs = self.vcpu.get_regs().map_err(KvmError::GetVcpuState)?;
        state.sregs = self.vcpu.get_sregs().map_err(KvmError::GetVcpuState)?;
        state.fpu = self.vcpu.get_fpu().map_err(KvmError::GetVcpuState)?;
        state.xcrs = self.vcpu.get_xcrs().map_err(KvmError::GetVcpuState)?;
        state.lapic = self.vcpu.get_lapic().map_err(KvmError::GetVcpuState)?;
        state.events = self
            .vcpu
            .get_vcpu_events()
            .map_err(KvmError::GetVcpuState)?;
        state.mp_state = self.vcpu.get_mp_state().map_err(KvmError::GetVcpuState)?;

        Ok(state)
    }

    /// Load a snapshot back into the core.
    pub fn restore_state(&self, state: &VcpuState) -> Result<(), KvmError> {
        self.vcpu
            .set_sregs(&state.sregs)
            .map_err(KvmError::SetVcpuState)?;
        self.vcpu
            .set_regs(&state.regs)
            .map_err(KvmError::SetVcpuState)?;

        let nmsrs = (state.nmsrs as usize).min(MAX_MSR_ENTRIES);
        let msrs = Msrs::from_entries(&state.msrs[..nmsrs])
            .map_err(|_| KvmError::InvalidState("msr table"))?;
        self.vcpu.set_msrs(&msrs).map_err(KvmError::SetVcpuState)?;

        self.vcpu
            .set_xcrs(&state.xcrs)
            .map_err(KvmError::SetVcpuState)?;
        // A frozen snapshot must come back runnable.
        self.set_mp_runnable()?;
        self.vcpu
            .set_lapic(&state.lapic)
            .map_err(KvmError::SetVcpuState)?;
        self.vcpu
            .set_fpu(&state.fpu)
            .map_err(KvmError::SetVcpuState)?;
        self.vcpu
            .set_vcpu_events(&state.events)
            .map_err(KvmError::SetVcpuState)?;

        Ok(())
    }

    /// Enter the guest until the next exit.
    pub fn run(&mut self) -> Result<VcpuExit, KvmError> {
        match self.vcpu.run() {
            Ok(RawExit::IoOut(port, data)) => Ok(VcpuExit::Hypercall {
                port: port as u64,
                data: le_u32(data),
            }),
            Ok(RawExit::MmioWrite(addr, data)) => Ok(VcpuExit::Hypercall {
                port: addr,
                data: le_u32(data),
            }),
            Ok(RawExit::Hlt) => Ok(VcpuExit::Halt),
            Ok(RawExit::Shutdown) => Ok(VcpuExit::Shutdown),
            Ok(RawExit::Debug(_)) => Ok(VcpuExit::Debug),
            Ok(RawExit::FailEntry(reason, _)) => Ok(VcpuExit::FailEntry(reason)),
            Ok(RawExit::InternalError) => Ok(VcpuExit::InternalError),
            Ok(RawExit::IoIn(..)) => Ok(VcpuExit::Unknown("io-in")),
            Ok(RawExit::MmioRead(..)) => Ok(VcpuExit::Unknown("mmio-read")),
            Ok(_) => Ok(VcpuExit::Unknown("other")),
            Err(e) if e.errno() == libc::EINTR => Ok(VcpuExit::Interrupted),
            Err(e) if e.errno() == libc::EFAULT => {
                let rip = self.vcpu.get_regs().map(|r| r.rip).unwrap_or(0);
                Err(KvmError::TranslationFault { rip })
            }
            Err(e) => Err(KvmError::Run(e)),
        }
    }

    /// Dump the register state to stderr, for fatal exits.
    pub fn dump_registers(&self) {
        let (Ok(regs), Ok(sregs)) = (self.vcpu.get_regs(), self.vcpu.get_sregs()) else {
            eprintln!("cpu {}: register state unavailable", self.id);
            return;
        };

        eprintln!("\n dump state of cpu {}", self.id);
        eprintln!(" rip: {:016x}   rsp: {:016x} flags: {:016x}", regs.rip, regs.rsp, regs.rflags);
        eprintln!(" rax: {:016x}   rbx: {:016x}   rcx: {:016x}", regs.rax, regs.rbx, regs.rcx);
        eprintln!(" rdx: {:016x}   rsi: {:016x}   rdi: {:016x}", regs.rdx, regs.rsi, regs.rdi);
        eprintln!(" rbp: {:016x}    r8: {:016x}    r9: {:016x}", regs.rbp, regs.r8, regs.r9);
        eprintln!(" r10: {:016x}   r11: {:016x}   r12: {:016x}", regs.r10, regs.r11, regs.r12);
        eprintln!(" r13: {:016x}   r14: {:016x}   r15: {:016x}", regs.r13, regs.r14, regs.r15);
        eprintln!(" cr0: {:016x}   cr2: {:016x}   cr3: {:016x}", sregs.cr0, sregs.cr2, sregs.cr3);
        eprintln!(" cr4: {:016x}   cr8: {:016x}  efer: {:016x}", sregs.cr4, sregs.cr8, sregs.efer);
        eprintln!(
            " gdt: {:016x} ({:04x})  idt: {:016x} ({:04x})",
            sregs.gdt.base, sregs.gdt.limit, sregs.idt.base, sregs.idt.limit
        );
    }
}

/// Little-endian u32 from a 1/2/4-byte I/O access.
fn le_u32(data: &[u8]) -> u32 {
    let mut bytes = [0u8; 4];
    let len = data.len().min(4);
    bytes[..len].copy_from_slice(&data[..len]);
    u32::from_le_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_le_u32() {
        assert_eq!(le_u32(&[0x78]), 0x78);
        assert_eq!(le_u32(&[0x34, 0x12]), 0x1234);
        assert_eq!(le_u32(&[0x78, 0x56, 0x34, 0x12]), 0x1234_5678);
    }

    #[test]
    fn test_vcpu_state_roundtrip_bytes() {
        let mut state = VcpuState::default();
        state.nmsrs = 3;
        state.regs.rip = 0x20_0000;
        state.regs.rsp = 0xdead;
        state.sregs.cr3 = 0x1_0000;

        let bytes = state.as_bytes().to_vec();
        assert_eq!(bytes.len(), std::mem::size_of::<VcpuState>());

        let restored = VcpuState::read_from(&mut bytes.as_slice()).unwrap();
        assert_eq!(restored.nmsrs, 3);
        assert_eq!(restored.regs.rip, 0x20_0000);
        assert_eq!(restored.regs.rsp, 0xdead);
        assert_eq!(restored.sregs.cr3, 0x1_0000);
    }
}
