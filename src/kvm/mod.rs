//! KVM accelerator bridge.
//!
//! Thin, typed wrappers over the three ioctl surfaces the hypervisor talks
//! to:
//!
//! - `/dev/kvm` — API version check, capability probing, VM creation
//! - the VM fd — memory slots, in-kernel irqchip, clock, irqfd wiring
//! - vCPU fds — register families, CPUID filtering, the run loop
//!
//! Everything guest-visible goes through these wrappers; raw
//! `kvm_ioctls` handles never leak into the rest of the crate. Failures
//! during startup are fatal; failures on the vCPU path are reported with
//! enough context to dump the faulting core.

mod vcpu;
mod vm;

pub use vcpu::{VcpuExit, VcpuHandle, VcpuState};
pub use vm::VmHandle;

use kvm_bindings::{KVM_CLOCK_TSC_STABLE, KVM_MAX_CPUID_ENTRIES};
use kvm_ioctls::{Cap, Kvm};
use thiserror::Error;

/// KVM API version this hypervisor is written against.
const REQUIRED_API_VERSION: i32 = 12;

/// Errors from the accelerator bridge.
#[derive(Error, Debug)]
pub enum KvmError {
    #[error("failed to open /dev/kvm: {0}")]
    OpenKvm(#[source] kvm_ioctls::Error),

    #[error("KVM API version is {0}, required is {REQUIRED_API_VERSION}")]
    ApiVersion(i32),

    #[error("required KVM capability {0} is missing")]
    MissingCapability(&'static str),

    #[error("operation requires a resource that does not exist yet: {0}")]
    InvalidState(&'static str),

    #[error("failed to create VM: {0}")]
    CreateVm(#[source] kvm_ioctls::Error),

    #[error("failed to create vCPU: {0}")]
    CreateVcpu(#[source] kvm_ioctls::Error),

    #[error("failed to set user memory region: {0}")]
    SetMemoryRegion(#[source] kvm_ioctls::Error),

    #[error("failed to set up the in-kernel irqchip: {0}")]
    IrqChip(#[source] kvm_ioctls::Error),

    #[error("failed to wire the irq eventfd: {0}")]
    IrqFd(#[source] kvm_ioctls::Error),

    #[error("failed to access the VM clock: {0}")]
    Clock(#[source] kvm_ioctls::Error),

    #[error("failed to get supported CPUID: {0}")]
    GetSupportedCpuid(#[source] kvm_ioctls::Error),

    #[error("failed to configure vCPU state: {0}")]
    SetVcpuState(#[source] kvm_ioctls::Error),

    #[error("failed to read vCPU state: {0}")]
    GetVcpuState(#[source] kvm_ioctls::Error),

    #[error("KVM_RUN failed: {0}")]
    Run(#[source] kvm_ioctls::Error),

    /// The kernel could not translate a guest access (EFAULT from KVM_RUN).
    #[error("host/guest translation fault at guest rip {rip:#x}")]
    TranslationFault { rip: u64 },
}

/// Host accelerator capabilities probed once at startup.
#[derive(Debug, Clone, Copy, Default)]
pub struct KvmCaps {
    /// TSC deadline timer, advertised to the guest through CPUID.
    pub tsc_deadline: bool,
    /// KVM_GET/SET_CLOCK with a stable TSC; gates clock save/restore.
    pub adjust_clock_stable: bool,
}

/// Open the accelerator, verify the API version, probe capabilities and
/// create the virtual machine.
pub fn create_vm() -> Result<VmHandle, KvmError> {
    let kvm = Kvm::new().map_err(KvmError::OpenKvm)?;

    let version = kvm.get_api_version();
    if version != REQUIRED_API_VERSION {
        return Err(KvmError::ApiVersion(version));
    }

    // The network bridge signals guest interrupts through an eventfd; there
    // is no fallback path without irqfd support.
    if !kvm.check_extension(Cap::Irqfd) {
        return Err(KvmError::MissingCapability("KVM_CAP_IRQFD"));
    }

    let caps = KvmCaps {
        tsc_deadline: kvm.check_extension(Cap::TscDeadlineTimer),
        adjust_clock_stable: kvm.check_extension_int(Cap::AdjustClock)
            == KVM_CLOCK_TSC_STABLE as i32,
    };
    tracing::debug!(
        ?caps,
        irqchip = kvm.check_extension(Cap::Irqchip),
        vapic = kvm.check_extension(Cap::Vapic),
        "accelerator capabilities"
    );

    let supported_cpuid = kvm
        .get_supported_cpuid(KVM_MAX_CPUID_ENTRIES)
        .map_err(KvmError::GetSupportedCpuid)?;

    let sync_mmu = kvm.check_extension(Cap::SyncMmu);
    let vm = kvm.create_vm().map_err(KvmError::CreateVm)?;

    VmHandle::new(vm, supported_cpuid, caps, sync_mmu)
}
