//! VM-scoped accelerator operations.
//!
//! A [`VmHandle`] owns the KVM VM file descriptor and performs the one-time
//! x86 platform setup the guest expects: identity-map and TSS addresses for
//! VT-x, the in-kernel irqchip with an IOAPIC redirection table matching the
//! guest kernel's interrupt layout, and the memory slots backing guest RAM.
//!
//! # Memory slots
//!
//! Guest physical memory maps onto one slot for small guests and two for
//! guests straddling the 32-bit MMIO hole:
//!
//! ```text
//! slot 0:  GPA 0          .. 3.25 GiB   → host base
//! slot 1:  GPA 4 GiB      .. end        → host base + 4 GiB
//! ```
//!
//! The hole itself is never registered, so guest accesses into it exit to
//! the hypervisor instead of touching memory.

use kvm_bindings::{
    kvm_clock_data, kvm_enable_cap, kvm_irqchip, kvm_userspace_memory_region, CpuId,
    KVM_CAP_X2APIC_API, KVM_IOAPIC_NUM_PINS, KVM_IRQCHIP_IOAPIC, KVM_X2APIC_API_DISABLE_BROADCAST_QUIRK,
    KVM_X2APIC_API_USE_32BIT_IDS,
};
use vmm_sys_util::eventfd::EventFd;

use super::{KvmCaps, KvmError, VcpuHandle};
use crate::mem::GuestMemory;

/// First interrupt vector wired to an IOAPIC pin.
const IOAPIC_VECTOR_BASE: u64 = 0x20;
/// Mask bit of an IOAPIC redirection entry.
const IOAPIC_MASKED: u64 = 1 << 16;

/// The virtual machine handle.
pub struct VmHandle {
    vm: kvm_ioctls::VmFd,
    /// Host-supported CPUID entries, filtered per vCPU at init time.
    supported_cpuid: CpuId,
    caps: KvmCaps,
}

impl VmHandle {
    /// Wrap a freshly created VM fd and perform the x86 platform setup.
    pub(super) fn new(
        vm: kvm_ioctls::VmFd,
        supported_cpuid: CpuId,
        caps: KvmCaps,
        sync_mmu: bool,
    ) -> Result<Self, KvmError> {
        // With a synchronized MMU the identity pages can sit right below
        // the BIOS region; the legacy address otherwise.
        let identity_base: u64 = if sync_mmu { 0xfeff_c000 } else { 0xfffb_c000 };
        if sync_mmu {
            vm.set_identity_map_address(identity_base)
                .map_err(KvmError::SetVcpuState)?;
        }
        vm.set_tss_address((identity_base + 0x1000) as usize)
            .map_err(KvmError::SetVcpuState)?;

        vm.create_irq_chip().map_err(KvmError::IrqChip)?;

        // 32-bit APIC ids without the broadcast quirk; older kernels simply
        // do not offer the capability.
        let x2apic = kvm_enable_cap {
            cap: KVM_CAP_X2APIC_API,
            args: [
                (KVM_X2APIC_API_USE_32BIT_IDS | KVM_X2APIC_API_DISABLE_BROADCAST_QUIRK) as u64,
                0,
                0,
                0,
            ],
            ..Default::default()
        };
        if let Err(e) = vm.enable_cap(&x2apic) {
            tracing::debug!("x2APIC API capability not enabled: {e}");
        }

        let handle = Self {
            vm,
            supported_cpuid,
            caps,
        };
        handle.seed_ioapic()?;

        Ok(handle)
    }

    /// Seed the IOAPIC redirection table with the guest kernel's static
    /// interrupt layout: vector 0x20 + pin, edge triggered, physical
    /// destination 0, pin 2 (the PIC cascade) masked.
    fn seed_ioapic(&self) -> Result<(), KvmError> {
        let mut chip = kvm_irqchip {
            chip_id: KVM_IRQCHIP_IOAPIC,
            ..Default::default()
        };
        self.vm.get_irqchip(&mut chip).map_err(KvmError::IrqChip)?;

        // chip.chip is a union keyed by chip_id.
        let ioapic = unsafe { &mut chip.chip.ioapic };
        for pin in 0..KVM_IOAPIC_NUM_PINS as usize {
            let mut bits = IOAPIC_VECTOR_BASE + pin as u64;
            if pin == 2 {
                bits |= IOAPIC_MASKED;
            }
            ioapic.redirtbl[pin].bits = bits;
        }

        self.vm.set_irqchip(&chip).map_err(KvmError::IrqChip)
    }

    /// Probed accelerator capabilities.
    pub fn caps(&self) -> KvmCaps {
        self.caps
    }

    /// Register the guest memory chunks as accelerator slots.
    pub fn register_memory(&self, mem: &GuestMemory) -> Result<(), KvmError> {
        for (slot, chunk) in mem.chunks().iter().enumerate() {
            let region = kvm_userspace_memory_region {
                slot: slot as u32,
                guest_phys_addr: chunk.gpa,
                memory_size: chunk.size,
                userspace_addr: mem.host_base() + chunk.gpa,
                flags: 0,
            };
            // The mapping outlives the VM and the chunks never overlap.
            unsafe {
                self.vm
                    .set_user_memory_region(region)
                    .map_err(KvmError::SetMemoryRegion)?;
            }
        }
        Ok(())
    }

    /// Create the vCPU for `core_id`.
    pub fn create_vcpu(&self, core_id: u32) -> Result<VcpuHandle, KvmError> {
        let vcpu = self
            .vm
            .create_vcpu(core_id as u64)
            .map_err(KvmError::CreateVcpu)?;
        Ok(VcpuHandle::new(vcpu, core_id, &self.supported_cpuid))
    }

    /// Bind an eventfd to a guest interrupt line.
    pub fn register_irqfd(&self, fd: &EventFd, gsi: u32) -> Result<(), KvmError> {
        self.vm.register_irqfd(fd, gsi).map_err(KvmError::IrqFd)
    }

    /// Read the guest clock. Only meaningful with a stable adjust-clock
    /// capability.
    pub fn get_clock(&self) -> Result<kvm_clock_data, KvmError> {
        self.vm.get_clock().map_err(KvmError::Clock)
    }

    /// Restore the guest clock from a snapshot.
    pub fn set_clock(&self, clock: &kvm_clock_data) -> Result<(), KvmError> {
        if !self.caps.adjust_clock_stable {
            return Err(KvmError::InvalidState("stable clock capability"));
        }
        // Only the raw counter may be written back; flags carry host state.
        let data = kvm_clock_data {
            clock: clock.clock,
            ..Default::default()
        };
        self.vm.set_clock(&data).map_err(KvmError::Clock)
    }
}
