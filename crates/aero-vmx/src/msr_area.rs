//! VM-entry / VM-exit MSR-load and MSR-store areas.
//!
//! Each entry is 16 bytes: MSR index in bits 31:0, reserved bits 63:32, then
//! the 64-bit MSR value.

use crate::caps::{IsaFeatures, VmxCapabilities};
use crate::memory::PhysicalMemory;
use crate::platform::MsrAccess;
use crate::state::{msr, VmxCpu};

pub const ENTRY_SIZE: u64 = 16;

/// 1-based index of the entry that could not be processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsrAreaFailure(pub u32);

/// Loads `count` MSRs from the area at `addr`. Stops at the first bad entry.
pub fn load_msrs<P>(
    bus: &mut P,
    cpu: &mut VmxCpu,
    caps: &VmxCapabilities,
    count: u32,
    addr: u64,
) -> Result<(), MsrAreaFailure>
where
    P: PhysicalMemory + MsrAccess + ?Sized,
{
    let x2apic = caps.has_isa(IsaFeatures::X2APIC);
    let mut entry_addr = addr;
    for n in 1..=count {
        let lo = bus.read_u64(entry_addr);
        let value = bus.read_u64(entry_addr + 8);
        entry_addr += ENTRY_SIZE;

        if lo >> 32 != 0 {
            tracing::error!(entry = n, lo, "VMX LoadMSRs: broken msr index");
            return Err(MsrAreaFailure(n));
        }
        let index = lo as u32;

        if index == msr::IA32_FS_BASE || index == msr::IA32_GS_BASE {
            tracing::error!(entry = n, "VMX LoadMSRs: unable to restore FSBASE or GSBASE");
            return Err(MsrAreaFailure(n));
        }
        if x2apic && msr::is_x2apic(index) {
            tracing::error!(entry = n, index, "VMX LoadMSRs: unable to restore X2APIC range MSR");
            return Err(MsrAreaFailure(n));
        }
        if !bus.wrmsr(cpu, index, value) {
            tracing::error!(entry = n, index, "VMX LoadMSRs: unable to set up MSR");
            return Err(MsrAreaFailure(n));
        }
    }
    Ok(())
}

/// Stores the current value of each MSR named in the area at `addr` into the
/// value half of its entry.
pub fn store_msrs<P>(
    bus: &mut P,
    cpu: &VmxCpu,
    caps: &VmxCapabilities,
    count: u32,
    addr: u64,
) -> Result<(), MsrAreaFailure>
where
    P: PhysicalMemory + MsrAccess + ?Sized,
{
    let x2apic = caps.has_isa(IsaFeatures::X2APIC);
    let mut entry_addr = addr;
    for n in 1..=count {
        let lo = bus.read_u64(entry_addr);
        if lo >> 32 != 0 {
            tracing::error!(entry = n, lo, "VMX StoreMSRs: broken msr index");
            return Err(MsrAreaFailure(n));
        }
        let index = lo as u32;

        if x2apic && msr::is_x2apic(index) {
            tracing::error!(entry = n, index, "VMX StoreMSRs: unable to save X2APIC range MSR");
            return Err(MsrAreaFailure(n));
        }
        let Some(value) = bus.rdmsr(cpu, index) else {
            tracing::error!(entry = n, index, "VMX StoreMSRs: unable to read MSR");
            return Err(MsrAreaFailure(n));
        };

        bus.write_u64(entry_addr + 8, value);
        entry_addr += ENTRY_SIZE;
    }
    Ok(())
}
