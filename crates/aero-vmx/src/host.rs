//! Host-state area: checked on VM entry, loaded on VM exit.

use crate::caps::VmxCapabilities;
use crate::controls::{EntryControls, ExitControls, VmcsCache};
use crate::error::{VmEntryError, VmxInstructionError};
use crate::fields;
use crate::memory::PhysicalMemory;
use crate::state::{cr0, cr4, efer, Segment, VmxCpu};
use crate::vmcs::VmcsAccess;

/// IA32_S_CET / IA32_U_CET bits checked by VM entry.
pub mod cet {
    pub const SUPPRESS_INDIRECT_BRANCH_TRACKING: u64 = 1 << 10;
    pub const WAIT_FOR_ENDBRANCH: u64 = 1 << 11;
    pub const RESERVED: u64 = 0x3c0;
}

/// Snapshot of the host-state area taken by the last successful VM entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HostState {
    pub cr0: u64,
    pub cr3: u64,
    pub cr4: u64,
    /// ES, CS, SS, DS, FS, GS selectors.
    pub selectors: [u16; 6],
    pub tr_selector: u16,
    pub tr_base: u64,
    pub fs_base: u64,
    pub gs_base: u64,
    pub gdtr_base: u64,
    pub idtr_base: u64,
    pub sysenter_esp: u64,
    pub sysenter_eip: u64,
    pub sysenter_cs: u16,
    pub pat: u64,
    pub efer: u64,
    pub rsp: u64,
    pub rip: u64,
    pub s_cet: u64,
    pub ssp: u64,
    pub interrupt_ssp_table: u64,
    pub pkrs: u64,
}

impl HostState {
    #[inline]
    pub fn selector(&self, seg: Segment) -> u16 {
        self.selectors[seg as usize]
    }
}

/// Memory types permitted in each PAT entry: UC, WC, WT, WP, WB and UC-.
pub fn is_valid_pat(pat: u64) -> bool {
    pat.to_le_bytes()
        .iter()
        .all(|&memtype| matches!(memtype, 0 | 1 | 4 | 5 | 6 | 7))
}

pub fn is_invalid_cet_control(value: u64) -> bool {
    let both = cet::SUPPRESS_INDIRECT_BRANCH_TRACKING | cet::WAIT_FOR_ENDBRANCH;
    value & both == both || value & cet::RESERVED != 0
}

fn vmfail(rule: &'static str) -> VmEntryError {
    tracing::error!("VMFAIL: VMCS host state: {rule}");
    VmxInstructionError::InvalidHostStateField.into()
}

/// Reads and validates the host-state area.
///
/// `vm` must hold the controls validated by
/// [`load_check_vm_controls`](crate::controls::load_check_vm_controls) for the
/// same entry. Errors are VMfailValid(8).
pub fn load_check_host_state<M: PhysicalMemory + ?Sized>(
    vmcs: &mut VmcsAccess<'_, M>,
    caps: &VmxCapabilities,
    cpu: &VmxCpu,
    vm: &VmcsCache,
) -> Result<HostState, VmEntryError> {
    let x86_64_host = vm.exit.contains(ExitControls::HOST_ADDRESS_SPACE_SIZE);
    let x86_64_guest = vm.entry.contains(EntryControls::IA32E_MODE_GUEST);

    if cpu.long_mode() {
        if !x86_64_host {
            return Err(vmfail("x86-64 host control clear while in long mode"));
        }
    } else if x86_64_host || x86_64_guest {
        tracing::error!(
            x86_64_host,
            x86_64_guest,
            "VMFAIL: VMCS host state: x86-64 guest/host controls outside long mode"
        );
        return Err(VmxInstructionError::InvalidHostStateField.into());
    }

    let mut host = HostState::default();

    host.cr0 = vmcs.read_natural(fields::HOST_CR0)?;
    if !host.cr0 & caps.cr0_fixed0 != 0 || host.cr0 & !caps.cr0_fixed1 != 0 {
        tracing::error!(cr0 = host.cr0, "VMFAIL: VMCS host state invalid CR0");
        return Err(VmxInstructionError::InvalidHostStateField.into());
    }

    host.cr3 = vmcs.read_natural(fields::HOST_CR3)?;
    if !caps.is_valid_phys_addr(host.cr3) {
        tracing::error!(cr3 = host.cr3, "VMFAIL: VMCS host state invalid CR3");
        return Err(VmxInstructionError::InvalidHostStateField.into());
    }

    host.cr4 = vmcs.read_natural(fields::HOST_CR4)?;
    if !host.cr4 & caps.cr4_fixed0 != 0 || host.cr4 & !caps.cr4_fixed1 != 0 {
        tracing::error!(cr4 = host.cr4, "VMFAIL: VMCS host state invalid CR4");
        return Err(VmxInstructionError::InvalidHostStateField.into());
    }

    for (n, selector) in host.selectors.iter_mut().enumerate() {
        *selector = vmcs.read16(fields::host_selector(n))?;
        if *selector & 7 != 0 {
            tracing::error!(segment = Segment::ALL[n].name(), "VMFAIL: VMCS host segreg TI/RPL != 0");
            return Err(VmxInstructionError::InvalidHostStateField.into());
        }
    }
    if host.selector(Segment::CS) == 0 {
        return Err(vmfail("CS selector 0"));
    }
    if !x86_64_host && host.selector(Segment::SS) == 0 {
        return Err(vmfail("SS selector 0"));
    }

    host.tr_selector = vmcs.read16(fields::HOST_TR_SELECTOR)?;
    if host.tr_selector == 0 || host.tr_selector & 7 != 0 {
        return Err(vmfail("invalid TR selector"));
    }

    host.tr_base = vmcs.read_natural(fields::HOST_TR_BASE)?;
    if !caps.is_canonical(host.tr_base) {
        return Err(vmfail("TR base non canonical"));
    }

    host.fs_base = vmcs.read_natural(fields::HOST_FS_BASE)?;
    host.gs_base = vmcs.read_natural(fields::HOST_GS_BASE)?;
    if !caps.is_canonical(host.fs_base) {
        return Err(vmfail("FS base non canonical"));
    }
    if !caps.is_canonical(host.gs_base) {
        return Err(vmfail("GS base non canonical"));
    }

    host.gdtr_base = vmcs.read_natural(fields::HOST_GDTR_BASE)?;
    host.idtr_base = vmcs.read_natural(fields::HOST_IDTR_BASE)?;
    if !caps.is_canonical(host.gdtr_base) {
        return Err(vmfail("GDTR base non canonical"));
    }
    if !caps.is_canonical(host.idtr_base) {
        return Err(vmfail("IDTR base non canonical"));
    }

    host.sysenter_esp = vmcs.read_natural(fields::HOST_IA32_SYSENTER_ESP)?;
    host.sysenter_eip = vmcs.read_natural(fields::HOST_IA32_SYSENTER_EIP)?;
    host.sysenter_cs = vmcs.read32(fields::HOST_IA32_SYSENTER_CS)? as u16;
    if !caps.is_canonical(host.sysenter_esp) {
        return Err(vmfail("SYSENTER_ESP non canonical"));
    }
    if !caps.is_canonical(host.sysenter_eip) {
        return Err(vmfail("SYSENTER_EIP non canonical"));
    }

    if vm.exit.contains(ExitControls::LOAD_PAT) {
        host.pat = vmcs.read64(fields::HOST_IA32_PAT)?;
        if !is_valid_pat(host.pat) {
            tracing::error!(pat = host.pat, "VMFAIL: invalid memory type in host IA32_PAT");
            return Err(VmxInstructionError::InvalidHostStateField.into());
        }
    }

    host.rsp = vmcs.read_natural(fields::HOST_RSP)?;
    host.rip = vmcs.read_natural(fields::HOST_RIP)?;

    if vm.exit.contains(ExitControls::LOAD_CET_STATE) {
        let high_ok = |value: u64| x86_64_host || value >> 32 == 0;

        host.s_cet = vmcs.read_natural(fields::HOST_IA32_S_CET)?;
        if !caps.is_canonical(host.s_cet) || !high_ok(host.s_cet) {
            return Err(vmfail("IA32_S_CET non canonical or invalid"));
        }
        if is_invalid_cet_control(host.s_cet) {
            return Err(vmfail("IA32_S_CET invalid"));
        }

        host.ssp = vmcs.read_natural(fields::HOST_SSP)?;
        if !caps.is_canonical(host.ssp) || !high_ok(host.ssp) {
            return Err(vmfail("SSP non canonical or invalid"));
        }
        if host.ssp & 3 != 0 {
            return Err(vmfail("SSP[1:0] not zero"));
        }

        host.interrupt_ssp_table = vmcs.read_natural(fields::HOST_INTERRUPT_SSP_TABLE_ADDR)?;
        if !caps.is_canonical(host.interrupt_ssp_table) {
            return Err(vmfail("interrupt SSP table address non canonical"));
        }

        if host.cr4 & cr4::CET != 0 && host.cr0 & cr0::WP == 0 {
            return Err(vmfail("CR4.CET=1 when CR0.WP=0"));
        }
    }

    if vm.exit.contains(ExitControls::LOAD_PKRS) {
        host.pkrs = vmcs.read64(fields::HOST_IA32_PKRS)?;
        if host.pkrs >> 32 != 0 {
            return Err(vmfail("invalid IA32_PKRS value"));
        }
    }

    if vm.exit.contains(ExitControls::LOAD_EFER) {
        host.efer = vmcs.read64(fields::HOST_IA32_EFER)?;
        if host.efer & !caps.efer_supported != 0 {
            tracing::error!(efer = host.efer, "VMFAIL: VMCS host EFER reserved bits set");
            return Err(VmxInstructionError::InvalidHostStateField.into());
        }
        let lme = host.efer & efer::LME != 0;
        let lma = host.efer & efer::LMA != 0;
        if lma != lme || lma != x86_64_host {
            tracing::error!(efer = host.efer, "VMFAIL: VMCS host EFER inconsistent value");
            return Err(VmxInstructionError::InvalidHostStateField.into());
        }
    }

    if x86_64_host {
        if host.cr4 & cr4::PAE == 0 {
            return Err(vmfail("CR4.PAE=0 with x86-64 host"));
        }
        if !caps.is_canonical(host.rip) {
            return Err(vmfail("RIP non-canonical"));
        }
    } else {
        if host.rip >> 32 != 0 {
            return Err(vmfail("RIP > 32 bit"));
        }
        if host.cr4 & cr4::PCIDE != 0 {
            return Err(vmfail("CR4.PCIDE set"));
        }
    }

    Ok(host)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pat_memory_types() {
        assert!(is_valid_pat(0x0007_0406_0007_0406));
        assert!(!is_valid_pat(0x0007_0406_0007_0402));
        assert!(!is_valid_pat(0x0800_0000_0000_0000));
    }

    #[test]
    fn cet_control_rejects_reserved_and_contradictory_bits() {
        assert!(!is_invalid_cet_control(0));
        assert!(!is_invalid_cet_control(cet::WAIT_FOR_ENDBRANCH));
        assert!(is_invalid_cet_control(
            cet::WAIT_FOR_ENDBRANCH | cet::SUPPRESS_INDIRECT_BRANCH_TRACKING
        ));
        assert!(is_invalid_cet_control(1 << 6));
    }
}
