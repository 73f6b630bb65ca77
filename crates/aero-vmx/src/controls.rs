//! VM-execution, VM-exit and VM-entry controls.
//!
//! [`load_check_vm_controls`] reads every control field of the current VMCS
//! into a fresh [`VmcsCache`] and validates it. Nothing outside the returned
//! cache is modified, so a rejected entry leaves the processor untouched.

use bitflags::bitflags;

use crate::caps::{self, ept_vpid, IsaFeatures, VmxCapabilities, VmxFeatures};
use crate::error::{FatalError, VmEntryError, VmxInstructionError};
use crate::fields;
use crate::host::HostState;
use crate::inject::{self, interruption, EventInjection};
use crate::memory::PhysicalMemory;
use crate::state::{cr0, VmxCpu};
use crate::vmcs::VmcsAccess;

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
    pub struct PinControls: u32 {
        const EXTERNAL_INTERRUPT_EXITING = 1 << 0;
        const NMI_EXITING = 1 << 3;
        const VIRTUAL_NMI = 1 << 5;
        const PREEMPTION_TIMER = 1 << 6;
        const POSTED_INTERRUPTS = 1 << 7;
    }
}

bitflags! {
    /// Primary processor-based VM-execution controls.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
    pub struct ProcControls: u32 {
        const INTERRUPT_WINDOW_EXITING = 1 << 2;
        const TSC_OFFSETTING = 1 << 3;
        const HLT_EXITING = 1 << 7;
        const INVLPG_EXITING = 1 << 9;
        const MWAIT_EXITING = 1 << 10;
        const RDPMC_EXITING = 1 << 11;
        const RDTSC_EXITING = 1 << 12;
        const CR3_LOAD_EXITING = 1 << 15;
        const CR3_STORE_EXITING = 1 << 16;
        const CR8_LOAD_EXITING = 1 << 19;
        const CR8_STORE_EXITING = 1 << 20;
        const TPR_SHADOW = 1 << 21;
        const NMI_WINDOW_EXITING = 1 << 22;
        const MOV_DR_EXITING = 1 << 23;
        const UNCONDITIONAL_IO_EXITING = 1 << 24;
        const IO_BITMAPS = 1 << 25;
        const MONITOR_TRAP_FLAG = 1 << 27;
        const MSR_BITMAPS = 1 << 28;
        const MONITOR_EXITING = 1 << 29;
        const PAUSE_EXITING = 1 << 30;
        const SECONDARY_CONTROLS = 1 << 31;
    }
}

bitflags! {
    /// Secondary processor-based VM-execution controls.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
    pub struct SecondaryControls: u32 {
        const VIRTUALIZE_APIC_ACCESSES = 1 << 0;
        const EPT = 1 << 1;
        const DESCRIPTOR_TABLE_EXITING = 1 << 2;
        const RDTSCP = 1 << 3;
        const VIRTUALIZE_X2APIC = 1 << 4;
        const VPID = 1 << 5;
        const WBINVD_EXITING = 1 << 6;
        const UNRESTRICTED_GUEST = 1 << 7;
        const APIC_REGISTER_VIRTUALIZATION = 1 << 8;
        const VIRTUAL_INTERRUPT_DELIVERY = 1 << 9;
        const PAUSE_LOOP_EXITING = 1 << 10;
        const RDRAND_EXITING = 1 << 11;
        const INVPCID = 1 << 12;
        const VM_FUNCTIONS = 1 << 13;
        const VMCS_SHADOWING = 1 << 14;
        const ENCLS_EXITING = 1 << 15;
        const RDSEED_EXITING = 1 << 16;
        const PML = 1 << 17;
        const EPT_VIOLATION_VE = 1 << 18;
        const XSAVES = 1 << 20;
        const MODE_BASED_EXECUTE = 1 << 22;
        const SUB_PAGE_WRITE_PROTECT = 1 << 23;
        const TSC_SCALING = 1 << 25;
    }
}

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
    pub struct ExitControls: u32 {
        const SAVE_DEBUG_CONTROLS = 1 << 2;
        /// Host is 64-bit after the exit.
        const HOST_ADDRESS_SPACE_SIZE = 1 << 9;
        const LOAD_PERF_GLOBAL_CTRL = 1 << 12;
        const ACK_INTERRUPT_ON_EXIT = 1 << 15;
        const SAVE_PAT = 1 << 18;
        const LOAD_PAT = 1 << 19;
        const SAVE_EFER = 1 << 20;
        const LOAD_EFER = 1 << 21;
        const SAVE_PREEMPTION_TIMER = 1 << 22;
        const LOAD_CET_STATE = 1 << 28;
        const LOAD_PKRS = 1 << 29;
    }
}

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
    pub struct EntryControls: u32 {
        const LOAD_DEBUG_CONTROLS = 1 << 2;
        const IA32E_MODE_GUEST = 1 << 9;
        const ENTRY_TO_SMM = 1 << 10;
        const DEACTIVATE_DUAL_MONITOR = 1 << 11;
        const LOAD_PERF_GLOBAL_CTRL = 1 << 13;
        const LOAD_PAT = 1 << 14;
        const LOAD_EFER = 1 << 15;
        const LOAD_CET_STATE = 1 << 20;
        const LOAD_PKRS = 1 << 22;
    }
}

/// Pause-loop exiting window state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PauseLoopExiting {
    pub gap: u32,
    pub window: u32,
    pub first_pause_time: u64,
    pub last_pause_time: u64,
}

/// Decoded copy of the VMCS controls consulted while the guest runs.
///
/// Rebuilt on every VM entry; the exit pipeline writes the few fields the
/// guest can change (interrupt status, PML index) back to the VMCS.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VmcsCache {
    pub pin: PinControls,
    pub proc: ProcControls,
    pub secondary: SecondaryControls,

    pub exception_bitmap: u32,
    pub pf_error_code_mask: u32,
    pub pf_error_code_match: u32,
    pub cr0_mask: u64,
    pub cr0_read_shadow: u64,
    pub cr4_mask: u64,
    pub cr4_read_shadow: u64,
    pub cr3_target_count: u32,
    pub cr3_targets: [u64; caps::CR3_TARGET_MAX as usize],

    pub io_bitmap: [u64; 2],
    pub msr_bitmap: u64,

    pub virtual_apic_page: u64,
    pub tpr_threshold: u32,
    pub apic_access_page: u64,
    /// Requesting virtual interrupt (low byte of the guest interrupt status).
    pub rvi: u8,
    /// Servicing virtual interrupt (high byte of the guest interrupt status).
    pub svi: u8,
    pub eoi_exit_bitmap: [u32; 8],

    pub eptp: u64,
    pub vpid: u16,
    pub pml_address: u64,
    pub pml_index: u16,
    pub spptp: u64,
    pub ple: PauseLoopExiting,

    pub vmread_bitmap: u64,
    pub vmwrite_bitmap: u64,
    pub ve_info_addr: u64,
    pub xss_exiting_bitmap: u64,
    pub tsc_multiplier: u64,
    pub vmfunc: u64,
    pub eptp_list_address: u64,

    pub exit: ExitControls,
    pub exit_msr_store_count: u32,
    pub exit_msr_store_addr: u64,
    pub exit_msr_load_count: u32,
    pub exit_msr_load_addr: u64,

    pub entry: EntryControls,
    pub entry_msr_load_count: u32,
    pub entry_msr_load_addr: u64,
    pub event: EventInjection,

    /// IDT-vectoring information of the event being delivered when the next
    /// VM exit happens.
    pub idt_vector_info: u32,
    pub idt_vector_error_code: u32,

    /// Guest VMCS link pointer of the last entry.
    pub link_pointer: u64,
    pub host: HostState,
}

impl VmcsCache {
    #[inline]
    pub fn unrestricted_guest(&self) -> bool {
        self.secondary.contains(SecondaryControls::UNRESTRICTED_GUEST)
    }

    #[inline]
    pub fn ept_enabled(&self) -> bool {
        self.secondary.contains(SecondaryControls::EPT)
    }

    #[inline]
    pub fn ia32e_mode_guest(&self) -> bool {
        self.entry.contains(EntryControls::IA32E_MODE_GUEST)
    }
}

fn vmfail(rule: &'static str) -> VmEntryError {
    tracing::error!("VMFAIL: VMCS EXEC CTRL: {rule}");
    VmxInstructionError::InvalidControlField.into()
}

/// Reads and validates the VM-execution, VM-exit and VM-entry control fields.
///
/// Errors are VMfailValid(7) except for internal layout errors. The checks run
/// in architectural order; the first failing rule is reported.
pub fn load_check_vm_controls<M: PhysicalMemory + ?Sized>(
    vmcs: &mut VmcsAccess<'_, M>,
    caps: &VmxCapabilities,
    cpu: &VmxCpu,
) -> Result<VmcsCache, VmEntryError> {
    let mut vm = VmcsCache::default();

    let pin = vmcs.read32(fields::PIN_BASED_CTRLS)?;
    let proc = vmcs.read32(fields::PROC_BASED_CTRLS)?;
    let secondary = if proc & ProcControls::SECONDARY_CONTROLS.bits() != 0 {
        vmcs.read32(fields::SECONDARY_PROC_BASED_CTRLS)?
    } else {
        0
    };
    vm.pin = PinControls::from_bits_retain(pin);
    vm.proc = ProcControls::from_bits_retain(proc);
    vm.secondary = SecondaryControls::from_bits_retain(secondary);

    vm.exception_bitmap = vmcs.read32(fields::EXCEPTION_BITMAP)?;
    vm.pf_error_code_mask = vmcs.read32(fields::PAGE_FAULT_ERR_CODE_MASK)?;
    vm.pf_error_code_match = vmcs.read32(fields::PAGE_FAULT_ERR_CODE_MATCH)?;
    vm.cr0_mask = vmcs.read_natural(fields::CR0_GUEST_HOST_MASK)?;
    vm.cr4_mask = vmcs.read_natural(fields::CR4_GUEST_HOST_MASK)?;
    vm.cr0_read_shadow = vmcs.read_natural(fields::CR0_READ_SHADOW)?;
    vm.cr4_read_shadow = vmcs.read_natural(fields::CR4_READ_SHADOW)?;

    vm.cr3_target_count = vmcs.read32(fields::CR3_TARGET_COUNT)?;
    for (n, target) in vm.cr3_targets.iter_mut().enumerate() {
        *target = vmcs.read_natural(fields::CR3_TARGET0 + 2 * n as u32)?;
    }

    if !caps.pin.accepts(pin) {
        tracing::error!(pin, "VMFAIL: VMCS EXEC CTRL: pin-based controls allowed 0/1 settings");
        return Err(VmxInstructionError::InvalidControlField.into());
    }
    if !caps.proc.accepts(proc) {
        tracing::error!(proc, "VMFAIL: VMCS EXEC CTRL: processor-based controls allowed 0/1 settings");
        return Err(VmxInstructionError::InvalidControlField.into());
    }
    if !caps.secondary.accepts(secondary) {
        tracing::error!(
            secondary,
            "VMFAIL: VMCS EXEC CTRL: secondary controls allowed 0/1 settings"
        );
        return Err(VmxInstructionError::InvalidControlField.into());
    }

    if vm.cr3_target_count > caps.cr3_target_count() {
        tracing::error!(count = vm.cr3_target_count, "VMFAIL: VMCS EXEC CTRL: too many CR3 targets");
        return Err(VmxInstructionError::InvalidControlField.into());
    }

    if vm.proc.contains(ProcControls::IO_BITMAPS) {
        vm.io_bitmap[0] = vmcs.read64(fields::IO_BITMAP_A)?;
        vm.io_bitmap[1] = vmcs.read64(fields::IO_BITMAP_B)?;
        if !vm.io_bitmap.iter().all(|&a| caps.is_valid_page_aligned_phys_addr(a)) {
            return Err(vmfail("I/O bitmap address malformed"));
        }
    }

    if vm.proc.contains(ProcControls::MSR_BITMAPS) {
        vm.msr_bitmap = vmcs.read64(fields::MSR_BITMAPS)?;
        if !caps.is_valid_page_aligned_phys_addr(vm.msr_bitmap) {
            return Err(vmfail("MSR bitmap address malformed"));
        }
    }

    if !vm.pin.contains(PinControls::NMI_EXITING) && vm.pin.contains(PinControls::VIRTUAL_NMI) {
        return Err(vmfail("virtual NMI without NMI exiting"));
    }
    if !vm.pin.contains(PinControls::VIRTUAL_NMI)
        && vm.proc.contains(ProcControls::NMI_WINDOW_EXITING)
    {
        return Err(vmfail("NMI-window exiting without virtual NMI"));
    }

    if vm.secondary.contains(SecondaryControls::VMCS_SHADOWING) {
        vm.vmread_bitmap = vmcs.read64(fields::VMREAD_BITMAP_ADDR)?;
        if !caps.is_valid_page_aligned_phys_addr(vm.vmread_bitmap) {
            return Err(vmfail("VMREAD bitmap address malformed"));
        }
        vm.vmwrite_bitmap = vmcs.read64(fields::VMWRITE_BITMAP_ADDR)?;
        if !caps.is_valid_page_aligned_phys_addr(vm.vmwrite_bitmap) {
            return Err(vmfail("VMWRITE bitmap address malformed"));
        }
    }

    if vm.secondary.contains(SecondaryControls::EPT_VIOLATION_VE) {
        vm.ve_info_addr = vmcs.read64(fields::VE_INFO_ADDR)?;
        if !caps.is_valid_page_aligned_phys_addr(vm.ve_info_addr) {
            return Err(vmfail("#VE information address malformed"));
        }
    }

    if vm.proc.contains(ProcControls::TPR_SHADOW) {
        vm.virtual_apic_page = vmcs.read64(fields::VIRTUAL_APIC_PAGE_ADDR)?;
        if !caps.is_valid_page_aligned_phys_addr(vm.virtual_apic_page) {
            return Err(vmfail("virtual-APIC page address malformed"));
        }

        if vm.secondary.contains(SecondaryControls::VIRTUAL_INTERRUPT_DELIVERY) {
            if !vm.pin.contains(PinControls::EXTERNAL_INTERRUPT_EXITING) {
                return Err(vmfail("virtual interrupt delivery without external-interrupt exiting"));
            }
            for (reg, bitmap) in vm.eoi_exit_bitmap.iter_mut().enumerate() {
                // Dword granular: the odd encodings are the high halves.
                *bitmap = vmcs.read32(fields::EOI_EXIT_BITMAP0 + reg as u32)?;
            }
            let status = vmcs.read16(fields::GUEST_INTERRUPT_STATUS)?;
            vm.rvi = status as u8;
            vm.svi = (status >> 8) as u8;
        } else {
            vm.tpr_threshold = vmcs.read32(fields::TPR_THRESHOLD)?;
            if vm.tpr_threshold & 0xffff_fff0 != 0 {
                tracing::error!(threshold = vm.tpr_threshold, "VMFAIL: VMCS EXEC CTRL: TPR threshold reserved bits");
                return Err(VmxInstructionError::InvalidControlField.into());
            }
            if !vm.secondary.contains(SecondaryControls::VIRTUALIZE_APIC_ACCESSES) {
                let vtpr = vmcs.memory().read_u32(vm.virtual_apic_page + 0x80);
                let tpr_shadow = (vtpr >> 4) & 0xf;
                if vm.tpr_threshold > tpr_shadow {
                    tracing::error!(
                        threshold = vm.tpr_threshold,
                        tpr_shadow,
                        "VMFAIL: VMCS EXEC CTRL: TPR threshold > TPR shadow"
                    );
                    return Err(VmxInstructionError::InvalidControlField.into());
                }
            }
        }
    } else {
        let needs_tpr_shadow = SecondaryControls::VIRTUALIZE_X2APIC
            | SecondaryControls::APIC_REGISTER_VIRTUALIZATION
            | SecondaryControls::VIRTUAL_INTERRUPT_DELIVERY;
        if vm.secondary.intersects(needs_tpr_shadow) {
            return Err(vmfail("APIC virtualization without TPR shadow"));
        }
    }

    if vm.secondary.contains(SecondaryControls::VIRTUALIZE_APIC_ACCESSES) {
        vm.apic_access_page = vmcs.read64(fields::APIC_ACCESS_ADDR)?;
        if !caps.is_valid_page_aligned_phys_addr(vm.apic_access_page) {
            return Err(vmfail("APIC-access page address malformed"));
        }
        if vm.secondary.contains(SecondaryControls::VIRTUALIZE_X2APIC) {
            return Err(vmfail("x2APIC virtualization together with APIC-access virtualization"));
        }
    }

    if vm.ept_enabled() {
        vm.eptp = vmcs.read64(fields::EPTP)?;
        if !caps.is_valid_eptp(vm.eptp) {
            return Err(vmfail("invalid EPTP"));
        }
    } else if vm.unrestricted_guest() {
        return Err(vmfail("unrestricted guest without EPT"));
    }

    if vm.secondary.contains(SecondaryControls::VPID) {
        vm.vpid = vmcs.read16(fields::VPID)?;
        if vm.vpid == 0 {
            return Err(vmfail("guest VPID == 0"));
        }
    }

    if vm.secondary.contains(SecondaryControls::PAUSE_LOOP_EXITING) {
        vm.ple.gap = vmcs.read32(fields::PAUSE_LOOP_EXITING_GAP)?;
        vm.ple.window = vmcs.read32(fields::PAUSE_LOOP_EXITING_WINDOW)?;
    }

    vm.vmfunc = if vm.secondary.contains(SecondaryControls::VM_FUNCTIONS) {
        vmcs.read64(fields::VMFUNC_CTRLS)?
    } else {
        0
    };
    if vm.vmfunc & !caps.vmfunc != 0 {
        tracing::error!(vmfunc = vm.vmfunc, "VMFAIL: VMCS EXEC CTRL: VM-function controls reserved bits");
        return Err(VmxInstructionError::InvalidControlField.into());
    }
    if vm.vmfunc & caps::VMFUNC_EPTP_SWITCHING != 0 {
        if !vm.ept_enabled() {
            return Err(vmfail("EPTP switching without EPT"));
        }
        vm.eptp_list_address = vmcs.read64(fields::EPTP_LIST_ADDRESS)?;
        if !caps.is_valid_page_aligned_phys_addr(vm.eptp_list_address) {
            return Err(vmfail("EPTP list address malformed"));
        }
    }

    if vm.secondary.contains(SecondaryControls::PML) {
        if !vm.ept_enabled() {
            return Err(vmfail("PML without EPT"));
        }
        vm.pml_address = vmcs.read64(fields::PML_ADDRESS)?;
        if !caps.is_valid_page_aligned_phys_addr(vm.pml_address) {
            return Err(vmfail("PML base address malformed"));
        }
        vm.pml_index = vmcs.read16(fields::GUEST_PML_INDEX)?;
    }

    if vm.secondary.contains(SecondaryControls::SUB_PAGE_WRITE_PROTECT) {
        if !vm.ept_enabled() {
            return Err(vmfail("sub-page write protection without EPT"));
        }
        vm.spptp = vmcs.read64(fields::SPPTP)?;
        if !caps.is_valid_page_aligned_phys_addr(vm.spptp) {
            return Err(vmfail("SPPTP malformed"));
        }
    }

    if vm.secondary.contains(SecondaryControls::MODE_BASED_EXECUTE) && !vm.ept_enabled() {
        return Err(vmfail("mode-based execute control without EPT"));
    }

    vm.xss_exiting_bitmap = if vm.secondary.contains(SecondaryControls::XSAVES) {
        vmcs.read64(fields::XSS_EXITING_BITMAP)?
    } else {
        0
    };

    if vm.secondary.contains(SecondaryControls::TSC_SCALING) {
        vm.tsc_multiplier = vmcs.read64(fields::TSC_MULTIPLIER)?;
        if vm.tsc_multiplier == 0 {
            return Err(vmfail("TSC multiplier should be non zero"));
        }
    }

    // VM-exit controls.
    let exit = vmcs.read32(fields::VMEXIT_CTRLS)?;
    vm.exit = ExitControls::from_bits_retain(exit);
    vm.exit_msr_store_count = vmcs.read32(fields::VMEXIT_MSR_STORE_COUNT)?;
    vm.exit_msr_load_count = vmcs.read32(fields::VMEXIT_MSR_LOAD_COUNT)?;

    if !caps.exit.accepts(exit) {
        tracing::error!(exit, "VMFAIL: VMCS EXEC CTRL: VM-exit controls allowed 0/1 settings");
        return Err(VmxInstructionError::InvalidControlField.into());
    }
    if vm.exit.contains(ExitControls::SAVE_PREEMPTION_TIMER)
        && !vm.pin.contains(PinControls::PREEMPTION_TIMER)
    {
        return Err(vmfail("save preemption timer without the preemption timer"));
    }

    if vm.exit_msr_store_count > 0 {
        vm.exit_msr_store_addr = vmcs.read64(fields::VMEXIT_MSR_STORE_ADDR)?;
        check_msr_area(caps, vm.exit_msr_store_addr, vm.exit_msr_store_count, "VM-exit MSR-store")?;
    }
    if vm.exit_msr_load_count > 0 {
        vm.exit_msr_load_addr = vmcs.read64(fields::VMEXIT_MSR_LOAD_ADDR)?;
        check_msr_area(caps, vm.exit_msr_load_addr, vm.exit_msr_load_count, "VM-exit MSR-load")?;
    }

    // VM-entry controls.
    let entry = vmcs.read32(fields::VMENTRY_CTRLS)?;
    vm.entry = EntryControls::from_bits_retain(entry);
    vm.entry_msr_load_count = vmcs.read32(fields::VMENTRY_MSR_LOAD_COUNT)?;

    if !caps.entry.accepts(entry) {
        tracing::error!(entry, "VMFAIL: VMCS EXEC CTRL: VM-entry controls allowed 0/1 settings");
        return Err(VmxInstructionError::InvalidControlField.into());
    }
    if vm.entry.contains(EntryControls::DEACTIVATE_DUAL_MONITOR) && !cpu.in_smm {
        return Err(vmfail("deactivate dual-monitor treatment outside SMM"));
    }

    if vm.entry_msr_load_count > 0 {
        vm.entry_msr_load_addr = vmcs.read64(fields::VMENTRY_MSR_LOAD_ADDR)?;
        check_msr_area(caps, vm.entry_msr_load_addr, vm.entry_msr_load_count, "VM-entry MSR-load")?;
    }

    vm.event = EventInjection {
        info: vmcs.read32(fields::VMENTRY_INTERRUPTION_INFO)?,
        error_code: vmcs.read32(fields::VMENTRY_EXCEPTION_ERR_CODE)?,
        instruction_length: vmcs.read32(fields::VMENTRY_INSTRUCTION_LENGTH)?,
    };
    if vm.event.is_valid() {
        let guest_cr0 = if vm.unrestricted_guest() {
            Some(vmcs.read_natural(fields::GUEST_CR0)?)
        } else {
            None
        };
        check_event_injection(caps, &vm.event, guest_cr0)?;
    }

    Ok(vm)
}

fn check_msr_area(
    caps: &VmxCapabilities,
    addr: u64,
    count: u32,
    area: &'static str,
) -> Result<(), VmEntryError> {
    if addr & 0xf != 0 || !caps.is_valid_phys_addr(addr) {
        tracing::error!(addr, "VMFAIL: VMCS EXEC CTRL: {area} address malformed");
        return Err(VmxInstructionError::InvalidControlField.into());
    }
    let last_byte = addr
        .wrapping_add(u64::from(count) * 16)
        .wrapping_sub(1);
    if !caps.is_valid_phys_addr(last_byte) {
        tracing::error!(addr, count, "VMFAIL: VMCS EXEC CTRL: {area} area too big");
        return Err(VmxInstructionError::InvalidControlField.into());
    }
    Ok(())
}

/// Validates the VM-entry event descriptor.
///
/// `guest_cr0` is the guest CR0 from the VMCS when the unrestricted-guest
/// control is set; a real-mode unrestricted guest never takes error codes.
fn check_event_injection(
    caps: &VmxCapabilities,
    event: &EventInjection,
    guest_cr0: Option<u64>,
) -> Result<(), VmEntryError> {
    let info = event.info;
    if info & interruption::RESERVED != 0 {
        tracing::error!(info, "VMFAIL: VMENTRY interruption info reserved bits");
        return Err(VmxInstructionError::InvalidControlField.into());
    }

    let vector = event.vector();
    let ty = event.event_type();
    match ty {
        0 => {}
        2 => {
            if vector != 2 {
                tracing::error!(vector, "VMFAIL: VMENTRY bad injected NMI vector");
                return Err(VmxInstructionError::InvalidControlField.into());
            }
        }
        3 => {
            if vector > 31 {
                tracing::error!(vector, "VMFAIL: VMENTRY bad injected exception vector");
                return Err(VmxInstructionError::InvalidControlField.into());
            }
        }
        4..=6 => {
            let ilen = event.instruction_length;
            let ilen0_ok = caps.supports(VmxFeatures::SW_INTERRUPT_ILEN_0);
            if (ilen == 0 && !ilen0_ok) || ilen > 15 {
                tracing::error!(ilen, "VMFAIL: VMENTRY bad injected event instruction length");
                return Err(VmxInstructionError::InvalidControlField.into());
            }
        }
        interruption::TYPE_OTHER => {
            if !caps.supports(VmxFeatures::MONITOR_TRAP_FLAG) {
                tracing::error!("VMENTRY: injection of event type 7 is not supported");
                return Err(FatalError::UnsupportedInjectionType { ty }.into());
            }
            if vector != 0 {
                tracing::error!(vector, "VMFAIL: VMENTRY bad MTF injection vector");
                return Err(VmxInstructionError::InvalidControlField.into());
            }
        }
        _ => {
            tracing::error!(ty, "VMFAIL: VMENTRY bad injected event type");
            return Err(VmxInstructionError::InvalidControlField.into());
        }
    }

    let cet = caps.has_isa(IsaFeatures::CET);
    let mut push_error_reference = ty == 3 && inject::exception_has_error_code(vector);
    if vector == 21 && !cet {
        push_error_reference = false;
    }
    if let Some(cr0_value) = guest_cr0 {
        if cr0_value & cr0::PE == 0 {
            push_error_reference = false;
        }
    }

    let push_error = event.delivers_error_code();
    if !cet && push_error != push_error_reference {
        tracing::error!(vector, push_error, "VMFAIL: VMENTRY injected event vector with error code");
        return Err(VmxInstructionError::InvalidControlField.into());
    }
    if push_error && event.error_code & 0xffff_0000 != 0 {
        tracing::error!(
            error_code = event.error_code,
            "VMFAIL: VMENTRY bad error code for injected event"
        );
        return Err(VmxInstructionError::InvalidControlField.into());
    }
    Ok(())
}

/// Whether the capability word advertises the INVEPT type.
pub(crate) fn invept_type_supported(caps: &VmxCapabilities, ty: u64) -> bool {
    match ty {
        1 => caps.ept_vpid & ept_vpid::INVEPT_SINGLE_CONTEXT != 0,
        2 => caps.ept_vpid & ept_vpid::INVEPT_ALL_CONTEXT != 0,
        _ => false,
    }
}

/// Whether the capability word advertises the INVVPID type.
pub(crate) fn invvpid_type_supported(caps: &VmxCapabilities, ty: u64) -> bool {
    match ty {
        0 => caps.ept_vpid & ept_vpid::INVVPID_INDIVIDUAL_ADDRESS != 0,
        1 => caps.ept_vpid & ept_vpid::INVVPID_SINGLE_CONTEXT != 0,
        2 => caps.ept_vpid & ept_vpid::INVVPID_ALL_CONTEXT != 0,
        3 => caps.ept_vpid & ept_vpid::INVVPID_SINGLE_CONTEXT_NON_GLOBAL != 0,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caps::{VmxFeatureOverrides, VmxProfile};

    fn event(ty: u32, vector: u32, push_error: bool, error_code: u32, ilen: u32) -> EventInjection {
        let mut info = interruption::VALID | (ty << 8) | vector;
        if push_error {
            info |= interruption::DELIVER_ERROR_CODE;
        }
        EventInjection {
            info,
            error_code,
            instruction_length: ilen,
        }
    }

    fn fails(caps: &VmxCapabilities, ev: EventInjection) -> bool {
        matches!(
            check_event_injection(caps, &ev, None),
            Err(VmEntryError::VmFail(VmxInstructionError::InvalidControlField))
        )
    }

    #[test]
    fn event_descriptor_table() {
        let caps = VmxCapabilities::default();
        assert!(check_event_injection(&caps, &event(0, 0x20, false, 0, 0), None).is_ok());
        assert!(fails(&caps, event(2, 3, false, 0, 0)));
        assert!(check_event_injection(&caps, &event(2, 2, false, 0, 0), None).is_ok());
        assert!(fails(&caps, event(3, 32, false, 0, 0)));
        assert!(fails(&caps, event(1, 0, false, 0, 0)));
        // #GP needs an error code, #UD must not have one.
        assert!(fails(&caps, event(3, 13, false, 0, 0)));
        assert!(fails(&caps, event(3, 6, true, 0, 0)));
        assert!(check_event_injection(&caps, &event(3, 13, true, 0x18, 0), None).is_ok());
        assert!(fails(&caps, event(3, 13, true, 0x1_0000, 0)));
        // #CP only pushes an error code with CET.
        assert!(check_event_injection(&caps, &event(3, 21, false, 0, 0), None).is_ok());
    }

    #[test]
    fn software_events_need_an_instruction_length() {
        let caps = VmxCapabilities::default();
        assert!(fails(&caps, event(4, 0x80, false, 0, 0)));
        assert!(fails(&caps, event(6, 3, false, 0, 16)));
        assert!(check_event_injection(&caps, &event(4, 0x80, false, 0, 2), None).is_ok());

        let caps = VmxCapabilities::from_profile(
            VmxProfile::Ept,
            VmxFeatureOverrides {
                force_enable: VmxFeatures::SW_INTERRUPT_ILEN_0,
                ..VmxFeatureOverrides::default()
            },
        )
        .unwrap();
        assert!(check_event_injection(&caps, &event(4, 0x80, false, 0, 0), None).is_ok());
    }

    #[test]
    fn real_mode_unrestricted_guest_takes_no_error_codes() {
        let caps = VmxCapabilities::default();
        let gp = event(3, 13, false, 0, 0);
        assert!(check_event_injection(&caps, &gp, Some(0)).is_ok());
        assert!(check_event_injection(&caps, &gp, Some(cr0::PE)).is_err());
    }

    #[test]
    fn mtf_pseudo_event_requires_vector_zero() {
        let caps = VmxCapabilities::default();
        assert!(check_event_injection(&caps, &event(7, 0, false, 0, 0), None).is_ok());
        assert!(fails(&caps, event(7, 1, false, 0, 0)));

        let caps = VmxCapabilities::from_profile(
            VmxProfile::Basic,
            VmxFeatureOverrides {
                force_disable: VmxFeatures::MONITOR_TRAP_FLAG,
                ..VmxFeatureOverrides::default()
            },
        )
        .unwrap();
        assert!(matches!(
            check_event_injection(&caps, &event(7, 0, false, 0, 0), None),
            Err(VmEntryError::Fatal(_))
        ));
    }

    #[test]
    fn msr_area_must_be_aligned_and_in_range() {
        let caps = VmxCapabilities::default();
        assert!(check_msr_area(&caps, 0x1000, 4, "test").is_ok());
        assert!(check_msr_area(&caps, 0x1008, 1, "test").is_err());
        let top = 1u64 << caps.physical_address_bits;
        assert!(check_msr_area(&caps, top - 0x20, 2, "test").is_ok());
        assert!(check_msr_area(&caps, top - 0x20, 3, "test").is_err());
    }
}
