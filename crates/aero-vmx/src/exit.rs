//! VM exit: record the exit, save the guest, load the host.
//!
//! VM exits are fault-like unless [`ExitReason::is_trap_like`] says otherwise:
//! RIP (and RSP/SSP if the instruction touched them speculatively) roll back to
//! the start of the exiting instruction, and the caller abandons the current
//! instruction once [`vm_exit`] returns.

use crate::caps::{misc, IsaFeatures, VmxCapabilities};
use crate::context::{VmxContext, VmxMode};
use crate::controls::{EntryControls, ExitControls, PinControls, SecondaryControls, VmcsCache};
use crate::error::{FatalError, VmAbortCode, VmxFault};
use crate::fields;
use crate::guest::{broken_cr0, broken_cr4, interruptibility, pdptes_valid, KEEP_CR0_BITS};
use crate::inject::interruption;
use crate::memory::PhysicalMemory;
use crate::msr_area;
use crate::platform::{Platform, TlbFlush};
use crate::state::{
    ar, cr0, cr4, efer, ActivityState, CpuEvents, DescriptorTable, Inhibit, Segment,
    SegmentCache, VmxCpu, DEBUG_TRAP_HIT, FLAG_RESERVED1,
};
use crate::vmcs::VmcsAccess;

/// Bit 31 of the exit-reason field: VM-entry failure.
pub const ENTRY_FAILURE: u32 = 1 << 31;

/// Basic exit reasons (bits 15:0 of the exit-reason field).
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExitReason {
    ExceptionNmi = 0,
    ExternalInterrupt = 1,
    TripleFault = 2,
    Init = 3,
    Sipi = 4,
    IoSmi = 5,
    Smi = 6,
    InterruptWindow = 7,
    NmiWindow = 8,
    TaskSwitch = 9,
    Cpuid = 10,
    Getsec = 11,
    Hlt = 12,
    Invd = 13,
    Invlpg = 14,
    Rdpmc = 15,
    Rdtsc = 16,
    Rsm = 17,
    Vmcall = 18,
    Vmclear = 19,
    Vmlaunch = 20,
    Vmptrld = 21,
    Vmptrst = 22,
    Vmread = 23,
    Vmresume = 24,
    Vmwrite = 25,
    Vmxoff = 26,
    Vmxon = 27,
    CrAccess = 28,
    DrAccess = 29,
    IoInstruction = 30,
    Rdmsr = 31,
    Wrmsr = 32,
    EntryFailureGuestState = 33,
    EntryFailureMsrLoading = 34,
    Reserved35 = 35,
    Mwait = 36,
    MonitorTrapFlag = 37,
    Reserved38 = 38,
    Monitor = 39,
    Pause = 40,
    EntryFailureMachineCheck = 41,
    Reserved42 = 42,
    TprBelowThreshold = 43,
    ApicAccess = 44,
    VirtualizedEoi = 45,
    GdtrIdtrAccess = 46,
    LdtrTrAccess = 47,
    EptViolation = 48,
    EptMisconfiguration = 49,
    Invept = 50,
    Rdtscp = 51,
    PreemptionTimerExpired = 52,
    Invvpid = 53,
    Wbinvd = 54,
    Xsetbv = 55,
    ApicWrite = 56,
    Rdrand = 57,
    Invpcid = 58,
    Vmfunc = 59,
    Encls = 60,
    Rdseed = 61,
    PmlFull = 62,
    Xsaves = 63,
    Xrstors = 64,
    Pconfig = 65,
    SppEvent = 66,
    Umwait = 67,
    Tpause = 68,
    Loadiwkey = 69,
    Reserved70 = 70,
    Reserved71 = 71,
    EnqcmdPasid = 72,
    EnqcmdsPasid = 73,
    BusLock = 74,
    NotifyWindow = 75,
}

impl ExitReason {
    pub const LAST: u32 = 75;

    const ALL: [ExitReason; 76] = {
        use ExitReason::*;
        [
            ExceptionNmi, ExternalInterrupt, TripleFault, Init, Sipi, IoSmi, Smi,
            InterruptWindow, NmiWindow, TaskSwitch, Cpuid, Getsec, Hlt, Invd, Invlpg, Rdpmc,
            Rdtsc, Rsm, Vmcall, Vmclear, Vmlaunch, Vmptrld, Vmptrst, Vmread, Vmresume,
            Vmwrite, Vmxoff, Vmxon, CrAccess, DrAccess, IoInstruction, Rdmsr, Wrmsr,
            EntryFailureGuestState, EntryFailureMsrLoading, Reserved35, Mwait,
            MonitorTrapFlag, Reserved38, Monitor, Pause, EntryFailureMachineCheck, Reserved42,
            TprBelowThreshold, ApicAccess, VirtualizedEoi, GdtrIdtrAccess, LdtrTrAccess,
            EptViolation, EptMisconfiguration, Invept, Rdtscp, PreemptionTimerExpired, Invvpid,
            Wbinvd, Xsetbv, ApicWrite, Rdrand, Invpcid, Vmfunc, Encls, Rdseed, PmlFull, Xsaves,
            Xrstors, Pconfig, SppEvent, Umwait, Tpause, Loadiwkey, Reserved70, Reserved71,
            EnqcmdPasid, EnqcmdsPasid, BusLock, NotifyWindow,
        ]
    };

    /// Decodes the basic reason (bits 15:0) of a raw exit-reason value.
    pub fn from_raw(raw: u32) -> Result<Self, FatalError> {
        let basic = raw & 0xffff;
        Self::ALL
            .get(basic as usize)
            .copied()
            .ok_or(FatalError::ExitReasonOutOfRange { reason: basic })
    }

    #[inline]
    pub const fn code(self) -> u32 {
        self as u32
    }

    /// Trap-like exits complete the instruction (or APIC write) that caused
    /// them; every other exit is fault-like.
    pub const fn is_trap_like(self) -> bool {
        matches!(
            self,
            ExitReason::TprBelowThreshold
                | ExitReason::VirtualizedEoi
                | ExitReason::ApicWrite
                | ExitReason::BusLock
        )
    }

    /// Exits that report a failed VM entry; the guest state is not saved.
    pub const fn is_entry_failure(self) -> bool {
        matches!(
            self,
            ExitReason::EntryFailureGuestState | ExitReason::EntryFailureMsrLoading
        )
    }
}

/// One VM exit to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmExitInfo {
    pub reason: ExitReason,
    /// Sets bit 31 of the exit-reason field.
    pub entry_failure: bool,
    pub qualification: u64,
    /// VM-exit instruction-information field, for instruction exits that define it.
    pub instruction_info: Option<u32>,
}

impl VmExitInfo {
    pub fn new(reason: ExitReason, qualification: u64) -> Self {
        Self {
            reason,
            entry_failure: false,
            qualification,
            instruction_info: None,
        }
    }

    /// Exit reported by VMLAUNCH/VMRESUME when the guest state or the entry
    /// MSR-load area is rejected.
    pub fn entry_failure(reason: ExitReason, qualification: u64) -> Self {
        Self {
            entry_failure: true,
            ..Self::new(reason, qualification)
        }
    }

    pub fn with_instruction_info(mut self, info: u32) -> Self {
        self.instruction_info = Some(info);
        self
    }

    /// Value stored in the exit-reason field.
    #[inline]
    pub fn raw_reason(&self) -> u32 {
        let failure = if self.entry_failure { ENTRY_FAILURE } else { 0 };
        self.reason.code() | failure
    }
}

/// Performs a VM exit from non-root operation back to the host.
///
/// On return the CPU is in VMX root operation with the host state loaded. For
/// fault-like exits the caller must abandon the current instruction.
pub fn vm_exit<P: Platform + ?Sized>(
    ctx: &mut VmxContext,
    cpu: &mut VmxCpu,
    platform: &mut P,
    info: VmExitInfo,
) -> Result<(), VmxFault> {
    if !ctx.in_guest() && !info.entry_failure {
        tracing::error!(reason = ?info.reason, "VMEXIT not in VMX guest mode");
        return Err(FatalError::ExitOutsideGuest.into());
    }
    let Some(vmcs_ptr) = ctx.current.address() else {
        tracing::error!(reason = ?info.reason, "VMEXIT without a current VMCS");
        return Err(FatalError::ExitOutsideGuest.into());
    };
    let reason = info.reason;
    tracing::debug!(
        reason = ?reason,
        qualification = info.qualification,
        "VMEXIT"
    );

    // The preemption timer stops counting on every exit.
    let preemption_timer = platform.read_preemption_timer();
    platform.disarm_preemption_timer();

    {
        let mut vmcs = VmcsAccess::new(&mut *platform, &ctx.layout, vmcs_ptr);
        vmcs.write32(fields::VMEXIT_REASON, info.raw_reason())?;
        vmcs.write_natural(fields::VMEXIT_QUALIFICATION, info.qualification)?;
        vmcs.write32(
            fields::VMEXIT_INSTRUCTION_LENGTH,
            (cpu.rip.wrapping_sub(cpu.prev_rip) & 0xf) as u32,
        )?;
        if let Some(instruction_info) = info.instruction_info {
            vmcs.write32(fields::VMEXIT_INSTRUCTION_INFO, instruction_info)?;
        }

        if !matches!(reason, ExitReason::ExceptionNmi | ExitReason::ExternalInterrupt) {
            vmcs.write32(fields::VMEXIT_INTERRUPTION_INFO, 0)?;
        }

        if cpu.in_event {
            vmcs.write32(
                fields::IDT_VECTORING_INFO,
                ctx.cache.idt_vector_info | interruption::VALID,
            )?;
            vmcs.write32(fields::IDT_VECTORING_ERR_CODE, ctx.cache.idt_vector_error_code)?;
            cpu.in_event = false;
        } else {
            vmcs.write32(fields::IDT_VECTORING_INFO, 0)?;
        }
    }

    if !reason.is_trap_like() {
        cpu.rip = cpu.prev_rip;
        if cpu.speculative_rsp {
            cpu.rsp = cpu.prev_rsp;
            cpu.ssp = cpu.prev_ssp;
        }
    }
    cpu.speculative_rsp = false;

    if !reason.is_entry_failure() {
        {
            let mut vmcs = VmcsAccess::new(&mut *platform, &ctx.layout, vmcs_ptr);
            vmcs.write32(
                fields::VMENTRY_INTERRUPTION_INFO,
                ctx.cache.event.info & !interruption::VALID,
            )?;
            save_guest_state(&mut vmcs, &ctx.caps, &mut ctx.cache, cpu, preemption_timer)?;
        }

        let vm = &ctx.cache;
        if let Err(failure) = msr_area::store_msrs(
            platform,
            cpu,
            &ctx.caps,
            vm.exit_msr_store_count,
            vm.exit_msr_store_addr,
        ) {
            tracing::error!(entry = failure.0, "VMABORT: error when saving guest MSR");
            return Err(vm_abort(ctx, cpu, platform, VmAbortCode::SavingGuestMsrs));
        }
    }

    ctx.mode = VmxMode::Root;
    cpu.clear_event(
        CpuEvents::VMX_VTPR_UPDATE
            | CpuEvents::VMX_VEOI_UPDATE
            | CpuEvents::VMX_VIRTUAL_APIC_WRITE
            | CpuEvents::VMX_MONITOR_TRAP_FLAG
            | CpuEvents::VMX_INTERRUPT_WINDOW_EXITING
            | CpuEvents::VMX_PREEMPTION_TIMER_EXPIRED
            | CpuEvents::VMX_VIRTUAL_NMI
            | CpuEvents::PENDING_VMX_VIRTUAL_INTR,
    );

    load_host_state(ctx, cpu, platform)?;

    let vm = &ctx.cache;
    if let Err(failure) = msr_area::load_msrs(
        platform,
        cpu,
        &ctx.caps,
        vm.exit_msr_load_count,
        vm.exit_msr_load_addr,
    ) {
        tracing::error!(entry = failure.0, "VMABORT: error when loading host MSR");
        return Err(vm_abort(ctx, cpu, platform, VmAbortCode::LoadingHostMsrs));
    }

    // INIT is blocked in VMX root operation.
    cpu.mask_event(CpuEvents::INIT);
    cpu.ext = false;
    Ok(())
}

/// Writes the register file back into the guest-state area.
pub fn save_guest_state<M: PhysicalMemory + ?Sized>(
    vmcs: &mut VmcsAccess<'_, M>,
    caps: &VmxCapabilities,
    vm: &mut VmcsCache,
    cpu: &mut VmxCpu,
    preemption_timer: u32,
) -> Result<(), FatalError> {
    vmcs.write_natural(fields::GUEST_CR0, cpu.cr0)?;
    vmcs.write_natural(fields::GUEST_CR3, cpu.cr3)?;
    vmcs.write_natural(fields::GUEST_CR4, cpu.cr4)?;

    // PDPTEs only exist for a legacy PAE guest.
    if vm.ept_enabled() && cpu.cr0 & cr0::PG != 0 && cpu.cr4 & cr4::PAE != 0 && !cpu.long_mode() {
        for (n, &entry) in cpu.pdptr.iter().enumerate() {
            vmcs.write64(fields::guest_pdpte(n), entry)?;
        }
    }

    if vm.exit.contains(ExitControls::SAVE_DEBUG_CONTROLS) {
        vmcs.write_natural(fields::GUEST_DR7, cpu.dr7)?;
    }

    vmcs.write_natural(fields::GUEST_RIP, cpu.rip)?;
    vmcs.write_natural(fields::GUEST_RSP, cpu.rsp)?;
    vmcs.write_natural(fields::GUEST_RFLAGS, cpu.rflags)?;

    if caps.has_isa(IsaFeatures::CET) {
        vmcs.write_natural(fields::GUEST_IA32_S_CET, cpu.msr.s_cet)?;
        vmcs.write_natural(fields::GUEST_INTERRUPT_SSP_TABLE_ADDR, cpu.msr.interrupt_ssp_table)?;
        vmcs.write_natural(fields::GUEST_SSP, cpu.ssp)?;
    }
    if caps.has_isa(IsaFeatures::PKS) {
        vmcs.write64(fields::GUEST_IA32_PKRS, u64::from(cpu.msr.pkrs))?;
    }

    for seg in Segment::ALL {
        let n = seg as usize;
        save_segment(
            vmcs,
            &cpu.segments[n],
            fields::guest_selector(n),
            fields::guest_base(n),
            fields::guest_limit(n),
            fields::guest_access_rights(n),
        )?;
    }
    save_segment(
        vmcs,
        &cpu.ldtr,
        fields::GUEST_LDTR_SELECTOR,
        fields::GUEST_LDTR_BASE,
        fields::GUEST_LDTR_LIMIT,
        fields::GUEST_LDTR_ACCESS_RIGHTS,
    )?;
    save_segment(
        vmcs,
        &cpu.tr,
        fields::GUEST_TR_SELECTOR,
        fields::GUEST_TR_BASE,
        fields::GUEST_TR_LIMIT,
        fields::GUEST_TR_ACCESS_RIGHTS,
    )?;

    vmcs.write_natural(fields::GUEST_GDTR_BASE, cpu.gdtr.base)?;
    vmcs.write32(fields::GUEST_GDTR_LIMIT, u32::from(cpu.gdtr.limit))?;
    vmcs.write_natural(fields::GUEST_IDTR_BASE, cpu.idtr.base)?;
    vmcs.write32(fields::GUEST_IDTR_LIMIT, u32::from(cpu.idtr.limit))?;

    vmcs.write_natural(fields::GUEST_IA32_SYSENTER_ESP, cpu.msr.sysenter_esp)?;
    vmcs.write_natural(fields::GUEST_IA32_SYSENTER_EIP, cpu.msr.sysenter_eip)?;
    vmcs.write32(fields::GUEST_IA32_SYSENTER_CS, cpu.msr.sysenter_cs)?;

    if vm.exit.contains(ExitControls::SAVE_PAT) {
        vmcs.write64(fields::GUEST_IA32_PAT, cpu.msr.pat)?;
    }
    if vm.exit.contains(ExitControls::SAVE_EFER) {
        vmcs.write64(fields::GUEST_IA32_EFER, cpu.efer)?;
    }

    let mut pending_dbg = cpu.debug_trap & 0x0000_400f;
    if pending_dbg & 0xf != 0 {
        pending_dbg |= DEBUG_TRAP_HIT;
    }
    vmcs.write_natural(fields::GUEST_PENDING_DBG_EXCEPTIONS, u64::from(pending_dbg))?;

    // Wait-for-SIPI and MWAIT sleep are saved as active.
    let mut activity = cpu.activity as u32;
    if activity >= ActivityState::LAST_VMX {
        activity = ActivityState::Active as u32;
    }
    vmcs.write32(fields::GUEST_ACTIVITY_STATE, activity)?;

    // Blocking by SMI is always saved as 0 outside SMM.
    let mut irq_state = match cpu.inhibit {
        Inhibit::None => 0,
        Inhibit::Interrupts => interruptibility::BLOCKED_BY_STI,
        Inhibit::MovSs => interruptibility::BLOCKED_BY_MOV_SS,
    };
    let nmi = if vm.pin.contains(PinControls::VIRTUAL_NMI) {
        CpuEvents::VMX_VIRTUAL_NMI
    } else {
        CpuEvents::NMI
    };
    if cpu.is_masked_event(nmi) {
        irq_state |= interruptibility::BLOCKED_BY_NMI;
    }
    vmcs.write32(fields::GUEST_INTERRUPTIBILITY_STATE, irq_state)?;

    if caps.misc_has(misc::STORE_LMA_ON_EXIT) {
        vm.entry.set(EntryControls::IA32E_MODE_GUEST, cpu.long_mode());
        vmcs.write32(fields::VMENTRY_CTRLS, vm.entry.bits())?;
    }

    cpu.clear_event(CpuEvents::VMX_PREEMPTION_TIMER_EXPIRED);
    if vm.exit.contains(ExitControls::SAVE_PREEMPTION_TIMER) {
        vmcs.write32(fields::GUEST_PREEMPTION_TIMER_VALUE, preemption_timer)?;
    }

    if vm.secondary.contains(SecondaryControls::VIRTUAL_INTERRUPT_DELIVERY) {
        vmcs.write16(
            fields::GUEST_INTERRUPT_STATUS,
            (u16::from(vm.svi) << 8) | u16::from(vm.rvi),
        )?;
    }
    if vm.secondary.contains(SecondaryControls::PML) {
        vmcs.write16(fields::GUEST_PML_INDEX, vm.pml_index)?;
    }
    Ok(())
}

fn save_segment<M: PhysicalMemory + ?Sized>(
    vmcs: &mut VmcsAccess<'_, M>,
    sreg: &SegmentCache,
    selector: u32,
    base: u32,
    limit: u32,
    access_rights: u32,
) -> Result<(), FatalError> {
    vmcs.write16(selector, sreg.selector)?;
    vmcs.write_access_rights(access_rights, sreg.ar & (0xf0ff | ar::UNUSABLE))?;
    vmcs.write_natural(base, sreg.base)?;
    vmcs.write32(limit, sreg.limit)
}

/// Loads the host-state snapshot taken by the last VM entry.
pub fn load_host_state<P: Platform + ?Sized>(
    ctx: &mut VmxContext,
    cpu: &mut VmxCpu,
    platform: &mut P,
) -> Result<(), VmxFault> {
    let host = ctx.cache.host;
    let exit = ctx.cache.exit;
    let x86_64_host = exit.contains(ExitControls::HOST_ADDRESS_SPACE_SIZE);
    cpu.tsc_offset = 0;

    let new_efer = if exit.contains(ExitControls::LOAD_EFER) {
        host.efer
    } else if x86_64_host {
        cpu.efer | efer::LME | efer::LMA
    } else {
        cpu.efer & !(efer::LME | efer::LMA)
    };

    let new_cr0 = (cpu.cr0 & KEEP_CR0_BITS) | (host.cr0 & !KEEP_CR0_BITS);
    if broken_cr0(new_cr0, false) {
        tracing::error!(cr0 = new_cr0, "VMEXIT: CR0 is broken");
        return Err(FatalError::BrokenControlRegister {
            register: "CR0",
            value: new_cr0,
        }
        .into());
    }
    if broken_cr4(&ctx.caps, host.cr4) {
        tracing::error!(cr4 = host.cr4, "VMEXIT: CR4 is broken");
        return Err(FatalError::BrokenControlRegister {
            register: "CR4",
            value: host.cr4,
        }
        .into());
    }

    cpu.efer = new_efer;
    cpu.cr0 = new_cr0;
    cpu.cr4 = host.cr4;
    cpu.cr3 = host.cr3;

    if !x86_64_host && host.cr4 & cr4::PAE != 0 {
        let table = host.cr3 & 0xffff_ffe0;
        let mut pdptr = [0u64; 4];
        for (n, entry) in pdptr.iter_mut().enumerate() {
            *entry = platform.read_u64(table | (n as u64) << 3);
        }
        if !pdptes_valid(&ctx.caps, &pdptr) {
            tracing::error!("VMABORT: host PDPTRs are corrupted");
            return Err(vm_abort(ctx, cpu, platform, VmAbortCode::HostPdptrCorrupted));
        }
        cpu.pdptr = pdptr;
    }

    cpu.dr7 = 0x400;

    cpu.msr.sysenter_cs = u32::from(host.sysenter_cs);
    cpu.msr.sysenter_esp = host.sysenter_esp;
    cpu.msr.sysenter_eip = host.sysenter_eip;
    if exit.contains(ExitControls::LOAD_PAT) {
        cpu.msr.pat = host.pat;
    }

    // Flat 4 GiB segments with DPL 0. A null data selector leaves the segment unusable.
    let mut cs_ar = ar::P | ar::S | ar::TYPE_CODE_EXEC_READ_ACCESSED | ar::G;
    cs_ar |= if x86_64_host { ar::L } else { ar::DB };
    cpu.segments[Segment::CS as usize] = SegmentCache {
        selector: host.selector(Segment::CS),
        base: 0,
        limit: 0xffff_ffff,
        ar: cs_ar,
    };
    for seg in Segment::ALL {
        if seg == Segment::CS {
            continue;
        }
        let selector = host.selector(seg);
        cpu.segments[seg as usize] = if selector == 0 {
            SegmentCache::unusable(0)
        } else {
            SegmentCache {
                selector,
                base: 0,
                limit: 0xffff_ffff,
                ar: ar::P | ar::S | ar::TYPE_DATA_RW_ACCESSED | ar::G | ar::DB,
            }
        };
    }

    if x86_64_host || cpu.segments[Segment::FS as usize].valid() {
        cpu.segments[Segment::FS as usize].base = host.fs_base;
    }
    if x86_64_host || cpu.segments[Segment::GS as usize].valid() {
        cpu.segments[Segment::GS as usize].base = host.gs_base;
    }

    cpu.tr = SegmentCache {
        selector: host.tr_selector,
        base: host.tr_base,
        limit: 0x67,
        ar: ar::P | ar::TYPE_SYS_BUSY_386_TSS,
    };
    cpu.ldtr = SegmentCache::unusable(0);

    cpu.gdtr = DescriptorTable {
        base: host.gdtr_base,
        limit: 0xffff,
    };
    cpu.idtr = DescriptorTable {
        base: host.idtr_base,
        limit: 0xffff,
    };

    cpu.rip = host.rip;
    cpu.prev_rip = host.rip;
    cpu.rsp = host.rsp;
    cpu.prev_rsp = host.rsp;

    if exit.contains(ExitControls::LOAD_CET_STATE) {
        cpu.ssp = host.ssp;
        cpu.prev_ssp = host.ssp;
        cpu.msr.interrupt_ssp_table = host.interrupt_ssp_table;
        cpu.msr.s_cet = host.s_cet;
    }
    if exit.contains(ExitControls::LOAD_PKRS) {
        cpu.msr.pkrs = host.pkrs as u32;
    }

    cpu.inhibit = Inhibit::None;
    cpu.debug_trap = 0;
    cpu.rflags = FLAG_RESERVED1;
    cpu.activity = ActivityState::Active;
    cpu.monitor_armed = false;
    platform.flush_tlb(TlbFlush::All);
    Ok(())
}

/// VMX abort: records `code` in the current VMCS and shuts the processor down.
///
/// The returned fault must be surfaced to the emulator; the guest cannot
/// continue.
pub fn vm_abort<P: Platform + ?Sized>(
    ctx: &VmxContext,
    cpu: &mut VmxCpu,
    platform: &mut P,
    code: VmAbortCode,
) -> VmxFault {
    tracing::error!(?code, "VMABORT");
    if let Some(mut vmcs) = ctx.current_vmcs(&mut *platform) {
        vmcs.set_abort_indicator(code as u32);
    }
    platform.disarm_preemption_timer();
    platform.shutdown(cpu);
    VmxFault::VmAbort(code)
}
