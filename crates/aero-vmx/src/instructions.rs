//! The VMX instruction surface.
//!
//! Each handler receives its operands already decoded and read by the CPU
//! core (memory operands are passed by value). A handler either completes with
//! a [`VmxOutcome`], with RFLAGS already updated per the VMsucceed/VMfail
//! conventions, or raises a [`VmxFault`] for the CPU core to deliver.
//!
//! When a handler runs in VMX non-root operation and the instruction exits,
//! the VM exit has been performed by the time it returns
//! ([`VmxOutcome::VmExit`]) and the caller must abandon the instruction.

use crate::caps::{ept_vpid, misc, VmxFeatures};
use crate::context::{VmcsPointer, VmxContext, VmxMode, INVALID_VMCS_POINTER};
use crate::controls::{
    invept_type_supported, invvpid_type_supported, load_check_vm_controls, PinControls,
    ProcControls, SecondaryControls,
};
use crate::error::{VmEntryError, VmxFault, VmxInstructionError};
use crate::exit::{vm_exit, ExitReason, VmExitInfo};
use crate::fields::{self, FieldType};
use crate::guest::{install_guest_state, load_check_guest_state, EntryPointers};
use crate::host::load_check_host_state;
use crate::inject::inject_event;
use crate::memory::PhysicalMemory;
use crate::msr_area;
use crate::platform::{Platform, TlbFlush};
use crate::state::{cr0, cr4, msr, CpuEvents, Inhibit, VmxCpu, FLAG_CF, FLAG_ZF};
use crate::vmcs::{LaunchState, VmcsAccess, VMCS_SHADOW_BIT};

/// Operand size of the register forms (VMREAD/VMWRITE, INVEPT/INVVPID type).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OperandSize {
    /// Outside 64-bit mode.
    #[default]
    Dword,
    /// 64-bit mode.
    Qword,
}

/// Decoder-provided operand description, reported in the exit qualification
/// and the VM-exit instruction-information field if the instruction exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExitOperand {
    pub qualification: u64,
    pub instruction_info: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmxOutcome {
    /// VMsucceed.
    Succeed,
    /// VMsucceed; the value goes to the destination operand (VMREAD, VMPTRST).
    SucceedWith(u64),
    /// VMfailInvalid: CF set, no current VMCS to report the error in.
    FailInvalid,
    /// VMfailValid: ZF set, error number written to the current VMCS.
    FailValid(VmxInstructionError),
    /// VM entry succeeded; the processor is in non-root operation.
    Entered,
    /// The instruction caused a VM exit (including entry-failure exits).
    VmExit(ExitReason),
}

fn vm_succeed(cpu: &mut VmxCpu) -> VmxOutcome {
    cpu.set_flags_oszapc(0);
    VmxOutcome::Succeed
}

fn vm_fail_invalid(cpu: &mut VmxCpu) -> VmxOutcome {
    cpu.set_flags_oszapc(FLAG_CF);
    VmxOutcome::FailInvalid
}

/// VMfailValid if there is a current VMCS, VMfailInvalid otherwise.
fn vm_fail<M: PhysicalMemory + ?Sized>(
    ctx: &VmxContext,
    cpu: &mut VmxCpu,
    mem: &mut M,
    error: VmxInstructionError,
) -> Result<VmxOutcome, VmxFault> {
    match ctx.current_vmcs(mem) {
        Some(mut vmcs) => {
            cpu.set_flags_oszapc(FLAG_ZF);
            vmcs.write32(fields::VM_INSTRUCTION_ERROR, error.code())?;
            Ok(VmxOutcome::FailValid(error))
        }
        None => Ok(vm_fail_invalid(cpu)),
    }
}

fn instruction_exit<P: Platform + ?Sized>(
    ctx: &mut VmxContext,
    cpu: &mut VmxCpu,
    platform: &mut P,
    reason: ExitReason,
    operand: Option<ExitOperand>,
) -> Result<VmxOutcome, VmxFault> {
    let info = match operand {
        Some(op) => {
            VmExitInfo::new(reason, op.qualification).with_instruction_info(op.instruction_info)
        }
        None => VmExitInfo::new(reason, 0),
    };
    vm_exit(ctx, cpu, platform, info)?;
    Ok(VmxOutcome::VmExit(reason))
}

/// #UD unless in VMX operation, in protected mode and not in compatibility mode.
fn check_vmx_operation(ctx: &VmxContext, cpu: &VmxCpu) -> Result<(), VmxFault> {
    if !ctx.in_vmx() || !cpu.protected_mode() || cpu.compat_mode() {
        return Err(VmxFault::InvalidOpcode);
    }
    Ok(())
}

fn check_cpl0(cpu: &VmxCpu, mnemonic: &'static str) -> Result<(), VmxFault> {
    if cpu.cpl() != 0 {
        tracing::error!("{mnemonic}: with CPL!=0 cause #GP(0)");
        return Err(VmxFault::GeneralProtection);
    }
    Ok(())
}

fn pointer_from_raw(raw: u64) -> VmcsPointer {
    if raw == INVALID_VMCS_POINTER {
        VmcsPointer::Invalid
    } else {
        VmcsPointer::Active(raw)
    }
}

/// VMXON: enter VMX root operation with the VMXON region at `region`.
pub fn vmxon<P: Platform + ?Sized>(
    ctx: &mut VmxContext,
    cpu: &mut VmxCpu,
    platform: &mut P,
    region: u64,
    operand: ExitOperand,
) -> Result<VmxOutcome, VmxFault> {
    if cpu.cr4 & cr4::VMXE == 0 || !cpu.protected_mode() || cpu.compat_mode() {
        return Err(VmxFault::InvalidOpcode);
    }

    match ctx.mode {
        VmxMode::Off => {
            let feature_control = cpu.msr.feature_control;
            if cpu.cpl() != 0
                || cpu.cr0 & cr0::NE == 0
                || cpu.cr0 & cr0::PE == 0
                || !cpu.a20_enabled
                || feature_control & msr::FEATURE_CONTROL_LOCK == 0
                || feature_control & msr::FEATURE_CONTROL_VMX_OUTSIDE_SMX == 0
            {
                tracing::error!("#GP: VMXON is not allowed");
                return Err(VmxFault::GeneralProtection);
            }

            if !ctx.caps.is_valid_page_aligned_phys_addr(region) {
                tracing::error!(region, "VMXON: invalid or not page aligned physical address");
                return Ok(vm_fail_invalid(cpu));
            }

            // The VMXON region may not carry the shadow-VMCS bit.
            let revision = VmcsAccess::new(&mut *platform, &ctx.layout, region).revision();
            if revision != ctx.layout.revision_id() {
                tracing::error!(
                    revision,
                    expected = ctx.layout.revision_id(),
                    "VMXON: not expected VMCS revision id"
                );
                return Ok(vm_fail_invalid(cpu));
            }

            ctx.current = VmcsPointer::Invalid;
            ctx.vmxon_ptr = region;
            ctx.mode = VmxMode::Root;
            cpu.mask_event(CpuEvents::INIT);
            cpu.monitor_armed = false;
            tracing::debug!(region, "VMXON");
            Ok(vm_succeed(cpu))
        }
        VmxMode::NonRoot => instruction_exit(ctx, cpu, platform, ExitReason::Vmxon, Some(operand)),
        VmxMode::Root => {
            check_cpl0(cpu, "VMXON")?;
            vm_fail(ctx, cpu, platform, VmxInstructionError::VmxonInRoot)
        }
    }
}

/// VMXOFF: leave VMX operation.
pub fn vmxoff<P: Platform + ?Sized>(
    ctx: &mut VmxContext,
    cpu: &mut VmxCpu,
    platform: &mut P,
) -> Result<VmxOutcome, VmxFault> {
    check_vmx_operation(ctx, cpu)?;
    if ctx.in_guest() {
        return instruction_exit(ctx, cpu, platform, ExitReason::Vmxoff, None);
    }
    check_cpl0(cpu, "VMXOFF")?;

    ctx.vmxon_ptr = INVALID_VMCS_POINTER;
    ctx.mode = VmxMode::Off;
    cpu.unmask_event(CpuEvents::INIT);
    cpu.monitor_armed = false;
    tracing::debug!("VMXOFF");
    Ok(vm_succeed(cpu))
}

/// VMCLEAR: mark the VMCS at `region` clear, and drop it if it is current.
pub fn vmclear<P: Platform + ?Sized>(
    ctx: &mut VmxContext,
    cpu: &mut VmxCpu,
    platform: &mut P,
    region: u64,
    operand: ExitOperand,
) -> Result<VmxOutcome, VmxFault> {
    check_vmx_operation(ctx, cpu)?;
    if ctx.in_guest() {
        return instruction_exit(ctx, cpu, platform, ExitReason::Vmclear, Some(operand));
    }
    check_cpl0(cpu, "VMCLEAR")?;

    if !ctx.caps.is_valid_page_aligned_phys_addr(region) {
        tracing::error!(region, "VMFAIL: VMCLEAR with invalid physical address");
        return vm_fail(ctx, cpu, platform, VmxInstructionError::VmclearInvalidAddress);
    }
    if region == ctx.vmxon_ptr {
        tracing::error!("VMFAIL: VMCLEAR with VMXON ptr");
        return vm_fail(ctx, cpu, platform, VmxInstructionError::VmclearVmxonPointer);
    }

    VmcsAccess::new(&mut *platform, &ctx.layout, region).set_launch_state(LaunchState::Clear);
    if ctx.current == VmcsPointer::Active(region) {
        ctx.current = VmcsPointer::Invalid;
    }
    Ok(vm_succeed(cpu))
}

/// VMPTRLD: make the VMCS at `region` current.
pub fn vmptrld<P: Platform + ?Sized>(
    ctx: &mut VmxContext,
    cpu: &mut VmxCpu,
    platform: &mut P,
    region: u64,
    operand: ExitOperand,
) -> Result<VmxOutcome, VmxFault> {
    check_vmx_operation(ctx, cpu)?;
    if ctx.in_guest() {
        return instruction_exit(ctx, cpu, platform, ExitReason::Vmptrld, Some(operand));
    }
    check_cpl0(cpu, "VMPTRLD")?;

    if !ctx.caps.is_valid_page_aligned_phys_addr(region) {
        tracing::error!(region, "VMFAIL: invalid or not page aligned physical address");
        return vm_fail(ctx, cpu, platform, VmxInstructionError::VmptrldInvalidAddress);
    }
    if region == ctx.vmxon_ptr {
        tracing::error!("VMFAIL: VMPTRLD with VMXON ptr");
        return vm_fail(ctx, cpu, platform, VmxInstructionError::VmptrldVmxonPointer);
    }

    let mut revision = VmcsAccess::new(&mut *platform, &ctx.layout, region).revision();
    if ctx.caps.supports(VmxFeatures::VMCS_SHADOWING) {
        revision &= !VMCS_SHADOW_BIT;
    }
    if revision != ctx.layout.revision_id() {
        tracing::error!(
            revision,
            expected = ctx.layout.revision_id(),
            "VMPTRLD: not expected VMCS revision id"
        );
        return vm_fail(ctx, cpu, platform, VmxInstructionError::VmptrldBadRevision);
    }

    ctx.current = VmcsPointer::Active(region);
    Ok(vm_succeed(cpu))
}

/// VMPTRST: the value to store is carried in [`VmxOutcome::SucceedWith`].
pub fn vmptrst<P: Platform + ?Sized>(
    ctx: &mut VmxContext,
    cpu: &mut VmxCpu,
    platform: &mut P,
    operand: ExitOperand,
) -> Result<VmxOutcome, VmxFault> {
    check_vmx_operation(ctx, cpu)?;
    if ctx.in_guest() {
        return instruction_exit(ctx, cpu, platform, ExitReason::Vmptrst, Some(operand));
    }
    check_cpl0(cpu, "VMPTRST")?;

    vm_succeed(cpu);
    Ok(VmxOutcome::SucceedWith(ctx.current.raw()))
}

pub fn vmlaunch<P: Platform + ?Sized>(
    ctx: &mut VmxContext,
    cpu: &mut VmxCpu,
    platform: &mut P,
) -> Result<VmxOutcome, VmxFault> {
    vm_enter(ctx, cpu, platform, true)
}

pub fn vmresume<P: Platform + ?Sized>(
    ctx: &mut VmxContext,
    cpu: &mut VmxCpu,
    platform: &mut P,
) -> Result<VmxOutcome, VmxFault> {
    vm_enter(ctx, cpu, platform, false)
}

/// Turns a failed entry stage into its guest-visible effect.
fn entry_failed<P: Platform + ?Sized>(
    ctx: &mut VmxContext,
    cpu: &mut VmxCpu,
    platform: &mut P,
    err: VmEntryError,
) -> Result<VmxOutcome, VmxFault> {
    let info = match err {
        VmEntryError::VmFail(error) => return vm_fail(ctx, cpu, platform, error),
        VmEntryError::Fatal(fatal) => return Err(fatal.into()),
        VmEntryError::GuestState(qualification) => {
            tracing::error!(?qualification, "VMEXIT: guest state checks failed");
            VmExitInfo::entry_failure(ExitReason::EntryFailureGuestState, qualification.value())
        }
        VmEntryError::MsrLoad { index } => {
            tracing::error!(index, "VMEXIT: error when loading guest MSR");
            VmExitInfo::entry_failure(ExitReason::EntryFailureMsrLoading, u64::from(index))
        }
    };
    let reason = info.reason;
    vm_exit(ctx, cpu, platform, info)?;
    Ok(VmxOutcome::VmExit(reason))
}

/// VMLAUNCH / VMRESUME.
///
/// Controls, host state and guest state are all read and checked before the
/// register file is touched. A control or host-state failure leaves the CPU
/// exactly as it was apart from the VMfail flags.
fn vm_enter<P: Platform + ?Sized>(
    ctx: &mut VmxContext,
    cpu: &mut VmxCpu,
    platform: &mut P,
    launch: bool,
) -> Result<VmxOutcome, VmxFault> {
    let mnemonic = if launch { "VMLAUNCH" } else { "VMRESUME" };
    check_vmx_operation(ctx, cpu)?;
    if ctx.in_guest() {
        let reason = if launch { ExitReason::Vmlaunch } else { ExitReason::Vmresume };
        return instruction_exit(ctx, cpu, platform, reason, None);
    }
    check_cpl0(cpu, mnemonic)?;

    let Some(base) = ctx.current.address() else {
        tracing::error!("VMFAIL: {mnemonic} with invalid VMCS ptr");
        return Ok(vm_fail_invalid(cpu));
    };
    tracing::debug!(vmcs = base, "{mnemonic}");

    if cpu.inhibit == Inhibit::MovSs {
        tracing::error!("VMFAIL: {mnemonic} with interrupts blocked by MOV_SS");
        return vm_fail(ctx, cpu, platform, VmxInstructionError::MovSsBlocking);
    }

    let launch_state = VmcsAccess::new(&mut *platform, &ctx.layout, base).launch_state();
    if launch && launch_state != LaunchState::Clear as u32 {
        tracing::error!("VMFAIL: VMLAUNCH with non-clear VMCS");
        return vm_fail(ctx, cpu, platform, VmxInstructionError::VmlaunchNonClear);
    }
    if !launch && launch_state != LaunchState::Launched as u32 {
        tracing::error!("VMFAIL: VMRESUME with non-launched VMCS");
        return vm_fail(ctx, cpu, platform, VmxInstructionError::VmresumeNonLaunched);
    }

    let checked = {
        let mut vmcs = VmcsAccess::new(&mut *platform, &ctx.layout, base);
        load_check_vm_controls(&mut vmcs, &ctx.caps, cpu).and_then(|mut vm| {
            vm.host = load_check_host_state(&mut vmcs, &ctx.caps, cpu, &vm)?;
            Ok(vm)
        })
    };
    let mut vm = match checked {
        Ok(vm) => vm,
        Err(err) => return entry_failed(ctx, cpu, platform, err),
    };

    let pointers = EntryPointers {
        vmcs: base,
        vmxon: ctx.vmxon_ptr,
    };
    let guest = {
        let mut vmcs = VmcsAccess::new(&mut *platform, &ctx.layout, base);
        load_check_guest_state(&mut vmcs, &ctx.caps, cpu, &vm, pointers)
    };
    let guest = match guest {
        Ok(guest) => guest,
        Err(err) => {
            // The entry-failure exit loads the host state just validated.
            ctx.cache = vm;
            return entry_failed(ctx, cpu, platform, err);
        }
    };

    install_guest_state(cpu, &guest, &mut vm, &ctx.caps, platform)?;
    ctx.cache = vm;

    if let Err(failure) = msr_area::load_msrs(
        platform,
        cpu,
        &ctx.caps,
        ctx.cache.entry_msr_load_count,
        ctx.cache.entry_msr_load_addr,
    ) {
        return entry_failed(ctx, cpu, platform, VmEntryError::MsrLoad { index: failure.0 });
    }

    let (tsc_offset, preemption_timer) = {
        let mut vmcs = VmcsAccess::new(&mut *platform, &ctx.layout, base);
        if launch {
            vmcs.set_launch_state(LaunchState::Launched);
        }
        let tsc_offset = if ctx.cache.proc.contains(ProcControls::TSC_OFFSETTING) {
            vmcs.read64(fields::TSC_OFFSET)?
        } else {
            0
        };
        let preemption_timer = if ctx.cache.pin.contains(PinControls::PREEMPTION_TIMER) {
            Some(vmcs.read32(fields::GUEST_PREEMPTION_TIMER_VALUE)?)
        } else {
            None
        };
        (tsc_offset, preemption_timer)
    };

    ctx.mode = VmxMode::NonRoot;
    cpu.unmask_event(CpuEvents::INIT);
    cpu.tsc_offset = tsc_offset;

    match preemption_timer {
        Some(0) => cpu.signal_event(CpuEvents::VMX_PREEMPTION_TIMER_EXPIRED),
        Some(value) => {
            tracing::debug!(value, "VMX preemption timer active");
            platform.arm_preemption_timer(value);
        }
        None => {}
    }

    inject_event(cpu, &mut ctx.cache, &ctx.caps, platform)?;

    if ctx.cache.proc.contains(ProcControls::TPR_SHADOW) {
        platform.virtualize_tpr(cpu, &ctx.cache);
    }
    Ok(VmxOutcome::Entered)
}

/// Whether a VMREAD/VMWRITE in non-root operation exits instead of accessing
/// the shadow VMCS.
fn shadow_access_exits<M: PhysicalMemory + ?Sized>(
    ctx: &VmxContext,
    mem: &mut M,
    bitmap: u64,
    encoding: u64,
    size: OperandSize,
) -> bool {
    if !ctx.cache.secondary.contains(SecondaryControls::VMCS_SHADOWING) {
        return true;
    }
    if size == OperandSize::Qword && encoding >> 32 != 0 {
        return true;
    }
    let encoding = encoding as u32;
    if encoding > 0x7fff {
        return true;
    }
    let byte = mem.read_u8(bitmap | u64::from(encoding >> 3));
    byte & (1 << (encoding & 7)) != 0
}

/// VMCS accessed by VMREAD/VMWRITE: the current VMCS in root operation, the
/// shadow VMCS named by the link pointer in non-root operation.
fn vmread_vmwrite_target(ctx: &VmxContext) -> VmcsPointer {
    if ctx.in_guest() {
        pointer_from_raw(ctx.cache.link_pointer)
    } else {
        ctx.current
    }
}

/// VMREAD: the field value is carried in [`VmxOutcome::SucceedWith`].
pub fn vmread<P: Platform + ?Sized>(
    ctx: &mut VmxContext,
    cpu: &mut VmxCpu,
    platform: &mut P,
    encoding: u64,
    size: OperandSize,
    operand: ExitOperand,
) -> Result<VmxOutcome, VmxFault> {
    check_vmx_operation(ctx, cpu)?;
    if ctx.in_guest()
        && shadow_access_exits(ctx, platform, ctx.cache.vmread_bitmap, encoding, size)
    {
        return instruction_exit(ctx, cpu, platform, ExitReason::Vmread, Some(operand));
    }
    check_cpl0(cpu, "VMREAD")?;

    let Some(base) = vmread_vmwrite_target(ctx).address() else {
        tracing::error!("VMFAIL: VMREAD with invalid VMCS ptr");
        return Ok(vm_fail_invalid(cpu));
    };

    if size == OperandSize::Qword && encoding >> 32 != 0 {
        tracing::error!("VMREAD: not supported field (upper 32-bit not zero)");
        return vm_fail(ctx, cpu, platform, VmxInstructionError::UnsupportedComponent);
    }
    let encoding = encoding as u32;
    if !ctx.layout.is_valid(encoding) {
        tracing::error!("VMREAD: not supported field {encoding:#010x}");
        return vm_fail(ctx, cpu, platform, VmxInstructionError::UnsupportedComponent);
    }

    let mut value = VmcsAccess::new(&mut *platform, &ctx.layout, base).vmread(encoding)?;
    if size == OperandSize::Dword {
        value &= 0xffff_ffff;
    }
    vm_succeed(cpu);
    Ok(VmxOutcome::SucceedWith(value))
}

/// VMWRITE `value` to the field named by `encoding`.
pub fn vmwrite<P: Platform + ?Sized>(
    ctx: &mut VmxContext,
    cpu: &mut VmxCpu,
    platform: &mut P,
    encoding: u64,
    value: u64,
    size: OperandSize,
    operand: ExitOperand,
) -> Result<VmxOutcome, VmxFault> {
    check_vmx_operation(ctx, cpu)?;
    if ctx.in_guest()
        && shadow_access_exits(ctx, platform, ctx.cache.vmwrite_bitmap, encoding, size)
    {
        return instruction_exit(ctx, cpu, platform, ExitReason::Vmwrite, Some(operand));
    }
    check_cpl0(cpu, "VMWRITE")?;

    let Some(base) = vmread_vmwrite_target(ctx).address() else {
        tracing::error!("VMFAIL: VMWRITE with invalid VMCS ptr");
        return Ok(vm_fail_invalid(cpu));
    };

    if size == OperandSize::Qword && encoding >> 32 != 0 {
        tracing::error!("VMWRITE: not supported field (upper 32-bit not zero)");
        return vm_fail(ctx, cpu, platform, VmxInstructionError::UnsupportedComponent);
    }
    let encoding = encoding as u32;
    if !ctx.layout.is_valid(encoding) {
        tracing::error!("VMWRITE: not supported field {encoding:#010x}");
        return vm_fail(ctx, cpu, platform, VmxInstructionError::UnsupportedComponent);
    }
    if fields::field_type(encoding) == FieldType::ReadOnly
        && !ctx.caps.misc_has(misc::VMWRITE_READ_ONLY_FIELDS)
    {
        tracing::error!("VMWRITE: write to read only field {encoding:#010x}");
        return vm_fail(ctx, cpu, platform, VmxInstructionError::VmwriteReadOnly);
    }

    let value = match size {
        OperandSize::Dword => value & 0xffff_ffff,
        OperandSize::Qword => value,
    };
    VmcsAccess::new(&mut *platform, &ctx.layout, base).vmwrite(encoding, value)?;
    Ok(vm_succeed(cpu))
}

/// VMCALL. In non-root operation this is an unconditional VM exit; in root
/// operation it would activate the dual-monitor treatment of SMM, which is not
/// modelled, so every path that reaches it fails.
pub fn vmcall<P: Platform + ?Sized>(
    ctx: &mut VmxContext,
    cpu: &mut VmxCpu,
    platform: &mut P,
) -> Result<VmxOutcome, VmxFault> {
    if !ctx.in_vmx() {
        return Err(VmxFault::InvalidOpcode);
    }
    if ctx.in_guest() {
        return instruction_exit(ctx, cpu, platform, ExitReason::Vmcall, None);
    }
    if cpu.v8086_mode() || cpu.compat_mode() {
        return Err(VmxFault::InvalidOpcode);
    }
    check_cpl0(cpu, "VMCALL")?;

    if cpu.in_smm {
        return vm_fail(ctx, cpu, platform, VmxInstructionError::VmcallInRoot);
    }
    let Some(mut vmcs) = ctx.current_vmcs(&mut *platform) else {
        tracing::error!("VMFAIL: VMCALL with invalid VMCS ptr");
        return Ok(vm_fail_invalid(cpu));
    };
    if vmcs.launch_state() != LaunchState::Clear as u32 {
        tracing::error!("VMFAIL: VMCALL with launched VMCS");
        return vm_fail(ctx, cpu, platform, VmxInstructionError::VmcallNonClear);
    }

    tracing::warn!("VMCALL: dual-monitor treatment of SMIs and SMM is not supported");
    vm_fail(ctx, cpu, platform, VmxInstructionError::VmcallInRoot)
}

/// INVEPT with the type in a register and the 128-bit descriptor
/// `[eptp, reserved]`.
pub fn invept<P: Platform + ?Sized>(
    ctx: &mut VmxContext,
    cpu: &mut VmxCpu,
    platform: &mut P,
    ty: u64,
    size: OperandSize,
    descriptor: [u64; 2],
    operand: ExitOperand,
) -> Result<VmxOutcome, VmxFault> {
    if ctx.caps.ept_vpid & ept_vpid::INVEPT == 0 {
        return Err(VmxFault::InvalidOpcode);
    }
    check_vmx_operation(ctx, cpu)?;
    if ctx.in_guest() {
        return instruction_exit(ctx, cpu, platform, ExitReason::Invept, Some(operand));
    }
    check_cpl0(cpu, "INVEPT")?;

    let ty = match size {
        OperandSize::Dword => ty & 0xffff_ffff,
        OperandSize::Qword => ty,
    };
    if !invept_type_supported(&ctx.caps, ty) {
        tracing::error!(ty, "INVEPT: not supported type");
        return vm_fail(ctx, cpu, platform, VmxInstructionError::InvalidInveptInvvpid);
    }
    // Single-context (1) needs a valid EPTP; all-context (2) ignores it.
    if ty == 1 && !ctx.caps.is_valid_eptp(descriptor[0]) {
        tracing::error!(eptp = descriptor[0], "INVEPT: invalid EPTPTR value");
        return vm_fail(ctx, cpu, platform, VmxInstructionError::InvalidInveptInvvpid);
    }

    platform.flush_tlb(TlbFlush::All);
    Ok(vm_succeed(cpu))
}

/// INVVPID with the type in a register and the 128-bit descriptor
/// `[vpid, linear address]`.
pub fn invvpid<P: Platform + ?Sized>(
    ctx: &mut VmxContext,
    cpu: &mut VmxCpu,
    platform: &mut P,
    ty: u64,
    size: OperandSize,
    descriptor: [u64; 2],
    operand: ExitOperand,
) -> Result<VmxOutcome, VmxFault> {
    if ctx.caps.ept_vpid & ept_vpid::INVVPID == 0 {
        return Err(VmxFault::InvalidOpcode);
    }
    check_vmx_operation(ctx, cpu)?;
    if ctx.in_guest() {
        return instruction_exit(ctx, cpu, platform, ExitReason::Invvpid, Some(operand));
    }
    check_cpl0(cpu, "INVVPID")?;

    let ty = match size {
        OperandSize::Dword => ty & 0xffff_ffff,
        OperandSize::Qword => ty,
    };

    if descriptor[0] > 0xffff {
        tracing::error!("INVVPID: INVVPID_DESC reserved bits set");
        return vm_fail(ctx, cpu, platform, VmxInstructionError::InvalidInveptInvvpid);
    }
    let vpid = descriptor[0] as u16;
    if vpid == 0 && ty != 2 {
        tracing::error!("INVVPID with VPID=0");
        return vm_fail(ctx, cpu, platform, VmxInstructionError::InvalidInveptInvvpid);
    }
    if !invvpid_type_supported(&ctx.caps, ty) {
        tracing::error!(ty, "INVVPID: not supported type");
        return vm_fail(ctx, cpu, platform, VmxInstructionError::InvalidInveptInvvpid);
    }

    let scope = match ty {
        0 => {
            if !ctx.caps.is_canonical(descriptor[1]) {
                tracing::error!("INVVPID: non canonical LADDR single context invalidation");
                return vm_fail(ctx, cpu, platform, VmxInstructionError::InvalidInveptInvvpid);
            }
            TlbFlush::All
        }
        3 => TlbFlush::NonGlobal,
        _ => TlbFlush::All,
    };
    platform.flush_tlb(scope);
    Ok(vm_succeed(cpu))
}
