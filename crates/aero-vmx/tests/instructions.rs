mod common;

use aero_vmx::caps::VmxFeatureOverrides;
use aero_vmx::controls::{ProcControls, SecondaryControls};
use aero_vmx::fields;
use aero_vmx::instructions::{
    invept, invvpid, vmcall, vmclear, vmptrld, vmptrst, vmread, vmwrite, vmxoff,
};
use aero_vmx::state::{ar, cr4, CpuEvents, Segment, FLAGS_OSZAPC, FLAG_CF, FLAG_ZF};
use aero_vmx::vmcs::{LaunchState, VMCS_REVISION_ID, VMCS_SHADOW_BIT};
use aero_vmx::{
    ExitOperand, ExitReason, OperandSize, PhysicalMemory, TlbFlush, VmcsPointer, VmxCapabilities,
    VmxFault, VmxFeatures, VmxInstructionError, VmxMode, VmxOutcome, VmxProfile,
};

use common::*;

const VMCS_REVISION_ID_SHADOW: u32 = VMCS_REVISION_ID | VMCS_SHADOW_BIT;

const NO_OPERAND: ExitOperand = ExitOperand {
    qualification: 0,
    instruction_info: 0,
};

fn read(bed: &mut TestBed, encoding: u64, size: OperandSize) -> Result<VmxOutcome, VmxFault> {
    vmread(&mut bed.ctx, &mut bed.cpu, &mut bed.m, encoding, size, NO_OPERAND)
}

fn write(
    bed: &mut TestBed,
    encoding: u64,
    value: u64,
    size: OperandSize,
) -> Result<VmxOutcome, VmxFault> {
    vmwrite(&mut bed.ctx, &mut bed.cpu, &mut bed.m, encoding, value, size, NO_OPERAND)
}

fn clear(bed: &mut TestBed, region: u64) -> Result<VmxOutcome, VmxFault> {
    vmclear(&mut bed.ctx, &mut bed.cpu, &mut bed.m, region, NO_OPERAND)
}

fn load(bed: &mut TestBed, region: u64) -> Result<VmxOutcome, VmxFault> {
    vmptrld(&mut bed.ctx, &mut bed.cpu, &mut bed.m, region, NO_OPERAND)
}

fn store(bed: &mut TestBed) -> Result<VmxOutcome, VmxFault> {
    vmptrst(&mut bed.ctx, &mut bed.cpu, &mut bed.m, NO_OPERAND)
}

#[test]
fn vmxon_requires_cr4_vmxe_cpl0_and_feature_control() {
    let mut bed = TestBed::new();
    bed.cpu.cr4 &= !cr4::VMXE;
    assert_eq!(bed.vmxon(VMXON_REGION), Err(VmxFault::InvalidOpcode));

    let mut bed = TestBed::new();
    bed.cpu.segment_mut(Segment::CS).selector = 0x0b;
    assert_eq!(bed.vmxon(VMXON_REGION), Err(VmxFault::GeneralProtection));

    let mut bed = TestBed::new();
    bed.cpu.msr.feature_control = 0;
    assert_eq!(bed.vmxon(VMXON_REGION), Err(VmxFault::GeneralProtection));
    assert_eq!(bed.ctx.mode, VmxMode::Off);
}

#[test]
fn vmxon_region_must_be_aligned_with_matching_revision() {
    let mut bed = TestBed::new();
    assert_eq!(bed.vmxon(VMXON_REGION + 0x10), Ok(VmxOutcome::FailInvalid));
    assert_eq!(bed.cpu.rflags & FLAGS_OSZAPC, FLAG_CF);
    assert_eq!(bed.vmxon(1 << 40), Ok(VmxOutcome::FailInvalid));

    write_region(&mut bed.m, VMXON_REGION, 0x1);
    assert_eq!(bed.vmxon(VMXON_REGION), Ok(VmxOutcome::FailInvalid));
    assert_eq!(bed.ctx.mode, VmxMode::Off);
}

#[test]
fn vmxon_enters_root_and_vmxoff_leaves() {
    let mut bed = TestBed::new();
    assert_eq!(bed.vmxon(VMXON_REGION), Ok(VmxOutcome::Succeed));
    assert_eq!(bed.ctx.mode, VmxMode::Root);
    assert_eq!(bed.ctx.vmxon_ptr, VMXON_REGION);
    assert_eq!(bed.ctx.current, VmcsPointer::Invalid);
    assert!(bed.cpu.is_masked_event(CpuEvents::INIT));
    assert_eq!(bed.cpu.rflags & FLAGS_OSZAPC, 0);

    // A second VMXON with no current VMCS fails without an error number.
    assert_eq!(bed.vmxon(VMXON_REGION), Ok(VmxOutcome::FailInvalid));

    assert_eq!(
        vmxoff(&mut bed.ctx, &mut bed.cpu, &mut bed.m),
        Ok(VmxOutcome::Succeed)
    );
    assert_eq!(bed.ctx.mode, VmxMode::Off);
    assert!(!bed.cpu.is_masked_event(CpuEvents::INIT));
    assert_eq!(
        vmxoff(&mut bed.ctx, &mut bed.cpu, &mut bed.m),
        Err(VmxFault::InvalidOpcode)
    );
}

#[test]
fn vmxon_in_root_with_current_vmcs_reports_error_15() {
    let mut bed = TestBed::new().in_root_with_vmcs();
    assert_eq!(
        bed.vmxon(VMXON_REGION),
        Ok(VmxOutcome::FailValid(VmxInstructionError::VmxonInRoot))
    );
    assert_eq!(bed.cpu.rflags & FLAGS_OSZAPC, FLAG_ZF);
    assert_eq!(bed.instruction_error(), 15);
}

#[test]
fn vmx_instructions_are_undefined_outside_vmx_operation() {
    let mut bed = TestBed::new();
    assert_eq!(clear(&mut bed, VMCS_REGION), Err(VmxFault::InvalidOpcode));
    assert_eq!(store(&mut bed), Err(VmxFault::InvalidOpcode));
    assert_eq!(bed.launch(), Err(VmxFault::InvalidOpcode));
    assert_eq!(
        vmcall(&mut bed.ctx, &mut bed.cpu, &mut bed.m),
        Err(VmxFault::InvalidOpcode)
    );
}

#[test]
fn vmclear_validates_the_address() {
    let mut bed = TestBed::new();
    assert_eq!(bed.vmxon(VMXON_REGION), Ok(VmxOutcome::Succeed));
    // No current VMCS yet: failures carry no error number.
    assert_eq!(clear(&mut bed, VMCS_REGION + 8), Ok(VmxOutcome::FailInvalid));
    assert_eq!(clear(&mut bed, VMXON_REGION), Ok(VmxOutcome::FailInvalid));

    let mut bed = TestBed::new().in_root_with_vmcs();
    assert_eq!(
        clear(&mut bed, VMCS_REGION + 8),
        Ok(VmxOutcome::FailValid(VmxInstructionError::VmclearInvalidAddress))
    );
    assert_eq!(bed.instruction_error(), 2);
    assert_eq!(
        clear(&mut bed, VMXON_REGION),
        Ok(VmxOutcome::FailValid(VmxInstructionError::VmclearVmxonPointer))
    );
    assert_eq!(bed.instruction_error(), 3);
}

#[test]
fn vmclear_of_current_vmcs_drops_the_pointer() {
    let mut bed = TestBed::new().ready_to_launch();
    assert_eq!(store(&mut bed), Ok(VmxOutcome::SucceedWith(VMCS_REGION)));
    bed.vmcs().set_launch_state(LaunchState::Launched);

    assert_eq!(clear(&mut bed, VMCS_REGION), Ok(VmxOutcome::Succeed));
    assert_eq!(bed.ctx.current, VmcsPointer::Invalid);
    assert_eq!(bed.vmcs().launch_state(), 0);
    assert_eq!(store(&mut bed), Ok(VmxOutcome::SucceedWith(u64::MAX)));

    // Clearing some other region leaves the current pointer alone.
    assert_eq!(load(&mut bed, VMCS_REGION), Ok(VmxOutcome::Succeed));
    assert_eq!(clear(&mut bed, SHADOW_VMCS_REGION), Ok(VmxOutcome::Succeed));
    assert_eq!(bed.ctx.current, VmcsPointer::Active(VMCS_REGION));
}

#[test]
fn vmptrld_checks_address_and_revision() {
    let mut bed = TestBed::new().in_root_with_vmcs();
    assert_eq!(
        load(&mut bed, VMCS_REGION | 0x800),
        Ok(VmxOutcome::FailValid(VmxInstructionError::VmptrldInvalidAddress))
    );
    assert_eq!(
        load(&mut bed, VMXON_REGION),
        Ok(VmxOutcome::FailValid(VmxInstructionError::VmptrldVmxonPointer))
    );
    write_region(&mut bed.m, SHADOW_VMCS_REGION, 0x1);
    assert_eq!(
        load(&mut bed, SHADOW_VMCS_REGION),
        Ok(VmxOutcome::FailValid(VmxInstructionError::VmptrldBadRevision))
    );
    assert_eq!(bed.instruction_error(), 11);

    // The shadow bit is only accepted when VMCS shadowing is supported.
    write_region(&mut bed.m, SHADOW_VMCS_REGION, VMCS_REVISION_ID_SHADOW);
    assert_eq!(
        load(&mut bed, SHADOW_VMCS_REGION),
        Ok(VmxOutcome::FailValid(VmxInstructionError::VmptrldBadRevision))
    );
    assert_eq!(bed.ctx.current, VmcsPointer::Active(VMCS_REGION));
}

#[test]
fn vmlaunch_without_current_vmcs_fails_invalid() {
    let mut bed = TestBed::new();
    assert_eq!(bed.vmxon(VMXON_REGION), Ok(VmxOutcome::Succeed));
    assert_eq!(bed.launch(), Ok(VmxOutcome::FailInvalid));
    assert_eq!(bed.resume(), Ok(VmxOutcome::FailInvalid));
    assert_eq!(bed.cpu.rflags & FLAGS_OSZAPC, FLAG_CF);
}

#[test]
fn vmread_and_vmwrite_in_root_operation() {
    let mut bed = TestBed::new().in_root_with_vmcs();
    let rip = fields::GUEST_RIP as u64;

    assert_eq!(
        write(&mut bed, rip, 0x1_2345_6789, OperandSize::Qword),
        Ok(VmxOutcome::Succeed)
    );
    assert_eq!(
        read(&mut bed, rip, OperandSize::Qword),
        Ok(VmxOutcome::SucceedWith(0x1_2345_6789))
    );
    assert_eq!(
        read(&mut bed, rip, OperandSize::Dword),
        Ok(VmxOutcome::SucceedWith(0x2345_6789))
    );

    // Outside 64-bit mode only the low half of the source is written.
    let rsp = fields::GUEST_RSP as u64;
    assert_eq!(
        write(&mut bed, rsp, 0xffff_ffff_0000_1234, OperandSize::Dword),
        Ok(VmxOutcome::Succeed)
    );
    assert_eq!(bed.read64(fields::GUEST_RSP), 0x1234);

    // 16-bit fields truncate.
    let cs = fields::guest_selector(1) as u64;
    assert_eq!(
        write(&mut bed, cs, 0xabcd_0008, OperandSize::Qword),
        Ok(VmxOutcome::Succeed)
    );
    assert_eq!(read(&mut bed, cs, OperandSize::Qword), Ok(VmxOutcome::SucceedWith(8)));
}

#[test]
fn access_rights_are_reported_in_architectural_format() {
    let mut bed = TestBed::new().in_root_with_vmcs();
    let es = fields::GUEST_ES_ACCESS_RIGHTS as u64;
    let value = u64::from(DATA_AR);

    assert_eq!(write(&mut bed, es, value, OperandSize::Qword), Ok(VmxOutcome::Succeed));
    assert_eq!(read(&mut bed, es, OperandSize::Qword), Ok(VmxOutcome::SucceedWith(value)));

    let unusable = u64::from(ar::UNUSABLE);
    assert_eq!(write(&mut bed, es, unusable, OperandSize::Qword), Ok(VmxOutcome::Succeed));
    assert_eq!(
        read(&mut bed, es, OperandSize::Qword),
        Ok(VmxOutcome::SucceedWith(unusable))
    );
}

#[test]
fn vmread_vmwrite_reject_unsupported_and_read_only_fields() {
    let mut bed = TestBed::new().in_root_with_vmcs();
    let unsupported = Ok(VmxOutcome::FailValid(VmxInstructionError::UnsupportedComponent));

    // Unassigned 16-bit control field.
    assert_eq!(read(&mut bed, 0x0002, OperandSize::Qword), unsupported);
    assert_eq!(bed.instruction_error(), 12);
    assert_eq!(write(&mut bed, 0x0002, 0, OperandSize::Qword), unsupported);
    // The field needs a feature the default profile does not advertise.
    assert_eq!(read(&mut bed, fields::EPTP_INDEX as u64, OperandSize::Qword), unsupported);
    // Encoding bits above 31.
    let high = 1 << 32 | fields::GUEST_RIP as u64;
    assert_eq!(read(&mut bed, high, OperandSize::Qword), unsupported);
    assert_eq!(write(&mut bed, high, 0, OperandSize::Qword), unsupported);
    // Reserved encoding bits.
    assert_eq!(read(&mut bed, 0x8000, OperandSize::Qword), unsupported);

    assert_eq!(
        write(&mut bed, fields::VMEXIT_REASON as u64, 1, OperandSize::Qword),
        Ok(VmxOutcome::FailValid(VmxInstructionError::VmwriteReadOnly))
    );
    assert_eq!(bed.instruction_error(), 13);
    assert_eq!(
        read(&mut bed, fields::VMEXIT_REASON as u64, OperandSize::Qword),
        Ok(VmxOutcome::SucceedWith(0))
    );
}

#[test]
fn vmread_without_current_vmcs_fails_invalid() {
    let mut bed = TestBed::new();
    assert_eq!(bed.vmxon(VMXON_REGION), Ok(VmxOutcome::Succeed));
    assert_eq!(
        read(&mut bed, fields::GUEST_RIP as u64, OperandSize::Qword),
        Ok(VmxOutcome::FailInvalid)
    );
    assert_eq!(
        write(&mut bed, fields::GUEST_RIP as u64, 0, OperandSize::Qword),
        Ok(VmxOutcome::FailInvalid)
    );
}

#[test]
fn vmcall_in_root_operation_always_fails() {
    let mut bed = TestBed::new();
    assert_eq!(bed.vmxon(VMXON_REGION), Ok(VmxOutcome::Succeed));
    assert_eq!(
        vmcall(&mut bed.ctx, &mut bed.cpu, &mut bed.m),
        Ok(VmxOutcome::FailInvalid)
    );

    let mut bed = TestBed::new().in_root_with_vmcs();
    assert_eq!(
        vmcall(&mut bed.ctx, &mut bed.cpu, &mut bed.m),
        Ok(VmxOutcome::FailValid(VmxInstructionError::VmcallInRoot))
    );
    assert_eq!(bed.instruction_error(), 1);

    bed.vmcs().set_launch_state(LaunchState::Launched);
    assert_eq!(
        vmcall(&mut bed.ctx, &mut bed.cpu, &mut bed.m),
        Ok(VmxOutcome::FailValid(VmxInstructionError::VmcallNonClear))
    );
}

#[test]
fn instructions_in_guest_exit_to_host() {
    let mut bed = TestBed::new().ready_to_launch();
    assert_eq!(bed.launch(), Ok(VmxOutcome::Entered));
    assert_eq!(
        vmcall(&mut bed.ctx, &mut bed.cpu, &mut bed.m),
        Ok(VmxOutcome::VmExit(ExitReason::Vmcall))
    );
    assert_eq!(bed.read32(fields::VMEXIT_REASON), 18);
    assert_eq!(bed.ctx.mode, VmxMode::Root);

    assert_eq!(bed.resume(), Ok(VmxOutcome::Entered));
    let op = ExitOperand {
        qualification: 0x40,
        instruction_info: 0x0044_0000,
    };
    assert_eq!(
        vmread(
            &mut bed.ctx,
            &mut bed.cpu,
            &mut bed.m,
            fields::GUEST_RIP as u64,
            OperandSize::Qword,
            op,
        ),
        Ok(VmxOutcome::VmExit(ExitReason::Vmread))
    );
    assert_eq!(bed.read32(fields::VMEXIT_REASON), 23);
    assert_eq!(bed.read64(fields::VMEXIT_QUALIFICATION), 0x40);
    assert_eq!(bed.read32(fields::VMEXIT_INSTRUCTION_INFO), 0x0044_0000);

    assert_eq!(bed.resume(), Ok(VmxOutcome::Entered));
    assert_eq!(
        bed.vmxon(VMXON_REGION),
        Ok(VmxOutcome::VmExit(ExitReason::Vmxon))
    );
    assert_eq!(bed.resume(), Ok(VmxOutcome::Entered));
    assert_eq!(bed.launch(), Ok(VmxOutcome::VmExit(ExitReason::Vmlaunch)));
}

#[test]
fn invept_types_and_descriptor() {
    let mut bed = TestBed::new().in_root_with_vmcs();
    let run = |bed: &mut TestBed, ty: u64, eptp: u64| {
        invept(
            &mut bed.ctx,
            &mut bed.cpu,
            &mut bed.m,
            ty,
            OperandSize::Qword,
            [eptp, 0],
            NO_OPERAND,
        )
    };
    let invalid = Ok(VmxOutcome::FailValid(VmxInstructionError::InvalidInveptInvvpid));

    // WB memory type, 4-level walk.
    assert_eq!(run(&mut bed, 1, 0x101e), Ok(VmxOutcome::Succeed));
    assert_eq!(bed.m.flushes, vec![TlbFlush::All]);
    // Memory type 1 is reserved.
    assert_eq!(run(&mut bed, 1, 0x1019), invalid);
    assert_eq!(bed.instruction_error(), 28);
    // All-context ignores the descriptor.
    assert_eq!(run(&mut bed, 2, 0x1019), Ok(VmxOutcome::Succeed));
    assert_eq!(run(&mut bed, 3, 0x101e), invalid);
    assert_eq!(run(&mut bed, 0, 0x101e), invalid);
}

#[test]
fn invept_and_invvpid_are_undefined_without_ept_and_vpid() {
    let caps = VmxCapabilities::from_profile(VmxProfile::Basic, VmxFeatureOverrides::default())
        .unwrap();
    let mut bed = TestBed::with_caps(caps).in_root_with_vmcs();
    assert_eq!(
        invept(
            &mut bed.ctx,
            &mut bed.cpu,
            &mut bed.m,
            2,
            OperandSize::Qword,
            [0, 0],
            NO_OPERAND,
        ),
        Err(VmxFault::InvalidOpcode)
    );
    assert_eq!(
        invvpid(
            &mut bed.ctx,
            &mut bed.cpu,
            &mut bed.m,
            2,
            OperandSize::Qword,
            [0, 0],
            NO_OPERAND,
        ),
        Err(VmxFault::InvalidOpcode)
    );
}

#[test]
fn invvpid_types_and_descriptor() {
    let mut bed = TestBed::new().in_root_with_vmcs();
    let run = |bed: &mut TestBed, ty: u64, descriptor: [u64; 2]| {
        invvpid(
            &mut bed.ctx,
            &mut bed.cpu,
            &mut bed.m,
            ty,
            OperandSize::Qword,
            descriptor,
            NO_OPERAND,
        )
    };
    let invalid = Ok(VmxOutcome::FailValid(VmxInstructionError::InvalidInveptInvvpid));

    // Reserved descriptor bits above the VPID.
    assert_eq!(run(&mut bed, 1, [0x1_0000, 0]), invalid);
    // VPID 0 is only valid for all-context invalidation.
    assert_eq!(run(&mut bed, 1, [0, 0]), invalid);
    assert_eq!(run(&mut bed, 2, [0, 0]), Ok(VmxOutcome::Succeed));
    // Individual-address invalidation needs a canonical address.
    assert_eq!(run(&mut bed, 0, [1, 0x0000_8000_0000_0000]), invalid);
    assert_eq!(run(&mut bed, 0, [1, 0xFFFF_8000_0000_0000]), Ok(VmxOutcome::Succeed));
    assert_eq!(run(&mut bed, 4, [1, 0]), invalid);

    bed.m.flushes.clear();
    assert_eq!(run(&mut bed, 3, [1, 0]), Ok(VmxOutcome::Succeed));
    assert_eq!(bed.m.flushes, vec![TlbFlush::NonGlobal]);
}

fn shadowing_bed() -> TestBed {
    let caps = VmxCapabilities::from_profile(
        VmxProfile::Ept,
        VmxFeatureOverrides {
            force_enable: VmxFeatures::VMCS_SHADOWING,
            ..VmxFeatureOverrides::default()
        },
    )
    .unwrap();
    let mut bed = TestBed::with_caps(caps).ready_to_launch();
    bed.write32(
        fields::PROC_BASED_CTRLS,
        PROC_DEFAULT1 | ProcControls::SECONDARY_CONTROLS.bits(),
    );
    bed.write32(
        fields::SECONDARY_PROC_BASED_CTRLS,
        SecondaryControls::VMCS_SHADOWING.bits(),
    );
    bed.write64(fields::VMREAD_BITMAP_ADDR, VMREAD_BITMAP);
    bed.write64(fields::VMWRITE_BITMAP_ADDR, VMWRITE_BITMAP);
    bed.write64(fields::VMCS_LINK_POINTER, SHADOW_VMCS_REGION);
    write_region(&mut bed.m, SHADOW_VMCS_REGION, VMCS_REVISION_ID_SHADOW);
    bed
}

#[test]
fn link_pointer_must_name_a_shadow_vmcs() {
    let mut bed = shadowing_bed();
    write_region(&mut bed.m, SHADOW_VMCS_REGION, VMCS_REVISION_ID);
    assert_eq!(
        bed.launch(),
        Ok(VmxOutcome::VmExit(ExitReason::EntryFailureGuestState))
    );
    assert_eq!(bed.read64(fields::VMEXIT_QUALIFICATION), 4);
}

#[test]
fn shadow_vmcs_serves_guest_vmread_and_vmwrite() {
    let mut bed = shadowing_bed();
    assert_eq!(bed.launch(), Ok(VmxOutcome::Entered));
    let rip = fields::GUEST_RIP as u64;

    assert_eq!(
        write(&mut bed, rip, 0xdead_beef, OperandSize::Qword),
        Ok(VmxOutcome::Succeed)
    );
    assert_eq!(
        read(&mut bed, rip, OperandSize::Qword),
        Ok(VmxOutcome::SucceedWith(0xdead_beef))
    );
    assert_eq!(bed.ctx.mode, VmxMode::NonRoot);
    // The access went to the shadow region, not the current VMCS.
    assert_eq!(bed.read64(fields::GUEST_RIP), GUEST_RIP);

    // Read-only fields are writable once VMWRITE_READ_ONLY_FIELDS is advertised.
    assert_eq!(
        write(&mut bed, fields::VMEXIT_QUALIFICATION as u64, 7, OperandSize::Qword),
        Ok(VmxOutcome::Succeed)
    );

    // Setting the field's bit in the VMREAD bitmap makes the read exit.
    let bit = fields::GUEST_RIP;
    let byte_addr = VMREAD_BITMAP + u64::from(bit >> 3);
    bed.m.mem.write_u8(byte_addr, 1 << (bit & 7));
    assert_eq!(
        read(&mut bed, rip, OperandSize::Qword),
        Ok(VmxOutcome::VmExit(ExitReason::Vmread))
    );
    assert_eq!(bed.ctx.mode, VmxMode::Root);
    assert_eq!(bed.read32(fields::VMEXIT_REASON), 23);
}

#[test]
fn guest_vmread_of_large_encodings_always_exits() {
    let mut bed = shadowing_bed();
    assert_eq!(bed.launch(), Ok(VmxOutcome::Entered));
    assert_eq!(
        read(&mut bed, 0x8000, OperandSize::Qword),
        Ok(VmxOutcome::VmExit(ExitReason::Vmread))
    );

    assert_eq!(bed.resume(), Ok(VmxOutcome::Entered));
    assert_eq!(
        write(&mut bed, 1 << 32, 0, OperandSize::Qword),
        Ok(VmxOutcome::VmExit(ExitReason::Vmwrite))
    );
}

#[test]
fn guest_vmread_without_shadow_link_fails_invalid() {
    let mut bed = shadowing_bed();
    bed.write64(fields::VMCS_LINK_POINTER, u64::MAX);
    assert_eq!(bed.launch(), Ok(VmxOutcome::Entered));
    assert_eq!(
        read(&mut bed, fields::GUEST_RIP as u64, OperandSize::Qword),
        Ok(VmxOutcome::FailInvalid)
    );
    assert_eq!(bed.ctx.mode, VmxMode::NonRoot);
}
