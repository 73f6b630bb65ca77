#![allow(dead_code)]

use std::collections::BTreeMap;

use aero_vmx::controls::{EntryControls, ExitControls, VmcsCache};
use aero_vmx::fields;
use aero_vmx::instructions::{vmclear, vmlaunch, vmptrld, vmresume, vmxon};
use aero_vmx::platform::EventType;
use aero_vmx::state::{ar, cr0, cr4, efer, msr, ActivityState, Segment, SegmentCache};
use aero_vmx::vmcs::VMCS_REVISION_ID;
use aero_vmx::{
    EventDelivery, ExitOperand, FlatGuestMemory, LocalApic, MsrAccess, PhysicalMemory, TlbFlush,
    VmcsAccess, VmxCapabilities, VmxContext, VmxCpu, VmxFault, VmxOutcome,
};

pub const MEM_SIZE: usize = 0x4_0000;

pub const VMXON_REGION: u64 = 0x1000;
pub const VMCS_REGION: u64 = 0x2000;
pub const SHADOW_VMCS_REGION: u64 = 0x3000;
pub const ENTRY_MSR_LOAD_AREA: u64 = 0x4000;
pub const EXIT_MSR_STORE_AREA: u64 = 0x5000;
pub const EXIT_MSR_LOAD_AREA: u64 = 0x6000;
pub const VMREAD_BITMAP: u64 = 0x7000;
pub const VMWRITE_BITMAP: u64 = 0x8000;
pub const GUEST_CR3: u64 = 0x9000;
pub const HOST_CR3: u64 = 0xA000;

pub const GUEST_RIP: u64 = 0x40_0000;
pub const GUEST_RSP: u64 = 0x50_0000;
pub const HOST_RIP: u64 = 0xFFFF_8000_0010_0000;
pub const HOST_RSP: u64 = 0xFFFF_8000_0020_0000;

/// Required-1 bits of the default (EPT) profile's TRUE control MSRs.
pub const PIN_DEFAULT1: u32 = 0x0000_0016;
pub const PROC_DEFAULT1: u32 = 0x0400_6172;
pub const EXIT_DEFAULT1: u32 = 0x0003_6DFB;
pub const ENTRY_DEFAULT1: u32 = 0x0000_11FB;

pub const CODE64_AR: u32 = ar::G | ar::L | ar::P | ar::S | ar::TYPE_CODE_EXEC_READ_ACCESSED;
pub const DATA_AR: u32 = ar::G | ar::DB | ar::P | ar::S | ar::TYPE_DATA_RW_ACCESSED;
pub const BUSY_TSS_AR: u32 = ar::P | ar::TYPE_SYS_BUSY_386_TSS;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub vector: u8,
    pub ty: EventType,
    pub push_error: bool,
    pub error_code: u16,
}

/// Machine model backing every integration test: flat RAM, a sparse MSR file
/// and recorders for the side effects the control plane triggers.
pub struct TestMachine {
    pub mem: FlatGuestMemory,
    pub msrs: BTreeMap<u32, u64>,
    pub armed_timer: Option<u32>,
    /// Value returned by the next preemption-timer read.
    pub timer_value: u32,
    pub deliveries: Vec<Delivery>,
    pub flushes: Vec<TlbFlush>,
    pub sleeps: Vec<ActivityState>,
    pub tpr_virtualizations: usize,
    pub shut_down: bool,
}

impl TestMachine {
    pub fn new() -> Self {
        Self {
            mem: FlatGuestMemory::new(MEM_SIZE),
            msrs: BTreeMap::new(),
            armed_timer: None,
            timer_value: 0,
            deliveries: Vec::new(),
            flushes: Vec::new(),
            sleeps: Vec::new(),
            tpr_virtualizations: 0,
            shut_down: false,
        }
    }

    pub fn with_msrs(mut self, msrs: &[(u32, u64)]) -> Self {
        self.msrs.extend(msrs.iter().copied());
        self
    }

    /// Writes `(index, value)` pairs as 16-byte MSR-area entries.
    pub fn put_msr_area(&mut self, addr: u64, entries: &[(u32, u64)]) {
        for (n, &(index, value)) in entries.iter().enumerate() {
            let at = addr + n as u64 * 16;
            self.mem.write_u64(at, u64::from(index));
            self.mem.write_u64(at + 8, value);
        }
    }
}

impl Default for TestMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl PhysicalMemory for TestMachine {
    fn read_bytes(&mut self, paddr: u64, dst: &mut [u8]) {
        self.mem.read_bytes(paddr, dst)
    }

    fn write_bytes(&mut self, paddr: u64, src: &[u8]) {
        self.mem.write_bytes(paddr, src)
    }
}

impl MsrAccess for TestMachine {
    fn rdmsr(&mut self, _cpu: &VmxCpu, index: u32) -> Option<u64> {
        self.msrs.get(&index).copied()
    }

    fn wrmsr(&mut self, _cpu: &mut VmxCpu, index: u32, value: u64) -> bool {
        match self.msrs.get_mut(&index) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }
}

impl LocalApic for TestMachine {
    fn arm_preemption_timer(&mut self, value: u32) {
        self.armed_timer = Some(value);
        self.timer_value = value;
    }

    fn disarm_preemption_timer(&mut self) {
        self.armed_timer = None;
    }

    fn read_preemption_timer(&mut self) -> u32 {
        self.timer_value
    }

    fn virtualize_tpr(&mut self, _cpu: &mut VmxCpu, _cache: &VmcsCache) {
        self.tpr_virtualizations += 1;
    }
}

impl EventDelivery for TestMachine {
    fn deliver_event(
        &mut self,
        _cpu: &mut VmxCpu,
        vector: u8,
        ty: EventType,
        push_error: bool,
        error_code: u16,
    ) {
        self.deliveries.push(Delivery {
            vector,
            ty,
            push_error,
            error_code,
        });
    }

    fn enter_sleep_state(&mut self, _cpu: &mut VmxCpu, state: ActivityState) {
        self.sleeps.push(state);
    }

    fn flush_tlb(&mut self, scope: TlbFlush) {
        self.flushes.push(scope);
    }

    fn shutdown(&mut self, _cpu: &mut VmxCpu) {
        self.shut_down = true;
    }
}

/// A 64-bit, CPL 0 host with CR4.VMXE set and VMXON enabled in
/// IA32_FEATURE_CONTROL.
pub fn host_cpu() -> VmxCpu {
    let mut cpu = VmxCpu::default();
    cpu.cr0 = cr0::PE | cr0::NE | cr0::PG | cr0::ET;
    cpu.cr3 = HOST_CR3;
    cpu.cr4 = cr4::PAE | cr4::VMXE;
    cpu.efer = efer::LME | efer::LMA;
    cpu.msr.feature_control = msr::FEATURE_CONTROL_LOCK | msr::FEATURE_CONTROL_VMX_OUTSIDE_SMX;
    *cpu.segment_mut(Segment::CS) = SegmentCache {
        selector: 0x08,
        base: 0,
        limit: 0xffff_ffff,
        ar: CODE64_AR,
    };
    for seg in [Segment::ES, Segment::SS, Segment::DS] {
        *cpu.segment_mut(seg) = SegmentCache {
            selector: 0x10,
            base: 0,
            limit: 0xffff_ffff,
            ar: DATA_AR,
        };
    }
    cpu.rip = 0x10_0005;
    cpu.prev_rip = 0x10_0000;
    cpu
}

/// Stamps a VMCS/VMXON region with a revision identifier.
pub fn write_region(machine: &mut TestMachine, addr: u64, revision: u32) {
    machine.mem.write_u32(addr, revision);
}

/// One logical processor plus its machine.
pub struct TestBed {
    pub ctx: VmxContext,
    pub cpu: VmxCpu,
    pub m: TestMachine,
}

impl TestBed {
    pub fn new() -> Self {
        Self::with_caps(VmxCapabilities::default())
    }

    pub fn with_caps(caps: VmxCapabilities) -> Self {
        init_tracing();
        let mut m = TestMachine::new();
        write_region(&mut m, VMXON_REGION, VMCS_REVISION_ID);
        write_region(&mut m, VMCS_REGION, VMCS_REVISION_ID);
        Self {
            ctx: VmxContext::new(caps),
            cpu: host_cpu(),
            m,
        }
    }

    /// VMXON, then VMCLEAR + VMPTRLD of the test VMCS.
    pub fn in_root_with_vmcs(mut self) -> Self {
        let op = ExitOperand::default();
        assert_eq!(self.vmxon(VMXON_REGION), Ok(VmxOutcome::Succeed));
        assert_eq!(
            vmclear(&mut self.ctx, &mut self.cpu, &mut self.m, VMCS_REGION, op),
            Ok(VmxOutcome::Succeed)
        );
        assert_eq!(
            vmptrld(&mut self.ctx, &mut self.cpu, &mut self.m, VMCS_REGION, op),
            Ok(VmxOutcome::Succeed)
        );
        self
    }

    /// [`Self::in_root_with_vmcs`] with a VMCS that passes every entry check.
    pub fn ready_to_launch(self) -> Self {
        let mut bed = self.in_root_with_vmcs();
        bed.write_valid_vmcs();
        bed
    }

    pub fn vmxon(&mut self, region: u64) -> Result<VmxOutcome, VmxFault> {
        vmxon(&mut self.ctx, &mut self.cpu, &mut self.m, region, ExitOperand::default())
    }

    pub fn launch(&mut self) -> Result<VmxOutcome, VmxFault> {
        vmlaunch(&mut self.ctx, &mut self.cpu, &mut self.m)
    }

    pub fn resume(&mut self) -> Result<VmxOutcome, VmxFault> {
        vmresume(&mut self.ctx, &mut self.cpu, &mut self.m)
    }

    /// Raw access to the test VMCS, bypassing VMREAD/VMWRITE.
    pub fn vmcs(&mut self) -> VmcsAccess<'_, TestMachine> {
        VmcsAccess::new(&mut self.m, &self.ctx.layout, VMCS_REGION)
    }

    pub fn read16(&mut self, encoding: u32) -> u16 {
        self.vmcs().read16(encoding).expect("mapped field")
    }

    pub fn read32(&mut self, encoding: u32) -> u32 {
        self.vmcs().read32(encoding).expect("mapped field")
    }

    pub fn read64(&mut self, encoding: u32) -> u64 {
        self.vmcs().read64(encoding).expect("mapped field")
    }

    pub fn write32(&mut self, encoding: u32, value: u32) {
        self.vmcs().write32(encoding, value).expect("mapped field")
    }

    pub fn write64(&mut self, encoding: u32, value: u64) {
        self.vmcs().write64(encoding, value).expect("mapped field")
    }

    pub fn write16(&mut self, encoding: u32, value: u16) {
        self.vmcs().write16(encoding, value).expect("mapped field")
    }

    pub fn write_ar(&mut self, encoding: u32, value: u32) {
        self.vmcs()
            .write_access_rights(encoding, value)
            .expect("mapped field")
    }

    pub fn instruction_error(&mut self) -> u32 {
        self.read32(fields::VM_INSTRUCTION_ERROR)
    }

    /// Guest-physical addresses whose byte differs from `before`.
    pub fn changed_bytes(&self, before: &[u8]) -> Vec<u64> {
        let now = self.m.mem.as_slice();
        (0..now.len())
            .filter(|&i| before[i] != now[i])
            .map(|i| i as u64)
            .collect()
    }

    /// Asserts that RAM differs from `before` only in the VM-instruction-error field.
    pub fn assert_only_instruction_error_written(&self, before: &[u8]) {
        let offset = self
            .ctx
            .layout
            .field_offset(fields::VM_INSTRUCTION_ERROR)
            .expect("mapped field");
        let field = VMCS_REGION + u64::from(offset)..VMCS_REGION + u64::from(offset) + 4;
        let changed = self.changed_bytes(before);
        assert!(!changed.is_empty(), "no error number was recorded");
        assert!(
            changed.iter().all(|addr| field.contains(addr)),
            "unexpected memory writes at {changed:#x?}"
        );
    }

    pub fn write_valid_vmcs(&mut self) {
        self.write_valid_controls();
        self.write_valid_host_state();
        self.write_valid_guest_state();
    }

    pub fn write_valid_controls(&mut self) {
        self.write32(fields::PIN_BASED_CTRLS, PIN_DEFAULT1);
        self.write32(fields::PROC_BASED_CTRLS, PROC_DEFAULT1);
        self.write32(
            fields::VMEXIT_CTRLS,
            EXIT_DEFAULT1 | ExitControls::HOST_ADDRESS_SPACE_SIZE.bits(),
        );
        self.write32(
            fields::VMENTRY_CTRLS,
            ENTRY_DEFAULT1 | EntryControls::IA32E_MODE_GUEST.bits(),
        );
        self.write32(fields::VMENTRY_INTERRUPTION_INFO, 0);
    }

    pub fn write_valid_host_state(&mut self) {
        self.write64(fields::HOST_CR0, cr0::PE | cr0::NE | cr0::PG | cr0::ET);
        self.write64(fields::HOST_CR3, HOST_CR3);
        self.write64(fields::HOST_CR4, cr4::PAE | cr4::VMXE);
        for (n, selector) in [0x10, 0x08, 0x10, 0x10, 0, 0].into_iter().enumerate() {
            self.write16(fields::host_selector(n), selector);
        }
        self.write16(fields::HOST_TR_SELECTOR, 0x18);
        self.write64(fields::HOST_TR_BASE, 0xFFFF_8000_0000_3000);
        self.write64(fields::HOST_FS_BASE, 0x7000_0000);
        self.write64(fields::HOST_GS_BASE, 0xFFFF_8000_0000_8000);
        self.write64(fields::HOST_GDTR_BASE, 0xFFFF_8000_0000_1000);
        self.write64(fields::HOST_IDTR_BASE, 0xFFFF_8000_0000_2000);
        self.write64(fields::HOST_RSP, HOST_RSP);
        self.write64(fields::HOST_RIP, HOST_RIP);
    }

    pub fn write_valid_guest_state(&mut self) {
        self.write64(fields::GUEST_CR0, cr0::PE | cr0::NE | cr0::PG | cr0::ET);
        self.write64(fields::GUEST_CR3, GUEST_CR3);
        self.write64(fields::GUEST_CR4, cr4::PAE | cr4::VMXE);
        self.write64(fields::GUEST_RFLAGS, 0x2);
        self.write64(fields::GUEST_RIP, GUEST_RIP);
        self.write64(fields::GUEST_RSP, GUEST_RSP);

        let segments = [
            (Segment::ES, 0x10, DATA_AR),
            (Segment::CS, 0x08, CODE64_AR),
            (Segment::SS, 0x10, DATA_AR),
            (Segment::DS, 0x10, DATA_AR),
            (Segment::FS, 0, ar::UNUSABLE),
            (Segment::GS, 0, ar::UNUSABLE),
        ];
        for (seg, selector, access_rights) in segments {
            let n = seg as usize;
            let limit = if access_rights == ar::UNUSABLE { 0 } else { 0xffff_ffff };
            self.write16(fields::guest_selector(n), selector);
            self.write64(fields::guest_base(n), 0);
            self.write32(fields::guest_limit(n), limit);
            self.write_ar(fields::guest_access_rights(n), access_rights);
        }

        self.write16(fields::GUEST_LDTR_SELECTOR, 0);
        self.write64(fields::GUEST_LDTR_BASE, 0);
        self.write32(fields::GUEST_LDTR_LIMIT, 0);
        self.write_ar(fields::GUEST_LDTR_ACCESS_RIGHTS, ar::UNUSABLE);

        self.write16(fields::GUEST_TR_SELECTOR, 0x18);
        self.write64(fields::GUEST_TR_BASE, 0x3000);
        self.write32(fields::GUEST_TR_LIMIT, 0x67);
        self.write_ar(fields::GUEST_TR_ACCESS_RIGHTS, BUSY_TSS_AR);

        self.write64(fields::GUEST_GDTR_BASE, 0x8000);
        self.write32(fields::GUEST_GDTR_LIMIT, 0x7f);
        self.write64(fields::GUEST_IDTR_BASE, 0x9000);
        self.write32(fields::GUEST_IDTR_LIMIT, 0xfff);

        self.write64(fields::VMCS_LINK_POINTER, u64::MAX);
        self.write64(fields::GUEST_PENDING_DBG_EXCEPTIONS, 0);
        self.write32(fields::GUEST_ACTIVITY_STATE, 0);
        self.write32(fields::GUEST_INTERRUPTIBILITY_STATE, 0);
    }
}

impl Default for TestBed {
    fn default() -> Self {
        Self::new()
    }
}
