//! Architectural register file touched by VM entry and VM exit.
//!
//! This is the single source of truth for both the guest-state snapshot taken
//! on exit and the install performed on entry. The surrounding CPU model owns
//! the rest of the processor state (GPRs other than RSP, FPU, ...).

use bitflags::bitflags;

pub const FLAG_CF: u64 = 1 << 0;
pub const FLAG_RESERVED1: u64 = 1 << 1;
pub const FLAG_PF: u64 = 1 << 2;
pub const FLAG_AF: u64 = 1 << 4;
pub const FLAG_ZF: u64 = 1 << 6;
pub const FLAG_SF: u64 = 1 << 7;
pub const FLAG_TF: u64 = 1 << 8;
pub const FLAG_IF: u64 = 1 << 9;
pub const FLAG_OF: u64 = 1 << 11;
pub const FLAG_VM: u64 = 1 << 17;

/// The arithmetic status flags cleared by VMsucceed.
pub const FLAGS_OSZAPC: u64 = FLAG_OF | FLAG_SF | FLAG_ZF | FLAG_AF | FLAG_PF | FLAG_CF;

pub mod cr0 {
    pub const PE: u64 = 1 << 0;
    pub const MP: u64 = 1 << 1;
    pub const EM: u64 = 1 << 2;
    pub const TS: u64 = 1 << 3;
    pub const ET: u64 = 1 << 4;
    pub const NE: u64 = 1 << 5;
    pub const WP: u64 = 1 << 16;
    pub const AM: u64 = 1 << 18;
    pub const NW: u64 = 1 << 29;
    pub const CD: u64 = 1 << 30;
    pub const PG: u64 = 1 << 31;
}

pub mod cr4 {
    pub const VME: u64 = 1 << 0;
    pub const PVI: u64 = 1 << 1;
    pub const TSD: u64 = 1 << 2;
    pub const DE: u64 = 1 << 3;
    pub const PSE: u64 = 1 << 4;
    pub const PAE: u64 = 1 << 5;
    pub const MCE: u64 = 1 << 6;
    pub const PGE: u64 = 1 << 7;
    pub const PCE: u64 = 1 << 8;
    pub const OSFXSR: u64 = 1 << 9;
    pub const OSXMMEXCPT: u64 = 1 << 10;
    pub const VMXE: u64 = 1 << 13;
    pub const FSGSBASE: u64 = 1 << 16;
    pub const PCIDE: u64 = 1 << 17;
    pub const OSXSAVE: u64 = 1 << 18;
    pub const SMEP: u64 = 1 << 20;
    pub const SMAP: u64 = 1 << 21;
    pub const CET: u64 = 1 << 23;
    pub const PKS: u64 = 1 << 24;
}

pub mod efer {
    pub const SCE: u64 = 1 << 0;
    pub const LME: u64 = 1 << 8;
    pub const LMA: u64 = 1 << 10;
    pub const NXE: u64 = 1 << 11;
}

pub mod msr {
    pub const IA32_FEATURE_CONTROL: u32 = 0x0000_003A;
    pub const IA32_FS_BASE: u32 = 0xC000_0100;
    pub const IA32_GS_BASE: u32 = 0xC000_0101;

    pub const FEATURE_CONTROL_LOCK: u64 = 1 << 0;
    pub const FEATURE_CONTROL_VMX_OUTSIDE_SMX: u64 = 1 << 2;

    /// x2APIC MSR range 0x800..=0x8FF.
    #[inline]
    pub const fn is_x2apic(index: u32) -> bool {
        index >> 8 == 0x8
    }
}

/// Pending-debug-exception bit recorded when a data breakpoint trap is carried
/// across VM entry.
pub const DEBUG_TRAP_HIT: u32 = 1 << 12;
/// Single-step (BS) bit in DR6 / pending debug exceptions.
pub const DEBUG_TRAP_SINGLE_STEP: u32 = 1 << 14;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Segment {
    ES = 0,
    CS = 1,
    SS = 2,
    DS = 3,
    FS = 4,
    GS = 5,
}

impl Segment {
    pub const ALL: [Segment; 6] = [
        Segment::ES,
        Segment::CS,
        Segment::SS,
        Segment::DS,
        Segment::FS,
        Segment::GS,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Segment::ES => "ES",
            Segment::CS => "CS",
            Segment::SS => "SS",
            Segment::DS => "DS",
            Segment::FS => "FS",
            Segment::GS => "GS",
        }
    }
}

/// Access-rights bits in the VMX (unpacked) layout.
pub mod ar {
    pub const TYPE_MASK: u32 = 0xf;
    pub const S: u32 = 1 << 4;
    pub const DPL_SHIFT: u32 = 5;
    pub const P: u32 = 1 << 7;
    pub const AVL: u32 = 1 << 12;
    pub const L: u32 = 1 << 13;
    pub const DB: u32 = 1 << 14;
    pub const G: u32 = 1 << 15;
    pub const UNUSABLE: u32 = 1 << 16;

    pub const TYPE_DATA_RW_ACCESSED: u32 = 3;
    pub const TYPE_DATA_RW_EXPAND_DOWN_ACCESSED: u32 = 7;
    pub const TYPE_CODE_EXEC_ONLY_ACCESSED: u32 = 9;
    pub const TYPE_CODE_EXEC_READ_ACCESSED: u32 = 11;
    pub const TYPE_CODE_EXEC_ONLY_CONFORMING_ACCESSED: u32 = 13;
    pub const TYPE_CODE_EXEC_READ_CONFORMING_ACCESSED: u32 = 15;

    pub const TYPE_SYS_LDT: u32 = 2;
    pub const TYPE_SYS_BUSY_286_TSS: u32 = 3;
    pub const TYPE_SYS_BUSY_386_TSS: u32 = 11;
}

/// Hidden segment-register state, with access rights in the VMX layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SegmentCache {
    pub selector: u16,
    pub base: u64,
    /// Byte-granular (scaled) limit.
    pub limit: u32,
    /// Access rights (type, S, DPL, P, AVL, L, D/B, G and the unusable bit 16).
    pub ar: u32,
}

impl SegmentCache {
    /// Segment marked unusable, as after loading a null selector.
    pub const fn unusable(selector: u16) -> Self {
        Self {
            selector,
            base: 0,
            limit: 0,
            ar: ar::UNUSABLE,
        }
    }

    #[inline]
    pub const fn valid(&self) -> bool {
        self.ar & ar::UNUSABLE == 0
    }

    #[inline]
    pub const fn seg_type(&self) -> u32 {
        self.ar & ar::TYPE_MASK
    }

    /// Code/data (as opposed to system) descriptor.
    #[inline]
    pub const fn is_code_or_data(&self) -> bool {
        self.ar & ar::S != 0
    }

    #[inline]
    pub const fn dpl(&self) -> u8 {
        ((self.ar >> ar::DPL_SHIFT) & 3) as u8
    }

    #[inline]
    pub const fn present(&self) -> bool {
        self.ar & ar::P != 0
    }

    #[inline]
    pub const fn long(&self) -> bool {
        self.ar & ar::L != 0
    }

    #[inline]
    pub const fn default_big(&self) -> bool {
        self.ar & ar::DB != 0
    }

    #[inline]
    pub const fn rpl(&self) -> u8 {
        (self.selector & 3) as u8
    }

    /// Table indicator (LDT) bit of the selector.
    #[inline]
    pub const fn ti(&self) -> bool {
        self.selector & 4 != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DescriptorTable {
    pub base: u64,
    pub limit: u16,
}

/// Model-specific registers loaded/saved through dedicated VMCS fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmxMsrState {
    pub sysenter_cs: u32,
    pub sysenter_esp: u64,
    pub sysenter_eip: u64,
    pub pat: u64,
    pub debugctl: u64,
    /// IA32_S_CET.
    pub s_cet: u64,
    pub interrupt_ssp_table: u64,
    pub pkrs: u32,
    pub feature_control: u64,
    pub smbase: u32,
}

impl Default for VmxMsrState {
    fn default() -> Self {
        Self {
            sysenter_cs: 0,
            sysenter_esp: 0,
            sysenter_eip: 0,
            pat: 0x0007_0406_0007_0406,
            debugctl: 0,
            s_cet: 0,
            interrupt_ssp_table: 0,
            pkrs: 0,
            feature_control: 0,
            smbase: 0x30000,
        }
    }
}

/// Interrupt shadow after STI / MOV SS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Inhibit {
    #[default]
    None,
    /// Blocking by STI.
    Interrupts,
    /// Blocking by MOV SS / POP SS (also blocks debug traps).
    MovSs,
}

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ActivityState {
    #[default]
    Active = 0,
    Hlt = 1,
    Shutdown = 2,
    WaitForSipi = 3,
    /// MWAIT sleep; never stored in the VMCS.
    Mwait = 4,
}

impl ActivityState {
    /// Highest activity state encodable in the guest-state area.
    pub const LAST_VMX: u32 = 3;

    pub fn from_vmcs(value: u32) -> Option<Self> {
        Some(match value {
            0 => ActivityState::Active,
            1 => ActivityState::Hlt,
            2 => ActivityState::Shutdown,
            3 => ActivityState::WaitForSipi,
            _ => return None,
        })
    }
}

bitflags! {
    /// Asynchronous events tracked per logical processor.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
    pub struct CpuEvents: u32 {
        const NMI = 1 << 0;
        const INIT = 1 << 1;
        const SMI = 1 << 2;
        const VMX_VIRTUAL_NMI = 1 << 3;
        const VMX_MONITOR_TRAP_FLAG = 1 << 4;
        const VMX_INTERRUPT_WINDOW_EXITING = 1 << 5;
        const VMX_PREEMPTION_TIMER_EXPIRED = 1 << 6;
        const VMX_VTPR_UPDATE = 1 << 7;
        const VMX_VEOI_UPDATE = 1 << 8;
        const VMX_VIRTUAL_APIC_WRITE = 1 << 9;
        const PENDING_VMX_VIRTUAL_INTR = 1 << 10;
    }
}

/// Register file and per-processor flags consulted by VM entry/exit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmxCpu {
    /// RIP after the current instruction (the decoder has already advanced it).
    pub rip: u64,
    /// RIP of the instruction being executed.
    pub prev_rip: u64,
    pub rsp: u64,
    pub prev_rsp: u64,
    /// RSP was modified speculatively by the current instruction.
    pub speculative_rsp: bool,
    pub rflags: u64,

    pub cr0: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub efer: u64,
    pub dr6: u64,
    pub dr7: u64,

    pub segments: [SegmentCache; 6],
    pub ldtr: SegmentCache,
    pub tr: SegmentCache,
    pub gdtr: DescriptorTable,
    pub idtr: DescriptorTable,

    pub msr: VmxMsrState,
    /// Shadow-stack pointer.
    pub ssp: u64,
    pub prev_ssp: u64,
    /// PAE PDPTR cache used when EPT supplies the PDPTEs.
    pub pdptr: [u64; 4],

    pub inhibit: Inhibit,
    pub debug_trap: u32,
    pub activity: ActivityState,

    pub pending_events: CpuEvents,
    pub masked_events: CpuEvents,

    pub in_smm: bool,
    pub a20_enabled: bool,
    /// External-event flag for the interrupt collaborator (EXT bit of error codes).
    pub ext: bool,
    /// An event is being delivered; a VM exit in the middle of it records IDT-vectoring info.
    pub in_event: bool,
    pub tsc_offset: u64,
    pub monitor_armed: bool,
}

impl Default for VmxCpu {
    fn default() -> Self {
        let flat_data = SegmentCache {
            selector: 0,
            base: 0,
            limit: 0xFFFF,
            ar: ar::P | ar::S | ar::TYPE_DATA_RW_ACCESSED,
        };
        let mut segments = [flat_data; 6];
        segments[Segment::CS as usize].ar = ar::P | ar::S | ar::TYPE_CODE_EXEC_READ_ACCESSED;
        Self {
            rip: 0,
            prev_rip: 0,
            rsp: 0,
            prev_rsp: 0,
            speculative_rsp: false,
            rflags: FLAG_RESERVED1,
            cr0: cr0::ET,
            cr3: 0,
            cr4: 0,
            efer: 0,
            dr6: 0xFFFF_0FF0,
            dr7: 0x400,
            segments,
            ldtr: SegmentCache::unusable(0),
            tr: SegmentCache {
                selector: 0,
                base: 0,
                limit: 0xFFFF,
                ar: ar::P | ar::TYPE_SYS_BUSY_386_TSS,
            },
            gdtr: DescriptorTable { base: 0, limit: 0xFFFF },
            idtr: DescriptorTable { base: 0, limit: 0xFFFF },
            msr: VmxMsrState::default(),
            ssp: 0,
            prev_ssp: 0,
            pdptr: [0; 4],
            inhibit: Inhibit::None,
            debug_trap: 0,
            activity: ActivityState::Active,
            pending_events: CpuEvents::empty(),
            masked_events: CpuEvents::empty(),
            in_smm: false,
            a20_enabled: true,
            ext: false,
            in_event: false,
            tsc_offset: 0,
            monitor_armed: false,
        }
    }
}

impl VmxCpu {
    #[inline]
    pub fn segment(&self, seg: Segment) -> &SegmentCache {
        &self.segments[seg as usize]
    }

    #[inline]
    pub fn segment_mut(&mut self, seg: Segment) -> &mut SegmentCache {
        &mut self.segments[seg as usize]
    }

    #[inline]
    pub fn protected_mode(&self) -> bool {
        self.cr0 & cr0::PE != 0 && self.rflags & FLAG_VM == 0
    }

    #[inline]
    pub fn v8086_mode(&self) -> bool {
        self.cr0 & cr0::PE != 0 && self.rflags & FLAG_VM != 0
    }

    #[inline]
    pub fn long_mode(&self) -> bool {
        self.efer & efer::LMA != 0
    }

    /// 64-bit sub-mode of long mode.
    #[inline]
    pub fn long64_mode(&self) -> bool {
        self.long_mode() && self.segment(Segment::CS).long()
    }

    /// Compatibility sub-mode of long mode.
    #[inline]
    pub fn compat_mode(&self) -> bool {
        self.long_mode() && !self.segment(Segment::CS).long()
    }

    pub fn cpl(&self) -> u8 {
        if self.cr0 & cr0::PE == 0 {
            0
        } else if self.rflags & FLAG_VM != 0 {
            3
        } else {
            self.segment(Segment::CS).rpl()
        }
    }

    #[inline]
    pub fn signal_event(&mut self, events: CpuEvents) {
        self.pending_events |= events;
    }

    #[inline]
    pub fn clear_event(&mut self, events: CpuEvents) {
        self.pending_events &= !events;
    }

    #[inline]
    pub fn mask_event(&mut self, events: CpuEvents) {
        self.masked_events |= events;
    }

    #[inline]
    pub fn unmask_event(&mut self, events: CpuEvents) {
        self.masked_events &= !events;
    }

    #[inline]
    pub fn is_masked_event(&self, event: CpuEvents) -> bool {
        self.masked_events.contains(event)
    }

    #[inline]
    pub fn is_pending(&self, event: CpuEvents) -> bool {
        self.pending_events.contains(event)
    }

    /// Interrupts are blocked by STI or MOV SS.
    #[inline]
    pub fn interrupts_inhibited(&self) -> bool {
        self.inhibit != Inhibit::None
    }

    #[inline]
    pub fn set_flags_oszapc(&mut self, flags: u64) {
        self.rflags = (self.rflags & !FLAGS_OSZAPC) | (flags & FLAGS_OSZAPC);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpl_follows_operating_mode() {
        let mut cpu = VmxCpu::default();
        cpu.segment_mut(Segment::CS).selector = 0x1b;
        assert_eq!(cpu.cpl(), 0, "real mode is always CPL 0");

        cpu.cr0 |= cr0::PE;
        assert_eq!(cpu.cpl(), 3);

        cpu.segment_mut(Segment::CS).selector = 0x08;
        cpu.rflags |= FLAG_VM;
        assert_eq!(cpu.cpl(), 3, "virtual-8086 mode runs at CPL 3");
        assert!(cpu.v8086_mode());
        assert!(!cpu.protected_mode());
    }

    #[test]
    fn long_mode_submodes_follow_cs_l() {
        let mut cpu = VmxCpu::default();
        cpu.efer = efer::LME | efer::LMA;
        assert!(cpu.compat_mode());
        cpu.segment_mut(Segment::CS).ar |= ar::L;
        assert!(cpu.long64_mode());
        assert!(!cpu.compat_mode());
    }
}
