//! VMX capability reporting.
//!
//! Guest hypervisors discover what the virtual processor supports through the
//! IA32_VMX_* capability MSRs. Everything the VM-entry checks compare against
//! (allowed 0/1 settings of every control word, CR0/CR4 fixed bits, the
//! EPT/VPID capability word) is derived here from a profile plus a set of
//! named extensions, so tests and embedders can pin down an exact surface.
//!
//! As with CPUID, never advertise an extension the control plane does not
//! implement: a guest hypervisor that enables it will take paths we cannot
//! model.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::controls::{
    EntryControls, ExitControls, PinControls, ProcControls, SecondaryControls,
};
use crate::error::CapabilityError;
use crate::state::{cr0, cr4, efer};

bitflags! {
    /// Optional VMX extensions.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct VmxFeatures: u32 {
        const VIRTUAL_NMI = 1 << 0;
        const TPR_SHADOW = 1 << 1;
        const APIC_VIRTUALIZATION = 1 << 2;
        const EPT = 1 << 3;
        const VPID = 1 << 4;
        const UNRESTRICTED_GUEST = 1 << 5;
        const PREEMPTION_TIMER = 1 << 6;
        const PAT = 1 << 7;
        const EFER = 1 << 8;
        const VMCS_SHADOWING = 1 << 9;
        const PML = 1 << 10;
        const SPP = 1 << 11;
        const MBE = 1 << 12;
        const TSC_SCALING = 1 << 13;
        const EPTP_SWITCHING = 1 << 14;
        const EPT_ACCESS_DIRTY = 1 << 15;
        const MONITOR_TRAP_FLAG = 1 << 16;
        const SW_INTERRUPT_ILEN_0 = 1 << 17;
        const VIRTUAL_INTERRUPT_DELIVERY = 1 << 18;
        const PAUSE_LOOP_EXITING = 1 << 19;
        const EPT_EXCEPTION = 1 << 20;
        const DESCRIPTOR_TABLE_EXIT = 1 << 21;
        const X2APIC_VIRTUALIZATION = 1 << 22;
        const WBINVD_EXIT = 1 << 23;
    }
}

bitflags! {
    /// Non-VMX ISA extensions that change which VMX fields and controls exist.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct IsaFeatures: u32 {
        const LONG_MODE = 1 << 0;
        const NX = 1 << 1;
        const PCID = 1 << 2;
        const RDTSCP = 1 << 3;
        const INVPCID = 1 << 4;
        const RDRAND = 1 << 5;
        const RDSEED = 1 << 6;
        const MONITOR_MWAIT = 1 << 7;
        const XSAVES = 1 << 8;
        const CET = 1 << 9;
        const PKS = 1 << 10;
        const X2APIC = 1 << 11;
        const ONE_GB_PAGES = 1 << 12;
    }
}

/// Allowed settings of one 32-bit VMX control word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ControlMask {
    /// Bits that must be 1 (low half of the capability MSR).
    pub allowed0: u32,
    /// Bits that may be 1 (high half of the capability MSR).
    pub allowed1: u32,
}

impl ControlMask {
    pub const fn new(allowed0: u32, supported: u32) -> Self {
        Self {
            allowed0,
            allowed1: allowed0 | supported,
        }
    }

    #[inline]
    pub const fn accepts(self, value: u32) -> bool {
        (!value & self.allowed0) == 0 && (value & !self.allowed1) == 0
    }

    /// Capability MSR encoding: allowed-0 settings in bits 31:0, allowed-1 in 63:32.
    pub const fn msr_value(self) -> u64 {
        ((self.allowed1 as u64) << 32) | self.allowed0 as u64
    }
}

/// VMX capability policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmxProfile {
    /// First-generation VT-x: no EPT/VPID, legacy (non-TRUE) control masks.
    Basic,
    /// EPT, VPID, unrestricted guest and the usual server-class extensions.
    #[default]
    Ept,
    /// Every extension the control plane implements.
    Full,
}

impl VmxProfile {
    pub fn features(self) -> VmxFeatures {
        let basic = VmxFeatures::VIRTUAL_NMI
            | VmxFeatures::TPR_SHADOW
            | VmxFeatures::APIC_VIRTUALIZATION
            | VmxFeatures::MONITOR_TRAP_FLAG;
        match self {
            VmxProfile::Basic => basic,
            VmxProfile::Ept => {
                basic
                    | VmxFeatures::EPT
                    | VmxFeatures::VPID
                    | VmxFeatures::UNRESTRICTED_GUEST
                    | VmxFeatures::PREEMPTION_TIMER
                    | VmxFeatures::PAT
                    | VmxFeatures::EFER
                    | VmxFeatures::PAUSE_LOOP_EXITING
                    | VmxFeatures::DESCRIPTOR_TABLE_EXIT
                    | VmxFeatures::WBINVD_EXIT
            }
            VmxProfile::Full => VmxFeatures::all(),
        }
    }

    pub fn isa(self) -> IsaFeatures {
        let base = IsaFeatures::LONG_MODE | IsaFeatures::NX | IsaFeatures::RDTSCP;
        match self {
            VmxProfile::Basic => base,
            VmxProfile::Ept => base | IsaFeatures::PCID | IsaFeatures::INVPCID,
            VmxProfile::Full => IsaFeatures::all(),
        }
    }

    /// Whether entry checks use the TRUE_* capability MSRs (default1 bits may be 0).
    fn true_controls(self) -> bool {
        !matches!(self, VmxProfile::Basic)
    }
}

/// Debugging overrides applied on top of the profile's extension set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmxFeatureOverrides {
    pub force_enable: VmxFeatures,
    pub force_disable: VmxFeatures,
    pub isa_enable: IsaFeatures,
    pub isa_disable: IsaFeatures,
}

impl Default for VmxFeatureOverrides {
    fn default() -> Self {
        Self {
            force_enable: VmxFeatures::empty(),
            force_disable: VmxFeatures::empty(),
            isa_enable: IsaFeatures::empty(),
            isa_disable: IsaFeatures::empty(),
        }
    }
}

pub mod misc {
    pub const STORE_LMA_ON_EXIT: u32 = 1 << 5;
    pub const ACTIVITY_HLT: u32 = 1 << 6;
    pub const ACTIVITY_SHUTDOWN: u32 = 1 << 7;
    pub const ACTIVITY_WAIT_FOR_SIPI: u32 = 1 << 8;
    pub const CR3_TARGET_COUNT_SHIFT: u32 = 16;
    pub const VMWRITE_READ_ONLY_FIELDS: u32 = 1 << 29;
    pub const INJECT_SW_INTERRUPT_ILEN_0: u32 = 1 << 30;
}

pub mod ept_vpid {
    pub const EXECUTE_ONLY: u64 = 1 << 0;
    pub const WALK_LENGTH_4: u64 = 1 << 6;
    pub const MEMTYPE_UC: u64 = 1 << 8;
    pub const MEMTYPE_WB: u64 = 1 << 14;
    pub const LARGE_PAGE_2M: u64 = 1 << 16;
    pub const LARGE_PAGE_1G: u64 = 1 << 17;
    pub const INVEPT: u64 = 1 << 20;
    pub const ACCESS_DIRTY: u64 = 1 << 21;
    pub const SUPERVISOR_SHADOW_STACK: u64 = 1 << 23;
    pub const INVEPT_SINGLE_CONTEXT: u64 = 1 << 25;
    pub const INVEPT_ALL_CONTEXT: u64 = 1 << 26;
    pub const INVVPID: u64 = 1 << 32;
    pub const INVVPID_INDIVIDUAL_ADDRESS: u64 = 1 << 40;
    pub const INVVPID_SINGLE_CONTEXT: u64 = 1 << 41;
    pub const INVVPID_ALL_CONTEXT: u64 = 1 << 42;
    pub const INVVPID_SINGLE_CONTEXT_NON_GLOBAL: u64 = 1 << 43;
}

/// Maximum number of CR3-target values supported.
pub const CR3_TARGET_MAX: u32 = 4;

/// VM-function controls: EPTP switching.
pub const VMFUNC_EPTP_SWITCHING: u64 = 1 << 0;

/// The capability-register surface consulted by every VMX check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmxCapabilities {
    pub profile: VmxProfile,
    pub features: VmxFeatures,
    pub isa: IsaFeatures,
    pub pin: ControlMask,
    pub proc: ControlMask,
    pub secondary: ControlMask,
    pub exit: ControlMask,
    pub entry: ControlMask,
    pub cr0_fixed0: u64,
    pub cr0_fixed1: u64,
    pub cr4_fixed0: u64,
    pub cr4_fixed1: u64,
    /// EFER bits the CPU implements.
    pub efer_supported: u64,
    pub ept_vpid: u64,
    pub vmfunc: u64,
    pub misc: u32,
    pub physical_address_bits: u8,
    pub linear_address_bits: u8,
}

impl VmxCapabilities {
    pub fn from_profile(
        profile: VmxProfile,
        overrides: VmxFeatureOverrides,
    ) -> Result<Self, CapabilityError> {
        let features = profile
            .features()
            .union(overrides.force_enable)
            .difference(overrides.force_disable);
        let isa = profile
            .isa()
            .union(overrides.isa_enable)
            .difference(overrides.isa_disable);
        check_dependencies(features, isa)?;

        let has = |f: VmxFeatures| features.contains(f);
        let has_isa = |f: IsaFeatures| isa.contains(f);

        let mut ept_vpid = 0u64;
        if has(VmxFeatures::EPT) {
            ept_vpid = 0x0611_4141;
            if has_isa(IsaFeatures::ONE_GB_PAGES) {
                ept_vpid |= ept_vpid::LARGE_PAGE_1G;
            }
            if has(VmxFeatures::EPT_ACCESS_DIRTY) {
                ept_vpid |= ept_vpid::ACCESS_DIRTY;
            }
            if has_isa(IsaFeatures::CET) {
                ept_vpid |= ept_vpid::SUPERVISOR_SHADOW_STACK;
            }
        }
        if has(VmxFeatures::VPID) {
            ept_vpid |= 0x0f01 << 32;
        }

        let vmfunc = if has(VmxFeatures::EPTP_SWITCHING) {
            VMFUNC_EPTP_SWITCHING
        } else {
            0
        };

        let mut pin = PinControls::EXTERNAL_INTERRUPT_EXITING | PinControls::NMI_EXITING;
        if has(VmxFeatures::VIRTUAL_NMI) {
            pin |= PinControls::VIRTUAL_NMI;
        }
        if has(VmxFeatures::PREEMPTION_TIMER) {
            pin |= PinControls::PREEMPTION_TIMER;
        }

        let mut secondary = SecondaryControls::empty();
        let gated = [
            (has(VmxFeatures::APIC_VIRTUALIZATION), SecondaryControls::VIRTUALIZE_APIC_ACCESSES),
            (has(VmxFeatures::EPT), SecondaryControls::EPT),
            (has(VmxFeatures::DESCRIPTOR_TABLE_EXIT), SecondaryControls::DESCRIPTOR_TABLE_EXITING),
            (has_isa(IsaFeatures::RDTSCP), SecondaryControls::RDTSCP),
            (has(VmxFeatures::X2APIC_VIRTUALIZATION), SecondaryControls::VIRTUALIZE_X2APIC),
            (has(VmxFeatures::VPID), SecondaryControls::VPID),
            (has(VmxFeatures::WBINVD_EXIT), SecondaryControls::WBINVD_EXITING),
            (has(VmxFeatures::UNRESTRICTED_GUEST), SecondaryControls::UNRESTRICTED_GUEST),
            (
                has(VmxFeatures::VIRTUAL_INTERRUPT_DELIVERY),
                SecondaryControls::APIC_REGISTER_VIRTUALIZATION
                    | SecondaryControls::VIRTUAL_INTERRUPT_DELIVERY,
            ),
            (has(VmxFeatures::PAUSE_LOOP_EXITING), SecondaryControls::PAUSE_LOOP_EXITING),
            (has_isa(IsaFeatures::INVPCID), SecondaryControls::INVPCID),
            (has_isa(IsaFeatures::RDRAND), SecondaryControls::RDRAND_EXITING),
            (has(VmxFeatures::VMCS_SHADOWING), SecondaryControls::VMCS_SHADOWING),
            (has_isa(IsaFeatures::RDSEED), SecondaryControls::RDSEED_EXITING),
            (has(VmxFeatures::PML), SecondaryControls::PML),
            (has(VmxFeatures::EPT_EXCEPTION), SecondaryControls::EPT_VIOLATION_VE),
            (has_isa(IsaFeatures::XSAVES), SecondaryControls::XSAVES),
            (has(VmxFeatures::MBE), SecondaryControls::MODE_BASED_EXECUTE),
            (has(VmxFeatures::SPP), SecondaryControls::SUB_PAGE_WRITE_PROTECT),
            (has(VmxFeatures::TSC_SCALING), SecondaryControls::TSC_SCALING),
            (vmfunc != 0, SecondaryControls::VM_FUNCTIONS),
        ];
        for (enabled, bits) in gated {
            if enabled {
                secondary |= bits;
            }
        }

        let mut proc = ProcControls::INTERRUPT_WINDOW_EXITING
            | ProcControls::TSC_OFFSETTING
            | ProcControls::HLT_EXITING
            | ProcControls::INVLPG_EXITING
            | ProcControls::RDPMC_EXITING
            | ProcControls::RDTSC_EXITING
            | ProcControls::MOV_DR_EXITING
            | ProcControls::UNCONDITIONAL_IO_EXITING
            | ProcControls::IO_BITMAPS
            | ProcControls::MSR_BITMAPS
            | ProcControls::PAUSE_EXITING;
        if has_isa(IsaFeatures::MONITOR_MWAIT) {
            proc |= ProcControls::MWAIT_EXITING | ProcControls::MONITOR_EXITING;
        }
        if has(VmxFeatures::TPR_SHADOW) {
            proc |= ProcControls::TPR_SHADOW
                | ProcControls::CR8_LOAD_EXITING
                | ProcControls::CR8_STORE_EXITING;
        }
        if has(VmxFeatures::VIRTUAL_NMI) {
            proc |= ProcControls::NMI_WINDOW_EXITING;
        }
        if has(VmxFeatures::MONITOR_TRAP_FLAG) {
            proc |= ProcControls::MONITOR_TRAP_FLAG;
        }
        if has(VmxFeatures::EPT) {
            proc |= ProcControls::CR3_LOAD_EXITING | ProcControls::CR3_STORE_EXITING;
        }
        if !secondary.is_empty() {
            proc |= ProcControls::SECONDARY_CONTROLS;
        }

        let mut exit = ExitControls::ACK_INTERRUPT_ON_EXIT | ExitControls::SAVE_DEBUG_CONTROLS;
        let mut entry = EntryControls::LOAD_DEBUG_CONTROLS
            | EntryControls::ENTRY_TO_SMM
            | EntryControls::DEACTIVATE_DUAL_MONITOR;
        if has_isa(IsaFeatures::LONG_MODE) {
            exit |= ExitControls::HOST_ADDRESS_SPACE_SIZE;
            entry |= EntryControls::IA32E_MODE_GUEST;
        }
        if has(VmxFeatures::PAT) {
            exit |= ExitControls::SAVE_PAT | ExitControls::LOAD_PAT;
            entry |= EntryControls::LOAD_PAT;
        }
        if has(VmxFeatures::EFER) {
            exit |= ExitControls::SAVE_EFER | ExitControls::LOAD_EFER;
            entry |= EntryControls::LOAD_EFER;
        }
        if has(VmxFeatures::PREEMPTION_TIMER) {
            exit |= ExitControls::SAVE_PREEMPTION_TIMER;
        }
        if has_isa(IsaFeatures::CET) {
            exit |= ExitControls::LOAD_CET_STATE;
            entry |= EntryControls::LOAD_CET_STATE;
        }
        if has_isa(IsaFeatures::PKS) {
            exit |= ExitControls::LOAD_PKRS;
            entry |= EntryControls::LOAD_PKRS;
        }

        // Default1 bits; the TRUE_* variants relax some of them to allowed-0.
        const PIN_DEFAULT1: u32 = 0x0000_0016;
        const PROC_DEFAULT1: u32 = 0x0401_E172;
        const PROC_TRUE_DEFAULT1: u32 = 0x0400_6172;
        const EXIT_DEFAULT1: u32 = 0x0003_6DFF;
        const EXIT_TRUE_DEFAULT1: u32 = 0x0003_6DFB;
        const ENTRY_DEFAULT1: u32 = 0x0000_11FF;
        const ENTRY_TRUE_DEFAULT1: u32 = 0x0000_11FB;

        let relaxed = profile.true_controls();
        let required = |legacy: u32, true_bits: u32| if relaxed { true_bits } else { legacy };
        let mask = |legacy: u32, true_bits: u32, supported: u32| ControlMask {
            allowed0: required(legacy, true_bits),
            allowed1: legacy | supported,
        };

        let mut misc = misc::ACTIVITY_HLT
            | misc::ACTIVITY_SHUTDOWN
            | misc::ACTIVITY_WAIT_FOR_SIPI
            | (CR3_TARGET_MAX << misc::CR3_TARGET_COUNT_SHIFT);
        if relaxed {
            misc |= misc::STORE_LMA_ON_EXIT;
        }
        if has(VmxFeatures::VMCS_SHADOWING) {
            misc |= misc::VMWRITE_READ_ONLY_FIELDS;
        }
        if has(VmxFeatures::SW_INTERRUPT_ILEN_0) {
            misc |= misc::INJECT_SW_INTERRUPT_ILEN_0;
        }

        let mut cr4_fixed1 = cr4::VME
            | cr4::PVI
            | cr4::TSD
            | cr4::DE
            | cr4::PSE
            | cr4::PAE
            | cr4::MCE
            | cr4::PGE
            | cr4::PCE
            | cr4::OSFXSR
            | cr4::OSXMMEXCPT
            | cr4::VMXE
            | cr4::FSGSBASE
            | cr4::OSXSAVE
            | cr4::SMEP
            | cr4::SMAP;
        if has_isa(IsaFeatures::PCID) {
            cr4_fixed1 |= cr4::PCIDE;
        }
        if has_isa(IsaFeatures::CET) {
            cr4_fixed1 |= cr4::CET;
        }
        if has_isa(IsaFeatures::PKS) {
            cr4_fixed1 |= cr4::PKS;
        }

        let mut efer_supported = efer::SCE;
        if has_isa(IsaFeatures::NX) {
            efer_supported |= efer::NXE;
        }
        if has_isa(IsaFeatures::LONG_MODE) {
            efer_supported |= efer::LME | efer::LMA;
        }

        Ok(Self {
            profile,
            features,
            isa,
            pin: ControlMask::new(PIN_DEFAULT1, pin.bits()),
            proc: mask(PROC_DEFAULT1, PROC_TRUE_DEFAULT1, proc.bits()),
            secondary: ControlMask::new(0, secondary.bits()),
            exit: mask(EXIT_DEFAULT1, EXIT_TRUE_DEFAULT1, exit.bits()),
            entry: mask(ENTRY_DEFAULT1, ENTRY_TRUE_DEFAULT1, entry.bits()),
            cr0_fixed0: cr0::PE | cr0::NE | cr0::PG,
            cr0_fixed1: 0xFFFF_FFFF,
            cr4_fixed0: cr4::VMXE,
            cr4_fixed1,
            efer_supported,
            ept_vpid,
            vmfunc,
            misc,
            physical_address_bits: 40,
            linear_address_bits: 48,
        })
    }

    #[inline]
    pub fn supports(&self, feature: VmxFeatures) -> bool {
        self.features.contains(feature)
    }

    #[inline]
    pub fn has_isa(&self, feature: IsaFeatures) -> bool {
        self.isa.contains(feature)
    }

    #[inline]
    pub fn misc_has(&self, bit: u32) -> bool {
        self.misc & bit != 0
    }

    /// Whether `addr` fits in the implemented physical address width.
    #[inline]
    pub fn is_valid_phys_addr(&self, addr: u64) -> bool {
        addr >> self.physical_address_bits == 0
    }

    #[inline]
    pub fn is_valid_page_aligned_phys_addr(&self, addr: u64) -> bool {
        addr & 0xfff == 0 && self.is_valid_phys_addr(addr)
    }

    /// Bits of a paging-structure entry that are reserved above the physical address width.
    pub fn phys_addr_reserved_bits(&self) -> u64 {
        !((1u64 << self.physical_address_bits) - 1) & 0x000F_FFFF_FFFF_FFFF
    }

    #[inline]
    pub fn is_canonical(&self, addr: u64) -> bool {
        let shift = 64 - u32::from(self.linear_address_bits);
        (((addr << shift) as i64) >> shift) as u64 == addr
    }

    pub fn is_valid_eptp(&self, eptp: u64) -> bool {
        // Memory type: UC (0) or WB (6).
        let memtype = eptp & 7;
        if memtype != 0 && memtype != 6 {
            tracing::error!(eptp, "EPTP: invalid EPT memory type");
            return false;
        }
        if (eptp >> 3) & 7 != 3 {
            tracing::error!(eptp, "EPTP: unsupported page walk length");
            return false;
        }
        if eptp & 0x40 != 0 && self.ept_vpid & ept_vpid::ACCESS_DIRTY == 0 {
            tracing::error!(eptp, "EPTP: A/D bits enabled without support");
            return false;
        }
        if eptp & 0x80 != 0 && !self.has_isa(IsaFeatures::CET) {
            tracing::error!(eptp, "EPTP: supervisor shadow stack control without CET");
            return false;
        }
        if eptp & 0xf00 != 0 {
            tracing::error!(eptp, "EPTP: reserved bits set");
            return false;
        }
        if !self.is_valid_phys_addr(eptp) {
            tracing::error!(eptp, "EPTP: invalid physical address");
            return false;
        }
        true
    }

    pub fn cr3_target_count(&self) -> u32 {
        (self.misc >> misc::CR3_TARGET_COUNT_SHIFT) & 0x1ff
    }
}

impl Default for VmxCapabilities {
    fn default() -> Self {
        VmxCapabilities::from_profile(VmxProfile::default(), VmxFeatureOverrides::default())
            .expect("default VMX profile must be consistent")
    }
}

fn check_dependencies(features: VmxFeatures, isa: IsaFeatures) -> Result<(), CapabilityError> {
    const NEEDS_EPT: [(VmxFeatures, &str); 6] = [
        (VmxFeatures::UNRESTRICTED_GUEST, "UNRESTRICTED_GUEST"),
        (VmxFeatures::PML, "PML"),
        (VmxFeatures::SPP, "SPP"),
        (VmxFeatures::MBE, "MBE"),
        (VmxFeatures::EPTP_SWITCHING, "EPTP_SWITCHING"),
        (VmxFeatures::EPT_ACCESS_DIRTY, "EPT_ACCESS_DIRTY"),
    ];
    for (feature, name) in NEEDS_EPT {
        if features.contains(feature) && !features.contains(VmxFeatures::EPT) {
            return Err(CapabilityError::MissingDependency {
                feature: name,
                requires: "EPT",
            });
        }
    }

    const NEEDS_TPR_SHADOW: [(VmxFeatures, &str); 3] = [
        (VmxFeatures::APIC_VIRTUALIZATION, "APIC_VIRTUALIZATION"),
        (VmxFeatures::VIRTUAL_INTERRUPT_DELIVERY, "VIRTUAL_INTERRUPT_DELIVERY"),
        (VmxFeatures::X2APIC_VIRTUALIZATION, "X2APIC_VIRTUALIZATION"),
    ];
    for (feature, name) in NEEDS_TPR_SHADOW {
        if features.contains(feature) && !features.contains(VmxFeatures::TPR_SHADOW) {
            return Err(CapabilityError::MissingDependency {
                feature: name,
                requires: "TPR_SHADOW",
            });
        }
    }

    if features.contains(VmxFeatures::TPR_SHADOW) && !isa.contains(IsaFeatures::LONG_MODE) {
        return Err(CapabilityError::MissingDependency {
            feature: "TPR_SHADOW",
            requires: "LONG_MODE",
        });
    }
    if features.contains(VmxFeatures::EPT_EXCEPTION)
        && !features.contains(VmxFeatures::EPTP_SWITCHING)
    {
        return Err(CapabilityError::MissingDependency {
            feature: "EPT_EXCEPTION",
            requires: "EPTP_SWITCHING",
        });
    }
    Ok(())
}

/// Serializable VMX configuration, typically loaded from the machine config file.
///
/// ```json
/// { "profile": "ept", "enable": ["VMCS_SHADOWING"], "disable": ["VPID"] }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VmxConfig {
    pub profile: VmxProfile,
    /// Extra [`VmxFeatures`] names to enable.
    pub enable: Vec<String>,
    /// [`VmxFeatures`] names to disable.
    pub disable: Vec<String>,
    /// Extra [`IsaFeatures`] names to enable.
    pub isa_enable: Vec<String>,
    /// [`IsaFeatures`] names to disable.
    pub isa_disable: Vec<String>,
    pub physical_address_bits: u8,
    pub linear_address_bits: u8,
}

impl Default for VmxConfig {
    fn default() -> Self {
        Self {
            profile: VmxProfile::default(),
            enable: Vec::new(),
            disable: Vec::new(),
            isa_enable: Vec::new(),
            isa_disable: Vec::new(),
            physical_address_bits: 40,
            linear_address_bits: 48,
        }
    }
}

impl VmxConfig {
    pub fn from_json_str(json: &str) -> Result<Self, CapabilityError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn build(&self) -> Result<VmxCapabilities, CapabilityError> {
        if !(32..=52).contains(&self.physical_address_bits) {
            return Err(CapabilityError::PhysicalAddressWidth(self.physical_address_bits));
        }
        if !matches!(self.linear_address_bits, 48 | 57) {
            return Err(CapabilityError::LinearAddressWidth(self.linear_address_bits));
        }

        let overrides = VmxFeatureOverrides {
            force_enable: parse_names::<VmxFeatures>(&self.enable)?,
            force_disable: parse_names::<VmxFeatures>(&self.disable)?,
            isa_enable: parse_names::<IsaFeatures>(&self.isa_enable)?,
            isa_disable: parse_names::<IsaFeatures>(&self.isa_disable)?,
        };
        let mut caps = VmxCapabilities::from_profile(self.profile, overrides)?;
        caps.physical_address_bits = self.physical_address_bits;
        caps.linear_address_bits = self.linear_address_bits;
        tracing::debug!(
            profile = ?caps.profile,
            features = ?caps.features,
            "VMX capabilities configured"
        );
        Ok(caps)
    }
}

fn parse_names<F: bitflags::Flags>(names: &[String]) -> Result<F, CapabilityError> {
    let mut out = F::empty();
    for name in names {
        let flag = F::from_name(&name.to_ascii_uppercase())
            .ok_or_else(|| CapabilityError::UnknownFeature(name.clone()))?;
        out.insert(flag);
    }
    Ok(out)
}
