use thiserror::Error;

/// VM-instruction error numbers reported through VMfailValid.
///
/// The discriminant is the value stored in the VM-instruction error field.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum VmxInstructionError {
    #[error("VMCALL executed in VMX root operation")]
    VmcallInRoot = 1,
    #[error("VMCLEAR with invalid physical address")]
    VmclearInvalidAddress = 2,
    #[error("VMCLEAR with VMXON pointer")]
    VmclearVmxonPointer = 3,
    #[error("VMLAUNCH with non-clear VMCS")]
    VmlaunchNonClear = 4,
    #[error("VMRESUME with non-launched VMCS")]
    VmresumeNonLaunched = 5,
    #[error("VMRESUME after VMXOFF")]
    VmresumeCorrupted = 6,
    #[error("VM entry with invalid control field(s)")]
    InvalidControlField = 7,
    #[error("VM entry with invalid host-state field(s)")]
    InvalidHostStateField = 8,
    #[error("VMPTRLD with invalid physical address")]
    VmptrldInvalidAddress = 9,
    #[error("VMPTRLD with VMXON pointer")]
    VmptrldVmxonPointer = 10,
    #[error("VMPTRLD with incorrect VMCS revision identifier")]
    VmptrldBadRevision = 11,
    #[error("VMREAD/VMWRITE from/to unsupported VMCS component")]
    UnsupportedComponent = 12,
    #[error("VMWRITE to read-only VMCS component")]
    VmwriteReadOnly = 13,
    #[error("VMXON executed in VMX root operation")]
    VmxonInRoot = 15,
    #[error("VM entry with invalid executive-VMCS pointer")]
    InvalidExecutiveVmcs = 16,
    #[error("VM entry with non-launched executive VMCS")]
    NonLaunchedExecutiveVmcs = 17,
    #[error("VM entry with executive-VMCS pointer not VMXON pointer")]
    ExecutiveVmcsNotVmxon = 18,
    #[error("VMCALL with non-clear VMCS")]
    VmcallNonClear = 19,
    #[error("VMCALL with invalid VM-exit control fields")]
    VmcallInvalidExitControls = 20,
    #[error("VMCALL with incorrect MSEG revision identifier")]
    VmcallBadMsegRevision = 22,
    #[error("VMXOFF under dual-monitor treatment of SMIs and SMM")]
    VmxoffWithSmmMonitor = 23,
    #[error("VMCALL with invalid SMM-monitor features")]
    VmcallInvalidSmmFeatures = 24,
    #[error("VM entry with invalid VM-execution control fields in executive VMCS")]
    InvalidExecutiveControls = 25,
    #[error("VM entry with events blocked by MOV SS")]
    MovSsBlocking = 26,
    #[error("invalid operand to INVEPT/INVVPID")]
    InvalidInveptInvvpid = 28,
}

impl VmxInstructionError {
    #[inline]
    pub const fn code(self) -> u32 {
        self as u32
    }
}

/// Exit qualification of a VM exit caused by a guest-state entry failure.
#[repr(u64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum EntryFailureQualification {
    #[default]
    None = 0,
    PdptrLoading = 2,
    NmiBlockingEvents = 3,
    LinkPointer = 4,
}

impl EntryFailureQualification {
    #[inline]
    pub const fn value(self) -> u64 {
        self as u64
    }
}

/// VMX-abort indicator values written to the abort slot of the VMCS.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum VmAbortCode {
    #[error("failure saving guest MSRs")]
    SavingGuestMsrs = 0,
    #[error("host PDPTR corrupted")]
    HostPdptrCorrupted = 1,
    #[error("current VMCS corrupted")]
    VmcsCorrupted = 2,
    #[error("failure loading host MSRs")]
    LoadingHostMsrs = 3,
    #[error("machine check during VM exit")]
    MachineCheck = 4,
}

/// Internal emulator errors. These are never visible to the guest; the caller
/// is expected to stop emulation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FatalError {
    #[error("VMCS field {encoding:#010x} has no layout mapping")]
    UnmappedField { encoding: u32 },

    #[error("unsupported event injection type {ty}")]
    UnsupportedInjectionType { ty: u8 },

    #[error("VM entry to SMM is not implemented")]
    SmmEntryUnsupported,

    #[error("VM exit reason {reason} out of range")]
    ExitReasonOutOfRange { reason: u32 },

    #[error("VM exit requested outside VMX non-root operation")]
    ExitOutsideGuest,

    #[error("{register} = {value:#x} is invalid after VMX state load")]
    BrokenControlRegister { register: &'static str, value: u64 },
}

/// Guest-visible outcome of a VMX instruction that does not complete normally.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VmxFault {
    #[error("#UD")]
    InvalidOpcode,

    #[error("#GP(0)")]
    GeneralProtection,

    /// The processor hit a VMX abort and entered shutdown.
    #[error("VMX abort: {0}")]
    VmAbort(VmAbortCode),

    #[error(transparent)]
    Fatal(#[from] FatalError),
}

/// Failure of one stage of the VM-entry pipeline.
///
/// Control and host-state checks report [`VmEntryError::VmFail`] (VMfailValid),
/// while guest-state and MSR-load failures are reported with a synthetic VM
/// exit by the instruction front end.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VmEntryError {
    #[error("VM entry failed: {0}")]
    VmFail(VmxInstructionError),

    #[error("VM entry failed guest-state checks (qualification {0:?})")]
    GuestState(EntryFailureQualification),

    #[error("VM entry failed loading MSR area entry {index}")]
    MsrLoad { index: u32 },

    #[error(transparent)]
    Fatal(#[from] FatalError),
}

impl From<VmxInstructionError> for VmEntryError {
    fn from(err: VmxInstructionError) -> Self {
        VmEntryError::VmFail(err)
    }
}

/// Rejection of a capability profile or configuration file.
#[derive(Debug, Error)]
pub enum CapabilityError {
    #[error("VMX feature {feature} requires {requires}")]
    MissingDependency {
        feature: &'static str,
        requires: &'static str,
    },

    #[error("unknown VMX feature name {0:?}")]
    UnknownFeature(String),

    #[error("physical address width {0} out of range (32..=52)")]
    PhysicalAddressWidth(u8),

    #[error("linear address width {0} must be 48 or 57")]
    LinearAddressWidth(u8),

    #[error("invalid VMX configuration: {0}")]
    Json(#[from] serde_json::Error),
}
