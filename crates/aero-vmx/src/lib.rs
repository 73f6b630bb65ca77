//! Intel VMX (VT-x) control plane for the Aero x86 CPU model.
//!
//! This crate owns the root/non-root transition logic of a virtualization
//! capable processor:
//!
//! - VMCS field encoding, layout, and width-aware access ([`vmcs`], [`fields`])
//! - VM-entry checks of the execution/exit/entry controls ([`controls`]), the
//!   host-state area ([`host`]), and the guest-state area ([`guest`])
//! - event injection at the tail of a successful entry ([`inject`])
//! - the VM-exit save/restore pipeline ([`exit`])
//! - the VMX instruction surface (VMXON, VMLAUNCH, VMREAD, ...) ([`instructions`])
//!
//! The register file lives in [`state::VmxCpu`]; everything outside the CPU
//! (guest physical memory, the MSR bus, the local APIC, and interrupt
//! delivery) is reached through the collaborator traits in [`platform`].
//!
//! Validation is front-loaded: a VM entry reads and checks every control,
//! host-state and guest-state field into transient snapshots and only touches
//! the live register file once all of them passed.

#![forbid(unsafe_code)]

pub mod caps;
pub mod context;
pub mod controls;
pub mod error;
pub mod exit;
pub mod fields;
pub mod guest;
pub mod host;
pub mod inject;
pub mod instructions;
pub mod memory;
pub mod msr_area;
pub mod platform;
pub mod state;
pub mod vmcs;

pub use caps::{IsaFeatures, VmxCapabilities, VmxConfig, VmxFeatures, VmxProfile};
pub use context::{VmcsPointer, VmxContext, VmxMode};
pub use error::{
    CapabilityError, EntryFailureQualification, FatalError, VmAbortCode, VmEntryError,
    VmxFault, VmxInstructionError,
};
pub use exit::{ExitReason, VmExitInfo};
pub use instructions::{ExitOperand, OperandSize, VmxOutcome};
pub use memory::{FlatGuestMemory, PhysicalMemory};
pub use platform::{EventDelivery, LocalApic, MsrAccess, Platform, TlbFlush};
pub use state::VmxCpu;
pub use vmcs::{ArFormat, VmcsAccess, VmcsLayout};
