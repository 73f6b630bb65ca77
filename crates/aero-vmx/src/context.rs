//! Per-logical-processor VMX state.

use crate::caps::{VmxCapabilities, VmxConfig};
use crate::controls::VmcsCache;
use crate::error::CapabilityError;
use crate::memory::PhysicalMemory;
use crate::vmcs::{VmcsAccess, VmcsLayout};

/// Value VMPTRST stores when no VMCS is current.
pub const INVALID_VMCS_POINTER: u64 = u64::MAX;

/// The current-VMCS pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VmcsPointer {
    #[default]
    Invalid,
    Active(u64),
}

impl VmcsPointer {
    #[inline]
    pub fn address(self) -> Option<u64> {
        match self {
            VmcsPointer::Invalid => None,
            VmcsPointer::Active(addr) => Some(addr),
        }
    }

    /// Architectural encoding: all ones when no VMCS is current.
    #[inline]
    pub fn raw(self) -> u64 {
        self.address().unwrap_or(INVALID_VMCS_POINTER)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VmxMode {
    /// VMX operation disabled (before VMXON / after VMXOFF).
    #[default]
    Off,
    /// VMX root operation.
    Root,
    /// VMX non-root operation: a guest is running.
    NonRoot,
}

/// Everything VMX owns for one logical processor.
#[derive(Debug, Clone)]
pub struct VmxContext {
    pub mode: VmxMode,
    pub vmxon_ptr: u64,
    pub current: VmcsPointer,
    /// Decoded controls of the current VMCS. Valid while in non-root operation.
    pub cache: VmcsCache,
    pub layout: VmcsLayout,
    pub caps: VmxCapabilities,
}

impl VmxContext {
    pub fn new(caps: VmxCapabilities) -> Self {
        Self {
            mode: VmxMode::Off,
            vmxon_ptr: 0,
            current: VmcsPointer::Invalid,
            cache: VmcsCache::default(),
            layout: VmcsLayout::for_capabilities(&caps),
            caps,
        }
    }

    pub fn from_config(config: &VmxConfig) -> Result<Self, CapabilityError> {
        Ok(Self::new(config.build()?))
    }

    #[inline]
    pub fn in_vmx(&self) -> bool {
        self.mode != VmxMode::Off
    }

    #[inline]
    pub fn in_guest(&self) -> bool {
        self.mode == VmxMode::NonRoot
    }

    /// Accessor for the current VMCS, if any.
    pub fn current_vmcs<'a, M: PhysicalMemory + ?Sized>(
        &'a self,
        mem: &'a mut M,
    ) -> Option<VmcsAccess<'a, M>> {
        let base = self.current.address()?;
        Some(VmcsAccess::new(mem, &self.layout, base))
    }
}

impl Default for VmxContext {
    fn default() -> Self {
        Self::new(VmxCapabilities::default())
    }
}
