//! Collaborators the VMX control plane drives but does not implement.

use crate::controls::VmcsCache;
use crate::memory::PhysicalMemory;
use crate::state::{ActivityState, VmxCpu};

/// MSR bus used by the VM-entry/VM-exit MSR areas.
pub trait MsrAccess {
    /// Returns `None` if the MSR does not exist (the access would #GP).
    fn rdmsr(&mut self, cpu: &VmxCpu, index: u32) -> Option<u64>;

    /// Returns `false` if the write would #GP.
    fn wrmsr(&mut self, cpu: &mut VmxCpu, index: u32, value: u64) -> bool;
}

/// Local-APIC services: the VMX-preemption timer and TPR virtualization.
pub trait LocalApic {
    fn arm_preemption_timer(&mut self, value: u32);
    fn disarm_preemption_timer(&mut self);
    /// Current timer value, saved on VM exit when requested.
    fn read_preemption_timer(&mut self) -> u32;

    /// TPR threshold / PPR virtualization after a successful entry with TPR shadow.
    fn virtualize_tpr(&mut self, cpu: &mut VmxCpu, cache: &VmcsCache);
}

/// Event taxonomy of the interruption-information fields (bits 10:8).
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    ExternalInterrupt = 0,
    Nmi = 2,
    HardwareException = 3,
    SoftwareInterrupt = 4,
    PrivilegedSoftwareException = 5,
    SoftwareException = 6,
    Other = 7,
}

impl EventType {
    pub fn from_bits(ty: u8) -> Option<Self> {
        Some(match ty {
            0 => EventType::ExternalInterrupt,
            2 => EventType::Nmi,
            3 => EventType::HardwareException,
            4 => EventType::SoftwareInterrupt,
            5 => EventType::PrivilegedSoftwareException,
            6 => EventType::SoftwareException,
            7 => EventType::Other,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlbFlush {
    All,
    /// Everything except global translations.
    NonGlobal,
}

/// Exception/interrupt delivery and the other side effects of the CPU core.
pub trait EventDelivery {
    /// Vector the event through the guest IDT.
    fn deliver_event(
        &mut self,
        cpu: &mut VmxCpu,
        vector: u8,
        ty: EventType,
        push_error: bool,
        error_code: u16,
    );

    /// Suspend the processor in a non-active activity state.
    fn enter_sleep_state(&mut self, cpu: &mut VmxCpu, state: ActivityState);

    fn flush_tlb(&mut self, scope: TlbFlush);

    /// Processor shutdown after a VMX abort.
    fn shutdown(&mut self, cpu: &mut VmxCpu);
}

/// Everything the control plane needs from the machine.
pub trait Platform: PhysicalMemory + MsrAccess + LocalApic + EventDelivery {}

impl<T> Platform for T where T: PhysicalMemory + MsrAccess + LocalApic + EventDelivery + ?Sized {}
