//! Event injection as the final step of a successful VM entry.

use crate::caps::{VmxCapabilities, VmxFeatures};
use crate::controls::{PinControls, VmcsCache};
use crate::error::FatalError;
use crate::platform::{EventDelivery, EventType};
use crate::state::{CpuEvents, VmxCpu};

/// Bits of the VM-entry / IDT-vectoring interruption-information fields.
pub mod interruption {
    pub const VECTOR_MASK: u32 = 0xff;
    pub const TYPE_SHIFT: u32 = 8;
    pub const TYPE_MASK: u32 = 7;
    pub const DELIVER_ERROR_CODE: u32 = 1 << 11;
    pub const NMI_UNBLOCKING_IRET: u32 = 1 << 12;
    /// Bits 30:12 must be zero in the VM-entry field.
    pub const RESERVED: u32 = 0x7fff_f000;
    pub const VALID: u32 = 1 << 31;

    /// Raw event type 7 ("other event"): with vector 0, a pending MTF VM exit.
    pub const TYPE_OTHER: u8 = 7;
}

/// Exceptions that push an error code in protected mode.
pub(crate) const fn exception_has_error_code(vector: u8) -> bool {
    matches!(vector, 8 | 10 | 11 | 12 | 13 | 14 | 17 | 21)
}

/// The VM-entry event descriptor: interruption information, error code and
/// instruction length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EventInjection {
    pub info: u32,
    pub error_code: u32,
    pub instruction_length: u32,
}

impl EventInjection {
    #[inline]
    pub const fn is_valid(&self) -> bool {
        self.info & interruption::VALID != 0
    }

    #[inline]
    pub const fn vector(&self) -> u8 {
        (self.info & interruption::VECTOR_MASK) as u8
    }

    /// Raw type field (bits 10:8).
    #[inline]
    pub const fn event_type(&self) -> u8 {
        ((self.info >> interruption::TYPE_SHIFT) & interruption::TYPE_MASK) as u8
    }

    #[inline]
    pub const fn delivers_error_code(&self) -> bool {
        self.info & interruption::DELIVER_ERROR_CODE != 0
    }
}

/// Delivers the event described by `cache.event`, if any.
///
/// The control checks have already validated the descriptor; a type that
/// reaches here without a delivery path is an internal error.
pub fn inject_event<P: EventDelivery + ?Sized>(
    cpu: &mut VmxCpu,
    cache: &mut VmcsCache,
    caps: &VmxCapabilities,
    platform: &mut P,
) -> Result<(), FatalError> {
    let event = cache.event;
    if !event.is_valid() {
        return Ok(());
    }

    let ty = event.event_type();
    let vector = event.vector();

    if ty == interruption::TYPE_OTHER {
        if caps.supports(VmxFeatures::MONITOR_TRAP_FLAG) {
            tracing::trace!("VM entry: injecting pending MTF VM exit");
            cpu.signal_event(CpuEvents::VMX_MONITOR_TRAP_FLAG);
            return Ok(());
        }
        return Err(FatalError::UnsupportedInjectionType { ty });
    }

    let kind = EventType::from_bits(ty).ok_or(FatalError::UnsupportedInjectionType { ty })?;
    let mut is_int = false;
    match kind {
        EventType::ExternalInterrupt | EventType::HardwareException => cpu.ext = true,
        EventType::Nmi => {
            if cache.pin.contains(PinControls::VIRTUAL_NMI) {
                cpu.mask_event(CpuEvents::VMX_VIRTUAL_NMI);
            } else {
                cpu.mask_event(CpuEvents::NMI);
            }
            cpu.ext = true;
        }
        EventType::PrivilegedSoftwareException => {
            cpu.ext = true;
            is_int = true;
        }
        EventType::SoftwareInterrupt | EventType::SoftwareException => is_int = true,
        EventType::Other => return Err(FatalError::UnsupportedInjectionType { ty }),
    }

    // Software events are delivered with the return address past the instruction.
    if is_int {
        cpu.rip = cpu.rip.wrapping_add(u64::from(event.instruction_length));
    }

    let push_error = event.delivers_error_code();
    let error_code = if push_error { event.error_code } else { 0 };

    cache.idt_vector_info = event.info & !interruption::VALID;
    cache.idt_vector_error_code = error_code;

    tracing::debug!(vector, ty, push_error, error_code, "VM entry: injecting event");
    platform.deliver_event(cpu, vector, kind, push_error, error_code as u16);
    cpu.ext = false;
    Ok(())
}
