use ember_mmu::PageFault;
use thiserror::Error;

/// Architectural exceptions raised by the core and delivered to the guest.
///
/// Selector-style error codes are carried as raw 16-bit values; the EXT bit
/// is already folded in by whoever raised the exception.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Exception {
    DivideError,
    Debug,
    Breakpoint,
    Overflow,
    BoundRange,
    InvalidOpcode,
    DeviceNotAvailable,
    DoubleFault,
    InvalidTss(u16),
    SegmentNotPresent(u16),
    StackFault(u16),
    GeneralProtection(u16),
    PageFault { addr: u32, error_code: u32 },
}

impl Exception {
    pub fn vector(self) -> u8 {
        match self {
            Exception::DivideError => 0,
            Exception::Debug => 1,
            Exception::Breakpoint => 3,
            Exception::Overflow => 4,
            Exception::BoundRange => 5,
            Exception::InvalidOpcode => 6,
            Exception::DeviceNotAvailable => 7,
            Exception::DoubleFault => 8,
            Exception::InvalidTss(_) => 10,
            Exception::SegmentNotPresent(_) => 11,
            Exception::StackFault(_) => 12,
            Exception::GeneralProtection(_) => 13,
            Exception::PageFault { .. } => 14,
        }
    }

    /// Error code pushed by protected-mode delivery, if the vector has one.
    pub fn error_code(self) -> Option<u32> {
        match self {
            Exception::DoubleFault => Some(0),
            Exception::InvalidTss(code)
            | Exception::SegmentNotPresent(code)
            | Exception::StackFault(code)
            | Exception::GeneralProtection(code) => Some(u32::from(code)),
            Exception::PageFault { error_code, .. } => Some(error_code),
            _ => None,
        }
    }
}

impl From<PageFault> for Exception {
    fn from(pf: PageFault) -> Self {
        Exception::PageFault {
            addr: pf.addr,
            error_code: pf.error_code.bits(),
        }
    }
}

/// A bug in the core itself, never caused by guest behaviour.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InternalError {
    #[error("decoder produced an operand shape the {0} handler does not accept")]
    OperandShape(&'static str),
}

/// Why an instruction or event delivery did not complete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// Guest-visible exception; delivered through the IDT/IVT.
    Guest(Exception),
    /// Host-side bug; aborts the step.
    Internal(InternalError),
}

impl From<Exception> for Fault {
    fn from(e: Exception) -> Self {
        Fault::Guest(e)
    }
}

impl From<PageFault> for Fault {
    fn from(pf: PageFault) -> Self {
        Fault::Guest(pf.into())
    }
}

impl From<InternalError> for Fault {
    fn from(e: InternalError) -> Self {
        Fault::Internal(e)
    }
}

pub type CpuResult<T> = Result<T, Fault>;

#[cfg(test)]
mod tests {
    use super::*;
    use ember_mmu::PfErrorCode;

    #[test]
    fn vectors_and_error_codes() {
        assert_eq!(Exception::GeneralProtection(0x10).vector(), 13);
        assert_eq!(
            Exception::GeneralProtection(0x10).error_code(),
            Some(0x10)
        );
        assert_eq!(Exception::InvalidOpcode.error_code(), None);
        assert_eq!(Exception::DoubleFault.error_code(), Some(0));
    }

    #[test]
    fn page_fault_conversion_keeps_address_and_code() {
        let pf = PageFault {
            addr: 0xdead_b000,
            error_code: PfErrorCode::WRITE | PfErrorCode::USER,
        };
        assert_eq!(
            Exception::from(pf),
            Exception::PageFault {
                addr: 0xdead_b000,
                error_code: 0b110
            }
        );
    }
}
