//! Architectural exceptions and the fault record that carries them.

use core::fmt;

/// Architecturally defined x86 exception vectors.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Exception {
    DivideError = 0,                // #DE
    Debug = 1,                      // #DB
    NonMaskableInterrupt = 2,       // NMI
    Breakpoint = 3,                 // #BP
    Overflow = 4,                   // #OF
    BoundRangeExceeded = 5,         // #BR
    InvalidOpcode = 6,              // #UD
    DeviceNotAvailable = 7,         // #NM
    DoubleFault = 8,                // #DF
    CoprocessorSegmentOverrun = 9,
    InvalidTss = 10,                // #TS
    SegmentNotPresent = 11,         // #NP
    StackFault = 12,                // #SS
    GeneralProtection = 13,         // #GP
    PageFault = 14,                 // #PF
    X87Fpu = 16,                    // #MF
    AlignmentCheck = 17,            // #AC
    MachineCheck = 18,              // #MC
}

/// Double-fault classification (Intel SDM Vol. 3, table 6-4/6-5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionClass {
    Benign,
    Contributory,
    PageFault,
}

impl Exception {
    #[inline]
    pub const fn vector(self) -> u8 {
        self as u8
    }

    /// Whether the CPU pushes an error code for this exception.
    #[inline]
    pub const fn pushes_error_code(self) -> bool {
        matches!(
            self,
            Exception::DoubleFault
                | Exception::InvalidTss
                | Exception::SegmentNotPresent
                | Exception::StackFault
                | Exception::GeneralProtection
                | Exception::PageFault
                | Exception::AlignmentCheck
        )
    }

    #[inline]
    pub const fn class(self) -> ExceptionClass {
        match self {
            Exception::DivideError
            | Exception::InvalidTss
            | Exception::SegmentNotPresent
            | Exception::StackFault
            | Exception::GeneralProtection => ExceptionClass::Contributory,
            Exception::PageFault => ExceptionClass::PageFault,
            _ => ExceptionClass::Benign,
        }
    }
}

/// A faulting memory access or instruction, as latched into the abort record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fault {
    pub exception: Exception,
    /// Error code pushed on delivery (ignored for vectors that push none).
    pub error_code: u32,
    /// Faulting linear address for #PF (the CR2 value).
    pub cr2: Option<u32>,
}

impl Fault {
    #[inline]
    pub const fn new(exception: Exception) -> Self {
        Self {
            exception,
            error_code: 0,
            cr2: None,
        }
    }

    #[inline]
    pub const fn with_code(exception: Exception, error_code: u32) -> Self {
        Self {
            exception,
            error_code,
            cr2: None,
        }
    }

    #[inline]
    pub const fn gp0() -> Self {
        Self::with_code(Exception::GeneralProtection, 0)
    }

    /// #GP with a selector-derived error code (RPL bits cleared).
    #[inline]
    pub const fn gp(selector: u16) -> Self {
        Self::with_code(Exception::GeneralProtection, (selector & 0xfffc) as u32)
    }

    #[inline]
    pub const fn ss(selector: u16) -> Self {
        Self::with_code(Exception::StackFault, (selector & 0xfffc) as u32)
    }

    #[inline]
    pub const fn np(selector: u16) -> Self {
        Self::with_code(Exception::SegmentNotPresent, (selector & 0xfffc) as u32)
    }

    #[inline]
    pub const fn ts(selector: u16) -> Self {
        Self::with_code(Exception::InvalidTss, (selector & 0xfffc) as u32)
    }

    #[inline]
    pub const fn ud() -> Self {
        Self::new(Exception::InvalidOpcode)
    }

    #[inline]
    pub const fn nm() -> Self {
        Self::new(Exception::DeviceNotAvailable)
    }

    #[inline]
    pub const fn de() -> Self {
        Self::new(Exception::DivideError)
    }

    #[inline]
    pub const fn page_fault(addr: u32, error_code: u32) -> Self {
        Self {
            exception: Exception::PageFault,
            error_code,
            cr2: Some(addr),
        }
    }
}

impl From<Exception> for Fault {
    fn from(exception: Exception) -> Self {
        Fault::new(exception)
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.exception)?;
        if self.exception.pushes_error_code() {
            write!(f, "({:#x})", self.error_code)?;
        }
        if let Some(addr) = self.cr2 {
            write!(f, " at {addr:#010x}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_error_codes_drop_rpl() {
        assert_eq!(Fault::gp(0x2b).error_code, 0x28);
        assert_eq!(Fault::np(0x13).exception, Exception::SegmentNotPresent);
        assert_eq!(Fault::page_fault(0x1234, 6).to_string(), "PageFault(0x6) at 0x00001234");
    }

    #[test]
    fn classes() {
        assert_eq!(Exception::DivideError.class(), ExceptionClass::Contributory);
        assert_eq!(Exception::PageFault.class(), ExceptionClass::PageFault);
        assert_eq!(Exception::InvalidOpcode.class(), ExceptionClass::Benign);
        assert!(!Exception::InvalidOpcode.pushes_error_code());
    }
}
