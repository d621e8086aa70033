use fluxpath_core::CoreError;
use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FluxError {
    #[error("Descriptor pool exhausted: {0}")]
    Exhausted(String),

    #[error("Cookie {0:#x} does not resolve to a descriptor")]
    InvalidCookie(u32),

    #[error("Cookie {0:#x} refers to a released descriptor")]
    StaleCookie(u32),

    #[error("DMA mapping failed")]
    DmaMap,

    #[error("Ring is full")]
    RingFull,

    #[error("Ring access failed: {0}")]
    RingAccess(&'static str),

    #[error("Outstanding descriptor ceiling reached")]
    AdmissionDenied,

    #[error("Vdev {0} is not attached")]
    VdevDown(u8),

    #[error("No TX bank profile available")]
    BankUnavailable,

    #[error("Descriptor table corruption: {0}")]
    Corruption(String),

    #[error("Datapath halted after a fatal error")]
    Halted,

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("IO Error: {0}")]
    Io(#[from] io::Error),
}

/// How the engines react to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retryable resource shortage; counted.
    Exhaustion,
    /// Bad entry or frame; dropped and counted.
    Integrity,
    /// Dropped by rule; counted.
    Policy,
    /// Flow-control signal; no data lost if honoured.
    Backpressure,
    /// Descriptor bookkeeping is broken. The device instance stops.
    Corruption,
    Config,
}

impl FluxError {
    pub fn class(&self) -> ErrorClass {
        match self {
            FluxError::Exhausted(_) | FluxError::DmaMap | FluxError::RingFull => {
                ErrorClass::Exhaustion
            }
            FluxError::InvalidCookie(_) | FluxError::StaleCookie(_) | FluxError::RingAccess(_) => {
                ErrorClass::Integrity
            }
            FluxError::VdevDown(_) => ErrorClass::Policy,
            FluxError::AdmissionDenied => ErrorClass::Backpressure,
            FluxError::BankUnavailable | FluxError::Corruption(_) | FluxError::Halted => {
                ErrorClass::Corruption
            }
            FluxError::InvalidConfiguration(_) | FluxError::Io(_) => ErrorClass::Config,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.class() == ErrorClass::Corruption
    }
}

impl From<CoreError> for FluxError {
    fn from(e: CoreError) -> Self {
        match e {
            CoreError::Exhausted(pool) => FluxError::Exhausted(pool),
            CoreError::InvalidCookie(c) => FluxError::InvalidCookie(c.raw()),
            CoreError::StaleCookie(c) => FluxError::StaleCookie(c.raw()),
            CoreError::DoubleRelease(c) => {
                FluxError::Corruption(format!("descriptor {:?} released twice", c))
            }
            CoreError::DmaMap(_) => FluxError::DmaMap,
            CoreError::RingFull => FluxError::RingFull,
            CoreError::RingAccess(what) => FluxError::RingAccess(what),
            CoreError::PageTableFull(n) => {
                FluxError::InvalidConfiguration(format!("page table cannot hold {} more pages", n))
            }
            CoreError::InvalidLayout(msg) => FluxError::InvalidConfiguration(msg),
            CoreError::Io(e) => FluxError::Io(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fluxpath_core::Cookie;

    #[test]
    fn test_error_taxonomy() {
        assert_eq!(FluxError::RingFull.class(), ErrorClass::Exhaustion);
        assert_eq!(FluxError::AdmissionDenied.class(), ErrorClass::Backpressure);
        assert!(FluxError::Corruption("x".into()).is_fatal());
        assert!(!FluxError::StaleCookie(1).is_fatal());

        let e: FluxError = CoreError::DoubleRelease(Cookie::new(1, 2)).into();
        assert!(e.is_fatal());
        let e: FluxError = CoreError::StaleCookie(Cookie::new(1, 2)).into();
        assert!(matches!(e, FluxError::StaleCookie(raw) if raw == (1 << 9) | 2));
    }
}
