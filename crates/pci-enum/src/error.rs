use thiserror::Error;

use crate::pool::ResourceClass;
use crate::PciBdf;

pub type Result<T> = std::result::Result<T, PciError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PciError {
    /// Malformed width/offset/alignment arguments or an unknown phase value.
    #[error("invalid request: {0}")]
    InvalidRequest(&'static str),

    #[error("unsupported: {0}")]
    Unsupported(&'static str),

    #[error("no free {class} space for {length:#x} bytes (alignment mask {alignment:#x})")]
    Exhausted {
        class: ResourceClass,
        length: u64,
        alignment: u64,
    },

    #[error("{0} not found")]
    NotFound(&'static str),

    /// A register access did not behave as the protocol expects.
    #[error("device fault at {bdf} (config offset {offset:#04x})")]
    DeviceFault { bdf: PciBdf, offset: u16 },

    /// A phase call was made out of the required order.
    #[error("not ready: {0}")]
    NotReady(&'static str),
}

/// The amount granted for a request that may be only partially satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Grant<T> {
    Full(T),
    Partial { granted: T, requested: T },
}

impl<T: Copy> Grant<T> {
    pub fn granted(&self) -> T {
        match *self {
            Self::Full(granted) | Self::Partial { granted, .. } => granted,
        }
    }

    pub fn is_full(&self) -> bool {
        matches!(self, Self::Full(_))
    }
}
