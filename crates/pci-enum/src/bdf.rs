use core::fmt;
use core::str::FromStr;

use crate::error::PciError;

/// PCI bus/device/function identifier.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct PciBdf {
    pub bus: u8,
    pub device: u8,
    pub function: u8,
}

impl PciBdf {
    pub const MAX_DEVICE: u8 = 31;
    pub const MAX_FUNCTION: u8 = 7;

    /// Creates a new BDF.
    ///
    /// The caller is responsible for ensuring the values are within the PCI ranges:
    /// device < 32, function < 8. Config accessors reject out-of-range values.
    pub const fn new(bus: u8, device: u8, function: u8) -> Self {
        Self {
            bus,
            device,
            function,
        }
    }

    pub const fn is_valid(self) -> bool {
        self.device <= Self::MAX_DEVICE && self.function <= Self::MAX_FUNCTION
    }

    /// Packs this BDF using the standard config-address bit layout (bus in bits 15:8, device in
    /// bits 7:3, function in bits 2:0).
    pub const fn pack_u16(self) -> u16 {
        ((self.bus as u16) << 8)
            | (((self.device & 0x1f) as u16) << 3)
            | ((self.function & 0x7) as u16)
    }

    pub const fn unpack_u16(v: u16) -> Self {
        Self {
            bus: (v >> 8) as u8,
            device: ((v >> 3) & 0x1f) as u8,
            function: (v & 0x7) as u8,
        }
    }
}

impl From<PciBdf> for u16 {
    fn from(value: PciBdf) -> Self {
        value.pack_u16()
    }
}

impl From<u16> for PciBdf {
    fn from(value: u16) -> Self {
        Self::unpack_u16(value)
    }
}

impl fmt::Display for PciBdf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02x}:{:02x}.{}", self.bus, self.device, self.function)
    }
}

/// Parses `bus:device.function` in hex, as printed by [`fmt::Display`]. A leading segment
/// (`0000:`) is accepted and ignored.
impl FromStr for PciBdf {
    type Err = PciError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        const MALFORMED: PciError = PciError::InvalidRequest("malformed bus:device.function");
        let s = s.trim();
        let s = match s.matches(':').count() {
            2 => s.split_once(':').map_or(s, |(_, rest)| rest),
            _ => s,
        };
        let (bus, rest) = s.split_once(':').ok_or(MALFORMED)?;
        let (device, function) = rest.split_once('.').ok_or(MALFORMED)?;
        let bus = u8::from_str_radix(bus, 16).map_err(|_| MALFORMED)?;
        let device = u8::from_str_radix(device, 16).map_err(|_| MALFORMED)?;
        let function = u8::from_str_radix(function, 16).map_err(|_| MALFORMED)?;
        let bdf = Self::new(bus, device, function);
        if !bdf.is_valid() {
            return Err(PciError::InvalidRequest("device or function number out of range"));
        }
        Ok(bdf)
    }
}
