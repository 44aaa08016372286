use pci_enum::access::{CONFIG_ADDRESS_PORT, CONFIG_DATA_PORT};
use pci_enum::{AccessWidth, ConfigAccess, PciBdf, PortIo};
use tracing::warn;

use crate::bus::SimBus;

const ENABLE: u32 = 0x8000_0000;

/// The `0xCF8`/`0xCFC` port pair in front of a [`SimBus`], for driving
/// [`pci_enum::Mechanism1`] end to end.
#[derive(Debug, Default)]
pub struct SimPorts {
    bus: SimBus,
    address: u32,
}

impl SimPorts {
    pub fn new(bus: SimBus) -> Self {
        Self { bus, address: 0 }
    }

    pub fn bus(&self) -> &SimBus {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut SimBus {
        &mut self.bus
    }

    /// The latched `0xCF8` value.
    pub fn address(&self) -> u32 {
        self.address
    }

    fn target(&self, port: u16) -> Option<(PciBdf, u16)> {
        if self.address & ENABLE == 0 {
            return None;
        }
        let bdf = PciBdf::new(
            ((self.address >> 16) & 0xFF) as u8,
            ((self.address >> 11) & 0x1F) as u8,
            ((self.address >> 8) & 0x07) as u8,
        );
        let offset = (self.address & 0xFC) as u16 + (port - CONFIG_DATA_PORT);
        Some((bdf, offset))
    }
}

impl PortIo for SimPorts {
    fn read(&mut self, port: u16, width: AccessWidth) -> u32 {
        match port {
            CONFIG_ADDRESS_PORT => self.address & width.mask(),
            p if (CONFIG_DATA_PORT..CONFIG_DATA_PORT + 4).contains(&p) => {
                let Some((bdf, offset)) = self.target(port) else {
                    return width.mask();
                };
                match self.bus.read(bdf, offset, width) {
                    Ok(value) => value,
                    Err(err) => {
                        // The port has no error channel; a failed cycle reads as all-ones.
                        warn!(bdf = %bdf, offset, error = %err, "config read through port failed");
                        width.mask()
                    }
                }
            }
            _ => width.mask(),
        }
    }

    fn write(&mut self, port: u16, width: AccessWidth, value: u32) {
        match port {
            CONFIG_ADDRESS_PORT => {
                self.address = (self.address & !width.mask()) | (value & width.mask());
            }
            p if (CONFIG_DATA_PORT..CONFIG_DATA_PORT + 4).contains(&p) => {
                let Some((bdf, offset)) = self.target(port) else {
                    return;
                };
                if let Err(err) = self.bus.write(bdf, offset, width, value) {
                    warn!(bdf = %bdf, offset, error = %err, "config write through port failed");
                }
            }
            _ => {}
        }
    }
}
