use pci_enum::{regs, AccessWidth, PciBdf, PciError};
use serde::{Deserialize, Serialize};

use crate::bus::SimSegment;
use crate::config::{SimBar, SimBridgeWindows, SimConfigSpace};

/// Which config accesses of a function fail.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultMode {
    #[default]
    None,
    /// Every read fails.
    Reads,
    /// Writes to BAR and expansion ROM registers fail, so the windows cannot be sized.
    BarProbe,
    /// Writes to the command register fail.
    CommandWrites,
}

/// One simulated function. A PCI-to-PCI bridge owns the segment behind it.
#[derive(Debug, Clone)]
pub struct SimFunction {
    config: SimConfigSpace,
    fault: FaultMode,
    secondary: Option<SimSegment>,
}

impl SimFunction {
    pub fn endpoint(vendor_id: u16, device_id: u16) -> Self {
        Self {
            config: SimConfigSpace::new(vendor_id, device_id),
            fault: FaultMode::None,
            secondary: None,
        }
    }

    pub fn bridge(vendor_id: u16, device_id: u16, windows: SimBridgeWindows) -> Self {
        let mut config = SimConfigSpace::new(vendor_id, device_id);
        config.make_bridge(windows);
        Self {
            config,
            fault: FaultMode::None,
            secondary: Some(SimSegment::new()),
        }
    }

    pub fn with_class(mut self, class: u8, subclass: u8) -> Self {
        self.config.set_class_code(class, subclass, 0);
        self
    }

    pub fn with_bar(mut self, index: u8, bar: SimBar) -> Self {
        self.config.set_bar(index, bar);
        self
    }

    pub fn with_rom(mut self, size: u64) -> Self {
        self.config.set_rom(size);
        self
    }

    pub fn with_fault(mut self, fault: FaultMode) -> Self {
        self.fault = fault;
        self
    }

    /// Places `function` on this bridge's secondary bus. Ignored for endpoints.
    pub fn with_child(mut self, device: u8, function_number: u8, function: SimFunction) -> Self {
        if let Some(segment) = self.secondary.as_mut() {
            segment.insert(device, function_number, function);
        }
        self
    }

    pub fn config(&self) -> &SimConfigSpace {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut SimConfigSpace {
        &mut self.config
    }

    pub fn fault(&self) -> FaultMode {
        self.fault
    }

    pub fn set_fault(&mut self, fault: FaultMode) {
        self.fault = fault;
    }

    pub fn secondary(&self) -> Option<&SimSegment> {
        self.secondary.as_ref()
    }

    pub fn secondary_mut(&mut self) -> Option<&mut SimSegment> {
        self.secondary.as_mut()
    }

    /// Bus range this function forwards to, once it has been numbered.
    pub(crate) fn forwarded_buses(&self) -> Option<(u8, u8)> {
        self.secondary.as_ref()?;
        let (_, secondary, subordinate) = self.config.bus_numbers();
        (secondary != 0 && secondary <= subordinate).then_some((secondary, subordinate))
    }

    pub(crate) fn read(
        &self,
        bdf: PciBdf,
        offset: u16,
        width: AccessWidth,
    ) -> Result<u32, PciError> {
        if self.fault == FaultMode::Reads {
            return Err(PciError::DeviceFault { bdf, offset });
        }
        Ok(self.config.read(offset, width))
    }

    pub(crate) fn write(
        &mut self,
        bdf: PciBdf,
        offset: u16,
        width: AccessWidth,
        value: u32,
    ) -> Result<(), PciError> {
        let fails = match self.fault {
            FaultMode::None | FaultMode::Reads => false,
            FaultMode::BarProbe => self.is_window_register(offset),
            FaultMode::CommandWrites => offset & !0x3 == regs::COMMAND,
        };
        if fails {
            return Err(PciError::DeviceFault { bdf, offset });
        }
        self.config.write(offset, width, value);
        Ok(())
    }

    fn is_window_register(&self, offset: u16) -> bool {
        let layout = self.config.layout();
        let bars_end = regs::bar_offset(regs::bar_count(layout));
        (regs::BAR0..bars_end).contains(&offset) || regs::rom_offset(layout) == Some(offset & !0x3)
    }
}
