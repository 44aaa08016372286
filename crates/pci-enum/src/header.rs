use crate::access::ConfigAccess;
use crate::error::Result;
use crate::regs;
use crate::PciBdf;

/// Snapshot of the first 64 bytes (the standard header) of a function's config space.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ConfigHeader {
    dwords: [u32; 16],
}

impl ConfigHeader {
    pub fn read<C: ConfigAccess + ?Sized>(cfg: &mut C, bdf: PciBdf) -> Result<Self> {
        let mut dwords = [0u32; 16];
        for (index, dword) in dwords.iter_mut().enumerate() {
            *dword = cfg.read_u32(bdf, (index * 4) as u16)?;
        }
        Ok(Self { dwords })
    }

    pub fn from_dwords(dwords: [u32; 16]) -> Self {
        Self { dwords }
    }

    pub fn dwords(&self) -> &[u32; 16] {
        &self.dwords
    }

    pub fn u8_at(&self, offset: u16) -> u8 {
        let dword = self.dwords[usize::from(offset / 4) & 0xF];
        (dword >> ((offset % 4) * 8)) as u8
    }

    pub fn u16_at(&self, offset: u16) -> u16 {
        u16::from(self.u8_at(offset)) | (u16::from(self.u8_at(offset + 1)) << 8)
    }

    pub fn vendor_id(&self) -> u16 {
        self.u16_at(regs::VENDOR_ID)
    }

    pub fn device_id(&self) -> u16 {
        self.u16_at(regs::DEVICE_ID)
    }

    pub fn command(&self) -> u16 {
        self.u16_at(regs::COMMAND)
    }

    pub fn revision_id(&self) -> u8 {
        self.u8_at(regs::REVISION_ID)
    }

    pub fn prog_if(&self) -> u8 {
        self.u8_at(regs::PROG_IF)
    }

    pub fn subclass(&self) -> u8 {
        self.u8_at(regs::SUBCLASS)
    }

    pub fn class(&self) -> u8 {
        self.u8_at(regs::CLASS)
    }

    pub fn header_type(&self) -> u8 {
        self.u8_at(regs::HEADER_TYPE)
    }

    pub fn layout(&self) -> u8 {
        self.header_type() & regs::HEADER_LAYOUT_MASK
    }

    pub fn is_multi_function(&self) -> bool {
        self.header_type() & regs::HEADER_MULTI_FUNCTION != 0
    }

    pub fn secondary_bus(&self) -> u8 {
        self.u8_at(regs::SECONDARY_BUS)
    }

    pub fn subordinate_bus(&self) -> u8 {
        self.u8_at(regs::SUBORDINATE_BUS)
    }
}
