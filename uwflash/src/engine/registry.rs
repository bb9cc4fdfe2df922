//! Flash devices and sector layout declared by the upgrade file.

use crate::{
    error::{Error, Result},
    image::uwf::{RegisterDevice, SectorGroup, SelectDevice},
};

/// A contiguous run of equally sized sectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectorMapEntry {
    /// Absolute address of the first sector.
    pub offset: u32,
    /// Number of sectors.
    pub sector_count: u32,
    /// Size of each sector.
    pub sector_size: u32,
    /// `sector_count * sector_size`.
    pub total_size: u32,
}

impl SectorMapEntry {
    /// Whether `address` lies in this run.
    pub fn contains(&self, address: u32) -> bool {
        address >= self.offset && u64::from(address) < u64::from(self.offset) + u64::from(self.total_size)
    }
}

/// Registered devices, the active selection and the sector map.
#[derive(Debug, Clone, Default)]
pub struct DeviceRegistry {
    devices: Vec<RegisterDevice>,
    active: usize,
    active_bank: u8,
    sector_map: Vec<SectorMapEntry>,
}

impl DeviceRegistry {
    /// Add a device; the first one registered becomes active.
    pub fn register(&mut self, device: RegisterDevice) {
        if self
            .devices
            .is_empty()
        {
            self.active = 0;
            self.active_bank = 0;
        }
        self.devices
            .push(device);
    }

    /// Make the device with handle `flash_id` active.
    pub fn select(&mut self, select: SelectDevice) -> Result<()> {
        let index = self
            .devices
            .iter()
            .position(|d| d.handle == select.flash_id)
            .ok_or_else(|| {
                Error::ReturnCodeError(format!(
                    "select of unregistered flash device {}",
                    select.flash_id
                ))
            })?;
        self.active = index;
        self.active_bank = select.bank_id;
        Ok(())
    }

    /// Remove the device with `handle`; unknown handles are ignored.
    pub fn unregister(&mut self, handle: u8) {
        if let Some(index) = self
            .devices
            .iter()
            .position(|d| d.handle == handle)
        {
            self.devices
                .remove(index);
            if self.active >= index && self.active > 0 {
                self.active -= 1;
            }
        }
    }

    /// Append the groups of one sector map command.
    ///
    /// The first group starts at the active device's base address and every
    /// later group follows the previous one.
    pub fn add_sector_map(&mut self, groups: &[SectorGroup]) -> Result<()> {
        let base = self.base_address()?;
        for (i, group) in groups
            .iter()
            .enumerate()
        {
            let offset = match (i, self.sector_map.last()) {
                (0, _) | (_, None) => base,
                (_, Some(prev)) => prev
                    .offset
                    .wrapping_add(prev.total_size),
            };
            self.sector_map
                .push(SectorMapEntry {
                    offset,
                    sector_count: group.sector_count,
                    sector_size: group.sector_size,
                    total_size: group
                        .sector_count
                        .wrapping_mul(group.sector_size),
                });
        }
        Ok(())
    }

    /// Base address of the active device.
    pub fn base_address(&self) -> Result<u32> {
        self.devices
            .get(self.active)
            .map(|d| d.base_address)
            .ok_or_else(|| Error::ReturnCodeError("no flash device registered".to_string()))
    }

    /// First sector map entry containing `address`.
    pub fn sector_at(&self, address: u32) -> Option<&SectorMapEntry> {
        self.sector_map
            .iter()
            .find(|e| e.contains(address))
    }

    /// Sector map entries in declaration order.
    pub fn sector_map(&self) -> &[SectorMapEntry] {
        &self.sector_map
    }

    /// Bank selected with the active device.
    pub fn active_bank(&self) -> u8 {
        self.active_bank
    }

    /// Number of registered devices.
    pub fn len(&self) -> usize {
        self.devices
            .len()
    }

    /// Whether no device is registered.
    pub fn is_empty(&self) -> bool {
        self.devices
            .is_empty()
    }
}
