use crate::chip::{ChipRegistry, DeviceAddress};
use crate::error::{DriverError, Result};
use crate::pcm::StreamStatus;

/// Stream status of the device at `address`, if it is bound.
pub fn get_status(registry: &ChipRegistry, address: DeviceAddress) -> Option<StreamStatus> {
    registry.lookup(address).map(|chip| chip.pcm().status())
}

/// Card name and stream status of every bound device.
pub fn list_status(registry: &ChipRegistry) -> Vec<(String, StreamStatus)> {
    registry
        .chips()
        .into_iter()
        .map(|chip| (chip.longname().to_string(), chip.pcm().status()))
        .collect()
}

/// Force the device at `address` to stop streaming, as a disconnect would.
pub fn abort(registry: &ChipRegistry, address: DeviceAddress) -> Result<()> {
    let chip = registry.lookup(address).ok_or(DriverError::NoDevice)?;
    chip.abort();
    Ok(())
}
