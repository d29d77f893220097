//! Platforms without a message queue to service.

use crate::bridge::BridgeFault;
use crate::pump::PumpHandles;

pub(super) struct PlatformPump;

impl PlatformPump {
    pub(super) fn create() -> Result<Self, BridgeFault> {
        Ok(Self)
    }

    pub(super) fn drain_once(&self) -> usize {
        0
    }

    pub(super) fn handles(&self) -> PumpHandles {
        PumpHandles::default()
    }
}
