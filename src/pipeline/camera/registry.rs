use std::{
    collections::HashSet,
    sync::{Arc, OnceLock},
};

use parking_lot::Mutex;

use crate::error::CaptureError;

/// Process-wide record of which capture devices are currently held.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    claimed: Mutex<HashSet<String>>,
}

impl DeviceRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn global() -> Arc<Self> {
        static GLOBAL: OnceLock<Arc<DeviceRegistry>> = OnceLock::new();
        GLOBAL.get_or_init(DeviceRegistry::new).clone()
    }

    /// Exclusive hold on `device` until the returned claim is dropped.
    pub fn claim(self: &Arc<Self>, device: &str) -> Result<DeviceClaim, CaptureError> {
        let mut claimed = self.claimed.lock();
        if !claimed.insert(device.to_string()) {
            return Err(CaptureError::DeviceUnavailable(format!(
                "{device} is held by another pipeline"
            )));
        }
        Ok(DeviceClaim {
            registry: Arc::clone(self),
            device: device.to_string(),
        })
    }

    pub fn is_claimed(&self, device: &str) -> bool {
        self.claimed.lock().contains(device)
    }
}

#[derive(Debug)]
pub struct DeviceClaim {
    registry: Arc<DeviceRegistry>,
    device: String,
}

impl Drop for DeviceClaim {
    fn drop(&mut self) {
        self.registry.claimed.lock().remove(&self.device);
        log::debug!("released claim on {}", self.device);
    }
}
