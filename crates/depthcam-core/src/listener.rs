//! Hot-plug listener forwarding native callbacks into the registry

use std::sync::{Arc, Weak};
use tracing::{debug, warn};

use crate::registry::DeviceRegistry;
use crate::sdk::{DeviceInfo, DeviceListener};

/// Forwards each SDK connect/disconnect callback to one registry
///
/// Holds a weak reference so the SDK keeping its listener alive does not keep
/// the registry alive.
pub struct HotplugListener {
    registry: Weak<DeviceRegistry>,
}

impl HotplugListener {
    pub fn new(registry: &Arc<DeviceRegistry>) -> Self {
        Self {
            registry: Arc::downgrade(registry),
        }
    }

    /// Register a listener for `registry` with the registry's SDK
    pub fn install(registry: &Arc<DeviceRegistry>) {
        registry.sdk().set_listener(Arc::new(Self::new(registry)));
        debug!("Hot-plug listener installed");
    }
}

impl DeviceListener for HotplugListener {
    fn on_connected(&self, info: &DeviceInfo) {
        let Some(registry) = self.registry.upgrade() else {
            debug!(uri = %info.uri, "Registry dropped, ignoring connect");
            return;
        };
        if let Err(e) = registry.on_connected(info) {
            warn!(uri = %info.uri, error = %e, "Connect notification applied with errors");
        }
    }

    fn on_disconnected(&self, info: &DeviceInfo) {
        let Some(registry) = self.registry.upgrade() else {
            debug!(uri = %info.uri, "Registry dropped, ignoring disconnect");
            return;
        };
        registry.on_disconnected(info);
    }
}
