//! Simulated sensor SDK for tests and development without hardware
//!
//! Devices are described by [`SimDevice`] fixtures (deserializable from TOML or
//! JSON). Attaching and detaching devices fires the installed listener the way
//! a native SDK delivers hot-plug callbacks, always outside the internal lock.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};

use crate::sdk::{
    DeviceInfo, DeviceListener, DeviceProperty, NativeHandle, Sdk, SdkError, SdkResult,
    SensorKind, VideoMode, PROPERTY_BUFFER_LEN,
};

/// One sensor of a simulated device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimSensor {
    pub kind: SensorKind,
    #[serde(default)]
    pub modes: Vec<VideoMode>,
}

/// A simulated physical device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimDevice {
    pub uri: String,
    #[serde(default = "default_vendor")]
    pub vendor: String,
    #[serde(default = "default_name")]
    pub name: String,
    pub serial: String,
    #[serde(default, rename = "sensor")]
    pub sensors: Vec<SimSensor>,
}

fn default_vendor() -> String {
    "PrimeSense".to_string()
}

fn default_name() -> String {
    "PS1080".to_string()
}

impl SimDevice {
    pub fn new(uri: impl Into<String>, serial: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            vendor: default_vendor(),
            name: default_name(),
            serial: serial.into(),
            sensors: Vec::new(),
        }
    }

    pub fn with_sensor(mut self, kind: SensorKind, modes: Vec<VideoMode>) -> Self {
        self.sensors.retain(|s| s.kind != kind);
        self.sensors.push(SimSensor { kind, modes });
        self
    }

    pub fn info(&self) -> DeviceInfo {
        DeviceInfo::new(&self.uri, &self.vendor, &self.name)
    }

    fn sensor(&self, kind: SensorKind) -> Option<&SimSensor> {
        self.sensors.iter().find(|s| s.kind == kind)
    }

    fn serial_property(&self) -> Vec<u8> {
        let mut raw = vec![0u8; PROPERTY_BUFFER_LEN];
        let bytes = self.serial.as_bytes();
        let len = bytes.len().min(PROPERTY_BUFFER_LEN - 1);
        raw[..len].copy_from_slice(&bytes[..len]);
        raw
    }
}

#[derive(Debug, Default)]
struct SimState {
    initialized: bool,
    /// Attached devices in attach order
    attached: Vec<SimDevice>,
    handles: HashMap<u64, String>,
    next_handle: u64,
    failing_reopens: HashSet<String>,
}

impl SimState {
    fn check_initialized(&self) -> SdkResult<()> {
        if self.initialized {
            Ok(())
        } else {
            Err(SdkError::Uninitialized)
        }
    }

    fn device(&self, uri: &str) -> Option<&SimDevice> {
        self.attached.iter().find(|d| d.uri == uri)
    }

    fn device_for(&self, handle: NativeHandle) -> SdkResult<&SimDevice> {
        self.check_initialized()?;
        let uri = self
            .handles
            .get(&handle.0)
            .ok_or_else(|| SdkError::Unavailable(format!("invalid handle {}", handle.0)))?;
        self.device(uri)
            .ok_or_else(|| SdkError::Unavailable(format!("no device attached at {}", uri)))
    }

    fn put(&mut self, device: SimDevice) {
        match self.attached.iter_mut().find(|d| d.uri == device.uri) {
            Some(existing) => *existing = device,
            None => self.attached.push(device),
        }
    }

    fn take(&mut self, uri: &str) -> Option<SimDevice> {
        let index = self.attached.iter().position(|d| d.uri == uri)?;
        Some(self.attached.remove(index))
    }
}

/// In-process [`Sdk`] implementation
#[derive(Default)]
pub struct SimulatedSdk {
    state: Mutex<SimState>,
    listener: Mutex<Option<Arc<dyn DeviceListener>>>,
}

impl SimulatedSdk {
    /// Simulator with `devices` attached; every call fails until initialized
    pub fn new(devices: Vec<SimDevice>) -> Self {
        let sdk = Self::default();
        sdk.with_state(|state| {
            for device in devices {
                state.put(device);
            }
        });
        sdk
    }

    /// Simulator that needs no library directory
    pub fn initialized(devices: Vec<SimDevice>) -> Self {
        let sdk = Self::new(devices);
        sdk.with_state(|state| state.initialized = true);
        sdk
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut SimState) -> R) -> R {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut state)
    }

    fn current_listener(&self) -> Option<Arc<dyn DeviceListener>> {
        self.listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Attach a device without notifying the listener
    pub fn attach_silently(&self, device: SimDevice) {
        self.with_state(|state| state.put(device));
    }

    /// Plug a device in and fire the connect callback
    pub fn attach(&self, device: SimDevice) {
        let info = device.info();
        self.attach_silently(device);
        debug!(uri = %info.uri, "Simulated device attached");
        if let Some(listener) = self.current_listener() {
            listener.on_connected(&info);
        }
    }

    /// Unplug a device and fire the disconnect callback
    pub fn detach(&self, uri: &str) -> bool {
        let Some(device) = self.with_state(|state| state.take(uri)) else {
            return false;
        };
        debug!(uri = %uri, "Simulated device detached");
        if let Some(listener) = self.current_listener() {
            listener.on_disconnected(&device.info());
        }
        true
    }

    /// Move a device to a new uri, announcing only the new connection
    ///
    /// Models an OS-level reconnect where the old uri's disconnect has not
    /// been delivered yet.
    pub fn reassign_uri(&self, old_uri: &str, new_uri: &str) -> bool {
        let Some(mut device) = self.with_state(|state| state.take(old_uri)) else {
            return false;
        };
        device.uri = new_uri.to_string();
        self.attach(device);
        true
    }

    /// Replace the modes a sensor reports
    pub fn update_sensor(&self, uri: &str, kind: SensorKind, modes: Vec<VideoMode>) -> bool {
        self.with_state(|state| match state.attached.iter_mut().find(|d| d.uri == uri) {
            Some(device) => {
                device.sensors.retain(|s| s.kind != kind);
                device.sensors.push(SimSensor { kind, modes });
                true
            }
            None => false,
        })
    }

    /// Make the next reopen of `uri` fail
    pub fn fail_next_reopen(&self, uri: &str) {
        self.with_state(|state| state.failing_reopens.insert(uri.to_string()));
    }

    pub fn attached_uris(&self) -> Vec<String> {
        self.with_state(|state| state.attached.iter().map(|d| d.uri.clone()).collect())
    }
}

impl Sdk for SimulatedSdk {
    fn initialize(&self, library_dir: &Path) -> SdkResult<()> {
        if !library_dir.is_dir() {
            warn!(path = %library_dir.display(), "SDK library directory not found");
            return Err(SdkError::Uninitialized);
        }
        self.with_state(|state| state.initialized = true);
        info!(path = %library_dir.display(), "Simulated SDK initialized");
        Ok(())
    }

    fn enumerate(&self) -> SdkResult<Vec<DeviceInfo>> {
        self.with_state(|state| {
            state.check_initialized()?;
            Ok(state.attached.iter().map(SimDevice::info).collect())
        })
    }

    fn open(&self, uri: &str) -> SdkResult<NativeHandle> {
        self.with_state(|state| {
            state.check_initialized()?;
            if state.device(uri).is_none() {
                return Err(SdkError::Unavailable(format!("no device attached at {}", uri)));
            }
            state.next_handle += 1;
            let handle = state.next_handle;
            state.handles.insert(handle, uri.to_string());
            Ok(NativeHandle(handle))
        })
    }

    fn reopen(&self, handle: NativeHandle) -> SdkResult<NativeHandle> {
        self.with_state(|state| {
            state.check_initialized()?;
            let uri = state
                .handles
                .get(&handle.0)
                .cloned()
                .ok_or_else(|| SdkError::Unavailable(format!("invalid handle {}", handle.0)))?;
            if state.failing_reopens.remove(&uri) {
                return Err(SdkError::Unavailable(format!("reopen of {} failed", uri)));
            }
            if state.device(&uri).is_none() {
                return Err(SdkError::Unavailable(format!("no device attached at {}", uri)));
            }
            Ok(handle)
        })
    }

    fn get_property(&self, handle: NativeHandle, property: DeviceProperty) -> SdkResult<Vec<u8>> {
        self.with_state(|state| {
            let device = state.device_for(handle)?;
            match property {
                DeviceProperty::SerialNumber => Ok(device.serial_property()),
            }
        })
    }

    fn has_sensor(&self, handle: NativeHandle, kind: SensorKind) -> SdkResult<bool> {
        self.with_state(|state| Ok(state.device_for(handle)?.sensor(kind).is_some()))
    }

    fn video_modes(&self, handle: NativeHandle, kind: SensorKind) -> SdkResult<Vec<VideoMode>> {
        self.with_state(|state| {
            Ok(state
                .device_for(handle)?
                .sensor(kind)
                .map(|s| s.modes.clone())
                .unwrap_or_default())
        })
    }

    fn set_listener(&self, listener: Arc<dyn DeviceListener>) {
        *self.listener.lock().unwrap_or_else(PoisonError::into_inner) = Some(listener);
    }
}
