//! Device handles with lazily cached identity and capabilities

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

use crate::capability::CapabilityTree;
use crate::error::{RegistryError, Result};
use crate::registry::DeviceRegistry;
use crate::sdk::{DeviceInfo, DeviceProperty, NativeHandle, Sdk, SdkResult};

/// Suffix appended to labels of disconnected devices when presenting them
pub const DISCONNECTED_SUFFIX: &str = " (Disconnected)";

/// A value that is computed on demand and kept until invalidated
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cached<T> {
    Uncomputed,
    Cached(T),
}

impl<T> Default for Cached<T> {
    fn default() -> Self {
        Self::Uncomputed
    }
}

impl<T> Cached<T> {
    pub fn get(&self) -> Option<&T> {
        match self {
            Self::Cached(value) => Some(value),
            Self::Uncomputed => None,
        }
    }

    pub fn is_cached(&self) -> bool {
        matches!(self, Self::Cached(_))
    }

    pub fn set(&mut self, value: T) {
        *self = Self::Cached(value);
    }

    pub fn invalidate(&mut self) {
        *self = Self::Uncomputed;
    }
}

/// State of the native handle behind a device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NativeState {
    /// Opening failed when the device was first seen; retried on access
    Unopened,
    Open(NativeHandle),
}

/// Registry-owned state for one uri
#[derive(Debug, Clone)]
pub(crate) struct DeviceRecord {
    pub(crate) info: DeviceInfo,
    pub(crate) native: NativeState,
    pub(crate) serial: Cached<String>,
    pub(crate) capabilities: Cached<Arc<CapabilityTree>>,
    pub(crate) connected: bool,
    pub(crate) first_seen: DateTime<Utc>,
    pub(crate) last_seen: DateTime<Utc>,
    /// Registry generation of the last connectivity change; newest wins ties
    pub(crate) updated: u64,
    /// Bumped on every reopen; lazy results from an older epoch are discarded
    pub(crate) epoch: u64,
}

impl DeviceRecord {
    pub(crate) fn new(info: DeviceInfo, native: NativeState, generation: u64) -> Self {
        let now = Utc::now();
        Self {
            info,
            native,
            serial: Cached::Uncomputed,
            capabilities: Cached::Uncomputed,
            connected: true,
            first_seen: now,
            last_seen: now,
            updated: generation,
            epoch: 0,
        }
    }

    pub(crate) fn touch(&mut self, generation: u64) {
        self.updated = generation;
        self.last_seen = Utc::now();
    }

    /// Identity label used as the deduplication key
    ///
    /// Until the serial number is known the uri stands in for it, so a pending
    /// device never collides with a confirmed one.
    pub(crate) fn label(&self) -> String {
        match self.serial.get() {
            Some(serial) => format!("{} {} {}", self.info.vendor, self.info.name, serial),
            None => format!("{} {} [{}]", self.info.vendor, self.info.name, self.info.uri),
        }
    }

    pub(crate) fn display_label(&self) -> String {
        let mut label = self.label();
        if !self.connected {
            label.push_str(DISCONNECTED_SUFFIX);
        }
        label
    }
}

/// Read and decode the serial number property
pub(crate) fn read_serial_number(sdk: &dyn Sdk, handle: NativeHandle) -> SdkResult<String> {
    let raw = sdk.get_property(handle, DeviceProperty::SerialNumber)?;
    Ok(DeviceProperty::decode_string(&raw))
}

/// Serializable summary of a device
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceSnapshot {
    pub uri: String,
    pub vendor: String,
    pub name: String,
    pub serial_number: Option<String>,
    pub label: String,
    pub display_label: String,
    pub connected: bool,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// Handle to one uri tracked by a [`DeviceRegistry`]
///
/// Handles are cheap to clone. Every accessor goes through the registry lock;
/// native calls are made with the lock released.
#[derive(Clone)]
pub struct DeviceHandle {
    registry: Arc<DeviceRegistry>,
    uri: String,
}

impl DeviceHandle {
    pub(crate) fn new(registry: Arc<DeviceRegistry>, uri: impl Into<String>) -> Self {
        Self {
            registry,
            uri: uri.into(),
        }
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn vendor(&self) -> String {
        self.read(|r| r.info.vendor.clone()).unwrap_or_default()
    }

    pub fn name(&self) -> String {
        self.read(|r| r.info.name.clone()).unwrap_or_default()
    }

    pub fn connected(&self) -> bool {
        self.read(|r| r.connected).unwrap_or(false)
    }

    /// Identity label (vendor, name, serial) without connectivity
    pub fn label(&self) -> String {
        self.read(|r| r.label()).unwrap_or_default()
    }

    /// Label with a disconnected suffix for presentation
    pub fn display_label(&self) -> String {
        self.read(|r| r.display_label()).unwrap_or_default()
    }

    pub fn snapshot(&self) -> Option<DeviceSnapshot> {
        self.read(|r| DeviceSnapshot {
            uri: r.info.uri.clone(),
            vendor: r.info.vendor.clone(),
            name: r.info.name.clone(),
            serial_number: r.serial.get().cloned(),
            label: r.label(),
            display_label: r.display_label(),
            connected: r.connected,
            first_seen: r.first_seen,
            last_seen: r.last_seen,
        })
    }

    /// Serial number of the physical unit, read once and cached
    pub fn serial_number(&self) -> Result<String> {
        if let Some(serial) = self.read(|r| r.serial.get().cloned()).flatten() {
            return Ok(serial);
        }

        let (handle, epoch) = self.ensure_native()?;
        let serial = read_serial_number(self.registry.sdk(), handle)
            .map_err(|e| RegistryError::from_sdk(&self.uri, e))?;

        self.registry.with_state(|state| {
            if let Some(record) = state.get_mut(&self.uri) {
                if record.epoch == epoch {
                    record.serial.set(serial.clone());
                }
            }
        });
        debug!(uri = %self.uri, serial = %serial, "Read device serial number");
        Ok(serial)
    }

    /// Capability tree, built on first access and after every reopen
    pub fn capabilities(&self) -> Result<Arc<CapabilityTree>> {
        if let Some(tree) = self.read(|r| r.capabilities.get().cloned()).flatten() {
            return Ok(tree);
        }

        let (handle, epoch) = self.ensure_native()?;
        let tree = CapabilityTree::build(self.registry.sdk(), handle)
            .map(Arc::new)
            .map_err(|e| RegistryError::from_sdk(&self.uri, e))?;

        self.registry.with_state(|state| {
            if let Some(record) = state.get_mut(&self.uri) {
                if record.epoch == epoch {
                    record.capabilities.set(tree.clone());
                }
            }
        });
        debug!(uri = %self.uri, modes = tree.mode_count(), "Indexed device capabilities");
        Ok(tree)
    }

    /// Re-establish the native handle and recompute identity and capabilities
    ///
    /// Leaves the connected flag alone.
    pub fn reopen(&self) -> Result<()> {
        let native = self.read(|r| r.native).ok_or_else(|| self.untracked())?;
        let sdk = self.registry.sdk();

        let handle = match native {
            NativeState::Open(handle) => sdk.reopen(handle),
            NativeState::Unopened => sdk.open(&self.uri),
        }
        .map_err(|e| RegistryError::from_sdk(&self.uri, e))?;

        let epoch = self
            .registry
            .with_state(|state| {
                let generation = state.bump();
                state.get_mut(&self.uri).map(|record| {
                    record.native = NativeState::Open(handle);
                    record.epoch += 1;
                    record.serial.invalidate();
                    record.capabilities.invalidate();
                    record.touch(generation);
                    record.epoch
                })
            })
            .ok_or_else(|| self.untracked())?;

        let serial =
            read_serial_number(sdk, handle).map_err(|e| RegistryError::from_sdk(&self.uri, e))?;
        let tree = CapabilityTree::build(sdk, handle)
            .map(Arc::new)
            .map_err(|e| RegistryError::from_sdk(&self.uri, e))?;

        self.registry.with_state(|state| {
            if let Some(record) = state.get_mut(&self.uri) {
                if record.epoch == epoch {
                    record.serial.set(serial.clone());
                    record.capabilities.set(tree);
                }
            }
        });
        // The identity may have changed under the same uri
        self.registry.mark_stale();
        info!(uri = %self.uri, serial = %serial, "Reopened device");
        Ok(())
    }

    /// Current native handle, opening the device first if that was deferred
    fn ensure_native(&self) -> Result<(NativeHandle, u64)> {
        let (native, epoch) = self
            .read(|r| (r.native, r.epoch))
            .ok_or_else(|| self.untracked())?;

        match native {
            NativeState::Open(handle) => Ok((handle, epoch)),
            NativeState::Unopened => {
                let handle = self
                    .registry
                    .sdk()
                    .open(&self.uri)
                    .map_err(|e| RegistryError::from_sdk(&self.uri, e))?;
                // Another caller may have opened it meanwhile; keep theirs
                self.registry
                    .with_state(|state| {
                        state.get_mut(&self.uri).map(|record| match record.native {
                            NativeState::Open(existing) => (existing, record.epoch),
                            NativeState::Unopened => {
                                record.native = NativeState::Open(handle);
                                (handle, record.epoch)
                            }
                        })
                    })
                    .ok_or_else(|| self.untracked())
            }
        }
    }

    fn read<R>(&self, f: impl FnOnce(&DeviceRecord) -> R) -> Option<R> {
        self.registry
            .with_state(|state| state.get_mut(&self.uri).map(|record| f(record)))
    }

    fn untracked(&self) -> RegistryError {
        RegistryError::DeviceUnavailable {
            uri: self.uri.clone(),
            reason: "not tracked by this registry".to_string(),
        }
    }
}

impl fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceHandle").field("uri", &self.uri).finish()
    }
}

impl fmt::Display for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display_label())
    }
}
