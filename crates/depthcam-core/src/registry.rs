//! Device registry keyed by uri, with a deduplicated label view
//!
//! Entries are created once per uri and never removed: a disconnect only flips
//! the connected flag, and a reconnect on the same uri updates the entry in
//! place. The label view is rebuilt from scratch on every call.

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::device::{DeviceHandle, DeviceRecord, NativeState};
use crate::error::{RegistryError, Result};
use crate::listener::HotplugListener;
use crate::sdk::{DeviceInfo, Sdk, SdkError};

/// Registry change notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    /// A uri was seen for the first time
    DeviceAdded(String),
    /// A hot-plug connect was applied
    DeviceConnected(String),
    /// A hot-plug disconnect was applied
    DeviceDisconnected(String),
    /// A reconnected device could not be reopened
    ReopenFailed { uri: String, reason: String },
    /// Enumeration completed
    Refreshed { added: usize, total: usize },
}

/// Mutable registry state, guarded by a single lock
#[derive(Debug, Default)]
pub(crate) struct RegistryState {
    by_uri: HashMap<String, DeviceRecord>,
    stale: bool,
    generation: u64,
}

impl RegistryState {
    pub(crate) fn get_mut(&mut self, uri: &str) -> Option<&mut DeviceRecord> {
        self.by_uri.get_mut(uri)
    }

    /// Next update generation
    pub(crate) fn bump(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }

    fn insert_new(&mut self, info: DeviceInfo, native: NativeState) -> bool {
        if self.by_uri.contains_key(&info.uri) {
            return false;
        }
        let generation = self.bump();
        self.by_uri
            .insert(info.uri.clone(), DeviceRecord::new(info, native, generation));
        true
    }
}

/// Two connected handles resolved to the same identity label
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IdentityConflict {
    pub label: String,
    /// Uris sharing the label; the last one is the handle that was kept
    pub uris: Vec<String>,
}

/// Deduplicated devices ordered by label
#[derive(Debug, Clone, Default)]
pub struct LabelView {
    entries: BTreeMap<String, DeviceHandle>,
    conflicts: Vec<IdentityConflict>,
}

impl LabelView {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, label: &str) -> Option<&DeviceHandle> {
        self.entries.get(label)
    }

    pub fn labels(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &DeviceHandle)> + '_ {
        self.entries.iter().map(|(label, handle)| (label.as_str(), handle))
    }

    pub fn conflicts(&self) -> &[IdentityConflict] {
        &self.conflicts
    }
}

#[derive(Debug, Clone)]
struct Candidate {
    label: String,
    uri: String,
    connected: bool,
    updated: u64,
}

impl Candidate {
    /// Connected beats disconnected, then the most recently updated wins
    fn rank(&self) -> (bool, u64) {
        (self.connected, self.updated)
    }
}

/// Pick one candidate per label and report labels claimed by several connected uris
fn dedup_by_label(candidates: Vec<Candidate>) -> (BTreeMap<String, Candidate>, Vec<IdentityConflict>) {
    let mut groups: BTreeMap<String, Vec<Candidate>> = BTreeMap::new();
    for candidate in candidates {
        groups.entry(candidate.label.clone()).or_default().push(candidate);
    }

    let mut winners = BTreeMap::new();
    let mut conflicts = Vec::new();

    for (label, mut group) in groups {
        group.sort_by_key(Candidate::rank);

        let connected: Vec<String> = group
            .iter()
            .filter(|c| c.connected)
            .map(|c| c.uri.clone())
            .collect();
        if connected.len() > 1 {
            warn!(label = %label, uris = ?connected, "Several connected devices share one identity");
            conflicts.push(IdentityConflict {
                label: label.clone(),
                uris: connected,
            });
        }

        if let Some(winner) = group.pop() {
            winners.insert(label, winner);
        }
    }

    (winners, conflicts)
}

/// Authoritative collection of device handles
pub struct DeviceRegistry {
    sdk: Arc<dyn Sdk>,
    state: Mutex<RegistryState>,
    event_tx: broadcast::Sender<RegistryEvent>,
}

impl DeviceRegistry {
    /// Create an empty registry without touching the SDK
    pub fn new(sdk: Arc<dyn Sdk>) -> Arc<Self> {
        let (event_tx, _) = broadcast::channel(100);
        Arc::new(Self {
            sdk,
            state: Mutex::new(RegistryState::default()),
            event_tx,
        })
    }

    /// Create a registry, enumerate devices and start listening for hot-plug events
    pub fn open(sdk: Arc<dyn Sdk>) -> Result<Arc<Self>> {
        let registry = Self::new(sdk);
        registry.refresh()?;
        HotplugListener::install(&registry);
        Ok(registry)
    }

    pub(crate) fn sdk(&self) -> &dyn Sdk {
        self.sdk.as_ref()
    }

    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&mut RegistryState) -> R) -> R {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut state)
    }

    /// Subscribe to registry events
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.event_tx.subscribe()
    }

    /// Enumerate attached devices and track uris not seen before
    ///
    /// Enumeration is additive: known uris keep the connectivity state
    /// established by hot-plug events. Returns the number of new uris.
    pub fn refresh(&self) -> Result<usize> {
        let infos = self
            .sdk
            .enumerate()
            .map_err(|e| RegistryError::from_sdk("enumeration", e))?;

        let unseen: Vec<DeviceInfo> = self.with_state(|state| {
            let mut unseen: Vec<DeviceInfo> = Vec::new();
            for info in infos {
                if !state.by_uri.contains_key(&info.uri) && !unseen.iter().any(|u| u.uri == info.uri) {
                    unseen.push(info);
                }
            }
            unseen
        });

        let mut opened = Vec::with_capacity(unseen.len());
        for info in unseen {
            let native = match self.sdk.open(&info.uri) {
                Ok(handle) => NativeState::Open(handle),
                Err(SdkError::Uninitialized) => return Err(RegistryError::SdkUninitialized),
                Err(e) => {
                    warn!(uri = %info.uri, error = %e, "Could not open enumerated device, deferring");
                    NativeState::Unopened
                }
            };
            opened.push((info, native));
        }

        let (added, total) = self.with_state(|state| {
            let mut added = Vec::new();
            for (info, native) in opened {
                let uri = info.uri.clone();
                if state.insert_new(info, native) {
                    added.push(uri);
                }
            }
            state.stale = true;
            (added, state.by_uri.len())
        });

        for uri in &added {
            debug!(uri = %uri, "Tracking new device");
            let _ = self.event_tx.send(RegistryEvent::DeviceAdded(uri.clone()));
        }
        let _ = self.event_tx.send(RegistryEvent::Refreshed {
            added: added.len(),
            total,
        });

        info!("Refresh complete: {} new devices, {} total tracked", added.len(), total);
        Ok(added.len())
    }

    /// Apply a hot-plug connect notification
    ///
    /// A known uri is marked connected and reopened; an unknown uri gets a new
    /// handle. The device stays connected in the registry even if reopening
    /// fails; the failure is returned to the caller.
    pub fn on_connected(self: &Arc<Self>, info: &DeviceInfo) -> Result<DeviceHandle> {
        let known = self.with_state(|state| {
            state.stale = true;
            let generation = state.bump();
            match state.get_mut(&info.uri) {
                Some(record) => {
                    record.connected = true;
                    record.touch(generation);
                    true
                }
                None => false,
            }
        });

        let handle = DeviceHandle::new(self.clone(), info.uri.clone());

        if known {
            let _ = self
                .event_tx
                .send(RegistryEvent::DeviceConnected(info.uri.clone()));
            if let Err(e) = handle.reopen() {
                warn!(uri = %info.uri, error = %e, "Reconnected device could not be reopened");
                let _ = self.event_tx.send(RegistryEvent::ReopenFailed {
                    uri: info.uri.clone(),
                    reason: e.to_string(),
                });
                return Err(e);
            }
            info!(uri = %info.uri, device = %handle.label(), "Device connected");
            return Ok(handle);
        }

        let (native, open_error) = match self.sdk.open(&info.uri) {
            Ok(native) => (NativeState::Open(native), None),
            Err(e) => (NativeState::Unopened, Some(RegistryError::from_sdk(&info.uri, e))),
        };

        let inserted = self.with_state(|state| {
            state.stale = true;
            if state.insert_new(info.clone(), native) {
                return true;
            }
            // Registered concurrently by a refresh; treat as a reconnect
            let generation = state.bump();
            if let Some(record) = state.get_mut(&info.uri) {
                record.connected = true;
                record.touch(generation);
                if record.native == NativeState::Unopened {
                    record.native = native;
                }
            }
            false
        });

        if inserted {
            let _ = self.event_tx.send(RegistryEvent::DeviceAdded(info.uri.clone()));
        }
        let _ = self
            .event_tx
            .send(RegistryEvent::DeviceConnected(info.uri.clone()));

        match open_error {
            Some(e) => {
                warn!(uri = %info.uri, error = %e, "New device connected but could not be opened");
                Err(e)
            }
            None => {
                info!(uri = %info.uri, vendor = %info.vendor, name = %info.name, "Device connected");
                Ok(handle)
            }
        }
    }

    /// Apply a hot-plug disconnect notification
    ///
    /// Unknown uris are ignored. Returns whether the uri was known.
    pub fn on_disconnected(&self, info: &DeviceInfo) -> bool {
        let label = self.with_state(|state| {
            state.stale = true;
            let generation = state.bump();
            state.get_mut(&info.uri).map(|record| {
                record.connected = false;
                record.touch(generation);
                record.label()
            })
        });

        match label {
            Some(label) => {
                info!(uri = %info.uri, device = %label, "Device disconnected");
                let _ = self
                    .event_tx
                    .send(RegistryEvent::DeviceDisconnected(info.uri.clone()));
                true
            }
            None => {
                debug!(uri = %info.uri, "Ignoring disconnect for unknown device");
                false
            }
        }
    }

    /// Devices keyed by identity label, one handle per label, sorted by label
    ///
    /// Connected devices whose serial number is still unknown are read first,
    /// so that a device seen under a new uri collapses onto its old entry.
    pub fn label_view(self: &Arc<Self>) -> LabelView {
        let pending: Vec<String> = self.with_state(|state| {
            state
                .by_uri
                .iter()
                .filter(|(_, record)| record.connected && !record.serial.is_cached())
                .map(|(uri, _)| uri.clone())
                .collect()
        });

        for uri in pending {
            if let Err(e) = DeviceHandle::new(self.clone(), uri.clone()).serial_number() {
                debug!(uri = %uri, error = %e, "Serial number not available yet");
            }
        }

        let candidates: Vec<Candidate> = self.with_state(|state| {
            state
                .by_uri
                .iter()
                .map(|(uri, record)| Candidate {
                    label: record.label(),
                    uri: uri.clone(),
                    connected: record.connected,
                    updated: record.updated,
                })
                .collect()
        });

        let (winners, conflicts) = dedup_by_label(candidates);
        let entries = winners
            .into_iter()
            .map(|(label, candidate)| (label, DeviceHandle::new(self.clone(), candidate.uri)))
            .collect();

        LabelView { entries, conflicts }
    }

    /// Handle for a tracked uri
    pub fn get(self: &Arc<Self>, uri: &str) -> Option<DeviceHandle> {
        let known = self.with_state(|state| state.by_uri.contains_key(uri));
        known.then(|| DeviceHandle::new(self.clone(), uri))
    }

    /// Every uri ever tracked, sorted
    pub fn uris(&self) -> Vec<String> {
        let mut uris: Vec<String> = self.with_state(|state| state.by_uri.keys().cloned().collect());
        uris.sort();
        uris
    }

    pub fn len(&self) -> usize {
        self.with_state(|state| state.by_uri.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn mark_stale(&self) {
        self.with_state(|state| state.stale = true);
    }

    /// Whether derived views need rebuilding
    pub fn is_stale(&self) -> bool {
        self.with_state(|state| state.stale)
    }

    /// Read and clear the stale flag
    pub fn take_stale(&self) -> bool {
        self.with_state(|state| std::mem::take(&mut state.stale))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sdk::{PixelFormat, SensorKind, VideoMode};
    use crate::sim::{SimDevice, SimulatedSdk};
    use std::thread;

    fn info(uri: &str) -> DeviceInfo {
        DeviceInfo::new(uri, "PrimeSense", "PS1080")
    }

    fn candidate(label: &str, uri: &str, connected: bool, updated: u64) -> Candidate {
        Candidate {
            label: label.to_string(),
            uri: uri.to_string(),
            connected,
            updated,
        }
    }

    fn color_camera(uri: &str, serial: &str) -> SimDevice {
        SimDevice::new(uri, serial).with_sensor(
            SensorKind::Color,
            vec![VideoMode::new(30, 640, 480, PixelFormat::RGB888)],
        )
    }

    #[test]
    fn test_dedup_prefers_connected() {
        let (winners, conflicts) = dedup_by_label(vec![
            candidate("A", "usb:1", true, 1),
            candidate("A", "usb:0", false, 5),
        ]);
        assert_eq!(winners["A"].uri, "usb:1");
        assert!(conflicts.is_empty());
    }

    #[test]
    fn test_dedup_connected_tie_newest_wins() {
        let (winners, conflicts) = dedup_by_label(vec![
            candidate("A", "usb:0", true, 9),
            candidate("A", "usb:1", true, 3),
            candidate("B", "usb:2", false, 1),
        ]);
        assert_eq!(winners["A"].uri, "usb:0");
        assert_eq!(winners["B"].uri, "usb:2");
        assert_eq!(
            conflicts,
            vec![IdentityConflict {
                label: "A".to_string(),
                uris: vec!["usb:1".to_string(), "usb:0".to_string()],
            }]
        );
    }

    #[test]
    fn test_scenario_single_device() {
        let sdk = Arc::new(SimulatedSdk::initialized(vec![color_camera("usb:0", "ABC123")]));
        let registry = DeviceRegistry::open(sdk).unwrap();

        let view = registry.label_view();
        assert_eq!(view.len(), 1);
        let (label, handle) = view.iter().next().unwrap();
        assert!(label.contains("ABC123"));

        let tree = handle.capabilities().unwrap();
        assert_eq!(tree.format_labels("Color", "30 fps", "640 x 480").len(), 1);
    }

    #[test]
    fn test_scenario_disconnect_keeps_entry() {
        let sdk = Arc::new(SimulatedSdk::initialized(vec![color_camera("usb:0", "ABC123")]));
        let registry = DeviceRegistry::open(sdk.clone()).unwrap();
        registry.label_view();

        sdk.detach("usb:0");

        let view = registry.label_view();
        assert_eq!(view.len(), 1);
        let handle = view.get("PrimeSense PS1080 ABC123").unwrap();
        assert!(!handle.connected());
        assert_eq!(handle.display_label(), "PrimeSense PS1080 ABC123 (Disconnected)");
    }

    #[test]
    fn test_scenario_new_uri_supersedes_disconnected() {
        let sdk = Arc::new(SimulatedSdk::initialized(vec![color_camera("usb:0", "ABC123")]));
        let registry = DeviceRegistry::open(sdk.clone()).unwrap();
        registry.label_view();

        // The OS hands out a new uri before the old disconnect is delivered
        assert!(sdk.reassign_uri("usb:0", "usb:1"));
        assert_eq!(registry.uris(), vec!["usb:0", "usb:1"]);

        let view = registry.label_view();
        assert_eq!(view.len(), 1);
        assert_eq!(view.get("PrimeSense PS1080 ABC123").unwrap().uri(), "usb:1");
        assert_eq!(view.conflicts().len(), 1);

        registry.on_disconnected(&info("usb:0"));

        let view = registry.label_view();
        assert_eq!(view.len(), 1);
        let handle = view.get("PrimeSense PS1080 ABC123").unwrap();
        assert_eq!(handle.uri(), "usb:1");
        assert!(handle.connected());
        assert!(view.conflicts().is_empty());
    }

    #[test]
    fn test_scenario_reopen_failure() {
        let sdk = Arc::new(SimulatedSdk::initialized(vec![color_camera("usb:0", "ABC123")]));
        let registry = DeviceRegistry::open(sdk.clone()).unwrap();
        let mut events = registry.subscribe();

        registry.on_disconnected(&info("usb:0"));
        registry.take_stale();
        sdk.fail_next_reopen("usb:0");

        let err = registry.on_connected(&info("usb:0")).unwrap_err();
        assert!(err.is_unavailable());
        assert_eq!(registry.uris(), vec!["usb:0"]);
        assert!(registry.get("usb:0").unwrap().connected());
        assert!(registry.take_stale());

        assert_eq!(
            events.try_recv().unwrap(),
            RegistryEvent::DeviceDisconnected("usb:0".to_string())
        );
        assert_eq!(
            events.try_recv().unwrap(),
            RegistryEvent::DeviceConnected("usb:0".to_string())
        );
        assert!(matches!(
            events.try_recv().unwrap(),
            RegistryEvent::ReopenFailed { .. }
        ));
    }

    #[test]
    fn test_reconnect_same_uri_updates_in_place() {
        let sdk = Arc::new(SimulatedSdk::initialized(vec![color_camera("usb:0", "ABC123")]));
        let registry = DeviceRegistry::open(sdk.clone()).unwrap();

        sdk.detach("usb:0");
        assert!(!registry.get("usb:0").unwrap().connected());

        sdk.attach(color_camera("usb:0", "ABC123"));
        assert_eq!(registry.len(), 1);
        let handle = registry.get("usb:0").unwrap();
        assert!(handle.connected());
        assert_eq!(handle.serial_number().unwrap(), "ABC123");
    }

    #[test]
    fn test_refresh_is_additive_and_idempotent() {
        let sdk = Arc::new(SimulatedSdk::initialized(vec![
            color_camera("usb:0", "ABC123"),
            color_camera("usb:1", "DEF456"),
        ]));
        let registry = DeviceRegistry::open(sdk.clone()).unwrap();

        let first = registry.label_view().labels();
        assert_eq!(registry.refresh().unwrap(), 0);
        let second = registry.label_view().labels();
        assert_eq!(first, second);
        assert_eq!(
            first,
            vec!["PrimeSense PS1080 ABC123", "PrimeSense PS1080 DEF456"]
        );

        // A disconnected uri absent from enumeration is neither removed nor revived
        sdk.detach("usb:1");
        registry.refresh().unwrap();
        assert_eq!(registry.len(), 2);
        assert!(!registry.get("usb:1").unwrap().connected());
    }

    #[test]
    fn test_refresh_marks_stale() {
        let sdk = Arc::new(SimulatedSdk::initialized(Vec::new()));
        let registry = DeviceRegistry::new(sdk);
        assert!(!registry.is_stale());
        registry.refresh().unwrap();
        assert!(registry.take_stale());
        assert!(!registry.is_stale());
    }

    #[test]
    fn test_refresh_uninitialized() {
        let sdk = Arc::new(SimulatedSdk::new(vec![color_camera("usb:0", "ABC123")]));
        let result = DeviceRegistry::open(sdk);
        assert!(matches!(result, Err(RegistryError::SdkUninitialized)));
    }

    #[test]
    fn test_unknown_disconnect_ignored() {
        let sdk = Arc::new(SimulatedSdk::initialized(Vec::new()));
        let registry = DeviceRegistry::open(sdk).unwrap();
        registry.take_stale();

        assert!(!registry.on_disconnected(&info("usb:9")));
        assert!(registry.is_empty());
        assert!(registry.is_stale());
    }

    #[test]
    fn test_pending_serial_does_not_collide() {
        let sdk = Arc::new(SimulatedSdk::initialized(Vec::new()));
        let registry = DeviceRegistry::open(sdk).unwrap();

        // Neither uri can be opened, so both stay pending
        assert!(registry.on_connected(&info("usb:0")).is_err());
        assert!(registry.on_connected(&info("usb:1")).is_err());

        let view = registry.label_view();
        assert_eq!(
            view.labels(),
            vec!["PrimeSense PS1080 [usb:0]", "PrimeSense PS1080 [usb:1]"]
        );
    }

    #[test]
    fn test_concurrent_hotplug_never_loses_uris() {
        let sdk = Arc::new(SimulatedSdk::initialized(vec![color_camera("usb:0", "S0")]));
        let registry = DeviceRegistry::open(sdk.clone()).unwrap();

        let workers: Vec<_> = (0..4)
            .map(|t| {
                let sdk = sdk.clone();
                thread::spawn(move || {
                    for i in 0..25 {
                        let uri = format!("usb:{}-{}", t, i);
                        sdk.attach(color_camera(&uri, &format!("S{}", t)));
                        sdk.detach(&uri);
                    }
                })
            })
            .collect();

        let mut seen = 0;
        for _ in 0..50 {
            registry.refresh().unwrap();
            let view = registry.label_view();
            assert!(!view.is_empty());
            let now = registry.len();
            assert!(now >= seen);
            seen = now;
        }

        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(registry.len(), 1 + 4 * 25);
        let view = registry.label_view();
        assert!(view.get("PrimeSense PS1080 S0").unwrap().connected());
    }
}
