//! Application state management

use anyhow::{Context, Result};
use depthcam_core::{
    DeviceRegistry, DeviceSnapshot, Menus, RegistryError, Sdk, Selection, SimulatedSdk,
};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::{sleep_until, Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::{Config, HotplugAction, ScriptStep};

/// Shared application state
pub struct AppState {
    /// Device registry
    pub registry: Arc<DeviceRegistry>,
    /// Sensor SDK backend
    pub sdk: Arc<SimulatedSdk>,
    /// Configuration
    pub config: Config,
    /// Selection requested by the user, rewritten with the effective one
    requested: RwLock<Selection>,
    /// Selection the current menus were built for
    applied: RwLock<Option<Selection>>,
    /// Last built menus
    menus: RwLock<Option<Menus>>,
}

impl AppState {
    /// Initialize the SDK and create the device registry
    pub async fn new(config: Config) -> Result<Arc<Self>> {
        let sdk = Arc::new(SimulatedSdk::new(config.sim.devices.clone()));

        let library_dir = Path::new(&config.sdk.library_dir);
        sdk.initialize(library_dir)
            .map_err(|e| RegistryError::from_sdk("initialization", e))
            .with_context(|| format!("SDK library directory {} is not usable", library_dir.display()))?;

        let backend = sdk.clone();
        let registry = tokio::task::spawn_blocking(move || DeviceRegistry::open(backend)).await??;
        info!(devices = registry.len(), "Device registry ready");

        Ok(Arc::new(Self {
            registry,
            sdk,
            requested: RwLock::new(config.selection.clone()),
            applied: RwLock::new(None),
            menus: RwLock::new(None),
            config,
        }))
    }

    /// Re-enumerate devices (the user "reload" action)
    pub async fn reload(&self) -> Result<usize> {
        let registry = self.registry.clone();
        let added = tokio::task::spawn_blocking(move || registry.refresh()).await??;
        Ok(added)
    }

    /// Request a new capture mode selection
    pub async fn select(&self, selection: Selection) {
        *self.requested.write().await = selection;
    }

    /// Last built menus
    pub async fn menus(&self) -> Option<Menus> {
        self.menus.read().await.clone()
    }

    /// Rebuild menus if the registry changed or a different selection was requested
    ///
    /// Returns the new menus when a rebuild happened.
    pub async fn poll(&self) -> Result<Option<Menus>> {
        let requested = self.requested.read().await.clone();
        let changed = match self.applied.read().await.as_ref() {
            Some(applied) => requested.changed_from(applied),
            None => true,
        };
        let stale = self.registry.take_stale();
        if !stale && !changed {
            return Ok(None);
        }

        debug!(stale, changed, "Rebuilding menus");
        let registry = self.registry.clone();
        let menus = tokio::task::spawn_blocking(move || {
            let view = registry.label_view();
            Menus::resolve(&view, &requested)
        })
        .await?;

        *self.requested.write().await = menus.selection.clone();
        *self.applied.write().await = Some(menus.selection.clone());
        *self.menus.write().await = Some(menus.clone());
        Ok(Some(menus))
    }

    /// Snapshots of the deduplicated devices in label order
    pub async fn devices(&self) -> Result<Vec<DeviceSnapshot>> {
        let registry = self.registry.clone();
        let snapshots = tokio::task::spawn_blocking(move || {
            registry
                .label_view()
                .iter()
                .filter_map(|(_, handle)| handle.snapshot())
                .collect()
        })
        .await?;
        Ok(snapshots)
    }

    /// Play the configured hot-plug script against the simulated SDK
    pub async fn run_script(self: Arc<Self>) {
        let start = Instant::now();
        let mut steps: Vec<ScriptStep> = self.config.sim.script.clone();
        steps.sort_by_key(|step| step.after_ms);

        for step in steps {
            sleep_until(start + Duration::from_millis(step.after_ms)).await;
            let sdk = self.sdk.clone();
            let result = tokio::task::spawn_blocking(move || apply_step(&sdk, step.action)).await;
            if let Err(e) = result {
                warn!(error = %e, "Hot-plug script step panicked");
            }
        }
        debug!("Hot-plug script finished");
    }
}

fn apply_step(sdk: &SimulatedSdk, action: HotplugAction) {
    match action {
        HotplugAction::Attach { device } => {
            info!(uri = %device.uri, "Script: attaching device");
            sdk.attach(device);
        }
        HotplugAction::Detach { uri } => {
            info!(uri = %uri, "Script: detaching device");
            if !sdk.detach(&uri) {
                warn!(uri = %uri, "Script: no device attached at uri");
            }
        }
        HotplugAction::Reassign { from, to } => {
            info!(from = %from, to = %to, "Script: reassigning device uri");
            if !sdk.reassign_uri(&from, &to) {
                warn!(uri = %from, "Script: no device attached at uri");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SdkConfig;
    use depthcam_core::{PixelFormat, SensorKind, SimDevice, VideoMode};

    fn camera(uri: &str, serial: &str) -> SimDevice {
        SimDevice::new(uri, serial).with_sensor(
            SensorKind::Depth,
            vec![
                VideoMode::new(30, 640, 480, PixelFormat::DEPTH_1_MM),
                VideoMode::new(60, 320, 240, PixelFormat::DEPTH_1_MM),
            ],
        )
    }

    fn config_in(dir: &Path, devices: Vec<SimDevice>) -> Config {
        let mut config = Config {
            sdk: SdkConfig {
                library_dir: dir.display().to_string(),
                poll_interval_ms: 10,
            },
            ..Default::default()
        };
        config.sim.devices = devices;
        config
    }

    #[tokio::test]
    async fn test_missing_library_dir() {
        let mut config = Config::default();
        config.sdk.library_dir = "/nonexistent/depthcam/Redist".to_string();

        let err = AppState::new(config).await.err().unwrap();
        assert_eq!(
            err.downcast_ref::<RegistryError>(),
            Some(&RegistryError::SdkUninitialized)
        );
    }

    #[tokio::test]
    async fn test_poll_rebuilds_only_when_needed() {
        let dir = tempfile::tempdir().unwrap();
        let state = AppState::new(config_in(dir.path(), vec![camera("usb:0", "ABC123")]))
            .await
            .unwrap();

        let menus = state.poll().await.unwrap().unwrap();
        assert_eq!(menus.selection.device.as_deref(), Some("PrimeSense PS1080 ABC123"));
        assert_eq!(menus.selection.fps.as_deref(), Some("30 fps"));
        assert!(state.poll().await.unwrap().is_none());

        state.sdk.detach("usb:0");
        let menus = state.poll().await.unwrap().unwrap();
        assert_eq!(menus.devices[0].label, "PrimeSense PS1080 ABC123 (Disconnected)");
        assert_eq!(state.menus().await, Some(menus));
    }

    #[tokio::test]
    async fn test_select_triggers_rebuild() {
        let dir = tempfile::tempdir().unwrap();
        let state = AppState::new(config_in(dir.path(), vec![camera("usb:0", "ABC123")]))
            .await
            .unwrap();
        state.poll().await.unwrap();

        let mut selection = state.menus().await.unwrap().selection;
        selection.fps = Some("60 fps".to_string());
        state.select(selection).await;

        let menus = state.poll().await.unwrap().unwrap();
        assert_eq!(menus.selection.resolution.as_deref(), Some("320 x 240"));
        assert_eq!(menus.mode, Some(VideoMode::new(60, 320, 240, PixelFormat::DEPTH_1_MM)));
    }

    #[tokio::test]
    async fn test_reload_picks_up_silent_devices() {
        let dir = tempfile::tempdir().unwrap();
        let state = AppState::new(config_in(dir.path(), Vec::new())).await.unwrap();
        state.poll().await.unwrap();

        state.sdk.attach_silently(camera("usb:4", "NEW001"));
        assert_eq!(state.reload().await.unwrap(), 1);

        let devices = state.devices().await.unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].serial_number.as_deref(), Some("NEW001"));
        assert!(state.poll().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_script_reassign_collapses_to_one_device() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config_in(dir.path(), vec![camera("usb:0", "ABC123")]);
        config.sim.script = vec![
            ScriptStep {
                after_ms: 0,
                action: HotplugAction::Reassign {
                    from: "usb:0".to_string(),
                    to: "usb:1".to_string(),
                },
            },
            ScriptStep {
                after_ms: 1,
                action: HotplugAction::Attach {
                    device: camera("usb:2", "XYZ789"),
                },
            },
        ];
        let state = AppState::new(config).await.unwrap();
        state.devices().await.unwrap();

        state.clone().run_script().await;

        let devices = state.devices().await.unwrap();
        assert_eq!(state.registry.len(), 3);
        assert_eq!(devices.len(), 2);
        let abc = devices.iter().find(|d| d.serial_number.as_deref() == Some("ABC123")).unwrap();
        assert_eq!(abc.uri, "usb:1");
    }
}
