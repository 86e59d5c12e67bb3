//! Configuration loading and validation

use anyhow::Result;
use depthcam_core::{PixelFormat, Selection, SensorKind, SimDevice, VideoMode};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::info;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub sdk: SdkConfig,
    /// Initially requested capture mode
    #[serde(default)]
    pub selection: Selection,
    #[serde(default)]
    pub sim: SimConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SdkConfig {
    /// Directory holding the SDK shared library
    #[serde(default = "default_library_dir")]
    pub library_dir: String,
    /// How often the driver loop checks for registry changes
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

impl Default for SdkConfig {
    fn default() -> Self {
        Self {
            library_dir: default_library_dir(),
            poll_interval_ms: default_poll_interval(),
        }
    }
}

fn default_library_dir() -> String {
    "./Redist".to_string()
}

fn default_poll_interval() -> u64 {
    500
}

/// Simulated devices and hot-plug script
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SimConfig {
    /// Devices attached at startup
    #[serde(default, rename = "device")]
    pub devices: Vec<SimDevice>,
    /// Hot-plug events played back after startup
    #[serde(default, rename = "event")]
    pub script: Vec<ScriptStep>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptStep {
    /// Delay from daemon start
    pub after_ms: u64,
    #[serde(flatten)]
    pub action: HotplugAction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum HotplugAction {
    /// Plug a device in
    Attach { device: SimDevice },
    /// Unplug the device at a uri
    Detach { uri: String },
    /// Move a device to a new uri without a disconnect for the old one
    Reassign { from: String, to: String },
}

/// Load configuration from file
pub fn load_config(path: &Path) -> Result<Config> {
    if path.exists() {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        info!(
            path = %path.display(),
            devices = config.sim.devices.len(),
            events = config.sim.script.len(),
            "Loaded configuration"
        );
        Ok(config)
    } else {
        info!(
            path = %path.display(),
            "Configuration file not found, using defaults"
        );
        Ok(Config::default())
    }
}

/// Save an example configuration to file
pub fn save_default_config(path: &Path) -> Result<()> {
    let camera = SimDevice::new("usb:1d27/0601@1/4", "1208120112")
        .with_sensor(
            SensorKind::Color,
            vec![
                VideoMode::new(30, 640, 480, PixelFormat::RGB888),
                VideoMode::new(30, 1280, 720, PixelFormat::RGB888),
            ],
        )
        .with_sensor(
            SensorKind::Depth,
            vec![
                VideoMode::new(30, 640, 480, PixelFormat::DEPTH_1_MM),
                VideoMode::new(30, 320, 240, PixelFormat::DEPTH_100_UM),
            ],
        );

    let config = Config {
        sdk: SdkConfig::default(),
        selection: Selection {
            sensor: Some("Depth".to_string()),
            ..Default::default()
        },
        sim: SimConfig {
            devices: vec![camera],
            script: vec![
                ScriptStep {
                    after_ms: 2000,
                    action: HotplugAction::Detach {
                        uri: "usb:1d27/0601@1/4".to_string(),
                    },
                },
                ScriptStep {
                    after_ms: 4000,
                    action: HotplugAction::Reassign {
                        from: "usb:1d27/0601@1/4".to_string(),
                        to: "usb:1d27/0601@1/5".to_string(),
                    },
                },
            ],
        },
    };

    let content = toml::to_string_pretty(&config)?;
    std::fs::write(path, content)?;
    info!(path = %path.display(), "Wrote default configuration");
    Ok(())
}

/// Detects edits to the configuration file between polls
#[derive(Debug)]
pub struct ConfigWatcher {
    path: PathBuf,
    modified: Option<SystemTime>,
}

impl ConfigWatcher {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            modified: modified_time(path),
        }
    }

    /// Whether the file changed since the last call
    pub fn changed(&mut self) -> bool {
        let modified = modified_time(&self.path);
        if modified == self.modified {
            return false;
        }
        self.modified = modified;
        true
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn modified_time(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join("missing.toml")).unwrap();
        assert_eq!(config.sdk.library_dir, "./Redist");
        assert_eq!(config.sdk.poll_interval_ms, 500);
        assert!(config.sim.devices.is_empty());
    }

    #[test]
    fn test_parse_config() {
        let content = r#"
            [sdk]
            library_dir = "/opt/openni2/Redist"

            [selection]
            sensor = "Color"
            fps = "30 fps"

            [[sim.device]]
            uri = "usb:0"
            serial = "ABC123"

            [[sim.device.sensor]]
            kind = "Color"
            modes = [{ fps = 30, resolution_x = 640, resolution_y = 480, pixel_format = "RGB888" }]

            [[sim.event]]
            after_ms = 1500
            action = "detach"
            uri = "usb:0"

            [[sim.event]]
            after_ms = 3000
            action = "reassign"
            from = "usb:0"
            to = "usb:1"
        "#;
        let config: Config = toml::from_str(content).unwrap();

        assert_eq!(config.sdk.library_dir, "/opt/openni2/Redist");
        assert_eq!(config.sdk.poll_interval_ms, 500);
        assert_eq!(config.selection.sensor.as_deref(), Some("Color"));
        assert!(config.selection.device.is_none());
        assert_eq!(config.sim.devices[0].sensors[0].modes.len(), 1);
        assert_eq!(config.sim.script.len(), 2);
        assert!(matches!(
            &config.sim.script[0].action,
            HotplugAction::Detach { uri } if uri == "usb:0"
        ));
        assert!(matches!(
            &config.sim.script[1].action,
            HotplugAction::Reassign { from, to } if from == "usb:0" && to == "usb:1"
        ));
    }

    #[test]
    fn test_default_config_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("depthcam.toml");
        save_default_config(&path).unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.sim.devices.len(), 1);
        assert_eq!(config.sim.script.len(), 2);
        assert_eq!(config.selection.sensor.as_deref(), Some("Depth"));
    }

    #[test]
    fn test_watcher_detects_changes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("depthcam.toml");
        let mut watcher = ConfigWatcher::new(&path);
        assert!(!watcher.changed());

        std::fs::write(&path, "[selection]\nsensor = \"Color\"\n").unwrap();
        assert!(watcher.changed());
        assert!(!watcher.changed());

        std::fs::remove_file(&path).unwrap();
        assert!(watcher.changed());
    }
}
