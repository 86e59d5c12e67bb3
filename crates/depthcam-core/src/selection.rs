//! Cascading capture mode selection
//!
//! Each level's options depend on the choice made at the level above. A
//! requested value that is not among the current options falls back to the
//! first option instead of failing.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::registry::LabelView;
use crate::sdk::VideoMode;

/// Requested (or effective) label at each level
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    #[serde(default)]
    pub device: Option<String>,
    #[serde(default)]
    pub sensor: Option<String>,
    #[serde(default)]
    pub fps: Option<String>,
    #[serde(default)]
    pub resolution: Option<String>,
    #[serde(default)]
    pub pixel_format: Option<String>,
}

impl Selection {
    /// Whether any level differs from `previous`
    pub fn changed_from(&self, previous: &Selection) -> bool {
        self != previous
    }
}

/// Device list entry: the identity label and the text shown for it
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceOption {
    pub name: String,
    pub label: String,
}

/// Options for every level plus the effective selection
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Menus {
    pub devices: Vec<DeviceOption>,
    pub sensors: Vec<String>,
    pub fps: Vec<String>,
    pub resolutions: Vec<String>,
    pub pixel_formats: Vec<String>,
    pub selection: Selection,
    /// Mode the effective selection resolves to
    pub mode: Option<VideoMode>,
}

/// The requested option if offered, otherwise the first one
fn pick(options: &[String], requested: Option<&String>) -> Option<String> {
    match requested {
        Some(value) if options.contains(value) => Some(value.clone()),
        _ => options.first().cloned(),
    }
}

impl Menus {
    /// Build the option lists for `view` and resolve `requested` against them
    pub fn resolve(view: &LabelView, requested: &Selection) -> Self {
        let mut menus = Menus {
            devices: view
                .iter()
                .map(|(label, handle)| DeviceOption {
                    name: label.to_string(),
                    label: handle.display_label(),
                })
                .collect(),
            ..Default::default()
        };

        let device_names = view.labels();
        let Some(device) = pick(&device_names, requested.device.as_ref()) else {
            return menus;
        };
        menus.selection.device = Some(device.clone());

        let Some(handle) = view.get(&device) else {
            return menus;
        };
        let tree = match handle.capabilities() {
            Ok(tree) => tree,
            Err(e) => {
                debug!(device = %device, error = %e, "Capabilities unavailable for selection");
                return menus;
            }
        };

        menus.sensors = tree.sensor_labels();
        let Some(sensor) = pick(&menus.sensors, requested.sensor.as_ref()) else {
            return menus;
        };
        menus.selection.sensor = Some(sensor.clone());

        menus.fps = tree.fps_labels(&sensor);
        let Some(fps) = pick(&menus.fps, requested.fps.as_ref()) else {
            return menus;
        };
        menus.selection.fps = Some(fps.clone());

        menus.resolutions = tree.resolution_labels(&sensor, &fps);
        let Some(resolution) = pick(&menus.resolutions, requested.resolution.as_ref()) else {
            return menus;
        };
        menus.selection.resolution = Some(resolution.clone());

        menus.pixel_formats = tree.format_labels(&sensor, &fps, &resolution);
        let Some(format) = pick(&menus.pixel_formats, requested.pixel_format.as_ref()) else {
            return menus;
        };
        menus.mode = tree.lookup(&sensor, &fps, &resolution, &format).copied();
        menus.selection.pixel_format = Some(format);

        menus
    }
}
