//! Capability trees: sensor → fps → resolution → pixel format → video mode
//!
//! Every level is keyed by a typed value and ordered numerically, so two builds
//! over the same modes produce the same tree and the same labels no matter in
//! which order the SDK reported them.

use serde::ser::{Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use tracing::trace;

use crate::sdk::{NativeHandle, PixelFormat, Sdk, SdkResult, SensorKind, VideoMode};

/// Frame size in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Resolution {
    pub x: u32,
    pub y: u32,
}

impl Resolution {
    pub fn label(self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} x {}", self.x, self.y)
    }
}

/// Label for a frame rate level
pub fn fps_label(fps: u32) -> String {
    format!("{} fps", fps)
}

type FormatLevel = BTreeMap<PixelFormat, VideoMode>;
type ResolutionLevel = BTreeMap<Resolution, FormatLevel>;
type FpsLevel = BTreeMap<u32, ResolutionLevel>;

/// Index of the capture modes a device supports
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapabilityTree {
    sensors: BTreeMap<SensorKind, FpsLevel>,
}

impl CapabilityTree {
    /// Query the SDK for every present sensor kind and index its modes
    pub fn build(sdk: &dyn Sdk, handle: NativeHandle) -> SdkResult<Self> {
        let mut reported = Vec::new();
        for kind in SensorKind::ALL {
            if sdk.has_sensor(handle, kind)? {
                reported.push((kind, sdk.video_modes(handle, kind)?));
            }
        }
        Ok(Self::from_modes(reported))
    }

    /// Index already reported modes; the first mode wins on duplicate paths
    pub fn from_modes<I>(reported: I) -> Self
    where
        I: IntoIterator<Item = (SensorKind, Vec<VideoMode>)>,
    {
        let mut sensors: BTreeMap<SensorKind, FpsLevel> = BTreeMap::new();

        for (kind, modes) in reported {
            let fps_level = sensors.entry(kind).or_default();
            for mode in modes {
                let resolution = Resolution {
                    x: mode.resolution_x,
                    y: mode.resolution_y,
                };
                let formats = fps_level
                    .entry(mode.fps)
                    .or_default()
                    .entry(resolution)
                    .or_default();
                if formats.contains_key(&mode.pixel_format) {
                    trace!(sensor = %kind, ?mode, "Ignoring duplicate video mode");
                    continue;
                }
                formats.insert(mode.pixel_format, mode);
            }
        }

        Self { sensors }
    }

    pub fn is_empty(&self) -> bool {
        self.sensors.is_empty()
    }

    /// Sensor kinds present on the device, in fixed kind order
    pub fn sensors(&self) -> impl Iterator<Item = SensorKind> + '_ {
        self.sensors.keys().copied()
    }

    /// Number of distinct indexed modes
    pub fn mode_count(&self) -> usize {
        self.modes().count()
    }

    /// All indexed modes in tree order
    pub fn modes(&self) -> impl Iterator<Item = (SensorKind, &VideoMode)> + '_ {
        self.sensors.iter().flat_map(|(kind, fps_level)| {
            fps_level
                .values()
                .flat_map(|resolutions| resolutions.values())
                .flat_map(|formats| formats.values())
                .map(move |mode| (*kind, mode))
        })
    }

    pub fn sensor_labels(&self) -> Vec<String> {
        self.sensors.keys().map(|k| k.label().to_string()).collect()
    }

    pub fn fps_labels(&self, sensor: &str) -> Vec<String> {
        self.fps_level(sensor)
            .map(|level| level.keys().map(|fps| fps_label(*fps)).collect())
            .unwrap_or_default()
    }

    pub fn resolution_labels(&self, sensor: &str, fps: &str) -> Vec<String> {
        self.resolution_level(sensor, fps)
            .map(|level| level.keys().map(|r| r.label()).collect())
            .unwrap_or_default()
    }

    pub fn format_labels(&self, sensor: &str, fps: &str, resolution: &str) -> Vec<String> {
        self.format_level(sensor, fps, resolution)
            .map(|level| level.keys().map(|f| f.label()).collect())
            .unwrap_or_default()
    }

    /// Resolve a full label path to the mode reported by the SDK
    pub fn lookup(
        &self,
        sensor: &str,
        fps: &str,
        resolution: &str,
        format: &str,
    ) -> Option<&VideoMode> {
        self.format_level(sensor, fps, resolution)?
            .iter()
            .find(|(f, _)| f.label() == format)
            .map(|(_, mode)| mode)
    }

    fn fps_level(&self, sensor: &str) -> Option<&FpsLevel> {
        self.sensors.get(&SensorKind::from_label(sensor)?)
    }

    fn resolution_level(&self, sensor: &str, fps: &str) -> Option<&ResolutionLevel> {
        self.fps_level(sensor)?
            .iter()
            .find(|(f, _)| fps_label(**f) == fps)
            .map(|(_, level)| level)
    }

    fn format_level(&self, sensor: &str, fps: &str, resolution: &str) -> Option<&FormatLevel> {
        self.resolution_level(sensor, fps)?
            .iter()
            .find(|(r, _)| r.label() == resolution)
            .map(|(_, level)| level)
    }
}

// Serialized as nested label-keyed objects in tree order.
impl Serialize for CapabilityTree {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_map(
            self.sensors
                .iter()
                .map(|(kind, level)| (kind.label(), LabeledFps(level))),
        )
    }
}

struct LabeledFps<'a>(&'a FpsLevel);

impl Serialize for LabeledFps<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_map(
            self.0
                .iter()
                .map(|(fps, level)| (fps_label(*fps), LabeledResolutions(level))),
        )
    }
}

struct LabeledResolutions<'a>(&'a ResolutionLevel);

impl Serialize for LabeledResolutions<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_map(
            self.0
                .iter()
                .map(|(resolution, formats)| (resolution.label(), LabeledFormats(formats))),
        )
    }
}

struct LabeledFormats<'a>(&'a FormatLevel);

impl Serialize for LabeledFormats<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_map(self.0.iter().map(|(format, mode)| (format.label(), mode)))
    }
}
