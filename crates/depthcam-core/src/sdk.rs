//! Seam over the native sensor SDK
//!
//! The registry never talks to a vendor library directly. Everything it needs
//! from the native side goes through [`Sdk`], and hot-plug notifications come
//! back through [`DeviceListener`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

use crate::error::CapabilityDecodeError;

/// Size of the buffer the native side fills for string properties
pub const PROPERTY_BUFFER_LEN: usize = 100;

const PIXEL_FORMAT_PREFIX: &str = "ONI_PIXEL_FORMAT_";

/// Raw failure reported by a native call
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SdkError {
    #[error("device unavailable: {0}")]
    Unavailable(String),
    #[error("SDK not initialized")]
    Uninitialized,
}

pub type SdkResult<T> = std::result::Result<T, SdkError>;

/// Opaque handle to an open native device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NativeHandle(pub u64);

/// Descriptor delivered by enumeration and hot-plug callbacks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Transient address assigned by the SDK; not stable across reconnects
    pub uri: String,
    pub vendor: String,
    pub name: String,
}

impl DeviceInfo {
    pub fn new(uri: impl Into<String>, vendor: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            vendor: vendor.into(),
            name: name.into(),
        }
    }
}

/// Device properties readable through [`Sdk::get_property`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceProperty {
    SerialNumber,
}

impl DeviceProperty {
    /// Decode a fixed-size string property buffer
    pub fn decode_string(raw: &[u8]) -> String {
        let raw = &raw[..raw.len().min(PROPERTY_BUFFER_LEN)];
        let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        String::from_utf8_lossy(&raw[..end]).trim().to_string()
    }
}

/// Sensor kinds a device may expose
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SensorKind {
    Infrared = 1,
    Color = 2,
    Depth = 3,
}

impl SensorKind {
    /// Fixed iteration order for capability building
    pub const ALL: [SensorKind; 3] = [SensorKind::Infrared, SensorKind::Color, SensorKind::Depth];

    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn label(self) -> &'static str {
        match self {
            SensorKind::Infrared => "Infrared",
            SensorKind::Color => "Color",
            SensorKind::Depth => "Depth",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.label() == label)
    }
}

impl fmt::Display for SensorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Raw pixel format code as reported by the SDK
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "PixelFormatRepr", into = "u32")]
pub struct PixelFormat(pub u32);

const PIXEL_FORMATS: &[(u32, &str)] = &[
    (100, "ONI_PIXEL_FORMAT_DEPTH_1_MM"),
    (101, "ONI_PIXEL_FORMAT_DEPTH_100_UM"),
    (102, "ONI_PIXEL_FORMAT_SHIFT_9_2"),
    (103, "ONI_PIXEL_FORMAT_SHIFT_9_3"),
    (200, "ONI_PIXEL_FORMAT_RGB888"),
    (201, "ONI_PIXEL_FORMAT_YUV422"),
    (202, "ONI_PIXEL_FORMAT_GRAY8"),
    (203, "ONI_PIXEL_FORMAT_GRAY16"),
    (204, "ONI_PIXEL_FORMAT_JPEG"),
    (205, "ONI_PIXEL_FORMAT_YUYV"),
];

impl PixelFormat {
    pub const DEPTH_1_MM: PixelFormat = PixelFormat(100);
    pub const DEPTH_100_UM: PixelFormat = PixelFormat(101);
    pub const RGB888: PixelFormat = PixelFormat(200);
    pub const YUV422: PixelFormat = PixelFormat(201);
    pub const GRAY16: PixelFormat = PixelFormat(203);

    /// Symbolic name from the SDK enum table
    pub fn symbol(self) -> Result<&'static str, CapabilityDecodeError> {
        PIXEL_FORMATS
            .iter()
            .find(|(code, _)| *code == self.0)
            .map(|(_, name)| *name)
            .ok_or(CapabilityDecodeError::UnknownPixelFormat(self.0))
    }

    /// Display label: symbol without prefix and with spaces, or the numeric code
    pub fn label(self) -> String {
        match self.symbol() {
            Ok(symbol) => symbol
                .trim_start_matches(PIXEL_FORMAT_PREFIX)
                .replace('_', " "),
            Err(e) => {
                tracing::debug!(error = %e, "Labeling pixel format by its numeric code");
                self.0.to_string()
            }
        }
    }

    /// Parse a symbolic name or label (`RGB888`, `DEPTH 1 MM`, `ONI_PIXEL_FORMAT_GRAY16`)
    pub fn from_name(name: &str) -> Option<Self> {
        let normalized = name.trim().to_ascii_uppercase().replace(' ', "_");
        let normalized = normalized.trim_start_matches(PIXEL_FORMAT_PREFIX);
        PIXEL_FORMATS
            .iter()
            .find(|(_, symbol)| symbol.trim_start_matches(PIXEL_FORMAT_PREFIX) == normalized)
            .map(|(code, _)| PixelFormat(*code))
    }
}

impl From<PixelFormat> for u32 {
    fn from(format: PixelFormat) -> Self {
        format.0
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PixelFormatRepr {
    Code(u32),
    Name(String),
}

impl TryFrom<PixelFormatRepr> for PixelFormat {
    type Error = String;

    fn try_from(repr: PixelFormatRepr) -> Result<Self, Self::Error> {
        match repr {
            PixelFormatRepr::Code(code) => Ok(PixelFormat(code)),
            PixelFormatRepr::Name(name) => PixelFormat::from_name(&name)
                .ok_or_else(|| format!("unknown pixel format name: {}", name)),
        }
    }
}

/// One capture mode as reported by a sensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoMode {
    pub fps: u32,
    pub resolution_x: u32,
    pub resolution_y: u32,
    pub pixel_format: PixelFormat,
}

impl VideoMode {
    pub fn new(fps: u32, resolution_x: u32, resolution_y: u32, pixel_format: PixelFormat) -> Self {
        Self {
            fps,
            resolution_x,
            resolution_y,
            pixel_format,
        }
    }
}

/// Receiver for asynchronous hot-plug notifications
///
/// The SDK may call these from any thread.
pub trait DeviceListener: Send + Sync {
    fn on_connected(&self, info: &DeviceInfo);
    fn on_disconnected(&self, info: &DeviceInfo);
}

/// Native sensor SDK surface consumed by the registry
///
/// Calls may block; the registry never holds its lock across them.
pub trait Sdk: Send + Sync {
    /// Bind the SDK to the directory holding its shared library
    fn initialize(&self, library_dir: &Path) -> SdkResult<()>;

    /// Devices currently attached
    fn enumerate(&self) -> SdkResult<Vec<DeviceInfo>>;

    fn open(&self, uri: &str) -> SdkResult<NativeHandle>;

    /// Re-establish a handle after a disconnect/reconnect cycle
    fn reopen(&self, handle: NativeHandle) -> SdkResult<NativeHandle>;

    fn get_property(&self, handle: NativeHandle, property: DeviceProperty) -> SdkResult<Vec<u8>>;

    fn has_sensor(&self, handle: NativeHandle, kind: SensorKind) -> SdkResult<bool>;

    fn video_modes(&self, handle: NativeHandle, kind: SensorKind) -> SdkResult<Vec<VideoMode>>;

    /// Install the receiver for hot-plug callbacks, replacing any previous one
    fn set_listener(&self, listener: Arc<dyn DeviceListener>);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pixel_format_labels() {
        assert_eq!(PixelFormat::RGB888.label(), "RGB888");
        assert_eq!(PixelFormat::DEPTH_1_MM.label(), "DEPTH 1 MM");
        assert_eq!(PixelFormat(101).label(), "DEPTH 100 UM");
    }

    #[test]
    fn test_unknown_pixel_format_falls_back_to_code() {
        let format = PixelFormat(999);
        assert_eq!(
            format.symbol(),
            Err(CapabilityDecodeError::UnknownPixelFormat(999))
        );
        assert_eq!(format.label(), "999");
    }

    #[test]
    fn test_pixel_format_from_name() {
        assert_eq!(PixelFormat::from_name("RGB888"), Some(PixelFormat::RGB888));
        assert_eq!(PixelFormat::from_name("depth 1 mm"), Some(PixelFormat::DEPTH_1_MM));
        assert_eq!(
            PixelFormat::from_name("ONI_PIXEL_FORMAT_GRAY16"),
            Some(PixelFormat::GRAY16)
        );
        assert_eq!(PixelFormat::from_name("H264"), None);
    }

    #[test]
    fn test_pixel_format_deserialize_code_or_name() {
        let by_code: PixelFormat = serde_json::from_str("200").unwrap();
        let by_name: PixelFormat = serde_json::from_str("\"YUV422\"").unwrap();
        assert_eq!(by_code, PixelFormat::RGB888);
        assert_eq!(by_name, PixelFormat::YUV422);
        assert!(serde_json::from_str::<PixelFormat>("\"BOGUS\"").is_err());
    }

    #[test]
    fn test_decode_string_property() {
        let mut raw = vec![0u8; PROPERTY_BUFFER_LEN];
        raw[..6].copy_from_slice(b"ABC123");
        assert_eq!(DeviceProperty::decode_string(&raw), "ABC123");
        assert_eq!(DeviceProperty::decode_string(b" 17122 "), "17122");
    }

    #[test]
    fn test_sensor_kind_order_and_labels() {
        assert_eq!(SensorKind::ALL.map(SensorKind::code), [1, 2, 3]);
        assert!(SensorKind::Infrared < SensorKind::Color);
        assert_eq!(SensorKind::from_label("Depth"), Some(SensorKind::Depth));
        assert_eq!(SensorKind::from_label("Audio"), None);
    }
}
