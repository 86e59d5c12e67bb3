//! Depthcam Core - Device registry and capture mode index for depth cameras
//!
//! This crate provides the foundational pieces of the depthcam system:
//! - A seam over the native sensor SDK (enumeration, properties, hot-plug callbacks)
//! - Device handles with lazily cached identity and capabilities
//! - A uri-keyed device registry with a deduplicated, label-keyed view
//! - Capability trees (sensor → fps → resolution → pixel format)
//! - Cascading capture mode selection with fallback to the first option
//! - A simulated SDK backend for tests and development without hardware

pub mod capability;
pub mod device;
pub mod error;
pub mod listener;
pub mod registry;
pub mod sdk;
pub mod selection;
pub mod sim;

pub use capability::{CapabilityTree, Resolution};
pub use device::{Cached, DeviceHandle, DeviceSnapshot};
pub use error::{CapabilityDecodeError, RegistryError, Result};
pub use listener::HotplugListener;
pub use registry::{DeviceRegistry, IdentityConflict, LabelView, RegistryEvent};
pub use sdk::{
    DeviceInfo, DeviceListener, DeviceProperty, NativeHandle, PixelFormat, Sdk, SdkError,
    SensorKind, VideoMode,
};
pub use selection::{Menus, Selection};
pub use sim::{SimDevice, SimSensor, SimulatedSdk};
