pub mod capture;
pub mod enumeration;

pub use capture::{CaptureConfig, CaptureError, CaptureStats, InputCapture};
pub use enumeration::{EnumError, EnumResult, HostInfo, InputDeviceEnumerator, InputDeviceInfo};
