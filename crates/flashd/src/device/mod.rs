//! Device registry and identity policies.

pub mod identity;
pub mod registry;

pub use identity::{DeviceIdentity, HardwareSerialPolicy, IdentityPolicy, PortPathPolicy};
pub use registry::{Device, DeviceRegistry, DeviceState};
