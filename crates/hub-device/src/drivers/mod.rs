//! Per-platform implementations of the device contract

pub mod android;
pub mod ios_simulator;
pub mod macos;
pub mod remote;

pub use android::AndroidDriver;
pub use ios_simulator::IosSimulatorDriver;
pub use macos::MacOsDriver;
pub use remote::RemoteDriver;
