pub mod adb;
pub mod config;
pub mod error;
pub mod logcat;
pub mod logging;
pub mod memory;
pub mod models;
pub mod recording;
pub mod screenshot;
pub mod session;
pub mod telemetry;

#[cfg(test)]
pub mod testing;
