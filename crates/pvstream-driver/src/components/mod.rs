//! Driver components.

pub mod acquisition;
#[cfg(feature = "mock")]
pub mod mock;
#[cfg(feature = "pvapi_sdk")]
pub mod pvapi;
