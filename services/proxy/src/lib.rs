// proxy: Library entry point.
// Exposes modules for integration testing.

pub mod admission;
pub mod core;
pub mod frame_log;
pub mod proxy_meta;
pub mod registry;
pub mod router;

pub use crate::admission::{AdmissionState, handle_incoming};
pub use crate::core::{ProxyConfig, ProxyCore};
pub use crate::frame_log::FrameLog;
pub use crate::registry::Registry;
