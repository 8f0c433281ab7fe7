//! Pull-through proxy core.

pub mod controller;
pub mod inflight;
pub mod local;
pub mod remote;

pub use controller::ProxyController;
pub use inflight::{inflight_key, InflightGuard, InflightTracker};
pub use local::LocalCache;
pub use remote::RemoteSource;
