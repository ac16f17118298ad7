//! Status Poller
//!
//! Host liveness and resource metrics with short-lived caching.

pub mod metrics;
pub mod poller;

pub use metrics::{HostMetrics, UsageStat};
pub use poller::{status_session_id, HostStatus, StatusPoller};
