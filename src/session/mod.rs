//! Session management: reference-counted connections shared by terminal,
//! file and status consumers of one session id.

pub mod registry;

pub use registry::{
    Lane, Purpose, RegistryError, SessionInfo, SessionRegistry, SessionStatus,
    DEFAULT_GRACE_PERIOD,
};
