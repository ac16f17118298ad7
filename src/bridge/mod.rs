//! WebSocket bridge - client-facing endpoints
//!
//! `/ssh` carries interactive terminals, `/api` the control API.

pub mod control;
pub mod protocol;
mod resize;
pub mod server;
pub mod terminal;

pub use control::{ControlApi, ControlChannel, ControlError};
pub use protocol::{ApiMessage, ClientMessage, ProtocolError, ServerMessage};
pub use server::BridgeServer;
pub use terminal::{
    ClientChannel, PtyShellOpener, Shell, ShellEvent, ShellOpener, ShellReader, ShellWriter,
    TerminalBridge, TerminalEvent, TerminalInput,
};
