//! Client SDK for a router speaking the pub/sub + RPC session protocol.
//!
//! The crate is organized in two layers:
//! - `session::dispatch`: the protocol core. It owns session state, request
//!   correlation, subscriptions, registrations and pending calls, and talks
//!   to any [`session::dispatch::Transport`].
//! - `session::client`: a websocket driver running the core on a background
//!   task behind a cloneable handle.
//!
//! `options` holds the tunables shared by both layers.

/// Session and driver configuration.
pub mod options;
/// Session core, protocol types and websocket driver.
pub mod session;

pub use options::{SessionDefaults, SessionOptions};
pub use session::client::{ClientError, SessionClient, SessionConnection, SessionHandle};
pub use session::dispatch::{Session, Transport};
pub use session::error::{HandlerError, SessionError};
pub use session::handler::Event;
pub use session::state::{LifecycleEvent, SessionState};
