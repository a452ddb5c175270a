//! Client session modules.
//!
//! - `dispatch`: transport-agnostic protocol core routing inbound messages.
//! - `client`: websocket driver, command handle and handshake.
//! - `proto`: wire messages exchanged with the router.

/// In-flight remote calls and their completions.
mod calls;
/// Websocket connection, worker task and cloneable handle.
pub mod client;
/// Request id allocation and reply correlation.
pub mod correlator;
/// Session core: lifecycle, routing and termination.
pub mod dispatch;
/// Session and handler error types.
pub mod error;
/// Application callback types.
pub mod handler;
/// Local procedure registrations.
pub mod procedures;
/// Wire protocol messages.
pub mod proto;
/// Session state machine and lifecycle notifications.
pub mod state;
/// Topic subscriptions and event fan-out.
mod subscriptions;
