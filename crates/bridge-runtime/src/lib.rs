//! Runtime of the messenger session bridge.
//!
//! A [`Bridge`] owns one [`SessionEngine`] and the sessions created on it.
//! Each [`Session`] has two independently connected channels, a command
//! worker that serializes caller commands, one event poller per connected
//! channel and an event dispatcher fanning events out to subscribers.

mod bridge;
pub mod engine;
mod gateway;
mod lifecycle;
pub mod loopback;
mod poller;
mod record;
mod registry;
mod session;

pub use bridge::Bridge;
pub use engine::{BlockingEngine, EngineOp, EngineResponse, JsonEngine, SessionEngine};
pub use loopback::LoopbackEngine;
pub use registry::SessionHandle;
pub use session::Session;
