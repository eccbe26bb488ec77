//! Realtime session management between browser clients and a conversational
//! voice provider.
//!
//! A [`RealtimeManager`] owns a [`SessionRegistry`] of [`Session`]s. Each session
//! holds at most one upstream link, buffers the current audio turn, and fans
//! normalized [`Event`]s out to per-kind subscribers. WebRTC offers go through
//! the stateless [`SdpRelay`] instead.

pub mod audio;
pub mod config;
pub mod error;
pub mod event;
pub mod manager;
pub mod registry;
pub mod sdp;
pub mod session;
pub mod upstream;

#[cfg(test)]
mod test_support;

pub use config::{ManagerConfig, OpenAiEndpoints, Provider, SessionOptions, TurnDetection};
pub use error::{ErrorKind, RealtimeError, RealtimeResult};
pub use event::{Event, EventKind};
pub use manager::{EventStream, RealtimeManager, StartOutcome, StartRequest, StatusSnapshot};
pub use registry::SessionRegistry;
pub use sdp::SdpRelay;
pub use session::{Session, SessionStatus, Subscription};
