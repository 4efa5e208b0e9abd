//! Non-blocking, length-prefixed message transport over stream sockets.
//!
//! An [`Endpoint`] multiplexes an outbound queue of [`Message`]s and a
//! single inbound partially-assembled message over one connection,
//! advancing both directions opportunistically whenever the socket becomes
//! ready. A [`PollGroup`] lets one thread drive many endpoints with a
//! single system-level multiplex call.
//!
//! Progress only happens inside [`Endpoint::wait`] or [`PollGroup::wait`];
//! every other operation here is non-blocking. See each type's docs for the
//! full lifecycle.

pub mod error;
pub mod frame;
pub mod group;
pub mod message;

mod endpoint;

pub use endpoint::{Endpoint, EndpointState};
pub use error::{Errno, PollError};
pub use group::{PollGroup, Tag};
pub use message::{msg_delete, unwrap_buffer, wrap_buffer, Message};
