//! # confab-server
//!
//! The HTTP surface and coordination layer of the confab agent server.
//!
//! The [`coordinator::Coordinator`] owns the map of active conversation
//! managers, single-flights their creation, fans appended messages out
//! to stream subscribers, and fires the slug side-effect on each
//! conversation's first message. [`router`] wires the axum API on top.

pub mod coordinator;
pub mod handlers;
pub mod router;

pub use coordinator::Coordinator;
