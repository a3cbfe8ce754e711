//! # confab-core
//!
//! The conversational heart of the confab agent server.
//!
//! ## Overview
//!
//! This crate holds everything a conversation needs that is not HTTP:
//!
//! - **LLM surface** ([`llm`]) — provider-neutral message/usage types and
//!   the [`llm::LlmService`] / [`llm::LlmProvider`] traits the server
//!   plugs real providers into.
//! - **Message log** ([`store`]) — the [`store::ConversationStore`] trait
//!   with dense per-conversation sequence ids, plus the in-memory
//!   reference backend.
//! - **Tool registry** ([`tools`]) — a uniform façade over heterogeneous
//!   tools with recoverable error results.
//! - **Conversation manager** ([`manager`]) — the per-conversation turn
//!   loop with one-turn-at-a-time ordering and cooperative cancellation.
//! - **Slug allocator** ([`slug`]) — LLM-driven unique-name assignment
//!   with a multi-tier model fallback.
//! - **Stream types** ([`stream`]) — the snapshot format carried on each
//!   conversation's subscription bus.

pub mod error;
pub mod llm;
pub mod manager;
pub mod slug;
pub mod store;
pub mod stream;
pub mod tools;

pub use error::{CoreError, Result};
