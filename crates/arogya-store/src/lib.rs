//! # arogya-store
//!
//! Durable storage for the chat core, backed by SQLite.
//!
//! The crate exposes a synchronous `Database` handle that wraps a
//! `rusqlite::Connection` and provides typed helpers for conversations,
//! their participant sets, and the append-only per-conversation message log.
//! Callers in async contexts are expected to run these on a blocking pool.

pub mod conversations;
pub mod database;
pub mod messages;
pub mod migrations;

mod error;

pub use database::Database;
pub use error::{Result, StoreError};
