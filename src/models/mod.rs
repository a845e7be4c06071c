// Core domain models for GraphQL Jobs
// These are the plain data structures shared by the engine and the server

//! # Domain Models Module
//!
//! This module contains the data types that cross component boundaries:
//! - the demo [`Todo`] record served by GraphQL
//! - the [`WorkerDescriptor`] a job worker publishes on disk
//! - the command wire messages exchanged with workers
//!
//! ## Rust Learning Notes:
//!
//! ### Re-exports for Clean APIs
//! The `pub use` statements at the bottom create a clean, flat API.
//! Users can import `use graphql_jobs::models::Todo` instead of
//! `use graphql_jobs::models::todo::Todo`.

// Contains Todo - the item record stored in insertion order
pub mod todo;

// Contains WorkerDescriptor - the published address of a job worker
pub mod worker;

// Contains CommandRequest, CommandOutput and CommandResponse - the worker wire format
pub mod command;

/// Re-export the todo record
pub use todo::Todo;

/// Re-export worker discovery types
pub use worker::WorkerDescriptor;

/// Re-export command wire types
/// - CommandRequest: what the dispatcher sends
/// - CommandOutput: one streamed line (or the terminal message)
/// - CommandResponse: the single reply of a non-streaming command
/// - CommandFailure / FailureKind: failures returned as data
pub use command::{CommandFailure, CommandOutput, CommandRequest, CommandResponse, FailureKind};
