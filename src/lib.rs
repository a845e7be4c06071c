// GraphQL Jobs - Rust Edition
// An example GraphQL API server with a round-robin job dispatcher

//! # GraphQL Jobs Library
//!
//! This is the library root for GraphQL Jobs, a small GraphQL API server that
//! composes axum and async-graphql with an out-of-process job dispatcher.
//!
//! ## Core Components
//!
//! ### Domain Models
//! - [`Todo`]: The demo item record exposed through GraphQL
//! - [`WorkerDescriptor`]: The published address of a running job worker
//! - [`CommandRequest`] / [`CommandOutput`] / [`CommandResponse`]: The wire
//!   messages exchanged between the dispatcher and a worker
//!
//! ### Engine
//!
//! #### [`Dispatcher`] - Round-Robin Command Dispatch
//!
//! Picks the next worker from the known list, opens a transient connection,
//! forwards a single command and relays the worker's reply unchanged.
//! The cursor always advances, even when the exchange fails, so one broken
//! worker never stalls the rotation.
//!
//! #### [`SubscriptionRegistry`] and [`EventBus`] - Notification Fan-out
//!
//! Connections declare interest in a named stream (`"todos"`); a mutation
//! publishes an event that is delivered to every subscribed connection with
//! that connection's own subscription id.
//!
//! #### Job Worker
//!
//! [`JobServer`] binds a socket, publishes a descriptor file and runs commands
//! from a fixed [`CommandTable`], streaming stdout back line by line.
//!
//! ### Server
//! [`GraphQLServer`] wires everything behind an axum router: GraphQL over HTTP,
//! the legacy `graphql-subscriptions` WebSocket protocol, native GraphQL
//! WebSocket subscriptions, the `/command` endpoint and CORS.
//!
//! ## Rust Learning Notes:
//!
//! ### Re-exports
//! `pub use` statements create shortcuts so users don't need to know the internal
//! module structure. Instead of `use graphql_jobs::engine::dispatcher::Dispatcher`,
//! users can write `use graphql_jobs::Dispatcher`.

// Core domain models
pub mod models;

// Dispatcher, worker, registry and notification engines
pub mod engine;

// HTTP / WebSocket server setup
pub mod server;

// REST endpoints that sit next to GraphQL
pub mod api;

pub use models::{
    CommandFailure, CommandOutput, CommandRequest, CommandResponse, FailureKind, Todo,
    WorkerDescriptor,
};

pub use engine::{
    commands::{CommandRunner, CommandSpec, CommandTable},
    dispatcher::{Dispatcher, DispatcherConfig, TcpTransport, WorkerTransport},
    events::{EventBus, TodoEvent},
    graphql::{create_schema, AppSchema},
    job_server::{JobServer, JobServerConfig},
    registry::{list_workers, runtime_dir, DescriptorFile, APP_NAME},
    storage::{InMemoryStorage, TodoStorage},
    subscriptions::{ConnectionId, ServerMessage, SubscriptionRegistry},
};

pub use server::{
    cors::CorsConfig,
    graphql::{GraphQLServer, GraphQLServerBuilder, ServerConfig},
};

use thiserror::Error;

/// Errors produced by the dispatcher, workers and subscription handling
///
/// ## Rust Learning Notes:
///
/// ### The `thiserror` Crate
/// - `#[derive(Error)]` implements the `std::error::Error` trait
/// - `#[error("...")]` provides human-readable error messages
/// - `#[from]` enables automatic conversion from other error types
#[derive(Error, Debug)]
pub enum JobsError {
    /// Dispatch was attempted while no worker is known
    #[error("No workers available")]
    NoWorkersAvailable,

    /// The selected worker could not be reached, or did not answer in time
    #[error("Worker unreachable: {worker} ({reason})")]
    WorkerUnreachable {
        worker: WorkerDescriptor,
        reason: String,
    },

    /// The worker's command table has no entry with this name
    #[error("Unknown command '{0}'")]
    UnknownCommand(String),

    /// The external program failed to spawn or exited non-zero
    #[error("Command execution failed (exit code {exit_code:?}): {stderr}")]
    CommandExecutionFailed {
        exit_code: Option<i32>,
        stderr: String,
    },

    /// A descriptor file could not be read or parsed
    #[error("Malformed worker descriptor {path}: {reason}")]
    MalformedDescriptor { path: String, reason: String },

    /// A WebSocket frame did not follow the subscription protocol
    #[error("Invalid subscription message: {0}")]
    InvalidSubscriptionMessage(String),

    /// A streaming result ended without its terminal message
    #[error("Command output ended before the finished message")]
    IncompleteOutput,

    /// The connection was already closed
    #[error("Connection {0} is closed")]
    ConnectionClosed(u64),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for JobsError {
    fn from(err: std::io::Error) -> Self {
        JobsError::Internal(err.to_string())
    }
}

impl JobsError {
    /// Whether the error means the request never reached a working worker
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            JobsError::NoWorkersAvailable | JobsError::WorkerUnreachable { .. }
        )
    }
}

/// Type alias for Results that use our custom error type
pub type Result<T> = std::result::Result<T, JobsError>;
