// GraphQL Jobs Engine
// Job dispatch, job workers, notifications and the GraphQL schema

//! # Engine Module
//!
//! The engine sits between the domain models and the HTTP layer in `server/`.
//!
//! ## Engine Components
//!
//! ### Job Registry (`registry` module)
//! - Locates the runtime directory
//! - Publishes and removes `jobserver-<pid>` descriptor files
//! - Lists the descriptors of running workers
//!
//! ### Dispatcher (`dispatcher` module)
//! - Round-robin selection over the known workers
//! - One transient connection per command
//!
//! ### Job Worker (`commands` and `job_server` modules)
//! - A fixed table of runnable commands
//! - A TCP server answering one command per request line
//!
//! ### Notifications (`subscriptions` and `events` modules)
//! - Which connection listens to which stream
//! - Fan-out of todo mutations to those connections
//!
//! ### GraphQL Engine (`graphql` module)
//! - Schema, resolvers and GraphQL types
//!
//! ### Storage Engine (`storage` module)
//! - Todo storage trait and its in-memory implementation
//!
//! ## Rust Learning Notes:
//!
//! ### Module Organization Pattern
//! 1. Create a directory with the module name (`engine/`)
//! 2. Add a `mod.rs` file as the module root
//! 3. Declare submodules in `mod.rs`
//! 4. Re-export important types for a clean API

pub mod commands;
pub mod dispatcher;
pub mod events;
pub mod graphql;
pub mod job_server;
pub mod registry;
pub mod storage;
pub mod subscriptions;

#[cfg(test)]
pub(crate) mod testing;

pub use commands::{CommandRunner, CommandTable};
pub use dispatcher::{Dispatcher, DispatcherConfig, WorkerTransport};
pub use events::{EventBus, TodoEvent};
pub use graphql::{create_schema, AppSchema};
pub use job_server::{JobServer, JobServerConfig};
pub use storage::{InMemoryStorage, TodoStorage};
pub use subscriptions::{ConnectionId, ServerMessage, SubscriptionRegistry};
