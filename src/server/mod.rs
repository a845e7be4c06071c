// GraphQL Jobs Server
// HTTP and WebSocket front end for the engine

//! # Server Module
//!
//! ```text
//! Browser / GraphQL client
//!        ↓ HTTP, WebSocket
//! Server Layer (this module) ← routes, CORS, subscription protocol
//!        ↓ Function calls
//! Engine Layer ← schema, dispatcher, registry, storage
//!        ↓ TCP (newline-delimited JSON)
//! Job workers
//! ```
//!
//! - `graphql`: router, [`GraphQLServer`](graphql::GraphQLServer) and its builder
//! - `cors`: origin policy and response headers
//! - `subscriptions`: the `graphql-subscriptions` WebSocket protocol

pub mod cors;
pub mod graphql;
pub mod subscriptions;

pub use cors::CorsConfig;
pub use graphql::{build_router, AppState, GraphQLServer, GraphQLServerBuilder, ServerConfig};
