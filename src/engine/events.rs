// Event system for todo mutations

//! # Event System
//!
//! After a mutation commits, the [`EventBus`] fans the change out to two kinds
//! of listeners:
//! - connections on the legacy `graphql-subscriptions` protocol, through the
//!   [`SubscriptionRegistry`] stream they subscribed to
//! - native GraphQL subscriptions, through a `broadcast` channel of [`TodoEvent`]s
//!
//! Emitting never fails the mutation. A lagging or closed listener only
//! loses its own copy of the event.

use serde_json::json;
use tokio::sync::broadcast;
use tracing::debug;

use crate::engine::subscriptions::SubscriptionRegistry;
use crate::models::Todo;

/// Stream name carrying newly created todos
pub const TODOS_STREAM: &str = "todos";

/// Stream name carrying toggled todos
pub const TODO_TOGGLED_STREAM: &str = "todoToggled";

/// A committed change to the todo list
#[derive(Debug, Clone, PartialEq)]
pub enum TodoEvent {
    Created(Todo),
    Toggled(Todo),
}

impl TodoEvent {
    pub fn todo(&self) -> &Todo {
        match self {
            TodoEvent::Created(todo) | TodoEvent::Toggled(todo) => todo,
        }
    }

    /// Name of the legacy subscription stream for this event
    pub fn stream(&self) -> &'static str {
        match self {
            TodoEvent::Created(_) => TODOS_STREAM,
            TodoEvent::Toggled(_) => TODO_TOGGLED_STREAM,
        }
    }
}

/// Event bus for publishing todo events
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<TodoEvent>,
    registry: SubscriptionRegistry,
}

impl EventBus {
    /// Create a new event bus delivering to `registry`
    pub fn new(registry: SubscriptionRegistry) -> Self {
        let (sender, _) = broadcast::channel(1000);

        Self { sender, registry }
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    /// Receive every event emitted from now on
    pub fn subscribe(&self) -> broadcast::Receiver<TodoEvent> {
        self.sender.subscribe()
    }

    /// Publish an event to all listeners
    ///
    /// Returns how many legacy connections accepted it.
    pub async fn publish(&self, event: TodoEvent) -> usize {
        let payload = json!({ "data": event.todo() });
        let delivered = self.registry.publish(event.stream(), payload).await;

        // An error here only means no native subscriber is listening
        let _ = self.sender.send(event.clone());
        debug!("event published: {:?}", event);

        delivered
    }

    pub async fn emit_todo_created(&self, todo: &Todo) -> usize {
        self.publish(TodoEvent::Created(todo.clone())).await
    }

    pub async fn emit_todo_toggled(&self, todo: &Todo) -> usize {
        self.publish(TodoEvent::Toggled(todo.clone())).await
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(SubscriptionRegistry::new())
    }
}
