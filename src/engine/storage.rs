// Storage abstraction for the todo list
// This defines the interface for reading and mutating todo items

//! # Storage Abstraction Layer
//!
//! The GraphQL resolvers never touch the todo list directly; they go through
//! the [`TodoStorage`] trait so a different backend can be swapped in without
//! changing the schema.
//!
//! ## Ordering and Ids
//!
//! Items are kept in insertion order. A new item's id is the decimal string of
//! the list length plus one, so after the two seeded items the first created
//! item is `"3"`. Items are never deleted, which keeps ids unique.
//!
//! ## Rust Learning Notes:
//!
//! - Async traits with the async-trait crate
//! - `tokio::sync::RwLock` for many-readers / one-writer access
//! - Trait objects (`Arc<dyn TodoStorage>`) for dynamic dispatch

use tokio::sync::RwLock;

use crate::models::Todo;
use crate::{JobsError, Result};

/// Storage trait for todo persistence
///
/// ## Rust Learning Notes:
///
/// ### Trait Bounds
/// - `Send`: Type can be safely moved between threads
/// - `Sync`: Type can be safely shared between threads via references
/// These bounds are required to keep the store in shared GraphQL context.
#[async_trait::async_trait]
pub trait TodoStorage: Send + Sync {
    /// All items in insertion order
    async fn list_todos(&self) -> Result<Vec<Todo>>;

    /// Look up one item by id
    async fn get_todo(&self, id: &str) -> Result<Option<Todo>>;

    /// Append a new item and return it with its assigned id
    async fn create_todo(&self, text: String, completed: bool) -> Result<Todo>;

    /// Flip `completed` on an existing item
    ///
    /// Fails with `NotFound` when no item has this id.
    async fn toggle_todo(&self, id: &str) -> Result<Todo>;
}

/// In-memory todo store
///
/// Not persistent: the list resets to the seeded items on every restart.
pub struct InMemoryStorage {
    todos: RwLock<Vec<Todo>>,
}

impl InMemoryStorage {
    /// Store with no items; `default()` is the seeded store
    pub fn empty() -> Self {
        Self::with_todos(Vec::new())
    }

    pub fn with_todos(todos: Vec<Todo>) -> Self {
        Self {
            todos: RwLock::new(todos),
        }
    }

    /// Store holding the two demo items served at startup
    pub fn seeded() -> Self {
        Self::with_todos(vec![
            Todo::new("1", "Start the job servers", true),
            Todo::new("2", "Subscribe to new todos", false),
        ])
    }
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::seeded()
    }
}

#[async_trait::async_trait]
impl TodoStorage for InMemoryStorage {
    async fn list_todos(&self) -> Result<Vec<Todo>> {
        Ok(self.todos.read().await.clone())
    }

    async fn get_todo(&self, id: &str) -> Result<Option<Todo>> {
        let todos = self.todos.read().await;
        Ok(todos.iter().find(|todo| todo.id == id).cloned())
    }

    async fn create_todo(&self, text: String, completed: bool) -> Result<Todo> {
        let mut todos = self.todos.write().await;

        // id assignment and push happen under the same write guard
        let todo = Todo::new((todos.len() + 1).to_string(), text, completed);
        todos.push(todo.clone());

        Ok(todo)
    }

    async fn toggle_todo(&self, id: &str) -> Result<Todo> {
        let mut todos = self.todos.write().await;
        let todo = todos
            .iter_mut()
            .find(|todo| todo.id == id)
            .ok_or_else(|| JobsError::NotFound(format!("Todo {}", id)))?;

        todo.toggle();
        Ok(todo.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_seeded_store_assigns_next_id() {
        let storage = InMemoryStorage::seeded();
        assert_eq!(storage.list_todos().await.unwrap().len(), 2);

        let todo = storage.create_todo("buy milk".to_string(), false).await.unwrap();
        assert_eq!(todo, Todo::new("3", "buy milk", false));

        let ids: Vec<String> = storage
            .list_todos()
            .await
            .unwrap()
            .into_iter()
            .map(|todo| todo.id)
            .collect();
        assert_eq!(ids, vec!["1", "2", "3"]);
    }

    #[tokio::test]
    async fn test_toggle_todo() {
        let storage = InMemoryStorage::seeded();

        let toggled = storage.toggle_todo("2").await.unwrap();
        assert!(toggled.completed);
        assert!(storage.get_todo("2").await.unwrap().unwrap().completed);

        assert!(matches!(
            storage.toggle_todo("99").await,
            Err(JobsError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_concurrent_creates_get_distinct_ids() {
        let storage = Arc::new(InMemoryStorage::empty());

        let handles: Vec<_> = (0..10)
            .map(|i| {
                let storage = storage.clone();
                tokio::spawn(async move { storage.create_todo(format!("item {}", i), false).await })
            })
            .collect();

        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap().unwrap().id);
        }
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 10);
    }

    #[tokio::test]
    async fn test_default_is_seeded_and_empty_is_empty() {
        let seeded = InMemoryStorage::default().list_todos().await.unwrap();
        assert_eq!(seeded, InMemoryStorage::seeded().list_todos().await.unwrap());
        assert_eq!(seeded.len(), 2);

        assert!(InMemoryStorage::empty().list_todos().await.unwrap().is_empty());
    }
}
