// Todo item record - the demo payload served through GraphQL

use serde::{Deserialize, Serialize};

/// A single to-do entry
///
/// Ids are decimal strings assigned by the store at creation time.
/// Records are toggled but never deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Todo {
    pub id: String,
    pub text: String,
    pub completed: bool,
}

impl Todo {
    pub fn new(id: impl Into<String>, text: impl Into<String>, completed: bool) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            completed,
        }
    }

    /// Flip the completed flag and return the new value
    pub fn toggle(&mut self) -> bool {
        self.completed = !self.completed;
        self.completed
    }
}
