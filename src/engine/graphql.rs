// GraphQL API for the todo list and the job dispatcher

//! # GraphQL Schema
//!
//! - **Query**: read the todo list and the known job workers
//! - **Mutation**: add or toggle todos, run a command on the next worker
//! - **Subscription**: todo events and streamed command output
//!
//! Resolvers pull their collaborators out of the schema context:
//! `Arc<dyn TodoStorage>`, [`EventBus`] and `Arc<Dispatcher>`.

use std::sync::Arc;

use async_graphql::{Context, ErrorExtensions, Object, Schema, SimpleObject, Subscription, ID};
use futures::{Stream, StreamExt};
use serde_json::Value;
use tokio_stream::wrappers::BroadcastStream;
use tracing::debug;

use crate::engine::dispatcher::Dispatcher;
use crate::engine::events::{EventBus, TodoEvent};
use crate::engine::storage::TodoStorage;
use crate::models::{CommandOutput, CommandRequest, Todo, WorkerDescriptor};
use crate::JobsError;

// GraphQL types - API representations of the domain models

#[derive(SimpleObject, Debug, Clone)]
#[graphql(name = "Todo")]
pub struct TodoGQL {
    pub id: ID,
    pub text: String,
    pub completed: bool,
}

#[derive(SimpleObject, Debug, Clone)]
#[graphql(name = "TodoList")]
pub struct TodoListGQL {
    pub todos: Vec<TodoGQL>,
}

#[derive(SimpleObject, Debug, Clone)]
#[graphql(name = "Worker")]
pub struct WorkerGQL {
    pub pid: u32,
    pub ip: String,
    pub port: u16,
    pub command_port: Option<u16>,
    pub address: String,
}

#[derive(SimpleObject, Debug, Clone)]
#[graphql(name = "CommandOutput")]
pub struct CommandOutputGQL {
    pub stdout: Option<String>,
    pub finished: bool,
    pub timestamp: f64,
    pub error: Option<String>,
}

impl From<&Todo> for TodoGQL {
    fn from(todo: &Todo) -> Self {
        Self {
            id: ID::from(todo.id.clone()),
            text: todo.text.clone(),
            completed: todo.completed,
        }
    }
}

impl From<&WorkerDescriptor> for WorkerGQL {
    fn from(worker: &WorkerDescriptor) -> Self {
        Self {
            pid: worker.pid,
            ip: worker.ip.clone(),
            port: worker.port,
            command_port: worker.command_port,
            address: worker.address(),
        }
    }
}

impl From<CommandOutput> for CommandOutputGQL {
    fn from(output: CommandOutput) -> Self {
        Self {
            stdout: output.stdout,
            finished: output.finished,
            timestamp: output.timestamp,
            error: output.error.map(|failure| failure.message),
        }
    }
}

impl CommandOutputGQL {
    /// Terminal message standing in for a dispatch error
    fn from_error(error: &JobsError) -> Self {
        Self {
            stdout: None,
            finished: true,
            timestamp: crate::models::command::now_timestamp(),
            error: Some(error.to_string()),
        }
    }
}

/// Convert an engine error, tagging it with a machine readable code
fn gql_error(error: JobsError) -> async_graphql::Error {
    let code = match &error {
        JobsError::NoWorkersAvailable | JobsError::WorkerUnreachable { .. } => "UNAVAILABLE",
        JobsError::NotFound(_) => "NOT_FOUND",
        JobsError::InvalidInput(_) | JobsError::UnknownCommand(_) => "BAD_REQUEST",
        _ => "INTERNAL",
    };
    error.extend_with(|_, extensions| extensions.set("code", code.to_string()))
}

/// Command request from GraphQL arguments; an empty command is rejected
pub(crate) fn build_request(
    command: String,
    params: Option<Value>,
) -> Result<CommandRequest, JobsError> {
    if command.trim().is_empty() {
        return Err(JobsError::InvalidInput("command must not be empty".to_string()));
    }
    CommandRequest::new(command).with_params(params.unwrap_or(Value::Null))
}

// GraphQL Query root
pub struct Query;

#[Object]
impl Query {
    /// The whole todo list, wrapped the way the demo client expects
    async fn todo_list(&self, ctx: &Context<'_>) -> async_graphql::Result<TodoListGQL> {
        let todos = self.todos(ctx).await?;
        Ok(TodoListGQL { todos })
    }

    /// All todos in insertion order
    async fn todos(&self, ctx: &Context<'_>) -> async_graphql::Result<Vec<TodoGQL>> {
        let storage = ctx.data::<Arc<dyn TodoStorage>>()?;
        let todos = storage.list_todos().await.map_err(gql_error)?;
        Ok(todos.iter().map(TodoGQL::from).collect())
    }

    /// Get a todo by id
    async fn todo(&self, ctx: &Context<'_>, id: ID) -> async_graphql::Result<Option<TodoGQL>> {
        let storage = ctx.data::<Arc<dyn TodoStorage>>()?;
        let todo = storage.get_todo(&id).await.map_err(gql_error)?;
        Ok(todo.as_ref().map(TodoGQL::from))
    }

    /// Job workers known to the dispatcher, in rotation order
    async fn workers(&self, ctx: &Context<'_>) -> async_graphql::Result<Vec<WorkerGQL>> {
        let dispatcher = ctx.data::<Arc<Dispatcher>>()?;
        Ok(dispatcher.workers().iter().map(WorkerGQL::from).collect())
    }
}

// GraphQL Mutation root
pub struct Mutation;

#[Object]
impl Mutation {
    /// Append a todo and notify `todos` subscribers
    async fn add_todo(
        &self,
        ctx: &Context<'_>,
        text: String,
        #[graphql(default = false)] completed: bool,
    ) -> async_graphql::Result<TodoGQL> {
        let storage = ctx.data::<Arc<dyn TodoStorage>>()?;
        let events = ctx.data::<EventBus>()?;

        let todo = storage.create_todo(text, completed).await.map_err(gql_error)?;
        let delivered = events.emit_todo_created(&todo).await;
        debug!("addTodo {} notified {} connection(s)", todo.id, delivered);

        Ok(TodoGQL::from(&todo))
    }

    /// Flip the completed flag of a todo
    async fn toggle_todo(&self, ctx: &Context<'_>, id: ID) -> async_graphql::Result<TodoGQL> {
        let storage = ctx.data::<Arc<dyn TodoStorage>>()?;
        let events = ctx.data::<EventBus>()?;

        let todo = storage.toggle_todo(&id).await.map_err(gql_error)?;
        events.emit_todo_toggled(&todo).await;

        Ok(TodoGQL::from(&todo))
    }

    /// Run a command on the next job worker and return its reply as JSON
    async fn run_command(
        &self,
        ctx: &Context<'_>,
        command: String,
        params: Option<Value>,
    ) -> async_graphql::Result<Value> {
        let dispatcher = ctx.data::<Arc<Dispatcher>>()?;
        let request = build_request(command, params).map_err(gql_error)?;
        dispatcher.dispatch(request).await.map_err(gql_error)
    }
}

// GraphQL Subscription root
pub struct Subscription;

#[Subscription]
impl Subscription {
    /// Todos as they are created
    async fn new_todos(
        &self,
        ctx: &Context<'_>,
    ) -> async_graphql::Result<impl Stream<Item = TodoGQL>> {
        let events = ctx.data::<EventBus>()?;
        Ok(
            BroadcastStream::new(events.subscribe()).filter_map(|event| async move {
                match event {
                    Ok(TodoEvent::Created(todo)) => Some(TodoGQL::from(&todo)),
                    _ => None,
                }
            }),
        )
    }

    /// Todos whose completed flag changed
    async fn todo_toggled(
        &self,
        ctx: &Context<'_>,
    ) -> async_graphql::Result<impl Stream<Item = TodoGQL>> {
        let events = ctx.data::<EventBus>()?;
        Ok(
            BroadcastStream::new(events.subscribe()).filter_map(|event| async move {
                match event {
                    Ok(TodoEvent::Toggled(todo)) => Some(TodoGQL::from(&todo)),
                    _ => None,
                }
            }),
        )
    }

    /// Stream a command's stdout line by line from the next job worker
    ///
    /// The last item has `finished: true`; a failure mid-stream arrives as a
    /// finished item carrying `error`.
    async fn command_execute(
        &self,
        ctx: &Context<'_>,
        command: String,
        params: Option<Value>,
    ) -> async_graphql::Result<impl Stream<Item = CommandOutputGQL>> {
        let dispatcher = ctx.data::<Arc<Dispatcher>>()?;
        let request = build_request(command, params).map_err(gql_error)?;
        let outputs = dispatcher.dispatch_stream(request).await.map_err(gql_error)?;

        Ok(outputs.map(|output| match output {
            Ok(output) => CommandOutputGQL::from(output),
            Err(e) => CommandOutputGQL::from_error(&e),
        }))
    }
}

// Schema type alias
pub type AppSchema = Schema<Query, Mutation, Subscription>;

/// Create the GraphQL schema over the given store, notifier and dispatcher
pub fn create_schema(
    storage: Arc<dyn TodoStorage>,
    events: EventBus,
    dispatcher: Arc<Dispatcher>,
) -> AppSchema {
    Schema::build(Query, Mutation, Subscription)
        .data(storage)
        .data(events)
        .data(dispatcher)
        .finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::storage::InMemoryStorage;
    use crate::engine::testing::scripted_dispatcher;
    use serde_json::json;
    use std::time::Duration;

    fn schema_with(dispatcher: Arc<Dispatcher>) -> (AppSchema, EventBus) {
        let events = EventBus::default();
        let schema = create_schema(
            Arc::new(InMemoryStorage::seeded()),
            events.clone(),
            dispatcher,
        );
        (schema, events)
    }

    fn data(response: async_graphql::Response) -> Value {
        assert!(response.errors.is_empty(), "errors: {:?}", response.errors);
        response.data.into_json().unwrap()
    }

    #[tokio::test]
    async fn test_todo_list_returns_seeded_items() {
        let (schema, _) = schema_with(scripted_dispatcher(&[], &[]));

        let value = data(schema.execute("{ todoList { todos { id completed } } }").await);
        assert_eq!(
            value,
            json!({"todoList": {"todos": [
                {"id": "1", "completed": true},
                {"id": "2", "completed": false}
            ]}})
        );
    }

    #[tokio::test]
    async fn test_add_todo_assigns_next_id_and_notifies() {
        let (schema, events) = schema_with(scripted_dispatcher(&[], &[]));
        let mut received = events.subscribe();

        let value = data(
            schema
                .execute(r#"mutation { addTodo(text: "buy milk") { id text completed } }"#)
                .await,
        );
        assert_eq!(
            value,
            json!({"addTodo": {"id": "3", "text": "buy milk", "completed": false}})
        );
        assert!(matches!(received.recv().await, Ok(TodoEvent::Created(todo)) if todo.id == "3"));
    }

    #[tokio::test]
    async fn test_toggle_unknown_todo_is_not_found() {
        let (schema, _) = schema_with(scripted_dispatcher(&[], &[]));

        let response = schema.execute(r#"mutation { toggleTodo(id: "42") { id } }"#).await;
        assert_eq!(response.errors.len(), 1);
        assert!(response.errors[0].message.contains("42"));
    }

    #[tokio::test]
    async fn test_run_command_without_workers_is_unavailable() {
        let (schema, _) = schema_with(scripted_dispatcher(&[], &[]));

        let response = schema.execute(r#"mutation { runCommand(command: "date") }"#).await;
        assert_eq!(response.errors.len(), 1);
        assert_eq!(response.errors[0].message, "No workers available");
        let extensions = serde_json::to_value(&response.errors[0].extensions).unwrap();
        assert_eq!(extensions["code"], "UNAVAILABLE");
    }

    #[tokio::test]
    async fn test_run_command_relays_worker_reply() {
        let (schema, _) = schema_with(scripted_dispatcher(&[7], &["2", "1"]));

        let value = data(
            schema
                .execute(r#"mutation { runCommand(command: "countdown", params: {count: 2}) }"#)
                .await,
        );
        assert_eq!(value["runCommand"]["stdout"], json!(["2", "1"]));
        assert_eq!(value["runCommand"]["worker"], json!(7));
    }

    #[tokio::test]
    async fn test_workers_query_lists_rotation() {
        let (schema, _) = schema_with(scripted_dispatcher(&[1, 2], &[]));

        let value = data(schema.execute("{ workers { pid commandPort } }").await);
        assert_eq!(
            value,
            json!({"workers": [
                {"pid": 1, "commandPort": 40001},
                {"pid": 2, "commandPort": 40002}
            ]})
        );
    }

    #[tokio::test]
    async fn test_command_execute_streams_until_finished() {
        let (schema, _) = schema_with(scripted_dispatcher(&[1], &["3", "2", "1"]));

        let responses: Vec<Value> = schema
            .execute_stream(
                r#"subscription { commandExecute(command: "countdown") { stdout finished } }"#,
            )
            .map(data)
            .collect()
            .await;

        assert_eq!(
            responses,
            vec![
                json!({"commandExecute": {"stdout": "3", "finished": false}}),
                json!({"commandExecute": {"stdout": "2", "finished": false}}),
                json!({"commandExecute": {"stdout": "1", "finished": false}}),
                json!({"commandExecute": {"stdout": null, "finished": true}}),
            ]
        );
    }

    #[tokio::test]
    async fn test_new_todos_subscription_sees_mutation() {
        let (schema, _) = schema_with(scripted_dispatcher(&[], &[]));
        let mut stream = schema.execute_stream("subscription { newTodos { id text } }");

        let mutator = schema.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            mutator
                .execute(r#"mutation { addTodo(text: "buy milk") { id } }"#)
                .await;
        });

        let response = tokio::time::timeout(Duration::from_secs(2), stream.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            data(response),
            json!({"newTodos": {"id": "3", "text": "buy milk"}})
        );
    }
}
