// WebSocket handler for the `graphql-subscriptions` protocol

//! # Legacy Subscription Protocol
//!
//! Older GraphQL clients speak a small JSON protocol over a WebSocket
//! negotiated with the `graphql-subscriptions` subprotocol:
//!
//! ```text
//! client -> {"type": "subscription_start", "id": 1, "query": "subscription todos { newTodos { id } }"}
//! server <- {"type": "subscription_success", "id": 1}
//! server <- {"type": "subscription_data", "id": 1, "payload": {"data": {...}}}
//! client -> {"type": "subscription_end", "id": 1}
//! ```
//!
//! The stream a subscription listens to comes from the operation name of its
//! query (`todos` above), or from its first root field. Only streams the
//! [`EventBus`](crate::EventBus) publishes on are accepted: `todos` (also
//! reachable as `newTodos`) and `todoToggled`. Their events are produced after
//! each mutation, not by executing the subscription query.
//!
//! A `commandExecute` subscription instead runs its `command` argument on the
//! next job worker and forwards every output line as `subscription_data`,
//! ending with the `finished` message.
//!
//! A bad frame gets an `error` (or `subscription_fail`) frame back; the
//! socket stays open.

use std::sync::Arc;

use async_graphql::parser::{
    parse_query,
    types::{DocumentOperations, Field, OperationDefinition, Selection},
};
use async_graphql::Value as ConstValue;
use axum::extract::ws::{Message, WebSocket};
use futures::stream::BoxStream;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::engine::dispatcher::Dispatcher;
use crate::engine::events::{TODOS_STREAM, TODO_TOGGLED_STREAM};
use crate::engine::graphql::build_request;
use crate::engine::subscriptions::{ConnectionId, ServerMessage, SubscriptionRegistry};
use crate::models::{CommandFailure, CommandOutput, CommandRequest};
use crate::{JobsError, Result};

/// WebSocket subprotocol name
pub const SUBPROTOCOL: &str = "graphql-subscriptions";

/// Frames a client may send
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    SubscriptionStart {
        #[serde(default)]
        id: Value,
        query: String,
        #[serde(default, rename = "operationName")]
        operation_name: Option<String>,
        #[serde(default)]
        variables: Option<Value>,
    },
    SubscriptionEnd {
        #[serde(default)]
        id: Value,
    },
}

/// Root field whose subscription runs a command instead of following a stream
pub const COMMAND_EXECUTE: &str = "commandExecute";

/// Notifier stream known under `name`, either the stream itself or its root field
pub fn known_stream(name: &str) -> Option<&'static str> {
    match name {
        TODOS_STREAM | "newTodos" => Some(TODOS_STREAM),
        TODO_TOGGLED_STREAM => Some(TODO_TOGGLED_STREAM),
        _ => None,
    }
}

/// What a legacy subscription is attached to
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionTarget {
    /// A notifier stream fed by mutations
    Stream(&'static str),
    /// A streamed command on the next job worker
    Command(CommandRequest),
}

fn first_root_field(operation: &OperationDefinition) -> Option<&Field> {
    operation
        .selection_set
        .node
        .items
        .iter()
        .find_map(|selection| match &selection.node {
            Selection::Field(field) => Some(&field.node),
            _ => None,
        })
}

/// Pick the operation to run and the name it goes by
///
/// Named operations use their own name (or `operation_name` to pick one of
/// several). An anonymous operation is named by `operation_name`, if given.
fn select_operation<'a>(
    operations: &'a DocumentOperations,
    operation_name: Option<&str>,
) -> Result<(Option<String>, &'a OperationDefinition)> {
    match operations {
        DocumentOperations::Single(operation) => {
            Ok((operation_name.map(str::to_string), &operation.node))
        }
        DocumentOperations::Multiple(operations) => {
            let selected = match operation_name {
                Some(wanted) => operations
                    .iter()
                    .find(|(name, _)| name.as_str() == wanted)
                    .ok_or_else(|| {
                        JobsError::InvalidSubscriptionMessage(format!(
                            "unknown operation '{}'",
                            wanted
                        ))
                    })?,
                None if operations.len() == 1 => operations.iter().next().ok_or_else(|| {
                    JobsError::InvalidSubscriptionMessage("query has no operation".to_string())
                })?,
                None => {
                    return Err(JobsError::InvalidSubscriptionMessage(
                        "operationName is required when the query has several operations"
                            .to_string(),
                    ))
                }
            };
            Ok((Some(selected.0.to_string()), &selected.1.node))
        }
    }
}

/// Arguments of `field` as JSON, with `$variables` substituted
fn field_arguments(field: &Field, variables: &Map<String, Value>) -> Result<Map<String, Value>> {
    let mut arguments = Map::new();
    for (name, value) in &field.arguments {
        let value = value.node.clone().into_const_with(|variable| {
            match variables.get(variable.as_str()) {
                Some(json) => ConstValue::from_json(json.clone()).map_err(JobsError::from),
                None => Ok(ConstValue::Null),
            }
        })?;
        arguments.insert(name.node.to_string(), value.into_json()?);
    }
    Ok(arguments)
}

/// Resolve a subscription query to the stream or command it asks for
///
/// The operation name wins when it names a known stream; otherwise the first
/// root field decides. Anything that would never receive data is rejected.
pub fn subscription_target(
    query: &str,
    operation_name: Option<&str>,
    variables: &Map<String, Value>,
) -> Result<SubscriptionTarget> {
    let document = parse_query(query)
        .map_err(|e| JobsError::InvalidSubscriptionMessage(format!("invalid query: {}", e)))?;
    let (label, operation) = select_operation(&document.operations, operation_name)?;
    let root = first_root_field(operation).ok_or_else(|| {
        JobsError::InvalidSubscriptionMessage("query selects no fields".to_string())
    })?;

    if root.name.node.as_str() == COMMAND_EXECUTE {
        let mut arguments = field_arguments(root, variables)?;
        let command = match arguments.remove("command") {
            Some(Value::String(command)) => command,
            _ => {
                return Err(JobsError::InvalidSubscriptionMessage(
                    "commandExecute needs a string command".to_string(),
                ))
            }
        };
        let params = arguments.remove("params");
        return build_request(command, params).map(SubscriptionTarget::Command);
    }

    label
        .as_deref()
        .and_then(known_stream)
        .or_else(|| known_stream(root.name.node.as_str()))
        .map(SubscriptionTarget::Stream)
        .ok_or_else(|| {
            JobsError::InvalidSubscriptionMessage(format!(
                "no stream for subscription '{}'",
                label.as_deref().unwrap_or(root.name.node.as_str())
            ))
        })
}

/// Payload of one `commandExecute` frame
fn command_payload(output: Result<CommandOutput>) -> Value {
    let output = output.unwrap_or_else(|e| CommandOutput::failed(CommandFailure::from(&e)));
    json!({ "data": output })
}

/// Relay command output to `connection_id` until it finishes or the
/// subscription is ended or replaced
async fn forward_command_output(
    mut outputs: BoxStream<'static, Result<CommandOutput>>,
    connection_id: ConnectionId,
    id: Value,
    registry: SubscriptionRegistry,
) {
    while let Some(output) = outputs.next().await {
        if registry.subscription(connection_id, COMMAND_EXECUTE).await.as_ref() != Some(&id) {
            debug!("command subscription {} on {} ended early", id, connection_id);
            return;
        }
        let frame = ServerMessage::SubscriptionData {
            id: id.clone(),
            payload: command_payload(output),
        };
        if registry.send_to(connection_id, frame).await.is_err() {
            return;
        }
    }

    if registry.subscription(connection_id, COMMAND_EXECUTE).await.as_ref() == Some(&id) {
        registry.unsubscribe(connection_id, COMMAND_EXECUTE).await;
    }
}

async fn start_command(
    request: CommandRequest,
    connection_id: ConnectionId,
    id: Value,
    registry: &SubscriptionRegistry,
    dispatcher: &Dispatcher,
) -> Result<()> {
    let outputs = match dispatcher.dispatch_stream(request).await {
        Ok(outputs) => outputs,
        Err(e) => {
            warn!("Command subscription {} from {} failed: {}", id, connection_id, e);
            return registry
                .send_to(connection_id, ServerMessage::fail(id, e.to_string()))
                .await;
        }
    };

    registry
        .subscribe(connection_id, COMMAND_EXECUTE, id.clone())
        .await?;
    registry
        .send_to(connection_id, ServerMessage::SubscriptionSuccess { id: id.clone() })
        .await?;
    tokio::spawn(forward_command_output(
        outputs,
        connection_id,
        id,
        registry.clone(),
    ));
    Ok(())
}

/// Handle one text frame from `connection_id`
///
/// Protocol errors are answered on the socket; the returned error only
/// reports that the reply itself could not be queued.
pub async fn process_client_message(
    text: &str,
    connection_id: ConnectionId,
    registry: &SubscriptionRegistry,
    dispatcher: &Dispatcher,
) -> Result<()> {
    let value: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(e) => {
            warn!("Malformed frame from {}: {}", connection_id, e);
            let reply = ServerMessage::error(format!("Invalid message format: {}", e));
            return registry.send_to(connection_id, reply).await;
        }
    };

    let id = value.get("id").cloned().unwrap_or(Value::Null);
    let is_start = value.get("type").and_then(Value::as_str) == Some("subscription_start");

    let message = match serde_json::from_value::<ClientMessage>(value) {
        Ok(message) => message,
        Err(e) => {
            warn!("Invalid frame from {}: {}", connection_id, e);
            let reply = if is_start {
                ServerMessage::fail(id, format!("Invalid subscription_start: {}", e))
            } else {
                ServerMessage::error(format!("Invalid message: {}", e))
            };
            return registry.send_to(connection_id, reply).await;
        }
    };

    match message {
        ClientMessage::SubscriptionStart {
            id,
            query,
            operation_name,
            variables,
        } => {
            let variables = match variables {
                Some(Value::Object(variables)) => variables,
                _ => Map::new(),
            };
            match subscription_target(&query, operation_name.as_deref(), &variables) {
                Ok(SubscriptionTarget::Stream(stream)) => {
                    debug!("subscription query for {}: {}", stream, query);
                    registry.subscribe(connection_id, stream, id.clone()).await?;
                    registry
                        .send_to(connection_id, ServerMessage::SubscriptionSuccess { id })
                        .await
                }
                Ok(SubscriptionTarget::Command(request)) => {
                    start_command(request, connection_id, id, registry, dispatcher).await
                }
                Err(e) => {
                    warn!("Rejecting subscription {} from {}: {}", id, connection_id, e);
                    registry
                        .send_to(connection_id, ServerMessage::fail(id, e.to_string()))
                        .await
                }
            }
        }
        ClientMessage::SubscriptionEnd { id } => {
            registry.unsubscribe_id(connection_id, &id).await;
            Ok(())
        }
    }
}

/// Process an individual WebSocket connection
pub async fn handle_socket(
    socket: WebSocket,
    registry: SubscriptionRegistry,
    dispatcher: Arc<Dispatcher>,
) {
    // Split the socket into sender and receiver
    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Frames for this connection are queued here by the registry
    let (tx, mut rx) = mpsc::channel::<ServerMessage>(100);
    let connection_id = registry.open(tx).await;

    let mut send_task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let json = match serde_json::to_string(&message) {
                Ok(json) => json,
                Err(e) => {
                    error!("Failed to serialize message: {}", e);
                    continue;
                }
            };

            if let Err(e) = ws_sender.send(Message::Text(json)).await {
                debug!("WebSocket send failed: {}", e);
                break;
            }
        }
    });

    loop {
        tokio::select! {
            incoming = ws_receiver.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    if let Err(e) = process_client_message(&text, connection_id, &registry, &dispatcher).await {
                        debug!("Could not answer {}: {}", connection_id, e);
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    info!("WebSocket connection closed by client: {}", connection_id);
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("WebSocket error on {}: {}", connection_id, e);
                    break;
                }
            },
            // The writer is gone, nothing more can be delivered
            _ = &mut send_task => break,
        }
    }

    registry.close(connection_id).await;
    send_task.abort();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::scripted_dispatcher;

    fn target(query: &str, operation_name: Option<&str>) -> Result<SubscriptionTarget> {
        subscription_target(query, operation_name, &Map::new())
    }

    #[test]
    fn test_named_operation_selects_its_stream() {
        assert_eq!(
            target("subscription todos { newTodos { id text } }", None).unwrap(),
            SubscriptionTarget::Stream(TODOS_STREAM)
        );
        assert_eq!(
            target("subscription todoToggled { todoToggled { id } }", None).unwrap(),
            SubscriptionTarget::Stream(TODO_TOGGLED_STREAM)
        );
    }

    #[test]
    fn test_anonymous_new_todos_follows_the_todos_stream() {
        assert_eq!(
            target("subscription { newTodos { id } }", None).unwrap(),
            SubscriptionTarget::Stream(TODOS_STREAM)
        );
        assert_eq!(
            target("subscription { todoToggled { id } }", Some("todos")).unwrap(),
            SubscriptionTarget::Stream(TODOS_STREAM)
        );
    }

    #[test]
    fn test_picks_among_several_operations() {
        let query = "subscription a { newTodos { id } } subscription b { todoToggled { id } }";
        assert_eq!(
            target(query, Some("b")).unwrap(),
            SubscriptionTarget::Stream(TODO_TOGGLED_STREAM)
        );
        assert!(target(query, None).is_err());
        assert!(target(query, Some("c")).is_err());
    }

    #[test]
    fn test_unpublished_streams_are_rejected() {
        assert!(matches!(
            target("subscription bogus { noSuchField }", None),
            Err(JobsError::InvalidSubscriptionMessage(_))
        ));
        assert!(matches!(
            target("subscription {", None),
            Err(JobsError::InvalidSubscriptionMessage(_))
        ));
    }

    #[test]
    fn test_command_execute_reads_variables_and_literals() {
        let query = "subscription commandExecute($command: String!) { commandExecute(command: $command) { stdout finished } }";
        let variables = match json!({"command": "countdown"}) {
            Value::Object(variables) => variables,
            _ => unreachable!(),
        };
        assert_eq!(
            subscription_target(query, None, &variables).unwrap(),
            SubscriptionTarget::Command(CommandRequest::new("countdown"))
        );

        let literal = r#"subscription { commandExecute(command: "echo", params: {text: "hi"}) { stdout } }"#;
        assert_eq!(
            target(literal, None).unwrap(),
            SubscriptionTarget::Command(CommandRequest::new("echo").with_param("text", "hi"))
        );

        // the variable was never supplied
        assert!(target(query, None).is_err());
    }

    async fn connection() -> (SubscriptionRegistry, ConnectionId, mpsc::Receiver<ServerMessage>) {
        let registry = SubscriptionRegistry::new();
        let (tx, rx) = mpsc::channel(8);
        let conn = registry.open(tx).await;
        (registry, conn, rx)
    }

    fn no_workers() -> Arc<Dispatcher> {
        scripted_dispatcher(&[], &[])
    }

    #[tokio::test]
    async fn test_start_acknowledges_and_registers() {
        let (registry, conn, mut rx) = connection().await;

        let frame = r#"{"type": "subscription_start", "id": "x", "query": "subscription todos { newTodos { id } }"}"#;
        process_client_message(frame, conn, &registry, &no_workers())
            .await
            .unwrap();

        assert_eq!(
            rx.recv().await,
            Some(ServerMessage::SubscriptionSuccess { id: json!("x") })
        );
        assert_eq!(registry.subscription(conn, "todos").await, Some(json!("x")));
    }

    #[tokio::test]
    async fn test_anonymous_start_receives_published_todos() {
        let (registry, conn, mut rx) = connection().await;

        let frame = r#"{"type": "subscription_start", "id": 2, "query": "subscription { newTodos { id } }"}"#;
        process_client_message(frame, conn, &registry, &no_workers())
            .await
            .unwrap();
        assert_eq!(
            rx.recv().await,
            Some(ServerMessage::SubscriptionSuccess { id: json!(2) })
        );

        assert_eq!(registry.publish(TODOS_STREAM, json!({"data": {"id": "3"}})).await, 1);
        assert_eq!(
            rx.recv().await,
            Some(ServerMessage::SubscriptionData {
                id: json!(2),
                payload: json!({"data": {"id": "3"}}),
            })
        );
    }

    #[tokio::test]
    async fn test_unknown_field_gets_subscription_fail() {
        let (registry, conn, mut rx) = connection().await;

        let frame = r#"{"type": "subscription_start", "id": 5, "query": "subscription bogus { noSuchField }"}"#;
        process_client_message(frame, conn, &registry, &no_workers())
            .await
            .unwrap();

        assert!(matches!(
            rx.recv().await,
            Some(ServerMessage::SubscriptionFail { id, .. }) if id == json!(5)
        ));
        assert_eq!(registry.subscription(conn, "bogus").await, None);
        assert_eq!(registry.subscription(conn, "noSuchField").await, None);
    }

    #[tokio::test]
    async fn test_command_execute_streams_output_frames() {
        let (registry, conn, mut rx) = connection().await;
        let dispatcher = scripted_dispatcher(&[1], &["3", "2", "1"]);

        let frame = json!({
            "type": "subscription_start",
            "id": "cmd",
            "query": "subscription commandExecute($command: String!) { commandExecute(command: $command) { stdout finished timestamp } }",
            "variables": {"command": "countdown"}
        });
        process_client_message(&frame.to_string(), conn, &registry, &dispatcher)
            .await
            .unwrap();

        assert_eq!(
            rx.recv().await,
            Some(ServerMessage::SubscriptionSuccess { id: json!("cmd") })
        );

        let mut lines = Vec::new();
        loop {
            match rx.recv().await {
                Some(ServerMessage::SubscriptionData { id, payload }) => {
                    assert_eq!(id, json!("cmd"));
                    if payload["data"]["finished"] == json!(true) {
                        break;
                    }
                    lines.push(payload["data"]["stdout"].clone());
                }
                other => panic!("unexpected frame: {:?}", other),
            }
        }
        assert_eq!(lines, vec![json!("3"), json!("2"), json!("1")]);

        // the finished subscription is dropped from the registry
        for _ in 0..50 {
            if registry.subscription(conn, COMMAND_EXECUTE).await.is_none() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(registry.subscription(conn, COMMAND_EXECUTE).await, None);
    }

    #[tokio::test]
    async fn test_command_execute_without_workers_fails() {
        let (registry, conn, mut rx) = connection().await;

        let frame = r#"{"type": "subscription_start", "id": 7, "query": "subscription { commandExecute(command: \"date\") { stdout } }"}"#;
        process_client_message(frame, conn, &registry, &no_workers())
            .await
            .unwrap();

        match rx.recv().await {
            Some(ServerMessage::SubscriptionFail { id, payload }) => {
                assert_eq!(id, json!(7));
                assert_eq!(payload["errors"][0]["message"], "No workers available");
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_end_removes_by_id() {
        let (registry, conn, _rx) = connection().await;
        registry.subscribe(conn, "todos", json!(4)).await.unwrap();

        let end = r#"{"type": "subscription_end", "id": 4}"#;
        process_client_message(end, conn, &registry, &no_workers())
            .await
            .unwrap();
        process_client_message(end, conn, &registry, &no_workers())
            .await
            .unwrap();

        assert_eq!(registry.subscription(conn, "todos").await, None);
    }

    #[tokio::test]
    async fn test_bad_query_gets_subscription_fail() {
        let (registry, conn, mut rx) = connection().await;

        let frame = r#"{"type": "subscription_start", "id": 9, "query": "not graphql"}"#;
        process_client_message(frame, conn, &registry, &no_workers())
            .await
            .unwrap();

        match rx.recv().await {
            Some(ServerMessage::SubscriptionFail { id, payload }) => {
                assert_eq!(id, json!(9));
                assert!(payload["errors"][0]["message"].is_string());
            }
            other => panic!("unexpected frame: {:?}", other),
        }
        assert_eq!(registry.subscription(conn, "todos").await, None);
    }

    #[tokio::test]
    async fn test_unknown_type_and_garbage_get_error_frames() {
        let (registry, conn, mut rx) = connection().await;
        let dispatcher = no_workers();

        process_client_message(r#"{"type": "bogus", "id": 1}"#, conn, &registry, &dispatcher)
            .await
            .unwrap();
        process_client_message("{not json", conn, &registry, &dispatcher)
            .await
            .unwrap();

        for _ in 0..2 {
            assert!(matches!(rx.recv().await, Some(ServerMessage::Error { .. })));
        }
        assert!(registry.is_open(conn).await);
    }
}
