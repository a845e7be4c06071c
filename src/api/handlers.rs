// HTTP handlers for the REST endpoints

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderMap},
    Json,
};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::types::ErrorResponse;
use crate::engine::dispatcher::Dispatcher;
use crate::models::CommandRequest;

/// Run one command on the next job worker - POST /command
///
/// Accepts a JSON object or a urlencoded form. `command` names the command;
/// every other field is passed to it as a parameter. The worker's reply is
/// returned unchanged.
pub async fn run_command(
    State(dispatcher): State<Arc<Dispatcher>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ErrorResponse> {
    let request = parse_command_request(&headers, &body)?;
    debug!("POST /command: {}", request.command);

    match dispatcher.dispatch(request).await {
        Ok(reply) => Ok(Json(reply)),
        Err(e) => {
            warn!("/command failed: {}", e);
            Err(e.into())
        }
    }
}

fn is_form(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map_or(false, |value| {
            value.starts_with("application/x-www-form-urlencoded")
        })
}

/// Build a command request from a JSON or form body
fn parse_command_request(headers: &HeaderMap, body: &[u8]) -> Result<CommandRequest, ErrorResponse> {
    let mut fields: Map<String, Value> = if is_form(headers) {
        url::form_urlencoded::parse(body)
            .map(|(name, value)| (name.into_owned(), Value::String(value.into_owned())))
            .collect()
    } else {
        match serde_json::from_slice(body) {
            Ok(Value::Object(fields)) => fields,
            Ok(_) => return Err(ErrorResponse::bad_request("Request body must be a JSON object")),
            Err(e) => return Err(ErrorResponse::bad_request(format!("Invalid JSON body: {}", e))),
        }
    };

    let command = match fields.remove("command") {
        Some(Value::String(command)) if !command.trim().is_empty() => command,
        Some(_) => return Err(ErrorResponse::bad_request("'command' must be a non-empty string")),
        None => return Err(ErrorResponse::bad_request("Missing 'command' field")),
    };

    CommandRequest::new(command)
        .with_params(Value::Object(fields))
        .map_err(ErrorResponse::from)
}
