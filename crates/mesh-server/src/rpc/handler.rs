//! JSON-RPC 2.0 endpoint of the bridge.
//!
//! Each `bus_*` method takes one [`RpcRequest`] (bare or as `params[0]`) and
//! returns an [`RpcResponse`]. Bus-level failures travel in-band in
//! `RpcResponse.error`; only malformed calls get a JSON-RPC error object.

use crate::domain::error::{ApiError, ApiResult};
use crate::server::Server;
use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde_json::Value;
use shared_types::rpc::{
    METHOD_PING, METHOD_POLL, METHOD_PUBLISH, METHOD_PUBLISH_TO_ID, METHOD_REMOVE_TOPIC,
    METHOD_SUBSCRIBE, METHOD_UNSUBSCRIBE,
};
use shared_types::{RpcRequest, RpcResponse};
use tracing::{debug, trace};

/// Handle JSON-RPC request
pub async fn handle_json_rpc(State(server): State<Server>, body: String) -> impl IntoResponse {
    let request: Value = match serde_json::from_str(&body) {
        Ok(v) => v,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(error_response(Value::Null, ApiError::unreadable_body(&e))),
            );
        }
    };

    let response = match request {
        Value::Array(requests) if requests.is_empty() => {
            error_response(Value::Null, ApiError::empty_batch())
        }
        Value::Array(requests) => Value::Array(
            requests
                .iter()
                .map(|req| process_single_request(&server, req))
                .collect(),
        ),
        single => process_single_request(&server, &single),
    };

    (StatusCode::OK, Json(response))
}

/// Process a single JSON-RPC request
fn process_single_request(server: &Server, request: &Value) -> Value {
    let id = request.get("id").cloned().unwrap_or(Value::Null);

    if !(id.is_string() || id.is_number()) {
        return error_response(Value::Null, ApiError::bad_call_id());
    }

    let Some(method) = request.get("method").and_then(|m| m.as_str()) else {
        return error_response(id, ApiError::method_missing());
    };
    let params = request.get("params");

    match route_method(server, method, params) {
        Ok(value) => serde_json::json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": value
        }),
        Err(e) => error_response(id, e),
    }
}

/// Route a `bus_*` method to the bridge.
fn route_method(server: &Server, method: &str, params: Option<&Value>) -> ApiResult<Value> {
    let bridge = server.rpc();
    let req: RpcRequest = match method {
        METHOD_PING | METHOD_SUBSCRIBE | METHOD_UNSUBSCRIBE | METHOD_PUBLISH
        | METHOD_PUBLISH_TO_ID | METHOD_REMOVE_TOPIC | METHOD_POLL => parse_param(params, 0)?,
        _ => return Err(ApiError::unknown_method(method)),
    };
    trace!(method, from = ?req.from, topic = ?req.topic, "RPC call");

    let outcome = match method {
        METHOD_PING => bridge.ping(server, &req),
        METHOD_SUBSCRIBE => bridge.subscribe(server, &req),
        METHOD_UNSUBSCRIBE => bridge.unsubscribe(server, &req),
        METHOD_PUBLISH => bridge.publish(server, &req),
        METHOD_PUBLISH_TO_ID => bridge.publish_to_id(server, &req),
        METHOD_REMOVE_TOPIC => bridge.remove_topic(server, &req),
        _ => bridge.poll(&req),
    };

    let response = outcome.unwrap_or_else(|e| {
        debug!(method, error = %e, "RPC call rejected");
        RpcResponse::error(e.to_string())
    });
    serde_json::to_value(response).map_err(|e| ApiError::unencodable(&e))
}

/// Parse a parameter from JSON-RPC params (array or bare object).
fn parse_param<T: serde::de::DeserializeOwned>(params: Option<&Value>, index: usize) -> ApiResult<T> {
    let param = params
        .and_then(|p| {
            if p.is_array() {
                p.get(index)
            } else if index == 0 {
                Some(p)
            } else {
                None
            }
        })
        .ok_or_else(|| ApiError::bad_request_object(format!("nothing at params[{index}]")))?;

    serde_json::from_value(param.clone()).map_err(ApiError::bad_request_object)
}

fn error_response(id: Value, error: ApiError) -> Value {
    serde_json::json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": error.to_json()
    })
}
