//! # JSON-RPC 2.0 over UDP
//!
//! Each datagram carries exactly one envelope. Requests are answered to the
//! sending address; `status_update` notifications (no `id`) are pushed over
//! the same socket by the transport sender task, fed from the subscription
//! manager's outbound queue.

use std::collections::BTreeMap;
use std::io;
use std::sync::Arc;

use holyrig_types::Value;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as Json};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::dispatch::Dispatcher;
use crate::rig::RigError;
use crate::subscribe::{Datagram, SubscribeError};

/// JSON-RPC error codes used by the service.
pub mod codes {
    pub const PARSE_ERROR: i32 = -32700;
    pub const INVALID_REQUEST: i32 = -32600;
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;
    pub const INTERNAL_ERROR: i32 = -32603;
    pub const RIG_COMMUNICATION_ERROR: i32 = -32000;
    pub const INVALID_COMMAND_PARAMETERS: i32 = -32001;
    pub const SUBSCRIPTION_ERROR: i32 = -32002;
    pub const UNKNOWN_RIG_ID: i32 = -32003;
}

/// A parsed request envelope.
#[derive(Debug, Deserialize)]
pub struct Request {
    pub jsonrpc: String,
    #[serde(default)]
    pub id: Option<Json>,
    pub method: String,
    #[serde(default)]
    pub params: Json,
}

#[derive(Debug, Serialize)]
pub struct Response {
    jsonrpc: &'static str,
    id: Json,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Json>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ErrorObject>,
}

#[derive(Clone, Debug, Serialize)]
pub struct ErrorObject {
    pub code: i32,
    pub message: String,
}

impl Response {
    pub fn result(id: Json, result: Json) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: Json, failure: RpcFailure) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: None,
            error: Some(ErrorObject {
                code: failure.code,
                message: failure.message,
            }),
        }
    }
}

/// A dispatch failure, already mapped to its JSON-RPC error code.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RpcFailure {
    pub code: i32,
    pub message: String,
}

impl RpcFailure {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(codes::METHOD_NOT_FOUND, format!("unknown method `{method}`"))
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(codes::INVALID_PARAMS, message)
    }

    pub fn unknown_rig(rig_id: &str) -> Self {
        Self::new(codes::UNKNOWN_RIG_ID, format!("unknown rig `{rig_id}`"))
    }
}

impl From<RigError> for RpcFailure {
    fn from(error: RigError) -> Self {
        let code = if error.is_invalid_params() {
            codes::INVALID_COMMAND_PARAMETERS
        } else {
            codes::RIG_COMMUNICATION_ERROR
        };
        Self::new(code, error.to_string())
    }
}

impl From<SubscribeError> for RpcFailure {
    fn from(error: SubscribeError) -> Self {
        Self::new(codes::SUBSCRIPTION_ERROR, error.to_string())
    }
}

/// Renders one `status_update` notification datagram.
pub fn status_update_payload(
    rig_id: &str,
    subscription_id: &str,
    updates: &BTreeMap<String, Value>,
) -> serde_json::Result<Vec<u8>> {
    serde_json::to_vec(&json!({
        "jsonrpc": "2.0",
        "method": "status_update",
        "params": {
            "rig_id": rig_id,
            "subscription_id": subscription_id,
            "updates": updates,
        },
    }))
}

/// Serves RPC on `socket` until the socket errors.
///
/// Requests are handled concurrently; per-rig ordering is preserved by the
/// rig command queues, not by the transport.
pub async fn serve(
    socket: UdpSocket,
    dispatcher: Arc<Dispatcher>,
    mut outbound: mpsc::Receiver<Datagram>,
) -> io::Result<()> {
    let socket = Arc::new(socket);

    let push_socket = socket.clone();
    tokio::spawn(async move {
        while let Some(datagram) = outbound.recv().await {
            if let Err(error) = push_socket.send_to(&datagram.payload, datagram.peer).await {
                warn!(peer = %datagram.peer, %error, "failed to push notification");
            }
        }
    });

    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let (len, peer) = socket.recv_from(&mut buf).await?;
        let data = buf[..len].to_vec();
        let dispatcher = dispatcher.clone();
        let socket = socket.clone();

        tokio::spawn(async move {
            let Some(response) = handle_datagram(&dispatcher, &data, peer).await else {
                return;
            };
            match serde_json::to_vec(&response) {
                Ok(payload) => {
                    if let Err(error) = socket.send_to(&payload, peer).await {
                        warn!(%peer, %error, "failed to send response");
                    }
                }
                Err(error) => warn!(%peer, %error, "failed to render response"),
            }
        });
    }
}

/// Parses and dispatches one datagram; `None` means nothing to send back.
pub async fn handle_datagram(
    dispatcher: &Dispatcher,
    data: &[u8],
    peer: std::net::SocketAddr,
) -> Option<Response> {
    let request: Request = match serde_json::from_slice(data) {
        Ok(request) => request,
        Err(error) => {
            debug!(%peer, %error, "unparseable datagram");
            return Some(Response::error(
                Json::Null,
                RpcFailure::new(codes::PARSE_ERROR, "parse error"),
            ));
        }
    };

    if request.jsonrpc != "2.0" {
        return Some(Response::error(
            request.id.unwrap_or(Json::Null),
            RpcFailure::new(codes::INVALID_REQUEST, "jsonrpc must be \"2.0\""),
        ));
    }

    let outcome = dispatcher.dispatch(&request.method, request.params, peer).await;

    // Requests without an id are notifications; execute but do not answer.
    let id = request.id?;
    Some(match outcome {
        Ok(result) => Response::result(id, result),
        Err(failure) => Response::error(id, failure),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_update_payload_shape() {
        let mut updates = BTreeMap::new();
        updates.insert("freq".to_owned(), Value::Int(14_250_000));
        updates.insert("mode".to_owned(), Value::Enum("USB".into()));

        let payload = status_update_payload("ic7300", "sub_3", &updates).unwrap();
        let json: Json = serde_json::from_slice(&payload).unwrap();

        assert_eq!("2.0", json["jsonrpc"]);
        assert_eq!("status_update", json["method"]);
        assert!(json.get("id").is_none());
        assert_eq!("ic7300", json["params"]["rig_id"]);
        assert_eq!("sub_3", json["params"]["subscription_id"]);
        assert_eq!(14_250_000, json["params"]["updates"]["freq"]);
        assert_eq!("USB", json["params"]["updates"]["mode"]);
    }

    #[test]
    fn test_response_shape() {
        let ok = Response::result(json!(7), json!({"success": true}));
        let rendered = serde_json::to_value(&ok).unwrap();
        assert_eq!(json!({"jsonrpc": "2.0", "id": 7, "result": {"success": true}}), rendered);

        let err = Response::error(json!(8), RpcFailure::unknown_rig("nope"));
        let rendered = serde_json::to_value(&err).unwrap();
        assert_eq!(codes::UNKNOWN_RIG_ID, rendered["error"]["code"]);
        assert!(rendered.get("result").is_none());
    }
}
