//! JSON-RPC front-end
//!
//! Maps method names onto orchestrator calls through a fixed table. Every
//! request yields exactly one response: a result or an error body, never
//! both.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::container::{LogSink, Orchestrator, SessionError};

/// Error codes carried in [`RpcErrorBody::code`]
pub mod codes {
    pub const PARSE_ERROR: i32 = -32700;
    pub const UNKNOWN_METHOD: i32 = 1;
    pub const INVALID_PARAMS: i32 = 2;
    pub const HANDLER_ERROR: i32 = 3;
}

/// JSON-RPC 2.0 request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    #[serde(default)]
    pub jsonrpc: Option<String>,
    #[serde(default)]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default)]
    pub params: Option<Value>,
}

/// JSON-RPC 2.0 response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    pub id: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcErrorBody>,
}

/// JSON-RPC error object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcErrorBody {
    pub code: i32,
    pub message: String,
}

impl RpcResponse {
    pub fn success(id: Option<Value>, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: Option<Value>, code: i32, message: String) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(RpcErrorBody { code, message }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct NewSessionParams {
    pub image: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ExecParams {
    pub session_id: Uuid,
    pub command: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CloseParams {
    pub session_id: Uuid,
}

/// Every callable method with its decoded parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Method {
    Ping,
    NewSession(NewSessionParams),
    Exec(ExecParams),
    Close(CloseParams),
    List,
}

impl Method {
    pub const PING: &'static str = "ping";
    pub const NEW_SESSION: &'static str = "session.new";
    pub const EXEC: &'static str = "session.exec";
    pub const CLOSE: &'static str = "session.close";
    pub const LIST: &'static str = "session.list";

    /// Resolve a method name and decode its parameters
    pub fn parse(name: &str, params: Option<Value>) -> Result<Self, RpcErrorBody> {
        match name {
            Self::PING => Ok(Self::Ping),
            Self::NEW_SESSION => decode(params).map(Self::NewSession),
            Self::EXEC => decode(params).map(Self::Exec),
            Self::CLOSE => decode(params).map(Self::Close),
            Self::LIST => Ok(Self::List),
            other => Err(RpcErrorBody {
                code: codes::UNKNOWN_METHOD,
                message: format!("method not allowed: {}", other),
            }),
        }
    }
}

fn decode<T: DeserializeOwned>(params: Option<Value>) -> Result<T, RpcErrorBody> {
    serde_json::from_value(params.unwrap_or(Value::Null)).map_err(|e| RpcErrorBody {
        code: codes::INVALID_PARAMS,
        message: e.to_string(),
    })
}

/// Executes decoded requests against an [`Orchestrator`]
pub struct Dispatcher {
    orchestrator: Arc<Orchestrator>,
    sink_capacity: usize,
}

impl Dispatcher {
    pub fn new(orchestrator: Arc<Orchestrator>, sink_capacity: usize) -> Self {
        Self {
            orchestrator,
            sink_capacity: sink_capacity.max(1),
        }
    }

    /// Handle one raw request document
    pub async fn handle_line(&self, line: &str) -> RpcResponse {
        match serde_json::from_str::<RpcRequest>(line) {
            Ok(request) => self.handle(request).await,
            Err(e) => RpcResponse::error(None, codes::PARSE_ERROR, format!("Parse error: {}", e)),
        }
    }

    pub async fn handle(&self, request: RpcRequest) -> RpcResponse {
        debug!(method = %request.method, "RPC request received");

        let method = match Method::parse(&request.method, request.params) {
            Ok(method) => method,
            Err(body) => return RpcResponse::error(request.id, body.code, body.message),
        };

        match self.call(method).await {
            Ok(result) => RpcResponse::success(request.id, result),
            Err(e) => RpcResponse::error(request.id, codes::HANDLER_ERROR, e.to_string()),
        }
    }

    async fn call(&self, method: Method) -> Result<Value, SessionError> {
        match method {
            Method::Ping => Ok(json!({ "text": "pong" })),
            Method::NewSession(params) => {
                let sink = self.output_sink(&params.image);
                let session = self.orchestrator.new_session(&params.image, sink).await?;
                Ok(json!({
                    "session_id": session.session_id,
                    "container_name": session.container_name,
                }))
            }
            Method::Exec(params) => {
                self.orchestrator
                    .exec(&params.session_id, &params.command)
                    .await?;
                Ok(json!({ "ok": true }))
            }
            Method::Close(params) => {
                self.orchestrator.close_session(&params.session_id).await?;
                Ok(json!({ "ok": true }))
            }
            Method::List => Ok(json!({
                "sessions": self.orchestrator.session_ids().await,
                "images": self.orchestrator.catalog_tags().await,
            })),
        }
    }

    /// Sink for an RPC-created session: each record becomes a log event
    fn output_sink(&self, image: &str) -> LogSink {
        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(self.sink_capacity);
        let image = image.to_string();
        tokio::spawn(async move {
            while let Some(record) = rx.recv().await {
                info!(
                    target: "sandcell::output",
                    image = %image,
                    line = %String::from_utf8_lossy(&record),
                    "Session output"
                );
            }
        });
        tx
    }
}
