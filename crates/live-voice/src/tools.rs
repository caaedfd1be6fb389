//! Tool-call routing: remote function calls in, correlated responses out.
//!
//! Every routed request produces exactly one [`ToolCallResponse`] carrying the request id,
//! including unknown names ("unsupported") and failing or panicking handlers (error result).

use async_trait::async_trait;
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Error type returned by handlers.
pub type ToolError = Box<dyn std::error::Error + Send + Sync>;

/// A function call requested by the remote service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    /// Opaque correlation id chosen by the remote side.
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub args: serde_json::Value,
}

/// The single answer to a [`ToolCallRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallResponse {
    pub id: String,
    pub name: String,
    /// `{"result": ...}` on success, `{"error": "..."}` otherwise.
    pub response: serde_json::Value,
}

impl ToolCallResponse {
    pub fn success(request: &ToolCallRequest, result: serde_json::Value) -> Self {
        Self {
            id: request.id.clone(),
            name: request.name.clone(),
            response: serde_json::json!({ "result": result }),
        }
    }

    pub fn failure(request: &ToolCallRequest, message: impl Into<String>) -> Self {
        Self {
            id: request.id.clone(),
            name: request.name.clone(),
            response: serde_json::json!({ "error": message.into() }),
        }
    }

    pub fn is_error(&self) -> bool {
        self.response.get("error").is_some()
    }
}

/// Schema advertised to the remote service at connect time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDeclaration {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Host logic invoked for a named tool call.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// Function name the remote service calls.
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    /// JSON schema for `args`.
    fn parameters(&self) -> serde_json::Value {
        serde_json::json!({ "type": "object", "properties": {} })
    }

    async fn call(&self, args: serde_json::Value) -> Result<serde_json::Value, ToolError>;
}

/// Callback receiving a navigation destination.
pub type OnNavigate = Arc<dyn Fn(String) + Send + Sync>;

/// `navigateToSector`: forwards `args.destination` to the host.
pub struct NavigateHandler {
    on_navigate: OnNavigate,
}

impl NavigateHandler {
    pub const NAME: &'static str = "navigateToSector";

    pub fn new(on_navigate: OnNavigate) -> Self {
        Self { on_navigate }
    }
}

#[async_trait]
impl ToolHandler for NavigateHandler {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn description(&self) -> &str {
        "Navigate the user to a specific sector or tool of the app."
    }

    fn parameters(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "destination": {
                    "type": "string",
                    "description": "Identifier of the view to open."
                }
            },
            "required": ["destination"]
        })
    }

    async fn call(&self, args: serde_json::Value) -> Result<serde_json::Value, ToolError> {
        let destination = args
            .get("destination")
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or("Missing 'destination' parameter")?;
        (self.on_navigate)(destination.to_string());
        Ok(serde_json::json!("Navigation Successful"))
    }
}

/// Name-keyed handler registry. Register before the session opens; cloning is cheap.
#[derive(Clone, Default)]
pub struct ToolCallRouter {
    handlers: HashMap<String, Arc<dyn ToolHandler>>,
}

impl ToolCallRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. Replaces any existing handler with the same name.
    pub fn register(&mut self, handler: Arc<dyn ToolHandler>) {
        let name = handler.name().to_string();
        if self.handlers.insert(name.clone(), handler).is_some() {
            warn!(tool = %name, "Replaced existing tool handler");
        }
    }

    pub fn with_handler(mut self, handler: Arc<dyn ToolHandler>) -> Self {
        self.register(handler);
        self
    }

    pub fn has(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Declarations for every registered handler, sorted by name.
    pub fn declarations(&self) -> Vec<ToolDeclaration> {
        let mut decls: Vec<ToolDeclaration> = self
            .handlers
            .values()
            .map(|h| ToolDeclaration {
                name: h.name().to_string(),
                description: h.description().to_string(),
                parameters: h.parameters(),
            })
            .collect();
        decls.sort_by(|a, b| a.name.cmp(&b.name));
        decls
    }

    /// Run the handler for `request` and build its response. Never fails: unknown
    /// names, handler errors and handler panics all become error results.
    pub async fn handle(&self, request: &ToolCallRequest) -> ToolCallResponse {
        let Some(handler) = self.handlers.get(&request.name).cloned() else {
            warn!(call_id = %request.id, tool = %request.name, "No handler for tool call");
            return ToolCallResponse::failure(
                request,
                format!("unsupported tool: {}", request.name),
            );
        };

        let fut = AssertUnwindSafe(handler.call(request.args.clone()));
        match fut.catch_unwind().await {
            Ok(Ok(result)) => {
                debug!(call_id = %request.id, tool = %request.name, "Tool call succeeded");
                ToolCallResponse::success(request, result)
            }
            Ok(Err(e)) => {
                warn!(call_id = %request.id, tool = %request.name, error = %e, "Tool handler failed");
                ToolCallResponse::failure(request, e.to_string())
            }
            Err(_) => {
                warn!(call_id = %request.id, tool = %request.name, "Tool handler panicked");
                ToolCallResponse::failure(
                    request,
                    format!("tool '{}' panicked during execution", request.name),
                )
            }
        }
    }

    /// Handle `request` on its own task and send the response to `responses`, unless
    /// `cancel` fired first, in which case the late response is discarded.
    pub fn dispatch(
        &self,
        request: ToolCallRequest,
        responses: mpsc::Sender<ToolCallResponse>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let router = self.clone();
        info!(call_id = %request.id, tool = %request.name, "Dispatching tool call");
        tokio::spawn(async move {
            let response = router.handle(&request).await;
            if cancel.is_cancelled() {
                debug!(call_id = %response.id, "Session closed; discarding late tool response");
                return;
            }
            if responses.send(response).await.is_err() {
                debug!(call_id = %request.id, "Response channel closed; tool response dropped");
            }
        })
    }
}

impl std::fmt::Debug for ToolCallRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.handlers.keys().collect();
        names.sort();
        f.debug_struct("ToolCallRouter")
            .field("handlers", &names)
            .finish()
    }
}
