//! Outbound HTTP collaborator and the `action` node built on it.

use crate::executor::{node_config, NodeExecutor};
use async_trait::async_trait;
use orchcore::expression::value_to_string;
use orchcore::{NodeContext, NodeError, NodeExecutionResult, NodeSpec};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub enum HttpAuth {
    Bearer(String),
    Basic { username: String, password: String },
}

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: String,
    pub url: String,
    pub headers: HashMap<String, String>,
    pub body: Option<Value>,
    pub auth: Option<HttpAuth>,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
    pub headers: HashMap<String, String>,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Issues the calls made by `action` nodes
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, NodeError>;
}

/// `HttpClient` over a shared `reqwest::Client`
pub struct ReqwestClient {
    client: reqwest::Client,
}

impl ReqwestClient {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for ReqwestClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HttpClient for ReqwestClient {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, NodeError> {
        let method = reqwest::Method::from_bytes(request.method.to_uppercase().as_bytes())
            .map_err(|_| NodeError::Configuration(format!("Unsupported method: {}", request.method)))?;

        let mut builder = self
            .client
            .request(method, &request.url)
            .timeout(request.timeout);
        for (key, value) in &request.headers {
            builder = builder.header(key, value);
        }
        builder = match &request.auth {
            Some(HttpAuth::Bearer(token)) => builder.bearer_auth(token),
            Some(HttpAuth::Basic { username, password }) => builder.basic_auth(username, Some(password)),
            None => builder,
        };
        builder = match &request.body {
            Some(Value::String(text)) => builder.body(text.clone()),
            Some(body) => builder.json(body),
            None => builder,
        };

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                NodeError::Timeout {
                    seconds: request.timeout.as_secs(),
                }
            } else if e.is_connect() {
                NodeError::ExecutionFailed(format!("Connection error: {}", e))
            } else {
                NodeError::ExecutionFailed(format!("HTTP request failed: {}", e))
            }
        })?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or("").to_string()))
            .collect();
        let body = response
            .text()
            .await
            .map_err(|e| NodeError::ExecutionFailed(format!("Failed to read response: {}", e)))?;

        Ok(HttpResponse {
            status,
            body,
            headers,
        })
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ActionConfig {
    #[serde(alias = "actionType")]
    action_type: Option<String>,
    method: Option<String>,
    url: Option<String>,
    headers: HashMap<String, Value>,
    body: Option<Value>,
    payload: Option<Value>,
    auth: Option<AuthConfig>,
    script: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum AuthConfig {
    Bearer {
        token: String,
    },
    Basic {
        username: String,
        #[serde(default)]
        password: String,
    },
}

impl NodeExecutor<'_> {
    pub(crate) async fn action(&mut self, node: &NodeSpec, ctx: &mut NodeContext) -> Result<NodeExecutionResult, NodeError> {
        let config: ActionConfig = node_config(node)?;
        let action_type = config.action_type.clone().unwrap_or_else(|| "http".to_string());
        match action_type.as_str() {
            "http" => {
                let method = config.method.clone().unwrap_or_else(|| "GET".to_string());
                let body = config.body.as_ref().map(|b| self.render_value(b, &ctx.variables));
                self.call(node, ctx, method, config, body).await
            }
            "webhook" => {
                let payload = match &config.payload {
                    Some(payload) => self.render_value(payload, &ctx.variables),
                    None => json!(ctx.variables),
                };
                self.call(node, ctx, "POST".to_string(), config, Some(payload)).await
            }
            "script" => {
                let script = config
                    .script
                    .ok_or_else(|| NodeError::Configuration(format!("No script configured for action {}", node.id)))?;
                let result = self.evaluator.evaluate(&script, &ctx.variables);
                Ok(NodeExecutionResult::completed().with_output(json!({ "result": result })))
            }
            other => Err(NodeError::Configuration(format!(
                "Unsupported action type '{}' on {}",
                other, node.id
            ))),
        }
    }

    async fn call(
        &self,
        node: &NodeSpec,
        ctx: &NodeContext,
        method: String,
        config: ActionConfig,
        body: Option<Value>,
    ) -> Result<NodeExecutionResult, NodeError> {
        let url = config
            .url
            .ok_or_else(|| NodeError::Configuration(format!("No url configured for action {}", node.id)))?;
        let url = self.evaluator.substitute(&url, &ctx.variables);
        let headers = config
            .headers
            .iter()
            .map(|(k, v)| (k.clone(), self.evaluator.substitute(&value_to_string(v), &ctx.variables)))
            .collect();
        let auth = config.auth.map(|auth| match auth {
            AuthConfig::Bearer { token } => HttpAuth::Bearer(self.evaluator.substitute(&token, &ctx.variables)),
            AuthConfig::Basic { username, password } => HttpAuth::Basic {
                username: self.evaluator.substitute(&username, &ctx.variables),
                password: self.evaluator.substitute(&password, &ctx.variables),
            },
        });

        ctx.events.info(format!("{} {}", method, url));
        let response = self
            .http
            .send(HttpRequest {
                method,
                url,
                headers,
                body,
                auth,
                timeout: Duration::from_secs(self.config.http_timeout_secs),
            })
            .await?;

        let body = truncate(&response.body, self.config.response_body_limit);
        let success = response.is_success();
        let output = json!({
            "status_code": response.status,
            "body": body,
            "success": success,
        });
        if success {
            Ok(NodeExecutionResult::completed().with_output(output))
        } else {
            Ok(NodeExecutionResult::failed(format!("HTTP {}: {}", response.status, body)).with_output(output))
        }
    }
}

fn truncate(text: &str, limit: usize) -> String {
    match text.char_indices().nth(limit) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}
