use std::collections::HashMap;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};

use crate::node::{Node, PortDefinition, ProcessContext};
use crate::types::PortType;

const DEFAULT_TIMEOUT_SECONDS: u64 = 30;

/// HTTP client node. The request await is a suspension point: the run's
/// cancel token is observed there, so cancelling a run abandons the
/// request instead of blocking the scheduler.
pub struct HttpRequestNode;

impl HttpRequestNode {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Node for HttpRequestNode {
    fn node_type(&self) -> &str {
        "HttpRequest"
    }

    fn input_ports(&self) -> Vec<PortDefinition> {
        vec![
            PortDefinition::required("url", PortType::String),
            PortDefinition::with_default("method", PortType::String, json!("GET")).with_options(
                vec![json!("GET"), json!("POST"), json!("PUT"), json!("DELETE")],
            ),
            PortDefinition::optional("body", PortType::Json),
            PortDefinition::optional("headers", PortType::Object),
            PortDefinition::with_default(
                "timeout_seconds",
                PortType::Number,
                json!(DEFAULT_TIMEOUT_SECONDS),
            ),
        ]
    }

    fn output_ports(&self) -> Vec<PortDefinition> {
        vec![
            PortDefinition::required("status", PortType::Number),
            PortDefinition::optional("body", PortType::Any),
        ]
    }

    async fn process(
        &mut self,
        inputs: &HashMap<String, Value>,
        ctx: &ProcessContext,
    ) -> Result<HashMap<String, Value>> {
        let url = inputs
            .get("url")
            .and_then(Value::as_str)
            .context("HttpRequest: input 'url' must be a string")?;
        let method = inputs
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or("GET");
        let timeout_seconds = inputs
            .get("timeout_seconds")
            .and_then(Value::as_u64)
            .unwrap_or(DEFAULT_TIMEOUT_SECONDS);

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_seconds))
            .build()
            .context("HttpRequest: failed to build client")?;

        let mut request = match method {
            "GET" => client.get(url),
            "POST" => client.post(url),
            "PUT" => client.put(url),
            "DELETE" => client.delete(url),
            other => bail!("HttpRequest: unsupported method '{other}'"),
        };

        if let Some(headers) = inputs.get("headers").and_then(Value::as_object) {
            for (name, value) in headers {
                let value = value
                    .as_str()
                    .map(str::to_string)
                    .unwrap_or_else(|| value.to_string());
                request = request.header(name, value);
            }
        }

        if let Some(body) = inputs.get("body") {
            request = request.json(body);
        }

        let response = tokio::select! {
            response = request.send() => {
                response.with_context(|| format!("HttpRequest: {method} {url} failed"))?
            }
            _ = ctx.cancel.cancelled() => {
                bail!("HttpRequest: cancelled while awaiting {url}")
            }
        };

        let status = response.status().as_u16();
        let text = tokio::select! {
            text = response.text() => {
                text.context("HttpRequest: failed to read response body")?
            }
            _ = ctx.cancel.cancelled() => {
                bail!("HttpRequest: cancelled while reading response from {url}")
            }
        };

        let body = serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text));

        Ok(HashMap::from([
            ("status".to_string(), json!(status)),
            ("body".to_string(), body),
        ]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::NodeRegistry;
    use std::sync::Arc;

    fn ctx() -> ProcessContext {
        ProcessContext::new(Arc::new(NodeRegistry::new()))
    }

    #[tokio::test]
    async fn test_rejects_unsupported_method() {
        let mut node = HttpRequestNode::new();
        let inputs = HashMap::from([
            ("url".to_string(), json!("http://127.0.0.1:1/never")),
            ("method".to_string(), json!("BREW")),
        ]);

        let err = node
            .process(&inputs, &ctx())
            .await
            .expect_err("unsupported method should fail");
        assert!(err.to_string().contains("unsupported method 'BREW'"));
    }

    #[tokio::test]
    async fn test_cancelled_before_send_aborts_request() {
        let mut node = HttpRequestNode::new();
        let context = ctx();
        context.cancel.cancel();

        // Unroutable address: without cancellation this would wait out the
        // connect timeout.
        let inputs = HashMap::from([("url".to_string(), json!("http://10.255.255.1:9/slow"))]);

        let err = node
            .process(&inputs, &context)
            .await
            .expect_err("cancelled request should fail");
        assert!(err.to_string().contains("cancelled"));
    }
}
