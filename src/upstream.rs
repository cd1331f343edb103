use crate::config::GatewayConfig;
use crate::identity::Identity;
use crate::openai::ChatRequest;
use crate::proxy::ProxyManager;
use axum::http::StatusCode;
use serde_json::{Value, json};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamErrorKind {
    Network,
    Http,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct UpstreamCallError {
    pub kind: UpstreamErrorKind,
    pub status: Option<StatusCode>,
    pub message: String,
}

impl UpstreamCallError {
    pub fn new(kind: UpstreamErrorKind, status: Option<StatusCode>, message: String) -> Self {
        Self {
            kind,
            status,
            message,
        }
    }

    pub fn cancelled() -> Self {
        Self::new(
            UpstreamErrorKind::Cancelled,
            None,
            "request cancelled".to_string(),
        )
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == UpstreamErrorKind::Cancelled
    }
}

/// The backend's request schema: the translated conversation plus the
/// rotated identity pair. The conversation id is the backend's
/// idempotency/session key.
pub fn build_backend_body(request: &ChatRequest, identity: &Identity, backend_model: &str) -> Value {
    json!({
        "model": backend_model,
        "messages": request.messages,
        "stream": request.stream,
        "caller_id": identity.caller_id,
        "conversation_id": identity.conversation_id,
    })
}

/// Issues one backend call. A proxy supplied by the manager is used when a
/// proxied client can be built for it; any failure there falls back to the
/// shared direct client rather than failing the call.
pub async fn call_backend(
    client: &reqwest::Client,
    proxies: &ProxyManager,
    config: &GatewayConfig,
    body: &Value,
) -> Result<reqwest::Response, UpstreamCallError> {
    let proxy_url = proxies.pick();
    let proxied_client = proxy_url.as_deref().and_then(|url| {
        match build_proxied_client(url) {
            Ok(client) => Some(client),
            Err(err) => {
                tracing::warn!(proxy = url, error = %err, "proxy client build failed, using direct connection");
                proxies.report_failure(url);
                None
            }
        }
    });
    let via_proxy = proxied_client.is_some();
    let client_for_call = proxied_client.as_ref().unwrap_or(client);

    let url = join_url(&config.backend_base_url, "/chat");
    let mut req = client_for_call
        .post(url)
        .timeout(std::time::Duration::from_millis(config.request_timeout_ms))
        .json(body);
    if let Some(token) = config.backend_token.as_deref() {
        req = req.bearer_auth(token);
    }

    let resp = match req.send().await {
        Ok(resp) => resp,
        Err(err) => {
            if via_proxy {
                if let Some(url) = proxy_url.as_deref() {
                    proxies.report_failure(url);
                }
            }
            return Err(UpstreamCallError::new(
                UpstreamErrorKind::Network,
                None,
                err.to_string(),
            ));
        }
    };
    if via_proxy {
        if let Some(url) = proxy_url.as_deref() {
            proxies.report_success(url);
        }
    }

    let status = resp.status();
    if !status.is_success() {
        let text = resp.text().await.unwrap_or_default();
        return Err(UpstreamCallError::new(
            UpstreamErrorKind::Http,
            Some(status),
            format!("backend status {}: {}", status, text),
        ));
    }
    Ok(resp)
}

fn build_proxied_client(proxy_url: &str) -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder()
        .user_agent("linegate/0.1")
        .proxy(reqwest::Proxy::all(proxy_url)?)
        .build()
}

fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::openai::ChatMessage;

    #[test]
    fn backend_body_carries_identity_and_mapped_model() {
        let request = ChatRequest {
            model: "gpt-4o".to_string(),
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: "hi".to_string(),
            }],
            stream: true,
        };
        let identity = Identity {
            caller_id: "caller-1".to_string(),
            conversation_id: "conv-abc".to_string(),
        };
        let body = build_backend_body(&request, &identity, "prime-v2");
        assert_eq!(body["model"], "prime-v2");
        assert_eq!(body["stream"], true);
        assert_eq!(body["caller_id"], "caller-1");
        assert_eq!(body["conversation_id"], "conv-abc");
        assert_eq!(body["messages"][0]["content"], "hi");
    }

    #[test]
    fn join_url_handles_trailing_slashes() {
        assert_eq!(join_url("http://b/", "/chat"), "http://b/chat");
        assert_eq!(join_url("http://b", "chat"), "http://b/chat");
    }
}
