use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, StatusCode};
use tracing::{debug, instrument, warn};

use sluice_core::{Gate, GateError, GateOutcome};

#[derive(Clone, Debug)]
pub struct GateConfig {
    /// Admission Controller base URL, without the `/messages` path.
    pub base_url: String,
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".into(),
            request_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// Calls `POST {base}/messages` once per message. Never retries.
pub struct HttpGate {
    client: Client,
    messages_url: String,
    root_url: String,
    request_timeout: Duration,
}

impl HttpGate {
    pub fn new(config: GateConfig) -> Result<Self, GateError> {
        let base = config.base_url.trim_end_matches('/');
        reqwest::Url::parse(base).map_err(|e| GateError::InvalidUrl(format!("{base}: {e}")))?;
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| GateError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            messages_url: format!("{base}/messages"),
            root_url: format!("{base}/"),
            request_timeout: config.request_timeout,
        })
    }

    fn classify(&self, e: reqwest::Error) -> GateError {
        if e.is_timeout() {
            GateError::Timeout(self.request_timeout)
        } else {
            GateError::Transport(e.to_string())
        }
    }

    /// `GET {base}/`, returning the response text. Used as a startup
    /// reachability check.
    pub async fn probe(&self) -> Result<String, GateError> {
        let resp = self.client.get(&self.root_url).send().await.map_err(|e| self.classify(e))?;
        resp.text().await.map_err(|e| GateError::Body(e.to_string()))
    }
}

/// JSON request for a raw message body: an object that already carries a
/// string `message` is forwarded as-is, anything else is wrapped.
pub fn request_body(body: &[u8]) -> Vec<u8> {
    let forward = serde_json::from_slice::<serde_json::Value>(body)
        .map(|v| v.get("message").is_some_and(|m| m.is_string()))
        .unwrap_or(false);
    if forward {
        return body.to_vec();
    }
    let wrapped = serde_json::json!({ "message": String::from_utf8_lossy(body) });
    wrapped.to_string().into_bytes()
}

#[async_trait]
impl Gate for HttpGate {
    #[instrument(skip_all, fields(url = %self.messages_url))]
    async fn send(&self, body: &[u8]) -> GateOutcome {
        let result = self
            .client
            .post(&self.messages_url)
            .header(CONTENT_TYPE, "application/json")
            .body(request_body(body))
            .send()
            .await;
        let resp = match result {
            Ok(resp) => resp,
            Err(e) => return GateOutcome::Failed(self.classify(e)),
        };

        // The status line alone decides the outcome; a broken body is only logged.
        let status = resp.status();
        let text = match resp.text().await {
            Ok(text) => text,
            Err(e) => {
                warn!(status = status.as_u16(), error = %e, "failed to read gate response body");
                String::new()
            }
        };
        debug!(status = status.as_u16(), "gate responded");

        if status == StatusCode::TOO_MANY_REQUESTS {
            GateOutcome::Throttled { body: text }
        } else {
            GateOutcome::Admitted { status: status.as_u16(), body: text }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn gate(base_url: String) -> HttpGate {
        HttpGate::new(GateConfig {
            base_url,
            request_timeout: Duration::from_millis(500),
            connect_timeout: Duration::from_millis(500),
        })
        .unwrap()
    }

    #[test]
    fn message_objects_are_forwarded_unchanged() {
        let raw = br#"{"message":"hello","sessionId":"s1"}"#;
        assert_eq!(request_body(raw), raw.to_vec());
    }

    #[test]
    fn other_bodies_are_wrapped() {
        let wrapped: serde_json::Value = serde_json::from_slice(&request_body(b"plain text")).unwrap();
        assert_eq!(wrapped, serde_json::json!({"message": "plain text"}));

        let wrapped: serde_json::Value = serde_json::from_slice(&request_body(br#"{"message":5}"#)).unwrap();
        assert_eq!(wrapped["message"], r#"{"message":5}"#);
    }

    #[test]
    fn invalid_base_url_is_rejected() {
        let err = HttpGate::new(GateConfig { base_url: "not a url".into(), ..GateConfig::default() })
            .err()
            .unwrap();
        assert_eq!(err.error_kind(), "invalid_url");
    }

    #[tokio::test]
    async fn ok_response_is_admitted() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/messages"))
            .and(header("content-type", "application/json"))
            .and(body_json(serde_json::json!({"message": "hi"})))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"success":true}"#))
            .expect(1)
            .mount(&server)
            .await;

        let outcome = gate(server.uri()).send(b"hi").await;
        assert!(matches!(outcome, GateOutcome::Admitted { status: 200, ref body } if body.contains("success")));
    }

    #[tokio::test]
    async fn too_many_requests_is_throttled() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/messages"))
            .respond_with(ResponseTemplate::new(429).set_body_string("Rate limit exceeded."))
            .mount(&server)
            .await;

        let outcome = gate(server.uri()).send(b"hi").await;
        assert_eq!(outcome.kind(), "throttled");
    }

    /// Serve one response whose body is cut short of its content length.
    async fn truncated_response(status_line: &'static str) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4096];
            let _ = socket.read(&mut buf).await;
            let head = format!("HTTP/1.1 {status_line}\r\ncontent-length: 100\r\n\r\nshort");
            socket.write_all(head.as_bytes()).await.unwrap();
            socket.shutdown().await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn throttled_status_wins_over_broken_body() {
        let base = truncated_response("429 Too Many Requests").await;
        let outcome = gate(base).send(b"hi").await;
        assert!(matches!(outcome, GateOutcome::Throttled { ref body } if body.is_empty()));
    }

    #[tokio::test]
    async fn admitted_status_wins_over_broken_body() {
        let base = truncated_response("200 OK").await;
        let outcome = gate(base).send(b"hi").await;
        assert!(matches!(outcome, GateOutcome::Admitted { status: 200, .. }));
    }

    #[tokio::test]
    async fn other_error_statuses_are_admitted() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400))
            .mount(&server)
            .await;
        let outcome = gate(server.uri()).send(b"hi").await;
        assert!(matches!(outcome, GateOutcome::Admitted { status: 400, .. }));
    }

    #[tokio::test]
    async fn server_error_is_admitted_too() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        assert!(gate(server.uri()).send(b"hi").await.is_admitted());
    }

    #[tokio::test]
    async fn slow_response_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(3)))
            .mount(&server)
            .await;
        let outcome = gate(server.uri()).send(b"hi").await;
        assert!(matches!(outcome, GateOutcome::Failed(GateError::Timeout(_))));
    }

    #[tokio::test]
    async fn refused_connection_fails() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let outcome = gate(format!("http://{addr}")).send(b"hi").await;
        assert!(matches!(outcome, GateOutcome::Failed(GateError::Transport(_))));
    }

    #[tokio::test]
    async fn probe_reads_root() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_string("welcome"))
            .mount(&server)
            .await;
        assert_eq!(gate(format!("{}/", server.uri())).probe().await.unwrap(), "welcome");
    }
}
