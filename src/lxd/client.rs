//! LXD REST client.
//!
//! Implements [`LxdApi`] over HTTPS with `reqwest`. Mutating calls (image
//! fetch, container create/start/stop/delete) return background operations;
//! the client waits for those to settle before returning, so callers observe
//! a completed action. Exec submissions are returned as soon as the server
//! accepts them.

use super::{
    ContainerStatus, ExecHandle, ExecRequest, ImageAlias, ImageInfo, ImageSource, LxdApi,
    LxdError, OperationStatus, Result,
};
use crate::config::LxdConfig;
use crate::env;
use async_trait::async_trait;
use reqwest::{Client, Identity, RequestBuilder};
use serde::Deserialize;
use serde_json::{Value, json};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

/// Seconds the server waits for a container to shut down cleanly before
/// the stop is forced.
const STATE_CHANGE_TIMEOUT_SECS: u64 = 30;

/// Operation status codes at or above this value are final.
const FINAL_STATUS_CODE: u16 = 200;

/// Operation status codes at or above this value are failures.
const FAILURE_STATUS_CODE: u16 = 400;

/// Response envelope every LXD endpoint wraps its payload in.
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    operation: Option<String>,
    #[serde(default)]
    error_code: u16,
    #[serde(default)]
    error: String,
    #[serde(default)]
    metadata: Value,
}

/// Background operation as returned by `/1.0/operations/{id}`.
#[derive(Debug, Deserialize)]
struct Operation {
    id: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    status_code: u16,
    #[serde(default)]
    metadata: Option<Value>,
    #[serde(default)]
    err: String,
}

/// LXD API client.
#[derive(Clone)]
pub struct LxdClient {
    http: Client,
    base: Url,
    operation_timeout: Duration,
}

impl LxdClient {
    /// Create a client from configuration.
    ///
    /// The configured client certificate and key are presented when both
    /// files exist; otherwise the client connects anonymously and the server
    /// decides whether to trust it.
    ///
    /// # Errors
    ///
    /// Returns error if the certificate files cannot be read or parsed, or the
    /// HTTP client cannot be built.
    pub fn from_config(config: &LxdConfig) -> Result<Self> {
        let mut builder = Client::builder().danger_accept_invalid_certs(!config.verify_ssl);

        if let Some(identity) = load_identity(&config.client_cert, &config.client_key)? {
            builder = builder.identity(identity);
        }

        let http = builder.build()?;
        info!("LXD client configured for {}", config.api);

        Ok(Self::with_http_client(
            http,
            config.api.clone(),
            config.timing.operation_timeout,
        ))
    }

    /// Create a client around an existing HTTP client.
    pub fn with_http_client(http: Client, base: Url, operation_timeout: Duration) -> Self {
        Self {
            http,
            base,
            operation_timeout,
        }
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        endpoint_url(&self.base, segments)
    }

    fn alias_endpoint(&self, alias: &str) -> Result<Url> {
        let mut segments = vec!["images", "aliases"];
        segments.extend(alias.split('/'));
        self.endpoint(&segments)
    }

    async fn send(&self, request: RequestBuilder, what: &str) -> Result<Envelope> {
        let response = request.send().await?;
        let status = response.status().as_u16();
        let body = response.bytes().await?;
        parse_envelope(status, &body, what)
    }

    /// Wait for the operation an async response refers to.
    async fn wait_for_operation(&self, envelope: Envelope) -> Result<Operation> {
        let id = operation_id(&envelope)?;
        let operation = self.wait_operation_by_id(&id).await?;

        if operation.status_code < FINAL_STATUS_CODE {
            return Err(LxdError::OperationFailed {
                id,
                message: format!(
                    "still {} after {:?}",
                    operation.status, self.operation_timeout
                ),
            });
        }

        Ok(operation)
    }

    async fn wait_operation_by_id(&self, id: &str) -> Result<Operation> {
        let mut url = self.endpoint(&["operations", id, "wait"])?;
        url.query_pairs_mut()
            .append_pair("timeout", &self.operation_timeout.as_secs().to_string());

        let envelope = self
            .send(self.http.get(url), &format!("operation {}", id))
            .await?;
        let operation: Operation = serde_json::from_value(envelope.metadata)?;

        if operation.status_code >= FAILURE_STATUS_CODE {
            return Err(LxdError::OperationFailed {
                id: operation.id,
                message: operation.err,
            });
        }

        debug!("Operation {} is {}", operation.id, operation.status);
        Ok(operation)
    }

    async fn change_state(&self, name: &str, action: &str) -> Result<()> {
        let url = self.endpoint(&["containers", name, "state"])?;
        let body = json!({
            "action": action,
            "timeout": STATE_CHANGE_TIMEOUT_SECS,
            "force": action == "stop",
        });

        let envelope = self
            .send(self.http.put(url).json(&body), &format!("container {}", name))
            .await?;
        self.wait_for_operation(envelope).await?;
        Ok(())
    }
}

#[async_trait]
impl LxdApi for LxdClient {
    fn base_url(&self) -> &Url {
        &self.base
    }

    async fn image_by_alias(&self, alias: &str) -> Result<ImageAlias> {
        let url = self.alias_endpoint(alias)?;
        let envelope = self
            .send(self.http.get(url), &format!("image alias {}", alias))
            .await?;

        let target = envelope
            .metadata
            .get("target")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                LxdError::UnexpectedResponse(format!("alias {} has no target", alias))
            })?;

        Ok(ImageAlias {
            name: alias.to_string(),
            target: target.to_string(),
        })
    }

    async fn create_image_from_remote(
        &self,
        source: &ImageSource,
        alias: &str,
    ) -> Result<ImageInfo> {
        info!("Fetching image {} from {}", alias, source.server);

        let url = self.endpoint(&["images"])?;
        let body = json!({
            "source": {
                "type": "image",
                "mode": "pull",
                "server": source.server.as_str(),
                "protocol": source.protocol,
                "alias": alias,
            }
        });

        let envelope = self
            .send(self.http.post(url).json(&body), &format!("image {}", alias))
            .await?;
        let operation = self.wait_for_operation(envelope).await?;

        let fingerprint = operation
            .metadata
            .as_ref()
            .and_then(|metadata| metadata.get("fingerprint"))
            .and_then(Value::as_str)
            .ok_or_else(|| {
                LxdError::UnexpectedResponse(format!(
                    "image fetch for {} returned no fingerprint",
                    alias
                ))
            })?;

        Ok(ImageInfo {
            fingerprint: fingerprint.to_string(),
        })
    }

    async fn create_image_alias(&self, fingerprint: &str, alias: &str) -> Result<()> {
        let url = self.endpoint(&["images", "aliases"])?;
        let body = json!({ "name": alias, "target": fingerprint });

        match self
            .send(self.http.post(url).json(&body), &format!("image alias {}", alias))
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if is_conflict(&e) => {
                debug!("Alias {} already exists, retargeting to {}", alias, fingerprint);
                let url = self.alias_endpoint(alias)?;
                let body = json!({ "target": fingerprint, "description": "" });
                self.send(self.http.put(url).json(&body), &format!("image alias {}", alias))
                    .await?;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn create_container(&self, name: &str, fingerprint: &str) -> Result<()> {
        let url = self.endpoint(&["containers"])?;
        let body = json!({
            "name": name,
            "source": { "type": "image", "fingerprint": fingerprint },
        });

        let envelope = self
            .send(self.http.post(url).json(&body), &format!("container {}", name))
            .await?;
        self.wait_for_operation(envelope).await?;
        Ok(())
    }

    async fn start_container(&self, name: &str) -> Result<()> {
        self.change_state(name, "start").await
    }

    async fn stop_container(&self, name: &str) -> Result<()> {
        self.change_state(name, "stop").await
    }

    async fn delete_container(&self, name: &str) -> Result<()> {
        let url = self.endpoint(&["containers", name])?;
        let envelope = self
            .send(self.http.delete(url), &format!("container {}", name))
            .await?;
        self.wait_for_operation(envelope).await?;
        Ok(())
    }

    async fn container_status(&self, name: &str) -> Result<ContainerStatus> {
        let url = self.endpoint(&["containers", name])?;
        let envelope = self
            .send(self.http.get(url), &format!("container {}", name))
            .await?;

        let status = envelope
            .metadata
            .get("status")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                LxdError::UnexpectedResponse(format!("container {} has no status", name))
            })?;

        Ok(ContainerStatus::parse(status))
    }

    async fn execute_command(&self, name: &str, request: &ExecRequest) -> Result<ExecHandle> {
        let url = self.endpoint(&["containers", name, "exec"])?;
        let body = json!({
            "command": request.command,
            "environment": request.environment,
            "interactive": request.interactive,
            "wait-for-websocket": request.wait_for_websocket,
            "record-output": false,
        });

        let envelope = self
            .send(self.http.post(url).json(&body), &format!("container {}", name))
            .await?;
        exec_handle(envelope)
    }

    async fn operation_status(&self, operation_id: &str) -> Result<OperationStatus> {
        let operation = self.wait_operation_by_id(operation_id).await?;
        let metadata = operation.metadata.unwrap_or(Value::Null);

        Ok(OperationStatus {
            status: operation.status,
            exit_code: metadata.get("return").and_then(Value::as_i64),
            exit_signal: metadata.get("signal").and_then(Value::as_i64),
        })
    }

    async fn push_file(&self, name: &str, path: &str, data: Vec<u8>) -> Result<()> {
        let url = self.endpoint(&["containers", name, "files"])?;
        debug!("Pushing {} bytes to {}:{}", data.len(), name, path);

        let request = self
            .http
            .post(url)
            .query(&[("path", path)])
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(data);

        self.send(request, &format!("container {}", name)).await?;
        Ok(())
    }

    async fn pull_file(&self, name: &str, path: &str) -> Result<Vec<u8>> {
        let url = self.endpoint(&["containers", name, "files"])?;
        let response = self.http.get(url).query(&[("path", path)]).send().await?;

        let status = response.status();
        let body = response.bytes().await?;

        if status.is_success() {
            debug!("Pulled {} bytes from {}:{}", body.len(), name, path);
            return Ok(body.to_vec());
        }

        // Failures come back as a regular error envelope.
        match parse_envelope(status.as_u16(), &body, &format!("file {}:{}", name, path)) {
            Err(e) => Err(e),
            Ok(_) => Err(LxdError::Api {
                status: status.as_u16(),
                message: String::from_utf8_lossy(&body).into_owned(),
            }),
        }
    }
}

/// Load a TLS client identity from PEM certificate and key files.
fn load_identity(cert: &Path, key: &Path) -> Result<Option<Identity>> {
    if !cert.exists() || !key.exists() {
        warn!(
            "Client certificate {:?} or key {:?} not found, connecting without a client identity",
            cert, key
        );
        return Ok(None);
    }

    let mut pem = std::fs::read(cert)?;
    pem.push(b'\n');
    pem.extend(std::fs::read(key)?);

    Ok(Some(Identity::from_pem(&pem)?))
}

/// Build `{base}/1.0/{segments...}`, percent-encoding each segment.
pub(crate) fn endpoint_url(base: &Url, segments: &[&str]) -> Result<Url> {
    let mut url = base.clone();
    url.set_query(None);
    {
        let mut path = url
            .path_segments_mut()
            .map_err(|_| LxdError::InvalidEndpoint(base.to_string()))?;
        path.pop_if_empty().push(env::lxd::API_VERSION).extend(segments);
    }
    Ok(url)
}

fn parse_envelope(status: u16, body: &[u8], what: &str) -> Result<Envelope> {
    if status == 404 {
        return Err(LxdError::NotFound(what.to_string()));
    }

    let envelope: Envelope = match serde_json::from_slice(body) {
        Ok(envelope) => envelope,
        Err(_) if status >= 400 => {
            return Err(LxdError::Api {
                status,
                message: String::from_utf8_lossy(body).into_owned(),
            });
        }
        Err(e) => return Err(LxdError::Json(e)),
    };

    if envelope.kind == "error" || status >= 400 {
        let code = if envelope.error_code != 0 {
            envelope.error_code
        } else {
            status
        };

        if code == 404 {
            return Err(LxdError::NotFound(what.to_string()));
        }

        return Err(LxdError::Api {
            status: code,
            message: envelope.error,
        });
    }

    Ok(envelope)
}

fn operation_id(envelope: &Envelope) -> Result<String> {
    if let Some(id) = envelope.metadata.get("id").and_then(Value::as_str) {
        return Ok(id.to_string());
    }

    envelope
        .operation
        .as_deref()
        .unwrap_or_default()
        .rsplit('/')
        .next()
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .ok_or_else(|| {
            LxdError::UnexpectedResponse(format!(
                "expected a background operation, got a {} response",
                envelope.kind
            ))
        })
}

fn exec_handle(envelope: Envelope) -> Result<ExecHandle> {
    let operation_id = operation_id(&envelope)?;
    // Interactive execs multiplex stdin/stdout/stderr on fd 0.
    let stream_secret = envelope
        .metadata
        .pointer("/metadata/fds/0")
        .and_then(Value::as_str)
        .map(str::to_string);

    Ok(ExecHandle {
        stream_secret,
        operation_id,
    })
}

fn is_conflict(error: &LxdError) -> bool {
    match error {
        LxdError::Api { status, message } => {
            *status == 409 || message.to_lowercase().contains("already exists")
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Url {
        Url::parse("https://lxd.local:8443").unwrap()
    }

    #[test]
    fn test_endpoint_url() {
        let url = endpoint_url(&base(), &["containers", "build-1", "state"]).unwrap();
        assert_eq!(url.as_str(), "https://lxd.local:8443/1.0/containers/build-1/state");

        let url = endpoint_url(&Url::parse("https://lxd.local:8443/").unwrap(), &["images"])
            .unwrap();
        assert_eq!(url.as_str(), "https://lxd.local:8443/1.0/images");
    }

    #[test]
    fn test_endpoint_url_encodes_segments() {
        let url = endpoint_url(&base(), &["containers", "a b"]).unwrap();
        assert_eq!(url.as_str(), "https://lxd.local:8443/1.0/containers/a%20b");
    }

    #[test]
    fn test_parse_sync_envelope() {
        let body = br#"{"type":"sync","status":"Success","status_code":200,"operation":"","error_code":0,"error":"","metadata":{"status":"Running"}}"#;
        let envelope = parse_envelope(200, body, "container").unwrap();
        assert_eq!(envelope.kind, "sync");
        assert_eq!(envelope.metadata["status"], "Running");
    }

    #[test]
    fn test_parse_error_envelope() {
        let body = br#"{"type":"error","error":"Container is running","error_code":400,"metadata":null}"#;
        match parse_envelope(400, body, "container") {
            Err(LxdError::Api { status, message }) => {
                assert_eq!(status, 400);
                assert_eq!(message, "Container is running");
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_parse_not_found() {
        let result = parse_envelope(404, b"", "image alias ubuntu/trusty");
        assert!(matches!(result, Err(LxdError::NotFound(_))));

        let body = br#"{"type":"error","error":"not found","error_code":404}"#;
        let result = parse_envelope(200, body, "alias");
        assert!(matches!(result, Err(LxdError::NotFound(_))));
    }

    #[test]
    fn test_parse_non_json_error() {
        let result = parse_envelope(502, b"Bad Gateway", "container");
        assert!(matches!(result, Err(LxdError::Api { status: 502, .. })));
    }

    #[test]
    fn test_exec_handle_from_async_response() {
        let body = br#"{
            "type": "async",
            "status": "Operation created",
            "status_code": 100,
            "operation": "/1.0/operations/8f6d2c1e",
            "metadata": {
                "id": "8f6d2c1e",
                "class": "websocket",
                "metadata": { "fds": { "0": "stream-secret", "control": "control-secret" } }
            }
        }"#;

        let handle = exec_handle(parse_envelope(202, body, "exec").unwrap()).unwrap();
        assert_eq!(handle.operation_id, "8f6d2c1e");
        assert_eq!(handle.stream_secret.as_deref(), Some("stream-secret"));
    }

    #[test]
    fn test_operation_id_falls_back_to_path() {
        let body = br#"{"type":"async","operation":"/1.0/operations/abc123","metadata":null}"#;
        let envelope = parse_envelope(202, body, "op").unwrap();
        assert_eq!(operation_id(&envelope).unwrap(), "abc123");

        let body = br#"{"type":"sync","metadata":{}}"#;
        let envelope = parse_envelope(200, body, "op").unwrap();
        assert!(operation_id(&envelope).is_err());
    }

    #[test]
    fn test_conflict_detection() {
        assert!(is_conflict(&LxdError::Api {
            status: 409,
            message: String::new()
        }));
        assert!(is_conflict(&LxdError::Api {
            status: 400,
            message: "Alias already exists".to_string()
        }));
        assert!(!is_conflict(&LxdError::NotFound("x".to_string())));
    }

    #[test]
    fn test_missing_identity_is_not_an_error() {
        let identity = load_identity(
            Path::new("/nonexistent/client.crt"),
            Path::new("/nonexistent/client.key"),
        )
        .unwrap();
        assert!(identity.is_none());
    }
}
