//! Verification endpoint adapter.
//!
//! Uploads one still per call as multipart form data with a bearer token and
//! maps the reply onto [`VerificationOutcome`]. The token comes from a
//! [`CredentialProvider`] supplied at construction.

use crate::types::{Identity, StillFrame, TransportError, VerificationOutcome};
use chrono::{DateTime, NaiveDateTime, Utc};
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use serde_json::Value;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Used when no API URL is configured.
pub const DEFAULT_API_URL: &str = "http://127.0.0.1:8000";
pub const VERIFY_PATH: &str = "/attendance/verify";

const UPLOAD_FIELD: &str = "image";
const UPLOAD_FILE_STEM: &str = "scan";

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("failed to build HTTP client: {0}")]
    Build(#[from] reqwest::Error),
}

/// Source of the bearer token attached to verification calls.
pub trait CredentialProvider: Send + Sync {
    /// `None` means not logged in; the client then skips the network call.
    fn bearer_token(&self) -> Option<String>;
}

/// A fixed token, or none at all.
pub struct StaticCredential(Option<String>);

impl StaticCredential {
    pub fn new(token: impl Into<String>) -> Self {
        Self(non_blank(token.into()))
    }

    pub fn none() -> Self {
        Self(None)
    }
}

impl CredentialProvider for StaticCredential {
    fn bearer_token(&self) -> Option<String> {
        self.0.clone()
    }
}

/// Reads the token from a file on every call, so a fresh login is picked up
/// without restarting the scanner.
pub struct TokenFile {
    path: PathBuf,
}

impl TokenFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl CredentialProvider for TokenFile {
    fn bearer_token(&self) -> Option<String> {
        match std::fs::read_to_string(&self.path) {
            Ok(contents) => non_blank(contents),
            Err(e) => {
                tracing::debug!(path = %self.path.display(), error = %e, "token file unreadable");
                None
            }
        }
    }
}

fn non_blank(raw: String) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// One network round-trip per attempt. Never retries internally.
pub trait VerificationClient: Send + Sync + 'static {
    fn verify(&self, frame: &StillFrame) -> impl Future<Output = VerificationOutcome> + Send;
}

/// Prefix `https://` when no scheme is given and drop trailing slashes.
pub fn normalize_base_url(raw: &str) -> String {
    let trimmed = raw.trim();
    let with_scheme = if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    };
    with_scheme.trim_end_matches('/').to_string()
}

/// HTTP implementation against `POST {base}/attendance/verify`.
pub struct HttpVerificationClient {
    http: reqwest::Client,
    endpoint: String,
    credentials: Arc<dyn CredentialProvider>,
}

impl HttpVerificationClient {
    pub fn new(
        base_url: &str,
        credentials: Arc<dyn CredentialProvider>,
        timeout: Duration,
    ) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        let endpoint = format!("{}{VERIFY_PATH}", normalize_base_url(base_url));
        tracing::debug!(endpoint = %endpoint, timeout_ms = timeout.as_millis() as u64, "verification client ready");
        Ok(Self {
            http,
            endpoint,
            credentials,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl VerificationClient for HttpVerificationClient {
    async fn verify(&self, frame: &StillFrame) -> VerificationOutcome {
        let Some(token) = self.credentials.bearer_token() else {
            return VerificationOutcome::TransportError(TransportError::Unauthenticated);
        };

        let part = match Part::bytes(frame.data.clone())
            .file_name(upload_file_name(&frame.mime_type))
            .mime_str(&frame.mime_type)
        {
            Ok(part) => part,
            Err(e) => {
                return VerificationOutcome::TransportError(TransportError::Request(format!(
                    "invalid frame MIME type {:?}: {e}",
                    frame.mime_type
                )))
            }
        };
        let form = Form::new().part(UPLOAD_FIELD, part);

        let response = match self
            .http
            .post(&self.endpoint)
            .bearer_auth(&token)
            .multipart(form)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => return VerificationOutcome::TransportError(TransportError::Network(e.to_string())),
        };

        let status = response.status().as_u16();
        match response.text().await {
            Ok(body) => interpret_response(status, &body),
            Err(e) => VerificationOutcome::TransportError(TransportError::Network(e.to_string())),
        }
    }
}

#[derive(Debug, Deserialize)]
struct VerifyBody {
    success: Option<bool>,
    student: Option<StudentBody>,
    attendance: Option<AttendanceBody>,
    confidence: Option<f32>,
}

#[derive(Debug, Deserialize)]
struct StudentBody {
    id: Value,
    name: String,
}

#[derive(Debug, Deserialize)]
struct AttendanceBody {
    id: Option<Value>,
    timestamp: Option<String>,
}

/// Error payloads: the service's own `{"error": ...}` or the auth layer's `{"msg": ...}`.
#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    error: Option<String>,
    msg: Option<String>,
}

/// Map a status code and raw body onto an outcome.
fn interpret_response(status: u16, body: &str) -> VerificationOutcome {
    if (200..300).contains(&status) {
        let parsed = match serde_json::from_str::<VerifyBody>(body) {
            Ok(parsed) => parsed,
            Err(e) => {
                return VerificationOutcome::TransportError(TransportError::MalformedResponse(
                    e.to_string(),
                ))
            }
        };
        if parsed.success == Some(false) {
            return VerificationOutcome::Unmatched;
        }
        let Some(student) = parsed.student else {
            return VerificationOutcome::TransportError(TransportError::MalformedResponse(
                "response has no student".into(),
            ));
        };
        let Some(id) = id_string(&student.id) else {
            return VerificationOutcome::TransportError(TransportError::MalformedResponse(format!(
                "unusable student id: {}",
                student.id
            )));
        };
        let (attendance_id, server_timestamp) = match parsed.attendance {
            Some(a) => (
                a.id.as_ref().and_then(id_string),
                a.timestamp.as_deref().and_then(parse_server_timestamp),
            ),
            None => (None, None),
        };
        return VerificationOutcome::Matched {
            identity: Identity::new(id, student.name),
            confidence: parsed.confidence,
            server_timestamp,
            attendance_id,
        };
    }

    if status >= 500 {
        return VerificationOutcome::TransportError(TransportError::Status(status));
    }

    let error_body: ErrorBody = serde_json::from_str(body).unwrap_or_default();
    if matches!(status, 401 | 422) && error_body.error.is_none() && error_body.msg.is_some() {
        return VerificationOutcome::TransportError(TransportError::Unauthenticated);
    }

    if error_body.error.is_some() {
        tracing::debug!(status, error = ?error_body.error, "verification rejected");
        return VerificationOutcome::Unmatched;
    }

    tracing::warn!(status, "unexpected error response from verification endpoint");
    VerificationOutcome::TransportError(TransportError::Status(status))
}

/// `scan.<ext>` with the extension taken from the MIME subtype.
fn upload_file_name(mime_type: &str) -> String {
    let subtype = mime_type
        .split(';')
        .next()
        .and_then(|essence| essence.split_once('/'))
        .map(|(_, subtype)| subtype.trim().to_ascii_lowercase())
        .unwrap_or_default();
    let ext = match subtype.as_str() {
        "jpeg" | "pjpeg" | "" => "jpg",
        other => other,
    };
    format!("{UPLOAD_FILE_STEM}.{ext}")
}

fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// RFC 3339, or a naive ISO-8601 timestamp taken as UTC.
fn parse_server_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const MATCH_BODY: &str = r#"{
        "success": true,
        "student": {"id": 42, "name": "Ada Lovelace"},
        "attendance": {"id": 9, "status": "Present", "timestamp": "2024-03-04T09:15:00.123456"}
    }"#;

    fn frame() -> StillFrame {
        StillFrame::jpeg(vec![0xFF, 0xD8, 0xFF, 0xD9])
    }

    fn client(url: &str, credentials: impl CredentialProvider + 'static) -> HttpVerificationClient {
        HttpVerificationClient::new(url, Arc::new(credentials), Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_normalize_base_url() {
        assert_eq!(normalize_base_url("http://127.0.0.1:8000/"), "http://127.0.0.1:8000");
        assert_eq!(normalize_base_url("api.example.com"), "https://api.example.com");
        assert_eq!(normalize_base_url(" https://x.io// "), "https://x.io");
    }

    #[test]
    fn test_endpoint_path() {
        let c = client("example.com/", StaticCredential::none());
        assert_eq!(c.endpoint(), "https://example.com/attendance/verify");
    }

    #[test]
    fn test_static_credential_blank_is_none() {
        assert_eq!(StaticCredential::new("  ").bearer_token(), None);
        assert_eq!(StaticCredential::new(" tok\n").bearer_token().as_deref(), Some("tok"));
    }

    #[test]
    fn test_token_file_missing_is_none() {
        let provider = TokenFile::new("/nonexistent/rollcall/token");
        assert_eq!(provider.bearer_token(), None);
    }

    #[test]
    fn test_token_file_reread_each_call() {
        let path = std::env::temp_dir().join(format!("rollcall-token-{}", std::process::id()));
        let provider = TokenFile::new(&path);
        std::fs::write(&path, "first\n").unwrap();
        assert_eq!(provider.bearer_token().as_deref(), Some("first"));
        std::fs::write(&path, "second").unwrap();
        assert_eq!(provider.bearer_token().as_deref(), Some("second"));
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_interpret_match() {
        match interpret_response(200, MATCH_BODY) {
            VerificationOutcome::Matched {
                identity,
                confidence,
                server_timestamp,
                attendance_id,
            } => {
                assert_eq!(identity, Identity::new("42", "Ada Lovelace"));
                assert_eq!(confidence, None);
                assert_eq!(attendance_id.as_deref(), Some("9"));
                let ts = server_timestamp.expect("timestamp parsed");
                assert_eq!((ts.year(), ts.month(), ts.day()), (2024, 3, 4));
                assert_eq!((ts.hour(), ts.minute()), (9, 15));
            }
            other => panic!("expected match, got {other:?}"),
        }
    }

    #[test]
    fn test_interpret_match_with_confidence_and_string_id() {
        let body = r#"{"student": {"id": "s-1", "name": "Grace"}, "confidence": 0.91}"#;
        match interpret_response(200, body) {
            VerificationOutcome::Matched {
                identity,
                confidence,
                server_timestamp,
                ..
            } => {
                assert_eq!(identity.id, "s-1");
                assert!((confidence.unwrap() - 0.91).abs() < 1e-6);
                assert!(server_timestamp.is_none());
            }
            other => panic!("expected match, got {other:?}"),
        }
    }

    #[test]
    fn test_interpret_success_without_student_is_malformed() {
        assert!(matches!(
            interpret_response(200, r#"{"success": true}"#),
            VerificationOutcome::TransportError(TransportError::MalformedResponse(_))
        ));
        assert!(matches!(
            interpret_response(200, "<html>tunnel warning</html>"),
            VerificationOutcome::TransportError(TransportError::MalformedResponse(_))
        ));
    }

    #[test]
    fn test_interpret_not_recognized() {
        let body = r#"{"success": false, "error": "Face not recognized"}"#;
        assert_eq!(interpret_response(401, body), VerificationOutcome::Unmatched);
        assert_eq!(
            interpret_response(400, r#"{"error": "No image provided"}"#),
            VerificationOutcome::Unmatched
        );
    }

    #[test]
    fn test_interpret_non_service_error_is_transport() {
        assert_eq!(
            interpret_response(404, "<html><body>Not Found</body></html>"),
            VerificationOutcome::TransportError(TransportError::Status(404))
        );
        assert_eq!(
            interpret_response(413, ""),
            VerificationOutcome::TransportError(TransportError::Status(413))
        );
        assert_eq!(
            interpret_response(405, r#"{"message": "Method Not Allowed"}"#),
            VerificationOutcome::TransportError(TransportError::Status(405))
        );
    }

    #[test]
    fn test_upload_file_name_follows_mime() {
        assert_eq!(upload_file_name("image/jpeg"), "scan.jpg");
        assert_eq!(upload_file_name("image/png"), "scan.png");
        assert_eq!(upload_file_name("image/webp; q=1"), "scan.webp");
        assert_eq!(upload_file_name("garbage"), "scan.jpg");
    }

    #[test]
    fn test_interpret_auth_layer_rejection() {
        assert_eq!(
            interpret_response(401, r#"{"msg": "Token has expired"}"#),
            VerificationOutcome::TransportError(TransportError::Unauthenticated)
        );
        assert_eq!(
            interpret_response(422, r#"{"msg": "Not enough segments"}"#),
            VerificationOutcome::TransportError(TransportError::Unauthenticated)
        );
    }

    #[test]
    fn test_interpret_server_error() {
        assert_eq!(
            interpret_response(500, r#"{"error": "db down"}"#),
            VerificationOutcome::TransportError(TransportError::Status(500))
        );
        assert_eq!(
            interpret_response(502, ""),
            VerificationOutcome::TransportError(TransportError::Status(502))
        );
    }

    #[test]
    fn test_parse_server_timestamp_formats() {
        assert!(parse_server_timestamp("2024-03-04T09:15:00").is_some());
        assert!(parse_server_timestamp("2024-03-04T09:15:00+02:00").is_some());
        assert!(parse_server_timestamp("yesterday").is_none());
    }

    #[tokio::test]
    async fn test_verify_posts_frame_with_bearer_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/attendance/verify"))
            .and(header("authorization", "Bearer tok-123"))
            .respond_with(ResponseTemplate::new(200).set_body_string(MATCH_BODY))
            .expect(1)
            .mount(&server)
            .await;

        let c = client(&server.uri(), StaticCredential::new("tok-123"));
        let outcome = c.verify(&frame()).await;
        assert!(matches!(
            outcome,
            VerificationOutcome::Matched { ref identity, .. } if identity.id == "42"
        ));

        let requests = server.received_requests().await.unwrap();
        let content_type = requests[0]
            .headers
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        assert!(content_type.starts_with("multipart/form-data"));
        let body = String::from_utf8_lossy(&requests[0].body);
        assert!(body.contains("name=\"image\""));
        assert!(body.contains("filename=\"scan.jpg\""));
    }

    #[tokio::test]
    async fn test_verify_without_credential_skips_network() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string(MATCH_BODY))
            .expect(0)
            .mount(&server)
            .await;

        let c = client(&server.uri(), StaticCredential::none());
        assert_eq!(
            c.verify(&frame()).await,
            VerificationOutcome::TransportError(TransportError::Unauthenticated)
        );
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_verify_unrecognized_face() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/attendance/verify"))
            .respond_with(
                ResponseTemplate::new(401)
                    .set_body_string(r#"{"success": false, "error": "Face not recognized"}"#),
            )
            .mount(&server)
            .await;

        let c = client(&server.uri(), StaticCredential::new("tok"));
        assert_eq!(c.verify(&frame()).await, VerificationOutcome::Unmatched);
    }

    #[tokio::test]
    async fn test_verify_png_upload_keeps_extension() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/attendance/verify"))
            .respond_with(ResponseTemplate::new(200).set_body_string(MATCH_BODY))
            .mount(&server)
            .await;

        let c = client(&server.uri(), StaticCredential::new("tok"));
        let png = StillFrame {
            data: vec![0x89, b'P', b'N', b'G'],
            mime_type: "image/png".into(),
        };
        assert!(matches!(
            c.verify(&png).await,
            VerificationOutcome::Matched { .. }
        ));

        let requests = server.received_requests().await.unwrap();
        let body = String::from_utf8_lossy(&requests[0].body);
        assert!(body.contains("filename=\"scan.png\""));
        assert!(body.contains("image/png"));
    }

    #[tokio::test]
    async fn test_verify_wrong_base_url_is_transport() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(404).set_body_string("<html>Not Found</html>"))
            .mount(&server)
            .await;

        let c = client(&server.uri(), StaticCredential::new("tok"));
        assert_eq!(
            c.verify(&frame()).await,
            VerificationOutcome::TransportError(TransportError::Status(404))
        );
    }

    #[tokio::test]
    async fn test_verify_server_error_is_transport() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let c = client(&server.uri(), StaticCredential::new("tok"));
        assert_eq!(
            c.verify(&frame()).await,
            VerificationOutcome::TransportError(TransportError::Status(503))
        );
    }

    #[tokio::test]
    async fn test_verify_connection_refused_is_network_error() {
        // Port 1 (tcpmux) is essentially never listening.
        let c = client("http://127.0.0.1:1", StaticCredential::new("tok"));
        assert!(matches!(
            c.verify(&frame()).await,
            VerificationOutcome::TransportError(TransportError::Network(_))
        ));
    }
}
