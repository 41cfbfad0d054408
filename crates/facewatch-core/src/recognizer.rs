//! Recognition client adapter. The single call that turns an image plus a
//! reference gallery into detected faces.
//!
//! [`RecognitionClient`] is the seam every analysis surface depends on.
//! [`RemoteRecognizer`] is the HTTP implementation; tests substitute fakes.

use crate::types::{EncodedImage, Gallery, RecognitionOptions, RecognitionResult};
use serde::Serialize;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

/// Upper bound on a single recognition call when none is configured.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Any failure of a recognition call. Callers only distinguish success from
/// failure; the variants exist for the message shown to the user.
#[derive(Error, Debug)]
pub enum RecognitionError {
    #[error("recognition service unreachable: {0}")]
    Transport(String),
    #[error("recognition service returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed recognition response: {0}")]
    Malformed(String),
    #[error("recognition timed out after {0:?}")]
    Timeout(Duration),
}

/// Everything one recognition call needs. The gallery is a snapshot, so a
/// roster change mid-call cannot alter an in-flight request.
#[derive(Debug, Clone)]
pub struct RecognitionRequest {
    pub image: EncodedImage,
    pub gallery: Gallery,
    pub options: RecognitionOptions,
}

/// Strategy for recognizing faces in an image against a reference gallery.
pub trait RecognitionClient: Send + Sync + 'static {
    fn recognize(
        &self,
        request: RecognitionRequest,
    ) -> impl Future<Output = Result<RecognitionResult, RecognitionError>> + Send;
}

/// Run `client.recognize` with an upper time bound.
pub async fn recognize_with_timeout<C: RecognitionClient>(
    client: &C,
    request: RecognitionRequest,
    limit: Duration,
) -> Result<RecognitionResult, RecognitionError> {
    match tokio::time::timeout(limit, client.recognize(request)).await {
        Ok(outcome) => outcome,
        Err(_) => Err(RecognitionError::Timeout(limit)),
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WireRequest<'a> {
    image: WireImage<'a>,
    gallery: Vec<WireReference<'a>>,
    options: RecognitionOptions,
}

#[derive(Serialize)]
struct WireImage<'a> {
    mime: &'a str,
    data: &'a str,
}

#[derive(Serialize)]
struct WireReference<'a> {
    name: &'a str,
    image: WireImage<'a>,
}

impl<'a> From<&'a RecognitionRequest> for WireRequest<'a> {
    fn from(request: &'a RecognitionRequest) -> Self {
        Self {
            image: WireImage {
                mime: &request.image.mime,
                data: &request.image.data,
            },
            gallery: request
                .gallery
                .iter()
                .map(|person| WireReference {
                    name: &person.name,
                    image: WireImage {
                        mime: &person.mime,
                        data: &person.image,
                    },
                })
                .collect(),
            options: request.options,
        }
    }
}

/// JSON-over-HTTP recognition service client.
pub struct RemoteRecognizer {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    timeout: Duration,
}

impl RemoteRecognizer {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, RecognitionError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RecognitionError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            api_key,
            timeout,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl RecognitionClient for RemoteRecognizer {
    async fn recognize(
        &self,
        request: RecognitionRequest,
    ) -> Result<RecognitionResult, RecognitionError> {
        let body = WireRequest::from(&request);
        tracing::debug!(
            endpoint = %self.endpoint,
            gallery = body.gallery.len(),
            "sending recognition request"
        );

        let mut call = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            call = call.bearer_auth(key);
        }

        let response = call.send().await.map_err(|e| {
            if e.is_timeout() {
                RecognitionError::Timeout(self.timeout)
            } else {
                RecognitionError::Transport(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RecognitionError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| RecognitionError::Transport(e.to_string()))?;
        parse_response(&bytes)
    }
}

/// Parse the service's `{ faces, personCount }` payload.
fn parse_response(bytes: &[u8]) -> Result<RecognitionResult, RecognitionError> {
    serde_json::from_slice(bytes).map_err(|e| RecognitionError::Malformed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::KnownPerson;
    use std::sync::Arc;

    #[test]
    fn test_wire_request_shape() {
        let gallery: Gallery = Arc::from(vec![KnownPerson {
            id: "p1".into(),
            name: "Alice".into(),
            image: "QUxJQ0U=".into(),
            mime: "image/png".into(),
            created_at: String::new(),
        }]);
        let request = RecognitionRequest {
            image: EncodedImage {
                mime: "image/jpeg".into(),
                data: "Zm9v".into(),
            },
            gallery,
            options: RecognitionOptions {
                recognize_gender: true,
                count_people: false,
            },
        };

        let json = serde_json::to_value(WireRequest::from(&request)).unwrap();
        assert_eq!(json["image"]["data"], "Zm9v");
        assert_eq!(json["gallery"][0]["name"], "Alice");
        assert_eq!(json["gallery"][0]["image"]["mime"], "image/png");
        assert_eq!(json["options"]["recognizeGender"], true);
        assert_eq!(json["options"]["countPeople"], false);
        // ids never leave the process
        assert!(json["gallery"][0].get("id").is_none());
    }

    #[test]
    fn test_parse_response_ok() {
        let result = parse_response(br#"{"faces": [], "personCount": 2}"#).unwrap();
        assert!(result.faces.is_empty());
        assert_eq!(result.person_count, 2);
    }

    #[test]
    fn test_parse_response_malformed() {
        let err = parse_response(b"<html>bad gateway</html>").unwrap_err();
        assert!(matches!(err, RecognitionError::Malformed(_)));
    }

    #[test]
    fn test_parse_response_missing_count_defaults_to_zero() {
        let body = br#"{"faces": [
            {"box": {"x": 0, "y": 0, "width": 1, "height": 1}, "name": "Unknown"}
        ]}"#;
        let result = parse_response(body).unwrap();
        assert_eq!(result.person_count, 0);
        assert!(result.faces[0].is_unknown());
    }

    struct Stalled;

    impl RecognitionClient for Stalled {
        async fn recognize(
            &self,
            _request: RecognitionRequest,
        ) -> Result<RecognitionResult, RecognitionError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(RecognitionResult::default())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_bounds_a_stalled_call() {
        let request = RecognitionRequest {
            image: EncodedImage::jpeg(&[1, 2, 3]),
            gallery: Arc::from(Vec::<KnownPerson>::new()),
            options: RecognitionOptions::default(),
        };
        let err = recognize_with_timeout(&Stalled, request, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, RecognitionError::Timeout(d) if d == Duration::from_secs(5)));
    }
}
