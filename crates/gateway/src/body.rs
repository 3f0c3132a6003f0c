//! Bounded, timed JSON body reading for ingress handlers.

use std::time::Duration;

use {axum::body::Body, serde_json::Value};

/// Why a body read failed. Maps 1:1 onto response codes at the call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyError {
    /// The body exceeded the byte cap (413).
    TooLarge,
    /// The read did not finish within the deadline (408).
    Timeout,
    /// The bytes were not valid JSON (400).
    Malformed,
}

/// Read a request body under `max_bytes` within `deadline` and parse it as
/// JSON. An empty body parses as `{}` so senders may omit optional payloads.
pub async fn read_json_body(
    body: Body,
    max_bytes: usize,
    deadline: Duration,
) -> Result<Value, BodyError> {
    let collected = tokio::time::timeout(deadline, axum::body::to_bytes(body, max_bytes))
        .await
        .map_err(|_| BodyError::Timeout)?
        .map_err(|_| BodyError::TooLarge)?;

    if collected.is_empty() {
        return Ok(Value::Object(serde_json::Map::new()));
    }
    serde_json::from_slice(&collected).map_err(|_| BodyError::Malformed)
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    const DEADLINE: Duration = Duration::from_secs(1);

    #[tokio::test]
    async fn parses_json_object() {
        let body = Body::from(r#"{"text":"hi"}"#);
        let value = read_json_body(body, 1024, DEADLINE).await.unwrap();
        assert_eq!(value["text"], "hi");
    }

    #[tokio::test]
    async fn empty_body_is_empty_object() {
        let value = read_json_body(Body::empty(), 1024, DEADLINE).await.unwrap();
        assert_eq!(value, serde_json::json!({}));
    }

    #[tokio::test]
    async fn oversized_body_rejected() {
        let body = Body::from(vec![b'x'; 2048]);
        assert_eq!(
            read_json_body(body, 1024, DEADLINE).await,
            Err(BodyError::TooLarge)
        );
    }

    #[tokio::test]
    async fn malformed_json_rejected() {
        let body = Body::from("{not json");
        assert_eq!(
            read_json_body(body, 1024, DEADLINE).await,
            Err(BodyError::Malformed)
        );
    }

    #[tokio::test]
    async fn slow_body_times_out() {
        let stream = futures::stream::once(async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok::<_, std::io::Error>(axum::body::Bytes::from_static(b"{}"))
        });
        let body = Body::from_stream(stream);
        assert_eq!(
            read_json_body(body, 1024, Duration::from_millis(20)).await,
            Err(BodyError::Timeout)
        );
    }
}
