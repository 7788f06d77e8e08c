use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, de::DeserializeOwned};
use serde_json::{Value, json};
use tokio::io::AsyncWriteExt;

use crate::{Error, Result, config::Settings};

/// Header carrying the correlation id on outbound calls.
pub const CORRELATION_HEADER: &str = "Correlation-Id";

/// Delivers worker output to the channel the request came from.
#[async_trait]
pub trait ResultPublisher: Send + Sync {
    async fn publish(&self, content: &str, location: &str, correlation_id: &str) -> Result<()>;
}

const FILENAME: &str = "result.txt";

#[derive(Debug, Deserialize)]
struct ApiStatus {
    ok: bool,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UploadTicket {
    upload_url: String,
    file_id: String,
}

/// Uploads the text as a file snippet through Slack's external upload flow:
/// reserve an upload URL, send the bytes there, then share the file.
#[derive(Clone, Debug)]
pub struct SlackPublisher {
    client: reqwest::Client,
    api_url: String,
    token: String,
}

impl SlackPublisher {
    pub fn new(api_url: impl Into<String>, token: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            api_url: api_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        })
    }

    pub fn from_settings(settings: &Settings) -> Result<Self> {
        Self::new(&settings.slack_api_url, settings.require_slack_token()?)
    }

    /// Call a Web API method and decode its payload once `ok` is confirmed.
    async fn call<T: DeserializeOwned>(
        &self,
        api_method: &str,
        form: &[(&str, &str)],
        location: &str,
        correlation_id: &str,
    ) -> Result<T> {
        let body: Value = self
            .client
            .post(format!("{}/{api_method}", self.api_url))
            .bearer_auth(&self.token)
            .header(CORRELATION_HEADER, correlation_id)
            .form(form)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let status: ApiStatus = serde_json::from_value(body.clone())?;
        if !status.ok {
            return Err(Error::Publish {
                location: location.to_string(),
                reason: format!(
                    "{api_method}: {}",
                    status.error.as_deref().unwrap_or("request rejected")
                ),
            });
        }
        Ok(serde_json::from_value(body)?)
    }

    async fn upload(&self, content: &str, location: &str, correlation_id: &str) -> Result<()> {
        let length = content.len().to_string();
        let ticket: UploadTicket = self
            .call(
                "files.getUploadURLExternal",
                &[("filename", FILENAME), ("length", length.as_str())],
                location,
                correlation_id,
            )
            .await?;
        tracing::debug!(target: "sqlbot::publisher", file_id = %ticket.file_id, "upload url reserved");

        self.client
            .post(&ticket.upload_url)
            .header(CORRELATION_HEADER, correlation_id)
            .header(reqwest::header::CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(content.to_string())
            .send()
            .await?
            .error_for_status()?;

        let files = json!([{ "id": ticket.file_id, "title": FILENAME }]).to_string();
        let _: ApiStatus = self
            .call(
                "files.completeUploadExternal",
                &[("files", files.as_str()), ("channel_id", location)],
                location,
                correlation_id,
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ResultPublisher for SlackPublisher {
    async fn publish(&self, content: &str, location: &str, correlation_id: &str) -> Result<()> {
        self.upload(content, location, correlation_id)
            .await
            .map_err(|err| match err {
                Error::Publish { .. } => err,
                other => Error::Publish {
                    location: location.to_string(),
                    reason: other.to_string(),
                },
            })?;
        tracing::info!(target: "sqlbot::publisher", location, bytes = content.len(), "result uploaded");
        Ok(())
    }
}

/// Writes results to stdout, for running the worker by hand.
#[derive(Clone, Copy, Debug, Default)]
pub struct StdoutPublisher;

#[async_trait]
impl ResultPublisher for StdoutPublisher {
    async fn publish(&self, content: &str, location: &str, correlation_id: &str) -> Result<()> {
        let mut out = tokio::io::stdout();
        let text = format!("[{location}] ({correlation_id})\n{content}\n");
        out.write_all(text.as_bytes()).await?;
        out.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string, body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const TABLE: &str = "id\n--\n1 ";

    async fn reserve(server: &MockServer, expect: u64) {
        Mock::given(method("POST"))
            .and(path("/api/files.getUploadURLExternal"))
            .and(header("Correlation-Id", "trig-42"))
            .and(header("Authorization", "Bearer xoxb-test"))
            .and(body_string_contains("filename=result.txt"))
            .and(body_string_contains(format!("length={}", TABLE.len())))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "ok": true,
                "upload_url": format!("{}/upload/F123", server.uri()),
                "file_id": "F123",
            })))
            .expect(expect)
            .mount(server)
            .await;
    }

    async fn receive_bytes(server: &MockServer, status: u16, expect: u64) {
        Mock::given(method("POST"))
            .and(path("/upload/F123"))
            .and(header("Correlation-Id", "trig-42"))
            .and(body_string(TABLE))
            .respond_with(ResponseTemplate::new(status).set_body_string("OK"))
            .expect(expect)
            .mount(server)
            .await;
    }

    async fn complete(server: &MockServer, response: Value, expect: u64) {
        Mock::given(method("POST"))
            .and(path("/api/files.completeUploadExternal"))
            .and(header("Correlation-Id", "trig-42"))
            .and(header("Authorization", "Bearer xoxb-test"))
            .and(body_string_contains("channel_id=C123"))
            .and(body_string_contains("F123"))
            .respond_with(ResponseTemplate::new(200).set_body_json(response))
            .expect(expect)
            .mount(server)
            .await;
    }

    fn publisher(server: &MockServer) -> SlackPublisher {
        SlackPublisher::new(format!("{}/api", server.uri()), "xoxb-test").unwrap()
    }

    fn publish_reason(err: Error) -> String {
        match err {
            Error::Publish { location, reason } => {
                assert_eq!(location, "C123");
                reason
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn uploads_through_external_flow() {
        let server = MockServer::start().await;
        reserve(&server, 1).await;
        receive_bytes(&server, 200, 1).await;
        complete(&server, json!({"ok": true, "files": [{"id": "F123"}]}), 1).await;

        publisher(&server)
            .publish(TABLE, "C123", "trig-42")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn rejected_reservation_stops_the_flow() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/files.getUploadURLExternal"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"ok": false, "error": "invalid_auth"})),
            )
            .expect(1)
            .mount(&server)
            .await;
        receive_bytes(&server, 200, 0).await;
        complete(&server, json!({"ok": true}), 0).await;

        let err = publisher(&server)
            .publish(TABLE, "C123", "trig-42")
            .await
            .unwrap_err();
        assert_eq!(publish_reason(err), "files.getUploadURLExternal: invalid_auth");
    }

    #[tokio::test]
    async fn failed_byte_upload_is_a_publish_error() {
        let server = MockServer::start().await;
        reserve(&server, 1).await;
        receive_bytes(&server, 500, 1).await;
        complete(&server, json!({"ok": true}), 0).await;

        let err = publisher(&server)
            .publish(TABLE, "C123", "trig-42")
            .await
            .unwrap_err();
        assert!(publish_reason(err).contains("500"));
    }

    #[tokio::test]
    async fn rejected_completion_is_a_publish_error() {
        let server = MockServer::start().await;
        reserve(&server, 1).await;
        receive_bytes(&server, 200, 1).await;
        complete(
            &server,
            json!({"ok": false, "error": "channel_not_found"}),
            1,
        )
        .await;

        let err = publisher(&server)
            .publish(TABLE, "C123", "trig-42")
            .await
            .unwrap_err();
        assert_eq!(
            publish_reason(err),
            "files.completeUploadExternal: channel_not_found"
        );
    }

    #[tokio::test]
    async fn http_failure_is_a_publish_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let err = publisher(&server)
            .publish("x", "C123", "t")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Publish { .. }));
    }
}
