//! Request executors shipped with the service.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::header;
use tracing::info;

use crate::request::{Authentication, RequestExecutor, UnitOfWork};

pub const API_KEY_HEADER: &str = "x-api-key";
pub const MESSAGE_ID_HEADER: &str = "x-message-id";

/// Logs every unit of work and accepts it.
#[derive(Debug, Default)]
pub struct LoggingExecutor;

#[async_trait]
impl RequestExecutor for LoggingExecutor {
    async fn execute(&self, work: UnitOfWork) -> anyhow::Result<()> {
        info!(
            topic = work.partition.topic(),
            partition = work.partition.partition_number(),
            offset = work.offset,
            message_id = ?work.message_id,
            authenticated = work.authentication.is_some(),
            "Executing request"
        );
        Ok(())
    }
}

/// Forwards the request body to an HTTP endpoint. Any non-2xx response is an error.
pub struct HttpExecutor {
    client: reqwest::Client,
    url: String,
}

pub fn build_http_client(request_timeout: Duration) -> reqwest::Result<reqwest::Client> {
    let mut headers = header::HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("application/json"),
    );
    reqwest::Client::builder()
        .default_headers(headers)
        .user_agent("partition-dispatcher")
        .timeout(request_timeout)
        .build()
}

impl HttpExecutor {
    pub fn new(url: String, request_timeout: Duration) -> anyhow::Result<Self> {
        let client =
            build_http_client(request_timeout).context("failed to build executor HTTP client")?;
        Ok(Self { client, url })
    }
}

#[async_trait]
impl RequestExecutor for HttpExecutor {
    async fn execute(&self, work: UnitOfWork) -> anyhow::Result<()> {
        let mut request = self.client.post(&self.url).json(&work.request);

        request = match &work.authentication {
            Some(Authentication::ApiKey(key)) => request.header(API_KEY_HEADER, key),
            Some(Authentication::Jwt(token)) => request.bearer_auth(token),
            None => request,
        };
        if let Some(message_id) = &work.message_id {
            request = request.header(MESSAGE_ID_HEADER, message_id);
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("request for offset {} failed", work.offset))?;

        response
            .error_for_status()
            .with_context(|| format!("executor rejected offset {}", work.offset))?;

        Ok(())
    }
}
