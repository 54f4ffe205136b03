//! Per-record request handling: decode the envelope, resolve credentials, run the executor.
//!
//! Every failure here is local to one record. The handler reports what happened as a
//! [`RecordOutcome`] and never fails the batch.

use std::panic::AssertUnwindSafe;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, warn};

use crate::metrics_consts::RECORDS_PROCESSED;
use crate::types::{Partition, Record};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Authentication {
    ApiKey(String),
    Jwt(String),
}

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("record has no payload")]
    MissingPayload,

    #[error("invalid request envelope: {0}")]
    InvalidEnvelope(#[from] serde_json::Error),
}

#[derive(Debug, Deserialize)]
struct RequestEnvelope {
    #[serde(default)]
    authentication: Option<Authentication>,
    #[serde(default)]
    message_id: Option<String>,
    request: serde_json::Value,
}

/// A decoded record ready to be handed to a [`RequestExecutor`].
#[derive(Debug, Clone, PartialEq)]
pub struct UnitOfWork {
    pub partition: Partition,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub message_id: Option<String>,
    pub authentication: Option<Authentication>,
    pub request: serde_json::Value,
}

impl UnitOfWork {
    pub fn decode(partition: &Partition, record: &Record) -> Result<Self, DecodeError> {
        let payload = record.payload().ok_or(DecodeError::MissingPayload)?;
        let envelope: RequestEnvelope = serde_json::from_slice(payload)?;

        Ok(Self {
            partition: partition.clone(),
            offset: record.offset(),
            key: record.key().map(<[u8]>::to_vec),
            message_id: envelope.message_id,
            authentication: envelope.authentication,
            request: envelope.request,
        })
    }
}

/// Performs the business work encoded in a record.
#[async_trait]
pub trait RequestExecutor: Send + Sync {
    async fn execute(&self, work: UnitOfWork) -> anyhow::Result<()>;
}

/// What to do with a record that carries no credential when no default is configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MissingCredentialPolicy {
    /// Log and skip the record.
    #[default]
    Drop,
    /// Hand the record to the executor without a credential and let it decide.
    PassThrough,
}

impl FromStr for MissingCredentialPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "drop" => Ok(MissingCredentialPolicy::Drop),
            "pass_through" | "passthrough" => Ok(MissingCredentialPolicy::PassThrough),
            _ => Err(format!("Invalid missing credential policy: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Executed,
    ExecutorFailed,
    Undecodable,
    MissingCredentials,
}

impl RecordOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordOutcome::Executed => "executed",
            RecordOutcome::ExecutorFailed => "executor_failed",
            RecordOutcome::Undecodable => "undecodable",
            RecordOutcome::MissingCredentials => "missing_credentials",
        }
    }
}

pub struct RequestHandler {
    executor: Arc<dyn RequestExecutor>,
    default_authentication: Option<Authentication>,
    missing_credential_policy: MissingCredentialPolicy,
}

impl RequestHandler {
    pub fn new(executor: Arc<dyn RequestExecutor>) -> Self {
        Self {
            executor,
            default_authentication: None,
            missing_credential_policy: MissingCredentialPolicy::default(),
        }
    }

    pub fn with_default_authentication(mut self, authentication: Option<Authentication>) -> Self {
        self.default_authentication = authentication;
        self
    }

    pub fn with_missing_credential_policy(mut self, policy: MissingCredentialPolicy) -> Self {
        self.missing_credential_policy = policy;
        self
    }

    /// Handle one record. Never fails: decode errors, missing credentials, executor errors
    /// and executor panics are logged and reported through the outcome.
    pub async fn handle(&self, partition: &Partition, record: &Record) -> RecordOutcome {
        let outcome = self.handle_inner(partition, record).await;
        metrics::counter!(
            RECORDS_PROCESSED,
            "topic" => partition.topic().to_string(),
            "outcome" => outcome.as_str()
        )
        .increment(1);
        outcome
    }

    async fn handle_inner(&self, partition: &Partition, record: &Record) -> RecordOutcome {
        let mut work = match UnitOfWork::decode(partition, record) {
            Ok(work) => work,
            Err(e) => {
                warn!(
                    topic = partition.topic(),
                    partition = partition.partition_number(),
                    offset = record.offset(),
                    "Skipping undecodable record: {e:#}"
                );
                return RecordOutcome::Undecodable;
            }
        };

        if work.authentication.is_none() {
            work.authentication = self.default_authentication.clone();
        }

        if work.authentication.is_none()
            && self.missing_credential_policy == MissingCredentialPolicy::Drop
        {
            error!(
                topic = partition.topic(),
                partition = partition.partition_number(),
                offset = record.offset(),
                message_id = ?work.message_id,
                "No authentication on record and no default configured, dropping it"
            );
            return RecordOutcome::MissingCredentials;
        }

        let offset = work.offset;
        match AssertUnwindSafe(self.executor.execute(work))
            .catch_unwind()
            .await
        {
            Ok(Ok(())) => RecordOutcome::Executed,
            Ok(Err(e)) => {
                warn!(
                    topic = partition.topic(),
                    partition = partition.partition_number(),
                    offset = offset,
                    "Request execution failed: {e:#}"
                );
                RecordOutcome::ExecutorFailed
            }
            Err(_) => {
                error!(
                    topic = partition.topic(),
                    partition = partition.partition_number(),
                    offset = offset,
                    "Request executor panicked"
                );
                RecordOutcome::ExecutorFailed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{request_payload, RecordingExecutor};
    use test_case::test_case;

    fn partition() -> Partition {
        Partition::new("requests".to_string(), 0)
    }

    fn record(offset: i64, payload: &[u8]) -> Record {
        Record::new(offset, Some(b"key".to_vec()), Some(payload.to_vec()))
    }

    #[test]
    fn test_decode_envelope() {
        let payload = br#"{"authentication":{"api_key":"k-1"},"message_id":"m-1","request":{"op":"ping"}}"#;
        let work = UnitOfWork::decode(&partition(), &record(42, payload)).unwrap();

        assert_eq!(work.offset, 42);
        assert_eq!(work.key.as_deref(), Some(&b"key"[..]));
        assert_eq!(work.message_id.as_deref(), Some("m-1"));
        assert_eq!(
            work.authentication,
            Some(Authentication::ApiKey("k-1".to_string()))
        );
        assert_eq!(work.request["op"], "ping");
    }

    #[test]
    fn test_decode_rejects_tombstone() {
        let tombstone = Record::new(1, None, None);
        assert!(matches!(
            UnitOfWork::decode(&partition(), &tombstone),
            Err(DecodeError::MissingPayload)
        ));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            UnitOfWork::decode(&partition(), &record(1, b"not json")),
            Err(DecodeError::InvalidEnvelope(_))
        ));
    }

    #[test_case("drop", MissingCredentialPolicy::Drop ; "drop")]
    #[test_case("pass_through", MissingCredentialPolicy::PassThrough ; "pass through")]
    #[test_case(" PassThrough ", MissingCredentialPolicy::PassThrough ; "pass through mixed case")]
    fn test_policy_from_str(input: &str, expected: MissingCredentialPolicy) {
        assert_eq!(input.parse::<MissingCredentialPolicy>().unwrap(), expected);
    }

    #[test]
    fn test_policy_from_str_invalid() {
        assert!("dead_letter".parse::<MissingCredentialPolicy>().is_err());
    }

    #[tokio::test]
    async fn test_embedded_credential_is_used() {
        let executor = Arc::new(RecordingExecutor::new());
        let handler = RequestHandler::new(executor.clone())
            .with_default_authentication(Some(Authentication::ApiKey("default".to_string())));

        let payload = request_payload(Some(Authentication::Jwt("token".to_string())));
        let outcome = handler.handle(&partition(), &record(1, &payload)).await;

        assert_eq!(outcome, RecordOutcome::Executed);
        let executed = executor.executed();
        assert_eq!(
            executed[0].authentication,
            Some(Authentication::Jwt("token".to_string()))
        );
    }

    #[tokio::test]
    async fn test_default_credential_fills_gap() {
        let executor = Arc::new(RecordingExecutor::new());
        let handler = RequestHandler::new(executor.clone())
            .with_default_authentication(Some(Authentication::ApiKey("default".to_string())));

        let outcome = handler
            .handle(&partition(), &record(1, &request_payload(None)))
            .await;

        assert_eq!(outcome, RecordOutcome::Executed);
        assert_eq!(
            executor.executed()[0].authentication,
            Some(Authentication::ApiKey("default".to_string()))
        );
    }

    #[tokio::test]
    async fn test_missing_credential_dropped_by_default() {
        let executor = Arc::new(RecordingExecutor::new());
        let handler = RequestHandler::new(executor.clone());

        let outcome = handler
            .handle(&partition(), &record(1, &request_payload(None)))
            .await;

        assert_eq!(outcome, RecordOutcome::MissingCredentials);
        assert!(executor.executed().is_empty());
    }

    #[tokio::test]
    async fn test_missing_credential_pass_through() {
        let executor = Arc::new(RecordingExecutor::new());
        let handler = RequestHandler::new(executor.clone())
            .with_missing_credential_policy(MissingCredentialPolicy::PassThrough);

        let outcome = handler
            .handle(&partition(), &record(1, &request_payload(None)))
            .await;

        assert_eq!(outcome, RecordOutcome::Executed);
        assert_eq!(executor.executed()[0].authentication, None);
    }

    #[tokio::test]
    async fn test_executor_error_is_swallowed() {
        let executor = Arc::new(RecordingExecutor::new().failing_on([7]));
        let handler = RequestHandler::new(executor.clone())
            .with_missing_credential_policy(MissingCredentialPolicy::PassThrough);

        let outcome = handler
            .handle(&partition(), &record(7, &request_payload(None)))
            .await;

        assert_eq!(outcome, RecordOutcome::ExecutorFailed);
        assert_eq!(executor.executed_offsets(), vec![7]);
    }

    #[tokio::test]
    async fn test_executor_panic_is_contained() {
        let executor = Arc::new(RecordingExecutor::new().panicking_on([3]));
        let handler = RequestHandler::new(executor)
            .with_missing_credential_policy(MissingCredentialPolicy::PassThrough);

        let outcome = handler
            .handle(&partition(), &record(3, &request_payload(None)))
            .await;

        assert_eq!(outcome, RecordOutcome::ExecutorFailed);
    }

    #[tokio::test]
    async fn test_undecodable_record_is_skipped() {
        let executor = Arc::new(RecordingExecutor::new());
        let handler = RequestHandler::new(executor.clone());

        let outcome = handler.handle(&partition(), &record(1, b"{")).await;

        assert_eq!(outcome, RecordOutcome::Undecodable);
        assert!(executor.executed().is_empty());
    }
}
