use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tracing::Instrument;

use crate::{
    Result,
    context::RequestContext,
    dispatch::{ExecutionRequest, QueueReceiver},
    message::{
        Attachment, FormattedMessage, connection_failed_text, credential_rejected_text,
        formatting_failed_text, query_failed_text, result_text,
    },
    metrics,
    publisher::ResultPublisher,
    retry::{AttemptError, Clock, RetryError, RetryPolicy, TokioClock},
    table::{FormatError, Row, format_result_sets},
};

const SLOW_QUERY: Duration = Duration::from_millis(500);
const NO_ROWS: &str = "Query returned no rows.";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConnectError {
    /// The server rejected the login; retrying cannot help.
    #[error("access denied: {0}")]
    AccessDenied(String),
    #[error("connection unavailable: {0}")]
    Unavailable(String),
}

/// An open database session owned by one worker invocation.
#[async_trait]
pub trait QueryConnection: Send {
    /// Run `sql`, which may hold several statements, and return the result
    /// sets that produced rows, in order.
    async fn execute(&mut self, sql: &str) -> Result<Vec<Vec<Row>>>;

    async fn close(self: Box<Self>) -> Result<()>;
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        request: &ExecutionRequest,
    ) -> std::result::Result<Box<dyn QueryConnection>, ConnectError>;
}

#[derive(Debug)]
pub enum ExecutionFailure {
    ConnectionExhausted {
        host: String,
        attempts: u32,
        last_error: ConnectError,
    },
    CredentialsRejected {
        alias: String,
        error: ConnectError,
    },
    Query {
        alias: String,
        error: crate::Error,
    },
    Formatting {
        alias: String,
        error: FormatError,
    },
}

impl ExecutionFailure {
    pub fn user_text(&self) -> String {
        match self {
            Self::ConnectionExhausted { host, attempts, .. } => {
                connection_failed_text(host, *attempts)
            }
            Self::CredentialsRejected { alias, .. } => credential_rejected_text(alias),
            Self::Query { alias, .. } => query_failed_text(alias),
            Self::Formatting { alias, .. } => formatting_failed_text(alias),
        }
    }
}

/// What one execution produced: the user-facing message, how many connection
/// attempts it took, and the failure if there was one.
#[derive(Debug)]
pub struct Execution {
    pub message: FormattedMessage,
    pub attempts: u32,
    pub failure: Option<ExecutionFailure>,
}

impl Execution {
    fn failed(failure: ExecutionFailure, attempts: u32) -> Self {
        Self {
            message: FormattedMessage::in_channel(failure.user_text()),
            attempts,
            failure: Some(failure),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.failure.is_none()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub processed: usize,
    pub publish_failures: usize,
    pub rejected_payloads: usize,
}

pub struct QueryWorker {
    connector: Arc<dyn Connector>,
    publisher: Arc<dyn ResultPublisher>,
    policy: RetryPolicy,
    clock: Arc<dyn Clock>,
}

impl QueryWorker {
    pub fn new(connector: Arc<dyn Connector>, publisher: Arc<dyn ResultPublisher>) -> Self {
        Self {
            connector,
            publisher,
            policy: RetryPolicy::default(),
            clock: Arc::new(TokioClock),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Connect, run and format. Every failure is turned into user-readable
    /// text in the returned message.
    pub async fn execute(&self, request: &ExecutionRequest) -> Execution {
        let ctx = request.context();
        self.execute_with(&ctx, request).await
    }

    async fn execute_with(&self, ctx: &RequestContext, request: &ExecutionRequest) -> Execution {
        let execution = self
            .execute_inner(request)
            .instrument(ctx.span().clone())
            .await;
        metrics::record_execution(execution.succeeded());
        execution
    }

    async fn execute_inner(&self, request: &ExecutionRequest) -> Execution {
        let connector = &self.connector;
        let connected = self
            .policy
            .run(self.clock.as_ref(), move |attempt| async move {
                tracing::debug!(target: "sqlbot::worker", attempt, host = %request.host, "connecting");
                connector.connect(request).await.map_err(|err| match err {
                    ConnectError::AccessDenied(_) => AttemptError::Permanent(err),
                    ConnectError::Unavailable(_) => AttemptError::Transient(err),
                })
            })
            .await;

        let (mut conn, attempts) = match connected {
            Ok(retried) => (retried.value, retried.attempts),
            Err(RetryError::Exhausted {
                last,
                attempts,
                elapsed,
            }) => {
                metrics::record_connect_attempts(attempts);
                tracing::error!(
                    target: "sqlbot::worker",
                    host = %request.host,
                    attempts,
                    elapsed_ms = elapsed.as_millis() as u64,
                    error = %last,
                    "giving up connecting"
                );
                return Execution::failed(
                    ExecutionFailure::ConnectionExhausted {
                        host: request.host.clone(),
                        attempts,
                        last_error: last,
                    },
                    attempts,
                );
            }
            Err(RetryError::Aborted { error, attempts }) => {
                metrics::record_connect_attempts(attempts);
                tracing::error!(
                    target: "sqlbot::worker",
                    alias = %request.alias,
                    host = %request.host,
                    error = %error,
                    "credentials rejected"
                );
                return Execution::failed(
                    ExecutionFailure::CredentialsRejected {
                        alias: request.alias.clone(),
                        error,
                    },
                    attempts,
                );
            }
        };
        metrics::record_connect_attempts(attempts);
        tracing::info!(target: "sqlbot::worker", host = %request.host, attempts, "connected");

        let started = Instant::now();
        let result = conn.execute(&request.sql).await;
        let elapsed = started.elapsed();
        if let Err(err) = conn.close().await {
            tracing::warn!(target: "sqlbot::worker", error = %err, "closing connection failed");
        }
        if elapsed > SLOW_QUERY {
            tracing::warn!(
                target: "sqlbot::slow_query",
                alias = %request.alias,
                elapsed_ms = elapsed.as_millis() as u64,
                sql = %request.sql,
                "slow query"
            );
        }

        let sets = match result {
            Ok(sets) => sets,
            Err(error) => {
                tracing::error!(
                    target: "sqlbot::worker",
                    alias = %request.alias,
                    sql = %request.sql,
                    error = %error,
                    "query execution failed"
                );
                return Execution::failed(
                    ExecutionFailure::Query {
                        alias: request.alias.clone(),
                        error,
                    },
                    attempts,
                );
            }
        };

        let table = match format_result_sets(&sets) {
            Ok(table) if table.is_empty() => NO_ROWS.to_string(),
            Ok(table) => table,
            Err(error) => {
                tracing::error!(
                    target: "sqlbot::worker",
                    alias = %request.alias,
                    error = %error,
                    "formatting failed"
                );
                return Execution::failed(
                    ExecutionFailure::Formatting {
                        alias: request.alias.clone(),
                        error,
                    },
                    attempts,
                );
            }
        };

        let rows: usize = sets.iter().map(Vec::len).sum();
        tracing::info!(
            target: "sqlbot::worker",
            alias = %request.alias,
            result_sets = sets.len(),
            rows,
            elapsed_ms = elapsed.as_millis() as u64,
            "query executed"
        );
        Execution {
            message: FormattedMessage::in_channel(result_text(&request.alias))
                .with_attachment(Attachment::describe(&request.definition()).with_table(table)),
            attempts,
            failure: None,
        }
    }

    /// Execute and publish. A publish failure is logged and returned.
    pub async fn handle(&self, request: &ExecutionRequest) -> Result<Execution> {
        let ctx = request.context();
        let execution = self.execute_with(&ctx, request).await;
        self.publisher
            .publish(
                execution.message.upload_content(),
                &request.location,
                &request.correlation_id,
            )
            .instrument(ctx.span().clone())
            .await
            .inspect_err(|err| {
                metrics::record_publish_failure();
                ctx.span().in_scope(|| {
                    tracing::error!(
                        target: "sqlbot::worker",
                        location = %request.location,
                        error = %err,
                        "publishing result failed"
                    );
                });
            })?;
        Ok(execution)
    }

    /// Drain `queue` one request at a time until every sender is gone.
    pub async fn run(&self, mut queue: QueueReceiver) -> WorkerStats {
        let mut stats = WorkerStats::default();
        while let Some(next) = queue.recv().await {
            match next {
                Ok(request) => {
                    stats.processed += 1;
                    if self.handle(&request).await.is_err() {
                        stats.publish_failures += 1;
                    }
                }
                Err(err) => {
                    stats.rejected_payloads += 1;
                    tracing::error!(target: "sqlbot::worker", error = %err, "undecodable execution payload");
                }
            }
        }
        tracing::debug!(target: "sqlbot::worker", processed = stats.processed, "queue drained");
        stats
    }
}
