use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::Instrument;

use crate::{
    Error, Result,
    context::RequestContext,
    message::{FormattedMessage, ack_text},
    metrics,
    registry::{Credential, QueryDefinition},
};

/// Everything the worker needs to run one query, independent of the
/// receiver's process. Serialized as JSON when crossing the dispatch channel.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub alias: String,
    pub sql: String,
    pub host: String,
    pub database: String,
    pub credential: Credential,
    pub location: String,
    pub correlation_id: String,
    pub requester: String,
}

impl ExecutionRequest {
    pub fn new(
        definition: &QueryDefinition,
        credential: Credential,
        location: impl Into<String>,
        correlation_id: impl Into<String>,
        requester: impl Into<String>,
    ) -> Self {
        Self {
            alias: definition.alias.clone(),
            sql: definition.sql.clone(),
            host: definition.host.clone(),
            database: definition.database.clone(),
            credential,
            location: location.into(),
            correlation_id: correlation_id.into(),
            requester: requester.into(),
        }
    }

    pub fn definition(&self) -> QueryDefinition {
        QueryDefinition {
            alias: self.alias.clone(),
            sql: self.sql.clone(),
            host: self.host.clone(),
            database: self.database.clone(),
        }
    }

    pub fn to_payload(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_payload(payload: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(payload)?)
    }

    pub fn context(&self) -> RequestContext {
        RequestContext::builder(self.correlation_id.clone())
            .requester(self.requester.clone())
            .location(self.location.clone())
            .component("worker")
            .build()
    }
}

/// Asynchronous hand-off to whatever runs the worker. `send` returns once the
/// payload is accepted; it never waits for execution.
#[async_trait]
pub trait DispatchChannel: Send + Sync {
    async fn send(&self, target: &str, payload: Vec<u8>) -> Result<()>;
}

/// In-process bounded queue feeding a `QueueReceiver`.
#[derive(Clone, Debug)]
pub struct QueueChannel {
    tx: mpsc::Sender<Vec<u8>>,
}

#[derive(Debug)]
pub struct QueueReceiver {
    rx: mpsc::Receiver<Vec<u8>>,
}

pub fn queue(capacity: usize) -> (QueueChannel, QueueReceiver) {
    let (tx, rx) = mpsc::channel(capacity);
    (QueueChannel { tx }, QueueReceiver { rx })
}

#[async_trait]
impl DispatchChannel for QueueChannel {
    async fn send(&self, target: &str, payload: Vec<u8>) -> Result<()> {
        self.tx.try_send(payload).map_err(|err| {
            let reason = match err {
                mpsc::error::TrySendError::Full(_) => "queue is full",
                mpsc::error::TrySendError::Closed(_) => "worker queue is closed",
            };
            Error::Dispatch {
                alias: String::new(),
                target: target.to_string(),
                reason: reason.to_string(),
            }
        })
    }
}

impl QueueReceiver {
    /// Next request, or `None` once every sender is dropped.
    pub async fn recv(&mut self) -> Option<Result<ExecutionRequest>> {
        let payload = self.rx.recv().await?;
        Some(ExecutionRequest::from_payload(&payload))
    }

    pub fn close(&mut self) {
        self.rx.close();
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    channel: Arc<dyn DispatchChannel>,
    target: String,
}

impl Dispatcher {
    pub fn new(channel: Arc<dyn DispatchChannel>, target: impl Into<String>) -> Self {
        Self {
            channel,
            target: target.into(),
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Enqueue `request` and return the acknowledgment shown to the requester.
    pub async fn dispatch(
        &self,
        ctx: &RequestContext,
        request: &ExecutionRequest,
    ) -> Result<FormattedMessage> {
        let fail = |reason: String| Error::Dispatch {
            alias: request.alias.clone(),
            target: self.target.clone(),
            reason,
        };
        if request.correlation_id.trim().is_empty() {
            return Err(fail("request has no correlation id".into()));
        }

        let payload = request.to_payload()?;
        async {
            self.channel
                .send(&self.target, payload)
                .await
                .map_err(|err| match err {
                    Error::Dispatch { reason, .. } => fail(reason),
                    other => fail(other.to_string()),
                })
        }
        .instrument(ctx.span().clone())
        .await?;

        metrics::record_dispatched();
        ctx.span().in_scope(|| {
            tracing::info!(
                target: "sqlbot::dispatch",
                alias = %request.alias,
                host = %request.host,
                handler = %self.target,
                "execution dispatched"
            );
        });
        Ok(FormattedMessage::in_channel(ack_text(
            &request.requester,
            &request.alias,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> ExecutionRequest {
        ExecutionRequest::new(
            &QueryDefinition {
                alias: "users".into(),
                sql: "select 1".into(),
                host: "db".into(),
                database: "app".into(),
            },
            Credential {
                username: "u".into(),
                password: "p".into(),
            },
            "C123",
            "trig-1",
            "alice",
        )
    }

    #[tokio::test]
    async fn dispatch_enqueues_and_acknowledges() {
        let (channel, mut rx) = queue(4);
        let dispatcher = Dispatcher::new(Arc::new(channel), "sqlbot-worker");
        let ctx = RequestContext::builder("trig-1").build();

        let ack = dispatcher.dispatch(&ctx, &request()).await.unwrap();
        assert_eq!(ack.text, "alice has requested execution of users, executing now...");

        let received = rx.recv().await.unwrap().unwrap();
        assert_eq!(received, request());
    }

    #[tokio::test]
    async fn closed_queue_is_a_dispatch_failure() {
        let (channel, mut rx) = queue(1);
        rx.close();
        let dispatcher = Dispatcher::new(Arc::new(channel), "sqlbot-worker");
        let ctx = RequestContext::builder("trig-1").build();

        let err = dispatcher.dispatch(&ctx, &request()).await.unwrap_err();
        match err {
            Error::Dispatch { alias, target, .. } => {
                assert_eq!(alias, "users");
                assert_eq!(target, "sqlbot-worker");
                assert_eq!(target, dispatcher.target());
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_correlation_id_is_refused() {
        let (channel, _rx) = queue(1);
        let dispatcher = Dispatcher::new(Arc::new(channel), "sqlbot-worker");
        let mut req = request();
        req.correlation_id = " ".into();
        let ctx = RequestContext::builder("").build();
        assert!(dispatcher.dispatch(&ctx, &req).await.is_err());
    }

    #[test]
    fn payload_round_trips() {
        let req = request();
        let bytes = req.to_payload().unwrap();
        assert_eq!(ExecutionRequest::from_payload(&bytes).unwrap(), req);
    }
}
