//! In-memory collaborators for exercising the pipeline without MySQL or Slack.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::{
    Error, Result,
    dispatch::{DispatchChannel, ExecutionRequest},
    publisher::ResultPublisher,
    registry::{AliasRegistry, MapSecrets, QueryDefinition},
    retry::Clock,
    table::Row,
    worker::{ConnectError, Connector, QueryConnection},
};

/// Clock whose time only moves on `sleep` or `advance`.
#[derive(Clone, Debug)]
pub struct ManualClock {
    base: Instant,
    offset: Arc<Mutex<Duration>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            offset: Arc::default(),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.offset.lock().expect("clock poisoned") += by;
    }

    pub fn elapsed(&self) -> Duration {
        *self.offset.lock().expect("clock poisoned")
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + self.elapsed()
    }

    async fn sleep(&self, duration: Duration) {
        self.advance(duration);
    }
}

/// What a `StaticConnection` does when asked to execute.
#[derive(Clone, Debug)]
pub enum Script {
    Rows(Vec<Vec<Row>>),
    Fail(String),
}

/// Connection returning canned result sets and counting closes.
pub struct StaticConnection {
    script: Script,
    closed: Arc<AtomicU32>,
    executed: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl QueryConnection for StaticConnection {
    async fn execute(&mut self, sql: &str) -> Result<Vec<Vec<Row>>> {
        self.executed
            .lock()
            .expect("executed poisoned")
            .push(sql.to_string());
        match &self.script {
            Script::Rows(sets) => Ok(sets.clone()),
            Script::Fail(msg) => Err(Error::Db(sqlx::Error::Protocol(msg.clone()))),
        }
    }

    async fn close(self: Box<Self>) -> Result<()> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Connector that fails with queued errors before handing out connections.
#[derive(Clone)]
pub struct ScriptedConnector {
    failures: Arc<Mutex<VecDeque<ConnectError>>>,
    script: Script,
    attempts: Arc<AtomicU32>,
    closed: Arc<AtomicU32>,
    executed: Arc<Mutex<Vec<String>>>,
    attempt_cost: Duration,
    clock: Option<ManualClock>,
}

impl ScriptedConnector {
    pub fn returning(sets: Vec<Vec<Row>>) -> Self {
        Self {
            failures: Arc::default(),
            script: Script::Rows(sets),
            attempts: Arc::default(),
            closed: Arc::default(),
            executed: Arc::default(),
            attempt_cost: Duration::ZERO,
            clock: None,
        }
    }

    pub fn failing_query(message: impl Into<String>) -> Self {
        Self {
            script: Script::Fail(message.into()),
            ..Self::returning(Vec::new())
        }
    }

    /// Fail the first `n` connects with a transient error.
    pub fn unavailable_times(self, n: usize) -> Self {
        {
            let mut failures = self.failures.lock().expect("failures poisoned");
            for i in 0..n {
                failures.push_back(ConnectError::Unavailable(format!("connection refused #{i}")));
            }
        }
        self
    }

    /// Fail every connect with a transient error.
    pub fn always_unavailable(self) -> Self {
        self.unavailable_times(10_000)
    }

    pub fn access_denied(self) -> Self {
        self.failures
            .lock()
            .expect("failures poisoned")
            .push_back(ConnectError::AccessDenied(
                "Access denied for user 'reader'@'%' (using password: YES)".into(),
            ));
        self
    }

    /// Each connect advances `clock` by `cost`, simulating slow handshakes.
    pub fn with_attempt_cost(mut self, clock: ManualClock, cost: Duration) -> Self {
        self.clock = Some(clock);
        self.attempt_cost = cost;
        self
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> u32 {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().expect("executed poisoned").clone()
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(
        &self,
        _request: &ExecutionRequest,
    ) -> std::result::Result<Box<dyn QueryConnection>, ConnectError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(clock) = &self.clock {
            clock.advance(self.attempt_cost);
        }
        let next = self.failures.lock().expect("failures poisoned").pop_front();
        match next {
            Some(err) => Err(err),
            None => Ok(Box::new(StaticConnection {
                script: self.script.clone(),
                closed: self.closed.clone(),
                executed: self.executed.clone(),
            })),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Published {
    pub content: String,
    pub location: String,
    pub correlation_id: String,
}

#[derive(Clone, Default)]
pub struct RecordingPublisher {
    published: Arc<Mutex<Vec<Published>>>,
    fail_with: Option<String>,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(reason: impl Into<String>) -> Self {
        Self {
            fail_with: Some(reason.into()),
            ..Self::default()
        }
    }

    pub fn published(&self) -> Vec<Published> {
        self.published.lock().expect("publisher poisoned").clone()
    }
}

#[async_trait]
impl ResultPublisher for RecordingPublisher {
    async fn publish(&self, content: &str, location: &str, correlation_id: &str) -> Result<()> {
        if let Some(reason) = &self.fail_with {
            return Err(Error::Publish {
                location: location.to_string(),
                reason: reason.clone(),
            });
        }
        self.published
            .lock()
            .expect("publisher poisoned")
            .push(Published {
                content: content.to_string(),
                location: location.to_string(),
                correlation_id: correlation_id.to_string(),
            });
        Ok(())
    }
}

/// Dispatch channel that keeps payloads in memory.
#[derive(Clone, Default)]
pub struct RecordingChannel {
    sent: Arc<Mutex<Vec<(String, Vec<u8>)>>>,
}

impl RecordingChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn requests(&self) -> Vec<ExecutionRequest> {
        self.sent
            .lock()
            .expect("channel poisoned")
            .iter()
            .map(|(_, payload)| {
                ExecutionRequest::from_payload(payload).expect("payload decodes")
            })
            .collect()
    }

    pub fn targets(&self) -> Vec<String> {
        self.sent
            .lock()
            .expect("channel poisoned")
            .iter()
            .map(|(target, _)| target.clone())
            .collect()
    }
}

#[async_trait]
impl DispatchChannel for RecordingChannel {
    async fn send(&self, target: &str, payload: Vec<u8>) -> Result<()> {
        self.sent
            .lock()
            .expect("channel poisoned")
            .push((target.to_string(), payload));
        Ok(())
    }
}

/// Dispatch channel that is always unavailable.
#[derive(Clone, Copy, Debug, Default)]
pub struct FailingChannel;

#[async_trait]
impl DispatchChannel for FailingChannel {
    async fn send(&self, target: &str, _payload: Vec<u8>) -> Result<()> {
        Err(Error::Dispatch {
            alias: String::new(),
            target: target.to_string(),
            reason: "invocation service unavailable".into(),
        })
    }
}

/// Two aliases: `users` with credentials, `orders` without.
pub fn sample_registry() -> AliasRegistry {
    let definitions = vec![
        QueryDefinition {
            alias: "users".into(),
            sql: "select id, name from users".into(),
            host: "db1.internal".into(),
            database: "app".into(),
        },
        QueryDefinition {
            alias: "orders".into(),
            sql: "select count(*) as total from orders".into(),
            host: "db2.internal:3307".into(),
            database: "shop".into(),
        },
    ];
    let secrets = MapSecrets::new().with_credential("users", "reader", "s3cret");
    AliasRegistry::new(definitions, Arc::new(secrets))
}
