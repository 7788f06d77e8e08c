use std::time::Duration;

use async_trait::async_trait;
use futures_util::TryStreamExt;
use sqlx::mysql::{MySqlConnectOptions, MySqlConnection, MySqlDatabaseError, MySqlRow};
use sqlx::{Column as _, Connection as _, Either, Executor as _, Row as _, ValueRef as _};

use crate::{
    Result,
    dispatch::ExecutionRequest,
    table::Row,
    worker::{ConnectError, Connector, QueryConnection},
};

pub const DEFAULT_PORT: u16 = 3306;

// ER_DBACCESS_DENIED_ERROR, ER_ACCESS_DENIED_ERROR
const ACCESS_DENIED_CODES: [u16; 2] = [1044, 1045];
const ACCESS_DENIED_SQLSTATE: &str = "28000";

/// Opens one MySQL session per attempt using the request's credentials.
#[derive(Clone, Debug)]
pub struct MySqlConnector {
    connect_timeout: Duration,
}

impl Default for MySqlConnector {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
        }
    }
}

impl MySqlConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    pub fn options(request: &ExecutionRequest) -> MySqlConnectOptions {
        let (host, port) = split_host_port(&request.host);
        MySqlConnectOptions::new()
            .host(host)
            .port(port)
            .username(&request.credential.username)
            .password(&request.credential.password)
            .database(&request.database)
    }
}

/// `host[:port]`; an unparseable port falls back to the default.
pub fn split_host_port(target: &str) -> (&str, u16) {
    match target.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && !host.ends_with(':') => {
            (host, port.parse().unwrap_or(DEFAULT_PORT))
        }
        _ => (target, DEFAULT_PORT),
    }
}

/// Access denied is permanent; anything else on connect is worth retrying.
pub fn classify_connect_error(err: &sqlx::Error) -> ConnectError {
    if let sqlx::Error::Database(db) = err {
        let by_number = db
            .try_downcast_ref::<MySqlDatabaseError>()
            .is_some_and(|e| ACCESS_DENIED_CODES.contains(&e.number()));
        let by_state = db.code().as_deref() == Some(ACCESS_DENIED_SQLSTATE);
        if by_number || by_state {
            return ConnectError::AccessDenied(db.message().to_string());
        }
    }
    ConnectError::Unavailable(err.to_string())
}

#[async_trait]
impl Connector for MySqlConnector {
    async fn connect(
        &self,
        request: &ExecutionRequest,
    ) -> std::result::Result<Box<dyn QueryConnection>, ConnectError> {
        let options = Self::options(request);
        match tokio::time::timeout(self.connect_timeout, MySqlConnection::connect_with(&options))
            .await
        {
            Ok(Ok(conn)) => Ok(Box::new(MySqlSession { conn })),
            Ok(Err(err)) => Err(classify_connect_error(&err)),
            Err(_) => Err(ConnectError::Unavailable(format!(
                "connect to {} timed out after {}s",
                request.host,
                self.connect_timeout.as_secs()
            ))),
        }
    }
}

pub struct MySqlSession {
    conn: MySqlConnection,
}

#[async_trait]
impl QueryConnection for MySqlSession {
    async fn execute(&mut self, sql: &str) -> Result<Vec<Vec<Row>>> {
        let mut sets = Vec::new();
        let mut current = Vec::new();
        // Text protocol: multi-statement SQL is allowed and every cell arrives as text.
        let mut stream = (&mut self.conn).fetch_many(sqlx::raw_sql(sql));
        while let Some(item) = stream.try_next().await? {
            match item {
                Either::Left(_done) => {
                    if !current.is_empty() {
                        sets.push(std::mem::take(&mut current));
                    }
                }
                Either::Right(row) => current.push(decode_row(&row)),
            }
        }
        if !current.is_empty() {
            sets.push(current);
        }
        Ok(sets)
    }

    async fn close(self: Box<Self>) -> Result<()> {
        self.conn.close().await?;
        Ok(())
    }
}

fn decode_row(row: &MySqlRow) -> Row {
    let mut out = Row::new();
    for (idx, column) in row.columns().iter().enumerate() {
        out.push(column.name(), cell_text(row, idx));
    }
    out
}

fn cell_text(row: &MySqlRow, idx: usize) -> Option<String> {
    match row.try_get_raw(idx) {
        Ok(raw) if !raw.is_null() => {}
        _ => return None,
    }
    row.try_get_unchecked::<String, _>(idx).ok().or_else(|| {
        row.try_get_unchecked::<Vec<u8>, _>(idx)
            .ok()
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
    })
}
