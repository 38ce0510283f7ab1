//! SQL warehouse session instrumentation
//!
//! When an instrumented session is closed it first reads the session's own
//! query history and records it as package-level `queries`. The helper
//! queries it issues carry [`SERVICE_PREFIX`] and are excluded from the
//! history. Failing to collect history never prevents the close.

use std::sync::Arc;

use chrono::{DateTime, NaiveDateTime};
use serde_json::{Map, Value};
use thiserror::Error;

use super::{InstrumentReport, Instrumentation};
use crate::patch::{PatchTarget, Slot};
use crate::stats::{FieldDef, FieldKind, Recorder, StatSchema, QUERIES};

pub const PACKAGE: &str = "redshift";
pub const SESSION_ATTR: &str = "session";

/// Marks queries issued by the agent itself
pub const SERVICE_PREFIX: &str = "/* requestor: arcee */";

/// Record keys, in history query column order
const QUERY_PROPS: [&str; 8] = [
    "database",
    "start_time",
    "end_time",
    "status",
    "query",
    "duration",
    "returned_rows",
    "returned_bytes",
];

/// Record keys holding timestamps, reported as epoch seconds
const TIME_PROPS: [&str; 2] = ["start_time", "end_time"];

/// Driver rendering of `timestamp` columns
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

const CONNECTION_INFO_QUERY: &str = "select pg_backend_pid() as session_id, \
     current_user_id as user_id, current_database() as database";

pub static REDSHIFT_STATS: StatSchema = StatSchema {
    package: PACKAGE,
    service: None,
    fields: &[FieldDef::new(QUERIES, FieldKind::Records)],
};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SqlError {
    #[error("query failed: {0}")]
    Query(String),

    #[error("session is closed")]
    Closed,

    #[error("unexpected result: {0}")]
    Shape(String),
}

/// A SQL session on the warehouse
///
/// Rows are returned as JSON values, one per column. Timestamp columns may
/// come back either as epoch seconds or as UTC strings, in the
/// `2024-01-31 12:00:00.123456` or RFC 3339 form.
pub trait SqlSession: Send + Sync {
    /// Run a statement and return all result rows
    fn query(&self, sql: &str) -> Result<Vec<Vec<Value>>, SqlError>;

    fn close(&self) -> Result<(), SqlError>;
}

fn with_prefix(sql: &str) -> String {
    format!("{} {}", SERVICE_PREFIX, sql)
}

fn history_query(session_id: i64, user_id: i64, database: &str) -> String {
    format!(
        "select database_name, start_time, end_time, trim(status) as status, \
         trim(query_text) as query, elapsed_time, returned_rows, returned_bytes \
         from sys_query_history \
         where session_id = {session_id} and database_name = '{database}' and user_id = {user_id} \
         and substring(query_text, 1, {prefix_len}) != '{prefix}' \
         order by start_time asc",
        session_id = session_id,
        user_id = user_id,
        database = database.replace('\'', "''"),
        prefix_len = SERVICE_PREFIX.len(),
        prefix = SERVICE_PREFIX,
    )
}

/// Map history rows onto named records with epoch-second timestamps
fn history_records(rows: Vec<Vec<Value>>) -> Result<Vec<Value>, SqlError> {
    rows.into_iter()
        .map(|row| {
            let mut record: Map<String, Value> = QUERY_PROPS
                .iter()
                .map(|prop| prop.to_string())
                .zip(row)
                .collect();
            for prop in TIME_PROPS {
                if let Some(value) = record.get_mut(prop) {
                    *value = epoch_seconds(value.take())?;
                }
            }
            Ok(Value::Object(record))
        })
        .collect()
}

fn epoch_seconds(value: Value) -> Result<Value, SqlError> {
    match value {
        Value::Null | Value::Number(_) => Ok(value),
        Value::String(text) => parse_timestamp(&text).map(Value::from),
        other => Err(SqlError::Shape(format!("unexpected timestamp value {}", other))),
    }
}

fn parse_timestamp(text: &str) -> Result<f64, SqlError> {
    let text = text.trim();
    let micros = match DateTime::parse_from_rfc3339(text) {
        Ok(parsed) => parsed.timestamp_micros(),
        Err(_) => NaiveDateTime::parse_from_str(text, TIMESTAMP_FORMAT)
            .map_err(|err| SqlError::Shape(format!("invalid timestamp '{}': {}", text, err)))?
            .and_utc()
            .timestamp_micros(),
    };
    Ok(micros as f64 / 1_000_000.0)
}

/// Integer id column of the connection info row
fn id_column(value: &Value, column: &str) -> Result<i64, SqlError> {
    value
        .as_i64()
        .ok_or_else(|| SqlError::Shape(format!("{} is not an integer: {}", column, value)))
}

/// Session that reports its query history when closed
pub struct InstrumentedSession {
    inner: Arc<dyn SqlSession>,
    recorder: Recorder,
}

impl InstrumentedSession {
    pub fn new(inner: Arc<dyn SqlSession>, recorder: Recorder) -> Self {
        Self { inner, recorder }
    }

    fn query_history(&self) -> Result<Vec<Value>, SqlError> {
        let info = self.inner.query(&with_prefix(CONNECTION_INFO_QUERY))?;
        let row = info
            .into_iter()
            .next()
            .ok_or_else(|| SqlError::Shape("connection info returned no rows".to_string()))?;
        let [session_id, user_id, database]: [Value; 3] = row
            .try_into()
            .map_err(|row: Vec<Value>| SqlError::Shape(format!("expected 3 columns, got {}", row.len())))?;
        let session_id = id_column(&session_id, "session_id")?;
        let user_id = id_column(&user_id, "user_id")?;
        let database = database
            .as_str()
            .ok_or_else(|| SqlError::Shape("database name is not a string".to_string()))?;

        let rows = self
            .inner
            .query(&with_prefix(&history_query(session_id, user_id, database)))?;
        history_records(rows)
    }
}

impl SqlSession for InstrumentedSession {
    fn query(&self, sql: &str) -> Result<Vec<Vec<Value>>, SqlError> {
        self.inner.query(sql)
    }

    fn close(&self) -> Result<(), SqlError> {
        match self.query_history() {
            Ok(records) => self.recorder.count_queries(PACKAGE, records),
            Err(err) => tracing::warn!(%err, "failed to collect query history"),
        }
        self.inner.close()
    }
}

/// Host-side handle on a SQL session
#[derive(Clone)]
pub struct SqlHandle {
    session: Arc<Slot<dyn SqlSession>>,
    target: Arc<PatchTarget>,
}

impl SqlHandle {
    pub fn new(name: &str, session: Arc<dyn SqlSession>) -> Self {
        let session = Arc::new(Slot::new(session));
        let target =
            PatchTarget::new(PACKAGE, PACKAGE, name).with_slot(SESSION_ATTR, Arc::clone(&session));
        Self {
            session,
            target: Arc::new(target),
        }
    }

    pub fn session(&self) -> Arc<dyn SqlSession> {
        self.session.load()
    }

    pub fn target(&self) -> Arc<PatchTarget> {
        Arc::clone(&self.target)
    }
}

pub(crate) fn instrument(instrumentation: &Instrumentation, report: &mut InstrumentReport) {
    instrumentation.registry().register(PACKAGE, &REDSHIFT_STATS);
    instrumentation.patches().revert(PACKAGE);

    for target in instrumentation.targets_for(PACKAGE) {
        let recorder = instrumentation.recorder();
        instrumentation.install(
            report,
            PACKAGE,
            &target,
            SESSION_ATTR,
            |inner: Arc<dyn SqlSession>| {
                Arc::new(InstrumentedSession::new(inner, recorder)) as Arc<dyn SqlSession>
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::Collector;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeSession {
        statements: Mutex<Vec<String>>,
        closed: AtomicBool,
        broken_history: bool,
        text_ids: bool,
        text_times: bool,
    }

    impl SqlSession for FakeSession {
        fn query(&self, sql: &str) -> Result<Vec<Vec<Value>>, SqlError> {
            self.statements.lock().unwrap().push(sql.to_string());
            if sql.contains("pg_backend_pid") {
                if self.text_ids {
                    return Ok(vec![vec![json!("1073"), json!("100"), json!("dev")]]);
                }
                return Ok(vec![vec![json!(1073), json!(100), json!("dev")]]);
            }
            if sql.contains("sys_query_history") {
                if self.broken_history {
                    return Err(SqlError::Query("permission denied".to_string()));
                }
                let (start, end) = if self.text_times {
                    (json!("2023-11-14 22:13:20.5"), json!("2023-11-14T22:13:21Z"))
                } else {
                    (json!(1700000000.5), json!(1700000001.0))
                };
                return Ok(vec![vec![
                    json!("dev"),
                    start,
                    end,
                    json!("success"),
                    json!("select * from events"),
                    json!(500000),
                    json!(42),
                    json!(2048),
                ]]);
            }
            Ok(vec![])
        }

        fn close(&self) -> Result<(), SqlError> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    fn setup(session: Arc<FakeSession>) -> (SqlHandle, Instrumentation) {
        let handle = SqlHandle::new("warehouse", session);
        let instrumentation = Instrumentation::new(Arc::new(Collector::new()));
        instrumentation.register(handle.target());
        instrumentation.instrument();
        (handle, instrumentation)
    }

    #[test]
    fn test_close_records_history() {
        let session = Arc::new(FakeSession::default());
        let (handle, instrumentation) = setup(Arc::clone(&session));

        handle.session().query("select * from events").unwrap();
        handle.session().close().unwrap();

        assert!(session.closed.load(Ordering::SeqCst));
        let snapshot = instrumentation.collector().get();
        assert_eq!(
            snapshot.field(PACKAGE, None, QUERIES),
            Some(&json!([{
                "database": "dev",
                "start_time": 1700000000.5,
                "end_time": 1700000001.0,
                "status": "success",
                "query": "select * from events",
                "duration": 500000,
                "returned_rows": 42,
                "returned_bytes": 2048
            }]))
        );
    }

    #[test]
    fn test_helper_queries_are_marked() {
        let session = Arc::new(FakeSession::default());
        let (handle, _instrumentation) = setup(Arc::clone(&session));
        handle.session().close().unwrap();

        let statements = session.statements.lock().unwrap();
        assert_eq!(statements.len(), 2);
        assert!(statements.iter().all(|sql| sql.starts_with(SERVICE_PREFIX)));
        assert!(statements[1].contains("database_name = 'dev'"));
    }

    #[test]
    fn test_history_failure_still_closes() {
        let session = Arc::new(FakeSession {
            broken_history: true,
            ..FakeSession::default()
        });
        let (handle, instrumentation) = setup(Arc::clone(&session));

        handle.session().close().unwrap();
        assert!(session.closed.load(Ordering::SeqCst));
        assert!(instrumentation.collector().get().is_empty());
    }

    #[test]
    fn test_history_query_escapes_database() {
        let sql = history_query(1, 2, "o'brien");
        assert!(sql.contains("database_name = 'o''brien'"));
    }

    #[test]
    fn test_history_query_inlines_numeric_ids() {
        let sql = history_query(1073, 100, "dev");
        assert!(sql.contains("session_id = 1073 and"));
        assert!(sql.contains("user_id = 100 and"));
    }

    #[test]
    fn test_text_timestamps_become_epoch_seconds() {
        let session = Arc::new(FakeSession {
            text_times: true,
            ..FakeSession::default()
        });
        let (handle, instrumentation) = setup(Arc::clone(&session));
        handle.session().close().unwrap();

        let snapshot = instrumentation.collector().get();
        let records = snapshot.field(PACKAGE, None, QUERIES).unwrap();
        assert_eq!(records[0]["start_time"], json!(1700000000.5));
        assert_eq!(records[0]["end_time"], json!(1700000001.0));
    }

    #[test]
    fn test_running_query_keeps_null_end_time() {
        let records = history_records(vec![vec![
            json!("dev"),
            json!("2023-11-14 22:13:20"),
            Value::Null,
        ]])
        .unwrap();
        assert_eq!(records[0]["start_time"], json!(1700000000.0));
        assert_eq!(records[0]["end_time"], Value::Null);
    }

    #[test]
    fn test_unparseable_timestamp_is_rejected() {
        let result = history_records(vec![vec![json!("dev"), json!("yesterday")]]);
        assert!(matches!(result, Err(SqlError::Shape(_))));
    }

    #[test]
    fn test_text_session_ids_are_rejected() {
        let session = Arc::new(FakeSession {
            text_ids: true,
            ..FakeSession::default()
        });
        let (handle, instrumentation) = setup(Arc::clone(&session));
        handle.session().close().unwrap();

        // history query never issued with a quoted id
        assert_eq!(session.statements.lock().unwrap().len(), 1);
        assert!(session.closed.load(Ordering::SeqCst));
        assert!(instrumentation.collector().get().is_empty());
    }

    #[test]
    fn test_id_column_requires_integer() {
        assert_eq!(id_column(&json!(1073), "session_id"), Ok(1073));
        assert!(matches!(
            id_column(&json!("1073"), "session_id"),
            Err(SqlError::Shape(msg)) if msg.contains("session_id")
        ));
    }
}
