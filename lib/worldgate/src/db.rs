//! Opaque persistence interface. The core addresses storage through logical
//! statement ids and positional values, never through schema knowledge.

use slog::{debug, error, Logger};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;

/// Logical statement ids the session layer issues.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Statement {
    SelAccountInfoByName,
    SelCharacters,
    SelAccountData,
    RepAccountData,
    SelTutorials,
    RepTutorials,
    UpdLastIp,
    UpdMuteTime,
    UpdAccountOnline,
    UpdCharactersOfflineByAccount,
    RepCharacter,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Uint(u64),
    Int(i64),
    Str(String),
    Blob(Vec<u8>),
    Null,
}

impl Value {
    #[inline]
    pub fn as_u32(&self) -> Option<u32> {
        match self {
            Value::Uint(value) => Some(*value as u32),
            _ => None,
        }
    }

    #[inline]
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::Uint(value) => Some(*value),
            _ => None,
        }
    }

    #[inline]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(value) => Some(*value),
            Value::Uint(value) => Some(*value as i64),
            _ => None,
        }
    }

    #[inline]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(value) => Some(value),
            _ => None,
        }
    }

    #[inline]
    pub fn as_blob(&self) -> Option<&[u8]> {
        match self {
            Value::Blob(value) => Some(value),
            _ => None,
        }
    }

    #[inline]
    pub fn as_bool(&self) -> Option<bool> {
        self.as_u64().map(|value| value != 0)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row(pub Vec<Value>);

impl Row {
    #[inline]
    pub fn get(&self, index: usize) -> Option<&Value> {
        self.0.get(index)
    }

    #[inline]
    pub fn u32(&self, index: usize) -> Option<u32> {
        self.get(index).and_then(Value::as_u32)
    }

    #[inline]
    pub fn u64(&self, index: usize) -> Option<u64> {
        self.get(index).and_then(Value::as_u64)
    }

    #[inline]
    pub fn i64(&self, index: usize) -> Option<i64> {
        self.get(index).and_then(Value::as_i64)
    }

    #[inline]
    pub fn str(&self, index: usize) -> Option<&str> {
        self.get(index).and_then(Value::as_str)
    }

    #[inline]
    pub fn blob(&self, index: usize) -> Option<&[u8]> {
        self.get(index).and_then(Value::as_blob)
    }

    #[inline]
    pub fn bool(&self, index: usize) -> Option<bool> {
        self.get(index).and_then(Value::as_bool)
    }
}

/// Result set of a query. "No rows" is an ordinary outcome, not an error.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    pub rows: Vec<Row>,
}

impl QueryResult {
    #[inline]
    pub fn empty() -> QueryResult {
        QueryResult { rows: Vec::new() }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    #[inline]
    pub fn first(&self) -> Option<&Row> {
        self.rows.first()
    }
}

/// Storage backend boundary. Implementations run on the worker thread.
pub trait Database: Send + Sync {
    fn query(&self, statement: Statement, args: &[Value]) -> QueryResult;
    fn execute(&self, statement: Statement, args: &[Value]);
}

/// Backend that answers every query with an empty result. Default for tests.
pub struct NullDatabase;

impl Database for NullDatabase {
    fn query(&self, _statement: Statement, _args: &[Value]) -> QueryResult {
        QueryResult::empty()
    }

    fn execute(&self, _statement: Statement, _args: &[Value]) {}
}

enum Job {
    Query {
        statement: Statement,
        args: Vec<Value>,
        reply: mpsc::Sender<QueryResult>,
    },
    Execute {
        statement: Statement,
        args: Vec<Value>,
    },
}

/// Handle to a query submitted to the worker. Polled, never awaited.
pub struct PendingQuery {
    reply: mpsc::Receiver<QueryResult>,
}

impl PendingQuery {
    /// Returns the result once available. A worker that went away before
    /// answering yields an empty result so callers degrade to "no rows".
    #[inline]
    pub fn poll(&self) -> Option<QueryResult> {
        match self.reply.try_recv() {
            Ok(result) => Some(result),
            Err(mpsc::TryRecvError::Empty) => None,
            Err(mpsc::TryRecvError::Disconnected) => Some(QueryResult::empty()),
        }
    }
}

/// Background thread executing statements against one backend, preserving
/// submission order. Queries answer through per-call channels, executes are
/// fire-and-forget.
pub struct DatabaseWorker {
    jobs: Mutex<mpsc::Sender<Job>>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
    log: Logger,
}

impl DatabaseWorker {
    pub fn spawn(name: &str, backend: Arc<dyn Database>, log: Logger) -> DatabaseWorker {
        let (jobs, inbox) = mpsc::channel::<Job>();
        let worker_log = log.clone();

        let worker = thread::Builder::new()
            .name(format!("db-{}", name))
            .spawn(move || {
                while let Ok(job) = inbox.recv() {
                    match job {
                        Job::Query {
                            statement,
                            args,
                            reply,
                        } => {
                            let result = backend.query(statement, &args);
                            // Receiver may be gone if the session died mid-flight
                            if reply.send(result).is_err() {
                                debug!(worker_log, "Dropped query result"; "statement" => ?statement);
                            }
                        }
                        Job::Execute { statement, args } => backend.execute(statement, &args),
                    }
                }
            })
            .expect("Database worker spawn failed");

        DatabaseWorker {
            jobs: Mutex::new(jobs),
            worker: Mutex::new(Some(worker)),
            log,
        }
    }

    /// Submits a query and returns its polling handle.
    pub fn async_query(&self, statement: Statement, args: Vec<Value>) -> PendingQuery {
        let (reply, receiver) = mpsc::channel();

        self.submit(Job::Query {
            statement,
            args,
            reply,
        });

        PendingQuery { reply: receiver }
    }

    /// Submits a write with no result channel.
    pub fn execute(&self, statement: Statement, args: Vec<Value>) {
        self.submit(Job::Execute { statement, args });
    }

    fn submit(&self, job: Job) {
        let sender = self.jobs.lock().expect("Database job lock poisoned");

        if sender.send(job).is_err() {
            error!(self.log, "Database worker is gone, job dropped");
        }
    }
}

impl Drop for DatabaseWorker {
    fn drop(&mut self) {
        // Disconnect the channel so the worker loop ends, then join it
        {
            let (sender, _) = mpsc::channel();
            let mut jobs = self.jobs.lock().expect("Database job lock poisoned");
            *jobs = sender;
        }

        if let Some(worker) = self.worker.lock().expect("Worker handle lock poisoned").take() {
            drop(worker.join());
        }
    }
}
