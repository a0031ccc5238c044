//! Command Handler Module
//!
//! This module turns decoded requests into storage calls and storage
//! outcomes into response frames.
//!
//! ## Supported Commands
//!
//! - `get` - Look up a key (empty payload if absent)
//! - `set` - Create or overwrite a key
//! - `del` - Remove a key (no-op if absent)
//! - `exp` - Dump every record as a JSON array
//! - `imp` - Apply a JSON array of `{key, value}` records, in order
//!
//! ## Execution
//!
//! ```text
//! Request ──validate──> spawn_blocking(storage call, ctx)
//!                              │
//!              ┌───────────────┼────────────────┐
//!              ▼               ▼                ▼
//!          Ok(value)       Err(error)      deadline hit
//!              │               │                │
//!              ▼               ▼                ▼  ctx.cancel()
//!          'O' payload    'N' message      'N' timed out
//! ```
//!
//! Exactly one response is produced for every request. Storage calls run on
//! the blocking pool so that a slow engine never stalls the reactor, and an
//! operation whose deadline passes has its context cancelled so the engine
//! stops at its next check instead of finishing unobserved.

use crate::protocol::{
    trim_field, validate_key, validate_record, Opcode, Request, Response, ValidationError,
};
use crate::storage::{OpContext, Record, Storage, StorageError};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinError;
use tracing::{debug, error, warn};

/// Deadline applied to every storage operation.
pub const DEFAULT_OP_TIMEOUT: Duration = Duration::from_secs(10);

/// Why a command produced a failure response.
#[derive(Debug, Error)]
pub enum CommandError {
    /// The request violated the key/value input domain
    #[error("{op} operation rejected: {source}")]
    Invalid {
        op: Opcode,
        #[source]
        source: ValidationError,
    },

    /// A key or value was not valid UTF-8
    #[error("{op} operation rejected: {field} is not valid UTF-8")]
    NotUtf8 { op: Opcode, field: &'static str },

    /// The import payload was not a JSON array of records
    #[error("import operation rejected: invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    /// The export could not be serialized
    #[error("export operation failed: {0}")]
    Encode(serde_json::Error),

    /// The storage engine returned an error
    #[error("{op} operation failed: {source}")]
    Storage {
        op: Opcode,
        #[source]
        source: StorageError,
    },

    /// The operation outlived its deadline
    #[error("{op} operation timed out after {}ms", timeout.as_millis())]
    Timeout { op: Opcode, timeout: Duration },

    /// The task running the operation panicked
    #[error("{op} operation failed: internal error")]
    Panicked { op: Opcode },
}

/// A request that passed validation and is ready to hit storage.
#[derive(Debug)]
enum Operation {
    Search(String),
    Insert(String, String),
    Delete(String),
    Import(Vec<Record>),
    Export,
}

/// Dispatches requests to the shared storage engine.
///
/// Cheap to clone; every connection holds its own copy pointing at the same
/// engine.
#[derive(Clone)]
pub struct CommandHandler {
    /// The storage engine shared by all connections
    storage: Arc<dyn Storage>,
    /// Deadline for each storage call
    op_timeout: Duration,
}

impl std::fmt::Debug for CommandHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandHandler")
            .field("storage", &self.storage.name())
            .field("op_timeout", &self.op_timeout)
            .finish()
    }
}

impl CommandHandler {
    /// Creates a handler with the default 10 second deadline.
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self::with_timeout(storage, DEFAULT_OP_TIMEOUT)
    }

    /// Creates a handler with a custom deadline.
    pub fn with_timeout(storage: Arc<dyn Storage>, op_timeout: Duration) -> Self {
        Self {
            storage,
            op_timeout,
        }
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn op_timeout(&self) -> Duration {
        self.op_timeout
    }

    /// Executes a request and returns the response to send back.
    ///
    /// # Arguments
    ///
    /// * `root` - The connection's context; the operation runs in a child of it
    /// * `request` - The decoded request
    pub async fn execute(&self, root: &OpContext, request: Request) -> Response {
        let op = request.opcode();

        let result = match prepare(request) {
            Ok(operation) => self.run(root, op, operation).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(payload) => Response::Ok(payload),
            Err(e) => {
                match &e {
                    CommandError::Panicked { .. } => error!(error = %e, "Command failed"),
                    CommandError::Timeout { .. } => warn!(error = %e, "Command timed out"),
                    _ => debug!(error = %e, "Command failed"),
                }
                Response::Err(e.to_string())
            }
        }
    }

    /// Runs `operation` on the blocking pool and races it against the deadline.
    async fn run(
        &self,
        root: &OpContext,
        op: Opcode,
        operation: Operation,
    ) -> Result<Bytes, CommandError> {
        let ctx = root.child(self.op_timeout);
        let storage = Arc::clone(&self.storage);
        let task_ctx = ctx.clone();

        let task = tokio::task::spawn_blocking(move || apply(storage.as_ref(), &task_ctx, operation));

        // If this future is dropped before the task finishes, the engine
        // still sees the cancellation.
        let _guard = ctx.cancel_on_drop();

        match tokio::time::timeout(self.op_timeout, task).await {
            Ok(Ok(Ok(outcome))) => outcome.into_payload(),
            Ok(Ok(Err(StorageError::DeadlineExceeded))) => Err(CommandError::Timeout {
                op,
                timeout: self.op_timeout,
            }),
            Ok(Ok(Err(source))) => Err(CommandError::Storage { op, source }),
            Ok(Err(join_error)) => Err(panicked(op, join_error)),
            Err(_elapsed) => {
                // The blocking task cannot be aborted; cancel its context so
                // the engine bails out at its next check.
                ctx.cancel();
                Err(CommandError::Timeout {
                    op,
                    timeout: self.op_timeout,
                })
            }
        }
    }
}

/// Result of a storage call, before serialization.
enum Outcome {
    Value(String),
    Done,
    Records(Vec<Record>),
}

impl Outcome {
    fn into_payload(self) -> Result<Bytes, CommandError> {
        match self {
            Outcome::Value(value) => Ok(Bytes::from(value)),
            Outcome::Done => Ok(Bytes::new()),
            Outcome::Records(records) => serde_json::to_vec(&records)
                .map(Bytes::from)
                .map_err(CommandError::Encode),
        }
    }
}

/// Validates a request and converts its raw fields into owned strings.
fn prepare(request: Request) -> Result<Operation, CommandError> {
    let op = request.opcode();

    match request {
        Request::Get { key } => {
            validate_key(&key).map_err(|source| CommandError::Invalid { op, source })?;
            Ok(Operation::Search(utf8(op, "key", key)?))
        }
        Request::Set { key, value } => {
            validate_record(&key, &value)
                .map_err(|source| CommandError::Invalid { op, source })?;
            Ok(Operation::Insert(
                utf8(op, "key", key)?,
                utf8(op, "value", value)?,
            ))
        }
        Request::Delete { key } => {
            validate_key(&key).map_err(|source| CommandError::Invalid { op, source })?;
            Ok(Operation::Delete(utf8(op, "key", key)?))
        }
        Request::Export => Ok(Operation::Export),
        Request::Import { payload } => {
            let records: Vec<Record> = serde_json::from_slice(trim_field(&payload))?;

            // Reject the whole batch up front; partial application is only
            // possible for storage failures.
            for record in &records {
                validate_record(record.key.as_bytes(), record.value.as_bytes())
                    .map_err(|source| CommandError::Invalid { op, source })?;
            }
            Ok(Operation::Import(records))
        }
    }
}

/// Performs the storage call. Runs on a blocking thread.
fn apply(storage: &dyn Storage, ctx: &OpContext, operation: Operation) -> Result<Outcome, StorageError> {
    match operation {
        Operation::Search(key) => storage.search(ctx, &key).map(Outcome::Value),
        Operation::Insert(key, value) => storage.insert(ctx, &key, &value).map(|_| Outcome::Done),
        Operation::Delete(key) => storage.delete(ctx, &key).map(|_| Outcome::Done),
        Operation::Import(records) => storage.import(ctx, &records).map(|_| Outcome::Done),
        Operation::Export => storage.export(ctx).map(Outcome::Records),
    }
}

fn utf8(op: Opcode, field: &'static str, bytes: Bytes) -> Result<String, CommandError> {
    String::from_utf8(bytes.to_vec()).map_err(|_| CommandError::NotUtf8 { op, field })
}

fn panicked(op: Opcode, join_error: JoinError) -> CommandError {
    if join_error.is_panic() {
        error!(%op, "Storage task panicked");
    }
    CommandError::Panicked { op }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{HashTable, StorageResult};
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn handler() -> CommandHandler {
        CommandHandler::new(Arc::new(HashTable::with_buckets(1021)))
    }

    fn get(key: &str) -> Request {
        Request::Get {
            key: Bytes::copy_from_slice(key.as_bytes()),
        }
    }

    fn set(key: &str, value: &str) -> Request {
        Request::Set {
            key: Bytes::copy_from_slice(key.as_bytes()),
            value: Bytes::copy_from_slice(value.as_bytes()),
        }
    }

    fn del(key: &str) -> Request {
        Request::Delete {
            key: Bytes::copy_from_slice(key.as_bytes()),
        }
    }

    fn error_text(response: Response) -> String {
        match response {
            Response::Err(message) => message,
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_set_get_del() {
        let handler = handler();
        let root = OpContext::background();

        assert_eq!(
            handler.execute(&root, set("key100000", "value100000")).await,
            Response::ok()
        );
        assert_eq!(
            handler.execute(&root, get("key100000")).await,
            Response::with_payload("value100000")
        );
        assert_eq!(handler.execute(&root, del("key100000")).await, Response::ok());
        assert_eq!(
            handler.execute(&root, get("key100000")).await,
            Response::with_payload("")
        );
    }

    #[tokio::test]
    async fn test_del_absent_succeeds() {
        let handler = handler();
        let root = OpContext::background();
        assert_eq!(handler.execute(&root, del("nothing")).await, Response::ok());
    }

    #[tokio::test]
    async fn test_empty_key_rejected() {
        let handler = handler();
        let root = OpContext::background();
        let message = error_text(handler.execute(&root, get("")).await);
        assert!(message.contains("key must not be empty"), "{}", message);
    }

    #[tokio::test]
    async fn test_oversize_value_rejected() {
        let handler = handler();
        let root = OpContext::background();
        let message = error_text(handler.execute(&root, set("k", &"v".repeat(512))).await);
        assert!(message.starts_with("set operation rejected"), "{}", message);
        assert!(handler.storage().is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_invalid_utf8_rejected() {
        let handler = handler();
        let root = OpContext::background();
        let request = Request::Get {
            key: Bytes::from_static(&[0xff, 0xfe]),
        };
        let message = error_text(handler.execute(&root, request).await);
        assert!(message.contains("not valid UTF-8"), "{}", message);
    }

    #[tokio::test]
    async fn test_import_then_export() {
        let handler = handler();
        let root = OpContext::background();
        let records: Vec<Record> = (0..1000)
            .map(|i| Record::new(format!("key{}", i), format!("value{}", i)))
            .collect();

        let import = Request::Import {
            payload: Bytes::from(serde_json::to_vec(&records).unwrap()),
        };
        assert_eq!(handler.execute(&root, import).await, Response::ok());

        let payload = match handler.execute(&root, Request::Export).await {
            Response::Ok(payload) => payload,
            other => panic!("unexpected response: {:?}", other),
        };
        let exported: Vec<Record> = serde_json::from_slice(&payload).unwrap();
        assert_eq!(exported.len(), 1000);

        let expected: HashSet<Record> = records.into_iter().collect();
        assert_eq!(exported.into_iter().collect::<HashSet<_>>(), expected);
    }

    #[tokio::test]
    async fn test_export_empty_is_json_array() {
        let handler = handler();
        let root = OpContext::background();
        assert_eq!(
            handler.execute(&root, Request::Export).await,
            Response::with_payload("[]")
        );
    }

    #[tokio::test]
    async fn test_import_invalid_json() {
        let handler = handler();
        let root = OpContext::background();
        let request = Request::Import {
            payload: Bytes::from_static(b"{not json"),
        };
        let message = error_text(handler.execute(&root, request).await);
        assert!(message.contains("invalid JSON"), "{}", message);
    }

    #[tokio::test]
    async fn test_import_validates_whole_batch_first() {
        let handler = handler();
        let root = OpContext::background();
        let request = Request::Import {
            payload: Bytes::from_static(br#"[{"key":"a","value":"1"},{"key":"","value":"2"}]"#),
        };
        error_text(handler.execute(&root, request).await);
        assert!(handler.storage().is_empty().unwrap());
    }

    /// Engine that sleeps until cancelled, recording whether it saw the cancel.
    struct Stalled {
        saw_cancel: Arc<AtomicBool>,
    }

    impl Storage for Stalled {
        fn search(&self, ctx: &OpContext, _key: &str) -> StorageResult<String> {
            loop {
                if ctx.is_cancelled() {
                    self.saw_cancel.store(true, Ordering::SeqCst);
                    return Err(StorageError::Cancelled);
                }
                std::thread::sleep(Duration::from_millis(5));
            }
        }
        fn insert(&self, _: &OpContext, _: &str, _: &str) -> StorageResult<bool> {
            Err(StorageError::LockPoisoned("stalled"))
        }
        fn delete(&self, _: &OpContext, _: &str) -> StorageResult<bool> {
            panic!("delete exploded")
        }
        fn export(&self, _: &OpContext) -> StorageResult<Vec<Record>> {
            Ok(Vec::new())
        }
        fn len(&self) -> StorageResult<usize> {
            Ok(0)
        }
        fn name(&self) -> &'static str {
            "stalled"
        }
    }

    #[tokio::test]
    async fn test_timeout_cancels_operation() {
        let saw_cancel = Arc::new(AtomicBool::new(false));
        let storage = Arc::new(Stalled {
            saw_cancel: Arc::clone(&saw_cancel),
        });
        let handler = CommandHandler::with_timeout(storage, Duration::from_millis(50));
        let root = OpContext::background();

        let message = error_text(handler.execute(&root, get("slow")).await);
        assert!(message.contains("timed out"), "{}", message);

        // The abandoned task observes the cancellation and stops
        for _ in 0..100 {
            if saw_cancel.load(Ordering::SeqCst) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(saw_cancel.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_dropped_execute_cancels_operation() {
        let saw_cancel = Arc::new(AtomicBool::new(false));
        let storage = Arc::new(Stalled {
            saw_cancel: Arc::clone(&saw_cancel),
        });
        // Deadline far beyond the test, so only the drop can stop the engine
        let handler = CommandHandler::new(storage);
        let root = OpContext::background();

        let abandoned =
            tokio::time::timeout(Duration::from_millis(50), handler.execute(&root, get("slow")))
                .await;
        assert!(abandoned.is_err());
        assert!(!root.is_cancelled());

        for _ in 0..100 {
            if saw_cancel.load(Ordering::SeqCst) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(saw_cancel.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_storage_error_reported() {
        let storage = Arc::new(Stalled {
            saw_cancel: Arc::new(AtomicBool::new(false)),
        });
        let handler = CommandHandler::new(storage);
        let root = OpContext::background();

        let message = error_text(handler.execute(&root, set("k", "v")).await);
        assert_eq!(message, "set operation failed: lock poisoned: stalled");
    }

    #[tokio::test]
    async fn test_panic_is_recovered() {
        let storage = Arc::new(Stalled {
            saw_cancel: Arc::new(AtomicBool::new(false)),
        });
        let handler = CommandHandler::new(storage);
        let root = OpContext::background();

        let message = error_text(handler.execute(&root, del("k")).await);
        assert_eq!(message, "del operation failed: internal error");

        // The handler keeps working afterwards
        assert_eq!(
            handler.execute(&root, Request::Export).await,
            Response::with_payload("[]")
        );
    }
}
