//! Correlation-id propagation across async boundaries.
//!
//! A correlation scope is bound to a task with [`run`]. Everything awaited inside
//! that future observes the same [`CorrelationId`] through [`get`] without the id
//! being threaded through call signatures. Tokio does not copy task-locals into
//! spawned tasks, so work handed to `tokio::spawn` must go through [`spawn`] or
//! [`propagate`] to stay inside the scope.
//!
//! Each scope also enters a `correlation` tracing span carrying the id, so every
//! event logged inside it is tagged automatically.

use std::fmt::{self, Display, Formatter};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use ahash::AHashMap;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::task::JoinHandle;
use tracing::Instrument;
use uuid::Uuid;

/// Header used to carry the correlation id on outbound requests.
pub const HEADER_NAME: &str = "x-correlation-id";

tokio::task_local! {
    static CONTEXT: CorrelationContext;
}

/// Opaque identifier tagging every event of one logical operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Generates a fresh random (v4) id in canonical hyphenated form.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Borrows the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for CorrelationId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for CorrelationId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for CorrelationId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

/// The store bound to one correlation scope.
///
/// Clones share the auxiliary entries, so values added by a spawned child are
/// visible to the parent scope and vice versa.
#[derive(Debug, Clone)]
pub struct CorrelationContext {
    id: CorrelationId,
    values: Arc<RwLock<AHashMap<String, Value>>>,
}

impl CorrelationContext {
    /// Creates an empty store rooted at `id`.
    pub fn new(id: CorrelationId) -> Self {
        Self {
            id,
            values: Arc::new(RwLock::new(AHashMap::new())),
        }
    }

    /// The scope's correlation id.
    pub fn id(&self) -> &CorrelationId {
        &self.id
    }

    /// Sets an auxiliary entry.
    pub fn insert(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.values.write().insert(key.into(), value.into());
    }

    /// Reads an auxiliary entry.
    pub fn value(&self, key: &str) -> Option<Value> {
        self.values.read().get(key).cloned()
    }

    /// The whole store as a JSON object, including `correlationId`.
    pub fn snapshot(&self) -> Value {
        let mut map: Map<String, Value> = self
            .values
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        map.insert("correlationId".to_owned(), Value::from(self.id.as_str()));
        Value::Object(map)
    }
}

/// Generates a fresh correlation id.
pub fn generate() -> CorrelationId {
    CorrelationId::generate()
}

/// Runs `fut` inside a new correlation scope.
///
/// When `id` is `None` a fresh one is generated. A nested `run` shadows the
/// outer scope for its own extent only. The output of `fut` is returned as is.
pub async fn run<F>(id: Option<CorrelationId>, fut: F) -> F::Output
where
    F: Future,
{
    let context = CorrelationContext::new(id.unwrap_or_else(generate));
    let span = tracing::info_span!("correlation", correlation_id = %context.id);
    CONTEXT.scope(context, fut.instrument(span)).await
}

/// Synchronous counterpart of [`run`].
pub fn run_sync<R>(id: Option<CorrelationId>, f: impl FnOnce() -> R) -> R {
    let context = CorrelationContext::new(id.unwrap_or_else(generate));
    let span = tracing::info_span!("correlation", correlation_id = %context.id);
    let _entered = span.enter();
    CONTEXT.sync_scope(context, f)
}

/// The active scope's correlation id, or `None` outside any scope.
pub fn get() -> Option<CorrelationId> {
    CONTEXT.try_with(|c| c.id.clone()).ok()
}

/// The active scope's full store.
pub fn context() -> Option<CorrelationContext> {
    CONTEXT.try_with(Clone::clone).ok()
}

/// Adds an entry to the active scope. Returns false when no scope is active.
pub fn add_context(key: impl Into<String>, value: impl Into<Value>) -> bool {
    CONTEXT.try_with(|c| c.insert(key, value)).is_ok()
}

/// Reads an entry from the active scope.
pub fn context_value(key: &str) -> Option<Value> {
    CONTEXT.try_with(|c| c.value(key)).ok().flatten()
}

/// Binds the current scope, if any, to `fut` so it can run on another task.
pub fn propagate<F>(fut: F) -> BoxFuture<'static, F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send,
{
    match context() {
        Some(context) => {
            let span = tracing::info_span!("correlation", correlation_id = %context.id);
            Box::pin(CONTEXT.scope(context, fut.instrument(span)))
        }
        None => Box::pin(fut),
    }
}

/// `tokio::spawn` that keeps the spawned task inside the current scope.
pub fn spawn<F>(fut: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    tokio::spawn(propagate(fut))
}

/// Wraps `f` so that every invocation runs inside a correlation scope, reusing
/// the ambient one when the caller already has it and generating one otherwise.
pub fn with_correlation_id<A, F, Fut>(f: F) -> impl Fn(A) -> BoxFuture<'static, Fut::Output>
where
    F: Fn(A) -> Fut + Send + Sync + 'static,
    Fut: Future + Send + 'static,
    Fut::Output: Send,
{
    move |arg| {
        let fut = f(arg);
        Box::pin(async move {
            if get().is_some() {
                fut.await
            } else {
                run(None, fut).await
            }
        })
    }
}

/// Logs the start, completion and failure of `fut` under `operation`,
/// tagged with the active correlation id and the elapsed time.
pub async fn traced<T, E, F>(operation: &str, fut: F) -> Result<T, E>
where
    F: Future<Output = Result<T, E>>,
    E: Display,
{
    let correlation_id = get();
    let started = Instant::now();
    tracing::debug!(operation, correlation_id = ?correlation_id, "operation called");

    let result = fut.await;
    let duration_ms = started.elapsed().as_millis() as u64;
    match &result {
        Ok(_) => tracing::debug!(
            operation,
            correlation_id = ?correlation_id,
            duration_ms,
            "operation completed"
        ),
        Err(error) => tracing::error!(
            operation,
            correlation_id = ?correlation_id,
            duration_ms,
            error = %error,
            "operation failed"
        ),
    }
    result
}

/// Header pair propagating the active correlation id to an outbound request.
pub fn outbound_headers() -> Option<(&'static str, String)> {
    get().map(|id| (HEADER_NAME, id.0))
}
