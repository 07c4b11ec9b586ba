//! The write-batch engine (spec.md §4.C).
//!
//! Groups semantically similar writes under a shared batch key, waits up to
//! `batch_ms` (or until `MaxBatchSize` is reached) and executes the group
//! with one of three strategies, then fans the individual results back out
//! to each caller.

use crate::error::{TqdbError, TqdbResult};
use crate::hint::QueryType;
use crate::metrics::{MetricsSink, truncate_for_label};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// Result of executing one write, delivered back to its originating caller.
#[derive(Debug, Clone, Default)]
pub struct WriteResult {
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub returning_values: Option<Vec<u8>>,
    pub batch_size: usize,
}

/// One statement to execute, as handed to the transaction strategy.
pub struct BatchStatement {
    pub query: String,
    pub params: Vec<u8>,
    pub has_returning: bool,
}

/// What the dispatch routine needs from the backend connection. Implemented
/// per front end (MariaDB/PostgreSQL) against the connection bound to this
/// batch key's shard.
#[async_trait]
pub trait BatchExecutor: Send + Sync {
    /// `BatchSize == 1`: execute directly.
    async fn exec_single(&self, stmt: &BatchStatement) -> TqdbResult<WriteResult>;

    /// All requests share identical `Query` text: prepare once, execute each
    /// parameter set individually. A per-row error fails only that row.
    async fn exec_prepared_each(&self, statements: &[BatchStatement]) -> Vec<TqdbResult<WriteResult>>;

    /// Mixed query text under one batch key: run inside one transaction. A
    /// single error fails (and rolls back) the whole batch.
    async fn exec_transaction(&self, statements: &[BatchStatement]) -> TqdbResult<Vec<WriteResult>>;
}

struct PendingRequest {
    stmt: BatchStatement,
    query_type: QueryType,
    result_tx: oneshot::Sender<TqdbResult<WriteResult>>,
    on_batch_complete: Option<Box<dyn FnOnce(usize) + Send>>,
}

struct BatchGroupInner {
    requests: Vec<PendingRequest>,
    first_seen: Option<Instant>,
}

struct BatchGroup {
    inner: Mutex<BatchGroupInner>,
}

impl BatchGroup {
    fn new() -> Self {
        Self {
            inner: Mutex::new(BatchGroupInner {
                requests: Vec::new(),
                first_seen: None,
            }),
        }
    }
}

/// Fallback hard ceiling (spec.md §4.C step 6) when the caller doesn't
/// override it via `Config.batch.max_wait_ms`.
const DEFAULT_HARD_TIMEOUT: Duration = Duration::from_secs(30);

pub struct WriteBatchEngine {
    executor: Arc<dyn BatchExecutor>,
    metrics: Arc<dyn MetricsSink>,
    max_batch_size: usize,
    drain_grace: Duration,
    hard_timeout: Duration,
    groups: Mutex<HashMap<String, Arc<BatchGroup>>>,
    closed: AtomicBool,
}

impl WriteBatchEngine {
    pub fn new(
        executor: Arc<dyn BatchExecutor>,
        metrics: Arc<dyn MetricsSink>,
        max_batch_size: usize,
        drain_grace: Duration,
    ) -> Arc<Self> {
        Self::with_hard_timeout(executor, metrics, max_batch_size, drain_grace, DEFAULT_HARD_TIMEOUT)
    }

    pub fn with_hard_timeout(
        executor: Arc<dyn BatchExecutor>,
        metrics: Arc<dyn MetricsSink>,
        max_batch_size: usize,
        drain_grace: Duration,
        hard_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            executor,
            metrics,
            max_batch_size,
            drain_grace,
            hard_timeout,
            groups: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        })
    }

    /// spec.md §4.C `Enqueue`. `batch_ms == 0` bypasses batching entirely,
    /// which is also how the front end must route any write issued inside a
    /// transaction (spec.md §8 invariant 5) — the front end simply never
    /// calls this with a nonzero `batch_ms` in that case.
    pub async fn enqueue(
        self: &Arc<Self>,
        cancel: &CancellationToken,
        batch_key: String,
        stmt: BatchStatement,
        query_type: QueryType,
        batch_ms: u32,
        on_batch_complete: Option<Box<dyn FnOnce(usize) + Send>>,
    ) -> TqdbResult<WriteResult> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TqdbError::ManagerClosed);
        }

        if batch_ms == 0 {
            let result = self.executor.exec_single(&stmt).await;
            if let Some(cb) = on_batch_complete {
                cb(1);
            }
            self.metrics.inc_batched_write(query_type.as_str());
            return result.map(|mut r| {
                r.batch_size = 1;
                r
            });
        }

        let (tx, rx) = oneshot::channel();
        let req = PendingRequest {
            stmt,
            query_type,
            result_tx: tx,
            on_batch_complete,
        };
        self.enqueue_batched(batch_key, req, batch_ms);

        tokio::select! {
            biased;
            res = rx => res.unwrap_or_else(|_| Err(TqdbError::Internal("batch result sender dropped".into()))),
            _ = cancel.cancelled() => Err(TqdbError::Canceled("context canceled".into())),
            _ = tokio::time::sleep(self.hard_timeout) => Err(TqdbError::Timeout),
        }
    }

    fn enqueue_batched(self: &Arc<Self>, key: String, req: PendingRequest, batch_ms: u32) {
        let group = {
            let mut groups = self.groups.lock().expect("batch map mutex poisoned");
            groups
                .entry(key.clone())
                .or_insert_with(|| Arc::new(BatchGroup::new()))
                .clone()
        };

        let (is_first, reached_max) = {
            let mut inner = group.inner.lock().expect("batch group mutex poisoned");
            let is_first = inner.first_seen.is_none();
            if is_first {
                inner.first_seen = Some(Instant::now());
            }
            inner.requests.push(req);
            (is_first, inner.requests.len() >= self.max_batch_size)
        };

        if reached_max {
            if let Some(g) = self.claim_group(&key) {
                let engine = self.clone();
                tokio::spawn(async move { engine.dispatch(g).await });
            }
        }

        if is_first {
            let engine = self.clone();
            let key = key.clone();
            let wait = Duration::from_millis(batch_ms as u64);
            tokio::spawn(async move {
                tokio::time::sleep(wait).await;
                if let Some(g) = engine.claim_group(&key) {
                    engine.dispatch(g).await;
                }
            });
        }
    }

    /// Atomically detach a group from the dispatch map. Whichever of the
    /// timer callback or the max-size check wins this race owns the
    /// dispatch (spec.md §3 BatchGroup invariant, §5).
    fn claim_group(&self, key: &str) -> Option<Arc<BatchGroup>> {
        self.groups
            .lock()
            .expect("batch map mutex poisoned")
            .remove(key)
    }

    async fn dispatch(self: Arc<Self>, group: Arc<BatchGroup>) {
        let (requests, first_seen) = {
            let mut inner = group.inner.lock().expect("batch group mutex poisoned");
            let requests = std::mem::take(&mut inner.requests);
            (requests, inner.first_seen)
        };
        if requests.is_empty() {
            return;
        }

        let batch_size = requests.len();
        let label_query = requests[0].stmt.query.clone();
        let truncated = truncate_for_label(&label_query).to_string();
        let label_type = requests[0].query_type.as_str();

        if let Some(first_seen) = first_seen {
            self.metrics
                .observe_batch_wait(&truncated, label_type, first_seen.elapsed().as_secs_f64());
        }
        self.metrics
            .observe_batch_size(&truncated, label_type, batch_size as f64);

        let exec_start = Instant::now();

        if batch_size == 1 {
            let PendingRequest {
                stmt,
                query_type,
                result_tx,
                on_batch_complete,
            } = { requests.into_iter().next().expect("checked non-empty") };
            let result = self.executor.exec_single(&stmt).await.map(|mut r| {
                r.batch_size = 1;
                r
            });
            self.metrics.inc_batched_write(query_type.as_str());
            let _ = result_tx.send(result);
            if let Some(cb) = on_batch_complete {
                cb(1);
            }
        } else if requests
            .iter()
            .all(|r| r.stmt.query == requests[0].stmt.query)
        {
            let stmts: Vec<BatchStatement> = requests
                .iter()
                .map(|r| BatchStatement {
                    query: r.stmt.query.clone(),
                    params: r.stmt.params.clone(),
                    has_returning: r.stmt.has_returning,
                })
                .collect();
            let results = self.executor.exec_prepared_each(&stmts).await;

            for (req, result) in requests.into_iter().zip(results.into_iter()) {
                self.metrics.inc_batched_write(req.query_type.as_str());
                let result = result.map(|mut r| {
                    r.batch_size = batch_size;
                    r
                });
                let _ = req.result_tx.send(result);
                if let Some(cb) = req.on_batch_complete {
                    cb(batch_size);
                }
            }
        } else {
            let stmts: Vec<BatchStatement> = requests
                .iter()
                .map(|r| BatchStatement {
                    query: r.stmt.query.clone(),
                    params: r.stmt.params.clone(),
                    has_returning: r.stmt.has_returning,
                })
                .collect();
            let outcome = self.executor.exec_transaction(&stmts).await;

            match outcome {
                Ok(results) => {
                    for (req, result) in requests.into_iter().zip(results.into_iter()) {
                        self.metrics.inc_batched_write(req.query_type.as_str());
                        let mut result = result;
                        result.batch_size = batch_size;
                        let _ = req.result_tx.send(Ok(result));
                        if let Some(cb) = req.on_batch_complete {
                            cb(batch_size);
                        }
                    }
                }
                Err(e) => {
                    // Transaction-strategy error fails every request in the
                    // batch (spec.md §7).
                    let msg = e.to_string();
                    for req in requests {
                        self.metrics.inc_batched_write(req.query_type.as_str());
                        let _ = req.result_tx.send(Err(TqdbError::BatchExec(msg.clone())));
                        if let Some(cb) = req.on_batch_complete {
                            cb(batch_size);
                        }
                    }
                }
            }
        }

        self.metrics.observe_batch_execute(
            &truncated,
            label_type,
            exec_start.elapsed().as_secs_f64(),
        );
    }

    /// `Close`: new enqueues start failing with `ErrManagerClosed`
    /// immediately; already-armed groups still fire their own timers and
    /// drain normally within the grace window.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        tokio::time::sleep(self.drain_grace).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::NoopMetricsSink;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    struct CountingExecutor {
        single_calls: AtomicUsize,
        prepared_calls: AtomicUsize,
        transaction_calls: AtomicUsize,
        fail_second_transaction_stmt: bool,
    }

    impl CountingExecutor {
        fn new() -> Self {
            Self {
                single_calls: AtomicUsize::new(0),
                prepared_calls: AtomicUsize::new(0),
                transaction_calls: AtomicUsize::new(0),
                fail_second_transaction_stmt: false,
            }
        }

        fn failing() -> Self {
            Self {
                fail_second_transaction_stmt: true,
                ..Self::new()
            }
        }
    }

    #[async_trait]
    impl BatchExecutor for CountingExecutor {
        async fn exec_single(&self, _stmt: &BatchStatement) -> TqdbResult<WriteResult> {
            self.single_calls.fetch_add(1, AtomicOrdering::SeqCst);
            Ok(WriteResult {
                affected_rows: 1,
                last_insert_id: 1,
                returning_values: None,
                batch_size: 1,
            })
        }

        async fn exec_prepared_each(
            &self,
            statements: &[BatchStatement],
        ) -> Vec<TqdbResult<WriteResult>> {
            self.prepared_calls.fetch_add(1, AtomicOrdering::SeqCst);
            statements
                .iter()
                .map(|_| {
                    Ok(WriteResult {
                        affected_rows: 1,
                        last_insert_id: 1,
                        returning_values: None,
                        batch_size: 0,
                    })
                })
                .collect()
        }

        async fn exec_transaction(
            &self,
            statements: &[BatchStatement],
        ) -> TqdbResult<Vec<WriteResult>> {
            self.transaction_calls.fetch_add(1, AtomicOrdering::SeqCst);
            if self.fail_second_transaction_stmt && statements.len() >= 2 {
                return Err(TqdbError::BatchExec("forced failure".into()));
            }
            Ok(statements
                .iter()
                .map(|_| WriteResult {
                    affected_rows: 1,
                    last_insert_id: 1,
                    returning_values: None,
                    batch_size: 0,
                })
                .collect())
        }
    }

    fn stmt(query: &str) -> BatchStatement {
        BatchStatement {
            query: query.to_string(),
            params: Vec::new(),
            has_returning: false,
        }
    }

    #[tokio::test]
    async fn zero_batch_ms_bypasses_batching() {
        let exec = Arc::new(CountingExecutor::new());
        let engine = WriteBatchEngine::new(exec.clone(), Arc::new(NoopMetricsSink), 1000, Duration::from_millis(200));
        let result = engine
            .enqueue(
                &CancellationToken::new(),
                "INSERT INTO t(v) VALUES (?)".into(),
                stmt("INSERT INTO t(v) VALUES (?)"),
                QueryType::Insert,
                0,
                None,
            )
            .await
            .unwrap();
        assert_eq!(result.batch_size, 1);
        assert_eq!(exec.single_calls.load(AtomicOrdering::SeqCst), 1);
    }

    #[tokio::test]
    async fn identical_queries_batch_through_prepared_strategy() {
        let exec = Arc::new(CountingExecutor::new());
        let engine = WriteBatchEngine::new(exec.clone(), Arc::new(NoopMetricsSink), 1000, Duration::from_millis(200));

        let mut handles = Vec::new();
        for _ in 0..50 {
            let engine = engine.clone();
            handles.push(tokio::spawn(async move {
                engine
                    .enqueue(
                        &CancellationToken::new(),
                        "INSERT INTO t(v) VALUES (?)".into(),
                        stmt("INSERT INTO t(v) VALUES (?)"),
                        QueryType::Insert,
                        10,
                        None,
                    )
                    .await
            }));
        }

        let mut ok_count = 0;
        for h in handles {
            let r = h.await.unwrap().unwrap();
            assert_eq!(r.batch_size, 50);
            ok_count += 1;
        }
        assert_eq!(ok_count, 50);
        assert_eq!(exec.prepared_calls.load(AtomicOrdering::SeqCst), 1);
        assert_eq!(exec.transaction_calls.load(AtomicOrdering::SeqCst), 0);
    }

    #[tokio::test]
    async fn mixed_queries_use_transaction_strategy_and_share_errors() {
        let exec = Arc::new(CountingExecutor::failing());
        let engine = WriteBatchEngine::new(exec.clone(), Arc::new(NoopMetricsSink), 1000, Duration::from_millis(200));

        let key = "shared-batch-key".to_string();
        let a = {
            let engine = engine.clone();
            let key = key.clone();
            tokio::spawn(async move {
                engine
                    .enqueue(
                        &CancellationToken::new(),
                        key,
                        stmt("INSERT INTO t(v) VALUES (1)"),
                        QueryType::Insert,
                        20,
                        None,
                    )
                    .await
            })
        };
        let b = {
            let engine = engine.clone();
            let key = key.clone();
            tokio::spawn(async move {
                engine
                    .enqueue(
                        &CancellationToken::new(),
                        key,
                        stmt("INSERT INTO t(v) VALUES (2)"),
                        QueryType::Insert,
                        20,
                        None,
                    )
                    .await
            })
        };

        let ra = a.await.unwrap();
        let rb = b.await.unwrap();
        assert!(ra.is_err());
        assert!(rb.is_err());
        assert_eq!(exec.transaction_calls.load(AtomicOrdering::SeqCst), 1);
        assert_eq!(exec.prepared_calls.load(AtomicOrdering::SeqCst), 0);
    }

    #[tokio::test]
    async fn max_batch_size_dispatches_without_waiting_for_timer() {
        let exec = Arc::new(CountingExecutor::new());
        // Long timer window; if max-size dispatch didn't fire immediately,
        // this test would hang for a long time.
        let engine = WriteBatchEngine::new(exec.clone(), Arc::new(NoopMetricsSink), 3, Duration::from_millis(200));

        let mut handles = Vec::new();
        for _ in 0..3 {
            let engine = engine.clone();
            handles.push(tokio::spawn(async move {
                engine
                    .enqueue(
                        &CancellationToken::new(),
                        "INSERT INTO t(v) VALUES (?)".into(),
                        stmt("INSERT INTO t(v) VALUES (?)"),
                        QueryType::Insert,
                        10_000,
                        None,
                    )
                    .await
            }));
        }

        for h in handles {
            let r = tokio::time::timeout(Duration::from_secs(2), h)
                .await
                .expect("should not wait for the 10s timer")
                .unwrap()
                .unwrap();
            assert_eq!(r.batch_size, 3);
        }
    }

    #[tokio::test]
    async fn closed_engine_rejects_new_enqueues() {
        let exec = Arc::new(CountingExecutor::new());
        let engine = WriteBatchEngine::new(exec, Arc::new(NoopMetricsSink), 1000, Duration::from_millis(10));
        engine.close().await;

        let err = engine
            .enqueue(
                &CancellationToken::new(),
                "INSERT INTO t(v) VALUES (?)".into(),
                stmt("INSERT INTO t(v) VALUES (?)"),
                QueryType::Insert,
                10,
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TqdbError::ManagerClosed));
    }

    #[tokio::test]
    async fn on_batch_complete_receives_final_batch_size() {
        let exec = Arc::new(CountingExecutor::new());
        let engine = WriteBatchEngine::new(exec, Arc::new(NoopMetricsSink), 1000, Duration::from_millis(200));
        let (tx, rx) = oneshot::channel::<usize>();
        let cb: Box<dyn FnOnce(usize) + Send> = Box::new(move |size| {
            let _ = tx.send(size);
        });

        let _ = engine
            .enqueue(
                &CancellationToken::new(),
                "INSERT INTO t(v) VALUES (?)".into(),
                stmt("INSERT INTO t(v) VALUES (?)"),
                QueryType::Insert,
                10,
                Some(cb),
            )
            .await
            .unwrap();

        let observed = rx.await.unwrap();
        assert_eq!(observed, 1);
    }

    #[tokio::test]
    async fn hard_timeout_is_configurable_via_with_hard_timeout() {
        let exec = Arc::new(CountingExecutor::new());
        // batch_ms far longer than the hard timeout, so the caller's wait
        // on its result channel expires via the timeout branch, not a
        // dispatch.
        let engine = WriteBatchEngine::with_hard_timeout(
            exec,
            Arc::new(NoopMetricsSink),
            1000,
            Duration::from_millis(200),
            Duration::from_millis(50),
        );

        let err = engine
            .enqueue(
                &CancellationToken::new(),
                "INSERT INTO t(v) VALUES (?)".into(),
                stmt("INSERT INTO t(v) VALUES (?)"),
                QueryType::Insert,
                10_000,
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TqdbError::Timeout));
    }
}
