//! OperationRegistry: dependency-aware scheduler state for queued tool calls.
//!
//! Every map lives behind one mutex: a cascade must never be observed half
//! applied, so status reads and the transitive walk share the same lock.

use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::types::{Batch, BatchProgress, OperationError, OperationStatus, QueuedOperation};

struct Entry {
    op: QueuedOperation,
    /// Insertion sequence, the tie-break for equal priorities
    seq: u64,
}

#[derive(Default)]
struct Inner {
    operations: HashMap<String, Entry>,
    /// dependency id → ids that declared it
    dependents: HashMap<String, Vec<String>>,
    batches: HashMap<String, Batch>,
    undo: Vec<String>,
    redo: Vec<String>,
    next_seq: u64,
}

#[derive(Default)]
pub struct OperationRegistry {
    inner: Mutex<Inner>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Enqueue
    // ─────────────────────────────────────────────────────────────────────

    /// Enqueue one operation and return its id.
    ///
    /// An operation whose dependency already failed or was cancelled is
    /// cancelled on arrival instead of waiting forever.
    pub fn queue_operation(&self, mut op: QueuedOperation) -> Result<String, OperationError> {
        let mut inner = self.inner.lock();
        if op.id.is_empty() {
            op.id = uuid::Uuid::new_v4().to_string();
        } else if inner.operations.contains_key(&op.id) {
            return Err(OperationError::DuplicateId(op.id));
        }
        Ok(inner.insert(op))
    }

    /// Enqueue several operations under one new batch id, all or nothing.
    pub fn create_batch(
        &self,
        session_id: &str,
        mut ops: Vec<QueuedOperation>,
    ) -> Result<String, OperationError> {
        if ops.is_empty() {
            return Err(OperationError::EmptyBatch);
        }
        let mut inner = self.inner.lock();

        let mut seen = HashSet::new();
        for op in &mut ops {
            if op.id.is_empty() {
                op.id = uuid::Uuid::new_v4().to_string();
            }
            if inner.operations.contains_key(&op.id) || !seen.insert(op.id.clone()) {
                return Err(OperationError::DuplicateId(op.id.clone()));
            }
        }

        let batch_id = uuid::Uuid::new_v4().to_string();
        inner.batches.insert(
            batch_id.clone(),
            Batch {
                id: batch_id.clone(),
                session_id: session_id.to_string(),
                operation_ids: Vec::with_capacity(ops.len()),
                created_at: Utc::now(),
            },
        );
        let count = ops.len();
        for mut op in ops {
            if op.session_id.is_empty() {
                op.session_id = session_id.to_string();
            }
            op.batch_id = Some(batch_id.clone());
            inner.insert(op);
        }
        info!(%batch_id, session_id, operations = count, "batch created");
        Ok(batch_id)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────────────────

    /// Queued operations of `session_id` whose dependencies are all
    /// completed, highest priority first, insertion order among equals.
    pub fn get_pending_operations(&self, session_id: &str) -> Vec<QueuedOperation> {
        let inner = self.inner.lock();
        let mut ready: Vec<&Entry> = inner
            .operations
            .values()
            .filter(|e| e.op.session_id == session_id && e.op.status == OperationStatus::Queued)
            .filter(|e| inner.dependencies_met(&e.op))
            .collect();
        ready.sort_by_key(|e| (Reverse(e.op.priority), e.seq));
        ready.into_iter().map(|e| e.op.clone()).collect()
    }

    pub fn get_operation(&self, id: &str) -> Option<QueuedOperation> {
        self.inner.lock().operations.get(id).map(|e| e.op.clone())
    }

    /// Every operation of a session in insertion order, whatever its status.
    pub fn get_session_operations(&self, session_id: &str) -> Vec<QueuedOperation> {
        let inner = self.inner.lock();
        let mut entries: Vec<&Entry> = inner
            .operations
            .values()
            .filter(|e| e.op.session_id == session_id)
            .collect();
        entries.sort_by_key(|e| e.seq);
        entries.into_iter().map(|e| e.op.clone()).collect()
    }

    /// Batch members in the order they were enqueued.
    pub fn get_batch_operations(&self, batch_id: &str) -> Result<Vec<QueuedOperation>, OperationError> {
        let inner = self.inner.lock();
        let batch = inner
            .batches
            .get(batch_id)
            .ok_or_else(|| OperationError::UnknownBatch(batch_id.to_string()))?;
        Ok(batch
            .operation_ids
            .iter()
            .filter_map(|id| inner.operations.get(id).map(|e| e.op.clone()))
            .collect())
    }

    pub fn get_batch_progress(&self, batch_id: &str) -> Result<BatchProgress, OperationError> {
        let inner = self.inner.lock();
        let batch = inner
            .batches
            .get(batch_id)
            .ok_or_else(|| OperationError::UnknownBatch(batch_id.to_string()))?;
        let mut progress = BatchProgress::default();
        for id in &batch.operation_ids {
            if let Some(entry) = inner.operations.get(id) {
                progress.count(entry.op.status);
            }
        }
        Ok(progress)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().operations.is_empty()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Transitions
    // ─────────────────────────────────────────────────────────────────────

    pub fn mark_operation_in_progress(&self, id: &str) -> Result<(), OperationError> {
        let mut inner = self.inner.lock();
        let op = inner.op_mut(id)?;
        if op.status != OperationStatus::Queued {
            return Err(OperationError::InvalidTransition {
                id: id.to_string(),
                from: op.status,
                to: OperationStatus::InProgress,
            });
        }
        op.status = OperationStatus::InProgress;
        op.started_at = Some(Utc::now());
        debug!(op_id = id, "operation started");
        Ok(())
    }

    /// Record a result. The operation becomes the newest undo entry and
    /// any redo history is discarded.
    pub fn mark_operation_complete(&self, id: &str, result: Value) -> Result<(), OperationError> {
        let mut inner = self.inner.lock();
        let op = inner.op_mut(id)?;
        ensure_open(op, OperationStatus::Completed)?;
        op.status = OperationStatus::Completed;
        op.result = Some(result);
        op.completed_at = Some(Utc::now());
        inner.undo.push(id.to_string());
        inner.redo.clear();
        debug!(op_id = id, "operation completed");
        Ok(())
    }

    /// Fail an operation and cancel every transitive dependent that has not
    /// finished. Returns the cancelled ids.
    pub fn mark_operation_failed(&self, id: &str, error: &str) -> Result<Vec<String>, OperationError> {
        let mut inner = self.inner.lock();
        let op = inner.op_mut(id)?;
        ensure_open(op, OperationStatus::Failed)?;
        op.status = OperationStatus::Failed;
        op.error = Some(error.to_string());
        op.completed_at = Some(Utc::now());

        let cancelled = inner.cascade(id, &format!("dependency {id} failed: {error}"));
        warn!(op_id = id, error, cascaded = cancelled.len(), "operation failed");
        Ok(cancelled)
    }

    /// Cancel an unfinished operation and, like a failure, its dependents.
    pub fn cancel_operation(&self, id: &str, reason: &str) -> Result<Vec<String>, OperationError> {
        let mut inner = self.inner.lock();
        let op = inner.op_mut(id)?;
        ensure_open(op, OperationStatus::Cancelled)?;
        op.status = OperationStatus::Cancelled;
        op.error = Some(reason.to_string());
        op.completed_at = Some(Utc::now());

        let cancelled = inner.cascade(id, &format!("dependency {id} cancelled: {reason}"));
        info!(op_id = id, reason, cascaded = cancelled.len(), "operation cancelled");
        Ok(cancelled)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Undo / redo
    // ─────────────────────────────────────────────────────────────────────

    /// Pop the newest completed operation and hand back an `undo_` copy of it
    /// for the caller to run. The copy replays the original input; it is not
    /// a computed inverse.
    pub fn undo_last_operation(&self) -> Result<QueuedOperation, OperationError> {
        let mut inner = self.inner.lock();
        let id = inner.undo.last().cloned().ok_or(OperationError::NothingToUndo)?;
        let pseudo = inner.replay(&id, "undo_")?;
        inner.undo.pop();
        inner.redo.push(id);
        Ok(pseudo)
    }

    pub fn redo_last_operation(&self) -> Result<QueuedOperation, OperationError> {
        let mut inner = self.inner.lock();
        let id = inner.redo.last().cloned().ok_or(OperationError::NothingToRedo)?;
        let pseudo = inner.replay(&id, "redo_")?;
        inner.redo.pop();
        inner.undo.push(id);
        Ok(pseudo)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Cleanup
    // ─────────────────────────────────────────────────────────────────────

    /// Drop terminal operations that finished more than `max_age` ago,
    /// along with their adjacency, batch and history entries. An operation
    /// that an unfinished dependent still waits on is kept.
    pub fn cleanup_old_operations(&self, max_age: Duration) -> usize {
        let Ok(age) = chrono::Duration::from_std(max_age) else {
            return 0;
        };
        let Some(cutoff) = Utc::now().checked_sub_signed(age) else {
            return 0;
        };

        let mut inner = self.inner.lock();
        let expired: HashSet<String> = inner
            .operations
            .values()
            .filter(|e| e.op.status.is_terminal())
            .filter(|e| e.op.completed_at.is_some_and(|at| at < cutoff))
            .filter(|e| !inner.has_open_dependents(&e.op.id))
            .map(|e| e.op.id.clone())
            .collect();
        if expired.is_empty() {
            return 0;
        }

        inner.operations.retain(|id, _| !expired.contains(id));
        inner.dependents.retain(|id, _| !expired.contains(id));
        for dependents in inner.dependents.values_mut() {
            dependents.retain(|id| !expired.contains(id));
        }
        inner.batches.retain(|_, batch| {
            batch.operation_ids.retain(|id| !expired.contains(id));
            !batch.operation_ids.is_empty()
        });
        inner.undo.retain(|id| !expired.contains(id));
        inner.redo.retain(|id| !expired.contains(id));

        info!(removed = expired.len(), remaining = inner.operations.len(), "old operations cleaned up");
        expired.len()
    }

    /// Run [`OperationRegistry::cleanup_old_operations`] every `interval`
    /// until `shutdown`.
    pub fn spawn_cleanup(
        self: &Arc<Self>,
        interval: Duration,
        max_age: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        registry.cleanup_old_operations(max_age);
                    }
                }
            }
            debug!("operation cleanup stopped");
        })
    }
}

fn ensure_open(op: &QueuedOperation, to: OperationStatus) -> Result<(), OperationError> {
    if op.status.is_terminal() {
        return Err(OperationError::InvalidTransition {
            id: op.id.clone(),
            from: op.status,
            to,
        });
    }
    Ok(())
}

impl Inner {
    fn op_mut(&mut self, id: &str) -> Result<&mut QueuedOperation, OperationError> {
        self.operations
            .get_mut(id)
            .map(|e| &mut e.op)
            .ok_or_else(|| OperationError::NotFound(id.to_string()))
    }

    fn dependencies_met(&self, op: &QueuedOperation) -> bool {
        op.depends_on.iter().all(|dep| {
            self.operations
                .get(dep)
                .is_some_and(|e| e.op.status == OperationStatus::Completed)
        })
    }

    fn has_open_dependents(&self, id: &str) -> bool {
        self.dependents.get(id).is_some_and(|ids| {
            ids.iter().any(|dep| {
                self.operations
                    .get(dep)
                    .is_some_and(|e| !e.op.status.is_terminal())
            })
        })
    }

    /// Store a new operation whose id is already unique.
    fn insert(&mut self, mut op: QueuedOperation) -> String {
        let now = Utc::now();
        op.status = OperationStatus::Queued;
        op.result = None;
        op.error = None;
        op.created_at = Some(now);
        op.started_at = None;
        op.completed_at = None;

        for dep in &op.depends_on {
            self.dependents.entry(dep.clone()).or_default().push(op.id.clone());
        }

        let dead_dependency = op.depends_on.iter().find_map(|dep| {
            self.operations
                .get(dep)
                .filter(|e| matches!(e.op.status, OperationStatus::Failed | OperationStatus::Cancelled))
                .map(|e| (dep.clone(), e.op.status))
        });
        if let Some((dep, status)) = dead_dependency {
            op.status = OperationStatus::Cancelled;
            op.error = Some(format!("dependency {dep} {status}"));
            op.completed_at = Some(now);
        }

        if let Some(batch_id) = &op.batch_id {
            self.batches
                .entry(batch_id.clone())
                .or_insert_with(|| Batch {
                    id: batch_id.clone(),
                    session_id: op.session_id.clone(),
                    operation_ids: Vec::new(),
                    created_at: now,
                })
                .operation_ids
                .push(op.id.clone());
        }

        let id = op.id.clone();
        debug!(op_id = %id, session_id = %op.session_id, kind = %op.kind, status = %op.status, "operation queued");
        let seq = self.next_seq;
        self.next_seq += 1;
        self.operations.insert(id.clone(), Entry { op, seq });
        id
    }

    /// Cancel every unfinished transitive dependent of `root`.
    fn cascade(&mut self, root: &str, reason: &str) -> Vec<String> {
        let now = Utc::now();
        let mut cancelled = Vec::new();
        let mut worklist: Vec<String> = self.dependents.get(root).cloned().unwrap_or_default();

        while let Some(id) = worklist.pop() {
            let Some(entry) = self.operations.get_mut(&id) else {
                continue;
            };
            if entry.op.status.is_terminal() {
                continue;
            }
            entry.op.status = OperationStatus::Cancelled;
            entry.op.error = Some(reason.to_string());
            entry.op.completed_at = Some(now);
            if let Some(next) = self.dependents.get(&id) {
                worklist.extend(next.iter().cloned());
            }
            cancelled.push(id);
        }
        cancelled
    }

    fn replay(&self, id: &str, prefix: &str) -> Result<QueuedOperation, OperationError> {
        let original = self
            .operations
            .get(id)
            .map(|e| &e.op)
            .ok_or_else(|| OperationError::NotFound(id.to_string()))?;
        let mut pseudo = QueuedOperation::new(
            original.session_id.clone(),
            format!("{prefix}{}", original.kind),
            original.input.clone(),
        )
        .with_id(uuid::Uuid::new_v4().to_string())
        .with_priority(original.priority);
        pseudo.created_at = Some(Utc::now());
        Ok(pseudo)
    }
}
