//! Worker pool and cancellation
//!
//! Tasks are independent units of work drawn from a queue; within one task
//! execution is single-threaded and sequential. The per-task advisory lock
//! in the branch store is the actual mutual exclusion; a worker that loses
//! the race re-queues the task after a short delay rather than blocking.

use crate::engine::ExecutionEngine;
use crate::error::EngineError;
use planvm_store::StoreError;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Cooperative cancellation signal carried by each task.
///
/// The engine polls it before dispatching each instruction and between
/// suspension points; in-flight calls run to completion and their result is
/// discarded.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Pool of workers draining a queue of task ids.
pub struct WorkerPool {
    sender: mpsc::UnboundedSender<Uuid>,
    tokens: Arc<Mutex<HashMap<Uuid, CancellationToken>>>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(engine: Arc<ExecutionEngine>, workers: usize) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel::<Uuid>();
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        let tokens: Arc<Mutex<HashMap<Uuid, CancellationToken>>> =
            Arc::new(Mutex::new(HashMap::new()));

        let mut handles = Vec::with_capacity(workers);
        for worker_index in 0..workers.max(1) {
            let engine = engine.clone();
            let receiver = receiver.clone();
            let tokens = tokens.clone();
            // Workers hold only a weak sender so dropping the pool's
            // sender closes the queue and lets them drain.
            let sender = sender.downgrade();
            handles.push(tokio::spawn(async move {
                loop {
                    let task_id = {
                        let mut rx = receiver.lock().await;
                        match rx.recv().await {
                            Some(task_id) => task_id,
                            None => break,
                        }
                    };
                    let token = tokens
                        .lock()
                        .expect("token registry poisoned")
                        .entry(task_id)
                        .or_default()
                        .clone();

                    match engine.run_task(task_id, &token).await {
                        Ok(outcome) => {
                            info!(
                                worker = worker_index,
                                task_id = %task_id,
                                goal_completed = outcome.goal_completed,
                                "task finished"
                            );
                        }
                        // Another worker holds the task; fail fast and
                        // re-queue.
                        Err(EngineError::Store(StoreError::Locked { .. })) => {
                            warn!(worker = worker_index, task_id = %task_id, "task locked, re-queueing");
                            tokio::time::sleep(Duration::from_millis(250)).await;
                            if let Some(sender) = sender.upgrade() {
                                let _ = sender.send(task_id);
                            }
                            continue;
                        }
                        Err(EngineError::Cancelled(_)) => {
                            info!(worker = worker_index, task_id = %task_id, "task cancelled");
                        }
                        Err(e) => {
                            error!(worker = worker_index, task_id = %task_id, error = %e, "task failed");
                        }
                    }
                    tokens.lock().expect("token registry poisoned").remove(&task_id);
                }
            }));
        }

        Self { sender, tokens, handles }
    }

    /// Queue a task for execution.
    pub fn submit(&self, task_id: Uuid) {
        let _ = self.sender.send(task_id);
    }

    /// Fire the cancellation signal for a queued or running task.
    pub fn cancel(&self, task_id: Uuid) {
        self.tokens
            .lock()
            .expect("token registry poisoned")
            .entry(task_id)
            .or_default()
            .cancel();
    }

    /// Stop accepting work and wait for the workers to drain.
    pub async fn shutdown(self) {
        drop(self.sender);
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}
