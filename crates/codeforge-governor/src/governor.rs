//! The task governor: FIFO queue plus a bounded-concurrency dispatcher.

use async_trait::async_trait;
use codeforge_core::{CodeforgeResult, Stage};
use codeforge_store::TaskStore;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// One queued unit of work.
///
/// `request_id` is correlation metadata only; callers that have none pass
/// `None` and nothing downstream keys on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    /// Task to run.
    pub task_id: String,
    /// The task description.
    pub description: String,
    /// Template to seed the container from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_id: Option<String>,
    /// Correlation id from the submitting request, when one existed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// Stage to resume from, for re-enqueued tasks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_from_stage: Option<Stage>,
}

/// Executes one dequeued item. The governor owns retrying nothing: a
/// runner's error is logged and the slot is released.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    /// Run the item to its terminal or paused state.
    async fn run(&self, item: QueueItem) -> CodeforgeResult<()>;
}

/// Queue + bounded-concurrency dispatcher.
///
/// The queue itself is unbounded, matching the upstream submission surface;
/// deployments that need backpressure bound it at the transport layer.
pub struct TaskGovernor {
    sender: mpsc::UnboundedSender<QueueItem>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<QueueItem>>>,
    semaphore: Arc<Semaphore>,
    running: Arc<Mutex<HashSet<String>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl TaskGovernor {
    /// Governor allowing up to `max_concurrent` runners (minimum 1).
    pub fn new(max_concurrent: usize) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: Mutex::new(Some(receiver)),
            semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
            running: Arc::new(Mutex::new(HashSet::new())),
            dispatcher: Mutex::new(None),
        }
    }

    /// Enqueue one item.
    pub fn enqueue(&self, item: QueueItem) -> CodeforgeResult<()> {
        self.sender.send(item).map_err(|err| {
            codeforge_core::CodeforgeError::Orchestrator(format!("queue closed: {err}"))
        })
    }

    /// Task ids currently holding a slot.
    pub fn running_tasks(&self) -> Vec<String> {
        self.running.lock().iter().cloned().collect()
    }

    /// Crash recovery: flip `processing` rows back to `queued` and enqueue
    /// everything queued, oldest first. Returns the enqueued count.
    pub async fn bootstrap(&self, store: &dyn TaskStore) -> CodeforgeResult<usize> {
        let reset = store.reset_processing_to_queued().await?;
        if reset > 0 {
            info!(reset, "reset processing tasks back to queued");
        }
        let queued = store.list_queued_tasks().await?;
        for row in &queued {
            self.enqueue(QueueItem {
                task_id: row.id.clone(),
                description: row.description.clone(),
                template_id: row.template_id.clone(),
                request_id: None,
                resume_from_stage: row.resume_from_stage,
            })?;
        }
        Ok(queued.len())
    }

    /// Start the dispatcher loop. A second call is a no-op.
    pub fn start(&self, runner: Arc<dyn TaskRunner>) {
        let mut dispatcher = self.dispatcher.lock();
        if dispatcher.is_some() {
            return;
        }
        let Some(mut receiver) = self.receiver.lock().take() else {
            return;
        };
        let semaphore = self.semaphore.clone();
        let running = self.running.clone();

        let handle = tokio::spawn(async move {
            while let Some(item) = receiver.recv().await {
                let Ok(permit) = semaphore.clone().acquire_owned().await else {
                    break;
                };
                let task_id = item.task_id.clone();
                running.lock().insert(task_id.clone());
                info!(task_id = %task_id, "dispatching task");

                let runner = runner.clone();
                let running = running.clone();
                tokio::spawn(async move {
                    if let Err(err) = runner.run(item).await {
                        warn!(task_id = %task_id, error = %err, "task runner failed");
                    }
                    running.lock().remove(&task_id);
                    drop(permit);
                });
            }
        });
        *dispatcher = Some(handle);
    }

    /// Stop the dispatcher. In-flight runners finish on their own; queued
    /// items stay in the store and come back via [`Self::bootstrap`].
    pub fn stop(&self) {
        if let Some(handle) = self.dispatcher.lock().take() {
            handle.abort();
        }
    }
}

impl Drop for TaskGovernor {
    fn drop(&mut self) {
        if let Some(handle) = self.dispatcher.lock().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct CountingRunner {
        current: AtomicUsize,
        peak: AtomicUsize,
        completed: AtomicUsize,
    }

    #[async_trait]
    impl TaskRunner for CountingRunner {
        async fn run(&self, _item: QueueItem) -> CodeforgeResult<()> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(30)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            self.completed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn at_most_two_runners_active_with_five_tasks() {
        let governor = TaskGovernor::new(2);
        let runner = Arc::new(CountingRunner {
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
        });
        governor.start(runner.clone());

        for index in 0..5 {
            governor
                .enqueue(QueueItem {
                    task_id: format!("t{index}"),
                    description: "work".into(),
                    template_id: None,
                    request_id: None,
                    resume_from_stage: None,
                })
                .unwrap();
        }

        for _ in 0..100 {
            if runner.completed.load(Ordering::SeqCst) == 5 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(runner.completed.load(Ordering::SeqCst), 5);
        assert!(runner.peak.load(Ordering::SeqCst) <= 2);
        assert!(governor.running_tasks().is_empty());
        governor.stop();
    }

    #[tokio::test]
    async fn single_slot_serializes_execution() {
        let governor = TaskGovernor::new(1);
        let runner = Arc::new(CountingRunner {
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
        });
        governor.start(runner.clone());
        for index in 0..3 {
            governor
                .enqueue(QueueItem {
                    task_id: format!("t{index}"),
                    description: "work".into(),
                    template_id: None,
                    request_id: None,
                    resume_from_stage: None,
                })
                .unwrap();
        }
        for _ in 0..100 {
            if runner.completed.load(Ordering::SeqCst) == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(runner.peak.load(Ordering::SeqCst), 1);
        governor.stop();
    }

    #[tokio::test]
    async fn bootstrap_requeues_processing_and_queued_rows() {
        use codeforge_core::{TaskRow, TaskStatus};
        use codeforge_store::{MemoryStore, TaskStore as _};

        let store = MemoryStore::new();
        let mut processing = TaskRow::new("t1", "recover me");
        processing.status = TaskStatus::Processing;
        store.create_task(processing).await.unwrap();
        store.create_task(TaskRow::new("t2", "run me")).await.unwrap();

        let governor = TaskGovernor::new(2);
        let queued = governor.bootstrap(&store).await.unwrap();
        assert_eq!(queued, 2);
        assert_eq!(
            store.get_task("t1").await.unwrap().unwrap().status,
            TaskStatus::Queued
        );
    }
}
