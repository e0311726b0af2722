//! Background work tracked for the desktop host
//!
//! Tasks are spawned on the tokio runtime. The runner keeps every task that
//! has been started and not yet finished, so the host can show a progress
//! indicator while, for example, the server is starting.

use crate::error::TaskError;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Display;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::sync::{oneshot, watch};
use tokio::task::AbortHandle;

pub type TaskId = u64;

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Ready,
    Scheduled,
    Running,
    Cancelled,
    Succeeded,
    Failed,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Cancelled | TaskState::Succeeded | TaskState::Failed
        )
    }
}

type TaskFuture = Pin<Box<dyn Future<Output = Result<(), String>> + Send>>;

/// Unit of work that has not been handed to a [`TaskRunner`] yet
pub struct BackgroundTask {
    id: TaskId,
    name: String,
    state: Arc<watch::Sender<TaskState>>,
    work: Option<TaskFuture>,
}

impl std::fmt::Debug for BackgroundTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackgroundTask")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

impl BackgroundTask {
    pub fn new<F, E>(name: impl Into<String>, work: F) -> Self
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: Display,
    {
        let (state, _) = watch::channel(TaskState::Ready);
        Self {
            id: NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            state: Arc::new(state),
            work: Some(Box::pin(async move { work.await.map_err(|e| e.to_string()) })),
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> TaskState {
        *self.state.borrow()
    }
}

/// What start actions and `current_tasks` see of a task
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskInfo {
    pub id: TaskId,
    pub name: String,
    pub state: TaskState,
}

/// Reference to a started task
#[derive(Debug, Clone)]
pub struct TaskHandle {
    id: TaskId,
    name: String,
    state: watch::Receiver<TaskState>,
    abort: AbortHandle,
}

impl TaskHandle {
    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> TaskState {
        *self.state.borrow()
    }

    /// Abort the task. Has no effect once it has finished.
    pub fn cancel(&self) {
        self.abort.abort();
    }

    /// Wait for the task to finish and return how it ended
    pub async fn wait(&self) -> TaskState {
        let mut state = self.state.clone();
        if let Ok(finished) = state.wait_for(|s| s.is_terminal()).await {
            return *finished;
        }
        let current = *state.borrow();
        current
    }

    fn info(&self) -> TaskInfo {
        TaskInfo {
            id: self.id,
            name: self.name.clone(),
            state: self.state(),
        }
    }
}

pub type StartAction = Arc<dyn Fn(&TaskInfo) + Send + Sync>;

struct RunnerInner {
    tasks: Mutex<BTreeMap<TaskId, TaskHandle>>,
    start_actions: RwLock<Vec<StartAction>>,
    count: watch::Sender<usize>,
}

#[derive(Clone)]
pub struct TaskRunner {
    inner: Arc<RunnerInner>,
}

impl Default for TaskRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskRunner {
    pub fn new() -> Self {
        let (count, _) = watch::channel(0);
        Self {
            inner: Arc::new(RunnerInner {
                tasks: Mutex::new(BTreeMap::new()),
                start_actions: RwLock::new(Vec::new()),
                count,
            }),
        }
    }

    /// Run `action` every time a task is started
    pub fn add_start_action<F>(&self, action: F)
    where
        F: Fn(&TaskInfo) + Send + Sync + 'static,
    {
        self.inner
            .start_actions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(action));
    }

    /// Validate and spawn `task`. A rejected task leaves the runner
    /// untouched; a task can only ever be started once.
    pub fn start(&self, task: &mut BackgroundTask) -> Result<TaskHandle, TaskError> {
        if task.name.trim().is_empty() {
            return Err(TaskError::EmptyName);
        }
        let work = match (task.state(), task.work.take()) {
            (TaskState::Ready, Some(work)) => work,
            (state, work) => {
                task.work = work;
                return Err(TaskError::NotReady {
                    name: task.name.clone(),
                    state,
                });
            }
        };

        task.state.send_replace(TaskState::Scheduled);

        // The work is held back until the task is tracked and every start
        // action has seen it
        let (release, gate) = oneshot::channel::<()>();
        let running = task.state.clone();
        let job = tokio::spawn(async move {
            if gate.await.is_err() {
                return Err("start actions did not complete".to_string());
            }
            running.send_replace(TaskState::Running);
            work.await
        });

        let handle = TaskHandle {
            id: task.id,
            name: task.name.clone(),
            state: task.state.subscribe(),
            abort: job.abort_handle(),
        };
        self.track(handle.clone());

        let runner = self.clone();
        let state = task.state.clone();
        let (id, name) = (task.id, task.name.clone());
        tokio::spawn(async move {
            let finished = match job.await {
                Ok(Ok(())) => TaskState::Succeeded,
                Ok(Err(e)) => {
                    tracing::error!("Task {} failed: {}", name, e);
                    TaskState::Failed
                }
                Err(e) if e.is_cancelled() => {
                    tracing::info!("Task {} cancelled", name);
                    TaskState::Cancelled
                }
                Err(e) => {
                    tracing::error!("Task {} panicked: {}", name, e);
                    TaskState::Failed
                }
            };
            runner.untrack(id);
            state.send_replace(finished);
        });

        let info = handle.info();
        let actions: Vec<StartAction> = self
            .inner
            .start_actions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for action in actions {
            action(&info);
        }
        let _ = release.send(());

        tracing::debug!("Started task {} ({})", task.name, task.id);
        Ok(handle)
    }

    fn track(&self, handle: TaskHandle) {
        let mut tasks = self
            .inner
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        tasks.insert(handle.id, handle);
        self.inner.count.send_replace(tasks.len());
    }

    fn untrack(&self, id: TaskId) {
        let mut tasks = self
            .inner
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if tasks.remove(&id).is_some() {
            self.inner.count.send_replace(tasks.len());
        }
    }

    /// Tasks started and not yet finished, oldest first
    pub fn current_tasks(&self) -> Vec<TaskInfo> {
        self.inner
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(TaskHandle::info)
            .collect()
    }

    pub fn current_count(&self) -> usize {
        *self.inner.count.borrow()
    }

    /// Number of unfinished tasks, e.g. to drive a busy indicator
    pub fn watch_count(&self) -> watch::Receiver<usize> {
        self.inner.count.subscribe()
    }
}
