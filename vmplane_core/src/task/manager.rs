use super::{Reporter, TaskFilter, TaskInfo, TaskStatus};

use regex::Regex;
use std::any::Any;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::AbortHandle;

// Error Handling
use log::{debug, error, info, trace};
use vmplane_error::{Reason, VmplaneError};

/// Shared state behind every manager and reporter handle.
#[derive(Debug, Default)]
pub(super) struct Registry {
    next_id: AtomicU64,
    tasks: Mutex<BTreeMap<u64, TaskInfo>>,
    handles: Mutex<Vec<AbortHandle>>,
}

impl Registry {
    fn tasks(&self) -> MutexGuard<'_, BTreeMap<u64, TaskInfo>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }
    pub(super) fn report(&self, id: u64, message: &str, finished: bool) {
        let mut tasks = self.tasks();
        let Some(task) = tasks.get_mut(&id) else {
            return;
        };
        if task.status.is_terminal() {
            trace!("ignored report on terminated task {id}");
            return;
        }
        task.message = message.to_owned();
        if finished {
            task.status = TaskStatus::Finished;
            debug!("[end] task {id} finished: {message}");
        }
    }
    fn fail(&self, id: u64, message: &str) {
        let mut tasks = self.tasks();
        let Some(task) = tasks.get_mut(&id) else {
            return;
        };
        if task.status.is_terminal() {
            return;
        }
        task.status = TaskStatus::Failed;
        task.message = if message.is_empty() {
            "task failed".to_owned()
        } else {
            message.to_owned()
        };
        error!("[end] task {id} on {} failed: {}", task.target_uri, task.message);
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        format!("task panicked: {msg}")
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        format!("task panicked: {msg}")
    } else {
        "task panicked".to_owned()
    }
}

/**
Runs work units concurrently and tracks their status.
One manager lives as long as the process, clones share the same registry.
*/
#[derive(Debug, Clone, Default)]
pub struct TaskManager {
    registry: Arc<Registry>,
}

impl TaskManager {
    pub fn new() -> Self {
        Self::default()
    }
    /*
     * Register a running task and schedule its work.
     * Returns immediately with the task snapshot.
     *
     * The work runs inside its own tokio task, awaited by a supervisor:
     * an error or a panic marks the task failed without touching others.
     */
    pub fn submit<F, Fut>(&self, target_uri: &str, work: F) -> TaskInfo
    where
        F: FnOnce(Reporter) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), VmplaneError>> + Send + 'static,
    {
        let id = self.registry.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let info = TaskInfo {
            id,
            status: TaskStatus::Running,
            message: String::new(),
            target_uri: target_uri.to_owned(),
        };
        self.registry.tasks().insert(id, info.clone());
        info!("[start] task {id} on {target_uri}");

        let reporter = Reporter::new(id, self.registry.clone());
        let inner = tokio::spawn(async move { work(reporter).await });
        let abort = inner.abort_handle();

        let registry = self.registry.clone();
        tokio::spawn(async move {
            match inner.await {
                Ok(Ok(())) => trace!("task {id} returned"),
                Ok(Err(e)) => registry.fail(id, &e.to_string()),
                Err(e) if e.is_panic() => registry.fail(id, &panic_message(e.into_panic())),
                Err(_) => registry.fail(id, "task was aborted"),
            }
        });

        let mut handles = self.registry.handles.lock().unwrap_or_else(PoisonError::into_inner);
        handles.retain(|e| !e.is_finished());
        handles.push(abort);
        info
    }
    pub fn lookup(&self, id: u64) -> Result<TaskInfo, VmplaneError> {
        match self.registry.tasks().get(&id) {
            Some(task) => Ok(task.clone()),
            None => Err(VmplaneError::not_found(
                Reason::TaskNotFound,
                &format!("Couldn't find task {id}"),
            )),
        }
    }
    /// Tasks in submission order.
    pub fn list(&self, filter: &TaskFilter) -> Result<Vec<TaskInfo>, VmplaneError> {
        let pattern = match &filter.target_uri {
            Some(pattern) => Some(Regex::new(pattern).map_err(|e| {
                VmplaneError::invalid(
                    Reason::FilterInvalid,
                    &format!("bad target_uri pattern {:#?}: {}", pattern, e),
                )
            })?),
            None => None,
        };
        let res = self
            .registry
            .tasks()
            .values()
            .filter(|e| filter.status.map_or(true, |status| e.status == status))
            .filter(|e| pattern.as_ref().map_or(true, |re| re.is_match(&e.target_uri)))
            .cloned()
            .collect();
        Ok(res)
    }
    /*
     * Abort outstanding work at process teardown.
     * Aborted tasks end up failed.
     */
    pub fn shutdown(&self) {
        let handles: Vec<AbortHandle> = self
            .registry
            .handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        info!("[end] aborting {} outstanding tasks", handles.len());
        for handle in handles {
            handle.abort();
        }
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use vmplane_error::LibError;

    // Error Handling
    use miette::Result;

    /// Poll a task until it leaves the running status.
    pub async fn wait_task(tasks: &TaskManager, id: u64) -> Result<TaskInfo, VmplaneError> {
        for _ in 0..500 {
            let task = tasks.lookup(id)?;
            if task.status.is_terminal() {
                return Ok(task);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tasks.lookup(id)
    }

    #[tokio::test]
    async fn running_right_after_submit() -> Result<()> {
        let tasks = TaskManager::new();
        let info = tasks.submit("/tasks/1", |reporter| async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            reporter.report("done", true);
            Ok(())
        });
        assert_eq!(info.status, TaskStatus::Running);
        assert_eq!(info.message, "");
        assert_eq!(tasks.lookup(info.id)?.status, TaskStatus::Running);

        let task = wait_task(&tasks, info.id).await?;
        assert_eq!(task.status, TaskStatus::Finished);
        assert_eq!(task.message, "done");
        Ok(())
    }

    #[tokio::test]
    async fn ids_increase() -> Result<()> {
        let tasks = TaskManager::new();
        let a = tasks.submit("/a", |_| async { Ok(()) });
        let b = tasks.submit("/b", |_| async { Ok(()) });
        assert_eq!(a.id, 1);
        assert_eq!(b.id, 2);
        Ok(())
    }

    fn explode() -> Result<(), VmplaneError> {
        panic!("oops")
    }

    #[tokio::test]
    async fn errors_and_panics_fail_the_task() -> Result<()> {
        let tasks = TaskManager::new();
        let erroring = tasks.submit("/tasks/2", |reporter| async move {
            reporter.report("half way", false);
            Err(LibError::builder().msg("disk on fire").help("").build().into())
        });
        let panicking = tasks.submit("/tasks/3", |_| async move { explode() });
        let sane = tasks.submit("/tasks/4", |reporter| async move {
            reporter.report("ok", true);
            Ok(())
        });

        let task = wait_task(&tasks, erroring.id).await?;
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.message, "disk on fire");

        let task = wait_task(&tasks, panicking.id).await?;
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.message.contains("oops"));

        let task = wait_task(&tasks, sane.id).await?;
        assert_eq!(task.status, TaskStatus::Finished);
        Ok(())
    }

    #[tokio::test]
    async fn reports_after_terminal_are_ignored() -> Result<()> {
        let tasks = TaskManager::new();
        let info = tasks.submit("/tasks/5", |reporter| async move {
            reporter.report("first", true);
            reporter.report("second", false);
            reporter.report("third", true);
            Err(LibError::builder().msg("late").help("").build().into())
        });
        // Let the supervisor observe the late error.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let task = wait_task(&tasks, info.id).await?;
        assert_eq!(task.status, TaskStatus::Finished);
        assert_eq!(task.message, "first");
        Ok(())
    }

    #[tokio::test]
    async fn progress_without_terminal_stays_running() -> Result<()> {
        let tasks = TaskManager::new();
        let info = tasks.submit("/tasks/6", |reporter| async move {
            reporter.report("in progress", false);
            Ok(())
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        let task = tasks.lookup(info.id)?;
        assert_eq!(task.status, TaskStatus::Running);
        assert_eq!(task.message, "in progress");
        Ok(())
    }

    #[tokio::test]
    async fn filter_by_status_and_uri() -> Result<()> {
        let tasks = TaskManager::new();
        for uri in ["/tasks/1", "/tasks/2", "/vms/a/clone"] {
            tasks.submit(uri, |_| std::future::pending());
        }
        tasks.submit("/tasks/3", |reporter| async move {
            reporter.report("done", true);
            Ok(())
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let filter = TaskFilter::builder()
            .status(TaskStatus::Running)
            .target_uri("^/tasks/*")
            .build();
        let res: Vec<String> = tasks
            .list(&filter)?
            .into_iter()
            .map(|e| e.target_uri)
            .collect();
        assert_eq!(res, vec!["/tasks/1".to_owned(), "/tasks/2".to_owned()]);

        let all = tasks.list(&TaskFilter::default())?;
        assert_eq!(all.len(), 4);
        assert!(all.windows(2).all(|e| e[0].id < e[1].id));

        let bad = TaskFilter::builder().target_uri("(").build();
        let err = tasks.list(&bad).unwrap_err();
        assert_eq!(err.reason(), Some(Reason::FilterInvalid));
        Ok(())
    }

    #[tokio::test]
    async fn unknown_task() -> Result<()> {
        let tasks = TaskManager::new();
        let err = tasks.lookup(42).unwrap_err();
        assert_eq!(err.status(), 404);
        Ok(())
    }

    #[tokio::test]
    async fn shutdown_aborts_outstanding_work() -> Result<()> {
        let tasks = TaskManager::new();
        let info = tasks.submit("/tasks/7", |_| std::future::pending());
        tasks.shutdown();
        let task = wait_task(&tasks, info.id).await?;
        assert_eq!(task.status, TaskStatus::Failed);
        Ok(())
    }
}
