//! Supervised task lifecycle.
//!
//! A [`Supervisor`] owns a cancellation scope and a pending-count for every
//! task it starts. Every task body is wrapped so a panic is caught and turned
//! into a [`TaskError`] instead of unwinding into the runtime or sibling tasks.
//!
//! ```text
//!  Supervisor (root)
//!   ├── token ──────────────► cancelled by close_and_wait()
//!   ├── tracker ────────────► pending-count, drained by wait()
//!   └── child("conn-17")
//!         ├── token = parent.child_token()
//!         └── tracker (own pending-count)
//! ```
//!
//! Shutdown is cancel-then-drain: [`Supervisor::close_and_wait`] broadcasts
//! cancellation and then blocks until the pending-count reaches zero. A task
//! that ignores its token and never returns blocks shutdown forever.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use crate::error::TaskError;

/// Final state of a supervised task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// The task body returned normally.
    Completed,
    /// The task body panicked.
    Failed(TaskError),
    /// The task body returned after its scope was cancelled.
    Cancelled,
}

/// Optional callbacks attached to a spawned task.
///
/// `on_failure` receives the converted panic. `finally` runs exactly once per
/// task, whatever the outcome, including when the task future is dropped.
#[derive(Default)]
pub struct TaskHooks {
    on_failure: Option<Box<dyn FnOnce(&TaskError) + Send>>,
    finally: Option<Box<dyn FnOnce() + Send>>,
}

impl TaskHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_failure(mut self, hook: impl FnOnce(&TaskError) + Send + 'static) -> Self {
        self.on_failure = Some(Box::new(hook));
        self
    }

    pub fn finally(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.finally = Some(Box::new(hook));
        self
    }
}

struct FinallyGuard(Option<Box<dyn FnOnce() + Send>>);

impl Drop for FinallyGuard {
    fn drop(&mut self) {
        if let Some(hook) = self.0.take() {
            hook();
        }
    }
}

/// Handle to a single task started with [`Supervisor::spawn_cancelable`].
#[derive(Debug)]
pub struct CancelHandle {
    token: CancellationToken,
    handle: JoinHandle<TaskOutcome>,
}

impl CancelHandle {
    /// Requests early cancellation of this one task.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Waits for the task and returns its outcome.
    pub async fn join(self) -> TaskOutcome {
        self.handle
            .await
            .unwrap_or(TaskOutcome::Failed(TaskError::Dropped))
    }
}

/// Runs `fut` with panic containment on the calling task.
pub async fn guard<Fut: Future>(fut: Fut) -> Result<Fut::Output, TaskError> {
    AssertUnwindSafe(fut)
        .catch_unwind()
        .await
        .map_err(TaskError::from_panic)
}

/// Tracks and coordinates the shutdown of spawned tasks.
#[derive(Clone, Debug)]
pub struct Supervisor {
    name: Arc<str>,
    token: CancellationToken,
    tracker: TaskTracker,
}

impl Supervisor {
    /// Creates a root supervisor with a fresh cancellation scope.
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self {
            name: name.into(),
            token: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// Creates a sub-supervisor whose scope is cancelled with this one.
    ///
    /// The child keeps its own pending-count; draining the child never waits
    /// on the parent's tasks.
    pub fn child(&self, name: impl Into<Arc<str>>) -> Self {
        Self {
            name: name.into(),
            token: self.token.child_token(),
            tracker: TaskTracker::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The cancellation token handed to every task of this scope.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Number of tasks that have not exited yet.
    pub fn pending(&self) -> usize {
        self.tracker.len()
    }

    /// Starts `task` under this scope.
    pub fn spawn<F, Fut>(&self, task: F) -> JoinHandle<TaskOutcome>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.spawn_with(task, TaskHooks::default())
    }

    /// Starts `task` with failure and finally hooks.
    pub fn spawn_with<F, Fut>(&self, task: F, hooks: TaskHooks) -> JoinHandle<TaskOutcome>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.tracker
            .spawn(supervise(self.name.clone(), task, self.token.clone(), hooks))
    }

    /// Starts `task` under its own child token and returns a handle that can
    /// cancel just that task.
    pub fn spawn_cancelable<F, Fut>(&self, task: F) -> CancelHandle
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = self.token.child_token();
        let handle = self.tracker.spawn(supervise(
            self.name.clone(),
            task,
            token.clone(),
            TaskHooks::default(),
        ));
        CancelHandle { token, handle }
    }

    /// Runs `fut` on the calling task, counted in the pending-count, with the
    /// same panic containment as spawned tasks.
    pub async fn try_run<Fut: Future>(&self, fut: Fut) -> Result<Fut::Output, TaskError> {
        self.tracker.track_future(guard(fut)).await
    }

    /// Counts an externally driven future in the pending-count.
    pub fn track<Fut: Future>(&self, fut: Fut) -> impl Future<Output = Fut::Output> {
        self.tracker.track_future(fut)
    }

    /// Broadcasts cancellation to every task of this scope and its children.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Blocks until every tracked task has exited, without cancelling.
    pub async fn wait(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }

    /// Cancels the scope, then blocks until every tracked task has exited.
    pub async fn close_and_wait(&self) {
        debug!("supervisor '{}' closing with {} pending task(s)", self.name, self.pending());
        self.token.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }
}

/// Builds and runs the task body inside the panic guard, so a closure that
/// panics before returning its future is contained too.
async fn supervise<F, Fut>(
    name: Arc<str>,
    task: F,
    token: CancellationToken,
    hooks: TaskHooks,
) -> TaskOutcome
where
    F: FnOnce(CancellationToken) -> Fut,
    Fut: Future<Output = ()>,
{
    let TaskHooks { on_failure, finally } = hooks;
    let _finally = FinallyGuard(finally);

    let scope = token.clone();
    match guard(async move { task(scope).await }).await {
        Ok(()) if token.is_cancelled() => TaskOutcome::Cancelled,
        Ok(()) => TaskOutcome::Completed,
        Err(err) => {
            warn!("supervisor '{}': {}", name, err);
            if let Some(hook) = on_failure {
                hook(&err);
            }
            TaskOutcome::Failed(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::time::{sleep, timeout};

    #[tokio::test]
    async fn panic_is_contained_and_reported() {
        let sup = Supervisor::new("test");
        let failures = Arc::new(Mutex::new(Vec::new()));
        let finals = Arc::new(AtomicUsize::new(0));

        let hooks = {
            let failures = failures.clone();
            let finals = finals.clone();
            TaskHooks::new()
                .on_failure(move |err| failures.lock().unwrap().push(err.clone()))
                .finally(move || {
                    finals.fetch_add(1, Ordering::SeqCst);
                })
        };
        let outcome = sup
            .spawn_with(|_| async { panic!("handler exploded") }, hooks)
            .await
            .unwrap();

        assert_eq!(
            outcome,
            TaskOutcome::Failed(TaskError::Panicked("handler exploded".into()))
        );
        assert_eq!(failures.lock().unwrap().len(), 1);
        assert_eq!(finals.load(Ordering::SeqCst), 1);

        // A sibling still runs fine after the panic.
        let outcome = sup.spawn(|_| async {}).await.unwrap();
        assert_eq!(outcome, TaskOutcome::Completed);
    }

    #[tokio::test]
    async fn panic_while_building_the_future_is_contained() {
        let sup = Supervisor::new("test");
        let finals = Arc::new(AtomicUsize::new(0));
        let counter = finals.clone();

        let outcome = sup
            .spawn_with(
                |_| -> std::future::Ready<()> { panic!("no future") },
                TaskHooks::new().finally(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .await
            .unwrap();
        assert_eq!(
            outcome,
            TaskOutcome::Failed(TaskError::Panicked("no future".into()))
        );
        assert_eq!(finals.load(Ordering::SeqCst), 1);

        let handle = sup.spawn_cancelable(|_| -> std::future::Ready<()> { panic!("again") });
        assert_eq!(
            handle.join().await,
            TaskOutcome::Failed(TaskError::Panicked("again".into()))
        );
        sup.close_and_wait().await;
        assert_eq!(sup.pending(), 0);
    }

    #[tokio::test]
    async fn finally_runs_once_on_success() {
        let sup = Supervisor::new("test");
        let finals = Arc::new(AtomicUsize::new(0));
        let counter = finals.clone();
        sup.spawn_with(
            |_| async {},
            TaskHooks::new().finally(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .await
        .unwrap();
        assert_eq!(finals.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn close_and_wait_drains_every_task() {
        let sup = Supervisor::new("test");
        let exited = Arc::new(AtomicUsize::new(0));

        for _ in 0..4 {
            let exited = exited.clone();
            sup.spawn(move |token| async move {
                token.cancelled().await;
                sleep(Duration::from_millis(10)).await;
                exited.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(sup.pending(), 4);

        timeout(Duration::from_secs(2), sup.close_and_wait())
            .await
            .expect("shutdown should drain");
        assert_eq!(exited.load(Ordering::SeqCst), 4);
        assert_eq!(sup.pending(), 0);
    }

    #[tokio::test]
    async fn cancel_handle_stops_only_its_task() {
        let sup = Supervisor::new("test");
        let target = sup.spawn_cancelable(|token| async move { token.cancelled().await });
        let bystander = sup.spawn_cancelable(|token| async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = sleep(Duration::from_millis(50)) => {}
            }
        });

        target.cancel();
        assert_eq!(target.join().await, TaskOutcome::Cancelled);
        assert!(!bystander.is_cancelled());
        assert_eq!(bystander.join().await, TaskOutcome::Completed);
        assert!(!sup.is_cancelled());
    }

    #[tokio::test]
    async fn child_scope_follows_parent_cancellation() {
        let parent = Supervisor::new("parent");
        let child = parent.child("child");
        let handle = child.spawn(|token| async move { token.cancelled().await });

        parent.cancel();
        assert_eq!(handle.await.unwrap(), TaskOutcome::Cancelled);
        child.close_and_wait().await;
    }

    #[tokio::test]
    async fn try_run_catches_panics_on_the_calling_task() {
        let sup = Supervisor::new("test");
        assert_eq!(sup.try_run(async { 7 }).await, Ok(7));

        let err = sup
            .try_run(async {
                let values: Vec<u32> = Vec::new();
                values[3]
            })
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::Panicked(_)));
        assert_eq!(sup.pending(), 0);
    }

    #[tokio::test]
    async fn wait_does_not_cancel() {
        let sup = Supervisor::new("test");
        sup.spawn(|_| sleep(Duration::from_millis(20)));
        sup.wait().await;
        assert!(!sup.is_cancelled());
        assert_eq!(sup.pending(), 0);

        // Still usable afterwards.
        let outcome = sup.spawn(|_| async {}).await.unwrap();
        assert_eq!(outcome, TaskOutcome::Completed);
    }
}
