//! # Task Scheduler
//!
//! In-process bounded priority queue with a concurrency limit, per-run timeouts and
//! exponential-backoff retry.
//!
//! Every enqueue, completion and resume pumps dispatch: while fewer than `concurrency`
//! tasks are running and the queue is not empty, the highest-priority task is popped,
//! marked `Running` and handed to its handler on a spawned task.
//!
//! A failed run with attempts left waits `retry_base_delay * backoff_factor^(attempt-1)`
//! as `Retrying` before re-entering the queue; otherwise the task ends `Failed` with the
//! handler's message. Timeouts are bookkeeping only: a run that outlives its timeout is
//! marked `TimedOut` and frees its slot, but the handler future keeps running and its
//! eventual result is discarded.

use super::handler::{handler_fn, TaskContext, TaskHandler};
use super::persistence;
use super::queue::TaskQueue;
use super::types::{SchedulerStats, Task, TaskOptions, TaskStatus};
use crate::config::ConfigHandle;
use crate::errors::{ResilienceError, ResilienceResult};
use crate::events::{EventPublisher, ResilienceEvent};
use crate::logging::log_error;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const TIMEOUT_MESSAGE: &str = "Task timed out";

/// Priority task scheduler
///
/// Cheap to clone; clones share the queue, handlers and background loops.
#[derive(Clone)]
pub struct TaskScheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    config: ConfigHandle,
    events: Arc<EventPublisher>,
    handlers: DashMap<String, Arc<dyn TaskHandler>>,
    state: Mutex<SchedulerState>,
    paused: AtomicBool,
    closed: AtomicBool,
    settled: Notify,
    shutdown_notify: Notify,
    background: Mutex<Vec<JoinHandle<()>>>,
}

#[derive(Default)]
struct SchedulerState {
    tasks: HashMap<Uuid, Task>,
    queue: TaskQueue,
    running: usize,
    high_water: bool,
}

/// A task popped for execution
struct Dispatch {
    ctx: TaskContext,
    handler: Arc<dyn TaskHandler>,
    timeout: Duration,
}

/// How one run ended
enum RunOutcome {
    Succeeded(Value),
    Failed(String),
    TimedOut,
}

impl std::fmt::Debug for TaskScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskScheduler")
            .field("stats", &self.stats())
            .finish()
    }
}

impl TaskScheduler {
    pub fn new(config: ConfigHandle, events: Arc<EventPublisher>) -> Self {
        let scheduler = config.current().scheduler.clone();
        info!(
            concurrency = scheduler.concurrency,
            max_queue_length = scheduler.max_queue_length,
            max_retries = scheduler.max_retries,
            "Task scheduler initialized"
        );
        Self {
            inner: Arc::new(SchedulerInner {
                config,
                events,
                handlers: DashMap::new(),
                state: Mutex::new(SchedulerState::default()),
                paused: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                settled: Notify::new(),
                shutdown_notify: Notify::new(),
                background: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Register the handler for `task_type`, replacing any previous one
    pub fn register_handler<H>(&self, task_type: impl Into<String>, handler: H)
    where
        H: TaskHandler + 'static,
    {
        let task_type = task_type.into();
        if self
            .inner
            .handlers
            .insert(task_type.clone(), Arc::new(handler))
            .is_some()
        {
            warn!(task_type = %task_type, "Task handler replaced");
        } else {
            debug!(task_type = %task_type, "Task handler registered");
        }
    }

    /// Register a closure as the handler for `task_type`
    pub fn register_fn<F, Fut>(&self, task_type: impl Into<String>, f: F)
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.register_handler(task_type, handler_fn(f));
    }

    pub fn unregister_handler(&self, task_type: &str) -> bool {
        self.inner.handlers.remove(task_type).is_some()
    }

    pub fn has_handler(&self, task_type: &str) -> bool {
        self.inner.handlers.contains_key(task_type)
    }

    /// Enqueue a task; fails with `QueueFull` when the queue is at capacity
    pub async fn add_task(
        &self,
        task_type: impl Into<String>,
        payload: Value,
        opts: TaskOptions,
    ) -> ResilienceResult<Uuid> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(ResilienceError::ShuttingDown("task scheduler".to_string()));
        }
        let config = self.inner.config.current();
        let capacity = config.scheduler.max_queue_length;
        let task = Task::new(task_type, payload, &opts);
        let (id, task_type, priority) = (task.id, task.task_type.clone(), task.priority);

        {
            let mut state = self.inner.state.lock();
            if state.queue.len() >= capacity {
                warn!(task_type = %task_type, capacity = capacity, "Task queue full");
                return Err(ResilienceError::QueueFull { capacity });
            }
            if state.tasks.contains_key(&id) {
                return Err(ResilienceError::DuplicateTask(id));
            }
            state.queue.push(id, priority);
            state.tasks.insert(id, task);
            self.inner.check_high_water(&mut state, capacity, config.scheduler.queue_warning_ratio);
        }

        debug!(task_id = %id, task_type = %task_type, priority = %priority, "Task added");
        self.inner.events.publish(ResilienceEvent::TaskAdded {
            task_id: id,
            task_type,
            priority,
        });
        SchedulerInner::pump(&self.inner);
        Ok(id)
    }

    /// Cancel a `Pending` or `Retrying` task
    pub fn cancel_task(&self, id: Uuid) -> bool {
        {
            let mut state = self.inner.state.lock();
            let Some(task) = state.tasks.get_mut(&id) else {
                return false;
            };
            if !task.status.is_cancellable() {
                return false;
            }
            task.status = TaskStatus::Cancelled;
            task.ended_at = Some(Utc::now());
            state.queue.remove(id);
        }

        info!(task_id = %id, "Task cancelled");
        self.inner
            .events
            .publish(ResilienceEvent::TaskCancelled { task_id: id });
        self.inner.settled.notify_waiters();
        true
    }

    pub fn get_task(&self, id: Uuid) -> Option<Task> {
        self.inner.state.lock().tasks.get(&id).cloned()
    }

    pub fn task_status(&self, id: Uuid) -> Option<TaskStatus> {
        self.inner.state.lock().tasks.get(&id).map(|t| t.status)
    }

    /// Result of a completed task
    pub fn task_result(&self, id: Uuid) -> Option<Value> {
        self.inner
            .state
            .lock()
            .tasks
            .get(&id)
            .filter(|t| t.status == TaskStatus::Completed)
            .and_then(|t| t.result.clone())
    }

    /// Every tracked task, oldest first
    pub fn all_tasks(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = self.inner.state.lock().tasks.values().cloned().collect();
        tasks.sort_by_key(|t| t.created_at);
        tasks
    }

    /// Wait until a task reaches a terminal state; `None` if unknown or still unsettled
    /// after `timeout`
    pub async fn wait_for_task(&self, id: Uuid, timeout: Duration) -> Option<Task> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.inner.settled.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let task = self.get_task(id)?;
            if task.status.is_terminal() {
                return Some(task);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return None;
            }
        }
    }

    /// Forget terminal tasks that ended more than `max_age` ago
    pub fn cleanup_tasks(&self, max_age: Duration) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(max_age).unwrap_or_else(|_| chrono::Duration::zero());
        let mut state = self.inner.state.lock();
        let before = state.tasks.len();
        state.tasks.retain(|_, task| {
            !(task.status.is_terminal() && task.ended_at.is_some_and(|ended| ended < cutoff))
        });
        let removed = before - state.tasks.len();
        if removed > 0 {
            debug!(removed = removed, "Cleaned up finished tasks");
        }
        removed
    }

    /// Stop dispatching; running tasks continue
    pub fn pause(&self) {
        self.inner.paused.store(true, Ordering::Release);
        info!("Task scheduler paused");
    }

    pub async fn resume(&self) {
        self.inner.paused.store(false, Ordering::Release);
        info!("Task scheduler resumed");
        SchedulerInner::pump(&self.inner);
    }

    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> SchedulerStats {
        let config = self.inner.config.current();
        let state = self.inner.state.lock();
        let mut stats = SchedulerStats {
            queue_length: state.queue.len(),
            capacity: config.scheduler.max_queue_length,
            running: state.running,
            concurrency: config.scheduler.concurrency,
            paused: self.is_paused(),
            total: state.tasks.len(),
            ..SchedulerStats::default()
        };
        for task in state.tasks.values() {
            match task.status {
                TaskStatus::Pending => stats.pending += 1,
                TaskStatus::Retrying => stats.retrying += 1,
                TaskStatus::Completed => stats.completed += 1,
                TaskStatus::Failed => stats.failed += 1,
                TaskStatus::Cancelled => stats.cancelled += 1,
                TaskStatus::TimedOut => stats.timed_out += 1,
                TaskStatus::Running => {}
            }
        }
        stats
    }

    /// Mark every run older than its timeout as `TimedOut`; returns how many were marked
    pub fn sweep_timeouts(&self) -> usize {
        let timed_out = self.inner.sweep_timeouts();
        if timed_out > 0 {
            SchedulerInner::pump(&self.inner);
        }
        timed_out
    }

    /// Write the persistence snapshot now
    pub async fn persist(&self) -> ResilienceResult<usize> {
        let path = self.inner.config.current().scheduler.persistence.path.clone();
        let tasks = self.all_tasks();
        persistence::save_tasks(&path, &tasks).await
    }

    /// Load persisted tasks (when enabled) and start the watchdog, monitor and
    /// persistence loops
    pub async fn start(&self) -> ResilienceResult<()> {
        let config = self.inner.config.current();
        if config.scheduler.persistence.enabled {
            let restored = persistence::load_tasks(&config.scheduler.persistence.path).await?;
            self.restore(restored);
        }

        let weak = Arc::downgrade(&self.inner);
        let mut background = self.inner.background.lock();
        background.push(spawn_loop(
            weak.clone(),
            "watchdog",
            |inner| Duration::from_millis(inner.config.current().scheduler.watchdog_interval_ms),
            |inner| async move {
                if inner.sweep_timeouts() > 0 {
                    SchedulerInner::pump(&inner);
                }
            },
        ));
        background.push(spawn_loop(
            weak.clone(),
            "monitor",
            |inner| Duration::from_millis(inner.config.current().scheduler.monitor_interval_ms),
            |inner| async move { inner.monitor() },
        ));
        if config.scheduler.persistence.enabled {
            background.push(spawn_loop(
                weak,
                "persistence",
                |inner| {
                    Duration::from_millis(inner.config.current().scheduler.persistence.interval_ms)
                },
                |inner| async move {
                    let scheduler = TaskScheduler { inner };
                    if let Err(e) = scheduler.persist().await {
                        error!(error = %e, "Failed to persist task snapshot");
                    }
                },
            ));
        }
        info!("Task scheduler background loops started");
        Ok(())
    }

    /// Stop background loops, reject new tasks and write a final snapshot when enabled
    pub async fn close(&self) -> ResilienceResult<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.inner.shutdown_notify.notify_waiters();
        let handles: Vec<JoinHandle<()>> = self.inner.background.lock().drain(..).collect();
        for handle in handles {
            handle.abort();
            let _ = handle.await;
        }

        if self.inner.config.current().scheduler.persistence.enabled {
            let saved = self.persist().await?;
            info!(tasks = saved, "Task snapshot written on close");
        }
        info!("Task scheduler closed");
        Ok(())
    }

    fn restore(&self, tasks: Vec<Task>) {
        let capacity = self.inner.config.current().scheduler.max_queue_length;
        let mut restored = 0;
        {
            let mut state = self.inner.state.lock();
            for task in tasks {
                if state.tasks.contains_key(&task.id) {
                    continue;
                }
                if state.queue.len() >= capacity {
                    warn!(task_id = %task.id, capacity = capacity, "Queue full, dropping persisted task");
                    continue;
                }
                state.queue.push(task.id, task.priority);
                state.tasks.insert(task.id, task);
                restored += 1;
            }
        }
        info!(tasks = restored, "Persisted tasks restored");
        SchedulerInner::pump(&self.inner);
    }
}

fn spawn_loop<I, R, Fut>(
    weak: Weak<SchedulerInner>,
    name: &'static str,
    interval: I,
    mut run: R,
) -> JoinHandle<()>
where
    I: Fn(&SchedulerInner) -> Duration + Send + 'static,
    R: FnMut(Arc<SchedulerInner>) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    tokio::spawn(async move {
        loop {
            let Some(inner) = weak.upgrade() else {
                break;
            };
            if inner.closed.load(Ordering::Acquire) {
                break;
            }
            let period = interval(&*inner).max(Duration::from_millis(1));
            let shutdown = async {
                tokio::select! {
                    _ = tokio::time::sleep(period) => false,
                    _ = inner.shutdown_notify.notified() => true,
                }
            };
            if shutdown.await {
                debug!(name = name, "Scheduler loop received shutdown notification");
                break;
            }
            run(inner).await;
        }
        debug!(name = name, "Scheduler loop ended");
    })
}

impl SchedulerInner {
    /// Start as many queued tasks as the concurrency limit allows
    fn pump(self: &Arc<Self>) {
        if self.paused.load(Ordering::Acquire) || self.closed.load(Ordering::Acquire) {
            return;
        }

        loop {
            let concurrency = self.config.current().scheduler.concurrency;
            let mut unhandled = None;
            let dispatch = {
                let mut state = self.state.lock();
                if state.running >= concurrency {
                    break;
                }
                let Some(id) = state.queue.pop() else {
                    break;
                };
                let Some(task) = state.tasks.get_mut(&id) else {
                    continue;
                };
                if !task.status.is_cancellable() {
                    continue;
                }

                let handler = self.handlers.get(&task.task_type).map(|h| h.value().clone());
                match handler {
                    None => {
                        let message =
                            ResilienceError::HandlerNotFound(task.task_type.clone()).to_string();
                        task.status = TaskStatus::Failed;
                        task.ended_at = Some(Utc::now());
                        task.error = Some(message.clone());
                        unhandled = Some((id, task.task_type.clone(), task.attempt, message));
                        None
                    }
                    Some(handler) => {
                        task.status = TaskStatus::Running;
                        task.attempt += 1;
                        task.started_at = Some(Utc::now());
                        task.ended_at = None;
                        let timeout = task.timeout_ms.map_or_else(
                            || self.config.current().scheduler.task_timeout(),
                            Duration::from_millis,
                        );
                        let ctx = TaskContext {
                            task_id: id,
                            task_type: task.task_type.clone(),
                            payload: task.payload.clone(),
                            priority: task.priority,
                            attempt: task.attempt,
                        };
                        state.running += 1;
                        Some(Dispatch {
                            ctx,
                            handler,
                            timeout,
                        })
                    }
                }
            };

            if let Some((task_id, task_type, attempt, message)) = unhandled {
                error!(task_id = %task_id, task_type = %task_type, "No handler registered for task type");
                self.events.publish(ResilienceEvent::TaskFailed {
                    task_id,
                    attempt,
                    error: message,
                });
                self.settled.notify_waiters();
                continue;
            }

            if let Some(dispatch) = dispatch {
                debug!(
                    task_id = %dispatch.ctx.task_id,
                    task_type = %dispatch.ctx.task_type,
                    attempt = dispatch.ctx.attempt,
                    "Task running"
                );
                self.events.publish(ResilienceEvent::TaskRunning {
                    task_id: dispatch.ctx.task_id,
                    attempt: dispatch.ctx.attempt,
                });
                let inner = Arc::clone(self);
                tokio::spawn(async move { inner.execute(dispatch).await });
            }
        }
    }

    async fn execute(self: Arc<Self>, dispatch: Dispatch) {
        let Dispatch {
            ctx,
            handler,
            timeout,
        } = dispatch;
        let (task_id, attempt) = (ctx.task_id, ctx.attempt);

        // Spawned so a panicking handler surfaces as a join error
        let run = tokio::spawn(async move { handler.handle(ctx).await });
        let outcome = match tokio::time::timeout(timeout, run).await {
            Ok(Ok(Ok(value))) => RunOutcome::Succeeded(value),
            Ok(Ok(Err(e))) => RunOutcome::Failed(e.to_string()),
            Ok(Err(join_error)) => RunOutcome::Failed(format!("handler panicked: {}", join_error)),
            Err(_) => RunOutcome::TimedOut,
        };

        self.finish(task_id, attempt, outcome);
        Self::pump(&self);
    }

    /// Record the outcome of one run; stale outcomes are ignored
    fn finish(self: &Arc<Self>, task_id: Uuid, attempt: u32, outcome: RunOutcome) {
        let config = self.config.current();
        let mut retry_after = None;
        let event = {
            let mut state = self.state.lock();
            let Some(task) = state.tasks.get_mut(&task_id) else {
                return;
            };
            if task.status != TaskStatus::Running || task.attempt != attempt {
                debug!(task_id = %task_id, attempt = attempt, "Ignoring result of a settled run");
                return;
            }

            let now = Utc::now();
            let event = match outcome {
                RunOutcome::Succeeded(value) => {
                    task.status = TaskStatus::Completed;
                    task.ended_at = Some(now);
                    task.result = Some(value);
                    task.error = None;
                    debug!(task_id = %task_id, attempt = attempt, "Task completed");
                    ResilienceEvent::TaskCompleted { task_id, attempt }
                }
                RunOutcome::TimedOut => {
                    task.status = TaskStatus::TimedOut;
                    task.ended_at = Some(now);
                    task.error = Some(TIMEOUT_MESSAGE.to_string());
                    warn!(task_id = %task_id, task_type = %task.task_type, attempt = attempt, "Task timed out");
                    ResilienceEvent::TaskTimedOut { task_id, attempt }
                }
                RunOutcome::Failed(message) => {
                    let max_retries = task.max_retries.unwrap_or(config.scheduler.max_retries);
                    task.error = Some(message.clone());
                    if attempt <= max_retries {
                        let delay = backoff_delay(
                            config.scheduler.retry_base_delay(),
                            config.scheduler.backoff_factor,
                            attempt,
                        );
                        task.status = TaskStatus::Retrying;
                        retry_after = Some(delay);
                        warn!(
                            task_id = %task_id,
                            task_type = %task.task_type,
                            attempt = attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %message,
                            "Task failed, retrying"
                        );
                        ResilienceEvent::TaskRetrying {
                            task_id,
                            attempt,
                            delay_ms: delay.as_millis() as u64,
                        }
                    } else {
                        task.status = TaskStatus::Failed;
                        task.ended_at = Some(now);
                        log_error(
                            "scheduler",
                            "execute",
                            &message,
                            Some(&format!(
                                "task_id={task_id} task_type={} attempt={attempt}",
                                task.task_type
                            )),
                        );
                        ResilienceEvent::TaskFailed {
                            task_id,
                            attempt,
                            error: message,
                        }
                    }
                }
            };
            state.running = state.running.saturating_sub(1);
            event
        };

        self.events.publish(event);
        match retry_after {
            Some(delay) => self.schedule_retry(task_id, delay),
            None => self.settled.notify_waiters(),
        }
    }

    /// Re-enqueue a `Retrying` task once its backoff has elapsed
    fn schedule_retry(self: &Arc<Self>, task_id: Uuid, delay: Duration) {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            {
                let mut state = inner.state.lock();
                let Some(priority) = state
                    .tasks
                    .get(&task_id)
                    .filter(|t| t.status == TaskStatus::Retrying)
                    .map(|t| t.priority)
                else {
                    return;
                };
                state.queue.push(task_id, priority);
            }
            Self::pump(&inner);
        });
    }

    fn sweep_timeouts(&self) -> usize {
        let default_timeout = self.config.current().scheduler.task_timeout();
        let now = Utc::now();
        let mut expired = Vec::new();
        {
            let mut state = self.state.lock();
            for task in state.tasks.values_mut() {
                if task.status != TaskStatus::Running {
                    continue;
                }
                let timeout = task
                    .timeout_ms
                    .map_or(default_timeout, Duration::from_millis);
                let Some(started) = task.started_at else {
                    continue;
                };
                let overdue = (now - started)
                    .to_std()
                    .is_ok_and(|elapsed| elapsed > timeout);
                if overdue {
                    task.status = TaskStatus::TimedOut;
                    task.ended_at = Some(now);
                    task.error = Some(TIMEOUT_MESSAGE.to_string());
                    expired.push((task.id, task.attempt));
                }
            }
            state.running = state.running.saturating_sub(expired.len());
        }

        for (task_id, attempt) in &expired {
            warn!(task_id = %task_id, attempt = attempt, "Watchdog marked task timed out");
            self.events.publish(ResilienceEvent::TaskTimedOut {
                task_id: *task_id,
                attempt: *attempt,
            });
        }
        if !expired.is_empty() {
            self.settled.notify_waiters();
        }
        expired.len()
    }

    fn monitor(&self) {
        let config = self.config.current();
        let mut state = self.state.lock();
        debug!(
            queue_length = state.queue.len(),
            running = state.running,
            tracked = state.tasks.len(),
            "Task queue status"
        );
        self.check_high_water(
            &mut state,
            config.scheduler.max_queue_length,
            config.scheduler.queue_warning_ratio,
        );
    }

    fn check_high_water(&self, state: &mut SchedulerState, capacity: usize, ratio: f64) {
        let length = state.queue.len();
        let above = length as f64 >= capacity as f64 * ratio;
        if above && !state.high_water {
            warn!(length = length, capacity = capacity, "Task queue nearing capacity");
            self.events
                .publish(ResilienceEvent::QueueHighWater { length, capacity });
        }
        state.high_water = above;
    }
}

/// `base * factor^(attempt-1)`
pub fn backoff_delay(base: Duration, factor: f64, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
    let scaled = base.as_secs_f64() * factor.powi(exponent);
    Duration::try_from_secs_f64(scaled).unwrap_or(Duration::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResilienceConfig;
    use crate::scheduler::TaskPriority;
    use serde_json::json;
    use std::sync::atomic::AtomicU32;

    fn scheduler_with(
        edit: impl FnOnce(&mut ResilienceConfig),
    ) -> (TaskScheduler, Arc<EventPublisher>) {
        let mut config = ResilienceConfig::for_testing();
        edit(&mut config);
        let events = Arc::new(EventPublisher::new(256));
        (
            TaskScheduler::new(ConfigHandle::fixed(config), events.clone()),
            events,
        )
    }

    const WAIT: Duration = Duration::from_secs(5);

    #[test]
    fn test_backoff_delay() {
        let base = Duration::from_millis(100);
        assert_eq!(backoff_delay(base, 2.0, 1), Duration::from_millis(100));
        assert_eq!(backoff_delay(base, 2.0, 2), Duration::from_millis(200));
        assert_eq!(backoff_delay(base, 2.0, 4), Duration::from_millis(800));
        assert_eq!(backoff_delay(base, 1.0, 9), base);
    }

    #[tokio::test]
    async fn test_completes_with_result() {
        let (scheduler, _events) = scheduler_with(|_| {});
        scheduler.register_fn("double", |ctx: TaskContext| async move {
            let n = ctx.payload["n"].as_i64().unwrap_or_default();
            Ok(json!(n * 2))
        });

        let id = scheduler
            .add_task("double", json!({"n": 21}), TaskOptions::new())
            .await
            .unwrap();
        let task = scheduler.wait_for_task(id, WAIT).await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.attempt, 1);
        assert_eq!(scheduler.task_result(id), Some(json!(42)));
    }

    #[tokio::test]
    async fn test_retries_then_succeeds() {
        let (scheduler, _events) = scheduler_with(|_| {});
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        scheduler.register_fn("flaky", move |_ctx| {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    anyhow::bail!("transient failure");
                }
                Ok(json!("ok"))
            }
        });

        let id = scheduler
            .add_task("flaky", json!({}), TaskOptions::new())
            .await
            .unwrap();
        let task = scheduler.wait_for_task(id, WAIT).await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.attempt, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_always_failing_task_exhausts_retries() {
        let (scheduler, events) = scheduler_with(|c| c.scheduler.max_retries = 2);
        let mut rx = events.subscribe();
        scheduler.register_fn("broken", |_ctx| async { anyhow::bail!("disk full") });

        let id = scheduler
            .add_task("broken", json!({}), TaskOptions::new())
            .await
            .unwrap();
        let task = scheduler.wait_for_task(id, WAIT).await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.attempt, 3);
        assert_eq!(task.error.as_deref(), Some("disk full"));

        let mut retries = 0;
        while let Ok(published) = rx.try_recv() {
            if matches!(published.event, ResilienceEvent::TaskRetrying { .. }) {
                retries += 1;
            }
        }
        assert_eq!(retries, 2);
    }

    #[tokio::test]
    async fn test_missing_handler_fails_immediately() {
        let (scheduler, _events) = scheduler_with(|_| {});
        let id = scheduler
            .add_task("unknown", json!({}), TaskOptions::new())
            .await
            .unwrap();
        let task = scheduler.wait_for_task(id, WAIT).await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.attempt, 0);
        assert!(task.error.unwrap().contains("unknown"));
    }

    #[tokio::test]
    async fn test_queue_full() {
        let (scheduler, _events) = scheduler_with(|c| c.scheduler.max_queue_length = 2);
        scheduler.pause();
        for _ in 0..2 {
            scheduler
                .add_task("noop", json!({}), TaskOptions::new())
                .await
                .unwrap();
        }
        let err = scheduler
            .add_task("noop", json!({}), TaskOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ResilienceError::QueueFull { capacity: 2 }));
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected() {
        let (scheduler, _events) = scheduler_with(|_| {});
        scheduler.pause();
        let id = Uuid::new_v4();
        scheduler
            .add_task("noop", json!({}), TaskOptions::new().with_id(id))
            .await
            .unwrap();
        let err = scheduler
            .add_task("noop", json!({}), TaskOptions::new().with_id(id))
            .await
            .unwrap_err();
        assert!(matches!(err, ResilienceError::DuplicateTask(dup) if dup == id));
    }

    #[tokio::test]
    async fn test_cancel_only_waiting_tasks() {
        let (scheduler, _events) = scheduler_with(|_| {});
        scheduler.register_fn("noop", |_ctx| async { Ok(Value::Null) });
        scheduler.pause();
        let id = scheduler
            .add_task("noop", json!({}), TaskOptions::new())
            .await
            .unwrap();
        assert!(scheduler.cancel_task(id));
        assert!(!scheduler.cancel_task(id));
        assert!(!scheduler.cancel_task(Uuid::new_v4()));

        scheduler.resume().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(scheduler.task_status(id), Some(TaskStatus::Cancelled));
        assert_eq!(scheduler.stats().queue_length, 0);
    }

    #[tokio::test]
    async fn test_priority_dispatch_with_single_slot() {
        let (scheduler, _events) = scheduler_with(|c| c.scheduler.concurrency = 1);
        let order = Arc::new(Mutex::new(Vec::new()));
        let seen = order.clone();
        scheduler.register_fn("record", move |ctx: TaskContext| {
            let seen = seen.clone();
            async move {
                seen.lock().push(ctx.priority);
                Ok(Value::Null)
            }
        });

        scheduler.pause();
        let low = scheduler
            .add_task("record", json!({}), TaskOptions::new().with_priority(TaskPriority::Low))
            .await
            .unwrap();
        scheduler
            .add_task(
                "record",
                json!({}),
                TaskOptions::new().with_priority(TaskPriority::Critical),
            )
            .await
            .unwrap();
        scheduler.resume().await;

        scheduler.wait_for_task(low, WAIT).await.unwrap();
        assert_eq!(*order.lock(), vec![TaskPriority::Critical, TaskPriority::Low]);
    }

    #[tokio::test]
    async fn test_run_timeout_frees_slot_and_ignores_late_result() {
        let (scheduler, _events) = scheduler_with(|c| c.scheduler.concurrency = 1);
        scheduler.register_fn("slow", |_ctx| async {
            tokio::time::sleep(Duration::from_millis(300)).await;
            Ok(json!("late"))
        });
        scheduler.register_fn("fast", |_ctx| async { Ok(json!("fast")) });

        let slow = scheduler
            .add_task(
                "slow",
                json!({}),
                TaskOptions::new().with_timeout(Duration::from_millis(50)),
            )
            .await
            .unwrap();
        let fast = scheduler
            .add_task("fast", json!({}), TaskOptions::new())
            .await
            .unwrap();

        let task = scheduler.wait_for_task(slow, WAIT).await.unwrap();
        assert_eq!(task.status, TaskStatus::TimedOut);
        assert_eq!(
            scheduler.wait_for_task(fast, WAIT).await.unwrap().status,
            TaskStatus::Completed
        );

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(scheduler.task_status(slow), Some(TaskStatus::TimedOut));
        assert_eq!(scheduler.task_result(slow), None);
        assert_eq!(scheduler.stats().running, 0);
    }

    #[tokio::test]
    async fn test_watchdog_marks_overdue_runs() {
        let (scheduler, _events) = scheduler_with(|_| {});
        scheduler.register_fn("hang", |_ctx| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(Value::Null)
        });
        let id = scheduler
            .add_task("hang", json!({}), TaskOptions::new())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Backdate the run so the sweep sees it as overdue
        {
            let mut state = scheduler.inner.state.lock();
            let task = state.tasks.get_mut(&id).unwrap();
            task.started_at = Some(Utc::now() - chrono::Duration::minutes(5));
        }
        assert_eq!(scheduler.sweep_timeouts(), 1);
        assert_eq!(scheduler.task_status(id), Some(TaskStatus::TimedOut));
        assert_eq!(scheduler.stats().running, 0);
    }

    #[tokio::test]
    async fn test_cleanup_and_stats() {
        let (scheduler, _events) = scheduler_with(|_| {});
        scheduler.register_fn("noop", |_ctx| async { Ok(Value::Null) });
        let id = scheduler
            .add_task("noop", json!({}), TaskOptions::new())
            .await
            .unwrap();
        scheduler.wait_for_task(id, WAIT).await.unwrap();
        assert_eq!(scheduler.stats().completed, 1);

        assert_eq!(scheduler.cleanup_tasks(Duration::from_secs(3600)), 0);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(scheduler.cleanup_tasks(Duration::ZERO), 1);
        assert!(scheduler.get_task(id).is_none());
    }

    #[tokio::test]
    async fn test_high_water_event() {
        let (scheduler, events) = scheduler_with(|c| c.scheduler.max_queue_length = 5);
        let mut rx = events.subscribe();
        scheduler.pause();
        for _ in 0..4 {
            scheduler
                .add_task("noop", json!({}), TaskOptions::new())
                .await
                .unwrap();
        }
        let mut high_water = 0;
        while let Ok(published) = rx.try_recv() {
            if let ResilienceEvent::QueueHighWater { length, capacity } = published.event {
                assert_eq!((length, capacity), (4, 5));
                high_water += 1;
            }
        }
        assert_eq!(high_water, 1);
    }

    #[tokio::test]
    async fn test_close_persists_and_restart_restores() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.json");
        let edit = |c: &mut ResilienceConfig| {
            c.scheduler.persistence.enabled = true;
            c.scheduler.persistence.path = path.clone();
        };

        let (first, _events) = scheduler_with(edit);
        first.start().await.unwrap();
        first.pause();
        let id = first
            .add_task("report", json!({"day": 1}), TaskOptions::new())
            .await
            .unwrap();
        first.close().await.unwrap();
        assert!(matches!(
            first.add_task("report", json!({}), TaskOptions::new()).await,
            Err(ResilienceError::ShuttingDown(_))
        ));

        let (second, _events) = scheduler_with(edit);
        second.register_fn("report", |ctx: TaskContext| async move { Ok(ctx.payload) });
        second.start().await.unwrap();
        let task = second.wait_for_task(id, WAIT).await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.result, Some(json!({"day": 1})));
        second.close().await.unwrap();
    }
}
