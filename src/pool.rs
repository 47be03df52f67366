//! Fixed worker pool behind a bounded task queue.
//!
//! Workers are spawned once at startup, pinned round-robin across cores,
//! and live for the whole process. A task's verdict travels back to the
//! event loop one of two ways: a blocking [`Completion`] handshake
//! (reactor, where the loop must not re-arm a socket a worker still owns)
//! or the shared [`VerdictQueue`] plus an eventfd wake (proactor, where
//! tasks run concurrently across the pool). One-shot registration keeps a
//! connection claimed by exactly one thread either way, and only the
//! event-loop thread ever touches epoll or the timer list.

use std::collections::VecDeque;
use std::os::fd::RawFd;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use tracing::{debug, info};

use crate::config::ServerConfig;
use crate::conn::{HttpConnection, ProcessOutcome, WriteOutcome};
use crate::error::{ServerError, ServerResult};
use crate::store::{StorePool, lock_unpoisoned};
use crate::syscalls;
use crate::table::ConnId;

/// What a worker should do with the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOp {
    /// Run the protocol step over already-buffered input (proactor: the
    /// event loop performed the read).
    Process,
    /// Drain the socket, then run the protocol step (reactor readable).
    ReadAndProcess,
    /// Drain the pending response (reactor writable).
    Write,
}

/// Verdict posted back to the event loop when a task finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Re-arm read interest and refresh the idle timer.
    AwaitReadable,
    /// Re-arm write interest and refresh the idle timer.
    AwaitWritable,
    /// Tear the connection down.
    Teardown,
}

/// One-shot handshake cell between the event loop and the worker that runs
/// a dispatched task.
pub struct Completion {
    slot: Mutex<Option<TaskOutcome>>,
    ready: Condvar,
}

impl Completion {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            ready: Condvar::new(),
        }
    }

    pub fn post(&self, outcome: TaskOutcome) {
        *lock_unpoisoned(&self.slot) = Some(outcome);
        self.ready.notify_one();
    }

    /// Block until the worker posts; no spinning.
    pub fn wait(&self) -> TaskOutcome {
        let mut slot = lock_unpoisoned(&self.slot);
        loop {
            if let Some(outcome) = slot.take() {
                return outcome;
            }
            slot = match self.ready.wait(slot) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
    }
}

impl Default for Completion {
    fn default() -> Self {
        Self::new()
    }
}

/// Verdict channel for tasks the event loop does not wait on. Pushes wake
/// the epoll loop through an eventfd; the loop drains the queue and applies
/// each verdict itself, so epoll and the timers stay single-threaded even
/// with the whole pool running concurrently.
pub struct VerdictQueue {
    verdicts: Mutex<Vec<(ConnId, TaskOutcome)>>,
    wake_fd: RawFd,
}

impl VerdictQueue {
    pub fn new(wake_fd: RawFd) -> Self {
        Self {
            verdicts: Mutex::new(Vec::new()),
            wake_fd,
        }
    }

    pub fn push(&self, id: ConnId, outcome: TaskOutcome) {
        lock_unpoisoned(&self.verdicts).push((id, outcome));
        syscalls::notify_event(self.wake_fd);
    }

    /// Take everything queued so far.
    pub fn drain(&self) -> Vec<(ConnId, TaskOutcome)> {
        std::mem::take(&mut *lock_unpoisoned(&self.verdicts))
    }
}

/// How a task's verdict travels back to the event loop.
pub enum Reply {
    /// The loop blocks on this cell right after dispatch (reactor: the
    /// worker owns the socket until the verdict posts).
    Handshake(Arc<Completion>),
    /// The verdict is queued and the loop is woken through its eventfd
    /// (proactor: dispatch returns immediately).
    Queued(Arc<VerdictQueue>),
}

pub struct Task {
    pub op: TaskOp,
    pub conn_id: ConnId,
    pub conn: Arc<Mutex<HttpConnection>>,
    pub reply: Reply,
}

/// Bounded FIFO. Enqueue never blocks; a full queue is reported to the
/// caller so it can shed the connection instead of stalling the loop.
struct TaskQueue {
    tasks: Mutex<VecDeque<Task>>,
    not_empty: Condvar,
    capacity: usize,
}

impl TaskQueue {
    fn new(capacity: usize) -> Self {
        Self {
            tasks: Mutex::new(VecDeque::new()),
            not_empty: Condvar::new(),
            capacity,
        }
    }

    fn push(&self, task: Task) -> ServerResult<()> {
        let mut tasks = lock_unpoisoned(&self.tasks);
        if tasks.len() >= self.capacity {
            return Err(ServerError::QueueFull);
        }
        tasks.push_back(task);
        self.not_empty.notify_one();
        Ok(())
    }

    fn pop(&self) -> Task {
        let mut tasks = lock_unpoisoned(&self.tasks);
        loop {
            if let Some(task) = tasks.pop_front() {
                return task;
            }
            tasks = match self.not_empty.wait(tasks) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
    }
}

pub struct WorkerPool {
    queue: Arc<TaskQueue>,
}

impl WorkerPool {
    /// Spawn the fixed set of worker threads. Threads are detached and run
    /// for the life of the process.
    pub fn new(config: &ServerConfig, stores: Arc<StorePool>) -> ServerResult<Self> {
        let queue = Arc::new(TaskQueue::new(config.max_queue));
        let core_ids = core_affinity::get_core_ids().unwrap_or_default();

        for i in 0..config.workers {
            let queue = queue.clone();
            let stores = stores.clone();
            let core = if core_ids.is_empty() {
                None
            } else {
                Some(core_ids[i % core_ids.len()])
            };
            thread::Builder::new()
                .name(format!("etude-worker-{i}"))
                .spawn(move || {
                    if let Some(core) = core {
                        core_affinity::set_for_current(core);
                    }
                    debug!(worker = i, "worker online");
                    loop {
                        let task = queue.pop();
                        run_task(task, &stores);
                    }
                })
                .map_err(ServerError::Spawn)?;
        }
        info!(workers = config.workers, "worker pool started");
        Ok(Self { queue })
    }

    /// Hand a task to the pool. `Err(QueueFull)` when the bounded queue is
    /// at capacity; the caller decides what happens to the connection.
    pub fn dispatch(&self, task: Task) -> ServerResult<()> {
        self.queue.push(task)
    }
}

fn run_task(task: Task, stores: &StorePool) {
    let outcome = {
        let mut conn = lock_unpoisoned(&task.conn);
        match task.op {
            TaskOp::Process => process_step(&mut conn, stores),
            TaskOp::ReadAndProcess => {
                if conn.read_once() {
                    process_step(&mut conn, stores)
                } else {
                    TaskOutcome::Teardown
                }
            }
            TaskOp::Write => match conn.write() {
                WriteOutcome::Again => TaskOutcome::AwaitWritable,
                WriteOutcome::Done { keep_alive: true } => TaskOutcome::AwaitReadable,
                WriteOutcome::Done { keep_alive: false } => TaskOutcome::Teardown,
                WriteOutcome::Error => TaskOutcome::Teardown,
            },
        }
    };
    match task.reply {
        Reply::Handshake(completion) => completion.post(outcome),
        Reply::Queued(verdicts) => verdicts.push(task.conn_id, outcome),
    }
}

fn process_step(conn: &mut HttpConnection, stores: &StorePool) -> TaskOutcome {
    // The store connection is held only for the duration of the step.
    let store = stores.checkout();
    match conn.process(&store) {
        ProcessOutcome::NeedMore => TaskOutcome::AwaitReadable,
        ProcessOutcome::ResponseReady => TaskOutcome::AwaitWritable,
        ProcessOutcome::Close => TaskOutcome::Teardown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::CredentialStore;

    fn pool_with(workers: usize, max_queue: usize) -> WorkerPool {
        let config = ServerConfig {
            workers,
            max_queue,
            ..ServerConfig::default()
        };
        let stores = Arc::new(StorePool::new(2, Arc::new(CredentialStore::new())));
        WorkerPool::new(&config, stores).unwrap()
    }

    fn task_for(op: TaskOp, conn: HttpConnection) -> (Task, Arc<Completion>) {
        let completion = Arc::new(Completion::new());
        let task = Task {
            op,
            conn_id: ConnId {
                index: 0,
                generation: 0,
            },
            conn: Arc::new(Mutex::new(conn)),
            reply: Reply::Handshake(completion.clone()),
        };
        (task, completion)
    }

    fn fresh_conn() -> HttpConnection {
        HttpConnection::new(Arc::new(ServerConfig::default()))
    }

    #[test]
    fn test_dispatch_and_completion_round_trip() {
        let pool = pool_with(2, 16);

        // A malformed request runs the full protocol step without touching
        // any socket and ends with a response ready to send.
        let mut conn = fresh_conn();
        assert!(conn.feed(b"BOGUS\r\n\r\n"));
        let (task, completion) = task_for(TaskOp::Process, conn);
        pool.dispatch(task).unwrap();
        assert_eq!(completion.wait(), TaskOutcome::AwaitWritable);
    }

    #[test]
    fn test_incomplete_request_awaits_more_data() {
        let pool = pool_with(1, 16);
        let mut conn = fresh_conn();
        assert!(conn.feed(b"GET /a.html HTT"));
        let (task, completion) = task_for(TaskOp::Process, conn);
        pool.dispatch(task).unwrap();
        assert_eq!(completion.wait(), TaskOutcome::AwaitReadable);
    }

    #[test]
    fn test_write_with_nothing_pending_is_keep_alive() {
        let pool = pool_with(1, 16);
        let (task, completion) = task_for(TaskOp::Write, fresh_conn());
        pool.dispatch(task).unwrap();
        assert_eq!(completion.wait(), TaskOutcome::AwaitReadable);
    }

    #[test]
    fn test_queue_capacity_enforced() {
        // No workers draining: fill the queue directly.
        let queue = TaskQueue::new(2);
        for _ in 0..2 {
            let (task, _) = task_for(TaskOp::Process, fresh_conn());
            queue.push(task).unwrap();
        }
        let (task, _) = task_for(TaskOp::Process, fresh_conn());
        assert!(matches!(queue.push(task), Err(ServerError::QueueFull)));

        // A pop restores exactly one slot.
        let _drained = queue.pop();
        let (task, _) = task_for(TaskOp::Process, fresh_conn());
        queue.push(task).unwrap();
        let (task, _) = task_for(TaskOp::Process, fresh_conn());
        assert!(matches!(queue.push(task), Err(ServerError::QueueFull)));
    }

    #[test]
    fn test_queued_tasks_run_concurrently() {
        use std::time::Duration;

        let stores = Arc::new(StorePool::new(1, Arc::new(CredentialStore::new())));
        let config = ServerConfig {
            workers: 2,
            max_queue: 16,
            ..ServerConfig::default()
        };
        let pool = WorkerPool::new(&config, stores.clone()).unwrap();
        let wake_fd = syscalls::create_eventfd().unwrap();
        let verdicts = Arc::new(VerdictQueue::new(wake_fd));

        // Starve the store pool so both tasks park inside their workers.
        let blocker = stores.checkout();

        for index in 0..2u32 {
            let mut conn = fresh_conn();
            assert!(conn.feed(b"GET /nothing.html HTTP/1.1\r\n\r\n"));
            pool.dispatch(Task {
                op: TaskOp::Process,
                conn_id: ConnId {
                    index,
                    generation: 0,
                },
                conn: Arc::new(Mutex::new(conn)),
                reply: Reply::Queued(verdicts.clone()),
            })
            .unwrap();
        }

        // Both tasks leave the queue with no verdict posted: two workers
        // hold one task each at the same time.
        thread::sleep(Duration::from_millis(100));
        assert!(lock_unpoisoned(&pool.queue.tasks).is_empty());
        assert!(verdicts.drain().is_empty());

        drop(blocker);
        let mut seen = Vec::new();
        for _ in 0..200 {
            seen.extend(verdicts.drain());
            if seen.len() == 2 {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        let mut indices: Vec<u32> = seen.iter().map(|(id, _)| id.index).collect();
        indices.sort_unstable();
        assert_eq!(indices, vec![0, 1]);
        assert!(
            seen.iter()
                .all(|(_, outcome)| *outcome == TaskOutcome::AwaitWritable)
        );
        syscalls::close_fd(wake_fd);
    }
}
