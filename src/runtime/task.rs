//! Cooperative tasks.
//!
//! A task is a boxed future living in a slab on the ring's thread. Tasks
//! start eagerly: `spawn` polls the future once before returning, so a task
//! runs until its first suspension point right away. After that a task is
//! only polled when something wakes it, which in practice is the ring
//! dispatching a completion the task was waiting for, or another task it
//! is awaiting finishing.
//!
//! Wakers must be `Send + Sync`, so the ready queue behind them sits in an
//! `Arc<Mutex<..>>`. Everything else is `Rc`/`RefCell` and never leaves the
//! thread.

use slab::Slab;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::future::Future;
use std::mem;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Wake, Waker};
use tracing::{trace, warn};

type BoxFuture = Pin<Box<dyn Future<Output = ()>>>;

/// Queue of `(slot, id)` pairs whose tasks want to be polled.
#[derive(Default)]
struct ReadyQueue {
    queue: Mutex<VecDeque<(usize, u64)>>,
}

impl ReadyQueue {
    fn push(&self, slot: usize, id: u64) {
        let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        queue.push_back((slot, id));
    }

    fn pop(&self) -> Option<(usize, u64)> {
        let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        queue.pop_front()
    }

    fn is_empty(&self) -> bool {
        let queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        queue.is_empty()
    }

    fn clear(&self) {
        let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        queue.clear();
    }
}

struct TaskWaker {
    slot: usize,
    id: u64,
    scheduled: AtomicBool,
    ready: Arc<ReadyQueue>,
}

impl Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        if !self.scheduled.swap(true, Ordering::AcqRel) {
            self.ready.push(self.slot, self.id);
        }
    }
}

struct TaskCell {
    /// Slots are reused; the id tells a stale wake-up from a live one.
    id: u64,
    future: RefCell<Option<BoxFuture>>,
    waker: Arc<TaskWaker>,
}

/// The set of live tasks plus the queue of those ready to run.
pub(crate) struct Executor {
    tasks: RefCell<Slab<Rc<TaskCell>>>,
    ready: Arc<ReadyQueue>,
    next_id: Cell<u64>,
}

impl Executor {
    pub fn new() -> Self {
        Self {
            tasks: RefCell::new(Slab::new()),
            ready: Arc::new(ReadyQueue::default()),
            next_id: Cell::new(0),
        }
    }

    /// Spawn a task and run it up to its first suspension point.
    pub fn spawn<F>(&self, future: F) -> Task<F::Output>
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        let join = Rc::new(RefCell::new(JoinState {
            output: None,
            finished: false,
            waiter: None,
        }));
        let state = Rc::clone(&join);
        let wrapped = async move {
            let output = future.await;
            let waiter = {
                let mut state = state.borrow_mut();
                state.output = Some(output);
                state.finished = true;
                state.waiter.take()
            };
            if let Some(waiter) = waiter {
                waiter.wake();
            }
        };

        let id = self.next_id.get();
        self.next_id.set(id.wrapping_add(1));
        let slot = {
            let mut tasks = self.tasks.borrow_mut();
            let entry = tasks.vacant_entry();
            let slot = entry.key();
            entry.insert(Rc::new(TaskCell {
                id,
                future: RefCell::new(Some(Box::pin(wrapped))),
                waker: Arc::new(TaskWaker {
                    slot,
                    id,
                    scheduled: AtomicBool::new(false),
                    ready: Arc::clone(&self.ready),
                }),
            }));
            slot
        };
        trace!(slot, id, "Spawned task");

        self.poll_task(slot, id);
        Task { state: join }
    }

    /// Poll every task that has been woken, including tasks woken while
    /// this runs.
    pub fn run_ready(&self) {
        while let Some((slot, id)) = self.ready.pop() {
            self.poll_task(slot, id);
        }
    }

    /// True when no task is waiting to be polled.
    pub fn is_idle(&self) -> bool {
        self.ready.is_empty()
    }

    /// Number of tasks that have not finished yet.
    pub fn len(&self) -> usize {
        self.tasks.borrow().len()
    }

    /// Drop every task without running it further.
    pub fn clear(&self) {
        let tasks = mem::take(&mut *self.tasks.borrow_mut());
        // Futures may touch the executor while being dropped, so the slab
        // must not be borrowed at this point.
        drop(tasks);
        self.ready.clear();
    }

    fn poll_task(&self, slot: usize, id: u64) {
        let cell = match self.tasks.borrow().get(slot) {
            Some(cell) if cell.id == id => Rc::clone(cell),
            _ => return,
        };

        cell.waker.scheduled.store(false, Ordering::Release);
        let waker = Waker::from(Arc::clone(&cell.waker));
        let mut cx = Context::from_waker(&waker);

        let finished = {
            let mut future = match cell.future.try_borrow_mut() {
                Ok(future) => future,
                Err(_) => {
                    warn!(slot, id, "Task woken while it is being polled");
                    return;
                }
            };
            let done = match future.as_mut() {
                Some(f) => f.as_mut().poll(&mut cx).is_ready(),
                None => false,
            };
            if done {
                future.take()
            } else {
                None
            }
        };

        if let Some(future) = finished {
            drop(future);
            let removed = {
                let mut tasks = self.tasks.borrow_mut();
                match tasks.get(slot) {
                    Some(c) if c.id == id => Some(tasks.remove(slot)),
                    _ => None,
                }
            };
            drop(removed);
            trace!(slot, id, "Task finished");
        }
    }
}

struct JoinState<T> {
    output: Option<T>,
    finished: bool,
    waiter: Option<Waker>,
}

/// Handle to a spawned task.
///
/// Awaiting it suspends until the task finishes and yields its output.
/// Dropping it detaches the task, which keeps running.
pub struct Task<T> {
    state: Rc<RefCell<JoinState<T>>>,
}

impl<T> Task<T> {
    /// Whether the task has run to completion.
    pub fn is_finished(&self) -> bool {
        self.state.borrow().finished
    }

    /// Take the output if the task has finished and it hasn't been taken.
    pub(crate) fn try_take(&mut self) -> Option<T> {
        self.state.borrow_mut().output.take()
    }
}

impl<T> Future for Task<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        let mut state = self.state.borrow_mut();
        if let Some(output) = state.output.take() {
            return Poll::Ready(output);
        }
        if state.finished {
            panic!("task output already taken");
        }
        match &state.waiter {
            Some(waiter) if waiter.will_wake(cx.waker()) => {}
            _ => state.waiter = Some(cx.waker().clone()),
        }
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Suspends once, waking itself first.
    struct YieldOnce(bool);

    impl Future for YieldOnce {
        type Output = ();

        fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
            if self.0 {
                return Poll::Ready(());
            }
            self.0 = true;
            cx.waker().wake_by_ref();
            Poll::Pending
        }
    }

    #[test]
    fn test_spawn_runs_eagerly() {
        let executor = Executor::new();
        let ran = Rc::new(Cell::new(false));
        let flag = Rc::clone(&ran);

        let task = executor.spawn(async move {
            flag.set(true);
            7
        });

        assert!(ran.get());
        assert!(task.is_finished());
        assert_eq!(executor.len(), 0);
    }

    #[test]
    fn test_woken_task_runs_on_run_ready() {
        let executor = Executor::new();
        let steps = Rc::new(Cell::new(0));
        let counter = Rc::clone(&steps);

        let mut task = executor.spawn(async move {
            counter.set(1);
            YieldOnce(false).await;
            counter.set(2);
            "done"
        });

        assert_eq!(steps.get(), 1);
        assert!(!task.is_finished());
        assert!(!executor.is_idle());

        executor.run_ready();
        assert_eq!(steps.get(), 2);
        assert_eq!(task.try_take(), Some("done"));
        assert!(executor.is_idle());
    }

    #[test]
    fn test_awaiting_another_task() {
        let executor = Executor::new();
        let inner = executor.spawn(async {
            YieldOnce(false).await;
            21
        });
        let mut outer = executor.spawn(async move { inner.await * 2 });

        assert!(!outer.is_finished());
        executor.run_ready();
        assert_eq!(outer.try_take(), Some(42));
    }

    #[test]
    fn test_detached_task_keeps_running() {
        let executor = Executor::new();
        let steps = Rc::new(Cell::new(0));
        let counter = Rc::clone(&steps);

        drop(executor.spawn(async move {
            YieldOnce(false).await;
            counter.set(counter.get() + 1);
        }));
        executor.run_ready();
        assert_eq!(steps.get(), 1);
    }

    #[test]
    fn test_clear_drops_pending_tasks() {
        let executor = Executor::new();
        let marker = Rc::new(());
        let held = Rc::clone(&marker);

        let _task = executor.spawn(async move {
            let _held = held;
            std::future::pending::<()>().await;
        });
        assert_eq!(Rc::strong_count(&marker), 2);

        executor.clear();
        assert_eq!(Rc::strong_count(&marker), 1);
        assert_eq!(executor.len(), 0);
    }

    #[test]
    #[should_panic(expected = "task output already taken")]
    fn test_task_polled_after_output_taken_panics() {
        let executor = Executor::new();
        let mut task = executor.spawn(async { 1 });
        let mut cx = Context::from_waker(Waker::noop());

        assert_eq!(Pin::new(&mut task).poll(&mut cx), Poll::Ready(1));
        let _ = Pin::new(&mut task).poll(&mut cx);
    }
}
