use std::cell::RefCell;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::rc::{Rc, Weak};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Wake, Waker};
use std::time::Duration;

use futures::future::LocalBoxFuture;
use tracing::{debug, trace};

use crate::task::Task;
use crate::{CoroError, Result};

/// Identifier of one resumable handle. Ids are allocated monotonically and
/// never reused, so a stale id held by a continuation link or a queue entry
/// is skipped instead of dereferencing freed state.
pub type HandleId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    Created,
    Pending,
    Cancelled,
    Done,
    Failed,
}

impl HandleState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            HandleState::Cancelled | HandleState::Done | HandleState::Failed
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Queued {
    No,
    Ready,
    Timer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resume {
    Suspended,
    Finished,
    Cancelled,
    Failed,
}

pub(crate) type Runner = LocalBoxFuture<'static, Result<()>>;

struct HandleSlot {
    state: HandleState,
    runner: Option<Runner>,
    continuation: Option<HandleId>,
    cancel_requested: bool,
    queued: Queued,
    timer_seq: Option<u64>,
}

#[derive(Debug, Clone, Copy)]
struct TimerEntry {
    deadline: Duration,
    seq: u64,
    id: HandleId,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.deadline
            .cmp(&other.deadline)
            .then(self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

struct WakeEntry {
    id: HandleId,
    queue: Arc<Mutex<Vec<HandleId>>>,
}

impl WakeEntry {
    fn push(&self) {
        match self.queue.lock() {
            Ok(mut queue) => queue.push(self.id),
            Err(poisoned) => poisoned.into_inner().push(self.id),
        }
    }
}

impl Wake for WakeEntry {
    fn wake(self: Arc<Self>) {
        self.push();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.push();
    }
}

pub(crate) struct LoopInner {
    ready: VecDeque<HandleId>,
    timers: BinaryHeap<Reverse<TimerEntry>>,
    handles: HashMap<HandleId, HandleSlot>,
    now: Duration,
    next_id: HandleId,
    next_seq: u64,
    current: Option<HandleId>,
    woken: Arc<Mutex<Vec<HandleId>>>,
}

impl LoopInner {
    fn new() -> Self {
        Self {
            ready: VecDeque::new(),
            timers: BinaryHeap::new(),
            handles: HashMap::new(),
            now: Duration::ZERO,
            next_id: 0,
            next_seq: 0,
            current: None,
            woken: Arc::new(Mutex::new(Vec::new())),
        }
    }

    // id and seq counters keep counting so references from a previous run
    // stay stale
    fn reset(&mut self) {
        self.ready.clear();
        self.timers.clear();
        self.handles.clear();
        self.now = Duration::ZERO;
        self.current = None;
        self.woken = Arc::new(Mutex::new(Vec::new()));
    }

    fn alloc(&mut self, runner: Runner) -> HandleId {
        let id = self.next_id;
        self.next_id += 1;
        self.handles.insert(
            id,
            HandleSlot {
                state: HandleState::Created,
                runner: Some(runner),
                continuation: None,
                cancel_requested: false,
                queued: Queued::No,
                timer_seq: None,
            },
        );
        id
    }

    fn call_soon(&mut self, id: HandleId) {
        let Some(slot) = self.handles.get_mut(&id) else {
            return;
        };
        if slot.state.is_terminal() || slot.queued == Queued::Ready {
            return;
        }
        if slot.queued == Queued::Timer {
            // a handle lives in at most one queue; the timer entry goes stale
            slot.timer_seq = None;
        }
        slot.queued = Queued::Ready;
        self.ready.push_back(id);
    }

    fn call_later(&mut self, delay: Duration, id: HandleId) {
        let Some(slot) = self.handles.get_mut(&id) else {
            return;
        };
        if slot.state.is_terminal() || slot.queued == Queued::Ready {
            return;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        slot.queued = Queued::Timer;
        slot.timer_seq = Some(seq);
        self.timers.push(Reverse(TimerEntry {
            deadline: self.now + delay,
            seq,
            id,
        }));
    }

    // fast-forward the clock to the nearest live deadline and move due
    // handles to the ready queue; stale entries are discarded on the way
    fn advance_timers(&mut self) {
        loop {
            let head = match self.timers.peek() {
                Some(Reverse(entry)) => *entry,
                None => return,
            };
            let live = self
                .handles
                .get(&head.id)
                .map_or(false, |slot| slot.timer_seq == Some(head.seq));
            if !live {
                self.timers.pop();
                continue;
            }
            if head.deadline > self.now {
                trace!(from = ?self.now, to = ?head.deadline, "advancing clock");
                self.now = head.deadline;
            }
            break;
        }
        while let Some(Reverse(head)) = self.timers.peek().copied() {
            if head.deadline > self.now {
                break;
            }
            self.timers.pop();
            let Some(slot) = self.handles.get_mut(&head.id) else {
                continue;
            };
            if slot.timer_seq != Some(head.seq) {
                continue;
            }
            slot.timer_seq = None;
            slot.queued = Queued::Ready;
            self.ready.push_back(head.id);
        }
    }
}

thread_local! {
    static CURRENT: RefCell<Option<LoopContext>> = RefCell::new(None);
}

/// Cheap-clone reference to one event loop, installed in task-local storage
/// for the duration of a single `run_until_complete` call. Awaitables and the
/// out-of-tree I/O layer reach the scheduler through this, never through an
/// ambient global.
#[derive(Clone)]
pub struct LoopContext {
    inner: Rc<RefCell<LoopInner>>,
}

#[derive(Clone)]
pub(crate) struct WeakContext {
    inner: Weak<RefCell<LoopInner>>,
}

impl WeakContext {
    pub(crate) fn upgrade(&self) -> Option<LoopContext> {
        self.inner.upgrade().map(|inner| LoopContext { inner })
    }
}

impl LoopContext {
    fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(LoopInner::new())),
        }
    }

    /// The loop currently running on this thread.
    pub fn current() -> Result<Self> {
        Self::try_current().ok_or(CoroError::InvalidState(
            "no event loop is running on this thread",
        ))
    }

    pub(crate) fn try_current() -> Option<Self> {
        CURRENT.with(|current| current.borrow().clone())
    }

    pub(crate) fn downgrade(&self) -> WeakContext {
        WeakContext {
            inner: Rc::downgrade(&self.inner),
        }
    }

    /// Monotonic loop clock. Starts at zero and advances when the loop
    /// fast-forwards to a timer deadline.
    pub fn time(&self) -> Duration {
        self.inner.borrow().now
    }

    /// Appends a handle to the ready queue for the next tick.
    pub fn call_soon(&self, id: HandleId) {
        self.inner.borrow_mut().call_soon(id);
    }

    /// Defers a handle until `time() + delay`. Timers fire in deadline order,
    /// ties broken by insertion order.
    pub fn call_later(&self, delay: Duration, id: HandleId) {
        self.inner.borrow_mut().call_later(delay, id);
    }

    /// The handle being resumed right now, if any.
    pub fn current_handle(&self) -> Option<HandleId> {
        self.inner.borrow().current
    }

    pub(crate) fn handle_state(&self, id: HandleId) -> Option<HandleState> {
        self.inner.borrow().handles.get(&id).map(|slot| slot.state)
    }

    pub(crate) fn set_continuation(&self, id: HandleId, continuation: HandleId) {
        let mut inner = self.inner.borrow_mut();
        if let Some(slot) = inner.handles.get_mut(&id) {
            if !slot.state.is_terminal() {
                slot.continuation = Some(continuation);
            }
        }
    }

    // each cancel delivers at most one signal
    pub(crate) fn take_cancel_request(&self, id: HandleId) -> bool {
        let mut inner = self.inner.borrow_mut();
        match inner.handles.get_mut(&id) {
            Some(slot) if slot.cancel_requested => {
                slot.cancel_requested = false;
                true
            }
            _ => false,
        }
    }

    pub(crate) fn timer_armed(&self, id: HandleId) -> bool {
        self.inner
            .borrow()
            .handles
            .get(&id)
            .map_or(false, |slot| slot.queued == Queued::Timer)
    }

    pub(crate) fn spawn(&self, runner: Runner) -> HandleId {
        let mut inner = self.inner.borrow_mut();
        let id = inner.alloc(runner);
        inner.call_soon(id);
        trace!(id, "handle spawned");
        id
    }

    /// Requests cancellation of a handle. Never-started handles become
    /// terminal immediately; sleeping handles are pulled off the timer queue
    /// and resumed promptly; otherwise the signal is delivered cooperatively
    /// at the next suspension point. Terminal handles are left alone.
    pub fn cancel(&self, id: HandleId) {
        let mut dropped: Option<Runner> = None;
        {
            let mut inner = self.inner.borrow_mut();
            let mut wake: Option<HandleId> = None;
            let mut self_wake = false;
            {
                let Some(slot) = inner.handles.get_mut(&id) else {
                    return;
                };
                match slot.state {
                    HandleState::Done | HandleState::Failed | HandleState::Cancelled => return,
                    HandleState::Created => {
                        debug!(id, "cancelling handle before first resume");
                        dropped = slot.runner.take();
                        slot.state = HandleState::Cancelled;
                        slot.timer_seq = None;
                        slot.queued = Queued::No;
                        wake = slot.continuation.take();
                    }
                    HandleState::Pending => {
                        debug!(id, "requesting cooperative cancellation");
                        slot.cancel_requested = true;
                        match slot.queued {
                            Queued::Timer => {
                                slot.timer_seq = None;
                                slot.queued = Queued::No;
                                self_wake = true;
                            }
                            Queued::No => self_wake = true,
                            Queued::Ready => {}
                        }
                    }
                }
            }
            if let Some(continuation) = wake {
                inner.call_soon(continuation);
            }
            if self_wake {
                inner.call_soon(id);
            }
        }
        // the dropped frame may own tasks whose drop re-enters the loop
        drop(dropped);
    }

    fn waker_for(&self, id: HandleId) -> Waker {
        let queue = self.inner.borrow().woken.clone();
        Waker::from(Arc::new(WakeEntry { id, queue }))
    }

    // polls one handle once; a completed handle's continuation goes through
    // call_soon, never an inline resume
    fn resume(&self, id: HandleId) {
        let mut runner = {
            let mut inner = self.inner.borrow_mut();
            let Some(slot) = inner.handles.get_mut(&id) else {
                trace!(id, "skipping stale ready entry");
                return;
            };
            slot.queued = Queued::No;
            if slot.state.is_terminal() {
                trace!(id, state = ?slot.state, "skipping resume of terminal handle");
                return;
            }
            let Some(runner) = slot.runner.take() else {
                return;
            };
            inner.current = Some(id);
            Some(runner)
        };

        let waker = self.waker_for(id);
        let mut cx = Context::from_waker(&waker);
        let poll = match runner.as_mut() {
            Some(runner) => runner.as_mut().poll(&mut cx),
            None => return,
        };

        let continuation = {
            let mut inner = self.inner.borrow_mut();
            inner.current = None;
            let Some(slot) = inner.handles.get_mut(&id) else {
                return;
            };
            let outcome = match poll {
                Poll::Pending => {
                    if slot.state == HandleState::Cancelled {
                        // cancelled from within its own resume; drop the frame
                        Resume::Cancelled
                    } else {
                        slot.runner = runner.take();
                        slot.state = HandleState::Pending;
                        Resume::Suspended
                    }
                }
                Poll::Ready(Ok(())) => {
                    slot.state = HandleState::Done;
                    Resume::Finished
                }
                Poll::Ready(Err(CoroError::Cancelled)) => {
                    slot.state = HandleState::Cancelled;
                    Resume::Cancelled
                }
                Poll::Ready(Err(_)) => {
                    slot.state = HandleState::Failed;
                    Resume::Failed
                }
            };
            trace!(id, ?outcome, "handle resumed");
            if outcome == Resume::Suspended {
                None
            } else {
                slot.continuation.take()
            }
        };
        if let Some(continuation) = continuation {
            self.inner.borrow_mut().call_soon(continuation);
        }
        // leftover runner (if any) drops here, after the loop borrow ended
    }

    fn drain_woken(&self) {
        let ids: Vec<HandleId> = {
            let inner = self.inner.borrow();
            let mut queue = match inner.woken.lock() {
                Ok(queue) => queue,
                Err(poisoned) => poisoned.into_inner(),
            };
            std::mem::take(&mut *queue)
        };
        if ids.is_empty() {
            return;
        }
        let mut inner = self.inner.borrow_mut();
        for id in ids {
            inner.call_soon(id);
        }
    }

    // one tick resumes the batch that was ready at tick start; work scheduled
    // during the tick runs on the next one
    fn tick(&self) {
        self.drain_woken();
        let batch = self.inner.borrow().ready.len();
        for _ in 0..batch {
            let id = self.inner.borrow_mut().ready.pop_front();
            let Some(id) = id else {
                break;
            };
            self.resume(id);
        }
        let mut inner = self.inner.borrow_mut();
        if inner.ready.is_empty() {
            inner.advance_timers();
        }
    }

    fn has_work(&self) -> bool {
        let inner = self.inner.borrow();
        if !inner.ready.is_empty() || !inner.timers.is_empty() {
            return true;
        }
        let woken = match inner.woken.lock() {
            Ok(queue) => !queue.is_empty(),
            Err(poisoned) => !poisoned.into_inner().is_empty(),
        };
        woken
    }
}

struct ContextGuard;

impl ContextGuard {
    fn install(ctx: LoopContext) -> Result<Self> {
        CURRENT.with(|current| {
            let mut current = current.borrow_mut();
            if current.is_some() {
                return Err(CoroError::InvalidState(
                    "an event loop is already running on this thread",
                ));
            }
            *current = Some(ctx);
            Ok(ContextGuard)
        })
    }
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        CURRENT.with(|current| current.borrow_mut().take());
    }
}

/// Single-threaded cooperative scheduler: a FIFO ready queue, a
/// deadline-ordered timer queue and a monotonic virtual clock, driven until a
/// root task completes.
pub struct EventLoop {
    ctx: LoopContext,
}

impl EventLoop {
    pub fn new() -> Self {
        Self {
            ctx: LoopContext::new(),
        }
    }

    pub fn time(&self) -> Duration {
        self.ctx.time()
    }

    /// Drives the loop until `task` reaches a terminal state, then returns
    /// its value or re-raises its failure. The current tick is drained before
    /// returning; unrelated still-pending handles are abandoned. Each run
    /// starts from a fresh clock and empty queues.
    pub fn run_until_complete<T: 'static>(&mut self, task: Task<T>) -> Result<T> {
        let guard = ContextGuard::install(self.ctx.clone())?;
        self.ctx.inner.borrow_mut().reset();
        let (root, cell) = task.into_registered(&self.ctx)?;
        debug!(root, "event loop started");
        loop {
            self.ctx.tick();
            match self.ctx.handle_state(root) {
                Some(state) if !state.is_terminal() => {}
                _ => break,
            }
            if !self.ctx.has_work() {
                return Err(CoroError::InvalidState(
                    "event loop ran out of work before the root task completed",
                ));
            }
        }
        drop(guard);
        debug!(root, elapsed = ?self.ctx.time(), "event loop finished");
        let mut cell = cell.borrow_mut();
        if cell.is_empty() {
            // cancelled before it could record anything
            return Err(CoroError::Cancelled);
        }
        cell.take_result()
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs a root task on a fresh event loop and returns its result.
pub fn run<T: 'static>(task: Task<T>) -> Result<T> {
    EventLoop::new().run_until_complete(task)
}
