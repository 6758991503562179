use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

use futures::FutureExt;

use crate::event_loop::{HandleId, HandleState, LoopContext, WeakContext};
use crate::result::ResultCell;
use crate::CoroError;

/// Whether a task begins running at construction or only once something
/// resumes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StartPolicy {
    #[default]
    Lazy,
    Eager,
}

/// The owning, user-facing wrapper around one suspendable computation and its
/// result. Lazy by default: nothing runs until the task is awaited or handed
/// to the loop. Movable, not copyable.
pub struct Task<T> {
    fut: Option<futures::future::LocalBoxFuture<'static, crate::Result<T>>>,
    cell: Rc<RefCell<ResultCell<T>>>,
    id: Option<HandleId>,
    loop_: Option<WeakContext>,
    cancelled: bool,
}

impl<T: 'static> Task<T> {
    pub fn new<F>(fut: F) -> Self
    where
        F: Future<Output = crate::Result<T>> + 'static,
    {
        Self::with_policy(fut, StartPolicy::Lazy)
    }

    pub fn with_policy<F>(fut: F, policy: StartPolicy) -> Self
    where
        F: Future<Output = crate::Result<T>> + 'static,
    {
        let mut task = Self {
            fut: Some(fut.boxed_local()),
            cell: Rc::new(RefCell::new(ResultCell::new())),
            id: None,
            loop_: None,
            cancelled: false,
        };
        if policy == StartPolicy::Eager {
            if let Some(ctx) = LoopContext::try_current() {
                task.ensure_started(&ctx);
            }
        }
        task
    }

    /// Requests termination. A task that never started becomes terminally
    /// cancelled on the spot; a running one observes the signal at its next
    /// suspension point. Cancelling a finished task is a no-op.
    pub fn cancel(&mut self) {
        match (self.id, &self.loop_) {
            (Some(id), Some(loop_)) => {
                if let Some(ctx) = loop_.upgrade() {
                    ctx.cancel(id);
                }
            }
            _ => {
                self.fut = None;
                self.cancelled = true;
            }
        }
    }

    fn ensure_started(&mut self, ctx: &LoopContext) {
        if self.id.is_some() || self.cancelled {
            return;
        }
        let Some(fut) = self.fut.take() else {
            return;
        };
        let cell = self.cell.clone();
        let runner = async move {
            match fut.await {
                Ok(value) => {
                    // the runner is the cell's only producer
                    let _ = cell.borrow_mut().set_value(value);
                    Ok(())
                }
                Err(err) => {
                    let _ = cell.borrow_mut().set_failure(err.clone());
                    Err(err)
                }
            }
        }
        .boxed_local();
        self.loop_ = Some(ctx.downgrade());
        self.id = Some(ctx.spawn(runner));
    }

    pub(crate) fn into_registered(
        mut self,
        ctx: &LoopContext,
    ) -> crate::Result<(HandleId, Rc<RefCell<ResultCell<T>>>)> {
        if self.cancelled {
            return Err(CoroError::Cancelled);
        }
        self.ensure_started(ctx);
        let id = self
            .id
            .take()
            .ok_or(CoroError::InvalidState("task has no computation"))?;
        Ok((id, self.cell.clone()))
    }

    pub(crate) fn schedule_on(self, ctx: &LoopContext) -> crate::Result<ScheduledTask<T>> {
        let loop_ = ctx.downgrade();
        let (id, cell) = self.into_registered(ctx)?;
        Ok(ScheduledTask { id, cell, loop_ })
    }
}

impl<T> Drop for Task<T> {
    fn drop(&mut self) {
        // a still-pending task loses its owner here; its handle must not
        // keep running detached
        if let (Some(id), Some(loop_)) = (self.id, &self.loop_) {
            if let Some(ctx) = loop_.upgrade() {
                ctx.cancel(id);
            }
        }
    }
}

fn poll_cell<T>(
    ctx: &LoopContext,
    me: HandleId,
    id: HandleId,
    cell: &Rc<RefCell<ResultCell<T>>>,
) -> Poll<crate::Result<T>> {
    {
        let mut cell = cell.borrow_mut();
        if !cell.is_empty() {
            return Poll::Ready(cell.take_result());
        }
    }
    match ctx.handle_state(id) {
        Some(HandleState::Cancelled) | None => Poll::Ready(Err(CoroError::Cancelled)),
        _ => {
            ctx.set_continuation(id, me);
            Poll::Pending
        }
    }
}

fn awaiting_context() -> crate::Result<(LoopContext, HandleId)> {
    let ctx = LoopContext::try_current().ok_or(CoroError::InvalidState(
        "task awaited outside of a running event loop",
    ))?;
    let me = ctx.current_handle().ok_or(CoroError::InvalidState(
        "task awaited outside of a running event loop",
    ))?;
    Ok((ctx, me))
}

impl<T: 'static> Future for Task<T> {
    type Output = crate::Result<T>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if this.cancelled {
            return Poll::Ready(Err(CoroError::Cancelled));
        }
        let (ctx, me) = match awaiting_context() {
            Ok(found) => found,
            Err(err) => return Poll::Ready(Err(err)),
        };
        if ctx.take_cancel_request(me) {
            return Poll::Ready(Err(CoroError::Cancelled));
        }
        this.ensure_started(&ctx);
        match this.id {
            Some(id) => poll_cell(&ctx, me, id, &this.cell),
            None => Poll::Ready(Err(CoroError::Cancelled)),
        }
    }
}

/// Lightweight cancellable reference to a detached task, returned by
/// `schedule_task`. Awaiting it yields the task's result; cancelling it does
/// not require owning the task.
pub struct ScheduledTask<T> {
    id: HandleId,
    cell: Rc<RefCell<ResultCell<T>>>,
    loop_: WeakContext,
}

impl<T> ScheduledTask<T> {
    pub fn cancel(&self) {
        if let Some(ctx) = self.loop_.upgrade() {
            ctx.cancel(self.id);
        }
    }

    /// A clonable token that stays usable after the scheduled task itself was
    /// moved, e.g. into `gather`.
    pub fn cancel_token(&self) -> CancelHandle {
        CancelHandle {
            id: self.id,
            loop_: self.loop_.clone(),
        }
    }
}

impl<T: 'static> Future for ScheduledTask<T> {
    type Output = crate::Result<T>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let (ctx, me) = match awaiting_context() {
            Ok(found) => found,
            Err(err) => return Poll::Ready(Err(err)),
        };
        if ctx.take_cancel_request(me) {
            return Poll::Ready(Err(CoroError::Cancelled));
        }
        poll_cell(&ctx, me, this.id, &this.cell)
    }
}

#[derive(Clone)]
pub struct CancelHandle {
    id: HandleId,
    loop_: WeakContext,
}

impl CancelHandle {
    pub fn cancel(&self) {
        if let Some(ctx) = self.loop_.upgrade() {
            ctx.cancel(self.id);
        }
    }
}

/// Detaches a task onto the running loop for independent, cancellable
/// execution, decoupling "run concurrently" from "own the result".
pub fn schedule_task<T: 'static>(task: Task<T>) -> crate::Result<ScheduledTask<T>> {
    let ctx = LoopContext::current()?;
    task.schedule_on(&ctx)
}
