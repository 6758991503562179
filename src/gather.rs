use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

use futures::FutureExt;
use tracing::trace;

use crate::event_loop::{HandleId, LoopContext};
use crate::CoroError;

/// Policy knobs for `gather`. By default a failing child does not disturb its
/// siblings: they run to completion and their outcomes are discarded.
#[derive(Debug, Clone, Copy, Default)]
pub struct GatherOptions {
    /// Cancel all remaining children as soon as the first failure is
    /// recorded.
    pub cancel_on_failure: bool,
}

pub struct GatherShared {
    remaining: usize,
    failure: Option<CoroError>,
    continuation: Option<HandleId>,
    children: Vec<HandleId>,
    cancel_on_failure: bool,
}

impl GatherShared {
    fn finished(&self) -> bool {
        self.remaining == 0 || self.failure.is_some()
    }

    fn child_done(&mut self) -> Option<HandleId> {
        self.remaining -= 1;
        self.wake_if_finished()
    }

    fn child_failed(&mut self, err: CoroError) -> (Option<HandleId>, Vec<HandleId>) {
        self.remaining -= 1;
        let mut cancels = Vec::new();
        if self.failure.is_none() {
            self.failure = Some(err);
            if self.cancel_on_failure {
                cancels = self.children.clone();
            }
        }
        (self.wake_if_finished(), cancels)
    }

    fn wake_if_finished(&mut self) -> Option<HandleId> {
        if self.finished() {
            self.continuation.take()
        } else {
            None
        }
    }
}

fn spawn_child<T, F>(
    ctx: &LoopContext,
    fut: F,
    slot: Rc<RefCell<Option<T>>>,
    shared: Rc<RefCell<GatherShared>>,
) where
    T: 'static,
    F: Future<Output = crate::Result<T>> + 'static,
{
    let state = shared.clone();
    let id = ctx.spawn(
        async move {
            match fut.await {
                Ok(value) => {
                    *slot.borrow_mut() = Some(value);
                    let wake = state.borrow_mut().child_done();
                    if let (Some(continuation), Some(ctx)) = (wake, LoopContext::try_current()) {
                        ctx.call_soon(continuation);
                    }
                    Ok(())
                }
                Err(err) => {
                    let propagated = err.clone();
                    let (wake, cancels) = state.borrow_mut().child_failed(err);
                    if let Some(ctx) = LoopContext::try_current() {
                        for child in cancels {
                            ctx.cancel(child);
                        }
                        if let Some(continuation) = wake {
                            ctx.call_soon(continuation);
                        }
                    }
                    Err(propagated)
                }
            }
        }
        .boxed_local(),
    );
    shared.borrow_mut().children.push(id);
}

/// Tuples of heterogeneous futures that `gather` can fan out over.
pub trait GatherList: Sized + 'static {
    type Output;
    type Slots;
    const LEN: usize;

    fn spawn(self, ctx: &LoopContext, shared: &Rc<RefCell<GatherShared>>) -> Self::Slots;
    fn collect(slots: &mut Self::Slots) -> Option<Self::Output>;
}

macro_rules! impl_gather_list {
    ($len:expr; $( $F:ident : $T:ident => $fut:ident / $slot:ident ),+) => {
        impl<$($T,)+ $($F,)+> GatherList for ($($F,)+)
        where
            $($T: 'static,)+
            $($F: Future<Output = crate::Result<$T>> + 'static,)+
        {
            type Output = ($($T,)+);
            type Slots = ($(Rc<RefCell<Option<$T>>>,)+);
            const LEN: usize = $len;

            fn spawn(self, ctx: &LoopContext, shared: &Rc<RefCell<GatherShared>>) -> Self::Slots {
                let ($($fut,)+) = self;
                $(
                    let $slot: Rc<RefCell<Option<$T>>> = Rc::new(RefCell::new(None));
                    spawn_child(ctx, $fut, $slot.clone(), shared.clone());
                )+
                ($($slot,)+)
            }

            fn collect(slots: &mut Self::Slots) -> Option<Self::Output> {
                let ($($slot,)+) = slots;
                Some(($($slot.borrow_mut().take()?,)+))
            }
        }
    };
}

impl_gather_list!(1; F1:T1 => f1/s1);
impl_gather_list!(2; F1:T1 => f1/s1, F2:T2 => f2/s2);
impl_gather_list!(3; F1:T1 => f1/s1, F2:T2 => f2/s2, F3:T3 => f3/s3);
impl_gather_list!(4; F1:T1 => f1/s1, F2:T2 => f2/s2, F3:T3 => f3/s3, F4:T4 => f4/s4);
impl_gather_list!(5; F1:T1 => f1/s1, F2:T2 => f2/s2, F3:T3 => f3/s3, F4:T4 => f4/s4,
    F5:T5 => f5/s5);
impl_gather_list!(6; F1:T1 => f1/s1, F2:T2 => f2/s2, F3:T3 => f3/s3, F4:T4 => f4/s4,
    F5:T5 => f5/s5, F6:T6 => f6/s6);
impl_gather_list!(7; F1:T1 => f1/s1, F2:T2 => f2/s2, F3:T3 => f3/s3, F4:T4 => f4/s4,
    F5:T5 => f5/s5, F6:T6 => f6/s6, F7:T7 => f7/s7);
impl_gather_list!(8; F1:T1 => f1/s1, F2:T2 => f2/s2, F3:T3 => f3/s3, F4:T4 => f4/s4,
    F5:T5 => f5/s5, F6:T6 => f6/s6, F7:T7 => f7/s7, F8:T8 => f8/s8);

/// Runs the given futures concurrently under one parent and yields the tuple
/// of their results in positional order, or re-raises the first failure.
/// Every input is wrapped in an eager-start child so all children begin
/// before any of them is awaited.
pub fn gather<L: GatherList>(futs: L) -> GatherFuture<L> {
    gather_with(GatherOptions::default(), futs)
}

pub fn gather_with<L: GatherList>(options: GatherOptions, futs: L) -> GatherFuture<L> {
    let shared = Rc::new(RefCell::new(GatherShared {
        remaining: L::LEN,
        failure: None,
        continuation: None,
        children: Vec::with_capacity(L::LEN),
        cancel_on_failure: options.cancel_on_failure,
    }));
    let mut fanout = GatherFuture {
        futs: Some(Box::new(futs)),
        slots: None,
        shared,
    };
    // eager start when a loop is already current; otherwise at first poll
    if let Some(ctx) = LoopContext::try_current() {
        fanout.start(&ctx);
    }
    fanout
}

pub struct GatherFuture<L: GatherList> {
    futs: Option<Box<L>>,
    slots: Option<L::Slots>,
    shared: Rc<RefCell<GatherShared>>,
}

impl<L: GatherList> GatherFuture<L> {
    fn start(&mut self, ctx: &LoopContext) {
        if let Some(futs) = self.futs.take() {
            trace!(children = L::LEN, "gather fan-out");
            self.slots = Some(futs.spawn(ctx, &self.shared));
        }
    }
}

impl<L: GatherList> Unpin for GatherFuture<L> {}

impl<L: GatherList> Future for GatherFuture<L> {
    type Output = crate::Result<L::Output>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let Some(ctx) = LoopContext::try_current() else {
            return Poll::Ready(Err(CoroError::InvalidState(
                "gather awaited outside of a running event loop",
            )));
        };
        let Some(me) = ctx.current_handle() else {
            return Poll::Ready(Err(CoroError::InvalidState(
                "gather awaited outside of a running event loop",
            )));
        };
        if ctx.take_cancel_request(me) {
            return Poll::Ready(Err(CoroError::Cancelled));
        }
        this.start(&ctx);

        if !this.shared.borrow().finished() {
            this.shared.borrow_mut().continuation = Some(me);
            return Poll::Pending;
        }
        if let Some(err) = this.shared.borrow().failure.clone() {
            return Poll::Ready(Err(err));
        }
        let Some(slots) = this.slots.as_mut() else {
            return Poll::Ready(Err(CoroError::InvalidState("gather has no children")));
        };
        match L::collect(slots) {
            Some(tuple) => Poll::Ready(Ok(tuple)),
            None => Poll::Ready(Err(CoroError::InvalidState(
                "gather result already consumed",
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop::{run, EventLoop};
    use crate::task::{schedule_task, Task};
    use crate::time::sleep;
    use std::cell::Cell;
    use std::rc::Rc;
    use std::time::Duration;

    fn value_after<T: 'static>(delay: Duration, value: T) -> impl Future<Output = crate::Result<T>> {
        async move {
            sleep(delay).await?;
            Ok(value)
        }
    }

    #[test]
    fn test_gather_keeps_positional_order() {
        let mut ev = EventLoop::new();
        let out = ev
            .run_until_complete(Task::new(async {
                gather((
                    value_after(Duration::from_millis(200), "slow"),
                    value_after(Duration::from_millis(100), "fast"),
                ))
                .await
            }))
            .unwrap();
        assert_eq!(out, ("slow", "fast"));
        assert_eq!(ev.time(), Duration::from_millis(200));
    }

    #[test]
    fn test_gather_mixes_result_types() {
        let out = run(Task::new(async {
            gather((
                value_after(Duration::from_millis(10), 42u32),
                value_after(Duration::from_millis(20), String::from("hello")),
                value_after(Duration::from_millis(5), vec![1u8, 2, 3]),
            ))
            .await
        }))
        .unwrap();
        assert_eq!(out, (42, String::from("hello"), vec![1, 2, 3]));
    }

    #[test]
    fn test_first_failure_wins_and_siblings_finish() {
        let sibling_done = Rc::new(Cell::new(false));
        let flag = sibling_done.clone();
        let out = run(Task::new(async move {
            let gathered = gather((
                async {
                    sleep(Duration::from_millis(50)).await?;
                    Err::<u32, _>(CoroError::failure("early"))
                },
                async move {
                    sleep(Duration::from_millis(100)).await?;
                    flag.set(true);
                    Ok(1u32)
                },
            ))
            .await;
            assert_eq!(gathered, Err(CoroError::failure("early")));
            // the sibling keeps running; its outcome is discarded
            sleep(Duration::from_millis(100)).await?;
            Ok(())
        }));
        assert_eq!(out, Ok(()));
        assert!(sibling_done.get());
    }

    #[test]
    fn test_earlier_failure_wins_over_later_ones() {
        let out = run(Task::new(async {
            let gathered = gather((
                async {
                    sleep(Duration::from_millis(50)).await?;
                    Err::<u32, _>(CoroError::failure("first"))
                },
                async {
                    sleep(Duration::from_millis(100)).await?;
                    Err::<u32, _>(CoroError::failure("second"))
                },
            ))
            .await;
            assert_eq!(gathered, Err(CoroError::failure("first")));
            // let the later failure land; it must stay discarded
            sleep(Duration::from_millis(100)).await?;
            Ok(())
        }));
        assert_eq!(out, Ok(()));
    }

    #[test]
    fn test_cancel_on_failure_stops_siblings() {
        let sibling_done = Rc::new(Cell::new(false));
        let flag = sibling_done.clone();
        let out = run(Task::new(async move {
            let gathered = gather_with(
                GatherOptions {
                    cancel_on_failure: true,
                },
                (
                    async {
                        sleep(Duration::from_millis(50)).await?;
                        Err::<u32, _>(CoroError::failure("early"))
                    },
                    async move {
                        sleep(Duration::from_millis(100)).await?;
                        flag.set(true);
                        Ok(1u32)
                    },
                ),
            )
            .await;
            assert_eq!(gathered, Err(CoroError::failure("early")));
            sleep(Duration::from_millis(150)).await?;
            Ok(())
        }));
        assert_eq!(out, Ok(()));
        assert!(!sibling_done.get());
    }

    #[test]
    fn test_gather_waits_for_slowest_child() {
        let mut ev = EventLoop::new();
        let out = ev
            .run_until_complete(Task::new(async {
                gather((
                    value_after(Duration::from_millis(100), 'a'),
                    value_after(Duration::from_millis(200), 'b'),
                ))
                .await
            }))
            .unwrap();
        assert_eq!(out, ('a', 'b'));
        assert!(ev.time() >= Duration::from_millis(200));
    }

    #[test]
    fn test_cancelling_one_child_keeps_captured_sibling_value() {
        let a_done = Rc::new(Cell::new(false));
        let flag = a_done.clone();
        let mut ev = EventLoop::new();
        let out = ev.run_until_complete(Task::new(async move {
            let a = schedule_task(Task::new(async move {
                sleep(Duration::from_millis(50)).await?;
                flag.set(true);
                Ok("a")
            }))?;
            let b = schedule_task(Task::new(async {
                sleep(Duration::from_millis(300)).await?;
                Ok("b")
            }))?;
            let token = b.cancel_token();
            let _watchdog = schedule_task(Task::new(async move {
                sleep(Duration::from_millis(100)).await?;
                token.cancel();
                Ok(())
            }))?;
            gather((a, b)).await
        }));
        assert_eq!(out, Err(CoroError::Cancelled));
        assert!(a_done.get());
        assert!(ev.time() < Duration::from_millis(300));
    }
}
