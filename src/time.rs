use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use crate::event_loop::LoopContext;
use crate::CoroError;

/// Suspends the calling computation until the loop clock reaches
/// `now + delay`. Cancellation while sleeping removes the timer and delivers
/// `Err(Cancelled)` immediately instead of waiting for the deadline.
pub fn sleep(delay: Duration) -> Sleep {
    Sleep {
        delay,
        deadline: None,
    }
}

pub struct Sleep {
    delay: Duration,
    deadline: Option<Duration>,
}

impl Future for Sleep {
    type Output = crate::Result<()>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let Some(ctx) = LoopContext::try_current() else {
            return Poll::Ready(Err(CoroError::InvalidState(
                "sleep awaited outside of a running event loop",
            )));
        };
        let Some(id) = ctx.current_handle() else {
            return Poll::Ready(Err(CoroError::InvalidState(
                "sleep awaited outside of a running event loop",
            )));
        };
        if ctx.take_cancel_request(id) {
            return Poll::Ready(Err(CoroError::Cancelled));
        }
        match this.deadline {
            None => {
                this.deadline = Some(ctx.time() + this.delay);
                if this.delay.is_zero() {
                    ctx.call_soon(id);
                } else {
                    ctx.call_later(this.delay, id);
                }
                Poll::Pending
            }
            Some(deadline) if ctx.time() >= deadline => Poll::Ready(Ok(())),
            Some(deadline) => {
                // woken early by something other than the timer; re-arm
                if !ctx.timer_armed(id) {
                    ctx.call_later(deadline.saturating_sub(ctx.time()), id);
                }
                Poll::Pending
            }
        }
    }
}

/// Reschedules the calling computation to the back of the ready queue once,
/// letting everything already ready run first.
pub fn yield_now() -> YieldNow {
    YieldNow { yielded: false }
}

pub struct YieldNow {
    yielded: bool,
}

impl Future for YieldNow {
    type Output = crate::Result<()>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let Some(ctx) = LoopContext::try_current() else {
            return Poll::Ready(Err(CoroError::InvalidState(
                "yield_now awaited outside of a running event loop",
            )));
        };
        let Some(id) = ctx.current_handle() else {
            return Poll::Ready(Err(CoroError::InvalidState(
                "yield_now awaited outside of a running event loop",
            )));
        };
        if ctx.take_cancel_request(id) {
            return Poll::Ready(Err(CoroError::Cancelled));
        }
        if this.yielded {
            Poll::Ready(Ok(()))
        } else {
            this.yielded = true;
            ctx.call_soon(id);
            Poll::Pending
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop::{run, EventLoop};
    use crate::task::Task;

    #[test]
    fn test_sequential_sleeps_accumulate_on_the_clock() {
        let mut ev = EventLoop::new();
        ev.run_until_complete(Task::new(async {
            sleep(Duration::from_millis(100)).await?;
            sleep(Duration::from_millis(50)).await?;
            Ok(())
        }))
        .unwrap();
        assert_eq!(ev.time(), Duration::from_millis(150));
    }

    #[test]
    fn test_zero_sleep_completes_without_advancing_clock() {
        let mut ev = EventLoop::new();
        ev.run_until_complete(Task::new(async {
            sleep(Duration::ZERO).await?;
            Ok(())
        }))
        .unwrap();
        assert_eq!(ev.time(), Duration::ZERO);
    }

    #[test]
    fn test_yield_now_completes() {
        assert_eq!(run(Task::new(async { yield_now().await })), Ok(()));
    }

    #[test]
    fn test_sleep_outside_loop_fails() {
        let out = futures::executor::block_on(sleep(Duration::from_millis(1)));
        assert_eq!(
            out,
            Err(CoroError::InvalidState(
                "sleep awaited outside of a running event loop"
            ))
        );
    }
}
