//! Panic isolation for handler futures that borrow their handler.
//!
//! Job handlers run on their own task, so a panic surfaces as a failed join.
//! Batch and stream handlers are driven inline on the caller's task; wrap
//! each call in [`catch_unwind`] to turn a panic into a per-record failure.

use std::any::Any;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::error::HandlerError;

/// Future returned by [`catch_unwind`].
#[must_use = "futures do nothing unless polled"]
pub struct CatchUnwind<F> {
    inner: Pin<Box<F>>,
}

impl<F> std::fmt::Debug for CatchUnwind<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CatchUnwind").finish_non_exhaustive()
    }
}

/// Poll `future` to completion, reporting a panic as a permanent
/// [`HandlerError`] instead of unwinding into the caller.
pub fn catch_unwind<F: Future>(future: F) -> CatchUnwind<F> {
    CatchUnwind {
        inner: Box::pin(future),
    }
}

impl<F: Future> Future for CatchUnwind<F> {
    type Output = Result<F::Output, HandlerError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let inner = self.inner.as_mut();
        match panic::catch_unwind(AssertUnwindSafe(|| inner.poll(cx))) {
            Ok(Poll::Pending) => Poll::Pending,
            Ok(Poll::Ready(output)) => Poll::Ready(Ok(output)),
            Err(payload) => Poll::Ready(Err(HandlerError::permanent(format!(
                "handler panicked: {}",
                panic_message(payload.as_ref())
            )))),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}
