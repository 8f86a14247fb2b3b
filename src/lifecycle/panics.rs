//! Panic containment.
//!
//! A panic caught at one of the server's recovery points (a pool task, a consumer
//! loop, a health predicate) is handled where it happened: the task fails, the stream
//! errors, the check reports unhealthy. Only panics that escape every recovery point
//! reach the fault funnel through [`install_panic_hook`].
//!
//! Containment is tracked per thread while a recovery point is polling, which is
//! exactly when the panic hook runs for a panic it is about to catch.

use futures::FutureExt;
use std::cell::Cell;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::task::{Context, Poll};

use super::{Fault, FaultSender};

thread_local! {
    static CONTAINED: Cell<usize> = const { Cell::new(0) };
}

struct Depth;

impl Depth {
    fn enter() -> Self {
        CONTAINED.with(|depth| depth.set(depth.get() + 1));
        Depth
    }
}

impl Drop for Depth {
    fn drop(&mut self) {
        CONTAINED.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

/// Whether the current thread is inside a recovery point
pub fn is_contained() -> bool {
    CONTAINED.with(|depth| depth.get() > 0)
}

struct Contained<F> {
    inner: Pin<Box<F>>,
}

impl<F: Future> Future for Contained<F> {
    type Output = F::Output;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<F::Output> {
        let _depth = Depth::enter();
        self.inner.as_mut().poll(cx)
    }
}

/// Drive `future` to completion, turning a panic into `Err` without raising a fault
pub async fn contain<F: Future>(future: F) -> std::thread::Result<F::Output> {
    AssertUnwindSafe(Contained {
        inner: Box::pin(future),
    })
    .catch_unwind()
    .await
}

/// Synchronous counterpart of [`contain`]
pub fn contain_sync<R>(f: impl FnOnce() -> R) -> std::thread::Result<R> {
    let _depth = Depth::enter();
    panic::catch_unwind(AssertUnwindSafe(f))
}

/// Report every uncontained panic as [`Fault::Panic`], then run the previous hook
pub fn install_panic_hook(faults: FaultSender) {
    let previous = panic::take_hook();
    panic::set_hook(Box::new(move |info| {
        if !is_contained() {
            let _ = faults.send(Fault::Panic {
                message: info.to_string(),
            });
        }
        previous(info);
    }));
}
