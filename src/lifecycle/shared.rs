//! Lazily constructed resource shared by every startup step that needs it.
//!
//! The first caller runs the constructor; concurrent callers wait on the same
//! initialization and every later caller gets the same `Arc`. Closing hands the
//! resource out exactly once.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::OnceCell;

use crate::error::{Result, ServerError};

pub struct Shared<T> {
    name: &'static str,
    cell: OnceCell<Arc<T>>,
    constructions: AtomicUsize,
    closed: AtomicBool,
}

impl<T> Shared<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            cell: OnceCell::new(),
            constructions: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Return the resource, constructing it on first use
    pub async fn get_or_try_init<F, Fut>(&self, init: F) -> Result<Arc<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if self.closed.load(Ordering::Acquire) {
            return Err(ServerError::InvalidState(format!(
                "{} has already been closed",
                self.name
            )));
        }

        let value = self
            .cell
            .get_or_try_init(|| async {
                let value = init().await?;
                self.constructions.fetch_add(1, Ordering::AcqRel);
                Ok::<_, ServerError>(Arc::new(value))
            })
            .await?;
        Ok(value.clone())
    }

    pub fn get(&self) -> Option<Arc<T>> {
        self.cell.get().cloned()
    }

    /// Successful constructions so far; never more than one
    pub fn constructions(&self) -> usize {
        self.constructions.load(Ordering::Acquire)
    }

    /// The resource to close, returned to the first caller only.
    /// `None` if it was never constructed or was already taken.
    pub fn take_for_close(&self) -> Option<Arc<T>> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return None;
        }
        self.cell.get().cloned()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
