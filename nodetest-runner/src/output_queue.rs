// Copyright (c) The nodetest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! An ordering queue for reporter callbacks.
//!
//! Some callbacks need a value that is computed asynchronously (typically a source-mapped
//! location) but must still be delivered in the order their events arrived. [`OutputQueue`]
//! holds callbacks until every earlier callback has run, while letting the values they wait on
//! resolve concurrently.

use futures::future::{BoxFuture, FutureExt};
use std::{
    collections::VecDeque,
    fmt,
    future::{Future, poll_fn},
    task::{Context, Poll},
};

type Action<S> = Box<dyn FnOnce(&mut S) + Send>;

/// A value that is either available now or will be at some point.
pub enum Deferred<T> {
    /// The value is available.
    Ready(T),

    /// The value is being computed.
    Pending(BoxFuture<'static, T>),
}

impl<T: Send + 'static> Deferred<T> {
    /// Starts computing a value in the background.
    ///
    /// The future is spawned onto the current tokio runtime right away, so it makes progress
    /// even while it waits for its turn in a queue.
    pub fn spawn(future: impl Future<Output = T> + Send + 'static) -> Self {
        let handle = tokio::spawn(future);
        Self::Pending(
            async move {
                match handle.await {
                    Ok(value) => value,
                    Err(error) if error.is_panic() => std::panic::resume_unwind(error.into_panic()),
                    // The runtime is shutting down; there's nothing left to deliver to.
                    Err(_) => futures::future::pending().await,
                }
            }
            .boxed(),
        )
    }
}

impl<T> fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready(_) => f.write_str("Deferred::Ready"),
            Self::Pending(_) => f.write_str("Deferred::Pending"),
        }
    }
}

enum Item<S> {
    Ready(Action<S>),
    Waiting(BoxFuture<'static, Action<S>>),
}

/// Runs callbacks against a sink `S` in strict enqueue order.
pub struct OutputQueue<S> {
    items: VecDeque<Item<S>>,
}

impl<S: 'static> OutputQueue<S> {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self {
            items: VecDeque::new(),
        }
    }

    /// Returns true if nothing is waiting to run.
    pub fn is_idle(&self) -> bool {
        self.items.is_empty()
    }

    /// Returns the number of callbacks waiting to run.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Runs `f` now if the queue is idle, and otherwise after everything enqueued before it.
    pub fn enqueue(&mut self, sink: &mut S, f: impl FnOnce(&mut S) + Send + 'static) {
        if self.is_idle() {
            f(sink);
        } else {
            self.items.push_back(Item::Ready(Box::new(f)));
        }
    }

    /// Runs `f` with `value` once the value is available and everything enqueued before it has
    /// run.
    pub fn enqueue_deferred<T: Send + 'static>(
        &mut self,
        sink: &mut S,
        value: Deferred<T>,
        f: impl FnOnce(&mut S, T) + Send + 'static,
    ) {
        match value {
            Deferred::Ready(value) => self.enqueue(sink, move |sink| f(sink, value)),
            Deferred::Pending(future) => {
                let action = async move {
                    let value = future.await;
                    Box::new(move |sink: &mut S| f(sink, value)) as Action<S>
                };
                self.items.push_back(Item::Waiting(action.boxed()));
            }
        }
    }

    /// Runs queued callbacks in order, waiting for deferred values as needed. Completes once the
    /// queue is empty.
    ///
    /// This future is cancel-safe: callbacks that haven't run yet stay queued.
    pub async fn advance(&mut self, sink: &mut S) {
        poll_fn(|cx| self.poll_advance(cx, sink)).await
    }

    /// Runs every queued callback. Unlike [`Self::advance`], this is meant to be awaited to
    /// completion at the end of a run.
    pub async fn drain(&mut self, sink: &mut S) {
        self.advance(sink).await
    }

    fn poll_advance(&mut self, cx: &mut Context<'_>, sink: &mut S) -> Poll<()> {
        while let Some(item) = self.items.pop_front() {
            let action = match item {
                Item::Ready(action) => action,
                Item::Waiting(mut future) => match future.poll_unpin(cx) {
                    Poll::Ready(action) => action,
                    Poll::Pending => {
                        self.items.push_front(Item::Waiting(future));
                        return Poll::Pending;
                    }
                },
            };
            action(sink);
        }
        Poll::Ready(())
    }
}

impl<S: 'static> Default for OutputQueue<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> fmt::Debug for OutputQueue<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputQueue")
            .field("len", &self.items.len())
            .finish()
    }
}
