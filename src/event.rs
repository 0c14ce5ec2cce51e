//! Pool events and the handlers that receive them.

pub mod cmap;

use std::{fmt, sync::Arc};

use futures_core::future::BoxFuture;

use crate::runtime;

/// Where a component delivers its events.
///
/// Handlers are called synchronously from the code that emitted the event, so a callback must
/// not block. Async callbacks and channel sends each run on their own spawned task.
///
/// ```rust
/// # use mongodb_core::{event::{cmap::CmapEvent, EventHandler}, options::ConnectionPoolOptions};
/// # async fn example() {
/// let (tx, mut rx) = tokio::sync::mpsc::channel::<CmapEvent>(64);
/// let options = ConnectionPoolOptions::builder()
///     .event_handler(EventHandler::from(tx))
///     .build();
/// # let _ = (options, rx.recv());
/// # }
/// ```
#[derive(Clone)]
#[non_exhaustive]
pub enum EventHandler<T> {
    /// Called inline for every event.
    Callback(Arc<dyn Fn(T) + Send + Sync>),

    /// Called for every event; the returned future is spawned.
    AsyncCallback(Arc<dyn Fn(T) -> BoxFuture<'static, ()> + Send + Sync>),

    /// Every event is sent down the channel. Events are dropped once the receiver is gone.
    TokioMpsc(tokio::sync::mpsc::Sender<T>),
}

impl<T> fmt::Debug for EventHandler<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            Self::Callback(_) => "Callback",
            Self::AsyncCallback(_) => "AsyncCallback",
            Self::TokioMpsc(_) => "TokioMpsc",
        };
        f.debug_tuple("EventHandler").field(&kind).finish()
    }
}

impl<T> From<tokio::sync::mpsc::Sender<T>> for EventHandler<T> {
    fn from(sender: tokio::sync::mpsc::Sender<T>) -> Self {
        Self::TokioMpsc(sender)
    }
}

impl<T: Send + Sync + 'static> EventHandler<T> {
    /// A handler calling `f` inline.
    pub fn callback(f: impl Fn(T) + Send + Sync + 'static) -> Self {
        Self::Callback(Arc::new(f))
    }

    /// A handler spawning the future `f` returns.
    pub fn async_callback(f: impl Fn(T) -> BoxFuture<'static, ()> + Send + Sync + 'static) -> Self {
        Self::AsyncCallback(Arc::new(f))
    }

    pub(crate) fn handle(&self, event: T) {
        match self {
            Self::Callback(f) => f(event),
            Self::AsyncCallback(f) => {
                runtime::spawn(f(event));
            }
            Self::TokioMpsc(sender) => {
                let sender = sender.clone();
                runtime::spawn(async move { sender.send(event).await.ok() });
            }
        }
    }
}
