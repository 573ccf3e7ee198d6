//! Coalescing of concurrent requests for the same key.

use std::{
    collections::HashMap,
    fmt,
    future::Future,
    hash::Hash,
    pin::Pin,
    sync::{Arc, Weak},
};

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::broadcast::{self, error::RecvError};

/// A boxed, sendable future.
pub type BoxFut<'f, O> = Pin<Box<dyn Future<Output = O> + Send + 'f>>;

type Inflight<K, V> = HashMap<K, Weak<broadcast::Sender<V>>>;

/// Waits for the result of an in-flight request.
pub struct Handle<T> {
    fut: BoxFut<'static, Result<T, RecvError>>,
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle").finish()
    }
}

impl<T> Future for Handle<T> {
    type Output = Result<T, RecvError>;

    fn poll(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Self::Output> {
        self.fut.poll_unpin(cx)
    }
}

impl<T> Handle<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn new(mut reciever: broadcast::Receiver<T>) -> Self {
        Self {
            fut: Box::pin(async move { reciever.recv().await }),
        }
    }
}

/// Ensures that only one request per key is running at a time. Callers
/// that arrive while a request is in flight wait for its result instead of
/// starting their own.
///
/// The request runs on its own task, so it completes even if the caller
/// that started it goes away.
pub struct Coalesce<K, V> {
    inflight: Arc<Mutex<Inflight<K, V>>>,
}

impl<K, V> fmt::Debug for Coalesce<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coalesce")
            .field("inflight", &self.inflight.lock().len())
            .finish()
    }
}

impl<K, V> Clone for Coalesce<K, V> {
    fn clone(&self) -> Self {
        Self {
            inflight: Arc::clone(&self.inflight),
        }
    }
}

impl<K, V> Default for Coalesce<K, V> {
    fn default() -> Self {
        Self {
            inflight: Default::default(),
        }
    }
}

impl<K, V> Coalesce<K, V>
where
    K: Hash + Eq + Clone + Send + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Create an empty coalescer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a handle to the one-and-only inflight request for `key`,
    /// starting it with `f` if there is none.
    pub fn handle<F>(&self, key: K, f: F) -> Handle<V>
    where
        F: FnOnce() -> BoxFut<'static, V>,
    {
        // We must take the lock at this point to prevent another thread
        // from starting this request simultaneously.
        let mut inflight = self.inflight.lock();
        if let Some(tx) = inflight.get(&key).and_then(Weak::upgrade) {
            tracing::trace!("Found inflight request");
            return Handle::new(tx.subscribe());
        }

        let (tx, rx) = broadcast::channel::<V>(1);
        let tx = Arc::new(tx);
        inflight.insert(key.clone(), Arc::downgrade(&tx));

        let fut = (f)();
        let map = Arc::clone(&self.inflight);
        tracing::trace!("Launching new request");
        tokio::spawn(async move {
            let res = fut.await;
            {
                // Hold the lock while sending, so that no caller subscribes
                // after the send and waits forever.
                let mut inflight = map.lock();
                if inflight
                    .get(&key)
                    .is_some_and(|current| current.as_ptr() == Arc::as_ptr(&tx))
                {
                    inflight.remove(&key);
                }
                let _ = tx.send(res);
            }
        });

        Handle::new(rx)
    }

    /// Run `f` for `key`, or join the request already running for it.
    ///
    /// Errors only if the request task ended without producing a value.
    pub async fn get<F>(&self, key: K, f: F) -> Result<V, RecvError>
    where
        F: FnOnce() -> BoxFut<'static, V>,
    {
        self.handle(key, f).await
    }

    /// Number of keys with a request in flight.
    pub fn inflight(&self) -> usize {
        self.inflight
            .lock()
            .values()
            .filter(|tx| tx.strong_count() > 0)
            .count()
    }
}
