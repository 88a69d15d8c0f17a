//! Single-threaded task dispatcher
//!
//! All client state lives on one named thread. Public calls and transport
//! events are posted to it as closures, so state is never touched concurrently.

use crate::error::{GattError, GattResult};
use log::{debug, error, trace};
use std::thread::{self, JoinHandle, ThreadId};
use tokio::sync::{mpsc, oneshot};

type Task<S> = Box<dyn FnOnce(&mut S) + Send>;

enum Message<S> {
    Task(Task<S>),
    Shutdown,
}

/// Cloneable handle for posting work to a [`Dispatcher`]
pub struct DispatchHandle<S> {
    tx: mpsc::UnboundedSender<Message<S>>,
    thread_id: ThreadId,
}

impl<S> Clone for DispatchHandle<S> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            thread_id: self.thread_id,
        }
    }
}

impl<S: 'static> DispatchHandle<S> {
    /// Queue `task` without waiting for it.
    pub fn post<F>(&self, task: F) -> GattResult<()>
    where
        F: FnOnce(&mut S) + Send + 'static,
    {
        self.tx
            .send(Message::Task(Box::new(task)))
            .map_err(|_| GattError::DispatcherStopped)
    }

    /// Run `task` on the dispatcher thread and wait for its result.
    ///
    /// Fails with [`GattError::Reentrant`] when called from the dispatcher
    /// thread itself, which would otherwise deadlock.
    pub fn call<F, R>(&self, task: F) -> GattResult<R>
    where
        F: FnOnce(&mut S) -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.is_dispatcher_thread() {
            return Err(GattError::Reentrant);
        }
        let (tx, rx) = oneshot::channel();
        self.post(move |state| {
            let _ = tx.send(task(state));
        })?;
        rx.blocking_recv().map_err(|_| GattError::DispatcherStopped)
    }

    pub fn is_dispatcher_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }
}

/// Owner of the dispatcher thread. Dropping it stops the thread.
pub struct Dispatcher<S> {
    handle: DispatchHandle<S>,
    thread: Option<JoinHandle<()>>,
}

impl<S: Send + 'static> Dispatcher<S> {
    /// Start a thread named `name` that owns `state`.
    pub fn spawn(name: &str, mut state: S) -> GattResult<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Message<S>>();
        let thread = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                while let Some(message) = rx.blocking_recv() {
                    match message {
                        Message::Task(task) => task(&mut state),
                        Message::Shutdown => break,
                    }
                }
                trace!("Dispatcher loop finished");
            })
            .map_err(|e| {
                error!("Failed to start dispatcher thread {}: {}", name, e);
                GattError::DispatcherStopped
            })?;
        debug!("Dispatcher thread {} started", name);

        Ok(Self {
            handle: DispatchHandle {
                tx,
                thread_id: thread.thread().id(),
            },
            thread: Some(thread),
        })
    }
}

impl<S> Dispatcher<S> {
    pub fn handle(&self) -> &DispatchHandle<S> {
        &self.handle
    }
}

impl<S> Drop for Dispatcher<S> {
    fn drop(&mut self) {
        let _ = self.handle.tx.send(Message::Shutdown);
        if let Some(thread) = self.thread.take() {
            // Joining from the loop itself would never return.
            if thread.thread().id() != thread::current().id() && thread.join().is_err() {
                error!("Dispatcher thread panicked");
            }
        }
    }
}
