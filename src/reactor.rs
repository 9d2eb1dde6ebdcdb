use std::future::Future;
use std::io;
use std::time::Duration;

use tokio::runtime::{Builder, Handle, Runtime};
use tokio::task::JoinHandle;
use tracing::instrument::WithSubscriber;
use tracing::Dispatch;

use crate::{Error, Result};

const DEFAULT_WORKER_THREADS: usize = 2;

/// Worker threads driving every asynchronous connection and timer of a client.
///
/// Components only keep a [`ReactorHandle`]. Dropping the reactor stops the runtime and with it
/// every background task, so it must be dropped outside of an async context.
pub struct Reactor {
    runtime: Runtime,
    handle: ReactorHandle,
}

impl Reactor {
    pub fn new() -> io::Result<Reactor> {
        Reactor::with_worker_threads(DEFAULT_WORKER_THREADS)
    }

    pub fn with_worker_threads(worker_threads: usize) -> io::Result<Reactor> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(worker_threads.max(1))
            .thread_name("rustdis-reactor")
            .enable_all()
            .build()?;
        let handle = ReactorHandle {
            handle: runtime.handle().clone(),
            dispatch: None,
        };
        Ok(Reactor { runtime, handle })
    }

    /// Route the logs of every task spawned through this reactor to `dispatch` instead of the
    /// process wide subscriber.
    pub fn with_dispatch(mut self, dispatch: Dispatch) -> Reactor {
        self.handle.dispatch = Some(dispatch);
        self
    }

    pub fn handle(&self) -> ReactorHandle {
        self.handle.clone()
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }
}

#[derive(Clone, Debug)]
pub struct ReactorHandle {
    handle: Handle,
    dispatch: Option<Dispatch>,
}

impl ReactorHandle {
    /// Wraps the runtime the caller is running on.
    pub fn current() -> Option<ReactorHandle> {
        Handle::try_current().ok().map(|handle| ReactorHandle {
            handle,
            dispatch: None,
        })
    }

    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        match &self.dispatch {
            Some(dispatch) => self.handle.spawn(future.with_subscriber(dispatch.clone())),
            None => self.handle.spawn(future),
        }
    }

    pub fn spawn_blocking<F, R>(&self, f: F) -> JoinHandle<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        match self.dispatch.clone() {
            Some(dispatch) => self
                .handle
                .spawn_blocking(move || tracing::dispatcher::with_default(&dispatch, f)),
            None => self.handle.spawn_blocking(f),
        }
    }

    /// Blocks the calling thread until `future` completes or `timeout` elapses. The future keeps
    /// running on its own if it is spawned work, only the wait is bounded.
    ///
    /// Must not be called from a reactor thread.
    pub fn block_on_timeout<F: Future>(&self, timeout: Duration, future: F) -> Result<F::Output> {
        let wait = async { tokio::time::timeout(timeout, future).await };
        let result = match &self.dispatch {
            Some(dispatch) => {
                tracing::dispatcher::with_default(dispatch, || self.handle.block_on(wait))
            }
            None => self.handle.block_on(wait),
        };
        result.map_err(|_| Error::Timeout(timeout))
    }

    pub fn tokio_handle(&self) -> &Handle {
        &self.handle
    }
}
