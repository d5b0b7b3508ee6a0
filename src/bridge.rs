//! Bridge between blocking callers and the async session core.
//!
//! A [`BackgroundRuntime`] is a dedicated worker thread that owns one
//! current-thread tokio runtime for its entire life. External threads
//! submit futures into that runtime and block on a thread-safe handoff for
//! the result. Shutdown is cooperative: a stop signal ends the runtime's
//! root future, dropping the runtime cancels every task it still owns, and
//! the worker thread is joined before `terminate` returns.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc as std_mpsc;

use parking_lot::Mutex;
use tokio::sync::{oneshot, watch};

use crate::error::{Error, Result};

/// Blocking handle to the result of work submitted to a
/// [`BackgroundRuntime`].
pub struct RemoteResult<T> {
    rx: oneshot::Receiver<T>,
}

impl<T> RemoteResult<T> {
    /// Block the calling thread until the submitted work completes.
    ///
    /// Fails with [`Error::Connection`] if the worker terminated before the
    /// work finished (its runtime cancelled the task).
    pub fn wait(self) -> Result<T> {
        self.rx.blocking_recv().map_err(|_| {
            Error::connection("background runtime terminated before the submitted work completed")
        })
    }
}

/// A worker thread owning one current-thread tokio runtime.
pub struct BackgroundRuntime {
    handle: tokio::runtime::Handle,
    stop: watch::Sender<bool>,
    worker: Mutex<Option<std::thread::JoinHandle<()>>>,
    terminated: AtomicBool,
}

impl BackgroundRuntime {
    /// Spawn the worker and block until its runtime reports ready.
    pub fn start() -> Result<Self> {
        Self::start_named("sluice-worker")
    }

    pub fn start_named(name: &str) -> Result<Self> {
        let (ready_tx, ready_rx) = std_mpsc::channel();
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let worker = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };
                runtime.block_on(async move {
                    if ready_tx.send(Ok(tokio::runtime::Handle::current())).is_err() {
                        return;
                    }
                    // Park until termination is requested. Every task
                    // spawned onto this runtime is cancelled when the
                    // runtime drops after this future returns.
                    while !*stop_rx.borrow() {
                        if stop_rx.changed().await.is_err() {
                            break;
                        }
                    }
                });
                tracing::debug!("background runtime stopped");
            })
            .map_err(|err| Error::connection(format!("failed to spawn worker thread: {err}")))?;

        let handle = ready_rx
            .recv()
            .map_err(|_| Error::connection("worker thread exited before reporting ready"))?
            .map_err(|err| Error::connection(format!("failed to build worker runtime: {err}")))?;
        tracing::debug!("background runtime ready");
        Ok(BackgroundRuntime {
            handle,
            stop: stop_tx,
            worker: Mutex::new(Some(worker)),
            terminated: AtomicBool::new(false),
        })
    }

    pub fn is_active(&self) -> bool {
        !self.terminated.load(Ordering::SeqCst)
    }

    fn ensure_active(&self) -> Result<()> {
        if !self.is_active() {
            return Err(Error::usage(
                "background runtime has been terminated",
            ));
        }
        Ok(())
    }

    /// Submit a future from any thread; the returned handle blocks for its
    /// result. The future must own everything it touches; it runs on the
    /// worker after the calling scope may have exited.
    pub fn run_future<F>(&self, future: F) -> Result<RemoteResult<F::Output>>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.ensure_active()?;
        let (tx, rx) = oneshot::channel();
        self.handle.spawn(async move {
            let _ = tx.send(future.await);
        });
        Ok(RemoteResult { rx })
    }

    /// Submit a future and block for its result.
    pub fn block_on<F>(&self, future: F) -> Result<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.run_future(future)?.wait()
    }

    /// Fire-and-forget submission.
    pub fn spawn_detached<F>(&self, future: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.ensure_active()?;
        self.handle.spawn(future);
        Ok(())
    }

    /// Request cooperative shutdown and wait until the worker has fully
    /// stopped. Safe to call multiple times and from any thread except the
    /// worker's own.
    pub fn terminate(&self) {
        self.terminated.store(true, Ordering::SeqCst);
        let _ = self.stop.send(true);
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            let _ = worker.join();
        }
    }
}

impl Drop for BackgroundRuntime {
    fn drop(&mut self) {
        self.terminate();
    }
}
