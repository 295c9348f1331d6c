use crate::errors::EngineError;
use std::future::Future;
use std::sync::mpsc;
use std::thread::{self, JoinHandle, ThreadId};
use tokio::runtime::{Builder, Handle};
use tokio::sync::oneshot;

/// A named OS thread driving its own single-threaded tokio runtime.
///
/// The engine forbids blocking its signaling path with application work,
/// so worker and signaling activity each get one of these.
pub struct ExecutionContext {
    handle: ContextHandle,
    shutdown: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

/// Cheap, cloneable access to a running [`ExecutionContext`].
#[derive(Clone)]
pub struct ContextHandle {
    name: String,
    runtime: Handle,
    thread_id: ThreadId,
}

impl ExecutionContext {
    pub fn start(name: &str) -> Result<Self, EngineError> {
        let (ready_tx, ready_rx) = mpsc::channel::<Result<Handle, String>>();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let thread_name = name.to_string();

        let thread = thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                let runtime = match Builder::new_current_thread().enable_all().build() {
                    Ok(rt) => rt,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e.to_string()));
                        return;
                    }
                };
                if ready_tx.send(Ok(runtime.handle().clone())).is_err() {
                    return;
                }
                runtime.block_on(async {
                    let _ = shutdown_rx.await;
                });
                log::debug!("execution context '{}' shutting down", thread_name);
            })
            .map_err(|e| EngineError::ContextStopped(format!("{}: {}", name, e)))?;

        let thread_id = thread.thread().id();
        let runtime = ready_rx
            .recv()
            .map_err(|e| EngineError::ContextStopped(format!("{}: {}", name, e)))?
            .map_err(|e| EngineError::ContextStopped(format!("{}: {}", name, e)))?;
        log::debug!("execution context '{}' started", name);

        Ok(Self {
            handle: ContextHandle {
                name: name.to_string(),
                runtime,
                thread_id,
            },
            shutdown: Some(shutdown_tx),
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> ContextHandle {
        self.handle.clone()
    }

    pub fn name(&self) -> &str {
        &self.handle.name
    }

    pub fn is_running(&self) -> bool {
        self.thread.is_some()
    }

    /// Stop the runtime and join its thread. Pending tasks are dropped.
    pub async fn stop(&mut self) {
        let Some(thread) = self.signal_shutdown() else {
            return;
        };
        if thread::current().id() == self.handle.thread_id {
            log::warn!(
                "execution context '{}' stopped from its own thread, detaching",
                self.handle.name
            );
            return;
        }
        let name = self.handle.name.clone();
        match tokio::task::spawn_blocking(move || thread.join()).await {
            Ok(Ok(())) => log::debug!("execution context '{}' stopped", name),
            Ok(Err(_)) => log::error!("execution context '{}' panicked", name),
            Err(e) => log::error!("failed to join execution context '{}': {}", name, e),
        }
    }

    fn signal_shutdown(&mut self) -> Option<JoinHandle<()>> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        self.thread.take()
    }
}

impl Drop for ExecutionContext {
    fn drop(&mut self) {
        // Detach rather than block in a destructor.
        self.signal_shutdown();
    }
}

impl ContextHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    pub fn spawn<F>(&self, fut: F) -> tokio::task::JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.runtime.spawn(fut)
    }

    /// Run `fut` on this context and wait for its result.
    pub async fn run<F>(&self, fut: F) -> Result<F::Output, EngineError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.runtime
            .spawn(fut)
            .await
            .map_err(|e| EngineError::ContextStopped(format!("{}: {}", self.name, e)))
    }
}
