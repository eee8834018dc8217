//! Process interruption handling
//!
//! SIGINT, SIGTERM and SIGHUP cancel a shared [`CancellationToken`] and then
//! run the registered shutdown callbacks exactly once, newest first.
//! Long-running operations observe the token and return
//! [`crate::error::DestroyError::Cancelled`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type Callback = Box<dyn FnOnce() + Send>;

#[derive(Clone, Default)]
pub struct Shutdown {
    token: CancellationToken,
    callbacks: Arc<Mutex<Vec<(String, Callback)>>>,
    ran: Arc<AtomicBool>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token observed by blocking operations
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Register a callback to run on shutdown
    pub fn on_shutdown(&self, name: impl Into<String>, callback: impl FnOnce() + Send + 'static) {
        let mut callbacks = self.callbacks.lock().unwrap_or_else(|e| e.into_inner());
        callbacks.push((name.into(), Box::new(callback)));
    }

    /// Cancel in-flight work and run callbacks
    pub fn trigger(&self, reason: &str) {
        if !self.token.is_cancelled() {
            info!(reason = %reason, "Shutting down");
        }
        self.token.cancel();
        self.run_callbacks();
    }

    /// Run registered callbacks once, newest first
    ///
    /// Also called on normal exit so cleanup happens on every path.
    pub fn run_callbacks(&self) {
        if self.ran.swap(true, Ordering::SeqCst) {
            return;
        }
        let callbacks = {
            let mut guard = self.callbacks.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *guard)
        };
        for (name, callback) in callbacks.into_iter().rev() {
            debug!(callback = %name, "Running shutdown callback");
            callback();
        }
    }

    /// Spawn the task that turns process signals into a shutdown
    pub fn listen_for_signals(&self) -> JoinHandle<()> {
        let shutdown = self.clone();
        tokio::spawn(async move {
            let reason = wait_for_signal().await;
            shutdown.trigger(reason);
        })
    }
}

#[cfg(unix)]
async fn wait_for_signal() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};

    let streams = (
        signal(SignalKind::interrupt()),
        signal(SignalKind::terminate()),
        signal(SignalKind::hangup()),
    );
    match streams {
        (Ok(mut int), Ok(mut term), Ok(mut hup)) => {
            tokio::select! {
                _ = int.recv() => "SIGINT",
                _ = term.recv() => "SIGTERM",
                _ = hup.recv() => "SIGHUP",
            }
        }
        _ => {
            warn!("Failed to install signal handlers, falling back to ctrl-c");
            ctrl_c().await
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> &'static str {
    ctrl_c().await
}

async fn ctrl_c() -> &'static str {
    match tokio::signal::ctrl_c().await {
        Ok(()) => "ctrl-c",
        Err(e) => {
            warn!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<&'static str>().await
        }
    }
}

#[cfg(test)]
#[path = "shutdown_test.rs"]
mod tests;
