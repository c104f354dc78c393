//! Interrupt deferral
//!
//! An interrupt normally requests shutdown straight away; the worker loop
//! notices at its next safe point. While a `DeferGuard` is alive the request
//! is held back and delivered when the last guard drops, so a dispatch in
//! flight finishes its state transition. Receiving the configured number of
//! interrupts forces an exit whether or not a guard is held, so an operator
//! can still stop a worker stuck before its next safe point.

use std::sync::Arc;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{info, warn};

/// Exit status used for a forced exit (128 + SIGINT)
pub const FORCED_EXIT_CODE: i32 = 130;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptAction {
    /// Shutdown was requested immediately
    Shutdown,
    /// A deferral guard is held; shutdown follows when it is released
    Deferred,
    /// Repeated interrupts exhausted the deferral; exit now
    ForceExit,
}

#[derive(Debug, Default)]
struct GateState {
    depth: u32,
    pending: bool,
    received: u32,
}

#[derive(Debug)]
struct GateInner {
    state: Mutex<GateState>,
    force_after: Option<u32>,
    shutdown: watch::Sender<bool>,
}

/// Shared shutdown flag with scoped interrupt deferral
#[derive(Debug, Clone)]
pub struct InterruptGate {
    inner: Arc<GateInner>,
}

impl InterruptGate {
    /// `force_after` is the number of interrupts that forces an exit;
    /// `None` never forces.
    pub fn new(force_after: Option<u32>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(GateInner {
                state: Mutex::new(GateState::default()),
                force_after: force_after.filter(|n| *n > 0),
                shutdown,
            }),
        }
    }

    /// Record one raw interrupt
    pub fn notify(&self) -> InterruptAction {
        let mut state = self.inner.state.lock();
        state.received = state.received.saturating_add(1);

        if let Some(limit) = self.inner.force_after {
            if state.received >= limit {
                warn!("Interrupt repeated {} times, forcing exit", state.received);
                return InterruptAction::ForceExit;
            }
        }

        if state.depth == 0 {
            drop(state);
            info!("Interrupt received, shutting down at the next safe point");
            self.request_shutdown();
            return InterruptAction::Shutdown;
        }

        state.pending = true;
        info!("Interrupt deferred until the current dispatch completes");
        InterruptAction::Deferred
    }

    /// Hold back interrupts until the returned guard is dropped
    pub fn defer(&self) -> DeferGuard {
        self.inner.state.lock().depth += 1;
        DeferGuard { gate: self.clone() }
    }

    pub fn is_deferring(&self) -> bool {
        self.inner.state.lock().depth > 0
    }

    pub fn request_shutdown(&self) {
        self.inner.shutdown.send_replace(true);
    }

    pub fn is_shutdown(&self) -> bool {
        *self.inner.shutdown.borrow()
    }

    /// Resolves once shutdown has been requested
    pub async fn wait_shutdown(&self) {
        let mut rx = self.inner.shutdown.subscribe();
        // The sender lives as long as the gate, so this cannot close early
        let _ = rx.wait_for(|requested| *requested).await;
    }

    fn release(&self) {
        let mut state = self.inner.state.lock();
        state.depth = state.depth.saturating_sub(1);
        if state.depth > 0 || !state.pending {
            return;
        }
        state.pending = false;
        drop(state);

        info!("Delivering deferred interrupt");
        self.request_shutdown();
    }
}

impl Default for InterruptGate {
    fn default() -> Self {
        Self::new(Some(3))
    }
}

/// Keeps interrupts deferred while alive
#[must_use = "interrupts are only deferred while the guard is held"]
#[derive(Debug)]
pub struct DeferGuard {
    gate: InterruptGate,
}

impl Drop for DeferGuard {
    fn drop(&mut self) {
        self.gate.release();
    }
}

/// Feed SIGINT and SIGTERM into `gate` until the process exits.
///
/// Exits the process with status 130 when the gate asks for a forced exit.
pub async fn listen_for_interrupts(gate: InterruptGate) -> std::io::Result<()> {
    #[cfg(unix)]
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    loop {
        #[cfg(unix)]
        tokio::select! {
            result = tokio::signal::ctrl_c() => result?,
            _ = terminate.recv() => {},
        }

        #[cfg(not(unix))]
        tokio::signal::ctrl_c().await?;

        if gate.notify() == InterruptAction::ForceExit {
            std::process::exit(FORCED_EXIT_CODE);
        }
    }
}
