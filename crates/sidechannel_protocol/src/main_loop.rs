use std::panic::{AssertUnwindSafe, catch_unwind};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{error, info};

use crate::dispatcher::panic_message;

/// State owned by a main loop. `tick` runs once per scheduler tick, between
/// jobs, never concurrently with them.
pub trait MainState: Send + 'static {
    fn tick(&mut self) {}
}

pub type Job<S> = Box<dyn FnOnce(&mut S) + Send + 'static>;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("main loop has shut down")]
pub struct MainLoopClosed;

// -----------------------------------------------------------------------------
// Commands for the loop
// -----------------------------------------------------------------------------
enum Command<S> {
    Run(Job<S>),
    Shutdown,
}

/// Submits work to a running [`MainLoop`]. Cheap to clone; the loop stops
/// once every handle is gone or [`shutdown`](Self::shutdown) is called.
pub struct MainLoopHandle<S> {
    tx: mpsc::UnboundedSender<Command<S>>,
}

impl<S> Clone for MainLoopHandle<S> {
    fn clone(&self) -> Self {
        Self { tx: self.tx.clone() }
    }
}

impl<S> std::fmt::Debug for MainLoopHandle<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MainLoopHandle")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

impl<S: MainState> MainLoopHandle<S> {
    /// Queue `job` behind everything already submitted.
    pub fn run_on_main_loop<F>(&self, job: F) -> Result<(), MainLoopClosed>
    where
        F: FnOnce(&mut S) + Send + 'static,
    {
        self.tx
            .send(Command::Run(Box::new(job)))
            .map_err(|_| MainLoopClosed)
    }

    /// Run `f` on the loop and wait for its result.
    pub async fn call<F, R>(&self, f: F) -> Result<R, MainLoopClosed>
    where
        F: FnOnce(&mut S) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.run_on_main_loop(move |state| {
            let _ = tx.send(f(state));
        })?;
        rx.await.map_err(|_| MainLoopClosed)
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown);
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// A single-threaded executor for one side's mutable state.
///
/// Jobs run strictly one after another on a dedicated task; a panicking job
/// is logged and the loop carries on with the next one.
pub struct MainLoop;

impl MainLoop {
    /// Spawn the loop. With `tick` set, [`MainState::tick`] runs at that period.
    /// The join handle yields the state back once the loop stops.
    pub fn spawn<S: MainState>(state: S, tick: Option<Duration>) -> (MainLoopHandle<S>, JoinHandle<S>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let interval = tick.map(|period| {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            interval
        });
        let task = tokio::spawn(run(state, rx, interval));
        (MainLoopHandle { tx }, task)
    }
}

async fn run<S: MainState>(
    mut state: S,
    mut rx: mpsc::UnboundedReceiver<Command<S>>,
    mut interval: Option<Interval>,
) -> S {
    loop {
        tokio::select! {
            biased;
            cmd = rx.recv() => match cmd {
                Some(Command::Run(job)) => {
                    if let Err(panic) = catch_unwind(AssertUnwindSafe(|| job(&mut state))) {
                        error!("main loop job panicked: {}", panic_message(panic.as_ref()));
                    }
                }
                Some(Command::Shutdown) | None => break,
            },
            _ = next_tick(&mut interval) => {
                if let Err(panic) = catch_unwind(AssertUnwindSafe(|| state.tick())) {
                    error!("main loop tick panicked: {}", panic_message(panic.as_ref()));
                }
            }
        }
    }
    info!("main loop stopped");
    state
}

async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
