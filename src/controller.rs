//! Background Training Controller
//!
//! Runs the epoch/batch loop of one model on a dedicated thread while the
//! model stays reachable for inference through its shared mutex.
//!
//! ## State Machine
//!
//! ```text
//!          start()            pause()
//!   Idle ──────────► Running ────────► Paused
//!                     │   ▲              │
//!                     │   └── resume() ──┘
//!                     │
//!         ┌───────────┼────────────┐
//!         ▼           ▼            ▼
//!     Completed    Stopped       Failed
//! ```
//!
//! `start` while a run is alive is rejected with a conflict. A finished
//! controller can be started again.
//!
//! ## Suspension Points
//!
//! The loop only looks at its signals between units of work:
//!
//! ```text
//! for epoch:
//!     stop? ─► Stopped
//!     wait on pause gate
//!     for batch:
//!         stop? ─► Stopped
//!         wait on pause gate
//!         lock engine ─► forward, backward, clip, step, zero grad ─► unlock
//! ```
//!
//! A batch in flight always finishes before a stop or pause takes effect.
//! The engine lock is held for exactly one batch, so readers wait at most
//! that long.
//!
//! ## Failure
//!
//! An error or panic inside the loop ends the run as `Failed` with its
//! message recorded. The engine is always marked as no longer training and
//! the thread stays joinable. Steps applied before the failure are kept.

use crate::engine::EngineService;
use crate::error::{EngineError, Result};
use crate::progress::{Dispatcher, ProgressEvent, ProgressSink, TrainingStatus};
use crate::scheduler::LrScheduler;
use std::any::Any;
use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Batch progress is reported every this many batches, and on the last one
const BATCH_REPORT_EVERY: usize = 10;

/// Epochs between weight snapshots (the first and last epoch always get one)
const SNAPSHOT_EVERY: usize = 5;

/// Lock ignoring poison; a panicking batch must not wedge every later caller
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Resumable gate: `wait` blocks while closed
#[derive(Default)]
struct PauseGate {
    paused: Mutex<bool>,
    cvar: Condvar,
}

impl PauseGate {
    fn close(&self) {
        *lock(&self.paused) = true;
    }

    fn open(&self) {
        *lock(&self.paused) = false;
        self.cvar.notify_all();
    }

    fn wait(&self) {
        let mut paused = lock(&self.paused);
        while *paused {
            paused = self.cvar.wait(paused).unwrap_or_else(PoisonError::into_inner);
        }
    }
}

/// State shared between the controller and its run thread
struct RunState {
    stop: AtomicBool,
    gate: PauseGate,
    status: Mutex<TrainingStatus>,
    loss_history: Mutex<Vec<f64>>,
    last_error: Mutex<Option<String>>,
    epoch: AtomicUsize,
}

impl RunState {
    fn new() -> Self {
        Self {
            stop: AtomicBool::new(false),
            gate: PauseGate::default(),
            status: Mutex::new(TrainingStatus::Idle),
            loss_history: Mutex::new(Vec::new()),
            last_error: Mutex::new(None),
            epoch: AtomicUsize::new(0),
        }
    }

    fn stopping(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    fn set_status(&self, status: TrainingStatus) {
        *lock(&self.status) = status;
    }
}

enum Outcome {
    Completed,
    Stopped,
}

/// Everything the run thread owns
struct Run {
    model_id: String,
    engine: Arc<Mutex<EngineService>>,
    state: Arc<RunState>,
    events: Arc<Dispatcher>,
    checkpoint_dir: Option<PathBuf>,
    num_epochs: usize,
}

impl Run {
    fn emit(&self, event: ProgressEvent) {
        self.events.dispatch(event);
    }

    fn emit_status(&self, status: TrainingStatus, message: Option<String>) {
        self.emit(ProgressEvent::StatusChange {
            model_id: self.model_id.clone(),
            status,
            message,
        });
    }

    /// Enter a terminal status and release the engine in one step, so a
    /// concurrent `pause` either lands before it or sees the terminal status
    fn finish(&self, status: TrainingStatus) {
        let mut current = lock(&self.state.status);
        *current = status;
        lock(&self.engine).set_training(false);
    }

    fn execute(self) {
        info!(model = %self.model_id, epochs = self.num_epochs, "training run started");
        self.emit_status(TrainingStatus::Running, None);

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.epochs()))
            .unwrap_or_else(|payload| Err(panic_message(payload)));

        match outcome {
            Ok(Outcome::Completed) => {
                self.finish(TrainingStatus::Completed);
                info!(model = %self.model_id, "training run completed");
                self.emit_status(TrainingStatus::Completed, None);
                self.auto_save();
            }
            Ok(Outcome::Stopped) => {
                self.finish(TrainingStatus::Stopped);
                info!(model = %self.model_id, "training run stopped");
                self.emit_status(TrainingStatus::Stopped, None);
            }
            Err(message) => {
                *lock(&self.state.last_error) = Some(message.clone());
                self.finish(TrainingStatus::Failed);
                error!(model = %self.model_id, error = %message, "training run failed");
                self.emit_status(TrainingStatus::Failed, Some(message));
            }
        }
    }

    fn epochs(&self) -> std::result::Result<Outcome, String> {
        let (total_batches, config) = {
            let engine = lock(&self.engine);
            (
                engine.num_batches().map_err(|e| e.to_string())?,
                engine.config().clone(),
            )
        };
        let mut scheduler = LrScheduler::new(
            config.lr_schedule,
            config.learning_rate,
            self.num_epochs * total_batches,
        );
        let started = Instant::now();
        let state = &self.state;

        for epoch in 0..self.num_epochs {
            if state.stopping() {
                return Ok(Outcome::Stopped);
            }
            state.gate.wait();

            let mut epoch_loss = 0.0;
            for batch in 0..total_batches {
                if state.stopping() {
                    return Ok(Outcome::Stopped);
                }
                state.gate.wait();
                if state.stopping() {
                    return Ok(Outcome::Stopped);
                }

                let lr = scheduler.step();
                let loss = lock(&self.engine)
                    .train_batch(lr)
                    .map_err(|e| e.to_string())?;
                epoch_loss += loss;

                if batch % BATCH_REPORT_EVERY == 0 || batch + 1 == total_batches {
                    debug!(epoch = epoch + 1, batch = batch + 1, loss, lr, "batch");
                    self.emit(ProgressEvent::BatchComplete {
                        model_id: self.model_id.clone(),
                        epoch: epoch + 1,
                        batch: batch + 1,
                        total_batches,
                        batch_loss: loss,
                    });
                }
            }

            let avg_loss = epoch_loss / total_batches.max(1) as f64;
            let loss_history = {
                let mut history = lock(&state.loss_history);
                history.push(avg_loss);
                history.clone()
            };
            state.epoch.store(epoch + 1, Ordering::SeqCst);

            let wants_snapshot =
                epoch == 0 || (epoch + 1) % SNAPSHOT_EVERY == 0 || epoch + 1 == self.num_epochs;
            let weight_snapshot = wants_snapshot.then(|| lock(&self.engine).weight_snapshot());

            let elapsed_seconds = started.elapsed().as_secs_f64();
            if epoch == 0 || (epoch + 1) % config.log_every.max(1) == 0 {
                info!(
                    "Epoch {:4}/{} | Loss: {:.4} | {:.1}s",
                    epoch + 1,
                    self.num_epochs,
                    avg_loss,
                    elapsed_seconds
                );
            }
            self.emit(ProgressEvent::EpochComplete {
                model_id: self.model_id.clone(),
                epoch: epoch + 1,
                total_epochs: self.num_epochs,
                loss: avg_loss,
                loss_history,
                elapsed_seconds,
                weight_snapshot,
            });
        }
        Ok(Outcome::Completed)
    }

    /// Write weights and vocabulary into the checkpoint directory, if any
    fn auto_save(&self) {
        let Some(dir) = &self.checkpoint_dir else {
            return;
        };
        let weights = dir.join(format!("{}.ckpt", self.model_id));
        let vocab = dir.join(format!("{}.vocab.json", self.model_id));

        let saved = fs::create_dir_all(dir)
            .map_err(EngineError::from)
            .and_then(|_| lock(&self.engine).save_weights(&weights))
            .and_then(|snapshot| snapshot.save(&vocab));
        match saved {
            Ok(()) => info!(model = %self.model_id, path = %weights.display(), "auto-saved model"),
            Err(e) => warn!(model = %self.model_id, error = %e, "auto-save failed"),
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "training thread panicked".to_string()
    }
}

/// Start/pause/resume/stop of background training for one model
pub struct TrainingController {
    model_id: String,
    engine: Arc<Mutex<EngineService>>,
    state: Arc<RunState>,
    sinks: Vec<Arc<dyn ProgressSink>>,
    checkpoint_dir: Option<PathBuf>,
    handle: Mutex<Option<JoinHandle<()>>>,
    /// Sink workers of the current or last run
    events: Mutex<Option<Arc<Dispatcher>>>,
}

impl TrainingController {
    pub fn new(model_id: impl Into<String>, engine: Arc<Mutex<EngineService>>) -> Self {
        Self {
            model_id: model_id.into(),
            engine,
            state: Arc::new(RunState::new()),
            sinks: Vec::new(),
            checkpoint_dir: None,
            handle: Mutex::new(None),
            events: Mutex::new(None),
        }
    }

    /// Also deliver progress to `sink`
    pub fn with_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Save weights and vocabulary into `dir` when a run completes
    pub fn with_checkpoint_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.checkpoint_dir = Some(dir.into());
        self
    }

    pub fn add_sink(&mut self, sink: Arc<dyn ProgressSink>) {
        self.sinks.push(sink);
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn engine(&self) -> Arc<Mutex<EngineService>> {
        Arc::clone(&self.engine)
    }

    /// Launch a run of `num_epochs` (default `config.max_epochs`)
    pub fn start(&self, num_epochs: Option<usize>) -> Result<()> {
        let mut handle = lock(&self.handle);
        if handle.as_ref().is_some_and(|h| !h.is_finished()) {
            return Err(EngineError::Conflict("training is already running".to_string()));
        }
        if let Some(finished) = handle.take() {
            let _ = finished.join();
        }

        let num_epochs = {
            let mut engine = lock(&self.engine);
            if !engine.is_ready() {
                return Err(EngineError::NotReady);
            }
            engine.num_batches()?;
            engine.set_training(true);
            num_epochs.unwrap_or(engine.config().max_epochs)
        };

        let state = &self.state;
        state.stop.store(false, Ordering::SeqCst);
        state.gate.open();
        state.epoch.store(0, Ordering::SeqCst);
        lock(&state.loss_history).clear();
        *lock(&state.last_error) = None;
        state.set_status(TrainingStatus::Running);

        let events = Arc::new(Dispatcher::new(&self.sinks));
        *lock(&self.events) = Some(Arc::clone(&events));

        let run = Run {
            model_id: self.model_id.clone(),
            engine: Arc::clone(&self.engine),
            state: Arc::clone(&self.state),
            events,
            checkpoint_dir: self.checkpoint_dir.clone(),
            num_epochs,
        };
        *handle = Some(thread::spawn(move || run.execute()));
        Ok(())
    }

    /// Ask the run to end at the next batch boundary
    pub fn stop(&self) {
        self.state.stop.store(true, Ordering::SeqCst);
        self.state.gate.open();
    }

    /// Running → Paused; anything else is left alone
    pub fn pause(&self) {
        {
            let mut status = lock(&self.state.status);
            if *status != TrainingStatus::Running {
                return;
            }
            *status = TrainingStatus::Paused;
            self.state.gate.close();
            lock(&self.engine).set_paused(true);
        }
        self.emit_status(TrainingStatus::Paused);
    }

    /// Paused → Running; anything else is left alone
    pub fn resume(&self) {
        {
            let mut status = lock(&self.state.status);
            if *status != TrainingStatus::Paused {
                return;
            }
            *status = TrainingStatus::Running;
            lock(&self.engine).set_paused(false);
            self.state.gate.open();
        }
        self.emit_status(TrainingStatus::Running);
    }

    fn emit_status(&self, status: TrainingStatus) {
        if let Some(events) = lock(&self.events).as_ref() {
            events.dispatch(ProgressEvent::StatusChange {
                model_id: self.model_id.clone(),
                status,
                message: None,
            });
        }
    }

    /// Block until the current run, if any, has ended
    pub fn join(&self) {
        if let Some(handle) = lock(&self.handle).take() {
            if handle.join().is_err() {
                warn!(model = %self.model_id, "training thread ended abnormally");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        lock(&self.handle)
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    pub fn is_paused(&self) -> bool {
        self.status() == TrainingStatus::Paused && self.is_running()
    }

    pub fn status(&self) -> TrainingStatus {
        *lock(&self.state.status)
    }

    pub fn loss_history(&self) -> Vec<f64> {
        lock(&self.state.loss_history).clone()
    }

    /// Epochs finished in the current or last run
    pub fn current_epoch(&self) -> usize {
        self.state.epoch.load(Ordering::SeqCst)
    }

    /// Message of the last failed run
    pub fn last_error(&self) -> Option<String> {
        lock(&self.state.last_error).clone()
    }
}

impl Drop for TrainingController {
    fn drop(&mut self) {
        self.stop();
    }
}
