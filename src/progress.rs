//! Training Progress Events
//!
//! The background training loop reports what it is doing through
//! [`ProgressEvent`]s handed to [`ProgressSink`]s. Events serialize to JSON
//! with a `type` tag:
//!
//! ```text
//! {"type":"status_change","model_id":"m1","status":"running"}
//! {"type":"batch_complete","model_id":"m1","epoch":3,"batch":11,"total_batches":40,"batch_loss":2.17}
//! {"type":"epoch_complete","model_id":"m1","epoch":3,"total_epochs":50,"loss":2.21,...}
//! ```
//!
//! Delivery is fire-and-forget. Every sink gets one worker thread fed by a
//! channel:
//!
//! ```text
//! training thread ──send──► [queue] ──► worker ──► sink A
//!                 └─send──► [queue] ──► worker ──► sink B
//! ```
//!
//! A slow sink only lets its own queue grow; training never waits on it.
//! Each sink sees events in the order they were sent.
//!
//! ## CSV Loss Curve
//!
//! [`CsvLossSink`] appends one row per completed epoch:
//!
//! ```text
//! epoch,loss,perplexity,elapsed_seconds
//! 1,3.412876,30.3537,0.84
//! 2,2.904411,18.2541,1.63
//! ```
//!
//! Perplexity is `exp(loss)`: 1.0 for a perfect model, about `vocab_size`
//! for uniform guessing.

use crate::introspection::WeightTile;
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainingStatus {
    Idle,
    Running,
    Paused,
    Completed,
    Stopped,
    Failed,
}

impl TrainingStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Stopped | Self::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    StatusChange {
        model_id: String,
        status: TrainingStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    BatchComplete {
        model_id: String,
        epoch: usize,
        batch: usize,
        total_batches: usize,
        batch_loss: f64,
    },
    EpochComplete {
        model_id: String,
        epoch: usize,
        total_epochs: usize,
        loss: f64,
        loss_history: Vec<f64>,
        elapsed_seconds: f64,
        #[serde(skip_serializing_if = "Option::is_none")]
        weight_snapshot: Option<Vec<WeightTile>>,
    },
}

/// Receiver of training progress
pub trait ProgressSink: Send + Sync {
    fn send(&self, event: ProgressEvent);
}

/// One queue and worker thread per sink
///
/// Dropping the dispatcher closes the queues; each worker drains what is
/// left and exits.
pub(crate) struct Dispatcher {
    queues: Vec<Sender<ProgressEvent>>,
}

impl Dispatcher {
    pub(crate) fn new(sinks: &[Arc<dyn ProgressSink>]) -> Self {
        let queues = sinks
            .iter()
            .map(|sink| {
                let sink = Arc::clone(sink);
                let (tx, rx) = mpsc::channel::<ProgressEvent>();
                thread::spawn(move || {
                    for event in rx {
                        sink.send(event);
                    }
                });
                tx
            })
            .collect();
        Self { queues }
    }

    /// Queue `event` for every sink without waiting for any of them
    pub(crate) fn dispatch(&self, event: ProgressEvent) {
        for queue in &self.queues {
            // A closed queue means its worker died with a panicking sink
            let _ = queue.send(event.clone());
        }
    }
}

/// Forwards events into an `mpsc` channel
pub struct ChannelSink {
    sender: Mutex<Sender<ProgressEvent>>,
}

impl ChannelSink {
    pub fn new(sender: Sender<ProgressEvent>) -> Self {
        Self {
            sender: Mutex::new(sender),
        }
    }
}

impl ProgressSink for ChannelSink {
    fn send(&self, event: ProgressEvent) {
        let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        // A dropped receiver just means nobody is listening anymore
        let _ = sender.send(event);
    }
}

/// Appends per-epoch losses to a CSV file
pub struct CsvLossSink {
    file: Mutex<File>,
}

impl CsvLossSink {
    /// Create (or truncate) `path` and write the header
    pub fn create<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let mut file = File::create(path)?;
        writeln!(file, "epoch,loss,perplexity,elapsed_seconds")?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }

    /// Keep appending to an existing log
    pub fn append<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = OpenOptions::new().append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }

    fn write_row(&self, epoch: usize, loss: f64, elapsed_seconds: f64) -> io::Result<()> {
        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        writeln!(
            file,
            "{},{:.6},{:.4},{:.2}",
            epoch,
            loss,
            loss.exp(),
            elapsed_seconds
        )?;
        file.flush()
    }
}

impl ProgressSink for CsvLossSink {
    fn send(&self, event: ProgressEvent) {
        if let ProgressEvent::EpochComplete {
            epoch,
            loss,
            elapsed_seconds,
            ..
        } = event
        {
            if let Err(e) = self.write_row(epoch, loss, elapsed_seconds) {
                warn!(error = %e, "failed to write loss row");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn epoch_event(epoch: usize, loss: f64) -> ProgressEvent {
        ProgressEvent::EpochComplete {
            model_id: "m".to_string(),
            epoch,
            total_epochs: 3,
            loss,
            loss_history: vec![loss],
            elapsed_seconds: 0.5 * epoch as f64,
            weight_snapshot: None,
        }
    }

    #[test]
    fn test_event_json_shape() {
        let json = serde_json::to_string(&ProgressEvent::StatusChange {
            model_id: "m1".to_string(),
            status: TrainingStatus::Running,
            message: None,
        })
        .expect("json");
        assert_eq!(json, r#"{"type":"status_change","model_id":"m1","status":"running"}"#);

        let json = serde_json::to_string(&epoch_event(1, 2.0)).expect("json");
        assert!(json.contains(r#""type":"epoch_complete""#));
        assert!(!json.contains("weight_snapshot"));
    }

    #[test]
    fn test_dispatch_reaches_every_sink() {
        let (tx, rx) = mpsc::channel();
        let sinks: Vec<Arc<dyn ProgressSink>> = vec![
            Arc::new(ChannelSink::new(tx.clone())),
            Arc::new(ChannelSink::new(tx)),
        ];
        let dispatcher = Dispatcher::new(&sinks);
        dispatcher.dispatch(epoch_event(1, 1.0));
        drop(dispatcher);
        drop(sinks);
        assert_eq!(rx.iter().count(), 2);
    }

    #[test]
    fn test_dispatch_preserves_order_per_sink() {
        let (tx, rx) = mpsc::channel();
        let sinks: Vec<Arc<dyn ProgressSink>> = vec![Arc::new(ChannelSink::new(tx))];
        let dispatcher = Dispatcher::new(&sinks);
        for batch in 0..200 {
            dispatcher.dispatch(ProgressEvent::BatchComplete {
                model_id: "m".to_string(),
                epoch: 1,
                batch,
                total_batches: 200,
                batch_loss: 1.0,
            });
        }
        drop(dispatcher);
        drop(sinks);

        let batches: Vec<usize> = rx
            .iter()
            .filter_map(|e| match e {
                ProgressEvent::BatchComplete { batch, .. } => Some(batch),
                _ => None,
            })
            .collect();
        assert_eq!(batches, (0..200).collect::<Vec<_>>());
    }

    struct SlowSink {
        seen: Mutex<usize>,
    }

    impl ProgressSink for SlowSink {
        fn send(&self, _event: ProgressEvent) {
            std::thread::sleep(std::time::Duration::from_millis(5));
            *self.seen.lock().unwrap_or_else(PoisonError::into_inner) += 1;
        }
    }

    #[test]
    fn test_slow_sink_does_not_block_sender() {
        let slow = Arc::new(SlowSink { seen: Mutex::new(0) });
        let sinks: Vec<Arc<dyn ProgressSink>> = vec![slow.clone()];
        let dispatcher = Dispatcher::new(&sinks);

        let started = std::time::Instant::now();
        for epoch in 1..=50 {
            dispatcher.dispatch(epoch_event(epoch, 1.0));
        }
        // 50 events at 5ms each would take 250ms if delivery were inline
        assert!(started.elapsed() < std::time::Duration::from_millis(200));

        drop(dispatcher);
        for _ in 0..500 {
            if *slow.seen.lock().unwrap_or_else(PoisonError::into_inner) == 50 {
                return;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        panic!("slow sink never drained its queue");
    }

    #[test]
    fn test_csv_sink_writes_epoch_rows_only() {
        let path = std::env::temp_dir().join(format!("minillm_loss_{}.csv", std::process::id()));
        let sink = CsvLossSink::create(&path).expect("create");
        sink.send(epoch_event(1, 1.0));
        sink.send(ProgressEvent::BatchComplete {
            model_id: "m".to_string(),
            epoch: 1,
            batch: 1,
            total_batches: 1,
            batch_loss: 1.0,
        });
        sink.send(epoch_event(2, 0.5));
        drop(sink);

        let text = std::fs::read_to_string(&path).expect("read");
        std::fs::remove_file(&path).ok();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "epoch,loss,perplexity,elapsed_seconds");
        assert!(lines[1].starts_with("1,1.000000,2.7183,"));
        assert!(lines[2].starts_with("2,0.500000,"));
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(TrainingStatus::Completed.is_terminal());
        assert!(TrainingStatus::Failed.is_terminal());
        assert!(!TrainingStatus::Paused.is_terminal());
    }
}
