use std::sync::mpsc::{Receiver, Sender, channel};
use std::thread::JoinHandle;

use tracing::{error, info};

use dcmkit_common::CancelFlag;

/// Progress update emitted by a background worker.
#[derive(Debug, Clone)]
pub struct Progress {
    pub current: usize,
    pub total: usize,
    pub message: String,
}

/// Events a worker publishes over its channel. Exactly one terminal
/// event (`Completed` or `Failed`) is sent per job; a cancelled job
/// completes with its partial result.
#[derive(Debug)]
pub enum JobEvent<T> {
    Progress(Progress),
    Completed(T),
    Failed(String),
}

/// Worker-side handle for publishing events and observing cancellation.
pub struct JobContext<T> {
    pub cancel: CancelFlag,
    sender: Sender<JobEvent<T>>,
}

impl<T> JobContext<T> {
    pub fn progress(&self, current: usize, total: usize, message: &str) {
        let _ = self.sender.send(JobEvent::Progress(Progress {
            current,
            total,
            message: message.to_string(),
        }));
    }
}

/// Foreground handle of a spawned worker.
pub struct JobHandle<T> {
    pub events: Receiver<JobEvent<T>>,
    pub cancel: CancelFlag,
    join: JoinHandle<()>,
}

impl<T> JobHandle<T> {
    /// Drains the event channel, logging progress, until the terminal
    /// event arrives.
    pub fn wait(self) -> Result<T, String> {
        let mut outcome = Err("worker terminated without a completion event".to_string());
        for event in self.events.iter() {
            match event {
                JobEvent::Progress(progress) => {
                    info!(
                        "[{}/{}] {}",
                        progress.current, progress.total, progress.message
                    );
                }
                JobEvent::Completed(value) => {
                    outcome = Ok(value);
                    break;
                }
                JobEvent::Failed(message) => {
                    outcome = Err(message);
                    break;
                }
            }
        }
        let _ = self.join.join();
        outcome
    }
}

/// Spawns one background worker. The closure reports progress through
/// the context, checks `ctx.cancel` between units of work, and returns
/// either its result or a human-readable failure message.
pub fn spawn<T, F>(name: &'static str, cancel: CancelFlag, work: F) -> JobHandle<T>
where
    T: Send + 'static,
    F: FnOnce(&JobContext<T>) -> Result<T, String> + Send + 'static,
{
    let (sender, events) = channel();
    let context = JobContext {
        cancel: cancel.clone(),
        sender: sender.clone(),
    };
    let join = std::thread::Builder::new()
        .name(name.to_string())
        .spawn(move || match work(&context) {
            Ok(result) => {
                let _ = sender.send(JobEvent::Completed(result));
            }
            Err(message) => {
                error!("Worker '{name}' failed: {message}");
                let _ = sender.send(JobEvent::Failed(message));
            }
        })
        .expect("failed to spawn worker thread");
    JobHandle {
        events,
        cancel,
        join,
    }
}
