//! Per-port I/O actor
//!
//! One spawned task owns the opened interface. Callers hand it boxed
//! operations over a bounded FIFO queue and wait on a oneshot for the single
//! reply. A caller-side timeout never blocks the actor: the operation may
//! still complete, its reply is simply dropped.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{PortOpener, PortTarget, SerialIo};
use crate::error::{HvError, HvResult};

const QUEUE_CAPACITY: usize = 64;
const STOP_GRACE: Duration = Duration::from_millis(1500);

/// Link notifications for observers. Not part of the command contract.
#[derive(Debug, Clone, PartialEq)]
pub enum PortEvent {
    Connected { port: String },
    Disconnected { port: String },
    IoError { port: String, message: String },
}

type Job<P> = Box<dyn for<'a> FnOnce(&'a mut Option<P>) -> BoxFuture<'a, ()> + Send>;

enum WorkerCommand<P> {
    Run(Job<P>),
    Stop,
}

fn job<P, F>(f: F) -> Job<P>
where
    F: for<'a> FnOnce(&'a mut Option<P>) -> BoxFuture<'a, ()> + Send + 'static,
{
    Box::new(f)
}

/// Errors after which the handle is unusable
fn is_fatal(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe | io::ErrorKind::NotConnected | io::ErrorKind::UnexpectedEof
    )
}

/// Handle to the actor that owns one opened interface.
///
/// A worker is never reused across reconnects; reopening means starting a
/// new worker.
pub struct PortWorker<P: SerialIo> {
    target: PortTarget,
    tx: mpsc::Sender<WorkerCommand<P>>,
    stopped: AtomicBool,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl<P: SerialIo> PortWorker<P> {
    /// Open the interface and start accepting calls.
    ///
    /// An open failure is reported once on `events` and returned; no task is
    /// left running.
    pub async fn start<O>(
        opener: &O,
        target: PortTarget,
        events: broadcast::Sender<PortEvent>,
    ) -> HvResult<Self>
    where
        O: PortOpener<Port = P>,
    {
        let port = match opener.open(&target).await {
            Ok(port) => port,
            Err(e) => {
                warn!("Port open failed: {} - {}", target, e);
                let _ = events.send(PortEvent::IoError {
                    port: target.port.clone(),
                    message: e.to_string(),
                });
                return Err(e);
            },
        };

        info!("Port worker started: {}", target);
        let _ = events.send(PortEvent::Connected {
            port: target.port.clone(),
        });

        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let handle = tokio::spawn(run_loop(Some(port), rx, target.port.clone(), events));

        Ok(Self {
            target,
            tx,
            stopped: AtomicBool::new(false),
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn target(&self) -> &PortTarget {
        &self.target
    }

    pub fn is_running(&self) -> bool {
        !self.stopped.load(Ordering::Acquire) && !self.tx.is_closed()
    }

    /// Queue `op` and wait for its result.
    ///
    /// `timeout` covers queueing and execution. Elapsing yields
    /// [`HvError::Timeout`]; a worker that is stopped or has lost its handle
    /// yields [`HvError::NotOpen`].
    pub async fn submit<T, F>(&self, timeout: Duration, op: F) -> HvResult<T>
    where
        T: Send + 'static,
        F: for<'a> FnOnce(&'a mut P) -> BoxFuture<'a, io::Result<T>> + Send + 'static,
    {
        if self.stopped.load(Ordering::Acquire) {
            return Err(HvError::not_open(format!("{} worker stopped", self.target.port)));
        }

        let deadline = tokio::time::Instant::now() + timeout;
        let (reply_tx, reply_rx) = oneshot::channel::<HvResult<T>>();
        let port_name = self.target.port.clone();

        let work = job(move |slot: &mut Option<P>| {
            async move {
                let outcome = match slot.as_mut() {
                    Some(port) => Some(op(port).await),
                    None => None,
                };
                let result = match outcome {
                    None => Err(HvError::not_open(format!("{port_name} is closed"))),
                    Some(Ok(value)) => Ok(value),
                    Some(Err(e)) => {
                        if is_fatal(&e) {
                            warn!("Fatal I/O error on {}, closing handle: {}", port_name, e);
                            *slot = None;
                        }
                        Err(HvError::from(e))
                    },
                };
                let _ = reply_tx.send(result);
            }
            .boxed()
        });

        match tokio::time::timeout_at(deadline, self.tx.send(WorkerCommand::Run(work))).await {
            Ok(Ok(())) => {},
            Ok(Err(_)) => {
                return Err(HvError::not_open(format!("{} worker gone", self.target.port)))
            },
            Err(_) => {
                return Err(HvError::timeout(format!(
                    "{} queue full for {:?}",
                    self.target.port, timeout
                )))
            },
        }

        match tokio::time::timeout_at(deadline, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(HvError::not_open(format!(
                "{} worker dropped the call",
                self.target.port
            ))),
            Err(_) => Err(HvError::timeout(format!(
                "{} no result within {:?}",
                self.target.port, timeout
            ))),
        }
    }

    /// Drain queued calls, close the interface and end the task.
    ///
    /// Waits at most 1.5 s; an operation stuck in I/O is left to finish on
    /// its own.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }

        if tokio::time::timeout(STOP_GRACE, self.tx.send(WorkerCommand::Stop))
            .await
            .is_err()
        {
            warn!("Port worker {} queue did not accept stop", self.target);
        }

        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            match tokio::time::timeout(STOP_GRACE, handle).await {
                Ok(_) => debug!("Port worker {} joined", self.target),
                Err(_) => warn!(
                    "Port worker {} did not stop within {:?}",
                    self.target, STOP_GRACE
                ),
            }
        }
    }
}

async fn run_loop<P: SerialIo>(
    mut slot: Option<P>,
    mut rx: mpsc::Receiver<WorkerCommand<P>>,
    port: String,
    events: broadcast::Sender<PortEvent>,
) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WorkerCommand::Run(work) => {
                let was_open = slot.is_some();
                work(&mut slot).await;
                if was_open && slot.is_none() {
                    let _ = events.send(PortEvent::IoError {
                        port: port.clone(),
                        message: "handle closed after fatal I/O error".to_string(),
                    });
                }
            },
            WorkerCommand::Stop => break,
        }
    }

    drop(slot);
    info!("Port worker stopped: {}", port);
    let _ = events.send(PortEvent::Disconnected { port });
}
