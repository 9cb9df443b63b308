//! Routing worker threads and the worker pool.
//!
//! Each worker is an isolated OS thread that owns a routing table
//! (producer id → consumer sinks) and does all per-packet fan-out work, so
//! CPU-bound forwarding never runs on the signaling runtime. Registry
//! mutations reach the worker through its command channel only; nothing else
//! touches the table.
//!
//! Load is measured as the worker thread's own cumulative user+system CPU
//! time (`getrusage(RUSAGE_THREAD)`), queried with a synchronous round-trip.
//! This approximates least-loaded scheduling without a central load counter
//! and stays correct even when rooms close silently.

use crate::error::MediaError;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// Per-consumer packet channel capacity. Beyond this the consumer is too
/// slow and packets are dropped.
const CONSUMER_CHANNEL_CAPACITY: usize = 512;

/// Cumulative CPU time consumed by a worker thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceUsage {
    pub user_micros: u64,
    pub system_micros: u64,
}

impl ResourceUsage {
    pub fn total_micros(&self) -> u64 {
        self.user_micros + self.system_micros
    }
}

/// A consumer registration in the routing table.
pub(crate) struct ConsumerSink {
    pub consumer_id: String,
    pub paused: Arc<AtomicBool>,
    pub closed: Arc<AtomicBool>,
    pub tx: mpsc::Sender<Bytes>,
}

pub(crate) enum WorkerCommand {
    Usage(oneshot::Sender<ResourceUsage>),
    AddProducer {
        producer_id: String,
    },
    RemoveProducer {
        producer_id: String,
    },
    AddConsumer {
        producer_id: String,
        sink: ConsumerSink,
    },
    RemoveConsumer {
        producer_id: String,
        consumer_id: String,
    },
    Forward {
        producer_id: String,
        packet: Bytes,
    },
}

/// Cloneable handle to one routing worker thread.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    index: usize,
    cmd_tx: mpsc::UnboundedSender<WorkerCommand>,
}

impl WorkerHandle {
    pub fn index(&self) -> usize {
        self.index
    }

    /// Queries the worker's cumulative CPU usage.
    ///
    /// Returns `None` when the worker thread is gone or fails to answer;
    /// the pool treats that as the worker being unavailable.
    pub async fn resource_usage(&self) -> Option<ResourceUsage> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx.send(WorkerCommand::Usage(tx)).ok()?;
        rx.await.ok()
    }

    pub(crate) fn send(&self, command: WorkerCommand) -> Result<(), MediaError> {
        self.cmd_tx
            .send(command)
            .map_err(|_| MediaError::WorkerUnavailable(self.index))
    }

    /// Allocates a consumer packet channel sized for this worker.
    pub(crate) fn consumer_channel() -> (mpsc::Sender<Bytes>, mpsc::Receiver<Bytes>) {
        mpsc::channel(CONSUMER_CHANNEL_CAPACITY)
    }
}

/// Reads this thread's cumulative CPU time.
fn thread_resource_usage() -> ResourceUsage {
    let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::getrusage(libc::RUSAGE_THREAD, &mut usage) };
    if rc != 0 {
        tracing::warn!("getrusage(RUSAGE_THREAD) failed, reporting zero usage");
        return ResourceUsage {
            user_micros: 0,
            system_micros: 0,
        };
    }
    let to_micros =
        |tv: libc::timeval| -> u64 { tv.tv_sec as u64 * 1_000_000 + tv.tv_usec as u64 };
    ResourceUsage {
        user_micros: to_micros(usage.ru_utime),
        system_micros: to_micros(usage.ru_stime),
    }
}

/// The routing loop run by each worker thread.
fn run_worker(index: usize, mut cmd_rx: mpsc::UnboundedReceiver<WorkerCommand>) {
    let mut routes: HashMap<String, Vec<ConsumerSink>> = HashMap::new();

    while let Some(command) = cmd_rx.blocking_recv() {
        match command {
            WorkerCommand::Usage(reply) => {
                let _ = reply.send(thread_resource_usage());
            }
            WorkerCommand::AddProducer { producer_id } => {
                routes.entry(producer_id).or_default();
            }
            WorkerCommand::RemoveProducer { producer_id } => {
                routes.remove(&producer_id);
            }
            WorkerCommand::AddConsumer { producer_id, sink } => {
                routes.entry(producer_id).or_default().push(sink);
            }
            WorkerCommand::RemoveConsumer {
                producer_id,
                consumer_id,
            } => {
                if let Some(sinks) = routes.get_mut(&producer_id) {
                    sinks.retain(|s| s.consumer_id != consumer_id);
                }
            }
            WorkerCommand::Forward {
                producer_id,
                packet,
            } => {
                let Some(sinks) = routes.get(&producer_id) else {
                    continue;
                };
                for sink in sinks {
                    if sink.paused.load(Ordering::Relaxed) || sink.closed.load(Ordering::Relaxed)
                    {
                        continue;
                    }
                    if sink.tx.try_send(packet.clone()).is_err() {
                        tracing::warn!(
                            worker = index,
                            consumer_id = %sink.consumer_id,
                            "dropping packet for slow consumer"
                        );
                    }
                }
            }
        }
    }

    tracing::debug!(worker = index, "routing worker stopped");
}

/// Picks the index of the worker with the minimum cumulative usage.
///
/// Ties resolve to the lowest index (first found). Returns `None` when no
/// usage could be determined for any worker.
pub(crate) fn select_least_loaded(usages: &[Option<ResourceUsage>]) -> Option<usize> {
    let mut selected: Option<usize> = None;
    let mut min_load = u64::MAX;
    for (index, usage) in usages.iter().enumerate() {
        if let Some(usage) = usage {
            if usage.total_micros() < min_load {
                min_load = usage.total_micros();
                selected = Some(index);
            }
        }
    }
    selected
}

/// A fixed pool of routing workers created at process start.
///
/// Workers are never destroyed during the process lifetime.
pub struct MediaWorkerPool {
    workers: Vec<WorkerHandle>,
}

impl MediaWorkerPool {
    /// Spawns `size` worker threads.
    pub fn new(size: usize) -> Self {
        let mut workers = Vec::with_capacity(size);
        for index in 0..size {
            let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
            std::thread::Builder::new()
                .name(format!("media-worker-{index}"))
                .spawn(move || run_worker(index, cmd_rx))
                .expect("failed to spawn media worker thread");
            workers.push(WorkerHandle { index, cmd_tx });
        }
        tracing::info!(count = size, "media worker pool started");
        Self { workers }
    }

    /// Spawns one worker per available CPU.
    pub fn with_default_size() -> Self {
        let size = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self::new(size)
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Selects the worker with the minimum summed CPU usage at call time.
    ///
    /// Errors with [`MediaError::NoWorkersInitialized`] when the pool is
    /// empty, and [`MediaError::NoWorkerAvailable`] when usage could not be
    /// determined for any worker.
    pub async fn least_loaded(&self) -> Result<WorkerHandle, MediaError> {
        if self.workers.is_empty() {
            return Err(MediaError::NoWorkersInitialized);
        }

        let mut usages = Vec::with_capacity(self.workers.len());
        for worker in &self.workers {
            usages.push(worker.resource_usage().await);
        }

        let index = select_least_loaded(&usages).ok_or(MediaError::NoWorkerAvailable)?;
        Ok(self.workers[index].clone())
    }
}
