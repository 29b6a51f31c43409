// src/capture/recorder.rs
//! Best-effort exchange recorder
//!
//! `record()` redacts and pushes onto a lock-free queue and returns
//! immediately. A background writer drains the queue in batches and hands
//! them to the sink on a blocking worker. Queue overflow and sink failures
//! are counted and logged; neither ever reaches the response path.

use crate::capture::exchange::Exchange;
use crate::capture::queue::ExchangeQueue;
use crate::capture::redactor::Redactor;
use crate::capture::sink::CaptureSink;
use crate::utils::config::CaptureConfig;
use crate::utils::errors::CaptureError;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Recorder configuration
#[derive(Debug, Clone)]
pub struct RecorderConfig {
    /// When false, `record()` discards everything
    pub enabled: bool,

    /// Maximum queued exchanges
    pub queue_capacity: usize,

    /// Exchanges per sink write
    pub batch_size: usize,

    /// Writer wake-up interval
    pub flush_interval: Duration,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self::from(&CaptureConfig::default())
    }
}

impl From<&CaptureConfig> for RecorderConfig {
    fn from(config: &CaptureConfig) -> Self {
        Self {
            enabled: config.enabled,
            queue_capacity: config.queue_capacity,
            batch_size: config.batch_size,
            flush_interval: Duration::from_millis(config.flush_interval_ms),
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    recorded: AtomicU64,
    written: AtomicU64,
    dropped: AtomicU64,
    sink_failures: AtomicU64,
}

/// Recorder statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecorderStats {
    /// Exchanges accepted onto the queue
    pub recorded: u64,
    /// Exchanges the sink accepted
    pub written: u64,
    /// Exchanges rejected by a full queue
    pub dropped: u64,
    /// Exchanges lost to sink errors
    pub sink_failures: u64,

    /// Exchanges waiting for the writer
    pub queued: usize,
}

pub struct CaptureRecorder {
    config: RecorderConfig,
    redactor: Redactor,
    queue: Arc<ExchangeQueue>,
    sink: Arc<dyn CaptureSink>,
    counters: Arc<Counters>,
    flush_notify: Arc<Notify>,
    // serializes drain+write so batches reach the sink in queue order
    write_lock: Arc<tokio::sync::Mutex<()>>,
    shutdown: CancellationToken,
    writer_handle: Mutex<Option<JoinHandle<()>>>,
}

impl CaptureRecorder {
    pub fn new(config: RecorderConfig, redactor: Redactor, sink: Arc<dyn CaptureSink>) -> Self {
        info!(
            "Initializing capture recorder (sink={}, capacity={})",
            sink.name(),
            config.queue_capacity
        );

        Self {
            queue: Arc::new(ExchangeQueue::new(config.queue_capacity)),
            config,
            redactor,
            sink,
            counters: Arc::new(Counters::default()),
            flush_notify: Arc::new(Notify::new()),
            write_lock: Arc::new(tokio::sync::Mutex::new(())),
            shutdown: CancellationToken::new(),
            writer_handle: Mutex::new(None),
        }
    }

    /// Start the background writer. Must run inside a tokio runtime.
    pub fn start(&self) {
        let mut handle = self.writer_handle.lock();
        if handle.is_some() {
            return;
        }

        let queue = Arc::clone(&self.queue);
        let sink = Arc::clone(&self.sink);
        let counters = Arc::clone(&self.counters);
        let notify = Arc::clone(&self.flush_notify);
        let write_lock = Arc::clone(&self.write_lock);
        let shutdown = self.shutdown.clone();
        let batch_size = self.config.batch_size;
        let flush_interval = self.config.flush_interval;

        *handle = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(flush_interval);
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = notify.notified() => {}
                    _ = shutdown.cancelled() => break,
                }
                let _guard = write_lock.lock().await;
                while !queue.is_empty() {
                    let batch = queue.drain(batch_size);
                    Self::write_batch(&sink, &counters, batch).await;
                }

                let stats = queue.stats();
                metrics::gauge!("relay_capture_queue_depth").set(stats.current_size as f64);
                trace!(
                    "Capture queue: {} pushed, {} popped, {} dropped, {}/{} queued",
                    stats.push_count,
                    stats.pop_count,
                    stats.drop_count,
                    stats.current_size,
                    stats.capacity
                );
            }
            debug!("Capture writer stopped");
        }));
    }

    /// Hand an exchange to the sink. Never blocks, never fails the caller.
    pub fn record(&self, exchange: Exchange) {
        if !self.config.enabled {
            return;
        }

        let exchange = self.redactor.redact_exchange(exchange);
        match self.queue.push(exchange) {
            Ok(()) => {
                self.counters.recorded.fetch_add(1, Ordering::Relaxed);
                if self.queue.len() >= self.config.batch_size {
                    self.flush_notify.notify_one();
                }
            }
            Err(dropped) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("relay_capture_dropped_total").increment(1);
                warn!(
                    "{}; dropping exchange {}",
                    CaptureError::QueueFull,
                    dropped.id
                );
            }
        }
    }

    /// Drain everything queued so far and wait for the sink to take it
    pub async fn flush(&self) {
        let _guard = self.write_lock.lock().await;
        while !self.queue.is_empty() {
            let batch = self.queue.drain(self.config.batch_size);
            Self::write_batch(&self.sink, &self.counters, batch).await;
        }
    }

    async fn write_batch(sink: &Arc<dyn CaptureSink>, counters: &Counters, batch: Vec<Exchange>) {
        if batch.is_empty() {
            return;
        }
        let count = batch.len() as u64;
        let sink = Arc::clone(sink);

        let result = tokio::task::spawn_blocking(move || sink.write_batch(&batch))
            .await
            .unwrap_or_else(|e| Err(CaptureError::SinkUnavailable(format!("Sink worker panicked: {}", e))));

        match result {
            Ok(()) => {
                counters.written.fetch_add(count, Ordering::Relaxed);
            }
            Err(e) => {
                counters.sink_failures.fetch_add(count, Ordering::Relaxed);
                metrics::counter!("relay_capture_sink_failures_total").increment(count);
                warn!("Capture sink write failed, {} exchanges lost: {}", count, e);
            }
        }
    }

    pub fn stats(&self) -> RecorderStats {
        RecorderStats {
            recorded: self.counters.recorded.load(Ordering::Relaxed),
            written: self.counters.written.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            sink_failures: self.counters.sink_failures.load(Ordering::Relaxed),
            queued: self.queue.stats().current_size,
        }
    }

    /// Stop the writer and flush what is left
    pub async fn shutdown(&self) {
        info!("Shutting down capture recorder");
        self.shutdown.cancel();

        let handle = self.writer_handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.flush().await;
    }
}
