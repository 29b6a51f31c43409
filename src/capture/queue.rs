// src/capture/queue.rs
//! Bounded lock-free exchange queue
//!
//! Push never blocks: when the queue is full the exchange is handed back to
//! the caller and counted as dropped.

use crate::capture::exchange::Exchange;
use crossbeam::queue::ArrayQueue;
use std::sync::atomic::{AtomicU64, Ordering};

pub struct ExchangeQueue {
    queue: ArrayQueue<Exchange>,
    push_count: AtomicU64,
    pop_count: AtomicU64,
    drop_count: AtomicU64,
}

impl ExchangeQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity),
            push_count: AtomicU64::new(0),
            pop_count: AtomicU64::new(0),
            drop_count: AtomicU64::new(0),
        }
    }

    pub fn push(&self, exchange: Exchange) -> Result<(), Exchange> {
        match self.queue.push(exchange) {
            Ok(()) => {
                self.push_count.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(exchange) => {
                self.drop_count.fetch_add(1, Ordering::Relaxed);
                Err(exchange)
            }
        }
    }

    pub fn try_pop(&self) -> Option<Exchange> {
        let exchange = self.queue.pop()?;
        self.pop_count.fetch_add(1, Ordering::Relaxed);
        Some(exchange)
    }

    /// Pop up to `max` exchanges in FIFO order
    pub fn drain(&self, max: usize) -> Vec<Exchange> {
        let mut batch = Vec::with_capacity(max.min(self.len()));
        while batch.len() < max {
            match self.try_pop() {
                Some(exchange) => batch.push(exchange),
                None => break,
            }
        }
        batch
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            push_count: self.push_count.load(Ordering::Relaxed),
            pop_count: self.pop_count.load(Ordering::Relaxed),
            drop_count: self.drop_count.load(Ordering::Relaxed),
            current_size: self.queue.len(),
            capacity: self.queue.capacity(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }
}

#[derive(Debug, Clone)]
pub struct QueueStats {
    pub push_count: u64,
    pub pop_count: u64,
    /// Exchanges rejected because the queue was full
    pub drop_count: u64,
    pub current_size: usize,
    pub capacity: usize,
}
