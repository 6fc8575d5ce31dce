// Copyright 2024 Escrow Relayer Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![warn(missing_docs)]
//! # Order Queue
//!
//! A bounded FIFO of pending orders with per-order retry state. The
//! submitter pipeline chains three of these; each stage plugs its own
//! handler in and composes with the next through the completion hook.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

const QUEUE_CAPACITY: usize = 1024;

/// The hooks a queue owner implements.
///
/// Exactly one `on_order_completion` call is made per accepted order,
/// with `success` only when a terminal non-null result was produced.
#[async_trait::async_trait]
pub trait QueueOrderHandler: Send + Sync + 'static {
    /// The order record flowing through the queue.
    type Order: Clone + Send + Sync + 'static;
    /// The result a successfully handled order produces.
    type Output: Send + Sync + 'static;

    /// Attempts to process an order. `Ok(None)` means "skip without
    /// retrying"; an `Err` consults [`Self::handle_failed_order`].
    async fn handle_order(
        &self,
        order: &Self::Order,
        retry_count: u32,
    ) -> escrow_relayer_utils::Result<Option<Self::Output>>;

    /// Whether a failed order should be retried. Defaults to yes; the
    /// queue still stops after `max_tries` failures.
    async fn handle_failed_order(
        &self,
        _order: &Self::Order,
        _retry_count: u32,
        _error: &escrow_relayer_utils::Error,
    ) -> bool {
        true
    }

    /// Called exactly once per order when it leaves the queue.
    async fn on_order_completion(
        &self,
        order: Self::Order,
        success: bool,
        result: Option<Self::Output>,
        retry_count: u32,
    );
}

/// Scheduling parameters of a queue.
#[derive(Debug, Clone)]
pub struct ProcessingQueueConfig {
    /// Delay before a failed order becomes eligible again.
    pub retry_interval: Duration,
    /// Idle sleep between scheduling passes when nothing is eligible.
    pub processing_interval: Duration,
    /// Failures after which an order completes unsuccessfully.
    pub max_tries: u32,
    /// Delay before a freshly enqueued order becomes eligible.
    pub initial_delay: Duration,
}

impl Default for ProcessingQueueConfig {
    fn default() -> Self {
        Self {
            retry_interval: Duration::from_millis(2_000),
            processing_interval: Duration::from_millis(100),
            max_tries: 3,
            initial_delay: Duration::ZERO,
        }
    }
}

/// The submission side of a queue. Cloneable; enqueueing blocks when
/// the queue is full.
pub struct QueueHandle<O> {
    tx: mpsc::Sender<O>,
}

impl<O> Clone for QueueHandle<O> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<O: Send> QueueHandle<O> {
    /// Adds an order to the queue.
    pub async fn enqueue(&self, order: O) -> escrow_relayer_utils::Result<()> {
        self.tx
            .send(order)
            .await
            .map_err(|_| escrow_relayer_utils::Error::Generic("queue closed"))
    }
}

struct PendingOrder<O> {
    order: O,
    retry_count: u32,
    process_at: Instant,
}

/// A generic bounded retry queue driven by a [`QueueOrderHandler`].
pub struct ProcessingQueue<H: QueueOrderHandler> {
    name: String,
    config: ProcessingQueueConfig,
    handler: Arc<H>,
    rx: mpsc::Receiver<H::Order>,
}

impl<H: QueueOrderHandler> ProcessingQueue<H> {
    /// Creates a queue and its submission handle.
    pub fn new(
        name: impl Into<String>,
        config: ProcessingQueueConfig,
        handler: Arc<H>,
    ) -> (Self, QueueHandle<H::Order>) {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        (
            Self {
                name: name.into(),
                config,
                handler,
                rx,
            },
            QueueHandle { tx },
        )
    }

    /// Runs the queue until every handle is dropped and the backlog is
    /// drained.
    #[tracing::instrument(skip_all, fields(queue = %self.name))]
    pub async fn run(mut self) {
        let mut pending: VecDeque<PendingOrder<H::Order>> = VecDeque::new();
        loop {
            if pending.is_empty() {
                // nothing in flight, block for the next arrival.
                let arrival = self.rx.recv().await;
                match arrival {
                    Some(order) => pending.push_back(self.admit(order)),
                    None => break,
                }
            }
            loop {
                let arrival = self.rx.try_recv();
                match arrival {
                    Ok(order) => pending.push_back(self.admit(order)),
                    Err(_) => break,
                }
            }

            let now = Instant::now();
            let Some(pos) =
                pending.iter().position(|p| p.process_at <= now)
            else {
                tokio::time::sleep(self.config.processing_interval).await;
                continue;
            };
            let item = pending.remove(pos).expect("position just found");
            if let Some(back) = self.process(item).await {
                pending.push_back(back);
            }
        }
        tracing::trace!("queue drained, exiting");
    }

    fn admit(&self, order: H::Order) -> PendingOrder<H::Order> {
        PendingOrder {
            order,
            retry_count: 0,
            process_at: Instant::now() + self.config.initial_delay,
        }
    }

    /// Processes one order; returns it when it must be rescheduled.
    async fn process(
        &self,
        mut item: PendingOrder<H::Order>,
    ) -> Option<PendingOrder<H::Order>> {
        match self
            .handler
            .handle_order(&item.order, item.retry_count)
            .await
        {
            Ok(Some(result)) => {
                self.handler
                    .on_order_completion(
                        item.order,
                        true,
                        Some(result),
                        item.retry_count,
                    )
                    .await;
                None
            }
            Ok(None) => {
                // the handler decided to skip; terminal, no retry.
                self.handler
                    .on_order_completion(
                        item.order,
                        false,
                        None,
                        item.retry_count,
                    )
                    .await;
                None
            }
            Err(error) => {
                tracing::event!(
                    target: escrow_relayer_utils::probe::TARGET,
                    tracing::Level::TRACE,
                    kind = %escrow_relayer_utils::probe::Kind::Retry,
                    queue = %self.name,
                    retry_count = item.retry_count,
                    error = %error,
                );
                let retry = self
                    .handler
                    .handle_failed_order(
                        &item.order,
                        item.retry_count,
                        &error,
                    )
                    .await;
                item.retry_count += 1;
                if retry && item.retry_count < self.config.max_tries {
                    item.process_at =
                        Instant::now() + self.config.retry_interval;
                    Some(item)
                } else {
                    self.handler
                        .on_order_completion(
                            item.order,
                            false,
                            None,
                            item.retry_count,
                        )
                        .await;
                    None
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    struct Recorder {
        /// orders that fail this many times before succeeding.
        fail_times: u32,
        /// return Ok(None) instead of a result.
        skip: bool,
        /// refuse retries from handle_failed_order.
        refuse_retry: bool,
        attempts: AtomicU32,
        completions: Mutex<Vec<(u64, bool, Option<u64>, u32)>>,
    }

    #[async_trait::async_trait]
    impl QueueOrderHandler for Recorder {
        type Order = u64;
        type Output = u64;

        async fn handle_order(
            &self,
            order: &u64,
            _retry_count: u32,
        ) -> escrow_relayer_utils::Result<Option<u64>> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < self.fail_times {
                return Err(escrow_relayer_utils::Error::Generic(
                    "induced failure",
                ));
            }
            if self.skip {
                return Ok(None);
            }
            Ok(Some(order * 2))
        }

        async fn handle_failed_order(
            &self,
            _order: &u64,
            _retry_count: u32,
            _error: &escrow_relayer_utils::Error,
        ) -> bool {
            !self.refuse_retry
        }

        async fn on_order_completion(
            &self,
            order: u64,
            success: bool,
            result: Option<u64>,
            retry_count: u32,
        ) {
            self.completions
                .lock()
                .push((order, success, result, retry_count));
        }
    }

    fn fast_config(max_tries: u32) -> ProcessingQueueConfig {
        ProcessingQueueConfig {
            retry_interval: Duration::from_millis(10),
            processing_interval: Duration::from_millis(5),
            max_tries,
            initial_delay: Duration::ZERO,
        }
    }

    async fn wait_for_completions(
        handler: &Arc<Recorder>,
        count: usize,
    ) -> Vec<(u64, bool, Option<u64>, u32)> {
        for _ in 0..200 {
            if handler.completions.lock().len() >= count {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handler.completions.lock().clone()
    }

    #[tokio::test]
    async fn success_completes_exactly_once() {
        let handler = Arc::new(Recorder::default());
        let (queue, handle) =
            ProcessingQueue::new("test", fast_config(3), handler.clone());
        tokio::spawn(queue.run());

        handle.enqueue(21).await.unwrap();
        let completions = wait_for_completions(&handler, 1).await;
        assert_eq!(completions, vec![(21, true, Some(42), 0)]);
        // no second completion sneaks in afterwards.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(handler.completions.lock().len(), 1);
    }

    #[tokio::test]
    async fn failures_retry_until_success() {
        let handler = Arc::new(Recorder {
            fail_times: 2,
            ..Default::default()
        });
        let (queue, handle) =
            ProcessingQueue::new("test", fast_config(5), handler.clone());
        tokio::spawn(queue.run());

        handle.enqueue(5).await.unwrap();
        let completions = wait_for_completions(&handler, 1).await;
        assert_eq!(completions, vec![(5, true, Some(10), 2)]);
        assert_eq!(handler.attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_complete_unsuccessfully() {
        let handler = Arc::new(Recorder {
            fail_times: u32::MAX,
            ..Default::default()
        });
        let (queue, handle) =
            ProcessingQueue::new("test", fast_config(3), handler.clone());
        tokio::spawn(queue.run());

        handle.enqueue(7).await.unwrap();
        let completions = wait_for_completions(&handler, 1).await;
        assert_eq!(completions, vec![(7, false, None, 3)]);
        assert_eq!(handler.attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn skip_is_terminal_without_retry() {
        let handler = Arc::new(Recorder {
            skip: true,
            ..Default::default()
        });
        let (queue, handle) =
            ProcessingQueue::new("test", fast_config(3), handler.clone());
        tokio::spawn(queue.run());

        handle.enqueue(9).await.unwrap();
        let completions = wait_for_completions(&handler, 1).await;
        assert_eq!(completions, vec![(9, false, None, 0)]);
        assert_eq!(handler.attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn refused_retry_fails_immediately() {
        let handler = Arc::new(Recorder {
            fail_times: u32::MAX,
            refuse_retry: true,
            ..Default::default()
        });
        let (queue, handle) =
            ProcessingQueue::new("test", fast_config(5), handler.clone());
        tokio::spawn(queue.run());

        handle.enqueue(3).await.unwrap();
        let completions = wait_for_completions(&handler, 1).await;
        assert_eq!(completions, vec![(3, false, None, 1)]);
        assert_eq!(handler.attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn orders_complete_in_fifo_order() {
        let handler = Arc::new(Recorder::default());
        let (queue, handle) =
            ProcessingQueue::new("test", fast_config(3), handler.clone());
        tokio::spawn(queue.run());

        for n in [1u64, 2, 3, 4] {
            handle.enqueue(n).await.unwrap();
        }
        let completions = wait_for_completions(&handler, 4).await;
        let orders: Vec<u64> =
            completions.iter().map(|(o, _, _, _)| *o).collect();
        assert_eq!(orders, vec![1, 2, 3, 4]);
    }
}
