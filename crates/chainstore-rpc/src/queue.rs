//! Per-network rate-limited request queue.
//!
//! Requests are dispatched in strict submission order (FIFO; there is no
//! priority key), paced by a single-shot timer: every `interval` the queue
//! releases up to `batch_size` tasks to the transport at once. A failed RPC
//! call rejects its own task only; siblings are unaffected.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;

use chainstore_observability::ChainStoreMetrics;

use crate::error::TransportError;
use crate::request::{JsonRpcRequest, RpcCall};
use crate::transport::RpcTransport;

/// Configuration for a [`RequestQueue`].
#[derive(Debug, Clone)]
pub struct QueueOptions {
    /// Network label used in logs and metrics (e.g. `"mainnet"`).
    pub network: String,
    /// Requests per second budget for this network's provider.
    pub max_requests_per_second: u64,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            network: "default".into(),
            max_requests_per_second: 50,
        }
    }
}

/// Derive the dispatch pacing from a requests-per-second budget.
///
/// Below 20 rps the queue releases one request every `1000 / rps` ms; above
/// that it ticks every 50 ms and releases `rps / 20` requests per tick.
fn pacing(max_rps: u64) -> (Duration, usize) {
    let rps = max_rps.max(1);
    let natural_ms = 1000 / rps;
    let interval_ms = natural_ms.max(50);
    let batch_size = if interval_ms == natural_ms {
        1
    } else {
        (rps / 20).max(1) as usize
    };
    (Duration::from_millis(interval_ms), batch_size)
}

struct QueuedTask {
    call: RpcCall,
    enqueued_at: Instant,
    reply: oneshot::Sender<Result<serde_json::Value, TransportError>>,
}

struct QueueState {
    queue: VecDeque<QueuedTask>,
    last_dispatch: Option<Instant>,
    paused: bool,
    timer_armed: bool,
}

struct QueueInner {
    transport: Arc<dyn RpcTransport>,
    network: String,
    interval: Duration,
    batch_size: usize,
    state: Mutex<QueueState>,
    in_flight: AtomicUsize,
    next_id: AtomicU64,
    metrics: Option<ChainStoreMetrics>,
}

/// FIFO request queue in front of one network's RPC transport.
///
/// Cheap to clone; all clones share the same queue and pacing state.
#[derive(Clone)]
pub struct RequestQueue {
    inner: Arc<QueueInner>,
}

impl RequestQueue {
    pub fn new(
        transport: Arc<dyn RpcTransport>,
        options: QueueOptions,
        metrics: Option<ChainStoreMetrics>,
    ) -> Self {
        let (interval, batch_size) = pacing(options.max_requests_per_second);
        Self {
            inner: Arc::new(QueueInner {
                transport,
                network: options.network,
                interval,
                batch_size,
                state: Mutex::new(QueueState {
                    queue: VecDeque::new(),
                    last_dispatch: None,
                    paused: false,
                    timer_armed: false,
                }),
                in_flight: AtomicUsize::new(0),
                next_id: AtomicU64::new(1),
                metrics,
            }),
        }
    }

    /// Enqueue a call and return a future that settles with its result.
    ///
    /// Tasks dropped by [`RequestQueue::clear`] settle with
    /// [`TransportError::Cancelled`].
    pub fn request(
        &self,
        call: RpcCall,
    ) -> impl Future<Output = Result<serde_json::Value, TransportError>> {
        let (reply, rx) = oneshot::channel();
        {
            let mut state = self.inner.state.lock().unwrap();
            state.queue.push_back(QueuedTask {
                call,
                enqueued_at: Instant::now(),
                reply,
            });
        }
        process(&self.inner);
        async move { rx.await.unwrap_or(Err(TransportError::Cancelled)) }
    }

    /// Number of tasks enqueued but not yet dispatched.
    pub fn size(&self) -> usize {
        self.inner.state.lock().unwrap().queue.len()
    }

    /// Number of dispatched tasks whose responses are still outstanding.
    pub fn pending(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    /// Resume dispatching after a [`RequestQueue::pause`].
    pub fn start(&self) {
        self.inner.state.lock().unwrap().paused = false;
        process(&self.inner);
    }

    /// Stop dispatching. Already in-flight requests still settle.
    pub fn pause(&self) {
        self.inner.state.lock().unwrap().paused = true;
    }

    /// Drop every undispatched task and reset the pacing clock.
    ///
    /// In-flight requests are left alone; the transport does not expose
    /// cancellation.
    pub fn clear(&self) {
        let dropped = {
            let mut state = self.inner.state.lock().unwrap();
            state.last_dispatch = None;
            state.queue.drain(..).collect::<Vec<_>>()
        };
        if !dropped.is_empty() {
            tracing::debug!(
                network = %self.inner.network,
                count = dropped.len(),
                "cleared undispatched requests"
            );
        }
        // Dropping the reply senders settles the callers with Cancelled.
    }
}

/// Scheduler tick. Dispatches a batch when the interval has elapsed,
/// otherwise arms the (single) timer for the remainder.
fn process(inner: &Arc<QueueInner>) {
    let mut batch = Vec::new();
    {
        let mut state = inner.state.lock().unwrap();
        if state.paused || state.queue.is_empty() {
            return;
        }

        let now = Instant::now();
        let waited = state
            .last_dispatch
            .map(|last| now.saturating_duration_since(last));
        if let Some(waited) = waited {
            if waited < inner.interval {
                if !state.timer_armed {
                    state.timer_armed = true;
                    let delay = inner.interval - waited;
                    let handle = Arc::clone(inner);
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        handle.state.lock().unwrap().timer_armed = false;
                        process(&handle);
                    });
                }
                return;
            }
        }

        state.last_dispatch = Some(now);
        let n = inner.batch_size.min(state.queue.len());
        batch.extend(state.queue.drain(..n));
    }

    for task in batch {
        dispatch(inner, task);
    }
    // Anything left waits for the next interval.
    process(inner);
}

fn dispatch(inner: &Arc<QueueInner>, task: QueuedTask) {
    inner.in_flight.fetch_add(1, Ordering::SeqCst);
    let id = inner.next_id.fetch_add(1, Ordering::Relaxed);
    let inner = Arc::clone(inner);
    tokio::spawn(async move {
        let lag = task.enqueued_at.elapsed();
        if let Some(metrics) = &inner.metrics {
            metrics.record_rpc_lag(&task.call.method, &inner.network, lag);
        }

        let started = Instant::now();
        let request = JsonRpcRequest::from_call(id, &task.call);
        let result = match inner.transport.send(request).await {
            Ok(response) => response.into_result().map_err(TransportError::Rpc),
            Err(e) => Err(e),
        };

        if let Some(metrics) = &inner.metrics {
            metrics.record_rpc_duration(&task.call.method, &inner.network, started.elapsed());
        }
        if let Err(e) = &result {
            tracing::debug!(
                network = %inner.network,
                method = %task.call.method,
                error = %e,
                "request failed"
            );
        }

        inner.in_flight.fetch_sub(1, Ordering::SeqCst);
        // The caller may have dropped its future; nothing to do then.
        let _ = task.reply.send(result);
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{JsonRpcResponse, RpcId};
    use async_trait::async_trait;
    use serde_json::json;

    struct RecordingTransport {
        sends: Mutex<Vec<(String, serde_json::Value, Instant)>>,
        fail_method: Option<String>,
    }

    impl RecordingTransport {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                sends: Mutex::new(Vec::new()),
                fail_method: None,
            })
        }

        fn failing(method: &str) -> Arc<Self> {
            Arc::new(Self {
                sends: Mutex::new(Vec::new()),
                fail_method: Some(method.to_string()),
            })
        }

        fn dispatch_times(&self) -> Vec<Instant> {
            self.sends.lock().unwrap().iter().map(|s| s.2).collect()
        }

        fn methods(&self) -> Vec<String> {
            self.sends.lock().unwrap().iter().map(|s| s.0.clone()).collect()
        }
    }

    #[async_trait]
    impl RpcTransport for RecordingTransport {
        async fn send(&self, req: JsonRpcRequest) -> Result<JsonRpcResponse, TransportError> {
            self.sends.lock().unwrap().push((
                req.method.clone(),
                json!(req.params),
                Instant::now(),
            ));
            if self.fail_method.as_deref() == Some(req.method.as_str()) {
                return Err(TransportError::Http("mock failure".into()));
            }
            Ok(JsonRpcResponse::of_result(req.id, json!("0x1")))
        }

        fn url(&self) -> &str {
            "mock"
        }
    }

    fn queue(transport: Arc<RecordingTransport>, rps: u64) -> RequestQueue {
        RequestQueue::new(
            transport,
            QueueOptions {
                network: "testnet".into(),
                max_requests_per_second: rps,
            },
            None,
        )
    }

    #[test]
    fn pacing_schedule() {
        assert_eq!(pacing(1), (Duration::from_millis(1000), 1));
        assert_eq!(pacing(10), (Duration::from_millis(100), 1));
        assert_eq!(pacing(100), (Duration::from_millis(50), 5));
        assert_eq!(pacing(1000), (Duration::from_millis(50), 50));
    }

    #[tokio::test(start_paused = true)]
    async fn second_request_waits_a_full_interval() {
        let transport = RecordingTransport::new();
        let q = queue(transport.clone(), 1);

        let first = q.request(RpcCall::new("eth_blockNumber", vec![]));
        let second = q.request(RpcCall::new("eth_chainId", vec![]));
        first.await.unwrap();
        second.await.unwrap();

        let times = transport.dispatch_times();
        assert_eq!(times.len(), 2);
        assert!(times[1] - times[0] >= Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn dispatch_preserves_submission_order() {
        let transport = RecordingTransport::new();
        let q = queue(transport.clone(), 10);

        let a = q.request(RpcCall::new("m_a", vec![]));
        let b = q.request(RpcCall::new("m_b", vec![]));
        let c = q.request(RpcCall::new("m_c", vec![]));
        let (ra, rb, rc) = tokio::join!(a, b, c);
        ra.unwrap();
        rb.unwrap();
        rc.unwrap();

        assert_eq!(transport.methods(), vec!["m_a", "m_b", "m_c"]);
    }

    #[tokio::test(start_paused = true)]
    async fn batches_release_together() {
        let transport = RecordingTransport::new();
        // 100 rps → 50 ms interval, 5 per batch.
        let q = queue(transport.clone(), 100);

        let futures: Vec<_> = (0..7)
            .map(|i| q.request(RpcCall::new(format!("m_{i}"), vec![])))
            .collect();
        for f in futures {
            f.await.unwrap();
        }

        let times = transport.dispatch_times();
        assert_eq!(times.len(), 7);
        // The first request goes out alone (the queue was empty when it
        // arrived); the next five share the following tick; the last one
        // rides the tick after that.
        assert!(times[1] - times[0] >= Duration::from_millis(50));
        assert_eq!(times[2], times[1]);
        assert_eq!(times[5], times[1]);
        assert!(times[6] - times[5] >= Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn throughput_stays_within_budget() {
        let transport = RecordingTransport::new();
        let q = queue(transport.clone(), 20);

        let started = Instant::now();
        let futures: Vec<_> = (0..40)
            .map(|_| q.request(RpcCall::new("eth_blockNumber", vec![])))
            .collect();
        for f in futures {
            f.await.unwrap();
        }

        // 20 rps with batch 1 → 39 inter-dispatch gaps of ≥ 50 ms.
        assert!(started.elapsed() >= Duration::from_millis(39 * 50));
    }

    #[tokio::test(start_paused = true)]
    async fn clear_cancels_undispatched_and_resets_the_clock() {
        let transport = RecordingTransport::new();
        let q = queue(transport.clone(), 1);

        let first = q.request(RpcCall::new("eth_blockNumber", vec![]));
        let second = q.request(RpcCall::new("eth_chainId", vec![]));
        first.await.unwrap();
        assert_eq!(q.size(), 1);

        q.clear();
        assert_eq!(q.size(), 0);
        assert!(matches!(second.await, Err(TransportError::Cancelled)));

        // The pacing clock was reset: a new request goes out immediately.
        let refilled = q.request(RpcCall::new("eth_getLogs", vec![]));
        refilled.await.unwrap();
        let times = transport.dispatch_times();
        assert_eq!(times.len(), 2);
        assert_eq!(times[1], times[0]);
    }

    #[tokio::test(start_paused = true)]
    async fn pause_holds_dispatch_until_start() {
        let transport = RecordingTransport::new();
        let q = queue(transport.clone(), 10);

        q.pause();
        let pending = q.request(RpcCall::new("eth_blockNumber", vec![]));
        tokio::task::yield_now().await;
        assert_eq!(transport.methods().len(), 0);
        assert_eq!(q.size(), 1);

        q.start();
        pending.await.unwrap();
        assert_eq!(transport.methods().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_rejects_only_its_own_task() {
        let transport = RecordingTransport::failing("m_bad");
        let q = queue(transport.clone(), 10);

        let good = q.request(RpcCall::new("m_good", vec![]));
        let bad = q.request(RpcCall::new("m_bad", vec![]));
        let tail = q.request(RpcCall::new("m_good", vec![]));

        assert!(good.await.is_ok());
        assert!(matches!(bad.await, Err(TransportError::Http(_))));
        assert!(tail.await.is_ok());
    }
}
