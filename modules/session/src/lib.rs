//! Session coordination: endpoint reconcile, concurrent result merge, and
//! cross-endpoint aggregates.
//!
//! The session owns the snapshot and is its only mutator. Probes are pure
//! calls dispatched onto the runtime; each completed probe merges exactly one
//! slot (or the identity label) back through the session, so merges stay
//! linearizable per slot no matter how completions interleave.

use anyhow::Result;
use prober::{build_client, probe, ProbeOptions};
use reqwest::Client;
use rpcprobe_core::catalog::{MethodCall, IDENTITY_METHOD};
use rpcprobe_core::{EndpointSnapshot, Outcome, ProbeResult, IDENTITY_PENDING, IDENTITY_UNKNOWN};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{watch, Notify, Semaphore};

pub const DEFAULT_CONCURRENCY: usize = 32;

/// Which slots contribute elapsed times to mean/median.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregatePolicy {
    /// Only Success slots count.
    SuccessOnly,
    /// Any terminal slot counts, errors included.
    IncludeErrors,
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub probe: ProbeOptions,
    /// Bound on in-flight requests across all endpoints.
    pub concurrency: usize,
    pub aggregate: AggregatePolicy,
}

impl Default for SessionOptions {
    fn default() -> Self {
        SessionOptions {
            probe: ProbeOptions::default(),
            concurrency: DEFAULT_CONCURRENCY,
            aggregate: AggregatePolicy::SuccessOnly,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MethodStats {
    pub mean: f64,
    pub median: f64,
    pub samples: usize,
}

#[derive(Clone, Copy)]
enum Slot {
    Identity,
    Method(usize),
}

struct Row {
    url: String,
    gen: u64,
    identity: String,
    slots: Vec<ProbeResult>,
}

struct State {
    rows: Vec<Row>,
    next_gen: u64,
}

struct Inner {
    state: Mutex<State>,
    updates: watch::Sender<Vec<EndpointSnapshot>>,
    methods: Vec<MethodCall>,
    client: Client,
    opts: SessionOptions,
    limiter: Arc<Semaphore>,
    in_flight: AtomicUsize,
    idle: Notify,
}

/// A probing session over a dynamic endpoint set and a fixed method catalog.
pub struct Session {
    inner: Arc<Inner>,
}

impl Clone for Session {
    fn clone(&self) -> Self {
        Session { inner: self.inner.clone() }
    }
}

impl Session {
    pub fn new(methods: Vec<MethodCall>, opts: SessionOptions) -> Result<Self> {
        let client = build_client(&opts.probe)?;
        let (updates, _) = watch::channel(Vec::new());
        let limiter = Arc::new(Semaphore::new(opts.concurrency.max(1)));
        Ok(Session {
            inner: Arc::new(Inner {
                state: Mutex::new(State { rows: Vec::new(), next_gen: 0 }),
                updates,
                methods,
                client,
                opts,
                limiter,
                in_flight: AtomicUsize::new(0),
                idle: Notify::new(),
            }),
        })
    }

    pub fn methods(&self) -> &[MethodCall] {
        &self.inner.methods
    }

    /// Adjust the tracked set to `desired`. Rows for removed URLs are dropped
    /// immediately; each newly added URL gets a pending row and one dispatched
    /// probe per catalog method plus the identity probe. URLs already tracked
    /// are left alone, so re-supplying the same set triggers no new requests.
    pub fn reconcile(&self, desired: &[String]) {
        let added = {
            let mut st = self.inner.state.lock().unwrap();
            let before = st.rows.len();
            st.rows.retain(|r| desired.iter().any(|u| u == &r.url));
            let removed = before - st.rows.len();
            if removed > 0 {
                tracing::debug!(removed, "dropped endpoint rows");
            }
            let mut added = Vec::new();
            for url in desired {
                if st.rows.iter().any(|r| &r.url == url) {
                    continue;
                }
                let gen = st.next_gen;
                st.next_gen += 1;
                let slots = self.inner.methods.iter().map(|m| ProbeResult::pending(&m.method)).collect();
                st.rows.push(Row {
                    url: url.clone(),
                    gen,
                    identity: IDENTITY_PENDING.to_string(),
                    slots,
                });
                added.push((url.clone(), gen));
            }
            if removed == 0 && added.is_empty() {
                return;
            }
            added
        };
        self.publish();
        for (url, gen) in added {
            self.dispatch(url, gen);
        }
    }

    /// Drop every row and forget the tracked set. In-flight probes from the
    /// old lifetime resolve against stale generations and are discarded.
    pub fn reset(&self) {
        {
            let mut st = self.inner.state.lock().unwrap();
            st.rows.clear();
        }
        self.publish();
    }

    pub fn snapshot(&self) -> Vec<EndpointSnapshot> {
        let st = self.inner.state.lock().unwrap();
        snapshot_rows(&st)
    }

    /// Receiver that observes a fresh full snapshot after every merge.
    pub fn subscribe(&self) -> watch::Receiver<Vec<EndpointSnapshot>> {
        self.inner.updates.subscribe()
    }

    pub fn aggregate(&self, method: &str) -> Option<MethodStats> {
        aggregate_rows(&self.snapshot(), method, self.inner.opts.aggregate)
    }

    /// Wait until no dispatched probe is still in flight. Results merged
    /// before the counter drops, so a settled session has a settled snapshot.
    pub async fn settled(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if self.inner.in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    fn dispatch(&self, url: String, gen: u64) {
        self.spawn_probe(url.clone(), gen, Slot::Identity);
        for idx in 0..self.inner.methods.len() {
            self.spawn_probe(url.clone(), gen, Slot::Method(idx));
        }
    }

    fn spawn_probe(&self, url: String, gen: u64, slot: Slot) {
        let inner = Arc::clone(&self.inner);
        inner.in_flight.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            let _permit = inner.limiter.clone().acquire_owned().await.unwrap();
            let result = match slot {
                Slot::Identity => probe(&inner.client, &url, IDENTITY_METHOD, &[], &inner.opts.probe).await,
                Slot::Method(idx) => {
                    let call = &inner.methods[idx];
                    probe(&inner.client, &url, &call.method, &call.params, &inner.opts.probe).await
                }
            };
            merge(&inner, &url, gen, slot, result);
            if inner.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
                inner.idle.notify_waiters();
            }
        });
    }

    fn publish(&self) {
        let snap = self.snapshot();
        self.inner.updates.send_replace(snap);
    }
}

fn merge(inner: &Inner, url: &str, gen: u64, slot: Slot, result: ProbeResult) {
    let snap = {
        let mut st = inner.state.lock().unwrap();
        let Some(row) = st.rows.iter_mut().find(|r| r.url == url && r.gen == gen) else {
            tracing::debug!(url, "discarding result for a removed endpoint");
            return;
        };
        match slot {
            Slot::Identity => row.identity = identity_label(&result),
            Slot::Method(idx) => {
                // a slot transitions out of Pending exactly once
                if row.slots[idx].outcome == Outcome::Pending {
                    row.slots[idx] = result;
                }
            }
        }
        snapshot_rows(&st)
    };
    inner.updates.send_replace(snap);
}

fn snapshot_rows(st: &State) -> Vec<EndpointSnapshot> {
    st.rows
        .iter()
        .map(|r| EndpointSnapshot {
            url: r.url.clone(),
            identity: r.identity.clone(),
            results: r.slots.clone(),
        })
        .collect()
}

fn identity_label(result: &ProbeResult) -> String {
    if result.outcome == Outcome::Success {
        if let Some(s) = result.raw_result.as_ref().and_then(|v| v.as_str()) {
            if !s.is_empty() {
                return s.to_string();
            }
        }
    }
    IDENTITY_UNKNOWN.to_string()
}

/// Mean and median elapsed time for one method across all endpoint rows.
/// Returns `None` when no slot contributes under the given policy.
pub fn aggregate_rows(rows: &[EndpointSnapshot], method: &str, policy: AggregatePolicy) -> Option<MethodStats> {
    let mut samples: Vec<f64> = rows
        .iter()
        .filter_map(|r| r.result(method))
        .filter(|res| match policy {
            AggregatePolicy::SuccessOnly => res.outcome == Outcome::Success,
            AggregatePolicy::IncludeErrors => res.outcome.is_terminal(),
        })
        .filter_map(|res| res.elapsed_ms)
        .collect();
    if samples.is_empty() {
        return None;
    }
    samples.sort_by(f64::total_cmp);
    let mean = samples.iter().sum::<f64>() / samples.len() as f64;
    let mid = samples.len() / 2;
    let median = if samples.len() % 2 == 0 {
        (samples[mid - 1] + samples[mid]) / 2.0
    } else {
        samples[mid]
    };
    Some(MethodStats { mean, median, samples: samples.len() })
}
