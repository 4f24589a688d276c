// Copyright (C) 2025 Michael Herstine <sp1ff@pobox.com>
//
// This file is part of qadu.
//
// qadu is free software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// qadu is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even
// the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU General
// Public License for more details.
//
// You should have received a copy of the GNU General Public License along with qadu.  If not, see
// <http://www.gnu.org/licenses/>.

//! # Periodic Request Scheduling
//!
//! Request handlers can't afford to talk to every peer pod each time a counter changes: peers are
//! slow, they go away, they rate-limit us. So handlers just write down what needs to be said, and
//! this module provides the component that periodically says it.
//!
//! # Design
//!
//! A [Scheduler] knows nothing about videos or counters. It's assembled from three parts:
//!
//! - a [PendingStore], from which it reads bounded, per-peer groups of pending "facts" & to which
//!   it reports the facts it has retired
//! - a [BatchBuilder], which turns each peer's facts into a single [OutgoingBatch]: the items to be
//!   sent plus the facts that batch resolves
//! - a [Transport](crate::transport::Transport), which delivers a batch to a peer
//!
//! along with a [Config] of numeric limits. One "cycle" reads pending work, builds batches,
//! delivers them (several peers at a time) & deletes whatever was resolved by a successful
//! delivery. If delivery to a peer fails, its facts simply remain pending; the next cycle is the
//! retry. If the store itself fails, the cycle is abandoned (deletes already made stand).
//!
//! Cycles never overlap. The scheduler is either idle or running one cycle; should the timer fire
//! (or [Scheduler::run_cycle] be invoked) while a cycle is running, that invocation returns
//! [CycleOutcome::Skipped] immediately without touching the store. Skipped ticks are dropped, not
//! queued.
//!
//! [spawn] drives a [Scheduler] from a timer in a background task, returning a [Processor] which
//! can be used to shut it down.

use std::{
    collections::{HashMap, HashSet},
    future::Future,
    num::NonZeroUsize,
    pin::Pin,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    task::Poll,
    time::Duration,
};

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt, stream};
use nonzero::nonzero;
use opentelemetry::KeyValue;
use pin_project::pin_project;
use serde::Deserialize;
use snafu::{Backtrace, prelude::*};
use tokio::{
    sync::Notify,
    task::{JoinError, JoinHandle, JoinSet},
    time::{Instant, MissedTickBehavior},
};
use tracing::{Instrument, debug, error, info, info_span, warn};
use url::Url;

use crate::{
    counter_add, define_metric,
    entities::{PeerId, RequestId},
    metrics::{Instruments, Sort},
    storage,
    transport::Transport,
};

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       module error type                                        //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("{description}: failed to build outgoing batches: {source}"))]
    Build {
        description: &'static str,
        source: storage::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("The scheduler task failed to run to completion: {source}"))]
    Join {
        source: JoinError,
        backtrace: Backtrace,
    },
    #[snafu(display("{description}: failed to read pending requests: {source}"))]
    List {
        description: &'static str,
        source: storage::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("{description}: failed to retire {count} requests for {peer}: {source}"))]
    Retire {
        description: &'static str,
        peer: PeerId,
        count: usize,
        source: storage::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Timeout shutting-down the scheduler: {source}"))]
    ShutdownTimeout {
        source: tokio::time::error::Elapsed,
        backtrace: Backtrace,
    },
    #[snafu(display("The scheduling interval must be greater than zero"))]
    ZeroInterval { backtrace: Backtrace },
}

impl Error {
    /// True if this error means the datastore couldn't be reached (or misbehaved)
    pub fn is_storage_unavailable(&self) -> bool {
        matches!(
            self,
            Error::Build { .. } | Error::List { .. } | Error::Retire { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           strategies                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Access to a queue of pending facts of type `F`
#[async_trait]
pub trait PendingStore<F>: Send + Sync {
    /// At most `max_peers` peers' worth of pending facts, at most `max_per_peer` (the oldest) each
    async fn list_grouped_by_peer(
        &self,
        max_peers: usize,
        max_per_peer: usize,
    ) -> std::result::Result<HashMap<PeerId, Vec<F>>, storage::Error>;
    /// Delete the given facts, all of which are destined for `peer`
    async fn retire(
        &self,
        peer: &PeerId,
        ids: &HashSet<RequestId>,
    ) -> std::result::Result<(), storage::Error>;
}

/// The result of building one peer's batch
#[derive(Clone, Debug, PartialEq)]
pub struct OutgoingBatch<I> {
    pub peer: PeerId,
    /// Where to deliver `items`; `None` if the peer can't be reached at all
    pub endpoint: Option<Url>,
    pub items: Vec<I>,
    /// The facts that are resolved once `items` is delivered (or immediately, if `items` is empty)
    pub resolved: HashSet<RequestId>,
    /// The number of facts deliberately left pending
    pub skipped: usize,
}

impl<I> OutgoingBatch<I> {
    pub fn new(peer: PeerId, endpoint: Option<Url>) -> OutgoingBatch<I> {
        OutgoingBatch {
            peer,
            endpoint,
            items: Vec::new(),
            resolved: HashSet::new(),
            skipped: 0,
        }
    }
}

/// Turns pending facts of type `F` into batches of items of type `I`
#[async_trait]
pub trait BatchBuilder<F, I>: Send + Sync {
    /// Build one batch per peer in `pending`
    async fn build(
        &self,
        pending: HashMap<PeerId, Vec<F>>,
    ) -> std::result::Result<Vec<OutgoingBatch<I>>, storage::Error>;
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                             Config                                             //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Scheduler limits
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Maximum number of peers to which we'll deliver in a single cycle
    #[serde(rename = "limit-pods")]
    pub limit_pods: NonZeroUsize,
    /// Maximum number of pending facts to pick-up per peer in a single cycle
    #[serde(rename = "limit-per-pod")]
    pub limit_per_pod: NonZeroUsize,
    /// Time between cycles
    pub interval: Duration,
    /// Maximum number of peers to which we'll be delivering at any one time
    #[serde(rename = "max-concurrent-deliveries")]
    pub max_concurrent_deliveries: NonZeroUsize,
    /// Amount of time to wait for an in-flight cycle on shutdown
    #[serde(rename = "shutdown-timeout")]
    pub shutdown_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            limit_pods: nonzero!(10usize),
            limit_per_pod: nonzero!(10usize),
            interval: Duration::from_secs(10),
            max_concurrent_deliveries: nonzero!(10usize),
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           Scheduler                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

define_metric! { "scheduler.cycles.started",     scheduler_cycles_started,     Sort::IntegralCounter }
define_metric! { "scheduler.cycles.skipped",     scheduler_cycles_skipped,     Sort::IntegralCounter }
define_metric! { "scheduler.cycles.aborted",     scheduler_cycles_aborted,     Sort::IntegralCounter }
define_metric! { "scheduler.peers.selected",     scheduler_peers_selected,     Sort::IntegralCounter }
define_metric! { "scheduler.deliveries.success", scheduler_deliveries_success, Sort::IntegralCounter }
define_metric! { "scheduler.deliveries.failure", scheduler_deliveries_failure, Sort::IntegralCounter }
define_metric! { "scheduler.requests.retired",   scheduler_requests_retired,   Sort::IntegralCounter }
define_metric! { "scheduler.requests.skipped",   scheduler_requests_skipped,   Sort::IntegralCounter }

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum State {
    Idle,
    Running,
}

/// What one cycle accomplished
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CycleReport {
    /// Peers with pending work picked-up this cycle
    pub peers: usize,
    /// Peers to which a batch was successfully delivered
    pub delivered: usize,
    /// Peers to which delivery failed
    pub failed: usize,
    /// Peers whose pending facts were retired without anything to send
    pub purged: usize,
    /// Total facts deleted
    pub retired: usize,
    /// Total facts left pending because they couldn't be interpreted
    pub skipped: usize,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum CycleOutcome {
    /// Another cycle was already running
    Skipped,
    Completed(CycleReport),
}

enum PeerOutcome {
    Delivered { retired: usize, skipped: usize },
    Failed { skipped: usize },
    Purged { retired: usize, skipped: usize },
    Idle { skipped: usize },
}

impl CycleReport {
    fn record(mut self, outcome: PeerOutcome) -> CycleReport {
        match outcome {
            PeerOutcome::Delivered { retired, skipped } => {
                self.delivered += 1;
                self.retired += retired;
                self.skipped += skipped;
            }
            PeerOutcome::Failed { skipped } => {
                self.failed += 1;
                self.skipped += skipped;
            }
            PeerOutcome::Purged { retired, skipped } => {
                self.purged += 1;
                self.retired += retired;
                self.skipped += skipped;
            }
            PeerOutcome::Idle { skipped } => {
                self.skipped += skipped;
            }
        }
        self
    }
}

// Marks the scheduler as running for as long as it lives, including when a cycle is abandoned
// part-way through by dropping its future.
struct RunningGuard<'a>(&'a AtomicBool);

impl<'a> RunningGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<RunningGuard<'a>> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RunningGuard(flag))
    }
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Periodically read, build, deliver & retire pending facts of type `F` as items of type `I`
pub struct Scheduler<F, I> {
    description: &'static str,
    store: Arc<dyn PendingStore<F>>,
    builder: Arc<dyn BatchBuilder<F, I>>,
    transport: Arc<dyn Transport<I>>,
    config: Config,
    instruments: Arc<Instruments>,
    running: AtomicBool,
    next_cycle: Mutex<Option<Instant>>,
}

impl<F, I> Scheduler<F, I>
where
    F: Send + 'static,
    I: Send + Sync + 'static,
{
    /// `description` is used to identify this scheduler in logs & metrics
    pub fn new(
        description: &'static str,
        store: Arc<dyn PendingStore<F>>,
        builder: Arc<dyn BatchBuilder<F, I>>,
        transport: Arc<dyn Transport<I>>,
        config: Config,
        instruments: Arc<Instruments>,
    ) -> Result<Scheduler<F, I>> {
        ensure!(!config.interval.is_zero(), ZeroIntervalSnafu);
        Ok(Scheduler {
            description,
            store,
            builder,
            transport,
            config,
            instruments,
            running: AtomicBool::new(false),
            next_cycle: Mutex::new(None),
        })
    }
    pub fn config(&self) -> &Config {
        &self.config
    }
    pub fn description(&self) -> &'static str {
        self.description
    }
    pub fn state(&self) -> State {
        if self.running.load(Ordering::Acquire) {
            State::Running
        } else {
            State::Idle
        }
    }
    /// Time remaining until the timer next fires; `None` if no timer is driving this scheduler
    pub fn remaining_until_next_cycle(&self) -> Option<Duration> {
        self.next_cycle
            .lock()
            .ok()
            .and_then(|next| *next)
            .map(|next| next.saturating_duration_since(Instant::now()))
    }
    fn set_next_cycle(&self, next: Option<Instant>) {
        if let Ok(mut guard) = self.next_cycle.lock() {
            *guard = next;
        }
    }

    /// Run one cycle now
    ///
    /// This is what the timer invokes, but it may also be called directly to flush pending work
    /// immediately (subject to the same limits). Should a cycle already be running, return
    /// [CycleOutcome::Skipped] without doing anything.
    pub async fn run_cycle(&self) -> Result<CycleOutcome> {
        let attrs = [KeyValue::new("scheduler", self.description)];
        let Some(_guard) = RunningGuard::acquire(&self.running) else {
            debug!("{}: a cycle is already in progress; skipping.", self.description);
            counter_add!(self.instruments, scheduler_cycles_skipped, 1, &attrs);
            return Ok(CycleOutcome::Skipped);
        };
        counter_add!(self.instruments, scheduler_cycles_started, 1, &attrs);
        match self
            .cycle(&attrs)
            .instrument(info_span!("cycle", scheduler = self.description))
            .await
        {
            Ok(report) => Ok(CycleOutcome::Completed(report)),
            Err(err) => {
                counter_add!(self.instruments, scheduler_cycles_aborted, 1, &attrs);
                Err(err)
            }
        }
    }

    async fn cycle(&self, attrs: &[KeyValue]) -> Result<CycleReport> {
        let pending = self
            .store
            .list_grouped_by_peer(
                self.config.limit_pods.get(),
                self.config.limit_per_pod.get(),
            )
            .await
            .context(ListSnafu {
                description: self.description,
            })?;
        if pending.is_empty() {
            debug!("{}: nothing pending.", self.description);
            return Ok(CycleReport::default());
        }

        let peers = pending.len();
        counter_add!(self.instruments, scheduler_peers_selected, peers as u64, attrs);
        debug!(
            "{}: {} pending requests for {} peers.",
            self.description,
            pending.values().map(Vec::len).sum::<usize>(),
            peers
        );

        let batches = self.builder.build(pending).await.context(BuildSnafu {
            description: self.description,
        })?;

        // The first storage error abandons whatever deliveries are still in flight.
        let report = stream::iter(batches)
            .map(|batch| self.process_batch(batch, attrs))
            .buffer_unordered(self.config.max_concurrent_deliveries.get())
            .try_fold(
                CycleReport {
                    peers,
                    ..Default::default()
                },
                |report, outcome| async move { Ok(report.record(outcome)) },
            )
            .await?;

        counter_add!(
            self.instruments,
            scheduler_requests_retired,
            report.retired as u64,
            attrs
        );
        counter_add!(
            self.instruments,
            scheduler_requests_skipped,
            report.skipped as u64,
            attrs
        );
        Ok(report)
    }

    async fn process_batch(
        &self,
        batch: OutgoingBatch<I>,
        attrs: &[KeyValue],
    ) -> Result<PeerOutcome> {
        let OutgoingBatch {
            peer,
            endpoint,
            items,
            resolved,
            skipped,
        } = batch;

        if items.is_empty() {
            if resolved.is_empty() {
                return Ok(PeerOutcome::Idle { skipped });
            }
            // Nothing to say, but there are facts to be purged; no need to bother the peer.
            self.retire(&peer, &resolved).await?;
            return Ok(PeerOutcome::Purged {
                retired: resolved.len(),
                skipped,
            });
        }

        let Some(endpoint) = endpoint else {
            error!(
                "{}: {} items for {} but no endpoint; leaving them pending.",
                self.description,
                items.len(),
                peer
            );
            counter_add!(self.instruments, scheduler_deliveries_failure, 1, attrs);
            return Ok(PeerOutcome::Failed { skipped });
        };

        match self.transport.deliver(&peer, &endpoint, &items).await {
            Ok(()) => {
                counter_add!(self.instruments, scheduler_deliveries_success, 1, attrs);
                self.retire(&peer, &resolved).await?;
                Ok(PeerOutcome::Delivered {
                    retired: resolved.len(),
                    skipped,
                })
            }
            Err(err) => {
                warn!(
                    "{}: delivery of {} items to {} ({}) failed; will retry next cycle: {}",
                    self.description,
                    items.len(),
                    peer,
                    endpoint,
                    err
                );
                counter_add!(self.instruments, scheduler_deliveries_failure, 1, attrs);
                Ok(PeerOutcome::Failed { skipped })
            }
        }
    }

    async fn retire(&self, peer: &PeerId, ids: &HashSet<RequestId>) -> Result<()> {
        self.store.retire(peer, ids).await.context(RetireSnafu {
            description: self.description,
            peer: *peer,
            count: ids.len(),
        })
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                           Processor                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// [Processor] is the handle on a [Scheduler] being driven by a timer in a background task; its
/// `shutdown()` method will consume the instance & resolve to the result of that task.
#[pin_project]
pub struct Processor {
    #[pin]
    processor: JoinHandle<Result<()>>,
    shutdown: Arc<Notify>,
}

impl Future for Processor {
    type Output = std::result::Result<Result<()>, JoinError>;

    fn poll(self: Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        this.processor.poll(cx)
    }
}

impl Processor {
    /// Signal the timer task to stop & wait up to `timeout` for it to exit
    ///
    /// The task will itself wait for an in-flight cycle for up to the scheduler's configured
    /// shutdown timeout, so `timeout` should be longer than that.
    pub async fn shutdown(self, timeout: Duration) -> Result<()> {
        self.shutdown.notify_one();
        tokio::time::timeout(timeout, self.processor)
            .await
            .context(ShutdownTimeoutSnafu)?
            .context(JoinSnafu)?
    }
    /// Split the instance back into its parts
    ///
    /// Convenient when waiting on the processor along with other futures (in a `tokio::select!`
    /// invocation, e.g.)
    pub fn into_parts(self) -> (JoinHandle<Result<()>>, Arc<Notify>) {
        (self.processor, self.shutdown)
    }
}

fn log_cycle(description: &'static str, result: std::result::Result<Result<CycleOutcome>, JoinError>) {
    match result {
        Ok(Ok(CycleOutcome::Skipped)) => (),
        Ok(Ok(CycleOutcome::Completed(report))) => {
            if report.peers > 0 {
                info!(
                    peers = report.peers,
                    delivered = report.delivered,
                    failed = report.failed,
                    purged = report.purged,
                    retired = report.retired,
                    skipped = report.skipped,
                    "{}: cycle complete.",
                    description
                );
            }
        }
        Ok(Err(err)) => error!("{}: cycle aborted: {}", description, err),
        Err(err) => error!("{}: cycle failed to run to completion: {}", description, err),
    }
}

async fn tick<F, I>(scheduler: Arc<Scheduler<F, I>>, shutdown: Arc<Notify>) -> Result<()>
where
    F: Send + 'static,
    I: Send + Sync + 'static,
{
    let period = scheduler.config.interval;
    // The first cycle runs one period after start-up, not immediately.
    let start = Instant::now() + period;
    let mut interval = tokio::time::interval_at(start, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    scheduler.set_next_cycle(Some(start));

    let mut cycles: JoinSet<Result<CycleOutcome>> = JoinSet::new();
    loop {
        tokio::select! {
            _ = interval.tick() => {
                scheduler.set_next_cycle(Some(Instant::now() + period));
                let scheduler = scheduler.clone();
                // A tick arriving while a cycle is running spawns a task that returns `Skipped`
                // straight away.
                cycles.spawn(async move { scheduler.run_cycle().await });
            }
            Some(result) = cycles.join_next() => log_cycle(scheduler.description, result),
            _ = shutdown.notified() => break,
        }
    }
    scheduler.set_next_cycle(None);

    // Give any in-flight cycle a chance to complete; if it doesn't, dropping `cycles` aborts it.
    let description = scheduler.description;
    if tokio::time::timeout(scheduler.config.shutdown_timeout, async {
        while let Some(result) = cycles.join_next().await {
            log_cycle(description, result);
        }
    })
    .await
    .is_err()
    {
        warn!("{}: abandoning the in-flight cycle.", description);
    }

    Ok(())
}

/// Drive `scheduler` from a timer in a new task
///
/// Must be invoked from within a Tokio runtime.
pub fn spawn<F, I>(scheduler: Arc<Scheduler<F, I>>) -> Processor
where
    F: Send + 'static,
    I: Send + Sync + 'static,
{
    let shutdown = Arc::new(Notify::new());
    let processor = tokio::spawn(tick(scheduler, shutdown.clone()));
    Processor {
        processor,
        shutdown,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use std::sync::atomic::AtomicUsize;

    use crate::transport;

    // Facts are just (id, text) pairs; items are the text.
    type Fact = (RequestId, String);

    #[derive(Default)]
    struct MockStore {
        pending: Mutex<HashMap<PeerId, Vec<Fact>>>,
        lists: AtomicUsize,
        retires: AtomicUsize,
        fail_list: AtomicBool,
        fail_retire: AtomicBool,
        // If set, `list_grouped_by_peer` signals `entered` & then waits on `release`
        gate: Option<(Arc<Notify>, Arc<Notify>)>,
    }

    #[derive(Debug, Snafu)]
    #[snafu(display("the mock store is unavailable"))]
    struct Unavailable;

    impl MockStore {
        fn with(pending: HashMap<PeerId, Vec<Fact>>) -> MockStore {
            MockStore {
                pending: Mutex::new(pending),
                ..Default::default()
            }
        }
        fn remaining(&self, peer: &PeerId) -> usize {
            self.pending
                .lock()
                .unwrap()
                .get(peer)
                .map(Vec::len)
                .unwrap_or(0)
        }
    }

    #[async_trait]
    impl PendingStore<Fact> for MockStore {
        async fn list_grouped_by_peer(
            &self,
            max_peers: usize,
            max_per_peer: usize,
        ) -> std::result::Result<HashMap<PeerId, Vec<Fact>>, storage::Error> {
            self.lists.fetch_add(1, Ordering::SeqCst);
            if let Some((entered, release)) = &self.gate {
                entered.notify_one();
                release.notified().await;
            }
            if self.fail_list.load(Ordering::SeqCst) {
                return Err(storage::Error::new(Unavailable));
            }
            Ok(self
                .pending
                .lock()
                .unwrap()
                .iter()
                .filter(|(_, facts)| !facts.is_empty())
                .take(max_peers)
                .map(|(peer, facts)| {
                    (
                        *peer,
                        facts.iter().take(max_per_peer).cloned().collect::<Vec<_>>(),
                    )
                })
                .collect())
        }
        async fn retire(
            &self,
            peer: &PeerId,
            ids: &HashSet<RequestId>,
        ) -> std::result::Result<(), storage::Error> {
            self.retires.fetch_add(1, Ordering::SeqCst);
            if self.fail_retire.load(Ordering::SeqCst) {
                return Err(storage::Error::new(Unavailable));
            }
            if let Some(facts) = self.pending.lock().unwrap().get_mut(peer) {
                facts.retain(|(id, _)| !ids.contains(id));
            }
            Ok(())
        }
    }

    // Facts whose text is "purge" are resolved without producing an item, "skip" are left pending
    // & "nowhere" leaves the peer without an endpoint
    struct MockBuilder;

    #[async_trait]
    impl BatchBuilder<Fact, String> for MockBuilder {
        async fn build(
            &self,
            pending: HashMap<PeerId, Vec<Fact>>,
        ) -> std::result::Result<Vec<OutgoingBatch<String>>, storage::Error> {
            Ok(pending
                .into_iter()
                .map(|(peer, facts)| {
                    let mut batch = OutgoingBatch::new(
                        peer,
                        Some(Url::parse(&format!("http://{}.example.com/qadu", peer)).unwrap()),
                    );
                    facts.into_iter().for_each(|(id, text)| match text.as_str() {
                        "purge" => {
                            batch.resolved.insert(id);
                        }
                        "skip" => batch.skipped += 1,
                        "nowhere" => {
                            batch.endpoint = None;
                            batch.items.push(text);
                            batch.resolved.insert(id);
                        }
                        _ => {
                            batch.items.push(text);
                            batch.resolved.insert(id);
                        }
                    });
                    batch
                })
                .collect())
        }
    }

    #[derive(Default)]
    struct MockTransport {
        delivered: Mutex<Vec<(PeerId, Vec<String>)>>,
        failing: Mutex<HashSet<PeerId>>,
    }

    #[async_trait]
    impl Transport<String> for MockTransport {
        async fn deliver(
            &self,
            peer: &PeerId,
            endpoint: &Url,
            items: &[String],
        ) -> std::result::Result<(), transport::Error> {
            if self.failing.lock().unwrap().contains(peer) {
                return Err(transport::Error::rejected(endpoint, 503));
            }
            self.delivered
                .lock()
                .unwrap()
                .push((*peer, items.to_vec()));
            Ok(())
        }
    }

    fn facts(texts: &[&str]) -> Vec<Fact> {
        texts
            .iter()
            .map(|t| (RequestId::generate(), t.to_string()))
            .collect()
    }

    fn scheduler(
        store: Arc<MockStore>,
        transport: Arc<MockTransport>,
        config: Config,
    ) -> Scheduler<Fact, String> {
        Scheduler::new(
            "test requests",
            store,
            Arc::new(MockBuilder),
            transport,
            config,
            Arc::new(Instruments::new("qadu")),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn delivers_and_retires() {
        let (a, b) = (PeerId::default(), PeerId::default());
        let store = Arc::new(MockStore::with(HashMap::from([
            (a, facts(&["a1", "a2", "purge"])),
            (b, facts(&["b1"])),
        ])));
        let transport = Arc::new(MockTransport::default());
        let scheduler = scheduler(store.clone(), transport.clone(), Config::default());

        assert_eq!(scheduler.state(), State::Idle);
        let outcome = scheduler.run_cycle().await.unwrap();
        assert_eq!(
            outcome,
            CycleOutcome::Completed(CycleReport {
                peers: 2,
                delivered: 2,
                failed: 0,
                purged: 0,
                retired: 4,
                skipped: 0,
            })
        );
        assert_eq!(store.remaining(&a), 0);
        assert_eq!(store.remaining(&b), 0);
        let mut delivered = transport.delivered.lock().unwrap().clone();
        delivered.sort_by_key(|(_, items)| items.len());
        assert_eq!(delivered[0].1, vec!["b1".to_owned()]);
        assert_eq!(delivered[1].1, vec!["a1".to_owned(), "a2".to_owned()]);
        assert_eq!(scheduler.state(), State::Idle);

        // Nothing left; the next cycle is a no-op
        assert_eq!(
            scheduler.run_cycle().await.unwrap(),
            CycleOutcome::Completed(CycleReport::default())
        );
    }

    #[tokio::test]
    async fn failed_deliveries_stay_pending() {
        let (a, b) = (PeerId::default(), PeerId::default());
        let store = Arc::new(MockStore::with(HashMap::from([
            (a, facts(&["a1", "a2"])),
            (b, facts(&["b1"])),
        ])));
        let transport = Arc::new(MockTransport::default());
        transport.failing.lock().unwrap().insert(a);
        let scheduler = scheduler(store.clone(), transport.clone(), Config::default());

        let CycleOutcome::Completed(report) = scheduler.run_cycle().await.unwrap() else {
            panic!("cycle was skipped");
        };
        assert_eq!(report.delivered, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(report.retired, 1);
        assert_eq!(store.remaining(&a), 2);
        assert_eq!(store.remaining(&b), 0);
        // no retries within the cycle:
        assert_eq!(transport.delivered.lock().unwrap().len(), 1);

        // Once the peer recovers, the next cycle picks them up:
        transport.failing.lock().unwrap().clear();
        scheduler.run_cycle().await.unwrap();
        assert_eq!(store.remaining(&a), 0);
    }

    #[tokio::test]
    async fn purges_without_delivery() {
        let a = PeerId::default();
        let store = Arc::new(MockStore::with(HashMap::from([(
            a,
            facts(&["purge", "purge", "skip"]),
        )])));
        let transport = Arc::new(MockTransport::default());
        let scheduler = scheduler(store.clone(), transport.clone(), Config::default());

        let CycleOutcome::Completed(report) = scheduler.run_cycle().await.unwrap() else {
            panic!("cycle was skipped");
        };
        assert_eq!(report.purged, 1);
        assert_eq!(report.retired, 2);
        assert_eq!(report.skipped, 1);
        assert!(transport.delivered.lock().unwrap().is_empty());
        // only the "skip" fact remains
        assert_eq!(store.remaining(&a), 1);
    }

    #[tokio::test]
    async fn batches_without_endpoints_fail() {
        let a = PeerId::default();
        let store = Arc::new(MockStore::with(HashMap::from([(
            a,
            facts(&["a1", "nowhere"]),
        )])));
        let transport = Arc::new(MockTransport::default());
        let scheduler = scheduler(store.clone(), transport.clone(), Config::default());

        let CycleOutcome::Completed(report) = scheduler.run_cycle().await.unwrap() else {
            panic!("cycle was skipped");
        };
        assert_eq!(report.failed, 1);
        assert_eq!(report.retired, 0);
        assert_eq!(report.skipped, 0);
        assert!(transport.delivered.lock().unwrap().is_empty());
        assert_eq!(store.remaining(&a), 2);
    }

    #[tokio::test]
    async fn limits_are_passed_through() {
        let peers = (0..10).map(|_| PeerId::default()).collect::<Vec<_>>();
        let store = Arc::new(MockStore::with(
            peers
                .iter()
                .map(|p| (*p, facts(&["x"; 20])))
                .collect::<HashMap<_, _>>(),
        ));
        let transport = Arc::new(MockTransport::default());
        let scheduler = scheduler(
            store.clone(),
            transport.clone(),
            Config {
                limit_pods: nonzero!(3usize),
                limit_per_pod: nonzero!(5usize),
                ..Default::default()
            },
        );
        let CycleOutcome::Completed(report) = scheduler.run_cycle().await.unwrap() else {
            panic!("cycle was skipped");
        };
        assert_eq!(report.peers, 3);
        assert_eq!(report.retired, 15);
        let delivered = transport.delivered.lock().unwrap();
        assert_eq!(delivered.len(), 3);
        assert!(delivered.iter().all(|(_, items)| items.len() == 5));
    }

    #[tokio::test]
    async fn storage_failures_abort_the_cycle() {
        let a = PeerId::default();
        let store = Arc::new(MockStore::with(HashMap::from([(a, facts(&["a1"]))])));
        let transport = Arc::new(MockTransport::default());
        let scheduler = scheduler(store.clone(), transport.clone(), Config::default());

        store.fail_list.store(true, Ordering::SeqCst);
        let err = scheduler.run_cycle().await.unwrap_err();
        assert!(matches!(err, Error::List { .. }));
        assert!(err.is_storage_unavailable());
        assert!(transport.delivered.lock().unwrap().is_empty());
        // The scheduler's back to idle & ready to go again
        assert_eq!(scheduler.state(), State::Idle);

        store.fail_list.store(false, Ordering::SeqCst);
        store.fail_retire.store(true, Ordering::SeqCst);
        let err = scheduler.run_cycle().await.unwrap_err();
        assert!(matches!(err, Error::Retire { .. }));
        // The peer got the update, but the fact remains & will be sent again (at-least-once).
        assert_eq!(transport.delivered.lock().unwrap().len(), 1);
        assert_eq!(store.remaining(&a), 1);
    }

    #[tokio::test]
    async fn cycles_do_not_overlap() {
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let a = PeerId::default();
        let store = Arc::new(MockStore {
            pending: Mutex::new(HashMap::from([(a, facts(&["a1"]))])),
            gate: Some((entered.clone(), release.clone())),
            ..Default::default()
        });
        let transport = Arc::new(MockTransport::default());
        let scheduler = Arc::new(scheduler(store.clone(), transport.clone(), Config::default()));

        let first = tokio::spawn({
            let scheduler = scheduler.clone();
            async move { scheduler.run_cycle().await }
        });
        entered.notified().await;
        assert_eq!(scheduler.state(), State::Running);

        // The first cycle is parked inside the store; a second must neither read nor write:
        assert_eq!(
            scheduler.run_cycle().await.unwrap(),
            CycleOutcome::Skipped
        );
        assert_eq!(store.lists.load(Ordering::SeqCst), 1);
        assert_eq!(store.retires.load(Ordering::SeqCst), 0);

        release.notify_one();
        let outcome = first.await.unwrap().unwrap();
        assert!(matches!(outcome, CycleOutcome::Completed(CycleReport { delivered: 1, .. })));
        assert_eq!(scheduler.state(), State::Idle);
    }

    #[tokio::test]
    async fn zero_interval_is_rejected() {
        let result = Scheduler::<Fact, String>::new(
            "test requests",
            Arc::new(MockStore::default()),
            Arc::new(MockBuilder),
            Arc::new(MockTransport::default()),
            Config {
                interval: Duration::ZERO,
                ..Default::default()
            },
            Arc::new(Instruments::new("qadu")),
        );
        assert!(matches!(result, Err(Error::ZeroInterval { .. })));
    }

    #[tokio::test]
    async fn timer_drives_cycles() {
        let a = PeerId::default();
        let store = Arc::new(MockStore::with(HashMap::from([(a, facts(&["a1"]))])));
        let transport = Arc::new(MockTransport::default());
        let scheduler = Arc::new(scheduler(
            store.clone(),
            transport.clone(),
            Config {
                interval: Duration::from_millis(50),
                shutdown_timeout: Duration::from_millis(250),
                ..Default::default()
            },
        ));
        assert!(scheduler.remaining_until_next_cycle().is_none());

        let processor = spawn(scheduler.clone());
        tokio::time::sleep(Duration::from_millis(10)).await;
        let remaining = scheduler.remaining_until_next_cycle().unwrap();
        assert!(remaining <= Duration::from_millis(50));

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(store.lists.load(Ordering::SeqCst) >= 2);
        assert_eq!(store.remaining(&a), 0);

        processor.shutdown(Duration::from_secs(1)).await.unwrap();
        assert!(scheduler.remaining_until_next_cycle().is_none());
    }
}
