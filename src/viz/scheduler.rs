//! Per-panel render scheduling.
//!
//! A panel is rendered from two sources: a fixed-period ticker (only while the
//! model is training) and forced renders from user interaction. Both go
//! through one single-flight slot, so at most one fetch per panel is ever
//! outstanding. What happens to a render requested while the slot is busy is
//! the panel's [`FlightPolicy`].

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::bridge::ComputeBridge;
use crate::error::Result;
use crate::model::TrainingFlag;

/// What to do with a render requested while a fetch is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum FlightPolicy {
    /// Discard it.
    #[default]
    Drop,
    /// Run exactly one more render once the current one lands.
    Coalesce,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderOutcome {
    /// A fetch was issued.
    Started,
    /// Periodic tick while the model is not training.
    SkippedIdle,
    /// The panel had nothing new to fetch.
    Unchanged,
    /// A fetch was in flight and the policy is [`FlightPolicy::Drop`].
    Dropped,
    /// A fetch was in flight; a follow-up render is now pending.
    Coalesced,
    Disposed,
}

/// A panel the scheduler can drive: capture inputs, fetch off-thread, draw.
pub trait RenderPanel: Send + 'static {
    /// Inputs captured when a render starts.
    type Request: Send + 'static;
    /// What the fetch produces for [`RenderPanel::present`].
    type Frame: Send + 'static;

    fn name(&self) -> &'static str;

    /// `None` means there is nothing new to fetch.
    fn request(&mut self) -> Option<Self::Request>;

    fn fetch(
        bridge: ComputeBridge,
        request: Self::Request,
    ) -> impl Future<Output = Result<Option<Self::Frame>>> + Send + 'static;

    /// Draws a fetched frame onto a freshly cleared canvas. `None` is the
    /// benign empty state (no model yet, no data yet).
    fn present(&mut self, frame: Option<Self::Frame>) -> Result<()>;

    fn clear(&mut self);
}

#[derive(Default)]
struct FlightSlot {
    task: Option<JoinHandle<()>>,
    rerun: bool,
}

struct Inner<P: RenderPanel> {
    panel: Mutex<P>,
    bridge: ComputeBridge,
    training: TrainingFlag,
    policy: FlightPolicy,
    runtime: Handle,
    slot: Mutex<FlightSlot>,
    ticker: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
    settled: Notify,
    fetches: AtomicUsize,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<P: RenderPanel> Inner<P> {
    fn maybe_render(self: &Arc<Self>, force: bool) -> RenderOutcome {
        if self.cancel.is_cancelled() {
            return RenderOutcome::Disposed;
        }
        if !force && !self.training.is_training() {
            return RenderOutcome::SkippedIdle;
        }

        let mut slot = lock(&self.slot);
        if slot.task.is_some() {
            let name = lock(&self.panel).name();
            return match self.policy {
                FlightPolicy::Drop => {
                    debug!(panel = name, force, "render dropped, fetch in flight");
                    RenderOutcome::Dropped
                }
                FlightPolicy::Coalesce => {
                    debug!(panel = name, force, "render coalesced behind in-flight fetch");
                    slot.rerun = true;
                    RenderOutcome::Coalesced
                }
            };
        }

        let Some(request) = lock(&self.panel).request() else {
            return RenderOutcome::Unchanged;
        };
        let inner = Arc::clone(self);
        slot.task = Some(self.runtime.spawn(inner.run(request)));
        RenderOutcome::Started
    }

    async fn run(self: Arc<Self>, mut request: P::Request) {
        loop {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            let fetched = tokio::select! {
                _ = self.cancel.cancelled() => break,
                r = P::fetch(self.bridge.clone(), request) => r,
            };
            self.apply(fetched);

            let mut slot = lock(&self.slot);
            if !slot.rerun || self.cancel.is_cancelled() {
                break;
            }
            slot.rerun = false;
            match lock(&self.panel).request() {
                Some(next) => request = next,
                None => break,
            }
        }
        lock(&self.slot).task = None;
        self.settled.notify_waiters();
    }

    fn apply(&self, fetched: Result<Option<P::Frame>>) {
        let mut panel = lock(&self.panel);
        panel.clear();
        let drawn = fetched.and_then(|frame| panel.present(frame));
        if let Err(e) = drawn {
            error!(panel = panel.name(), error = %e, "render failed");
            panel.clear();
        }
    }
}

/// Owns a panel and the single-flight slot that guards its fetches.
///
/// Dropping the scheduler stops its ticker; an in-flight fetch is abandoned
/// without being drawn.
pub struct RenderScheduler<P: RenderPanel> {
    inner: Arc<Inner<P>>,
}

impl<P: RenderPanel> std::fmt::Debug for RenderScheduler<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderScheduler")
            .field("policy", &self.inner.policy)
            .field("in_flight", &self.is_in_flight())
            .field("fetches", &self.fetch_count())
            .finish()
    }
}

impl<P: RenderPanel> RenderScheduler<P> {
    /// Must be called from within a tokio runtime.
    pub fn new(
        panel: P,
        bridge: ComputeBridge,
        training: TrainingFlag,
        policy: FlightPolicy,
    ) -> Result<Self> {
        let runtime = Handle::try_current()?;
        Ok(Self {
            inner: Arc::new(Inner {
                panel: Mutex::new(panel),
                bridge,
                training,
                policy,
                runtime,
                slot: Mutex::new(FlightSlot::default()),
                ticker: Mutex::new(None),
                cancel: CancellationToken::new(),
                settled: Notify::new(),
                fetches: AtomicUsize::new(0),
            }),
        })
    }

    /// Starts (or restarts) the periodic ticker.
    pub fn start(&self, period: Duration) {
        let weak = Arc::downgrade(&self.inner);
        let cancel = self.inner.cancel.clone();
        let name = self.with_panel(|p| p.name());
        let ticker = self.inner.runtime.spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {}
                }
                let Some(inner) = weak.upgrade() else { break };
                inner.maybe_render(false);
            }
            debug!(panel = name, "ticker stopped");
        });
        if let Some(old) = lock(&self.inner.ticker).replace(ticker) {
            old.abort();
        }
        info!(panel = name, period_ms = period.as_millis() as u64, "render ticker started");
    }

    pub fn maybe_render(&self, force: bool) -> RenderOutcome {
        self.inner.maybe_render(force)
    }

    /// Bypasses the training check; still single-flight.
    pub fn force_render(&self) -> RenderOutcome {
        self.inner.maybe_render(true)
    }

    /// A callback that force-renders this panel while it is alive.
    pub fn trigger(&self) -> impl Fn() + Send + Sync + 'static {
        let weak: Weak<Inner<P>> = Arc::downgrade(&self.inner);
        move || {
            if let Some(inner) = weak.upgrade() {
                inner.maybe_render(true);
            }
        }
    }

    pub fn with_panel<R>(&self, f: impl FnOnce(&mut P) -> R) -> R {
        f(&mut lock(&self.inner.panel))
    }

    pub fn is_in_flight(&self) -> bool {
        lock(&self.inner.slot).task.is_some()
    }

    /// Fetches issued so far, follow-ups included.
    pub fn fetch_count(&self) -> usize {
        self.inner.fetches.load(Ordering::SeqCst)
    }

    /// Resolves once no fetch is in flight.
    pub async fn settled(&self) {
        loop {
            let notified = self.inner.settled.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !self.is_in_flight() {
                return;
            }
            notified.await;
        }
    }

    pub fn policy(&self) -> FlightPolicy {
        self.inner.policy
    }

    pub fn dispose(&self) {
        if self.inner.cancel.is_cancelled() {
            return;
        }
        self.inner.cancel.cancel();
        if let Some(ticker) = lock(&self.inner.ticker).take() {
            ticker.abort();
        }
        let name = self.with_panel(|p| p.name());
        info!(panel = name, "render scheduler disposed");
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }
}

impl<P: RenderPanel> Drop for RenderScheduler<P> {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::testing::FakeService;
    use crate::model::{NetworkSnapshot, NetworkTopology, ProbeCoordinate, Selection};

    /// Records what it was asked to draw.
    struct Probe {
        presented: Vec<Option<usize>>,
        clears: usize,
    }

    impl RenderPanel for Probe {
        type Request = ();
        type Frame = NetworkSnapshot;

        fn name(&self) -> &'static str {
            "probe"
        }

        fn request(&mut self) -> Option<()> {
            Some(())
        }

        fn fetch(
            bridge: ComputeBridge,
            _: (),
        ) -> impl Future<Output = Result<Option<NetworkSnapshot>>> + Send + 'static {
            async move {
                bridge
                    .get_viz_data(ProbeCoordinate::CENTER, Selection::None, 1)
                    .await
            }
        }

        fn present(&mut self, frame: Option<NetworkSnapshot>) -> Result<()> {
            self.presented.push(frame.map(|s| s.hidden.len()));
            Ok(())
        }

        fn clear(&mut self) {
            self.clears += 1;
        }
    }

    fn probe() -> Probe {
        Probe {
            presented: Vec::new(),
            clears: 0,
        }
    }

    fn topo() -> Option<NetworkTopology> {
        Some(NetworkTopology::new(2, vec![3, 2], 1))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn back_to_back_forced_renders_keep_one_fetch_in_flight() {
        let (svc, gate) = FakeService::new(topo()).gated();
        let counters = svc.counters.clone();
        let bridge = ComputeBridge::spawn(svc).unwrap();
        let sched =
            RenderScheduler::new(probe(), bridge, TrainingFlag::new(), FlightPolicy::Drop).unwrap();

        assert_eq!(sched.force_render(), RenderOutcome::Started);
        assert_eq!(sched.force_render(), RenderOutcome::Dropped);
        assert!(sched.is_in_flight());

        gate.send(()).unwrap();
        sched.settled().await;
        assert_eq!(counters.viz_calls(), 1);
        assert_eq!(sched.fetch_count(), 1);
        sched.with_panel(|p| assert_eq!(p.presented, vec![Some(2)]));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn coalesce_runs_exactly_one_follow_up() {
        let (svc, gate) = FakeService::new(topo()).gated();
        let counters = svc.counters.clone();
        let bridge = ComputeBridge::spawn(svc).unwrap();
        let sched = RenderScheduler::new(probe(), bridge, TrainingFlag::new(), FlightPolicy::Coalesce)
            .unwrap();

        assert_eq!(sched.force_render(), RenderOutcome::Started);
        assert_eq!(sched.force_render(), RenderOutcome::Coalesced);
        assert_eq!(sched.force_render(), RenderOutcome::Coalesced);

        gate.send(()).unwrap();
        gate.send(()).unwrap();
        sched.settled().await;
        assert_eq!(counters.viz_calls(), 2);
        sched.with_panel(|p| assert_eq!(p.presented.len(), 2));
    }

    #[tokio::test]
    async fn periodic_ticks_only_render_while_training() {
        let bridge = ComputeBridge::spawn(FakeService::new(topo())).unwrap();
        let training = TrainingFlag::new();
        let sched =
            RenderScheduler::new(probe(), bridge, training.clone(), FlightPolicy::Drop).unwrap();

        assert_eq!(sched.maybe_render(false), RenderOutcome::SkippedIdle);
        training.set(true);
        assert_eq!(sched.maybe_render(false), RenderOutcome::Started);
        sched.settled().await;
        assert_eq!(sched.fetch_count(), 1);
    }

    #[tokio::test]
    async fn uninitialized_model_presents_the_empty_state() {
        let bridge = ComputeBridge::spawn(FakeService::new(None)).unwrap();
        let sched =
            RenderScheduler::new(probe(), bridge, TrainingFlag::new(), FlightPolicy::Drop).unwrap();
        sched.force_render();
        sched.settled().await;
        sched.with_panel(|p| {
            assert_eq!(p.presented, vec![None]);
            assert_eq!(p.clears, 1);
        });
    }

    #[tokio::test(start_paused = true)]
    async fn ticker_fires_on_its_period_and_stops_on_dispose() {
        let bridge = ComputeBridge::spawn(FakeService::new(topo())).unwrap();
        let training = TrainingFlag::new();
        training.set(true);
        let sched =
            RenderScheduler::new(probe(), bridge, training, FlightPolicy::Drop).unwrap();
        sched.start(Duration::from_millis(200));

        // Let the immediate first tick land.
        tokio::time::sleep(Duration::from_millis(1)).await;
        sched.settled().await;
        assert!(sched.fetch_count() >= 1);

        sched.dispose();
        let before = sched.fetch_count();
        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(sched.fetch_count(), before);
        assert_eq!(sched.force_render(), RenderOutcome::Disposed);
    }
}
