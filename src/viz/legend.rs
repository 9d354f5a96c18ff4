//! Color scale legend: a vertical gradient with max / zero / min labels.
//!
//! The first fetch can race the compute thread's startup, so each attempt is
//! bounded by a short timeout and retried after a delay instead of holding up
//! the first paint.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::canvas::{Canvas, Rgba};
use crate::bridge::ComputeBridge;
use crate::error::Result;

#[derive(Debug, Clone, PartialEq)]
pub struct LegendSpec {
    /// `[min, max]`; max is drawn at the top.
    pub range: [f32; 2],
    pub gradient_width: usize,
    pub gradient_height: usize,
    pub timeout: Duration,
    pub retry_delay: Duration,
    pub max_attempts: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegendState {
    Pending,
    Drawn,
    GaveUp,
}

struct LegendInner<C> {
    canvas: Mutex<C>,
    state: Mutex<LegendState>,
    attempts: AtomicU32,
    done: Notify,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<C: Canvas> LegendInner<C> {
    fn finish(&self, state: LegendState) {
        *lock(&self.state) = state;
        self.done.notify_waiters();
    }

    fn draw(&self, spec: &LegendSpec, gradient: &[u8]) -> Result<()> {
        let mut canvas = lock(&self.canvas);
        let (gw, gh) = (spec.gradient_width, spec.gradient_height);
        let top = canvas.height().saturating_sub(gh) / 2;
        canvas.clear();
        canvas.put_rgba(0, top, gw, gh, gradient)?;

        let [min, max] = spec.range;
        let x = gw as f64 + 4.0;
        let top = top as f64;
        canvas.fill_text(&format!("{max:.1}"), x, top + 6.0, Rgba::LABEL);
        canvas.fill_text("0", x, top + gh as f64 / 2.0 + 3.0, Rgba::LABEL);
        canvas.fill_text(&format!("{min:.1}"), x, top + gh as f64 + 3.0, Rgba::LABEL);
        Ok(())
    }
}

pub struct ColorScaleLegend;

impl ColorScaleLegend {
    /// Starts drawing onto `canvas` in the background. Needs a tokio runtime.
    pub fn mount<C: Canvas + 'static>(
        canvas: C,
        spec: LegendSpec,
        bridge: ComputeBridge,
    ) -> Result<LegendHandle<C>> {
        let runtime = Handle::try_current()?;
        let shared = Arc::new(LegendInner {
            canvas: Mutex::new(canvas),
            state: Mutex::new(LegendState::Pending),
            attempts: AtomicU32::new(0),
            done: Notify::new(),
        });
        let task = runtime.spawn(Self::run(Arc::clone(&shared), spec, bridge));
        Ok(LegendHandle { shared, task })
    }

    async fn run<C: Canvas>(shared: Arc<LegendInner<C>>, spec: LegendSpec, bridge: ComputeBridge) {
        let (gw, gh) = (spec.gradient_width, spec.gradient_height);
        for attempt in 1..=spec.max_attempts {
            shared.attempts.store(attempt, Ordering::SeqCst);
            let fetch = bridge.color_scale_legend(spec.range, gw, gh);
            match tokio::time::timeout(spec.timeout, fetch).await {
                Ok(Ok(gradient)) => {
                    match shared.draw(&spec, &gradient) {
                        Ok(()) => {
                            info!(attempt, "color scale legend drawn");
                            shared.finish(LegendState::Drawn);
                        }
                        Err(e) => {
                            error!(error = %e, "color scale legend could not be drawn");
                            shared.finish(LegendState::GaveUp);
                        }
                    }
                    return;
                }
                Ok(Err(e)) => warn!(attempt, error = %e, "legend fetch failed"),
                Err(_) => warn!(attempt, "legend fetch timed out"),
            }
            if attempt < spec.max_attempts {
                tokio::time::sleep(spec.retry_delay).await;
            }
        }
        warn!(attempts = spec.max_attempts, "giving up on the color scale legend");
        shared.finish(LegendState::GaveUp);
    }
}

/// Mounted legend. Dropping it stops any pending retries.
pub struct LegendHandle<C: Canvas + 'static> {
    shared: Arc<LegendInner<C>>,
    task: JoinHandle<()>,
}

impl<C: Canvas + 'static> LegendHandle<C> {
    pub fn state(&self) -> LegendState {
        *lock(&self.shared.state)
    }

    pub fn attempts(&self) -> u32 {
        self.shared.attempts.load(Ordering::SeqCst)
    }

    pub fn with_canvas<R>(&self, f: impl FnOnce(&C) -> R) -> R {
        f(&lock(&self.shared.canvas))
    }

    /// Resolves once the legend is drawn or retries are exhausted.
    pub async fn wait(&self) -> LegendState {
        loop {
            let notified = self.shared.done.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            let state = self.state();
            if state != LegendState::Pending {
                return state;
            }
            notified.await;
        }
    }
}

impl<C: Canvas + 'static> Drop for LegendHandle<C> {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::testing::FakeService;
    use crate::config::LegendConfig;
    use crate::viz::canvas::PixelCanvas;

    fn spec() -> LegendSpec {
        LegendConfig::default().spec()
    }

    #[tokio::test]
    async fn draws_gradient_and_three_labels() {
        let bridge = ComputeBridge::spawn(FakeService::new(None)).unwrap();
        let legend = ColorScaleLegend::mount(PixelCanvas::new(42, 280), spec(), bridge).unwrap();
        assert_eq!(legend.wait().await, LegendState::Drawn);
        assert_eq!(legend.attempts(), 1);
        legend.with_canvas(|c| {
            assert_eq!(c.pixel(0, 9), Some(Rgba::TRANSPARENT));
            assert_eq!(c.pixel(0, 10), Some(Rgba([1, 2, 3, 255])));
            assert_eq!(c.pixel(17, 269), Some(Rgba([1, 2, 3, 255])));
            assert_eq!(c.pixel(18, 100), Some(Rgba::TRANSPARENT));
            let labels: Vec<(&str, f64, f64)> = c
                .labels()
                .iter()
                .map(|l| (l.text.as_str(), l.x, l.y))
                .collect();
            assert_eq!(
                labels,
                vec![("2.5", 22.0, 16.0), ("0", 22.0, 143.0), ("-2.5", 22.0, 273.0)]
            );
        });
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn slow_first_fetch_is_retried() {
        let mut svc = FakeService::new(None);
        svc.legend_delays = vec![Duration::from_millis(300)];
        let counters = svc.counters.clone();
        let bridge = ComputeBridge::spawn(svc).unwrap();
        let spec = LegendSpec {
            retry_delay: Duration::from_millis(10),
            ..spec()
        };
        let legend = ColorScaleLegend::mount(PixelCanvas::new(42, 280), spec, bridge).unwrap();
        assert_eq!(legend.wait().await, LegendState::Drawn);
        assert!(legend.attempts() > 1);
        assert!(counters.legend_calls() >= 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn gives_up_after_max_attempts() {
        let mut svc = FakeService::new(None);
        svc.legend_delays = vec![Duration::from_millis(500); 2];
        let bridge = ComputeBridge::spawn(svc).unwrap();
        let spec = LegendSpec {
            retry_delay: Duration::from_millis(10),
            max_attempts: 2,
            ..spec()
        };
        let legend = ColorScaleLegend::mount(PixelCanvas::new(42, 280), spec, bridge).unwrap();
        assert_eq!(legend.wait().await, LegendState::GaveUp);
        assert_eq!(legend.attempts(), 2);
        legend.with_canvas(|c| assert!(c.is_blank()));
    }
}
