//! Keep-alive coordinator: periodic liveness probes over the outbound
//! frame queue and a timeout action when the peer goes quiet.
//!
//! Two wirings exist, mirroring the two connection flavors:
//!
//! - **Default** — `on_timeout` disposes the connection; the timer is
//!   started once when the connection is accepted and stopped when it
//!   closes.
//! - **Resumable** — `on_timeout` requests a transport disconnect (not a
//!   close), a disconnect notification calls [`KeepAlive::stop`] and a
//!   resume notification calls [`KeepAlive::start`], so the timer is
//!   inactive exactly while the transport is down. A
//!   [`resume state provider`](KeepAlive::with_resume_state) stamps the
//!   last received position into outgoing probes.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::protocol::Frame;

/// Action invoked exactly once when the liveness window elapses.
pub type TimeoutAction = Arc<dyn Fn() + Send + Sync>;

/// Supplier of the connection's last received position, stamped into
/// outgoing KEEPALIVE frames on resumable connections.
pub type ResumeStateProvider = Arc<dyn Fn() -> u64 + Send + Sync>;

/// Timed liveness protocol over one connection.
pub struct KeepAlive {
    interval: Duration,
    timeout_after: Duration,
    outbound: mpsc::UnboundedSender<Bytes>,
    epoch: Instant,
    last_frame_millis: Arc<AtomicU64>,
    running: Arc<AtomicBool>,
    timer: Mutex<Option<JoinHandle<()>>>,
    on_timeout: TimeoutAction,
    resume_state: Option<ResumeStateProvider>,
}

impl KeepAlive {
    /// Create a coordinator. `interval` paces outgoing probes;
    /// `timeout_after` is the quiet window that triggers `on_timeout`.
    pub fn new(
        interval: Duration,
        timeout_after: Duration,
        outbound: mpsc::UnboundedSender<Bytes>,
        on_timeout: TimeoutAction,
    ) -> Self {
        Self {
            interval,
            timeout_after,
            outbound,
            epoch: Instant::now(),
            last_frame_millis: Arc::new(AtomicU64::new(0)),
            running: Arc::new(AtomicBool::new(false)),
            timer: Mutex::new(None),
            on_timeout,
            resume_state: None,
        }
    }

    /// Attach a resume state provider (resumable connections).
    pub fn with_resume_state(mut self, provider: ResumeStateProvider) -> Self {
        self.resume_state = Some(provider);
        self
    }

    /// True while the timer is armed.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Arm the timer. Idempotent. Arming counts as liveness so a resumed
    /// connection does not time out on stale state.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::AcqRel) {
            return;
        }
        self.touch();

        let interval = self.interval;
        let timeout_after = self.timeout_after;
        let outbound = self.outbound.clone();
        let epoch = self.epoch;
        let last_frame_millis = self.last_frame_millis.clone();
        let running = self.running.clone();
        let on_timeout = self.on_timeout.clone();
        let resume_state = self.resume_state.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if !running.load(Ordering::Acquire) {
                    return;
                }

                let now = epoch.elapsed().as_millis() as u64;
                let last = last_frame_millis.load(Ordering::Acquire);
                if now.saturating_sub(last) >= timeout_after.as_millis() as u64 {
                    // exactly once: losers of this swap do nothing
                    if running.swap(false, Ordering::AcqRel) {
                        on_timeout();
                    }
                    return;
                }

                let position = resume_state.as_ref().map(|state| state()).unwrap_or(0);
                let Ok(frame) = Frame::keepalive(true, position, &[]) else {
                    return;
                };
                if outbound.send(frame.into_bytes()).is_err() {
                    running.store(false, Ordering::Release);
                    return;
                }
            }
        });
        *self.timer.lock() = Some(handle);
    }

    /// Disarm the timer. Idempotent.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.timer.lock().take() {
            handle.abort();
        }
    }

    /// Process an inbound KEEPALIVE frame: refresh liveness and echo
    /// respond-flagged frames with the same data and the respond flag
    /// cleared.
    pub fn receive(&self, frame: &Frame) {
        self.touch();
        if frame.keepalive_respond() {
            let data = frame.data().unwrap_or_default();
            let position = self.resume_state.as_ref().map(|state| state()).unwrap_or(0);
            if let Ok(echo) = Frame::keepalive(false, position, &data) {
                let _ = self.outbound.send(echo.into_bytes());
            }
        }
    }

    fn touch(&self) {
        self.last_frame_millis
            .store(self.epoch.elapsed().as_millis() as u64, Ordering::Release);
    }
}

impl Drop for KeepAlive {
    fn drop(&mut self) {
        if let Some(handle) = self.timer.lock().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::FrameType;
    use std::sync::atomic::AtomicUsize;

    struct Harness {
        keep_alive: KeepAlive,
        outbound: mpsc::UnboundedReceiver<Bytes>,
        timeouts: Arc<AtomicUsize>,
    }

    fn harness(interval: Duration, timeout_after: Duration) -> Harness {
        let (outbound_tx, outbound) = mpsc::unbounded_channel();
        let timeouts = Arc::new(AtomicUsize::new(0));
        let on_timeout: TimeoutAction = {
            let timeouts = timeouts.clone();
            Arc::new(move || {
                timeouts.fetch_add(1, Ordering::SeqCst);
            })
        };
        Harness {
            keep_alive: KeepAlive::new(interval, timeout_after, outbound_tx, on_timeout),
            outbound,
            timeouts,
        }
    }

    fn drain(outbound: &mut mpsc::UnboundedReceiver<Bytes>) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Ok(bytes) = outbound.try_recv() {
            frames.push(Frame::from_bytes(bytes).unwrap());
        }
        frames
    }

    #[tokio::test(start_paused = true)]
    async fn test_probes_sent_each_interval() {
        let mut h = harness(Duration::from_millis(500), Duration::from_millis(1500));
        h.keep_alive.start();

        tokio::time::sleep(Duration::from_millis(1100)).await;
        let frames = drain(&mut h.outbound);
        assert_eq!(frames.len(), 2);
        for frame in &frames {
            assert_eq!(frame.frame_type().unwrap(), FrameType::Keepalive);
            assert!(frame.keepalive_respond());
        }
        assert_eq!(h.timeouts.load(Ordering::SeqCst), 0);

        h.keep_alive.stop();
        assert!(!h.keep_alive.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fires_exactly_once() {
        let h = harness(Duration::from_millis(500), Duration::from_millis(1500));
        h.keep_alive.start();

        tokio::time::sleep(Duration::from_millis(3000)).await;
        assert_eq!(h.timeouts.load(Ordering::SeqCst), 1);
        assert!(!h.keep_alive.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_received_keepalive_defers_timeout() {
        let mut h = harness(Duration::from_millis(500), Duration::from_millis(1500));
        h.keep_alive.start();

        for _ in 0..5 {
            tokio::time::sleep(Duration::from_millis(1000)).await;
            h.keep_alive
                .receive(&Frame::keepalive(false, 0, b"").unwrap());
        }
        assert_eq!(h.timeouts.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(2000)).await;
        assert_eq!(h.timeouts.load(Ordering::SeqCst), 1);
        drain(&mut h.outbound);
    }

    #[tokio::test(start_paused = true)]
    async fn test_respond_flag_is_echoed() {
        let mut h = harness(Duration::from_secs(60), Duration::from_secs(180));
        h.keep_alive
            .receive(&Frame::keepalive(true, 7, b"ping").unwrap());

        let frames = drain(&mut h.outbound);
        assert_eq!(frames.len(), 1);
        assert!(!frames[0].keepalive_respond());
        assert_eq!(frames[0].data().unwrap().as_ref(), b"ping");
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_echo_without_respond_flag() {
        let mut h = harness(Duration::from_secs(60), Duration::from_secs(180));
        h.keep_alive
            .receive(&Frame::keepalive(false, 0, b"pong").unwrap());
        assert!(drain(&mut h.outbound).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_and_restart_as_disconnect_resume() {
        let mut h = harness(Duration::from_millis(500), Duration::from_millis(1500));
        h.keep_alive.start();

        // transport drops: timer disarmed, no timeout while down
        h.keep_alive.stop();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(h.timeouts.load(Ordering::SeqCst), 0);

        // transport resumes: arming refreshes liveness
        h.keep_alive.start();
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(h.timeouts.load(Ordering::SeqCst), 0);
        assert!(!drain(&mut h.outbound).is_empty());

        tokio::time::sleep(Duration::from_millis(2000)).await;
        assert_eq!(h.timeouts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_state_stamped_into_probes() {
        let (outbound_tx, mut outbound) = mpsc::unbounded_channel();
        let keep_alive = KeepAlive::new(
            Duration::from_millis(500),
            Duration::from_millis(5000),
            outbound_tx,
            Arc::new(|| {}),
        )
        .with_resume_state(Arc::new(|| 99));
        keep_alive.start();

        tokio::time::sleep(Duration::from_millis(600)).await;
        let bytes = outbound.try_recv().unwrap();
        let frame = Frame::from_bytes(bytes).unwrap();
        assert_eq!(frame.keepalive_last_position().unwrap(), 99);
        keep_alive.stop();
    }
}
