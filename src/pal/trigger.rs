//! Three-phase trigger rendezvous with the autosampler.
//!
//! The autosampler raises three digital lines per physical operation: start,
//! continue (sampling) and done. The digital input card only supports level
//! snapshots, so a poller task samples the lines every `poll_interval_ms`,
//! detects rising edges and timestamps them into three single-slot queues.
//! The [`TriggerSynchronizer`] then awaits the phases in order:
//!
//! ```text
//! idle -> awaiting_start -> awaiting_continue -> awaiting_done -> complete
//! ```
//!
//! A start timeout marks the whole session as timed out and ends the wait
//! without entering the later phases. Continue and done timeouts only report
//! their own kind.
//!
//! Recorded timestamps are strictly increasing. Edges seen in the same poll
//! share one timestamp, so a phase that ties with the previous one is
//! recorded one microsecond after it; older timestamps are stale and
//! discarded.

use crate::config::TriggerConfig;
use crate::error::{AppResult, WorkcellError};
use crate::estop::EstopFlag;
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

/// One of the three acknowledgments of a physical operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerPhase {
    /// The operation started
    Start,
    /// Sampling has started
    Continue,
    /// The operation completed
    Done,
}

/// State of the [`TriggerSynchronizer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerState {
    /// Not waiting
    Idle,
    /// Waiting for the start trigger
    AwaitingStart,
    /// Waiting for the continue trigger
    AwaitingContinue,
    /// Waiting for the done trigger
    AwaitingDone,
    /// All three phases seen
    Complete,
}

/// Level snapshot of digital input lines.
pub trait DigitalInputs: Send + Sync {
    /// One level per requested line, in request order.
    fn read_lines(&self, lines: &[u32]) -> AppResult<Vec<bool>>;
}

/// Receiving ends of the three trigger queues.
pub struct TriggerChannels {
    /// Start edges
    pub start: mpsc::Receiver<DateTime<Utc>>,
    /// Continue edges
    pub continue_: mpsc::Receiver<DateTime<Utc>>,
    /// Done edges
    pub done: mpsc::Receiver<DateTime<Utc>>,
}

/// Poller task that is aborted when dropped.
pub struct TriggerPoller {
    handle: JoinHandle<()>,
    /// Queues fed by the poller
    pub channels: TriggerChannels,
}

impl TriggerPoller {
    /// Start polling the configured lines.
    pub fn spawn(inputs: Arc<dyn DigitalInputs>, config: &TriggerConfig) -> Self {
        let (start_tx, start) = mpsc::channel(1);
        let (continue_tx, continue_) = mpsc::channel(1);
        let (done_tx, done) = mpsc::channel(1);
        let lines = [config.start_line, config.continue_line, config.done_line];
        let senders = [start_tx, continue_tx, done_tx];
        let interval = config.poll_interval();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut previous: Option<Vec<bool>> = None;
            loop {
                ticker.tick().await;
                let levels = match inputs.read_lines(&lines) {
                    Ok(levels) if levels.len() == lines.len() => levels,
                    Ok(levels) => {
                        warn!(
                            "trigger poll returned {} levels for {} lines",
                            levels.len(),
                            lines.len()
                        );
                        continue;
                    }
                    Err(e) => {
                        warn!("trigger poll failed: {}", e);
                        continue;
                    }
                };
                if let Some(prev) = &previous {
                    let now = Utc::now();
                    for (i, sender) in senders.iter().enumerate() {
                        if levels[i] && !prev[i] && sender.try_send(now).is_err() {
                            debug!("trigger line {} edge dropped, queue full", lines[i]);
                        }
                    }
                }
                previous = Some(levels);
            }
        });

        Self {
            handle,
            channels: TriggerChannels {
                start,
                continue_,
                done,
            },
        }
    }
}

impl Drop for TriggerPoller {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Timestamps observed for one physical operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TriggerTimes {
    /// Start edge time
    pub start: Option<DateTime<Utc>>,
    /// Continue edge time
    pub continue_: Option<DateTime<Utc>>,
    /// Done edge time
    pub done: Option<DateTime<Utc>>,
}

/// Awaits the three phases of each operation of one run.
pub struct TriggerSynchronizer {
    timeout: Duration,
    timed_out: Arc<AtomicBool>,
    state: TriggerState,
    entered: Vec<TriggerState>,
    last_seen: Option<DateTime<Utc>>,
}

impl TriggerSynchronizer {
    /// A start timeout sets `timed_out`.
    pub fn new(timeout: Duration, timed_out: Arc<AtomicBool>) -> Self {
        Self {
            timeout,
            timed_out,
            state: TriggerState::Idle,
            entered: Vec::new(),
            last_seen: None,
        }
    }

    /// Current state.
    pub fn state(&self) -> TriggerState {
        self.state
    }

    /// States entered by the most recent [`TriggerSynchronizer::wait`].
    pub fn entered(&self) -> &[TriggerState] {
        &self.entered
    }

    fn enter(&mut self, state: TriggerState) {
        self.state = state;
        self.entered.push(state);
    }

    /// Wait for start, continue and done. Without channels (no trigger lines
    /// configured) this returns immediately with no timestamps.
    pub async fn wait(
        &mut self,
        channels: Option<&mut TriggerChannels>,
        estop: &EstopFlag,
    ) -> AppResult<TriggerTimes> {
        self.entered.clear();
        self.state = TriggerState::Idle;
        let Some(channels) = channels else {
            self.enter(TriggerState::Complete);
            return Ok(TriggerTimes::default());
        };

        self.enter(TriggerState::AwaitingStart);
        let start = match self
            .await_phase(TriggerPhase::Start, &mut channels.start, estop)
            .await
        {
            Ok(ts) => ts,
            Err(e) => {
                if matches!(e, WorkcellError::TriggerTimeout(_)) {
                    self.timed_out.store(true, Ordering::SeqCst);
                }
                return Err(e);
            }
        };

        self.enter(TriggerState::AwaitingContinue);
        let continue_ = self
            .await_phase(TriggerPhase::Continue, &mut channels.continue_, estop)
            .await?;

        self.enter(TriggerState::AwaitingDone);
        let done = self
            .await_phase(TriggerPhase::Done, &mut channels.done, estop)
            .await?;

        self.enter(TriggerState::Complete);
        Ok(TriggerTimes {
            start: Some(start),
            continue_: Some(continue_),
            done: Some(done),
        })
    }

    async fn await_phase(
        &mut self,
        phase: TriggerPhase,
        rx: &mut mpsc::Receiver<DateTime<Utc>>,
        estop: &EstopFlag,
    ) -> AppResult<DateTime<Utc>> {
        if estop.is_set() {
            return Err(WorkcellError::Estop);
        }
        let deadline = Instant::now() + self.timeout;
        loop {
            tokio::select! {
                biased;
                _ = estop.wait() => return Err(WorkcellError::Estop),
                received = tokio::time::timeout_at(deadline, rx.recv()) => match received {
                    Err(_) => {
                        warn!("{:?} trigger not seen within {:?}", phase, self.timeout);
                        return Err(WorkcellError::TriggerTimeout(phase));
                    }
                    Ok(None) => {
                        return Err(WorkcellError::NotAvailable(
                            "trigger poller stopped".to_string(),
                        ))
                    }
                    Ok(Some(ts)) if self.last_seen.is_some_and(|last| ts < last) => {
                        debug!("discarding stale {:?} trigger at {}", phase, ts);
                    }
                    Ok(Some(seen)) => {
                        let ts = match self.last_seen {
                            Some(last) if seen <= last => last + TimeDelta::microseconds(1),
                            _ => seen,
                        };
                        debug!("{:?} trigger at {}", phase, ts);
                        self.last_seen = Some(ts);
                        return Ok(ts);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channels() -> (
        [mpsc::Sender<DateTime<Utc>>; 3],
        TriggerChannels,
    ) {
        let (a, start) = mpsc::channel(1);
        let (b, continue_) = mpsc::channel(1);
        let (c, done) = mpsc::channel(1);
        (
            [a, b, c],
            TriggerChannels {
                start,
                continue_,
                done,
            },
        )
    }

    #[tokio::test]
    async fn test_phases_in_order() {
        let (tx, mut rx) = channels();
        let t0 = Utc::now();
        for (i, sender) in tx.iter().enumerate() {
            sender.send(t0 + TimeDelta::seconds(i as i64)).await.unwrap();
        }
        let mut sync = TriggerSynchronizer::new(Duration::from_secs(1), Arc::default());
        let times = sync.wait(Some(&mut rx), &EstopFlag::new()).await.unwrap();
        assert!(times.start < times.continue_ && times.continue_ < times.done);
        assert_eq!(sync.state(), TriggerState::Complete);
    }

    #[tokio::test]
    async fn test_same_poll_edges_stay_ordered() {
        let (tx, mut rx) = channels();
        let t0 = Utc::now();
        for sender in &tx {
            sender.send(t0).await.unwrap();
        }
        let mut sync = TriggerSynchronizer::new(Duration::from_secs(1), Arc::default());
        let times = sync.wait(Some(&mut rx), &EstopFlag::new()).await.unwrap();
        assert_eq!(times.start, Some(t0));
        assert_eq!(times.continue_, Some(t0 + TimeDelta::microseconds(1)));
        assert_eq!(times.done, Some(t0 + TimeDelta::microseconds(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_timeout_skips_later_phases() {
        let (_tx, mut rx) = channels();
        let timed_out = Arc::new(AtomicBool::new(false));
        let mut sync = TriggerSynchronizer::new(Duration::from_secs(5), timed_out.clone());
        let err = sync.wait(Some(&mut rx), &EstopFlag::new()).await.unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::StartTimeout);
        assert!(timed_out.load(Ordering::SeqCst));
        assert_eq!(sync.entered(), &[TriggerState::AwaitingStart]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_done_timeout_does_not_mark_session() {
        let (tx, mut rx) = channels();
        let t0 = Utc::now();
        tx[0].send(t0).await.unwrap();
        tx[1].send(t0 + TimeDelta::seconds(1)).await.unwrap();
        let timed_out = Arc::new(AtomicBool::new(false));
        let mut sync = TriggerSynchronizer::new(Duration::from_secs(5), timed_out.clone());
        let err = sync.wait(Some(&mut rx), &EstopFlag::new()).await.unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::DoneTimeout);
        assert!(!timed_out.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_timestamp_is_discarded() {
        let (tx, mut rx) = channels();
        let t0 = Utc::now();
        tx[0].send(t0).await.unwrap();
        tx[1].send(t0 - TimeDelta::seconds(1)).await.unwrap();
        let mut sync = TriggerSynchronizer::new(Duration::from_secs(5), Arc::default());
        let err = sync.wait(Some(&mut rx), &EstopFlag::new()).await.unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::ContinueTimeout);
    }

    #[tokio::test]
    async fn test_no_channels_is_noop() {
        let mut sync = TriggerSynchronizer::new(Duration::from_secs(1), Arc::default());
        let times = sync.wait(None, &EstopFlag::new()).await.unwrap();
        assert_eq!(times, TriggerTimes::default());
    }

    #[tokio::test]
    async fn test_estop_interrupts_wait() {
        let (_tx, mut rx) = channels();
        let estop = EstopFlag::new();
        let mut sync = TriggerSynchronizer::new(Duration::from_secs(60), Arc::default());
        let setter = {
            let estop = estop.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                estop.set(true);
            })
        };
        let err = sync.wait(Some(&mut rx), &estop).await.unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::Estop);
        setter.await.unwrap();
    }

    struct Scripted {
        polls: parking_lot::Mutex<u32>,
    }

    impl DigitalInputs for Scripted {
        fn read_lines(&self, _lines: &[u32]) -> AppResult<Vec<bool>> {
            let mut polls = self.polls.lock();
            *polls += 1;
            // start goes high on poll 2, continue on 3, done on 4
            Ok(vec![*polls >= 2, *polls >= 3, *polls >= 4])
        }
    }

    #[tokio::test]
    async fn test_poller_detects_rising_edges() {
        let config = TriggerConfig {
            start_line: 0,
            continue_line: 1,
            done_line: 2,
            poll_interval_ms: 5,
            timeout_secs: 1,
        };
        let inputs = Arc::new(Scripted {
            polls: parking_lot::Mutex::new(0),
        });
        let mut poller = TriggerPoller::spawn(inputs, &config);
        let mut sync = TriggerSynchronizer::new(config.timeout(), Arc::default());
        let times = sync
            .wait(Some(&mut poller.channels), &EstopFlag::new())
            .await
            .unwrap();
        assert!(times.start < times.continue_);
        assert!(times.continue_ < times.done);
    }
}
