/// Observation window: poll the line queue against a wall-clock deadline.
///
/// The window closes when the budget elapses or the process exits, whichever
/// comes first. An exit is followed by a short bounded drain so output
/// flushed at exit time is not lost.
use crate::extract::{Extractor, LastValue, Observation};
use serde::Serialize;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{timeout, Instant};

/// Timing knobs for one window.
#[derive(Debug, Clone, Copy)]
pub struct WindowTiming {
    pub budget: Duration,
    pub poll_interval: Duration,
    pub final_drain: Duration,
}

/// How the window closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowEnd {
    Expired,
    ProcessExited,
}

#[derive(Debug)]
pub struct WindowOutcome {
    pub last: Option<Observation>,
    pub end: WindowEnd,
    pub lines_seen: u64,
    pub elapsed: Duration,
}

/// Liveness check for the observed process.
pub trait ExitProbe {
    /// Non-blocking: true once the process has exited.
    fn has_exited(&mut self) -> bool;
}

impl ExitProbe for tokio::process::Child {
    fn has_exited(&mut self) -> bool {
        match self.try_wait() {
            Ok(status) => status.is_some(),
            Err(e) => {
                // Leave the decision to the deadline.
                tracing::warn!(error = %e, "failed to poll child status");
                false
            }
        }
    }
}

/// Run one observation window.
pub async fn await_window<P: ExitProbe>(
    probe: &mut P,
    lines: &mut UnboundedReceiver<String>,
    extractor: &Extractor,
    timing: &WindowTiming,
) -> WindowOutcome {
    let start = Instant::now();
    let deadline = start + timing.budget;
    let mut tracker = LastValue::default();
    let mut stream_open = true;

    let end = loop {
        let now = Instant::now();
        if now >= deadline {
            absorb_queued(lines, extractor, &mut tracker);
            break WindowEnd::Expired;
        }
        let wait = timing.poll_interval.min(deadline - now);

        if stream_open {
            match timeout(wait, lines.recv()).await {
                Ok(Some(line)) => {
                    tracker.offer(extractor, &line);
                    continue;
                }
                Ok(None) => {
                    tracing::debug!("output stream closed during window");
                    stream_open = false;
                }
                Err(_) => {}
            }
        } else {
            // Nothing more can arrive; only exit or the deadline can end the window.
            tokio::time::sleep(wait).await;
        }

        if probe.has_exited() {
            tracing::debug!("process exited before deadline, draining");
            final_drain(lines, extractor, &mut tracker, timing.final_drain).await;
            break WindowEnd::ProcessExited;
        }
    };

    let lines_seen = tracker.lines_seen();
    WindowOutcome {
        last: tracker.into_inner(),
        end,
        lines_seen,
        elapsed: start.elapsed(),
    }
}

/// Take every line already queued without waiting.
fn absorb_queued(
    lines: &mut UnboundedReceiver<String>,
    extractor: &Extractor,
    tracker: &mut LastValue,
) {
    while let Ok(line) = lines.try_recv() {
        tracker.offer(extractor, &line);
    }
}

/// Receive lines for at most `budget`, stopping early once the stream closes.
async fn final_drain(
    lines: &mut UnboundedReceiver<String>,
    extractor: &Extractor,
    tracker: &mut LastValue,
    budget: Duration,
) {
    let until = Instant::now() + budget;
    loop {
        let now = Instant::now();
        if now >= until {
            // Budget spent; still take what is already buffered.
            absorb_queued(lines, extractor, tracker);
            return;
        }
        match timeout(until - now, lines.recv()).await {
            Ok(Some(line)) => tracker.offer(extractor, &line),
            Ok(None) | Err(_) => return,
        }
    }
}
