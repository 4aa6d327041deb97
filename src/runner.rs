/// Core loop: spawn the target, observe one window, terminate, tally, repeat.
///
/// Cycles are independent apart from the running tally, which lives here and
/// is mutated only by this loop.
use crate::config::TallyConfig;
use crate::extract::{Classification, Extractor, Observation};
use crate::report::{CycleReport, ReportSink};
use crate::signals::ShutdownToken;
use crate::supervisor::{self, LaunchError, TerminationOutcome};
use crate::window::{WindowEnd, WindowTiming};

/// Counts of cycles above and below the threshold.
///
/// `Equal` and `NoMatch` cycles are reported but not counted.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Tally {
    pub greater: u64,
    pub lesser: u64,
}

impl Tally {
    pub fn record(&mut self, classification: Classification) {
        match classification {
            Classification::Greater => self.greater += 1,
            Classification::Lesser => self.lesser += 1,
            Classification::Equal | Classification::NoMatch => {}
        }
    }
}

/// Result of one cycle.
#[derive(Debug)]
pub struct CycleResult {
    pub observation: Option<Observation>,
    pub classification: Classification,
    pub end: WindowEnd,
    pub lines_seen: u64,
    pub termination: TerminationOutcome,
}

/// Summary of the entire run, returned to main.
#[derive(Debug)]
pub struct RunSummary {
    pub cycles: u64,
    pub tally: Tally,
    pub exit_reason: ExitReason,
}

/// Why the loop stopped.
#[derive(Debug, PartialEq, Eq)]
pub enum ExitReason {
    /// Reached the configured cycle limit.
    MaxCycles,
    /// SIGINT or SIGTERM received.
    Signal,
}

fn window_timing(config: &TallyConfig) -> WindowTiming {
    WindowTiming {
        budget: config.timing.window(),
        poll_interval: config.timing.poll_interval(),
        final_drain: config.timing.final_drain(),
    }
}

/// Run a single spawn → observe → terminate cycle.
///
/// Only a launch failure is an error; everything else degrades into the
/// returned result.
pub async fn run_cycle(
    config: &TallyConfig,
    extractor: &Extractor,
) -> Result<CycleResult, LaunchError> {
    let mut child = supervisor::spawn(&config.target)?;
    let pid = child.pid();

    let window = child.observe(extractor, &window_timing(config)).await;
    tracing::debug!(
        ?pid,
        end = ?window.end,
        lines = window.lines_seen,
        elapsed_ms = window.elapsed.as_millis() as u64,
        "observation window closed"
    );

    let termination = child.terminate(config.timing.grace_period()).await;
    termination.log(pid);
    tracing::trace!(?pid, phase = ?child.phase(), "cycle child released");

    let classification = Classification::of(
        window.last.as_ref().map(|obs| obs.value),
        config.filter.threshold,
    );

    Ok(CycleResult {
        observation: window.last,
        classification,
        end: window.end,
        lines_seen: window.lines_seen,
        termination,
    })
}

/// Run cycles until the cycle limit is reached or shutdown is requested.
///
/// Returns `Err` only when the target cannot be launched. An in-flight cycle
/// is abandoned on shutdown; dropping it kills the child.
pub async fn run(
    config: &TallyConfig,
    shutdown: &ShutdownToken,
    sink: &mut dyn ReportSink,
) -> Result<RunSummary, LaunchError> {
    let extractor = Extractor::new(config.filter.substring.clone());
    let max_cycles = config.run.max_cycles;
    let mut tally = Tally::default();
    let mut cycles = 0u64;
    let exit_reason;

    tracing::info!(
        command = %config.target.command,
        filter = %config.filter.substring,
        threshold = config.filter.threshold,
        window_ms = config.timing.window_ms,
        ?max_cycles,
        "starting cycle loop"
    );

    loop {
        if max_cycles.is_some_and(|max| cycles >= max) {
            exit_reason = ExitReason::MaxCycles;
            break;
        }
        if shutdown.is_requested() {
            exit_reason = ExitReason::Signal;
            break;
        }

        let result = tokio::select! {
            biased;
            _ = shutdown.requested() => {
                tracing::info!(cycle = cycles + 1, "shutdown requested mid-cycle");
                exit_reason = ExitReason::Signal;
                break;
            }
            result = run_cycle(config, &extractor) => result?,
        };

        cycles += 1;
        tally.record(result.classification);

        let report = CycleReport {
            cycle: cycles,
            finished_at: chrono::Local::now(),
            value: result.observation.as_ref().map(|obs| obs.value),
            classification: result.classification,
            threshold: config.filter.threshold,
            greater: tally.greater,
            lesser: tally.lesser,
            ended_by: result.end,
            window_ms: config.timing.window_ms,
            line: result.observation.map(|obs| obs.line),
        };
        tracing::debug!(
            cycle = cycles,
            value = ?report.value,
            classification = %report.classification,
            lines = result.lines_seen,
            reaped = result.termination.is_reaped(),
            "cycle completed"
        );
        sink.emit(&report);

        if max_cycles.is_some_and(|max| cycles >= max) {
            continue;
        }
        tokio::select! {
            biased;
            _ = shutdown.requested() => {
                exit_reason = ExitReason::Signal;
                break;
            }
            _ = tokio::time::sleep(config.timing.pause()) => {}
        }
    }

    tracing::info!(
        cycles,
        greater = tally.greater,
        lesser = tally.lesser,
        reason = ?exit_reason,
        "loop finished"
    );

    Ok(RunSummary {
        cycles,
        tally,
        exit_reason,
    })
}
