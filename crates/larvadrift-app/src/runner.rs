//! Run control for single simulations.
//!
//! A single run executes on a dedicated worker thread so a supervising
//! process stays responsive; cancellation is cooperative through a stop
//! flag polled once per integration step.

use anyhow::{Result, anyhow};
use larvadrift_core::{CalendarDate, CensusSnapshot, RunObserver, RunOutcome, Simulation};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use tracing::debug;

/// Observer forwarding census refreshes to the log.
#[derive(Debug, Default)]
pub struct ProgressLog;

impl RunObserver for ProgressLog {
    fn on_refresh(&mut self, census: &CensusSnapshot, date: &CalendarDate) {
        debug!(
            %date,
            live = census.live,
            out = census.out_count,
            recruited = census.recruit_counts.iter().sum::<u32>(),
            "refresh"
        );
    }
}

/// Handle on a simulation running on its own worker thread.
pub struct RunHandle {
    stop: Arc<AtomicBool>,
    thread: JoinHandle<Result<RunOutcome, larvadrift_core::SimulationError>>,
}

impl RunHandle {
    /// Move an initialized simulation onto a worker thread and start it.
    pub fn spawn(mut simulation: Simulation) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let thread = thread::Builder::new()
            .name("larvadrift-run".into())
            .spawn(move || {
                let mut observer = ProgressLog;
                simulation.run(&flag, &mut observer)
            })?;
        Ok(Self { stop, thread })
    }

    /// Request a graceful stop; the worker finishes its current step,
    /// flushes output and terminates.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    /// Wait for the run to finish and return its outcome.
    pub fn join(self) -> Result<RunOutcome> {
        self.thread
            .join()
            .map_err(|_| anyhow!("simulation worker panicked"))?
            .map_err(Into::into)
    }
}
