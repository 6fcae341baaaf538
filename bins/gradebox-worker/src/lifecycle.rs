// Run state machine shared by every runner.
//
// QUEUED -> PREPARING -> RUNNING -> COLLECTING -> VALIDATING -> SCORING -> CLEANUP -> COMPLETED | FAILED
// RUNNING -> TIMEOUT -> CLEANUP -> FAILED
// CLEANUP is reachable from every non-terminal state once resources exist.

use crate::error::CleanupWarning;
use std::fmt;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Queued,
    Preparing,
    Running,
    Collecting,
    Validating,
    Scoring,
    Timeout,
    Cleanup,
    Completed,
    Failed,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Completed | RunState::Failed)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunState::Queued => "QUEUED",
            RunState::Preparing => "PREPARING",
            RunState::Running => "RUNNING",
            RunState::Collecting => "COLLECTING",
            RunState::Validating => "VALIDATING",
            RunState::Scoring => "SCORING",
            RunState::Timeout => "TIMEOUT",
            RunState::Cleanup => "CLEANUP",
            RunState::Completed => "COMPLETED",
            RunState::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// Tracks one run through [`RunState`]
#[derive(Debug)]
pub struct RunLifecycle {
    run_id: Uuid,
    state: RunState,
    allocated: bool,
    timed_out: bool,
    history: Vec<RunState>,
    /// Teardown problems that must reach the result even when the run fails
    warnings: Vec<CleanupWarning>,
}

impl RunLifecycle {
    pub fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            state: RunState::Queued,
            allocated: false,
            timed_out: false,
            history: vec![RunState::Queued],
            warnings: Vec::new(),
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn history(&self) -> &[RunState] {
        &self.history
    }

    pub fn record_warnings(&mut self, warnings: impl IntoIterator<Item = CleanupWarning>) {
        self.warnings.extend(warnings);
    }

    pub fn warnings(&self) -> &[CleanupWarning] {
        &self.warnings
    }

    /// Containers, networks or images now exist for this run
    pub fn mark_allocated(&mut self) {
        self.allocated = true;
    }

    fn allowed(&self, next: RunState) -> bool {
        use RunState::*;

        if self.state.is_terminal() {
            return false;
        }
        match (self.state, next) {
            (Queued, Preparing)
            | (Preparing, Running)
            | (Running, Collecting)
            | (Running, Timeout)
            | (Collecting, Validating)
            | (Validating, Scoring)
            | (Scoring, Cleanup)
            | (Timeout, Cleanup) => true,
            (_, Cleanup) => self.allocated,
            (Cleanup, Completed) => !self.timed_out,
            (Cleanup, Failed) => true,
            // Nothing to clean up: fail straight away
            (_, Failed) => !self.allocated,
            _ => false,
        }
    }

    /// Move to `next`. Illegal transitions are logged and ignored.
    pub fn advance(&mut self, next: RunState) -> bool {
        if !self.allowed(next) {
            warn!(run_id = %self.run_id, from = %self.state, to = %next, "Illegal run state transition");
            return false;
        }

        debug!(run_id = %self.run_id, from = %self.state, to = %next, "Run state");
        if next == RunState::Timeout {
            self.timed_out = true;
        }
        self.state = next;
        self.history.push(next);
        true
    }

    /// Enter CLEANUP from wherever the run is, if anything was allocated
    pub fn begin_cleanup(&mut self) {
        if self.state != RunState::Cleanup && self.allocated {
            self.advance(RunState::Cleanup);
        }
    }

    /// Close the run; a timed-out run can only end FAILED
    pub fn finish(&mut self, success: bool) -> RunState {
        self.begin_cleanup();
        let terminal = if success && !self.timed_out {
            RunState::Completed
        } else {
            RunState::Failed
        };
        if !self.state.is_terminal() && !self.advance(terminal) {
            self.advance(RunState::Failed);
        }
        self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use RunState::*;

    #[test]
    fn test_happy_path() {
        let mut run = RunLifecycle::new(Uuid::new_v4());
        for next in [Preparing, Running, Collecting, Validating, Scoring, Cleanup] {
            assert!(run.advance(next), "{} rejected", next);
            if next == Preparing {
                run.mark_allocated();
            }
        }
        assert_eq!(run.finish(true), Completed);
        assert_eq!(
            run.history(),
            &[Queued, Preparing, Running, Collecting, Validating, Scoring, Cleanup, Completed]
        );
    }

    #[test]
    fn test_timeout_always_fails() {
        let mut run = RunLifecycle::new(Uuid::new_v4());
        run.advance(Preparing);
        run.mark_allocated();
        run.advance(Running);
        assert!(run.advance(Timeout));
        assert!(!run.advance(Collecting));
        assert_eq!(run.finish(true), Failed);
        assert_eq!(&run.history()[3..], &[Timeout, Cleanup, Failed]);
    }

    #[test]
    fn test_cleanup_only_after_allocation() {
        let mut run = RunLifecycle::new(Uuid::new_v4());
        run.advance(Preparing);
        assert!(!run.advance(Cleanup));

        run.mark_allocated();
        assert!(run.advance(Cleanup));
        assert_eq!(run.finish(false), Failed);
    }

    #[test]
    fn test_launch_failure_skips_cleanup() {
        let mut run = RunLifecycle::new(Uuid::new_v4());
        run.advance(Preparing);
        assert_eq!(run.finish(false), Failed);
        assert_eq!(run.history(), &[Queued, Preparing, Failed]);
    }

    #[test]
    fn test_terminal_states_are_final() {
        let mut run = RunLifecycle::new(Uuid::new_v4());
        run.finish(false);
        assert!(!run.advance(Preparing));
        assert_eq!(run.state(), Failed);
    }

    #[test]
    fn test_warnings_survive_a_failed_run() {
        let mut run = RunLifecycle::new(Uuid::new_v4());
        run.advance(Preparing);
        run.mark_allocated();
        run.record_warnings(vec![CleanupWarning::new("network not removed")]);
        assert_eq!(run.finish(false), Failed);
        assert_eq!(run.warnings(), &[CleanupWarning::new("network not removed")]);
    }

    #[test]
    fn test_skipping_states_is_rejected() {
        let mut run = RunLifecycle::new(Uuid::new_v4());
        assert!(!run.advance(Running));
        assert!(!run.advance(Scoring));
        assert_eq!(run.state(), Queued);
    }
}
