//! Waiting for named artifacts to show up in a job's output listing.
//!
//! Artifacts can exist before the job itself is done (partial results), so
//! this is a separate watcher from [`crate::terminal::TerminalStatePoller`].
//! Unlike that one it is bounded twice: by a total attempt budget and by a
//! budget of consecutive failed fetches.

use std::time::Duration;

use async_trait::async_trait;
use rnaflow_data::{Job, JobState};
use tracing::{debug, info, warn};

use crate::{
    backend::{fetch_within, SharedBackend},
    config::PollSettings,
    error::ClientError,
    poll_loop::{Flow, PollLoop, Tick},
};

#[derive(Clone, Debug, PartialEq)]
pub enum WaitOutcome {
    /// every required artifact is listed on this snapshot
    Satisfied(Job),
    /// the job failed before producing the artifacts
    JobFailed { message: String },
    TimedOut { attempts: u32 },
    /// too many fetches in a row failed
    Unreachable { faults: u32, last_error: String },
    /// a fetch failed locally, in a way no retry fixes
    Aborted { error: String },
}

#[derive(Clone, Debug, PartialEq)]
pub enum WaitEvent {
    Progress {
        attempt: u32,
        missing: Vec<String>,
        job: Job,
    },
    Fault {
        attempt: u32,
        faults: u32,
        error: String,
    },
    Finished(WaitOutcome),
}

/// Bounded-retry state machine behind [`PrerequisiteWaiter`], clock free.
#[derive(Debug, Clone)]
pub struct PrerequisiteTracker {
    required: Vec<String>,
    max_attempts: u32,
    max_faults: u32,
    attempts: u32,
    faults: u32,
}

impl PrerequisiteTracker {
    pub fn new(required: Vec<String>, max_attempts: u32, max_faults: u32) -> Self {
        Self {
            required,
            max_attempts,
            max_faults,
            attempts: 0,
            faults: 0,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn faults(&self) -> u32 {
        self.faults
    }

    pub fn missing(&self, job: &Job) -> Vec<String> {
        let names: Vec<&str> = self.required.iter().map(String::as_str).collect();
        job.missing_outputs(&names)
    }

    /// counts one attempt that got a snapshot back
    /// satisfaction wins over a failed job state seen on the same snapshot
    pub fn observe(&mut self, job: &Job) -> Option<WaitOutcome> {
        self.attempts += 1;
        self.faults = 0;
        if self.missing(job).is_empty() {
            return Some(WaitOutcome::Satisfied(job.clone()));
        }
        if job.state == JobState::Error {
            return Some(WaitOutcome::JobFailed {
                message: job.message_or("job failed").to_string(),
            });
        }
        if self.attempts >= self.max_attempts {
            return Some(WaitOutcome::TimedOut {
                attempts: self.attempts,
            });
        }
        None
    }

    /// counts one attempt whose fetch failed
    /// only transport errors are retried
    pub fn observe_fault(&mut self, error: &ClientError) -> Option<WaitOutcome> {
        self.attempts += 1;
        if !error.is_transport() {
            return Some(WaitOutcome::Aborted {
                error: error.to_string(),
            });
        }
        self.faults += 1;
        if self.faults >= self.max_faults {
            return Some(WaitOutcome::Unreachable {
                faults: self.faults,
                last_error: error.to_string(),
            });
        }
        if self.attempts >= self.max_attempts {
            return Some(WaitOutcome::TimedOut {
                attempts: self.attempts,
            });
        }
        None
    }
}

struct WaitTick<F> {
    backend: SharedBackend,
    job_id: String,
    tick_timeout: Duration,
    tracker: PrerequisiteTracker,
    on_event: F,
}

#[async_trait]
impl<F> Tick for WaitTick<F>
where
    F: FnMut(WaitEvent) + Send + 'static,
{
    async fn tick(&mut self) -> Result<Flow, ClientError> {
        let outcome = match fetch_within(self.backend.as_ref(), &self.job_id, self.tick_timeout).await {
            Ok(job) => match self.tracker.observe(&job) {
                Some(outcome) => outcome,
                None => {
                    let missing = self.tracker.missing(&job);
                    debug!(job_id = %self.job_id, attempt = self.tracker.attempts(), ?missing, "still waiting");
                    (self.on_event)(WaitEvent::Progress {
                        attempt: self.tracker.attempts(),
                        missing,
                        job,
                    });
                    return Ok(Flow::Continue);
                }
            },
            Err(err) => {
                warn!(job_id = %self.job_id, faults = self.tracker.faults() + 1, "status fetch failed: {}", err);
                match self.tracker.observe_fault(&err) {
                    Some(outcome) => outcome,
                    None => {
                        (self.on_event)(WaitEvent::Fault {
                            attempt: self.tracker.attempts(),
                            faults: self.tracker.faults(),
                            error: err.to_string(),
                        });
                        return Ok(Flow::Continue);
                    }
                }
            }
        };
        info!(job_id = %self.job_id, attempts = self.tracker.attempts(), outcome = outcome_name(&outcome), "prerequisite wait finished");
        (self.on_event)(WaitEvent::Finished(outcome));
        Ok(Flow::Stop)
    }
}

fn outcome_name(outcome: &WaitOutcome) -> &'static str {
    match outcome {
        WaitOutcome::Satisfied(_) => "satisfied",
        WaitOutcome::JobFailed { .. } => "job-failed",
        WaitOutcome::TimedOut { .. } => "timed-out",
        WaitOutcome::Unreachable { .. } => "unreachable",
        WaitOutcome::Aborted { .. } => "aborted",
    }
}

/// Polls a job until a set of artifacts is listed, the job fails, or a
/// budget runs out. Every finished wait reports exactly one
/// [`WaitEvent::Finished`]; a stopped wait reports nothing more.
pub struct PrerequisiteWaiter {
    backend: SharedBackend,
    interval: Duration,
    tick_timeout: Duration,
    max_attempts: u32,
    max_faults: u32,
    poll: PollLoop,
}

impl PrerequisiteWaiter {
    pub fn new(backend: SharedBackend, settings: &PollSettings) -> Self {
        Self {
            backend,
            interval: settings.prerequisite_interval(),
            tick_timeout: settings.tick_timeout(),
            max_attempts: settings.prerequisite_max_attempts,
            max_faults: settings.prerequisite_max_faults,
            poll: PollLoop::new("prerequisites"),
        }
    }

    /// (re)starts waiting for `required` on `job_id`
    pub fn start<F>(&mut self, job_id: &str, required: &[&str], on_event: F)
    where
        F: FnMut(WaitEvent) + Send + 'static,
    {
        let tracker = PrerequisiteTracker::new(
            required.iter().map(|name| name.to_string()).collect(),
            self.max_attempts,
            self.max_faults,
        );
        info!(job_id, ?required, max_attempts = self.max_attempts, "waiting for artifacts");
        let tick = WaitTick {
            backend: self.backend.clone(),
            job_id: job_id.to_string(),
            tick_timeout: self.tick_timeout,
            tracker,
            on_event,
        };
        self.poll.start(self.interval, tick);
    }

    pub fn stop(&mut self) -> bool {
        self.poll.stop()
    }

    pub fn is_active(&self) -> bool {
        self.poll.is_active()
    }
}

#[cfg(test)]
mod test {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use rnaflow_data::{artifacts::GSEA_ARTIFACTS, JobState};
    use tokio::time::sleep;

    use super::*;
    use crate::test_support::{job, paused_runtime, setup, ScriptedBackend, Step};

    const BOTH: &[&str] = &["gsea_results.csv", "gsea_core_genes.json"];

    fn settings(max_attempts: u32, max_faults: u32) -> PollSettings {
        PollSettings {
            prerequisite_max_attempts: max_attempts,
            prerequisite_max_faults: max_faults,
            ..Default::default()
        }
    }

    fn collect() -> (Arc<Mutex<Vec<WaitEvent>>>, impl FnMut(WaitEvent) + Send + 'static) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        (events, move |event: WaitEvent| sink.lock().unwrap().push(event))
    }

    fn finished(events: &Arc<Mutex<Vec<WaitEvent>>>) -> Vec<WaitOutcome> {
        events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|event| match event {
                WaitEvent::Finished(outcome) => Some(outcome.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_tracker_counts_exact_budget() {
        let running = job(JobState::Running, &[]);
        let mut tracker = PrerequisiteTracker::new(vec!["a.csv".to_string()], 3, 2);
        assert_eq!(None, tracker.observe(&running));
        assert_eq!(None, tracker.observe(&running));
        assert_eq!(
            Some(WaitOutcome::TimedOut { attempts: 3 }),
            tracker.observe(&running)
        );
    }

    // testing that a good snapshot resets the consecutive fault count
    #[test]
    fn test_tracker_faults_are_consecutive() {
        let err = ClientError::Timeout(10);
        let running = job(JobState::Running, &[]);
        let mut tracker = PrerequisiteTracker::new(vec!["a.csv".to_string()], 100, 2);
        assert_eq!(None, tracker.observe_fault(&err));
        assert_eq!(None, tracker.observe(&running));
        assert_eq!(None, tracker.observe_fault(&err));
        assert!(matches!(
            tracker.observe_fault(&err),
            Some(WaitOutcome::Unreachable { faults: 2, .. })
        ));
        assert_eq!(4, tracker.attempts());
    }

    // testing that a local error ends the wait at once instead of being retried
    #[test]
    fn test_tracker_local_error_aborts() {
        let mut tracker = PrerequisiteTracker::new(vec!["a.csv".to_string()], 100, 20);
        assert_eq!(
            Some(WaitOutcome::Aborted {
                error: "no job id given".to_string()
            }),
            tracker.observe_fault(&ClientError::EmptyJobId)
        );
        assert_eq!(0, tracker.faults());
    }

    // testing that a job that never produces the artifacts times out after exactly N attempts
    #[test]
    fn test_times_out_after_exact_attempts() {
        setup();
        paused_runtime().block_on(async {
            let backend = ScriptedBackend::new(vec![Step::Snapshot(job(JobState::Running, &[]))]);
            let mut waiter = PrerequisiteWaiter::new(backend.clone(), &settings(5, 20));
            let (events, on_event) = collect();
            waiter.start("J1", BOTH, on_event);

            // attempts at 0s, 2s, 4s, 6s and 8s
            sleep(Duration::from_secs(7)).await;
            assert!(finished(&events).is_empty());
            assert_eq!(4, backend.fetch_count());

            sleep(Duration::from_secs(30)).await;
            assert_eq!(vec![WaitOutcome::TimedOut { attempts: 5 }], finished(&events));
            assert_eq!(5, backend.fetch_count());
            assert!(!waiter.is_active());
        });
    }

    // testing that a failed job ends the wait on the first tick
    #[test]
    fn test_job_failure_ends_wait() {
        setup();
        paused_runtime().block_on(async {
            let mut failed = job(JobState::Error, &["deseq2_results.csv"]);
            failed.message = Some("GSEA step failed".to_string());
            let backend = ScriptedBackend::new(vec![Step::Snapshot(failed)]);
            let mut waiter = PrerequisiteWaiter::new(backend.clone(), &settings(300, 20));
            let (events, on_event) = collect();
            waiter.start("J1", GSEA_ARTIFACTS, on_event);
            sleep(Duration::from_secs(60)).await;
            assert_eq!(
                vec![WaitOutcome::JobFailed {
                    message: "GSEA step failed".to_string()
                }],
                finished(&events)
            );
            assert_eq!(1, backend.fetch_count());
        });
    }

    // testing that artifacts present on a failed job still satisfy the wait
    #[test]
    fn test_satisfied_wins_over_error() {
        setup();
        paused_runtime().block_on(async {
            let backend = ScriptedBackend::new(vec![Step::Snapshot(job(JobState::Error, BOTH))]);
            let mut waiter = PrerequisiteWaiter::new(backend.clone(), &settings(300, 20));
            let (events, on_event) = collect();
            waiter.start("J1", BOTH, on_event);
            sleep(Duration::from_secs(10)).await;
            let outcomes = finished(&events);
            assert_eq!(1, outcomes.len());
            assert!(matches!(outcomes[0], WaitOutcome::Satisfied(_)));
        });
    }

    #[test]
    fn test_fault_budget() {
        setup();
        paused_runtime().block_on(async {
            let backend = ScriptedBackend::new(vec![Step::Fault]);
            let mut waiter = PrerequisiteWaiter::new(backend.clone(), &settings(300, 3));
            let (events, on_event) = collect();
            waiter.start("J1", BOTH, on_event);
            sleep(Duration::from_secs(60)).await;
            let outcomes = finished(&events);
            assert!(matches!(
                outcomes.as_slice(),
                [WaitOutcome::Unreachable { faults: 3, .. }]
            ));
            assert_eq!(3, backend.fetch_count());
            let fault_events = events
                .lock()
                .unwrap()
                .iter()
                .filter(|event| matches!(event, WaitEvent::Fault { .. }))
                .count();
            assert_eq!(2, fault_events);
        });
    }

    // testing that a hanging fetch is cut off by the per-tick bound and counted
    // as a fault, with no overlapping fetches
    #[test]
    fn test_hanging_fetch_hits_tick_bound() {
        setup();
        paused_runtime().block_on(async {
            let backend = ScriptedBackend::new(vec![Step::Snapshot(job(JobState::Running, &[]))]);
            backend.set_latency(Duration::from_secs(30));
            let settings = PollSettings {
                prerequisite_max_faults: 3,
                tick_timeout_ms: 500,
                ..Default::default()
            };
            let mut waiter = PrerequisiteWaiter::new(backend.clone(), &settings);
            let (events, on_event) = collect();
            waiter.start("J1", BOTH, on_event);

            // fetches at 0s, 2s and 4s, each given up after 0.5s
            sleep(Duration::from_millis(3000)).await;
            assert_eq!(2, backend.fetch_count());
            sleep(Duration::from_secs(60)).await;
            assert_eq!(3, backend.fetch_count());

            let events = events.lock().unwrap();
            assert_eq!(3, events.len());
            for (i, event) in events.iter().take(2).enumerate() {
                match event {
                    WaitEvent::Fault { attempt, faults, error } => {
                        assert_eq!(i as u32 + 1, *attempt);
                        assert_eq!(i as u32 + 1, *faults);
                        assert_eq!("request timed out after 500 ms", error);
                    }
                    other => panic!("unexpected event: {:?}", other),
                }
            }
            assert_eq!(
                WaitEvent::Finished(WaitOutcome::Unreachable {
                    faults: 3,
                    last_error: "request timed out after 500 ms".to_string()
                }),
                events[2]
            );
            assert!(!waiter.is_active());
        });
    }

    // testing that a local error ends the wait after one fetch
    #[test]
    fn test_local_error_ends_wait() {
        setup();
        paused_runtime().block_on(async {
            let backend = ScriptedBackend::new(vec![Step::Snapshot(job(JobState::Running, &[]))]);
            let mut waiter = PrerequisiteWaiter::new(backend.clone(), &settings(300, 20));
            let (events, on_event) = collect();
            waiter.start(" ", BOTH, on_event);
            sleep(Duration::from_secs(60)).await;
            assert!(matches!(
                finished(&events).as_slice(),
                [WaitOutcome::Aborted { .. }]
            ));
            assert_eq!(1, backend.fetch_count());
        });
    }

    // testing three empty snapshots followed by both artifacts on the fourth tick
    #[test]
    fn test_satisfied_on_fourth_tick() {
        setup();
        paused_runtime().block_on(async {
            let running = job(JobState::Running, &[]);
            let backend = ScriptedBackend::new(vec![
                Step::Snapshot(running.clone()),
                Step::Snapshot(running.clone()),
                Step::Snapshot(running),
                Step::Snapshot(job(JobState::Running, BOTH)),
            ]);
            let mut waiter = PrerequisiteWaiter::new(backend.clone(), &settings(300, 20));
            let (events, on_event) = collect();
            waiter.start("J1", BOTH, on_event);

            sleep(Duration::from_secs(5)).await;
            assert!(finished(&events).is_empty());

            sleep(Duration::from_secs(60)).await;
            let events = events.lock().unwrap();
            assert_eq!(4, events.len());
            for (i, event) in events.iter().take(3).enumerate() {
                match event {
                    WaitEvent::Progress { attempt, missing, .. } => {
                        assert_eq!(i as u32 + 1, *attempt);
                        assert_eq!(2, missing.len());
                    }
                    other => panic!("unexpected event: {:?}", other),
                }
            }
            assert!(matches!(events[3], WaitEvent::Finished(WaitOutcome::Satisfied(_))));
            assert_eq!(4, backend.fetch_count());
        });
    }

    // testing that nothing is reported after stop
    #[test]
    fn test_stop_silences_waiter() {
        setup();
        paused_runtime().block_on(async {
            let backend = ScriptedBackend::new(vec![Step::Snapshot(job(JobState::Running, &[]))]);
            let mut waiter = PrerequisiteWaiter::new(backend.clone(), &settings(300, 20));
            let (events, on_event) = collect();
            waiter.start("J1", BOTH, on_event);
            sleep(Duration::from_millis(100)).await;
            assert!(waiter.stop());
            let seen = events.lock().unwrap().len();
            sleep(Duration::from_secs(60)).await;
            assert_eq!(seen, events.lock().unwrap().len());
            assert_eq!(1, backend.fetch_count());
        });
    }
}
