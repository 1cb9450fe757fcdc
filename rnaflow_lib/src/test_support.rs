//! In-memory backend and runtime helpers shared by the unit tests.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Once,
    },
    time::Duration,
};

use async_trait::async_trait;
use lazy_static::lazy_static;
use parking_lot::Mutex;
use rnaflow_data::{ActionRecord, DerivedAction, Job, JobState, OutputItem};
use tokio::runtime::{Builder, Runtime};

use crate::{action_runner::ActionRequest, backend::JobBackend, error::ClientError};

lazy_static! {
    pub static ref RUNTIME: Runtime = Runtime::new().unwrap();
}
static INIT: Once = Once::new();

pub fn setup() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    });
}

/// single threaded runtime on a paused clock; sleeps resolve as soon as
/// every task is idle, so interval arithmetic is exact
pub fn paused_runtime() -> Runtime {
    Builder::new_current_thread()
        .enable_all()
        .start_paused(true)
        .build()
        .unwrap()
}

pub fn job(state: JobState, outputs: &[&str]) -> Job {
    let mut job = Job::new("J1", state);
    job.outputs = outputs
        .iter()
        .map(|name| OutputItem {
            name: name.to_string(),
            url: format!("/api/jobs/J1/outputs/{}", name),
            size_bytes: 1024,
        })
        .collect();
    job
}

pub fn with_action(mut job: Job, action: DerivedAction, record: ActionRecord) -> Job {
    job.extra
        .get_or_insert_with(Default::default)
        .insert(action.key().to_string(), serde_json::to_value(record).unwrap());
    job
}

#[derive(Clone, Debug)]
pub enum Step {
    Snapshot(Job),
    Fault,
}

/// Replays a script of snapshots and faults, one step per fetch.
/// The last step repeats once the script is used up.
pub struct ScriptedBackend {
    steps: Mutex<VecDeque<Step>>,
    last: Mutex<Option<Step>>,
    latency: Mutex<Option<Duration>>,
    fetches: AtomicUsize,
    rejection: Mutex<Option<(u16, String)>>,
    requests: Mutex<Vec<(String, ActionRequest)>>,
    outputs: Mutex<HashMap<String, Vec<u8>>>,
    log: Mutex<Option<String>>,
}

impl ScriptedBackend {
    pub fn new(steps: Vec<Step>) -> Arc<Self> {
        Arc::new(Self {
            steps: Mutex::new(steps.into()),
            last: Mutex::new(None),
            latency: Mutex::new(None),
            fetches: AtomicUsize::new(0),
            rejection: Mutex::new(None),
            requests: Mutex::new(Vec::new()),
            outputs: Mutex::new(HashMap::new()),
            log: Mutex::new(None),
        })
    }

    /// appends to the script
    pub fn push(&self, step: Step) {
        self.steps.lock().push_back(step);
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = Some(latency);
    }

    /// answer every action request with this status
    pub fn reject_actions(&self, status: u16, message: &str) {
        *self.rejection.lock() = Some((status, message.to_string()));
    }

    pub fn put_output(&self, name: &str, bytes: &[u8]) {
        self.outputs.lock().insert(name.to_string(), bytes.to_vec());
    }

    pub fn put_log(&self, text: &str) {
        *self.log.lock() = Some(text.to_string());
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<(String, ActionRequest)> {
        self.requests.lock().clone()
    }

    fn next_step(&self) -> Option<Step> {
        let next = self.steps.lock().pop_front();
        let mut last = self.last.lock();
        if let Some(step) = next {
            *last = Some(step);
        }
        last.clone()
    }
}

#[async_trait]
impl JobBackend for ScriptedBackend {
    async fn fetch_job(&self, job_id: &str) -> Result<Job, ClientError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if job_id.trim().is_empty() {
            return Err(ClientError::EmptyJobId);
        }
        let step = self.next_step();
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        match step {
            Some(Step::Snapshot(mut job)) => {
                job.job_id = job_id.to_string();
                Ok(job)
            }
            Some(Step::Fault) => Err(ClientError::Http {
                status: 503,
                message: "scripted fault".to_string(),
            }),
            None => Err(ClientError::Http {
                status: 404,
                message: "Job not found".to_string(),
            }),
        }
    }

    async fn request_action(
        &self,
        job_id: &str,
        request: &ActionRequest,
    ) -> Result<(), ClientError> {
        self.requests
            .lock()
            .push((job_id.to_string(), request.clone()));
        let rejection = self.rejection.lock().clone();
        match rejection {
            Some((409, message)) => Err(ClientError::ActionBusy {
                job_id: job_id.to_string(),
                action: request.action(),
                message,
            }),
            Some((status, message)) => Err(ClientError::Http { status, message }),
            None => Ok(()),
        }
    }

    async fn fetch_output(&self, _job_id: &str, name: &str) -> Result<Vec<u8>, ClientError> {
        self.outputs
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| ClientError::Http {
                status: 404,
                message: format!("Output not found: {}", name),
            })
    }

    async fn fetch_log(&self, _job_id: &str) -> Result<String, ClientError> {
        self.log.lock().clone().ok_or_else(|| ClientError::Http {
            status: 404,
            message: "log not found".to_string(),
        })
    }

    /// the listed outputs in order, one `name:bytes` entry per line
    async fn fetch_bundle(&self, _job_id: &str) -> Result<Vec<u8>, ClientError> {
        let outputs = self.outputs.lock();
        if outputs.is_empty() {
            return Err(ClientError::Http {
                status: 404,
                message: "output not found".to_string(),
            });
        }
        let mut names: Vec<&String> = outputs.keys().collect();
        names.sort();
        let mut bundle = Vec::new();
        for name in names {
            bundle.extend_from_slice(name.as_bytes());
            bundle.push(b':');
            bundle.extend_from_slice(&outputs[name]);
            bundle.push(b'\n');
        }
        Ok(bundle)
    }
}
