//! Durable client session: the active job id, the pathway selection and the
//! workflow position. Every change is written through to disk right away.

use std::{
    fs,
    path::{Path, PathBuf},
};

use rnaflow_data::{PathwaySelection, SessionState, WorkflowStep};
use tracing::{debug, warn};

use crate::error::ClientError;

pub struct SessionStore {
    path: PathBuf,
    state: SessionState,
}

impl SessionStore {
    /// Opens the session at `path`. A missing file starts a fresh session;
    /// an unreadable one is logged and replaced by a fresh session too.
    pub fn open(path: &Path) -> Self {
        let state = match Self::load(path) {
            Ok(state) => state,
            Err(err) => {
                warn!("could not restore session from {}: {}", path.display(), err);
                SessionState::default()
            }
        };
        Self {
            path: path.to_path_buf(),
            state,
        }
    }

    /// reads a session file; a missing file is an empty session
    pub fn load(path: &Path) -> Result<SessionState, ClientError> {
        if !path.exists() {
            return Ok(SessionState::default());
        }
        let buf = fs::read(path)?;
        Ok(serde_json::from_slice(&buf)?)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn job_id(&self) -> Option<&str> {
        self.state.job_id()
    }

    pub fn selected_pathway(&self) -> Option<&PathwaySelection> {
        self.state.selected_pathway.as_ref()
    }

    pub fn workflow_step(&self) -> WorkflowStep {
        self.state.workflow_step
    }

    pub fn set_job_id(&mut self, job_id: &str) -> Result<(), ClientError> {
        self.state.job_id = job_id.trim().to_string();
        self.flush()
    }

    pub fn select_pathway(&mut self, pathway: PathwaySelection) -> Result<(), ClientError> {
        self.state.selected_pathway = Some(pathway);
        self.flush()
    }

    pub fn clear_pathway(&mut self) -> Result<(), ClientError> {
        self.state.selected_pathway = None;
        self.flush()
    }

    pub fn set_workflow_step(&mut self, step: WorkflowStep) -> Result<(), ClientError> {
        self.state.workflow_step = step;
        self.flush()
    }

    pub fn reset(&mut self) -> Result<(), ClientError> {
        self.state = SessionState::default();
        self.flush()
    }

    // temp file + rename, so a crash never leaves half a record behind
    fn flush(&self) -> Result<(), ClientError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_vec_pretty(&self.state)?;
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)?;
        debug!(path = %self.path.display(), "session saved");
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::fs::File;
    use std::io::Write;
    use tempfile::tempdir;

    // testing that a saved session comes back identical
    #[test]
    fn test_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state").join("session.json");
        {
            let mut store = SessionStore::open(&path);
            store.set_job_id(" J1 ").unwrap();
            store
                .select_pathway(PathwaySelection::new("hsa04110", None, &["TP53", "MDM2"]))
                .unwrap();
            store.set_workflow_step(WorkflowStep::ExploringGsea).unwrap();
        }
        let reopened = SessionStore::open(&path);
        let expected = SessionState {
            job_id: "J1".to_string(),
            selected_pathway: Some(PathwaySelection::new("hsa04110", None, &["TP53", "MDM2"])),
            workflow_step: WorkflowStep::ExploringGsea,
        };
        assert_eq!(&expected, reopened.state());
        assert_eq!(expected, SessionStore::load(&path).unwrap());
        assert!(!dir.path().join("state").join("session.json.tmp").exists());
    }

    #[test]
    fn test_corrupt_file_gives_fresh_session() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("session.json");
        let mut file = File::create(&path).unwrap();
        writeln!(file, "{{ not json").unwrap();
        assert!(SessionStore::load(&path).is_err());
        let store = SessionStore::open(&path);
        assert_eq!(&SessionState::default(), store.state());
        assert_eq!(None, store.job_id());
    }

    // testing the camelCase layout written by older clients
    #[test]
    fn test_reads_legacy_keys() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("session.json");
        fs::write(
            &path,
            r#"{"jobId": "J7", "selectedPathway": {"ID": "hsa04115", "core_genes": ["CDKN1A"]}, "workflowStep": 3}"#,
        )
        .unwrap();
        let store = SessionStore::open(&path);
        assert_eq!(Some("J7"), store.job_id());
        assert_eq!("hsa04115", store.selected_pathway().unwrap().id);
        assert_eq!(WorkflowStep::Downstream, store.workflow_step());
    }

    #[test]
    fn test_clear_and_reset() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("session.json");
        let mut store = SessionStore::open(&path);
        store.set_job_id("J1").unwrap();
        store
            .select_pathway(PathwaySelection::new("hsa04110", None, &[]))
            .unwrap();
        store.clear_pathway().unwrap();
        assert_eq!(None, SessionStore::load(&path).unwrap().selected_pathway);
        assert_eq!("J1", SessionStore::load(&path).unwrap().job_id);
        store.reset().unwrap();
        assert_eq!(SessionState::default(), SessionStore::load(&path).unwrap());
    }
}
