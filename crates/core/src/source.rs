//! Log source boundary
//!
//! The engine consumes session logs exclusively through [`LogSource`]; the
//! host supplies the implementation (directory scanning, log parsing, and
//! format details live outside this workspace).

use crate::Result;
use crate::session::SessionData;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::path::PathBuf;

/// Source of projects, sessions, and session content
#[async_trait]
pub trait LogSource: Send + Sync {
    /// List all known project names
    async fn list_projects(&self) -> Result<Vec<String>>;

    /// List the session ids of a project
    async fn list_sessions(&self, project: &str) -> Result<Vec<String>>;

    /// Path of a session's log file, whether or not it currently exists
    fn session_path(&self, project: &str, session_id: &str) -> PathBuf;

    /// Candidate log paths for a subagent, in probe order
    ///
    /// Subagent logs moved locations across log-format revisions; the hasher
    /// probes these in order and uses the first that exists.
    fn subagent_candidates(
        &self,
        project: &str,
        session_id: &str,
        agent_id: &str,
    ) -> Vec<PathBuf>;

    /// Load a session's raw lines and parsed entries
    async fn load_session(&self, project: &str, session_id: &str) -> Result<SessionData>;
}

/// In-memory log source for tests and embedding
///
/// Holds sessions as `(project, session_id) -> SessionData` and reports
/// session paths under a synthetic root so hashing has something to stat
/// only when the host writes real files there. Sessions can be added and
/// removed through a shared handle.
#[derive(Debug, Default)]
pub struct StaticLogSource {
    root: PathBuf,
    sessions: RwLock<Vec<(String, String, SessionData)>>,
}

impl StaticLogSource {
    /// Create a static source rooted at `root`
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            sessions: RwLock::new(Vec::new()),
        }
    }

    /// Add or replace a session's content
    pub fn add_session(
        &self,
        project: impl Into<String>,
        session_id: impl Into<String>,
        data: SessionData,
    ) {
        let project = project.into();
        let session_id = session_id.into();
        let mut sessions = self.sessions.write();
        sessions.retain(|(p, s, _)| !(*p == project && *s == session_id));
        sessions.push((project, session_id, data));
    }

    /// Remove a session, mimicking deletion from disk
    pub fn remove_session(&self, project: &str, session_id: &str) {
        self.sessions
            .write()
            .retain(|(p, s, _)| !(p == project && s == session_id));
    }
}

#[async_trait]
impl LogSource for StaticLogSource {
    async fn list_projects(&self) -> Result<Vec<String>> {
        let mut projects: Vec<String> = self
            .sessions
            .read()
            .iter()
            .map(|(p, _, _)| p.clone())
            .collect();
        projects.sort();
        projects.dedup();
        Ok(projects)
    }

    async fn list_sessions(&self, project: &str) -> Result<Vec<String>> {
        let mut sessions: Vec<String> = self
            .sessions
            .read()
            .iter()
            .filter(|(p, _, _)| p == project)
            .map(|(_, s, _)| s.clone())
            .collect();
        sessions.sort();
        Ok(sessions)
    }

    fn session_path(&self, project: &str, session_id: &str) -> PathBuf {
        self.root.join(project).join(format!("{session_id}.jsonl"))
    }

    fn subagent_candidates(
        &self,
        project: &str,
        session_id: &str,
        agent_id: &str,
    ) -> Vec<PathBuf> {
        vec![
            self.root
                .join(project)
                .join(session_id)
                .join("subagents")
                .join(format!("{agent_id}.jsonl")),
            self.root
                .join(project)
                .join(format!("{session_id}-{agent_id}.jsonl")),
        ]
    }

    async fn load_session(&self, project: &str, session_id: &str) -> Result<SessionData> {
        self.sessions
            .read()
            .iter()
            .find(|(p, s, _)| p == project && s == session_id)
            .map(|(_, _, data)| data.clone())
            .ok_or_else(|| {
                crate::Error::configuration(format!(
                    "Unknown session '{session_id}' in project '{project}'"
                ))
            })
    }
}
