//! The session table: one analysis container per session.
//!
//! All table mutations happen under a single lock and are followed by a full
//! snapshot rewrite. Container runtime calls are made with the lock released;
//! a port is reserved under the lock before launching so concurrent creates
//! never race for the same port.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::SessionError;
use crate::retention;
use crate::sandbox::{ContainerRuntime, LaunchSpec, PortAllocator, SandboxConfig, SandboxError};
use crate::session::model::{Owner, Session, SessionPaths, SessionStatus};
use crate::snapshot::JsonSnapshot;

/// Point-in-time view of a session for status endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    pub session_id: String,
    pub container_id: String,
    pub container_ip: Option<String>,
    pub container_port: u16,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub uptime_secs: i64,
}

impl From<&Session> for SessionReport {
    fn from(session: &Session) -> Self {
        Self {
            session_id: session.session_id.clone(),
            container_id: session.container_id.clone(),
            container_ip: session.container_ip.clone(),
            container_port: session.container_port,
            status: session.status,
            created_at: session.created_at,
            uptime_secs: session.uptime_secs(),
        }
    }
}

#[derive(Debug, Default)]
struct SessionTable {
    sessions: BTreeMap<String, Session>,
    /// Ports handed out to creates that have not committed yet.
    reserved_ports: HashSet<u16>,
    /// Donors whose input is being copied by an in-flight create.
    claimed_donors: HashSet<String>,
}

impl SessionTable {
    fn claimed_ports(&self) -> HashSet<u16> {
        self.sessions
            .values()
            .filter(|s| s.status != SessionStatus::Cleaned)
            .map(|s| s.container_port)
            .chain(self.reserved_ports.iter().copied())
            .collect()
    }

    /// Unclaimed sessions of the same owner, newest first.
    fn donor_candidates(&self, owner: &Owner) -> Vec<Session> {
        let mut candidates: Vec<Session> = self
            .sessions
            .values()
            .filter(|s| !self.claimed_donors.contains(&s.session_id))
            .filter(|s| s.owner.same_owner(owner))
            .cloned()
            .collect();
        candidates.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        candidates
    }
}

/// Owns the session to container mapping and its on-disk snapshot.
pub struct SessionRegistry {
    config: SandboxConfig,
    paths: SessionPaths,
    runtime: Arc<dyn ContainerRuntime>,
    ports: PortAllocator,
    snapshot: JsonSnapshot,
    state: Mutex<SessionTable>,
}

impl SessionRegistry {
    /// Load the snapshot and reconcile it against the runtime.
    ///
    /// Rows whose container is gone are dropped. Stopped containers get one
    /// start attempt and are dropped if they still are not running.
    pub async fn open(
        config: SandboxConfig,
        paths: SessionPaths,
        snapshot: JsonSnapshot,
        runtime: Arc<dyn ContainerRuntime>,
    ) -> Result<Self, SessionError> {
        let stored: BTreeMap<String, Session> = snapshot.load_or_default().await?;

        let registry = Self {
            ports: PortAllocator::new(config.port_range.clone()),
            config,
            paths,
            runtime,
            snapshot,
            state: Mutex::new(SessionTable::default()),
        };

        let recovered = registry.recover(stored).await;
        {
            let mut table = registry.state.lock().await;
            table.sessions = recovered;
            registry.persist(&table).await;
        }

        Ok(registry)
    }

    async fn recover(&self, stored: BTreeMap<String, Session>) -> BTreeMap<String, Session> {
        let total = stored.len();
        let mut recovered = BTreeMap::new();

        for (session_id, mut session) in stored {
            if session.status == SessionStatus::Cleaned {
                tracing::debug!(session_id = %session_id, "Dropping cleaned session");
                continue;
            }

            match self.revive(&session.container_id).await {
                Ok(true) => {}
                Ok(false) => {
                    tracing::info!(
                        session_id = %session_id,
                        container_id = %session.container_id,
                        "Container would not start, dropping session"
                    );
                    continue;
                }
                Err(e) if e.is_not_found() => {
                    tracing::info!(
                        session_id = %session_id,
                        container_id = %session.container_id,
                        "Container no longer exists, dropping session"
                    );
                    continue;
                }
                Err(e) => {
                    tracing::warn!(
                        session_id = %session_id,
                        "Failed to probe container, dropping session: {}",
                        e
                    );
                    continue;
                }
            }

            match self.runtime.ip_address(&session.container_id).await {
                Ok(Some(ip)) => session.container_ip = Some(ip),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(session_id = %session_id, "Failed to refresh container IP: {}", e);
                }
            }
            session.status = SessionStatus::Active;
            recovered.insert(session_id, session);
        }

        tracing::info!(
            recovered = recovered.len(),
            dropped = total - recovered.len(),
            "Session recovery complete"
        );
        recovered
    }

    /// Running, or started once and running now.
    async fn revive(&self, container_id: &str) -> Result<bool, SandboxError> {
        if self.runtime.status(container_id).await?.is_running() {
            return Ok(true);
        }
        self.runtime.start(container_id).await?;
        Ok(self.runtime.status(container_id).await?.is_running())
    }

    /// Create a session and its container.
    ///
    /// When the owner has an earlier session with input data, those files are
    /// copied into the new session and the earlier session is deleted once the
    /// new container is up.
    pub async fn create_session(&self, owner: Owner) -> Result<(String, String), SessionError> {
        let session_id = Uuid::new_v4().to_string();

        let (port, candidates) = {
            let mut table = self.state.lock().await;
            let port = self.ports.allocate(&table.claimed_ports())?;
            table.reserved_ports.insert(port);
            (port, table.donor_candidates(&owner))
        };
        let donor = self.claim_donor(candidates).await;

        let result = self.provision(&session_id, owner, port, donor.as_ref()).await;

        let mut table = self.state.lock().await;
        table.reserved_ports.remove(&port);
        if let Some(donor) = &donor {
            table.claimed_donors.remove(&donor.session_id);
        }

        let session = match result {
            Ok(session) => session,
            Err(e) => {
                drop(table);
                tracing::error!(session_id = %session_id, port, "Failed to create session: {}", e);
                remove_dir_if_exists(&self.paths.input_dir(&session_id)).await;
                remove_dir_if_exists(&self.paths.output_dir(&session_id)).await;
                return Err(e);
            }
        };

        let container_id = session.container_id.clone();
        if let Some(donor) = &donor {
            table.sessions.remove(&donor.session_id);
        }
        table.sessions.insert(session_id.clone(), session);
        self.persist(&table).await;
        drop(table);

        if let Some(donor) = donor {
            self.retire_donor(&donor).await;
        }

        tracing::info!(
            session_id = %session_id,
            container_id = %container_id,
            port,
            "Created session"
        );
        Ok((session_id, container_id))
    }

    /// Claim the newest candidate whose input dir holds a file.
    ///
    /// Directories are checked without the table lock, so a candidate is
    /// re-checked under the lock before it is claimed.
    async fn claim_donor(&self, candidates: Vec<Session>) -> Option<Session> {
        for candidate in candidates {
            if !dir_holds_files(&candidate.input_dir).await {
                continue;
            }
            let mut table = self.state.lock().await;
            if table.sessions.contains_key(&candidate.session_id)
                && table.claimed_donors.insert(candidate.session_id.clone())
            {
                return Some(candidate);
            }
        }
        None
    }

    async fn provision(
        &self,
        session_id: &str,
        owner: Owner,
        port: u16,
        donor: Option<&Session>,
    ) -> Result<Session, SessionError> {
        let input_dir = self.paths.input_dir(session_id);
        let output_dir = self.paths.output_dir(session_id);
        create_dir(&input_dir).await?;
        create_dir(&output_dir).await?;

        if let Some(donor) = donor {
            let copied = copy_input_files(&donor.input_dir, &input_dir).await?;
            tracing::info!(
                session_id = %session_id,
                donor_session_id = %donor.session_id,
                files = copied,
                "Migrated input data from previous session"
            );
        }

        let spec = LaunchSpec::for_session(&self.config, session_id, &input_dir, &output_dir, port);
        let container_id = self.runtime.launch(&spec).await?;

        let running = self.revive(&container_id).await;
        if !matches!(running, Ok(true)) {
            if let Err(e) = self.runtime.remove(&container_id).await {
                tracing::warn!(container_id = %container_id, "Failed to remove unstarted container: {}", e);
            }
            return Err(match running {
                Err(e) => e.into(),
                _ => SandboxError::ContainerStartFailed {
                    container_id,
                    reason: "container is not running after start".to_string(),
                }
                .into(),
            });
        }

        let container_ip = match self.runtime.ip_address(&container_id).await {
            Ok(ip) => ip,
            Err(e) => {
                tracing::warn!(container_id = %container_id, "Could not read container IP: {}", e);
                None
            }
        };

        Ok(Session {
            session_id: session_id.to_string(),
            container_id,
            container_ip,
            container_port: port,
            created_at: Utc::now(),
            status: SessionStatus::Active,
            input_dir,
            output_dir,
            owner,
        })
    }

    async fn retire_donor(&self, donor: &Session) {
        if donor.status != SessionStatus::Cleaned
            && let Err(e) = self.runtime.remove(&donor.container_id).await
            && !e.is_not_found()
        {
            tracing::warn!(
                session_id = %donor.session_id,
                "Failed to remove previous session container: {}",
                e
            );
        }
        remove_dir_if_exists(&donor.input_dir).await;
        remove_dir_if_exists(&donor.output_dir).await;
        tracing::info!(session_id = %donor.session_id, "Deleted previous session after migration");
    }

    /// The session, only while its container is confirmed running.
    pub async fn get_session_container(&self, session_id: &str) -> Option<Session> {
        let (container_id, needs_ip) = {
            let table = self.state.lock().await;
            let session = table.sessions.get(session_id)?;
            if !session.is_active() {
                return None;
            }
            (session.container_id.clone(), session.container_ip.is_none())
        };

        let probe = self.runtime.status(&container_id).await;
        let ip = match &probe {
            Ok(status) if status.is_running() && needs_ip => {
                self.runtime.ip_address(&container_id).await.ok().flatten()
            }
            _ => None,
        };

        let mut table = self.state.lock().await;
        let session = table.sessions.get_mut(session_id)?;
        if session.container_id != container_id || !session.is_active() {
            return None;
        }

        match probe {
            Ok(status) if status.is_running() => {
                if session.container_ip.is_none()
                    && let Some(ip) = ip
                {
                    session.container_ip = Some(ip);
                    let resolved = session.clone();
                    self.persist(&table).await;
                    return Some(resolved);
                }
                Some(session.clone())
            }
            Ok(status) => {
                tracing::warn!(
                    session_id = %session_id,
                    container_id = %container_id,
                    %status,
                    "Session container is not running"
                );
                session.status = SessionStatus::Inactive;
                self.persist(&table).await;
                None
            }
            Err(e) => {
                tracing::warn!(session_id = %session_id, "Failed to query session container: {}", e);
                session.status = if e.is_not_found() {
                    SessionStatus::Inactive
                } else {
                    SessionStatus::Error
                };
                self.persist(&table).await;
                None
            }
        }
    }

    /// The stored row regardless of container state.
    pub async fn get(&self, session_id: &str) -> Option<Session> {
        self.state.lock().await.sessions.get(session_id).cloned()
    }

    pub async fn list(&self) -> Vec<Session> {
        self.state.lock().await.sessions.values().cloned().collect()
    }

    pub async fn check_ownership(&self, session_id: &str, identity: &str) -> bool {
        self.state
            .lock()
            .await
            .sessions
            .get(session_id)
            .is_some_and(|s| s.owner.matches(identity))
    }

    /// Restart the container in place. `Ok(false)` if the session is not live.
    pub async fn restart_session(&self, session_id: &str) -> Result<bool, SessionError> {
        let Some(session) = self.get_session_container(session_id).await else {
            return Ok(false);
        };

        self.runtime
            .restart(&session.container_id, self.config.stop_timeout)
            .await?;
        tracing::info!(session_id = %session_id, "Restarted session container");
        Ok(true)
    }

    /// Stop and remove the container, mark the row cleaned and delete the
    /// output directory. The input directory is kept.
    pub async fn cleanup_session(&self, session_id: &str) -> Result<bool, SessionError> {
        let session = {
            let table = self.state.lock().await;
            match table.sessions.get(session_id) {
                Some(s) if s.status != SessionStatus::Cleaned => s.clone(),
                _ => return Ok(false),
            }
        };

        let timeout = self.config.stop_timeout;
        tolerate_missing(self.runtime.stop(&session.container_id, timeout).await)?;
        tolerate_missing(self.runtime.remove(&session.container_id).await)?;

        {
            let mut table = self.state.lock().await;
            if let Some(row) = table.sessions.get_mut(session_id) {
                row.status = SessionStatus::Cleaned;
            }
            self.persist(&table).await;
        }

        remove_dir_if_exists(&session.output_dir).await;
        let input_preserved = dir_holds_files(&session.input_dir).await;
        tracing::info!(
            session_id = %session_id,
            input_preserved = input_preserved,
            "Cleaned up session"
        );
        Ok(true)
    }

    /// Clean up every not-yet-cleaned session older than `max_age`.
    pub async fn cleanup_inactive(&self, max_age: Duration) -> usize {
        let Some(cutoff) = retention::cutoff(max_age) else {
            return 0;
        };

        let stale: Vec<String> = {
            let table = self.state.lock().await;
            table
                .sessions
                .values()
                .filter(|s| s.status != SessionStatus::Cleaned && s.created_at < cutoff)
                .map(|s| s.session_id.clone())
                .collect()
        };

        let mut cleaned = 0;
        for session_id in stale {
            match self.cleanup_session(&session_id).await {
                Ok(true) => cleaned += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(session_id = %session_id, "Failed to clean up stale session: {}", e);
                }
            }
        }
        cleaned
    }

    pub async fn session_status(&self, session_id: &str) -> Option<SessionReport> {
        self.state
            .lock()
            .await
            .sessions
            .get(session_id)
            .map(SessionReport::from)
    }

    /// Whether the session's input directory holds at least one file.
    ///
    /// Answers by path, so it also works for ids no longer in the table.
    pub fn has_input_data(&self, session_id: &str) -> bool {
        if Uuid::parse_str(session_id).is_err() {
            return false;
        }
        dir_has_files(&self.paths.input_dir(session_id))
    }

    async fn persist(&self, table: &SessionTable) {
        if let Err(e) = self.snapshot.save(&table.sessions).await {
            tracing::error!("Failed to persist session table: {}", e);
        }
    }
}

fn tolerate_missing(result: Result<(), SandboxError>) -> Result<(), SandboxError> {
    match result {
        Err(e) if e.is_not_found() => Ok(()),
        other => other,
    }
}

fn dir_has_files(dir: &Path) -> bool {
    std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|entry| entry.ok())
                .any(|entry| entry.file_type().is_ok_and(|t| t.is_file()))
        })
        .unwrap_or(false)
}

async fn dir_holds_files(dir: &Path) -> bool {
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return false;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        if entry.file_type().await.is_ok_and(|t| t.is_file()) {
            return true;
        }
    }
    false
}

async fn create_dir(path: &Path) -> Result<(), SessionError> {
    tokio::fs::create_dir_all(path)
        .await
        .map_err(|source| SessionError::Filesystem {
            path: path.to_path_buf(),
            source,
        })
}

fn fs_err(path: &Path) -> impl FnOnce(std::io::Error) -> SessionError + use<> {
    let path = path.to_path_buf();
    move |source| SessionError::Filesystem { path, source }
}

/// Copy the regular files directly under `from` into `to`.
async fn copy_input_files(from: &Path, to: &Path) -> Result<usize, SessionError> {
    let mut entries = match tokio::fs::read_dir(from).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(source) => return Err(fs_err(from)(source)),
    };

    let mut copied = 0;
    while let Some(entry) = entries.next_entry().await.map_err(fs_err(from))? {
        let file_type = entry.file_type().await.map_err(fs_err(&entry.path()))?;
        if !file_type.is_file() {
            continue;
        }
        let target = to.join(entry.file_name());
        tokio::fs::copy(entry.path(), &target)
            .await
            .map_err(fs_err(&target))?;
        copied += 1;
    }
    Ok(copied)
}

async fn remove_dir_if_exists(path: &Path) {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), "Failed to remove directory: {}", e),
    }
}
