use crate::types::{ApprovalId, ApprovalRequest, ApprovalStatus, JobId};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use redb::{Database, DatabaseError, ReadableTable, TableDefinition};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};

const APPROVAL_REQUESTS_TABLE: TableDefinition<&str, &[u8]> =
    TableDefinition::new("approval_requests");

/// Query over stored approval requests. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct ApprovalFilter {
    pub status: Option<ApprovalStatus>,
    pub workflow_id: Option<String>,
    pub execution_id: Option<String>,
    pub job_id: Option<JobId>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
}

impl ApprovalFilter {
    pub fn pending() -> Self {
        Self {
            status: Some(ApprovalStatus::Pending),
            ..Default::default()
        }
    }

    pub fn matches(&self, request: &ApprovalRequest) -> bool {
        self.status.map_or(true, |s| request.status == s)
            && self
                .workflow_id
                .as_ref()
                .map_or(true, |w| &request.workflow_id == w)
            && self
                .execution_id
                .as_ref()
                .map_or(true, |e| &request.execution_id == e)
            && self.job_id.as_ref().map_or(true, |j| &request.job_id == j)
            && self.created_after.map_or(true, |t| request.created_at >= t)
            && self.created_before.map_or(true, |t| request.created_at < t)
    }
}

/// Storage contract for approval requests
#[async_trait::async_trait]
pub trait ApprovalRepository: Send + Sync {
    /// Store a new request; fails if the id is taken
    async fn insert(&self, request: &ApprovalRequest) -> Result<()>;

    /// Overwrite an existing request; fails if it does not exist
    async fn update(&self, request: &ApprovalRequest) -> Result<()>;

    async fn get(&self, id: &ApprovalId) -> Result<Option<ApprovalRequest>>;

    /// Matching requests, oldest first
    async fn list(&self, filter: &ApprovalFilter) -> Result<Vec<ApprovalRequest>>;
}

fn sort_by_creation(requests: &mut [ApprovalRequest]) {
    requests.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.0.cmp(&b.id.0)));
}

#[derive(Default)]
pub struct InMemoryApprovalRepository {
    requests: RwLock<HashMap<ApprovalId, ApprovalRequest>>,
}

impl InMemoryApprovalRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl ApprovalRepository for InMemoryApprovalRepository {
    async fn insert(&self, request: &ApprovalRequest) -> Result<()> {
        let mut requests = self.requests.write().await;
        if requests.contains_key(&request.id) {
            anyhow::bail!("Approval request {} already exists", request.id);
        }
        requests.insert(request.id.clone(), request.clone());
        Ok(())
    }

    async fn update(&self, request: &ApprovalRequest) -> Result<()> {
        let mut requests = self.requests.write().await;
        let stored = requests
            .get_mut(&request.id)
            .with_context(|| format!("Approval request {} not found", request.id))?;
        *stored = request.clone();
        Ok(())
    }

    async fn get(&self, id: &ApprovalId) -> Result<Option<ApprovalRequest>> {
        Ok(self.requests.read().await.get(id).cloned())
    }

    async fn list(&self, filter: &ApprovalFilter) -> Result<Vec<ApprovalRequest>> {
        let mut matching: Vec<ApprovalRequest> = self
            .requests
            .read()
            .await
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        sort_by_creation(&mut matching);
        Ok(matching)
    }
}

/// Attempts to open a database file that another handle holds
const LOCK_RETRY_ATTEMPTS: u32 = 100;
const LOCK_RETRY_DELAY: Duration = Duration::from_millis(25);

/// Approval requests persisted in a redb file, one JSON document per request.
///
/// The file is opened for each operation and closed again, so a separate
/// process (for example `kiln approvals approve` next to a running
/// `kiln run`) can share it. Opens that hit the file lock are retried.
#[derive(Clone)]
pub struct RedbApprovalRepository {
    path: PathBuf,
    access: Arc<Mutex<()>>,
}

impl RedbApprovalRepository {
    pub fn new(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create approval store directory")?;
        }

        let db = Database::create(&path).context("Failed to create redb database")?;

        let write_txn = db.begin_write().context("Failed to begin write transaction")?;
        {
            let _requests_table = write_txn
                .open_table(APPROVAL_REQUESTS_TABLE)
                .context("Failed to open approval requests table")?;
        }
        write_txn.commit().context("Failed to commit transaction")?;

        Ok(Self {
            path,
            access: Arc::new(Mutex::new(())),
        })
    }

    /// Open the database file, waiting while another handle holds its lock
    async fn open(&self) -> Result<Database> {
        let mut attempt = 1;
        loop {
            match Database::create(&self.path) {
                Ok(db) => return Ok(db),
                Err(DatabaseError::DatabaseAlreadyOpen) if attempt < LOCK_RETRY_ATTEMPTS => {
                    tracing::debug!(
                        "Approval store {} is locked, retrying (attempt {})",
                        self.path.display(),
                        attempt
                    );
                    attempt += 1;
                    tokio::time::sleep(LOCK_RETRY_DELAY).await;
                }
                Err(e) => {
                    return Err(e).with_context(|| {
                        format!("Failed to open approval store {}", self.path.display())
                    })
                }
            }
        }
    }

    fn read(db: &Database, id: &ApprovalId) -> Result<Option<ApprovalRequest>> {
        let read_txn = db.begin_read().context("Failed to begin read")?;
        let table = read_txn
            .open_table(APPROVAL_REQUESTS_TABLE)
            .context("Failed to open table")?;

        match table.get(id.0.as_str()).context("Failed to get approval request")? {
            Some(guard) => {
                let request: ApprovalRequest = serde_json::from_slice(guard.value())
                    .context("Failed to deserialize approval request")?;
                Ok(Some(request))
            }
            None => Ok(None),
        }
    }

    /// Write a request; `must_exist` selects update over insert semantics
    fn write(db: &Database, request: &ApprovalRequest, must_exist: bool) -> Result<()> {
        let write_txn = db.begin_write().context("Failed to begin write")?;
        {
            let mut table = write_txn
                .open_table(APPROVAL_REQUESTS_TABLE)
                .context("Failed to open table")?;

            let key = request.id.0.as_str();
            let exists = table
                .get(key)
                .context("Failed to get approval request")?
                .is_some();
            if exists != must_exist {
                if must_exist {
                    anyhow::bail!("Approval request {} not found", request.id);
                }
                anyhow::bail!("Approval request {} already exists", request.id);
            }

            let value = serde_json::to_vec(request).context("Failed to serialize approval request")?;
            table
                .insert(key, value.as_slice())
                .context("Failed to insert approval request")?;
        }
        write_txn.commit().context("Failed to commit")?;
        Ok(())
    }

    fn scan(db: &Database, filter: &ApprovalFilter) -> Result<Vec<ApprovalRequest>> {
        let read_txn = db.begin_read().context("Failed to begin read")?;
        let table = read_txn
            .open_table(APPROVAL_REQUESTS_TABLE)
            .context("Failed to open table")?;

        let mut requests = Vec::new();
        for item in table.iter().context("Failed to iterate approval requests")? {
            let (_key, value) = item.context("Failed to read item")?;
            let request: ApprovalRequest = serde_json::from_slice(value.value())
                .context("Failed to deserialize approval request")?;
            if filter.matches(&request) {
                requests.push(request);
            }
        }

        sort_by_creation(&mut requests);
        Ok(requests)
    }
}

#[async_trait::async_trait]
impl ApprovalRepository for RedbApprovalRepository {
    async fn insert(&self, request: &ApprovalRequest) -> Result<()> {
        let _access = self.access.lock().await;
        let db = self.open().await?;
        Self::write(&db, request, false)
    }

    async fn update(&self, request: &ApprovalRequest) -> Result<()> {
        let _access = self.access.lock().await;
        let db = self.open().await?;
        Self::write(&db, request, true)
    }

    async fn get(&self, id: &ApprovalId) -> Result<Option<ApprovalRequest>> {
        let _access = self.access.lock().await;
        let db = self.open().await?;
        Self::read(&db, id)
    }

    async fn list(&self, filter: &ApprovalFilter) -> Result<Vec<ApprovalRequest>> {
        let _access = self.access.lock().await;
        let db = self.open().await?;
        Self::scan(&db, filter)
    }
}
