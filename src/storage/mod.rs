use std::time::Duration;
use thiserror::Error;

use crate::models::{Job, JobStatus};

/// Records expire out of the store 24 hours after creation.
const JOB_TTL_SECS: i64 = 24 * 60 * 60;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

const JOB_KEY_PREFIX: &str = "crawler:jobs:";
const JOB_INDEX_KEY: &str = "crawler:jobs:index";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Store connection failed: {0}")]
    Connect(String),
    #[error("Store operation failed: {0}")]
    Operation(String),
    #[error("Job record is not decodable: {0}")]
    Decode(String),
}

/// Durable mirror of job records in the document store.
///
/// One record per job keyed by id with a 24 h TTL, plus a `created_at`-scored
/// index for listing. The in-memory registry stays authoritative; every
/// operation here is best-effort from the caller's point of view.
#[derive(Clone)]
pub struct DocStore {
    conn: redis::aio::MultiplexedConnection,
}

impl DocStore {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url).map_err(|e| StoreError::Connect(e.to_string()))?;
        let conn = tokio::time::timeout(CONNECT_TIMEOUT, client.get_multiplexed_async_connection())
            .await
            .map_err(|_| StoreError::Connect("connect timeout".to_string()))?
            .map_err(|e| StoreError::Connect(e.to_string()))?;
        Ok(DocStore { conn })
    }

    /// Write or overwrite a job record and refresh the index.
    pub async fn put_job(&self, job: &Job) -> Result<(), StoreError> {
        let payload = serde_json::to_string(job).map_err(|e| StoreError::Decode(e.to_string()))?;
        let key = format!("{JOB_KEY_PREFIX}{}", job.id);
        let created = job.created_at.timestamp();
        let mut conn = self.conn.clone();

        redis::cmd("SET")
            .arg(&key)
            .arg(&payload)
            .arg("EX")
            .arg(JOB_TTL_SECS)
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| StoreError::Operation(e.to_string()))?;

        redis::cmd("ZADD")
            .arg(JOB_INDEX_KEY)
            .arg(created)
            .arg(&job.id)
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| StoreError::Operation(e.to_string()))?;

        // Mirror the record TTL onto the index.
        let horizon = chrono::Utc::now().timestamp() - JOB_TTL_SECS;
        redis::cmd("ZREMRANGEBYSCORE")
            .arg(JOB_INDEX_KEY)
            .arg("-inf")
            .arg(horizon)
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| StoreError::Operation(e.to_string()))?;

        Ok(())
    }

    pub async fn get_job(&self, id: &str) -> Result<Option<Job>, StoreError> {
        let key = format!("{JOB_KEY_PREFIX}{id}");
        let mut conn = self.conn.clone();
        let payload: Option<String> = redis::cmd("GET")
            .arg(&key)
            .query_async(&mut conn)
            .await
            .map_err(|e| StoreError::Operation(e.to_string()))?;

        match payload {
            Some(p) => serde_json::from_str(&p)
                .map(Some)
                .map_err(|e| StoreError::Decode(e.to_string())),
            None => Ok(None),
        }
    }

    /// Jobs sorted by `created_at` descending, optionally filtered by status.
    pub async fn list_jobs(
        &self,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<Job>, StoreError> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = redis::cmd("ZREVRANGE")
            .arg(JOB_INDEX_KEY)
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await
            .map_err(|e| StoreError::Operation(e.to_string()))?;

        let mut jobs = Vec::new();
        for id in ids {
            if jobs.len() >= limit {
                break;
            }
            // Expired records fall out of the index lazily; skip misses.
            match self.get_job(&id).await? {
                Some(job) => {
                    if status.map(|s| job.status == s).unwrap_or(true) {
                        jobs.push(job);
                    }
                }
                None => continue,
            }
        }
        Ok(jobs)
    }

    /// All stored jobs still marked running (crash-recovery scan).
    pub async fn running_jobs(&self) -> Result<Vec<Job>, StoreError> {
        self.list_jobs(Some(JobStatus::Running), usize::MAX).await
    }

    pub async fn ping(&self) -> bool {
        let mut conn = self.conn.clone();
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .is_ok()
    }
}
