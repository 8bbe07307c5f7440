use async_trait::async_trait;
use redis::{aio::MultiplexedConnection, Client};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::crawler::task::{CrawlState, ErrorRecord, JobId};
use crate::storage::{CheckpointStore, StoreError};

/// Key layout under a shared prefix
#[derive(Debug, Clone)]
struct Keys {
    prefix: String,
}

impl Keys {
    fn checkpoint(&self, job_id: &JobId) -> String {
        format!("{}:checkpoint:{}", self.prefix, job_id)
    }

    fn jobs(&self) -> String {
        format!("{}:jobs", self.prefix)
    }

    fn errors(&self) -> String {
        format!("{}:errors", self.prefix)
    }
}

/// Redis-backed checkpoint store shared by several engine processes
pub struct RedisCheckpointStore {
    keys: Keys,

    /// Connection pool
    conn_pool: Arc<Mutex<MultiplexedConnection>>,
}

impl RedisCheckpointStore {
    pub async fn connect(redis_url: &str, key_prefix: &str) -> Result<Self, StoreError> {
        let client = Client::open(redis_url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        info!("Connected checkpoint store to Redis at {}", redis_url);

        Ok(Self {
            keys: Keys {
                prefix: key_prefix.to_string(),
            },
            conn_pool: Arc::new(Mutex::new(conn)),
        })
    }
}

#[async_trait]
impl CheckpointStore for RedisCheckpointStore {
    async fn save(&self, state: &CrawlState) -> Result<(), StoreError> {
        let state_json = serde_json::to_string(state)?;
        let mut conn = self.conn_pool.lock().await;

        // SET replaces the snapshot in one step, readers see old or new
        redis::pipe()
            .atomic()
            .cmd("SET")
            .arg(self.keys.checkpoint(state.job_id()))
            .arg(&state_json)
            .ignore()
            .cmd("SADD")
            .arg(self.keys.jobs())
            .arg(state.job_id().as_str())
            .ignore()
            .query_async::<_, ()>(&mut *conn)
            .await?;

        debug!("Saved checkpoint for job {} to Redis", state.job_id());
        Ok(())
    }

    async fn load(&self, job_id: &JobId) -> Result<Option<CrawlState>, StoreError> {
        let mut conn = self.conn_pool.lock().await;
        let state_json: Option<String> = redis::cmd("GET")
            .arg(self.keys.checkpoint(job_id))
            .query_async(&mut *conn)
            .await?;

        match state_json {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn append_error(&self, record: &ErrorRecord) -> Result<(), StoreError> {
        let record_json = serde_json::to_string(record)?;
        let mut conn = self.conn_pool.lock().await;

        redis::cmd("RPUSH")
            .arg(self.keys.errors())
            .arg(&record_json)
            .query_async::<_, ()>(&mut *conn)
            .await?;
        Ok(())
    }

    async fn errors(&self, job_id: Option<&JobId>) -> Result<Vec<ErrorRecord>, StoreError> {
        let mut conn = self.conn_pool.lock().await;
        let lines: Vec<String> = redis::cmd("LRANGE")
            .arg(self.keys.errors())
            .arg(0)
            .arg(-1)
            .query_async(&mut *conn)
            .await?;

        let mut records = Vec::new();
        for line in lines {
            match serde_json::from_str::<ErrorRecord>(&line) {
                Ok(record) if job_id.map_or(true, |id| &record.job_id == id) => records.push(record),
                Ok(_) => {}
                Err(e) => warn!("Skipping malformed error record: {}", e),
            }
        }
        Ok(records)
    }

    async fn list(&self) -> Result<Vec<JobId>, StoreError> {
        let mut conn = self.conn_pool.lock().await;
        let members: Vec<String> = redis::cmd("SMEMBERS")
            .arg(self.keys.jobs())
            .query_async(&mut *conn)
            .await?;

        let mut ids: Vec<JobId> = members.into_iter().map(JobId::from).collect();
        ids.sort();
        Ok(ids)
    }
}
