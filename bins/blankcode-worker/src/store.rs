/// Worker Collaborators - Queue, Stores and Grader
///
/// **Responsibility:**
/// The worker loop only talks to these traits. Handles are built once at
/// startup and passed down; tests substitute in-memory fakes.
///
/// **Redis backend:**
/// One multiplexed `ConnectionManager` for ordinary commands and a second,
/// dedicated one for the blocking reserve (BLMOVE would otherwise stall
/// every other command pipelined on the shared connection).

use anyhow::{Context, Result};
use async_trait::async_trait;
use blankcode_common::redis::{self as store, ReservedJob};
use blankcode_common::types::{ExecutionResult, Exercise, Submission};
use blankcode_engine::Coordinator;
use redis::aio::ConnectionManager;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Wait up to `wait` for the next job and take its processing lock.
    async fn reserve(&self, wait: Duration) -> Result<Option<ReservedJob>>;
    async fn heartbeat(&self, job: &ReservedJob) -> Result<()>;
    async fn ack(&self, job: &ReservedJob) -> Result<()>;
    async fn retry(&self, job: &ReservedJob, delay: Duration) -> Result<()>;
    async fn dead_letter(&self, job: &ReservedJob) -> Result<()>;
    /// Return jobs whose worker stopped renewing the lock to the queue.
    async fn requeue_stalled(&self) -> Result<usize>;
}

#[async_trait]
pub trait SubmissionStore: Send + Sync {
    async fn get(&self, id: &Uuid) -> Result<Option<Submission>>;
    async fn mark_running(&self, id: &Uuid) -> Result<()>;
    async fn record_result(&self, id: &Uuid, result: &ExecutionResult) -> Result<()>;
    async fn mark_error(&self, id: &Uuid, message: &str) -> Result<()>;
    /// Move submissions `running` for longer than `older_than` to `error`.
    async fn recover_stale(&self, older_than: Duration, message: &str) -> Result<Vec<Uuid>>;
}

#[async_trait]
pub trait ExerciseStore: Send + Sync {
    async fn get_exercise(&self, id: &Uuid) -> Result<Option<Exercise>>;
}

#[async_trait]
pub trait ProgressTracker: Send + Sync {
    async fn mark_completed(&self, user_id: &Uuid, exercise_id: &Uuid, submission_id: &Uuid) -> Result<()>;
    async fn increment_attempts(&self, user_id: &Uuid, exercise_id: &Uuid) -> Result<()>;
}

#[async_trait]
pub trait Grader: Send + Sync {
    async fn grade(
        &self,
        submission_id: Uuid,
        exercise_id: Uuid,
        code: &str,
        test_code: &str,
        language: &str,
    ) -> ExecutionResult;
}

#[async_trait]
impl Grader for Coordinator {
    async fn grade(
        &self,
        submission_id: Uuid,
        exercise_id: Uuid,
        code: &str,
        test_code: &str,
        language: &str,
    ) -> ExecutionResult {
        self.execute(submission_id, exercise_id, code, test_code, language)
            .await
    }
}

pub struct RedisBackend {
    conn: ConnectionManager,
    blocking: Mutex<ConnectionManager>,
    lock_ms: u64,
}

impl RedisBackend {
    pub async fn connect(redis_url: &str, lock_ms: u64) -> Result<Self> {
        let client = redis::Client::open(redis_url).context("Invalid Redis URL")?;
        let conn = ConnectionManager::new(client.clone())
            .await
            .context("Failed to connect to Redis")?;
        let blocking = ConnectionManager::new(client)
            .await
            .context("Failed to open blocking Redis connection")?;
        Ok(Self {
            conn,
            blocking: Mutex::new(blocking),
            lock_ms,
        })
    }

    fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }
}

#[async_trait]
impl JobQueue for RedisBackend {
    async fn reserve(&self, wait: Duration) -> Result<Option<ReservedJob>> {
        let mut conn = self.blocking.lock().await;
        let reserved = store::reserve_job(&mut conn, wait.as_secs_f64(), self.lock_ms).await?;
        Ok(reserved)
    }

    async fn heartbeat(&self, job: &ReservedJob) -> Result<()> {
        store::extend_lock(&mut self.conn(), job, self.lock_ms).await?;
        Ok(())
    }

    async fn ack(&self, job: &ReservedJob) -> Result<()> {
        store::ack_job(&mut self.conn(), job).await?;
        Ok(())
    }

    async fn retry(&self, job: &ReservedJob, delay: Duration) -> Result<()> {
        store::retry_job(&mut self.conn(), job, delay.as_millis() as u64).await?;
        Ok(())
    }

    async fn dead_letter(&self, job: &ReservedJob) -> Result<()> {
        store::dead_letter_job(&mut self.conn(), job).await?;
        Ok(())
    }

    async fn requeue_stalled(&self) -> Result<usize> {
        Ok(store::requeue_stalled(&mut self.conn()).await?)
    }
}

#[async_trait]
impl SubmissionStore for RedisBackend {
    async fn get(&self, id: &Uuid) -> Result<Option<Submission>> {
        Ok(store::get_submission(&mut self.conn(), id).await?)
    }

    async fn mark_running(&self, id: &Uuid) -> Result<()> {
        store::set_submission_running(&mut self.conn(), id)
            .await
            .context("Failed to mark submission running")
    }

    async fn record_result(&self, id: &Uuid, result: &ExecutionResult) -> Result<()> {
        store::store_submission_result(&mut self.conn(), id, result)
            .await
            .context("Failed to store submission result")
    }

    async fn mark_error(&self, id: &Uuid, message: &str) -> Result<()> {
        store::set_submission_error(&mut self.conn(), id, message)
            .await
            .context("Failed to mark submission as error")
    }

    async fn recover_stale(&self, older_than: Duration, message: &str) -> Result<Vec<Uuid>> {
        Ok(store::recover_stale_submissions(
            &mut self.conn(),
            older_than.as_millis() as u64,
            message,
        )
        .await?)
    }
}

#[async_trait]
impl ExerciseStore for RedisBackend {
    async fn get_exercise(&self, id: &Uuid) -> Result<Option<Exercise>> {
        Ok(store::get_exercise(&mut self.conn(), id).await?)
    }
}

#[async_trait]
impl ProgressTracker for RedisBackend {
    async fn mark_completed(&self, user_id: &Uuid, exercise_id: &Uuid, submission_id: &Uuid) -> Result<()> {
        store::mark_completed(&mut self.conn(), user_id, exercise_id, submission_id)
            .await
            .context("Failed to mark exercise completed")
    }

    async fn increment_attempts(&self, user_id: &Uuid, exercise_id: &Uuid) -> Result<()> {
        store::increment_attempts(&mut self.conn(), user_id, exercise_id)
            .await
            .context("Failed to increment attempts")
    }
}
