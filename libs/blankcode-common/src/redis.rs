use crate::types::{
    ExecutionResult, Exercise, Progress, Submission, SubmissionJob, SubmissionStatus, TestResult,
};
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, RedisResult};
use std::collections::HashMap;
use uuid::Uuid;

/// Redis semantics shared by every producer and consumer of submission jobs.
/// Keys are deterministic so the CLI, the worker and external producers
/// never drift.
///
/// Queue layout (at-least-once):
/// - `QUEUE_KEY`: pending payloads, FIFO
/// - `PROCESSING_KEY`: payloads reserved by a worker
/// - `DELAYED_KEY`: retries, scored by the epoch millis they become due
/// - `DEAD_LETTER_KEY`: payloads that exhausted their attempts
/// - `lock_key(id)`: per-job processing lock with TTL; a processing entry
///   without a live lock is considered stalled

pub const QUEUE_KEY: &str = "blankcode:queue:submissions";
pub const PROCESSING_KEY: &str = "blankcode:queue:submissions:processing";
pub const DELAYED_KEY: &str = "blankcode:queue:submissions:delayed";
pub const DEAD_LETTER_KEY: &str = "blankcode:queue:submissions:dead";
pub const RUNNING_INDEX_KEY: &str = "blankcode:submissions:running";

pub const SUBMISSION_PREFIX: &str = "blankcode:submission";
pub const EXERCISE_PREFIX: &str = "blankcode:exercise";
pub const PROGRESS_PREFIX: &str = "blankcode:progress";
pub const LOCK_PREFIX: &str = "blankcode:lock";

pub fn submission_key(id: &Uuid) -> String {
    format!("{}:{}", SUBMISSION_PREFIX, id)
}

pub fn exercise_key(id: &Uuid) -> String {
    format!("{}:{}", EXERCISE_PREFIX, id)
}

pub fn progress_key(user_id: &Uuid, exercise_id: &Uuid) -> String {
    format!("{}:{}:{}", PROGRESS_PREFIX, user_id, exercise_id)
}

pub fn lock_key(submission_id: &Uuid) -> String {
    format!("{}:{}", LOCK_PREFIX, submission_id)
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn type_error(what: &'static str, detail: String) -> redis::RedisError {
    redis::RedisError::from((redis::ErrorKind::TypeError, what, detail))
}

/// A job moved into the processing list. `payload` is the exact string
/// stored in Redis, needed to remove it again.
#[derive(Debug, Clone)]
pub struct ReservedJob {
    pub job: SubmissionJob,
    pub payload: String,
}

/// Push a job to the pending queue. RPUSH for FIFO semantics.
pub async fn push_job(conn: &mut ConnectionManager, job: &SubmissionJob) -> RedisResult<()> {
    let payload = serde_json::to_string(job)
        .map_err(|e| type_error("serialization error", e.to_string()))?;
    conn.rpush(QUEUE_KEY, payload).await
}

const PROMOTE_DELAYED: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
for _, payload in ipairs(due) do
  redis.call('ZREM', KEYS[1], payload)
  redis.call('RPUSH', KEYS[2], payload)
end
return #due
"#;

/// Move retries whose backoff has elapsed back onto the pending queue.
pub async fn promote_delayed(conn: &mut ConnectionManager) -> RedisResult<usize> {
    redis::Script::new(PROMOTE_DELAYED)
        .key(DELAYED_KEY)
        .key(QUEUE_KEY)
        .arg(now_ms())
        .invoke_async(conn)
        .await
}

/// Reserve the next job, blocking up to `wait_secs`.
///
/// The payload is moved atomically into the processing list and a lock with
/// `lock_ms` TTL is taken. Must run on a connection dedicated to blocking
/// commands: BLMOVE holds the connection for the whole wait.
pub async fn reserve_job(
    conn: &mut ConnectionManager,
    wait_secs: f64,
    lock_ms: u64,
) -> RedisResult<Option<ReservedJob>> {
    promote_delayed(conn).await?;

    let payload: Option<String> = redis::cmd("BLMOVE")
        .arg(QUEUE_KEY)
        .arg(PROCESSING_KEY)
        .arg("LEFT")
        .arg("RIGHT")
        .arg(wait_secs)
        .query_async(conn)
        .await?;

    let Some(payload) = payload else {
        return Ok(None);
    };

    let job: SubmissionJob = match serde_json::from_str(&payload) {
        Ok(job) => job,
        Err(e) => {
            // Undecodable payloads can never succeed; park them.
            let mut pipe = redis::pipe();
            pipe.atomic()
                .cmd("LREM").arg(PROCESSING_KEY).arg(1).arg(&payload).ignore()
                .cmd("RPUSH").arg(DEAD_LETTER_KEY).arg(&payload).ignore();
            let _: () = pipe.query_async(conn).await?;
            return Err(type_error("deserialization error", e.to_string()));
        }
    };

    let _: () = redis::cmd("SET")
        .arg(lock_key(&job.submission_id))
        .arg(now_ms())
        .arg("PX")
        .arg(lock_ms)
        .query_async(conn)
        .await?;

    Ok(Some(ReservedJob { job, payload }))
}

/// Keep the processing lock alive while a long job runs.
pub async fn extend_lock(
    conn: &mut ConnectionManager,
    reserved: &ReservedJob,
    lock_ms: u64,
) -> RedisResult<()> {
    let _: () = redis::cmd("SET")
        .arg(lock_key(&reserved.job.submission_id))
        .arg(now_ms())
        .arg("PX")
        .arg(lock_ms)
        .query_async(conn)
        .await?;
    Ok(())
}

/// Job finished (whatever the verdict): drop it from processing.
pub async fn ack_job(conn: &mut ConnectionManager, reserved: &ReservedJob) -> RedisResult<()> {
    let mut pipe = redis::pipe();
    pipe.atomic()
        .cmd("LREM").arg(PROCESSING_KEY).arg(1).arg(&reserved.payload).ignore()
        .cmd("DEL").arg(lock_key(&reserved.job.submission_id)).ignore();
    pipe.query_async(conn).await
}

/// Schedule another delivery after `delay_ms`, counting the failed attempt.
pub async fn retry_job(
    conn: &mut ConnectionManager,
    reserved: &ReservedJob,
    delay_ms: u64,
) -> RedisResult<()> {
    let mut next = reserved.job.clone();
    next.attempts_made += 1;
    let payload = serde_json::to_string(&next)
        .map_err(|e| type_error("serialization error", e.to_string()))?;

    let mut pipe = redis::pipe();
    pipe.atomic()
        .cmd("LREM").arg(PROCESSING_KEY).arg(1).arg(&reserved.payload).ignore()
        .cmd("ZADD").arg(DELAYED_KEY).arg(now_ms() + delay_ms as i64).arg(payload).ignore()
        .cmd("DEL").arg(lock_key(&reserved.job.submission_id)).ignore();
    pipe.query_async(conn).await
}

pub async fn dead_letter_job(conn: &mut ConnectionManager, reserved: &ReservedJob) -> RedisResult<()> {
    let mut pipe = redis::pipe();
    pipe.atomic()
        .cmd("LREM").arg(PROCESSING_KEY).arg(1).arg(&reserved.payload).ignore()
        .cmd("RPUSH").arg(DEAD_LETTER_KEY).arg(&reserved.payload).ignore()
        .cmd("DEL").arg(lock_key(&reserved.job.submission_id)).ignore();
    pipe.query_async(conn).await
}

const REQUEUE_STALLED: &str = r#"
local entries = redis.call('LRANGE', KEYS[1], 0, -1)
local moved = 0
for _, payload in ipairs(entries) do
  local ok, job = pcall(cjson.decode, payload)
  if ok and job['submissionId'] then
    if redis.call('EXISTS', ARGV[1] .. ':' .. job['submissionId']) == 0 then
      redis.call('LREM', KEYS[1], 1, payload)
      redis.call('RPUSH', KEYS[2], payload)
      moved = moved + 1
    end
  end
end
return moved
"#;

/// Move processing entries whose lock expired (worker died mid-job) back to
/// the pending queue.
pub async fn requeue_stalled(conn: &mut ConnectionManager) -> RedisResult<usize> {
    redis::Script::new(REQUEUE_STALLED)
        .key(PROCESSING_KEY)
        .key(QUEUE_KEY)
        .arg(LOCK_PREFIX)
        .invoke_async(conn)
        .await
}

/// Store a new submission record.
pub async fn create_submission(conn: &mut ConnectionManager, submission: &Submission) -> RedisResult<()> {
    let test_results = serde_json::to_string(&submission.test_results)
        .map_err(|e| type_error("serialization error", e.to_string()))?;
    let mut cmd = redis::cmd("HSET");
    cmd.arg(submission_key(&submission.id))
        .arg("id").arg(submission.id.to_string())
        .arg("user_id").arg(submission.user_id.to_string())
        .arg("exercise_id").arg(submission.exercise_id.to_string())
        .arg("code").arg(&submission.code)
        .arg("status").arg(submission.status.as_str())
        .arg("test_results").arg(test_results)
        .arg("created_at").arg(submission.created_at.to_rfc3339())
        .arg("updated_at").arg(submission.updated_at.to_rfc3339());
    if let Some(ms) = submission.execution_time_ms {
        cmd.arg("execution_time_ms").arg(ms);
    }
    if let Some(message) = &submission.error_message {
        cmd.arg("error_message").arg(message);
    }
    let _: () = cmd.query_async(conn).await?;
    Ok(())
}

pub async fn get_submission(conn: &mut ConnectionManager, id: &Uuid) -> RedisResult<Option<Submission>> {
    let fields: HashMap<String, String> = conn.hgetall(submission_key(id)).await?;
    if fields.is_empty() {
        return Ok(None);
    }
    submission_from_fields(&fields)
        .map(Some)
        .map_err(|e| type_error("corrupt submission record", e))
}

fn field<'a>(fields: &'a HashMap<String, String>, name: &str) -> Result<&'a str, String> {
    fields
        .get(name)
        .map(String::as_str)
        .ok_or_else(|| format!("missing field '{}'", name))
}

fn parse_uuid(fields: &HashMap<String, String>, name: &str) -> Result<Uuid, String> {
    Uuid::parse_str(field(fields, name)?).map_err(|e| format!("{}: {}", name, e))
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| e.to_string())
}

/// Decode a submission hash. Separate from I/O so it can be tested.
pub fn submission_from_fields(fields: &HashMap<String, String>) -> Result<Submission, String> {
    let status = field(fields, "status")?;
    let test_results: Vec<TestResult> = match fields.get("test_results") {
        Some(raw) if !raw.is_empty() => serde_json::from_str(raw).map_err(|e| e.to_string())?,
        _ => Vec::new(),
    };
    Ok(Submission {
        id: parse_uuid(fields, "id")?,
        user_id: parse_uuid(fields, "user_id")?,
        exercise_id: parse_uuid(fields, "exercise_id")?,
        code: fields.get("code").cloned().unwrap_or_default(),
        status: SubmissionStatus::parse(status)
            .ok_or_else(|| format!("unknown status '{}'", status))?,
        test_results,
        execution_time_ms: fields
            .get("execution_time_ms")
            .and_then(|v| v.parse().ok()),
        error_message: fields.get("error_message").cloned(),
        created_at: parse_time(field(fields, "created_at")?)?,
        updated_at: parse_time(field(fields, "updated_at")?)?,
    })
}

/// `pending -> running`, indexed by start time for the stale sweep.
pub async fn set_submission_running(conn: &mut ConnectionManager, id: &Uuid) -> RedisResult<()> {
    let now = Utc::now();
    let mut pipe = redis::pipe();
    pipe.atomic()
        .cmd("HSET").arg(submission_key(id))
            .arg("status").arg(SubmissionStatus::Running.as_str())
            .arg("updated_at").arg(now.to_rfc3339())
            .ignore()
        .cmd("ZADD").arg(RUNNING_INDEX_KEY).arg(now.timestamp_millis()).arg(id.to_string()).ignore();
    pipe.query_async(conn).await
}

/// Persist the final verdict of an attempt.
pub async fn store_submission_result(
    conn: &mut ConnectionManager,
    id: &Uuid,
    result: &ExecutionResult,
) -> RedisResult<()> {
    let key = submission_key(id);
    let test_results = serde_json::to_string(&result.test_results)
        .map_err(|e| type_error("serialization error", e.to_string()))?;
    let status = SubmissionStatus::from(result.status);

    let mut pipe = redis::pipe();
    pipe.atomic()
        .cmd("HSET").arg(&key)
            .arg("status").arg(status.as_str())
            .arg("test_results").arg(test_results)
            .arg("execution_time_ms").arg(result.execution_time_ms)
            .arg("updated_at").arg(Utc::now().to_rfc3339())
            .ignore();
    match &result.error_message {
        Some(message) => {
            pipe.cmd("HSET").arg(&key).arg("error_message").arg(message).ignore();
        }
        None => {
            pipe.cmd("HDEL").arg(&key).arg("error_message").ignore();
        }
    }
    pipe.cmd("ZREM").arg(RUNNING_INDEX_KEY).arg(id.to_string()).ignore();
    pipe.query_async(conn).await
}

/// Force a submission into `error` with an explanation.
pub async fn set_submission_error(
    conn: &mut ConnectionManager,
    id: &Uuid,
    message: &str,
) -> RedisResult<()> {
    let mut pipe = redis::pipe();
    pipe.atomic()
        .cmd("HSET").arg(submission_key(id))
            .arg("status").arg(SubmissionStatus::Error.as_str())
            .arg("test_results").arg("[]")
            .arg("error_message").arg(message)
            .arg("updated_at").arg(Utc::now().to_rfc3339())
            .ignore()
        .cmd("ZREM").arg(RUNNING_INDEX_KEY).arg(id.to_string()).ignore();
    pipe.query_async(conn).await
}

const RESET_FOR_RETRY: &str = r#"
local status = redis.call('HGET', KEYS[1], 'status')
if not status then
  return false
end
if status == 'failed' or status == 'error' then
  redis.call('HSET', KEYS[1], 'status', 'pending', 'test_results', '[]', 'updated_at', ARGV[1])
  redis.call('HDEL', KEYS[1], 'error_message', 'execution_time_ms')
end
return status
"#;

/// User-initiated retry: `failed|error -> pending`, atomically.
///
/// Returns the status observed before the call (`None` if the submission
/// does not exist). The record was reset only if that status permits it.
pub async fn reset_submission_for_retry(
    conn: &mut ConnectionManager,
    id: &Uuid,
) -> RedisResult<Option<SubmissionStatus>> {
    let previous: Option<String> = redis::Script::new(RESET_FOR_RETRY)
        .key(submission_key(id))
        .arg(Utc::now().to_rfc3339())
        .invoke_async(conn)
        .await?;
    Ok(previous.as_deref().and_then(SubmissionStatus::parse))
}

const RECOVER_STALE: &str = r#"
local ids = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
local recovered = {}
for _, id in ipairs(ids) do
  local key = ARGV[2] .. ':' .. id
  if redis.call('HGET', key, 'status') == 'running' then
    redis.call('HSET', key, 'status', 'error', 'test_results', '[]', 'error_message', ARGV[3], 'updated_at', ARGV[4])
    table.insert(recovered, id)
  end
  redis.call('ZREM', KEYS[1], id)
end
return recovered
"#;

/// Reclassify submissions that have been `running` for longer than
/// `older_than_ms` as `error`. Returns the recovered ids.
pub async fn recover_stale_submissions(
    conn: &mut ConnectionManager,
    older_than_ms: u64,
    message: &str,
) -> RedisResult<Vec<Uuid>> {
    let cutoff = now_ms() - older_than_ms as i64;
    let ids: Vec<String> = redis::Script::new(RECOVER_STALE)
        .key(RUNNING_INDEX_KEY)
        .arg(cutoff)
        .arg(SUBMISSION_PREFIX)
        .arg(message)
        .arg(Utc::now().to_rfc3339())
        .invoke_async(conn)
        .await?;
    Ok(ids.iter().filter_map(|id| Uuid::parse_str(id).ok()).collect())
}

pub async fn put_exercise(conn: &mut ConnectionManager, exercise: &Exercise) -> RedisResult<()> {
    let _: () = redis::cmd("HSET")
        .arg(exercise_key(&exercise.id))
        .arg("test_code").arg(&exercise.test_code)
        .arg("language").arg(&exercise.language)
        .query_async(conn)
        .await?;
    Ok(())
}

pub async fn get_exercise(conn: &mut ConnectionManager, id: &Uuid) -> RedisResult<Option<Exercise>> {
    let fields: HashMap<String, String> = conn.hgetall(exercise_key(id)).await?;
    let Some(language) = fields.get("language") else {
        return Ok(None);
    };
    Ok(Some(Exercise {
        id: *id,
        test_code: fields.get("test_code").cloned().unwrap_or_default(),
        language: language.clone(),
    }))
}

const MARK_COMPLETED: &str = r#"
local raw = redis.call('HGET', KEYS[2], 'execution_time_ms')
local time = raw and tonumber(raw)
redis.call('HINCRBY', KEYS[1], 'attempts', 1)
redis.call('HSET', KEYS[1], 'is_completed', '1', 'updated_at', ARGV[2], 'completed_at', ARGV[2])
local best = redis.call('HGET', KEYS[1], 'best_time_ms')
local current = redis.call('HGET', KEYS[1], 'best_submission_id')
if (not current) or (time and ((not best) or time < tonumber(best))) then
  redis.call('HSET', KEYS[1], 'best_submission_id', ARGV[1])
  if time then
    redis.call('HSET', KEYS[1], 'best_time_ms', time)
  end
end
return 1
"#;

/// Record a passing submission. First success sets the best submission,
/// later ones replace it only when strictly faster. Attempts always count
/// and `completed_at` moves to the latest pass.
pub async fn mark_completed(
    conn: &mut ConnectionManager,
    user_id: &Uuid,
    exercise_id: &Uuid,
    submission_id: &Uuid,
) -> RedisResult<()> {
    let _: i64 = redis::Script::new(MARK_COMPLETED)
        .key(progress_key(user_id, exercise_id))
        .key(submission_key(submission_id))
        .arg(submission_id.to_string())
        .arg(Utc::now().to_rfc3339())
        .invoke_async(conn)
        .await?;
    Ok(())
}

/// Count a non-passing attempt, creating the progress record if needed.
pub async fn increment_attempts(
    conn: &mut ConnectionManager,
    user_id: &Uuid,
    exercise_id: &Uuid,
) -> RedisResult<()> {
    let key = progress_key(user_id, exercise_id);
    let mut pipe = redis::pipe();
    pipe.atomic()
        .cmd("HINCRBY").arg(&key).arg("attempts").arg(1).ignore()
        .cmd("HSETNX").arg(&key).arg("is_completed").arg("0").ignore()
        .cmd("HSET").arg(&key).arg("updated_at").arg(Utc::now().to_rfc3339()).ignore();
    pipe.query_async(conn).await
}

pub async fn get_progress(
    conn: &mut ConnectionManager,
    user_id: &Uuid,
    exercise_id: &Uuid,
) -> RedisResult<Option<Progress>> {
    let fields: HashMap<String, String> = conn.hgetall(progress_key(user_id, exercise_id)).await?;
    if fields.is_empty() {
        return Ok(None);
    }
    Ok(Some(progress_from_fields(*user_id, *exercise_id, &fields)))
}

pub fn progress_from_fields(
    user_id: Uuid,
    exercise_id: Uuid,
    fields: &HashMap<String, String>,
) -> Progress {
    Progress {
        user_id,
        exercise_id,
        is_completed: fields.get("is_completed").map(|v| v == "1").unwrap_or(false),
        attempts: fields
            .get("attempts")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0),
        best_submission_id: fields
            .get("best_submission_id")
            .and_then(|v| Uuid::parse_str(v).ok()),
        best_time_ms: fields.get("best_time_ms").and_then(|v| v.parse().ok()),
        completed_at: fields
            .get("completed_at")
            .and_then(|v| parse_time(v).ok()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_naming() {
        let id = Uuid::new_v4();
        assert_eq!(submission_key(&id), format!("blankcode:submission:{}", id));
        assert_eq!(exercise_key(&id), format!("blankcode:exercise:{}", id));
        assert_eq!(lock_key(&id), format!("blankcode:lock:{}", id));
        assert!(QUEUE_KEY.starts_with("blankcode:queue:"));
    }

    #[test]
    fn test_progress_key_deterministic() {
        let user = Uuid::new_v4();
        let exercise = Uuid::new_v4();
        assert_eq!(progress_key(&user, &exercise), progress_key(&user, &exercise));
        assert_ne!(progress_key(&user, &exercise), progress_key(&exercise, &user));
    }

    fn sample_fields(id: Uuid) -> HashMap<String, String> {
        let now = Utc::now().to_rfc3339();
        HashMap::from([
            ("id".to_string(), id.to_string()),
            ("user_id".to_string(), Uuid::new_v4().to_string()),
            ("exercise_id".to_string(), Uuid::new_v4().to_string()),
            ("code".to_string(), "print(1)".to_string()),
            ("status".to_string(), "failed".to_string()),
            (
                "test_results".to_string(),
                r#"[{"name":"test_add","passed":false,"message":"assert 3 == 4","duration":0}]"#
                    .to_string(),
            ),
            ("execution_time_ms".to_string(), "812".to_string()),
            ("created_at".to_string(), now.clone()),
            ("updated_at".to_string(), now),
        ])
    }

    #[test]
    fn test_submission_from_fields() {
        let id = Uuid::new_v4();
        let submission = submission_from_fields(&sample_fields(id)).unwrap();
        assert_eq!(submission.id, id);
        assert_eq!(submission.status, SubmissionStatus::Failed);
        assert_eq!(submission.execution_time_ms, Some(812));
        assert_eq!(submission.test_results.len(), 1);
        assert!(submission.error_message.is_none());
    }

    #[test]
    fn test_submission_from_fields_rejects_bad_status() {
        let mut fields = sample_fields(Uuid::new_v4());
        fields.insert("status".to_string(), "exploded".to_string());
        let err = submission_from_fields(&fields).unwrap_err();
        assert!(err.contains("exploded"));
    }

    #[test]
    fn test_progress_from_fields() {
        let best = Uuid::new_v4();
        let fields = HashMap::from([
            ("attempts".to_string(), "3".to_string()),
            ("is_completed".to_string(), "1".to_string()),
            ("best_submission_id".to_string(), best.to_string()),
            ("best_time_ms".to_string(), "120".to_string()),
        ]);
        let progress = progress_from_fields(Uuid::new_v4(), Uuid::new_v4(), &fields);
        assert!(progress.is_completed);
        assert_eq!(progress.attempts, 3);
        assert_eq!(progress.best_submission_id, Some(best));
        assert_eq!(progress.best_time_ms, Some(120));
        assert!(progress.completed_at.is_none());
    }
}
