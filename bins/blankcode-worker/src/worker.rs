/// Grading Worker Loop
///
/// **Per job:**
/// 1. Load the submission (skip if unknown or already terminal)
/// 2. Persist `running`
/// 3. Fetch hidden test code + language of the exercise
/// 4. Grade through the `Grader`
/// 5. Persist the verdict, then update progress (best effort)
///
/// **Failure policy:**
/// A missing exercise can never succeed, so the submission is marked
/// `error` on the first delivery and the job is acknowledged.
/// A job that raises (store/queue error, panic) is redelivered with
/// exponential backoff while attempts remain; the submission stays
/// `running` in between. The last attempt marks the submission `error`
/// with `Job failed after N attempts: <cause>` and dead-letters the job.
/// Anything that slips through is caught by the stale-recovery sweep.
///
/// **Concurrency:**
/// A semaphore bounds in-flight jobs; a permit is taken before reserving
/// so the worker never holds jobs it cannot start.

use crate::config::WorkerConfig;
use crate::health::{GRADING_SECONDS, JOBS_IN_FLIGHT, JOBS_PROCESSED, JOB_FAILURES, STALE_RECOVERED};
use crate::store::{ExerciseStore, Grader, JobQueue, ProgressTracker, SubmissionStore};
use anyhow::{anyhow, Context, Result};
use blankcode_common::redis::ReservedJob;
use blankcode_common::types::{
    ExecutionResult, ExecutionStatus, Language, SubmissionJob, SubmissionStatus,
};
use futures_util::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

pub const RECOVERY_MESSAGE: &str = "Worker recovery: submission was stuck in running state";

const RESERVE_WAIT: Duration = Duration::from_secs(2);
const QUEUE_ERROR_PAUSE: Duration = Duration::from_secs(1);

/// Handles the worker needs, built once at startup.
#[derive(Clone)]
pub struct Collaborators {
    pub queue: Arc<dyn JobQueue>,
    pub submissions: Arc<dyn SubmissionStore>,
    pub exercises: Arc<dyn ExerciseStore>,
    pub progress: Arc<dyn ProgressTracker>,
    pub grader: Arc<dyn Grader>,
}

#[derive(Debug)]
pub enum Outcome {
    Graded(ExecutionResult),
    /// Nothing to grade: the record is gone or already has a verdict.
    Skipped(&'static str),
    /// Marked `error` without grading.
    Rejected(String),
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub requeued: usize,
    pub recovered: usize,
}

/// Resolves once `shutdown` holds `true` or its sender is gone.
pub async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

fn language_label(raw: &str) -> &'static str {
    Language::parse(raw).map(|l| l.as_str()).unwrap_or("unsupported")
}

pub struct Worker {
    deps: Collaborators,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(deps: Collaborators, config: WorkerConfig) -> Self {
        Self { deps, config }
    }

    /// Grade one job. Errors are left to `handle_job`'s retry policy.
    #[instrument(
        skip_all,
        fields(
            submission_id = %job.submission_id,
            exercise_id = %job.exercise_id,
            attempt = job.attempts_made + 1,
            language = tracing::field::Empty,
        )
    )]
    pub async fn process_submission(&self, job: &SubmissionJob) -> Result<Outcome> {
        let submission = match self
            .deps
            .submissions
            .get(&job.submission_id)
            .await
            .context("Failed to load submission")?
        {
            Some(submission) => submission,
            None => return Ok(Outcome::Skipped("submission not found")),
        };
        if submission.status.is_terminal() {
            return Ok(Outcome::Skipped("submission already graded"));
        }

        self.deps.submissions.mark_running(&job.submission_id).await?;

        let exercise = match self
            .deps
            .exercises
            .get_exercise(&job.exercise_id)
            .await
            .context("Failed to load exercise")?
        {
            Some(exercise) => exercise,
            None => {
                let message = format!("Exercise not found: {}", job.exercise_id);
                self.deps
                    .submissions
                    .mark_error(&job.submission_id, &message)
                    .await?;
                return Ok(Outcome::Rejected(message));
            }
        };
        tracing::Span::current().record("language", exercise.language.as_str());
        info!("Grading submission");

        let started = Instant::now();
        let result = self
            .deps
            .grader
            .grade(
                job.submission_id,
                job.exercise_id,
                &job.code,
                &exercise.test_code,
                &exercise.language,
            )
            .await;
        GRADING_SECONDS
            .with_label_values(&[language_label(&exercise.language)])
            .observe(started.elapsed().as_secs_f64());

        self.deps
            .submissions
            .record_result(&job.submission_id, &result)
            .await?;
        info!(
            status = result.status.as_str(),
            tests = result.test_results.len(),
            execution_time_ms = result.execution_time_ms,
            "Submission graded"
        );

        // The verdict is persisted; progress failures must not touch it.
        let progress = match result.status {
            ExecutionStatus::Passed => {
                self.deps
                    .progress
                    .mark_completed(&submission.user_id, &job.exercise_id, &job.submission_id)
                    .await
            }
            ExecutionStatus::Failed | ExecutionStatus::Error => {
                self.deps
                    .progress
                    .increment_attempts(&submission.user_id, &job.exercise_id)
                    .await
            }
        };
        if let Err(e) = progress {
            warn!(error = %format!("{:#}", e), "Progress update failed");
        }

        Ok(Outcome::Graded(result))
    }

    /// Process a reserved job and settle it with the queue. Never fails.
    pub async fn handle_job(&self, reserved: ReservedJob) {
        JOBS_IN_FLIGHT.inc();
        let heartbeat = self.spawn_heartbeat(reserved.clone());

        let outcome = AssertUnwindSafe(self.process_submission(&reserved.job))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                Err(anyhow!("Worker panicked: {}", panic_message(panic.as_ref())))
            });
        heartbeat.abort();

        match outcome {
            Ok(Outcome::Graded(result)) => {
                JOBS_PROCESSED
                    .with_label_values(&[result.status.as_str()])
                    .inc();
                self.ack(&reserved).await;
            }
            Ok(Outcome::Skipped(reason)) => {
                info!(submission_id = %reserved.job.submission_id, reason, "Skipping job");
                self.ack(&reserved).await;
            }
            Ok(Outcome::Rejected(message)) => {
                warn!(submission_id = %reserved.job.submission_id, error = %message, "Submission rejected");
                JOBS_PROCESSED
                    .with_label_values(&[SubmissionStatus::Error.as_str()])
                    .inc();
                self.ack(&reserved).await;
            }
            Err(e) => self.handle_failure(&reserved, e).await,
        }
        JOBS_IN_FLIGHT.dec();
    }

    async fn ack(&self, reserved: &ReservedJob) {
        if let Err(e) = self.deps.queue.ack(reserved).await {
            error!(
                submission_id = %reserved.job.submission_id,
                error = %format!("{:#}", e),
                "Failed to acknowledge job"
            );
        }
    }

    async fn handle_failure(&self, reserved: &ReservedJob, e: anyhow::Error) {
        let job = &reserved.job;
        let cause = format!("{:#}", e);
        let attempt = job.attempts_made + 1;

        if attempt < self.config.job_attempts {
            let delay = self.config.backoff(job.attempts_made);
            warn!(
                submission_id = %job.submission_id,
                attempt,
                max_attempts = self.config.job_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %cause,
                "Job failed, scheduling retry"
            );
            match self.deps.queue.retry(reserved, delay).await {
                Ok(()) => {
                    JOB_FAILURES.with_label_values(&["retried"]).inc();
                    return;
                }
                Err(retry_err) => {
                    error!(
                        submission_id = %job.submission_id,
                        error = %format!("{:#}", retry_err),
                        "Failed to schedule retry"
                    );
                    // No redelivery is coming; settle the submission now.
                    self.fail_submission(&job.submission_id, &cause).await;
                    return;
                }
            }
        }

        error!(
            submission_id = %job.submission_id,
            attempts = attempt,
            error = %cause,
            "Job failed permanently"
        );
        let message = format!("Job failed after {} attempts: {}", attempt, cause);
        self.fail_submission(&job.submission_id, &message).await;
        JOBS_PROCESSED
            .with_label_values(&[SubmissionStatus::Error.as_str()])
            .inc();
        JOB_FAILURES.with_label_values(&["dead_lettered"]).inc();
        if let Err(e) = self.deps.queue.dead_letter(reserved).await {
            error!(
                submission_id = %job.submission_id,
                error = %format!("{:#}", e),
                "Failed to dead-letter job"
            );
        }
    }

    async fn fail_submission(&self, id: &Uuid, message: &str) {
        if let Err(e) = self.deps.submissions.mark_error(id, message).await {
            error!(
                submission_id = %id,
                error = %format!("{:#}", e),
                "Failed to mark submission as error; leaving it to stale recovery"
            );
        }
    }

    fn spawn_heartbeat(&self, reserved: ReservedJob) -> JoinHandle<()> {
        let queue = self.deps.queue.clone();
        let every = self.config.heartbeat_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = queue.heartbeat(&reserved).await {
                    warn!(
                        submission_id = %reserved.job.submission_id,
                        error = %format!("{:#}", e),
                        "Failed to extend job lock"
                    );
                }
            }
        })
    }

    /// Requeue stalled jobs and recover submissions stuck in `running`.
    pub async fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();

        match self.deps.queue.requeue_stalled().await {
            Ok(0) => {}
            Ok(n) => {
                warn!(count = n, "Requeued stalled jobs");
                report.requeued = n;
            }
            Err(e) => error!(error = %format!("{:#}", e), "Stalled job check failed"),
        }

        match self
            .deps
            .submissions
            .recover_stale(self.config.stale_after(), RECOVERY_MESSAGE)
            .await
        {
            Ok(ids) => {
                for id in &ids {
                    warn!(submission_id = %id, "Recovered stale submission");
                }
                STALE_RECOVERED.inc_by(ids.len() as u64);
                report.recovered = ids.len();
            }
            Err(e) => error!(error = %format!("{:#}", e), "Stale submission recovery failed"),
        }

        report
    }

    async fn sweep_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.stalled_check_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.sweep().await;
                    debug!(requeued = report.requeued, recovered = report.recovered, "Sweep finished");
                }
                _ = shutdown_requested(&mut shutdown) => break,
            }
        }
    }

    /// Pull and process jobs until shutdown, then drain in-flight work.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(
            concurrency = self.config.concurrency,
            attempts = self.config.job_attempts,
            "Worker loop started"
        );
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency));
        let mut tasks = JoinSet::new();
        let sweep = tokio::spawn(self.clone().sweep_loop(shutdown.clone()));

        loop {
            while let Some(done) = tasks.try_join_next() {
                log_join(done);
            }

            let permit = tokio::select! {
                permit = semaphore.clone().acquire_owned() => permit.context("Job semaphore closed")?,
                _ = shutdown_requested(&mut shutdown) => break,
            };

            match self.deps.queue.reserve(RESERVE_WAIT).await {
                Ok(Some(reserved)) => {
                    debug!(
                        submission_id = %reserved.job.submission_id,
                        attempt = reserved.job.attempts_made + 1,
                        "Reserved job"
                    );
                    let worker = self.clone();
                    tasks.spawn(async move {
                        worker.handle_job(reserved).await;
                        drop(permit);
                    });
                }
                Ok(None) => {}
                Err(e) => {
                    error!(error = %format!("{:#}", e), "Failed to reserve job");
                    tokio::select! {
                        _ = tokio::time::sleep(QUEUE_ERROR_PAUSE) => {}
                        _ = shutdown_requested(&mut shutdown) => break,
                    }
                }
            }
        }

        info!(in_flight = tasks.len(), "Shutdown requested, draining in-flight jobs");
        while let Some(done) = tasks.join_next().await {
            log_join(done);
        }
        if let Err(e) = sweep.await {
            error!(error = %e, "Sweep task failed");
        }
        info!("Worker loop stopped");
        Ok(())
    }
}

fn log_join(done: std::result::Result<(), JoinError>) {
    if let Err(e) = done {
        error!(error = %e, "Job task failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use blankcode_common::types::{Exercise, Submission, TestResult};
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeQueue {
        pending: Mutex<VecDeque<ReservedJob>>,
        acked: Mutex<Vec<Uuid>>,
        retried: Mutex<Vec<(Uuid, Duration)>>,
        dead: Mutex<Vec<Uuid>>,
        stalled: AtomicUsize,
    }

    impl FakeQueue {
        fn push(&self, job: SubmissionJob) {
            let payload = serde_json::to_string(&job).unwrap();
            self.pending.lock().unwrap().push_back(ReservedJob { job, payload });
        }
    }

    #[async_trait]
    impl JobQueue for FakeQueue {
        async fn reserve(&self, wait: Duration) -> Result<Option<ReservedJob>> {
            let next = self.pending.lock().unwrap().pop_front();
            if next.is_none() {
                tokio::time::sleep(wait.min(Duration::from_millis(10))).await;
            }
            Ok(next)
        }
        async fn heartbeat(&self, _job: &ReservedJob) -> Result<()> {
            Ok(())
        }
        async fn ack(&self, job: &ReservedJob) -> Result<()> {
            self.acked.lock().unwrap().push(job.job.submission_id);
            Ok(())
        }
        async fn retry(&self, job: &ReservedJob, delay: Duration) -> Result<()> {
            self.retried.lock().unwrap().push((job.job.submission_id, delay));
            Ok(())
        }
        async fn dead_letter(&self, job: &ReservedJob) -> Result<()> {
            self.dead.lock().unwrap().push(job.job.submission_id);
            Ok(())
        }
        async fn requeue_stalled(&self) -> Result<usize> {
            Ok(self.stalled.swap(0, Ordering::SeqCst))
        }
    }

    #[derive(Default)]
    struct MemoryStore {
        submissions: Mutex<HashMap<Uuid, Submission>>,
        exercises: Mutex<HashMap<Uuid, Exercise>>,
        running_since: Mutex<HashMap<Uuid, Instant>>,
        progress: Mutex<Vec<String>>,
        fail_progress: AtomicBool,
        fail_running: AtomicBool,
    }

    impl MemoryStore {
        fn add_submission(&self, exercise_id: Uuid) -> Uuid {
            let now = chrono::Utc::now();
            let id = Uuid::new_v4();
            self.submissions.lock().unwrap().insert(
                id,
                Submission {
                    id,
                    user_id: Uuid::new_v4(),
                    exercise_id,
                    code: "def add(a, b): return a + b".to_string(),
                    status: SubmissionStatus::Pending,
                    test_results: vec![],
                    execution_time_ms: None,
                    error_message: None,
                    created_at: now,
                    updated_at: now,
                },
            );
            id
        }

        fn add_exercise(&self, language: &str) -> Uuid {
            let id = Uuid::new_v4();
            self.exercises.lock().unwrap().insert(
                id,
                Exercise {
                    id,
                    test_code: "def test_add(): assert add(1, 2) == 3".to_string(),
                    language: language.to_string(),
                },
            );
            id
        }

        fn submission(&self, id: &Uuid) -> Submission {
            self.submissions.lock().unwrap()[id].clone()
        }

        fn set_status(&self, id: &Uuid, status: SubmissionStatus) {
            if let Some(s) = self.submissions.lock().unwrap().get_mut(id) {
                s.status = status;
            }
        }
    }

    #[async_trait]
    impl SubmissionStore for MemoryStore {
        async fn get(&self, id: &Uuid) -> Result<Option<Submission>> {
            Ok(self.submissions.lock().unwrap().get(id).cloned())
        }
        async fn mark_running(&self, id: &Uuid) -> Result<()> {
            if self.fail_running.load(Ordering::SeqCst) {
                return Err(anyhow!("connection refused"));
            }
            self.set_status(id, SubmissionStatus::Running);
            self.running_since.lock().unwrap().insert(*id, Instant::now());
            Ok(())
        }
        async fn record_result(&self, id: &Uuid, result: &ExecutionResult) -> Result<()> {
            if let Some(s) = self.submissions.lock().unwrap().get_mut(id) {
                s.status = SubmissionStatus::from(result.status);
                s.test_results = result.test_results.clone();
                s.execution_time_ms = Some(result.execution_time_ms);
                s.error_message = result.error_message.clone();
            }
            Ok(())
        }
        async fn mark_error(&self, id: &Uuid, message: &str) -> Result<()> {
            if let Some(s) = self.submissions.lock().unwrap().get_mut(id) {
                s.status = SubmissionStatus::Error;
                s.test_results.clear();
                s.error_message = Some(message.to_string());
            }
            Ok(())
        }
        async fn recover_stale(&self, older_than: Duration, message: &str) -> Result<Vec<Uuid>> {
            let since = self.running_since.lock().unwrap().clone();
            let mut recovered = Vec::new();
            for s in self.submissions.lock().unwrap().values_mut() {
                let stale = since
                    .get(&s.id)
                    .map(|started| started.elapsed() >= older_than)
                    .unwrap_or(true);
                if s.status == SubmissionStatus::Running && stale {
                    s.status = SubmissionStatus::Error;
                    s.error_message = Some(message.to_string());
                    recovered.push(s.id);
                }
            }
            Ok(recovered)
        }
    }

    #[async_trait]
    impl ExerciseStore for MemoryStore {
        async fn get_exercise(&self, id: &Uuid) -> Result<Option<Exercise>> {
            Ok(self.exercises.lock().unwrap().get(id).cloned())
        }
    }

    #[async_trait]
    impl ProgressTracker for MemoryStore {
        async fn mark_completed(&self, _user: &Uuid, _exercise: &Uuid, submission: &Uuid) -> Result<()> {
            if self.fail_progress.load(Ordering::SeqCst) {
                return Err(anyhow!("progress store unavailable"));
            }
            self.progress.lock().unwrap().push(format!("completed:{}", submission));
            Ok(())
        }
        async fn increment_attempts(&self, _user: &Uuid, exercise: &Uuid) -> Result<()> {
            if self.fail_progress.load(Ordering::SeqCst) {
                return Err(anyhow!("progress store unavailable"));
            }
            self.progress.lock().unwrap().push(format!("attempt:{}", exercise));
            Ok(())
        }
    }

    enum Script {
        Verdict(ExecutionResult),
        Panic,
    }

    struct FakeGrader {
        script: Script,
        delay: Duration,
        calls: AtomicUsize,
        running: AtomicUsize,
        max_running: AtomicUsize,
    }

    impl FakeGrader {
        fn new(script: Script) -> Self {
            Self {
                script,
                delay: Duration::ZERO,
                calls: AtomicUsize::new(0),
                running: AtomicUsize::new(0),
                max_running: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Grader for FakeGrader {
        async fn grade(&self, _: Uuid, _: Uuid, _: &str, _: &str, _: &str) -> ExecutionResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_running.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            match &self.script {
                Script::Verdict(result) => result.clone(),
                Script::Panic => panic!("sandbox exploded"),
            }
        }
    }

    fn passed() -> ExecutionResult {
        ExecutionResult::from_tests(vec![TestResult::passed("test_add", 3)], 120)
    }

    fn failed() -> ExecutionResult {
        ExecutionResult::from_tests(
            vec![TestResult::failed("test_add", 3, Some("assert 3 == 4".to_string()))],
            120,
        )
    }

    fn worker(
        queue: &Arc<FakeQueue>,
        store: &Arc<MemoryStore>,
        grader: &Arc<FakeGrader>,
        config: WorkerConfig,
    ) -> Arc<Worker> {
        Arc::new(Worker::new(
            Collaborators {
                queue: queue.clone(),
                submissions: store.clone(),
                exercises: store.clone(),
                progress: store.clone(),
                grader: grader.clone(),
            },
            config,
        ))
    }

    fn reserved(job: SubmissionJob) -> ReservedJob {
        let payload = serde_json::to_string(&job).unwrap();
        ReservedJob { job, payload }
    }

    #[tokio::test]
    async fn test_passed_submission_marks_completed() {
        let (queue, store) = (Arc::new(FakeQueue::default()), Arc::new(MemoryStore::default()));
        let grader = Arc::new(FakeGrader::new(Script::Verdict(passed())));
        let exercise = store.add_exercise("python");
        let submission = store.add_submission(exercise);

        let w = worker(&queue, &store, &grader, WorkerConfig::default());
        w.handle_job(reserved(SubmissionJob::new(submission, exercise, "code"))).await;

        let stored = store.submission(&submission);
        assert_eq!(stored.status, SubmissionStatus::Passed);
        assert_eq!(stored.execution_time_ms, Some(120));
        assert_eq!(*store.progress.lock().unwrap(), vec![format!("completed:{}", submission)]);
        assert_eq!(*queue.acked.lock().unwrap(), vec![submission]);
    }

    #[tokio::test]
    async fn test_failed_submission_counts_attempt() {
        let (queue, store) = (Arc::new(FakeQueue::default()), Arc::new(MemoryStore::default()));
        let grader = Arc::new(FakeGrader::new(Script::Verdict(failed())));
        let exercise = store.add_exercise("python");
        let submission = store.add_submission(exercise);

        let w = worker(&queue, &store, &grader, WorkerConfig::default());
        w.handle_job(reserved(SubmissionJob::new(submission, exercise, "code"))).await;

        let stored = store.submission(&submission);
        assert_eq!(stored.status, SubmissionStatus::Failed);
        assert_eq!(stored.test_results[0].message.as_deref(), Some("assert 3 == 4"));
        assert_eq!(*store.progress.lock().unwrap(), vec![format!("attempt:{}", exercise)]);
    }

    #[tokio::test]
    async fn test_missing_exercise_errors_on_first_delivery() {
        let (queue, store) = (Arc::new(FakeQueue::default()), Arc::new(MemoryStore::default()));
        let grader = Arc::new(FakeGrader::new(Script::Verdict(passed())));
        let missing_exercise = Uuid::new_v4();
        let submission = store.add_submission(missing_exercise);

        let w = worker(&queue, &store, &grader, WorkerConfig::default());
        w.handle_job(reserved(SubmissionJob::new(submission, missing_exercise, "code"))).await;

        let stored = store.submission(&submission);
        assert_eq!(stored.status, SubmissionStatus::Error);
        assert_eq!(
            stored.error_message,
            Some(format!("Exercise not found: {}", missing_exercise))
        );
        assert_eq!(*queue.acked.lock().unwrap(), vec![submission]);
        assert!(queue.retried.lock().unwrap().is_empty());
        assert!(queue.dead.lock().unwrap().is_empty());
        assert_eq!(grader.calls.load(Ordering::SeqCst), 0);
        assert!(store.progress.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failure_with_attempts_left_is_retried() {
        let (queue, store) = (Arc::new(FakeQueue::default()), Arc::new(MemoryStore::default()));
        store.fail_running.store(true, Ordering::SeqCst);
        let grader = Arc::new(FakeGrader::new(Script::Verdict(passed())));
        let exercise = store.add_exercise("python");
        let submission = store.add_submission(exercise);
        store.set_status(&submission, SubmissionStatus::Running);

        let w = worker(&queue, &store, &grader, WorkerConfig::default());
        let mut job = SubmissionJob::new(submission, exercise, "code");
        job.attempts_made = 1;
        w.handle_job(reserved(job)).await;

        assert_eq!(
            *queue.retried.lock().unwrap(),
            vec![(submission, Duration::from_millis(2_000))]
        );
        assert!(queue.dead.lock().unwrap().is_empty());
        assert_eq!(store.submission(&submission).status, SubmissionStatus::Running);
        assert_eq!(grader.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_last_attempt_marks_error_and_dead_letters() {
        let (queue, store) = (Arc::new(FakeQueue::default()), Arc::new(MemoryStore::default()));
        store.fail_running.store(true, Ordering::SeqCst);
        let grader = Arc::new(FakeGrader::new(Script::Verdict(passed())));
        let exercise = store.add_exercise("python");
        let submission = store.add_submission(exercise);

        let w = worker(&queue, &store, &grader, WorkerConfig::default());
        let mut job = SubmissionJob::new(submission, exercise, "code");
        job.attempts_made = 2;
        w.handle_job(reserved(job)).await;

        let stored = store.submission(&submission);
        assert_eq!(stored.status, SubmissionStatus::Error);
        assert_eq!(
            stored.error_message.as_deref(),
            Some("Job failed after 3 attempts: connection refused")
        );
        assert_eq!(*queue.dead.lock().unwrap(), vec![submission]);
        assert!(queue.retried.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_panic_becomes_error() {
        let (queue, store) = (Arc::new(FakeQueue::default()), Arc::new(MemoryStore::default()));
        let grader = Arc::new(FakeGrader::new(Script::Panic));
        let exercise = store.add_exercise("go");
        let submission = store.add_submission(exercise);

        let config = WorkerConfig {
            job_attempts: 1,
            ..WorkerConfig::default()
        };
        let w = worker(&queue, &store, &grader, config);
        w.handle_job(reserved(SubmissionJob::new(submission, exercise, "code"))).await;

        let stored = store.submission(&submission);
        assert_eq!(stored.status, SubmissionStatus::Error);
        assert!(stored.error_message.unwrap().contains("Worker panicked: sandbox exploded"));
    }

    #[tokio::test]
    async fn test_progress_failure_keeps_verdict() {
        let (queue, store) = (Arc::new(FakeQueue::default()), Arc::new(MemoryStore::default()));
        store.fail_progress.store(true, Ordering::SeqCst);
        let grader = Arc::new(FakeGrader::new(Script::Verdict(passed())));
        let exercise = store.add_exercise("rust");
        let submission = store.add_submission(exercise);

        let w = worker(&queue, &store, &grader, WorkerConfig::default());
        w.handle_job(reserved(SubmissionJob::new(submission, exercise, "code"))).await;

        assert_eq!(store.submission(&submission).status, SubmissionStatus::Passed);
        assert_eq!(*queue.acked.lock().unwrap(), vec![submission]);
        assert!(queue.retried.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_store_outage_is_retried() {
        let (queue, store) = (Arc::new(FakeQueue::default()), Arc::new(MemoryStore::default()));
        store.fail_running.store(true, Ordering::SeqCst);
        let grader = Arc::new(FakeGrader::new(Script::Verdict(passed())));
        let exercise = store.add_exercise("python");
        let submission = store.add_submission(exercise);

        let w = worker(&queue, &store, &grader, WorkerConfig::default());
        w.handle_job(reserved(SubmissionJob::new(submission, exercise, "code"))).await;

        assert_eq!(queue.retried.lock().unwrap().len(), 1);
        assert_eq!(grader.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_duplicate_delivery_is_skipped() {
        let (queue, store) = (Arc::new(FakeQueue::default()), Arc::new(MemoryStore::default()));
        let grader = Arc::new(FakeGrader::new(Script::Verdict(passed())));
        let exercise = store.add_exercise("python");
        let submission = store.add_submission(exercise);
        store.set_status(&submission, SubmissionStatus::Failed);

        let w = worker(&queue, &store, &grader, WorkerConfig::default());
        w.handle_job(reserved(SubmissionJob::new(submission, exercise, "code"))).await;
        w.handle_job(reserved(SubmissionJob::new(Uuid::new_v4(), exercise, "code"))).await;

        assert_eq!(grader.calls.load(Ordering::SeqCst), 0);
        assert_eq!(store.submission(&submission).status, SubmissionStatus::Failed);
        assert_eq!(queue.acked.lock().unwrap().len(), 2);
        assert!(store.progress.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sweep_recovers_stuck_submissions() {
        let (queue, store) = (Arc::new(FakeQueue::default()), Arc::new(MemoryStore::default()));
        let grader = Arc::new(FakeGrader::new(Script::Verdict(passed())));
        let exercise = store.add_exercise("python");
        let stuck = store.add_submission(exercise);
        let waiting = store.add_submission(exercise);
        store.set_status(&stuck, SubmissionStatus::Running);
        queue.stalled.store(2, Ordering::SeqCst);

        let w = worker(&queue, &store, &grader, WorkerConfig::default());
        let report = w.sweep().await;

        assert_eq!(report, SweepReport { requeued: 2, recovered: 1 });
        let recovered = store.submission(&stuck);
        assert_eq!(recovered.status, SubmissionStatus::Error);
        assert_eq!(recovered.error_message.as_deref(), Some(RECOVERY_MESSAGE));
        assert_eq!(store.submission(&waiting).status, SubmissionStatus::Pending);
    }

    #[tokio::test]
    async fn test_run_bounds_concurrency_and_drains_on_shutdown() {
        let (queue, store) = (Arc::new(FakeQueue::default()), Arc::new(MemoryStore::default()));
        let mut grader = FakeGrader::new(Script::Verdict(passed()));
        grader.delay = Duration::from_millis(50);
        let grader = Arc::new(grader);
        let exercise = store.add_exercise("python");
        let ids: Vec<Uuid> = (0..6).map(|_| store.add_submission(exercise)).collect();
        for id in &ids {
            queue.push(SubmissionJob::new(*id, exercise, "code"));
        }

        let config = WorkerConfig {
            concurrency: 2,
            health_addr: None,
            ..WorkerConfig::default()
        };
        let w = worker(&queue, &store, &grader, config);
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(w.run(rx));

        let deadline = Instant::now() + Duration::from_secs(5);
        while queue.acked.lock().unwrap().len() < ids.len() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tx.send(true).unwrap();
        handle.await.unwrap().unwrap();

        assert_eq!(queue.acked.lock().unwrap().len(), ids.len());
        assert!(grader.max_running.load(Ordering::SeqCst) <= 2);
        for id in &ids {
            assert_eq!(store.submission(id).status, SubmissionStatus::Passed);
        }
    }

    #[test]
    fn test_language_label() {
        assert_eq!(language_label("TS"), "typescript");
        assert_eq!(language_label("cobol"), "unsupported");
    }
}
