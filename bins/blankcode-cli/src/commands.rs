// CLI commands: local grading and submission queue management
use anyhow::{bail, Context, Result};
use blankcode_common::config::ExecutionConfig;
use blankcode_common::redis as store;
use blankcode_common::types::{
    ExecutionResult, ExecutionStatus, Exercise, Language, Submission, SubmissionJob,
    SubmissionStatus,
};
use blankcode_engine::sandbox::{DockerSandbox, LocalSandbox};
use blankcode_engine::{Coordinator, ExecutionEngine, Sandbox};
use chrono::Utc;
use redis::aio::ConnectionManager;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

fn read_source(path: &Path) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))
}

async fn connect(redis_url: &str) -> Result<ConnectionManager> {
    let client = redis::Client::open(redis_url).context("Invalid Redis URL")?;
    ConnectionManager::new(client)
        .await
        .with_context(|| format!("Failed to connect to Redis at {}", redis_url))
}

/// Human-readable summary of a verdict.
pub fn render_result(result: &ExecutionResult) -> String {
    let icon = match result.status {
        ExecutionStatus::Passed => "✅",
        ExecutionStatus::Failed => "❌",
        ExecutionStatus::Error => "⚠️ ",
    };
    let mut out = format!(
        "{} {} ({} ms)\n",
        icon,
        result.status.as_str(),
        result.execution_time_ms
    );
    if let Some(message) = &result.error_message {
        out.push_str(&format!("   {}\n", message));
    }
    for test in &result.test_results {
        let mark = if test.passed { "✓" } else { "✗" };
        out.push_str(&format!("  {} {} ({} ms)\n", mark, test.name, test.duration));
        if let Some(message) = &test.message {
            for line in message.lines() {
                out.push_str(&format!("      {}\n", line));
            }
        }
    }
    let passed = result.test_results.iter().filter(|t| t.passed).count();
    if !result.test_results.is_empty() {
        out.push_str(&format!(
            "\n{}/{} tests passed\n",
            passed,
            result.test_results.len()
        ));
    }
    out
}

/// Only `failed` and `error` submissions go back to `pending`.
pub fn check_retry(id: Uuid, previous: Option<SubmissionStatus>) -> Result<()> {
    match previous {
        None => bail!("Submission not found: {}", id),
        Some(status) if status.can_transition_to(SubmissionStatus::Pending) => Ok(()),
        Some(status) => bail!(
            "Submission {} is {}; only failed or errored submissions can be retried",
            id,
            status
        ),
    }
}

/// Grade files from disk. Returns whether the verdict is `passed`.
pub async fn run_local(
    language: &str,
    code_path: &Path,
    tests_path: Option<&Path>,
    force_local: bool,
    json: bool,
) -> Result<bool> {
    let code = read_source(code_path)?;
    let test_code = match tests_path {
        Some(path) => read_source(path)?,
        None => String::new(),
    };

    let mut config = ExecutionConfig::from_env()?;
    if force_local {
        config.docker_enabled = false;
    }
    let sandbox: Arc<dyn Sandbox> = if config.docker_enabled {
        let docker = DockerSandbox::new(config.pids_limit)?;
        docker.ping().await.context(
            "Docker daemon unreachable; pass --local to use the local sandbox",
        )?;
        Arc::new(docker)
    } else {
        Arc::new(LocalSandbox::new())
    };

    let coordinator = Coordinator::new(ExecutionEngine::new(sandbox, Arc::new(config)));
    let result = coordinator
        .execute(Uuid::new_v4(), Uuid::new_v4(), &code, &test_code, language)
        .await;

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print!("{}", render_result(&result));
    }
    Ok(result.status == ExecutionStatus::Passed)
}

pub async fn add_exercise(
    redis_url: &str,
    language: &str,
    tests_path: &Path,
    id: Option<Uuid>,
) -> Result<()> {
    let Some(lang) = Language::parse(language) else {
        bail!("Unsupported language: {}", language);
    };
    let exercise = Exercise {
        id: id.unwrap_or_else(Uuid::new_v4),
        test_code: read_source(tests_path)?,
        language: lang.as_str().to_string(),
    };

    let mut conn = connect(redis_url).await?;
    store::put_exercise(&mut conn, &exercise).await?;

    println!("✅ Exercise stored ({})", exercise.language);
    println!("   id: {}", exercise.id);
    Ok(())
}

pub async fn submit(
    redis_url: &str,
    exercise_id: Uuid,
    code_path: &Path,
    user_id: Option<Uuid>,
) -> Result<()> {
    let code = read_source(code_path)?;
    let mut conn = connect(redis_url).await?;
    if store::get_exercise(&mut conn, &exercise_id).await?.is_none() {
        bail!("Exercise not found: {}", exercise_id);
    }

    let now = Utc::now();
    let submission = Submission {
        id: Uuid::new_v4(),
        user_id: user_id.unwrap_or_else(Uuid::new_v4),
        exercise_id,
        code: code.clone(),
        status: SubmissionStatus::Pending,
        test_results: Vec::new(),
        execution_time_ms: None,
        error_message: None,
        created_at: now,
        updated_at: now,
    };
    store::create_submission(&mut conn, &submission).await?;
    store::push_job(&mut conn, &SubmissionJob::new(submission.id, exercise_id, code)).await?;

    println!("🚀 Submission queued");
    println!("   id: {}", submission.id);
    println!("\n💡 Check it with: blankcode-cli status {}", submission.id);
    Ok(())
}

pub async fn retry(redis_url: &str, submission_id: Uuid) -> Result<()> {
    let mut conn = connect(redis_url).await?;
    let previous = store::reset_submission_for_retry(&mut conn, &submission_id).await?;
    check_retry(submission_id, previous)?;

    let Some(submission) = store::get_submission(&mut conn, &submission_id).await? else {
        bail!("Submission not found: {}", submission_id);
    };
    let job = SubmissionJob::new(submission.id, submission.exercise_id, submission.code);
    store::push_job(&mut conn, &job).await?;

    println!("🔁 Submission {} re-queued", submission_id);
    Ok(())
}

pub async fn status(redis_url: &str, submission_id: Uuid, json: bool) -> Result<()> {
    let mut conn = connect(redis_url).await?;
    let Some(submission) = store::get_submission(&mut conn, &submission_id).await? else {
        bail!("Submission not found: {}", submission_id);
    };
    let progress = store::get_progress(&mut conn, &submission.user_id, &submission.exercise_id).await?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "submission": submission,
                "progress": progress,
            }))?
        );
        return Ok(());
    }

    println!("📋 Submission {}", submission.id);
    println!("   exercise: {}", submission.exercise_id);
    println!("   user:     {}", submission.user_id);
    println!("   status:   {}", submission.status);
    println!("   updated:  {}", submission.updated_at.to_rfc3339());
    if submission.status.is_terminal() {
        let result = ExecutionResult {
            success: submission.status == SubmissionStatus::Passed,
            status: match submission.status {
                SubmissionStatus::Passed => ExecutionStatus::Passed,
                SubmissionStatus::Failed => ExecutionStatus::Failed,
                _ => ExecutionStatus::Error,
            },
            test_results: submission.test_results,
            execution_time_ms: submission.execution_time_ms.unwrap_or(0),
            error_message: submission.error_message,
        };
        println!();
        print!("{}", render_result(&result));
    }
    if let Some(progress) = progress {
        println!(
            "\n📊 Progress: {} attempt(s), {}",
            progress.attempts,
            if progress.is_completed { "completed" } else { "not completed" }
        );
        if let (Some(best), Some(ms)) = (progress.best_submission_id, progress.best_time_ms) {
            println!("   best: {} ({} ms)", best, ms);
        }
    }
    Ok(())
}
