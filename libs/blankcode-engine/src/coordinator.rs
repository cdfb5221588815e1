/// Execution Coordinator - Language Dispatch
///
/// **Responsibility:**
/// Map a language name (aliases included) to its executor and hand the
/// attempt to the `ExecutionEngine`.
///
/// **Contract:**
/// Never fails. An unknown language returns `status=error` immediately,
/// before any workspace or sandbox is touched.

use crate::executor::{executor_for, ExecutionEngine};
use blankcode_common::types::{ExecutionContext, ExecutionResult, Language};
use tracing::warn;
use uuid::Uuid;

#[derive(Clone)]
pub struct Coordinator {
    engine: ExecutionEngine,
}

impl Coordinator {
    pub fn new(engine: ExecutionEngine) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &ExecutionEngine {
        &self.engine
    }

    pub async fn execute(
        &self,
        submission_id: Uuid,
        exercise_id: Uuid,
        code: &str,
        test_code: &str,
        language: &str,
    ) -> ExecutionResult {
        let Some(lang) = Language::parse(language) else {
            warn!(%submission_id, %exercise_id, language, "Unsupported language");
            return ExecutionResult::error(format!("Unsupported language: {}", language), 0);
        };

        let config = self.engine.config();
        let ctx = ExecutionContext {
            submission_id,
            exercise_id,
            code: code.to_string(),
            test_code: test_code.to_string(),
            language: lang,
            timeout_ms: config.timeout_ms,
            memory_limit_mb: config.memory_limit_for(lang),
        };

        self.engine.execute(executor_for(lang), &ctx).await
    }
}
