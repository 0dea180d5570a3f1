use crate::processor::BatchProcessor;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use taskhive_core::HiveResult;
use taskhive_orchestrator::{ExecutionBackend, ExecutionOutcome, ExecutionRequest};

/// Runs each task as a single prompt through a shared [`BatchProcessor`],
/// so tasks dispatched together share model calls and cached answers.
pub struct BatchedModelBackend {
    processor: Arc<BatchProcessor>,
    default_model: String,
}

impl BatchedModelBackend {
    pub fn new(processor: Arc<BatchProcessor>) -> Self {
        let default_model = processor.config().default_model.clone();
        Self {
            processor,
            default_model,
        }
    }

    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = model.into();
        self
    }
}

#[async_trait]
impl ExecutionBackend for BatchedModelBackend {
    fn name(&self) -> &str {
        "batched-model"
    }

    async fn execute(&self, request: &ExecutionRequest) -> HiveResult<ExecutionOutcome> {
        let model = request
            .model
            .clone()
            .unwrap_or_else(|| self.default_model.clone());
        let request_id = format!("{}#{}", request.task_id, request.attempt);

        let started = Instant::now();
        let output = self
            .processor
            .process(request_id, request.description.clone(), model)
            .await?;
        Ok(ExecutionOutcome::success(output, started.elapsed()))
    }
}
