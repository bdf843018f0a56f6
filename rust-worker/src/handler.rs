//! Job handlers and job-type dispatch.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::envelope::Job;
use crate::error::HandlerError;

#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> Result<(), HandlerError>;
}

#[async_trait]
impl<T: JobHandler + ?Sized> JobHandler for Arc<T> {
    async fn handle(&self, job: &Job) -> Result<(), HandlerError> {
        (**self).handle(job).await
    }
}

/// Dispatches jobs to the handler registered for their job type.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, job_type: impl Into<String>, handler: Arc<dyn JobHandler>) -> &mut Self {
        self.handlers.insert(job_type.into(), handler);
        self
    }

    pub fn job_types(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }
}

#[async_trait]
impl JobHandler for HandlerRegistry {
    async fn handle(&self, job: &Job) -> Result<(), HandlerError> {
        match self.handlers.get(&job.job_type) {
            Some(handler) => handler.handle(job).await,
            None => Err(HandlerError::permanent(format!(
                "unknown job type {:?}",
                job.job_type
            ))),
        }
    }
}
