//! Email category: send the mail described by the payload.

use std::sync::Arc;

use async_trait::async_trait;

use crate::envelope::Job;
use crate::error::HandlerError;
use crate::handler::{HandlerRegistry, JobHandler};
use crate::mailer::{Mail, Mailer};

pub const JOB_TYPES: [&str; 3] = ["send-otp", "send-welcome", "send-password-reset"];

pub struct SendMail {
    mailer: Arc<dyn Mailer>,
}

impl SendMail {
    pub fn new(mailer: Arc<dyn Mailer>) -> Self {
        Self { mailer }
    }
}

#[async_trait]
impl JobHandler for SendMail {
    async fn handle(&self, job: &Job) -> Result<(), HandlerError> {
        let mail: Mail = job.payload_as()?;
        if mail.html.is_none() && mail.text.is_none() {
            return Err(HandlerError::permanent("mail has neither html nor text body"));
        }
        self.mailer.send(&mail).await?;
        Ok(())
    }
}

pub fn registry(mailer: Arc<dyn Mailer>) -> HandlerRegistry {
    let handler: Arc<dyn JobHandler> = Arc::new(SendMail::new(mailer));
    let mut registry = HandlerRegistry::new();
    for job_type in JOB_TYPES {
        registry.register(job_type, handler.clone());
    }
    registry
}
