//! Order category: one customer notification per lifecycle event.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::info;

use crate::envelope::Job;
use crate::error::HandlerError;
use crate::handler::{HandlerRegistry, JobHandler};
use crate::mailer::{Mail, Mailer};

pub const JOB_TYPES: [&str; 6] = ["created", "update", "delete", "cancel", "ship", "deliver"];

#[derive(Debug, Clone, Deserialize)]
pub struct Customer {
    pub email: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub id: serde_json::Value,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub total_price: Option<serde_json::Value>,
    #[serde(default)]
    pub tracking_number: Option<String>,
    #[serde(default)]
    pub shipping_address: Option<String>,
    pub user: Customer,
}

impl Order {
    fn id(&self) -> String {
        match &self.id {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Notice {
    Confirmed,
    Processing,
    Shipped,
    Delivered,
    Cancelled,
}

/// Which notice `job_type` sends for `order`, if any.
fn notice_for(job_type: &str, order: &Order) -> Option<Notice> {
    match job_type {
        "created" => Some(Notice::Confirmed),
        "ship" => Some(Notice::Shipped),
        "deliver" => Some(Notice::Delivered),
        "cancel" => Some(Notice::Cancelled),
        "update" => match order.status.as_deref() {
            Some("processing") => Some(Notice::Processing),
            Some("shipped") => Some(Notice::Shipped),
            Some("delivered") => Some(Notice::Delivered),
            Some("cancelled") => Some(Notice::Cancelled),
            _ => None,
        },
        _ => None,
    }
}

fn render(notice: Notice, order: &Order) -> Mail {
    let name = order.user.name.as_deref().unwrap_or("Valued Customer");
    let id = order.id();

    let (subject, line) = match notice {
        Notice::Confirmed => (
            "Order Confirmation",
            format!(
                "Hello {name}, thank you for your order #{id} (total {}).",
                order
                    .total_price
                    .as_ref()
                    .map(|p| p.to_string().trim_matches('"').to_string())
                    .unwrap_or_else(|| "n/a".to_string())
            ),
        ),
        Notice::Processing => (
            "Your Order is Being Processed",
            format!("Hello {name}, we are preparing order #{id} for shipment."),
        ),
        Notice::Shipped => (
            "Your Order Has Shipped",
            format!(
                "Hello {name}, order #{id} is on its way (tracking: {}).",
                order.tracking_number.as_deref().unwrap_or("not available")
            ),
        ),
        Notice::Delivered => (
            "Your Order Has Been Delivered",
            format!(
                "Hello {name}, order #{id} was delivered to {}.",
                order.shipping_address.as_deref().unwrap_or("your address")
            ),
        ),
        Notice::Cancelled => (
            "Your Order Has Been Cancelled",
            format!("Hello {name}, order #{id} has been cancelled."),
        ),
    };

    Mail {
        to: order.user.email.clone(),
        subject: subject.to_string(),
        html: None,
        text: Some(line),
        from: None,
    }
}

pub struct OrderNotifier {
    mailer: Arc<dyn Mailer>,
}

impl OrderNotifier {
    pub fn new(mailer: Arc<dyn Mailer>) -> Self {
        Self { mailer }
    }
}

#[async_trait]
impl JobHandler for OrderNotifier {
    async fn handle(&self, job: &Job) -> Result<(), HandlerError> {
        let order: Order = job.payload_as()?;

        match notice_for(&job.job_type, &order) {
            Some(notice) => {
                self.mailer.send(&render(notice, &order)).await?;
            }
            None => {
                info!(
                    job_type = %job.job_type,
                    order_id = %order.id(),
                    status = ?order.status,
                    "order_notification_skipped"
                );
            }
        }
        Ok(())
    }
}

pub fn registry(mailer: Arc<dyn Mailer>) -> HandlerRegistry {
    let handler: Arc<dyn JobHandler> = Arc::new(OrderNotifier::new(mailer));
    let mut registry = HandlerRegistry::new();
    for job_type in JOB_TYPES {
        registry.register(job_type, handler.clone());
    }
    registry
}
