//! Handlers for the built-in job categories.

pub mod email;
pub mod order;

use std::sync::Arc;

use crate::handler::HandlerRegistry;
use crate::mailer::Mailer;

/// Handlers for `category`, or `None` for a category this crate does not know.
pub fn registry_for(category: &str, mailer: Arc<dyn Mailer>) -> Option<HandlerRegistry> {
    match category {
        "email" => Some(email::registry(mailer)),
        "order" => Some(order::registry(mailer)),
        _ => None,
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::mailer::LogMailer;

    #[test]
    fn test_registry_for_known_categories() {
        let mailer: Arc<dyn Mailer> = Arc::new(LogMailer::new("no-reply@localhost"));

        let email = registry_for("email", mailer.clone()).unwrap();
        let mut types: Vec<&str> = email.job_types().collect();
        types.sort();
        assert_eq!(types, vec!["send-otp", "send-password-reset", "send-welcome"]);

        assert_eq!(registry_for("order", mailer.clone()).unwrap().job_types().count(), 6);
        assert!(registry_for("billing", mailer).is_none());
    }
}
