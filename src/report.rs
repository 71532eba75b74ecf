use chrono::Utc;
use std::fmt::Display;
use std::sync::Arc;
use tracing::{error, warn};

/// Receives internal failures that should not take the process down.
pub trait Reporter: Send + Sync {
    fn report(&self, context: &str, err: &dyn Display);
}

pub fn from_endpoint(endpoint: Option<&str>) -> Arc<dyn Reporter> {
    match endpoint.filter(|url| !url.trim().is_empty()) {
        Some(url) => Arc::new(WebhookReporter::new(url.to_string())),
        None => Arc::new(LogReporter),
    }
}

pub struct LogReporter;

impl Reporter for LogReporter {
    fn report(&self, context: &str, err: &dyn Display) {
        error!("{}: {}", context, err);
    }
}

/// Logs the failure and posts it as a JSON event to an HTTP endpoint.
pub struct WebhookReporter {
    url: String,
    http_client: reqwest::Client,
}

impl WebhookReporter {
    pub fn new(url: String) -> Self {
        Self {
            url,
            http_client: reqwest::Client::new(),
        }
    }
}

impl Reporter for WebhookReporter {
    fn report(&self, context: &str, err: &dyn Display) {
        error!("{}: {}", context, err);

        // Reports can come from sync contexts during bootstrap.
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };

        let payload = serde_json::json!({
            "service": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "context": context,
            "message": err.to_string(),
            "timestamp": Utc::now().to_rfc3339(),
        });
        let client = self.http_client.clone();
        let url = self.url.clone();
        runtime.spawn(async move {
            if let Err(e) = client.post(&url).json(&payload).send().await {
                warn!("Failed to deliver error report to {}: {}", url, e);
            }
        });
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Collects reports so tests can assert on them.
    #[derive(Default)]
    pub struct RecordingReporter {
        pub reports: Mutex<Vec<String>>,
    }

    impl RecordingReporter {
        pub fn count(&self) -> usize {
            self.reports.lock().unwrap().len()
        }
    }

    impl Reporter for RecordingReporter {
        fn report(&self, context: &str, err: &dyn Display) {
            self.reports.lock().unwrap().push(format!("{}: {}", context, err));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_endpoint_falls_back_to_logging() {
        // Neither call may panic outside a runtime.
        from_endpoint(None).report("startup", &"boom");
        from_endpoint(Some("  ")).report("startup", &"boom");
        from_endpoint(Some("http://127.0.0.1:9/report")).report("startup", &"boom");
    }
}
