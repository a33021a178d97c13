pub mod handlers;
pub mod routes;

pub use routes::*;

use crate::playbooks::PlaybookService;
use std::time::{Duration, Instant};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub service: PlaybookService,
    pub started_at: Instant,
    pub request_timeout: Duration,
}

impl AppState {
    pub fn new(service: PlaybookService) -> Self {
        Self {
            service,
            started_at: Instant::now(),
            request_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}
