use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::core::ProgressTracker;

/// Shared state handed to every component of a run.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub progress: ProgressTracker,
    /// Fired on Ctrl-C; archive and transfer steps stop at the next check.
    pub cancel: CancellationToken,
}

impl AppContext {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config: Arc::new(config),
            progress: ProgressTracker::new(),
            cancel: CancellationToken::new(),
        }
    }
}
