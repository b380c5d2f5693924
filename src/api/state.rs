use crate::config::JobsConfig;
use crate::jobs::JobRegistry;
use crate::storage::{ChannelStore, JobStore};

#[derive(Clone)]
pub struct AppState {
    pub registry: JobRegistry,
    pub channels: ChannelStore,
    pub jobs: JobStore,
    /// Defaults for job knobs a request leaves out.
    pub job_defaults: JobsConfig,
}

impl AppState {
    pub fn new(registry: JobRegistry, job_defaults: JobsConfig) -> Self {
        let runner = registry.runner();
        Self {
            channels: runner.channels().clone(),
            jobs: runner.jobs().clone(),
            registry,
            job_defaults,
        }
    }
}
