//! Worker options.

use hopper_queue::WorkerDefaults;

/// Jobs processed before a restart when `max_jobs` is zero.
pub const DEFAULT_MAX_JOBS: u64 = 1000;

/// Settings for one worker loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerOptions {
    /// Default job timeout in seconds. Zero disables the timeout.
    pub timeout: u64,
    /// Memory limit in megabytes. Zero disables the check.
    pub memory: u64,
    /// Seconds to sleep when no queue had work.
    pub sleep: u64,
    /// Default maximum attempts.
    pub tries: u32,
    /// Default base backoff in seconds.
    pub backoff: u64,
    /// Jobs to process before exiting for a restart.
    pub max_jobs: u64,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self::from(&WorkerDefaults::default())
    }
}

impl From<&WorkerDefaults> for WorkerOptions {
    fn from(defaults: &WorkerDefaults) -> Self {
        Self {
            timeout: defaults.timeout,
            memory: defaults.memory,
            sleep: defaults.sleep,
            tries: defaults.tries,
            backoff: defaults.backoff,
            max_jobs: defaults.max_jobs,
        }
    }
}

impl WorkerOptions {
    pub fn timeout(mut self, seconds: u64) -> Self {
        self.timeout = seconds;
        self
    }

    pub fn memory_limit(mut self, megabytes: u64) -> Self {
        self.memory = megabytes;
        self
    }

    pub fn sleep(mut self, seconds: u64) -> Self {
        self.sleep = seconds;
        self
    }

    pub fn tries(mut self, attempts: u32) -> Self {
        self.tries = attempts.max(1);
        self
    }

    pub fn backoff(mut self, seconds: u64) -> Self {
        self.backoff = seconds;
        self
    }

    pub fn max_jobs(mut self, jobs: u64) -> Self {
        self.max_jobs = jobs;
        self
    }

    /// `max_jobs`, with zero meaning [`DEFAULT_MAX_JOBS`].
    pub fn effective_max_jobs(&self) -> u64 {
        if self.max_jobs == 0 {
            DEFAULT_MAX_JOBS
        } else {
            self.max_jobs
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_follow_config() {
        let options = WorkerOptions::default();
        assert_eq!(options.timeout, 60);
        assert_eq!(options.memory, 128);
        assert_eq!(options.sleep, 5);
        assert_eq!(options.tries, 3);
        assert_eq!(options.backoff, 60);
        assert_eq!(options.max_jobs, 1000);
    }

    #[test]
    fn test_zero_max_jobs_uses_default() {
        assert_eq!(WorkerOptions::default().max_jobs(0).effective_max_jobs(), 1000);
        assert_eq!(WorkerOptions::default().max_jobs(5).effective_max_jobs(), 5);
        assert_eq!(WorkerOptions::default().tries(0).tries, 1);
    }
}
