//! Process-scoped queue context.

use std::sync::{Arc, Mutex};

use crate::{JobRegistry, QueueConfig};

/// Owns everything that would otherwise be global state: configuration, the
/// job registry and the list of queue names. Built once per process and
/// shared with the manager, scheduler and workers.
pub struct QueueContext {
    config: QueueConfig,
    registry: JobRegistry,
    queues: Mutex<Vec<String>>,
}

impl QueueContext {
    pub fn new(config: QueueConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            registry: JobRegistry::new(),
            queues: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    /// Add a queue name at runtime.
    pub fn register_queue(&self, name: impl Into<String>) {
        let name = name.into();
        let mut queues = match self.queues.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if !queues.contains(&name) {
            queues.push(name);
        }
    }

    /// `default` first, then the configured default queue, configured queues
    /// and runtime additions, without duplicates.
    pub fn registered_queues(&self) -> Vec<String> {
        let dynamic = match self.queues.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };

        let mut all: Vec<String> = Vec::new();
        let candidates = std::iter::once("default".to_string())
            .chain(std::iter::once(self.config.default_queue.clone()))
            .chain(self.config.queues.iter().cloned())
            .chain(dynamic);
        for name in candidates {
            if !all.contains(&name) {
                all.push(name);
            }
        }
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registered_queues_dedup() {
        let ctx = QueueContext::new(QueueConfig::default());
        ctx.register_queue("emails");
        ctx.register_queue("high");
        ctx.register_queue("emails");

        assert_eq!(
            ctx.registered_queues(),
            vec!["default", "high", "low", "emails"]
        );
    }

    #[test]
    fn test_default_comes_first() {
        let config = QueueConfig {
            queues: vec!["low".to_string(), "default".to_string()],
            ..Default::default()
        };
        let ctx = QueueContext::new(config);
        assert_eq!(ctx.registered_queues(), vec!["default", "low"]);
    }
}
