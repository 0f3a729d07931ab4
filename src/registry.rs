//! Kind → handler table.

use std::collections::HashMap;
use std::sync::Arc;

use osbuild_worker_api::JobKind;
use osbuild_worker_api::Lane;

use crate::handler::JobHandler;

#[derive(Clone, Default)]
pub struct Registry {
    handlers: HashMap<JobKind, Arc<dyn JobHandler>>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry").field("kinds", &self.kinds()).finish()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `kind`, replacing any previous one.
    pub fn register(&mut self, kind: JobKind, handler: Arc<dyn JobHandler>) -> &mut Self {
        self.handlers.insert(kind, handler);
        self
    }

    pub fn get(&self, kind: JobKind) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(&kind).cloned()
    }

    /// Registered kinds, in lane order.
    pub fn kinds(&self) -> Vec<JobKind> {
        JobKind::ALL.into_iter().filter(|k| self.handlers.contains_key(k)).collect()
    }

    /// Registered kinds a lane claims.
    pub fn kinds_for(&self, lane: Lane) -> Vec<JobKind> {
        lane.kinds().into_iter().filter(|k| self.handlers.contains_key(k)).collect()
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::handler::JobContext;
    use crate::handler::Outcome;

    struct Nop;

    #[async_trait]
    impl JobHandler for Nop {
        async fn run(&self, _ctx: &JobContext) -> Outcome {
            Outcome {
                result: serde_json::json!({}),
                job_error: None,
            }
        }
    }

    #[test]
    fn test_kinds_for_lane() {
        let mut registry = Registry::new();
        registry
            .register(JobKind::Depsolve, Arc::new(Nop))
            .register(JobKind::KojiFinalize, Arc::new(Nop))
            .register(JobKind::FileResolve, Arc::new(Nop));

        assert_eq!(registry.kinds_for(Lane::Depsolve), vec![JobKind::Depsolve]);
        assert!(registry.kinds_for(Lane::Build).is_empty());
        assert_eq!(registry.kinds_for(Lane::CopyShare), vec![JobKind::KojiFinalize]);
        assert_eq!(registry.kinds_for(Lane::Misc), vec![JobKind::FileResolve]);
        assert!(registry.get(JobKind::Osbuild).is_none());
        assert_eq!(registry.kinds().len(), 3);
    }
}
