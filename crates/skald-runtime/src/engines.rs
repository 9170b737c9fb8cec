//! The fixed engine array.
//!
//! One engine per worker thread, created at startup and disposed at
//! shutdown. The array itself is immutable; which conversation lands
//! on which engine is decided by the registry.

use skald_engine::{EngineError, ModuleCache, ScriptEngine};
use std::sync::Arc;

/// Fixed set of script engines.
#[derive(Debug)]
pub struct EnginePool {
    engines: Vec<Arc<ScriptEngine>>,
}

impl EnginePool {
    /// Creates `count` engines sharing one module cache.
    ///
    /// # Errors
    ///
    /// Any engine construction failure; fatal to the service.
    pub fn new(
        count: usize,
        memory_limit: Option<usize>,
        modules: &Arc<ModuleCache>,
    ) -> Result<Self, EngineError> {
        let count = count.max(1);
        let mut engines = Vec::with_capacity(count);
        for index in 0..count {
            engines.push(Arc::new(ScriptEngine::new(
                index,
                memory_limit,
                Arc::clone(modules),
            )?));
        }
        tracing::info!(engines = count, "engine pool ready");
        Ok(Self { engines })
    }

    /// The engine at `index`. Indices come from the registry's
    /// conversation assignment and are always in range.
    #[must_use]
    pub fn engine(&self, index: usize) -> &Arc<ScriptEngine> {
        &self.engines[index]
    }

    /// Number of engines.
    #[must_use]
    pub fn len(&self) -> usize {
        self.engines.len()
    }

    /// Always false; the pool holds at least one engine.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.engines.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn modules() -> Arc<ModuleCache> {
        let dir = tempfile::tempdir().expect("tempdir");
        Arc::new(ModuleCache::load(dir.path()))
    }

    #[test]
    fn engines_are_indexed_in_order() {
        let pool = EnginePool::new(3, None, &modules()).unwrap();
        assert_eq!(pool.len(), 3);
        for i in 0..3 {
            assert_eq!(pool.engine(i).index(), i);
        }
    }

    #[test]
    fn zero_requested_engines_still_yields_one() {
        let pool = EnginePool::new(0, None, &modules()).unwrap();
        assert_eq!(pool.len(), 1);
    }
}
