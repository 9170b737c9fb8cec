//! Conversation affinity and the compiled function registry.
//!
//! Two maps under one reader-writer lock:
//!
//! - `conv_to_engine`: which engine a conversation lives on. Assigned
//!   at first compile from a round-robin cursor and never reassigned
//!   until [`Registry::clean_all`], so every node of a conversation
//!   shares that engine's globals.
//! - `functions`: `(conversation, node)` to its compiled handle. A
//!   removed pair keeps its key with an empty handle, which is how a
//!   later run can distinguish "removed" from "never compiled".
//!
//! `run` holds the read lock across the whole engine call, so a
//! concurrent compile or remove cannot release a handle mid-invoke.
//! The write operations take the registry lock before the engine
//! lock; nothing ever takes them in the other order.

use crate::engines::EnginePool;
use crate::error::RegistryError;
use crate::watchdog::Watchdog;
use parking_lot::RwLock;
use skald_engine::{check_code, Callable, ModuleCache};
use skald_types::{ConvId, NodeId, PairKey};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Default)]
struct RegistryState {
    conv_to_engine: HashMap<ConvId, usize>,
    functions: HashMap<PairKey, Option<Callable>>,
    cursor: usize,
}

/// Compiled function registry over a fixed engine pool.
pub struct Registry {
    engines: Arc<EnginePool>,
    modules: Arc<ModuleCache>,
    watchdog: Arc<Watchdog>,
    memory_limit: Option<usize>,
    state: RwLock<RegistryState>,
}

impl Registry {
    /// Creates an empty registry over the given engines.
    #[must_use]
    pub fn new(
        engines: Arc<EnginePool>,
        modules: Arc<ModuleCache>,
        watchdog: Arc<Watchdog>,
        memory_limit: Option<usize>,
    ) -> Self {
        Self {
            engines,
            modules,
            watchdog,
            memory_limit,
            state: RwLock::new(RegistryState::default()),
        }
    }

    /// Compiles `source` for `(conv, node)`, replacing any previous
    /// function for that pair.
    ///
    /// The conversation's engine is assigned here on first compile.
    /// On failure nothing new is registered, but a previously
    /// compiled pair is left empty: its function was already released
    /// before compilation started.
    ///
    /// # Errors
    ///
    /// Compile errors from the engine.
    pub fn compile(
        &self,
        conv: &ConvId,
        node: &NodeId,
        source: &str,
    ) -> Result<(), RegistryError> {
        let pair = PairKey::new(conv.clone(), node.clone());
        let mut state = self.state.write();

        // Release the previous handle before recompiling.
        if let Some(slot) = state.functions.get_mut(&pair) {
            *slot = None;
        }

        let engine_index = match state.conv_to_engine.get(conv) {
            Some(&index) => index,
            None => {
                let index = state.cursor % self.engines.len();
                state.cursor = (state.cursor + 1) % self.engines.len();
                state.conv_to_engine.insert(conv.clone(), index);
                tracing::debug!(conv = %conv, engine = index, "conversation assigned");
                index
            }
        };

        let engine = self.engines.engine(engine_index);
        let guard = engine.lock();
        let chunk_name = format!("{conv}/{node}");
        let callable = guard.compile(&chunk_name, source)?;
        state.functions.insert(pair, Some(callable));
        Ok(())
    }

    /// Runs the compiled function of `(conv, node)` on a JSON payload.
    ///
    /// `worker` is the caller's worker index; the watchdog observes
    /// the run through that slot. The slot is cleared and the engine's
    /// termination flag reset before the engine lock is released.
    ///
    /// # Errors
    ///
    /// [`RegistryError::NotFoundPair`] for a pair that was never
    /// compiled, [`RegistryError::NotFunction`] for a removed pair,
    /// engine errors otherwise.
    pub fn run(
        &self,
        conv: &ConvId,
        node: &NodeId,
        payload: &str,
        worker: usize,
    ) -> Result<String, RegistryError> {
        let pair = PairKey::new(conv.clone(), node.clone());
        let state = self.state.read();

        let slot = state
            .functions
            .get(&pair)
            .ok_or_else(|| RegistryError::NotFoundPair(conv.clone(), node.clone()))?;
        let Some(callable) = slot else {
            return Err(RegistryError::NotFunction);
        };
        let engine_index = *state
            .conv_to_engine
            .get(conv)
            .ok_or_else(|| RegistryError::NotFoundPair(conv.clone(), node.clone()))?;

        let engine = self.engines.engine(engine_index);
        let guard = engine.lock();

        self.watchdog.mark_running(worker, engine_index);
        let result = guard.invoke(callable, payload);
        self.watchdog.mark_idle(worker);
        engine.clear_termination();

        Ok(result?)
    }

    /// Releases the function of `(conv, node)`, keeping the key.
    ///
    /// Idempotent; removing an unknown pair is a no-op.
    pub fn remove(&self, conv: &ConvId, node: &NodeId) {
        let mut state = self.state.write();
        if let Some(slot) = state.functions.get_mut(&PairKey::new(conv.clone(), node.clone())) {
            *slot = None;
        }
    }

    /// Validates a source on a disposable engine; nothing is
    /// registered and no pooled engine is touched.
    ///
    /// # Errors
    ///
    /// Compile errors, including instruction-budget exhaustion.
    pub fn check_code(&self, source: &str) -> Result<(), RegistryError> {
        check_code(source, &self.modules, self.memory_limit)?;
        Ok(())
    }

    /// Releases every function and clears all conversation
    /// assignments.
    pub fn clean_all(&self) {
        let mut state = self.state.write();
        let released = state.functions.len();
        state.functions.clear();
        state.conv_to_engine.clear();
        tracing::info!(released, "registry cleared");
    }

    /// Number of engines in the pool.
    #[must_use]
    pub fn engine_count(&self) -> usize {
        self.engines.len()
    }

    /// Number of conversations with an engine assignment.
    #[must_use]
    pub fn conv_count(&self) -> usize {
        self.state.read().conv_to_engine.len()
    }

    /// Number of registered pairs, empty handles included.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.state.read().functions.len()
    }

    /// The engine a conversation is pinned to, if assigned.
    #[must_use]
    pub fn engine_of(&self, conv: &ConvId) -> Option<usize> {
        self.state.read().conv_to_engine.get(conv).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watchdog::WatchdogConfig;
    use std::time::{Duration, Instant};

    fn registry_with(engines: usize) -> Registry {
        let dir = tempfile::tempdir().expect("tempdir");
        let modules = Arc::new(ModuleCache::load(dir.path()));
        let pool = Arc::new(EnginePool::new(engines, None, &modules).unwrap());
        let watchdog = Watchdog::spawn(
            Arc::clone(&pool),
            engines,
            WatchdogConfig {
                max_execution_time: Duration::from_millis(200),
                sleep_interval: Duration::from_millis(50),
            },
        )
        .unwrap();
        Registry::new(pool, modules, watchdog, None)
    }

    fn conv(s: &str) -> ConvId {
        ConvId::from(s)
    }

    fn node(s: &str) -> NodeId {
        NodeId::from(s)
    }

    #[test]
    fn run_before_compile_is_not_found() {
        let registry = registry_with(2);
        let err = registry.run(&conv("c"), &node("n"), "{}", 0).unwrap_err();
        assert!(matches!(err, RegistryError::NotFoundPair(..)));
        assert_eq!(err.to_string(), "Not found pair (c, n)");
    }

    #[test]
    fn compile_then_run() {
        let registry = registry_with(2);
        registry
            .compile(&conv("c"), &node("n"), "function(d) d.a = d.a + 1; return d end")
            .unwrap();
        let out = registry
            .run(&conv("c"), &node("n"), r#"{"a":1,"b":2}"#, 0)
            .unwrap();
        let json: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(json["a"], 2);
        assert_eq!(json["b"], 2);
    }

    #[test]
    fn removed_pair_is_not_function_not_not_found() {
        let registry = registry_with(2);
        registry
            .compile(&conv("c"), &node("n"), "function(d) return d end")
            .unwrap();
        registry.remove(&conv("c"), &node("n"));

        let err = registry.run(&conv("c"), &node("n"), "{}", 0).unwrap_err();
        assert!(matches!(err, RegistryError::NotFunction));

        // A second remove is a no-op.
        registry.remove(&conv("c"), &node("n"));
        // And removing something never compiled is fine too.
        registry.remove(&conv("x"), &node("y"));
    }

    #[test]
    fn recompile_wins() {
        let registry = registry_with(2);
        let c = conv("c");
        let n = node("n");
        registry.compile(&c, &n, "function(d) return 1 end").unwrap();
        registry.compile(&c, &n, "function(d) return 2 end").unwrap();
        assert_eq!(registry.run(&c, &n, "{}", 0).unwrap(), "2");
    }

    #[test]
    fn failed_recompile_leaves_pair_empty() {
        let registry = registry_with(2);
        let c = conv("c");
        let n = node("n");
        registry.compile(&c, &n, "function(d) return 1 end").unwrap();
        assert!(registry.compile(&c, &n, "function(d) nonsense syntax").is_err());

        // The old function is gone but the key survives.
        let err = registry.run(&c, &n, "{}", 0).unwrap_err();
        assert!(matches!(err, RegistryError::NotFunction));
    }

    #[test]
    fn failed_first_compile_registers_nothing() {
        let registry = registry_with(2);
        assert!(registry
            .compile(&conv("c"), &node("n"), "function(d) nonsense syntax")
            .is_err());
        let err = registry.run(&conv("c"), &node("n"), "{}", 0).unwrap_err();
        assert!(matches!(err, RegistryError::NotFoundPair(..)));
        assert_eq!(registry.node_count(), 0);
    }

    #[test]
    fn conversation_keeps_its_engine() {
        let registry = registry_with(2);
        registry
            .compile(&conv("c1"), &node("a"), "function(d) return d end")
            .unwrap();
        let assigned = registry.engine_of(&conv("c1")).unwrap();

        for i in 0..5 {
            registry
                .compile(&conv("c1"), &node(&format!("n{i}")), "function(d) return d end")
                .unwrap();
            assert_eq!(registry.engine_of(&conv("c1")), Some(assigned));
        }
    }

    #[test]
    fn conversations_round_robin_over_engines() {
        let registry = registry_with(2);
        for c in ["c1", "c2", "c3", "c4"] {
            registry
                .compile(&conv(c), &node("n"), "function(d) return d end")
                .unwrap();
        }
        assert_eq!(registry.engine_of(&conv("c1")), Some(0));
        assert_eq!(registry.engine_of(&conv("c2")), Some(1));
        assert_eq!(registry.engine_of(&conv("c3")), Some(0));
        assert_eq!(registry.engine_of(&conv("c4")), Some(1));
    }

    #[test]
    fn nodes_of_one_conversation_share_globals() {
        let registry = registry_with(2);
        let c = conv("c");
        registry
            .compile(&c, &node("setter"), "function(d) shared_flag = d.x; return d end")
            .unwrap();
        registry
            .compile(&c, &node("getter"), "function(d) return { seen = shared_flag } end")
            .unwrap();

        registry.run(&c, &node("setter"), r#"{"x":"hi"}"#, 0).unwrap();
        let out = registry.run(&c, &node("getter"), "{}", 0).unwrap();
        let json: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(json["seen"], "hi");
    }

    #[test]
    fn conversations_on_different_engines_are_isolated() {
        let registry = registry_with(2);
        // c1 -> engine 0, c2 -> engine 1.
        registry
            .compile(&conv("c1"), &node("n"), "function(d) leak = 'c1'; return d end")
            .unwrap();
        registry
            .compile(&conv("c2"), &node("n"), "function(d) return { seen = leak } end")
            .unwrap();

        registry.run(&conv("c1"), &node("n"), "{}", 0).unwrap();
        let out = registry.run(&conv("c2"), &node("n"), "{}", 0).unwrap();
        let json: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert!(json["seen"].is_null());
    }

    #[test]
    fn clean_all_resets_everything() {
        let registry = registry_with(2);
        registry
            .compile(&conv("c"), &node("n"), "function(d) return d end")
            .unwrap();
        assert_eq!(registry.conv_count(), 1);
        assert_eq!(registry.node_count(), 1);

        registry.clean_all();
        assert_eq!(registry.conv_count(), 0);
        assert_eq!(registry.node_count(), 0);
        let err = registry.run(&conv("c"), &node("n"), "{}", 0).unwrap_err();
        assert!(matches!(err, RegistryError::NotFoundPair(..)));
    }

    #[test]
    fn watchdog_terminates_a_runaway_run() {
        let registry = registry_with(1);
        registry
            .compile(&conv("c"), &node("loop"), "function(d) while true do end end")
            .unwrap();

        let started = Instant::now();
        let err = registry.run(&conv("c"), &node("loop"), "{}", 0).unwrap_err();
        assert!(matches!(
            err,
            RegistryError::Engine(skald_engine::EngineError::Terminated)
        ));
        // Budget 200ms + scan 50ms + safepoint slack.
        assert!(started.elapsed() < Duration::from_secs(5));

        // The engine is immediately reusable.
        registry
            .compile(&conv("c"), &node("ok"), "function(d) return d end")
            .unwrap();
        assert_eq!(registry.run(&conv("c"), &node("ok"), "{}", 0).unwrap(), "{}");
    }

    #[test]
    fn check_code_registers_nothing() {
        let registry = registry_with(1);
        registry.check_code("function(d) return d end").unwrap();
        assert_eq!(registry.node_count(), 0);
        assert_eq!(registry.conv_count(), 0);

        let err = registry.check_code("function(d) broken").unwrap_err();
        assert!(matches!(
            err,
            RegistryError::Engine(skald_engine::EngineError::Compile(_))
        ));
    }
}
