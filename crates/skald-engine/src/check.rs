//! One-shot code validation.
//!
//! `check_code` compiles and evaluates a chunk on a disposable VM so
//! callers can validate sources without registering anything. The VM
//! gets the same `print`/`require` hooks as pooled engines but runs
//! under a hard instruction budget instead of the watchdog, so a
//! runaway chunk cannot pin a worker.

use crate::convert::format_lua_error;
use crate::engine::install_globals;
use crate::error::EngineError;
use crate::modules::ModuleCache;
use mlua::{HookTriggers, Lua, Value};
use std::sync::Arc;

/// Instruction budget for a validation run.
pub const MAX_CHECK_INSTRUCTIONS: u32 = 10_000_000;

/// Compiles and evaluates `source` on a fresh, throwaway VM.
///
/// The VM is dropped on return; nothing is registered.
///
/// # Errors
///
/// [`EngineError::Compile`] on syntax errors, evaluation errors, and
/// budget exhaustion; [`EngineError::Init`] when the VM itself cannot
/// be set up.
pub fn check_code(
    source: &str,
    modules: &Arc<ModuleCache>,
    memory_limit: Option<usize>,
) -> Result<(), EngineError> {
    let lua = Lua::new();
    if let Some(bytes) = memory_limit {
        lua.set_memory_limit(bytes).map_err(EngineError::Init)?;
    }
    install_globals(&lua, modules).map_err(EngineError::Init)?;

    lua.set_hook(
        HookTriggers::new().every_nth_instruction(MAX_CHECK_INSTRUCTIONS),
        |_lua, _debug| {
            Err(mlua::Error::RuntimeError(format!(
                "instruction limit exceeded ({MAX_CHECK_INSTRUCTIONS})"
            )))
        },
    );

    lua.load(source)
        .set_name("check")
        .eval::<Value>()
        .map_err(|e| EngineError::Compile(format_lua_error(&e)))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn modules() -> Arc<ModuleCache> {
        let dir = tempfile::tempdir().expect("tempdir");
        Arc::new(ModuleCache::load(dir.path()))
    }

    #[test]
    fn valid_function_chunk_passes() {
        assert!(check_code("function(d) return d end", &modules(), None).is_ok());
    }

    #[test]
    fn syntax_error_is_reported() {
        let err = check_code("function(d) for lettttt i=0 do", &modules(), None).unwrap_err();
        assert!(matches!(err, EngineError::Compile(_)));
    }

    #[test]
    fn runaway_chunk_hits_the_budget() {
        // The chunk itself loops, not the function it defines.
        let err = check_code("while true do end", &modules(), None).unwrap_err();
        match err {
            EngineError::Compile(msg) => {
                assert!(msg.contains("instruction limit"), "got: {msg}");
            }
            other => panic!("expected compile error, got {other:?}"),
        }
    }

    #[test]
    fn nothing_persists_between_checks() {
        assert!(check_code("leak = 1; return function(d) return d end", &modules(), None).is_ok());
        assert!(check_code("assert(leak == nil); return function(d) return d end", &modules(), None).is_ok());
    }
}
