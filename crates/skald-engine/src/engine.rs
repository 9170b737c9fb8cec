//! Sandboxed script engine.
//!
//! One [`ScriptEngine`] is one Lua VM. The VM is not thread-safe, so
//! every compile and invoke goes through [`ScriptEngine::lock`]; the
//! returned [`EngineGuard`] is the only way to reach the VM, which
//! makes the at-most-one-script-per-engine rule a compile-time fact.
//!
//! Termination is cooperative: [`ScriptEngine::terminate`] is a plain
//! atomic store that any thread may issue, and a VM hook checks the
//! flag every [`KILL_CHECK_INTERVAL`] instructions. A running chunk
//! aborts at the next check with an error the caller maps to the
//! terminated status. The flag stays set until the lock holder calls
//! [`ScriptEngine::clear_termination`], after the watchdog slot for
//! the run has been cleared, so a late terminate cannot leak into the
//! engine's next run.
//!
//! Two native hooks are installed in the global scope:
//!
//! - `print(...)`: stdout diagnostic; tables are JSON-stringified.
//! - `require(name)`: serves the preloaded [`ModuleCache`] by
//!   verbatim name; an uncached name raises a Lua error, which
//!   surfaces as a compile or run error of the requesting script.

use crate::convert::{display_value, format_lua_error, json_to_lua, lua_to_json};
use crate::error::EngineError;
use crate::modules::ModuleCache;
use mlua::{Function, HookTriggers, Lua, MultiValue, RegistryKey, Value, VmState};
use parking_lot::{Mutex, MutexGuard};
use serde_json::Value as JsonValue;
use std::io::Write as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Instructions between termination-flag checks.
///
/// Bounds the safepoint latency of a terminate: a tight Lua loop runs
/// at most this many instructions past the flag store.
pub const KILL_CHECK_INTERVAL: u32 = 10_000;

/// A compiled function handle.
///
/// The function lives in the registry of the engine that compiled it
/// and must only ever be invoked through that engine's guard.
pub struct Callable {
    key: RegistryKey,
}

impl std::fmt::Debug for Callable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Callable")
    }
}

/// One sandboxed Lua VM plus its termination flag.
pub struct ScriptEngine {
    index: usize,
    lua: Mutex<Lua>,
    kill: Arc<AtomicBool>,
}

impl std::fmt::Debug for ScriptEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptEngine")
            .field("index", &self.index)
            .field("terminating", &self.kill.load(Ordering::Relaxed))
            .finish()
    }
}

impl ScriptEngine {
    /// Creates a VM with hooks installed and an optional memory limit.
    ///
    /// # Errors
    ///
    /// [`EngineError::Init`] when the VM rejects the memory limit or a
    /// hook cannot be installed. Construction failures are fatal to
    /// the service.
    pub fn new(
        index: usize,
        memory_limit: Option<usize>,
        modules: Arc<ModuleCache>,
    ) -> Result<Self, EngineError> {
        let lua = Lua::new();
        if let Some(bytes) = memory_limit {
            lua.set_memory_limit(bytes).map_err(EngineError::Init)?;
        }
        install_globals(&lua, &modules).map_err(EngineError::Init)?;

        let kill = Arc::new(AtomicBool::new(false));
        install_kill_hook(&lua, Arc::clone(&kill));

        tracing::debug!(engine = index, "script engine created");
        Ok(Self {
            index,
            lua: Mutex::new(lua),
            kill,
        })
    }

    /// Stable index of this engine within the pool.
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Acquires the engine lock.
    pub fn lock(&self) -> EngineGuard<'_> {
        EngineGuard {
            lua: self.lua.lock(),
            engine: self,
        }
    }

    /// Requests termination of whatever is running on this engine.
    ///
    /// Callable from any thread, idempotent, never blocks. The running
    /// chunk aborts at its next instruction-count safepoint.
    pub fn terminate(&self) {
        if !self.kill.swap(true, Ordering::SeqCst) {
            tracing::debug!(engine = self.index, "termination requested");
        }
    }

    /// True while a terminate has been requested and not yet cleared.
    #[must_use]
    pub fn termination_pending(&self) -> bool {
        self.kill.load(Ordering::SeqCst)
    }

    /// Clears the termination flag.
    ///
    /// Must be called by the lock holder after the watchdog slot for
    /// the finished run has been cleared.
    pub fn clear_termination(&self) {
        self.kill.store(false, Ordering::SeqCst);
    }
}

/// Exclusive access to one engine's VM.
pub struct EngineGuard<'a> {
    lua: MutexGuard<'a, Lua>,
    engine: &'a ScriptEngine,
}

impl EngineGuard<'_> {
    /// Compiles a chunk expected to evaluate to a function.
    ///
    /// The chunk is evaluated once; its value is pinned in the VM
    /// registry and returned as a [`Callable`].
    ///
    /// # Errors
    ///
    /// [`EngineError::Compile`] on a syntax error, an error raised
    /// while evaluating the chunk, or a chunk whose value is not a
    /// function.
    pub fn compile(&self, name: &str, source: &str) -> Result<Callable, EngineError> {
        let value: Value = self
            .lua
            .load(source)
            .set_name(name)
            .eval()
            .map_err(|e| EngineError::Compile(format_lua_error(&e)))?;

        let Value::Function(func) = value else {
            return Err(EngineError::Compile(
                "chunk did not evaluate to a function".into(),
            ));
        };

        // Reclaim registry slots of handles dropped since the last compile.
        self.lua.expire_registry_values();

        let key = self
            .lua
            .create_registry_value(func)
            .map_err(|e| EngineError::Compile(format_lua_error(&e)))?;
        Ok(Callable { key })
    }

    /// Invokes a compiled function on a JSON payload.
    ///
    /// The payload is parsed before any user code runs; the result is
    /// JSON-stringified.
    ///
    /// # Errors
    ///
    /// [`EngineError::BadInput`] for unparseable payloads,
    /// [`EngineError::Terminated`] when the run was aborted by a
    /// terminate, [`EngineError::Runtime`] for script errors and
    /// unserializable results.
    pub fn invoke(&self, callable: &Callable, payload: &str) -> Result<String, EngineError> {
        let json: JsonValue = serde_json::from_str(payload).map_err(|_| EngineError::BadInput)?;

        let func: Function = self
            .lua
            .registry_value(&callable.key)
            .map_err(|e| EngineError::Runtime(format_lua_error(&e)))?;
        let arg = json_to_lua(&self.lua, &json)
            .map_err(|e| EngineError::Runtime(format_lua_error(&e)))?;

        match func.call::<Value>(arg) {
            Ok(value) => {
                let result =
                    lua_to_json(value).map_err(|e| EngineError::Runtime(format_lua_error(&e)))?;
                serde_json::to_string(&result).map_err(|e| EngineError::Runtime(e.to_string()))
            }
            Err(e) => {
                if self.engine.termination_pending() {
                    Err(EngineError::Terminated)
                } else {
                    Err(EngineError::Runtime(format_lua_error(&e)))
                }
            }
        }
    }
}

/// Installs the `print` and `require` hooks in the VM's global scope.
pub(crate) fn install_globals(lua: &Lua, modules: &Arc<ModuleCache>) -> Result<(), mlua::Error> {
    let print = lua.create_function(|_, args: MultiValue| {
        let parts: Vec<String> = args.iter().map(display_value).collect();
        let mut out = std::io::stdout().lock();
        let _ = writeln!(out, "{}", parts.join(" "));
        Ok(())
    })?;
    lua.globals().set("print", print)?;

    let cache = Arc::clone(modules);
    let require = lua.create_function(move |lua, name: String| {
        let source = cache
            .lookup_for_require(&name)
            .map_err(|e| mlua::Error::RuntimeError(e.to_string()))?;
        lua.load(&source).set_name(name.as_str()).eval::<Value>()
    })?;
    lua.globals().set("require", require)?;

    Ok(())
}

/// Installs the termination-flag safepoint hook.
fn install_kill_hook(lua: &Lua, kill: Arc<AtomicBool>) {
    lua.set_hook(
        HookTriggers::new().every_nth_instruction(KILL_CHECK_INTERVAL),
        move |_lua, _debug| {
            if kill.load(Ordering::Relaxed) {
                Err(mlua::Error::RuntimeError("script execution terminated".into()))
            } else {
                Ok(VmState::Continue)
            }
        },
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::Duration;

    fn empty_cache() -> Arc<ModuleCache> {
        let dir = tempfile::tempdir().expect("tempdir");
        Arc::new(ModuleCache::load(dir.path()))
    }

    fn engine() -> ScriptEngine {
        ScriptEngine::new(0, None, empty_cache()).expect("engine")
    }

    #[test]
    fn compile_and_invoke() {
        let engine = engine();
        let guard = engine.lock();
        let callable = guard
            .compile("t", "function(d) d.a = d.a + 1; return d end")
            .unwrap();
        let out = guard
            .invoke(&callable, r#"{"a":1,"b":2,"arr":[1,2,3]}"#)
            .unwrap();
        let json: JsonValue = serde_json::from_str(&out).unwrap();
        assert_eq!(json["a"], 2);
        assert_eq!(json["b"], 2);
        assert_eq!(json["arr"], serde_json::json!([1, 2, 3]));
    }

    #[test]
    fn syntax_error_is_compile_error() {
        let engine = engine();
        let err = engine
            .lock()
            .compile("t", "function(d) for lettttt i=0 do end")
            .unwrap_err();
        assert!(matches!(err, EngineError::Compile(_)));
    }

    #[test]
    fn non_function_chunk_is_compile_error() {
        let engine = engine();
        let err = engine.lock().compile("t", "1 + 1").unwrap_err();
        assert!(matches!(err, EngineError::Compile(_)));
    }

    #[test]
    fn bad_payload_never_reaches_user_code() {
        let engine = engine();
        let guard = engine.lock();
        let callable = guard
            .compile("t", "function(d) error('must not run') end")
            .unwrap();
        let err = guard.invoke(&callable, "{not json}").unwrap_err();
        assert!(matches!(err, EngineError::BadInput));
    }

    #[test]
    fn script_error_is_runtime_error() {
        let engine = engine();
        let guard = engine.lock();
        let callable = guard.compile("t", "function(d) error('boom') end").unwrap();
        let err = guard.invoke(&callable, "{}").unwrap_err();
        match err {
            EngineError::Runtime(msg) => assert!(msg.contains("boom"), "got: {msg}"),
            other => panic!("expected runtime error, got {other:?}"),
        }
    }

    #[test]
    fn terminate_aborts_a_running_script() {
        let engine = Arc::new(engine());
        let guard = engine.lock();
        let callable = guard
            .compile("t", "function(d) while true do end end")
            .unwrap();

        let killer = {
            let engine = Arc::clone(&engine);
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(50));
                engine.terminate();
                engine.terminate(); // idempotent
            })
        };

        let err = guard.invoke(&callable, "{}").unwrap_err();
        assert!(matches!(err, EngineError::Terminated));
        killer.join().unwrap();

        // After the flag is cleared the engine is reusable.
        engine.clear_termination();
        let callable = guard.compile("t", "function(d) return d end").unwrap();
        assert_eq!(guard.invoke(&callable, r#"{"x":1}"#).unwrap(), r#"{"x":1}"#);
    }

    #[test]
    fn require_serves_the_module_cache() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(dir.path().join("libs")).unwrap();
        fs::write(
            dir.path().join("libs/util.lua"),
            "local m = {}\nfunction m.double(x) return x * 2 end\nreturn m",
        )
        .unwrap();
        let modules = Arc::new(ModuleCache::load(dir.path()));

        let engine = ScriptEngine::new(0, None, modules).expect("engine");
        let guard = engine.lock();
        let callable = guard
            .compile(
                "t",
                "function(d) local util = require('libs/util.lua'); d.v = util.double(d.v); return d end",
            )
            .unwrap();
        let out = guard.invoke(&callable, r#"{"v":21}"#).unwrap();
        let json: JsonValue = serde_json::from_str(&out).unwrap();
        assert_eq!(json["v"], 42);
    }

    #[test]
    fn require_of_uncached_module_is_a_runtime_error() {
        let engine = engine();
        let guard = engine.lock();
        let callable = guard
            .compile("t", "function(d) require('nope/missing.lua'); return d end")
            .unwrap();
        let err = guard.invoke(&callable, "{}").unwrap_err();
        match err {
            EngineError::Runtime(msg) => {
                assert!(msg.contains("Don't have cache"), "got: {msg}");
            }
            other => panic!("expected runtime error, got {other:?}"),
        }
    }

    #[test]
    fn recompile_replaces_behavior() {
        let engine = engine();
        let guard = engine.lock();
        let first = guard.compile("t", "function(d) return 1 end").unwrap();
        assert_eq!(guard.invoke(&first, "{}").unwrap(), "1");
        drop(first);
        let second = guard.compile("t", "function(d) return 2 end").unwrap();
        assert_eq!(guard.invoke(&second, "{}").unwrap(), "2");
    }

    #[test]
    fn print_is_installed() {
        let engine = engine();
        let guard = engine.lock();
        let callable = guard
            .compile("t", "function(d) print('diag', d, 1); return d end")
            .unwrap();
        assert!(guard.invoke(&callable, r#"{"k":"v"}"#).is_ok());
    }

    #[test]
    fn engines_share_state_within_one_vm() {
        let engine = engine();
        let guard = engine.lock();
        let setter = guard
            .compile("a", "function(d) shared = d.x; return d end")
            .unwrap();
        let getter = guard
            .compile("b", "function(d) return { seen = shared } end")
            .unwrap();
        guard.invoke(&setter, r#"{"x":"hello"}"#).unwrap();
        let out = guard.invoke(&getter, "{}").unwrap();
        let json: JsonValue = serde_json::from_str(&out).unwrap();
        assert_eq!(json["seen"], "hello");
    }
}
