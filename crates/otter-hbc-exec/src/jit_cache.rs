use std::sync::Arc;

use otter_hbc::BcProvider;
use otter_hbc_jit::{CompiledFunction, JitCompiler, JitConfig, JitError};
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};

/// `(module_id, function_index)`
pub type FunctionKey = (u64, u32);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
/// Snapshot of JIT cache counters for diagnostics.
pub struct JitStats {
    /// Compilations attempted.
    pub compile_requests: u64,
    /// Compilations that produced code.
    pub compile_successes: u64,
    /// Compilations rejected for an unsupported instruction.
    pub unsupported: u64,
    /// Compilations that failed for any other reason.
    pub compile_errors: u64,
    /// Lookups answered from the cache.
    pub cache_hits: u64,
    /// Functions currently cached.
    pub compiled_functions: u64,
    /// Functions currently marked do-not-JIT.
    pub dont_jit_functions: u64,
}

#[derive(Default)]
struct CacheState {
    compiled: FxHashMap<FunctionKey, Arc<CompiledFunction>>,
    dont_jit: FxHashSet<FunctionKey>,
    call_counts: FxHashMap<FunctionKey, u32>,
    compile_requests: u64,
    compile_successes: u64,
    unsupported: u64,
    compile_errors: u64,
    cache_hits: u64,
}

/// Compiled code and tiering state for every function the interpreter runs.
pub struct JitCache {
    compiler: JitCompiler,
    state: Mutex<CacheState>,
}

impl Default for JitCache {
    fn default() -> Self {
        Self::new()
    }
}

impl JitCache {
    /// Cache configured from the environment.
    pub fn new() -> Self {
        Self::with_config(JitConfig::from_env())
    }

    /// Cache with an explicit configuration.
    pub fn with_config(config: JitConfig) -> Self {
        Self {
            compiler: JitCompiler::with_config(config),
            state: Mutex::new(CacheState::default()),
        }
    }

    /// Active configuration.
    pub fn config(&self) -> &JitConfig {
        self.compiler.config()
    }

    /// Counts one call. Returns `true` once the function has reached the hot
    /// threshold and is still a compile candidate.
    pub fn record_call(&self, module_id: u64, function_index: u32) -> bool {
        let config = self.config();
        if !config.enabled {
            return false;
        }
        let key = (module_id, function_index);
        let mut state = self.state.lock();
        if state.dont_jit.contains(&key) {
            return false;
        }
        let count = state.call_counts.entry(key).or_insert(0);
        *count = count.saturating_add(1);
        *count >= config.hot_threshold
    }

    /// Cached code for `function_index`, compiling it on first request.
    ///
    /// A function that fails to compile is marked do-not-JIT and keeps
    /// returning `None`. With `crash_on_error` the failure panics instead.
    pub fn get_or_compile(
        &self,
        module_id: u64,
        provider: &BcProvider,
        function_index: u32,
    ) -> Option<Arc<CompiledFunction>> {
        if !self.config().enabled {
            return None;
        }
        let key = (module_id, function_index);
        {
            let mut state = self.state.lock();
            if state.dont_jit.contains(&key) {
                return None;
            }
            if let Some(code) = state.compiled.get(&key).cloned() {
                state.cache_hits = state.cache_hits.saturating_add(1);
                return Some(code);
            }
            state.compile_requests = state.compile_requests.saturating_add(1);
        }

        // Compile without holding the lock; a racing compile of the same key
        // keeps whichever result lands first.
        let result = self.compiler.compile_function(provider, function_index);

        let mut state = self.state.lock();
        match result {
            Ok(compiled) => {
                state.compile_successes = state.compile_successes.saturating_add(1);
                let code = state
                    .compiled
                    .entry(key)
                    .or_insert_with(|| Arc::new(compiled))
                    .clone();
                Some(code)
            }
            Err(err) => {
                if self.config().crash_on_error {
                    panic!("JIT compile of function {function_index} in module {module_id} failed: {err}");
                }
                if matches!(err, JitError::UnsupportedInstruction { .. }) {
                    state.unsupported = state.unsupported.saturating_add(1);
                } else {
                    state.compile_errors = state.compile_errors.saturating_add(1);
                    tracing::warn!(
                        target: "otter::jit::exec",
                        module_id,
                        function_index,
                        error = %err,
                        "jit compile error"
                    );
                }
                self.mark_dont_jit_locked(&mut state, key, &err);
                None
            }
        }
    }

    fn mark_dont_jit_locked(&self, state: &mut CacheState, key: FunctionKey, reason: &JitError) {
        state.dont_jit.insert(key);
        state.call_counts.remove(&key);
        if self.config().verbose {
            tracing::info!(
                target: "otter::jit::exec",
                module_id = key.0,
                function_index = key.1,
                reason = %reason,
                "marked do-not-jit"
            );
        } else {
            tracing::debug!(
                target: "otter::jit::exec",
                module_id = key.0,
                function_index = key.1,
                reason = %reason,
                "marked do-not-jit"
            );
        }
    }

    /// Whether the function previously failed to compile.
    pub fn is_marked_dont_jit(&self, module_id: u64, function_index: u32) -> bool {
        self.state.lock().dont_jit.contains(&(module_id, function_index))
    }

    /// Cached code, without compiling.
    pub fn get(&self, module_id: u64, function_index: u32) -> Option<Arc<CompiledFunction>> {
        self.state.lock().compiled.get(&(module_id, function_index)).cloned()
    }

    /// Forgets everything about `module_id`: code, marks and counters.
    /// Returns how many compiled functions were dropped.
    ///
    /// Code still referenced by a caller stays alive until its `Arc` drops.
    pub fn invalidate_module(&self, module_id: u64) -> usize {
        let mut state = self.state.lock();
        let before = state.compiled.len();
        state.compiled.retain(|key, _| key.0 != module_id);
        state.dont_jit.retain(|key| key.0 != module_id);
        state.call_counts.retain(|key, _| key.0 != module_id);
        before - state.compiled.len()
    }

    /// Current counters.
    pub fn stats_snapshot(&self) -> JitStats {
        let state = self.state.lock();
        JitStats {
            compile_requests: state.compile_requests,
            compile_successes: state.compile_successes,
            unsupported: state.unsupported,
            compile_errors: state.compile_errors,
            cache_hits: state.cache_hits,
            compiled_functions: state.compiled.len() as u64,
            dont_jit_functions: state.dont_jit.len() as u64,
        }
    }

    /// Counters as pretty-printed JSON.
    pub fn stats_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(&self.stats_snapshot())
    }
}

impl Drop for JitCache {
    fn drop(&mut self) {
        if !self.config().stats {
            return;
        }
        match self.stats_json() {
            Ok(json) => tracing::info!(target: "otter::jit::exec", stats = %json, "jit stats"),
            Err(err) => tracing::warn!(target: "otter::jit::exec", error = %err, "jit stats"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use otter_hbc::{BytecodeFunctionGenerator, BytecodeModuleGenerator, BytecodeSerializer, Opcode, Operand};

    fn config() -> JitConfig {
        JitConfig {
            hot_threshold: 3,
            ..JitConfig::default()
        }
    }

    /// Function 0 compiles; function 1 uses an unsupported opcode.
    fn provider() -> BcProvider {
        let mut m = BytecodeModuleGenerator::new();

        let mut ok = BytecodeFunctionGenerator::new(2);
        ok.emit(Opcode::LoadConstUInt8, &[Operand::Reg(0), Operand::UInt(4)]).unwrap();
        ok.emit(Opcode::Inc, &[Operand::Reg(1), Operand::Reg(0)]).unwrap();
        ok.emit(Opcode::Ret, &[Operand::Reg(1)]).unwrap();
        m.add_function(ok.finish().unwrap());

        let mut bad = BytecodeFunctionGenerator::new(1);
        bad.emit(Opcode::NewObject, &[Operand::Reg(0)]).unwrap();
        bad.emit(Opcode::Ret, &[Operand::Reg(0)]).unwrap();
        m.add_function(bad.finish().unwrap());

        let bytes = BytecodeSerializer::default().serialize(&m.generate()).unwrap();
        BcProvider::create_from_buffer(bytes).unwrap()
    }

    #[test]
    fn calls_reach_the_threshold() {
        let cache = JitCache::with_config(config());
        assert!(!cache.record_call(1, 0));
        assert!(!cache.record_call(1, 0));
        assert!(cache.record_call(1, 0));
        assert!(cache.record_call(1, 0));
        assert!(!cache.record_call(1, 1));
    }

    #[test]
    fn compiles_once_then_hits() {
        let cache = JitCache::with_config(config());
        let provider = provider();

        let first = cache.get_or_compile(7, &provider, 0).unwrap();
        let second = cache.get_or_compile(7, &provider, 0).unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        let stats = cache.stats_snapshot();
        assert_eq!(stats.compile_requests, 1);
        assert_eq!(stats.compile_successes, 1);
        assert_eq!(stats.cache_hits, 1);
        assert_eq!(stats.compiled_functions, 1);
    }

    #[test]
    fn failures_are_remembered() {
        let cache = JitCache::with_config(config());
        let provider = provider();

        assert!(cache.get_or_compile(7, &provider, 1).is_none());
        assert!(cache.is_marked_dont_jit(7, 1));
        assert!(cache.get_or_compile(7, &provider, 1).is_none());
        for _ in 0..10 {
            assert!(!cache.record_call(7, 1));
        }

        let stats = cache.stats_snapshot();
        assert_eq!(stats.compile_requests, 1);
        assert_eq!(stats.unsupported, 1);
        assert_eq!(stats.compile_errors, 0);
        assert_eq!(stats.dont_jit_functions, 1);
    }

    #[test]
    #[should_panic(expected = "JIT compile of function 1")]
    fn crash_on_error_panics() {
        let cache = JitCache::with_config(JitConfig {
            crash_on_error: true,
            ..config()
        });
        cache.get_or_compile(7, &provider(), 1);
    }

    #[test]
    fn disabled_cache_does_nothing() {
        let cache = JitCache::with_config(JitConfig {
            enabled: false,
            ..config()
        });
        for _ in 0..5 {
            assert!(!cache.record_call(1, 0));
        }
        assert!(cache.get_or_compile(1, &provider(), 0).is_none());
        assert_eq!(cache.stats_snapshot(), JitStats::default());
    }

    #[test]
    fn invalidation_is_per_module() {
        let cache = JitCache::with_config(config());
        let provider = provider();
        cache.get_or_compile(1, &provider, 0).unwrap();
        cache.get_or_compile(1, &provider, 1);
        cache.get_or_compile(2, &provider, 0).unwrap();

        assert_eq!(cache.invalidate_module(1), 1);
        assert!(cache.get(1, 0).is_none());
        assert!(!cache.is_marked_dont_jit(1, 1));
        assert!(cache.get(2, 0).is_some());
        assert_eq!(cache.invalidate_module(1), 0);
    }

    #[test]
    fn stats_render_as_json() {
        let cache = JitCache::with_config(config());
        cache.get_or_compile(3, &provider(), 0);
        let json: serde_json::Value = serde_json::from_str(&cache.stats_json().unwrap()).unwrap();
        assert_eq!(json["compile_successes"], 1);
        assert_eq!(json["unsupported"], 0);
    }
}
