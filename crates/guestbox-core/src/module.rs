//! WebAssembly module compilation and caching.
//!
//! This module provides:
//! - [`CompiledModule`]: a Wasmtime [`Module`] tagged with the engine that
//!   compiled it and a content hash of the original bytes
//! - [`ModuleCache`]: compile-once cache keyed by `(engine id, content hash)`
//!
//! Compiled artifacts are not portable across engines, so two engines that
//! compile the same bytes each get their own entry. Entries live for the
//! lifetime of the cache and are only dropped by [`ModuleCache::clear`].

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::Instant;

use dashmap::DashMap;
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument};
use wasmtime::Module;

use crate::WasmEngine;
use guestbox_common::RuntimeError;

static GLOBAL_CACHE: LazyLock<ModuleCache> = LazyLock::new(ModuleCache::new);

/// A compiled WebAssembly module.
///
/// # Thread Safety
///
/// `CompiledModule` is thread-safe and can be shared across multiple instances.
/// The underlying Wasmtime module is also thread-safe.
#[derive(Clone)]
pub struct CompiledModule {
    /// The compiled Wasmtime module.
    inner: Module,

    /// SHA-256 of the original Wasm bytes, hex encoded.
    content_hash: String,

    /// Id of the engine that produced the machine code.
    engine_id: u64,

    /// When this module was compiled.
    compiled_at: Instant,
}

impl CompiledModule {
    /// Compile a core module from WebAssembly bytes.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Compile`] if the bytes are not a valid module
    /// for this engine.
    #[instrument(skip(engine, bytes), fields(engine_id = engine.id(), bytes_len = bytes.len()))]
    pub fn from_bytes(engine: &WasmEngine, bytes: &[u8]) -> Result<Self, RuntimeError> {
        let start = Instant::now();

        Self::validate_wasm_header(bytes)?;

        let module = Module::new(engine.inner(), bytes)
            .map_err(|e| RuntimeError::compile(format!("Core module compilation failed: {e}")))?;

        let content_hash = compute_hash(bytes);

        info!(
            content_hash = %content_hash,
            duration_ms = start.elapsed().as_millis(),
            "Core module compiled"
        );

        Ok(Self {
            inner: module,
            content_hash,
            engine_id: engine.id(),
            compiled_at: Instant::now(),
        })
    }

    /// Compile a core module from WAT (WebAssembly Text Format).
    ///
    /// This is primarily for testing purposes.
    ///
    /// # Errors
    ///
    /// Returns an error if compilation fails.
    #[instrument(skip(engine, wat), fields(engine_id = engine.id()))]
    pub fn from_wat(engine: &WasmEngine, wat: &str) -> Result<Self, RuntimeError> {
        let start = Instant::now();

        let module = Module::new(engine.inner(), wat)
            .map_err(|e| RuntimeError::compile(format!("WAT compilation failed: {e}")))?;

        let content_hash = compute_hash(wat.as_bytes());

        info!(
            content_hash = %content_hash,
            duration_ms = start.elapsed().as_millis(),
            "WAT module compiled"
        );

        Ok(Self {
            inner: module,
            content_hash,
            engine_id: engine.id(),
            compiled_at: Instant::now(),
        })
    }

    /// Compile from either a binary module or WAT text.
    ///
    /// Text is recognised by a leading `(` after whitespace; anything else
    /// goes through [`from_bytes`](Self::from_bytes).
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Compile`] if the source does not compile.
    pub fn from_source(engine: &WasmEngine, source: &[u8]) -> Result<Self, RuntimeError> {
        match std::str::from_utf8(source) {
            Ok(text) if text.trim_start().starts_with('(') => Self::from_wat(engine, text),
            _ => Self::from_bytes(engine, source),
        }
    }

    /// Get the inner Wasmtime module.
    pub fn inner(&self) -> &Module {
        &self.inner
    }

    /// Get the content hash of the original Wasm bytes.
    pub fn content_hash(&self) -> &str {
        &self.content_hash
    }

    /// Id of the engine this module was compiled for.
    pub fn engine_id(&self) -> u64 {
        self.engine_id
    }

    /// Get when this module was compiled.
    pub fn compiled_at(&self) -> Instant {
        self.compiled_at
    }

    /// Whether the module exports a function called `name`.
    pub fn exports_func(&self, name: &str) -> bool {
        self.inner
            .get_export(name)
            .is_some_and(|ty| ty.func().is_some())
    }

    /// Validate WebAssembly header (magic number).
    fn validate_wasm_header(bytes: &[u8]) -> Result<(), RuntimeError> {
        if bytes.len() < 8 {
            return Err(RuntimeError::compile("Invalid Wasm: file too small"));
        }

        // Check magic number: \0asm
        if &bytes[0..4] != b"\0asm" {
            return Err(RuntimeError::compile("Invalid Wasm: bad magic number"));
        }

        Ok(())
    }
}

impl std::fmt::Debug for CompiledModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledModule")
            .field("content_hash", &self.content_hash)
            .field("engine_id", &self.engine_id)
            .finish_non_exhaustive()
    }
}

/// Compile-once cache of guest modules.
///
/// Concurrent first-time compilations of the same `(engine, bytes)` pair
/// collapse into one: the map entry stays locked while the compiler runs,
/// and the other callers receive the finished module.
#[derive(Default)]
pub struct ModuleCache {
    modules: DashMap<(u64, String), Arc<CompiledModule>>,
    compilations: AtomicUsize,
}

impl ModuleCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide cache used by the runtime.
    pub fn global() -> &'static ModuleCache {
        &GLOBAL_CACHE
    }

    /// Return the module for `bytes` on `engine`, compiling it on first use.
    ///
    /// `bytes` may be a binary module or WAT text.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Compile`] if the bytes do not compile. Failed
    /// compilations are not cached.
    pub fn compile(
        &self,
        engine: &WasmEngine,
        bytes: &[u8],
    ) -> Result<Arc<CompiledModule>, RuntimeError> {
        let key = (engine.id(), compute_hash(bytes));

        if let Some(module) = self.modules.get(&key) {
            debug!(engine_id = key.0, content_hash = %key.1, "Module cache hit");
            return Ok(Arc::clone(module.value()));
        }

        let entry = self.modules.entry(key).or_try_insert_with(|| {
            self.compilations.fetch_add(1, Ordering::Relaxed);
            CompiledModule::from_source(engine, bytes).map(Arc::new)
        })?;

        Ok(Arc::clone(entry.value()))
    }

    /// Drop every cached module.
    ///
    /// Instances created from a dropped module stay valid until they are
    /// closed; the next [`compile`](Self::compile) recompiles.
    pub fn clear(&self) {
        let dropped = self.modules.len();
        self.modules.clear();
        debug!(dropped, "Module cache cleared");
    }

    /// Drop every module compiled by the engine with id `engine_id`.
    ///
    /// Called when the engine's owner shuts down, so the cache does not keep
    /// the engine alive. Returns the number of modules dropped.
    pub fn evict_engine(&self, engine_id: u64) -> usize {
        let before = self.modules.len();
        self.modules.retain(|(id, _), _| *id != engine_id);
        let dropped = before.saturating_sub(self.modules.len());
        debug!(engine_id, dropped, "Evicted engine from module cache");
        dropped
    }

    /// Number of cached modules compiled by the engine with id `engine_id`.
    pub fn engine_len(&self, engine_id: u64) -> usize {
        self.modules.iter().filter(|entry| entry.key().0 == engine_id).count()
    }

    /// Number of cached modules.
    pub fn len(&self) -> usize {
        self.modules.len()
    }

    /// Returns `true` if nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Number of times the compiler actually ran.
    pub fn compilations(&self) -> usize {
        self.compilations.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for ModuleCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleCache")
            .field("modules", &self.modules.len())
            .field("compilations", &self.compilations())
            .finish()
    }
}

/// Clear the process-wide module cache.
pub fn clear_cache() {
    ModuleCache::global().clear();
}

/// Compute the SHA-256 of the given bytes as lowercase hex.
fn compute_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}
