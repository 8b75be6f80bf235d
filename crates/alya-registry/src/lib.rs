//! Process-local processor registry (§4.D).
//!
//! Two string-keyed maps — `(app, op) → BatchProcessor` and
//! `(app, op) → SlowQueryProcessor` — plus `app → Initializer`. Registration
//! is idempotent-rejecting: a duplicate `(app, op)` pair returns
//! `RegistryError::ProcessorAlreadyRegistered` rather than silently
//! overwriting the first registration.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde_json::Value;

use alya_schemas::{ProcessorMessage, RowStatus, SlowQueryStatus};

/// A worker-lifetime resource handle a processor may reuse across rows.
/// Acquired once per worker per app on first use, closed on worker shutdown.
pub trait InitBlock: Any + Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn close(&self) {}
}

/// Type-safe by construction: a processor only ever receives the init block
/// its own initializer constructed, so the downcast never actually fails in
/// practice.
pub fn downcast_init_block<T: 'static>(block: &dyn InitBlock) -> Option<&T> {
    block.as_any().downcast_ref::<T>()
}

#[async_trait]
pub trait Initializer: Send + Sync {
    async fn init(&self, app: &str) -> Result<Box<dyn InitBlock>, String>;
}

/// Outcome of `BatchProcessor::do_batch_job` (§6).
pub struct BatchJobOutcome {
    pub status: RowStatus,
    pub result: Value,
    pub messages: Vec<ProcessorMessage>,
    pub blob_rows: std::collections::BTreeMap<String, Vec<u8>>,
}

/// Details passed to `MarkDone` after a batch is summarized (§4.D).
pub struct BatchDoneDetails {
    pub batch_id: uuid::Uuid,
    pub status: alya_schemas::BatchStatus,
    pub n_success: i64,
    pub n_failed: i64,
    pub n_aborted: i64,
}

#[async_trait]
pub trait BatchProcessor: Send + Sync {
    async fn do_batch_job(
        &self,
        init_block: Option<&dyn InitBlock>,
        batch_ctx: &Value,
        line: i64,
        input: &Value,
    ) -> BatchJobOutcome;

    /// Optional post-summarization hook. Errors are logged, not fatal.
    async fn mark_done(
        &self,
        _init_block: Option<&dyn InitBlock>,
        _batch_ctx: &Value,
        _details: &BatchDoneDetails,
    ) -> Result<(), String> {
        Ok(())
    }
}

/// Outcome of `SlowQueryProcessor::do_slow_query`. Shaped like
/// `BatchJobOutcome` — a slow query is a batch of exactly one row (§3), so
/// its single row is dispatched, finalized, and summarized through the same
/// pipeline a regular batch row goes through.
pub struct SlowQueryOutcome {
    pub status: SlowQueryStatus,
    pub result: Value,
    pub messages: Vec<ProcessorMessage>,
    pub blob_rows: std::collections::BTreeMap<String, Vec<u8>>,
}

#[async_trait]
pub trait SlowQueryProcessor: Send + Sync {
    async fn do_slow_query(
        &self,
        init_block: Option<&dyn InitBlock>,
        ctx: &Value,
        input: &Value,
    ) -> SlowQueryOutcome;
}

#[derive(Debug)]
pub enum RegistryError {
    ProcessorAlreadyRegistered,
    NoProcessor,
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::ProcessorAlreadyRegistered => {
                write!(f, "REGISTRY_ALREADY_REGISTERED: processor already registered for (app, op)")
            }
            RegistryError::NoProcessor => write!(f, "REGISTRY_NO_PROCESSOR: no processor registered"),
        }
    }
}

impl std::error::Error for RegistryError {}

fn key(app: &str, op: &str) -> String {
    format!("{app}\0{op}")
}

/// Engine-scoped registry, created alongside the `JobManager` — no
/// ambient/process-wide singleton (§9 design note).
#[derive(Default)]
pub struct Registry {
    batch_processors: RwLock<HashMap<String, Arc<dyn BatchProcessor>>>,
    slow_query_processors: RwLock<HashMap<String, Arc<dyn SlowQueryProcessor>>>,
    initializers: RwLock<HashMap<String, Arc<dyn Initializer>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_batch_processor(
        &self,
        app: &str,
        op: &str,
        processor: Arc<dyn BatchProcessor>,
    ) -> Result<(), RegistryError> {
        let mut map = self.batch_processors.write().unwrap();
        if map.contains_key(&key(app, op)) {
            return Err(RegistryError::ProcessorAlreadyRegistered);
        }
        map.insert(key(app, op), processor);
        Ok(())
    }

    pub fn register_slow_query_processor(
        &self,
        app: &str,
        op: &str,
        processor: Arc<dyn SlowQueryProcessor>,
    ) -> Result<(), RegistryError> {
        let mut map = self.slow_query_processors.write().unwrap();
        if map.contains_key(&key(app, op)) {
            return Err(RegistryError::ProcessorAlreadyRegistered);
        }
        map.insert(key(app, op), processor);
        Ok(())
    }

    pub fn register_initializer(
        &self,
        app: &str,
        initializer: Arc<dyn Initializer>,
    ) -> Result<(), RegistryError> {
        let mut map = self.initializers.write().unwrap();
        if map.contains_key(app) {
            return Err(RegistryError::ProcessorAlreadyRegistered);
        }
        map.insert(app.to_string(), initializer);
        Ok(())
    }

    pub fn batch_processor(&self, app: &str, op: &str) -> Option<Arc<dyn BatchProcessor>> {
        self.batch_processors.read().unwrap().get(&key(app, op)).cloned()
    }

    pub fn slow_query_processor(&self, app: &str, op: &str) -> Option<Arc<dyn SlowQueryProcessor>> {
        self.slow_query_processors
            .read()
            .unwrap()
            .get(&key(app, op))
            .cloned()
    }

    pub fn initializer(&self, app: &str) -> Option<Arc<dyn Initializer>> {
        self.initializers.read().unwrap().get(app).cloned()
    }
}

/// Per-worker cache of acquired init blocks, one per app, kept until worker
/// shutdown (§4.D, §4.F step 3).
#[derive(Default)]
pub struct InitBlockCache {
    blocks: std::sync::Mutex<HashMap<String, Arc<Box<dyn InitBlock>>>>,
}

impl InitBlockCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached init block for `app`, acquiring it via `registry`'s
    /// initializer on first use. Returns `Ok(None)` if no initializer is
    /// registered for `app` (processors without init needs are common).
    pub async fn get_or_init(
        &self,
        registry: &Registry,
        app: &str,
    ) -> Result<Option<Arc<Box<dyn InitBlock>>>, String> {
        if let Some(existing) = self.blocks.lock().unwrap().get(app).cloned() {
            return Ok(Some(existing));
        }
        let Some(initializer) = registry.initializer(app) else {
            return Ok(None);
        };
        let block = initializer.init(app).await?;
        let block = Arc::new(block);
        self.blocks.lock().unwrap().insert(app.to_string(), block.clone());
        Ok(Some(block))
    }

    /// Close every acquired init block. Called on worker shutdown.
    pub fn close_all(&self) {
        let mut blocks = self.blocks.lock().unwrap();
        for (_, block) in blocks.drain() {
            block.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopInitBlock;
    impl InitBlock for NoopInitBlock {
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    struct EchoProcessor;
    #[async_trait]
    impl BatchProcessor for EchoProcessor {
        async fn do_batch_job(
            &self,
            _init_block: Option<&dyn InitBlock>,
            _batch_ctx: &Value,
            _line: i64,
            _input: &Value,
        ) -> BatchJobOutcome {
            BatchJobOutcome {
                status: RowStatus::Success,
                result: Value::Null,
                messages: vec![],
                blob_rows: Default::default(),
            }
        }
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let registry = Registry::new();
        registry
            .register_batch_processor("t", "o", Arc::new(EchoProcessor))
            .unwrap();
        let err = registry
            .register_batch_processor("t", "o", Arc::new(EchoProcessor))
            .unwrap_err();
        assert!(matches!(err, RegistryError::ProcessorAlreadyRegistered));
    }

    #[test]
    fn distinct_op_does_not_collide() {
        let registry = Registry::new();
        registry
            .register_batch_processor("t", "o1", Arc::new(EchoProcessor))
            .unwrap();
        registry
            .register_batch_processor("t", "o2", Arc::new(EchoProcessor))
            .unwrap();
        assert!(registry.batch_processor("t", "o1").is_some());
        assert!(registry.batch_processor("t", "o2").is_some());
    }

    #[test]
    fn downcast_recovers_the_concrete_init_block() {
        struct Typed(u32);
        impl InitBlock for Typed {
            fn as_any(&self) -> &dyn Any {
                self
            }
        }
        let boxed: Box<dyn InitBlock> = Box::new(Typed(7));
        let recovered: &Typed = downcast_init_block(boxed.as_ref()).unwrap();
        assert_eq!(recovered.0, 7);
        let _ = NoopInitBlock;
    }
}
