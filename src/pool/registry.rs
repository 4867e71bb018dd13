use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::any::TypeId;
use std::sync::Arc;

use crate::core::errors::{Result, WeftError};
use crate::sync::SyncContext;

/// Execution context handed to a worker class for the duration of one
/// invocation: the worker's identity and its view of the shared
/// synchronization domain.
pub struct WorkerContext {
    worker_id: u32,
    sync: SyncContext,
}

impl WorkerContext {
    pub(crate) fn new(worker_id: u32, sync: SyncContext) -> Self {
        Self { worker_id, sync }
    }

    pub fn worker_id(&self) -> u32 {
        self.worker_id
    }

    pub fn sync(&self) -> &SyncContext {
        &self.sync
    }
}

/// A class whose methods can be executed on pool workers.
///
/// Implementations are instantiated fresh for every invocation; nothing
/// survives between calls. `invoke` is the single dispatch entry point: the
/// worker dispatcher has already checked `method` against
/// [`methods`](WorkerClass::methods), so an implementation only matches on
/// the names it advertises.
#[async_trait]
pub trait WorkerClass: Send {
    /// Method names this class exposes to the RPC proxy and dispatcher
    fn methods(&self) -> &'static [&'static str];

    /// Run `method` with `args`, awaiting any asynchronous completion
    async fn invoke(
        &mut self,
        ctx: &WorkerContext,
        method: &str,
        args: Vec<Value>,
    ) -> anyhow::Result<Value>;
}

type Factory = Box<dyn Fn() -> Box<dyn WorkerClass> + Send + Sync>;

/// Registration record for one worker-executable class
pub struct ClassEntry {
    name: String,
    type_id: TypeId,
    methods: &'static [&'static str],
    factory: Factory,
}

impl ClassEntry {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    pub fn methods(&self) -> &'static [&'static str] {
        self.methods
    }

    pub fn has_method(&self, method: &str) -> bool {
        self.methods.contains(&method)
    }

    pub fn instantiate(&self) -> Box<dyn WorkerClass> {
        (self.factory)()
    }
}

/// Explicit name-to-constructor registry of worker-executable classes,
/// populated by static registration calls at process start. Shared between
/// the coordinator (proxy generation) and every worker (dispatch).
#[derive(Default)]
pub struct ClassRegistry {
    classes: DashMap<String, Arc<ClassEntry>>,
}

impl ClassRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `T` under `name`. Double registration of a name is a
    /// configuration error.
    pub fn register<T>(&self, name: impl Into<String>) -> Result<()>
    where
        T: WorkerClass + Default + 'static,
    {
        let name = name.into();
        if self.classes.contains_key(&name) {
            return Err(WeftError::configuration(format!(
                "Worker class '{}' is already registered",
                name
            )));
        }
        let methods = T::default().methods();
        let entry = ClassEntry {
            name: name.clone(),
            type_id: TypeId::of::<T>(),
            methods,
            factory: Box::new(|| Box::new(T::default())),
        };
        self.classes.insert(name, Arc::new(entry));
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.classes.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<Arc<ClassEntry>> {
        self.classes.get(name).map(|entry| Arc::clone(&entry))
    }

    pub fn names(&self) -> Vec<String> {
        self.classes.iter().map(|e| e.key().clone()).collect()
    }
}
