//! Extensions for observing and steering the pipeline in tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use vaultkv_core::{
    ErrorDisposition, Extension, OpResult, Operation, OperationContext, Vault, VaultError,
    VaultResult,
};

/// The hook stage a [`HookCall`] was recorded in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// `on_register`
    Register,
    /// `before`
    Before,
    /// `after`
    After,
    /// `error`
    Error,
}

/// One recorded hook invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookCall {
    /// Name of the extension that was called.
    pub extension: String,
    /// Stage of the call.
    pub stage: Stage,
    /// Operation being dispatched. `None` for [`Stage::Register`].
    pub operation: Option<Operation>,
    /// Key of the operation, if any.
    pub key: Option<String>,
}

/// A shared, ordered log of hook calls.
#[derive(Debug, Clone, Default)]
pub struct HookLog {
    calls: Arc<Mutex<Vec<HookCall>>>,
}

impl HookLog {
    /// Creates an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every recorded call in order.
    pub fn calls(&self) -> Vec<HookCall> {
        self.calls.lock().clone()
    }

    /// Returns `"<extension>:<stage>"` labels for calls touching `key`.
    pub fn labels_for(&self, key: &str) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.key.as_deref() == Some(key))
            .map(|c| format!("{}:{:?}", c.extension, c.stage).to_lowercase())
            .collect()
    }

    /// Returns true if `extension` ran `stage` for `key`.
    pub fn saw(&self, extension: &str, stage: Stage, key: &str) -> bool {
        self.calls.lock().iter().any(|c| {
            c.extension == extension && c.stage == stage && c.key.as_deref() == Some(key)
        })
    }

    /// Empties the log.
    pub fn clear(&self) {
        self.calls.lock().clear();
    }

    fn push(&self, extension: &str, stage: Stage, ctx: Option<&OperationContext>) {
        self.calls.lock().push(HookCall {
            extension: extension.to_owned(),
            stage,
            operation: ctx.map(|c| c.operation),
            key: ctx.and_then(|c| c.key.clone()),
        });
    }
}

/// Records every hook call into a [`HookLog`] and changes nothing.
#[derive(Debug, Clone)]
pub struct RecordingExtension {
    name: String,
    log: HookLog,
}

impl RecordingExtension {
    /// Creates a recorder with its own log.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_log(name, HookLog::new())
    }

    /// Creates a recorder writing into a shared log.
    pub fn with_log(name: impl Into<String>, log: HookLog) -> Self {
        Self {
            name: name.into(),
            log,
        }
    }

    /// Returns the log this recorder writes to.
    pub fn log(&self) -> HookLog {
        self.log.clone()
    }
}

#[async_trait]
impl Extension for RecordingExtension {
    fn name(&self) -> &str {
        &self.name
    }

    fn on_register(&self, _vault: &Vault) -> VaultResult<()> {
        self.log.push(&self.name, Stage::Register, None);
        Ok(())
    }

    async fn before(&self, ctx: &mut OperationContext) -> VaultResult<()> {
        self.log.push(&self.name, Stage::Before, Some(ctx));
        Ok(())
    }

    async fn after(&self, ctx: &OperationContext, result: OpResult) -> VaultResult<OpResult> {
        self.log.push(&self.name, Stage::After, Some(ctx));
        Ok(result)
    }

    async fn error(&self, ctx: &OperationContext, _err: &VaultError) -> ErrorDisposition {
        self.log.push(&self.name, Stage::Error, Some(ctx));
        ErrorDisposition::Propagate
    }
}

type Predicate = dyn Fn(&OperationContext) -> bool + Send + Sync;

/// Rejects matching operations in its `before` hook with a validation error.
pub struct VetoExtension {
    name: String,
    predicate: Box<Predicate>,
    log: Option<HookLog>,
}

impl VetoExtension {
    /// Vetoes every operation for which `predicate` returns true.
    pub fn new(
        name: impl Into<String>,
        predicate: impl Fn(&OperationContext) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            predicate: Box::new(predicate),
            log: None,
        }
    }

    /// Vetoes every operation on `key`.
    pub fn for_key(name: impl Into<String>, key: impl Into<String>) -> Self {
        let key = key.into();
        Self::new(name, move |ctx| ctx.key.as_deref() == Some(key.as_str()))
    }

    /// Also records hook calls into `log`.
    #[must_use]
    pub fn recording(mut self, log: HookLog) -> Self {
        self.log = Some(log);
        self
    }
}

impl std::fmt::Debug for VetoExtension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VetoExtension")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Extension for VetoExtension {
    fn name(&self) -> &str {
        &self.name
    }

    async fn before(&self, ctx: &mut OperationContext) -> VaultResult<()> {
        if let Some(log) = &self.log {
            log.push(&self.name, Stage::Before, Some(ctx));
        }
        if (self.predicate)(ctx) {
            return Err(VaultError::validation(format!(
                "{} vetoed {} on {:?}",
                self.name, ctx.operation, ctx.key
            )));
        }
        Ok(())
    }

    async fn error(&self, ctx: &OperationContext, _err: &VaultError) -> ErrorDisposition {
        if let Some(log) = &self.log {
            log.push(&self.name, Stage::Error, Some(ctx));
        }
        ErrorDisposition::Propagate
    }
}
