//! Middleware pipeline.
//!
//! Every operation a [`Vault`] dispatches runs through the registered
//! extensions in registration order:
//!
//! 1. The context is built.
//! 2. `before` hooks run. An error skips the backend entirely. A hook that
//!    asks for the pre-image of a `set` triggers one backend read.
//! 3. For `set` with extensions registered, the pre-image is read if no
//!    hook asked for it yet, so `after` hooks see the record as it was.
//! 4. The one backend call matching the operation runs, then `after` hooks
//!    run, each receiving the result returned by the previous one.
//! 5. On any error, `error` hooks run and may replace the error or recover
//!    a result.

use crate::context::{OpResult, OperationContext};
use crate::error::{VaultError, VaultResult};
use crate::types::Operation;
use crate::vault::Vault;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, trace};
use vaultkv_storage::{Record, StorageBackend, StoreHandle};

/// What an `error` hook wants done with a failure.
#[derive(Debug)]
pub enum ErrorDisposition {
    /// Leave the current error in place.
    Propagate,
    /// Replace the current error. Later hooks see the replacement.
    Replace(VaultError),
    /// Stop error handling and complete the operation with this result.
    Recover(OpResult),
}

/// A named unit of behavior wrapped around every operation.
///
/// Every hook has a no-op default, so an extension implements only the
/// stages it cares about.
#[async_trait]
pub trait Extension: Send + Sync + 'static {
    /// Returns the extension name, used in logs and errors.
    fn name(&self) -> &str;

    /// Called once when the extension is registered.
    ///
    /// Failing here aborts the registration.
    fn on_register(&self, _vault: &Vault) -> VaultResult<()> {
        Ok(())
    }

    /// Runs before the backend call. Returning an error vetoes the operation.
    async fn before(&self, _ctx: &mut OperationContext) -> VaultResult<()> {
        Ok(())
    }

    /// Runs after a successful backend call and may transform its result.
    async fn after(&self, _ctx: &OperationContext, result: OpResult) -> VaultResult<OpResult> {
        Ok(result)
    }

    /// Runs when any earlier stage failed.
    async fn error(&self, _ctx: &OperationContext, _err: &VaultError) -> ErrorDisposition {
        ErrorDisposition::Propagate
    }
}

#[async_trait]
impl<E: Extension + ?Sized> Extension for Arc<E> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn on_register(&self, vault: &Vault) -> VaultResult<()> {
        (**self).on_register(vault)
    }

    async fn before(&self, ctx: &mut OperationContext) -> VaultResult<()> {
        (**self).before(ctx).await
    }

    async fn after(&self, ctx: &OperationContext, result: OpResult) -> VaultResult<OpResult> {
        (**self).after(ctx, result).await
    }

    async fn error(&self, ctx: &OperationContext, err: &VaultError) -> ErrorDisposition {
        (**self).error(ctx, err).await
    }
}

/// Ordered list of registered extensions.
#[derive(Default)]
pub(crate) struct Pipeline {
    extensions: RwLock<Vec<Arc<dyn Extension>>>,
}

impl Pipeline {
    pub(crate) fn push(&self, extension: Arc<dyn Extension>) -> usize {
        let mut extensions = self.extensions.write();
        extensions.push(extension);
        extensions.len()
    }

    pub(crate) fn names(&self) -> Vec<String> {
        self.extensions
            .read()
            .iter()
            .map(|e| e.name().to_owned())
            .collect()
    }

    /// Runs `ctx` through every stage and returns the final context with the
    /// outcome.
    pub(crate) async fn execute(
        &self,
        backend: &dyn StorageBackend,
        handle: &StoreHandle,
        mut ctx: OperationContext,
    ) -> (OperationContext, VaultResult<OpResult>) {
        // Extensions registered mid-flight apply from the next operation.
        let extensions: Vec<Arc<dyn Extension>> = self.extensions.read().clone();

        let result = match run(&extensions, backend, handle, &mut ctx).await {
            Ok(result) => Ok(result),
            Err(err) => handle_error(&extensions, &ctx, err).await,
        };

        match &result {
            Ok(_) => debug!(operation = %ctx.operation, key = ?ctx.key, "operation completed"),
            Err(err) => debug!(
                operation = %ctx.operation,
                key = ?ctx.key,
                error = %err,
                "operation failed"
            ),
        }
        (ctx, result)
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("extensions", &self.names())
            .finish()
    }
}

async fn run(
    extensions: &[Arc<dyn Extension>],
    backend: &dyn StorageBackend,
    handle: &StoreHandle,
    ctx: &mut OperationContext,
) -> VaultResult<OpResult> {
    for extension in extensions {
        trace!(extension = extension.name(), operation = %ctx.operation, "before");
        extension.before(ctx).await?;
    }

    if !extensions.is_empty() {
        ctx.load_previous().await?;
    }

    let mut result = invoke(backend, handle, ctx).await?;

    for extension in extensions {
        trace!(extension = extension.name(), operation = %ctx.operation, "after");
        result = extension.after(ctx, result).await?;
    }
    Ok(result)
}

async fn handle_error(
    extensions: &[Arc<dyn Extension>],
    ctx: &OperationContext,
    mut err: VaultError,
) -> VaultResult<OpResult> {
    for extension in extensions {
        trace!(extension = extension.name(), operation = %ctx.operation, "error");
        match extension.error(ctx, &err).await {
            ErrorDisposition::Propagate => {}
            ErrorDisposition::Replace(replacement) => err = replacement,
            ErrorDisposition::Recover(result) => {
                debug!(
                    extension = extension.name(),
                    operation = %ctx.operation,
                    error = %err,
                    "error recovered"
                );
                return Ok(result);
            }
        }
    }
    Err(err)
}

/// Makes the single backend call for the operation.
async fn invoke(
    backend: &dyn StorageBackend,
    handle: &StoreHandle,
    ctx: &OperationContext,
) -> VaultResult<OpResult> {
    let key = || {
        ctx.key
            .as_deref()
            .ok_or_else(|| VaultError::invalid_operation(format!("{} requires a key", ctx.operation)))
    };

    let result = match ctx.operation {
        Operation::Get => OpResult::Value(backend.get(handle, key()?).await?.map(|r| r.value)),
        Operation::GetMeta => {
            OpResult::Meta(backend.get(handle, key()?).await?.and_then(|r| r.meta))
        }
        Operation::Set => {
            let value = ctx
                .value
                .clone()
                .ok_or_else(|| VaultError::invalid_operation("set requires a value"))?;
            backend
                .put(handle, Record::new(key()?, value, ctx.meta.clone()))
                .await?;
            OpResult::Done
        }
        Operation::Remove => {
            backend.delete(handle, key()?).await?;
            OpResult::Done
        }
        Operation::Clear => {
            backend.clear(handle).await?;
            OpResult::Done
        }
        Operation::Keys => OpResult::Keys(backend.keys(handle).await?),
        Operation::Length => OpResult::Length(backend.count(handle).await?),
    };
    Ok(result)
}
