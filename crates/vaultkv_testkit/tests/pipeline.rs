//! Middleware pipeline tests against a scripted backend.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use vaultkv_core::{
    ErrorDisposition, ErrorKind, Extension, OpResult, Operation, OperationContext, VaultError,
    VaultResult,
};
use vaultkv_testkit::prelude::*;

#[tokio::test]
async fn veto_stops_later_hooks_and_the_backend() {
    let vault = TestVault::memory().await;
    let log = HookLog::new();
    vault
        .register(VetoExtension::for_key("A", "admin").recording(log.clone()))
        .unwrap();
    vault
        .register(RecordingExtension::with_log("B", log.clone()))
        .unwrap();

    let err = vault.set("admin", json!({"role": "root"})).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    assert!(log.saw("A", Stage::Before, "admin"));
    assert!(!log.saw("B", Stage::Before, "admin"));
    assert!(!log.saw("B", Stage::After, "admin"));
    // Error hooks still run for every extension.
    assert_eq!(
        log.labels_for("admin"),
        vec!["a:before", "a:error", "b:error"]
    );
    assert_eq!(vault.backend.mutating_calls(), 0);
    assert_eq!(vault.backend.calls(Call::Get), 0);
    assert_eq!(vault.raw("admin"), None);
    assert_eq!(vault.latest_sequence(), 0);
}

#[tokio::test]
async fn other_keys_pass_the_veto() {
    let vault = TestVault::memory().await;
    let log = HookLog::new();
    vault
        .register(VetoExtension::for_key("A", "admin").recording(log.clone()))
        .unwrap();
    vault
        .register(RecordingExtension::with_log("B", log.clone()))
        .unwrap();

    vault.set("user", 1).await.unwrap();
    assert_eq!(
        log.labels_for("user"),
        vec!["a:before", "b:before", "b:after"]
    );
    assert_eq!(vault.backend.calls(Call::Put), 1);
}

#[tokio::test]
async fn vetoed_field_write_leaves_store_untouched() {
    let vault = TestVault::memory().await;
    vault.set("admin", "original").await.unwrap();
    vault
        .register(VetoExtension::new("readonly", |ctx| {
            matches!(ctx.operation, Operation::Set | Operation::Remove)
        }))
        .unwrap();

    let field = vault.field("admin");
    field.assign("changed");
    field.unset();
    assert_eq!(field.read().await.unwrap(), Some(json!("original")));

    let err = vault.remove("admin").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
}

#[tokio::test]
async fn backend_failure_reaches_error_hooks() {
    let vault = TestVault::memory().await;
    let recorder = RecordingExtension::new("rec");
    let log = recorder.log();
    vault.register(recorder).unwrap();

    vault.backend.fail_next(Call::Delete, "io");
    let err = vault.remove("k").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BackendIo);
    assert_eq!(log.labels_for("k"), vec!["rec:before", "rec:error"]);
}

/// Rewrites values on the way in and out, and stamps metadata.
struct Stamp;

#[async_trait]
impl Extension for Stamp {
    fn name(&self) -> &str {
        "stamp"
    }

    async fn before(&self, ctx: &mut OperationContext) -> VaultResult<()> {
        if ctx.operation == Operation::Set {
            let revision = ctx
                .previous_meta()
                .await?
                .and_then(|m| m["rev"].as_u64())
                .unwrap_or(0);
            ctx.meta = Some(json!({ "rev": revision + 1 }));
            ctx.value = ctx.value.take().map(|v| json!({ "wrapped": v }));
        }
        Ok(())
    }

    async fn after(&self, _ctx: &OperationContext, result: OpResult) -> VaultResult<OpResult> {
        Ok(match result {
            OpResult::Value(Some(mut v)) => OpResult::Value(v.get_mut("wrapped").map(|w| w.take())),
            other => other,
        })
    }
}

#[tokio::test]
async fn hooks_shape_stored_records() {
    let vault = TestVault::memory().await;
    vault.register(Stamp).unwrap();

    vault.set("k", "a").await.unwrap();
    vault.set("k", "b").await.unwrap();

    assert_eq!(vault.raw("k"), Some(json!({ "wrapped": "b" })));
    assert_eq!(vault.get("k").await.unwrap(), Some(json!("b")));
    assert_eq!(vault.get_meta("k").await.unwrap(), Some(json!({ "rev": 2 })));

    let last = vault.changes_since(0, 10).pop().unwrap();
    assert_eq!(last.meta, Some(json!({ "rev": 2 })));
}

/// Turns backend failures on reads into an empty result.
struct TolerantReads;

#[async_trait]
impl Extension for TolerantReads {
    fn name(&self) -> &str {
        "tolerant"
    }

    async fn error(&self, ctx: &OperationContext, err: &VaultError) -> ErrorDisposition {
        match (ctx.operation, err.kind()) {
            (Operation::Get, ErrorKind::BackendIo) => ErrorDisposition::Recover(OpResult::Value(None)),
            _ => ErrorDisposition::Propagate,
        }
    }
}

#[tokio::test]
async fn error_hook_recovers_reads_only() {
    let vault = TestVault::memory().await;
    vault.register(TolerantReads).unwrap();
    vault.set("k", 1).await.unwrap();

    vault.backend.fail_next(Call::Get, "flaky");
    assert_eq!(vault.get("k").await.unwrap(), None);
    assert_eq!(vault.get("k").await.unwrap(), Some(json!(1)));

    vault.backend.fail_next(Call::Count, "flaky");
    assert_eq!(vault.length().await.unwrap_err().kind(), ErrorKind::BackendIo);
}

#[tokio::test]
async fn register_hook_runs_once_in_order() {
    let vault = TestVault::memory().await;
    let log = HookLog::new();
    vault
        .register(RecordingExtension::with_log("first", log.clone()))
        .unwrap();
    vault
        .register(RecordingExtension::with_log("second", log.clone()))
        .unwrap();

    let registered: Vec<_> = log
        .calls()
        .into_iter()
        .filter(|c| c.stage == Stage::Register)
        .map(|c| c.extension)
        .collect();
    assert_eq!(registered, vec!["first", "second"]);
    assert_eq!(vault.extension_names(), vec!["first", "second"]);
}

async fn within<T>(future: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(2), future)
        .await
        .expect("operation did not settle")
}

/// Rejects a write once the store holds `limit` keys.
struct Quota {
    limit: u64,
}

#[async_trait]
impl Extension for Quota {
    fn name(&self) -> &str {
        "quota"
    }

    async fn before(&self, ctx: &mut OperationContext) -> VaultResult<()> {
        if ctx.operation != Operation::Set {
            return Ok(());
        }
        let key = ctx.key.clone().unwrap_or_default();
        let exists = ctx.vault().get(key).await?.is_some();
        if !exists && ctx.vault().length().await? >= self.limit {
            return Err(VaultError::validation("quota exceeded"));
        }
        Ok(())
    }
}

#[tokio::test]
async fn hooks_can_read_the_vault_they_run_in() {
    let vault = TestVault::memory().await;
    vault.register(Quota { limit: 2 }).unwrap();

    within(vault.set("a", 1)).await.unwrap();
    within(vault.set("b", 2)).await.unwrap();
    // Overwrites pass; a third key does not.
    within(vault.set("a", 3)).await.unwrap();
    let err = within(vault.set("c", 4)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    within(vault.clear()).await.unwrap();
    assert!(within(vault.keys()).await.unwrap().is_empty());
    assert_eq!(vault.pending_operations(), 0);
    assert!(!vault.has_clear_barrier());
}

#[tokio::test]
async fn hooks_read_around_queued_operations() {
    let vault = TestVault::memory().await;
    vault.register(Quota { limit: 10 }).unwrap();
    vault.backend.delay_next(Call::Put, [Duration::from_millis(30)]);

    // The second set and the clear are queued while the first set's hook
    // reads; neither may block it.
    let first = vault.set("a", 1);
    let second = vault.set("a", 2);
    let cleared = vault.clear();
    let third = vault.set("b", 3);

    within(first).await.unwrap();
    within(second).await.unwrap();
    within(cleared).await.unwrap();
    within(third).await.unwrap();
    assert_eq!(within(vault.keys()).await.unwrap(), vec!["b".to_owned()]);
    assert_eq!(vault.pending_operations(), 0);
}

/// Records what `get` returns for the key being written.
struct ReadBack(Arc<parking_lot::Mutex<Vec<Option<Value>>>>);

#[async_trait]
impl Extension for ReadBack {
    fn name(&self) -> &str {
        "read-back"
    }

    async fn before(&self, ctx: &mut OperationContext) -> VaultResult<()> {
        if let (Operation::Set, Some(key)) = (ctx.operation, ctx.key.clone()) {
            let current = ctx.vault().get(key).await?;
            self.0.lock().push(current);
        }
        Ok(())
    }
}

#[tokio::test]
async fn hook_reading_its_own_key_sees_the_stored_value() {
    let vault = TestVault::memory().await;
    let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
    vault.register(ReadBack(Arc::clone(&seen))).unwrap();

    within(vault.set("k", "one")).await.unwrap();
    let _ = vault.set("k", "two");
    within(vault.set("k", "three")).await.unwrap();

    assert_eq!(*seen.lock(), vec![None, Some(json!("one")), Some(json!("two"))]);
    assert_eq!(within(vault.get("k")).await.unwrap(), Some(json!("three")));
}

#[tokio::test]
async fn pre_image_is_read_at_most_once_per_set() {
    let vault = TestVault::memory().await;
    vault.register(Stamp).unwrap();
    vault.register(RecordingExtension::new("rec")).unwrap();

    vault.set("k", "a").await.unwrap();
    assert_eq!(vault.backend.calls(Call::Get), 1);

    // Without extensions a set goes straight to the backend.
    let plain = TestVault::memory().await;
    plain.set("k", "a").await.unwrap();
    assert_eq!(plain.backend.calls(Call::Get), 0);
}

/// Panics in `before` the first time it sees a `set`.
struct PanicOnce(AtomicBool);

#[async_trait]
impl Extension for PanicOnce {
    fn name(&self) -> &str {
        "panic-once"
    }

    async fn before(&self, ctx: &mut OperationContext) -> VaultResult<()> {
        if ctx.operation == Operation::Set && !self.0.swap(true, Ordering::SeqCst) {
            panic!("extension bug");
        }
        Ok(())
    }
}

#[tokio::test]
async fn panicking_hook_abandons_the_write_and_frees_the_key() {
    let vault = TestVault::memory().await;
    vault.set("k", "before").await.unwrap();
    vault.register(PanicOnce(AtomicBool::new(false))).unwrap();

    let err = within(vault.set("k", "lost")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Abandoned);
    assert_eq!(vault.pending_operations(), 0);
    assert_eq!(vault.raw("k"), Some(json!("before")));

    within(vault.set("k", "after")).await.unwrap();
    assert_eq!(within(vault.get("k")).await.unwrap(), Some(json!("after")));
    within(vault.clear()).await.unwrap();
    assert_eq!(within(vault.length()).await.unwrap(), 0);
}
