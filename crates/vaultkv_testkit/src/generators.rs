//! Property-based test generators using proptest.
//!
//! Provides strategies for keys, JSON values and unawaited operation
//! sequences, plus a reference model to check a vault against.

use proptest::prelude::*;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use vaultkv_core::{Vault, VaultResult};

/// Strategy for generating valid keys.
pub fn key_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z][a-z0-9_]{0,11}").expect("Invalid regex")
}

/// Strategy for keys drawn from a small pool, so sequences collide often.
pub fn hot_key_strategy() -> impl Strategy<Value = String> {
    prop::sample::select(vec!["a", "b", "c"]).prop_map(str::to_owned)
}

/// Strategy for generating arbitrary JSON values of bounded depth.
pub fn json_value_strategy() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(Value::from),
        "[ -~]{0,16}".prop_map(Value::String),
    ];
    leaf.prop_recursive(2, 16, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
            prop::collection::vec(("[a-z]{1,6}", inner), 0..4)
                .prop_map(|pairs| Value::Object(pairs.into_iter().collect::<Map<_, _>>())),
        ]
    })
}

/// One operation in a generated sequence.
#[derive(Debug, Clone, PartialEq)]
pub enum VaultOp {
    /// `set(key, value)`
    Set(String, Value),
    /// `remove(key)`
    Remove(String),
    /// `clear()`
    Clear,
}

impl VaultOp {
    /// Issues the operation on `vault` without awaiting it.
    pub fn issue(&self, vault: &Vault) -> Pin<Box<dyn Future<Output = VaultResult<()>> + Send>> {
        match self {
            Self::Set(key, value) => vault.set(key.clone(), value.clone()),
            Self::Remove(key) => vault.remove(key.clone()),
            Self::Clear => vault.clear(),
        }
    }

    /// Applies the operation to a reference model.
    pub fn apply(&self, model: &mut BTreeMap<String, Value>) {
        match self {
            Self::Set(key, value) => {
                model.insert(key.clone(), value.clone());
            }
            Self::Remove(key) => {
                model.remove(key);
            }
            Self::Clear => model.clear(),
        }
    }
}

/// Strategy for a single operation on the hot key pool.
pub fn vault_op_strategy() -> impl Strategy<Value = VaultOp> {
    prop_oneof![
        6 => (hot_key_strategy(), json_value_strategy()).prop_map(|(k, v)| VaultOp::Set(k, v)),
        2 => hot_key_strategy().prop_map(VaultOp::Remove),
        1 => Just(VaultOp::Clear),
    ]
}

/// Strategy for operation sequences.
pub fn vault_ops_strategy(max_len: usize) -> impl Strategy<Value = Vec<VaultOp>> {
    prop::collection::vec(vault_op_strategy(), 1..max_len)
}

/// Builds the model state after applying `ops` in order.
pub fn model_after(ops: &[VaultOp]) -> BTreeMap<String, Value> {
    let mut model = BTreeMap::new();
    for op in ops {
        op.apply(&mut model);
    }
    model
}
