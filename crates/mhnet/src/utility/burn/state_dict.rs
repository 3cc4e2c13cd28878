//! # Module State Dicts
//!
//! A [`StateDict`] is a flat ``dotted.key -> parameter`` view of a module's
//! record; built by serializing the record item with `serde_json`.
//!
//! Any [`Record`] can be flattened, not only the record of a live module;
//! a record loaded from foreign weights flattens to the same keys as the
//! module it mirrors, and [`merge_state_dicts`] then filters it.
//!
//! Key paths follow the module tree:
//! * struct fields contribute their field name,
//! * `Vec` entries contribute their index,
//! * enum modules contribute their variant name,
//! * constant fields (and absent optional modules) contribute nothing.
//!
//! So a basic-block trunk yields keys like ``trunk.stem.conv.weight`` and
//! ``trunk.layers.1.blocks.0.Basic.downsample.norm.gamma``.

use anyhow::Context;
use burn::module::Module;
use burn::prelude::Backend;
use burn::record::{FullPrecisionSettings, Record};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};

const PARAM_ID_KEY: &str = "id";
const PARAM_VALUE_KEY: &str = "param";
const SHAPE_KEY: &str = "shape";

/// A single serialized parameter.
///
/// Wraps the serialized tensor data of a ``Param``; the parameter id is not
/// part of the entry, and is preserved from the target module on load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParamEntry(pub Value);

impl ParamEntry {
    /// The tensor shape of the entry, if it has one.
    pub fn shape(&self) -> Option<Vec<usize>> {
        find_shape(&self.0)
    }
}

fn find_shape(value: &Value) -> Option<Vec<usize>> {
    match value {
        Value::Object(obj) => match obj.get(SHAPE_KEY) {
            Some(Value::Array(dims)) => dims
                .iter()
                .map(|d| d.as_u64().map(|d| d as usize))
                .collect(),
            _ => obj.values().find_map(find_shape),
        },
        _ => None,
    }
}

/// Flat ``key -> parameter`` mapping.
pub type StateDict = BTreeMap<String, ParamEntry>;

fn is_param_leaf(obj: &Map<String, Value>) -> bool {
    obj.len() == 2 && obj.contains_key(PARAM_ID_KEY) && obj.contains_key(PARAM_VALUE_KEY)
}

fn join_key(
    prefix: &str,
    part: &str,
) -> String {
    if prefix.is_empty() {
        part.to_string()
    } else {
        format!("{prefix}.{part}")
    }
}

fn flatten_into(
    prefix: &str,
    value: Value,
    dict: &mut StateDict,
) {
    match value {
        Value::Object(mut obj) if is_param_leaf(&obj) => {
            if let Some(param) = obj.remove(PARAM_VALUE_KEY) {
                dict.insert(prefix.to_string(), ParamEntry(param));
            }
        }
        Value::Object(obj) => {
            for (k, v) in obj {
                flatten_into(&join_key(prefix, &k), v, dict);
            }
        }
        Value::Array(items) => {
            for (idx, v) in items.into_iter().enumerate() {
                flatten_into(&join_key(prefix, &idx.to_string()), v, dict);
            }
        }
        _ => (),
    }
}

fn overlay(
    prefix: &str,
    value: &mut Value,
    dict: &StateDict,
) {
    match value {
        Value::Object(obj) if is_param_leaf(obj) => {
            if let Some(entry) = dict.get(prefix) {
                obj.insert(PARAM_VALUE_KEY.to_string(), entry.0.clone());
            }
        }
        Value::Object(obj) => {
            for (k, v) in obj.iter_mut() {
                overlay(&join_key(prefix, k), v, dict);
            }
        }
        Value::Array(items) => {
            for (idx, v) in items.iter_mut().enumerate() {
                overlay(&join_key(prefix, &idx.to_string()), v, dict);
            }
        }
        _ => (),
    }
}

fn record_value<B: Backend, R: Record<B>>(record: R) -> anyhow::Result<Value> {
    let item = record.into_item::<FullPrecisionSettings>();
    serde_json::to_value(&item).context("serializing module record")
}

/// Build the [`StateDict`] of a record.
pub fn record_state_dict<B: Backend, R: Record<B>>(record: R) -> anyhow::Result<StateDict> {
    let mut dict = StateDict::new();
    flatten_into("", record_value(record)?, &mut dict);
    Ok(dict)
}

/// Build the [`StateDict`] of a module.
pub fn state_dict<B: Backend, M: Module<B>>(module: &M) -> anyhow::Result<StateDict> {
    record_state_dict::<B, _>(module.clone().into_record())
}

/// Load parameter values from a [`StateDict`] into a module.
///
/// Only keys present in `dict` are replaced; every other parameter keeps its
/// current value. Parameter ids are taken from the module, not the dict.
///
/// # Returns
///
/// The reloaded module.
pub fn load_state_dict<B: Backend, M: Module<B>>(
    module: M,
    dict: &StateDict,
) -> anyhow::Result<M> {
    let device = module.devices().into_iter().next().unwrap_or_default();

    let mut value = record_value::<B, _>(module.clone().into_record())?;
    overlay("", &mut value, dict);

    let item: <M::Record as Record<B>>::Item<FullPrecisionSettings> =
        serde_json::from_value(value).context("rebuilding module record")?;
    let record = M::Record::from_item(item, &device);

    Ok(module.load_record(record))
}

/// The result of [`merge_state_dicts`].
#[derive(Debug, Clone, Default)]
pub struct StateDictMerge {
    /// The fresh dict, with every compatible checkpoint entry overlaid.
    pub merged: StateDict,

    /// Checkpoint keys with no counterpart in the model.
    pub unexpected: BTreeSet<String>,

    /// Model keys left at their fresh values.
    pub missing: BTreeSet<String>,

    /// Keys present in both, with different shapes; not loaded.
    pub mismatched: BTreeSet<String>,
}

impl StateDictMerge {
    /// The number of entries taken from the checkpoint.
    pub fn loaded(&self) -> usize {
        self.merged.len() - self.missing.len()
    }
}

/// Leniently overlay a checkpoint onto a fresh state dict.
///
/// Entries absent from `fresh`, or whose shape differs from the fresh
/// entry, are dropped and reported.
pub fn merge_state_dicts(
    checkpoint: &StateDict,
    fresh: &StateDict,
) -> StateDictMerge {
    let mut merge = StateDictMerge {
        merged: fresh.clone(),
        ..Default::default()
    };

    for (key, entry) in checkpoint {
        match fresh.get(key) {
            None => {
                merge.unexpected.insert(key.clone());
            }
            Some(current) if current.shape() != entry.shape() => {
                merge.mismatched.insert(key.clone());
            }
            Some(_) => {
                merge.merged.insert(key.clone(), entry.clone());
            }
        }
    }

    merge.missing = fresh
        .keys()
        .filter(|key| !checkpoint.contains_key(*key) || merge.mismatched.contains(*key))
        .cloned()
        .collect();

    merge
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::resnet::downsample::{ConvDownsample, ConvDownsampleConfig};
    use burn::backend::NdArray;
    use burn::nn::{Linear, LinearConfig};
    use burn::tensor::Tensor;
    use serde_json::json;

    fn entry(shape: &[usize]) -> ParamEntry {
        ParamEntry(json!({ "bytes": [], "shape": shape, "dtype": "F32" }))
    }

    #[test]
    fn test_param_entry_shape() {
        assert_eq!(entry(&[4, 3]).shape(), Some(vec![4, 3]));
        assert_eq!(ParamEntry(json!({"inner": {"shape": [2]}})).shape(), Some(vec![2]));
        assert_eq!(ParamEntry(json!(null)).shape(), None);
    }

    #[test]
    fn test_state_dict_keys() {
        type B = NdArray;
        let device = Default::default();

        let linear: Linear<B> = LinearConfig::new(4, 3).init(&device);
        let dict = state_dict(&linear).unwrap();
        assert_eq!(
            dict.keys().cloned().collect::<Vec<_>>(),
            vec!["bias".to_string(), "weight".to_string()]
        );
        assert_eq!(dict["weight"].shape(), Some(vec![4, 3]));
        assert_eq!(dict["bias"].shape(), Some(vec![3]));

        let block: ConvDownsample<B> = ConvDownsampleConfig::new(2, 4).init(&device);
        let dict = state_dict(&block).unwrap();
        assert_eq!(dict.len(), 5);
        for key in [
            "conv.weight",
            "norm.gamma",
            "norm.beta",
            "norm.running_mean",
            "norm.running_var",
        ] {
            assert!(dict.contains_key(key), "missing {key}: {:?}", dict.keys());
        }
        assert_eq!(dict["conv.weight"].shape(), Some(vec![4, 2, 1, 1]));
    }

    #[test]
    fn test_load_state_dict_partial() {
        type B = NdArray;
        let device = Default::default();

        let source: Linear<B> = LinearConfig::new(4, 3).init(&device);
        let target: Linear<B> = LinearConfig::new(4, 3).init(&device);
        let target_bias = target.bias.as_ref().unwrap().val();

        let mut dict = state_dict(&source).unwrap();
        dict.remove("bias");

        let target = load_state_dict(target, &dict).unwrap();

        target
            .weight
            .val()
            .to_data()
            .assert_eq(&source.weight.val().to_data(), true);
        target
            .bias
            .as_ref()
            .unwrap()
            .val()
            .to_data()
            .assert_eq(&target_bias.to_data(), true);

        let input: Tensor<B, 2> = Tensor::ones([1, 4], &device);
        assert_eq!(target.forward(input).dims(), [1, 3]);
    }

    #[test]
    fn test_merge_state_dicts() {
        let fresh: StateDict = [
            ("a".to_string(), entry(&[2, 2])),
            ("b".to_string(), entry(&[3])),
            ("c".to_string(), entry(&[4])),
        ]
        .into_iter()
        .collect();

        let checkpoint: StateDict = [
            ("a".to_string(), ParamEntry(json!({"shape": [2, 2], "tag": "ckpt"}))),
            ("b".to_string(), entry(&[5])),
            ("z".to_string(), entry(&[1])),
        ]
        .into_iter()
        .collect();

        let merge = merge_state_dicts(&checkpoint, &fresh);

        assert_eq!(merge.merged.len(), 3);
        assert_eq!(merge.merged["a"], checkpoint["a"]);
        assert_eq!(merge.merged["b"], fresh["b"]);
        assert_eq!(merge.merged["c"], fresh["c"]);

        assert_eq!(merge.unexpected, BTreeSet::from(["z".to_string()]));
        assert_eq!(merge.mismatched, BTreeSet::from(["b".to_string()]));
        assert_eq!(
            merge.missing,
            BTreeSet::from(["b".to_string(), "c".to_string()])
        );
        assert_eq!(merge.loaded(), 1);
    }
}
