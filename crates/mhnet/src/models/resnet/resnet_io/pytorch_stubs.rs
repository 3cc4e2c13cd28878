#![allow(missing_docs)]
//! # Multi-Head `ResNet` ``torch`` Stubs.
//!
//! Stub modules mirroring the parameter layout of [`MultiHeadResNet`], so
//! that ``torch`` state dicts can be read with [`PyTorchFileRecorder`].
//!
//! The ``torch`` keys are remapped onto this crate's module tree by
//! [`PYTORCH_KEY_REMAPS`]; a flattened stub record then shares its keys with
//! the [`state_dict`] of the model it mirrors:
//!
//! ```text
//! module.conv1.weight                 -> trunk.stem.conv.weight
//! module.layer1.0.bn1.running_mean    -> trunk.layers.0.blocks.0.<Kind>.cna1.norm.running_mean
//! module.layer2.0.shortcut.0.weight   -> trunk.layers.1.blocks.0.<Kind>.downsample.conv.weight
//! module.pool_fc.weight               -> pooling.Projection.weight
//! module.fc2_number.weight            -> heads.number.weight
//! ```
//!
//! The projection and every head are optional in the stub. Whatever the file
//! holds is read, and [`merge_state_dicts`] decides what fits the model.

use crate::layers::blocks::cna::CNA2d;
use crate::layers::heads::HeadBank;
use crate::models::resnet::downsample::ConvDownsample;
use crate::models::resnet::pooling::FeaturePool;
use crate::models::resnet::residual_block::ResidualBlock;
use crate::models::resnet::resnet_model::MultiHeadResNet;
use crate::utility::burn::state_dict::{
    StateDictMerge, load_state_dict, merge_state_dicts, record_state_dict, state_dict,
};
use burn::module::Module;
use burn::nn::conv::Conv2d;
use burn::nn::{BatchNorm, Linear};
use burn::prelude::Backend;
use burn::record::{FullPrecisionSettings, Recorder};
use burn_import::pytorch::{LoadArgs, PyTorchFileRecorder};
use std::path::PathBuf;

/// Key prefix added by data-parallel module wrappers.
pub const DATA_PARALLEL_PREFIX: &str = "module.";

/// Namespace for keys lacking [`DATA_PARALLEL_PREFIX`]; no stub field reads it.
pub const UNPREFIXED_NAMESPACE: &str = "unprefixed";

/// ``(pattern, replacement)`` key remaps, applied in order to every key.
///
/// The first two rules strip [`DATA_PARALLEL_PREFIX`] from every key that
/// has it, and park every key that lacks it under [`UNPREFIXED_NAMESPACE`];
/// so ``module.x`` and ``x`` can never collide.
pub static PYTORCH_KEY_REMAPS: &[(&str, &str)] = &[
    (r"^(.*)$", "unprefixed.$1"),
    (r"^unprefixed\.module\.", ""),
    (r"^conv1\.", "trunk.stem.conv."),
    (r"^bn1\.", "trunk.stem.norm."),
    (r"^layer1\.", "trunk.layers.0.blocks."),
    (r"^layer2\.", "trunk.layers.1.blocks."),
    (r"^layer3\.", "trunk.layers.2.blocks."),
    (r"^layer4\.", "trunk.layers.3.blocks."),
    (r"\.conv([1-3])\.", ".cna$1.conv."),
    (r"\.bn([1-3])\.", ".cna$1.norm."),
    (r"\.shortcut\.0\.", ".downsample.conv."),
    (r"\.shortcut\.1\.", ".downsample.norm."),
    (r"^pool_fc\.", "pooling."),
    (r"^fc2_number\.", "heads.number."),
    (r"^fc2_color\.", "heads.color."),
    (r"^fc2_loc\.", "heads.location."),
    (r"^fc2_scale\.", "heads.scale."),
];

/// Leniently load ``torch`` weights onto a [`MultiHeadResNet`].
///
/// # Returns
///
/// ``(model, merge)``; the reloaded model and the merge report.
#[tracing::instrument(skip_all)]
pub fn load_pytorch_weights<B: Backend>(
    model: MultiHeadResNet<B>,
    path: PathBuf,
) -> anyhow::Result<(MultiHeadResNet<B>, StateDictMerge)> {
    let device = model.devices().into_iter().next().unwrap_or_default();
    let record = load_multi_head_stub_record::<B>(path, &device)?;
    apply_stub_record(model, record)
}

/// Load a [`MultiHeadResNetStubRecord`] from a ``torch`` weights path.
pub fn load_multi_head_stub_record<B: Backend>(
    path: PathBuf,
    device: &B::Device,
) -> anyhow::Result<MultiHeadResNetStubRecord<B>> {
    let load_args = PYTORCH_KEY_REMAPS
        .iter()
        .fold(LoadArgs::new(path), |args, (pattern, replacement)| {
            args.with_key_remap(pattern, replacement)
        });

    let record = PyTorchFileRecorder::<FullPrecisionSettings>::new().load(load_args, device)?;

    Ok(record)
}

/// Overlay the compatible entries of a stub record onto a model.
///
/// Entries the model lacks, or holds at another shape, are reported and
/// left out; those parameters keep their current values.
pub fn apply_stub_record<B: Backend>(
    model: MultiHeadResNet<B>,
    record: MultiHeadResNetStubRecord<B>,
) -> anyhow::Result<(MultiHeadResNet<B>, StateDictMerge)> {
    let checkpoint = record_state_dict::<B, _>(record)?;
    tracing::debug!(entries = checkpoint.len(), "read torch weights");

    let merge = merge_state_dicts(&checkpoint, &state_dict(&model)?);
    tracing::debug!(
        loaded = merge.loaded(),
        unexpected = merge.unexpected.len(),
        missing = merge.missing.len(),
        mismatched = merge.mismatched.len(),
        "merged torch weights"
    );
    for key in &merge.mismatched {
        tracing::debug!(key = %key, "shape mismatch; keeping fresh value");
    }

    let model = load_state_dict(model, &merge.merged)?;
    Ok((model, merge))
}

#[derive(Module, Debug)]
pub struct MultiHeadResNetStub<B: Backend> {
    pub trunk: TrunkStub<B>,
    pub pooling: Option<FeaturePoolStub<B>>,
    pub heads: Option<HeadBankStub<B>>,
}

impl<B: Backend> From<&MultiHeadResNet<B>> for MultiHeadResNetStub<B> {
    fn from(model: &MultiHeadResNet<B>) -> Self {
        Self {
            trunk: TrunkStub {
                stem: (&model.trunk.stem).into(),
                layers: model
                    .trunk
                    .layers
                    .iter()
                    .map(|layer| LayerBlockStub {
                        blocks: layer.blocks.iter().map(Into::into).collect(),
                    })
                    .collect(),
            },
            pooling: match &model.pooling {
                FeaturePool::Average(_) => None,
                FeaturePool::Projection(linear) => {
                    Some(FeaturePoolStub::Projection(linear.clone()))
                }
            },
            heads: Some((&model.heads).into()),
        }
    }
}

#[derive(Module, Debug)]
pub struct TrunkStub<B: Backend> {
    pub stem: ConvNormStub<B>,
    pub layers: Vec<LayerBlockStub<B>>,
}

#[derive(Module, Debug)]
pub struct LayerBlockStub<B: Backend> {
    pub blocks: Vec<ResidualBlockStub<B>>,
}

/// Variant names match [`ResidualBlock`]; the bottleneck is tried first.
#[derive(Module, Debug)]
#[allow(clippy::large_enum_variant)]
pub enum ResidualBlockStub<B: Backend> {
    Bottleneck(BottleneckStub<B>),
    Basic(BasicBlockStub<B>),
}

impl<B: Backend> From<&ResidualBlock<B>> for ResidualBlockStub<B> {
    fn from(block: &ResidualBlock<B>) -> Self {
        match block {
            ResidualBlock::Basic(block) => Self::Basic(BasicBlockStub {
                downsample: block.downsample.as_ref().map(Into::into),
                cna1: (&block.cna1).into(),
                cna2: (&block.cna2).into(),
            }),
            ResidualBlock::Bottleneck(block) => Self::Bottleneck(BottleneckStub {
                downsample: block.downsample.as_ref().map(Into::into),
                cna1: (&block.cna1).into(),
                cna2: (&block.cna2).into(),
                cna3: (&block.cna3).into(),
            }),
        }
    }
}

#[derive(Module, Debug)]
pub struct BasicBlockStub<B: Backend> {
    pub downsample: Option<ConvNormStub<B>>,
    pub cna1: ConvNormStub<B>,
    pub cna2: ConvNormStub<B>,
}

#[derive(Module, Debug)]
pub struct BottleneckStub<B: Backend> {
    pub downsample: Option<ConvNormStub<B>>,
    pub cna1: ConvNormStub<B>,
    pub cna2: ConvNormStub<B>,
    pub cna3: ConvNormStub<B>,
}

/// Stands in for [`CNA2d`] and [`ConvDownsample`]; both are ``conv`` + ``norm``.
#[derive(Module, Debug)]
pub struct ConvNormStub<B: Backend> {
    pub conv: Conv2d<B>,
    pub norm: BatchNorm<B, 2>,
}

impl<B: Backend> From<&CNA2d<B>> for ConvNormStub<B> {
    fn from(cna: &CNA2d<B>) -> Self {
        Self {
            conv: cna.conv.clone(),
            norm: cna.norm.clone(),
        }
    }
}

impl<B: Backend> From<&ConvDownsample<B>> for ConvNormStub<B> {
    fn from(downsample: &ConvDownsample<B>) -> Self {
        Self {
            conv: downsample.conv.clone(),
            norm: downsample.norm.clone(),
        }
    }
}

/// Only the projection arm of [`FeaturePool`] has parameters.
#[derive(Module, Debug)]
pub enum FeaturePoolStub<B: Backend> {
    Projection(Linear<B>),
}

#[derive(Module, Debug)]
pub struct HeadBankStub<B: Backend> {
    pub number: Option<Linear<B>>,
    pub color: Option<Linear<B>>,
    pub location: Option<Linear<B>>,
    pub scale: Option<Linear<B>>,
}

impl<B: Backend> From<&HeadBank<B>> for HeadBankStub<B> {
    fn from(heads: &HeadBank<B>) -> Self {
        Self {
            number: Some(heads.number.clone()),
            color: Some(heads.color.clone()),
            location: heads.location.clone(),
            scale: heads.scale.clone(),
        }
    }
}
