//! # Multi-Head `ResNet`
//!
//! Basic / Bottleneck residual blocks, the stage builder, the shared trunk,
//! feature pooling, and the multi-head model and its factories.

pub mod basic_block;
pub mod bottleneck;
pub mod downsample;
pub mod layer_block;
pub mod pooling;
pub mod prefabs;
pub mod residual_block;
pub mod resnet_io;
pub mod resnet_model;
pub mod trunk;
pub mod util;

pub use prefabs::{
    MultiHeadOptions, RESNET18_BLOCKS, RESNET50_BLOCKS, multi_head_resnet, resnet18, resnet50,
};
pub use residual_block::BlockKind;
pub use resnet_model::{MultiHeadResNet, MultiHeadResNetConfig, ParamGroupState};
pub use trunk::{ResNetTrunk, ResNetTrunkConfig};
