#![warn(missing_docs)]
//!# mhnet - Multi-Head Image Classification Networks
//!
//! Convolutional networks predicting several independent categorical
//! attributes of an image from one shared trunk.
//!
//! ## Notable Components
//!
//! * [`layers`] - reusable neural network modules.
//!   * [`layers::blocks`] - miscellaneous blocks.
//!     * [`layers::blocks::cna`] - ``Conv2d + BatchNorm2d + ReLU`` block.
//!   * [`layers::heads`] - the multi-head classifier bank.
//! * [`models`] - complete model families.
//!   * [`models::resnet`] - multi-head `ResNet` (Basic / Bottleneck).
//!     * [`models::resnet::resnet_io`] - ``torch`` weight loading.
//!   * [`models::simple_cnn`] - shallow two-conv baseline.
//! * [`utility`] - support code.
//!   * [`utility::burn::state_dict`] - flat ``key -> parameter`` views, and lenient merges.

/// Test-only macro import.
#[cfg(test)]
#[allow(unused_imports)]
#[macro_use]
extern crate hamcrest;

pub mod layers;
pub mod models;
pub mod utility;
