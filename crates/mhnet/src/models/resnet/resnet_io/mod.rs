//! # `ResNet` Weight IO

pub mod pytorch_stubs;
