//! # Complete Model Families

pub mod resnet;
pub mod simple_cnn;
