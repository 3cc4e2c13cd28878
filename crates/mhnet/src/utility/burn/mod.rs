//! # Burn Utilities

pub mod state_dict;
