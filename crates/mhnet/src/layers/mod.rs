//! Common low-level modules for adding layers and operations in Burn.
pub mod blocks;
pub mod heads;
