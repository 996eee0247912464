//! Core library: folder listing, dataset assembly with per-folder embedding
//! caches, and 2-D reductions for the visualization session.

pub mod config;
pub mod folder;
pub mod models;
pub mod pipeline;
pub mod reduce;
pub mod visualize;
