//! A static-analysis framework for CUDA-style kernel IR: uncoalesced
//! global-memory access detection and block-size-invariance detection,
//! sharing one abstract-interpretation engine.

pub mod analyses;
pub mod commons;
pub mod demos;
pub mod driver;
pub mod engine;
pub mod ir;
pub mod lattice;
