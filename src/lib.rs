//! WEFT: a minimal loop-nest tensor program compiler.
pub mod autodiff;
pub mod exec;
pub mod io;
pub mod kernels;
pub mod pipeline;
pub mod runtime;
pub mod schedule;
pub mod types;

pub mod ir;
