// Copyright 2025 STARGA Inc.
// Licensed under the Apache License, Version 2.0 (the “License”);
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at:
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an “AS IS” BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

// Part of the WEFT tensor compiler project.

//! Program execution on the host.
//!
//! [`run`] checks the caller's buffers against the program signature,
//! then interprets the statement tree. Serial loops run inline; loops
//! the scheduler marked parallel fan their iterations out over the
//! rayon thread pool, and lane-marked loops run serially (the mark is
//! advisory on the host). Scoped locals are instantiated per entry into
//! their allocation, so concurrent iterations never share temporary
//! storage.

use crate::types::TensorType;

mod interp;
mod value;

pub use interp::run;
pub use value::{Bindings, Data, TensorVal};

/// Errors raised while binding or executing a program.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ExecError {
    #[error("no binding for parameter '{0}'")]
    MissingBinding(String),
    #[error("binding '{var}' is {got}, parameter expects {expected}")]
    SignatureMismatch {
        var: String,
        expected: TensorType,
        got: TensorType,
    },
    #[error("{got} values cannot fill a tensor of {expected} elements")]
    LengthMismatch { expected: usize, got: usize },
    #[error("index {index} out of bounds for '{var}' axis {axis} (extent {extent})")]
    OutOfBounds {
        var: String,
        axis: usize,
        index: i64,
        extent: usize,
    },
    #[error("unknown variable '{0}' at execution")]
    UnboundVariable(String),
    #[error("unknown iterator '{0}' at execution")]
    UnboundIterator(String),
    #[error("integer division by zero")]
    DivisionByZero,
    #[error("evaluation type mismatch: {0}")]
    Type(String),
}
