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

//! Reverse-mode automatic differentiation.
//!
//! [`grad`] is a pure function from a program plus variable sets to a
//! forward program (the primal plus tape writes), a backward program
//! (tapes and seed gradients in, input gradients out), and the name
//! maps routing caller-owned gradient buffers. The original program is
//! never mutated and stays usable for plain inference.
//!
//! Gradients with respect to an input that no designated output depends
//! on are *defined-zero*: the backward program zero-fills every
//! requested gradient before accumulating, so a disconnected input
//! simply yields an all-zero tensor.

mod engine;
mod rules;

pub use engine::{grad, AutodiffError, GradProducts};

/// Selects which intermediate values the forward program records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TapeMode {
    /// Record every local. No recomputation in the backward pass at the
    /// cost of the largest tape.
    #[default]
    All,
    /// Record only values with no cheap re-derivation: locals whose
    /// definition involves a reduction or a store under a conditional.
    /// Everything else the backward pass recomputes by replaying the
    /// defining statements. Gradients are numerically identical to
    /// [`TapeMode::All`]; only the memory/compute trade-off differs.
    NoReuseOnly,
}
