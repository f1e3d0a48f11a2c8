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

//! External GPU backend interface.
//!
//! A backend owns buffer transfer and kernel launch for scheduled
//! programs; the bundled runtime ships none and executes GPU-shaped
//! schedules on the host thread pool instead. Implementations receive
//! programs whose parallel marks were already validated by the
//! scheduler, so they may map the two parallel levels directly onto
//! block and thread dimensions without re-checking dependences.

use crate::exec::Bindings;
use crate::ir::Program;
use crate::runtime::RuntimeError;

pub trait GpuBackend: Send + Sync {
    /// Backend identifier for diagnostics.
    fn name(&self) -> &str;

    /// Execute one scheduled program against host-resident bindings.
    /// The backend is responsible for any transfers it needs; outputs
    /// must be visible in `bindings` after [`GpuBackend::synchronize`].
    fn run(&self, program: &Program, bindings: &mut Bindings) -> Result<(), RuntimeError>;

    /// Block until all submitted work has completed.
    fn synchronize(&self) -> Result<(), RuntimeError>;
}
