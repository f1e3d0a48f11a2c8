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

//! The benchmark kernels.
//!
//! Each module exposes a size/config struct, a `program` constructor
//! producing the statement-level program, and the `REQUIRES`/`PROVIDES`
//! name lists a differentiating compile uses.

pub mod attention;
pub mod meshconv;
pub mod rasterize;
