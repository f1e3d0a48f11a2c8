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

//! Mesh face convolution over a 3-regular adjacency.
//!
//! Every face aggregates features from its three neighbors in four
//! order-invariant ways: its own features, the neighbor sum, the sum of
//! absolute differences between cyclically adjacent neighbors, and the
//! sum of absolute differences against itself. The cyclic pairs of
//! three slots are exactly the three unordered pairs, so every
//! aggregate is unchanged by reordering a face's adjacency row. Each
//! aggregate goes through its own dense weight matrix and the results
//! are added.

use crate::ir::{abs, iconst, BuildError, Program, ProgramBuilder, ReduceOp};
use crate::types::DType;

/// Problem sizes for [`program`].
#[derive(Debug, Clone, Copy)]
pub struct MeshConvConfig {
    pub n_faces: usize,
    pub in_feats: usize,
    pub out_feats: usize,
}

impl Default for MeshConvConfig {
    fn default() -> Self {
        Self {
            n_faces: 1024,
            in_feats: 13,
            out_feats: 64,
        }
    }
}

pub const REQUIRES: &[&str] = &["x", "w0", "w1", "w2", "w3"];
pub const PROVIDES: &[&str] = &["y"];

pub fn program(cfg: &MeshConvConfig) -> Result<Program, BuildError> {
    let faces = cfg.n_faces as i64;
    let fin = cfg.in_feats as i64;
    let fout = cfg.out_feats as i64;

    let mut b = ProgramBuilder::new("meshconv");
    let adj = b.input("adj", DType::I32, &[cfg.n_faces, 3])?;
    let x = b.input("x", DType::F32, &[cfg.n_faces, cfg.in_feats])?;
    let w0 = b.input("w0", DType::F32, &[cfg.in_feats, cfg.out_feats])?;
    let w1 = b.input("w1", DType::F32, &[cfg.in_feats, cfg.out_feats])?;
    let w2 = b.input("w2", DType::F32, &[cfg.in_feats, cfg.out_feats])?;
    let w3 = b.input("w3", DType::F32, &[cfg.in_feats, cfg.out_feats])?;
    let y = b.output("y", DType::F32, &[cfg.n_faces, cfg.out_feats])?;

    let i = b.begin_for("i", 0, faces)?;

    let sum1 = b.local("sum1", DType::F32, &[cfg.in_feats])?;
    b.fill(&sum1, 0.0f32)?;
    let sum2 = b.local("sum2", DType::F32, &[cfg.in_feats])?;
    b.fill(&sum2, 0.0f32)?;
    let sum3 = b.local("sum3", DType::F32, &[cfg.in_feats])?;
    b.fill(&sum3, 0.0f32)?;

    let p = b.begin_for("p", 0, 3)?;
    let q = b.begin_for("q", 0, fin)?;
    let this = |feat| adj.at(&[i.clone(), feat]);
    let nbr = x.at(&[this(p.clone()), q.clone()]);
    let next = x.at(&[this((p.clone() + iconst(1)).rem(iconst(3))), q.clone()]);
    b.reduce(&sum1, &[q.clone()], ReduceOp::Add, nbr.clone())?;
    b.reduce(&sum2, &[q.clone()], ReduceOp::Add, abs(nbr.clone() - next))?;
    b.reduce(
        &sum3,
        &[q.clone()],
        ReduceOp::Add,
        abs(nbr - x.at(&[i.clone(), q])),
    )?;
    b.end_for()?;
    b.end_for()?;

    let o = b.begin_for("o", 0, fout)?;
    b.store(&y, &[i.clone(), o.clone()], 0.0f32)?;
    let q = b.begin_for("q", 0, fin)?;
    b.reduce(
        &y,
        &[i.clone(), o.clone()],
        ReduceOp::Add,
        x.at(&[i.clone(), q.clone()]) * w0.at(&[q.clone(), o.clone()])
            + sum1.at(&[q.clone()]) * w1.at(&[q.clone(), o.clone()])
            + sum2.at(&[q.clone()]) * w2.at(&[q.clone(), o.clone()])
            + sum3.at(&[q.clone()]) * w3.at(&[q, o.clone()]),
    )?;
    b.end_for()?;
    b.end_for()?;

    b.end_for()?;
    b.finish()
}
