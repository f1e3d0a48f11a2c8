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

//! Soft triangle rasterization.
//!
//! For every face and every pixel of an `h x w` grid over the unit
//! square, the kernel computes the distance from the pixel to the
//! triangle boundary and a probability `sigmoid(inside * dist^2 / sigma)`
//! of the pixel belonging to the face. The distance is the exact
//! point-to-segment distance, so each edge has three cases depending on
//! which Voronoi region of the segment the pixel falls in.

use crate::ir::{
    abs, cast, fconst, iconst, min, select, sigmoid, sqrt, BuildError, Expr, Program,
    ProgramBuilder,
};
use crate::types::DType;

/// Sharpness of the inside/outside transition.
pub const SIGMA: f32 = 1e-4;

/// Problem sizes for [`program`].
#[derive(Debug, Clone, Copy)]
pub struct RasterizeConfig {
    pub n_verts: usize,
    pub n_faces: usize,
    pub height: usize,
    pub width: usize,
}

impl Default for RasterizeConfig {
    fn default() -> Self {
        Self {
            n_verts: 64,
            n_faces: 64,
            height: 64,
            width: 64,
        }
    }
}

pub const REQUIRES: &[&str] = &["vertices"];
pub const PROVIDES: &[&str] = &["y"];

pub fn program(cfg: &RasterizeConfig) -> Result<Program, BuildError> {
    let mut b = ProgramBuilder::new("rasterize");
    let vertices = b.input("vertices", DType::F32, &[cfg.n_verts, 3])?;
    let faces = b.input("faces", DType::I32, &[cfg.n_faces, 3])?;
    let y = b.output("y", DType::F32, &[cfg.n_faces, cfg.height, cfg.width])?;

    let i = b.begin_for("i", 0, cfg.n_faces as i64)?;

    // 2D corner positions of face i, gathered once per face.
    let v = b.local("v", DType::F32, &[3, 2])?;
    let p = b.begin_for("p", 0, 3)?;
    b.store(
        &v,
        &[p.clone(), iconst(0)],
        vertices.at(&[faces.at(&[i.clone(), p.clone()]), iconst(0)]),
    )?;
    b.store(
        &v,
        &[p.clone(), iconst(1)],
        vertices.at(&[faces.at(&[i.clone(), p]), iconst(1)]),
    )?;
    b.end_for()?;

    let j = b.begin_for("j", 0, cfg.height as i64)?;
    let k = b.begin_for("k", 0, cfg.width as i64)?;

    let pixel = b.local("pixel", DType::F32, &[2])?;
    b.store(
        &pixel,
        &[iconst(0)],
        fconst(1.0 / (cfg.height as f32 - 1.0)) * cast(DType::F32, j.clone()),
    )?;
    b.store(
        &pixel,
        &[iconst(1)],
        fconst(1.0 / (cfg.width as f32 - 1.0)) * cast(DType::F32, k.clone()),
    )?;

    let px = |axis: i64| pixel.at(&[iconst(axis)]);
    let vx = |corner: &Expr, axis: i64| v.at(&[corner.clone(), iconst(axis)]);
    // (pixel - v[a]) x (v[b] - v[a])
    let edge_cross = |a: &Expr, bb: &Expr| {
        (px(0) - vx(a, 0)) * (vx(bb, 1) - vx(a, 1)) - (px(1) - vx(a, 1)) * (vx(bb, 0) - vx(a, 0))
    };
    let edge_dot = |a: &Expr, bb: &Expr| {
        (px(0) - vx(a, 0)) * (vx(bb, 0) - vx(a, 0)) + (px(1) - vx(a, 1)) * (vx(bb, 1) - vx(a, 1))
    };
    let dist_to = |a: &Expr| {
        sqrt((px(0) - vx(a, 0)) * (px(0) - vx(a, 0)) + (px(1) - vx(a, 1)) * (px(1) - vx(a, 1)))
    };

    let e_cp = b.local("e_cp", DType::F32, &[3])?;
    let e_dist = b.local("e_dist", DType::F32, &[3])?;
    let p = b.begin_for("p", 0, 3)?;
    let q = (p.clone() + iconst(1)).rem(iconst(3));
    b.store(&e_cp, &[p.clone()], edge_cross(&p, &q))?;
    let dp1 = b.local("dp1", DType::F32, &[])?;
    b.store(&dp1, &[], edge_dot(&p, &q))?;
    b.begin_if(dp1.get().ge(fconst(0.0)))?;
    {
        // Projection falls past v[p]; check the other endpoint.
        let dp2 = b.local("dp2", DType::F32, &[])?;
        b.store(&dp2, &[], edge_dot(&q, &p))?;
        b.begin_if(dp2.get().ge(fconst(0.0)))?;
        {
            // Interior of the segment: perpendicular distance.
            let len = b.local("len", DType::F32, &[])?;
            b.store(
                &len,
                &[],
                sqrt(
                    (vx(&q, 0) - vx(&p, 0)) * (vx(&q, 0) - vx(&p, 0))
                        + (vx(&q, 1) - vx(&p, 1)) * (vx(&q, 1) - vx(&p, 1)),
                ),
            )?;
            b.store(&e_dist, &[p.clone()], abs(e_cp.at(&[p.clone()])) / len.get())?;
        }
        b.begin_else()?;
        b.store(&e_dist, &[p.clone()], dist_to(&q))?;
        b.end_if()?;
    }
    b.begin_else()?;
    b.store(&e_dist, &[p.clone()], dist_to(&p))?;
    b.end_if()?;
    b.end_for()?;

    let zero = || fconst(0.0);
    let inside = b.local("inside", DType::I32, &[])?;
    b.store(
        &inside,
        &[],
        select(
            e_cp.at(&[iconst(0)])
                .lt(zero())
                .and(e_cp.at(&[iconst(1)]).lt(zero()))
                .and(e_cp.at(&[iconst(2)]).lt(zero())),
            iconst(1),
            iconst(-1),
        ),
    )?;
    let dist = b.local("dist", DType::F32, &[])?;
    b.store(
        &dist,
        &[],
        min(
            min(e_dist.at(&[iconst(0)]), e_dist.at(&[iconst(1)])),
            e_dist.at(&[iconst(2)]),
        ),
    )?;
    b.store(
        &y,
        &[i.clone(), j, k],
        sigmoid(cast(DType::F32, inside.get()) * dist.get() * dist.get() / fconst(SIGMA)),
    )?;

    b.end_for()?;
    b.end_for()?;
    b.end_for()?;
    b.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::verify_program;

    fn tiny() -> RasterizeConfig {
        RasterizeConfig {
            n_verts: 4,
            n_faces: 2,
            height: 5,
            width: 5,
        }
    }

    #[test]
    fn builds_and_verifies() {
        let p = program(&tiny()).unwrap();
        verify_program(&p).unwrap();
    }

    #[test]
    fn conditional_edge_distances_are_recorded() {
        use crate::autodiff::{grad, TapeMode};
        let p = program(&tiny()).unwrap();
        let g = grad(&p, REQUIRES, PROVIDES, TapeMode::NoReuseOnly).unwrap();
        verify_program(&g.forward).unwrap();
        verify_program(&g.backward).unwrap();
        // Stored under a conditional, so replay cannot reconstruct it.
        assert!(g.tapes.contains(&"e_dist.tape".to_string()));
        assert!(!g.tapes.contains(&"pixel.tape".to_string()));
        assert!(!g.tapes.contains(&"v.tape".to_string()));
    }
}
