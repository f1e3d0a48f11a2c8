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

//! The soft rasterizer against a plain Rust reference.

use weft::exec::{run, Bindings, TensorVal};
use weft::kernels::rasterize::{self, RasterizeConfig, SIGMA};
use weft::types::DType;

fn cfg() -> RasterizeConfig {
    RasterizeConfig {
        n_verts: 4,
        n_faces: 2,
        height: 8,
        width: 8,
    }
}

fn vertices() -> TensorVal {
    // Two triangles sharing an edge, inside the unit square.
    TensorVal::from_f32(
        &[4, 3],
        vec![
            0.10, 0.15, 0.0, //
            0.85, 0.10, 0.0, //
            0.50, 0.80, 0.0, //
            0.95, 0.90, 0.0,
        ],
    )
    .unwrap()
}

fn faces() -> TensorVal {
    TensorVal::from_i32(&[2, 3], vec![0, 1, 2, 1, 3, 2]).unwrap()
}

/// Exact point-to-segment distance, mirroring the kernel's three cases.
fn edge_distance(px: [f32; 2], a: [f32; 2], b: [f32; 2], cp: f32) -> f32 {
    let dp1 = (px[0] - a[0]) * (b[0] - a[0]) + (px[1] - a[1]) * (b[1] - a[1]);
    if dp1 >= 0.0 {
        let dp2 = (px[0] - b[0]) * (a[0] - b[0]) + (px[1] - b[1]) * (a[1] - b[1]);
        if dp2 >= 0.0 {
            let len = ((b[0] - a[0]) * (b[0] - a[0]) + (b[1] - a[1]) * (b[1] - a[1])).sqrt();
            cp.abs() / len
        } else {
            ((px[0] - b[0]) * (px[0] - b[0]) + (px[1] - b[1]) * (px[1] - b[1])).sqrt()
        }
    } else {
        ((px[0] - a[0]) * (px[0] - a[0]) + (px[1] - a[1]) * (px[1] - a[1])).sqrt()
    }
}

fn reference(c: &RasterizeConfig, verts: &[f32], faces: &[i32]) -> Vec<f32> {
    let mut y = vec![0.0f32; c.n_faces * c.height * c.width];
    for i in 0..c.n_faces {
        let v: Vec<[f32; 2]> = (0..3)
            .map(|p| {
                let vi = faces[i * 3 + p] as usize;
                [verts[vi * 3], verts[vi * 3 + 1]]
            })
            .collect();
        for j in 0..c.height {
            for k in 0..c.width {
                let px = [
                    1.0 / (c.height as f32 - 1.0) * j as f32,
                    1.0 / (c.width as f32 - 1.0) * k as f32,
                ];
                let mut cps = [0.0f32; 3];
                let mut dists = [0.0f32; 3];
                for p in 0..3 {
                    let (a, b) = (v[p], v[(p + 1) % 3]);
                    cps[p] = (px[0] - a[0]) * (b[1] - a[1]) - (px[1] - a[1]) * (b[0] - a[0]);
                    dists[p] = edge_distance(px, a, b, cps[p]);
                }
                let inside = if cps.iter().all(|&cp| cp < 0.0) { 1.0 } else { -1.0 };
                let d0 = if dists[0] <= dists[1] { dists[0] } else { dists[1] };
                let dist = if d0 <= dists[2] { d0 } else { dists[2] };
                let arg = inside * dist * dist / SIGMA;
                y[(i * c.height + j) * c.width + k] = 1.0 / (1.0 + (-arg).exp());
            }
        }
    }
    y
}

fn run_kernel(c: &RasterizeConfig) -> Vec<f32> {
    let p = rasterize::program(c).unwrap();
    let mut b = Bindings::new();
    b.bind("vertices", vertices());
    b.bind("faces", faces());
    b.bind(
        "y",
        TensorVal::zeros(DType::F32, &[c.n_faces, c.height, c.width]),
    );
    run(&p, &mut b).unwrap();
    b.get("y").unwrap().as_f32().unwrap().to_vec()
}

#[test]
fn matches_the_reference() {
    let c = cfg();
    let expected = reference(
        &c,
        vertices().as_f32().unwrap(),
        faces().as_i32().unwrap(),
    );
    let y = run_kernel(&c);
    for (got, want) in y.iter().zip(&expected) {
        assert!((got - want).abs() <= 1e-5, "{got} vs {want}");
    }
}

/// The sharp transition: deep interior pixels saturate at one, far
/// exterior pixels at zero.
#[test]
fn interior_and_exterior_saturate() {
    let c = cfg();
    let y = run_kernel(&c);
    let at = |i: usize, j: usize, k: usize| y[(i * c.height + j) * c.width + k];
    // (3/7, 2/7) is well inside the first triangle.
    assert!(at(0, 3, 2) > 0.99, "interior: {}", at(0, 3, 2));
    // The corner (0, 1) is far from both triangles.
    assert!(at(0, 0, 7) < 0.01, "exterior: {}", at(0, 0, 7));
    assert!(at(1, 0, 0) < 0.01, "exterior: {}", at(1, 0, 0));
}
