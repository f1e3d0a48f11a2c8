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

//! Central finite differences against the generated backward programs.
//!
//! The scalar objective is `sum(Y * W)` for a fixed random weighting W,
//! which doubles as the gradient seed. Sampled input coordinates are
//! perturbed both ways and the quotient compared against the analytic
//! gradient.

use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use weft::autodiff::{grad, TapeMode};
use weft::exec::{run, Bindings, TensorVal};
use weft::ir::Program;
use weft::kernels::{attention, meshconv, rasterize};
use weft::types::DType;

fn random_tensor(rng: &mut StdRng, shape: &[usize]) -> TensorVal {
    let len = shape.iter().product();
    let values = (0..len).map(|_| rng.gen_range(-1.0..1.0)).collect();
    TensorVal::from_f32(shape, values).unwrap()
}

/// `sum(Y * W)` after one inference run.
fn loss(program: &Program, inputs: &Bindings, output: &str, weight: &TensorVal) -> f64 {
    let mut b = inputs.clone();
    let d = program.param(output).unwrap();
    b.bind(output, TensorVal::zeros(d.ty.dtype, &d.ty.shape));
    run(program, &mut b).unwrap();
    b.get(output)
        .unwrap()
        .as_f32()
        .unwrap()
        .iter()
        .zip(weight.as_f32().unwrap())
        .map(|(y, w)| f64::from(*y) * f64::from(*w))
        .sum()
}

/// Analytic gradients for every required input, seeded with `weight`.
fn analytic(
    program: &Program,
    requires: &[&str],
    provides: &[&str],
    inputs: &Bindings,
    weight: &TensorVal,
) -> BTreeMap<String, TensorVal> {
    let g = grad(program, requires, provides, TapeMode::NoReuseOnly).unwrap();
    let mut b = inputs.clone();
    for d in g.forward.outputs() {
        b.bind(d.name.as_str(), TensorVal::zeros(d.ty.dtype, &d.ty.shape));
    }
    run(&g.forward, &mut b).unwrap();
    b.bind(g.provides[provides[0]].as_str(), weight.clone());
    for d in g.backward.outputs() {
        b.bind(d.name.as_str(), TensorVal::zeros(d.ty.dtype, &d.ty.shape));
    }
    run(&g.backward, &mut b).unwrap();
    g.requires
        .iter()
        .map(|(input, grad)| (input.clone(), b.get(grad).unwrap().clone()))
        .collect()
}

fn check(
    program: &Program,
    requires: &[&str],
    provides: &[&str],
    inputs: &Bindings,
    rng: &mut StdRng,
    eps: f32,
    tol: f64,
) {
    let out_decl = program.param(provides[0]).unwrap();
    let weight = random_tensor(rng, &out_decl.ty.shape);
    let grads = analytic(program, requires, provides, inputs, &weight);

    for name in requires {
        let base = inputs.get(name).unwrap().clone();
        let values = base.as_f32().unwrap().to_vec();
        let ad = grads[*name].as_f32().unwrap();
        for _ in 0..6 {
            let idx = rng.gen_range(0..values.len());
            let mut probe = |delta: f32| {
                let mut bumped = values.clone();
                bumped[idx] += delta;
                let mut b = inputs.clone();
                b.bind(*name, TensorVal::from_f32(base.shape(), bumped).unwrap());
                loss(program, &b, provides[0], &weight)
            };
            let fd = (probe(eps) - probe(-eps)) / (2.0 * f64::from(eps));
            let got = f64::from(ad[idx]);
            let scale = fd.abs().max(got.abs()).max(1.0);
            assert!(
                (fd - got).abs() <= tol * scale,
                "{name}[{idx}]: finite difference {fd}, backward {got}"
            );
        }
    }
}

#[test]
fn attention_gradients() {
    let c = attention::AttentionConfig {
        n_heads: 2,
        seq_len: 6,
        feat_len: 3,
        w: 1,
        dilation: 2,
        dilation_heads: 1,
    };
    let shape = [c.n_heads, c.seq_len, c.feat_len];
    let mut rng = StdRng::seed_from_u64(41);
    let p = attention::program(&c).unwrap();
    let mut inputs = Bindings::new();
    inputs.bind("Q", random_tensor(&mut rng, &shape));
    inputs.bind("K", random_tensor(&mut rng, &shape));
    inputs.bind("V", random_tensor(&mut rng, &shape));
    check(
        &p,
        attention::REQUIRES,
        attention::PROVIDES,
        &inputs,
        &mut rng,
        1e-3,
        2e-2,
    );
}

#[test]
fn meshconv_gradients() {
    let c = meshconv::MeshConvConfig {
        n_faces: 4,
        in_feats: 3,
        out_feats: 2,
    };
    let mut rng = StdRng::seed_from_u64(43);
    let p = meshconv::program(&c).unwrap();
    let n = c.n_faces;
    let adj: Vec<i32> = (0..n)
        .flat_map(|i| {
            [
                ((i + 1) % n) as i32,
                ((i + 2) % n) as i32,
                ((i + n - 1) % n) as i32,
            ]
        })
        .collect();
    let mut inputs = Bindings::new();
    inputs.bind("adj", TensorVal::from_i32(&[n, 3], adj).unwrap());
    inputs.bind("x", random_tensor(&mut rng, &[n, c.in_feats]));
    for idx in 0..4 {
        inputs.bind(
            format!("w{idx}"),
            random_tensor(&mut rng, &[c.in_feats, c.out_feats]),
        );
    }
    check(
        &p,
        meshconv::REQUIRES,
        meshconv::PROVIDES,
        &inputs,
        &mut rng,
        1e-3,
        1e-2,
    );
}

#[test]
fn rasterize_gradients() {
    let c = rasterize::RasterizeConfig {
        n_verts: 3,
        n_faces: 1,
        height: 5,
        width: 5,
    };
    let mut rng = StdRng::seed_from_u64(47);
    let p = rasterize::program(&c).unwrap();
    // A small triangle around the center pixel keeps the nearest-edge
    // distances inside the responsive band of the sharp sigmoid.
    let verts = TensorVal::from_f32(
        &[3, 3],
        vec![
            0.471, 0.483, 0.0, //
            0.534, 0.472, 0.0, //
            0.497, 0.541, 0.0,
        ],
    )
    .unwrap();
    let mut inputs = Bindings::new();
    inputs.bind("vertices", verts);
    inputs.bind(
        "faces",
        TensorVal::from_i32(&[1, 3], vec![0, 1, 2]).unwrap(),
    );
    check(
        &p,
        rasterize::REQUIRES,
        rasterize::PROVIDES,
        &inputs,
        &mut rng,
        1e-4,
        5e-2,
    );
}
