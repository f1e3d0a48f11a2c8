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

//! The mesh convolution kernel against a plain Rust reference.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use weft::exec::{run, Bindings, TensorVal};
use weft::kernels::meshconv::{self, MeshConvConfig};
use weft::types::DType;

fn cfg() -> MeshConvConfig {
    MeshConvConfig {
        n_faces: 6,
        in_feats: 5,
        out_feats: 3,
    }
}

/// Ring adjacency: each face neighbors the next two and the previous one.
fn ring_adjacency(n: usize) -> TensorVal {
    let mut adj = Vec::with_capacity(n * 3);
    for i in 0..n {
        adj.push(((i + 1) % n) as i32);
        adj.push(((i + 2) % n) as i32);
        adj.push(((i + n - 1) % n) as i32);
    }
    TensorVal::from_i32(&[n, 3], adj).unwrap()
}

fn random_tensor(rng: &mut StdRng, shape: &[usize]) -> TensorVal {
    let len = shape.iter().product();
    let values = (0..len).map(|_| rng.gen_range(-1.0..1.0)).collect();
    TensorVal::from_f32(shape, values).unwrap()
}

fn run_with(
    c: &MeshConvConfig,
    adj: TensorVal,
    x: &TensorVal,
    weights: &[TensorVal; 4],
) -> Vec<f32> {
    let p = meshconv::program(c).unwrap();
    let mut b = Bindings::new();
    b.bind("adj", adj);
    b.bind("x", x.clone());
    for (idx, w) in weights.iter().enumerate() {
        b.bind(format!("w{idx}"), w.clone());
    }
    b.bind("y", TensorVal::zeros(DType::F32, &[c.n_faces, c.out_feats]));
    run(&p, &mut b).unwrap();
    b.get("y").unwrap().as_f32().unwrap().to_vec()
}

fn reference(c: &MeshConvConfig, adj: &[i32], x: &[f32], w: [&[f32]; 4]) -> Vec<f32> {
    let (n, fin, fout) = (c.n_faces, c.in_feats, c.out_feats);
    let xat = |f: usize, q: usize| x[f * fin + q];
    let mut y = vec![0.0f32; n * fout];
    for i in 0..n {
        let mut sum1 = vec![0.0f32; fin];
        let mut sum2 = vec![0.0f32; fin];
        let mut sum3 = vec![0.0f32; fin];
        for p in 0..3 {
            let nbr = adj[i * 3 + p] as usize;
            let next = adj[i * 3 + (p + 1) % 3] as usize;
            for q in 0..fin {
                sum1[q] += xat(nbr, q);
                sum2[q] += (xat(nbr, q) - xat(next, q)).abs();
                sum3[q] += (xat(nbr, q) - xat(i, q)).abs();
            }
        }
        for o in 0..fout {
            let mut acc = 0.0f32;
            for q in 0..fin {
                acc += xat(i, q) * w[0][q * fout + o]
                    + sum1[q] * w[1][q * fout + o]
                    + sum2[q] * w[2][q * fout + o]
                    + sum3[q] * w[3][q * fout + o];
            }
            y[i * fout + o] = acc;
        }
    }
    y
}

#[test]
fn matches_the_reference() {
    let c = cfg();
    let mut rng = StdRng::seed_from_u64(21);
    let adj = ring_adjacency(c.n_faces);
    let x = random_tensor(&mut rng, &[c.n_faces, c.in_feats]);
    let weights: Vec<TensorVal> = (0..4)
        .map(|_| random_tensor(&mut rng, &[c.in_feats, c.out_feats]))
        .collect();

    let expected = reference(
        &c,
        adj.as_i32().unwrap(),
        x.as_f32().unwrap(),
        [
            weights[0].as_f32().unwrap(),
            weights[1].as_f32().unwrap(),
            weights[2].as_f32().unwrap(),
            weights[3].as_f32().unwrap(),
        ],
    );

    let p = meshconv::program(&c).unwrap();
    let mut b = Bindings::new();
    b.bind("adj", adj);
    b.bind("x", x);
    for (idx, w) in weights.into_iter().enumerate() {
        b.bind(format!("w{idx}"), w);
    }
    b.bind("y", TensorVal::zeros(DType::F32, &[c.n_faces, c.out_feats]));
    run(&p, &mut b).unwrap();

    let y = b.get("y").unwrap().as_f32().unwrap();
    assert_eq!(y.len(), expected.len());
    for (got, want) in y.iter().zip(&expected) {
        assert!((got - want).abs() <= 1e-5 * want.abs().max(1.0), "{got} vs {want}");
    }
}

/// Rotating one face's adjacency row leaves the output unchanged:
/// `sum1` and `sum3` reduce over the slot values directly, and the
/// cyclic pairs of `sum2` are the same pairs visited from a different
/// starting slot.
#[test]
fn rotated_adjacency_row_is_equivalent() {
    let c = cfg();
    let mut rng = StdRng::seed_from_u64(23);
    let x = random_tensor(&mut rng, &[c.n_faces, c.in_feats]);
    let weights: [TensorVal; 4] =
        std::array::from_fn(|_| random_tensor(&mut rng, &[c.in_feats, c.out_feats]));

    let base = ring_adjacency(c.n_faces);
    let mut rotated = base.as_i32().unwrap().to_vec();
    // Face 2: (a, b, c) -> (b, c, a).
    rotated[6..9].rotate_left(1);
    let rotated = TensorVal::from_i32(&[c.n_faces, 3], rotated).unwrap();

    let y0 = run_with(&c, base, &x, &weights);
    let y1 = run_with(&c, rotated, &x, &weights);
    for (a, b) in y0.iter().zip(&y1) {
        assert!((a - b).abs() <= 1e-5 * b.abs().max(1.0), "{a} vs {b}");
    }
}

/// Swapping two slots is not a rotation, yet the output still cannot
/// change: a 3-cycle's adjacent pairs are exactly the three unordered
/// pairs, so `sum2` sees the same absolute differences in any slot
/// order. The other weight matrices are zeroed so that any deviation
/// would have to come from the pairwise-difference aggregate.
#[test]
fn swapped_adjacency_row_is_equivalent() {
    let c = cfg();
    let mut rng = StdRng::seed_from_u64(29);
    let x = random_tensor(&mut rng, &[c.n_faces, c.in_feats]);
    let zero = TensorVal::zeros(DType::F32, &[c.in_feats, c.out_feats]);
    let weights = [
        zero.clone(),
        zero.clone(),
        random_tensor(&mut rng, &[c.in_feats, c.out_feats]),
        zero,
    ];

    let base = ring_adjacency(c.n_faces);
    let mut swapped = base.as_i32().unwrap().to_vec();
    // Face 1: (a, b, c) -> (b, a, c).
    swapped.swap(3, 4);
    let swapped = TensorVal::from_i32(&[c.n_faces, 3], swapped).unwrap();

    let y0 = run_with(&c, base, &x, &weights);
    let y1 = run_with(&c, swapped, &x, &weights);
    for (a, b) in y0.iter().zip(&y1) {
        assert!((a - b).abs() <= 1e-5 * b.abs().max(1.0), "{a} vs {b}");
    }
}

/// An out-of-range adjacency entry is a runtime error, not UB.
#[test]
fn bad_adjacency_is_reported() {
    let c = cfg();
    let mut rng = StdRng::seed_from_u64(22);
    let mut adj = ring_adjacency(c.n_faces).as_i32().unwrap().to_vec();
    adj[4] = c.n_faces as i32;
    let p = meshconv::program(&c).unwrap();
    let mut b = Bindings::new();
    b.bind("adj", TensorVal::from_i32(&[c.n_faces, 3], adj).unwrap());
    b.bind("x", random_tensor(&mut rng, &[c.n_faces, c.in_feats]));
    for idx in 0..4 {
        b.bind(
            format!("w{idx}"),
            random_tensor(&mut rng, &[c.in_feats, c.out_feats]),
        );
    }
    b.bind("y", TensorVal::zeros(DType::F32, &[c.n_faces, c.out_feats]));
    assert!(matches!(
        run(&p, &mut b),
        Err(weft::exec::ExecError::OutOfBounds { .. })
    ));
}
