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

//! End-to-end checks for the sliding-window attention kernel.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use weft::autodiff::{grad, TapeMode};
use weft::exec::{run, Bindings, TensorVal};
use weft::kernels::attention::{self, AttentionConfig};
use weft::types::DType;

fn cfg() -> AttentionConfig {
    AttentionConfig {
        n_heads: 4,
        seq_len: 12,
        feat_len: 4,
        w: 2,
        dilation: 2,
        dilation_heads: 2,
    }
}

fn random_tensor(rng: &mut StdRng, shape: &[usize]) -> TensorVal {
    let len = shape.iter().product();
    let values = (0..len).map(|_| rng.gen_range(-1.0..1.0)).collect();
    TensorVal::from_f32(shape, values).unwrap()
}

/// With zero queries every window slot scores the same, so attention is
/// uniform over all `2w + 1` slots and Y counts the in-bounds ones.
#[test]
fn zero_queries_give_uniform_attention() {
    let c = cfg();
    let shape = [c.n_heads, c.seq_len, c.feat_len];
    let len: usize = shape.iter().product();
    let mut rng = StdRng::seed_from_u64(7);

    let p = attention::program(&c).unwrap();
    let mut b = Bindings::new();
    b.bind("Q", TensorVal::zeros(DType::F32, &shape));
    b.bind("K", random_tensor(&mut rng, &shape));
    b.bind("V", TensorVal::from_f32(&shape, vec![1.0; len]).unwrap());
    b.bind("Y", TensorVal::zeros(DType::F32, &shape));
    run(&p, &mut b).unwrap();

    let y = b.get("Y").unwrap().as_f32().unwrap();
    let at = |i: usize, j: usize, p: usize| y[(i * c.seq_len + j) * c.feat_len + p];
    let window = (2 * c.w + 1) as f32;
    let scale = 1.0 / (c.feat_len as f32).sqrt();

    // Head 3 is undilated, j = 6 sees all five neighbors.
    assert!((at(3, 6, 0) - scale).abs() < 1e-5);
    // At j = 0 only offsets 0..=2 stay in the sequence.
    assert!((at(3, 0, 1) - 3.0 / window * scale).abs() < 1e-5);
    // Head 0 dilates by 2: j = 5 reaches 1..=9, all in bounds.
    assert!((at(0, 5, 2) - scale).abs() < 1e-5);
    // j = 1 dilated reaches {-3, -1, 1, 3, 5}: three in bounds.
    assert!((at(0, 1, 3) - 3.0 / window * scale).abs() < 1e-5);
}

/// With V = 1 each output position is the sum of its in-bounds
/// attention weights times the 1/sqrt(feat) scaling. A position whose
/// whole window is in bounds must come out at the scaling itself,
/// whatever Q and K hold: its softmax weights sum to one.
#[test]
fn interior_attention_weights_sum_to_one() {
    let c = cfg();
    let shape = [c.n_heads, c.seq_len, c.feat_len];
    let len: usize = shape.iter().product();
    let mut rng = StdRng::seed_from_u64(19);

    let p = attention::program(&c).unwrap();
    let mut b = Bindings::new();
    b.bind("Q", random_tensor(&mut rng, &shape));
    b.bind("K", random_tensor(&mut rng, &shape));
    b.bind("V", TensorVal::from_f32(&shape, vec![1.0; len]).unwrap());
    b.bind("Y", TensorVal::zeros(DType::F32, &shape));
    run(&p, &mut b).unwrap();

    let y = b.get("Y").unwrap().as_f32().unwrap();
    let at = |i: usize, j: usize, p: usize| y[(i * c.seq_len + j) * c.feat_len + p];
    let scale = 1.0 / (c.feat_len as f32).sqrt();

    for i in 0..c.n_heads {
        let reach = if i < c.dilation_heads {
            c.w * c.dilation
        } else {
            c.w
        };
        for j in reach..c.seq_len - reach {
            for p in 0..c.feat_len {
                let got = at(i, j, p);
                assert!((got - scale).abs() <= 1e-5, "head {i} position {j}: {got}");
            }
        }
        // A boundary position keeps probability mass on its skipped
        // slots, so its in-bounds weights sum to strictly less than one.
        for p in 0..c.feat_len {
            let got = at(i, 0, p);
            assert!(got < scale * 0.999, "head {i} boundary: {got}");
        }
    }
}

/// Run forward then backward, returning the per-input gradients.
fn gradients(mode: TapeMode, inputs: &Bindings, seed: &TensorVal) -> Vec<(String, TensorVal)> {
    let c = cfg();
    let p = attention::program(&c).unwrap();
    let g = grad(&p, attention::REQUIRES, attention::PROVIDES, mode).unwrap();

    let mut b = inputs.clone();
    for d in g.forward.outputs() {
        b.bind(d.name.as_str(), TensorVal::zeros(d.ty.dtype, &d.ty.shape));
    }
    run(&g.forward, &mut b).unwrap();

    b.bind(g.provides["Y"].as_str(), seed.clone());
    for d in g.backward.outputs() {
        b.bind(d.name.as_str(), TensorVal::zeros(d.ty.dtype, &d.ty.shape));
    }
    run(&g.backward, &mut b).unwrap();

    g.requires
        .iter()
        .map(|(input, grad)| (input.clone(), b.get(grad).unwrap().clone()))
        .collect()
}

#[test]
fn tape_modes_agree() {
    let c = cfg();
    let shape = [c.n_heads, c.seq_len, c.feat_len];
    let mut rng = StdRng::seed_from_u64(11);

    let mut inputs = Bindings::new();
    inputs.bind("Q", random_tensor(&mut rng, &shape));
    inputs.bind("K", random_tensor(&mut rng, &shape));
    inputs.bind("V", random_tensor(&mut rng, &shape));
    let seed = random_tensor(&mut rng, &shape);

    let full = gradients(TapeMode::All, &inputs, &seed);
    let lean = gradients(TapeMode::NoReuseOnly, &inputs, &seed);
    assert_eq!(full.len(), 3);
    for ((name_a, ga), (name_b, gb)) in full.iter().zip(&lean) {
        assert_eq!(name_a, name_b);
        let ga = ga.as_f32().unwrap();
        let gb = gb.as_f32().unwrap();
        for (a, v) in ga.iter().zip(gb) {
            assert!((a - v).abs() <= 1e-5 * a.abs().max(1.0), "{name_a}: {a} vs {v}");
        }
    }
}

/// The forward product must compute the same Y as plain inference.
#[test]
fn forward_matches_inference() {
    let c = cfg();
    let shape = [c.n_heads, c.seq_len, c.feat_len];
    let mut rng = StdRng::seed_from_u64(3);

    let p = attention::program(&c).unwrap();
    let g = grad(
        &p,
        attention::REQUIRES,
        attention::PROVIDES,
        TapeMode::NoReuseOnly,
    )
    .unwrap();

    let mut inputs = Bindings::new();
    inputs.bind("Q", random_tensor(&mut rng, &shape));
    inputs.bind("K", random_tensor(&mut rng, &shape));
    inputs.bind("V", random_tensor(&mut rng, &shape));

    let mut plain = inputs.clone();
    plain.bind("Y", TensorVal::zeros(DType::F32, &shape));
    run(&p, &mut plain).unwrap();

    let mut taped = inputs.clone();
    for d in g.forward.outputs() {
        taped.bind(d.name.as_str(), TensorVal::zeros(d.ty.dtype, &d.ty.shape));
    }
    run(&g.forward, &mut taped).unwrap();

    assert_eq!(plain.get("Y").unwrap(), taped.get("Y").unwrap());
}
