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

//! Whole-pipeline compiles of the benchmark kernels.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use weft::autodiff::TapeMode;
use weft::exec::{run, Bindings, TensorVal};
use weft::kernels::{attention, meshconv, rasterize};
use weft::pipeline::{compile, CompileError, CompileOptions, GradRequest};
use weft::runtime::DeviceKind;
use weft::schedule::{Directive, ScheduleError};
use weft::types::DType;

fn request(requires: &[&str], provides: &[&str], mode: TapeMode) -> GradRequest {
    GradRequest {
        requires: requires.iter().map(|s| s.to_string()).collect(),
        provides: provides.iter().map(|s| s.to_string()).collect(),
        mode,
    }
}

fn attention_cfg() -> attention::AttentionConfig {
    attention::AttentionConfig {
        n_heads: 2,
        seq_len: 8,
        feat_len: 4,
        w: 1,
        dilation: 2,
        dilation_heads: 1,
    }
}

#[test]
fn attention_compiles_for_both_targets() {
    let p = attention::program(&attention_cfg()).unwrap();
    for target in [DeviceKind::Cpu, DeviceKind::Gpu] {
        let art = compile(
            &p,
            &CompileOptions {
                target,
                differentiate: Some(request(
                    attention::REQUIRES,
                    attention::PROVIDES,
                    TapeMode::NoReuseOnly,
                )),
                directives: Vec::new(),
            },
        )
        .unwrap();
        // The head loop carries no dependence in any of the programs.
        assert!(art.report.parallelized.contains(&"i".to_string()));
        let g = art.gradient.unwrap();
        assert!(!g.tapes.is_empty());
        assert!(g.forward_report.parallelized.contains(&"i".to_string()));
        assert!(g.backward_report.parallelized.contains(&"i".to_string()));
        if target == DeviceKind::Gpu {
            // Two levels per nest on the GPU shape.
            assert!(art.report.parallelized.contains(&"j".to_string()));
        } else {
            assert!(!art.report.parallelized.contains(&"j".to_string()));
        }
    }
}

/// Both targets run on the host pool; the gpu shape differs only in
/// its second nested parallel level, which must not change the values.
#[test]
fn cpu_and_gpu_targets_agree_on_outputs() {
    let c = attention_cfg();
    let p = attention::program(&c).unwrap();
    let shape = [c.n_heads, c.seq_len, c.feat_len];
    let len: usize = shape.iter().product();
    let mut rng = StdRng::seed_from_u64(13);
    let values: Vec<f32> = (0..3 * len).map(|_| rng.gen_range(-1.0..1.0)).collect();

    let mut inputs = Bindings::new();
    for (name, chunk) in ["Q", "K", "V"].iter().zip(values.chunks(len)) {
        inputs.bind(*name, TensorVal::from_f32(&shape, chunk.to_vec()).unwrap());
    }

    let mut outputs = Vec::new();
    for target in [DeviceKind::Cpu, DeviceKind::Gpu] {
        let art = compile(
            &p,
            &CompileOptions {
                target,
                differentiate: None,
                directives: Vec::new(),
            },
        )
        .unwrap();
        let mut b = inputs.clone();
        b.bind("Y", TensorVal::zeros(DType::F32, &shape));
        run(&art.inference, &mut b).unwrap();
        outputs.push(b.get("Y").unwrap().as_f32().unwrap().to_vec());
    }
    for (a, b) in outputs[0].iter().zip(&outputs[1]) {
        assert!((a - b).abs() <= 1e-5 * b.abs().max(1.0), "cpu {a} vs gpu {b}");
    }
}

#[test]
fn meshconv_backward_scatter_stays_serial() {
    let p = meshconv::program(&meshconv::MeshConvConfig {
        n_faces: 4,
        in_feats: 3,
        out_feats: 2,
    })
    .unwrap();
    let art = compile(
        &p,
        &CompileOptions {
            target: DeviceKind::Cpu,
            differentiate: Some(request(
                meshconv::REQUIRES,
                meshconv::PROVIDES,
                TapeMode::All,
            )),
            directives: Vec::new(),
        },
    )
    .unwrap();
    assert!(art.report.parallelized.contains(&"i".to_string()));
    let g = art.gradient.unwrap();
    // Forward writes stay face-local, but the backward scatters into
    // x.grad through the adjacency gather.
    assert!(g.forward_report.parallelized.contains(&"i".to_string()));
    assert!(!g.backward_report.parallelized.contains(&"i".to_string()));
}

#[test]
fn rasterize_compiles_without_directives() {
    let p = rasterize::program(&rasterize::RasterizeConfig {
        n_verts: 4,
        n_faces: 2,
        height: 6,
        width: 6,
    })
    .unwrap();
    let art = compile(
        &p,
        &CompileOptions {
            target: DeviceKind::Gpu,
            differentiate: Some(request(
                rasterize::REQUIRES,
                rasterize::PROVIDES,
                TapeMode::NoReuseOnly,
            )),
            directives: Vec::new(),
        },
    )
    .unwrap();
    assert!(art.report.parallelized.contains(&"i".to_string()));
    let g = art.gradient.unwrap();
    assert!(g.tapes.contains(&"e_dist.tape".to_string()));
}

#[test]
fn explicit_directives_are_validated() {
    let p = attention::program(&attention_cfg()).unwrap();
    let ok = compile(
        &p,
        &CompileOptions {
            target: DeviceKind::Cpu,
            differentiate: None,
            directives: vec![Directive::Parallelize("j".to_string())],
        },
    )
    .unwrap();
    assert_eq!(ok.report.parallelized, vec!["j".to_string()]);

    let err = compile(
        &p,
        &CompileOptions {
            target: DeviceKind::Cpu,
            differentiate: None,
            directives: vec![Directive::Parallelize("nope".to_string())],
        },
    )
    .unwrap_err();
    assert!(matches!(
        err,
        CompileError::Schedule(ScheduleError::UnknownLoop(_))
    ));
}
