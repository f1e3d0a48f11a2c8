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

//! weft-bench: end-to-end driver for the benchmark kernels.
//!
//! Each subcommand loads its input tensors from flat text files in the
//! data directory, compiles the kernel for the chosen target, times
//! inference plus the forward/backward gradient pair, and writes the
//! outputs and gradients back as `.out` files.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};

use weft::autodiff::TapeMode;
use weft::exec::{self, Bindings, TensorVal};
use weft::io::{load_txt, store_txt};
use weft::ir::Program;
use weft::kernels::{attention, meshconv, rasterize};
use weft::pipeline::{compile, Artifact, CompileOptions, GradRequest};
use weft::runtime::{measure, Device, DeviceKind};
use weft::types::DType;

#[derive(Parser, Debug)]
#[command(name = "weft-bench")]
#[command(about = "Run the WEFT benchmark kernels", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Execution target ('cpu' or 'gpu')
    #[arg(value_name = "TARGET", default_value = "cpu")]
    target: DeviceKind,

    /// Directory holding the .in tensor files; .out files go here too
    #[arg(long, default_value = ".")]
    data_dir: PathBuf,

    /// Untimed iterations before each measurement
    #[arg(long, default_value_t = 10)]
    warmup_repeat: usize,

    /// Timed iterations per measurement
    #[arg(long, default_value_t = 100)]
    timing_repeat: usize,

    /// Record every scoped local on the tape, not only the reused ones
    #[arg(long)]
    ad_save_all: bool,
}

impl RunArgs {
    fn options(&self, requires: &[&str], provides: &[&str]) -> CompileOptions {
        let mode = if self.ad_save_all {
            TapeMode::All
        } else {
            TapeMode::NoReuseOnly
        };
        CompileOptions {
            target: self.target,
            differentiate: Some(GradRequest {
                requires: requires.iter().map(|s| s.to_string()).collect(),
                provides: provides.iter().map(|s| s.to_string()).collect(),
                mode,
            }),
            directives: Vec::new(),
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Sliding-window attention with per-head dilation
    Attention {
        #[command(flatten)]
        run: RunArgs,

        /// Half window size
        #[arg(long, default_value_t = 32)]
        w: usize,

        /// Stride of the dilated heads' windows
        #[arg(long, default_value_t = 4)]
        dilation: usize,

        /// Number of leading heads that dilate their window
        #[arg(long, default_value_t = 2)]
        dilation_heads: usize,
    },

    /// Soft triangle rasterization
    Rasterize {
        #[command(flatten)]
        run: RunArgs,

        /// Output image height in pixels
        #[arg(long, default_value_t = 64)]
        height: usize,

        /// Output image width in pixels
        #[arg(long, default_value_t = 64)]
        width: usize,
    },

    /// Mesh face convolution over a 3-regular adjacency
    Meshconv {
        #[command(flatten)]
        run: RunArgs,
    },
}

fn main() -> Result<()> {
    match Cli::parse().command {
        Commands::Attention {
            run,
            w,
            dilation,
            dilation_heads,
        } => bench_attention(&run, w, dilation, dilation_heads),
        Commands::Rasterize { run, height, width } => bench_rasterize(&run, height, width),
        Commands::Meshconv { run } => bench_meshconv(&run),
    }
}

fn bench_attention(args: &RunArgs, w: usize, dilation: usize, dilation_heads: usize) -> Result<()> {
    let dir = args.data_dir.as_path();
    let q = load(dir, "q.in")?;
    let k = load(dir, "k.in")?;
    let v = load(dir, "v.in")?;
    let shape = q.shape().to_vec();
    if shape.len() != 3 {
        bail!("q.in must be rank 3 (heads, sequence, features), got rank {}", shape.len());
    }
    let cfg = attention::AttentionConfig {
        n_heads: shape[0],
        seq_len: shape[1],
        feat_len: shape[2],
        w,
        dilation,
        dilation_heads,
    };
    let program = attention::program(&cfg)?;
    let art = compile(&program, &args.options(attention::REQUIRES, attention::PROVIDES))?;

    let mut bindings = Bindings::new();
    bindings.bind("Q", q);
    bindings.bind("K", k);
    bindings.bind("V", v);
    bindings.bind("Y", TensorVal::zeros(DType::F32, &shape));
    bench_artifact(args, dir, &art, &mut bindings)
}

fn bench_rasterize(args: &RunArgs, height: usize, width: usize) -> Result<()> {
    let dir = args.data_dir.as_path();
    let vertices = load(dir, "vertices.in")?;
    let faces = load(dir, "faces.in")?;
    if vertices.shape().len() != 2 || faces.shape().len() != 2 {
        bail!("vertices.in and faces.in must be rank 2");
    }
    let cfg = rasterize::RasterizeConfig {
        n_verts: vertices.shape()[0],
        n_faces: faces.shape()[0],
        height,
        width,
    };
    let program = rasterize::program(&cfg)?;
    let art = compile(&program, &args.options(rasterize::REQUIRES, rasterize::PROVIDES))?;

    let mut bindings = Bindings::new();
    bindings.bind("vertices", vertices);
    bindings.bind("faces", faces);
    bindings.bind(
        "y",
        TensorVal::zeros(DType::F32, &[cfg.n_faces, height, width]),
    );
    bench_artifact(args, dir, &art, &mut bindings)
}

fn bench_meshconv(args: &RunArgs) -> Result<()> {
    let dir = args.data_dir.as_path();
    let adj = load(dir, "adj.in")?;
    let x = load(dir, "x.in")?;
    let w0 = load(dir, "w0.in")?;
    let w1 = load(dir, "w1.in")?;
    let w2 = load(dir, "w2.in")?;
    let w3 = load(dir, "w3.in")?;
    if x.shape().len() != 2 || w0.shape().len() != 2 {
        bail!("x.in and w0.in must be rank 2");
    }
    let cfg = meshconv::MeshConvConfig {
        n_faces: x.shape()[0],
        in_feats: x.shape()[1],
        out_feats: w0.shape()[1],
    };
    let program = meshconv::program(&cfg)?;
    let art = compile(&program, &args.options(meshconv::REQUIRES, meshconv::PROVIDES))?;

    let mut bindings = Bindings::new();
    bindings.bind("adj", adj);
    bindings.bind("x", x);
    bindings.bind("w0", w0);
    bindings.bind("w1", w1);
    bindings.bind("w2", w2);
    bindings.bind("w3", w3);
    bindings.bind(
        "y",
        TensorVal::zeros(DType::F32, &[cfg.n_faces, cfg.out_feats]),
    );
    bench_artifact(args, dir, &art, &mut bindings)
}

/// Time inference, then the gradient pair, writing every produced tensor
/// to `<name>.out` / `d_<name>.out` next to the inputs.
fn bench_artifact(
    args: &RunArgs,
    dir: &Path,
    art: &Artifact,
    bindings: &mut Bindings,
) -> Result<()> {
    let device = Device::new(args.target);

    time_one(args, &device, "Inference", &art.inference, bindings)?;
    for d in art.inference.outputs() {
        let val = bindings
            .get(&d.name)
            .with_context(|| format!("output '{}' was not produced", d.name))?;
        store_txt(&dir.join(format!("{}.out", d.name.to_lowercase())), val)?;
    }

    let Some(g) = &art.gradient else {
        return Ok(());
    };

    for d in g.forward.outputs() {
        if !bindings.contains(&d.name) {
            bindings.bind(d.name.as_str(), TensorVal::zeros(d.ty.dtype, &d.ty.shape));
        }
    }
    time_one(args, &device, "Forward", &g.forward, bindings)?;

    for (output, seed) in &g.provides {
        let file = format!("d_{}.in", output.to_lowercase());
        bindings.bind(seed.as_str(), load(dir, &file)?);
    }
    for d in g.backward.outputs() {
        bindings.bind(d.name.as_str(), TensorVal::zeros(d.ty.dtype, &d.ty.shape));
    }
    time_one(args, &device, "Backward", &g.backward, bindings)?;

    for (input, grad) in &g.requires {
        let val = bindings
            .get(grad)
            .with_context(|| format!("gradient '{grad}' was not produced"))?;
        store_txt(&dir.join(format!("d_{}.out", input.to_lowercase())), val)?;
    }
    Ok(())
}

fn time_one(
    args: &RunArgs,
    device: &Device,
    label: &str,
    program: &Program,
    bindings: &mut Bindings,
) -> Result<()> {
    let elapsed = measure(args.warmup_repeat, args.timing_repeat, || {
        run_on(device, program, bindings)?;
        device.sync().map_err(anyhow::Error::from)
    })?;
    println!("{label} Time = {} ms", elapsed.as_secs_f64() * 1e3);
    Ok(())
}

/// Dispatch to the registered backend or the host interpreter.
fn run_on(device: &Device, program: &Program, bindings: &mut Bindings) -> Result<()> {
    match device.backend() {
        Some(b) => b.run(program, bindings).map_err(anyhow::Error::from),
        None => exec::run(program, bindings).map_err(anyhow::Error::from),
    }
}

fn load(dir: &Path, name: &str) -> Result<TensorVal> {
    let path = dir.join(name);
    load_txt(&path).with_context(|| format!("loading {}", path.display()))
}
