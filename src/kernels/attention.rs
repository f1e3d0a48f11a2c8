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

//! Sliding-window attention with per-head dilation.
//!
//! Each query position attends to the `2w + 1` key positions in a
//! window around it. The first [`dilation_heads`] heads stride that
//! window by [`dilation`]; the rest use consecutive positions. Window
//! slots that fall off either end of the sequence are skipped, so no
//! padding tensors are involved.
//!
//! [`dilation_heads`]: AttentionConfig::dilation_heads
//! [`dilation`]: AttentionConfig::dilation

use crate::ir::{
    self, exp, fconst, iconst, select, sqrt, BuildError, Program, ProgramBuilder, ReduceOp,
};
use crate::types::DType;

/// Problem sizes for [`program`].
#[derive(Debug, Clone, Copy)]
pub struct AttentionConfig {
    pub n_heads: usize,
    pub seq_len: usize,
    pub feat_len: usize,
    /// Half window; a query sees `2 * w + 1` keys.
    pub w: usize,
    pub dilation: usize,
    /// Number of leading heads that use the dilated window.
    pub dilation_heads: usize,
}

impl Default for AttentionConfig {
    fn default() -> Self {
        Self {
            n_heads: 8,
            seq_len: 10000,
            feat_len: 512,
            w: 32,
            dilation: 4,
            dilation_heads: 2,
        }
    }
}

/// Inputs gradients are requested for.
pub const REQUIRES: &[&str] = &["Q", "K", "V"];
/// Outputs gradient seeds are supplied for.
pub const PROVIDES: &[&str] = &["Y"];

pub fn program(cfg: &AttentionConfig) -> Result<Program, BuildError> {
    let heads = cfg.n_heads;
    let seq = cfg.seq_len as i64;
    let feat = cfg.feat_len as i64;
    let w = cfg.w as i64;
    let window = (2 * cfg.w + 1) as i64;

    let mut b = ProgramBuilder::new("attention");
    let shape = [heads, cfg.seq_len, cfg.feat_len];
    let q = b.input("Q", DType::F32, &shape)?;
    let k_in = b.input("K", DType::F32, &shape)?;
    let v_in = b.input("V", DType::F32, &shape)?;
    let y = b.output("Y", DType::F32, &shape)?;

    let i = b.begin_for("i", 0, heads as i64)?;
    let j = b.begin_for("j", 0, seq)?;

    // Key offset for window slot k: dilated on the leading heads.
    let offset = |k: &ir::Expr| {
        select(
            i.clone().ge(iconst(cfg.dilation_heads as i64)),
            k.clone(),
            k.clone() * iconst(cfg.dilation as i64),
        )
    };
    let in_bounds = |k: &ir::Expr| {
        let pos = j.clone() + offset(k);
        pos.clone().ge(iconst(0)).and(pos.lt(iconst(seq)))
    };

    let dot = b.local("dot", DType::F32, &[window as usize])?;
    let k = b.begin_for("k", -w, w + 1)?;
    b.store(&dot, &[k.clone() + iconst(w)], 0.0f32)?;
    b.begin_if(in_bounds(&k))?;
    let p = b.begin_for("p", 0, feat)?;
    b.reduce(
        &dot,
        &[k.clone() + iconst(w)],
        ReduceOp::Add,
        q.at(&[i.clone(), j.clone(), p.clone()])
            * k_in.at(&[i.clone(), j.clone() + offset(&k), p]),
    )?;
    b.end_for()?;
    b.end_if()?;
    b.end_for()?;

    let maxval = b.local("maxval", DType::F32, &[])?;
    b.store(&maxval, &[], f32::NEG_INFINITY)?;
    let k = b.begin_for("k", 0, window)?;
    b.reduce(&maxval, &[], ReduceOp::Max, dot.at(&[k]))?;
    b.end_for()?;

    let expval = b.local("expval", DType::F32, &[window as usize])?;
    let k = b.begin_for("k", 0, window)?;
    b.store(&expval, &[k.clone()], exp(dot.at(&[k]) - maxval.get()))?;
    b.end_for()?;

    let expsum = b.local("expsum", DType::F32, &[])?;
    b.store(&expsum, &[], 0.0f32)?;
    let k = b.begin_for("k", 0, window)?;
    b.reduce(&expsum, &[], ReduceOp::Add, expval.at(&[k]))?;
    b.end_for()?;

    let attn = b.local("attn", DType::F32, &[window as usize])?;
    let k = b.begin_for("k", 0, window)?;
    b.store(
        &attn,
        &[k.clone()],
        expval.at(&[k]) / expsum.get() / sqrt(fconst(cfg.feat_len as f32)),
    )?;
    b.end_for()?;

    let p = b.begin_for("p", 0, feat)?;
    b.store(&y, &[i.clone(), j.clone(), p], 0.0f32)?;
    b.end_for()?;
    let k = b.begin_for("k", -w, w + 1)?;
    b.begin_if(in_bounds(&k))?;
    let p = b.begin_for("p", 0, feat)?;
    b.reduce(
        &y,
        &[i.clone(), j.clone(), p.clone()],
        ReduceOp::Add,
        attn.at(&[k.clone() + iconst(w)]) * v_in.at(&[i.clone(), j.clone() + offset(&k), p]),
    )?;
    b.end_for()?;
    b.end_if()?;
    b.end_for()?;

    b.end_for()?;
    b.end_for()?;
    b.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::verify_program;

    fn tiny() -> AttentionConfig {
        AttentionConfig {
            n_heads: 4,
            seq_len: 16,
            feat_len: 8,
            w: 2,
            dilation: 3,
            dilation_heads: 2,
        }
    }

    #[test]
    fn builds_and_verifies() {
        let p = program(&tiny()).unwrap();
        verify_program(&p).unwrap();
        assert_eq!(p.params.len(), 4);
    }

    #[test]
    fn differentiates_in_both_tape_modes() {
        use crate::autodiff::{grad, TapeMode};
        let p = program(&tiny()).unwrap();
        for mode in [TapeMode::All, TapeMode::NoReuseOnly] {
            let g = grad(&p, REQUIRES, PROVIDES, mode).unwrap();
            verify_program(&g.forward).unwrap();
            verify_program(&g.backward).unwrap();
        }
        // Reduction-defined locals are recorded even in the lean mode.
        let g = grad(&p, REQUIRES, PROVIDES, TapeMode::NoReuseOnly).unwrap();
        assert!(g.tapes.contains(&"dot.tape".to_string()));
        assert!(g.tapes.contains(&"maxval.tape".to_string()));
        assert!(g.tapes.contains(&"expsum.tape".to_string()));
        assert!(!g.tapes.contains(&"expval.tape".to_string()));
        assert!(!g.tapes.contains(&"attn.tape".to_string()));
    }
}
