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

//! The compilation pipeline: verify, differentiate, schedule.
//!
//! [`compile`] is the one entry point the bench driver and embedders
//! use. It verifies the source program, optionally derives the
//! forward/backward pair, verifies what it generated, and schedules
//! every program for the requested target. Explicit directives apply to
//! the inference program only; generated programs are always
//! auto-scheduled.

use std::collections::BTreeMap;

use crate::autodiff::{grad, AutodiffError, TapeMode};
use crate::ir::{verify_program, Program, VerifyError};
use crate::runtime::DeviceKind;
use crate::schedule::{self, auto_schedule, Directive, ScheduleError, ScheduleReport};

#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    #[error("verification failed: {0}")]
    Verify(#[from] VerifyError),
    #[error(transparent)]
    Autodiff(#[from] AutodiffError),
    #[error(transparent)]
    Schedule(#[from] ScheduleError),
}

/// A differentiation request attached to a compile.
#[derive(Debug, Clone)]
pub struct GradRequest {
    /// Inputs to produce gradients for.
    pub requires: Vec<String>,
    /// Outputs gradient seeds are supplied for.
    pub provides: Vec<String>,
    pub mode: TapeMode,
}

#[derive(Debug, Clone)]
pub struct CompileOptions {
    pub target: DeviceKind,
    pub differentiate: Option<GradRequest>,
    /// Explicit schedule for the inference program; auto when empty.
    pub directives: Vec<Directive>,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            target: DeviceKind::Cpu,
            differentiate: None,
            directives: Vec::new(),
        }
    }
}

/// Scheduled forward/backward pair plus the gradient routing maps.
#[derive(Debug, Clone)]
pub struct GradArtifact {
    pub forward: Program,
    pub backward: Program,
    /// Input name -> gradient parameter on `backward`.
    pub requires: BTreeMap<String, String>,
    /// Output name -> seed parameter on `backward`.
    pub provides: BTreeMap<String, String>,
    /// Tape parameter names, outputs of `forward` and inputs of
    /// `backward`.
    pub tapes: Vec<String>,
    pub forward_report: ScheduleReport,
    pub backward_report: ScheduleReport,
}

/// Everything a compile produces.
#[derive(Debug, Clone)]
pub struct Artifact {
    /// The scheduled primal, suitable for plain inference.
    pub inference: Program,
    pub report: ScheduleReport,
    pub gradient: Option<GradArtifact>,
}

pub fn compile(program: &Program, options: &CompileOptions) -> Result<Artifact, CompileError> {
    verify_program(program)?;

    let scheduled = if options.directives.is_empty() {
        auto_schedule(program, options.target)
    } else {
        schedule::apply(program, &options.directives)?
    };

    let gradient = match &options.differentiate {
        Some(req) => {
            let requires: Vec<&str> = req.requires.iter().map(String::as_str).collect();
            let provides: Vec<&str> = req.provides.iter().map(String::as_str).collect();
            let g = grad(program, &requires, &provides, req.mode)?;
            // Generated programs go through the same gate as source ones.
            verify_program(&g.forward)?;
            verify_program(&g.backward)?;
            let fwd = auto_schedule(&g.forward, options.target);
            let bwd = auto_schedule(&g.backward, options.target);
            Some(GradArtifact {
                forward: fwd.program,
                backward: bwd.program,
                requires: g.requires,
                provides: g.provides,
                tapes: g.tapes,
                forward_report: fwd.report,
                backward_report: bwd.report,
            })
        }
        None => None,
    };

    Ok(Artifact {
        inference: scheduled.program,
        report: scheduled.report,
        gradient,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::ProgramBuilder;
    use crate::types::DType;

    fn saxpy() -> Program {
        let mut b = ProgramBuilder::new("saxpy");
        let x = b.input("x", DType::F32, &[8]).unwrap();
        let y = b.input("y", DType::F32, &[8]).unwrap();
        let z = b.output("z", DType::F32, &[8]).unwrap();
        let i = b.begin_for("i", 0, 8).unwrap();
        b.store(
            &z,
            &[i.clone()],
            x.at(&[i.clone()]) * crate::ir::fconst(2.0) + y.at(&[i]),
        )
        .unwrap();
        b.end_for().unwrap();
        b.finish().unwrap()
    }

    #[test]
    fn compile_schedules_and_differentiates() {
        let art = compile(
            &saxpy(),
            &CompileOptions {
                target: DeviceKind::Cpu,
                differentiate: Some(GradRequest {
                    requires: vec!["x".into(), "y".into()],
                    provides: vec!["z".into()],
                    mode: TapeMode::NoReuseOnly,
                }),
                directives: Vec::new(),
            },
        )
        .unwrap();
        assert_eq!(art.report.parallelized, vec!["i".to_string()]);
        let g = art.gradient.unwrap();
        assert_eq!(g.requires.len(), 2);
        assert!(g.tapes.is_empty());
        // The gradient zero-fills are parallel too; the reversed main
        // loop must be among the marks.
        assert!(g.backward_report.parallelized.contains(&"i".to_string()));
    }

    #[test]
    fn bad_directives_fail_the_compile() {
        let err = compile(
            &saxpy(),
            &CompileOptions {
                directives: vec![Directive::Parallelize("nope".into())],
                ..CompileOptions::default()
            },
        )
        .unwrap_err();
        assert!(matches!(
            err,
            CompileError::Schedule(ScheduleError::UnknownLoop(_))
        ));
    }
}
