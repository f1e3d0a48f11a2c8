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

//! Loop scheduling.
//!
//! The scheduler marks loops for parallel or lane-wise execution
//! without changing program semantics. A loop may run its iterations
//! concurrently only when no two iterations touch the same element of
//! any tensor declared outside the loop; the test here is conservative:
//! for every such tensor written in the loop body there must be an index
//! position that is syntactically identical across all of the tensor's
//! accesses, affine in the candidate iterator with a nonzero stride, and
//! built only from the candidate, enclosing iterators, and constants.
//! Anything the test cannot prove safe stays serial. In particular,
//! reductions into a loop-invariant element and data-dependent scatters
//! are never parallelized.
//!
//! [`auto_schedule`] never fails; it parallelizes what it can prove and
//! leaves the rest alone. [`apply`] honors explicit directives and
//! rejects any directive the same proof cannot justify.

use std::collections::{BTreeMap, BTreeSet};

use crate::ir::{BinOp, Expr, Parallelism, Program, Stmt, UnOp};
use crate::runtime::DeviceKind;

/// Errors raised while applying explicit schedule directives.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ScheduleError {
    #[error("no loop with iterator '{0}'")]
    UnknownLoop(String),
    #[error("scheduling loop '{iter}' would violate a dependence on '{var}'")]
    DependencyViolation { iter: String, var: String },
}

/// An explicit scheduling request, addressed by iterator name. A name
/// shared by sibling loops addresses all of them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    Parallelize(String),
    Vectorize(String),
}

/// What the scheduler did, in traversal order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScheduleReport {
    pub parallelized: Vec<String>,
    pub vectorized: Vec<String>,
}

/// A scheduled program plus the decisions that produced it.
#[derive(Debug, Clone)]
pub struct Scheduled {
    pub program: Program,
    pub report: ScheduleReport,
}

/// Parallelize every loop the dependence test can prove safe, outermost
/// first: one nesting level per loop nest on the CPU, two on the GPU
/// (block and thread dimensions). Innermost loops that pass the same
/// test are additionally marked for lane-wise execution.
pub fn auto_schedule(p: &Program, target: DeviceKind) -> Scheduled {
    let levels = match target {
        DeviceKind::Cpu => 1,
        DeviceKind::Gpu => 2,
    };
    let mut program = p.clone();
    let mut report = ScheduleReport::default();
    let mut outer = Vec::new();
    auto_block(&mut program.body, &mut outer, levels, &mut report);
    Scheduled { program, report }
}

fn auto_block(
    stmts: &mut [Stmt],
    outer: &mut Vec<String>,
    levels: usize,
    report: &mut ScheduleReport,
) {
    for s in stmts {
        match s {
            Stmt::For(l) => {
                let mut remaining = levels;
                let outer_set: BTreeSet<String> = outer.iter().cloned().collect();
                if remaining > 0 && can_parallelize(&l.iter, &l.body, &outer_set).is_ok() {
                    l.parallel = Parallelism::Parallel;
                    report.parallelized.push(l.iter.clone());
                    remaining -= 1;
                }
                outer.push(l.iter.clone());
                auto_block(&mut l.body, outer, remaining, report);
                outer.pop();
                if l.parallel == Parallelism::Serial && is_innermost(&l.body) {
                    let outer_set: BTreeSet<String> = outer.iter().cloned().collect();
                    if can_parallelize(&l.iter, &l.body, &outer_set).is_ok() {
                        l.parallel = Parallelism::Vectorize;
                        report.vectorized.push(l.iter.clone());
                    }
                }
            }
            Stmt::If {
                then_body,
                else_body,
                ..
            } => {
                auto_block(then_body, outer, levels, report);
                auto_block(else_body, outer, levels, report);
            }
            Stmt::Alloc { body, .. } => auto_block(body, outer, levels, report),
            Stmt::Store { .. } | Stmt::Reduce { .. } => {}
        }
    }
}

/// Apply explicit directives. Every directive must name an existing
/// loop and pass the dependence test, otherwise the whole schedule is
/// rejected and the program is returned unchanged to the caller.
pub fn apply(p: &Program, directives: &[Directive]) -> Result<Scheduled, ScheduleError> {
    let mut program = p.clone();
    let mut report = ScheduleReport::default();
    for d in directives {
        let (iter, lanes) = match d {
            Directive::Parallelize(i) => (i, false),
            Directive::Vectorize(i) => (i, true),
        };
        let mut found = false;
        let mut outer = Vec::new();
        apply_block(
            &mut program.body,
            &mut outer,
            iter,
            lanes,
            &mut found,
            &mut report,
        )?;
        if !found {
            return Err(ScheduleError::UnknownLoop(iter.clone()));
        }
    }
    Ok(Scheduled { program, report })
}

fn apply_block(
    stmts: &mut [Stmt],
    outer: &mut Vec<String>,
    iter: &str,
    lanes: bool,
    found: &mut bool,
    report: &mut ScheduleReport,
) -> Result<(), ScheduleError> {
    for s in stmts {
        match s {
            Stmt::For(l) => {
                if l.iter == iter {
                    *found = true;
                    let outer_set: BTreeSet<String> = outer.iter().cloned().collect();
                    if let Err(var) = can_parallelize(&l.iter, &l.body, &outer_set) {
                        return Err(ScheduleError::DependencyViolation {
                            iter: iter.to_string(),
                            var,
                        });
                    }
                    if lanes {
                        l.parallel = Parallelism::Vectorize;
                        report.vectorized.push(l.iter.clone());
                    } else {
                        l.parallel = Parallelism::Parallel;
                        report.parallelized.push(l.iter.clone());
                    }
                }
                outer.push(l.iter.clone());
                apply_block(&mut l.body, outer, iter, lanes, found, report)?;
                outer.pop();
            }
            Stmt::If {
                then_body,
                else_body,
                ..
            } => {
                apply_block(then_body, outer, iter, lanes, found, report)?;
                apply_block(else_body, outer, iter, lanes, found, report)?;
            }
            Stmt::Alloc { body, .. } => {
                apply_block(body, outer, iter, lanes, found, report)?
            }
            Stmt::Store { .. } | Stmt::Reduce { .. } => {}
        }
    }
    Ok(())
}

/// Is this loop body free of nested loops?
fn is_innermost(body: &[Stmt]) -> bool {
    let mut nested = false;
    for s in body {
        s.visit(&mut |s| {
            if matches!(s, Stmt::For(_)) {
                nested = true;
            }
        });
    }
    !nested
}

/// Every access (read or write) of one tensor inside the candidate
/// loop, as its index vector.
#[derive(Default)]
struct Accesses {
    map: BTreeMap<String, Vec<Vec<Expr>>>,
    written: BTreeSet<String>,
    scoped: BTreeSet<String>,
}

fn collect_accesses(stmts: &[Stmt], acc: &mut Accesses) {
    let mut record_loads = |acc: &mut Accesses, e: &Expr| {
        e.for_each_load(&mut |var, indices| {
            acc.map
                .entry(var.to_string())
                .or_default()
                .push(indices.to_vec());
        });
    };
    for s in stmts {
        match s {
            Stmt::Store {
                var,
                indices,
                value,
            }
            | Stmt::Reduce {
                var,
                indices,
                value,
                ..
            } => {
                acc.written.insert(var.clone());
                acc.map
                    .entry(var.clone())
                    .or_default()
                    .push(indices.to_vec());
                for i in indices {
                    record_loads(acc, i);
                }
                record_loads(acc, value);
            }
            Stmt::If {
                cond,
                then_body,
                else_body,
            } => {
                record_loads(acc, cond);
                collect_accesses(then_body, acc);
                collect_accesses(else_body, acc);
            }
            Stmt::For(l) => {
                record_loads(acc, &l.begin);
                record_loads(acc, &l.end);
                collect_accesses(&l.body, acc);
            }
            Stmt::Alloc { decl, body } => {
                // Scoped locals are reinstantiated per iteration and
                // cannot carry a cross-iteration dependence.
                acc.scoped.insert(decl.name.clone());
                collect_accesses(body, acc);
            }
        }
    }
}

/// Prove that no two iterations of the loop over `iter` touch the same
/// element of any tensor declared outside it. On failure, returns the
/// name of the offending tensor.
fn can_parallelize(
    iter: &str,
    body: &[Stmt],
    outer: &BTreeSet<String>,
) -> Result<(), String> {
    let mut acc = Accesses::default();
    collect_accesses(body, &mut acc);
    for var in &acc.written {
        if acc.scoped.contains(var) {
            continue;
        }
        let accesses = match acc.map.get(var) {
            Some(a) if !a.is_empty() => a,
            _ => continue,
        };
        if !has_distinguishing_position(accesses, iter, outer) {
            return Err(var.clone());
        }
    }
    Ok(())
}

fn has_distinguishing_position(
    accesses: &[Vec<Expr>],
    iter: &str,
    outer: &BTreeSet<String>,
) -> bool {
    let rank = accesses[0].len();
    'pos: for p in 0..rank {
        let probe = &accesses[0][p];
        for a in accesses {
            if a.len() != rank || a[p] != *probe {
                continue 'pos;
            }
        }
        match linear_coeff(probe, iter) {
            Some(c) if c != 0 => {
                let mut free = BTreeSet::new();
                probe.free_iters(&mut free);
                if free.iter().all(|f| f == iter || outer.contains(f)) {
                    return true;
                }
            }
            _ => {}
        }
    }
    false
}

fn mentions(e: &Expr, iter: &str) -> bool {
    let mut free = BTreeSet::new();
    e.free_iters(&mut free);
    free.contains(iter)
}

fn has_load(e: &Expr) -> bool {
    let mut found = false;
    e.for_each_load(&mut |_, _| found = true);
    found
}

/// Coefficient of `iter` when the expression is affine in it; `None`
/// when the expression is not provably affine. Expressions that do not
/// mention `iter` are invariant (coefficient zero) unless they read
/// memory, which may change across iterations.
fn linear_coeff(e: &Expr, iter: &str) -> Option<i64> {
    if !mentions(e, iter) {
        return if has_load(e) { None } else { Some(0) };
    }
    match e {
        Expr::Iter(n) if n == iter => Some(1),
        Expr::Cast { arg, .. } => linear_coeff(arg, iter),
        Expr::Unary {
            op: UnOp::Neg,
            arg,
        } => linear_coeff(arg, iter).map(|c| -c),
        Expr::Binary { op, lhs, rhs } => match op {
            BinOp::Add => Some(linear_coeff(lhs, iter)? + linear_coeff(rhs, iter)?),
            BinOp::Sub => Some(linear_coeff(lhs, iter)? - linear_coeff(rhs, iter)?),
            BinOp::Mul => {
                if let Some(k) = lhs.as_const_int() {
                    linear_coeff(rhs, iter).map(|c| k * c)
                } else if let Some(k) = rhs.as_const_int() {
                    linear_coeff(lhs, iter).map(|c| k * c)
                } else {
                    None
                }
            }
            _ => None,
        },
        _ => None,
    }
}
