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

//! The differentiation engine.
//!
//! Differentiation is a source-to-source transform over the statement
//! tree. An analysis pass classifies every scoped local: which ones the
//! backward pass reads, which are defined by reductions or conditional
//! stores, and which loops enclose their allocation. The tape decision
//! follows from the [`TapeMode`]: a taped local's allocation is spliced
//! out of the forward program and every access is redirected into a
//! tape tensor indexed by the enclosing loop iterations; an untaped
//! local the backward pass recomputes by replaying its defining stores.
//!
//! The backward body mirrors the primal structure in reverse: blocks
//! are walked back to front, loops run their iteration ranges
//! backwards, and each store or reduction emits the adjoints of its
//! operands. A store into a local also clears that local's gradient
//! slot afterwards, since the overwritten definition must not leak
//! gradient into earlier statements.
//!
//! Tapes hold one value per tensor element, the value it had when its
//! scope closed. A local element must therefore be stored at most once
//! per scope instance: two stores to the same local are accepted only
//! when they provably target different elements (a constant index axis
//! differs) or sit in mutually exclusive conditional arms. Anything
//! else is rejected with [`AutodiffError::Overwrite`].

use std::collections::{BTreeMap, BTreeSet};

use crate::ir::{self, Expr, Loop, Parallelism, Program, ReduceOp, Stmt, VarDecl};
use crate::types::{DType, Role};

use super::rules::{self, AdjointSink};
use super::TapeMode;

/// Errors raised while differentiating a program.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum AutodiffError {
    #[error("unknown variable '{0}'")]
    UnknownVariable(String),
    #[error("'{0}' is not an input; gradients are taken with respect to inputs")]
    NotAnInput(String),
    #[error("'{0}' is not an output; gradient seeds are supplied for outputs")]
    NotAnOutput(String),
    #[error("'{0}' is not a float tensor and cannot carry a gradient")]
    NotDifferentiable(String),
    #[error("program reads its own output '{0}', which differentiation does not support")]
    OutputRead(String),
    #[error("local '{0}' is overwritten and has no single recordable value")]
    Overwrite(String),
    #[error("local '{0}' collides with another declaration")]
    DuplicateLocal(String),
    #[error("local '{local}' must be recorded but enclosing loop '{iter}' has non-constant bounds")]
    DynamicLoopBound { local: String, iter: String },
    #[error("cannot recompute '{local}': it reads scoped local '{dependency}'")]
    Recompute { local: String, dependency: String },
}

/// Output of [`grad`]: the forward and backward programs plus the name
/// maps tying caller-visible tensors to their gradient parameters.
#[derive(Debug, Clone)]
pub struct GradProducts {
    /// The primal computation plus tape writes. Signature is the primal
    /// signature followed by one output tensor per tape.
    pub forward: Program,
    /// Consumes the primal inputs, the tapes, and one gradient seed per
    /// designated output; produces one gradient tensor per designated
    /// input.
    pub backward: Program,
    /// Designated input name -> its gradient parameter in `backward`.
    pub requires: BTreeMap<String, String>,
    /// Designated output name -> its seed parameter in `backward`.
    pub provides: BTreeMap<String, String>,
    /// Tape tensor names, also present on both signatures.
    pub tapes: Vec<String>,
}

fn tape_name(var: &str) -> String {
    format!("{var}.tape")
}

fn grad_name(var: &str) -> String {
    format!("{var}.grad")
}

/// Differentiate `primal` with respect to the inputs in `requires`,
/// seeding from the outputs in `provides`. The primal is not modified.
///
/// An input in `requires` that no output in `provides` depends on gets
/// an all-zero gradient tensor; this is well-defined, not an error.
pub fn grad(
    primal: &Program,
    requires: &[&str],
    provides: &[&str],
    mode: TapeMode,
) -> Result<GradProducts, AutodiffError> {
    for name in requires {
        let d = primal
            .param(name)
            .ok_or_else(|| AutodiffError::UnknownVariable(name.to_string()))?;
        if d.role != Role::Input {
            return Err(AutodiffError::NotAnInput(name.to_string()));
        }
        if !d.ty.dtype.is_float() {
            return Err(AutodiffError::NotDifferentiable(name.to_string()));
        }
    }
    for name in provides {
        let d = primal
            .param(name)
            .ok_or_else(|| AutodiffError::UnknownVariable(name.to_string()))?;
        if d.role != Role::Output {
            return Err(AutodiffError::NotAnOutput(name.to_string()));
        }
        if !d.ty.dtype.is_float() {
            return Err(AutodiffError::NotDifferentiable(name.to_string()));
        }
    }
    // Normalize to signature order so the generated programs do not
    // depend on the order the caller listed the names in.
    let requires: Vec<String> = primal
        .params
        .iter()
        .filter(|d| requires.contains(&d.name.as_str()))
        .map(|d| d.name.clone())
        .collect();
    let provides: Vec<String> = primal
        .params
        .iter()
        .filter(|d| provides.contains(&d.name.as_str()))
        .map(|d| d.name.clone())
        .collect();

    let mut analyzer = Analyzer::new(primal);
    analyzer.block(&primal.body)?;
    let Analyzer {
        locals,
        reads,
        minmax_outputs,
        overwritten,
        ..
    } = analyzer;

    let mut taped = BTreeSet::new();
    let mut tape_prefix = BTreeMap::new();
    let mut tape_decls: BTreeMap<String, VarDecl> = BTreeMap::new();
    for (name, info) in &locals {
        if !reads.contains(name) {
            continue;
        }
        if overwritten.contains(name) {
            return Err(AutodiffError::Overwrite(name.clone()));
        }
        let record = match mode {
            TapeMode::All => true,
            TapeMode::NoReuseOnly => info.reduce_defined || info.stored_under_if,
        };
        if !record {
            continue;
        }
        let mut shape = Vec::with_capacity(info.prefix.len() + info.decl.ty.shape.len());
        let mut prefix = Vec::with_capacity(info.prefix.len());
        for pl in &info.prefix {
            let trips = pl.trips.ok_or_else(|| AutodiffError::DynamicLoopBound {
                local: name.clone(),
                iter: pl.iter.clone(),
            })?;
            shape.push(trips);
            prefix.push(normalized_iter(pl));
        }
        shape.extend(info.decl.ty.shape.iter().copied());
        taped.insert(name.clone());
        tape_prefix.insert(name.clone(), prefix);
        tape_decls.insert(
            name.clone(),
            VarDecl::new(tape_name(name), info.decl.ty.dtype, shape, Role::Output),
        );
    }

    let mut dtypes: BTreeMap<String, DType> = primal
        .params
        .iter()
        .map(|d| (d.name.clone(), d.ty.dtype))
        .collect();
    for (name, info) in &locals {
        dtypes.insert(name.clone(), info.decl.ty.dtype);
    }
    for decl in tape_decls.values() {
        dtypes.insert(decl.name.clone(), decl.ty.dtype);
    }

    let engine = Engine {
        requires: &requires,
        provides: &provides,
        roles: primal
            .params
            .iter()
            .map(|d| (d.name.clone(), d.role))
            .collect(),
        dtypes,
        locals: &locals,
        reads: &reads,
        taped: &taped,
        tape_prefix: &tape_prefix,
    };

    let mut fwd_params = primal.params.clone();
    fwd_params.extend(tape_decls.values().cloned());
    let forward = Program {
        name: format!("{}.fwd", primal.name),
        params: fwd_params,
        body: engine.forward_block(&primal.body),
    };

    let mut bwd_params: Vec<VarDecl> = primal.inputs().cloned().collect();
    for d in primal.outputs() {
        // Final values of min/max reduction targets are compared against
        // contributions in the backward pass.
        if minmax_outputs.contains(&d.name) {
            let mut as_input = d.clone();
            as_input.role = Role::Input;
            bwd_params.push(as_input);
        }
    }
    for decl in tape_decls.values() {
        let mut as_input = decl.clone();
        as_input.role = Role::Input;
        bwd_params.push(as_input);
    }
    for y in &provides {
        if let Some(d) = primal.param(y) {
            bwd_params.push(VarDecl::new(
                grad_name(y),
                d.ty.dtype,
                d.ty.shape.clone(),
                Role::Input,
            ));
        }
    }
    for x in &requires {
        if let Some(d) = primal.param(x) {
            bwd_params.push(VarDecl::new(
                grad_name(x),
                d.ty.dtype,
                d.ty.shape.clone(),
                Role::Output,
            ));
        }
    }

    let mut bwd_body = Vec::new();
    for x in &requires {
        if let Some(d) = primal.param(x) {
            bwd_body.extend(fill_zero(&grad_name(x), &d.ty.shape));
        }
    }
    bwd_body.extend(engine.reverse_block(&primal.body)?);
    let backward = Program {
        name: format!("{}.bwd", primal.name),
        params: bwd_params,
        body: bwd_body,
    };

    Ok(GradProducts {
        forward,
        backward,
        requires: requires.iter().map(|x| (x.clone(), grad_name(x))).collect(),
        provides: provides.iter().map(|y| (y.clone(), grad_name(y))).collect(),
        tapes: tape_decls.values().map(|d| d.name.clone()).collect(),
    })
}

/// A loop enclosing a local's allocation site.
#[derive(Debug, Clone)]
struct PrefixLoop {
    iter: String,
    begin: Expr,
    step: i64,
    trips: Option<usize>,
}

/// Tape index for one prefix level: the loop's iteration ordinal.
fn normalized_iter(pl: &PrefixLoop) -> Expr {
    let it = Expr::Iter(pl.iter.clone());
    let shifted = match pl.begin.as_const_int() {
        Some(0) => it,
        _ => it - pl.begin.clone(),
    };
    if pl.step == 1 {
        shifted
    } else {
        shifted / ir::iconst(pl.step)
    }
}

#[derive(Debug)]
struct LocalInfo {
    decl: VarDecl,
    prefix: Vec<PrefixLoop>,
    reduce_defined: bool,
    stored_under_if: bool,
}

/// The index vectors of the stores seen so far, per variable. Two sigs
/// for the same variable are fine when some axis is a different
/// constant in each; everything else counts as a potential overwrite.
type StoreSigs = BTreeMap<String, Vec<Vec<Expr>>>;

fn sigs_disjoint(a: &[Expr], b: &[Expr]) -> bool {
    a.len() == b.len()
        && a.iter().zip(b).any(|(x, y)| {
            matches!(
                (x.as_const_int(), y.as_const_int()),
                (Some(u), Some(v)) if u != v
            )
        })
}

struct Analyzer {
    param_roles: BTreeMap<String, Role>,
    locals: BTreeMap<String, LocalInfo>,
    /// Variables whose primal value some expression reads.
    reads: BTreeSet<String>,
    /// Outputs that are min/max reduction targets.
    minmax_outputs: BTreeSet<String>,
    /// Variables with two stores that may hit the same element.
    overwritten: BTreeSet<String>,
    loop_stack: Vec<PrefixLoop>,
    if_depth: usize,
    alloc_if_depth: BTreeMap<String, usize>,
}

impl Analyzer {
    fn new(primal: &Program) -> Self {
        Self {
            param_roles: primal
                .params
                .iter()
                .map(|d| (d.name.clone(), d.role))
                .collect(),
            locals: BTreeMap::new(),
            reads: BTreeSet::new(),
            minmax_outputs: BTreeSet::new(),
            overwritten: BTreeSet::new(),
            loop_stack: Vec::new(),
            if_depth: 0,
            alloc_if_depth: BTreeMap::new(),
        }
    }

    fn record_reads(&mut self, e: &Expr) -> Result<(), AutodiffError> {
        let mut loaded = Vec::new();
        e.for_each_load(&mut |var, _| loaded.push(var.to_string()));
        for var in loaded {
            if self.param_roles.get(&var) == Some(&Role::Output) {
                return Err(AutodiffError::OutputRead(var));
            }
            self.reads.insert(var);
        }
        Ok(())
    }

    fn record_write(&mut self, var: &str) {
        let under_if = self
            .alloc_if_depth
            .get(var)
            .is_some_and(|d| self.if_depth > *d);
        if let Some(info) = self.locals.get_mut(var) {
            if under_if {
                info.stored_under_if = true;
            }
        }
    }

    /// Flag `var` overwritten if `sig` may collide with a store already
    /// seen, then record it.
    fn note_store(&mut self, sigs: &mut StoreSigs, var: &str, sig: Vec<Expr>) {
        let entry = sigs.entry(var.to_string()).or_default();
        if entry.iter().any(|seen| !sigs_disjoint(seen, &sig)) {
            self.overwritten.insert(var.to_string());
        }
        entry.push(sig);
    }

    /// Fold a nested region's stores into the enclosing block. Incoming
    /// sigs are checked against what the block saw before the region,
    /// never against each other: pairs within the region were already
    /// checked by the recursive walk, except across `If` arms, where the
    /// stores are mutually exclusive.
    fn merge_sigs(&mut self, sigs: &mut StoreSigs, inner: StoreSigs) {
        for (var, list) in inner {
            let entry = sigs.entry(var.clone()).or_default();
            let seen = entry.len();
            if list
                .iter()
                .any(|sig| entry[..seen].iter().any(|prev| !sigs_disjoint(prev, sig)))
            {
                self.overwritten.insert(var);
            }
            entry.extend(list);
        }
    }

    /// Walk one block, returning the store signatures it contains for
    /// the overwrite check.
    fn block(&mut self, stmts: &[Stmt]) -> Result<StoreSigs, AutodiffError> {
        let mut sigs = StoreSigs::new();
        for s in stmts {
            match s {
                Stmt::Store {
                    var,
                    indices,
                    value,
                } => {
                    for i in indices {
                        self.record_reads(i)?;
                    }
                    self.record_reads(value)?;
                    self.record_write(var);
                    self.note_store(&mut sigs, var, indices.clone());
                }
                Stmt::Reduce {
                    var,
                    indices,
                    op,
                    value,
                } => {
                    for i in indices {
                        self.record_reads(i)?;
                    }
                    self.record_reads(value)?;
                    self.record_write(var);
                    if let Some(info) = self.locals.get_mut(var) {
                        info.reduce_defined = true;
                    }
                    if matches!(op, ReduceOp::Min | ReduceOp::Max) {
                        // The reduced value itself is needed to identify
                        // the achieving iterations.
                        if self.param_roles.get(var) == Some(&Role::Output) {
                            self.minmax_outputs.insert(var.clone());
                        } else {
                            self.reads.insert(var.clone());
                        }
                    }
                }
                Stmt::If {
                    cond,
                    then_body,
                    else_body,
                } => {
                    self.record_reads(cond)?;
                    self.if_depth += 1;
                    let mut arms = self.block(then_body)?;
                    let ev = self.block(else_body)?;
                    self.if_depth -= 1;
                    for (var, list) in ev {
                        arms.entry(var).or_default().extend(list);
                    }
                    self.merge_sigs(&mut sigs, arms);
                }
                Stmt::For(l) => {
                    self.record_reads(&l.begin)?;
                    self.record_reads(&l.end)?;
                    self.loop_stack.push(PrefixLoop {
                        iter: l.iter.clone(),
                        begin: l.begin.clone(),
                        step: l.step,
                        trips: l.const_trip_count(),
                    });
                    let inner = self.block(&l.body)?;
                    self.loop_stack.pop();
                    self.merge_sigs(&mut sigs, inner);
                }
                Stmt::Alloc { decl, body } => {
                    if self.locals.contains_key(&decl.name)
                        || self.param_roles.contains_key(&decl.name)
                    {
                        return Err(AutodiffError::DuplicateLocal(decl.name.clone()));
                    }
                    self.locals.insert(
                        decl.name.clone(),
                        LocalInfo {
                            decl: decl.clone(),
                            prefix: self.loop_stack.clone(),
                            reduce_defined: false,
                            stored_under_if: false,
                        },
                    );
                    self.alloc_if_depth.insert(decl.name.clone(), self.if_depth);
                    let mut inner = self.block(body)?;
                    self.alloc_if_depth.remove(&decl.name);
                    // The scope holds a fresh instance of the local, so
                    // its stores do not carry out of it.
                    inner.remove(&decl.name);
                    self.merge_sigs(&mut sigs, inner);
                }
            }
        }
        Ok(sigs)
    }
}

struct Engine<'a> {
    requires: &'a [String],
    provides: &'a [String],
    roles: BTreeMap<String, Role>,
    dtypes: BTreeMap<String, DType>,
    locals: &'a BTreeMap<String, LocalInfo>,
    reads: &'a BTreeSet<String>,
    taped: &'a BTreeSet<String>,
    tape_prefix: &'a BTreeMap<String, Vec<Expr>>,
}

impl AdjointSink for Engine<'_> {
    fn rewrite(&self, e: &Expr) -> Expr {
        self.rw(e)
    }

    fn grad_of(&self, var: &str) -> Option<String> {
        self.grad_of(var)
    }

    fn is_float(&self, e: &Expr) -> bool {
        self.expr_is_float(e)
    }
}

impl Engine<'_> {
    /// Rewrite a primal expression for the backward (and forward)
    /// program: loads of taped locals become tape loads.
    fn rw(&self, e: &Expr) -> Expr {
        e.map_loads(&|var, indices| {
            if self.taped.contains(var) {
                let mut idx = self
                    .tape_prefix
                    .get(var)
                    .cloned()
                    .unwrap_or_default();
                idx.extend(indices);
                Some(Expr::Load {
                    var: tape_name(var),
                    indices: idx,
                })
            } else {
                None
            }
        })
    }

    fn grad_of(&self, var: &str) -> Option<String> {
        match self.roles.get(var) {
            Some(Role::Input) => self
                .requires
                .iter()
                .any(|r| r == var)
                .then(|| grad_name(var)),
            Some(Role::Output) => self
                .provides
                .iter()
                .any(|p| p == var)
                .then(|| grad_name(var)),
            Some(Role::Local) => None,
            None => {
                let info = self.locals.get(var)?;
                (info.decl.ty.dtype.is_float() && self.reads.contains(var))
                    .then(|| grad_name(var))
            }
        }
    }

    fn expr_is_float(&self, e: &Expr) -> bool {
        match e {
            Expr::FConst(_) => true,
            Expr::IConst(_) | Expr::Iter(_) => false,
            Expr::Load { var, .. } => self
                .dtypes
                .get(var)
                .is_some_and(|d| d.is_float()),
            Expr::Cast { dtype, .. } => dtype.is_float(),
            Expr::Unary { op, arg } => match op {
                ir::UnOp::Neg | ir::UnOp::Abs => self.expr_is_float(arg),
                ir::UnOp::Sqrt | ir::UnOp::Exp | ir::UnOp::Sigmoid => true,
                ir::UnOp::Not => false,
            },
            Expr::Binary { op, lhs, .. } => !op.is_predicate() && self.expr_is_float(lhs),
            Expr::Select { on_true, .. } => self.expr_is_float(on_true),
        }
    }

    fn forward_block(&self, stmts: &[Stmt]) -> Vec<Stmt> {
        let mut out = Vec::with_capacity(stmts.len());
        for s in stmts {
            match s {
                Stmt::Store {
                    var,
                    indices,
                    value,
                } => {
                    let (var, indices) = self.forward_target(var, indices);
                    out.push(Stmt::Store {
                        var,
                        indices,
                        value: self.rw(value),
                    });
                }
                Stmt::Reduce {
                    var,
                    indices,
                    op,
                    value,
                } => {
                    let (var, indices) = self.forward_target(var, indices);
                    out.push(Stmt::Reduce {
                        var,
                        indices,
                        op: *op,
                        value: self.rw(value),
                    });
                }
                Stmt::If {
                    cond,
                    then_body,
                    else_body,
                } => out.push(Stmt::If {
                    cond: self.rw(cond),
                    then_body: self.forward_block(then_body),
                    else_body: self.forward_block(else_body),
                }),
                Stmt::For(l) => out.push(Stmt::For(Loop {
                    iter: l.iter.clone(),
                    begin: self.rw(&l.begin),
                    end: self.rw(&l.end),
                    step: l.step,
                    parallel: l.parallel,
                    body: self.forward_block(&l.body),
                })),
                Stmt::Alloc { decl, body } => {
                    if self.taped.contains(&decl.name) {
                        // The tape tensor replaces the local outright.
                        out.extend(self.forward_block(body));
                    } else {
                        out.push(Stmt::Alloc {
                            decl: decl.clone(),
                            body: self.forward_block(body),
                        });
                    }
                }
            }
        }
        out
    }

    fn forward_target(&self, var: &str, indices: &[Expr]) -> (String, Vec<Expr>) {
        let rewritten: Vec<Expr> = indices.iter().map(|i| self.rw(i)).collect();
        if self.taped.contains(var) {
            let mut idx = self
                .tape_prefix
                .get(var)
                .cloned()
                .unwrap_or_default();
            idx.extend(rewritten);
            (tape_name(var), idx)
        } else {
            (var.to_string(), rewritten)
        }
    }

    fn reverse_block(&self, stmts: &[Stmt]) -> Result<Vec<Stmt>, AutodiffError> {
        let mut out = Vec::new();
        for s in stmts.iter().rev() {
            match s {
                Stmt::Store {
                    var,
                    indices,
                    value,
                } => {
                    let Some(grad) = self.grad_of(var) else {
                        continue;
                    };
                    let idx: Vec<Expr> = indices.iter().map(|i| self.rw(i)).collect();
                    let upstream = Expr::Load {
                        var: grad.clone(),
                        indices: idx.clone(),
                    };
                    rules::accumulate(self, value, upstream, &mut out);
                    if self.locals.contains_key(var) {
                        // The store killed the previous definition, so no
                        // gradient may flow past it.
                        out.push(Stmt::Store {
                            var: grad,
                            indices: idx,
                            value: ir::fconst(0.0),
                        });
                    }
                }
                Stmt::Reduce {
                    var,
                    indices,
                    op,
                    value,
                } => {
                    let Some(grad) = self.grad_of(var) else {
                        continue;
                    };
                    let idx: Vec<Expr> = indices.iter().map(|i| self.rw(i)).collect();
                    let gload = Expr::Load {
                        var: grad,
                        indices: idx,
                    };
                    let upstream = match op {
                        ReduceOp::Add => gload,
                        ReduceOp::Min | ReduceOp::Max => {
                            // Every iteration that achieved the reduced
                            // value receives the full gradient.
                            let final_val = self.rw(&Expr::Load {
                                var: var.clone(),
                                indices: indices.to_vec(),
                            });
                            ir::select(self.rw(value).eq_(final_val), gload, ir::fconst(0.0))
                        }
                    };
                    rules::accumulate(self, value, upstream, &mut out);
                }
                Stmt::If {
                    cond,
                    then_body,
                    else_body,
                } => out.push(Stmt::If {
                    cond: self.rw(cond),
                    then_body: self.reverse_block(then_body)?,
                    else_body: self.reverse_block(else_body)?,
                }),
                Stmt::For(l) => {
                    let body = self.reverse_block(&l.body)?;
                    out.push(Stmt::For(self.reverse_loop(l, body)));
                }
                Stmt::Alloc { decl, body } => out.extend(self.reverse_alloc(decl, body)?),
            }
        }
        Ok(out)
    }

    /// A loop running the primal iteration values in reverse order.
    fn reverse_loop(&self, l: &Loop, body: Vec<Stmt>) -> Loop {
        let begin = self.rw(&l.begin);
        let end = self.rw(&l.end);
        let m = l.step.unsigned_abs() as i64;
        let trips = if l.step > 0 {
            (end - begin.clone() + ir::iconst(m - 1)) / ir::iconst(m)
        } else {
            (begin.clone() - end + ir::iconst(m - 1)) / ir::iconst(m)
        };
        let rev_begin = fold(begin.clone() + (trips - ir::iconst(1)) * ir::iconst(l.step));
        let rev_end = fold(if l.step > 0 {
            begin - ir::iconst(1)
        } else {
            begin + ir::iconst(1)
        });
        Loop {
            iter: l.iter.clone(),
            begin: rev_begin,
            end: rev_end,
            step: -l.step,
            parallel: Parallelism::Serial,
            body,
        }
    }

    fn reverse_alloc(&self, decl: &VarDecl, body: &[Stmt]) -> Result<Vec<Stmt>, AutodiffError> {
        let name = &decl.name;
        let reversed = self.reverse_block(body)?;
        let inner = if let Some(grad) = self.grad_of(name) {
            let gdecl = VarDecl {
                name: grad.clone(),
                ty: decl.ty.clone(),
                role: Role::Local,
            };
            let mut b = fill_zero(&grad, &decl.ty.shape);
            b.extend(reversed);
            vec![Stmt::Alloc {
                decl: gdecl,
                body: b,
            }]
        } else {
            reversed
        };
        if self.reads.contains(name) && !self.taped.contains(name) {
            // Recompute the primal value in place, then walk the adjoints.
            let mut b = self.extract_defs(body, name, &mut BTreeSet::new())?;
            b.extend(inner);
            Ok(vec![Stmt::Alloc {
                decl: decl.clone(),
                body: b,
            }])
        } else {
            Ok(inner)
        }
    }

    /// Pull the statements defining `target` out of an allocation body,
    /// preserving the loop and conditional structure around them.
    fn extract_defs(
        &self,
        body: &[Stmt],
        target: &str,
        inner: &mut BTreeSet<String>,
    ) -> Result<Vec<Stmt>, AutodiffError> {
        let mut out = Vec::new();
        for s in body {
            match s {
                Stmt::Store {
                    var,
                    indices,
                    value,
                } if var == target => {
                    self.check_replay_reads(value, target, inner)?;
                    for i in indices {
                        self.check_replay_reads(i, target, inner)?;
                    }
                    out.push(Stmt::Store {
                        var: var.clone(),
                        indices: indices.iter().map(|i| self.rw(i)).collect(),
                        value: self.rw(value),
                    });
                }
                Stmt::Reduce {
                    var,
                    indices,
                    op,
                    value,
                } if var == target => {
                    self.check_replay_reads(value, target, inner)?;
                    for i in indices {
                        self.check_replay_reads(i, target, inner)?;
                    }
                    out.push(Stmt::Reduce {
                        var: var.clone(),
                        indices: indices.iter().map(|i| self.rw(i)).collect(),
                        op: *op,
                        value: self.rw(value),
                    });
                }
                Stmt::Store { .. } | Stmt::Reduce { .. } => {}
                Stmt::If {
                    cond,
                    then_body,
                    else_body,
                } => {
                    let t = self.extract_defs(then_body, target, inner)?;
                    let e = self.extract_defs(else_body, target, inner)?;
                    if !t.is_empty() || !e.is_empty() {
                        self.check_replay_reads(cond, target, inner)?;
                        out.push(Stmt::If {
                            cond: self.rw(cond),
                            then_body: t,
                            else_body: e,
                        });
                    }
                }
                Stmt::For(l) => {
                    let b = self.extract_defs(&l.body, target, inner)?;
                    if !b.is_empty() {
                        self.check_replay_reads(&l.begin, target, inner)?;
                        self.check_replay_reads(&l.end, target, inner)?;
                        out.push(Stmt::For(Loop {
                            iter: l.iter.clone(),
                            begin: self.rw(&l.begin),
                            end: self.rw(&l.end),
                            step: l.step,
                            parallel: Parallelism::Serial,
                            body: b,
                        }));
                    }
                }
                Stmt::Alloc { decl, body } => {
                    inner.insert(decl.name.clone());
                    out.extend(self.extract_defs(body, target, inner)?);
                }
            }
        }
        Ok(out)
    }

    /// Replayed definitions may only read tensors that are still live at
    /// the replay point: parameters, tapes, and locals allocated at or
    /// above the one being recomputed.
    fn check_replay_reads(
        &self,
        e: &Expr,
        target: &str,
        inner: &BTreeSet<String>,
    ) -> Result<(), AutodiffError> {
        let mut bad = None;
        e.for_each_load(&mut |var, _| {
            if bad.is_none() && inner.contains(var) && !self.taped.contains(var) {
                bad = Some(var.to_string());
            }
        });
        match bad {
            Some(dependency) => Err(AutodiffError::Recompute {
                local: target.to_string(),
                dependency,
            }),
            None => Ok(()),
        }
    }
}

fn fold(e: Expr) -> Expr {
    match e.as_const_int() {
        Some(v) => ir::iconst(v),
        None => e,
    }
}

/// Nested loops storing zero into every element. Iterator names live in
/// the reserved `.`-namespace, so they cannot clash with user names.
fn fill_zero(var: &str, shape: &[usize]) -> Vec<Stmt> {
    let indices: Vec<Expr> = (0..shape.len())
        .map(|axis| Expr::Iter(format!("{var}.z{axis}")))
        .collect();
    let mut stmt = Stmt::Store {
        var: var.to_string(),
        indices,
        value: ir::fconst(0.0),
    };
    for (axis, extent) in shape.iter().enumerate().rev() {
        stmt = Stmt::For(Loop {
            iter: format!("{var}.z{axis}"),
            begin: ir::iconst(0),
            end: ir::iconst(*extent as i64),
            step: 1,
            parallel: Parallelism::Serial,
            body: vec![stmt],
        });
    }
    vec![stmt]
}
