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

//! Scoped program builder.
//!
//! Kernel authors describe a nested-loop computation through explicit
//! `begin_for`/`end_for`, `begin_if`/`begin_else`/`end_if`, `store`,
//! `reduce`, and `local` calls; the builder maintains a stack of open
//! scopes and appends statements in program order. Malformed programs
//! fail here, at build time: reads of variables with no earlier write,
//! writes to inputs, rank or element-type mismatches, reductions into
//! uninitialized targets, and unbalanced scopes all return a
//! [`BuildError`] and no partial program.
//!
//! A [`local`](ProgramBuilder::local) allocation stays live until the
//! end of the block that is open when it is declared, mirroring the
//! original kernels' per-iteration temporaries.

use std::collections::{BTreeMap, BTreeSet};

use crate::ir::{BinOp, Expr, Loop, Parallelism, Program, ReduceOp, Stmt, UnOp, VarDecl};
use crate::types::{DType, Role, TensorType};

/// Structured errors raised while a program is under construction.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum BuildError {
    /// Variable names must be nonempty `[A-Za-z_][A-Za-z0-9_]*`; the
    /// `.`-suffixed namespace is reserved for generated programs.
    #[error("invalid variable name '{0}'")]
    InvalidName(String),
    #[error("duplicate variable '{0}'")]
    DuplicateVariable(String),
    #[error("unknown or out-of-scope variable '{0}'")]
    UnknownVariable(String),
    /// A read of a non-input variable with no earlier write in program
    /// order (definition-order violation).
    #[error("variable '{0}' is read before any write")]
    UseBeforeDefinition(String),
    #[error("variable '{0}' is an input and cannot be written")]
    WriteToInput(String),
    /// Reduction into a target with no initializing write; accumulation
    /// targets must start from their neutral element.
    #[error("reduction into '{0}' before it is initialized")]
    ReduceBeforeInit(String),
    #[error("variable '{var}' has rank {expected}, access has {got} indices")]
    RankMismatch {
        var: String,
        expected: usize,
        got: usize,
    },
    #[error("duplicate loop iterator '{0}'")]
    DuplicateIterator(String),
    #[error("unknown loop iterator '{0}'")]
    UnknownIterator(String),
    #[error("loop '{0}' has zero step")]
    ZeroStep(String),
    #[error("expected an open {expected} scope")]
    MismatchedScope { expected: &'static str },
    #[error("finish() called with an open loop or conditional")]
    UnclosedScope,
    #[error("type error: {0}")]
    Type(String),
}

/// Handle to a declared variable, used to form loads and write targets.
#[derive(Debug, Clone)]
pub struct Var {
    name: String,
    dtype: DType,
}

impl Var {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Indexed load. The index count is checked when the expression is
    /// consumed by a builder call.
    pub fn at(&self, indices: &[Expr]) -> Expr {
        Expr::Load {
            var: self.name.clone(),
            indices: indices.to_vec(),
        }
    }

    /// Scalar load (rank-0 variables).
    pub fn get(&self) -> Expr {
        self.at(&[])
    }
}

impl From<i64> for Expr {
    fn from(v: i64) -> Expr {
        Expr::IConst(v)
    }
}

impl From<f32> for Expr {
    fn from(v: f32) -> Expr {
        Expr::FConst(v)
    }
}

/// Scalar category used during expression checking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExprTy {
    F32,
    I32,
    Bool,
}

impl ExprTy {
    fn of(dtype: DType) -> ExprTy {
        match dtype {
            DType::F32 => ExprTy::F32,
            DType::I32 => ExprTy::I32,
        }
    }
}

enum Frame {
    Root {
        stmts: Vec<Stmt>,
    },
    Loop {
        iter: String,
        begin: Expr,
        end: Expr,
        step: i64,
        stmts: Vec<Stmt>,
    },
    If {
        cond: Expr,
        then_stmts: Vec<Stmt>,
        /// `Some` once `begin_else` has been called.
        else_stmts: Option<Vec<Stmt>>,
    },
    Alloc {
        decl: VarDecl,
        stmts: Vec<Stmt>,
    },
}

/// Builder for [`Program`] values. See the module docs for the scope
/// discipline.
pub struct ProgramBuilder {
    name: String,
    params: Vec<VarDecl>,
    frames: Vec<Frame>,
    /// Declared variables currently in scope: name -> (dtype, rank, role).
    scope: BTreeMap<String, (DType, usize, Role)>,
    /// Variables with at least one write so far, in program order.
    written: BTreeSet<String>,
    /// Iterators currently in scope, outermost first. Sibling loops may
    /// reuse a name (the original kernels do); shadowing may not.
    open_iters: Vec<String>,
    fill_counter: usize,
}

fn valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl ProgramBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Vec::new(),
            frames: vec![Frame::Root { stmts: Vec::new() }],
            scope: BTreeMap::new(),
            written: BTreeSet::new(),
            open_iters: Vec::new(),
            fill_counter: 0,
        }
    }

    pub fn input(
        &mut self,
        name: &str,
        dtype: DType,
        shape: &[usize],
    ) -> Result<Var, BuildError> {
        self.param(name, dtype, shape, Role::Input)
    }

    pub fn output(
        &mut self,
        name: &str,
        dtype: DType,
        shape: &[usize],
    ) -> Result<Var, BuildError> {
        self.param(name, dtype, shape, Role::Output)
    }

    fn param(
        &mut self,
        name: &str,
        dtype: DType,
        shape: &[usize],
        role: Role,
    ) -> Result<Var, BuildError> {
        self.declare(name, dtype, shape, role)?;
        self.params
            .push(VarDecl::new(name, dtype, shape.to_vec(), role));
        if role == Role::Input {
            // Inputs are defined by the caller.
            self.written.insert(name.to_string());
        }
        Ok(Var {
            name: name.to_string(),
            dtype,
        })
    }

    /// Declare a scoped temporary. The allocation stays live until the
    /// enclosing block closes.
    pub fn local(
        &mut self,
        name: &str,
        dtype: DType,
        shape: &[usize],
    ) -> Result<Var, BuildError> {
        self.declare(name, dtype, shape, Role::Local)?;
        self.frames.push(Frame::Alloc {
            decl: VarDecl::new(name, dtype, shape.to_vec(), Role::Local),
            stmts: Vec::new(),
        });
        Ok(Var {
            name: name.to_string(),
            dtype,
        })
    }

    fn declare(
        &mut self,
        name: &str,
        dtype: DType,
        shape: &[usize],
        role: Role,
    ) -> Result<(), BuildError> {
        if !valid_name(name) {
            return Err(BuildError::InvalidName(name.to_string()));
        }
        if self.scope.contains_key(name) || self.open_iters.iter().any(|i| i == name) {
            return Err(BuildError::DuplicateVariable(name.to_string()));
        }
        self.scope
            .insert(name.to_string(), (dtype, shape.len(), role));
        Ok(())
    }

    /// Open a unit-stride loop; returns the induction-variable expression.
    pub fn begin_for(
        &mut self,
        iter: &str,
        begin: impl Into<Expr>,
        end: impl Into<Expr>,
    ) -> Result<Expr, BuildError> {
        self.begin_for_step(iter, begin, end, 1)
    }

    pub fn begin_for_step(
        &mut self,
        iter: &str,
        begin: impl Into<Expr>,
        end: impl Into<Expr>,
        step: i64,
    ) -> Result<Expr, BuildError> {
        if !valid_name(iter) {
            return Err(BuildError::InvalidName(iter.to_string()));
        }
        if self.open_iters.iter().any(|i| i == iter) || self.scope.contains_key(iter) {
            return Err(BuildError::DuplicateIterator(iter.to_string()));
        }
        if step == 0 {
            return Err(BuildError::ZeroStep(iter.to_string()));
        }
        let begin = begin.into();
        let end = end.into();
        self.check_expr(&begin, ExprTy::I32)?;
        self.check_expr(&end, ExprTy::I32)?;
        self.open_iters.push(iter.to_string());
        self.frames.push(Frame::Loop {
            iter: iter.to_string(),
            begin,
            end,
            step,
            stmts: Vec::new(),
        });
        Ok(Expr::Iter(iter.to_string()))
    }

    pub fn end_for(&mut self) -> Result<(), BuildError> {
        self.close_allocs();
        match self.frames.pop() {
            Some(Frame::Loop {
                iter,
                begin,
                end,
                step,
                stmts,
            }) => {
                self.open_iters.pop();
                self.push_stmt(Stmt::For(Loop {
                    iter,
                    begin,
                    end,
                    step,
                    parallel: Parallelism::Serial,
                    body: stmts,
                }));
                Ok(())
            }
            Some(other) => {
                self.frames.push(other);
                Err(BuildError::MismatchedScope { expected: "loop" })
            }
            None => Err(BuildError::MismatchedScope { expected: "loop" }),
        }
    }

    pub fn begin_if(&mut self, cond: Expr) -> Result<(), BuildError> {
        self.check_expr(&cond, ExprTy::Bool)?;
        self.frames.push(Frame::If {
            cond,
            then_stmts: Vec::new(),
            else_stmts: None,
        });
        Ok(())
    }

    pub fn begin_else(&mut self) -> Result<(), BuildError> {
        self.close_allocs();
        match self.frames.last_mut() {
            Some(Frame::If { else_stmts, .. }) if else_stmts.is_none() => {
                *else_stmts = Some(Vec::new());
                Ok(())
            }
            _ => Err(BuildError::MismatchedScope {
                expected: "conditional",
            }),
        }
    }

    pub fn end_if(&mut self) -> Result<(), BuildError> {
        self.close_allocs();
        match self.frames.pop() {
            Some(Frame::If {
                cond,
                then_stmts,
                else_stmts,
            }) => {
                self.push_stmt(Stmt::If {
                    cond,
                    then_body: then_stmts,
                    else_body: else_stmts.unwrap_or_default(),
                });
                Ok(())
            }
            Some(other) => {
                self.frames.push(other);
                Err(BuildError::MismatchedScope {
                    expected: "conditional",
                })
            }
            None => Err(BuildError::MismatchedScope {
                expected: "conditional",
            }),
        }
    }

    /// `var[indices] = value`
    pub fn store(
        &mut self,
        var: &Var,
        indices: &[Expr],
        value: impl Into<Expr>,
    ) -> Result<(), BuildError> {
        let value = value.into();
        self.check_write_target(var, indices)?;
        self.check_expr(&value, ExprTy::of(var.dtype))?;
        self.written.insert(var.name.clone());
        self.push_stmt(Stmt::Store {
            var: var.name.clone(),
            indices: indices.to_vec(),
            value,
        });
        Ok(())
    }

    /// `var[indices] op= value`. The target must already have an
    /// initializing write (the neutral element for `op`).
    pub fn reduce(
        &mut self,
        var: &Var,
        indices: &[Expr],
        op: ReduceOp,
        value: impl Into<Expr>,
    ) -> Result<(), BuildError> {
        let value = value.into();
        self.check_write_target(var, indices)?;
        if !self.written.contains(&var.name) {
            return Err(BuildError::ReduceBeforeInit(var.name.clone()));
        }
        self.check_expr(&value, ExprTy::of(var.dtype))?;
        self.push_stmt(Stmt::Reduce {
            var: var.name.clone(),
            indices: indices.to_vec(),
            op,
            value,
        });
        Ok(())
    }

    /// Store `value` into every element of `var` through generated
    /// loops. Used for neutral-element initialization of locals and
    /// outputs.
    pub fn fill(&mut self, var: &Var, value: impl Into<Expr>) -> Result<(), BuildError> {
        let value = value.into();
        let (_, rank, _) = *self
            .scope
            .get(&var.name)
            .ok_or_else(|| BuildError::UnknownVariable(var.name.clone()))?;
        let shape = self.lookup_shape(&var.name)?;
        self.check_expr(&value, ExprTy::of(var.dtype))?;
        let mut indices = Vec::with_capacity(rank);
        let mut loops = Vec::with_capacity(rank);
        for (axis, extent) in shape.iter().enumerate() {
            let iter = format!("{}.z{}_{}", var.name, self.fill_counter, axis);
            indices.push(Expr::Iter(iter.clone()));
            loops.push((iter, *extent as i64));
        }
        self.fill_counter += 1;
        let mut stmt = Stmt::Store {
            var: var.name.clone(),
            indices,
            value,
        };
        for (iter, extent) in loops.into_iter().rev() {
            stmt = Stmt::For(Loop {
                iter,
                begin: Expr::IConst(0),
                end: Expr::IConst(extent),
                step: 1,
                parallel: Parallelism::Serial,
                body: vec![stmt],
            });
        }
        self.written.insert(var.name.clone());
        self.push_stmt(stmt);
        Ok(())
    }

    /// Close remaining scopes and return the finished program.
    pub fn finish(mut self) -> Result<Program, BuildError> {
        self.close_allocs();
        if self.frames.len() != 1 {
            return Err(BuildError::UnclosedScope);
        }
        let body = match self.frames.pop() {
            Some(Frame::Root { stmts }) => stmts,
            _ => return Err(BuildError::UnclosedScope),
        };
        Ok(Program {
            name: self.name,
            params: self.params,
            body,
        })
    }

    fn push_stmt(&mut self, stmt: Stmt) {
        match self.frames.last_mut() {
            Some(Frame::Root { stmts })
            | Some(Frame::Loop { stmts, .. })
            | Some(Frame::Alloc { stmts, .. }) => stmts.push(stmt),
            Some(Frame::If {
                then_stmts,
                else_stmts,
                ..
            }) => match else_stmts {
                Some(stmts) => stmts.push(stmt),
                None => then_stmts.push(stmt),
            },
            None => unreachable!("builder always has a root frame"),
        }
    }

    /// Pop every `Alloc` frame sitting on top of the stack, folding each
    /// into an `Alloc` statement of the frame beneath it.
    fn close_allocs(&mut self) {
        while matches!(self.frames.last(), Some(Frame::Alloc { .. })) {
            if let Some(Frame::Alloc { decl, stmts }) = self.frames.pop() {
                self.scope.remove(&decl.name);
                self.written.remove(&decl.name);
                self.push_stmt(Stmt::Alloc { decl, body: stmts });
            }
        }
    }

    fn lookup_shape(&self, name: &str) -> Result<Vec<usize>, BuildError> {
        // Shapes live on the declarations; params are on the signature,
        // locals on the open Alloc frames.
        if let Some(decl) = self.params.iter().find(|d| d.name == name) {
            return Ok(decl.ty.shape.clone());
        }
        for frame in self.frames.iter().rev() {
            if let Frame::Alloc { decl, .. } = frame {
                if decl.name == name {
                    return Ok(decl.ty.shape.clone());
                }
            }
        }
        Err(BuildError::UnknownVariable(name.to_string()))
    }

    fn check_write_target(&self, var: &Var, indices: &[Expr]) -> Result<(), BuildError> {
        let (dtype, rank, role) = *self
            .scope
            .get(&var.name)
            .ok_or_else(|| BuildError::UnknownVariable(var.name.clone()))?;
        debug_assert_eq!(dtype, var.dtype);
        if role == Role::Input {
            return Err(BuildError::WriteToInput(var.name.clone()));
        }
        if indices.len() != rank {
            return Err(BuildError::RankMismatch {
                var: var.name.clone(),
                expected: rank,
                got: indices.len(),
            });
        }
        for idx in indices {
            self.check_expr(idx, ExprTy::I32)?;
        }
        Ok(())
    }

    fn check_expr(&self, e: &Expr, expected: ExprTy) -> Result<(), BuildError> {
        let found = self.type_of(e)?;
        if found != expected {
            return Err(BuildError::Type(format!(
                "expected {expected:?}, found {found:?} in {}",
                super::print::render(e)
            )));
        }
        Ok(())
    }

    fn type_of(&self, e: &Expr) -> Result<ExprTy, BuildError> {
        match e {
            Expr::FConst(_) => Ok(ExprTy::F32),
            Expr::IConst(_) => Ok(ExprTy::I32),
            Expr::Iter(name) => {
                if self.open_iters.iter().any(|i| i == name) {
                    Ok(ExprTy::I32)
                } else {
                    Err(BuildError::UnknownIterator(name.clone()))
                }
            }
            Expr::Load { var, indices } => {
                let (dtype, rank, role) = *self
                    .scope
                    .get(var)
                    .ok_or_else(|| BuildError::UnknownVariable(var.clone()))?;
                if role != Role::Input && !self.written.contains(var) {
                    return Err(BuildError::UseBeforeDefinition(var.clone()));
                }
                if indices.len() != rank {
                    return Err(BuildError::RankMismatch {
                        var: var.clone(),
                        expected: rank,
                        got: indices.len(),
                    });
                }
                for idx in indices {
                    self.check_expr(idx, ExprTy::I32)?;
                }
                Ok(ExprTy::of(dtype))
            }
            Expr::Cast { dtype, arg } => {
                let from = self.type_of(arg)?;
                if from == ExprTy::Bool {
                    return Err(BuildError::Type("cannot cast a predicate".into()));
                }
                Ok(ExprTy::of(*dtype))
            }
            Expr::Unary { op, arg } => {
                let ty = self.type_of(arg)?;
                match op {
                    UnOp::Neg | UnOp::Abs => match ty {
                        ExprTy::F32 | ExprTy::I32 => Ok(ty),
                        ExprTy::Bool => {
                            Err(BuildError::Type("arithmetic on a predicate".into()))
                        }
                    },
                    UnOp::Sqrt | UnOp::Exp | UnOp::Sigmoid => {
                        if ty == ExprTy::F32 {
                            Ok(ExprTy::F32)
                        } else {
                            Err(BuildError::Type(format!(
                                "{op:?} requires a float operand"
                            )))
                        }
                    }
                    UnOp::Not => {
                        if ty == ExprTy::Bool {
                            Ok(ExprTy::Bool)
                        } else {
                            Err(BuildError::Type("'!' requires a predicate".into()))
                        }
                    }
                }
            }
            Expr::Binary { op, lhs, rhs } => {
                let lt = self.type_of(lhs)?;
                let rt = self.type_of(rhs)?;
                match op {
                    BinOp::And | BinOp::Or => {
                        if lt == ExprTy::Bool && rt == ExprTy::Bool {
                            Ok(ExprTy::Bool)
                        } else {
                            Err(BuildError::Type(format!(
                                "{op:?} requires predicate operands"
                            )))
                        }
                    }
                    BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge | BinOp::Eq | BinOp::Ne => {
                        if lt == rt && lt != ExprTy::Bool {
                            Ok(ExprTy::Bool)
                        } else {
                            Err(BuildError::Type(format!(
                                "comparison operands disagree: {lt:?} vs {rt:?}"
                            )))
                        }
                    }
                    BinOp::Rem => {
                        if lt == ExprTy::I32 && rt == ExprTy::I32 {
                            Ok(ExprTy::I32)
                        } else {
                            Err(BuildError::Type("'%' requires integer operands".into()))
                        }
                    }
                    BinOp::Add
                    | BinOp::Sub
                    | BinOp::Mul
                    | BinOp::Div
                    | BinOp::Min
                    | BinOp::Max => {
                        if lt == rt && lt != ExprTy::Bool {
                            Ok(lt)
                        } else {
                            Err(BuildError::Type(format!(
                                "{op:?} operands disagree: {lt:?} vs {rt:?} (insert an explicit cast)"
                            )))
                        }
                    }
                }
            }
            Expr::Select {
                cond,
                on_true,
                on_false,
            } => {
                self.check_expr(cond, ExprTy::Bool)?;
                let tt = self.type_of(on_true)?;
                let ft = self.type_of(on_false)?;
                if tt == ft && tt != ExprTy::Bool {
                    Ok(tt)
                } else {
                    Err(BuildError::Type(
                        "select arms must have the same value type".into(),
                    ))
                }
            }
        }
    }
}
