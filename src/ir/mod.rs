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

//! Statement IR for nested-loop tensor programs.
//!
//! A [`Program`] is an ordered parameter list plus a statement tree:
//! stores, reductions, conditionals, loops, and scoped local
//! allocations. Expression trees cover arithmetic, comparisons, the
//! transcendental set used by the workload (`sqrt`, `exp`, `sigmoid`,
//! `abs`), `min`/`max`, a ternary select, and indexed loads whose index
//! operands may themselves be expressions (data-dependent gathers).
//!
//! Programs are immutable once built; every transform (differentiation,
//! scheduling) returns a new program.

use std::collections::BTreeSet;
use std::fmt;
use std::ops;

use crate::types::{DType, Role, TensorType};

pub mod builder;
pub mod print;
pub mod verify;

pub use builder::{BuildError, ProgramBuilder, Var};
pub use verify::{verify_program, VerifyError};

/// A named program variable with its type and binding role.
#[derive(Debug, Clone, PartialEq)]
pub struct VarDecl {
    pub name: String,
    pub ty: TensorType,
    pub role: Role,
}

impl VarDecl {
    pub fn new(name: impl Into<String>, dtype: DType, shape: Vec<usize>, role: Role) -> Self {
        Self {
            name: name.into(),
            ty: TensorType::new(dtype, shape),
            role,
        }
    }
}

/// Unary primitive operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    Neg,
    Sqrt,
    Exp,
    Sigmoid,
    Abs,
    Not,
}

/// Binary primitive operations. A closed set: every member carries an
/// evaluation rule in the executor and an adjoint rule in `autodiff`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Min,
    Max,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    And,
    Or,
}

impl BinOp {
    /// Operations whose result is a boolean.
    pub fn is_predicate(self) -> bool {
        matches!(
            self,
            BinOp::Lt
                | BinOp::Le
                | BinOp::Gt
                | BinOp::Ge
                | BinOp::Eq
                | BinOp::Ne
                | BinOp::And
                | BinOp::Or
        )
    }
}

/// Reduction operators for accumulating updates.
///
/// The accumulation target must be initialized to the neutral element
/// (`0` for `Add`, `-inf` for `Max`, `+inf` for `Min`) before the
/// reducing loop begins; the builder enforces that an initializing
/// write exists earlier in program order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    Add,
    Min,
    Max,
}

/// Expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    FConst(f32),
    IConst(i64),
    /// Value of an enclosing loop's induction variable.
    Iter(String),
    /// Indexed read of a program variable. Empty index list for scalars.
    Load { var: String, indices: Vec<Expr> },
    Cast { dtype: DType, arg: Box<Expr> },
    Unary { op: UnOp, arg: Box<Expr> },
    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Select {
        cond: Box<Expr>,
        on_true: Box<Expr>,
        on_false: Box<Expr>,
    },
}

/// Float constant.
pub fn fconst(v: f32) -> Expr {
    Expr::FConst(v)
}

/// Integer constant.
pub fn iconst(v: i64) -> Expr {
    Expr::IConst(v)
}

fn unary(op: UnOp, arg: Expr) -> Expr {
    Expr::Unary {
        op,
        arg: Box::new(arg),
    }
}

fn binary(op: BinOp, lhs: Expr, rhs: Expr) -> Expr {
    Expr::Binary {
        op,
        lhs: Box::new(lhs),
        rhs: Box::new(rhs),
    }
}

pub fn sqrt(arg: Expr) -> Expr {
    unary(UnOp::Sqrt, arg)
}

pub fn exp(arg: Expr) -> Expr {
    unary(UnOp::Exp, arg)
}

pub fn sigmoid(arg: Expr) -> Expr {
    unary(UnOp::Sigmoid, arg)
}

pub fn abs(arg: Expr) -> Expr {
    unary(UnOp::Abs, arg)
}

pub fn min(lhs: Expr, rhs: Expr) -> Expr {
    binary(BinOp::Min, lhs, rhs)
}

pub fn max(lhs: Expr, rhs: Expr) -> Expr {
    binary(BinOp::Max, lhs, rhs)
}

pub fn select(cond: Expr, on_true: Expr, on_false: Expr) -> Expr {
    Expr::Select {
        cond: Box::new(cond),
        on_true: Box::new(on_true),
        on_false: Box::new(on_false),
    }
}

pub fn cast(dtype: DType, arg: Expr) -> Expr {
    Expr::Cast {
        dtype,
        arg: Box::new(arg),
    }
}

impl Expr {
    pub fn lt(self, rhs: Expr) -> Expr {
        binary(BinOp::Lt, self, rhs)
    }

    pub fn le(self, rhs: Expr) -> Expr {
        binary(BinOp::Le, self, rhs)
    }

    pub fn gt(self, rhs: Expr) -> Expr {
        binary(BinOp::Gt, self, rhs)
    }

    pub fn ge(self, rhs: Expr) -> Expr {
        binary(BinOp::Ge, self, rhs)
    }

    pub fn eq_(self, rhs: Expr) -> Expr {
        binary(BinOp::Eq, self, rhs)
    }

    pub fn ne_(self, rhs: Expr) -> Expr {
        binary(BinOp::Ne, self, rhs)
    }

    pub fn and(self, rhs: Expr) -> Expr {
        binary(BinOp::And, self, rhs)
    }

    pub fn or(self, rhs: Expr) -> Expr {
        binary(BinOp::Or, self, rhs)
    }

    pub fn rem(self, rhs: Expr) -> Expr {
        binary(BinOp::Rem, self, rhs)
    }

    /// Fold the expression to an integer constant when it contains only
    /// integer constants and arithmetic.
    pub fn as_const_int(&self) -> Option<i64> {
        match self {
            Expr::IConst(v) => Some(*v),
            Expr::Binary { op, lhs, rhs } => {
                let l = lhs.as_const_int()?;
                let r = rhs.as_const_int()?;
                match op {
                    BinOp::Add => Some(l + r),
                    BinOp::Sub => Some(l - r),
                    BinOp::Mul => Some(l * r),
                    BinOp::Div if r != 0 => Some(l.div_euclid(r)),
                    BinOp::Rem if r != 0 => Some(l.rem_euclid(r)),
                    _ => None,
                }
            }
            Expr::Unary { op: UnOp::Neg, arg } => arg.as_const_int().map(|v| -v),
            _ => None,
        }
    }

    /// Collect the names of induction variables this expression reads.
    pub fn free_iters(&self, out: &mut BTreeSet<String>) {
        self.visit(&mut |e| {
            if let Expr::Iter(name) = e {
                out.insert(name.clone());
            }
        });
    }

    /// Invoke `f` on every load in the expression, including loads
    /// nested inside index operands.
    pub fn for_each_load(&self, f: &mut impl FnMut(&str, &[Expr])) {
        self.visit(&mut |e| {
            if let Expr::Load { var, indices } = e {
                f(var, indices);
            }
        });
    }

    /// Pre-order traversal over the whole tree.
    pub fn visit(&self, f: &mut impl FnMut(&Expr)) {
        f(self);
        match self {
            Expr::FConst(_) | Expr::IConst(_) | Expr::Iter(_) => {}
            Expr::Load { indices, .. } => {
                for idx in indices {
                    idx.visit(f);
                }
            }
            Expr::Cast { arg, .. } | Expr::Unary { arg, .. } => arg.visit(f),
            Expr::Binary { lhs, rhs, .. } => {
                lhs.visit(f);
                rhs.visit(f);
            }
            Expr::Select {
                cond,
                on_true,
                on_false,
            } => {
                cond.visit(f);
                on_true.visit(f);
                on_false.visit(f);
            }
        }
    }

    /// Rebuild the tree, replacing loads through `subst`. The
    /// substitution receives the variable name and the already rewritten
    /// indices, and returns a replacement expression or `None` to keep
    /// the load unchanged.
    pub fn map_loads(&self, subst: &impl Fn(&str, Vec<Expr>) -> Option<Expr>) -> Expr {
        match self {
            Expr::FConst(_) | Expr::IConst(_) | Expr::Iter(_) => self.clone(),
            Expr::Load { var, indices } => {
                let indices: Vec<Expr> = indices.iter().map(|i| i.map_loads(subst)).collect();
                match subst(var, indices.clone()) {
                    Some(replacement) => replacement,
                    None => Expr::Load {
                        var: var.clone(),
                        indices,
                    },
                }
            }
            Expr::Cast { dtype, arg } => Expr::Cast {
                dtype: *dtype,
                arg: Box::new(arg.map_loads(subst)),
            },
            Expr::Unary { op, arg } => Expr::Unary {
                op: *op,
                arg: Box::new(arg.map_loads(subst)),
            },
            Expr::Binary { op, lhs, rhs } => Expr::Binary {
                op: *op,
                lhs: Box::new(lhs.map_loads(subst)),
                rhs: Box::new(rhs.map_loads(subst)),
            },
            Expr::Select {
                cond,
                on_true,
                on_false,
            } => Expr::Select {
                cond: Box::new(cond.map_loads(subst)),
                on_true: Box::new(on_true.map_loads(subst)),
                on_false: Box::new(on_false.map_loads(subst)),
            },
        }
    }
}

impl ops::Add for Expr {
    type Output = Expr;
    fn add(self, rhs: Expr) -> Expr {
        binary(BinOp::Add, self, rhs)
    }
}

impl ops::Sub for Expr {
    type Output = Expr;
    fn sub(self, rhs: Expr) -> Expr {
        binary(BinOp::Sub, self, rhs)
    }
}

impl ops::Mul for Expr {
    type Output = Expr;
    fn mul(self, rhs: Expr) -> Expr {
        binary(BinOp::Mul, self, rhs)
    }
}

impl ops::Div for Expr {
    type Output = Expr;
    fn div(self, rhs: Expr) -> Expr {
        binary(BinOp::Div, self, rhs)
    }
}

impl ops::Neg for Expr {
    type Output = Expr;
    fn neg(self) -> Expr {
        unary(UnOp::Neg, self)
    }
}

/// Execution strategy chosen by the scheduler for one loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Parallelism {
    #[default]
    Serial,
    /// Iterations run concurrently on the target's compute units.
    Parallel,
    /// Innermost lane-wise execution; semantically identical to serial.
    Vectorize,
}

/// A counted loop. `begin`/`end` are integer expressions over enclosing
/// induction variables and constants; `step` is a nonzero constant
/// stride. Dilation in the bundled kernels is expressed through index
/// arithmetic rather than strides, but strided iteration is supported.
#[derive(Debug, Clone, PartialEq)]
pub struct Loop {
    pub iter: String,
    pub begin: Expr,
    pub end: Expr,
    pub step: i64,
    pub parallel: Parallelism,
    pub body: Vec<Stmt>,
}

impl Loop {
    /// Number of iterations when the bounds are compile-time constants.
    pub fn const_trip_count(&self) -> Option<usize> {
        let begin = self.begin.as_const_int()?;
        let end = self.end.as_const_int()?;
        if self.step == 0 {
            return None;
        }
        let span = if self.step > 0 { end - begin } else { begin - end };
        if span <= 0 {
            return Some(0);
        }
        let step = self.step.unsigned_abs() as i64;
        Some(((span + step - 1) / step) as usize)
    }
}

/// Program statement.
#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    /// `var[indices] = value`
    Store {
        var: String,
        indices: Vec<Expr>,
        value: Expr,
    },
    /// `var[indices] op= value`
    Reduce {
        var: String,
        indices: Vec<Expr>,
        op: ReduceOp,
        value: Expr,
    },
    If {
        cond: Expr,
        then_body: Vec<Stmt>,
        else_body: Vec<Stmt>,
    },
    For(Loop),
    /// Scoped local allocation: `decl` names a temporary that exists for
    /// the duration of `body` and is reinstantiated on every entry, so
    /// parallel iterations of an enclosing loop never share storage.
    Alloc { decl: VarDecl, body: Vec<Stmt> },
}

impl Stmt {
    /// Pre-order traversal over the statement tree.
    pub fn visit(&self, f: &mut impl FnMut(&Stmt)) {
        f(self);
        match self {
            Stmt::Store { .. } | Stmt::Reduce { .. } => {}
            Stmt::If {
                then_body,
                else_body,
                ..
            } => {
                for s in then_body.iter().chain(else_body) {
                    s.visit(f);
                }
            }
            Stmt::For(l) => {
                for s in &l.body {
                    s.visit(f);
                }
            }
            Stmt::Alloc { body, .. } => {
                for s in body {
                    s.visit(f);
                }
            }
        }
    }
}

/// An immutable tensor program: parameter signature plus statement body.
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    pub name: String,
    pub params: Vec<VarDecl>,
    pub body: Vec<Stmt>,
}

impl Program {
    pub fn param(&self, name: &str) -> Option<&VarDecl> {
        self.params.iter().find(|d| d.name == name)
    }

    pub fn inputs(&self) -> impl Iterator<Item = &VarDecl> {
        self.params.iter().filter(|d| d.role == Role::Input)
    }

    pub fn outputs(&self) -> impl Iterator<Item = &VarDecl> {
        self.params.iter().filter(|d| d.role == Role::Output)
    }

    /// Visit every statement in the body, depth first.
    pub fn visit(&self, f: &mut impl FnMut(&Stmt)) {
        for s in &self.body {
            s.visit(f);
        }
    }
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        print::write_program(self, f)
    }
}
