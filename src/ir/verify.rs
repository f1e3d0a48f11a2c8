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

//! Whole-program verifier.
//!
//! The builder already rejects malformed construction, but generated
//! programs (differentiation and scheduling outputs) and hand-assembled
//! ones go through [`verify_program`] before compilation. The verifier
//! enforces definition order, rank/element-type agreement, static index
//! bounds, loop well-formedness, and that every output receives at
//! least one write. It returns structured errors instead of panicking
//! on invalid input.

use std::collections::{BTreeMap, BTreeSet};

use crate::ir::{BinOp, Expr, Program, Stmt, UnOp};
use crate::types::{DType, Role};

/// Structured errors returned by the program verifier.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum VerifyError {
    #[error("duplicate parameter '{0}'")]
    DuplicateParam(String),
    #[error("parameter '{0}' declared with local role; locals are scoped in the body")]
    LocalInSignature(String),
    #[error("variable '{0}' is read before any write")]
    UseBeforeDefinition(String),
    #[error("unknown or out-of-scope variable '{0}'")]
    UnknownVariable(String),
    #[error("variable '{0}' is an input and cannot be written")]
    WriteToInput(String),
    #[error("reduction into '{0}' before it is initialized")]
    ReduceBeforeInit(String),
    #[error("variable '{var}' has rank {expected}, access has {got} indices")]
    RankMismatch {
        var: String,
        expected: usize,
        got: usize,
    },
    #[error("static index {index} out of bounds for '{var}' axis {axis} (extent {extent})")]
    IndexOutOfBounds {
        var: String,
        axis: usize,
        index: i64,
        extent: usize,
    },
    #[error("iterator or variable '{0}' shadowed in a nested scope")]
    Shadowed(String),
    #[error("unknown loop iterator '{0}'")]
    UnknownIterator(String),
    #[error("loop '{0}' has zero step")]
    ZeroStep(String),
    #[error("output '{0}' is never written")]
    OutputNeverWritten(String),
    #[error("type error: {0}")]
    Type(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ty {
    F32,
    I32,
    Bool,
}

fn ty_of_dtype(d: DType) -> Ty {
    match d {
        DType::F32 => Ty::F32,
        DType::I32 => Ty::I32,
    }
}

struct Scope {
    /// name -> (dtype, shape, role)
    vars: BTreeMap<String, (DType, Vec<usize>, Role)>,
    written: BTreeSet<String>,
    iters: Vec<String>,
}

/// Verify that a [`Program`] is well-formed.
pub fn verify_program(p: &Program) -> Result<(), VerifyError> {
    let mut scope = Scope {
        vars: BTreeMap::new(),
        written: BTreeSet::new(),
        iters: Vec::new(),
    };
    for d in &p.params {
        if d.role == Role::Local {
            return Err(VerifyError::LocalInSignature(d.name.clone()));
        }
        if scope
            .vars
            .insert(d.name.clone(), (d.ty.dtype, d.ty.shape.clone(), d.role))
            .is_some()
        {
            return Err(VerifyError::DuplicateParam(d.name.clone()));
        }
        if d.role == Role::Input {
            scope.written.insert(d.name.clone());
        }
    }
    verify_block(&p.body, &mut scope)?;
    for d in p.outputs() {
        if !scope.written.contains(&d.name) {
            return Err(VerifyError::OutputNeverWritten(d.name.clone()));
        }
    }
    Ok(())
}

fn verify_block(stmts: &[Stmt], scope: &mut Scope) -> Result<(), VerifyError> {
    for stmt in stmts {
        match stmt {
            Stmt::Store {
                var,
                indices,
                value,
            } => {
                check_write(var, indices, scope)?;
                let target_ty = ty_of_dtype(scope.vars[var].0);
                check_ty(value, target_ty, scope)?;
                scope.written.insert(var.clone());
            }
            Stmt::Reduce {
                var,
                indices,
                value,
                ..
            } => {
                check_write(var, indices, scope)?;
                if !scope.written.contains(var) {
                    return Err(VerifyError::ReduceBeforeInit(var.clone()));
                }
                let target_ty = ty_of_dtype(scope.vars[var].0);
                check_ty(value, target_ty, scope)?;
            }
            Stmt::If {
                cond,
                then_body,
                else_body,
            } => {
                check_ty(cond, Ty::Bool, scope)?;
                verify_block(then_body, scope)?;
                verify_block(else_body, scope)?;
            }
            Stmt::For(l) => {
                if l.step == 0 {
                    return Err(VerifyError::ZeroStep(l.iter.clone()));
                }
                if scope.iters.iter().any(|i| *i == l.iter) || scope.vars.contains_key(&l.iter)
                {
                    return Err(VerifyError::Shadowed(l.iter.clone()));
                }
                check_ty(&l.begin, Ty::I32, scope)?;
                check_ty(&l.end, Ty::I32, scope)?;
                scope.iters.push(l.iter.clone());
                verify_block(&l.body, scope)?;
                scope.iters.pop();
            }
            Stmt::Alloc { decl, body } => {
                if scope.vars.contains_key(&decl.name)
                    || scope.iters.iter().any(|i| *i == decl.name)
                {
                    return Err(VerifyError::Shadowed(decl.name.clone()));
                }
                scope.vars.insert(
                    decl.name.clone(),
                    (decl.ty.dtype, decl.ty.shape.clone(), Role::Local),
                );
                verify_block(body, scope)?;
                scope.vars.remove(&decl.name);
                scope.written.remove(&decl.name);
            }
        }
    }
    Ok(())
}

fn check_write(var: &str, indices: &[Expr], scope: &Scope) -> Result<(), VerifyError> {
    let (_, shape, role) = scope
        .vars
        .get(var)
        .ok_or_else(|| VerifyError::UnknownVariable(var.to_string()))?;
    if *role == Role::Input {
        return Err(VerifyError::WriteToInput(var.to_string()));
    }
    check_access(var, indices, shape, scope)
}

fn check_access(
    var: &str,
    indices: &[Expr],
    shape: &[usize],
    scope: &Scope,
) -> Result<(), VerifyError> {
    if indices.len() != shape.len() {
        return Err(VerifyError::RankMismatch {
            var: var.to_string(),
            expected: shape.len(),
            got: indices.len(),
        });
    }
    for (axis, (idx, extent)) in indices.iter().zip(shape).enumerate() {
        check_ty(idx, Ty::I32, scope)?;
        if let Some(v) = idx.as_const_int() {
            if v < 0 || v as usize >= *extent {
                return Err(VerifyError::IndexOutOfBounds {
                    var: var.to_string(),
                    axis,
                    index: v,
                    extent: *extent,
                });
            }
        }
    }
    Ok(())
}

fn check_ty(e: &Expr, expected: Ty, scope: &Scope) -> Result<(), VerifyError> {
    let found = type_of(e, scope)?;
    if found != expected {
        return Err(VerifyError::Type(format!(
            "expected {expected:?}, found {found:?} in {}",
            super::print::render(e)
        )));
    }
    Ok(())
}

fn type_of(e: &Expr, scope: &Scope) -> Result<Ty, VerifyError> {
    match e {
        Expr::FConst(_) => Ok(Ty::F32),
        Expr::IConst(_) => Ok(Ty::I32),
        Expr::Iter(name) => {
            if scope.iters.iter().any(|i| i == name) {
                Ok(Ty::I32)
            } else {
                Err(VerifyError::UnknownIterator(name.clone()))
            }
        }
        Expr::Load { var, indices } => {
            let (dtype, shape, role) = scope
                .vars
                .get(var)
                .ok_or_else(|| VerifyError::UnknownVariable(var.clone()))?
                .clone();
            if role != Role::Input && !scope.written.contains(var) {
                return Err(VerifyError::UseBeforeDefinition(var.clone()));
            }
            check_access(var, indices, &shape, scope)?;
            Ok(ty_of_dtype(dtype))
        }
        Expr::Cast { dtype, arg } => {
            let from = type_of(arg, scope)?;
            if from == Ty::Bool {
                return Err(VerifyError::Type("cannot cast a predicate".into()));
            }
            Ok(ty_of_dtype(*dtype))
        }
        Expr::Unary { op, arg } => {
            let ty = type_of(arg, scope)?;
            match op {
                UnOp::Neg | UnOp::Abs => {
                    if ty == Ty::Bool {
                        Err(VerifyError::Type("arithmetic on a predicate".into()))
                    } else {
                        Ok(ty)
                    }
                }
                UnOp::Sqrt | UnOp::Exp | UnOp::Sigmoid => {
                    if ty == Ty::F32 {
                        Ok(Ty::F32)
                    } else {
                        Err(VerifyError::Type(format!("{op:?} requires a float operand")))
                    }
                }
                UnOp::Not => {
                    if ty == Ty::Bool {
                        Ok(Ty::Bool)
                    } else {
                        Err(VerifyError::Type("'!' requires a predicate".into()))
                    }
                }
            }
        }
        Expr::Binary { op, lhs, rhs } => {
            let lt = type_of(lhs, scope)?;
            let rt = type_of(rhs, scope)?;
            match op {
                BinOp::And | BinOp::Or => {
                    if lt == Ty::Bool && rt == Ty::Bool {
                        Ok(Ty::Bool)
                    } else {
                        Err(VerifyError::Type(format!("{op:?} requires predicates")))
                    }
                }
                BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge | BinOp::Eq | BinOp::Ne => {
                    if lt == rt && lt != Ty::Bool {
                        Ok(Ty::Bool)
                    } else {
                        Err(VerifyError::Type(format!(
                            "comparison operands disagree: {lt:?} vs {rt:?}"
                        )))
                    }
                }
                BinOp::Rem => {
                    if lt == Ty::I32 && rt == Ty::I32 {
                        Ok(Ty::I32)
                    } else {
                        Err(VerifyError::Type("'%' requires integer operands".into()))
                    }
                }
                BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Min | BinOp::Max => {
                    if lt == rt && lt != Ty::Bool {
                        Ok(lt)
                    } else {
                        Err(VerifyError::Type(format!(
                            "{op:?} operands disagree: {lt:?} vs {rt:?}"
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
            check_ty(cond, Ty::Bool, scope)?;
            let tt = type_of(on_true, scope)?;
            let ft = type_of(on_false, scope)?;
            if tt == ft && tt != Ty::Bool {
                Ok(tt)
            } else {
                Err(VerifyError::Type(
                    "select arms must have the same value type".into(),
                ))
            }
        }
    }
}
