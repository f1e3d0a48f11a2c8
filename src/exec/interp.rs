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

//! Statement-tree interpreter.
//!
//! Buffers are shared across parallel iterations through raw pointers.
//! The scheduler only marks a loop parallel after proving no two
//! iterations touch the same element of any shared tensor, and scoped
//! locals are instantiated per iteration, so concurrent writes to one
//! element cannot occur. Every access is still bounds-checked at
//! runtime, since gather and scatter indices are data.

use std::collections::BTreeMap;

use rayon::prelude::*;

use crate::exec::{Bindings, Data, ExecError, TensorVal};
use crate::ir::{BinOp, Expr, Loop, Parallelism, Program, ReduceOp, Stmt, UnOp};
use crate::types::DType;

/// Execute a program against the caller's buffers. Every parameter must
/// be bound to a tensor of exactly the declared type; outputs and
/// gradient buffers are written in place.
pub fn run(program: &Program, bindings: &mut Bindings) -> Result<(), ExecError> {
    for d in &program.params {
        let val = bindings
            .get(&d.name)
            .ok_or_else(|| ExecError::MissingBinding(d.name.clone()))?;
        if val.dtype() != d.ty.dtype || val.shape() != d.ty.shape.as_slice() {
            return Err(ExecError::SignatureMismatch {
                var: d.name.clone(),
                expected: d.ty.clone(),
                got: val.ty(),
            });
        }
    }
    let mut globals: BTreeMap<&str, BufRef<'_>> = BTreeMap::new();
    for (name, val) in bindings.iter_mut() {
        let (shape, data) = val.parts_mut();
        let parts = match data {
            Data::F32(v) => RawParts::F32(v.as_mut_ptr()),
            Data::I32(v) => RawParts::I32(v.as_mut_ptr()),
        };
        globals.insert(name.as_str(), BufRef { parts, shape });
    }
    let ctx = Ctx {
        globals: &globals,
        vars: None,
        iters: None,
    };
    exec_block(&program.body, ctx)
}

#[derive(Clone, Copy)]
enum RawParts {
    F32(*mut f32),
    I32(*mut i32),
}

/// Unowned view of one buffer.
#[derive(Clone, Copy)]
struct BufRef<'a> {
    parts: RawParts,
    shape: &'a [usize],
}

// SAFETY: a BufRef crosses threads only inside a parallel loop, and the
// scheduler's dependence proof guarantees iterations access disjoint
// elements of every shared buffer. The storage outlives the run.
unsafe impl Send for BufRef<'_> {}
unsafe impl Sync for BufRef<'_> {}

struct VarNode<'a> {
    name: &'a str,
    buf: BufRef<'a>,
    next: Option<&'a VarNode<'a>>,
}

struct IterNode<'a> {
    name: &'a str,
    value: i64,
    next: Option<&'a IterNode<'a>>,
}

/// Execution context: the global buffer table plus stack-linked scopes
/// for locals and induction variables.
#[derive(Clone, Copy)]
struct Ctx<'a> {
    globals: &'a BTreeMap<&'a str, BufRef<'a>>,
    vars: Option<&'a VarNode<'a>>,
    iters: Option<&'a IterNode<'a>>,
}

impl<'a> Ctx<'a> {
    fn var(&self, name: &str) -> Result<BufRef<'a>, ExecError> {
        let mut node = self.vars;
        while let Some(n) = node {
            if n.name == name {
                return Ok(n.buf);
            }
            node = n.next;
        }
        self.globals
            .get(name)
            .copied()
            .ok_or_else(|| ExecError::UnboundVariable(name.to_string()))
    }

    fn iter(&self, name: &str) -> Result<i64, ExecError> {
        let mut node = self.iters;
        while let Some(n) = node {
            if n.name == name {
                return Ok(n.value);
            }
            node = n.next;
        }
        Err(ExecError::UnboundIterator(name.to_string()))
    }
}

#[derive(Clone, Copy, Debug)]
enum Scalar {
    F(f32),
    I(i64),
    B(bool),
}

impl Scalar {
    fn as_f(self) -> Result<f32, ExecError> {
        match self {
            Scalar::F(v) => Ok(v),
            other => Err(ExecError::Type(format!("expected a float, got {other:?}"))),
        }
    }

    fn as_i(self) -> Result<i64, ExecError> {
        match self {
            Scalar::I(v) => Ok(v),
            other => Err(ExecError::Type(format!("expected an integer, got {other:?}"))),
        }
    }

    fn as_b(self) -> Result<bool, ExecError> {
        match self {
            Scalar::B(v) => Ok(v),
            other => Err(ExecError::Type(format!("expected a predicate, got {other:?}"))),
        }
    }
}

fn exec_block<'a>(stmts: &'a [Stmt], ctx: Ctx<'a>) -> Result<(), ExecError> {
    for s in stmts {
        match s {
            Stmt::Store {
                var,
                indices,
                value,
            } => {
                let buf = ctx.var(var)?;
                let off = offset(var, buf, indices, ctx)?;
                let v = eval(value, ctx)?;
                write(buf, off, v)?;
            }
            Stmt::Reduce {
                var,
                indices,
                op,
                value,
            } => {
                let buf = ctx.var(var)?;
                let off = offset(var, buf, indices, ctx)?;
                let v = eval(value, ctx)?;
                let cur = read(buf, off);
                let combined = match op {
                    ReduceOp::Add => eval_bin(BinOp::Add, cur, v)?,
                    ReduceOp::Min => eval_bin(BinOp::Min, cur, v)?,
                    ReduceOp::Max => eval_bin(BinOp::Max, cur, v)?,
                };
                write(buf, off, combined)?;
            }
            Stmt::If {
                cond,
                then_body,
                else_body,
            } => {
                if eval(cond, ctx)?.as_b()? {
                    exec_block(then_body, ctx)?;
                } else {
                    exec_block(else_body, ctx)?;
                }
            }
            Stmt::For(l) => exec_loop(l, ctx)?,
            Stmt::Alloc { decl, body } => {
                let mut storage = TensorVal::zeros(decl.ty.dtype, &decl.ty.shape);
                let parts = match storage.data_mut() {
                    Data::F32(v) => RawParts::F32(v.as_mut_ptr()),
                    Data::I32(v) => RawParts::I32(v.as_mut_ptr()),
                };
                let node = VarNode {
                    name: &decl.name,
                    buf: BufRef {
                        parts,
                        shape: &decl.ty.shape,
                    },
                    next: ctx.vars,
                };
                exec_block(
                    body,
                    Ctx {
                        vars: Some(&node),
                        ..ctx
                    },
                )?;
            }
        }
    }
    Ok(())
}

fn exec_loop<'a>(l: &'a Loop, ctx: Ctx<'a>) -> Result<(), ExecError> {
    let begin = eval(&l.begin, ctx)?.as_i()?;
    let end = eval(&l.end, ctx)?.as_i()?;
    let step = l.step;
    match l.parallel {
        Parallelism::Parallel => {
            let span = if step > 0 { end - begin } else { begin - end };
            if span <= 0 {
                return Ok(());
            }
            let m = step.unsigned_abs() as i64;
            let trips = (span + m - 1) / m;
            (0..trips).into_par_iter().try_for_each(|t| {
                let node = IterNode {
                    name: &l.iter,
                    value: begin + t * step,
                    next: ctx.iters,
                };
                exec_block(
                    &l.body,
                    Ctx {
                        iters: Some(&node),
                        ..ctx
                    },
                )
            })
        }
        // Lane marks are advisory on the host.
        Parallelism::Serial | Parallelism::Vectorize => {
            let mut v = begin;
            while (step > 0 && v < end) || (step < 0 && v > end) {
                let node = IterNode {
                    name: &l.iter,
                    value: v,
                    next: ctx.iters,
                };
                exec_block(
                    &l.body,
                    Ctx {
                        iters: Some(&node),
                        ..ctx
                    },
                )?;
                v += step;
            }
            Ok(())
        }
    }
}

/// Row-major flat offset, bounds-checking every axis.
fn offset(var: &str, buf: BufRef<'_>, indices: &[Expr], ctx: Ctx<'_>) -> Result<usize, ExecError> {
    if indices.len() != buf.shape.len() {
        return Err(ExecError::Type(format!(
            "access of '{var}' has {} indices, tensor has rank {}",
            indices.len(),
            buf.shape.len()
        )));
    }
    let mut off = 0usize;
    for (axis, (idx, extent)) in indices.iter().zip(buf.shape).enumerate() {
        let v = eval(idx, ctx)?.as_i()?;
        if v < 0 || v as usize >= *extent {
            return Err(ExecError::OutOfBounds {
                var: var.to_string(),
                axis,
                index: v,
                extent: *extent,
            });
        }
        off = off * extent + v as usize;
    }
    Ok(off)
}

fn read(buf: BufRef<'_>, off: usize) -> Scalar {
    // SAFETY: `off` was bounds-checked against the buffer's shape and
    // the storage outlives the run.
    match buf.parts {
        RawParts::F32(p) => Scalar::F(unsafe { *p.add(off) }),
        RawParts::I32(p) => Scalar::I(i64::from(unsafe { *p.add(off) })),
    }
}

fn write(buf: BufRef<'_>, off: usize, val: Scalar) -> Result<(), ExecError> {
    match buf.parts {
        RawParts::F32(p) => {
            let v = val.as_f()?;
            // SAFETY: as in `read`; disjointness across threads is the
            // scheduler's proof obligation.
            unsafe { *p.add(off) = v };
        }
        RawParts::I32(p) => {
            let v = val.as_i()?;
            unsafe { *p.add(off) = v as i32 };
        }
    }
    Ok(())
}

fn eval(e: &Expr, ctx: Ctx<'_>) -> Result<Scalar, ExecError> {
    match e {
        Expr::FConst(v) => Ok(Scalar::F(*v)),
        Expr::IConst(v) => Ok(Scalar::I(*v)),
        Expr::Iter(name) => Ok(Scalar::I(ctx.iter(name)?)),
        Expr::Load { var, indices } => {
            let buf = ctx.var(var)?;
            let off = offset(var, buf, indices, ctx)?;
            Ok(read(buf, off))
        }
        Expr::Cast { dtype, arg } => {
            let v = eval(arg, ctx)?;
            match dtype {
                DType::F32 => Ok(Scalar::F(match v {
                    Scalar::F(f) => f,
                    Scalar::I(i) => i as f32,
                    Scalar::B(_) => {
                        return Err(ExecError::Type("cannot cast a predicate".into()))
                    }
                })),
                DType::I32 => Ok(Scalar::I(match v {
                    Scalar::I(i) => i,
                    Scalar::F(f) => f as i64,
                    Scalar::B(_) => {
                        return Err(ExecError::Type("cannot cast a predicate".into()))
                    }
                })),
            }
        }
        Expr::Unary { op, arg } => {
            let v = eval(arg, ctx)?;
            match op {
                UnOp::Neg => match v {
                    Scalar::F(f) => Ok(Scalar::F(-f)),
                    Scalar::I(i) => Ok(Scalar::I(-i)),
                    Scalar::B(_) => Err(ExecError::Type("arithmetic on a predicate".into())),
                },
                UnOp::Abs => match v {
                    Scalar::F(f) => Ok(Scalar::F(f.abs())),
                    Scalar::I(i) => Ok(Scalar::I(i.abs())),
                    Scalar::B(_) => Err(ExecError::Type("arithmetic on a predicate".into())),
                },
                UnOp::Sqrt => Ok(Scalar::F(v.as_f()?.sqrt())),
                UnOp::Exp => Ok(Scalar::F(v.as_f()?.exp())),
                UnOp::Sigmoid => {
                    let x = v.as_f()?;
                    Ok(Scalar::F(1.0 / (1.0 + (-x).exp())))
                }
                UnOp::Not => Ok(Scalar::B(!v.as_b()?)),
            }
        }
        Expr::Binary { op, lhs, rhs } => {
            let l = eval(lhs, ctx)?;
            let r = eval(rhs, ctx)?;
            eval_bin(*op, l, r)
        }
        // Only the selected arm is evaluated, so a guarded gather never
        // reads out of bounds.
        Expr::Select {
            cond,
            on_true,
            on_false,
        } => {
            if eval(cond, ctx)?.as_b()? {
                eval(on_true, ctx)
            } else {
                eval(on_false, ctx)
            }
        }
    }
}

fn eval_bin(op: BinOp, l: Scalar, r: Scalar) -> Result<Scalar, ExecError> {
    use Scalar::{B, F, I};
    match op {
        BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge | BinOp::Eq | BinOp::Ne => {
            let b = match (l, r) {
                (F(a), F(c)) => compare_f(op, a, c),
                (I(a), I(c)) => compare_i(op, a, c),
                _ => {
                    return Err(ExecError::Type(format!(
                        "comparison operands disagree: {l:?} vs {r:?}"
                    )))
                }
            };
            Ok(B(b))
        }
        BinOp::And => Ok(B(l.as_b()? && r.as_b()?)),
        BinOp::Or => Ok(B(l.as_b()? || r.as_b()?)),
        BinOp::Add => arith(op, l, r, |a, b| a + b, |a, b| Ok(a + b)),
        BinOp::Sub => arith(op, l, r, |a, b| a - b, |a, b| Ok(a - b)),
        BinOp::Mul => arith(op, l, r, |a, b| a * b, |a, b| Ok(a * b)),
        BinOp::Div => arith(
            op,
            l,
            r,
            |a, b| a / b,
            |a, b| {
                if b == 0 {
                    Err(ExecError::DivisionByZero)
                } else {
                    Ok(a.div_euclid(b))
                }
            },
        ),
        BinOp::Rem => match (l, r) {
            (I(_), I(0)) => Err(ExecError::DivisionByZero),
            (I(a), I(b)) => Ok(I(a.rem_euclid(b))),
            _ => Err(ExecError::Type("'%' requires integer operands".into())),
        },
        BinOp::Min => arith(op, l, r, |a, b| if a <= b { a } else { b }, |a, b| Ok(a.min(b))),
        BinOp::Max => arith(op, l, r, |a, b| if a >= b { a } else { b }, |a, b| Ok(a.max(b))),
    }
}

fn arith(
    op: BinOp,
    l: Scalar,
    r: Scalar,
    ff: impl Fn(f32, f32) -> f32,
    ii: impl Fn(i64, i64) -> Result<i64, ExecError>,
) -> Result<Scalar, ExecError> {
    match (l, r) {
        (Scalar::F(a), Scalar::F(b)) => Ok(Scalar::F(ff(a, b))),
        (Scalar::I(a), Scalar::I(b)) => Ok(Scalar::I(ii(a, b)?)),
        _ => Err(ExecError::Type(format!(
            "{op:?} operands disagree: {l:?} vs {r:?}"
        ))),
    }
}

fn compare_f(op: BinOp, a: f32, b: f32) -> bool {
    match op {
        BinOp::Lt => a < b,
        BinOp::Le => a <= b,
        BinOp::Gt => a > b,
        BinOp::Ge => a >= b,
        BinOp::Eq => a == b,
        _ => a != b,
    }
}

fn compare_i(op: BinOp, a: i64, b: i64) -> bool {
    match op {
        BinOp::Lt => a < b,
        BinOp::Le => a <= b,
        BinOp::Gt => a > b,
        BinOp::Ge => a >= b,
        BinOp::Eq => a == b,
        _ => a != b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{fconst, ProgramBuilder};
    use crate::runtime::DeviceKind;
    use crate::schedule::auto_schedule;
    use crate::types::DType;

    fn add_one() -> Program {
        let mut b = ProgramBuilder::new("add_one");
        let x = b.input("x", DType::F32, &[4]).unwrap();
        let y = b.output("y", DType::F32, &[4]).unwrap();
        let i = b.begin_for("i", 0, 4).unwrap();
        b.store(&y, &[i.clone()], x.at(&[i]) + fconst(1.0)).unwrap();
        b.end_for().unwrap();
        b.finish().unwrap()
    }

    #[test]
    fn serial_and_parallel_runs_agree() {
        let p = add_one();
        let scheduled = auto_schedule(&p, DeviceKind::Cpu).program;

        let mut serial = Bindings::new();
        serial.bind("x", TensorVal::from_f32(&[4], vec![1.0, 2.0, 3.0, 4.0]).unwrap());
        serial.bind("y", TensorVal::zeros(DType::F32, &[4]));
        run(&p, &mut serial).unwrap();

        let mut parallel = Bindings::new();
        parallel.bind("x", TensorVal::from_f32(&[4], vec![1.0, 2.0, 3.0, 4.0]).unwrap());
        parallel.bind("y", TensorVal::zeros(DType::F32, &[4]));
        run(&scheduled, &mut parallel).unwrap();

        assert_eq!(serial.get("y"), parallel.get("y"));
        assert_eq!(serial.get("y").unwrap().as_f32().unwrap(), &[2.0, 3.0, 4.0, 5.0]);
    }

    #[test]
    fn missing_binding_is_reported() {
        let mut b = Bindings::new();
        b.bind("x", TensorVal::zeros(DType::F32, &[4]));
        let err = run(&add_one(), &mut b).unwrap_err();
        assert_eq!(err, ExecError::MissingBinding("y".into()));
    }

    #[test]
    fn shape_mismatch_is_reported() {
        let mut b = Bindings::new();
        b.bind("x", TensorVal::zeros(DType::F32, &[5]));
        b.bind("y", TensorVal::zeros(DType::F32, &[4]));
        let err = run(&add_one(), &mut b).unwrap_err();
        assert!(matches!(err, ExecError::SignatureMismatch { var, .. } if var == "x"));
    }

    #[test]
    fn runtime_gather_is_bounds_checked() {
        let mut b = ProgramBuilder::new("gather");
        let idx = b.input("idx", DType::I32, &[2]).unwrap();
        let x = b.input("x", DType::F32, &[2]).unwrap();
        let y = b.output("y", DType::F32, &[2]).unwrap();
        let i = b.begin_for("i", 0, 2).unwrap();
        b.store(&y, &[i.clone()], x.at(&[idx.at(&[i])])).unwrap();
        b.end_for().unwrap();
        let p = b.finish().unwrap();

        let mut bind = Bindings::new();
        bind.bind("idx", TensorVal::from_i32(&[2], vec![0, 7]).unwrap());
        bind.bind("x", TensorVal::from_f32(&[2], vec![1.0, 2.0]).unwrap());
        bind.bind("y", TensorVal::zeros(DType::F32, &[2]));
        let err = run(&p, &mut bind).unwrap_err();
        assert_eq!(
            err,
            ExecError::OutOfBounds {
                var: "x".into(),
                axis: 0,
                index: 7,
                extent: 2,
            }
        );
    }

    #[test]
    fn locals_are_fresh_per_iteration() {
        let mut b = ProgramBuilder::new("square_via_local");
        let x = b.input("x", DType::F32, &[3]).unwrap();
        let y = b.output("y", DType::F32, &[3]).unwrap();
        let i = b.begin_for("i", 0, 3).unwrap();
        let t = b.local("t", DType::F32, &[]).unwrap();
        b.store(&t, &[], x.at(&[i.clone()]) * x.at(&[i.clone()])).unwrap();
        b.store(&y, &[i], t.get()).unwrap();
        b.end_for().unwrap();
        let p = b.finish().unwrap();
        let scheduled = auto_schedule(&p, DeviceKind::Cpu).program;

        let mut bind = Bindings::new();
        bind.bind("x", TensorVal::from_f32(&[3], vec![1.0, 2.0, 3.0]).unwrap());
        bind.bind("y", TensorVal::zeros(DType::F32, &[3]));
        run(&scheduled, &mut bind).unwrap();
        assert_eq!(bind.get("y").unwrap().as_f32().unwrap(), &[1.0, 4.0, 9.0]);
    }
}
