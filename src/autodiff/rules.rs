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

//! Local adjoint rules, one per primitive operation.
//!
//! [`accumulate`] walks a primal expression and emits one gradient
//! accumulation per load of a gradient-tracked variable, multiplying
//! the upstream adjoint by the local partial derivative at each step.
//! Primal subexpressions referenced by a partial are passed through the
//! engine's load rewriter so taped locals read from their tape.
//!
//! Tie-breaking: binary `min`/`max` route the whole gradient to the
//! left operand on ties (`l <= r` / `l >= r`); `select` routes by its
//! predicate. Both are deterministic.

use crate::ir::{self, BinOp, Expr, ReduceOp, Stmt, UnOp};

/// Engine services needed while emitting adjoints.
pub(super) trait AdjointSink {
    /// Rewrite a primal expression for use inside the backward program
    /// (tape substitution).
    fn rewrite(&self, e: &Expr) -> Expr;
    /// Gradient buffer name for `var`, or `None` when no gradient is
    /// tracked for it (integers, inputs outside the requires set).
    fn grad_of(&self, var: &str) -> Option<String>;
    /// Whether an expression is float-valued (gradients only flow
    /// through floats).
    fn is_float(&self, e: &Expr) -> bool;
}

/// Emit `grad(load) += upstream * d(expr)/d(load)` for every tracked
/// load in `expr`. `upstream` must already be rewritten for the
/// backward program.
pub(super) fn accumulate(
    sink: &impl AdjointSink,
    expr: &Expr,
    upstream: Expr,
    out: &mut Vec<Stmt>,
) {
    match expr {
        Expr::FConst(_) | Expr::IConst(_) | Expr::Iter(_) => {}
        Expr::Load { var, indices } => {
            let Some(grad) = sink.grad_of(var) else {
                return;
            };
            let indices = indices.iter().map(|i| sink.rewrite(i)).collect();
            out.push(Stmt::Reduce {
                var: grad,
                indices,
                op: ReduceOp::Add,
                value: upstream,
            });
        }
        Expr::Cast { arg, .. } => {
            // Float-to-float casts pass the gradient through; an integer
            // operand ends the differentiable path.
            if sink.is_float(arg) {
                accumulate(sink, arg, upstream, out);
            }
        }
        Expr::Unary { op, arg } => match op {
            UnOp::Neg => accumulate(sink, arg, -upstream, out),
            UnOp::Sqrt => {
                let a = sink.rewrite(arg);
                let partial = upstream / (ir::fconst(2.0) * ir::sqrt(a));
                accumulate(sink, arg, partial, out);
            }
            UnOp::Exp => {
                let a = sink.rewrite(arg);
                accumulate(sink, arg, upstream * ir::exp(a), out);
            }
            UnOp::Sigmoid => {
                let s = ir::sigmoid(sink.rewrite(arg));
                let partial = upstream * s.clone() * (ir::fconst(1.0) - s);
                accumulate(sink, arg, partial, out);
            }
            UnOp::Abs => {
                let a = sink.rewrite(arg);
                let partial = ir::select(
                    a.ge(ir::fconst(0.0)),
                    upstream.clone(),
                    -upstream,
                );
                accumulate(sink, arg, partial, out);
            }
            UnOp::Not => {}
        },
        Expr::Binary { op, lhs, rhs } => match op {
            BinOp::Add => {
                accumulate(sink, lhs, upstream.clone(), out);
                accumulate(sink, rhs, upstream, out);
            }
            BinOp::Sub => {
                accumulate(sink, lhs, upstream.clone(), out);
                accumulate(sink, rhs, -upstream, out);
            }
            BinOp::Mul => {
                let l = sink.rewrite(lhs);
                let r = sink.rewrite(rhs);
                accumulate(sink, lhs, upstream.clone() * r, out);
                accumulate(sink, rhs, upstream * l, out);
            }
            BinOp::Div => {
                let l = sink.rewrite(lhs);
                let r = sink.rewrite(rhs);
                accumulate(sink, lhs, upstream.clone() / r.clone(), out);
                accumulate(sink, rhs, -(upstream * l) / (r.clone() * r), out);
            }
            BinOp::Min => {
                let tie_left = sink.rewrite(lhs).le(sink.rewrite(rhs));
                accumulate(
                    sink,
                    lhs,
                    ir::select(tie_left.clone(), upstream.clone(), ir::fconst(0.0)),
                    out,
                );
                accumulate(sink, rhs, ir::select(tie_left, ir::fconst(0.0), upstream), out);
            }
            BinOp::Max => {
                let tie_left = sink.rewrite(lhs).ge(sink.rewrite(rhs));
                accumulate(
                    sink,
                    lhs,
                    ir::select(tie_left.clone(), upstream.clone(), ir::fconst(0.0)),
                    out,
                );
                accumulate(sink, rhs, ir::select(tie_left, ir::fconst(0.0), upstream), out);
            }
            // Integer-only or boolean operations carry no gradient.
            BinOp::Rem
            | BinOp::Lt
            | BinOp::Le
            | BinOp::Gt
            | BinOp::Ge
            | BinOp::Eq
            | BinOp::Ne
            | BinOp::And
            | BinOp::Or => {}
        },
        Expr::Select {
            cond,
            on_true,
            on_false,
        } => {
            let c = sink.rewrite(cond);
            accumulate(
                sink,
                on_true,
                ir::select(c.clone(), upstream.clone(), ir::fconst(0.0)),
                out,
            );
            accumulate(sink, on_false, ir::select(c, ir::fconst(0.0), upstream), out);
        }
    }
}
