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

//! Deterministic textual rendering of programs.
//!
//! The printer output is stable across runs for the same program and is
//! what the determinism tests compare; it is not a parseable syntax.

use std::fmt::{self, Write as _};

use crate::ir::{BinOp, Expr, Parallelism, Program, ReduceOp, Stmt, UnOp};

pub fn write_program(p: &Program, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "program {}(", p.name)?;
    for (i, d) in p.params.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{}: {} {}", d.name, d.ty, d.role)?;
    }
    writeln!(f, ") {{")?;
    for s in &p.body {
        write_stmt(s, 1, f)?;
    }
    writeln!(f, "}}")
}

fn indent(level: usize, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    for _ in 0..level {
        write!(f, "  ")?;
    }
    Ok(())
}

fn write_stmt(s: &Stmt, level: usize, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match s {
        Stmt::Store {
            var,
            indices,
            value,
        } => {
            indent(level, f)?;
            writeln!(f, "{}{} = {}", var, render_indices(indices), render(value))
        }
        Stmt::Reduce {
            var,
            indices,
            op,
            value,
        } => {
            let sym = match op {
                ReduceOp::Add => "+=",
                ReduceOp::Min => "min=",
                ReduceOp::Max => "max=",
            };
            indent(level, f)?;
            writeln!(
                f,
                "{}{} {} {}",
                var,
                render_indices(indices),
                sym,
                render(value)
            )
        }
        Stmt::If {
            cond,
            then_body,
            else_body,
        } => {
            indent(level, f)?;
            writeln!(f, "if {} {{", render(cond))?;
            for s in then_body {
                write_stmt(s, level + 1, f)?;
            }
            if !else_body.is_empty() {
                indent(level, f)?;
                writeln!(f, "}} else {{")?;
                for s in else_body {
                    write_stmt(s, level + 1, f)?;
                }
            }
            indent(level, f)?;
            writeln!(f, "}}")
        }
        Stmt::For(l) => {
            indent(level, f)?;
            let tag = match l.parallel {
                Parallelism::Serial => "for",
                Parallelism::Parallel => "parallel for",
                Parallelism::Vectorize => "vector for",
            };
            if l.step == 1 {
                writeln!(
                    f,
                    "{} {} in {}..{} {{",
                    tag,
                    l.iter,
                    render(&l.begin),
                    render(&l.end)
                )?;
            } else {
                writeln!(
                    f,
                    "{} {} in {}..{} step {} {{",
                    tag,
                    l.iter,
                    render(&l.begin),
                    render(&l.end),
                    l.step
                )?;
            }
            for s in &l.body {
                write_stmt(s, level + 1, f)?;
            }
            indent(level, f)?;
            writeln!(f, "}}")
        }
        Stmt::Alloc { decl, body } => {
            indent(level, f)?;
            writeln!(f, "alloc {}: {} {{", decl.name, decl.ty)?;
            for s in body {
                write_stmt(s, level + 1, f)?;
            }
            indent(level, f)?;
            writeln!(f, "}}")
        }
    }
}

fn render_indices(indices: &[Expr]) -> String {
    if indices.is_empty() {
        return "[]".to_string();
    }
    let mut out = String::from("[");
    for (i, idx) in indices.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        out.push_str(&render(idx));
    }
    out.push(']');
    out
}

fn bin_sym(op: BinOp) -> &'static str {
    match op {
        BinOp::Add => "+",
        BinOp::Sub => "-",
        BinOp::Mul => "*",
        BinOp::Div => "/",
        BinOp::Rem => "%",
        BinOp::Min => "min",
        BinOp::Max => "max",
        BinOp::Lt => "<",
        BinOp::Le => "<=",
        BinOp::Gt => ">",
        BinOp::Ge => ">=",
        BinOp::Eq => "==",
        BinOp::Ne => "!=",
        BinOp::And => "&&",
        BinOp::Or => "||",
    }
}

/// Render an expression. Fully parenthesized so the output never
/// depends on precedence rules.
pub fn render(e: &Expr) -> String {
    match e {
        Expr::FConst(v) => {
            // `{}` on f32 round-trips exactly; keep a trailing `.0` off
            // integral values out of the picture by formatting debug-style.
            let mut s = String::new();
            let _ = write!(s, "{v:?}");
            s
        }
        Expr::IConst(v) => format!("{v}"),
        Expr::Iter(name) => name.clone(),
        Expr::Load { var, indices } => format!("{}{}", var, render_indices(indices)),
        Expr::Cast { dtype, arg } => format!("{}({})", dtype, render(arg)),
        Expr::Unary { op, arg } => {
            let name = match op {
                UnOp::Neg => "-",
                UnOp::Sqrt => "sqrt",
                UnOp::Exp => "exp",
                UnOp::Sigmoid => "sigmoid",
                UnOp::Abs => "abs",
                UnOp::Not => "!",
            };
            match op {
                UnOp::Neg | UnOp::Not => format!("({}{})", name, render(arg)),
                _ => format!("{}({})", name, render(arg)),
            }
        }
        Expr::Binary { op, lhs, rhs } => match op {
            BinOp::Min | BinOp::Max => {
                format!("{}({}, {})", bin_sym(*op), render(lhs), render(rhs))
            }
            _ => format!("({} {} {})", render(lhs), bin_sym(*op), render(rhs)),
        },
        Expr::Select {
            cond,
            on_true,
            on_false,
        } => format!(
            "select({}, {}, {})",
            render(cond),
            render(on_true),
            render(on_false)
        ),
    }
}
