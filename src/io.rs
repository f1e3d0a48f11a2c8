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

//! Flat text tensor files.
//!
//! The format is one header line, `<dtype> <extent>*`, followed by the
//! elements in row-major order, one line per innermost row:
//!
//! ```text
//! f32 2 3
//! 1.0 2.0 3.0
//! 4.0 5.0 6.0
//! ```
//!
//! Floats are written in shortest-round-trip form, so storing a loaded
//! tensor reproduces the file byte for byte.

use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use crate::exec::TensorVal;
use crate::types::DType;

#[derive(Debug, thiserror::Error)]
pub enum IoError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("{}:{line}: {message}", path.display())]
    Parse {
        path: PathBuf,
        line: usize,
        message: String,
    },
}

/// Write `t` to `path`, replacing any existing file.
pub fn store_txt(path: &Path, t: &TensorVal) -> Result<(), IoError> {
    let mut out = String::new();
    let _ = write!(out, "{}", t.dtype());
    for extent in t.shape() {
        let _ = write!(out, " {extent}");
    }
    out.push('\n');
    let row = t.shape().last().copied().unwrap_or(1).max(1);
    match t.dtype() {
        DType::F32 => {
            for chunk in t.as_f32().unwrap_or(&[]).chunks(row) {
                push_row(&mut out, chunk.iter(), |s, v| {
                    let _ = write!(s, "{v:?}");
                });
            }
        }
        DType::I32 => {
            for chunk in t.as_i32().unwrap_or(&[]).chunks(row) {
                push_row(&mut out, chunk.iter(), |s, v| {
                    let _ = write!(s, "{v}");
                });
            }
        }
    }
    fs::write(path, out)?;
    Ok(())
}

fn push_row<'v, V: 'v>(
    out: &mut String,
    values: impl Iterator<Item = &'v V>,
    mut fmt: impl FnMut(&mut String, &V),
) {
    for (i, v) in values.enumerate() {
        if i > 0 {
            out.push(' ');
        }
        fmt(out, v);
    }
    out.push('\n');
}

/// Read a tensor from `path`.
pub fn load_txt(path: &Path) -> Result<TensorVal, IoError> {
    let text = fs::read_to_string(path)?;
    let parse_err = |line: usize, message: String| IoError::Parse {
        path: path.to_path_buf(),
        line,
        message,
    };

    let mut lines = text.lines().enumerate();
    let (header_no, header) = lines
        .by_ref()
        .find(|(_, l)| !l.trim().is_empty())
        .ok_or_else(|| parse_err(1, "empty tensor file".to_string()))?;
    let mut tokens = header.split_ascii_whitespace();
    let dtype = match tokens.next() {
        Some("f32") => DType::F32,
        Some("i32") => DType::I32,
        other => {
            return Err(parse_err(
                header_no + 1,
                format!("expected a dtype token, found {:?}", other.unwrap_or("")),
            ))
        }
    };
    let mut shape = Vec::new();
    for tok in tokens {
        let extent: usize = tok
            .parse()
            .map_err(|_| parse_err(header_no + 1, format!("bad extent '{tok}'")))?;
        shape.push(extent);
    }
    let expected: usize = shape.iter().product();

    match dtype {
        DType::F32 => {
            let values = parse_values::<f32>(lines, expected, &parse_err)?;
            TensorVal::from_f32(&shape, values)
                .map_err(|e| parse_err(header_no + 1, e.to_string()))
        }
        DType::I32 => {
            let values = parse_values::<i32>(lines, expected, &parse_err)?;
            TensorVal::from_i32(&shape, values)
                .map_err(|e| parse_err(header_no + 1, e.to_string()))
        }
    }
}

fn parse_values<'t, T: std::str::FromStr>(
    lines: impl Iterator<Item = (usize, &'t str)>,
    expected: usize,
    parse_err: &impl Fn(usize, String) -> IoError,
) -> Result<Vec<T>, IoError> {
    let mut values = Vec::with_capacity(expected);
    let mut last_line = 0;
    for (no, line) in lines {
        last_line = no;
        for tok in line.split_ascii_whitespace() {
            let v: T = tok
                .parse()
                .map_err(|_| parse_err(no + 1, format!("bad value '{tok}'")))?;
            values.push(v);
        }
    }
    if values.len() != expected {
        return Err(parse_err(
            last_line + 1,
            format!("expected {expected} values, found {}", values.len()),
        ));
    }
    Ok(values)
}
