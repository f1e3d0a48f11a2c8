//! Basic tensor type definitions.
//!
//! # Example
//! ```
//! use weft::types::{DType, Role, TensorType};
//! let ty = TensorType::new(DType::F32, vec![2, 3]);
//! assert_eq!(ty.rank(), 2);
//! assert_eq!(ty.len(), 6);
//! let _ = Role::Input;
//! ```

use std::fmt;

/// Element type of a tensor. The workload is 32-bit only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DType {
    F32,
    I32,
}

impl DType {
    pub fn is_float(self) -> bool {
        matches!(self, DType::F32)
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DType::F32 => write!(f, "f32"),
            DType::I32 => write!(f, "i32"),
        }
    }
}

/// Binding role of a program variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Bound by the caller, read-only inside the program.
    Input,
    /// Bound by the caller, written by the program.
    Output,
    /// Scoped temporary owned by the program.
    Local,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Input => write!(f, "input"),
            Role::Output => write!(f, "output"),
            Role::Local => write!(f, "local"),
        }
    }
}

/// Element type plus static shape. All dimensions in this workload are
/// known at program-build time; a scalar has an empty shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorType {
    pub dtype: DType,
    pub shape: Vec<usize>,
}

impl TensorType {
    pub fn new(dtype: DType, shape: Vec<usize>) -> Self {
        Self { dtype, shape }
    }

    pub fn scalar(dtype: DType) -> Self {
        Self {
            dtype,
            shape: Vec::new(),
        }
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// Total element count (1 for scalars).
    pub fn len(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Display for TensorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[", self.dtype)?;
        for (i, d) in self.shape.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{d}")?;
        }
        write!(f, "]")
    }
}

#[cfg(test)]
mod tests {
    use super::{DType, TensorType};

    #[test]
    fn tensor_type_len_and_rank() {
        let t = TensorType::new(DType::F32, vec![2, 3, 4]);
        assert_eq!(t.rank(), 3);
        assert_eq!(t.len(), 24);
    }

    #[test]
    fn scalar_has_one_element() {
        let t = TensorType::scalar(DType::I32);
        assert_eq!(t.rank(), 0);
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn display_forms() {
        let t = TensorType::new(DType::I32, vec![5, 1]);
        assert_eq!(format!("{t}"), "i32[5, 1]");
        assert_eq!(format!("{}", TensorType::scalar(DType::F32)), "f32[]");
    }
}
