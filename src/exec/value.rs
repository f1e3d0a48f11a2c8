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

//! Host tensor values and the name -> buffer map a run executes against.

use std::collections::BTreeMap;

use crate::exec::ExecError;
use crate::types::{DType, TensorType};

/// Dense row-major element storage.
#[derive(Debug, Clone, PartialEq)]
pub enum Data {
    F32(Vec<f32>),
    I32(Vec<i32>),
}

/// A shaped, typed host tensor.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorVal {
    shape: Vec<usize>,
    data: Data,
}

impl TensorVal {
    /// All-zero tensor of the given type.
    pub fn zeros(dtype: DType, shape: &[usize]) -> Self {
        let len = shape.iter().product();
        let data = match dtype {
            DType::F32 => Data::F32(vec![0.0; len]),
            DType::I32 => Data::I32(vec![0; len]),
        };
        Self {
            shape: shape.to_vec(),
            data,
        }
    }

    pub fn from_f32(shape: &[usize], values: Vec<f32>) -> Result<Self, ExecError> {
        let expected: usize = shape.iter().product();
        if values.len() != expected {
            return Err(ExecError::LengthMismatch {
                expected,
                got: values.len(),
            });
        }
        Ok(Self {
            shape: shape.to_vec(),
            data: Data::F32(values),
        })
    }

    pub fn from_i32(shape: &[usize], values: Vec<i32>) -> Result<Self, ExecError> {
        let expected: usize = shape.iter().product();
        if values.len() != expected {
            return Err(ExecError::LengthMismatch {
                expected,
                got: values.len(),
            });
        }
        Ok(Self {
            shape: shape.to_vec(),
            data: Data::I32(values),
        })
    }

    /// Rank-0 float tensor.
    pub fn scalar_f32(v: f32) -> Self {
        Self {
            shape: Vec::new(),
            data: Data::F32(vec![v]),
        }
    }

    pub fn dtype(&self) -> DType {
        match self.data {
            Data::F32(_) => DType::F32,
            Data::I32(_) => DType::I32,
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn ty(&self) -> TensorType {
        TensorType::new(self.dtype(), self.shape.clone())
    }

    pub fn len(&self) -> usize {
        match &self.data {
            Data::F32(v) => v.len(),
            Data::I32(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn data(&self) -> &Data {
        &self.data
    }

    pub(super) fn data_mut(&mut self) -> &mut Data {
        &mut self.data
    }

    /// Shape and storage through one borrow, for building buffer tables.
    pub(super) fn parts_mut(&mut self) -> (&[usize], &mut Data) {
        (&self.shape, &mut self.data)
    }

    pub fn as_f32(&self) -> Option<&[f32]> {
        match &self.data {
            Data::F32(v) => Some(v),
            Data::I32(_) => None,
        }
    }

    pub fn as_i32(&self) -> Option<&[i32]> {
        match &self.data {
            Data::I32(v) => Some(v),
            Data::F32(_) => None,
        }
    }
}

/// The buffers a program run reads and writes, keyed by parameter name.
/// Callers own the storage before and after the run.
#[derive(Debug, Clone, Default)]
pub struct Bindings {
    map: BTreeMap<String, TensorVal>,
}

impl Bindings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace one binding. Returns `self` for chaining.
    pub fn bind(&mut self, name: impl Into<String>, value: TensorVal) -> &mut Self {
        self.map.insert(name.into(), value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&TensorVal> {
        self.map.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut TensorVal> {
        self.map.get_mut(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<TensorVal> {
        self.map.remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.map.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &TensorVal)> {
        self.map.iter()
    }

    pub(super) fn iter_mut(&mut self) -> impl Iterator<Item = (&String, &mut TensorVal)> {
        self.map.iter_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zeros_has_the_requested_extent() {
        let t = TensorVal::zeros(DType::F32, &[2, 3]);
        assert_eq!(t.len(), 6);
        assert_eq!(t.as_f32().unwrap(), &[0.0; 6]);
        assert_eq!(t.ty().to_string(), "f32[2, 3]");
    }

    #[test]
    fn constructors_check_element_counts() {
        assert!(TensorVal::from_f32(&[2, 2], vec![1.0; 4]).is_ok());
        let err = TensorVal::from_i32(&[3], vec![1, 2]).unwrap_err();
        assert_eq!(
            err,
            ExecError::LengthMismatch {
                expected: 3,
                got: 2
            }
        );
    }

    #[test]
    fn bindings_replace_on_rebind() {
        let mut b = Bindings::new();
        b.bind("x", TensorVal::scalar_f32(1.0));
        b.bind("x", TensorVal::scalar_f32(2.0));
        assert_eq!(b.get("x").unwrap().as_f32().unwrap(), &[2.0]);
    }
}
