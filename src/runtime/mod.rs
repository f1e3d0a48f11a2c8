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

//! Device selection and timing.
//!
//! Both device kinds execute on the host thread pool; the GPU kind
//! differs in how the scheduler decomposes loops (see
//! [`crate::schedule`]) and in that a [`GpuBackend`] implementation,
//! when registered, takes over execution and synchronization. Without
//! one, [`Device::sync`] is an immediate fence, matching host execution
//! where every run call completes before returning.

use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub mod gpu;

pub use gpu::GpuBackend;

/// Errors from device selection and backend dispatch.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("unknown device '{0}' (expected 'cpu' or 'gpu')")]
    UnknownDevice(String),
    #[error("gpu backend '{backend}' failed: {message}")]
    Backend { backend: String, message: String },
}

/// The execution target a run is scheduled and executed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceKind {
    #[default]
    Cpu,
    Gpu,
}

impl FromStr for DeviceKind {
    type Err = RuntimeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cpu" => Ok(DeviceKind::Cpu),
            "gpu" => Ok(DeviceKind::Gpu),
            other => Err(RuntimeError::UnknownDevice(other.to_string())),
        }
    }
}

impl std::fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            DeviceKind::Cpu => "cpu",
            DeviceKind::Gpu => "gpu",
        })
    }
}

/// A selected execution device.
#[derive(Clone, Default)]
pub struct Device {
    kind: DeviceKind,
    backend: Option<Arc<dyn GpuBackend>>,
}

impl Device {
    pub fn new(kind: DeviceKind) -> Self {
        Self {
            kind,
            backend: None,
        }
    }

    /// A GPU device driven by an external backend.
    pub fn with_backend(backend: Arc<dyn GpuBackend>) -> Self {
        Self {
            kind: DeviceKind::Gpu,
            backend: Some(backend),
        }
    }

    pub fn kind(&self) -> DeviceKind {
        self.kind
    }

    pub fn backend(&self) -> Option<&Arc<dyn GpuBackend>> {
        self.backend.as_ref()
    }

    /// Wait until all submitted work has completed. Host execution is
    /// synchronous, so without a backend this returns immediately.
    pub fn sync(&self) -> Result<(), RuntimeError> {
        match &self.backend {
            Some(b) => b.synchronize(),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("kind", &self.kind)
            .field("backend", &self.backend.as_ref().map(|b| b.name().to_string()))
            .finish()
    }
}

/// Run `f` for `warmup` untimed iterations, then time `repeats` more and
/// return the mean wall-clock duration of one iteration.
pub fn measure<E>(
    warmup: usize,
    repeats: usize,
    mut f: impl FnMut() -> Result<(), E>,
) -> Result<Duration, E> {
    for _ in 0..warmup {
        f()?;
    }
    let start = Instant::now();
    for _ in 0..repeats {
        f()?;
    }
    Ok(start.elapsed() / repeats.max(1) as u32)
}
