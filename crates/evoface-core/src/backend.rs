//! Inference backend strategy.
//!
//! The device is chosen once at startup from the configured [`DeviceMode`]
//! and the backends this machine actually offers; every model session is
//! then built through the chosen [`ExecutionBackend`].

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use ort::execution_providers::{CPU as CPUExecutionProvider, CUDA as CUDAExecutionProvider, ExecutionProvider};
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use serde::{Deserialize, Serialize};

use crate::types::ModelError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceMode {
    #[default]
    Auto,
    Cpu,
    Gpu,
}

impl FromStr for DeviceMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(DeviceMode::Auto),
            "cpu" => Ok(DeviceMode::Cpu),
            "gpu" | "cuda" => Ok(DeviceMode::Gpu),
            other => Err(format!("unknown device mode '{other}' (expected auto, cpu or gpu)")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ExecutionBackend {
    Cpu,
    Cuda { device_id: i32 },
}

impl fmt::Display for ExecutionBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionBackend::Cpu => write!(f, "cpu"),
            ExecutionBackend::Cuda { device_id } => write!(f, "cuda:{device_id}"),
        }
    }
}

/// Probe the execution providers ONNX Runtime can use on this machine.
pub fn available_backends() -> Vec<ExecutionBackend> {
    let mut backends = vec![ExecutionBackend::Cpu];
    if CUDAExecutionProvider::default().is_available().unwrap_or(false) {
        backends.push(ExecutionBackend::Cuda { device_id: 0 });
    }
    backends
}

/// Pick the backend for `mode` among `available`. CPU is always the fallback.
pub fn select_backend(mode: DeviceMode, available: &[ExecutionBackend]) -> ExecutionBackend {
    let gpu = available
        .iter()
        .copied()
        .find(|b| matches!(b, ExecutionBackend::Cuda { .. }));
    match (mode, gpu) {
        (DeviceMode::Cpu, _) => ExecutionBackend::Cpu,
        (DeviceMode::Gpu | DeviceMode::Auto, Some(gpu)) => gpu,
        (DeviceMode::Gpu, None) => {
            tracing::warn!("GPU requested but no CUDA provider available; using CPU");
            ExecutionBackend::Cpu
        }
        (DeviceMode::Auto, None) => ExecutionBackend::Cpu,
    }
}

impl ExecutionBackend {
    /// Build an ONNX Runtime session for the model at `path` on this backend.
    pub fn load_session(&self, path: &Path, intra_threads: usize) -> Result<Session, ModelError> {
        let mut builder = Session::builder()
            .map_err(|e| load_error(path, e))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| load_error(path, e))?
            .with_intra_threads(intra_threads)
            .map_err(|e| load_error(path, e))?;

        if let ExecutionBackend::Cuda { device_id } = *self {
            builder = builder
                .with_execution_providers([
                    CUDAExecutionProvider::default()
                        .with_device_id(device_id)
                        .build(),
                    CPUExecutionProvider::default().build(),
                ])
                .map_err(|e| load_error(path, e))?;
        }

        let session = builder
            .commit_from_file(path)
            .map_err(|e| load_error(path, e))?;
        tracing::info!(path = %path.display(), backend = %self, "model session loaded");
        Ok(session)
    }
}

fn load_error(path: &Path, e: impl fmt::Display) -> ModelError {
    ModelError::Load {
        path: path.display().to_string(),
        message: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CUDA: ExecutionBackend = ExecutionBackend::Cuda { device_id: 0 };

    #[test]
    fn test_select_prefers_gpu_when_available() {
        let both = [ExecutionBackend::Cpu, CUDA];
        assert_eq!(select_backend(DeviceMode::Auto, &both), CUDA);
        assert_eq!(select_backend(DeviceMode::Gpu, &both), CUDA);
        assert_eq!(select_backend(DeviceMode::Cpu, &both), ExecutionBackend::Cpu);
    }

    #[test]
    fn test_select_falls_back_to_cpu() {
        let cpu_only = [ExecutionBackend::Cpu];
        assert_eq!(select_backend(DeviceMode::Auto, &cpu_only), ExecutionBackend::Cpu);
        assert_eq!(select_backend(DeviceMode::Gpu, &cpu_only), ExecutionBackend::Cpu);
    }

    #[test]
    fn test_device_mode_parse() {
        assert_eq!("GPU".parse::<DeviceMode>(), Ok(DeviceMode::Gpu));
        assert_eq!("cuda".parse::<DeviceMode>(), Ok(DeviceMode::Gpu));
        assert_eq!("auto".parse::<DeviceMode>(), Ok(DeviceMode::Auto));
        assert!("tpu".parse::<DeviceMode>().is_err());
    }
}
