//! # Device Detection and Routing
//!
//! Decides where each conversion runs. A request carries a device selector:
//! negative means CPU, non-negative names an accelerator by index. Hosts
//! without accelerators always run on the CPU. There is no fallback once an
//! accelerator has been chosen: if it cannot be opened the request fails.

use crate::error::{AppError, AppResult};
use candle_core::Device;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{debug, info};

/// Upper bound on CUDA ordinals tried at startup
const MAX_PROBED_ACCELERATORS: usize = 16;

/// Where a single request runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComputeTarget {
    Cpu,
    Accelerator(usize),
}

impl std::fmt::Display for ComputeTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ComputeTarget::Cpu => write!(f, "cpu"),
            ComputeTarget::Accelerator(index) => write!(f, "accelerator:{}", index),
        }
    }
}

/// Kind of accelerator present on the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AcceleratorKind {
    None,
    Cuda,
    Metal,
}

/// Apply the routing policy.
///
/// - `selector < 0` ⇒ CPU, whatever the host has
/// - no accelerators ⇒ CPU
/// - `selector` in range ⇒ that accelerator
/// - `selector` past the last accelerator ⇒ device error
pub fn route(selector: i64, accelerator_count: usize) -> AppResult<ComputeTarget> {
    if selector < 0 || accelerator_count == 0 {
        return Ok(ComputeTarget::Cpu);
    }

    let index = usize::try_from(selector)
        .map_err(|_| AppError::Device(format!("accelerator index {} is out of range", selector)))?;

    if index >= accelerator_count {
        return Err(AppError::Device(format!(
            "accelerator {} requested but only {} available",
            index, accelerator_count
        )));
    }

    Ok(ComputeTarget::Accelerator(index))
}

/// Knows which accelerators exist and hands out candle devices for them.
pub struct DeviceManager {
    kind: AcceleratorKind,
    accelerator_count: usize,
    /// Accelerator handles are created once and reused
    opened: Mutex<HashMap<usize, Device>>,
}

impl DeviceManager {
    /// Probe the host for accelerators.
    pub fn detect() -> Self {
        info!("Detecting compute devices...");

        let cuda_count = Self::count_cuda_devices();
        if cuda_count > 0 {
            info!(count = cuda_count, "CUDA accelerators available");
            return Self::with_accelerators(AcceleratorKind::Cuda, cuda_count);
        }

        if Self::metal_available() {
            info!("Metal accelerator available");
            return Self::with_accelerators(AcceleratorKind::Metal, 1);
        }

        info!("No accelerator found, all conversions run on the CPU");
        Self::cpu_only()
    }

    pub fn cpu_only() -> Self {
        Self::with_accelerators(AcceleratorKind::None, 0)
    }

    pub fn with_accelerators(kind: AcceleratorKind, accelerator_count: usize) -> Self {
        let accelerator_count = if kind == AcceleratorKind::None { 0 } else { accelerator_count };
        Self {
            kind,
            accelerator_count,
            opened: Mutex::new(HashMap::new()),
        }
    }

    pub fn accelerator_count(&self) -> usize {
        self.accelerator_count
    }

    /// Route `selector` and open the chosen device.
    pub fn resolve(&self, selector: i64) -> AppResult<(ComputeTarget, Device)> {
        let target = route(selector, self.accelerator_count)?;
        let device = match target {
            ComputeTarget::Cpu => Device::Cpu,
            ComputeTarget::Accelerator(index) => self.open(index)?,
        };
        Ok((target, device))
    }

    fn open(&self, index: usize) -> AppResult<Device> {
        let mut opened = self
            .opened
            .lock()
            .map_err(|_| AppError::Internal("device cache lock poisoned".to_string()))?;

        if let Some(device) = opened.get(&index) {
            return Ok(device.clone());
        }

        let device = match self.kind {
            AcceleratorKind::Cuda => Device::new_cuda(index),
            AcceleratorKind::Metal => Device::new_metal(index),
            AcceleratorKind::None => {
                return Err(AppError::Device("no accelerator available".to_string()));
            }
        }
        .map_err(|e| AppError::Device(format!("failed to open accelerator {}: {}", index, e)))?;

        debug!(index, "Opened accelerator");
        opened.insert(index, device.clone());
        Ok(device)
    }

    fn count_cuda_devices() -> usize {
        if !candle_core::utils::cuda_is_available() {
            return 0;
        }
        (0..MAX_PROBED_ACCELERATORS)
            .take_while(|&ordinal| match Device::new_cuda(ordinal) {
                Ok(_) => true,
                Err(e) => {
                    debug!("CUDA device {} not available: {}", ordinal, e);
                    false
                }
            })
            .count()
    }

    fn metal_available() -> bool {
        candle_core::utils::metal_is_available() && Device::new_metal(0).is_ok()
    }

    pub fn summary(&self) -> DeviceSummary {
        DeviceSummary {
            accelerator_kind: self.kind,
            accelerator_count: self.accelerator_count,
        }
    }
}

/// Device availability summary
#[derive(Debug, Clone, Serialize)]
pub struct DeviceSummary {
    pub accelerator_kind: AcceleratorKind,
    pub accelerator_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negative_selector_always_cpu() {
        for count in [0, 1, 4] {
            assert_eq!(route(-1, count).unwrap(), ComputeTarget::Cpu);
            assert_eq!(route(i64::MIN, count).unwrap(), ComputeTarget::Cpu);
        }
    }

    #[test]
    fn test_no_accelerators_falls_back_to_cpu() {
        assert_eq!(route(0, 0).unwrap(), ComputeTarget::Cpu);
        assert_eq!(route(7, 0).unwrap(), ComputeTarget::Cpu);
    }

    #[test]
    fn test_selector_in_range() {
        assert_eq!(route(0, 2).unwrap(), ComputeTarget::Accelerator(0));
        assert_eq!(route(1, 2).unwrap(), ComputeTarget::Accelerator(1));
    }

    #[test]
    fn test_selector_past_last_accelerator_is_device_error() {
        let err = route(2, 2).unwrap_err();
        assert!(matches!(err, AppError::Device(_)));
    }

    #[test]
    fn test_cpu_only_manager_resolves_to_cpu() {
        let manager = DeviceManager::cpu_only();
        let (target, device) = manager.resolve(3).unwrap();
        assert_eq!(target, ComputeTarget::Cpu);
        assert!(device.is_cpu());
    }

    #[test]
    fn test_target_display() {
        assert_eq!(ComputeTarget::Cpu.to_string(), "cpu");
        assert_eq!(ComputeTarget::Accelerator(1).to_string(), "accelerator:1");
    }
}
