use std::path::PathBuf;

use ash::vk;
use thiserror::Error;

/// Everything that can go wrong while driving the GPU.
///
/// Only [`RenderError::SwapchainOutOfDate`] is recoverable: the frame loop rebuilds the swapchain,
/// render targets and descriptor sets and carries on. Everything else means the device context
/// can no longer be trusted; see [`RenderError::is_fatal`].
#[derive(Error, Debug)]
pub enum RenderError {
    #[error("Device lost")]
    DeviceLost,
    #[error("Out of memory ({0:?})")]
    OutOfMemory(vk::Result),
    #[error("Swapchain is out of date")]
    SwapchainOutOfDate,
    #[error("Failed to acquire swapchain image: {0:?}")]
    AcquireImageFailed(vk::Result),
    #[error("Failed to create shader module from {path}: {reason}")]
    ShaderCreationFailed { path: PathBuf, reason: String },
    #[error("Failed to create pipeline: {0}")]
    PipelineCreationFailed(String),
    #[error("Render target `{0}` not found")]
    NotFound(String),
    #[error("Descriptor contract violated for {technique}: {reason}")]
    DescriptorMismatch {
        technique: &'static str,
        reason: String,
    },
    #[error("Uniform arena exhausted: requested {requested} bytes")]
    UniformArenaExhausted { requested: u64 },
    #[error("Device memory exhausted: requested {requested} bytes")]
    DeviceMemoryExhausted { requested: u64 },
    #[error("Staging buffer overflow: requested {requested} bytes, {available} available")]
    StagingOverflow { requested: u64, available: u64 },
    #[error("No suitable {0}")]
    Unsupported(&'static str),
    #[error("Vulkan error: {0:?}")]
    Vulkan(vk::Result),
}

impl RenderError {
    /// Device loss, memory exhaustion and rejected pipeline objects leave the GPU context in an
    /// unknown state. There is no degrade-and-continue path for these.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, RenderError::SwapchainOutOfDate | RenderError::NotFound(_))
    }

    /// The device itself is lost or out of memory, as opposed to one of the renderer's own
    /// budgets running out. Model uploads treat everything else as a soft load failure.
    pub fn is_device_failure(&self) -> bool {
        matches!(self, RenderError::DeviceLost | RenderError::OutOfMemory(_))
    }
}

impl From<vk::Result> for RenderError {
    fn from(result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_DEVICE_LOST => RenderError::DeviceLost,
            vk::Result::ERROR_OUT_OF_HOST_MEMORY | vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => {
                RenderError::OutOfMemory(result)
            }
            vk::Result::ERROR_OUT_OF_DATE_KHR | vk::Result::SUBOPTIMAL_KHR => {
                RenderError::SwapchainOutOfDate
            }
            other => RenderError::Vulkan(other),
        }
    }
}

pub type RenderResult<T> = Result<T, RenderError>;

/// Soft failures from the asset side. These never touch the frame loop: the request is dropped
/// and the model simply doesn't show up.
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("Model file {0} not found")]
    Missing(PathBuf),
    #[error("Model file {path} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },
    #[error("Loader thread for {0} went away before reporting")]
    Disconnected(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_loss_and_oom_are_fatal() {
        assert!(RenderError::from(vk::Result::ERROR_DEVICE_LOST).is_fatal());
        assert!(RenderError::from(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY).is_fatal());
        assert!(RenderError::from(vk::Result::ERROR_OUT_OF_HOST_MEMORY).is_fatal());
        assert!(RenderError::PipelineCreationFailed("rejected".into()).is_fatal());
    }

    #[test]
    fn out_of_date_is_recoverable() {
        let error = RenderError::from(vk::Result::ERROR_OUT_OF_DATE_KHR);
        assert!(matches!(error, RenderError::SwapchainOutOfDate));
        assert!(!error.is_fatal());
        assert!(!RenderError::NotFound("albedo".into()).is_fatal());
    }

    #[test]
    fn running_out_of_our_own_budgets_is_not_a_device_failure() {
        assert!(RenderError::from(vk::Result::ERROR_DEVICE_LOST).is_device_failure());
        assert!(RenderError::from(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY).is_device_failure());
        for error in [
            RenderError::StagingOverflow {
                requested: 120 << 20,
                available: 100 << 20,
            },
            RenderError::UniformArenaExhausted { requested: 256 },
            RenderError::DeviceMemoryExhausted { requested: 1 << 30 },
            RenderError::from(vk::Result::ERROR_OUT_OF_POOL_MEMORY),
        ] {
            assert!(!error.is_device_failure(), "{error}");
        }
    }

    #[test]
    fn unknown_codes_are_kept() {
        match RenderError::from(vk::Result::ERROR_INITIALIZATION_FAILED) {
            RenderError::Vulkan(code) => assert_eq!(code, vk::Result::ERROR_INITIALIZATION_FAILED),
            other => panic!("unexpected {other:?}"),
        }
    }
}
