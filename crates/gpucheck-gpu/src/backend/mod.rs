//! Device implementations

pub mod software;

#[cfg(feature = "wgpu")]
pub mod wgpu;

pub use software::SoftwareDevice;

#[cfg(feature = "wgpu")]
pub use self::wgpu::WgpuDevice;
