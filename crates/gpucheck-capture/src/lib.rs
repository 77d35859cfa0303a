//! Surface capture and image comparison for gpucheck
//!
//! [`ImageManager`] copies GPU surfaces into host [`Bitmap`]s, keeps them in
//! numbered slots and compares candidates against a reference slot. A
//! mismatch produces a reference | candidate | difference triptych that a
//! [`MismatchReporter`] stores, by default as `Failed.bmp`.

pub mod bitmap;
pub mod bmp;
pub mod capture;
pub mod compare;
pub mod harness;
pub mod manager;

pub use bitmap::Bitmap;
pub use capture::{capture_surface, AliasLayout, CaptureOptions, CaptureRequest};
pub use compare::{
    difference_bitmap, triptych, BmpFileReporter, ExactComparator, MismatchReporter,
    MismatchSummary, PixelComparator, ToleranceComparator, Verification, DIFF_PIXEL,
};
pub use harness::{RenderTarget, RenderTargetComparison, RenderTargetScenario};
pub use manager::ImageManager;
