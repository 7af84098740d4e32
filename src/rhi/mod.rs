//! Nova's Render Hardware Interface
//!
//! The types and traits the allocator uses to talk to a graphics API, plus the backends that implement them.

pub mod headless;
pub mod vulkan;

mod rhi_enums;
mod rhi_structs;
mod rhi_traits;

pub use rhi_enums::*;
pub use rhi_structs::*;
pub use rhi_traits::*;
