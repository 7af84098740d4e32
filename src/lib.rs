//! Device memory allocation for Nova's Render Hardware Interface.
//!
//! Graphics APIs like Vulkan hand out device memory in a small number of large memory objects, and leave it to the
//! application to pick the right memory type, carve resources out of those objects, map them for the CPU, and reuse
//! memory between resources that are never alive at the same time. This crate does all of that.
//!
//! Start with [`memory::Allocator`]. Backends live in [`rhi`].

// Rust warnings
#![warn(unused)]
#![deny(future_incompatible)]
#![deny(nonstandard_style)]
#![deny(rust_2018_idioms)]
#![deny(unsafe_code)] // Most is safe, but mapping and the Vulkan backend need unsafe
// Clippy warnings
#![warn(clippy::cargo)]
#![warn(clippy::nursery)]
#![warn(clippy::pedantic)]
#![warn(clippy::restriction)]
// Annoying regular clippy warnings
#![allow(clippy::cast_possible_truncation)] // Annoying
#![allow(clippy::cast_possible_wrap)] // Annoying
#![allow(clippy::cast_precision_loss)] // Annoying
#![allow(clippy::cast_sign_loss)] // Annoying
#![allow(clippy::cognitive_complexity)] // This is dumb
#![allow(clippy::doc_markdown)] // Too picky
#![allow(clippy::module_name_repetitions)] // Causes name conflicts
// Annoying/irrelevant clippy Restrictions
#![allow(clippy::decimal_literal_representation)]
#![allow(clippy::else_if_without_else)]
#![allow(clippy::float_arithmetic)]
#![allow(clippy::float_cmp_const)]
#![allow(clippy::implicit_return)]
#![allow(clippy::integer_division)]
#![allow(clippy::missing_docs_in_private_items)]
#![allow(clippy::missing_inline_in_public_items)]
#![allow(clippy::shadow_reuse)]
#![allow(clippy::shadow_same)]
#![allow(clippy::wildcard_enum_match_arm)]

pub mod core;
pub mod memory;
pub mod rhi;
pub mod settings;
