//! Orchestrators and compute kernels for grebe (pure Rust, parallel).
//!
//! Layering: `grebe-core` owns the data model and algebra objects; this
//! crate owns everything that computes — finalization, the operation
//! orchestrators, the kernel switch factories, and the masked
//! accumulation epilogue they all share.
#![allow(
    clippy::many_single_char_names,
    reason = "Math kernels conventionally use i/j/k/p for indices"
)]

mod accum_mask;
mod convert;
mod ewise;
mod mask;
mod mxm;
mod sauna;
mod util;

pub mod apply;
pub mod reduce;
pub mod select;
pub mod transpose;
pub mod wait;

pub use apply::apply;
pub use ewise::{ewise_add, ewise_mult};
pub use mxm::mxm;
pub use reduce::reduce_scalar;
pub use select::{select, Selector};
pub use transpose::transpose;
pub use wait::{build_matrix, extract_element, matrix_from_tuples, wait};
