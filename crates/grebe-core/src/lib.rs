//! Core data structures and algebra objects for grebe (pure Rust).
//!
//! This crate holds the runtime-typed sparse matrix, the operator /
//! monoid / semiring objects, descriptors, contexts, and the status enum.
//! It does no computing beyond single-element access; the orchestrators
//! and kernels live in `grebe-kernels`.

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod context;
pub mod descriptor;
pub mod elem;
pub mod error;
pub mod matrix;
pub mod ops;
pub mod types;

pub use context::Context;
pub use descriptor::{AxbMethod, Descriptor};
pub use elem::Elem;
pub use error::{Error, Result};
pub use matrix::{flip_index, is_zombie, unflip_index, Matrix, Orientation, Pending};
pub use ops::{BinaryFn, BinaryOp, Monoid, Opcode, Semiring, UnaryFn, UnaryOp};
pub use types::{cast_factory, CastFn, Type, TypeCode};
