//! Typed access to the byte-level value model.
//!
//! `Elem` maps each built-in Rust scalar to its runtime type code so that
//! element getters/setters and test builders can be written in terms of
//! `f64`/`i32`/… instead of byte slices.

use crate::types::{Type, TypeCode};

mod sealed {
    pub trait Sealed {}
}

/// A Rust scalar with a built-in runtime type. Sealed: the set of built-in
/// types is fixed by the wire format.
pub trait Elem: Copy + PartialEq + Send + Sync + sealed::Sealed + 'static {
    const CODE: TypeCode;

    /// The runtime descriptor for this scalar.
    #[must_use]
    fn rtype() -> Type {
        Type::builtin(Self::CODE).expect("Elem codes are builtin")
    }

    /// Write this value into `out` (which must be at least `size_of::<Self>()`).
    fn store(self, out: &mut [u8]) {
        assert!(out.len() >= std::mem::size_of::<Self>());
        unsafe { out.as_mut_ptr().cast::<Self>().write_unaligned(self) };
    }

    /// Read a value back out of `bytes`.
    #[must_use]
    fn load(bytes: &[u8]) -> Self {
        assert!(bytes.len() >= std::mem::size_of::<Self>());
        unsafe { bytes.as_ptr().cast::<Self>().read_unaligned() }
    }
}

macro_rules! impl_elem {
    ($($t:ty => $code:ident),* $(,)?) => {$(
        impl sealed::Sealed for $t {}
        impl Elem for $t {
            const CODE: TypeCode = TypeCode::$code;
        }
    )*};
}

impl_elem!(
    bool => Bool,
    i8 => Int8,
    u8 => UInt8,
    i16 => Int16,
    u16 => UInt16,
    i32 => Int32,
    u32 => UInt32,
    i64 => Int64,
    u64 => UInt64,
    f32 => Fp32,
    f64 => Fp64,
);
