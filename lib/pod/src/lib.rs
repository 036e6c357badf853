//! Utilities for working with POD (Plain Old Data)

#![no_std]
// https://github.com/rust-lang/rfcs/blob/master/text/2585-unsafe-block-in-unsafe-fn.md
#![deny(unsafe_op_in_unsafe_fn)]

use core::mem::MaybeUninit;

/// Marker trait that the given type is Plain Old Data; i.e. that it is safe to
/// interpret any pattern of bits as a value of this type.
///
/// This is notably *not* true for many Rust types. e.g. interpreting the integer
/// value `2` as a rust `bool` is undefined behavior.
///
/// We require `Copy` to also rule out anything that implements `Drop`.
///
/// References are inherently non-Pod, so we can require a 'static lifetime.
///
/// This is very *similar* in concept to `bytemuck::AnyBitPattern`. However,
/// unlike `AnyBitPattern`, this trait does not say anything about how the type
/// can be safely shared. e.g. while `bytemuck::AnyBitPattern` disallows pointer
/// types, [`Pod`] does not.
///
/// # Safety
///
/// - Any pattern of bits must be a valid value of the given type.
/// - The type must not contain an [`UnsafeCell`](core::cell::UnsafeCell), or any other structure
///   that contains an `UnsafeCell` (for example [`Cell`](core::cell::Cell)). Otherwise the following
///   code would have UB:
///   ```ignore
///   let x = Cell::new(0);
///   let y = as_u8_slice(&x);
///   x.set(1);
///   ```
pub unsafe trait Pod: Copy + 'static {}

/// Convert to a slice of raw bytes.
///
/// Some bytes may be uninitialized if T has padding.
pub fn to_u8_slice<T>(slice: &[T]) -> &[MaybeUninit<u8>]
where
    T: Pod,
{
    // SAFETY: Any value and alignment is safe for u8.
    unsafe {
        core::slice::from_raw_parts(
            slice.as_ptr() as *const MaybeUninit<u8>,
            slice.len() * core::mem::size_of::<MaybeUninit<T>>(),
        )
    }
}

/// Cast as a slice of raw bytes.
///
/// Some bytes may be uninitialized if T has padding.
pub fn as_u8_slice<T>(x: &T) -> &[MaybeUninit<u8>]
where
    T: Pod,
{
    to_u8_slice(core::slice::from_ref(x))
}

/// Convert to a mut slice of raw bytes.
///
/// Some bytes may be uninialized if T has padding.
///
/// # Safety
///
/// Uninitialized bytes (e.g. [`MaybeUninit::uninit`]) must not be written
/// into the returned slice, which would invalidate the source `slice`.
pub unsafe fn to_u8_slice_mut<T>(slice: &mut [T]) -> &mut [MaybeUninit<u8>]
where
    T: Pod,
{
    // SAFETY: Any value and alignment is safe for u8.
    unsafe {
        core::slice::from_raw_parts_mut(
            slice.as_mut_ptr() as *mut MaybeUninit<u8>,
            slice.len() * core::mem::size_of::<MaybeUninit<T>>(),
        )
    }
}

/// Cast as a mut slice of raw bytes.
///
/// Some bytes may be uninitialized if T has padding.
///
/// # Safety
///
/// See [`to_u8_slice_mut`].
pub unsafe fn as_u8_slice_mut<T>(x: &mut T) -> &mut [MaybeUninit<u8>]
where
    T: Pod,
{
    unsafe { to_u8_slice_mut(core::slice::from_mut(x)) }
}

/// Create a value of type `T`, with contents initialized to 0s.
pub fn zeroed<T>() -> T
where
    T: Pod,
{
    // SAFETY: Any value is legal for Pod.
    unsafe { core::mem::zeroed() }
}

/// Wrapper type to support associated compile-time size checks
struct PodTransmute<const N: usize, T> {
    _t: core::marker::PhantomData<T>,
}

impl<const N: usize, T: Pod> PodTransmute<N, T> {
    const CHECK: () = assert!(N == core::mem::size_of::<T>());
    #[inline(always)]
    fn transmute_array(x: &[u8; N]) -> T {
        // this should perform a compile-time check
        #[allow(clippy::let_unit_value)]
        let _ = Self::CHECK;

        // this should perform a runtime check in case the above compile-time check didn't run, but
        // should be compiled out if the compile-time check did run
        assert_eq!(N, core::mem::size_of::<T>());

        // It'd be nice to use `transmute` here, and take the array by value,
        // but there's no way to convince the type system that the input and output
        // sizes are guaranteed to be equal. So, we use `transmute_copy` which
        // doesn't require this to be statically guaranteed.
        unsafe { core::mem::transmute_copy(x) }
    }
}

/// Interpret the bytes of `x` as a value of type `T`.
pub fn from_array<const N: usize, T: Pod>(x: &[u8; N]) -> T {
    PodTransmute::transmute_array(x)
}

// Integer primitives
unsafe impl Pod for u8 {}
unsafe impl Pod for u16 {}
unsafe impl Pod for u32 {}
unsafe impl Pod for u64 {}
unsafe impl Pod for i8 {}
unsafe impl Pod for i16 {}
unsafe impl Pod for i32 {}
unsafe impl Pod for i64 {}
unsafe impl Pod for isize {}
unsafe impl Pod for usize {}

// No! Values other than 0 or 1 are invalid.
// impl !Pod for bool {}

// No! `char` must be a valid unicode value.
// impl !Pod for char {}

unsafe impl<T> Pod for core::mem::MaybeUninit<T> where T: Pod {}
unsafe impl<T, const N: usize> Pod for [T; N] where T: Pod {}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    #[repr(C)]
    struct Point {
        x: i32,
        y: i32,
    }
    unsafe impl Pod for Point {}

    #[test]
    fn roundtrip_struct() {
        let p = Point { x: 7, y: -3 };
        let bytes = as_u8_slice(&p);
        assert_eq!(bytes.len(), core::mem::size_of::<Point>());
    }

    #[test]
    fn zeroed_is_all_zero_bytes() {
        let z: [u32; 4] = zeroed();
        assert_eq!(z, [0, 0, 0, 0]);
    }
}
