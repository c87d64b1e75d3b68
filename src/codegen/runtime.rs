//! Native helper functions called from generated code.
//!
//! The string value kind is a [`CString`] constructed in place inside a
//! stack slot of the generated frame; construction, assignment, indexing,
//! the C-string view, and destruction all go through the helpers here via
//! absolute-address calls. The numeric conversion helpers cover casts
//! that have no single-instruction encoding.
//!
//! Every helper uses the calling convention of the generated code: the
//! Microsoft x64 convention on x86-64 and cdecl on x86, so the generator
//! can marshal arguments the same way it does for caller-supplied
//! functions.

use std::ffi::{c_char, CStr, CString};

/// Bytes a string object occupies in a stack frame.
pub const STRING_SIZE: i32 = std::mem::size_of::<CString>() as i32;

/// Declare helpers with the target's native calling convention.
macro_rules! native_helpers {
    ($($(#[$attr:meta])* $vis:vis fn $name:ident($($arg:ident: $ty:ty),* $(,)?) $(-> $ret:ty)? $body:block)*) => {
        $(
            $(#[$attr])*
            #[cfg(target_arch = "x86_64")]
            $vis unsafe extern "win64" fn $name($($arg: $ty),*) $(-> $ret)? $body

            $(#[$attr])*
            #[cfg(target_arch = "x86")]
            $vis unsafe extern "cdecl" fn $name($($arg: $ty),*) $(-> $ret)? $body
        )*
    };
}

native_helpers! {
    /// Initialize a zero-length string object at `addr`.
    ///
    /// # Safety
    /// `addr` must point to [`STRING_SIZE`] bytes of uninitialized,
    /// writable memory.
    pub fn string_default_ctor(addr: *mut CString) {
        unsafe { addr.write(CString::default()) }
    }

    /// Initialize a string object at `addr` with a copy of the
    /// NUL-terminated buffer `value`.
    ///
    /// # Safety
    /// `addr` must point to [`STRING_SIZE`] bytes of uninitialized,
    /// writable memory and `value` must be a valid NUL-terminated buffer.
    pub fn string_from_cstr_ctor(addr: *mut CString, value: *const c_char) {
        unsafe { addr.write(CStr::from_ptr(value).to_owned()) }
    }

    /// Destroy the string object at `addr`, releasing its heap buffer.
    ///
    /// # Safety
    /// `addr` must point to a live string object; it is dead afterwards.
    pub fn string_dtor(addr: *mut CString) {
        unsafe { std::ptr::drop_in_place(addr) }
    }

    /// Read the byte at `index` of the string at `addr`.
    ///
    /// # Safety
    /// `addr` must point to a live string object. `index` is not checked
    /// against the string length by the generated code.
    pub fn string_index(addr: *mut CString, index: i32) -> i32 {
        unsafe { (*addr).as_bytes()[index as usize] as i32 }
    }

    /// Overwrite the string at `addr` with a copy of the NUL-terminated
    /// buffer `value`, returning `addr`.
    ///
    /// # Safety
    /// `addr` must point to a live string object and `value` must be a
    /// valid NUL-terminated buffer.
    pub fn string_assign(addr: *mut CString, value: *const c_char) -> *mut CString {
        unsafe {
            *addr = CStr::from_ptr(value).to_owned();
        }
        addr
    }

    /// Pointer to the NUL-terminated buffer of the string at `addr`.
    ///
    /// # Safety
    /// `addr` must point to a live string object. The returned pointer is
    /// invalidated by assignment or destruction.
    pub fn string_cstr(addr: *mut CString) -> *const c_char {
        unsafe { (*addr).as_ptr() }
    }

    /// Convert a double to a pointer-sized unsigned integer, saturating
    /// at the type bounds.
    ///
    /// # Safety
    /// Always safe; declared unsafe for a uniform helper signature.
    pub fn double_to_ptr(value: f64) -> usize {
        value as usize
    }

    /// Convert a pointer-sized unsigned integer to the nearest double.
    ///
    /// # Safety
    /// Always safe; declared unsafe for a uniform helper signature.
    pub fn ptr_to_double(value: usize) -> f64 {
        value as f64
    }
}

native_helpers! {
    /// Sign-extend a 32-bit integer and reinterpret it at pointer width,
    /// i.e. `(size_t)(int32_t)value`.
    ///
    /// A plain 32-bit register move would zero-extend and lose the sign;
    /// the round trip through a call keeps the semantics explicit.
    ///
    /// # Safety
    /// Always safe; declared unsafe for a uniform helper signature.
    #[cfg(target_arch = "x86_64")]
    pub fn int32_to_ptr(value: i32) -> usize {
        value as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::MaybeUninit;

    #[test]
    fn string_lifecycle() {
        let mut slot = MaybeUninit::<CString>::uninit();
        let addr = slot.as_mut_ptr();
        unsafe {
            string_default_ctor(addr);
            assert_eq!((*addr).as_bytes(), b"");

            let abcde = CString::new("abcde").unwrap();
            string_assign(addr, abcde.as_ptr());
            assert_eq!((*addr).as_bytes(), b"abcde");
            assert_eq!(string_index(addr, 3), i32::from(b'd'));

            let view = string_cstr(addr);
            assert_eq!(CStr::from_ptr(view).to_bytes(), b"abcde");

            string_dtor(addr);
        }
    }

    #[test]
    fn string_from_cstr() {
        let mut slot = MaybeUninit::<CString>::uninit();
        let addr = slot.as_mut_ptr();
        let hello = CString::new("hello").unwrap();
        unsafe {
            string_from_cstr_ctor(addr, hello.as_ptr());
            assert_eq!((*addr).as_bytes(), b"hello");
            assert_eq!(string_index(addr, 0), i32::from(b'h'));
            string_dtor(addr);
        }
    }

    #[test]
    fn numeric_conversions() {
        unsafe {
            assert_eq!(double_to_ptr(3.9), 3);
            assert_eq!(double_to_ptr(-1.0), 0);
            assert_eq!(ptr_to_double(7), 7.0);
            #[cfg(target_arch = "x86_64")]
            {
                assert_eq!(int32_to_ptr(5), 5);
                assert_eq!(int32_to_ptr(-1), usize::MAX);
            }
        }
    }
}
