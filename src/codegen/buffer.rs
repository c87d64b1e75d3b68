//! Executable code buffer.
//!
//! An append-only byte buffer backed by read+write+execute pages. The
//! generator appends encoded instructions and patches jump displacements
//! in place; once the last byte is written, [`CodeBuffer::executable_address`]
//! can be cast to a function pointer and called.
//!
//! Growth reallocates the backing pages, so the base address is only
//! stable after the final write. Absolute addresses must never be taken
//! from the buffer while code is still being emitted.

use region::{Allocation, Protection};

use super::error::{CodegenError, Result};

/// Buffer of executable memory.
pub struct CodeBuffer {
    alloc: Option<Allocation>,
    used: usize,
}

impl CodeBuffer {
    /// Create an empty buffer. No pages are allocated until the first write.
    pub fn new() -> Self {
        Self { alloc: None, used: 0 }
    }

    /// Number of bytes written so far.
    pub fn len(&self) -> u32 {
        self.used as u32
    }

    /// Whether nothing has been written yet.
    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    /// Ensure capacity for at least `size` bytes in total.
    ///
    /// Growing allocates a fresh page-aligned region of at least
    /// `max(1024, 2 * old capacity, size rounded up to a page)`, copies the
    /// bytes written so far and releases the old region. The base address
    /// may change.
    pub fn reserve(&mut self, size: usize) -> Result<()> {
        let capacity = self.alloc.as_ref().map_or(0, |a| a.len());
        if size <= capacity {
            return Ok(());
        }
        let page = region::page::size();
        let new_capacity = 1024.max((2 * capacity).max(size.div_ceil(page) * page));
        let new_alloc = region::alloc(new_capacity, Protection::READ_WRITE_EXECUTE)
            .map_err(CodegenError::OutOfMemory)?;
        log::trace!(
            "code buffer grows {} -> {} bytes at {:p}",
            capacity,
            new_alloc.len(),
            new_alloc.as_ptr::<u8>()
        );
        if let Some(old) = self.alloc.take() {
            unsafe {
                std::ptr::copy_nonoverlapping(
                    old.as_ptr::<u8>(),
                    new_alloc.as_ptr::<u8>() as *mut u8,
                    self.used,
                );
            }
        }
        self.alloc = Some(new_alloc);
        Ok(())
    }

    /// Release the backing pages and return to the empty state.
    pub fn clear(&mut self) {
        self.alloc = None;
        self.used = 0;
    }

    /// Append one byte.
    pub fn push_u8(&mut self, value: u8) -> Result<()> {
        self.push_bytes(&[value])
    }

    /// Append a 32-bit integer, little-endian.
    pub fn push_u32(&mut self, value: u32) -> Result<()> {
        self.push_bytes(&value.to_le_bytes())
    }

    /// Append a 64-bit integer, little-endian.
    pub fn push_u64(&mut self, value: u64) -> Result<()> {
        self.push_bytes(&value.to_le_bytes())
    }

    /// Overwrite an already-written byte. Used for patching jump
    /// displacements.
    ///
    /// # Panics
    /// Panics if `location` is at or past the write position.
    pub fn set_byte(&mut self, location: u32, value: u8) {
        let location = location as usize;
        assert!(location < self.used, "patch location out of range");
        let base = self.base_mut();
        unsafe { base.add(location).write(value) };
    }

    /// Read back a written byte. Mostly useful for tests.
    pub fn byte_at(&self, location: u32) -> u8 {
        let location = location as usize;
        assert!(location < self.used, "read location out of range");
        unsafe { self.base().add(location).read() }
    }

    /// The written bytes as a slice.
    pub fn bytes(&self) -> &[u8] {
        if self.used == 0 {
            return &[];
        }
        unsafe { std::slice::from_raw_parts(self.base(), self.used) }
    }

    /// Pointer to the first byte of the generated code.
    ///
    /// Only valid once emission is finished; any further write may move
    /// the buffer.
    pub fn executable_address(&self) -> *const u8 {
        self.base()
    }

    fn base(&self) -> *const u8 {
        self.alloc
            .as_ref()
            .map_or(std::ptr::null(), |a| a.as_ptr::<u8>())
    }

    fn base_mut(&mut self) -> *mut u8 {
        self.alloc
            .as_mut()
            .map_or(std::ptr::null_mut(), |a| a.as_mut_ptr::<u8>())
    }

    fn push_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.reserve(self.used + bytes.len())?;
        let base = self.base_mut();
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), base.add(self.used), bytes.len());
        }
        self.used += bytes.len();
        Ok(())
    }
}

impl Default for CodeBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_and_read_back() {
        let mut buf = CodeBuffer::new();
        buf.push_u8(0xC3).unwrap();
        buf.push_u32(0xDEADBEEF).unwrap();
        buf.push_u64(0x0102030405060708).unwrap();
        assert_eq!(buf.len(), 13);
        assert_eq!(buf.bytes()[0], 0xC3);
        // little-endian
        assert_eq!(&buf.bytes()[1..5], &[0xEF, 0xBE, 0xAD, 0xDE]);
        assert_eq!(buf.bytes()[5], 0x08);
        assert_eq!(buf.bytes()[12], 0x01);
    }

    #[test]
    fn set_byte_patches_in_place() {
        let mut buf = CodeBuffer::new();
        buf.push_u32(0).unwrap();
        buf.set_byte(2, 0x7F);
        assert_eq!(buf.bytes(), &[0, 0, 0x7F, 0]);
    }

    #[test]
    fn grow_preserves_contents() {
        let mut buf = CodeBuffer::new();
        for i in 0..10_000u32 {
            buf.push_u8(i as u8).unwrap();
        }
        assert_eq!(buf.len(), 10_000);
        for i in 0..10_000u32 {
            assert_eq!(buf.byte_at(i), i as u8);
        }
    }

    #[test]
    fn clear_releases_everything() {
        let mut buf = CodeBuffer::new();
        buf.push_u8(0x90).unwrap();
        buf.clear();
        assert!(buf.is_empty());
        assert_eq!(buf.bytes(), &[] as &[u8]);
        buf.push_u8(0xC3).unwrap();
        assert_eq!(buf.len(), 1);
    }

    #[test]
    #[should_panic(expected = "patch location out of range")]
    fn set_byte_past_end_panics() {
        let mut buf = CodeBuffer::new();
        buf.push_u8(0).unwrap();
        buf.set_byte(1, 0);
    }
}
