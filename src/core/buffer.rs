//! Purpose: Bounds-checked access to externally owned memory shared between threads or processes.
//! Exports: `AtomicBuffer`.
//! Role: The only place the crate touches raw term/metadata memory.
//! Invariants: Every accessor checks `index + width <= capacity` before dereferencing.
//! Invariants: Ordered/atomic accessors require natural alignment of the absolute address.
//! Invariants: Multi-byte plain values are little-endian on the wire.
use std::cell::UnsafeCell;
use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicI32, AtomicI64, Ordering};

use crate::core::error::{Error, ErrorKind};

/// Base alignment every wrapped region must satisfy.
pub const BUFFER_ALIGNMENT: usize = 8;

/// Shared view over a byte region that many threads may write concurrently.
///
/// The view is `Copy`; copies alias the same memory, and the view itself only
/// guarantees bounds and alignment. Plain (non-atomic) writes are crate-private:
/// they are issued only by the appender and by claims, over ranges the tail
/// counter granted to a single producer. Outside the crate a view can only
/// write through the ordered accessors.
///
/// Plain reads (`get_bytes`, `get_i32`, ...) must only cover frames whose
/// length was observed non-zero through `get_i32_volatile`, or memory no
/// producer is writing. Reading a range that is still being written is a data
/// race.
#[derive(Clone, Copy)]
pub struct AtomicBuffer<'a> {
    ptr: NonNull<u8>,
    len: usize,
    _marker: PhantomData<&'a UnsafeCell<[u8]>>,
}

// Concurrent writers only ever touch disjoint ranges handed out by the tail
// counter, and publication goes through the ordered accessors below.
unsafe impl Send for AtomicBuffer<'_> {}
unsafe impl Sync for AtomicBuffer<'_> {}

impl std::fmt::Debug for AtomicBuffer<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AtomicBuffer")
            .field("addr", &self.ptr.as_ptr())
            .field("capacity", &self.len)
            .finish()
    }
}

impl<'a> AtomicBuffer<'a> {
    /// Wraps an exclusively borrowed region; the borrow keeps the memory alive
    /// and unaliased by safe code for `'a`.
    pub fn new(bytes: &'a mut [u8]) -> Result<Self, Error> {
        let len = bytes.len();
        let ptr = NonNull::new(bytes.as_mut_ptr())
            .ok_or_else(|| Error::new(ErrorKind::Usage).with_message("null buffer"))?;
        Self::checked(ptr, len)
    }

    /// Wraps raw memory such as a shared mapping.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for reads and writes of `len` bytes for `'a`, and
    /// nothing outside `AtomicBuffer` views may create references into it
    /// while views exist.
    pub unsafe fn from_raw_parts(ptr: *mut u8, len: usize) -> Result<Self, Error> {
        let ptr = NonNull::new(ptr)
            .ok_or_else(|| Error::new(ErrorKind::Usage).with_message("null buffer"))?;
        Self::checked(ptr, len)
    }

    fn checked(ptr: NonNull<u8>, len: usize) -> Result<Self, Error> {
        if ptr.as_ptr() as usize % BUFFER_ALIGNMENT != 0 {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("buffer base must be 8-byte aligned"));
        }
        Ok(Self {
            ptr,
            len,
            _marker: PhantomData,
        })
    }

    pub fn capacity(&self) -> usize {
        self.len
    }

    /// Narrows the view to `[index, index + length)`.
    pub fn slice(&self, index: usize, length: usize) -> Result<AtomicBuffer<'a>, Error> {
        self.bounds_check(index, length)?;
        let ptr = unsafe { NonNull::new_unchecked(self.ptr.as_ptr().add(index)) };
        Self::checked(ptr, length)
    }

    pub fn bounds_check(&self, index: usize, length: usize) -> Result<(), Error> {
        let end = index.checked_add(length);
        match end {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(Error::new(ErrorKind::Usage)
                .with_message(format!(
                    "access of {length} bytes out of bounds (capacity {})",
                    self.len
                ))
                .with_offset(index as u64)),
        }
    }

    fn aligned_check(&self, index: usize, width: usize) -> Result<*mut u8, Error> {
        self.bounds_check(index, width)?;
        let addr = unsafe { self.ptr.as_ptr().add(index) };
        if addr as usize % width != 0 {
            return Err(Error::new(ErrorKind::Usage)
                .with_message(format!("ordered access requires {width}-byte alignment"))
                .with_offset(index as u64));
        }
        Ok(addr)
    }

    pub(crate) fn put_bytes(&self, index: usize, src: &[u8]) -> Result<(), Error> {
        self.bounds_check(index, src.len())?;
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), self.ptr.as_ptr().add(index), src.len());
        }
        Ok(())
    }

    pub fn get_bytes(&self, index: usize, dst: &mut [u8]) -> Result<(), Error> {
        self.bounds_check(index, dst.len())?;
        unsafe {
            std::ptr::copy_nonoverlapping(self.ptr.as_ptr().add(index), dst.as_mut_ptr(), dst.len());
        }
        Ok(())
    }

    pub(crate) fn set_memory(&self, index: usize, length: usize, value: u8) -> Result<(), Error> {
        self.bounds_check(index, length)?;
        unsafe {
            std::ptr::write_bytes(self.ptr.as_ptr().add(index), value, length);
        }
        Ok(())
    }

    pub(crate) fn put_u8(&self, index: usize, value: u8) -> Result<(), Error> {
        self.put_bytes(index, &[value])
    }

    pub fn get_u8(&self, index: usize) -> Result<u8, Error> {
        let mut out = [0u8; 1];
        self.get_bytes(index, &mut out)?;
        Ok(out[0])
    }

    pub(crate) fn put_u16(&self, index: usize, value: u16) -> Result<(), Error> {
        self.put_bytes(index, &value.to_le_bytes())
    }

    pub fn get_u16(&self, index: usize) -> Result<u16, Error> {
        let mut out = [0u8; 2];
        self.get_bytes(index, &mut out)?;
        Ok(u16::from_le_bytes(out))
    }

    pub(crate) fn put_i32(&self, index: usize, value: i32) -> Result<(), Error> {
        self.put_bytes(index, &value.to_le_bytes())
    }

    pub fn get_i32(&self, index: usize) -> Result<i32, Error> {
        let mut out = [0u8; 4];
        self.get_bytes(index, &mut out)?;
        Ok(i32::from_le_bytes(out))
    }

    pub(crate) fn put_i64(&self, index: usize, value: i64) -> Result<(), Error> {
        self.put_bytes(index, &value.to_le_bytes())
    }

    pub fn get_i64(&self, index: usize) -> Result<i64, Error> {
        let mut out = [0u8; 8];
        self.get_bytes(index, &mut out)?;
        Ok(i64::from_le_bytes(out))
    }

    /// Store-release; every earlier write by this thread is visible to a
    /// thread that observes `value` through `get_i32_volatile`.
    pub fn put_i32_ordered(&self, index: usize, value: i32) -> Result<(), Error> {
        let addr = self.aligned_check(index, 4)?;
        let cell = unsafe { AtomicI32::from_ptr(addr.cast::<i32>()) };
        cell.store(value, Ordering::Release);
        Ok(())
    }

    pub fn get_i32_volatile(&self, index: usize) -> Result<i32, Error> {
        let addr = self.aligned_check(index, 4)?;
        let cell = unsafe { AtomicI32::from_ptr(addr.cast::<i32>()) };
        Ok(cell.load(Ordering::Acquire))
    }

    pub fn put_i64_ordered(&self, index: usize, value: i64) -> Result<(), Error> {
        let addr = self.aligned_check(index, 8)?;
        let cell = unsafe { AtomicI64::from_ptr(addr.cast::<i64>()) };
        cell.store(value, Ordering::Release);
        Ok(())
    }

    pub fn get_i64_volatile(&self, index: usize) -> Result<i64, Error> {
        let addr = self.aligned_check(index, 8)?;
        let cell = unsafe { AtomicI64::from_ptr(addr.cast::<i64>()) };
        Ok(cell.load(Ordering::Acquire))
    }

    /// Atomically adds `delta` and returns the previous value.
    pub fn get_and_add_i64(&self, index: usize, delta: i64) -> Result<i64, Error> {
        let addr = self.aligned_check(index, 8)?;
        let cell = unsafe { AtomicI64::from_ptr(addr.cast::<i64>()) };
        Ok(cell.fetch_add(delta, Ordering::AcqRel))
    }

    /// Mutable byte view of a range the caller exclusively owns.
    ///
    /// # Safety
    ///
    /// No other thread may read or write `[index, index + length)` for the
    /// lifetime of the returned slice.
    pub(crate) unsafe fn bytes_mut(&self, index: usize, length: usize) -> Result<&'a mut [u8], Error> {
        self.bounds_check(index, length)?;
        Ok(unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr().add(index), length) })
    }
}
