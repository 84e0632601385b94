// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use core::fmt;
use dma_heap::{Heap, HeapKind};
use std::{
    ffi::c_void,
    io,
    os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd},
    ptr::null_mut,
    slice::{from_raw_parts, from_raw_parts_mut},
};
use tracing::{debug, warn};

/// Pixel formats negotiated with the capture hardware.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// Planar YUV 4:2:0 (I420), the source for JPEG compression.
    Yuv420,
    /// Packed 24-bit BGR, delivered directly to callers.
    Bgr888,
    /// Sensor-native 10-bit Bayer in 16-bit containers.
    Sbggr10,
}

impl PixelFormat {
    pub const fn fourcc(&self) -> [u8; 4] {
        match self {
            PixelFormat::Yuv420 => *b"YU12",
            PixelFormat::Bgr888 => *b"RG24",
            PixelFormat::Sbggr10 => *b"BG10",
        }
    }

    /// Number of bytes in one tightly packed frame.
    pub const fn frame_size(&self, width: u32, height: u32) -> usize {
        let (w, h) = (width as usize, height as usize);
        match self {
            PixelFormat::Yuv420 => w * h + 2 * (w.div_ceil(2) * h.div_ceil(2)),
            PixelFormat::Bgr888 => 3 * w * h,
            PixelFormat::Sbggr10 => 2 * w * h,
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let fourcc = self.fourcc();
        write!(f, "{}", String::from_utf8_lossy(&fourcc))
    }
}

/// Where buffer memory comes from.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum MemorySource {
    /// Anonymous shared memory, available everywhere.
    #[default]
    Memfd,
    /// Contiguous DMA memory from the CMA heap, shareable with hardware
    /// blocks. Requires access to `/dev/dma_heap`.
    DmaHeap,
}

impl MemorySource {
    /// Allocates `size` bytes and returns the owning file descriptor.
    pub fn allocate(&self, size: usize) -> io::Result<OwnedFd> {
        match self {
            MemorySource::Memfd => allocate_memfd(size),
            MemorySource::DmaHeap => {
                let heap = Heap::new(HeapKind::Cma)
                    .map_err(|e| io::Error::other(format!("dma heap: {e}")))?;
                heap.allocate(size)
                    .map_err(|e| io::Error::other(format!("dma heap allocate {size}: {e}")))
            }
        }
    }
}

fn allocate_memfd(size: usize) -> io::Result<OwnedFd> {
    let fd = unsafe { libc::memfd_create(c"edgefirst-capture".as_ptr(), libc::MFD_CLOEXEC) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: memfd_create returned a fresh descriptor that nothing else owns.
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };
    if unsafe { libc::ftruncate(fd.as_raw_fd(), size as libc::off_t) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(fd)
}

/// Memory-mapped view of a hardware buffer.
///
/// The mapping is established once and unmapped when dropped, so holding a
/// `MappedBuffer` is what keeps the pointer valid.
///
/// # Safety
///
/// While the API is safe, the hardware may write into the underlying memory
/// at any time the buffer is queued. Readers must only look at the contents
/// between a completion event and the request being queued again.
pub struct MappedBuffer {
    ptr: *mut u8,
    len: usize,
    writable: bool,
}

// SAFETY: the mapping is plain shared memory with no thread affinity, and
// mutable access requires `&mut self`.
unsafe impl Send for MappedBuffer {}
unsafe impl Sync for MappedBuffer {}

impl MappedBuffer {
    /// Maps `len` bytes of `fd` starting at `offset` for reading.
    pub fn map(fd: BorrowedFd<'_>, offset: usize, len: usize) -> io::Result<Self> {
        Self::map_with(fd, offset, len, false)
    }

    /// Maps `len` bytes of `fd` starting at `offset` for reading and
    /// writing.
    pub fn map_writable(fd: BorrowedFd<'_>, offset: usize, len: usize) -> io::Result<Self> {
        Self::map_with(fd, offset, len, true)
    }

    fn map_with(fd: BorrowedFd<'_>, offset: usize, len: usize, writable: bool) -> io::Result<Self> {
        if len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "cannot map an empty buffer",
            ));
        }
        let prot = if writable {
            libc::PROT_READ | libc::PROT_WRITE
        } else {
            libc::PROT_READ
        };
        let ptr = unsafe {
            libc::mmap(
                null_mut(),
                len,
                prot,
                libc::MAP_SHARED,
                fd.as_raw_fd(),
                offset as libc::off_t,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        debug!("mapped {} bytes at {:?}", len, ptr);
        Ok(Self {
            ptr: ptr.cast::<u8>(),
            len,
            writable,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { from_raw_parts(self.ptr, self.len) }
    }

    /// # Panics
    ///
    /// Panics if the buffer was mapped read-only.
    pub fn as_slice_mut(&mut self) -> &mut [u8] {
        assert!(self.writable, "buffer is mapped read-only");
        unsafe { from_raw_parts_mut(self.ptr, self.len) }
    }
}

impl fmt::Debug for MappedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("MappedBuffer")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .finish()
    }
}

impl Drop for MappedBuffer {
    fn drop(&mut self) {
        if unsafe { libc::munmap(self.ptr.cast::<c_void>(), self.len) } != 0 {
            warn!("unmap failed: {}", io::Error::last_os_error());
        }
    }
}
