//! Guest and host memory arenas.
//!
//! The guest arena holds the loaded program image; the host arena is a bump
//! allocator for translated code. Host "addresses" are arena offsets: making
//! the region executable and jumping into it belongs to the embedder, not
//! the core.

/// The guest program image and its base address.
#[derive(Debug)]
pub struct GuestArena {
    capacity: usize,
    image: Vec<u8>,
    base: u64,
}

impl GuestArena {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            image: Vec::new(),
            base: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.image.len()
    }

    pub fn is_empty(&self) -> bool {
        self.image.is_empty()
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    /// Replace the image. Callers check the capacity first; loading is
    /// infallible.
    pub fn load(&mut self, bytes: &[u8], base: u64) {
        debug_assert!(bytes.len() <= self.capacity);
        self.image.clear();
        self.image.extend_from_slice(bytes);
        self.base = base;
    }

    /// Up to `max` bytes of the image starting at `guest_addr`, or `None`
    /// when the address is outside the image. The window may be empty when
    /// the address sits exactly at the image end.
    pub fn window(&self, guest_addr: u64, max: usize) -> Option<&[u8]> {
        let offset = usize::try_from(guest_addr.checked_sub(self.base)?).ok()?;
        if offset > self.image.len() {
            return None;
        }
        let end = self.image.len().min(offset + max);
        Some(&self.image[offset..end])
    }

    /// Overwrite image bytes in place (guest code mutation). Returns whether
    /// the whole range was inside the image.
    pub fn write(&mut self, guest_addr: u64, bytes: &[u8]) -> bool {
        let Some(offset) = guest_addr
            .checked_sub(self.base)
            .and_then(|o| usize::try_from(o).ok())
        else {
            return false;
        };
        let Some(end) = offset.checked_add(bytes.len()) else {
            return false;
        };
        if end > self.image.len() {
            return false;
        }
        self.image[offset..end].copy_from_slice(bytes);
        true
    }
}

/// Bump allocator for translated host code.
#[derive(Debug)]
pub struct HostArena {
    bytes: Vec<u8>,
    capacity: usize,
}

impl HostArena {
    pub fn new(capacity: usize) -> Self {
        Self {
            bytes: Vec::new(),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn used(&self) -> usize {
        self.bytes.len()
    }

    pub fn available(&self) -> usize {
        self.capacity - self.bytes.len()
    }

    /// Append `code` and return its arena offset, or `None` when the arena
    /// cannot hold it.
    pub fn alloc(&mut self, code: &[u8]) -> Option<u64> {
        if code.len() > self.available() {
            return None;
        }
        let addr = self.bytes.len() as u64;
        self.bytes.extend_from_slice(code);
        Some(addr)
    }

    pub fn bytes_at(&self, addr: u64, len: usize) -> Option<&[u8]> {
        let start = usize::try_from(addr).ok()?;
        let end = start.checked_add(len)?;
        self.bytes.get(start..end)
    }

    pub fn clear(&mut self) {
        self.bytes.clear();
    }
}
