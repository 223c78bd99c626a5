//! Host-visible playback ring ("DMA area") and the word-swapping copy that
//! moves it into transfer buffers.
//!
//! The host writes interleaved little-endian S32 stereo frames anywhere in the
//! area; the streaming engine reads fixed-size chunks from its own offset,
//! wrapping at the end of the area. Every 32-bit sample leaves the driver with
//! its two 16-bit halves exchanged, which is the order the device expects.

use memmap2::{MmapMut, MmapOptions};
use parking_lot::RwLock;

enum DmaStorage {
    Local(Vec<u8>),
    Shared(MmapMut),
}

impl DmaStorage {
    fn bytes(&self) -> &[u8] {
        match self {
            DmaStorage::Local(data) => data.as_slice(),
            DmaStorage::Shared(mmap) => &mmap[..],
        }
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        match self {
            DmaStorage::Local(data) => data.as_mut_slice(),
            DmaStorage::Shared(mmap) => &mut mmap[..],
        }
    }
}

/// Byte ring shared between the host audio subsystem and the driver.
pub struct DmaArea {
    storage: RwLock<DmaStorage>,
    len: usize,
}

impl DmaArea {
    /// Heap-backed area of `len` zeroed bytes.
    pub fn new_local(len: usize) -> Self {
        Self {
            storage: RwLock::new(DmaStorage::Local(vec![0u8; len])),
            len,
        }
    }

    /// Anonymous shared mapping of `len` bytes, suitable for handing to a
    /// peer process.
    pub fn new_shared(len: usize) -> std::io::Result<Self> {
        let mmap = MmapOptions::new().len(len.max(1)).map_anon()?;
        Ok(Self {
            storage: RwLock::new(DmaStorage::Shared(mmap)),
            len,
        })
    }

    /// Capacity in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the area has no capacity.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copy `data` into the ring starting at `offset`, wrapping at the end.
    /// Returns the offset following the last byte written.
    pub fn write(&self, offset: usize, data: &[u8]) -> usize {
        if self.len == 0 {
            return 0;
        }
        let mut storage = self.storage.write();
        let ring = &mut storage.bytes_mut()[..self.len];
        let mut offset = offset % self.len;
        let mut written = 0;
        while written < data.len() {
            let run = (self.len - offset).min(data.len() - written);
            ring[offset..offset + run].copy_from_slice(&data[written..written + run]);
            written += run;
            offset = (offset + run) % self.len;
        }
        offset
    }

    /// Overwrite the whole area with `byte`.
    pub fn fill(&self, byte: u8) {
        let mut storage = self.storage.write();
        storage.bytes_mut()[..self.len].fill(byte);
    }

    /// Copy of the current contents.
    pub fn to_vec(&self) -> Vec<u8> {
        self.storage.read().bytes()[..self.len].to_vec()
    }

    pub(crate) fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let storage = self.storage.read();
        f(&storage.bytes()[..self.len])
    }
}

/// Write the 4-byte sample at `src` into `dest` with its 16-bit halves exchanged.
#[inline]
pub fn swap_word(dest: &mut [u8], src: &[u8]) {
    dest[0] = src[2];
    dest[1] = src[3];
    dest[2] = src[0];
    dest[3] = src[1];
}

/// Fill `dest` with word-swapped bytes read from `ring` starting at `dma_off`,
/// wrapping around the end of the ring as often as needed. Returns the next
/// read offset, always below `ring.len()`.
///
/// `ring.len()`, `dma_off` and `dest.len()` must be multiples of four.
pub fn copy_swapped(dest: &mut [u8], ring: &[u8], dma_off: usize) -> usize {
    debug_assert!(ring.len() % 4 == 0 && dma_off % 4 == 0 && dest.len() % 4 == 0);
    if ring.is_empty() {
        dest.fill(0);
        return 0;
    }
    let mut offset = dma_off % ring.len();
    let mut written = 0;
    while written < dest.len() {
        let run = (ring.len() - offset).min(dest.len() - written);
        for (d, s) in dest[written..written + run]
            .chunks_exact_mut(4)
            .zip(ring[offset..offset + run].chunks_exact(4))
        {
            swap_word(d, s);
        }
        written += run;
        offset += run;
        if offset == ring.len() {
            offset = 0;
        }
    }
    offset
}
