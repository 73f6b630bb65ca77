//! Guest physical memory as seen by the VMX control plane.
//!
//! The VMCS region, MSR areas, VMREAD/VMWRITE bitmaps, the virtual-APIC page
//! and the PDPTEs are all plain guest-physical memory; nothing here is
//! virtual-address based.

/// Physical memory access used for VMCS and auxiliary-structure accesses.
///
/// Backends only need to provide bulk reads/writes; width-specific accessors
/// are little-endian views over them.
pub trait PhysicalMemory {
    fn read_bytes(&mut self, paddr: u64, dst: &mut [u8]);
    fn write_bytes(&mut self, paddr: u64, src: &[u8]);

    /// Direct view of host memory backing `paddr..paddr + len`, if contiguous.
    ///
    /// Used as a fast path for VMCS field access. The default has no backing.
    #[inline]
    fn backing_slice_mut(&mut self, _paddr: u64, _len: usize) -> Option<&mut [u8]> {
        None
    }

    /// Called after every VMCS field write; translation/decode caches keyed to
    /// the page containing `paddr` must be dropped.
    #[inline]
    fn invalidate_page(&mut self, _paddr: u64) {}

    #[inline]
    fn read_u8(&mut self, paddr: u64) -> u8 {
        let mut buf = [0u8; 1];
        self.read_bytes(paddr, &mut buf);
        buf[0]
    }

    #[inline]
    fn read_u16(&mut self, paddr: u64) -> u16 {
        let mut buf = [0u8; 2];
        self.read_bytes(paddr, &mut buf);
        u16::from_le_bytes(buf)
    }

    #[inline]
    fn read_u32(&mut self, paddr: u64) -> u32 {
        let mut buf = [0u8; 4];
        self.read_bytes(paddr, &mut buf);
        u32::from_le_bytes(buf)
    }

    #[inline]
    fn read_u64(&mut self, paddr: u64) -> u64 {
        let mut buf = [0u8; 8];
        self.read_bytes(paddr, &mut buf);
        u64::from_le_bytes(buf)
    }

    #[inline]
    fn write_u8(&mut self, paddr: u64, value: u8) {
        self.write_bytes(paddr, &[value]);
    }

    #[inline]
    fn write_u16(&mut self, paddr: u64, value: u16) {
        self.write_bytes(paddr, &value.to_le_bytes());
    }

    #[inline]
    fn write_u32(&mut self, paddr: u64, value: u32) {
        self.write_bytes(paddr, &value.to_le_bytes());
    }

    #[inline]
    fn write_u64(&mut self, paddr: u64, value: u64) {
        self.write_bytes(paddr, &value.to_le_bytes());
    }
}

impl<T: PhysicalMemory + ?Sized> PhysicalMemory for &mut T {
    #[inline]
    fn read_bytes(&mut self, paddr: u64, dst: &mut [u8]) {
        <T as PhysicalMemory>::read_bytes(&mut **self, paddr, dst)
    }

    #[inline]
    fn write_bytes(&mut self, paddr: u64, src: &[u8]) {
        <T as PhysicalMemory>::write_bytes(&mut **self, paddr, src)
    }

    #[inline]
    fn backing_slice_mut(&mut self, paddr: u64, len: usize) -> Option<&mut [u8]> {
        <T as PhysicalMemory>::backing_slice_mut(&mut **self, paddr, len)
    }

    #[inline]
    fn invalidate_page(&mut self, paddr: u64) {
        <T as PhysicalMemory>::invalidate_page(&mut **self, paddr)
    }
}

/// Flat RAM starting at physical address 0.
///
/// Reads beyond the end return open-bus `0xFF` bytes; writes beyond the end
/// are dropped.
#[derive(Debug, Clone)]
pub struct FlatGuestMemory {
    data: Vec<u8>,
}

impl FlatGuestMemory {
    pub fn new(size: usize) -> Self {
        Self {
            data: vec![0; size],
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    fn range(&self, paddr: u64, len: usize) -> Option<core::ops::Range<usize>> {
        let start = usize::try_from(paddr).ok()?;
        let end = start.checked_add(len)?;
        (end <= self.data.len()).then_some(start..end)
    }
}

impl PhysicalMemory for FlatGuestMemory {
    fn read_bytes(&mut self, paddr: u64, dst: &mut [u8]) {
        match self.range(paddr, dst.len()) {
            Some(range) => dst.copy_from_slice(&self.data[range]),
            None => {
                for (i, slot) in dst.iter_mut().enumerate() {
                    let addr = paddr.wrapping_add(i as u64);
                    *slot = usize::try_from(addr)
                        .ok()
                        .and_then(|a| self.data.get(a).copied())
                        .unwrap_or(0xFF);
                }
            }
        }
    }

    fn write_bytes(&mut self, paddr: u64, src: &[u8]) {
        match self.range(paddr, src.len()) {
            Some(range) => self.data[range].copy_from_slice(src),
            None => {
                for (i, byte) in src.iter().copied().enumerate() {
                    let addr = paddr.wrapping_add(i as u64);
                    if let Some(slot) = usize::try_from(addr)
                        .ok()
                        .and_then(|a| self.data.get_mut(a))
                    {
                        *slot = byte;
                    }
                }
            }
        }
    }

    fn backing_slice_mut(&mut self, paddr: u64, len: usize) -> Option<&mut [u8]> {
        let range = self.range(paddr, len)?;
        Some(&mut self.data[range])
    }
}
