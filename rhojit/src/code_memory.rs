//! Access to the generated code that assumptions patch.
//! The assumption table never touches code directly, it goes through a [`CodeMemory`] so that the
//! patching can be observed (and tested) without a real code cache.

use usize_cast::IntoUsize;

#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CodePatchError {
    /// The range was not inside of the code memory
    OutOfBounds { address: usize, len: usize },
    /// The patched branch could not reach its destination with the instruction that has room at
    /// the patch site
    BranchOutOfRange { from: usize, to: usize },
    /// The branch destination is not instruction aligned
    MisalignedBranch { from: usize, to: usize },
    /// A patch site recorded a width that can't be written
    UnsupportedWidth(u8),
}

pub trait CodeMemory {
    fn read_bytes(&self, address: usize, out: &mut [u8]) -> Result<(), CodePatchError>;

    fn write_bytes(&mut self, address: usize, data: &[u8]) -> Result<(), CodePatchError>;

    /// Ask for the body starting at `start_pc` to be recompiled.
    /// This is how pre-prologue assumptions are compensated, rather than by patching the
    /// guarded code itself.
    fn induce_recompilation(&mut self, start_pc: usize) -> Result<(), CodePatchError>;

    fn read_u32(&self, address: usize) -> Result<u32, CodePatchError> {
        let mut data = [0; 4];
        self.read_bytes(address, &mut data)?;
        Ok(u32::from_le_bytes(data))
    }

    fn write_u32(&mut self, address: usize, value: u32) -> Result<(), CodePatchError> {
        self.write_bytes(address, &value.to_le_bytes())
    }

    fn read_u64(&self, address: usize) -> Result<u64, CodePatchError> {
        let mut data = [0; 8];
        self.read_bytes(address, &mut data)?;
        Ok(u64::from_le_bytes(data))
    }

    fn write_u64(&mut self, address: usize, value: u64) -> Result<(), CodePatchError> {
        self.write_bytes(address, &value.to_le_bytes())
    }

    /// Write the low `width` bytes of `value`
    fn write_sized(&mut self, address: usize, width: u8, value: u64) -> Result<(), CodePatchError> {
        match width {
            // Truncation is the point, the site only holds the low half
            #[allow(clippy::cast_possible_truncation)]
            4 => self.write_u32(address, value as u32),
            8 => self.write_u64(address, value),
            _ => Err(CodePatchError::UnsupportedWidth(width)),
        }
    }
}

/// Code memory backed by a plain buffer, which pretends to live at `base`.
#[derive(Debug, Clone)]
pub struct BufferCodeMemory {
    base: usize,
    bytes: Vec<u8>,
    recompilations: Vec<usize>,
}
impl BufferCodeMemory {
    #[must_use]
    pub fn new(base: usize, size: usize) -> BufferCodeMemory {
        BufferCodeMemory {
            base,
            bytes: vec![0; size],
            recompilations: Vec::new(),
        }
    }

    #[must_use]
    pub fn base(&self) -> usize {
        self.base
    }

    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// The start pcs that were asked to be recompiled, in order
    #[must_use]
    pub fn recompilations(&self) -> &[usize] {
        &self.recompilations
    }

    fn range(&self, address: usize, len: usize) -> Result<std::ops::Range<usize>, CodePatchError> {
        let err = CodePatchError::OutOfBounds { address, len };
        let start = address.checked_sub(self.base).ok_or_else(|| err.clone())?;
        let end = start.checked_add(len).ok_or_else(|| err.clone())?;
        if end > self.bytes.len() {
            return Err(err);
        }

        Ok(start..end)
    }
}
impl CodeMemory for BufferCodeMemory {
    fn read_bytes(&self, address: usize, out: &mut [u8]) -> Result<(), CodePatchError> {
        let range = self.range(address, out.len())?;
        out.copy_from_slice(&self.bytes[range]);
        Ok(())
    }

    fn write_bytes(&mut self, address: usize, data: &[u8]) -> Result<(), CodePatchError> {
        let range = self.range(address, data.len())?;
        self.bytes[range].copy_from_slice(data);
        Ok(())
    }

    fn induce_recompilation(&mut self, start_pc: usize) -> Result<(), CodePatchError> {
        self.recompilations.push(start_pc);
        Ok(())
    }
}

/// Code memory that reads and writes the addresses directly.
pub struct RawCodeMemory<F: FnMut(usize)> {
    recompile: F,
}
impl<F: FnMut(usize)> RawCodeMemory<F> {
    /// `recompile` is called with the start pc of any body that has to be recompiled.
    /// # Safety
    /// Every address that is patched through this must be valid for reads and writes of the
    /// patched width, and nothing may be executing the patched bytes in a way that would observe
    /// a torn write.
    pub unsafe fn new(recompile: F) -> RawCodeMemory<F> {
        RawCodeMemory { recompile }
    }
}
impl<F: FnMut(usize)> CodeMemory for RawCodeMemory<F> {
    fn read_bytes(&self, address: usize, out: &mut [u8]) -> Result<(), CodePatchError> {
        // Safety: the creator of this promised that patched addresses are valid
        unsafe {
            std::ptr::copy_nonoverlapping(address as *const u8, out.as_mut_ptr(), out.len());
        }
        Ok(())
    }

    fn write_bytes(&mut self, address: usize, data: &[u8]) -> Result<(), CodePatchError> {
        // Safety: the creator of this promised that patched addresses are valid
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), address as *mut u8, data.len());
        }
        Ok(())
    }

    fn induce_recompilation(&mut self, start_pc: usize) -> Result<(), CodePatchError> {
        (self.recompile)(start_pc);
        Ok(())
    }
}

/// Displacement from `from` to `to` as a signed value
#[allow(clippy::cast_possible_wrap)]
pub(crate) fn displacement(from: usize, to: usize) -> i64 {
    (to as i64).wrapping_sub(from as i64)
}

/// Whether a signed value fits in `bits` bits
pub(crate) fn fits_signed(value: i64, bits: u32) -> bool {
    let limit = 1i64 << (bits - 1);
    (-limit..limit).contains(&value)
}

pub(crate) fn u32_at(bytes: &[u8], offset: usize) -> Option<u32> {
    let data = bytes.get(offset..offset + 4)?;
    let mut word = [0; 4];
    word.copy_from_slice(data);
    Some(u32::from_le_bytes(word))
}

pub(crate) fn u64_at(bytes: &[u8], offset: usize) -> Option<u64> {
    let data = bytes.get(offset..offset + 8)?;
    let mut word = [0; 8];
    word.copy_from_slice(data);
    Some(u64::from_le_bytes(word))
}

/// Read `len` bytes starting at `address`
pub(crate) fn read_vec(
    code: &dyn CodeMemory,
    address: usize,
    len: u32,
) -> Result<Vec<u8>, CodePatchError> {
    let mut data = vec![0; len.into_usize()];
    code.read_bytes(address, &mut data)?;
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::{fits_signed, BufferCodeMemory, CodeMemory, CodePatchError};

    #[test]
    fn test_buffer_bounds() {
        let mut mem = BufferCodeMemory::new(0x1000, 16);
        mem.write_u32(0x1000, 0xAABB_CCDD).unwrap();
        assert_eq!(&mem.bytes()[..4], &[0xDD, 0xCC, 0xBB, 0xAA]);
        assert_eq!(mem.read_u32(0x1000), Ok(0xAABB_CCDD));
        mem.write_u64(0x1008, u64::MAX).unwrap();

        assert_eq!(
            mem.write_u64(0x100C, 0),
            Err(CodePatchError::OutOfBounds {
                address: 0x100C,
                len: 8
            })
        );
        assert!(mem.read_u32(0xFFF).is_err());
        assert_eq!(
            mem.write_sized(0x1000, 2, 0),
            Err(CodePatchError::UnsupportedWidth(2))
        );
    }

    #[test]
    fn test_fits_signed() {
        assert!(fits_signed(127, 8));
        assert!(fits_signed(-128, 8));
        assert!(!fits_signed(128, 8));
        assert!(!fits_signed(-129, 8));
    }
}
