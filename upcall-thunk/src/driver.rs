//! The two passes that every thunk is built with.
//! The first pass only measures the code, so that memory of the right size can be gotten before
//! anything is written. The second pass writes the same instructions into that memory.

use crate::{sig::Signature, ThunkError};

/// Where the instructions of a thunk go
pub trait Emitter {
    fn emit_bytes(&mut self, bytes: &[u8]);

    /// Number of bytes emitted so far
    fn position(&self) -> usize;

    fn emit_u8(&mut self, value: u8) {
        self.emit_bytes(&[value]);
    }

    fn emit_i8(&mut self, value: i8) {
        self.emit_bytes(&value.to_le_bytes());
    }

    fn emit_i32(&mut self, value: i32) {
        self.emit_bytes(&value.to_le_bytes());
    }

    fn emit_u64(&mut self, value: u64) {
        self.emit_bytes(&value.to_le_bytes());
    }

    /// A fixed size instruction word, in little endian order
    fn emit_word(&mut self, word: u32) {
        self.emit_bytes(&word.to_le_bytes());
    }
}

/// Counts the bytes without keeping them
#[derive(Debug, Default)]
pub struct CodeSizer {
    len: usize,
}
impl CodeSizer {
    #[must_use]
    pub fn new() -> CodeSizer {
        CodeSizer::default()
    }
}
impl Emitter for CodeSizer {
    fn emit_bytes(&mut self, bytes: &[u8]) {
        self.len += bytes.len();
    }

    fn position(&self) -> usize {
        self.len
    }
}

/// Writes into a buffer that was sized beforehand
#[derive(Debug)]
pub struct CodeWriter<'a> {
    buffer: &'a mut [u8],
    len: usize,
    /// Number of bytes that did not fit
    overflow: usize,
}
impl<'a> CodeWriter<'a> {
    pub fn new(buffer: &'a mut [u8]) -> CodeWriter<'a> {
        CodeWriter {
            buffer,
            len: 0,
            overflow: 0,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn overflowed(&self) -> bool {
        self.overflow != 0
    }
}
impl<'a> Emitter for CodeWriter<'a> {
    fn emit_bytes(&mut self, bytes: &[u8]) {
        let end = self.len + bytes.len();
        if let Some(dest) = self.buffer.get_mut(self.len..end) {
            dest.copy_from_slice(bytes);
            self.len = end;
        } else {
            self.overflow += bytes.len();
        }
    }

    fn position(&self) -> usize {
        self.len + self.overflow
    }
}

/// A calling convention that thunks can be generated for.
///
/// Classification is done once, producing a plan. Both passes then emit from the same plan, so
/// they make the same decisions about every parameter.
pub trait ThunkGenerator {
    type Plan;

    /// Decide where every parameter comes from and where it is stored
    fn plan(&self, signature: &Signature) -> Result<Self::Plan, ThunkError>;

    /// Emit the thunk for the plan. `metadata` is the address of the record that the thunk
    /// passes to the dispatcher.
    fn emit(&self, plan: &Self::Plan, metadata: u64, out: &mut dyn Emitter);
}

/// Measure the thunk that `plan` describes
pub fn size_thunk<G: ThunkGenerator + ?Sized>(generator: &G, plan: &G::Plan, metadata: u64) -> usize {
    let mut sizer = CodeSizer::new();
    generator.emit(plan, metadata, &mut sizer);
    sizer.position()
}

/// Write the thunk for `plan` into `buffer`, which must be exactly `expected` bytes of code.
/// Returns the number of bytes written.
pub fn write_thunk<G: ThunkGenerator + ?Sized>(
    generator: &G,
    plan: &G::Plan,
    metadata: u64,
    buffer: &mut [u8],
    expected: usize,
) -> Result<usize, ThunkError> {
    let mut writer = CodeWriter::new(buffer);
    generator.emit(plan, metadata, &mut writer);
    if writer.overflowed() || writer.len() != expected {
        return Err(ThunkError::SizeMismatch {
            sized: expected,
            emitted: writer.position(),
        });
    }
    Ok(writer.len())
}

/// Build the thunk for `signature` into a new vector
pub fn generate_with<G: ThunkGenerator + ?Sized>(
    generator: &G,
    signature: &Signature,
    metadata: u64,
) -> Result<Vec<u8>, ThunkError> {
    let plan = generator.plan(signature)?;
    let size = size_thunk(generator, &plan, metadata);
    let mut code = vec![0; size];
    write_thunk(generator, &plan, metadata, &mut code, size)?;
    tracing::trace!("Generated {} byte thunk for {}", size, signature);
    Ok(code)
}
