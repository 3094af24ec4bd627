//! Generation of upcall thunks: small pieces of machine code which native code can call like any
//! other function, and which gather the arguments into a flat list before calling a dispatcher
//! that runs the managed code.
//!
//! Every argument takes up one or more 8 byte slots in the list, in order (see
//! [`sig::arg_pointer`]). The thunk calls the dispatcher through the pointer stored in the
//! [`UpcallMetadata`] with two arguments, the metadata and the argument list, and then returns
//! whatever the dispatcher returned in the way the native caller expects it.
#![warn(clippy::pedantic)]
// Instruction encoding is full of deliberate narrowing.
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::unreadable_literal)]

use driver::{generate_with, size_thunk, write_thunk, ThunkGenerator};
use sig::{DispatcherKind, Signature};

pub mod aarch64;
pub mod driver;
#[cfg(unix)]
pub mod memory;
pub mod ppc64;
pub mod sig;
pub mod x64;

#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ThunkError {
    /// The calling convention has no way of passing the given type
    UnsupportedSignature(&'static str),
    /// A displacement did not fit into the instruction that has to use it
    DisplacementOutOfRange { displacement: i64 },
    /// The stack frame the thunk would need can't be allocated by its prologue
    FrameTooLarge { size: u64 },
    /// The second pass did not produce the amount of code that the first measured
    SizeMismatch { sized: usize, emitted: usize },
    /// Thunks for the calling convention can't be run on this machine
    UnsupportedHost(Abi),
    /// There is no calling convention that thunks can be generated for on this machine
    NoHostAbi,
    /// Getting (or protecting) the memory for the thunk failed
    MemoryAllocation,
}

/// Check that an offset into the stack frame fits into a 32-bit displacement
pub(crate) fn frame_offset(value: u64) -> Result<i32, ThunkError> {
    i32::try_from(value).map_err(|_| ThunkError::FrameTooLarge { size: value })
}

/// The calling conventions that thunks can be generated for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Abi {
    /// x86-64 System V
    SysV,
    /// x86-64 Windows
    Win64,
    /// AArch64 procedure call standard
    Aarch64,
    /// 64-bit little endian `PowerPC` ELF v2
    Ppc64Le,
}
impl Abi {
    pub const ALL: [Abi; 4] = [Abi::SysV, Abi::Win64, Abi::Aarch64, Abi::Ppc64Le];

    /// The calling convention of the machine we are running on, if thunks can be generated for it
    #[must_use]
    pub fn host() -> Option<Abi> {
        if cfg!(all(target_arch = "x86_64", windows)) {
            Some(Abi::Win64)
        } else if cfg!(target_arch = "x86_64") {
            Some(Abi::SysV)
        } else if cfg!(target_arch = "aarch64") {
            Some(Abi::Aarch64)
        } else if cfg!(all(target_arch = "powerpc64", target_endian = "little")) {
            Some(Abi::Ppc64Le)
        } else {
            None
        }
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Abi::SysV => "sysv",
            Abi::Win64 => "win64",
            Abi::Aarch64 => "aarch64",
            Abi::Ppc64Le => "ppc64le",
        }
    }

    #[must_use]
    pub fn from_name(name: &str) -> Option<Abi> {
        Abi::ALL.iter().copied().find(|abi| abi.name() == name)
    }
}

/// The record which a thunk hands to its dispatcher.
/// The thunk embeds its address, so it must not move while the thunk may be called.
#[derive(Debug)]
#[repr(C)]
pub struct UpcallMetadata {
    /// Whatever the dispatcher needs to know about what to invoke
    pub user_data: usize,
    /// Address of the dispatcher the thunk calls
    pub dispatcher: usize,
    /// The signature the thunk was generated for
    pub signature: *const Signature,
    pub thunk_address: usize,
    pub thunk_size: usize,
}
impl UpcallMetadata {
    #[must_use]
    pub fn new(user_data: usize, dispatcher: usize) -> UpcallMetadata {
        UpcallMetadata {
            user_data,
            dispatcher,
            signature: std::ptr::null(),
            thunk_address: 0,
            thunk_size: 0,
        }
    }
}

/// Offset of [`UpcallMetadata::dispatcher`], which the thunk loads the call target from
pub const DISPATCHER_OFFSET: i8 = 8;

/// The six dispatchers that a thunk can call, one per kind of return value.
/// Each is called as `dispatcher(metadata, arg_list)`. The aggregate dispatcher returns a pointer
/// to the value it produced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatcherTable {
    pub void: usize,
    pub int32: usize,
    pub int64: usize,
    pub float: usize,
    pub double: usize,
    pub aggregate: usize,
}
impl DispatcherTable {
    #[must_use]
    pub fn select(&self, kind: DispatcherKind) -> usize {
        match kind {
            DispatcherKind::Void => self.void,
            DispatcherKind::Int32 => self.int32,
            DispatcherKind::Int64 => self.int64,
            DispatcherKind::Float => self.float,
            DispatcherKind::Double => self.double,
            DispatcherKind::Struct => self.aggregate,
        }
    }
}

/// Generate the code of a thunk for `abi`, which passes `metadata` to its dispatcher.
/// This works for any calling convention, whatever the host is.
pub fn generate_thunk(abi: Abi, signature: &Signature, metadata: u64) -> Result<Vec<u8>, ThunkError> {
    match abi {
        Abi::SysV => generate_with(&x64::sysv::SysV, signature, metadata),
        Abi::Win64 => generate_with(&x64::win64::Win64, signature, metadata),
        Abi::Aarch64 => generate_with(&aarch64::Aarch64, signature, metadata),
        Abi::Ppc64Le => generate_with(&ppc64::Ppc64, signature, metadata),
    }
}

/// The exact size of the thunk that [`generate_thunk`] would produce
pub fn thunk_size(abi: Abi, signature: &Signature) -> Result<usize, ThunkError> {
    fn size<G: ThunkGenerator>(generator: &G, signature: &Signature) -> Result<usize, ThunkError> {
        let plan = generator.plan(signature)?;
        Ok(size_thunk(generator, &plan, 0))
    }

    match abi {
        Abi::SysV => size(&x64::sysv::SysV, signature),
        Abi::Win64 => size(&x64::win64::Win64, signature),
        Abi::Aarch64 => size(&aarch64::Aarch64, signature),
        Abi::Ppc64Le => size(&ppc64::Ppc64, signature),
    }
}

/// A thunk in executable memory, along with the metadata and signature it refers to
#[cfg(unix)]
#[derive(Debug)]
pub struct UpcallThunk {
    metadata: Box<UpcallMetadata>,
    signature: Box<Signature>,
    memory: memory::ExecutableMemory,
}
#[cfg(unix)]
impl UpcallThunk {
    /// The address native code calls
    #[must_use]
    pub fn entry(&self) -> *const u8 {
        self.memory.as_ptr()
    }

    /// Size of the code, rounded up to 8 bytes
    #[must_use]
    pub fn size(&self) -> usize {
        self.metadata.thunk_size
    }

    #[must_use]
    pub fn metadata(&self) -> &UpcallMetadata {
        &self.metadata
    }

    #[must_use]
    pub fn signature(&self) -> &Signature {
        &self.signature
    }
}

/// Create a thunk for the host calling convention which calls the dispatcher from `dispatchers`
/// that fits the return type of `signature`.
/// The memory is only gotten once the size of the code is known, and is made executable after the
/// code has been written.
#[cfg(unix)]
pub fn create_thunk(
    signature: &Signature,
    dispatchers: &DispatcherTable,
    user_data: usize,
) -> Result<UpcallThunk, ThunkError> {
    let abi = Abi::host().ok_or(ThunkError::NoHostAbi)?;
    if cfg!(target_os = "macos") && abi == Abi::Aarch64 {
        // Apple packs stack arguments, which the generator does not
        return Err(ThunkError::UnsupportedHost(abi));
    }

    let signature = Box::new(signature.clone());
    let mut metadata = Box::new(UpcallMetadata::new(
        user_data,
        dispatchers.select(signature.dispatcher()),
    ));
    metadata.signature = &*signature;
    let address = &*metadata as *const UpcallMetadata as u64;

    let memory = match abi {
        Abi::SysV => emit_executable(&x64::sysv::SysV, &signature, address),
        Abi::Win64 => emit_executable(&x64::win64::Win64, &signature, address),
        Abi::Aarch64 => emit_executable(&aarch64::Aarch64, &signature, address),
        Abi::Ppc64Le => emit_executable(&ppc64::Ppc64, &signature, address),
    }?;

    metadata.thunk_address = memory.as_ptr() as usize;
    metadata.thunk_size = sig::round_up(memory.code_len(), 8);
    tracing::debug!(
        "Created {} byte {} thunk for {} at {:X}",
        memory.code_len(),
        abi.name(),
        signature,
        metadata.thunk_address
    );

    Ok(UpcallThunk {
        metadata,
        signature,
        memory,
    })
}

#[cfg(unix)]
fn emit_executable<G: ThunkGenerator>(
    generator: &G,
    signature: &Signature,
    metadata: u64,
) -> Result<memory::ExecutableMemory, ThunkError> {
    let plan = generator.plan(signature)?;
    let size = size_thunk(generator, &plan, metadata);

    let mut memory = memory::WritableMemory::allocate(size)?;
    write_thunk(generator, &plan, metadata, memory.as_mut_slice(), size)?;
    memory.seal(size)
}

#[cfg(test)]
mod tests {
    use crate::{
        sig::{DispatcherKind, Signature},
        thunk_size, generate_thunk, Abi, DispatcherTable, UpcallMetadata, DISPATCHER_OFFSET,
    };

    #[test]
    fn test_dispatcher_offset() {
        let metadata = UpcallMetadata::new(0, 0);
        let base = std::ptr::addr_of!(metadata) as usize;
        let dispatcher = std::ptr::addr_of!(metadata.dispatcher) as usize;
        assert_eq!(dispatcher - base, DISPATCHER_OFFSET as usize);
    }

    #[test]
    fn test_select() {
        let table = DispatcherTable {
            void: 1,
            int32: 2,
            int64: 3,
            float: 4,
            double: 5,
            aggregate: 6,
        };
        assert_eq!(table.select(DispatcherKind::Void), 1);
        assert_eq!(table.select(DispatcherKind::Int64), 3);
        assert_eq!(table.select(DispatcherKind::Struct), 6);
    }

    /// Both passes agree for a spread of signatures on every calling convention
    #[test]
    fn test_sizes_match() {
        let sigs = [
            "()v",
            "(i,d,{8:misc},p)d",
            "(c,s,i,j,p,f,d,i,j,p,i,j,f,d,f,d,f,d,f,d,f)v",
            "({16:all-dp},{12:all-sp},{16:sp-dp},{16:misc-dp},{16:dp-misc},{24:sp-sp-dp})j",
            "({40:other},i,{3:misc},{200:misc})f",
            "(d,d,d,d,d,d,d,d,d,{16:all-dp},{8:all-sp},i)i",
            "(i,j){32:misc}",
            "(f){12:all-sp}",
            "(p,p){16:misc}",
            "(){80:other}",
            "(i){8:misc-sp}",
            "(i){16:sp-misc}",
        ];
        for text in sigs {
            let sig: Signature = text.parse().unwrap();
            for abi in Abi::ALL {
                let code = generate_thunk(abi, &sig, 0x7FFF_1234_5678).unwrap();
                assert_eq!(code.len(), thunk_size(abi, &sig).unwrap(), "{} {}", abi.name(), text);
                if matches!(abi, Abi::Aarch64 | Abi::Ppc64Le) {
                    assert_eq!(code.len() % 4, 0);
                }
            }
        }
    }

    #[test]
    fn test_abi_names() {
        for abi in Abi::ALL {
            assert_eq!(Abi::from_name(abi.name()), Some(abi));
        }
        assert_eq!(Abi::from_name("mips"), None);
    }
}
