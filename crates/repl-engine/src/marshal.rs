//! Moving strings across the host/module boundary.
//!
//! Strings enter the module through buffers obtained from its own allocator
//! (`string_allocate`) and are handed back with `string_deallocate`.  The
//! marshaller keeps a ledger of every live buffer so that each allocation is
//! released exactly once and the allocator is caught if it ever hands out
//! memory that is still in use.  It never releases anything on its own
//! initiative, with the one exception of the scoped `with_string`, and never
//! calls into an instance that has just trapped.
//!
//! The linear memory is looked up again before every access, because any
//! call into the module may grow it.
//!
//! ## Authors
//!
//! The Veracruz Development Team.
//!
//! ## Licensing and copyright notice
//!
//! See the `LICENSE.md` file in the Veracruz root directory for
//! information on licensing and copyright.

use crate::{
    engines::wasmtime::{check_deallocate, DeallocSignature},
    error::EngineError,
    shim::SyscallShim,
};
use anyhow::{anyhow, Result};
use log::{trace, warn};
use wasmtime::{AsContextMut, Instance, Memory, Trap, TypedFunc};

/// Export names of the module's allocator.
pub const ALLOCATE_EXPORT: &str = "string_allocate";
pub const DEALLOCATE_EXPORT: &str = "string_deallocate";

/// A buffer in the module's memory holding a string the host wrote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarshalledString {
    pub pointer: u32,
    pub length: u32,
}

/// The module's deallocator, in whichever shape it was exported.
enum Deallocator {
    PointerOnly(TypedFunc<u32, ()>),
    PointerAndLength(TypedFunc<(u32, u32), ()>),
}

/// Allocation ledger and string codec for one instance.
pub struct MemoryMarshaller {
    instance: Instance,
    allocate: TypedFunc<u32, u32>,
    deallocate: Deallocator,
    /// Live buffers as `(pointer, length)`.
    live: Vec<(u32, u32)>,
}

impl MemoryMarshaller {
    /// Resolves the allocator exports of `instance`.
    pub fn new(instance: Instance, mut store: impl AsContextMut) -> Result<Self> {
        let allocate = instance
            .get_typed_func::<u32, u32>(&mut store, ALLOCATE_EXPORT)
            .map_err(|_| anyhow!(EngineError::MissingExport(ALLOCATE_EXPORT.to_string())))?;

        let export = instance
            .get_export(&mut store, DEALLOCATE_EXPORT)
            .ok_or_else(|| anyhow!(EngineError::MissingExport(DEALLOCATE_EXPORT.to_string())))?;
        let deallocate = match check_deallocate(&export.ty(&store)) {
            DeallocSignature::PointerOnly => Deallocator::PointerOnly(
                instance.get_typed_func::<u32, ()>(&mut store, DEALLOCATE_EXPORT)?,
            ),
            DeallocSignature::PointerAndLength => Deallocator::PointerAndLength(
                instance.get_typed_func::<(u32, u32), ()>(&mut store, DEALLOCATE_EXPORT)?,
            ),
            DeallocSignature::NoDeallocFound => {
                return Err(anyhow!(EngineError::MissingExport(
                    DEALLOCATE_EXPORT.to_string()
                )))
            }
        };

        Ok(Self {
            instance,
            allocate,
            deallocate,
            live: Vec::new(),
        })
    }

    /// Number of buffers allocated and not yet released.
    #[inline]
    pub fn live_allocations(&self) -> usize {
        self.live.len()
    }

    fn memory(&self, store: impl AsContextMut) -> Result<Memory> {
        self.instance
            .get_memory(store, SyscallShim::LINEAR_MEMORY_NAME)
            .ok_or_else(|| anyhow!(EngineError::NoMemoryExported))
    }

    /// Whether `[pointer, pointer + length)` overlaps a live buffer.
    fn overlaps_live(&self, pointer: u32, length: u32) -> bool {
        let end = u64::from(pointer) + u64::from(length);
        length != 0
            && self.live.iter().any(|(p, l)| {
                *l != 0 && u64::from(pointer) < u64::from(*p) + u64::from(*l) && u64::from(*p) < end
            })
    }

    ////////////////////////////////////////////////////////////////////////////
    // Allocation.
    ////////////////////////////////////////////////////////////////////////////

    /// Allocates `length` bytes in the module.  The caller owns the buffer
    /// and must pass it to `deallocate` exactly once.
    pub fn allocate(&mut self, mut store: impl AsContextMut, length: u32) -> Result<u32> {
        let pointer = self.allocate.call(&mut store, length)?;
        if self.overlaps_live(pointer, length) {
            return Err(anyhow!(EngineError::AllocationAliased(pointer)));
        }
        trace!("Allocated {} bytes at {:#x}.", length, pointer);
        self.live.push((pointer, length));
        Ok(pointer)
    }

    /// Takes ownership of a buffer the module allocated on its own and
    /// returned to the host, so it is released through `deallocate`.
    pub fn adopt(&mut self, pointer: u32, length: u32) -> Result<()> {
        if self.overlaps_live(pointer, length) {
            return Err(anyhow!(EngineError::AllocationAliased(pointer)));
        }
        self.live.push((pointer, length));
        Ok(())
    }

    /// Forgets a live buffer without calling into the module, for buffers the
    /// module releases through some other export.
    pub fn disown(&mut self, pointer: u32) -> Result<u32> {
        let index = self
            .live
            .iter()
            .position(|(p, _)| *p == pointer)
            .ok_or_else(|| anyhow!(EngineError::DoubleFree(pointer)))?;
        Ok(self.live.swap_remove(index).1)
    }

    /// Releases a buffer previously obtained from `allocate` or `adopt`.
    pub fn deallocate(&mut self, mut store: impl AsContextMut, pointer: u32) -> Result<()> {
        let length = self.disown(pointer)?;
        match &self.deallocate {
            Deallocator::PointerOnly(f) => f.call(&mut store, pointer)?,
            Deallocator::PointerAndLength(f) => f.call(&mut store, (pointer, length))?,
        }
        trace!("Released {} bytes at {:#x}.", length, pointer);
        Ok(())
    }

    ////////////////////////////////////////////////////////////////////////////
    // Encoding and decoding.
    ////////////////////////////////////////////////////////////////////////////

    /// Writes the UTF-8 bytes of `text` at `pointer`.
    pub fn write_utf8(&self, mut store: impl AsContextMut, pointer: u32, text: &str) -> Result<()> {
        let memory = self.memory(&mut store)?;
        memory
            .write(&mut store, pointer as usize, text.as_bytes())
            .map_err(|_| {
                anyhow!(EngineError::InvalidMemoryAccess {
                    address: pointer,
                    length: text.len() as u32,
                })
            })
    }

    /// Reads `length` bytes at `pointer` as UTF-8.
    pub fn read_utf8(
        &self,
        mut store: impl AsContextMut,
        pointer: u32,
        length: u32,
    ) -> Result<String> {
        let memory = self.memory(&mut store)?;
        let mut bytes = vec![0; length as usize];
        memory
            .read(&store, pointer as usize, &mut bytes)
            .map_err(|_| anyhow!(EngineError::InvalidMemoryAccess { address: pointer, length }))?;
        String::from_utf8(bytes).map_err(|_| anyhow!(EngineError::InvalidUtf8))
    }

    /// Reads a NUL-terminated UTF-8 string at `pointer`, excluding the NUL.
    pub fn read_cstring(&self, mut store: impl AsContextMut, pointer: u32) -> Result<String> {
        let memory = self.memory(&mut store)?;
        let data = memory.data(&store);
        let start = pointer as usize;
        let tail = data.get(start..).ok_or_else(|| {
            anyhow!(EngineError::InvalidMemoryAccess {
                address: pointer,
                length: 1,
            })
        })?;
        let length = tail.iter().position(|b| *b == 0).ok_or_else(|| {
            anyhow!(EngineError::InvalidMemoryAccess {
                address: pointer,
                length: tail.len() as u32,
            })
        })?;
        std::str::from_utf8(&tail[..length])
            .map(str::to_string)
            .map_err(|_| anyhow!(EngineError::InvalidUtf8))
    }

    /// Copies `text` into a freshly allocated buffer.  The buffer is released
    /// again if the copy fails; otherwise the caller owns it.
    pub fn pass_string(
        &mut self,
        mut store: impl AsContextMut,
        text: &str,
    ) -> Result<MarshalledString> {
        let length = text.len() as u32;
        let pointer = self.allocate(&mut store, length)?;
        if let Err(e) = self.write_utf8(&mut store, pointer, text) {
            self.deallocate(&mut store, pointer)?;
            return Err(e);
        }
        Ok(MarshalledString { pointer, length })
    }

    /// Passes `text` to `f` as a `(pointer, length)` pair, releasing the
    /// buffer once `f` returns, whether or not it succeeded.  If `f` trapped
    /// the buffer only leaves the ledger; the instance is not called again.
    pub fn with_string<S, R, F>(&mut self, mut store: S, text: &str, f: F) -> Result<R>
    where
        S: AsContextMut,
        F: FnOnce(&mut S, u32, u32) -> Result<R>,
    {
        let MarshalledString { pointer, length } = self.pass_string(&mut store, text)?;
        let result = f(&mut store, pointer, length);
        if let Err(e) = &result {
            if e.downcast_ref::<Trap>().is_some() {
                self.disown(pointer)?;
                return result;
            }
        }
        let released = self.deallocate(&mut store, pointer);
        match (result, released) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), released) => {
                if let Err(release_error) = released {
                    warn!(
                        "Buffer {:#x} could not be released after a failed call: {}",
                        pointer, release_error
                    );
                }
                Err(e)
            }
        }
    }
}
