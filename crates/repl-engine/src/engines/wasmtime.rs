//! Wasmtime bindings for the syscall shim.
//!
//! Every import the host provides is registered on a `Linker` whose store data
//! is the shared `SyscallShim`.  Each host function clones the shim handle out
//! of the caller, locks it, and passes the caller itself along as the
//! `MemoryHandler`.
//!
//! ## Authors
//!
//! The Veracruz Development Team.
//!
//! ## Copyright
//!
//! See the file `LICENSE.md` in the Veracruz root directory for licensing
//! and copyright information.

#![allow(clippy::too_many_arguments)]

use crate::{
    engines::common::{HostAPIName, MemoryHandler, WasiAPIName},
    error::{EngineError, ErrNo, ShimResult},
    shim::{SharedSyscallShim, SyscallShim},
};
use anyhow::{anyhow, Result};
use log::{info, warn};
use std::{convert::TryFrom, str::FromStr, vec::Vec};
use wasmtime::{
    Caller, Config, Engine, ExternType, FuncType, Linker, Memory, Module, Val, ValType,
};

////////////////////////////////////////////////////////////////////////////////
// The Wasmtime runtime state.
////////////////////////////////////////////////////////////////////////////////

type CallerWrapper<'a> = Caller<'a, SharedSyscallShim>;

/// A macro for lock and return the shim.
/// If the locks fails, it returns Busy error code.
macro_rules! lock_shim {
    ($var:ident) => {
        match $var.lock() {
            Ok(v) => v,
            Err(_) => return ErrNo::Busy as u32,
        }
    };
}

/// A macro to call try_from on a untyped raw wasi parameter `$var`.
/// It converts `$var` to the typed version, `$t`, of the parameter as a value,
/// or returns from the function with the `Inval` error code.
macro_rules! convert_wasi_arg {
    ($var:ident, $t:ty) => {
        match <$t>::try_from($var) {
            Err(_) => return ErrNo::Inval as u32,
            Ok(o) => o,
        }
    };
}

/// Looks up the linear memory export afresh.  Never cached: the module may
/// have grown (and so moved) its memory since the last access.
fn linear_memory<T>(caller: &mut Caller<'_, T>) -> ShimResult<Memory> {
    caller
        .get_export(SyscallShim::LINEAR_MEMORY_NAME)
        .and_then(|export| export.into_memory())
        .ok_or(ErrNo::Fault)
}

/// Impl the MemoryHandler for Caller.
/// This allows passing the Caller to SyscallShim on any host call.
impl<'a, T> MemoryHandler for Caller<'a, T> {
    fn write_buffer(&mut self, address: u32, buffer: &[u8]) -> ShimResult<()> {
        let memory = linear_memory(self)?;
        memory
            .write(&mut *self, address as usize, buffer)
            .map_err(|_| ErrNo::Fault)
    }

    fn read_buffer(&mut self, address: u32, length: u32) -> ShimResult<Vec<u8>> {
        let memory = linear_memory(self)?;
        let mut bytes = vec![0; length as usize];
        memory
            .read(&*self, address as usize, &mut bytes)
            .map_err(|_| ErrNo::Fault)?;
        Ok(bytes)
    }
}

////////////////////////////////////////////////////////////////////////////////
// Checking function well-formedness.
////////////////////////////////////////////////////////////////////////////////

/// Details the arguments the module's deallocator expects, if one is found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeallocSignature {
    /// `string_deallocate` is not exported, or has an unrecognised type.
    NoDeallocFound,
    /// `string_deallocate(ptr)`.
    PointerOnly,
    /// `string_deallocate(ptr, len)`.
    PointerAndLength,
}

/// Checks whether the deallocator was declared with or without a length.
pub fn check_deallocate(tau: &ExternType) -> DeallocSignature {
    match tau {
        ExternType::Func(tau) => {
            let params: Vec<ValType> = tau.params().collect();
            let returns_nothing = tau.results().len() == 0;

            match params.as_slice() {
                [ValType::I32] if returns_nothing => DeallocSignature::PointerOnly,
                [ValType::I32, ValType::I32] if returns_nothing => {
                    DeallocSignature::PointerAndLength
                }
                _ => DeallocSignature::NoDeallocFound,
            }
        }
        _otherwise => DeallocSignature::NoDeallocFound,
    }
}

/// Builds an `Engine` with the configuration every REPL module is run under.
pub fn new_engine() -> Result<Engine> {
    let mut config = Config::default();
    config.wasm_simd(true);
    config.wasm_bulk_memory(true);
    let engine = Engine::new(&config)?;
    info!("Initialized Wasmtime engine.");
    Ok(engine)
}

/// A zero of each result type, with the first i32 result set to `NoSys`.
fn not_implemented_results(ty: &FuncType, results: &mut [Val]) {
    let mut reported = false;
    for (slot, tau) in results.iter_mut().zip(ty.results()) {
        *slot = match tau {
            ValType::I32 if !reported => {
                reported = true;
                Val::I32(ErrNo::NoSys as i32)
            }
            ValType::I64 => Val::I64(0),
            ValType::F32 => Val::F32(0),
            ValType::F64 => Val::F64(0),
            _ => Val::I32(0),
        };
    }
}

////////////////////////////////////////////////////////////////////////////////
// Linking the shim.
////////////////////////////////////////////////////////////////////////////////

/// Host functions for the Wasmtime runtime.
pub struct WasmtimeHost;

impl WasmtimeHost {
    /// Creates a linker that satisfies every import `module` declares.
    ///
    /// WASI imports the shim does not implement by name are linked to a stub
    /// returning `NoSys`.  Any other unknown import is an error: the module
    /// expects a capability this host cannot provide.
    pub fn link(engine: &Engine, module: &Module) -> Result<Linker<SharedSyscallShim>> {
        let mut linker = Linker::new(engine);

        // Link all WASI functions
        let wasi_scope = SyscallShim::WASI_SNAPSHOT_MODULE_NAME;
        linker.func_wrap(wasi_scope, WasiAPIName::ARGS_GET.into(), Self::wasi_args_get)?;
        linker.func_wrap(
            wasi_scope,
            WasiAPIName::ARGS_SIZES_GET.into(),
            Self::wasi_args_sizes_get,
        )?;
        linker.func_wrap(
            wasi_scope,
            WasiAPIName::ENVIRON_GET.into(),
            Self::wasi_environ_get,
        )?;
        linker.func_wrap(
            wasi_scope,
            WasiAPIName::ENVIRON_SIZES_GET.into(),
            Self::wasi_environ_sizes_get,
        )?;
        linker.func_wrap(
            wasi_scope,
            WasiAPIName::CLOCK_RES_GET.into(),
            Self::wasi_clock_res_get,
        )?;
        linker.func_wrap(
            wasi_scope,
            WasiAPIName::CLOCK_TIME_GET.into(),
            Self::wasi_clock_time_get,
        )?;
        linker.func_wrap(wasi_scope, WasiAPIName::FD_CLOSE.into(), Self::wasi_fd_close)?;
        linker.func_wrap(
            wasi_scope,
            WasiAPIName::FD_FDSTAT_GET.into(),
            Self::wasi_fd_fdstat_get,
        )?;
        linker.func_wrap(
            wasi_scope,
            WasiAPIName::FD_FILESTAT_GET.into(),
            Self::wasi_fd_filestat_get,
        )?;
        linker.func_wrap(
            wasi_scope,
            WasiAPIName::FD_PRESTAT_GET.into(),
            Self::wasi_fd_prestat_get,
        )?;
        linker.func_wrap(
            wasi_scope,
            WasiAPIName::FD_PRESTAT_DIR_NAME.into(),
            Self::wasi_fd_prestat_dir_name,
        )?;
        linker.func_wrap(wasi_scope, WasiAPIName::FD_READ.into(), Self::wasi_fd_read)?;
        linker.func_wrap(wasi_scope, WasiAPIName::FD_SEEK.into(), Self::wasi_fd_seek)?;
        linker.func_wrap(wasi_scope, WasiAPIName::FD_WRITE.into(), Self::wasi_fd_write)?;
        linker.func_wrap(
            wasi_scope,
            WasiAPIName::PATH_FILESTAT_GET.into(),
            Self::wasi_path_filestat_get,
        )?;
        linker.func_wrap(wasi_scope, WasiAPIName::PATH_OPEN.into(), Self::wasi_path_open)?;
        linker.func_wrap(
            wasi_scope,
            WasiAPIName::POLL_ONEOFF.into(),
            Self::wasi_poll_oneoff,
        )?;
        linker.func_wrap(wasi_scope, WasiAPIName::PROC_EXIT.into(), Self::wasi_proc_exit)?;
        linker.func_wrap(
            wasi_scope,
            WasiAPIName::SCHED_YIELD.into(),
            Self::wasi_sched_yield,
        )?;
        linker.func_wrap(
            wasi_scope,
            WasiAPIName::RANDOM_GET.into(),
            Self::wasi_random_get,
        )?;

        // Link the host's own functions
        let host_scope = SyscallShim::HOST_MODULE_NAME;
        linker.func_wrap(
            host_scope,
            HostAPIName::CHECK_INTERRUPT.into(),
            Self::host_check_interrupt,
        )?;
        linker.func_wrap(
            host_scope,
            HostAPIName::IMPORT_CHECK_INTERRUPT.into(),
            Self::host_check_interrupt,
        )?;
        linker.func_wrap(host_scope, HostAPIName::SLEEP.into(), Self::host_sleep)?;
        linker.func_wrap(host_scope, HostAPIName::DRAW_SVG.into(), Self::host_draw_svg)?;
        linker.func_wrap(
            host_scope,
            HostAPIName::GET_KEY_EVENT.into(),
            Self::host_get_key_event,
        )?;

        Self::link_unknown_imports(&mut linker, module)?;

        info!("Link external functions.");
        Ok(linker)
    }

    /// Stubs out WASI imports the shim has no name for, and rejects imports
    /// from any other module.
    fn link_unknown_imports(
        linker: &mut Linker<SharedSyscallShim>,
        module: &Module,
    ) -> Result<()> {
        for import in module.imports() {
            let (scope, name) = (import.module(), import.name());
            let known = match scope {
                SyscallShim::WASI_SNAPSHOT_MODULE_NAME => WasiAPIName::from_str(name).is_ok(),
                SyscallShim::HOST_MODULE_NAME => HostAPIName::from_str(name).is_ok(),
                _ => false,
            };
            if known {
                continue;
            }
            match (scope, import.ty()) {
                (SyscallShim::WASI_SNAPSHOT_MODULE_NAME, ExternType::Func(ty)) => {
                    warn!("WASI import '{}' is not implemented; linking a stub.", name);
                    let stub_ty = ty.clone();
                    linker.func_new(scope, name, ty, move |_caller, _params, results| {
                        not_implemented_results(&stub_ty, results);
                        Ok(())
                    })?;
                }
                _ => {
                    return Err(anyhow!(EngineError::UnknownHostFunction {
                        module: scope.to_string(),
                        name: name.to_string(),
                    }))
                }
            }
        }
        Ok(())
    }

    fn convert_to_errno(input: ShimResult<()>) -> u32 {
        let errno = match input {
            Ok(_) => ErrNo::Success,
            Err(e) => e,
        };
        errno as u32
    }

    fn wasi_args_get(
        mut caller: CallerWrapper<'_>,
        string_ptr_address: u32,
        buf_address: u32,
    ) -> u32 {
        let caller_data = caller.data().clone();
        let shim = lock_shim!(caller_data);
        Self::convert_to_errno(shim.args_get(&mut caller, string_ptr_address, buf_address))
    }

    fn wasi_args_sizes_get(
        mut caller: CallerWrapper<'_>,
        count_address: u32,
        size_address: u32,
    ) -> u32 {
        let caller_data = caller.data().clone();
        let shim = lock_shim!(caller_data);
        Self::convert_to_errno(shim.args_sizes_get(&mut caller, count_address, size_address))
    }

    fn wasi_environ_get(
        mut caller: CallerWrapper<'_>,
        string_ptr_address: u32,
        buf_address: u32,
    ) -> u32 {
        let caller_data = caller.data().clone();
        let shim = lock_shim!(caller_data);
        Self::convert_to_errno(shim.environ_get(&mut caller, string_ptr_address, buf_address))
    }

    fn wasi_environ_sizes_get(
        mut caller: CallerWrapper<'_>,
        environc_address: u32,
        environ_buf_size_address: u32,
    ) -> u32 {
        let caller_data = caller.data().clone();
        let shim = lock_shim!(caller_data);
        Self::convert_to_errno(shim.environ_sizes_get(
            &mut caller,
            environc_address,
            environ_buf_size_address,
        ))
    }

    fn wasi_clock_res_get(mut caller: CallerWrapper<'_>, clock_id: u32, address: u32) -> u32 {
        let caller_data = caller.data().clone();
        let shim = lock_shim!(caller_data);
        Self::convert_to_errno(shim.clock_res_get(&mut caller, clock_id, address))
    }

    fn wasi_clock_time_get(
        mut caller: CallerWrapper<'_>,
        clock_id: u32,
        precision: u64,
        address: u32,
    ) -> u32 {
        let caller_data = caller.data().clone();
        let mut shim = lock_shim!(caller_data);
        Self::convert_to_errno(shim.clock_time_get(&mut caller, clock_id, precision, address))
    }

    fn wasi_fd_close(caller: CallerWrapper<'_>, fd: u32) -> u32 {
        let caller_data = caller.data().clone();
        let mut shim = lock_shim!(caller_data);
        Self::convert_to_errno(shim.fd_close(fd))
    }

    fn wasi_fd_fdstat_get(mut caller: CallerWrapper<'_>, fd: u32, address: u32) -> u32 {
        let caller_data = caller.data().clone();
        let shim = lock_shim!(caller_data);
        Self::convert_to_errno(shim.fd_fdstat_get(&mut caller, fd, address))
    }

    fn wasi_fd_filestat_get(caller: CallerWrapper<'_>, fd: u32, _address: u32) -> u32 {
        let caller_data = caller.data().clone();
        let shim = lock_shim!(caller_data);
        Self::convert_to_errno(shim.fd_filestat_get(fd))
    }

    fn wasi_fd_prestat_get(caller: CallerWrapper<'_>, fd: u32, _address: u32) -> u32 {
        let caller_data = caller.data().clone();
        let shim = lock_shim!(caller_data);
        Self::convert_to_errno(shim.fd_prestat_get(fd))
    }

    fn wasi_fd_prestat_dir_name(
        caller: CallerWrapper<'_>,
        fd: u32,
        _address: u32,
        _size: u32,
    ) -> u32 {
        let caller_data = caller.data().clone();
        let shim = lock_shim!(caller_data);
        Self::convert_to_errno(shim.fd_prestat_dir_name(fd))
    }

    fn wasi_fd_read(
        mut caller: CallerWrapper<'_>,
        fd: u32,
        iovec_base: u32,
        iovec_count: u32,
        address: u32,
    ) -> u32 {
        let caller_data = caller.data().clone();
        let mut shim = lock_shim!(caller_data);
        Self::convert_to_errno(shim.fd_read(&mut caller, fd, iovec_base, iovec_count, address))
    }

    fn wasi_fd_seek(
        mut caller: CallerWrapper<'_>,
        fd: u32,
        offset: i64,
        whence: u32,
        address: u32,
    ) -> u32 {
        let whence = convert_wasi_arg!(whence, u8);
        let caller_data = caller.data().clone();
        let mut shim = lock_shim!(caller_data);
        Self::convert_to_errno(shim.fd_seek(&mut caller, fd, offset, whence, address))
    }

    fn wasi_fd_write(
        mut caller: CallerWrapper<'_>,
        fd: u32,
        iovec_base: u32,
        iovec_count: u32,
        address: u32,
    ) -> u32 {
        let caller_data = caller.data().clone();
        let mut shim = lock_shim!(caller_data);
        Self::convert_to_errno(shim.fd_write(&mut caller, fd, iovec_base, iovec_count, address))
    }

    fn wasi_path_filestat_get(
        caller: CallerWrapper<'_>,
        _fd: u32,
        _flags: u32,
        _path_address: u32,
        _path_length: u32,
        _address: u32,
    ) -> u32 {
        let caller_data = caller.data().clone();
        let shim = lock_shim!(caller_data);
        Self::convert_to_errno(shim.path_filestat_get())
    }

    fn wasi_path_open(
        caller: CallerWrapper<'_>,
        _fd: u32,
        _dir_flags: u32,
        _path_address: u32,
        _path_length: u32,
        _oflags: u32,
        _fs_rights_base: u64,
        _fs_rights_inheriting: u64,
        _fd_flags: u32,
        _address: u32,
    ) -> u32 {
        let caller_data = caller.data().clone();
        let shim = lock_shim!(caller_data);
        Self::convert_to_errno(shim.path_open())
    }

    fn wasi_poll_oneoff(
        caller: CallerWrapper<'_>,
        _subscriptions: u32,
        _events: u32,
        _size: u32,
        _address: u32,
    ) -> u32 {
        let caller_data = caller.data().clone();
        let shim = lock_shim!(caller_data);
        Self::convert_to_errno(shim.poll_oneoff())
    }

    /// Records the exit code and unwinds the module with a trap.
    fn wasi_proc_exit(caller: CallerWrapper<'_>, exit_code: u32) -> Result<()> {
        let caller_data = caller.data().clone();
        let mut shim = caller_data
            .lock()
            .map_err(|_| anyhow!(EngineError::FailedLockShim))?;
        shim.proc_exit(exit_code);
        Err(anyhow!("module exited with code {}", exit_code))
    }

    fn wasi_sched_yield(caller: CallerWrapper<'_>) -> u32 {
        let caller_data = caller.data().clone();
        let shim = lock_shim!(caller_data);
        Self::convert_to_errno(shim.sched_yield())
    }

    fn wasi_random_get(mut caller: CallerWrapper<'_>, address: u32, length: u32) -> u32 {
        let caller_data = caller.data().clone();
        let mut shim = lock_shim!(caller_data);
        Self::convert_to_errno(shim.random_get(&mut caller, address, length))
    }

    fn host_check_interrupt(caller: CallerWrapper<'_>) -> u32 {
        let caller_data = caller.data().clone();
        let mut shim = match caller_data.lock() {
            Ok(v) => v,
            Err(_) => return 0,
        };
        shim.check_interrupt() as u32
    }

    /// Sleeps without holding the shim lock.
    fn host_sleep(caller: CallerWrapper<'_>, milliseconds: u32) {
        let caller_data = caller.data().clone();
        let cancellation = match caller_data.lock() {
            Ok(shim) => shim.cancellation().clone(),
            Err(_) => return,
        };
        SyscallShim::sleep(&cancellation, milliseconds);
    }

    fn host_draw_svg(mut caller: CallerWrapper<'_>, address: u32, length: u32) {
        let caller_data = caller.data().clone();
        let mut shim = match caller_data.lock() {
            Ok(v) => v,
            Err(_) => return,
        };
        if let Err(errno) = shim.draw_svg(&mut caller, address, length) {
            warn!("draw_svg failed: {:?}", errno);
        }
    }

    fn host_get_key_event(
        caller: CallerWrapper<'_>,
        address: u32,
        length: u32,
        mods_address: u32,
    ) -> u32 {
        let caller_data = caller.data().clone();
        let shim = match caller_data.lock() {
            Ok(v) => v,
            Err(_) => return 0,
        };
        shim.get_key_event(address, length, mods_address)
    }
}
