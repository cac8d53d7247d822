//! The syscall shim.
//!
//! The hosted module is built against `wasi_snapshot_preview1`, but there is
//! no operating system behind it: no files, no preopened directories, no
//! terminal.  `SyscallShim` answers the handful of calls the module's runtime
//! actually relies on (arguments, environment, clocks, random bytes and writes
//! to the standard streams), stubs the capability queries the way the module's
//! own fallback logic expects, and provides the cancellation and sleep
//! imports in the `env` module.
//!
//! Every operation takes a `MemoryHandler` so the same code serves the
//! Wasmtime caller and the in-memory buffers used by the tests.  Errors are
//! `ErrNo`s and are handed back to the module; they never reach the host.
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
    cancel::CancellationChannel,
    engines::common::{
        IoVec, MemoryHandler, FDSTAT_SIZE, FILETYPE_CHARACTER_DEVICE, RIGHTS_FD_READ,
        RIGHTS_FD_WRITE,
    },
    error::{ErrNo, ShimResult},
    ClockSource, HostConfig,
};
use log::{debug, trace};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::{
    sync::{Arc, Mutex},
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

////////////////////////////////////////////////////////////////////////////////
// Output routing.
////////////////////////////////////////////////////////////////////////////////

/// Where a piece of module output is headed.  Graphics are tagged explicitly
/// rather than recognised by content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stream {
    Stdout,
    Stderr,
    Graphics,
}

/// Receives decoded module output.  Implemented by the worker (which turns it
/// into protocol messages) and by `CapturedOutput`.
pub trait OutputSink: Send {
    /// Delivers one chunk of text for `stream`.
    fn emit(&mut self, stream: Stream, data: String);
}

/// An `OutputSink` that buffers everything it receives.  Clones share the
/// buffer.
#[derive(Debug, Clone, Default)]
pub struct CapturedOutput(Arc<Mutex<Vec<(Stream, String)>>>);

impl CapturedOutput {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Drains everything captured so far.
    pub fn take(&self) -> Vec<(Stream, String)> {
        match self.0.lock() {
            Ok(mut chunks) => std::mem::take(&mut *chunks),
            Err(_) => Vec::new(),
        }
    }

    /// Concatenates the captured chunks for `stream`, without draining.
    pub fn text(&self, stream: Stream) -> String {
        match self.0.lock() {
            Ok(chunks) => chunks
                .iter()
                .filter(|(s, _)| *s == stream)
                .map(|(_, data)| data.as_str())
                .collect(),
            Err(_) => String::new(),
        }
    }
}

impl OutputSink for CapturedOutput {
    fn emit(&mut self, stream: Stream, data: String) {
        if let Ok(mut chunks) = self.0.lock() {
            chunks.push((stream, data));
        }
    }
}

/// Counters accumulated by the shim between two calls to `take_activity`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Activity {
    /// Stop requests delivered through `check_interrupt`.
    pub interrupts: u32,
    /// Bytes accepted on standard output.
    pub stdout_bytes: u64,
    /// Bytes accepted on standard error.
    pub stderr_bytes: u64,
    /// Bytes of SVG handed to `draw_svg`.
    pub graphics_bytes: u64,
}

////////////////////////////////////////////////////////////////////////////////
// The shim.
////////////////////////////////////////////////////////////////////////////////

/// Standard stream file descriptors.
const STDIN: u32 = 0;
const STDOUT: u32 = 1;
const STDERR: u32 = 2;

/// Clock ids understood by `clock_time_get` and `clock_res_get`.
const CLOCK_REALTIME: u32 = 0;
const CLOCK_THREAD_CPUTIME: u32 = 3;

/// A shim shared between the store and the session that owns it.
pub type SharedSyscallShim = Arc<Mutex<SyscallShim>>;

/// Host implementation of the system-call imports for one module.
pub struct SyscallShim {
    /// Fixed argument list, as given by the host configuration.
    program_arguments: Vec<String>,
    /// Fixed environment, as given by the host configuration.
    environment_variables: Vec<(String, String)>,
    /// Which timer backs the clocks.
    clock: ClockSource,
    /// Origin of the monotonic clocks.
    origin: Instant,
    /// Last value returned per clock id, so values never go backwards.
    last_timestamps: [u64; 4],
    /// Destination of standard stream and graphics output.
    sink: Box<dyn OutputSink>,
    /// Incomplete UTF-8 sequences held back per standard stream.
    pending_stdout: Vec<u8>,
    pending_stderr: Vec<u8>,
    /// Stop and sleep cells shared with the controller.
    cancellation: CancellationChannel,
    /// The exit code, if the module called `proc_exit`.
    exit_code: Option<u32>,
    activity: Activity,
}

impl SyscallShim {
    /// The name of the module's linear memory export.
    pub const LINEAR_MEMORY_NAME: &'static str = "memory";
    /// The name of the containing module for all WASI imports.
    pub const WASI_SNAPSHOT_MODULE_NAME: &'static str = "wasi_snapshot_preview1";
    /// The name of the containing module for the host's own imports.
    pub const HOST_MODULE_NAME: &'static str = "env";

    ////////////////////////////////////////////////////////////////////////////
    // Creating and modifying the shim.
    ////////////////////////////////////////////////////////////////////////////

    /// Creates a shim answering with the arguments and environment of
    /// `config`, sending output to `sink`.
    pub fn new(
        config: &HostConfig,
        sink: Box<dyn OutputSink>,
        cancellation: CancellationChannel,
    ) -> Self {
        Self {
            program_arguments: config.program_arguments.clone(),
            environment_variables: config.environment_variables.clone(),
            clock: config.clock,
            origin: Instant::now(),
            last_timestamps: [0; 4],
            sink,
            pending_stdout: Vec::new(),
            pending_stderr: Vec::new(),
            cancellation,
            exit_code: None,
            activity: Activity::default(),
        }
    }

    /// Convenience constructor for the shared form stored in a `Store`.
    #[inline]
    pub fn shared(
        config: &HostConfig,
        sink: Box<dyn OutputSink>,
        cancellation: CancellationChannel,
    ) -> SharedSyscallShim {
        Arc::new(Mutex::new(Self::new(config, sink, cancellation)))
    }

    /// Forgets per-instance state ahead of a fresh instantiation.  The
    /// clocks keep their high-water marks.
    pub fn reset_instance_state(&mut self) {
        self.exit_code = None;
        self.pending_stdout.clear();
        self.pending_stderr.clear();
        self.activity = Activity::default();
    }

    /// Replaces the cancellation cells, e.g. once the controller shares its
    /// own.
    #[inline]
    pub fn set_cancellation(&mut self, cancellation: CancellationChannel) {
        self.cancellation = cancellation;
    }

    #[inline]
    pub fn cancellation(&self) -> &CancellationChannel {
        &self.cancellation
    }

    /// Return the exit code from a `proc_exit` call.
    #[inline]
    pub fn exit_code(&self) -> Option<u32> {
        self.exit_code
    }

    /// Returns and clears the activity counters.
    #[inline]
    pub fn take_activity(&mut self) -> Activity {
        std::mem::take(&mut self.activity)
    }

    /// Sends text to the sink on behalf of the host rather than the module.
    pub fn emit(&mut self, stream: Stream, data: String) {
        self.sink.emit(stream, data);
    }

    /// Flushes any bytes still held back on the standard streams.
    pub fn flush(&mut self) {
        for (stream, pending) in [
            (Stream::Stdout, &mut self.pending_stdout),
            (Stream::Stderr, &mut self.pending_stderr),
        ] {
            if !pending.is_empty() {
                let text = String::from_utf8_lossy(pending).into_owned();
                pending.clear();
                self.sink.emit(stream, text);
            }
        }
    }

    ////////////////////////////////////////////////////////////////////////////
    // Arguments and environment.
    ////////////////////////////////////////////////////////////////////////////

    fn encoded_arguments(&self) -> Vec<Vec<u8>> {
        self.program_arguments
            .iter()
            .map(|arg| format!("{}\0", arg).into_bytes())
            .collect()
    }

    fn encoded_environment(&self) -> Vec<Vec<u8>> {
        self.environment_variables
            .iter()
            .map(|(key, value)| format!("{}={}\0", key, value).into_bytes())
            .collect()
    }

    /// Writes the count and total byte size of `list`.  Shares the encoding
    /// with the fill call, so the two always agree.
    fn write_list_sizes<T: MemoryHandler>(
        memory_ref: &mut T,
        list: &[Vec<u8>],
        address_for_counts: u32,
        address_for_buffer_size: u32,
    ) -> ShimResult<()> {
        let size: usize = list.iter().map(Vec::len).sum();
        memory_ref.write_u32(address_for_counts, list.len() as u32)?;
        memory_ref.write_u32(address_for_buffer_size, size as u32)
    }

    /// The implementation of the WASI `args_get` function.
    pub fn args_get<T: MemoryHandler>(
        &self,
        memory_ref: &mut T,
        address_for_string_ptrs: u32,
        buf_address: u32,
    ) -> ShimResult<()> {
        memory_ref.write_string_list(
            &self.encoded_arguments(),
            buf_address,
            address_for_string_ptrs,
        )
    }

    /// The implementation of the WASI `args_sizes_get` function.
    pub fn args_sizes_get<T: MemoryHandler>(
        &self,
        memory_ref: &mut T,
        address_for_counts: u32,
        address_for_buffer_size: u32,
    ) -> ShimResult<()> {
        Self::write_list_sizes(
            memory_ref,
            &self.encoded_arguments(),
            address_for_counts,
            address_for_buffer_size,
        )
    }

    /// The implementation of the WASI `environ_get` function.
    pub fn environ_get<T: MemoryHandler>(
        &self,
        memory_ref: &mut T,
        address_for_string_ptrs: u32,
        buf_address: u32,
    ) -> ShimResult<()> {
        memory_ref.write_string_list(
            &self.encoded_environment(),
            buf_address,
            address_for_string_ptrs,
        )
    }

    /// The implementation of the WASI `environ_sizes_get` function.
    pub fn environ_sizes_get<T: MemoryHandler>(
        &self,
        memory_ref: &mut T,
        address_for_counts: u32,
        address_for_buffer_size: u32,
    ) -> ShimResult<()> {
        Self::write_list_sizes(
            memory_ref,
            &self.encoded_environment(),
            address_for_counts,
            address_for_buffer_size,
        )
    }

    ////////////////////////////////////////////////////////////////////////////
    // Clocks.
    ////////////////////////////////////////////////////////////////////////////

    fn wall_clock_nanos(&self) -> u64 {
        let since_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO);
        match self.clock {
            ClockSource::HighResolution => since_epoch.as_nanos() as u64,
            ClockSource::Coarse => since_epoch.as_millis() as u64 * 1_000_000,
        }
    }

    /// Reads clock `clock_id` in nanoseconds, never returning less than the
    /// previous reading of the same clock.
    pub fn now(&mut self, clock_id: u32) -> ShimResult<u64> {
        let raw = match (clock_id, self.clock) {
            (CLOCK_REALTIME, _) => self.wall_clock_nanos(),
            (1..=CLOCK_THREAD_CPUTIME, ClockSource::HighResolution) => {
                self.origin.elapsed().as_nanos() as u64
            }
            (1..=CLOCK_THREAD_CPUTIME, ClockSource::Coarse) => self.wall_clock_nanos(),
            _ => return Err(ErrNo::Inval),
        };
        let last = &mut self.last_timestamps[clock_id as usize];
        *last = (*last).max(raw);
        Ok(*last)
    }

    /// The implementation of the WASI `clock_res_get` function.
    pub fn clock_res_get<T: MemoryHandler>(
        &self,
        memory_ref: &mut T,
        clock_id: u32,
        address: u32,
    ) -> ShimResult<()> {
        if clock_id > CLOCK_THREAD_CPUTIME {
            return Err(ErrNo::Inval);
        }
        let resolution = match self.clock {
            ClockSource::HighResolution => 1_000,
            ClockSource::Coarse => 1_000_000,
        };
        memory_ref.write_u64(address, resolution)
    }

    /// The implementation of the WASI `clock_time_get` function.  The
    /// requested precision is ignored.
    pub fn clock_time_get<T: MemoryHandler>(
        &mut self,
        memory_ref: &mut T,
        clock_id: u32,
        _precision: u64,
        address: u32,
    ) -> ShimResult<()> {
        let timestamp = self.now(clock_id)?;
        memory_ref.write_u64(address, timestamp)
    }

    ////////////////////////////////////////////////////////////////////////////
    // Standard streams.
    ////////////////////////////////////////////////////////////////////////////

    /// The implementation of the WASI `fd_write` function.  Only standard
    /// output and standard error are writable.  The bytes of every buffer are
    /// gathered, decoded as UTF-8 and forwarded to the sink; the total is
    /// written to `address`.
    pub fn fd_write<T: MemoryHandler>(
        &mut self,
        memory_ref: &mut T,
        fd: u32,
        iovec_base: u32,
        iovec_count: u32,
        address: u32,
    ) -> ShimResult<()> {
        let stream = match fd {
            STDOUT => Stream::Stdout,
            STDERR => Stream::Stderr,
            _ => return Err(ErrNo::BadF),
        };
        let iovecs = memory_ref.unpack_array::<IoVec>(iovec_base, iovec_count)?;
        let bufs = memory_ref.read_iovec_scattered(&iovecs)?;
        let total: usize = bufs.iter().map(Vec::len).sum();

        let pending = match stream {
            Stream::Stdout => &mut self.pending_stdout,
            _ => &mut self.pending_stderr,
        };
        for buf in &bufs {
            pending.extend_from_slice(buf);
        }
        let text = decode_utf8_prefix(pending);
        if !text.is_empty() {
            self.sink.emit(stream, text);
        }
        match stream {
            Stream::Stdout => self.activity.stdout_bytes += total as u64,
            _ => self.activity.stderr_bytes += total as u64,
        }

        memory_ref.write_u32(address, total as u32)
    }

    /// The implementation of the WASI `fd_read` function.  Standard input is
    /// always at end of file.
    pub fn fd_read<T: MemoryHandler>(
        &mut self,
        memory_ref: &mut T,
        fd: u32,
        _iovec_base: u32,
        _iovec_count: u32,
        address: u32,
    ) -> ShimResult<()> {
        if fd != STDIN {
            return Err(ErrNo::BadF);
        }
        memory_ref.write_u32(address, 0)
    }

    /// The implementation of the WASI `fd_seek` function.  The standard
    /// streams are unseekable but report offset zero rather than failing.
    pub fn fd_seek<T: MemoryHandler>(
        &mut self,
        memory_ref: &mut T,
        fd: u32,
        _offset: i64,
        _whence: u8,
        address: u32,
    ) -> ShimResult<()> {
        if fd > STDERR {
            return Err(ErrNo::BadF);
        }
        memory_ref.write_u64(address, 0)
    }

    /// The implementation of the WASI `fd_close` function.
    pub fn fd_close(&mut self, fd: u32) -> ShimResult<()> {
        if fd > STDERR {
            return Err(ErrNo::BadF);
        }
        self.flush();
        Ok(())
    }

    /// The implementation of the WASI `fd_fdstat_get` function.  The standard
    /// streams are character devices that can be read and written, which is
    /// what the module's terminal detection looks for.
    pub fn fd_fdstat_get<T: MemoryHandler>(
        &self,
        memory_ref: &mut T,
        fd: u32,
        address: u32,
    ) -> ShimResult<()> {
        if fd > STDERR {
            return Err(ErrNo::BadF);
        }
        let rights = RIGHTS_FD_READ | RIGHTS_FD_WRITE;
        let mut fdstat = [0u8; FDSTAT_SIZE];
        fdstat[0] = FILETYPE_CHARACTER_DEVICE;
        fdstat[8..16].copy_from_slice(&rights.to_le_bytes());
        fdstat[16..24].copy_from_slice(&rights.to_le_bytes());
        memory_ref.write_buffer(address, &fdstat)
    }

    /// The implementation of the WASI `fd_prestat_get` function.  There are
    /// no preopened directories; `BadF` ends the runtime's preopen scan.
    #[inline]
    pub fn fd_prestat_get(&self, _fd: u32) -> ShimResult<()> {
        Err(ErrNo::BadF)
    }

    /// The implementation of the WASI `fd_prestat_dir_name` function.
    #[inline]
    pub fn fd_prestat_dir_name(&self, _fd: u32) -> ShimResult<()> {
        Err(ErrNo::BadF)
    }

    /// The implementation of the WASI `fd_filestat_get` function.
    #[inline]
    pub fn fd_filestat_get(&self, fd: u32) -> ShimResult<()> {
        if fd > STDERR {
            return Err(ErrNo::BadF);
        }
        Err(ErrNo::NoSys)
    }

    /// The implementation of the WASI `path_open` function.
    #[inline]
    pub fn path_open(&self) -> ShimResult<()> {
        Err(ErrNo::NoSys)
    }

    /// The implementation of the WASI `path_filestat_get` function.
    #[inline]
    pub fn path_filestat_get(&self) -> ShimResult<()> {
        Err(ErrNo::NoSys)
    }

    /// The implementation of the WASI `poll_oneoff` function.  Blocking
    /// belongs to the cooperative `sleep` import instead.
    #[inline]
    pub fn poll_oneoff(&self) -> ShimResult<()> {
        Err(ErrNo::NoSys)
    }

    /// The implementation of the WASI `sched_yield` function.
    pub fn sched_yield(&self) -> ShimResult<()> {
        std::thread::yield_now();
        Ok(())
    }

    ////////////////////////////////////////////////////////////////////////////
    // Randomness and process control.
    ////////////////////////////////////////////////////////////////////////////

    /// The implementation of the WASI `random_get` function.
    pub fn random_get<T: MemoryHandler>(
        &mut self,
        memory_ref: &mut T,
        buf_ptr: u32,
        length: u32,
    ) -> ShimResult<()> {
        let mut bytes = vec![0; length as usize];
        rand::thread_rng().fill_bytes(&mut bytes);
        memory_ref.write_buffer(buf_ptr, &bytes)
    }

    /// The implementation of the WASI `proc_exit` function.  Only records the
    /// code; the engine turns the call into a trap.
    #[inline]
    pub fn proc_exit(&mut self, exit_code: u32) {
        debug!("Module called proc_exit({}).", exit_code);
        self.flush();
        self.exit_code = Some(exit_code)
    }

    ////////////////////////////////////////////////////////////////////////////
    // Host imports.
    ////////////////////////////////////////////////////////////////////////////

    /// The interrupt check.  Returns 1 once per stop request.
    pub fn check_interrupt(&mut self) -> i32 {
        let stop = self.cancellation.take_stop();
        if stop != 0 {
            trace!("Interrupt delivered to module.");
            self.activity.interrupts += 1;
        }
        stop
    }

    /// Cooperative sleep for up to `milliseconds` on `cancellation`, cut
    /// short by a stop request.  The stop itself stays pending for
    /// `check_interrupt`.
    pub fn sleep(cancellation: &CancellationChannel, milliseconds: u32) -> bool {
        cancellation.sleep(Duration::from_millis(u64::from(milliseconds)))
    }

    /// Relays an SVG drawing produced by the module.
    pub fn draw_svg<T: MemoryHandler>(
        &mut self,
        memory_ref: &mut T,
        address: u32,
        length: u32,
    ) -> ShimResult<()> {
        let svg = memory_ref.read_cstring(address, length)?;
        self.activity.graphics_bytes += u64::from(length);
        self.sink.emit(Stream::Graphics, svg);
        Ok(())
    }

    /// Keyboard polling.  This host has no keyboard, so there is never an
    /// event to report.
    #[inline]
    pub fn get_key_event(&self, _address: u32, _length: u32, _mods_address: u32) -> u32 {
        0
    }
}

/// Decodes as much of `pending` as forms complete UTF-8, leaving a trailing
/// partial sequence in place for the next write.  Invalid bytes are replaced.
fn decode_utf8_prefix(pending: &mut Vec<u8>) -> String {
    let mut text = String::new();
    loop {
        match std::str::from_utf8(pending) {
            Ok(valid) => {
                text.push_str(valid);
                pending.clear();
                return text;
            }
            Err(error) => {
                let valid_up_to = error.valid_up_to();
                text.push_str(&String::from_utf8_lossy(&pending[..valid_up_to]));
                match error.error_len() {
                    Some(invalid) => {
                        text.push(char::REPLACEMENT_CHARACTER);
                        pending.drain(..valid_up_to + invalid);
                    }
                    None => {
                        pending.drain(..valid_up_to);
                        return text;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::TryInto;

    /// A flat byte array standing in for linear memory.
    impl MemoryHandler for Vec<u8> {
        fn write_buffer(&mut self, address: u32, buffer: &[u8]) -> ShimResult<()> {
            let start = address as usize;
            let end = start + buffer.len();
            self.get_mut(start..end)
                .ok_or(ErrNo::Fault)?
                .copy_from_slice(buffer);
            Ok(())
        }

        fn read_buffer(&mut self, address: u32, length: u32) -> ShimResult<Vec<u8>> {
            let start = address as usize;
            let end = start + length as usize;
            Ok(self.get(start..end).ok_or(ErrNo::Fault)?.to_vec())
        }
    }

    fn shim_with(config: HostConfig) -> (SyscallShim, CapturedOutput, CancellationChannel) {
        let output = CapturedOutput::new();
        let cancellation = CancellationChannel::new();
        let shim = SyscallShim::new(&config, Box::new(output.clone()), cancellation.clone());
        (shim, output, cancellation)
    }

    fn shim() -> (SyscallShim, CapturedOutput, CancellationChannel) {
        shim_with(HostConfig::default())
    }

    fn read_u64(memory: &mut Vec<u8>, address: u32) -> u64 {
        let bytes = memory.read_buffer(address, 8).unwrap();
        u64::from_le_bytes(bytes.try_into().unwrap())
    }

    #[test]
    fn environ_sizes_agree_with_fill() {
        let config = HostConfig::default()
            .with_environment_variables(Vec::new())
            .with_environment_variable("RUST_BACKTRACE", "1")
            .with_environment_variable("LANG", "C.UTF-8");
        let (shim, _, _) = shim_with(config);
        let mut memory = vec![0u8; 256];

        shim.environ_sizes_get(&mut memory, 0, 4).unwrap();
        let count = memory.read_u32(0).unwrap();
        let size = memory.read_u32(4).unwrap();
        assert_eq!(count, 2);
        assert_eq!(size, 30);

        shim.environ_get(&mut memory, 16, 64).unwrap();
        assert_eq!(
            memory.read_buffer(64, size).unwrap(),
            b"RUST_BACKTRACE=1\0LANG=C.UTF-8\0".to_vec()
        );
        assert_eq!(memory.read_u32(16).unwrap(), 64);
        assert_eq!(memory.read_u32(20).unwrap(), 81);
        // Nothing past the reported size was touched.
        assert_eq!(memory[64 + size as usize], 0);
    }

    #[test]
    fn args_use_fixed_host_list() {
        let (shim, _, _) = shim();
        let mut memory = vec![0u8; 128];
        shim.args_sizes_get(&mut memory, 0, 4).unwrap();
        assert_eq!(memory.read_u32(0).unwrap(), 1);
        assert_eq!(memory.read_u32(4).unwrap(), 7);
        shim.args_get(&mut memory, 8, 32).unwrap();
        assert_eq!(memory.read_u32(8).unwrap(), 32);
        assert_eq!(memory.read_buffer(32, 7).unwrap(), b"sgleam\0".to_vec());
    }

    #[test]
    fn fd_write_gathers_iovecs() {
        let (mut shim, output, _) = shim();
        let mut memory = vec![0u8; 128];
        memory.write_buffer(64, b"3").unwrap();
        memory.write_buffer(80, b"\n").unwrap();
        // Two iovecs at 0: (64, 1) and (80, 1).
        memory.write_u32(0, 64).unwrap();
        memory.write_u32(4, 1).unwrap();
        memory.write_u32(8, 80).unwrap();
        memory.write_u32(12, 1).unwrap();

        shim.fd_write(&mut memory, 1, 0, 2, 32).unwrap();
        assert_eq!(memory.read_u32(32).unwrap(), 2);
        assert_eq!(output.take(), vec![(Stream::Stdout, "3\n".to_string())]);
        assert_eq!(shim.take_activity().stdout_bytes, 2);
    }

    #[test]
    fn fd_write_rejects_other_descriptors() {
        let (mut shim, output, _) = shim();
        let mut memory = vec![0u8; 64];
        assert_eq!(shim.fd_write(&mut memory, 3, 0, 0, 32), Err(ErrNo::BadF));
        assert_eq!(shim.fd_write(&mut memory, 0, 0, 0, 32), Err(ErrNo::BadF));
        assert!(output.take().is_empty());
    }

    #[test]
    fn fd_write_holds_back_split_utf8() {
        let (mut shim, output, _) = shim();
        let mut memory = vec![0u8; 128];
        let snowman = "☃".as_bytes();
        memory.write_buffer(64, &snowman[..1]).unwrap();
        memory.write_buffer(80, &snowman[1..]).unwrap();
        memory.write_u32(0, 64).unwrap();
        memory.write_u32(4, 1).unwrap();
        memory.write_u32(8, 80).unwrap();
        memory.write_u32(12, 2).unwrap();

        shim.fd_write(&mut memory, 2, 0, 1, 32).unwrap();
        assert!(output.take().is_empty());
        shim.fd_write(&mut memory, 2, 8, 1, 32).unwrap();
        assert_eq!(output.take(), vec![(Stream::Stderr, "☃".to_string())]);
    }

    #[test]
    fn clocks_are_monotonic_and_reject_unknown_ids() {
        let (mut shim, _, _) = shim();
        let mut memory = vec![0u8; 64];
        shim.clock_time_get(&mut memory, 1, 0, 0).unwrap();
        let first = read_u64(&mut memory, 0);
        shim.clock_time_get(&mut memory, 1, 0, 8).unwrap();
        assert!(read_u64(&mut memory, 8) >= first);
        shim.clock_time_get(&mut memory, 0, 0, 16).unwrap();
        assert!(read_u64(&mut memory, 16) > 1_500_000_000 * 1_000_000_000);
        assert_eq!(shim.clock_time_get(&mut memory, 7, 0, 0), Err(ErrNo::Inval));
        assert_eq!(shim.clock_res_get(&mut memory, 9, 0), Err(ErrNo::Inval));
    }

    #[test]
    fn coarse_clock_has_millisecond_granularity() {
        let (mut shim, _, _) = shim_with(HostConfig::default().with_clock(ClockSource::Coarse));
        let mut memory = vec![0u8; 64];
        shim.clock_time_get(&mut memory, 1, 0, 0).unwrap();
        assert_eq!(read_u64(&mut memory, 0) % 1_000_000, 0);
        shim.clock_res_get(&mut memory, 1, 8).unwrap();
        assert_eq!(read_u64(&mut memory, 8), 1_000_000);
    }

    #[test]
    fn filesystem_queries_follow_stub_policy() {
        let (mut shim, _, _) = shim();
        let mut memory = vec![0u8; 64];
        assert_eq!(shim.fd_prestat_get(3), Err(ErrNo::BadF));
        assert_eq!(shim.path_open(), Err(ErrNo::NoSys));
        assert_eq!(shim.fd_close(1), Ok(()));
        assert_eq!(shim.fd_close(5), Err(ErrNo::BadF));
        assert_eq!(shim.fd_seek(&mut memory, 1, 0, 0, 0), Ok(()));
        assert_eq!(shim.fd_read(&mut memory, 0, 0, 0, 8), Ok(()));
        assert_eq!(memory.read_u32(8).unwrap(), 0);

        shim.fd_fdstat_get(&mut memory, 1, 16).unwrap();
        assert_eq!(memory[16], FILETYPE_CHARACTER_DEVICE);
        assert_eq!(shim.fd_fdstat_get(&mut memory, 4, 16), Err(ErrNo::BadF));
    }

    #[test]
    fn random_get_fills_requested_range_only() {
        let (mut shim, _, _) = shim();
        let mut memory = vec![0u8; 64];
        shim.random_get(&mut memory, 8, 32).unwrap();
        assert!(memory[..8].iter().all(|b| *b == 0));
        assert!(memory[40..].iter().all(|b| *b == 0));
        assert!(shim.random_get(&mut memory, 60, 32).is_err());
    }

    #[test]
    fn interrupt_check_counts_deliveries() {
        let (mut shim, _, cancellation) = shim();
        assert_eq!(shim.check_interrupt(), 0);
        cancellation.request_stop();
        assert_eq!(shim.check_interrupt(), 1);
        assert_eq!(shim.check_interrupt(), 0);
        assert_eq!(shim.take_activity().interrupts, 1);
    }

    #[test]
    fn sleep_ends_early_on_a_pending_stop() {
        let (shim, _, cancellation) = shim();
        assert!(!SyscallShim::sleep(shim.cancellation(), 10));
        cancellation.request_stop();
        let started = std::time::Instant::now();
        assert!(SyscallShim::sleep(shim.cancellation(), 10_000));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(cancellation.take_stop(), 1);
    }

    #[test]
    fn draw_svg_is_tagged_as_graphics() {
        let (mut shim, output, _) = shim();
        let mut memory = vec![0u8; 64];
        memory.write_buffer(0, b"<svg/>").unwrap();
        shim.draw_svg(&mut memory, 0, 6).unwrap();
        assert_eq!(output.text(Stream::Graphics), "<svg/>");
        assert_eq!(shim.get_key_event(0, 0, 0), 0);
    }
}
