//! Fetching and compiling the REPL module.
//!
//! The binary is several megabytes, so it is streamed in fixed-size chunks
//! and progress is reported through a callback as it arrives.  Progress is a
//! side channel only: callers get either a compiled `Module` or a
//! `LoadFailed` error, never a partial result.
//!
//! ## Authors
//!
//! The Veracruz Development Team.
//!
//! ## Licensing and copyright notice
//!
//! See the `LICENSE.md` file in the Veracruz root directory for
//! information on licensing and copyright.

use crate::error::EngineError;
use anyhow::{anyhow, Result};
use log::{error, info};
use std::{
    fs::File,
    io::{ErrorKind, Read},
    path::PathBuf,
};
use wasmtime::{Engine, Module};

/// Size of each read while streaming the module.
pub const CHUNK_SIZE: usize = 64 * 1024;
/// Most bytes reserved up front from an announced length.
const MAX_PREALLOCATION: u64 = 64 * 1024 * 1024;

/// Where a module is fetched from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModuleSource {
    /// A local file, given as a path or a `file://` URL.
    File(PathBuf),
    /// An `http://` or `https://` URL.
    Http(String),
}

impl ModuleSource {
    pub fn parse(url: &str) -> Self {
        if url.starts_with("http://") || url.starts_with("https://") {
            ModuleSource::Http(url.to_string())
        } else if let Some(path) = url.strip_prefix("file://") {
            ModuleSource::File(PathBuf::from(path))
        } else {
            ModuleSource::File(PathBuf::from(url))
        }
    }
}

/// Turns bytes-received counts into percentages: clamped to `[0, 100]`,
/// strictly increasing, with 100 reported at most once.  Nothing is
/// reported when the total is unknown or zero.
struct ProgressTracker<'a> {
    total: Option<u64>,
    loaded: u64,
    last: f64,
    report: &'a mut dyn FnMut(f64),
}

impl<'a> ProgressTracker<'a> {
    fn new(total: Option<u64>, report: &'a mut dyn FnMut(f64)) -> Self {
        Self {
            total: total.filter(|t| *t > 0),
            loaded: 0,
            last: 0.0,
            report,
        }
    }

    fn advance(&mut self, received: usize) {
        self.loaded += received as u64;
        if let Some(total) = self.total {
            let percent = (self.loaded as f64 / total as f64 * 100.0).min(100.0);
            if percent > self.last {
                self.last = percent;
                (self.report)(percent);
            }
        }
    }
}

/// Fetches and compiles modules for one `Engine`.
pub struct ModuleLoader {
    engine: Engine,
}

impl ModuleLoader {
    #[inline]
    pub fn new(engine: Engine) -> Self {
        Self { engine }
    }

    #[inline]
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Fetches the module at `url` and compiles it.  Every failure, whether
    /// in transport or compilation, is reported as `LoadFailed`.
    pub fn load(&self, url: &str, progress: &mut dyn FnMut(f64)) -> Result<Module> {
        info!("Loading module from {}.", url);
        let result = Self::fetch(url, progress).and_then(|bytes| self.compile(&bytes));
        result.map_err(|e| {
            error!("Failed to load module from {}: {}", url, e);
            match e.downcast::<EngineError>() {
                Ok(EngineError::LoadFailed(reason)) => anyhow!(EngineError::LoadFailed(reason)),
                Ok(other) => anyhow!(EngineError::LoadFailed(other.to_string())),
                Err(other) => anyhow!(EngineError::LoadFailed(format!("{:#}", other))),
            }
        })
    }

    /// Streams the raw bytes of the module at `url`.
    pub fn fetch(url: &str, progress: &mut dyn FnMut(f64)) -> Result<Vec<u8>> {
        match ModuleSource::parse(url) {
            ModuleSource::File(path) => {
                let file = File::open(&path)?;
                let total = file.metadata()?.len();
                Self::stream_module(file, Some(total), progress)
            }
            ModuleSource::Http(url) => Self::fetch_http(&url, progress),
        }
    }

    #[cfg(feature = "http")]
    fn fetch_http(url: &str, progress: &mut dyn FnMut(f64)) -> Result<Vec<u8>> {
        let response = reqwest::blocking::get(url)?.error_for_status()?;
        let total = response.content_length();
        Self::stream_module(response, total, progress)
    }

    #[cfg(not(feature = "http"))]
    fn fetch_http(url: &str, _progress: &mut dyn FnMut(f64)) -> Result<Vec<u8>> {
        Err(anyhow!(EngineError::LoadFailed(format!(
            "cannot fetch {}: built without http support",
            url
        ))))
    }

    /// Reads `reader` to the end in `CHUNK_SIZE` pieces, reporting progress
    /// against `total` when it is known.  A stream that ends before `total`
    /// bytes arrive is an error.
    pub fn stream_module<R: Read>(
        mut reader: R,
        total: Option<u64>,
        progress: &mut dyn FnMut(f64),
    ) -> Result<Vec<u8>> {
        let mut tracker = ProgressTracker::new(total, progress);
        let mut bytes = Vec::with_capacity(total.map_or(0, |t| t.min(MAX_PREALLOCATION)) as usize);
        let mut chunk = vec![0u8; CHUNK_SIZE];

        loop {
            let received = match reader.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            bytes.extend_from_slice(&chunk[..received]);
            tracker.advance(received);
        }

        if let Some(total) = total {
            if (bytes.len() as u64) < total {
                return Err(anyhow!(EngineError::LoadFailed(format!(
                    "stream ended after {} of {} bytes",
                    bytes.len(),
                    total
                ))));
            }
        }
        info!("Fetched {} bytes.", bytes.len());
        Ok(bytes)
    }

    /// Compiles module bytes (binary or text format).
    pub fn compile(&self, bytes: &[u8]) -> Result<Module> {
        let module = Module::new(&self.engine, bytes)?;
        info!("Module compiled.");
        Ok(module)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engines::wasmtime::new_engine;
    use std::io::{Cursor, Write};

    const TEN_MIB: usize = 10 * 1024 * 1024;

    #[test]
    fn parses_sources() {
        assert_eq!(
            ModuleSource::parse("file:///tmp/repl.wasm"),
            ModuleSource::File(PathBuf::from("/tmp/repl.wasm"))
        );
        assert_eq!(
            ModuleSource::parse("https://example.org/repl.wasm"),
            ModuleSource::Http("https://example.org/repl.wasm".to_string())
        );
        assert_eq!(
            ModuleSource::parse("repl.wasm"),
            ModuleSource::File(PathBuf::from("repl.wasm"))
        );
    }

    /// Streaming a 10 MiB module reports non-decreasing progress that reaches
    /// 100 exactly once.
    #[test]
    fn progress_reaches_one_hundred_once() {
        let mut reports = Vec::new();
        let bytes = ModuleLoader::stream_module(
            Cursor::new(vec![7u8; TEN_MIB]),
            Some(TEN_MIB as u64),
            &mut |p| reports.push(p),
        )
        .unwrap();

        assert_eq!(bytes.len(), TEN_MIB);
        assert!(reports.len() > 1);
        assert!(reports.windows(2).all(|w| w[0] <= w[1]));
        assert!(reports.iter().all(|p| (0.0..=100.0).contains(p)));
        assert_eq!(reports.iter().filter(|p| **p == 100.0).count(), 1);
        assert_eq!(*reports.last().unwrap(), 100.0);
    }

    #[test]
    fn progress_is_omitted_without_a_total() {
        let mut reports = Vec::new();
        let bytes =
            ModuleLoader::stream_module(Cursor::new(vec![1u8; 1000]), None, &mut |p| {
                reports.push(p)
            })
            .unwrap();
        assert_eq!(bytes.len(), 1000);
        assert!(reports.is_empty());

        ModuleLoader::stream_module(Cursor::new(Vec::new()), Some(0), &mut |p| reports.push(p))
            .unwrap();
        assert!(reports.is_empty());
    }

    #[test]
    fn overlong_stream_is_clamped() {
        let mut reports = Vec::new();
        ModuleLoader::stream_module(Cursor::new(vec![0u8; 300_000]), Some(100_000), &mut |p| {
            reports.push(p)
        })
        .unwrap();
        assert_eq!(reports.iter().filter(|p| **p == 100.0).count(), 1);
        assert!(reports.iter().all(|p| *p <= 100.0));
    }

    #[test]
    fn truncated_stream_fails() {
        let err = ModuleLoader::stream_module(Cursor::new(vec![0u8; 10]), Some(20), &mut |_| {})
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EngineError>(),
            Some(EngineError::LoadFailed(_))
        ));
    }

    #[test]
    fn oversized_length_is_not_reserved() {
        let err =
            ModuleLoader::stream_module(Cursor::new(vec![0u8; 10]), Some(u64::MAX), &mut |_| {})
                .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EngineError>(),
            Some(EngineError::LoadFailed(_))
        ));
    }

    #[test]
    fn loads_module_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"(module (memory (export \"memory\") 1))")
            .unwrap();
        let loader = ModuleLoader::new(new_engine().unwrap());
        let mut reports = Vec::new();
        let module = loader
            .load(file.path().to_str().unwrap(), &mut |p| reports.push(p))
            .unwrap();
        assert!(module.get_export("memory").is_some());
        assert_eq!(reports.last(), Some(&100.0));
    }

    #[test]
    fn bad_module_is_load_failed() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"\0asm definitely not a module").unwrap();
        let loader = ModuleLoader::new(new_engine().unwrap());
        let err = loader
            .load(file.path().to_str().unwrap(), &mut |_| {})
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EngineError>(),
            Some(EngineError::LoadFailed(_))
        ));
    }

    #[test]
    fn missing_file_is_load_failed() {
        let loader = ModuleLoader::new(new_engine().unwrap());
        let err = loader
            .load("file:///nonexistent/repl.wasm", &mut |_| {})
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EngineError>(),
            Some(EngineError::LoadFailed(_))
        ));
    }
}
