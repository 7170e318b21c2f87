//! Custom call targets loaded from a shared library.

use std::path::{Path, PathBuf};

use aot_rs::custom_call::{CustomCallTargetRegistry, SymbolAddress};
use libloading::Library;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum LibraryError {
    #[error("failed to load {path}: {source}")]
    Load {
        path: PathBuf,
        #[source]
        source: libloading::Error,
    },
    #[error("symbol {symbol} not found in {path}: {source}")]
    Symbol {
        path: PathBuf,
        symbol: String,
        #[source]
        source: libloading::Error,
    },
}

pub type LibraryResult<T> = Result<T, LibraryError>;

/// A loaded shared library whose exports are registered as custom call targets.
///
/// The library stays mapped for as long as this value lives; registered
/// addresses dangle once it is dropped, so keep it alive for the process.
pub struct CustomCallLibrary {
    path: PathBuf,
    symbols: Vec<String>,
    _lib: Library,
}

impl CustomCallLibrary {
    /// Opens `path` and registers every symbol in `symbols` in `registry`.
    ///
    /// # Safety
    ///
    /// Loading runs the library's initializers, and each symbol must be a
    /// function with the `CustomCallFn` signature.
    pub unsafe fn load(
        path: impl AsRef<Path>,
        symbols: &[&str],
        registry: &CustomCallTargetRegistry,
    ) -> LibraryResult<Self> {
        let path = path.as_ref().to_path_buf();
        let lib = Library::new(&path).map_err(|source| LibraryError::Load {
            path: path.clone(),
            source,
        })?;
        let mut resolved = Vec::with_capacity(symbols.len());
        for symbol in symbols {
            let address = lib
                .get::<*const std::ffi::c_void>(symbol.as_bytes())
                .map(|s| *s)
                .map_err(|source| LibraryError::Symbol {
                    path: path.clone(),
                    symbol: symbol.to_string(),
                    source,
                })?;
            resolved.push((symbol.to_string(), address));
        }
        for (symbol, address) in &resolved {
            registry.register(symbol.clone(), SymbolAddress::from_raw(*address));
        }
        info!(path = %path.display(), symbols = resolved.len(), "custom call library loaded");
        Ok(Self {
            path,
            symbols: resolved.into_iter().map(|(symbol, _)| symbol).collect(),
            _lib: lib,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn symbols(&self) -> &[String] {
        &self.symbols
    }
}

/// Platform file name for a library called `stem`, e.g. `libkernels.so`.
pub fn library_file_name(stem: &str) -> String {
    let ext = if cfg!(target_os = "macos") {
        ".dylib"
    } else if cfg!(target_os = "windows") {
        ".dll"
    } else {
        ".so"
    };
    if cfg!(target_os = "windows") {
        format!("{stem}{ext}")
    } else {
        format!("lib{stem}{ext}")
    }
}
