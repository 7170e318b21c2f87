//! Process-wide registry mapping custom call symbols to native entry points.
//!
//! The registry is created lazily on first access and lives for the rest of
//! the process. Keys are never removed; registering an existing symbol
//! replaces its address. The lock is held only for the duration of a single
//! map access.

use std::collections::HashMap;
use std::ffi::c_void;
use std::sync::{Mutex, OnceLock};

use tracing::{debug, trace};

/// Calling convention shared by every registered routine.
///
/// `outputs` and `inputs` point to arrays of buffer base addresses in
/// instruction operand order; `opaque` is the instruction's opaque payload.
pub type CustomCallFn = unsafe extern "C" fn(
    outputs: *const *mut c_void,
    inputs: *const *const c_void,
    opaque: *const u8,
    opaque_len: usize,
);

/// Untyped native function address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SymbolAddress(*const c_void);

// SAFETY: the address is an immutable code pointer; it is never dereferenced as data.
unsafe impl Send for SymbolAddress {}
// SAFETY: see above.
unsafe impl Sync for SymbolAddress {}

impl SymbolAddress {
    pub fn from_raw(ptr: *const c_void) -> Self {
        Self(ptr)
    }

    pub fn from_fn(function: CustomCallFn) -> Self {
        Self(function as *const c_void)
    }

    pub fn as_ptr(self) -> *const c_void {
        self.0
    }

    pub fn is_null(self) -> bool {
        self.0.is_null()
    }

    /// Reinterprets the address as a [`CustomCallFn`].
    ///
    /// # Safety
    ///
    /// The address must point to a function with the [`CustomCallFn`] signature.
    pub unsafe fn as_custom_call_fn(self) -> Option<CustomCallFn> {
        if self.0.is_null() {
            None
        } else {
            Some(std::mem::transmute::<*const c_void, CustomCallFn>(self.0))
        }
    }
}

#[derive(Debug, Default)]
pub struct CustomCallTargetRegistry {
    symbols: Mutex<HashMap<String, SymbolAddress>>,
}

impl CustomCallTargetRegistry {
    /// Returns the process-wide registry.
    pub fn global() -> &'static CustomCallTargetRegistry {
        static INSTANCE: OnceLock<CustomCallTargetRegistry> = OnceLock::new();
        INSTANCE.get_or_init(CustomCallTargetRegistry::default)
    }

    /// Inserts or overwrites `symbol`. The address is not validated.
    pub fn register(&self, symbol: impl Into<String>, address: SymbolAddress) {
        let symbol = symbol.into();
        let previous = {
            let mut symbols = self
                .symbols
                .lock()
                .expect("custom call registry mutex poisoned");
            symbols.insert(symbol.clone(), address)
        };
        match previous {
            Some(old) if old != address => {
                debug!(symbol = %symbol, "custom call target overwritten")
            }
            Some(_) => {}
            None => trace!(symbol = %symbol, "custom call target registered"),
        }
    }

    /// Returns the registered address, or `None` when `symbol` is unknown.
    pub fn lookup(&self, symbol: &str) -> Option<SymbolAddress> {
        self.symbols
            .lock()
            .expect("custom call registry mutex poisoned")
            .get(symbol)
            .copied()
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.lookup(symbol).is_some()
    }

    /// Snapshot of registered symbol names, sorted.
    pub fn symbols(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .symbols
            .lock()
            .expect("custom call registry mutex poisoned")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}

/// Registers `function` under `symbol` in the global registry.
pub fn register_custom_call(symbol: impl Into<String>, function: CustomCallFn) {
    CustomCallTargetRegistry::global().register(symbol, SymbolAddress::from_fn(function));
}
