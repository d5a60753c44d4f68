//! Custom node libraries: function tables and the registry that names them.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use libloading::Library;
use tracing::info;

use crate::abi::{
    self, DeinitializeFn, ExecuteFn, InitializeFn, ReleaseFn, TensorInfoFn,
};
use crate::builtin;
use crate::error::{PluginError, Result};

/// The six entry points of one library.
#[derive(Debug, Clone, Copy)]
pub struct LibraryFns {
    pub initialize: InitializeFn,
    pub deinitialize: DeinitializeFn,
    pub execute: ExecuteFn,
    pub get_inputs_info: TensorInfoFn,
    pub get_outputs_info: TensorInfoFn,
    pub release: ReleaseFn,
}

/// A resolved library. Cloning is cheap; a dynamically loaded library stays
/// mapped while any clone is alive.
#[derive(Clone)]
pub struct NodeLibrary {
    name: String,
    fns: LibraryFns,
    _lib: Option<Arc<Library>>,
}

impl NodeLibrary {
    /// Wrap a statically linked function table.
    pub fn from_fns(name: impl Into<String>, fns: LibraryFns) -> Self {
        Self { name: name.into(), fns, _lib: None }
    }

    /// `dlopen` a shared object and resolve its entry points.
    pub fn load(name: impl Into<String>, path: &Path) -> Result<Self> {
        let name = name.into();
        // SAFETY: loading runs the library's initializers; libraries are
        // trusted operator-supplied plugins.
        let lib = unsafe { Library::new(path) }.map_err(|e| PluginError::Load {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        let fns = LibraryFns {
            initialize: symbol::<InitializeFn>(&lib, &name, abi::SYM_INITIALIZE)?,
            deinitialize: symbol::<DeinitializeFn>(&lib, &name, abi::SYM_DEINITIALIZE)?,
            execute: symbol::<ExecuteFn>(&lib, &name, abi::SYM_EXECUTE)?,
            get_inputs_info: symbol::<TensorInfoFn>(&lib, &name, abi::SYM_GET_INPUTS_INFO)?,
            get_outputs_info: symbol::<TensorInfoFn>(&lib, &name, abi::SYM_GET_OUTPUTS_INFO)?,
            release: symbol::<ReleaseFn>(&lib, &name, abi::SYM_RELEASE)?,
        };

        info!(library = %name, path = %path.display(), "loaded custom node library");
        Ok(Self { name, fns, _lib: Some(Arc::new(lib)) })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fns(&self) -> &LibraryFns {
        &self.fns
    }
}

impl std::fmt::Debug for NodeLibrary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeLibrary")
            .field("name", &self.name)
            .field("dynamic", &self._lib.is_some())
            .finish()
    }
}

fn symbol<T: Copy>(lib: &Library, library: &str, sym: &[u8]) -> Result<T> {
    // SAFETY: the ABI module fixes the signature of every exported symbol.
    unsafe { lib.get::<T>(sym) }
        .map(|s| *s)
        .map_err(|_| PluginError::MissingSymbol {
            library: library.to_string(),
            symbol: String::from_utf8_lossy(sym).into_owned(),
        })
}

// ── Registry ──────────────────────────────────────────────────────────────────

/// Library name → function table, consulted when a pipeline is assembled.
#[derive(Debug, Default, Clone)]
pub struct LibraryRegistry {
    libraries: HashMap<String, NodeLibrary>,
}

impl LibraryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the built-in libraries.
    pub fn with_builtins() -> Self {
        let mut reg = Self::new();
        reg.register(builtin::add_sub::library());
        reg.register(builtin::replicate::library());
        reg
    }

    pub fn register(&mut self, library: NodeLibrary) {
        self.libraries.insert(library.name().to_string(), library);
    }

    pub fn load(&mut self, name: &str, path: &Path) -> Result<()> {
        let lib = NodeLibrary::load(name, path)?;
        self.register(lib);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<&NodeLibrary> {
        self.libraries
            .get(name)
            .ok_or_else(|| PluginError::UnknownLibrary(name.to_string()))
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.libraries.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_are_registered() {
        let reg = LibraryRegistry::with_builtins();
        assert_eq!(reg.names(), vec!["add_sub", "replicate"]);
        assert!(reg.get("add_sub").is_ok());
    }

    #[test]
    fn unknown_library() {
        let reg = LibraryRegistry::new();
        assert!(matches!(reg.get("nope"), Err(PluginError::UnknownLibrary(_))));
    }

    #[test]
    fn load_missing_file_fails() {
        let err = NodeLibrary::load("ghost", Path::new("/nonexistent/libghost.so")).unwrap_err();
        assert!(matches!(err, PluginError::Load { .. }));
    }
}
