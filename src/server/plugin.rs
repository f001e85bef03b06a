//! Model plug-in loading over a C-compatible dynamic-library boundary.
//!
//! A model library exports two symbols:
//!   `create(worker_idx: i32) -> *mut TrainingHandle`
//!   `destroy(handle: *mut TrainingHandle)`
//! The `export_model!` macro generates both for a plug-in crate.

use std::path::Path;
use std::sync::Arc;

use libloading::{Library, Symbol};
use tracing::info;

use crate::errors::{Error, Result};
use crate::graph::Graph;
use crate::training::Training;

/// Thin FFI-safe wrapper around a boxed model; trait objects are fat
/// pointers and cannot cross the C boundary directly.
pub struct TrainingHandle(pub Box<dyn Training>);

pub type CreateFn = unsafe extern "C" fn(i32) -> *mut TrainingHandle;
pub type DestroyFn = unsafe extern "C" fn(*mut TrainingHandle);

pub struct ModelLibrary {
    lib: Arc<Library>,
    create: CreateFn,
    destroy: DestroyFn,
}

impl ModelLibrary {
    pub fn load(path: &Path) -> Result<Self> {
        unsafe {
            let lib = Library::new(path)
                .map_err(|e| Error::ModelLoad(format!("{}: {e}", path.display())))?;
            let create: Symbol<CreateFn> = lib
                .get(b"create")
                .map_err(|e| Error::ModelLoad(format!("missing create symbol: {e}")))?;
            let create = *create;
            let destroy: Symbol<DestroyFn> = lib
                .get(b"destroy")
                .map_err(|e| Error::ModelLoad(format!("missing destroy symbol: {e}")))?;
            let destroy = *destroy;
            info!(path = %path.display(), "model plug-in loaded");
            Ok(Self {
                lib: Arc::new(lib),
                create,
                destroy,
            })
        }
    }

    pub fn instantiate(&self, worker_idx: usize) -> Result<PluginModel> {
        let raw = unsafe { (self.create)(worker_idx as i32) };
        if raw.is_null() {
            return Err(Error::ModelLoad(format!(
                "create({worker_idx}) returned null"
            )));
        }
        Ok(PluginModel {
            raw,
            destroy: self.destroy,
            _lib: Arc::clone(&self.lib),
        })
    }
}

/// An instantiated plug-in model; keeps its library alive and destroys
/// the foreign instance on drop.
pub struct PluginModel {
    raw: *mut TrainingHandle,
    destroy: DestroyFn,
    _lib: Arc<Library>,
}

// Each instance is owned by exactly one training thread.
unsafe impl Send for PluginModel {}

impl PluginModel {
    fn inner(&mut self) -> &mut dyn Training {
        unsafe { (*self.raw).0.as_mut() }
    }
}

impl Training for PluginModel {
    fn curr(&mut self) -> &mut Graph {
        self.inner().curr()
    }

    fn prev(&mut self) -> &mut Graph {
        self.inner().prev()
    }

    fn batch_train(&mut self) -> Result<()> {
        self.inner().batch_train()
    }
}

impl Drop for PluginModel {
    fn drop(&mut self) {
        unsafe { (self.destroy)(self.raw) };
    }
}
