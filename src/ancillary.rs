//! Per-object extension slots keyed by [`crate::keyspace::Keyspace`]-issued keys (§4.3).
//!
//! The C original attaches an `AncData` blob (an array of `void*`) to every object of
//! a given module, offset-addressed via `offsetof`. Rust has no `offsetof` story we'd
//! want to lean on, so each "ancillary-enabled" object simply owns an [`AncillaryData`]
//! field directly and the module keeps a registered walker closure to enumerate every
//! live object of that type — the same externally-observable contract (`ad_get`,
//! `ad_set`, `ad_iter`, `ad_flush`) as the original, without pointer arithmetic.

use crate::error::{CoreError, CoreResult};
use crate::keyspace::{Keyspace, KEY_INVALID};
use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Type-erased ancillary value plus its destructor.
type AnyValue = Box<dyn Any + Send>;
type Destructor = Arc<dyn Fn(AnyValue) + Send + Sync>;

/// Walker callback: visit every live object of a module's type.
pub type Walker = Arc<dyn Fn(&mut dyn FnMut(&mut AncillaryData)) + Send + Sync>;

/// One module's registration: its name, walker, and per-key destructors.
struct Module {
    walker: Walker,
    keyspace: Keyspace,
    destructors: HashMap<u32, Destructor>,
}

/// Global ancillary-data registry: one [`Module`] per module name.
#[derive(Default)]
pub struct AncillaryRegistry {
    modules: Mutex<HashMap<String, Module>>,
}

impl AncillaryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a module. `walker` must be able to visit every live object that
    /// embeds this module's [`AncillaryData`].
    pub fn register_module(&self, name: &str, walker: Walker) {
        let mut modules = self.modules.lock().unwrap();
        modules.insert(name.to_string(), Module { walker, keyspace: Keyspace::new(0, 4, None), destructors: HashMap::new() });
    }

    /// Create a new ancillary key for `module`, backed by a chunk-4 keyspace per §4.3.
    pub fn key_create(&self, module: &str, destroy: Destructor) -> CoreResult<u32> {
        let mut modules = self.modules.lock().unwrap();
        let m = modules.get_mut(module).ok_or_else(|| CoreError::NoSuchTable(module.to_string()))?;
        let key = m.keyspace.reserve();
        if key == KEY_INVALID {
            return Err(CoreError::KeyspaceExhausted);
        }
        m.destructors.insert(key, destroy);
        Ok(key)
    }

    /// Destroy a key: walk every object of the module, run the destructor on any
    /// stored value, then release the key.
    pub fn key_destroy(&self, module: &str, key: u32) {
        let (walker, destructor) = {
            let mut modules = self.modules.lock().unwrap();
            let m = match modules.get_mut(module) {
                Some(m) => m,
                None => return,
            };
            let destructor = m.destructors.remove(&key);
            m.keyspace.release(key);
            (m.walker.clone(), destructor)
        };
        if let Some(destructor) = destructor {
            walker(&mut |data: &mut AncillaryData| {
                if let Some(v) = data.take_raw(key) {
                    destructor(v);
                }
            });
        }
    }

    /// Trampoline into a module's walker, visiting each object's [`AncillaryData`].
    pub fn iter<F>(&self, module: &str, mut f: F) -> CoreResult<()>
    where
        F: FnMut(&mut AncillaryData) -> i32,
    {
        let walker = {
            let modules = self.modules.lock().unwrap();
            modules.get(module).ok_or_else(|| CoreError::NoSuchTable(module.to_string()))?.walker.clone()
        };
        let mut stop = false;
        walker(&mut |data: &mut AncillaryData| {
            if !stop && f(data) != 0 {
                stop = true;
            }
        });
        Ok(())
    }
}

/// Per-object storage slot array, embedded directly in an ancillary-enabled object.
#[derive(Default)]
pub struct AncillaryData {
    values: Vec<Option<AnyValue>>,
    destructors: HashMap<u32, Destructor>,
}

impl AncillaryData {
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_len(&mut self, key: u32) {
        let needed = key as usize + 1;
        if self.values.len() < needed {
            self.values.resize_with(needed, || None);
        }
    }

    /// Get the stored value for `key`, if any, downcast to `T`.
    pub fn get<T: 'static>(&self, key: u32) -> Option<&T> {
        self.values.get(key as usize)?.as_ref()?.downcast_ref::<T>()
    }

    /// Install a new value for `key`. If a prior value was stored, its destructor
    /// runs on it first (§4.3 "Access").
    pub fn set<T: Send + 'static>(&mut self, key: u32, value: T, destructor: Destructor) {
        self.ensure_len(key);
        if let Some(prev) = self.values[key as usize].take() {
            if let Some(d) = self.destructors.get(&key) {
                d(prev);
            } else {
                drop(prev);
            }
        }
        self.destructors.insert(key, destructor);
        self.values[key as usize] = Some(Box::new(value));
    }

    fn take_raw(&mut self, key: u32) -> Option<AnyValue> {
        self.values.get_mut(key as usize).and_then(|slot| slot.take())
    }

    /// Run every stored value's destructor and release the object's array (used when
    /// the owning object itself is being destroyed).
    pub fn flush(&mut self) {
        for (key, slot) in self.values.iter_mut().enumerate() {
            if let Some(value) = slot.take() {
                if let Some(d) = self.destructors.get(&(key as u32)) {
                    d(value);
                }
            }
        }
        self.values.clear();
        self.destructors.clear();
    }
}

impl Drop for AncillaryData {
    fn drop(&mut self) {
        self.flush();
    }
}
