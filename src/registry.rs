//! Named registration tables (§4.1).
//!
//! The original subsystem is untyped C: entries carry a runtime "magic number" so a
//! table can reject an entry of the wrong shape. Rust gives us that check for free at
//! the call site via the [`RegisteredEntry`] trait, but the magic word is kept as an
//! explicit per-table tag anyway — the design doc calls out callers that still expect
//! a mismatch to be rejectable independently of the Rust type system (e.g. two
//! distinct tables sharing a Rust type but disagreeing on which instances belong to
//! which table).

use crate::error::{CoreError, CoreResult};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Anything that can live in a [`Registry`] table.
pub trait RegisteredEntry: std::fmt::Debug + Send + Sync {
    /// Name this entry is looked up by within its table.
    fn name(&self) -> &str;
    /// Magic tag; must match the table's `entry_magic` or registration is rejected.
    fn magic(&self) -> u64;
}

type RegHook = Box<dyn Fn(&dyn RegisteredEntry) -> i32 + Send + Sync>;
type UnregHook = Box<dyn Fn(&dyn RegisteredEntry) -> i32 + Send + Sync>;

struct Table {
    entry_magic: u64,
    reg_hook: Option<RegHook>,
    unreg_hook: Option<UnregHook>,
    entries: Vec<Arc<dyn RegisteredEntry>>,
}

impl Table {
    fn new(entry_magic: u64) -> Self {
        Self { entry_magic, reg_hook: None, unreg_hook: None, entries: Vec::new() }
    }
}

/// Self-describing collection of named tables.
///
/// `"tables"` is a pseudo-table whose entries name every other registered table; it
/// is inserted lazily the first time any table is created, matching the "Bootstrap"
/// paragraph of §4.1.
pub struct Registry {
    tables: HashMap<String, Table>,
    bootstrapped: bool,
}

/// An entry in the self-describing `"tables"` pseudo-table.
#[derive(Debug)]
struct TableDescriptor {
    name: String,
}

impl RegisteredEntry for TableDescriptor {
    fn name(&self) -> &str {
        &self.name
    }
    fn magic(&self) -> u64 {
        TABLES_MAGIC
    }
}

/// Magic tag for the bootstrap `"tables"` table itself.
pub const TABLES_MAGIC: u64 = 0xed99_058e;

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self { tables: HashMap::new(), bootstrapped: false }
    }

    fn bootstrap(&mut self) {
        if !self.bootstrapped {
            self.tables.insert("tables".to_string(), Table::new(TABLES_MAGIC));
            self.bootstrapped = true;
        }
    }

    /// Create a new named table accepting entries tagged with `entry_magic`.
    pub fn create_table(&mut self, name: &str, entry_magic: u64) {
        self.bootstrap();
        self.tables.insert(name.to_string(), Table::new(entry_magic));
        if name != "tables" {
            if let Some(t) = self.tables.get_mut("tables") {
                t.entries.push(Arc::new(TableDescriptor { name: name.to_string() }));
            }
        }
    }

    /// Attach an optional registration/unregistration hook pair to an existing table.
    pub fn set_hooks(
        &mut self,
        name: &str,
        reg_hook: Option<Box<dyn Fn(&dyn RegisteredEntry) -> i32 + Send + Sync>>,
        unreg_hook: Option<Box<dyn Fn(&dyn RegisteredEntry) -> i32 + Send + Sync>>,
    ) -> CoreResult<()> {
        let table = self.tables.get_mut(name).ok_or_else(|| CoreError::NoSuchTable(name.to_string()))?;
        table.reg_hook = reg_hook;
        table.unreg_hook = unreg_hook;
        Ok(())
    }

    /// Register a single entry (§4.1 `register`).
    pub fn register(&mut self, table: &str, entry: Arc<dyn RegisteredEntry>) -> CoreResult<()> {
        let t = self.tables.get_mut(table).ok_or_else(|| CoreError::NoSuchTable(table.to_string()))?;
        if entry.magic() != t.entry_magic {
            return Err(CoreError::MagicMismatch(table.to_string()));
        }
        if t.entries.iter().any(|e| e.name() == entry.name()) {
            return Err(CoreError::DuplicateName { table: table.to_string(), name: entry.name().to_string() });
        }
        if let Some(hook) = &t.reg_hook {
            let code = hook(entry.as_ref());
            if code != 0 {
                return Err(CoreError::RejectedByHook(code));
            }
        }
        debug!(table, name = entry.name(), "registry: entry registered");
        t.entries.push(entry);
        Ok(())
    }

    /// Bulk register; stops and returns the index of the first failure, or the total
    /// count on full success. Earlier successes are not rolled back (§4.1).
    pub fn register_n(
        &mut self,
        table: &str,
        entries: Vec<Arc<dyn RegisteredEntry>>,
    ) -> Result<usize, (usize, CoreError)> {
        let n = entries.len();
        for (i, entry) in entries.into_iter().enumerate() {
            if let Err(e) = self.register(table, entry) {
                return Err((i, e));
            }
        }
        Ok(n)
    }

    /// Unregister by name; the unreg hook may veto.
    pub fn unregister(&mut self, table: &str, name: &str) -> CoreResult<()> {
        let t = self.tables.get_mut(table).ok_or_else(|| CoreError::NoSuchTable(table.to_string()))?;
        let idx = t.entries.iter().position(|e| e.name() == name);
        let idx = match idx {
            Some(i) => i,
            None => return Ok(()),
        };
        if let Some(hook) = &t.unreg_hook {
            let code = hook(t.entries[idx].as_ref());
            if code != 0 {
                return Err(CoreError::RejectedByHook(code));
            }
        }
        t.entries.remove(idx);
        debug!(table, name, "registry: entry unregistered");
        Ok(())
    }

    pub fn unregister_n(&mut self, table: &str, names: &[String]) -> Result<usize, (usize, CoreError)> {
        for (i, name) in names.iter().enumerate() {
            if let Err(e) = self.unregister(table, name) {
                return Err((i, e));
            }
        }
        Ok(names.len())
    }

    /// Find by name; moves the hit one step toward the front (move-to-front skew
    /// heuristic from §4.1). Returns `None` if the table or entry doesn't exist.
    pub fn find(&mut self, table: &str, name: &str) -> Option<Arc<dyn RegisteredEntry>> {
        let t = self.tables.get_mut(table)?;
        let idx = t.entries.iter().position(|e| e.name() == name)?;
        if idx > 0 {
            t.entries.swap(idx, idx - 1);
            let found = t.entries[idx - 1].clone();
            return Some(found);
        }
        Some(t.entries[idx].clone())
    }

    /// Visit every entry in `table`; stop early if `f` returns non-zero. Iteration
    /// order is unspecified (§4.1) — callers needing determinism must sort.
    pub fn iter<F>(&self, table: &str, mut f: F) -> CoreResult<()>
    where
        F: FnMut(&dyn RegisteredEntry) -> i32,
    {
        let t = self.tables.get(table).ok_or_else(|| CoreError::NoSuchTable(table.to_string()))?;
        for entry in &t.entries {
            if f(entry.as_ref()) != 0 {
                break;
            }
        }
        Ok(())
    }

    /// Remove a table entirely, flushing (unregistering) all its entries first.
    pub fn drop_table(&mut self, table: &str) -> CoreResult<()> {
        let names: Vec<String> = {
            let t = self.tables.get(table).ok_or_else(|| CoreError::NoSuchTable(table.to_string()))?;
            t.entries.iter().map(|e| e.name().to_string()).collect()
        };
        for name in names {
            self.unregister(table, &name)?;
        }
        self.tables.remove(table);
        if let Some(t) = self.tables.get_mut("tables") {
            t.entries.retain(|e| e.name() != table);
        }
        Ok(())
    }

    pub fn table_exists(&self, table: &str) -> bool {
        self.tables.contains_key(table)
    }

    pub fn len(&self, table: &str) -> CoreResult<usize> {
        self.tables.get(table).map(|t| t.entries.len()).ok_or_else(|| CoreError::NoSuchTable(table.to_string()))
    }

    pub fn is_empty(&self, table: &str) -> CoreResult<bool> {
        self.len(table).map(|n| n == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WIDGET_MAGIC: u64 = 0xdead_beef;

    #[derive(Debug)]
    struct Widget(String);

    impl RegisteredEntry for Widget {
        fn name(&self) -> &str {
            &self.0
        }
        fn magic(&self) -> u64 {
            WIDGET_MAGIC
        }
    }

    #[test]
    fn bootstrap_table_tracks_created_tables() {
        let mut reg = Registry::new();
        reg.create_table("widgets", WIDGET_MAGIC);
        assert!(reg.table_exists("tables"));
        let mut seen = Vec::new();
        reg.iter("tables", |e| {
            seen.push(e.name().to_string());
            0
        })
        .unwrap();
        assert_eq!(seen, vec!["widgets".to_string()]);
    }

    #[test]
    fn register_find_unregister_round_trip() {
        let mut reg = Registry::new();
        reg.create_table("widgets", WIDGET_MAGIC);
        reg.register("widgets", Arc::new(Widget("a".into()))).unwrap();
        assert!(reg.find("widgets", "a").is_some());
        reg.unregister("widgets", "a").unwrap();
        assert!(reg.find("widgets", "a").is_none());
    }

    #[test]
    fn magic_mismatch_is_rejected() {
        #[derive(Debug)]
        struct Other;
        impl RegisteredEntry for Other {
            fn name(&self) -> &str {
                "x"
            }
            fn magic(&self) -> u64 {
                0x1234
            }
        }
        let mut reg = Registry::new();
        reg.create_table("widgets", WIDGET_MAGIC);
        let err = reg.register("widgets", Arc::new(Other)).unwrap_err();
        assert_eq!(err, CoreError::MagicMismatch("widgets".to_string()));
    }

    #[test]
    fn duplicate_name_is_rejected() {
        let mut reg = Registry::new();
        reg.create_table("widgets", WIDGET_MAGIC);
        reg.register("widgets", Arc::new(Widget("a".into()))).unwrap();
        let err = reg.register("widgets", Arc::new(Widget("a".into()))).unwrap_err();
        assert_eq!(
            err,
            CoreError::DuplicateName { table: "widgets".to_string(), name: "a".to_string() }
        );
    }

    #[test]
    fn find_moves_entry_toward_front() {
        let mut reg = Registry::new();
        reg.create_table("widgets", WIDGET_MAGIC);
        reg.register("widgets", Arc::new(Widget("a".into()))).unwrap();
        reg.register("widgets", Arc::new(Widget("b".into()))).unwrap();
        reg.register("widgets", Arc::new(Widget("c".into()))).unwrap();
        reg.find("widgets", "c").unwrap();
        let mut order = Vec::new();
        reg.iter("widgets", |e| {
            order.push(e.name().to_string());
            0
        })
        .unwrap();
        assert_eq!(order, vec!["a".to_string(), "c".to_string(), "b".to_string()]);
    }

    #[test]
    fn drop_table_flushes_entries_and_removes_from_bootstrap() {
        let mut reg = Registry::new();
        reg.create_table("widgets", WIDGET_MAGIC);
        reg.register("widgets", Arc::new(Widget("a".into()))).unwrap();
        reg.drop_table("widgets").unwrap();
        assert!(!reg.table_exists("widgets"));
        let mut seen = Vec::new();
        reg.iter("tables", |e| {
            seen.push(e.name().to_string());
            0
        })
        .unwrap();
        assert!(!seen.contains(&"widgets".to_string()));
    }
}
