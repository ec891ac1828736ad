//! Variable store threaded through every pipeline run.
//!
//! An [`Env`] maps variable names to values, each flagged exportable or not.
//! Exportable entries become the environment block of external commands;
//! entries written by capture nodes are kept private to the store.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{Error, Result};
use crate::node::Node;

#[derive(Clone, Debug)]
struct Entry {
    value: String,
    exported: bool,
}

/// An ordered variable store with per-entry export flags.
///
/// `clone` produces an independent, writable copy; mutating the copy never
/// affects the original. The store locks per operation only: running two
/// pipelines that write the same `Env` at the same time is outside the
/// contract (one writer at a time).
#[derive(Debug)]
pub struct Env {
    vars: Arc<Mutex<BTreeMap<String, Entry>>>,
    writable: bool,
}

impl Env {
    /// An empty, writable store.
    pub fn new() -> Env {
        Env {
            vars: Arc::new(Mutex::new(BTreeMap::new())),
            writable: true,
        }
    }

    /// A read-only snapshot of the hosting process's variables, all marked
    /// exportable.
    ///
    /// The snapshot is taken when this is called; construct it once at
    /// program entry and thread it through. Clone it to get a writable copy.
    pub fn host() -> Env {
        let vars = std::env::vars()
            .map(|(name, value)| {
                (
                    name,
                    Entry {
                        value,
                        exported: true,
                    },
                )
            })
            .collect();
        Env {
            vars: Arc::new(Mutex::new(vars)),
            writable: false,
        }
    }

    /// Look up a variable's value. Fails with
    /// [`Error::UndefinedVariable`] when the name is absent; there are no
    /// defaults and no partial matches.
    pub fn lookup(&self, name: &str) -> Result<String> {
        self.lock()
            .get(name)
            .map(|entry| entry.value.clone())
            .ok_or_else(|| Error::UndefinedVariable(name.to_string()))
    }

    /// Insert or overwrite a variable. Entries are never deleted.
    pub fn set(&self, name: &str, value: &str, exported: bool) -> Result<()> {
        if !self.writable {
            return Err(Error::ReadOnlyEnvironment);
        }
        self.lock().insert(
            name.to_string(),
            Entry {
                value: value.to_string(),
                exported,
            },
        );
        Ok(())
    }

    /// The `name=value` pairs an external command receives, exported entries
    /// only, in name order.
    pub fn exportable_pairs(&self) -> Vec<String> {
        self.lock()
            .iter()
            .filter(|(_, entry)| entry.exported)
            .map(|(name, entry)| format!("{}={}", name, entry.value))
            .collect()
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// Run a node against this store. Equivalent to `node.run(self)`.
    pub fn run(&self, node: &Node) -> Result<i32> {
        node.run(self)
    }

    /// A handle onto the same storage, for background work that must observe
    /// and produce writes to this store rather than a copy of it.
    pub(crate) fn share(&self) -> Env {
        Env {
            vars: Arc::clone(&self.vars),
            writable: self.writable,
        }
    }

    /// Plain name -> value view for resolution in a forked child, taken in
    /// one locked pass so the child never touches the lock.
    pub(crate) fn values_snapshot(&self) -> BTreeMap<String, String> {
        self.lock()
            .iter()
            .map(|(name, entry)| (name.clone(), entry.value.clone()))
            .collect()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, Entry>> {
        self.vars.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for Env {
    fn default() -> Env {
        Env::new()
    }
}

impl Clone for Env {
    /// Deep copy: the clone is writable and fully independent, matching the
    /// copy-on-construct contract of the host snapshot.
    fn clone(&self) -> Env {
        Env {
            vars: Arc::new(Mutex::new(self.lock().clone())),
            writable: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_then_lookup() {
        let env = Env::new();
        env.set("greeting", "hello", true).unwrap();
        assert_eq!(env.lookup("greeting").unwrap(), "hello");
    }

    #[test]
    fn lookup_undefined_fails_every_time() {
        let env = Env::new();
        for _ in 0..2 {
            assert!(matches!(
                env.lookup("missing"),
                Err(Error::UndefinedVariable(name)) if name == "missing"
            ));
        }
    }

    #[test]
    fn overwrite_replaces_value_and_flag() {
        let env = Env::new();
        env.set("v", "one", true).unwrap();
        env.set("v", "two", false).unwrap();
        assert_eq!(env.lookup("v").unwrap(), "two");
        assert!(env.exportable_pairs().is_empty());
    }

    #[test]
    fn exportable_pairs_filters_and_orders() {
        let env = Env::new();
        env.set("B", "2", true).unwrap();
        env.set("A", "1", true).unwrap();
        env.set("SECRET", "x", false).unwrap();
        assert_eq!(env.exportable_pairs(), vec!["A=1", "B=2"]);
    }

    #[test]
    fn host_snapshot_is_read_only() {
        let env = Env::host();
        assert!(!env.is_writable());
        assert!(matches!(
            env.set("x", "y", false),
            Err(Error::ReadOnlyEnvironment)
        ));
    }

    #[test]
    fn host_snapshot_exports_everything() {
        let env = Env::host();
        let path = env.lookup("PATH").unwrap();
        assert!(env
            .exportable_pairs()
            .iter()
            .any(|pair| *pair == format!("PATH={path}")));
    }

    #[test]
    fn clone_is_independent_and_writable() {
        let host = Env::host();
        let copy = host.clone();
        assert!(copy.is_writable());
        copy.set("only_in_copy", "1", false).unwrap();
        assert!(host.lookup("only_in_copy").is_err());
    }
}
