//! Global string interning.
//!
//! Every identifier the compiler touches (variable, function, link, and
//! attribute names) is interned once and passed around as a small copyable
//! handle. Handle equality is string equality. The derived ordering follows
//! interning order, not lexicographic order; it exists so handles can key
//! `BTreeMap`s deterministically within one invocation.

use std::sync::RwLock;

use hashbrown::HashMap;
use once_cell::sync::Lazy;

struct Table {
    lookup: HashMap<&'static str, u32>,
    strings: Vec<&'static str>,
}

static TABLE: Lazy<RwLock<Table>> = Lazy::new(|| {
    RwLock::new(Table {
        lookup: HashMap::new(),
        strings: Vec::new(),
    })
});

/// Handle to an interned string
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InternedSymbol(u32);

impl InternedSymbol {
    pub fn new(value: &str) -> Self {
        if let Some(&index) = TABLE.read().unwrap().lookup.get(value) {
            return Self(index);
        }

        let mut table = TABLE.write().unwrap();
        // Re-check under the write lock; another thread may have interned
        // the same string between the two acquisitions.
        if let Some(&index) = table.lookup.get(value) {
            return Self(index);
        }

        let leaked: &'static str = Box::leak(value.to_owned().into_boxed_str());
        let index = table.strings.len() as u32;
        table.strings.push(leaked);
        table.lookup.insert(leaked, index);
        Self(index)
    }

    /// The interned string. Entries are never removed, so the reference is
    /// valid for the life of the process.
    pub fn value(self) -> &'static str {
        TABLE.read().unwrap().strings[self.0 as usize]
    }
}

impl core::fmt::Debug for InternedSymbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}#{}", self.value(), self.0)
    }
}

impl core::fmt::Display for InternedSymbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.value())
    }
}
