//! Variable records.
//!
//! All variables, temporaries, and interned constants live in one arena
//! ([`VarTable`]) and are referred to by [`VarId`] handles. Two handles name
//! the same logical variable iff their interned base names match; SSA
//! conversion mints a fresh handle (same name, bumped version) for every
//! definition, so handle equality is SSA-value equality.

use crate::{
    index::{simple_index, Arena},
    intern::InternedSymbol,
    middle::ty::ValueType,
};

simple_index! {
    /// Handle to a [`Var`] record in the [`VarTable`] arena
    pub struct VarId;
}

#[derive(Debug, Clone)]
pub struct Var {
    pub name: InternedSymbol,
    pub ty: ValueType,
    /// `None` until SSA conversion assigns a version. A non-const variable
    /// referenced as an input while still unversioned is a compiler defect.
    pub ssa_version: Option<u32>,
    pub is_const: bool,
    pub is_temp: bool,
    pub is_global: bool,
    pub is_published: bool,
    pub is_persistent: bool,
    /// Compile-time known cell value, if any
    pub holds_const: Option<i32>,
    /// Physical register index, assigned by linear scan
    pub register: Option<u8>,
    /// Source line of the declaration, for diagnostics
    pub line: u32,
}

impl Var {
    pub fn display_name(&self) -> String {
        match self.ssa_version {
            Some(v) => format!("{}.{v}", self.name.value()),
            None => self.name.value().to_string(),
        }
    }
}

#[derive(Debug, Default)]
pub struct VarTable {
    vars: Arena<VarId, Var>,
}

impl VarTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, var: Var) -> VarId {
        self.vars.push(var)
    }

    pub fn get(&self, id: VarId) -> &Var {
        &self.vars[id]
    }

    pub fn get_mut(&mut self, id: VarId) -> &mut Var {
        &mut self.vars[id]
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = VarId> {
        self.vars.indices()
    }

    /// Mints a fresh SSA version of `base` (same name and type, new handle).
    pub fn new_version(&mut self, base: VarId, version: u32) -> VarId {
        let source = self.get(base);
        let var = Var {
            name: source.name,
            ty: source.ty.clone(),
            ssa_version: Some(version),
            is_const: false,
            is_temp: source.is_temp,
            is_global: false,
            is_published: false,
            is_persistent: false,
            holds_const: None,
            register: None,
            line: source.line,
        };
        self.insert(var)
    }

    pub fn name_of(&self, id: VarId) -> InternedSymbol {
        self.get(id).name
    }

    pub fn is_const(&self, id: VarId) -> bool {
        self.get(id).is_const
    }

    pub fn holds_const(&self, id: VarId) -> Option<i32> {
        self.get(id).holds_const
    }

    /// True for handles that participate in SSA renaming and register
    /// allocation: scalar locals and temporaries. Constants keep their
    /// interned identity, globals live in fixed slots, and arrays are
    /// memory, not values.
    pub fn is_renamable(&self, id: VarId) -> bool {
        let var = self.get(id);
        !var.is_const && !var.is_global && var.ty.is_scalar()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch(name: &str) -> Var {
        Var {
            name: InternedSymbol::new(name),
            ty: ValueType::I32,
            ssa_version: None,
            is_const: false,
            is_temp: false,
            is_global: false,
            is_published: false,
            is_persistent: false,
            holds_const: None,
            register: None,
            line: 1,
        }
    }

    #[test]
    fn versions_share_the_base_name() {
        let mut table = VarTable::new();
        let base = table.insert(scratch("speed"));
        let v1 = table.new_version(base, 1);
        let v2 = table.new_version(base, 2);

        assert_ne!(v1, v2);
        assert_eq!(table.name_of(v1), table.name_of(base));
        assert_eq!(table.get(v2).ssa_version, Some(2));
        assert_eq!(table.get(v2).display_name(), "speed.2");
    }

    #[test]
    fn arrays_are_not_renamable() {
        let mut table = VarTable::new();
        let mut var = scratch("wave");
        var.ty = ValueType::Array {
            elem: Box::new(ValueType::I32),
            len: 8,
        };
        let id = table.insert(var);
        assert!(!table.is_renamable(id));
    }
}
