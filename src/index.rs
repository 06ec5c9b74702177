//! Typed handles for the compiler's arenas.
//!
//! Variables, labels, and blocks are all referred to by small integer
//! handles. Giving each kind its own newtype stops a `VarId` from being
//! used where a `LabelId` belongs; `simple_index!` mints the newtype and
//! [`Arena`] stores the records behind it.

use std::{fmt, hash::Hash, marker::PhantomData};

/// Implemented by every handle type minted with `simple_index!`
pub trait Index: Copy + Eq + Hash + fmt::Debug + 'static {
    fn new(position: usize) -> Self;

    fn index(self) -> usize;
}

/// Declares a `u32`-backed handle type implementing [`Index`]
macro_rules! simple_index {
    ($(#[$attr:meta])* $vis:vis struct $name:ident;) => {
        $(#[$attr])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        $vis struct $name(u32);

        impl $crate::index::Index for $name {
            fn new(position: usize) -> Self {
                Self(position as u32)
            }

            fn index(self) -> usize {
                self.0 as usize
            }
        }

        impl core::fmt::Debug for $name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self.0)
            }
        }
    };
}

pub(crate) use simple_index;

/// Append-only storage addressed by a typed handle instead of `usize`
pub struct Arena<I, T> {
    items: Vec<T>,
    _handle: PhantomData<fn(I)>,
}

impl<I: Index, T> Arena<I, T> {
    pub fn new() -> Self {
        Self {
            items: Vec::new(),
            _handle: PhantomData,
        }
    }

    /// Stores `item` and returns the handle it now lives under
    pub fn push(&mut self, item: T) -> I {
        let handle = I::new(self.items.len());
        self.items.push(item);
        handle
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Every handle issued so far, in insertion order
    pub fn indices(&self) -> impl Iterator<Item = I> {
        (0..self.items.len()).map(I::new)
    }
}

impl<I: Index, T> Default for Arena<I, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<I: Index, T: fmt::Debug> fmt::Debug for Arena<I, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.items.iter()).finish()
    }
}

impl<I: Index, T> std::ops::Index<I> for Arena<I, T> {
    type Output = T;

    fn index(&self, handle: I) -> &T {
        &self.items[handle.index()]
    }
}

impl<I: Index, T> std::ops::IndexMut<I> for Arena<I, T> {
    fn index_mut(&mut self, handle: I) -> &mut T {
        &mut self.items[handle.index()]
    }
}
