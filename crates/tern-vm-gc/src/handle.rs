//! Object handles

use std::fmt;

/// Handle to a heap cell.
///
/// The generation distinguishes successive objects placed at the same page
/// offset; lookups through a handle whose object was swept return `None`.
/// Generations start at 1, so the default handle never resolves.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GcRef {
    pub(crate) page: u32,
    pub(crate) unit: u32,
    pub(crate) generation: u32,
}

impl GcRef {
    /// Page index
    #[inline]
    pub fn page(self) -> u32 {
        self.page
    }

    /// Unit offset within the page
    #[inline]
    pub fn unit(self) -> u32 {
        self.unit
    }

    /// Allocation generation
    #[inline]
    pub fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Debug for GcRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GcRef({}:{}#{})", self.page, self.unit, self.generation)
    }
}
