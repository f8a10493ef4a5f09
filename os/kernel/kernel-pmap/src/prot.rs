use bitflags::bitflags;

bitflags! {
    /// Access rights requested for a mapping.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Protection: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
    }
}

impl Protection {
    pub const NONE: Self = Self::empty();
    pub const RW: Self = Self::READ.union(Self::WRITE);
    pub const RX: Self = Self::READ.union(Self::EXECUTE);
    pub const ALL: Self = Self::all();
}

bitflags! {
    /// Modifiers for [`CpuContext::enter`](crate::CpuContext::enter).
    ///
    /// The `ACCESS_*` bits describe the access that caused the fault being
    /// resolved; a write access pre-sets the dirty bit so the first store
    /// does not trap again.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct EnterFlags: u8 {
        const ACCESS_READ = 1 << 0;
        const ACCESS_WRITE = 1 << 1;
        const ACCESS_EXECUTE = 1 << 2;
        /// Exclude the mapping from reclamation.
        const WIRED = 1 << 3;
        /// Fail with `ResourceShortage` rather than treating exhaustion as fatal.
        const NOSLEEP = 1 << 4;
    }
}

impl EnterFlags {
    /// The fault type encoded in the `ACCESS_*` bits.
    #[must_use]
    pub const fn access(self) -> Protection {
        let mut p = Protection::NONE;
        if self.contains(Self::ACCESS_READ) {
            p = p.union(Protection::READ);
        }
        if self.contains(Self::ACCESS_WRITE) {
            p = p.union(Protection::WRITE);
        }
        if self.contains(Self::ACCESS_EXECUTE) {
            p = p.union(Protection::EXECUTE);
        }
        p
    }
}

bitflags! {
    /// Residency of one virtual page, as reported by
    /// [`CpuContext::mincore`](crate::CpuContext::mincore).
    ///
    /// The `*_OTHER` bits also account for state the frame kept from
    /// mappings elsewhere or from ones already gone.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Mincore: u8 {
        const INCORE = 1 << 0;
        const REFERENCED = 1 << 1;
        const MODIFIED = 1 << 2;
        const REFERENCED_OTHER = 1 << 3;
        const MODIFIED_OTHER = 1 << 4;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_bits_map_to_protection() {
        let f = EnterFlags::ACCESS_WRITE | EnterFlags::WIRED;
        assert_eq!(f.access(), Protection::WRITE);
        assert_eq!(EnterFlags::empty().access(), Protection::NONE);
    }
}
