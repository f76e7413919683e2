use std::ops::{AddAssign, SubAssign};

/// Per-component byte accounting: logical (decoded) size, stored size, and
/// bytes held by in-process caches.
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub struct Stat {
    pub bytes: u64,
    pub compressed: u64,
    pub cache: u64,
}

impl Stat {
    pub fn new(bytes: u64, compressed: u64, cache: u64) -> Self {
        Stat {
            bytes,
            compressed,
            cache,
        }
    }
}

impl AddAssign for Stat {
    fn add_assign(&mut self, x: Stat) {
        self.bytes += x.bytes;
        self.compressed += x.compressed;
        self.cache += x.cache;
    }
}

impl SubAssign for Stat {
    fn sub_assign(&mut self, x: Stat) {
        self.bytes -= x.bytes;
        self.compressed -= x.compressed;
        self.cache -= x.cache;
    }
}
