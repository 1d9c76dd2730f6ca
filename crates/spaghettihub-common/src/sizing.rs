//! Compute allocation for ephemeral runner VMs.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A size in whole gibibytes, rendered the way the virtualization host
/// expects it (`"8GiB"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ByteSize {
    gib: u32,
}

impl ByteSize {
    pub const fn gib(gib: u32) -> Self {
        Self { gib }
    }

    pub fn as_gib(&self) -> u32 {
        self.gib
    }
}

impl fmt::Display for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}GiB", self.gib)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmSize {
    pub cpu_cores: u32,
    pub memory: ByteSize,
    pub disk: ByteSize,
}

pub const MEDIUM_RUNNER_LABEL: &str = "medium-runner";
pub const LARGE_RUNNER_LABEL: &str = "large-runner";

const DEFAULT_SIZE: VmSize = VmSize {
    cpu_cores: 2,
    memory: ByteSize::gib(4),
    disk: ByteSize::gib(8),
};

const MEDIUM_SIZE: VmSize = VmSize {
    cpu_cores: 4,
    memory: ByteSize::gib(8),
    disk: ByteSize::gib(16),
};

const LARGE_SIZE: VmSize = VmSize {
    cpu_cores: 6,
    memory: ByteSize::gib(20),
    disk: ByteSize::gib(50),
};

/// Pick the VM allocation for a runner requesting `labels`.
///
/// Sizes are checked in escalating order and the last match wins, so a job
/// labelled both medium and large gets the large allocation.
pub fn size_for_labels<S: AsRef<str>>(labels: &[S]) -> VmSize {
    let has = |wanted: &str| labels.iter().any(|l| l.as_ref() == wanted);
    let mut size = DEFAULT_SIZE;
    if has(MEDIUM_RUNNER_LABEL) {
        size = MEDIUM_SIZE;
    }
    if has(LARGE_RUNNER_LABEL) {
        size = LARGE_SIZE;
    }
    size
}
