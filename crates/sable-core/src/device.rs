use std::fmt;

// Device — Where a buffer lives
//
// A Device is a plain value: Host memory, or one accelerator identified by
// its ordinal. It carries no handles and no behavior beyond classification;
// the actual memory operations go through the MemoryPool and the
// Accelerator registered with it.
//
// Device selection is always explicit. Every device-sensitive call takes a
// Device argument; there is no ambient "current device".

/// The memory domain of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    Host,
    Accelerator,
}

/// A compute location: the host, or an accelerator ordinal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Device {
    kind: DeviceKind,
    index: usize,
}

impl Device {
    /// The host (CPU memory) device.
    pub const fn host() -> Self {
        Device {
            kind: DeviceKind::Host,
            index: 0,
        }
    }

    /// The accelerator with the given ordinal (0, 1, ...).
    pub const fn accelerator(index: usize) -> Self {
        Device {
            kind: DeviceKind::Accelerator,
            index,
        }
    }

    pub fn kind(&self) -> DeviceKind {
        self.kind
    }

    /// Accelerator ordinal. Always 0 for the host.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn is_host(&self) -> bool {
        self.kind == DeviceKind::Host
    }

    pub fn is_accelerator(&self) -> bool {
        self.kind == DeviceKind::Accelerator
    }
}

impl Default for Device {
    fn default() -> Self {
        Device::host()
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            DeviceKind::Host => write!(f, "host"),
            DeviceKind::Accelerator => write!(f, "accel:{}", self.index),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_structural_equality() {
        assert_eq!(Device::accelerator(1), Device::accelerator(1));
        assert_ne!(Device::accelerator(0), Device::accelerator(1));
        assert_ne!(Device::host(), Device::accelerator(0));
    }

    #[test]
    fn test_display() {
        assert_eq!(Device::host().to_string(), "host");
        assert_eq!(Device::accelerator(2).to_string(), "accel:2");
    }
}
