use std::fmt;

/// Where a buffer lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Device {
    /// Host memory.
    Cpu,
    /// Accelerator memory, identified by device ordinal.
    Cuda(u32),
}

impl Device {
    /// Returns true if the buffer lives in accelerator memory.
    pub fn is_cuda(&self) -> bool {
        matches!(self, Device::Cuda(_))
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Cuda(i) => write!(f, "cuda:{}", i),
        }
    }
}

/// An ordered execution queue on a device.
///
/// Work issued onto one stream executes in issue order. The host only
/// blocks on a stream through `ArrayBackend::synchronize`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stream {
    pub device: Device,
    pub id: u64,
}

impl Stream {
    /// The default stream of `device`.
    pub fn default_for(device: Device) -> Self {
        Stream { device, id: 0 }
    }
}
