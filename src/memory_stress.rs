use sysinfo::System;
use tracing::info;

use crate::error::Error;

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Memory held resident until dropped.
pub struct MemoryBlock {
    data: Vec<u8>,
}

impl MemoryBlock {
    pub fn len(&self) -> usize {
        self.data.len()
    }
}

/// Allocates `gib` GiB and writes every byte so the pages are really backed.
pub fn stress_memory(gib: f64) -> Result<MemoryBlock, Error> {
    let bytes = gib_to_bytes(gib)?;
    if bytes == 0 {
        return Ok(MemoryBlock { data: Vec::new() });
    }

    let mut data = Vec::new();
    data.try_reserve_exact(bytes).map_err(|_| Error::Memory(gib))?;
    data.extend((0..bytes).map(|i| i as u8));

    info!("Allocated {:.2} GiB", gib);
    Ok(MemoryBlock { data })
}

fn gib_to_bytes(gib: f64) -> Result<usize, Error> {
    if !(gib > 0.0) {
        return Ok(0);
    }
    let bytes = (gib * GIB).trunc();
    if bytes > usize::MAX as f64 {
        return Err(Error::Memory(gib));
    }
    Ok(bytes as usize)
}

pub fn check_memory_usage() {
    let mut sys = System::new();
    sys.refresh_memory();

    info!("Total Memory: {} MB", sys.total_memory() / 1024 / 1024);
    info!("Used Memory: {} MB", sys.used_memory() / 1024 / 1024);
}
