// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::AddressSpaceError;
use crate::GuestAddressSpace;
use crate::LogBackend;
use crate::MigrationInterface;
use crate::PinnedRange;
use crate::RunState;
use crate::RunStateControl;
use crate::SaveBackend;
use parking_lot::Mutex;
use std::sync::Arc;

/// Run-state collaborator that accepts every request.
pub struct NullRunStateControl;

impl RunStateControl for NullRunStateControl {
    fn notify_run_state(&self, _state: RunState) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Save backend with no state: zero size bound, empty blob, restore accepted.
pub struct NullSaveBackend;

impl SaveBackend for NullSaveBackend {
    fn max_state_size(&mut self) -> u32 {
        0
    }

    fn save(&mut self) -> anyhow::Result<Vec<u8>> {
        Ok(Vec::new())
    }

    fn restore(&mut self, _data: &[u8]) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Logging backend that accepts every call and records nothing.
pub struct NullLogBackend;

impl LogBackend for NullLogBackend {
    fn set_addr(&mut self, _segments: &[Arc<dyn PinnedRange>]) -> anyhow::Result<()> {
        Ok(())
    }

    fn start(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    fn stop(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// A pinned range that records only its placement. Suitable for address
/// spaces whose backing memory is reachable by other means.
pub struct PinnedSegment {
    base: u64,
    len: usize,
}

impl PinnedSegment {
    pub fn new(base: u64, len: usize) -> Self {
        Self { base, len }
    }
}

impl PinnedRange for PinnedSegment {
    fn base(&self) -> u64 {
        self.base
    }

    fn len(&self) -> usize {
        self.len
    }
}

/// Guest RAM emulated as one flat allocation starting at physical address 0,
/// granting every request in full.
pub struct GuestRam {
    mem: Mutex<Vec<u8>>,
}

impl GuestRam {
    pub fn new(size: usize) -> Self {
        Self {
            mem: Mutex::new(vec![0; size]),
        }
    }

    /// Copies out of RAM, for asserting on what a device wrote.
    pub fn read(&self, gpa: u64, buf: &mut [u8]) {
        let mem = self.mem.lock();
        let start = gpa as usize;
        buf.copy_from_slice(&mem[start..start + buf.len()]);
    }

    /// Copies into RAM, for staging a buffer a device will read.
    pub fn write(&self, gpa: u64, data: &[u8]) {
        let mut mem = self.mem.lock();
        let start = gpa as usize;
        mem[start..start + data.len()].copy_from_slice(data);
    }

    fn check_range(&self, gpa: u64, len: usize) -> Result<usize, AddressSpaceError> {
        let size = self.mem.lock().len();
        let start = usize::try_from(gpa)
            .ok()
            .filter(|&start| start.checked_add(len).is_some_and(|end| end <= size));
        match start {
            Some(start) => Ok(start),
            None => Err(AddressSpaceError(anyhow::anyhow!(
                "access at {gpa:#x}+{len:#x} outside guest ram of {size:#x} bytes"
            ))),
        }
    }
}

impl GuestAddressSpace for GuestRam {
    fn write_range(&self, gpa: u64, data: &[u8]) -> Result<usize, AddressSpaceError> {
        let start = self.check_range(gpa, data.len())?;
        self.mem.lock()[start..start + data.len()].copy_from_slice(data);
        Ok(data.len())
    }

    fn read_range(&self, gpa: u64, buf: &mut [u8]) -> Result<usize, AddressSpaceError> {
        let start = self.check_range(gpa, buf.len())?;
        buf.copy_from_slice(&self.mem.lock()[start..start + buf.len()]);
        Ok(buf.len())
    }

    fn pin_range(&self, gpa: u64, len: usize) -> Result<Arc<dyn PinnedRange>, AddressSpaceError> {
        self.check_range(gpa, len)?;
        Ok(Arc::new(PinnedSegment::new(gpa, len)))
    }
}

/// A migration interface wired to null collaborators, for embedders that need
/// a device model to hold one without exercising it.
pub fn make_null_interface(ram_size: usize) -> MigrationInterface {
    let mut interface =
        MigrationInterface::new(Arc::new(NullRunStateControl), Arc::new(GuestRam::new(ram_size)));
    interface.bind_save_backend(Arc::new(Mutex::new(NullSaveBackend)));
    interface.bind_log_backend(Arc::new(Mutex::new(NullLogBackend)));
    interface
}
