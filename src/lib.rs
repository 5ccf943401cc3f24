// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//!
//! Register-driven live-migration control interface for passthrough-class PCI
//! devices. A migration orchestrator discovers the interface through a
//! capability descriptor in the device's configuration space, then drives two
//! independent sub-protocols through an eight-register block:
//!
//! - the *state* sub-block pauses the device, moves its serialized internal
//!   state across a DMA boundary to a guest-supplied buffer (and back), and
//!   resumes it on the target;
//! - the *log* sub-block points an external dirty-page logging engine at a
//!   guest-supplied log region so migration stays convergent while the device
//!   keeps running.
//!
//! The enclosing device model embeds a [`MigrationInterface`], binds its
//! save/restore and logging backends at construction time, advertises the
//! capability with [`MigrationInterface::advertise`], and routes configuration
//! or MMIO accesses that may fall in the register block to the `config_*` /
//! `mmio_*` dispatch methods. Everything the interface needs from its
//! surroundings is expressed as a collaborator trait: [`RunStateControl`] for
//! pause/resume, [`GuestAddressSpace`] for DMA and IOMMU translation,
//! [`SaveBackend`] and [`LogBackend`] for the device-specific machinery, and
//! [`CapabilitySpace`] for configuration-space allocation.
//!
//! All dispatch is synchronous and runs to completion within the register
//! write that triggered it. The hosting integration must serialize register
//! accesses per device (one trap/VM-exit handled at a time); invoking two
//! dispatch calls for the same device concurrently is not supported. There is
//! no cancellation: a caller wanting to abort a transfer waits for the
//! triggering write to return and then issues a reset. A stalled collaborator
//! call stalls the whole operation.

#![forbid(unsafe_code)]

pub mod spec;

mod dirty_log;
mod registers;
mod transfer;

/// Null collaborator implementations for embedders' tests.
pub mod test_helpers;

#[cfg(test)]
mod tests;

pub use dirty_log::LogError;
pub use transfer::TransferError;
pub use transfer::TransferState;

use dirty_log::LogSession;
use parking_lot::Mutex;
use registers::MigrationRegisters;
use registers::RegisterLocation;
use spec::BAR_NONE;
use spec::CapabilityHeader;
use spec::MI_CAP_ID;
use spec::REGISTER_BLOCK_SIZE;
use std::sync::Arc;
use thiserror::Error;
use zerocopy::IntoBytes;

/// Device run state requested through [`RunStateControl`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RunState {
    /// The device is executing and may touch guest memory.
    Running,
    /// The device is quiesced; its internal state is stable.
    Paused,
}

/// Lets the interface ask the owning runtime to pause or resume the device
/// around a state transfer.
pub trait RunStateControl: Send + Sync {
    /// Requests that the device be placed in `state` before the call returns.
    fn notify_run_state(&self, state: RunState) -> anyhow::Result<()>;
}

/// Failure reported by the guest address-space collaborator.
#[derive(Debug, Error)]
#[error("guest address space access failed")]
pub struct AddressSpaceError(#[source] pub anyhow::Error);

/// A host-side mapping of a contiguous guest physical range, kept alive for
/// as long as the handle is held.
pub trait PinnedRange: Send + Sync {
    /// Guest physical base of the range.
    fn base(&self) -> u64;
    /// Length of the range in bytes.
    fn len(&self) -> usize;
}

/// The DMA/IOMMU collaborator: translates guest physical addresses and moves
/// bytes across the boundary.
///
/// `write_range` and `read_range` are scoped, bounded copies: each call may
/// grant fewer bytes than requested (a page-boundary split, for example), and
/// the granted count must never exceed the requested length. Callers advance
/// and retry; a grant of zero means no forward progress is possible.
pub trait GuestAddressSpace: Send + Sync {
    /// Copies a prefix of `data` into guest memory at `gpa`, returning the
    /// granted length.
    fn write_range(&self, gpa: u64, data: &[u8]) -> Result<usize, AddressSpaceError>;

    /// Copies a prefix of `buf` out of guest memory at `gpa`, returning the
    /// granted length.
    fn read_range(&self, gpa: u64, buf: &mut [u8]) -> Result<usize, AddressSpaceError>;

    /// Establishes a long-lived mapping of `[gpa, gpa + len)` for ongoing
    /// device access, such as a dirty-log segment.
    fn pin_range(&self, gpa: u64, len: usize) -> Result<Arc<dyn PinnedRange>, AddressSpaceError>;
}

/// The device-specific save/restore backend: knows how to serialize and
/// deserialize this device's internal state. The blob format is opaque to the
/// migration interface.
pub trait SaveBackend: Send + Sync {
    /// Upper bound on the serialized state size, reported through
    /// `STATE_SIZE` after a reset so the orchestrator can size its buffer.
    fn max_state_size(&mut self) -> u32;

    /// Serializes the device's internal state.
    fn save(&mut self) -> anyhow::Result<Vec<u8>>;

    /// Reconstructs the device's internal state from `data`.
    fn restore(&mut self, data: &[u8]) -> anyhow::Result<()>;
}

/// The dirty-page logging backend: an external engine that records which
/// guest pages the device writes while migration is in progress.
pub trait LogBackend: Send + Sync {
    /// Hands the engine the pinned log segments it should record into.
    fn set_addr(&mut self, segments: &[Arc<dyn PinnedRange>]) -> anyhow::Result<()>;

    /// Starts recording.
    fn start(&mut self) -> anyhow::Result<()>;

    /// Stops recording. Segments remain valid until the call returns.
    fn stop(&mut self) -> anyhow::Result<()>;
}

/// The enclosing config space has no room left for a capability.
#[derive(Debug, Error)]
#[error("no configuration space remains for a {len}-byte capability")]
pub struct CapacitySaturated {
    /// Length of the capability that could not be placed.
    pub len: u8,
}

/// Configuration-space allocation in the enclosing device model.
///
/// The allocator owns the capability chain: `add_capability` writes the ID
/// and next-pointer fields and links the new capability in. The interface
/// fills the rest of the descriptor through `write`.
pub trait CapabilitySpace {
    /// Allocates `len` bytes of capability space, returning the config-space
    /// offset of the new capability.
    fn add_capability(&mut self, cap_id: u8, len: u8) -> Result<u16, CapacitySaturated>;

    /// Writes raw bytes into configuration space.
    fn write(&mut self, offset: u16, data: &[u8]);
}

/// Where the register block is placed by [`MigrationInterface::advertise`].
#[derive(Copy, Clone, Debug)]
pub enum CapabilityLayout {
    /// Legacy layout: the register block follows the descriptor directly in
    /// configuration space. Accesses arrive through `config_read`/`config_write`.
    ConfigSpace,
    /// The register block lives at `offset` within a memory-mapped BAR.
    /// Accesses arrive through `mmio_read`/`mmio_write`.
    Bar {
        /// BAR index holding the block.
        bar: u8,
        /// Byte offset of the block within the BAR.
        offset: u32,
    },
}

/// Errors installing the capability descriptor. Fatal to device setup.
#[derive(Debug, Error)]
pub enum AdvertiseError {
    /// The enclosing configuration space is full.
    #[error("configuration space exhausted")]
    ConfigSpaceExhausted(#[source] CapacitySaturated),
    /// The capability was already advertised for this device.
    #[error("migration capability already advertised")]
    AlreadyAdvertised,
}

/// The migration control interface for one device.
///
/// Owned by the enclosing device model; one instance per device, with
/// exclusive ownership of its register block.
pub struct MigrationInterface {
    regs: MigrationRegisters,
    location: Option<RegisterLocation>,
    transfer_state: TransferState,
    log_session: Option<LogSession>,
    run_state: Arc<dyn RunStateControl>,
    address_space: Arc<dyn GuestAddressSpace>,
    save_backend: Option<Arc<Mutex<dyn SaveBackend>>>,
    log_backend: Option<Arc<Mutex<dyn LogBackend>>>,
}

impl MigrationInterface {
    /// Creates a new interface with no backends bound and no capability
    /// advertised. Register accesses are ignored until
    /// [`advertise`](Self::advertise) succeeds.
    pub fn new(
        run_state: Arc<dyn RunStateControl>,
        address_space: Arc<dyn GuestAddressSpace>,
    ) -> Self {
        Self {
            regs: MigrationRegisters::new(),
            location: None,
            transfer_state: TransferState::Idle,
            log_session: None,
            run_state,
            address_space,
            save_backend: None,
            log_backend: None,
        }
    }

    /// Binds the save/restore backend. Last bind wins.
    ///
    /// Setup-time only: rebinding while a transfer is in flight or a log
    /// session is active is not supported.
    pub fn bind_save_backend(&mut self, backend: Arc<Mutex<dyn SaveBackend>>) {
        self.save_backend = Some(backend);
    }

    /// Binds the dirty-page logging backend. Last bind wins.
    ///
    /// Setup-time only, with the same restriction as
    /// [`bind_save_backend`](Self::bind_save_backend).
    pub fn bind_log_backend(&mut self, backend: Arc<Mutex<dyn LogBackend>>) {
        self.log_backend = Some(backend);
    }

    /// Installs the capability descriptor and records where the register
    /// block lives, marking the device migration-capable. Returns the
    /// config-space offset of the descriptor.
    pub fn advertise(
        &mut self,
        space: &mut dyn CapabilitySpace,
        layout: CapabilityLayout,
    ) -> Result<u16, AdvertiseError> {
        if self.location.is_some() {
            return Err(AdvertiseError::AlreadyAdvertised);
        }

        let header_len = size_of::<CapabilityHeader>() as u8;
        let (cap_len, bar, bar_offset) = match layout {
            CapabilityLayout::ConfigSpace => {
                (header_len + REGISTER_BLOCK_SIZE as u8, BAR_NONE, 0)
            }
            CapabilityLayout::Bar { bar, offset } => (header_len, bar, offset),
        };

        let base = space
            .add_capability(MI_CAP_ID, cap_len)
            .map_err(AdvertiseError::ConfigSpaceExhausted)?;

        let header = CapabilityHeader {
            cap_id: MI_CAP_ID,
            cap_next: 0,
            cap_len,
            bar,
            bar_offset: bar_offset.into(),
        };
        // The allocator owns the ID and next-pointer fields; fill in the rest
        // of the descriptor.
        space.write(base + 2, &header.as_bytes()[2..]);

        self.location = Some(match layout {
            CapabilityLayout::ConfigSpace => RegisterLocation::Config {
                regs_base: base + header_len as u16,
            },
            CapabilityLayout::Bar { bar, offset } => RegisterLocation::Bar { bar, offset },
        });

        tracing::info!(base, ?layout, "advertised migration capability");
        Ok(base)
    }

    /// Whether [`advertise`](Self::advertise) has succeeded.
    pub fn is_advertised(&self) -> bool {
        self.location.is_some()
    }

    /// Current state of the transfer state machine.
    pub fn transfer_state(&self) -> TransferState {
        self.transfer_state
    }

    /// Whether a dirty-log session is active.
    pub fn log_enabled(&self) -> bool {
        self.log_session.is_some()
    }

    /// Number of pinned segments in the active log session, if any.
    pub fn log_segment_count(&self) -> Option<usize> {
        self.log_session.as_ref().map(|s| s.segment_count())
    }
}
