// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Wire-level layout of the migration capability: the configuration-space
//! descriptor and the register block it points at.
//!
//! All registers are 32 bits wide, little-endian, and must be accessed with
//! exactly 4-byte naturally-aligned reads and writes.

use static_assertions::const_assert_eq;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;
use zerocopy::little_endian::U32;

/// Capability ID used to advertise the migration interface. Vendor-specific
/// per the PCI capability ID registry.
pub const MI_CAP_ID: u8 = 0x09;

/// Byte size of the register block.
pub const REGISTER_BLOCK_SIZE: u16 = 0x20;

/// `bar` value in [`CapabilityHeader`] selecting the legacy layout, where the
/// register block follows the descriptor directly in configuration space.
pub const BAR_NONE: u8 = 0xff;

/// Fixed size of one dirty-log segment.
pub const LOG_SEGMENT_SIZE: usize = 4096;

/// Maximum number of segments a log region may span.
pub const MAX_LOG_SEGMENTS: usize = 128;

/// Byte offset of a register within the block.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MigrationRegister(pub u16);

impl MigrationRegister {
    /// State transfer command (write-only).
    pub const STATE_CTL: Self = Self(0x00);
    /// Capacity of the guest buffer on write; last saved size on read.
    pub const STATE_SIZE: Self = Self(0x04);
    /// Low 32 bits of the guest state-buffer address.
    pub const STATE_BADDR_LO: Self = Self(0x08);
    /// High 32 bits of the guest state-buffer address.
    pub const STATE_BADDR_HI: Self = Self(0x0c);
    /// Dirty-log command (write-only).
    pub const LOG_CTL: Self = Self(0x10);
    /// Total size of the guest log region in bytes.
    pub const LOG_SIZE: Self = Self(0x14);
    /// Low 32 bits of the guest log-region address.
    pub const LOG_BADDR_LO: Self = Self(0x18);
    /// High 32 bits of the guest log-region address.
    pub const LOG_BADDR_HI: Self = Self(0x1c);
}

/// `STATE_CTL` command: clear transfer bookkeeping and the state registers.
pub const STATE_CTL_RESET: u32 = 0;
/// `STATE_CTL` command: pause the device and save its state to the guest buffer.
pub const STATE_CTL_SAVE: u32 = 1;
/// `STATE_CTL` command: restore device state from the guest buffer and resume.
pub const STATE_CTL_RESTORE: u32 = 2;

/// `LOG_CTL` command: clear any log session and the log registers.
pub const LOG_CTL_RESET: u32 = 0;
/// `LOG_CTL` command: map the log region and start the logging backend.
pub const LOG_CTL_ENABLE: u32 = 1;
/// `LOG_CTL` command: stop the logging backend and release the log region.
pub const LOG_CTL_DISABLE: u32 = 2;

/// The capability descriptor placed in configuration space.
///
/// For the legacy layout (`bar == BAR_NONE`), `cap_len` covers the descriptor
/// plus the register block, which follows at `base + 8`. For the BAR layout,
/// `cap_len` is 8 and `(bar, bar_offset)` locates the register block in a
/// memory-mapped BAR.
#[repr(C)]
#[derive(IntoBytes, FromBytes, Immutable, KnownLayout, Copy, Clone, Debug)]
pub struct CapabilityHeader {
    /// Capability ID ([`MI_CAP_ID`]).
    pub cap_id: u8,
    /// Offset of the next capability in the chain, 0 for the last.
    pub cap_next: u8,
    /// Total length of the capability structure.
    pub cap_len: u8,
    /// BAR index holding the register block, or [`BAR_NONE`].
    pub bar: u8,
    /// Byte offset of the register block within `bar`.
    pub bar_offset: U32,
}

const_assert_eq!(size_of::<CapabilityHeader>(), 8);
