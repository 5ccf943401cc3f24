// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Register storage and the access engine that validates and dispatches
//! configuration-space and MMIO accesses to the block.

use crate::MigrationInterface;
use crate::spec::MigrationRegister;
use crate::spec::REGISTER_BLOCK_SIZE;

/// Where the register block was placed by `advertise`.
#[derive(Copy, Clone, Debug)]
pub(crate) enum RegisterLocation {
    /// Registers in configuration space, starting at `regs_base`.
    Config { regs_base: u16 },
    /// Registers at `offset` within BAR `bar`.
    Bar { bar: u8, offset: u32 },
}

/// Backing storage for the readable/writable registers. The two control
/// registers are write-only commands and have no storage.
#[derive(Debug, Default)]
pub(crate) struct MigrationRegisters {
    pub state_size: u32,
    pub state_baddr_lo: u32,
    pub state_baddr_hi: u32,
    pub log_size: u32,
    pub log_baddr_lo: u32,
    pub log_baddr_hi: u32,
}

impl MigrationRegisters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Guest physical address of the state-transfer buffer.
    pub fn state_baddr(&self) -> u64 {
        (self.state_baddr_hi as u64) << 32 | self.state_baddr_lo as u64
    }

    /// Guest physical address of the dirty-log region.
    pub fn log_baddr(&self) -> u64 {
        (self.log_baddr_hi as u64) << 32 | self.log_baddr_lo as u64
    }
}

impl MigrationInterface {
    /// Handles an MMIO write that may target the register block.
    ///
    /// Returns `false` without mutating anything when the access is not for
    /// this block: the capability is not advertised (or not BAR-mapped), the
    /// BAR or address is out of range, or the access is not a naturally
    /// aligned 4-byte write.
    pub fn mmio_write(&mut self, bar: u8, addr: u64, data: &[u8]) -> bool {
        let Some(reg) = self.mmio_offset(bar, addr, data.len()) else {
            return false;
        };
        let Ok(bytes) = data.try_into() else {
            return false;
        };
        self.write_register(reg, u32::from_le_bytes(bytes));
        true
    }

    /// Handles an MMIO read that may target the register block. Reads have no
    /// side effects; the two write-only control registers read as zero.
    ///
    /// Returns `false` without touching `data` when the access is not for
    /// this block, under the same rules as [`mmio_write`](Self::mmio_write).
    pub fn mmio_read(&self, bar: u8, addr: u64, data: &mut [u8]) -> bool {
        let Some(reg) = self.mmio_offset(bar, addr, data.len()) else {
            return false;
        };
        data.copy_from_slice(&self.read_register(reg).to_le_bytes());
        true
    }

    /// Handles a configuration-space write that may target the legacy
    /// in-config-space register block. Same claiming rules as
    /// [`mmio_write`](Self::mmio_write).
    pub fn config_write(&mut self, addr: u16, value: u32, len: usize) -> bool {
        let Some(reg) = self.config_offset(addr, len) else {
            return false;
        };
        self.write_register(reg, value);
        true
    }

    /// Handles a configuration-space read that may target the legacy
    /// register block. Returns `None` when the access is not for this block.
    pub fn config_read(&self, addr: u16, len: usize) -> Option<u32> {
        let reg = self.config_offset(addr, len)?;
        Some(self.read_register(reg))
    }

    fn mmio_offset(&self, bar: u8, addr: u64, len: usize) -> Option<MigrationRegister> {
        let Some(RegisterLocation::Bar {
            bar: block_bar,
            offset,
        }) = self.location
        else {
            return None;
        };
        if bar != block_bar {
            return None;
        }
        let base = offset as u64;
        if !(base..base + REGISTER_BLOCK_SIZE as u64).contains(&addr) {
            return None;
        }
        let reg = (addr - base) as u16;
        check_access(reg, len)
    }

    fn config_offset(&self, addr: u16, len: usize) -> Option<MigrationRegister> {
        let Some(RegisterLocation::Config { regs_base }) = self.location else {
            return None;
        };
        if !(regs_base..regs_base + REGISTER_BLOCK_SIZE).contains(&addr) {
            return None;
        }
        check_access(addr - regs_base, len)
    }

    fn read_register(&self, reg: MigrationRegister) -> u32 {
        match reg {
            // Write-only registers.
            MigrationRegister::STATE_CTL
            | MigrationRegister::LOG_CTL
            | MigrationRegister::LOG_SIZE => 0,
            MigrationRegister::STATE_SIZE => self.regs.state_size,
            MigrationRegister::STATE_BADDR_LO => self.regs.state_baddr_lo,
            MigrationRegister::STATE_BADDR_HI => self.regs.state_baddr_hi,
            MigrationRegister::LOG_BADDR_LO => self.regs.log_baddr_lo,
            MigrationRegister::LOG_BADDR_HI => self.regs.log_baddr_hi,
            _ => {
                tracing::debug!(offset = reg.0, "read of unhandled migration register");
                0
            }
        }
    }

    fn write_register(&mut self, reg: MigrationRegister, value: u32) {
        match reg {
            MigrationRegister::STATE_CTL => self.handle_state_ctl(value),
            MigrationRegister::STATE_SIZE => self.regs.state_size = value,
            MigrationRegister::STATE_BADDR_LO => self.regs.state_baddr_lo = value,
            MigrationRegister::STATE_BADDR_HI => self.regs.state_baddr_hi = value,
            MigrationRegister::LOG_CTL => self.handle_log_ctl(value),
            MigrationRegister::LOG_SIZE => self.regs.log_size = value,
            MigrationRegister::LOG_BADDR_LO => self.regs.log_baddr_lo = value,
            MigrationRegister::LOG_BADDR_HI => self.regs.log_baddr_hi = value,
            _ => {
                tracing::warn!(offset = reg.0, value, "write to unhandled migration register");
            }
        }
    }
}

/// Rejects anything but a naturally aligned 4-byte access. A partial or
/// misaligned write must never corrupt a register.
fn check_access(reg: u16, len: usize) -> Option<MigrationRegister> {
    if len != 4 || reg % 4 != 0 {
        tracing::warn!(
            offset = reg,
            len,
            "rejected misaligned or non-dword migration register access"
        );
        return None;
    }
    Some(MigrationRegister(reg))
}
