// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The state transfer engine: pause, serialize, and copy device state out to
//! a guest buffer; copy it back in, deserialize, and resume.

use crate::AddressSpaceError;
use crate::MigrationInterface;
use crate::RunState;
use crate::spec;
use thiserror::Error;

/// State of the transfer machine. `Saving` and `Restoring` latch once the
/// operation runs (successfully or not) and only a reset returns the machine
/// to `Idle`, so back-to-back transfer commands are rejected.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TransferState {
    /// No transfer has run since the last reset.
    Idle,
    /// A save has been attempted.
    Saving,
    /// A restore has been attempted.
    Restoring,
}

/// A failed transfer command. Surfaced as a diagnostic by the register
/// dispatch path; the register recovery state is documented per variant in
/// the crate-level error taxonomy.
#[derive(Debug, Error)]
pub enum TransferError {
    /// A transfer command arrived while another transfer was latched.
    #[error("state command {command:#x} issued while {state:?}")]
    WrongState {
        /// The rejected command value.
        command: u32,
        /// The state the machine was in.
        state: TransferState,
    },
    /// No save/restore backend is bound.
    #[error("no save/restore backend bound")]
    BackendUnavailable,
    /// The owning runtime failed to pause the device.
    #[error("failed to pause the device")]
    Pause(#[source] anyhow::Error),
    /// The backend failed to serialize or deserialize the state blob.
    #[error("save/restore backend failed")]
    Backend(#[source] anyhow::Error),
    /// The address-space collaborator failed outright.
    #[error("guest buffer access failed at {gpa:#x}")]
    AddressSpace {
        /// Guest address of the failed chunk.
        gpa: u64,
        /// Collaborator failure.
        #[source]
        source: AddressSpaceError,
    },
    /// The address-space collaborator granted zero bytes; the copy cannot
    /// make forward progress.
    #[error("address space granted no progress at {gpa:#x}")]
    NoProgress {
        /// Guest address of the stalled chunk.
        gpa: u64,
    },
}

impl MigrationInterface {
    pub(crate) fn handle_state_ctl(&mut self, command: u32) {
        match command {
            spec::STATE_CTL_RESET => self.state_reset(),
            spec::STATE_CTL_SAVE => {
                if let Err(err) = self.state_save() {
                    tracing::warn!("device state save failed: {err:?}");
                }
            }
            spec::STATE_CTL_RESTORE => {
                if let Err(err) = self.state_restore() {
                    tracing::warn!("device state restore failed: {err:?}");
                }
            }
            _ => tracing::warn!(command, "unknown state control command"),
        }
    }

    /// Clears transfer bookkeeping and the state registers. `STATE_SIZE` is
    /// repopulated with the backend's size bound so the orchestrator can read
    /// back how large a buffer to provision. Always succeeds; idempotent.
    fn state_reset(&mut self) {
        self.transfer_state = TransferState::Idle;
        self.regs.state_baddr_lo = 0;
        self.regs.state_baddr_hi = 0;
        self.regs.state_size = match &self.save_backend {
            Some(backend) => backend.lock().max_state_size(),
            None => 0,
        };
        tracing::debug!(
            max_size = self.regs.state_size,
            "reset migration state registers"
        );
    }

    /// Pause, serialize, copy out. On failure before any byte is staged the
    /// saved-size register is zeroed; a mid-copy failure leaves it untouched.
    /// Every failure path leaves the device paused for the caller to recover
    /// with a reset.
    fn state_save(&mut self) -> Result<(), TransferError> {
        if self.transfer_state != TransferState::Idle {
            return Err(TransferError::WrongState {
                command: spec::STATE_CTL_SAVE,
                state: self.transfer_state,
            });
        }
        self.transfer_state = TransferState::Saving;

        if let Err(err) = self.run_state.notify_run_state(RunState::Paused) {
            self.regs.state_size = 0;
            return Err(TransferError::Pause(err));
        }
        let Some(backend) = self.save_backend.clone() else {
            self.regs.state_size = 0;
            return Err(TransferError::BackendUnavailable);
        };
        let blob = match backend.lock().save() {
            Ok(blob) => blob,
            Err(err) => {
                self.regs.state_size = 0;
                return Err(TransferError::Backend(err));
            }
        };

        self.copy_to_guest(self.regs.state_baddr(), &blob)?;
        self.regs.state_size = blob.len() as u32;
        tracing::info!(
            len = blob.len(),
            gpa = self.regs.state_baddr(),
            "device state saved to guest buffer"
        );
        Ok(())
    }

    /// Copy in, deserialize, resume. Resume is attempted in every failure
    /// path past the state check: a half-restored but running device is less
    /// harmful than one stuck unresponsive.
    fn state_restore(&mut self) -> Result<(), TransferError> {
        if self.transfer_state != TransferState::Idle {
            return Err(TransferError::WrongState {
                command: spec::STATE_CTL_RESTORE,
                state: self.transfer_state,
            });
        }
        self.transfer_state = TransferState::Restoring;

        let result = self.restore_from_guest();
        if let Err(err) = self.run_state.notify_run_state(RunState::Running) {
            tracing::warn!("failed to resume device after restore: {err:?}");
        }
        result
    }

    fn restore_from_guest(&mut self) -> Result<(), TransferError> {
        let Some(backend) = self.save_backend.clone() else {
            return Err(TransferError::BackendUnavailable);
        };
        let len = self.regs.state_size as usize;
        let mut blob = vec![0; len];
        self.copy_from_guest(self.regs.state_baddr(), &mut blob)?;
        backend.lock().restore(&blob).map_err(TransferError::Backend)?;
        tracing::info!(len, "device state restored from guest buffer");
        Ok(())
    }

    /// Copies `data` to guest memory chunk by chunk, advancing by whatever
    /// length the address space grants per call.
    fn copy_to_guest(&self, gpa: u64, data: &[u8]) -> Result<(), TransferError> {
        let mut done = 0;
        while done < data.len() {
            let chunk_gpa = gpa + done as u64;
            let granted = self
                .address_space
                .write_range(chunk_gpa, &data[done..])
                .map_err(|source| TransferError::AddressSpace {
                    gpa: chunk_gpa,
                    source,
                })?;
            if granted == 0 {
                return Err(TransferError::NoProgress { gpa: chunk_gpa });
            }
            assert!(granted <= data.len() - done, "grant exceeds request");
            tracing::trace!(gpa = chunk_gpa, granted, "copied state chunk to guest");
            done += granted;
        }
        Ok(())
    }

    /// Fills `buf` from guest memory with the same chunking discipline as
    /// [`copy_to_guest`](Self::copy_to_guest).
    fn copy_from_guest(&self, gpa: u64, buf: &mut [u8]) -> Result<(), TransferError> {
        let mut done = 0;
        while done < buf.len() {
            let chunk_gpa = gpa + done as u64;
            let remaining = buf.len() - done;
            let granted = self
                .address_space
                .read_range(chunk_gpa, &mut buf[done..])
                .map_err(|source| TransferError::AddressSpace {
                    gpa: chunk_gpa,
                    source,
                })?;
            if granted == 0 {
                return Err(TransferError::NoProgress { gpa: chunk_gpa });
            }
            assert!(granted <= remaining, "grant exceeds request");
            tracing::trace!(gpa = chunk_gpa, granted, "copied state chunk from guest");
            done += granted;
        }
        Ok(())
    }
}
