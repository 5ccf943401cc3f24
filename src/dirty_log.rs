// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The dirty-log controller: maps a guest-supplied log region into fixed-size
//! pinned segments and drives the logging backend's lifecycle.

use crate::AddressSpaceError;
use crate::MigrationInterface;
use crate::PinnedRange;
use crate::spec;
use std::sync::Arc;
use thiserror::Error;

/// An active log session. Holding the pinned segments keeps their mappings
/// alive for the logging engine until the session is dropped.
pub(crate) struct LogSession {
    segments: Vec<Arc<dyn PinnedRange>>,
}

impl LogSession {
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }
}

/// A failed dirty-log command. Surfaced as a diagnostic by the register
/// dispatch path; log state is unchanged by every rejection.
#[derive(Debug, Error)]
pub enum LogError {
    /// Enable was issued while a session was already active.
    #[error("log enable issued while a log session is already active")]
    AlreadyEnabled,
    /// Disable was issued with no active session.
    #[error("log disable issued with no active log session")]
    NotEnabled,
    /// No logging backend is bound.
    #[error("no logging backend bound")]
    BackendUnavailable,
    /// The log region size register is zero.
    #[error("log region size of zero")]
    EmptyRegion,
    /// The region needs more segments than the interface supports. Rejected
    /// before any mapping is attempted.
    #[error("log region needs {required} segments but at most {max} are supported")]
    CapacityExceeded {
        /// Segments the region would need.
        required: usize,
        /// Supported maximum.
        max: usize,
    },
    /// The address-space collaborator failed to pin a segment.
    #[error("failed to pin log segment at {gpa:#x}")]
    AddressSpace {
        /// Guest address of the failed segment.
        gpa: u64,
        /// Collaborator failure.
        #[source]
        source: AddressSpaceError,
    },
    /// The logging backend rejected the segment list or a lifecycle call.
    #[error("logging backend failed")]
    Backend(#[source] anyhow::Error),
}

impl MigrationInterface {
    pub(crate) fn handle_log_ctl(&mut self, command: u32) {
        let result = match command {
            spec::LOG_CTL_RESET => {
                self.log_reset();
                Ok(())
            }
            spec::LOG_CTL_ENABLE => self.log_enable(),
            spec::LOG_CTL_DISABLE => self.log_disable(),
            _ => {
                tracing::warn!(command, "unknown log control command");
                Ok(())
            }
        };
        if let Err(err) = result {
            tracing::warn!("dirty log command failed: {err:?}");
        }
    }

    /// Clears any active session and the log registers. Always succeeds;
    /// no-op when already disabled.
    fn log_reset(&mut self) {
        if self.log_session.is_some() {
            // Stop the engine before its segments are unpinned. A stop
            // failure here is only a warning; reset must always succeed.
            if let Some(backend) = &self.log_backend {
                if let Err(err) = backend.lock().stop() {
                    tracing::warn!("logging backend stop failed during reset: {err:?}");
                }
            }
            self.log_session = None;
            tracing::info!("dirty log session cleared by reset");
        }
        self.regs.log_size = 0;
        self.regs.log_baddr_lo = 0;
        self.regs.log_baddr_hi = 0;
    }

    /// Pins the log region segment by segment, hands the list to the backend,
    /// and starts it.
    fn log_enable(&mut self) -> Result<(), LogError> {
        if self.log_session.is_some() {
            return Err(LogError::AlreadyEnabled);
        }
        let size = self.regs.log_size as u64;
        if size == 0 {
            return Err(LogError::EmptyRegion);
        }
        let required = size.div_ceil(spec::LOG_SEGMENT_SIZE as u64) as usize;
        if required > spec::MAX_LOG_SEGMENTS {
            return Err(LogError::CapacityExceeded {
                required,
                max: spec::MAX_LOG_SEGMENTS,
            });
        }
        let backend = self.log_backend.clone().ok_or(LogError::BackendUnavailable)?;

        let base = self.regs.log_baddr();
        let mut segments = Vec::with_capacity(required);
        for i in 0..required {
            let gpa = base + (i * spec::LOG_SEGMENT_SIZE) as u64;
            let segment = self
                .address_space
                .pin_range(gpa, spec::LOG_SEGMENT_SIZE)
                .map_err(|source| LogError::AddressSpace { gpa, source })?;
            // A short grant means the caller or IOMMU misconfigured the
            // region; the logging engine cannot safely run past it.
            assert_eq!(
                segment.len(),
                spec::LOG_SEGMENT_SIZE,
                "short log segment mapping at {gpa:#x}"
            );
            segments.push(segment);
        }

        {
            let mut backend = backend.lock();
            backend.set_addr(&segments).map_err(LogError::Backend)?;
            backend.start().map_err(LogError::Backend)?;
        }

        self.log_session = Some(LogSession { segments });
        tracing::info!(base, size, count = required, "dirty page logging enabled");
        Ok(())
    }

    /// Stops the backend, then releases the session's segments. If the stop
    /// call fails the session is kept: segments must not be unpinned under a
    /// logging engine that may still be writing to them.
    fn log_disable(&mut self) -> Result<(), LogError> {
        if self.log_session.is_none() {
            return Err(LogError::NotEnabled);
        }
        let backend = self.log_backend.clone().ok_or(LogError::BackendUnavailable)?;
        backend.lock().stop().map_err(LogError::Backend)?;
        self.log_session = None;
        tracing::info!("dirty page logging disabled");
        Ok(())
    }
}
