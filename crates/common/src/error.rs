use thiserror::Error;

use crate::ids::{KernelId, NodeId};

/// Protocol stage at which a transport operation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportStage {
    /// Serializing or sending the begin-transmission header frame.
    BeginTransmission,
    /// Waiting for or decoding the begin-transmission acknowledgment.
    Acknowledgment,
    /// Sending or receiving a data frame.
    Frame,
}

impl std::fmt::Display for TransportStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TransportStage::BeginTransmission => "begin-transmission",
            TransportStage::Acknowledgment => "acknowledgment",
            TransportStage::Frame => "frame",
        };
        write!(f, "{s}")
    }
}

/// Failure class for a transport error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// The per-message timeout expired before completion.
    Timeout,
    /// The peer rejected the transmission (non-OK acknowledgment status).
    Refused,
    /// A frame or header failed to decode.
    Corrupt,
    /// The peer connection dropped mid-message.
    PeerGone,
}

impl std::fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TransportErrorKind::Timeout => "timeout",
            TransportErrorKind::Refused => "refused",
            TransportErrorKind::Corrupt => "corrupt",
            TransportErrorKind::PeerGone => "peer gone",
        };
        write!(f, "{s}")
    }
}

/// Resource class for a [`FfrError::ResourceExhausted`] failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    /// Pool or host memory.
    Memory,
    /// Spill-directory disk space.
    Disk,
    /// Open file handles.
    FileHandle,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ResourceKind::Memory => "memory",
            ResourceKind::Disk => "disk",
            ResourceKind::FileHandle => "file handle",
        };
        write!(f, "{s}")
    }
}

/// Canonical FFR error taxonomy used across crates.
///
/// Classification guidance:
/// - [`FfrError::PlanParse`]: textual plan problems found while building the graph
/// - [`FfrError::Kernel`]: runtime failures inside one kernel's `run` loop
/// - [`FfrError::Transport`]: inter-node messaging failures, attributed to a peer
/// - [`FfrError::ResourceExhausted`]: memory/disk/handle pressure; first occurrence
///   in a monitor period triggers spill, a second becomes fatal
/// - [`FfrError::Closed`]: benign cache-after-shutdown signal, converted to a
///   graceful termination by kernels
/// - [`FfrError::Cancelled`]: benign cooperative cancellation
#[derive(Debug, Error)]
pub enum FfrError {
    /// The textual plan could not be parsed or instantiated.
    ///
    /// Fatal to the query at construction time; partial caches are disposed.
    #[error("plan parse error at line {line}: {reason}")]
    PlanParse {
        /// 1-based line number in the plan text.
        line: usize,
        /// Human-readable parse failure description.
        reason: String,
    },

    /// A kernel failed at runtime.
    ///
    /// Stored in the graph's error slot; downstream kernels observe closed
    /// caches and terminate cleanly.
    #[error("kernel {kernel_id} failed: {reason}")]
    Kernel {
        /// Id of the failing kernel.
        kernel_id: KernelId,
        /// Human-readable failure description.
        reason: String,
    },

    /// An inter-node transport operation failed.
    ///
    /// Equivalent to a kernel error on the sending kernel.
    #[error("transport error with node {node_id} during {stage}: {kind}")]
    Transport {
        /// Peer node involved in the failed exchange.
        node_id: NodeId,
        /// Protocol stage that failed.
        stage: TransportStage,
        /// Failure class.
        kind: TransportErrorKind,
    },

    /// A pool-level resource ran out.
    #[error("{kind} exhausted: {detail}")]
    ResourceExhausted {
        /// Which resource ran out.
        kind: ResourceKind,
        /// Human-readable context.
        detail: String,
    },

    /// A cache operation was attempted after the cache was closed.
    #[error("cache is closed")]
    Closed,

    /// The query was cancelled cooperatively.
    #[error("query cancelled")]
    Cancelled,

    /// The output kernel's result set was already taken.
    #[error("query results were already released")]
    AlreadyReleased,

    /// Transparent std IO failures.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl FfrError {
    /// Returns whether this error terminates the query without being a failure
    /// (cache closure during shutdown, cooperative cancellation).
    pub fn is_benign(&self) -> bool {
        matches!(self, FfrError::Closed | FfrError::Cancelled)
    }

    /// Attribute an error to the kernel whose run loop surfaced it.
    ///
    /// Benign, transport, and resource errors keep their variant; kernel
    /// errors already attributed to a real kernel keep their owner; anything
    /// else (including helper errors stamped with the head sentinel) becomes
    /// a [`FfrError::Kernel`] on `kernel_id`.
    pub fn for_kernel(self, kernel_id: KernelId) -> FfrError {
        match self {
            e @ (FfrError::Closed
            | FfrError::Cancelled
            | FfrError::Transport { .. }
            | FfrError::ResourceExhausted { .. }) => e,
            FfrError::Kernel {
                kernel_id: owner,
                reason,
            } => FfrError::Kernel {
                kernel_id: if owner == KernelId::HEAD { kernel_id } else { owner },
                reason,
            },
            other => FfrError::Kernel {
                kernel_id,
                reason: other.to_string(),
            },
        }
    }
}

/// Standard FFR result alias.
pub type Result<T> = std::result::Result<T, FfrError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn for_kernel_restamps_sentinel_errors_and_keeps_owners() {
        let sentinel = FfrError::Kernel {
            kernel_id: KernelId::HEAD,
            reason: "downcast failed".to_string(),
        };
        match sentinel.for_kernel(KernelId(4)) {
            FfrError::Kernel { kernel_id, .. } => assert_eq!(kernel_id, KernelId(4)),
            other => panic!("expected kernel error, got {other}"),
        }

        let owned = FfrError::Kernel {
            kernel_id: KernelId(2),
            reason: "bad batch".to_string(),
        };
        match owned.for_kernel(KernelId(4)) {
            FfrError::Kernel { kernel_id, .. } => assert_eq!(kernel_id, KernelId(2)),
            other => panic!("expected kernel error, got {other}"),
        }
    }

    #[test]
    fn for_kernel_preserves_benign_transport_and_resource_variants() {
        assert!(matches!(
            FfrError::Cancelled.for_kernel(KernelId(1)),
            FfrError::Cancelled
        ));
        assert!(matches!(
            FfrError::Transport {
                node_id: NodeId(3),
                stage: TransportStage::Frame,
                kind: TransportErrorKind::Timeout,
            }
            .for_kernel(KernelId(1)),
            FfrError::Transport { .. }
        ));
        assert!(matches!(
            FfrError::ResourceExhausted {
                kind: ResourceKind::Disk,
                detail: "spill write failed".to_string(),
            }
            .for_kernel(KernelId(1)),
            FfrError::ResourceExhausted { .. }
        ));
    }
}
