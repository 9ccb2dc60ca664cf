// src/error.rs
//! Error taxonomy for card control
//!
//! Every failure surfaced by the crate is a [`CardError`]. Hardware fault
//! codes reported by the register interface are translated once, at the
//! point of the failing register access, and never retried.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::hal::{FaultCategory, FaultCode, HalResult, Register};

/// Result type alias for card operations
pub type CardResult<T> = Result<T, CardError>;

/// Unified error type for card, hub and pulse generator operations
#[derive(Debug, Error)]
pub enum CardError {
    /// Card unreachable or its driver refused to open it
    #[error("connection to {address} failed: {reason}")]
    Connection {
        /// Driver address
        address: String,
        /// What went wrong
        reason: String,
    },

    /// A settings rule was violated; nothing was written
    #[error("configuration rejected ({rule}): {message}")]
    Configuration {
        /// Violated rule
        rule: ConfigRule,
        /// Details
        message: String,
    },

    /// Completion or notify wait exceeded the card timeout
    #[error("timed out during {operation}")]
    Timeout {
        /// Operation that was waiting
        operation: String,
    },

    /// Producer outran consumer in a streaming buffer
    #[error("stream overrun: {detail}")]
    StreamOverrun {
        /// Details
        detail: String,
    },

    /// Register interface reported a hardware fault
    #[error("device fault {code} [{category}] on {register}: {message}")]
    DeviceFault {
        /// Raw driver code
        code: FaultCode,
        /// Category from the fault table
        category: FaultCategory,
        /// Message from the fault table
        message: &'static str,
        /// Register being accessed, or the operation when no register applies
        register: String,
    },

    /// Card already owned by another handle
    #[error("device {address} is already in use")]
    DeviceInUse {
        /// Driver address
        address: String,
    },

    /// Operation not allowed in the current lifecycle state
    #[error("{operation} not allowed while {state}")]
    InvalidState {
        /// Requested operation
        operation: &'static str,
        /// Current state
        state: String,
    },

    /// Streaming loop stopped by its cancellation token
    #[error("operation cancelled")]
    Cancelled,

    /// Failure of one StarHub child
    #[error("child {index}: {source}")]
    Child {
        /// Position of the child in the hub
        index: usize,
        /// Child error
        #[source]
        source: Box<CardError>,
    },
}

/// Machine-checkable error kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// [`CardError::Connection`]
    Connection,
    /// [`CardError::Configuration`]
    Configuration,
    /// [`CardError::Timeout`]
    Timeout,
    /// [`CardError::StreamOverrun`]
    StreamOverrun,
    /// [`CardError::DeviceFault`]
    DeviceFault,
    /// [`CardError::DeviceInUse`]
    DeviceInUse,
    /// [`CardError::InvalidState`]
    InvalidState,
    /// [`CardError::Cancelled`]
    Cancelled,
}

/// Closed set of settings validation rules
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConfigRule {
    /// Enabled channel count must be 1, 2, 4 or 8
    EnabledChannelCount,
    /// Per-channel arrays must have one entry per enabled channel
    ChannelArrayLength,
    /// Enabled channel does not exist on the card
    ChannelNotPresent,
    /// AND and OR trigger masks overlap
    TriggerMaskOverlap,
    /// AND mask source uses an edge detection mode
    AndMaskRequiresLevel,
    /// OR mask source uses a level detection mode
    OrMaskRequiresEdge,
    /// Channels on one module use different trigger edges
    ModuleEdgeMismatch,
    /// Implied pre-trigger exceeds the pretrigger memory
    PretriggerTooLong,
    /// Memory size is not a whole number of segments
    SegmentMemoryMismatch,
    /// Post-trigger is longer than the segment
    PostTriggerExceedsSegment,
    /// Batch size illegal for the mode
    BatchSize,
    /// Averaging needs at least two averages
    Averages,
    /// Waveform empty or not a multiple of the memory step
    WaveformLength,
    /// Notify size neither page multiple nor a legal sub-page size
    NotifyGranularity,
    /// Buffer cannot hold the required chunks
    BufferCapacity,
    /// Buffer direction does not suit the card or call
    TransferDirection,
    /// Value outside its legal range
    ValueOutOfRange,
    /// Card lacks the feature
    FeatureNotSupported,
    /// Forcing a trigger needs a software trigger source
    SoftwareTriggerRequired,
    /// StarHub children disagree on a setting
    SettingsMismatch,
}

impl ConfigRule {
    /// Driver fault code reporting the same violation, if there is one
    pub fn fault_code(self) -> Option<FaultCode> {
        match self {
            ConfigRule::EnabledChannelCount | ConfigRule::ChannelNotPresent => Some(FaultCode::CHANNEL),
            ConfigRule::TriggerMaskOverlap => Some(FaultCode::AND_OR_MASK_OVERLAP),
            ConfigRule::AndMaskRequiresLevel => Some(FaultCode::AND_MASK_EDGE),
            ConfigRule::OrMaskRequiresEdge => Some(FaultCode::OR_MASK_LEVEL),
            ConfigRule::ModuleEdgeMismatch => Some(FaultCode::EDGE_PER_MODULE),
            ConfigRule::PretriggerTooLong => Some(FaultCode::PRETRIGGER_LENGTH),
            ConfigRule::SegmentMemoryMismatch => Some(FaultCode::SEGMENT_IN_MEMORY),
            ConfigRule::PostTriggerExceedsSegment => Some(FaultCode::POST_EXCEEDS_SEGMENT),
            ConfigRule::NotifyGranularity => Some(FaultCode::NOTIFY_SIZE),
            ConfigRule::BufferCapacity => Some(FaultCode::BUFFER_SIZE),
            ConfigRule::TransferDirection => Some(FaultCode::DIRECTION_MISMATCH),
            ConfigRule::ValueOutOfRange => Some(FaultCode::VALUE),
            ConfigRule::FeatureNotSupported => Some(FaultCode::FEATURE),
            ConfigRule::SoftwareTriggerRequired => Some(FaultCode::SEQUENCE),
            ConfigRule::ChannelArrayLength
            | ConfigRule::BatchSize
            | ConfigRule::Averages
            | ConfigRule::WaveformLength
            | ConfigRule::SettingsMismatch => None,
        }
    }
}

impl fmt::Display for ConfigRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConfigRule::EnabledChannelCount => "enabled channel count",
            ConfigRule::ChannelArrayLength => "per-channel array length",
            ConfigRule::ChannelNotPresent => "channel not present",
            ConfigRule::TriggerMaskOverlap => "AND/OR mask overlap",
            ConfigRule::AndMaskRequiresLevel => "AND mask requires level mode",
            ConfigRule::OrMaskRequiresEdge => "OR mask requires edge mode",
            ConfigRule::ModuleEdgeMismatch => "one edge per module",
            ConfigRule::PretriggerTooLong => "pretrigger limit",
            ConfigRule::SegmentMemoryMismatch => "memory is whole segments",
            ConfigRule::PostTriggerExceedsSegment => "post-trigger within segment",
            ConfigRule::BatchSize => "batch size",
            ConfigRule::Averages => "number of averages",
            ConfigRule::WaveformLength => "waveform length",
            ConfigRule::NotifyGranularity => "notify granularity",
            ConfigRule::BufferCapacity => "buffer capacity",
            ConfigRule::TransferDirection => "transfer direction",
            ConfigRule::ValueOutOfRange => "value range",
            ConfigRule::FeatureNotSupported => "feature support",
            ConfigRule::SoftwareTriggerRequired => "software trigger source",
            ConfigRule::SettingsMismatch => "hub settings mismatch",
        };
        f.write_str(name)
    }
}

impl CardError {
    /// Kind of the error; transparent through child annotation
    pub fn kind(&self) -> ErrorKind {
        match self {
            CardError::Connection { .. } => ErrorKind::Connection,
            CardError::Configuration { .. } => ErrorKind::Configuration,
            CardError::Timeout { .. } => ErrorKind::Timeout,
            CardError::StreamOverrun { .. } => ErrorKind::StreamOverrun,
            CardError::DeviceFault { .. } => ErrorKind::DeviceFault,
            CardError::DeviceInUse { .. } => ErrorKind::DeviceInUse,
            CardError::InvalidState { .. } => ErrorKind::InvalidState,
            CardError::Cancelled => ErrorKind::Cancelled,
            CardError::Child { source, .. } => source.kind(),
        }
    }

    /// Configuration error for `rule`
    pub fn config(rule: ConfigRule, message: impl Into<String>) -> Self {
        CardError::Configuration {
            rule,
            message: message.into(),
        }
    }

    /// Violated rule of a configuration error
    pub fn rule(&self) -> Option<ConfigRule> {
        match self {
            CardError::Configuration { rule, .. } => Some(*rule),
            CardError::Child { source, .. } => source.rule(),
            _ => None,
        }
    }

    /// Driver code of a device fault
    pub fn fault_code(&self) -> Option<FaultCode> {
        match self {
            CardError::DeviceFault { code, .. } => Some(*code),
            CardError::Child { source, .. } => source.fault_code(),
            _ => None,
        }
    }

    /// Hub child index of an annotated error
    pub fn child_index(&self) -> Option<usize> {
        match self {
            CardError::Child { index, .. } => Some(*index),
            _ => None,
        }
    }

    /// Annotate with a hub child index
    pub fn in_child(self, index: usize) -> Self {
        CardError::Child {
            index,
            source: Box::new(self),
        }
    }

    /// Translate a driver fault observed while accessing `context`
    pub fn from_fault(code: FaultCode, context: impl Into<String>) -> Self {
        let context = context.into();
        if code == FaultCode::TIMEOUT {
            CardError::Timeout { operation: context }
        } else if code.is_overrun() {
            CardError::StreamOverrun {
                detail: format!("{} reported {}", context, code),
            }
        } else {
            CardError::DeviceFault {
                code,
                category: code.category(),
                message: code.message(),
                register: context,
            }
        }
    }
}

/// Lift register-interface results into [`CardResult`] with context
pub trait IntoCardError<T> {
    /// Translate a fault on `register`
    fn on_register(self, register: Register) -> CardResult<T>;

    /// Translate a fault during a named operation
    fn during(self, operation: &str) -> CardResult<T>;
}

impl<T> IntoCardError<T> for HalResult<T> {
    fn on_register(self, register: Register) -> CardResult<T> {
        self.map_err(|code| CardError::from_fault(code, register.to_string()))
    }

    fn during(self, operation: &str) -> CardResult<T> {
        self.map_err(|code| CardError::from_fault(code, operation))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::registers;

    #[test]
    fn test_fault_translation() {
        let timeout: CardResult<()> = Err(FaultCode::TIMEOUT).on_register(registers::CARD_COMMAND);
        assert_eq!(timeout.unwrap_err().kind(), ErrorKind::Timeout);

        let overrun: CardResult<()> = Err(FaultCode::FIFO_HW_OVERRUN).during("notify wait");
        assert_eq!(overrun.unwrap_err().kind(), ErrorKind::StreamOverrun);

        let locked: CardResult<()> = Err(FaultCode::BOARD_LOCKED).on_register(registers::SAMPLE_RATE);
        match locked.unwrap_err() {
            CardError::DeviceFault { code, register, .. } => {
                assert_eq!(code, FaultCode::BOARD_LOCKED);
                assert_eq!(register, "SAMPLE_RATE");
            }
            other => panic!("Expected device fault, got {other:?}"),
        }
    }

    #[test]
    fn test_child_annotation_is_transparent() {
        let err = CardError::from_fault(FaultCode::BOARD_LOCKED, "start").in_child(1);
        assert_eq!(err.kind(), ErrorKind::DeviceFault);
        assert_eq!(err.child_index(), Some(1));
        assert_eq!(err.fault_code(), Some(FaultCode::BOARD_LOCKED));
        assert!(err.to_string().starts_with("child 1:"));
    }

    #[test]
    fn test_rule_fault_codes() {
        assert_eq!(
            ConfigRule::TriggerMaskOverlap.fault_code(),
            Some(FaultCode::AND_OR_MASK_OVERLAP)
        );
        assert_eq!(ConfigRule::SettingsMismatch.fault_code(), None);
        let err = CardError::config(ConfigRule::PretriggerTooLong, "pre-trigger 9000 > 8192");
        assert_eq!(err.rule(), Some(ConfigRule::PretriggerTooLong));
        assert!(err.to_string().contains("pretrigger limit"));
    }

    #[test]
    fn test_error_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<CardError>();
    }
}
