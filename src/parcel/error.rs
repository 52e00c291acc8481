//! Transport layer errors.

use std::io;
use thiserror::Error;

use crate::error::{Error, ErrorKind};
use crate::types::LocalityId;

/// Errors raised by parcelports and the frame codec.
#[derive(Debug, Error)]
pub enum TransportError {
    /// No route or connection to the destination locality.
    #[error("locality unreachable: {0}")]
    Unreachable(LocalityId),

    /// The connection dropped while the parcel was in flight.
    #[error("connection to {0} lost")]
    ConnectionLost(LocalityId),

    /// A frame body did not decode into a parcel.
    #[error("corrupt frame: {details}")]
    Corrupt {
        /// What failed to decode.
        details: String,
    },

    /// A frame exceeded the configured maximum length.
    #[error("frame of {len} bytes exceeds limit of {max}")]
    FrameTooLarge {
        /// Announced or encoded length.
        len: usize,
        /// Configured limit.
        max: usize,
    },

    /// The parcel could not be encoded.
    #[error("encode failed: {0}")]
    Encode(String),

    /// The parcelport has been shut down.
    #[error("parcelport closed")]
    Closed,

    /// Underlying I/O error.
    #[error("I/O error: {source}")]
    Io {
        /// The source I/O error.
        #[from]
        source: io::Error,
    },
}

impl From<TransportError> for Error {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Unreachable(locality) => Self::locality_unreachable(locality),
            TransportError::ConnectionLost(_) => {
                Self::new(ErrorKind::ConnectionLost).with_message(err.to_string())
            }
            TransportError::Encode(detail) => Self::serialization(detail),
            TransportError::Closed => Self::new(ErrorKind::Shutdown).with_message(err.to_string()),
            TransportError::Io { source } => Self::new(ErrorKind::Transport)
                .with_message("I/O error")
                .with_source(source),
            TransportError::Corrupt { .. } | TransportError::FrameTooLarge { .. } => {
                Self::new(ErrorKind::Transport).with_message(err.to_string())
            }
        }
    }
}
