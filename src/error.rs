use thiserror::Error;

/// Everything that can go wrong while decoding a module or a debug blob.
///
/// Decoding never recovers: the first error aborts the whole parse.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed input at offset {offset}: {message}")]
    MalformedInput { offset: usize, message: String },

    #[error("unexpected end of stream at offset {offset}")]
    UnexpectedEndOfStream { offset: usize },

    #[error("failed to read input: {0}")]
    Io(#[from] std::io::Error),
}

impl DecodeError {
    pub fn malformed(offset: usize, message: impl Into<String>) -> Self {
        Self::MalformedInput {
            offset,
            message: message.into(),
        }
    }

    pub fn offset(&self) -> Option<usize> {
        match self {
            Self::MalformedInput { offset, .. } | Self::UnexpectedEndOfStream { offset } => {
                Some(*offset)
            }
            Self::Io(_) => None,
        }
    }

    /// Shifts a payload-relative offset so it points into the enclosing stream.
    pub(crate) fn rebase(self, base: usize) -> Self {
        match self {
            Self::MalformedInput { offset, message } => Self::MalformedInput {
                offset: offset + base,
                message,
            },
            Self::UnexpectedEndOfStream { offset } => Self::UnexpectedEndOfStream {
                offset: offset + base,
            },
            other => other,
        }
    }
}

pub type Result<T, E = DecodeError> = std::result::Result<T, E>;
