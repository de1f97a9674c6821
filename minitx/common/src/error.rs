use thiserror::Error;

pub type UidResult<T> = Result<T, UidError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UidError {
    #[error("server id is empty")]
    EmptyServerId,

    #[error("server id is {len} bytes long, at most {max} are allowed")]
    ServerIdTooLong { len: usize, max: usize },

    #[error("global transaction id must be at least {min} bytes, got {len}")]
    GtridTooShort { len: usize, min: usize },

    #[error("global transaction id must be at most {max} bytes, got {len}")]
    GtridTooLong { len: usize, max: usize },

    #[error("uid sequence overflow, reached {0}")]
    SequenceOverflow(u32),
}
