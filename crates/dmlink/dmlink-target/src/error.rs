use std::io;

/// Failures surfaced by the firmware-side engine.
///
/// Ring operations never produce these; they return `false`/zero
/// sentinels so a logging call can never take the firmware down. Errors
/// are reserved for region creation and the file-transfer operations,
/// where the caller asked for something with a real failure mode.
#[derive(Debug, thiserror::Error)]
pub enum TargetError {
    #[error("region rejected: {0}")]
    Region(&'static str),

    #[error("context is not attached to a live region")]
    NotLive,

    #[error("path does not fit the header path slot")]
    PathTooLong,

    #[error("chunk size must be non-zero")]
    BadChunkSize,

    #[error("host published a chunk larger than the negotiated buffer")]
    OversizedChunk,

    #[error("file is {0} bytes, larger than the 32-bit transfer counter")]
    FileTooLarge(u64),

    #[error("timed out waiting for the host to service the transfer")]
    HostTimeout,

    #[error("host published chunk {got}, expected {expected}")]
    ChunkSequence { expected: u32, got: u32 },

    #[error(transparent)]
    Io(#[from] io::Error),
}
