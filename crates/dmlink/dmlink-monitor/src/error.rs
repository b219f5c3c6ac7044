use dmlink_probe::ProbeError;
use std::io;

/// Monitor-loop failures that actually end the session.
///
/// Transient probe trouble never becomes one of these; the loop warns
/// and tries again next tick. What escapes here is the unrecoverable
/// rest: a dead connection, a console that cannot be read, a host-side
/// transfer file that will not open.
#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error(transparent)]
    Probe(#[from] ProbeError),

    #[error("console i/o failed")]
    Console(#[source] io::Error),

    #[error("transfer file '{path}' failed")]
    TransferFile {
        path: String,
        #[source]
        source: io::Error,
    },
}
