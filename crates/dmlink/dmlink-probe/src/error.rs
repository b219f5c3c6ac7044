use std::io;

/// Probe failures, split along the line the monitor cares about: things
/// worth retrying next tick versus things that end the session.
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("connecting to {addr} failed")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Io(#[from] io::Error),

    /// The server answered, but not with anything the dialect allows.
    #[error("malformed reply: {0}")]
    Protocol(String),

    /// The server understood us and said no (e.g. an RSP `E nn`).
    #[error("target error reply: {0}")]
    Target(String),

    /// Retransmits/re-reads ran out without a usable reply.
    #[error("retries exhausted while {0}")]
    RetriesExhausted(&'static str),

    /// The request does not fit the backend's address window.
    #[error("address {addr:#x}+{len} outside the backend window")]
    AddressRange { addr: u64, len: usize },
}

impl ProbeError {
    /// Transient failures are worth a warn-and-retry from the monitor
    /// loop; the rest should surface.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProbeError::Protocol(_) | ProbeError::Target(_) | ProbeError::RetriesExhausted(_)
        )
    }
}
