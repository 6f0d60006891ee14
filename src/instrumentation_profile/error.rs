use std::io;
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Error)]
pub enum InstrProfError {
    #[error("unrecognized instrumentation profile encoding format")]
    UnrecognizedFormat,
    #[error("invalid instrumentation profile data (bad magic)")]
    BadMagic,
    #[error("unsupported instrumentation profile format version")]
    UnsupportedVersion,
    #[error("unsupported instrumentation profile hash type")]
    UnsupportedHashType,
    #[error("malformed instrumentation profile data")]
    Malformed,
    #[error("no profile data available for function")]
    UnknownFunction,
    #[error("function control flow change detected (hash mismatch)")]
    HashMismatch,
    #[error("function basic block count change detected (counter mismatch)")]
    CountMismatch,
    #[error("counter overflow")]
    CounterOverflow,
    #[error("function value site count change detected (counter mismatch)")]
    ValueSiteCountMismatch,
    #[error("failed to compress data (zlib)")]
    CompressFailed,
    #[error("failed to uncompress data (zlib)")]
    UncompressFailed,
    #[error("profile kinds are incompatible and cannot be merged")]
    IncompatibleProfileKind,
}

impl<E> From<nom::Err<E>> for InstrProfError {
    fn from(_: nom::Err<E>) -> Self {
        Self::Malformed
    }
}

impl From<InstrProfError> for io::Error {
    fn from(e: InstrProfError) -> Self {
        io::Error::new(io::ErrorKind::InvalidData, e)
    }
}
