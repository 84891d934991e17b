use std::{io, path::PathBuf};

/// A counter could not be read this tick.
///
/// These errors degrade exactly one metric and are never propagated
/// out of a tick.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("counter {stream} is unavailable: {source}")]
    Io {
        stream: String,
        #[source]
        source: io::Error,
    },

    #[error("unknown counter stream {0}")]
    UnknownStream(String),

    #[error("failed to parse counter {stream}: '{content}'")]
    Parse { stream: String, content: String },

    #[error("procfs: {0}")]
    Proc(#[from] procfs::ProcError),
}

impl SourceError {
    pub(crate) fn io<S: Into<String>>(stream: S, source: io::Error) -> Self {
        SourceError::Io {
            stream: stream.into(),
            source,
        }
    }

    pub(crate) fn parse<S: Into<String>>(stream: S, content: &[u8]) -> Self {
        SourceError::Parse {
            stream: stream.into(),
            content: String::from_utf8_lossy(content).trim_end().to_owned(),
        }
    }
}

/// The time series could not be durably recorded. Always fatal.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("failed to write {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("the sink has not been opened, call init first")]
    NotOpen,
}

#[derive(Debug, thiserror::Error)]
pub enum TopologyError {
    #[error("cache {key} of cpu {cpu} is both a leaf and an inner node")]
    Inconsistent { cpu: u32, key: String },

    #[error("cpu {0} has no cache level")]
    NoCache(u32),
}
