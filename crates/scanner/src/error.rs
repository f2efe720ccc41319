use library::LibraryError;
use metadata::MetadataError;

use crate::protocol::ProtocolError;

#[derive(Debug)]
pub enum ScanError {
    /// Another scan holds the controller.
    AlreadyScanning,
    Io(std::io::Error),
    Metadata(MetadataError),
    Library(LibraryError),
    Protocol(ProtocolError),
    /// A folder reported failure through its progress record.
    Folder { path: String, message: String },
    Subprocess(String),
    Task(String),
    Joined(Vec<ScanError>),
}

impl ScanError {
    /// Collapses collected failures: none → `None`, one → itself, many → `Joined`.
    pub fn join(mut errors: Vec<ScanError>) -> Option<ScanError> {
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(ScanError::Joined(errors)),
        }
    }
}

impl std::fmt::Display for ScanError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScanError::AlreadyScanning => write!(f, "scanner: already scanning"),
            ScanError::Io(err) => write!(f, "io error: {}", err),
            ScanError::Metadata(err) => write!(f, "metadata error: {}", err),
            ScanError::Library(err) => write!(f, "library error: {}", err),
            ScanError::Protocol(err) => write!(f, "progress stream error: {}", err),
            ScanError::Folder { path, message } => {
                if path.is_empty() {
                    write!(f, "{}", message)
                } else {
                    write!(f, "{}: {}", path, message)
                }
            }
            ScanError::Subprocess(message) => write!(f, "external scanner: {}", message),
            ScanError::Task(message) => write!(f, "scan task failed: {}", message),
            ScanError::Joined(errors) => {
                for (idx, err) in errors.iter().enumerate() {
                    if idx > 0 {
                        writeln!(f)?;
                    }
                    write!(f, "{}", err)?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for ScanError {}

impl From<std::io::Error> for ScanError {
    fn from(err: std::io::Error) -> Self {
        ScanError::Io(err)
    }
}

impl From<MetadataError> for ScanError {
    fn from(err: MetadataError) -> Self {
        ScanError::Metadata(err)
    }
}

impl From<LibraryError> for ScanError {
    fn from(err: LibraryError) -> Self {
        ScanError::Library(err)
    }
}

impl From<ProtocolError> for ScanError {
    fn from(err: ProtocolError) -> Self {
        ScanError::Protocol(err)
    }
}

impl From<tokio::task::JoinError> for ScanError {
    fn from(err: tokio::task::JoinError) -> Self {
        ScanError::Task(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::ScanError;

    fn folder(path: &str, message: &str) -> ScanError {
        ScanError::Folder {
            path: path.to_string(),
            message: message.to_string(),
        }
    }

    #[test]
    fn join_keeps_every_failure() {
        assert!(ScanError::join(Vec::new()).is_none());
        let single = ScanError::join(vec![folder("A", "boom")]).unwrap();
        assert_eq!(single.to_string(), "A: boom");

        let joined =
            ScanError::join(vec![folder("A", "boom"), folder("", "child exited")]).unwrap();
        assert_eq!(joined.to_string(), "A: boom\nchild exited");
    }
}
