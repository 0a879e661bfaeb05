//! Stand-in for a database that failed to open.

use std::path::Path;

use super::{Dictionary, Direction, UpdateOutcome};
use crate::{DICT_TYPE, DictError, DictFlags, OpenError, Result};

/// Degraded handle that answers every operation with the captured open
/// error, so the failure surfaces where the table is used.
#[derive(Debug, Clone)]
pub struct SurrogateDict {
    name: String,
    label: String,
    flags: DictFlags,
    message: String,
}

impl SurrogateDict {
    /// Build a surrogate for `path` that reports `error`.
    pub fn new(path: &Path, flags: DictFlags, error: &OpenError) -> Self {
        let name = path.display().to_string();
        let label = format!("{DICT_TYPE}:{name}");
        Self {
            message: format!("{label} is unavailable. {error}"),
            name,
            label,
            flags,
        }
    }

    /// `type:name` label.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// The error every operation reports.
    pub fn message(&self) -> &str {
        &self.message
    }

    fn unavailable<T>(&self) -> Result<T> {
        Err(DictError::Unavailable(self.message.clone()))
    }
}

impl Dictionary for SurrogateDict {
    fn name(&self) -> &str {
        &self.name
    }

    fn flags(&self) -> DictFlags {
        self.flags
    }

    fn lookup(&mut self, _name: &str) -> Result<Option<&[u8]>> {
        self.unavailable()
    }

    fn update(&mut self, _name: &str, _value: &[u8]) -> Result<UpdateOutcome> {
        self.unavailable()
    }

    fn delete(&mut self, _name: &str) -> Result<bool> {
        self.unavailable()
    }

    fn sequence(&mut self, _direction: Direction) -> Result<Option<(&[u8], &[u8])>> {
        self.unavailable()
    }

    fn close(self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use mapstore::EngineError;
    use std::path::PathBuf;

    fn surrogate() -> SurrogateDict {
        let err = OpenError::Engine {
            path: PathBuf::from("/nonexistent/map.mdb"),
            source: EngineError::NotOpen,
        };
        SurrogateDict::new(Path::new("/nonexistent/map"), DictFlags::LOCK, &err)
    }

    #[test]
    fn test_every_operation_reports_open_error() {
        let mut dict = surrogate();
        assert_eq!(dict.label(), "mapstore:/nonexistent/map");
        assert_eq!(dict.name(), "/nonexistent/map");
        assert_eq!(dict.flags(), DictFlags::LOCK);

        let expected = dict.message().to_string();
        assert!(expected.starts_with("mapstore:/nonexistent/map is unavailable. open database"));

        for err in [
            dict.lookup("k").map(|_| ()).unwrap_err(),
            dict.update("k", b"v").map(|_| ()).unwrap_err(),
            dict.delete("k").map(|_| ()).unwrap_err(),
            dict.sequence(Direction::First).map(|_| ()).unwrap_err(),
        ] {
            assert!(!err.is_fatal());
            assert_eq!(err.to_string(), expected);
        }
        assert!(dict.close().is_ok());
    }
}
