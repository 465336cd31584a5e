use std::sync::Arc;

use crate::var::{ArcAny, Value};

/// Per-variable entry in a transaction log.
///
/// `read` holds the value record observed the first time the variable
/// was read; validation of the entry succeeds iff the cell still carries
/// that version. `write` holds the pending record built on the first
/// set, with `version = observed + 1`; later sets replace its payload in
/// place without bumping the version again.
#[derive(Clone, Default)]
pub(crate) struct LogEntry {
    pub read: Option<Arc<Value>>,
    pub write: Option<Value>,
}

impl LogEntry {
    /// Check the entry against the cell's current version.
    ///
    /// A write without a prior read acts as a read entry synthesized at
    /// the observed version: the pending version must be exactly one
    /// ahead of the cell.
    pub fn validates_against(&self, current_version: u64) -> bool {
        match (&self.read, &self.write) {
            (Some(read), _) => read.version == current_version,
            (None, Some(write)) => write.version == current_version + 1,
            (None, None) => true,
        }
    }

    /// The payload a transactional read of this entry observes: the
    /// pending write shadows the recorded read.
    pub fn payload(&self) -> Option<ArcAny> {
        if let Some(write) = &self.write {
            return Some(write.payload.clone());
        }
        self.read.as_ref().map(|read| read.payload.clone())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;

    fn value(version: u64) -> Value {
        Value {
            version,
            payload: Arc::new(0u8),
        }
    }

    #[test]
    fn read_entry_validates_on_same_version() {
        let entry = LogEntry {
            read: Some(Arc::new(value(3))),
            write: None,
        };

        assert!(entry.validates_against(3));
        assert!(!entry.validates_against(4));
    }

    #[test]
    fn blind_write_validates_one_ahead() {
        let entry = LogEntry {
            read: None,
            write: Some(value(4)),
        };

        assert!(entry.validates_against(3));
        assert!(!entry.validates_against(4));
    }

    #[test]
    fn read_write_entry_checks_the_read() {
        let entry = LogEntry {
            read: Some(Arc::new(value(3))),
            write: Some(value(4)),
        };

        assert!(entry.validates_against(3));
        assert!(!entry.validates_against(2));
    }
}
