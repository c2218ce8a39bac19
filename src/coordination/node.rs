use std::fmt;

/// Identity of one worker process.
///
/// Generated once per process start and passed explicitly to every role
/// component and outbound message.  The id doubles as the name of the
/// worker's private liveness-probe reply list.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkerId(String);

impl WorkerId {
    /// `<hostname>-<uuid v4>`: readable in logs and unique for every process,
    /// even on the same host.
    pub fn generate() -> Self {
        let hostname = gethostname::gethostname().to_string_lossy().into_owned();
        Self(format!("{hostname}-{}", uuid::Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for WorkerId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
