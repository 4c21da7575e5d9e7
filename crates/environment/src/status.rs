use serde::Serialize;

/// Lifecycle status of a single environment.
///
/// `Booting` is only ever reported by VM environments (a defined domain
/// whose IP lease has not appeared yet); container environments go
/// straight from `Created` to `Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Created,
    Booting,
    Running,
    Restarting,
    Paused,
    Unknown,
}

impl Status {
    /// Map a container runtime status string into the closed set.
    ///
    /// Anything the runtime reports outside the known states ("exited",
    /// "dead", "removing", ...) collapses to [`Status::Unknown`].
    pub fn from_container_state(state: &str) -> Self {
        match state {
            "created" => Self::Created,
            "running" => Self::Running,
            "restarting" => Self::Restarting,
            "paused" => Self::Paused,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Booting => "booting",
            Self::Running => "running",
            Self::Restarting => "restarting",
            Self::Paused => "paused",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
