/// Control requests from the caller's thread to the dispatch worker.
///
/// Commands are applied in the order they were sent. Interval changes and
/// shutdown are not commands: they travel over watch channels because only
/// the latest value matters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Command {
    /// Run a drain cycle now, clearing any earlier cancel
    Flush,
    /// Stop the running drain at its next batch boundary
    Cancel,
}

/// What started a drain cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Trigger {
    Timer,
    Flush,
}

impl std::fmt::Display for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Trigger::Timer => write!(f, "timer"),
            Trigger::Flush => write!(f, "flush"),
        }
    }
}

/// Control state accumulated while a drain is running
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DrainControl {
    pub cancelled: bool,
    /// A flush arrived mid-drain and should run once this one returns
    pub rerun: bool,
}

impl DrainControl {
    pub fn apply(&mut self, command: Command) {
        match command {
            Command::Flush => {
                self.cancelled = false;
                self.rerun = true;
            }
            Command::Cancel => {
                self.cancelled = true;
                self.rerun = false;
            }
        }
    }
}
