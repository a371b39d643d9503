use std::fmt;

/// Severity of an [`Event`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Level {
    Info,
    Error,
    Fatal,
    Close,
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Level::Info => write!(f, "info"),
            Level::Error => write!(f, "error"),
            Level::Fatal => write!(f, "fatal"),
            Level::Close => write!(f, "close"),
        }
    }
}

/// Out-of-band notification produced by the server and dispatchers for an
/// external logger. Delivered on a rendezvous channel: the core awaits the
/// consumer and never buffers or drops.
#[derive(Debug)]
pub struct Event {
    pub level: Level,
    pub message: String,
    pub error: Option<String>,
    /// Captured backtrace, present on `fatal` events only.
    pub stack: Option<String>,
}

impl Event {
    pub fn info(message: impl Into<String>) -> Event {
        Event {
            level: Level::Info,
            message: message.into(),
            error: None,
            stack: None,
        }
    }

    pub fn error(message: impl Into<String>, error: impl ToString) -> Event {
        Event {
            level: Level::Error,
            message: message.into(),
            error: Some(error.to_string()),
            stack: None,
        }
    }

    pub fn fatal(message: impl Into<String>, error: impl ToString, stack: String) -> Event {
        Event {
            level: Level::Fatal,
            message: message.into(),
            error: Some(error.to_string()),
            stack: Some(stack),
        }
    }

    pub fn close(message: impl Into<String>) -> Event {
        Event {
            level: Level::Close,
            message: message.into(),
            error: None,
            stack: None,
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.level, self.message)?;
        if let Some(error) = &self.error {
            write!(f, " {}", error)?;
        }
        Ok(())
    }
}
