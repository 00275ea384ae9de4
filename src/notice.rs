use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Success,
    Error,
}

/// What the client shows as a toast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notice {
    pub title: String,
    pub message: String,
    pub severity: Severity,
}

impl Notice {
    pub fn new(title: impl Into<String>, message: impl Into<String>, severity: Severity) -> Notice {
        Notice {
            title: title.into(),
            message: message.into(),
            severity,
        }
    }

    pub fn success(title: impl Into<String>, message: impl Into<String>) -> Notice {
        Notice::new(title, message, Severity::Success)
    }

    pub fn error(title: impl Into<String>, message: impl Into<String>) -> Notice {
        Notice::new(title, message, Severity::Error)
    }
}
