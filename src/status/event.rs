use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Category of an operator-visible status line.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatusCategory {
    HistoryPublish,
    HistoryCatchup,
}

impl fmt::Display for StatusCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HistoryPublish => write!(f, "HISTORY_PUBLISH"),
            Self::HistoryCatchup => write!(f, "HISTORY_CATCHUP"),
        }
    }
}

/// One event on the status bus.
///
/// `Status` events replace the retained line for their category;
/// `Diagnostic` events are fire-and-forget telemetry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    Status {
        category: StatusCategory,
        message: String,
        when: DateTime<Utc>,
    },
    Diagnostic {
        scope: String,
        message: String,
        when: DateTime<Utc>,
    },
}

impl Event {
    pub fn status(category: StatusCategory, message: impl Into<String>) -> Self {
        Event::Status {
            category,
            message: message.into(),
            when: Utc::now(),
        }
    }

    pub fn diagnostic(scope: impl Into<String>, message: impl Into<String>) -> Self {
        Event::Diagnostic {
            scope: scope.into(),
            message: message.into(),
            when: Utc::now(),
        }
    }

    #[must_use]
    pub fn message(&self) -> &str {
        match self {
            Event::Status { message, .. } | Event::Diagnostic { message, .. } => message,
        }
    }

    #[must_use]
    pub fn scope_label(&self) -> String {
        match self {
            Event::Status { category, .. } => category.to_string(),
            Event::Diagnostic { scope, .. } => scope.clone(),
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.scope_label(), self.message())
    }
}
