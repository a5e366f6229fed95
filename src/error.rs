//! Error types shared by services, projects and the orchestrator.

use serde::Serialize;
use thiserror::Error;

pub type Result<T, E = OrchestraError> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum OrchestraError {
    #[error("no project matches {0}")]
    ProjectNotFound(String),

    #[error("project {project} has no service {service}")]
    ServiceNotFound { project: String, service: String },

    #[error("service {0} is running and cannot be modified")]
    ServiceBusy(String),

    #[error("project {0} is running and cannot be modified")]
    ProjectBusy(String),

    #[error("the name {0} is already taken")]
    NameConflict(String),

    #[error("the payload could not be understood: {0}")]
    MalformedPayload(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("service {0} could not be matched")]
    Unmatched(String),
}

/// Coarse classification of an `OrchestraError`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Busy,
    NameConflict,
    MalformedPayload,
    IoFailure,
    Unmatched,
}

/// How loudly a failure should be reported to a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warn,
    Error,
}

/// Report category understood by the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportType {
    UpdateWarning,
    UpdateFailure,
    Error,
}

/// A user-facing description of a failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorReport {
    pub level: Severity,
    pub message: String,
    #[serde(rename = "type")]
    pub kind: ReportType,
}

impl OrchestraError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        OrchestraError::Io {
            context: context.into(),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            OrchestraError::ProjectNotFound(_) | OrchestraError::ServiceNotFound { .. } => {
                ErrorKind::NotFound
            }
            OrchestraError::ServiceBusy(_) | OrchestraError::ProjectBusy(_) => ErrorKind::Busy,
            OrchestraError::NameConflict(_) => ErrorKind::NameConflict,
            OrchestraError::MalformedPayload(_) => ErrorKind::MalformedPayload,
            OrchestraError::Io { .. } => ErrorKind::IoFailure,
            OrchestraError::Unmatched(_) => ErrorKind::Unmatched,
        }
    }

    /// An unmatched service during a bulk update only skips that entry, so it is a warning.
    pub fn severity(&self) -> Severity {
        match self.kind() {
            ErrorKind::Unmatched => Severity::Warn,
            _ => Severity::Error,
        }
    }

    /// Builds the report a dispatch layer forwards after a failed update.
    pub fn update_report(&self) -> ErrorReport {
        let kind = match self.severity() {
            Severity::Warn | Severity::Info => ReportType::UpdateWarning,
            Severity::Error => ReportType::UpdateFailure,
        };
        ErrorReport {
            level: self.severity(),
            message: self.to_string(),
            kind,
        }
    }

    /// Builds the report for a failure outside of an update.
    pub fn report(&self) -> ErrorReport {
        ErrorReport {
            level: self.severity(),
            message: self.to_string(),
            kind: ReportType::Error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unmatched_is_reported_as_warning() {
        let report = OrchestraError::Unmatched("abc".into()).update_report();
        assert_eq!(report.level, Severity::Warn);
        assert_eq!(report.kind, ReportType::UpdateWarning);

        let report = OrchestraError::MalformedPayload("bad".into()).update_report();
        assert_eq!(report.level, Severity::Error);
        assert_eq!(report.kind, ReportType::UpdateFailure);
    }

    #[test]
    fn report_serializes_with_type_tag() {
        let report = OrchestraError::ServiceBusy("api".into()).report();
        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(value["level"], "error");
        assert_eq!(value["type"], "error");
        assert_eq!(value["message"], "service api is running and cannot be modified");
    }
}
