use std::fmt;
use std::panic::Location;
use thiserror::Error;

/// Coarse classification of a driver failure.
///
/// Only `Connection` influences lifecycle decisions: a connection that reported
/// a link-level failure is never handed back to the pool for reuse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DriverErrorKind {
    /// The physical link is broken or unusable
    Connection,
    /// Unique, foreign key, check or not-null violation
    Constraint,
    /// The statement could not be parsed or planned by the server
    Syntax,
    Other,
}

impl fmt::Display for DriverErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection => write!(f, "Connection"),
            Self::Constraint => write!(f, "Constraint"),
            Self::Syntax => write!(f, "Syntax"),
            Self::Other => write!(f, "Driver"),
        }
    }
}

/// Opaque failure reported by a [`Connection`](crate::connection::Connection).
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{kind} error: {message}")]
pub struct DriverError {
    kind: DriverErrorKind,
    message: String,
    code: Option<String>,
    constraint: Option<String>,
}

impl DriverError {
    pub fn new(kind: DriverErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            code: None,
            constraint: None,
        }
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(DriverErrorKind::Connection, message)
    }

    pub fn syntax(message: impl Into<String>) -> Self {
        Self::new(DriverErrorKind::Syntax, message)
    }

    /// Constraint violation naming the violated constraint
    pub fn constraint(constraint: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(DriverErrorKind::Constraint, message).with_constraint(constraint)
    }

    /// Attach the server's SQLSTATE code
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_constraint(mut self, constraint: impl Into<String>) -> Self {
        self.constraint = Some(constraint.into());
        self
    }

    pub fn kind(&self) -> DriverErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn code(&self) -> Option<&str> {
        self.code.as_deref()
    }

    pub fn constraint_name(&self) -> Option<&str> {
        self.constraint.as_deref()
    }

    pub fn is_connection_error(&self) -> bool {
        self.kind == DriverErrorKind::Connection
    }
}

#[derive(Error, Debug, Clone)]
pub enum DbError {
    #[error("{0}")]
    Driver(#[from] DriverError),

    #[error("Task/tx aborted: the operation was still queued when its session finished")]
    Aborted,

    #[error("Misuse: {0}")]
    Misuse(String),

    #[error("{code}: {source}")]
    Classified {
        code: String,
        #[source]
        source: DriverError,
    },

    #[error("Pool error: {0}")]
    Pool(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{source} (issued at {call_site})")]
    Traced {
        call_site: &'static Location<'static>,
        #[source]
        source: Box<DbError>,
    },
}

pub type Result<T> = std::result::Result<T, DbError>;

impl DbError {
    pub fn misuse(message: impl Into<String>) -> Self {
        Self::Misuse(message.into())
    }

    pub fn classified(code: impl Into<String>, source: DriverError) -> Self {
        Self::Classified {
            code: code.into(),
            source,
        }
    }

    /// The error with any call-site context stripped
    pub fn root(&self) -> &DbError {
        match self {
            Self::Traced { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self.root(), Self::Aborted)
    }

    pub fn is_misuse(&self) -> bool {
        matches!(self.root(), Self::Misuse(_))
    }

    /// The underlying driver failure, classified or not
    pub fn driver_error(&self) -> Option<&DriverError> {
        match self.root() {
            Self::Driver(e) | Self::Classified { source: e, .. } => Some(e),
            _ => None,
        }
    }

    /// Application error code assigned by a classification hook
    pub fn code(&self) -> Option<&str> {
        match self.root() {
            Self::Classified { code, .. } => Some(code),
            _ => None,
        }
    }

    pub fn call_site(&self) -> Option<&'static Location<'static>> {
        match self {
            Self::Traced { call_site, .. } => Some(call_site),
            _ => None,
        }
    }

    /// Wrap with the submitting call site; the innermost site wins.
    pub(crate) fn traced(self, call_site: Option<&'static Location<'static>>) -> Self {
        match (call_site, self) {
            (Some(call_site), err) if !matches!(err, Self::Traced { .. }) => Self::Traced {
                call_site,
                source: Box::new(err),
            },
            (_, err) => err,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_driver_error_display() {
        let err = DriverError::constraint("users_email_key", "duplicate key value")
            .with_code("23505");
        assert_eq!(err.to_string(), "Constraint error: duplicate key value");
        assert_eq!(err.code(), Some("23505"));
        assert_eq!(err.constraint_name(), Some("users_email_key"));
        assert!(!err.is_connection_error());
    }

    #[test]
    fn test_traced_keeps_root() {
        let site = Location::caller();
        let err = DbError::Aborted.traced(Some(site));
        assert!(err.is_aborted());
        assert_eq!(err.call_site(), Some(site));
        assert!(err.to_string().contains("issued at"));

        // Already traced errors keep their original site
        let again = err.traced(Some(Location::caller()));
        assert_eq!(again.call_site(), Some(site));
    }

    #[test]
    fn test_untraced_without_site() {
        let err = DbError::misuse("closed").traced(None);
        assert!(matches!(err, DbError::Misuse(_)));
    }

    #[test]
    fn test_driver_error_lookup() {
        let source = DriverError::syntax("near \"SELEC\"");
        let err = DbError::classified("db.query", source.clone());
        assert_eq!(err.driver_error(), Some(&source));
        assert_eq!(err.code(), Some("db.query"));
        assert!(DbError::Aborted.driver_error().is_none());
    }
}
