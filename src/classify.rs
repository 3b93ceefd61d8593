//! Ready-made query error hooks.
//!
//! A hook receives every failed statement before its error reaches the
//! caller. Returning `Ok(())` lets the driver error through unchanged;
//! returning `Err` replaces it. Hooks compose with [`chain`].

use crate::config::QueryErrorHandler;
use crate::core::{DbError, DriverError};
use crate::query::Query;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

/// Replace every driver failure with an application error code
pub fn translate(code: impl Into<String>) -> QueryErrorHandler {
    let code = code.into();
    Arc::new(move |err: &DriverError, _query: &Query| {
        Err(DbError::classified(code.clone(), err.clone()))
    })
}

/// Log the failed statement and let the error through
pub fn log_errors() -> QueryErrorHandler {
    Arc::new(|err: &DriverError, query: &Query| {
        warn!(
            kind = %err.kind(),
            code = err.code().unwrap_or("-"),
            query = %query,
            params = query.params().len(),
            "query failed: {}",
            err.message()
        );
        Ok(())
    })
}

/// Run `first`, then `second`; the first replacement wins
pub fn chain(first: QueryErrorHandler, second: QueryErrorHandler) -> QueryErrorHandler {
    Arc::new(move |err: &DriverError, query: &Query| {
        first(err, query)?;
        second(err, query)
    })
}

/// Maps constraint names to application error codes.
///
/// ```
/// use txsession::classify::ConstraintMap;
/// use txsession::{DbError, DriverError};
///
/// let constraints = ConstraintMap::new()
///     .map("users_email_key", "user.email_taken")
///     .map("users_org_fk", "user.unknown_org");
///
/// let err = DbError::Driver(DriverError::constraint("users_email_key", "duplicate key"));
/// assert_eq!(constraints.classify(err).code(), Some("user.email_taken"));
/// ```
#[derive(Debug, Clone, Default)]
pub struct ConstraintMap {
    codes: HashMap<String, String>,
}

impl ConstraintMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn map(mut self, constraint: impl Into<String>, code: impl Into<String>) -> Self {
        self.codes.insert(constraint.into(), code.into());
        self
    }

    pub fn lookup(&self, err: &DriverError) -> Option<&str> {
        err.constraint_name()
            .and_then(|name| self.codes.get(name))
            .map(String::as_str)
    }

    /// Classify an error after the fact; unknown errors come back unchanged.
    ///
    /// Errors already classified by a hook are reclassified when their
    /// constraint is known.
    pub fn classify(&self, err: DbError) -> DbError {
        let code = err.driver_error().and_then(|source| {
            self.lookup(source)
                .map(|code| (code.to_string(), source.clone()))
        });

        match code {
            Some((code, source)) => DbError::classified(code, source),
            None => err,
        }
    }

    /// Hook classifying known constraint violations
    pub fn into_handler(self) -> QueryErrorHandler {
        Arc::new(move |err: &DriverError, _query: &Query| match self.lookup(err) {
            Some(code) => Err(DbError::classified(code, err.clone())),
            None => Ok(()),
        })
    }
}
