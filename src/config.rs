use crate::core::{DbError, DriverError, Result};
use crate::query::Query;
use std::fmt;
use std::sync::Arc;

/// Hook run on every failed statement before the error is returned.
///
/// `Ok(())` lets the original driver error propagate; `Err(e)` replaces it.
pub type QueryErrorHandler = Arc<dyn Fn(&DriverError, &Query) -> Result<()> + Send + Sync>;

/// Environment variable that toggles debug mode in [`ExecutorConfig::from_env`]
pub const DEBUG_ENV: &str = "TXSESSION_DEBUG";

/// Environment variable naming the deployment; `production` turns debug off by default
pub const APP_ENV: &str = "APP_ENV";

/// Executor configuration, fixed at construction
#[derive(Clone, Default)]
pub struct ExecutorConfig {
    /// Attach the submitting call site to failures
    pub debug: bool,

    /// Translation/logging hook for driver failures
    pub query_error_handler: Option<QueryErrorHandler>,
}

impl ExecutorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable call-site tracing
    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Set the query error hook
    ///
    /// # Examples
    ///
    /// ```
    /// use txsession::{DbError, ExecutorConfig};
    ///
    /// let config = ExecutorConfig::new().query_error_handler(|err, _query| {
    ///     Err(DbError::classified("db.query", err.clone()))
    /// });
    /// assert!(config.query_error_handler.is_some());
    /// ```
    pub fn query_error_handler<F>(self, handler: F) -> Self
    where
        F: Fn(&DriverError, &Query) -> Result<()> + Send + Sync + 'static,
    {
        self.with_query_error_handler(Arc::new(handler))
    }

    /// Set an already shared hook, such as one built by [`crate::classify`]
    pub fn with_query_error_handler(mut self, handler: QueryErrorHandler) -> Self {
        self.query_error_handler = Some(handler);
        self
    }

    /// Build from `TXSESSION_DEBUG` and `APP_ENV`.
    ///
    /// Debug defaults to on outside production. An unparsable flag is an error.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let production = lookup(APP_ENV)
            .map(|env| env.trim().eq_ignore_ascii_case("production"))
            .unwrap_or(false);

        let debug = match lookup(DEBUG_ENV) {
            Some(raw) => parse_flag(&raw).ok_or_else(|| {
                DbError::Config(format!("{} must be a boolean flag, got '{}'", DEBUG_ENV, raw))
            })?,
            None => !production,
        };

        Ok(Self::new().debug(debug))
    }

    /// Run the configured hook and produce the error to propagate
    pub(crate) fn handle_query_error(&self, err: DriverError, query: &Query) -> DbError {
        match &self.query_error_handler {
            Some(handler) => match handler(&err, query) {
                Ok(()) => DbError::Driver(err),
                Err(replaced) => replaced,
            },
            None => DbError::Driver(err),
        }
    }
}

impl fmt::Debug for ExecutorConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutorConfig")
            .field("debug", &self.debug)
            .field("query_error_handler", &self.query_error_handler.is_some())
            .finish()
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}
