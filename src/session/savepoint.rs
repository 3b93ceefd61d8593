/// Transaction control statements for a given nesting level.
///
/// Level 1 is the outermost transaction and uses plain `BEGIN`/`COMMIT`/
/// `ROLLBACK`; every deeper level N uses the savepoint `spN`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TxStatement {
    Open,
    Release,
    Rollback,
}

impl TxStatement {
    pub(crate) fn sql(self, level: usize) -> String {
        debug_assert!(level > 0, "transaction statements need a level of at least 1");

        match (self, level) {
            (Self::Open, 1) => "BEGIN".to_string(),
            (Self::Release, 1) => "COMMIT".to_string(),
            (Self::Rollback, 1) => "ROLLBACK".to_string(),
            (Self::Open, n) => format!("SAVEPOINT sp{}", n),
            (Self::Release, n) => format!("RELEASE SAVEPOINT sp{}", n),
            (Self::Rollback, n) => format!("ROLLBACK TO SAVEPOINT sp{}", n),
        }
    }

    /// Closing statement for a callback outcome
    pub(crate) fn closing(failed: bool) -> Self {
        if failed { Self::Rollback } else { Self::Release }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_top_level_statements() {
        assert_eq!(TxStatement::Open.sql(1), "BEGIN");
        assert_eq!(TxStatement::Release.sql(1), "COMMIT");
        assert_eq!(TxStatement::Rollback.sql(1), "ROLLBACK");
    }

    #[test]
    fn test_savepoint_statements() {
        assert_eq!(TxStatement::Open.sql(2), "SAVEPOINT sp2");
        assert_eq!(TxStatement::Release.sql(3), "RELEASE SAVEPOINT sp3");
        assert_eq!(TxStatement::Rollback.sql(5), "ROLLBACK TO SAVEPOINT sp5");
    }

    #[test]
    fn test_closing() {
        assert_eq!(TxStatement::closing(true), TxStatement::Rollback);
        assert_eq!(TxStatement::closing(false), TxStatement::Release);
    }
}
