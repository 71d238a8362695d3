//! PostgreSQL Error Codes
//!
//! Provides constants for the PostgreSQL SQLSTATE error codes this client
//! reacts to. Everything not listed here passes through unmodified.
//!
//! ## SQLSTATE Format
//!
//! PostgreSQL error codes follow the SQL standard SQLSTATE format:
//! - 5-character codes representing error classes and conditions
//! - First 2 characters: error class
//! - Last 3 characters: specific condition
//!
//! ## Reference
//!
//! Full list: <https://www.postgresql.org/docs/current/errcodes-appendix.html>
//!
//! ## Usage
//!
//! ```rust
//! use plugsql_core::database::error_codes::PgErrorCode;
//!
//! assert!(PgErrorCode::is_undefined_table("42P01"));
//! assert!(!PgErrorCode::is_undefined_table("42703"));
//! ```

/// PostgreSQL SQLSTATE error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PgErrorCode;

impl PgErrorCode {
    // =========================================================================
    // Class 42 - Syntax Error or Access Rule Violation
    // =========================================================================

    /// Undefined table - Code 42P01
    ///
    /// Raised as `relation "schema.table" does not exist`. When plugin workers
    /// are still materialising a connection's schema this is transient; the
    /// schema retry controller decides whether to wait for it.
    pub const UNDEFINED_TABLE: &'static str = "42P01";

    // =========================================================================
    // Class 25 - Invalid Transaction State
    // =========================================================================

    /// Idle in transaction session timeout - Code 25P03
    ///
    /// The server terminated a connection that sat idle inside a transaction.
    /// The pooled handle is dead and must be replaced.
    pub const IDLE_IN_TRANSACTION_SESSION_TIMEOUT: &'static str = "25P03";

    // =========================================================================
    // Class 57 - Operator Intervention
    // =========================================================================

    /// Admin shutdown - Code 57P01
    pub const ADMIN_SHUTDOWN: &'static str = "57P01";

    /// Crash shutdown - Code 57P02
    pub const CRASH_SHUTDOWN: &'static str = "57P02";

    /// Cannot connect now - Code 57P03
    pub const CANNOT_CONNECT_NOW: &'static str = "57P03";

    // =========================================================================
    // Helper Methods
    // =========================================================================

    /// Check if the error code is "relation does not exist"
    #[inline]
    pub fn is_undefined_table(code: &str) -> bool {
        code == Self::UNDEFINED_TABLE
    }

    /// Check if the error code means the connection itself is no longer usable.
    /// Every class 08 connection exception counts.
    #[inline]
    pub fn is_stale_connection(code: &str) -> bool {
        code == Self::IDLE_IN_TRANSACTION_SESSION_TIMEOUT
            || code == Self::ADMIN_SHUTDOWN
            || code == Self::CRASH_SHUTDOWN
            || code == Self::CANNOT_CONNECT_NOW
            || code.starts_with("08")
    }
}
