//! Error types for sqlx-sqlite-conn-pool

use std::ffi::CStr;
use std::fmt;

use libsqlite3_sys as ffi;
use thiserror::Error;

/// A native SQLite error: extended result code plus the engine's message.
///
/// Never constructed for the non-error codes `SQLITE_OK`, `SQLITE_ROW` and
/// `SQLITE_DONE`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeError {
   code: i32,
   message: String,
}

impl NativeError {
   /// Wraps a native result code, returning `None` when the code does not
   /// denote an error.
   pub fn new(code: i32, message: impl Into<String>) -> Option<Self> {
      match code & 0xff {
         ffi::SQLITE_OK | ffi::SQLITE_ROW | ffi::SQLITE_DONE => None,
         _ => Some(Self {
            code,
            message: message.into(),
         }),
      }
   }

   /// Extracts the native error carried by a sqlx database error.
   pub(crate) fn from_sqlx(err: &sqlx::Error) -> Option<Self> {
      let db_err = err.as_database_error()?;
      let code = db_err.code()?.parse::<i32>().ok()?;
      Self::new(code, db_err.message())
   }

   /// Extended result code as reported by the engine.
   pub fn code(&self) -> i32 {
      self.code
   }

   /// Primary result code (the low byte of the extended code).
   pub fn primary_code(&self) -> i32 {
      self.code & 0xff
   }

   /// Message reported by the engine for this failure.
   pub fn message(&self) -> &str {
      &self.message
   }

   /// English description of the result code, from `sqlite3_errstr`.
   pub fn description(&self) -> String {
      // SAFETY: sqlite3_errstr returns a pointer to a static, NUL-terminated
      // string for every input code (unknown codes map to "unknown error").
      unsafe {
         let ptr = ffi::sqlite3_errstr(self.code);
         if ptr.is_null() {
            return String::from("unknown error");
         }
         CStr::from_ptr(ptr).to_string_lossy().into_owned()
      }
   }

   /// True for table-lock and busy conditions, the codes a lock policy may retry.
   pub fn is_lock(&self) -> bool {
      matches!(self.primary_code(), ffi::SQLITE_BUSY | ffi::SQLITE_LOCKED)
   }
}

impl fmt::Display for NativeError {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      write!(
         f,
         "{} (code {}: {})",
         self.message,
         self.code,
         self.description()
      )
   }
}

impl std::error::Error for NativeError {}

/// Errors that may occur when working with sqlx-sqlite-conn-pool
#[derive(Error, Debug)]
pub enum Error {
   /// The engine could not open or configure a connection handle
   #[error("failed to open database: {0}")]
   Open(NativeError),

   /// Compiling, binding or stepping a statement failed
   #[error("SQL error: {0}")]
   Sql(NativeError),

   /// A table lock or busy condition that the lock policy did not resolve
   #[error("database is locked: {0}")]
   Lock(NativeError),

   /// A result column could not be converted to the requested type
   #[error("failed to decode column: {0}")]
   Decode(#[source] sqlx::Error),

   /// The statement references a named parameter that was not supplied
   #[error("no value supplied for parameter '{0}'")]
   MissingParameter(String),

   /// The connection handle has already been closed
   #[error("connection has been closed")]
   ConnectionClosed,

   /// Database has been closed and cannot be used
   #[error("Database has been closed")]
   DatabaseClosed,

   /// IO error when accessing database files. Standard library IO errors
   /// are converted to this variant.
   #[error("IO error: {0}")]
   Io(#[from] std::io::Error),

   /// Error from the sqlx library that carries no native SQLite code
   #[error("Sqlx error: {0}")]
   Sqlx(sqlx::Error),
}

impl Error {
   /// Classifies a sqlx error raised while running a statement.
   pub(crate) fn from_statement(err: sqlx::Error) -> Self {
      if matches!(
         err,
         sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_)
      ) {
         return Error::Decode(err);
      }

      match NativeError::from_sqlx(&err) {
         Some(native) if native.is_lock() => Error::Lock(native),
         Some(native) => Error::Sql(native),
         None => Error::Sqlx(err),
      }
   }

   /// Classifies a sqlx error raised while opening or configuring a handle.
   pub(crate) fn from_open(err: sqlx::Error) -> Self {
      match NativeError::from_sqlx(&err) {
         Some(native) => Error::Open(native),
         None => match err {
            sqlx::Error::Io(io) => Error::Io(io),
            other => Error::Sqlx(other),
         },
      }
   }

   /// The native error wrapped by this error, if any.
   pub fn native(&self) -> Option<&NativeError> {
      match self {
         Error::Open(native) | Error::Sql(native) | Error::Lock(native) => Some(native),
         _ => None,
      }
   }

   /// True when the error is a lock condition a retry could resolve.
   pub fn is_lock(&self) -> bool {
      matches!(self, Error::Lock(_))
   }

   /// Extract a structured error code from the error type.
   ///
   /// This provides machine-readable error codes for error handling.
   pub fn error_code(&self) -> String {
      match self {
         Error::Open(native) | Error::Sql(native) | Error::Lock(native) => {
            format!("SQLITE_{}", native.code())
         }
         Error::Decode(_) => "DECODE_ERROR".to_string(),
         Error::MissingParameter(_) => "MISSING_PARAMETER".to_string(),
         Error::ConnectionClosed => "CONNECTION_CLOSED".to_string(),
         Error::DatabaseClosed => "DATABASE_CLOSED".to_string(),
         Error::Io(_) => "IO_ERROR".to_string(),
         Error::Sqlx(_) => "SQLX_ERROR".to_string(),
      }
   }
}

/// A type alias for Results with our Error type
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_non_error_codes_are_not_wrapped() {
      assert!(NativeError::new(ffi::SQLITE_OK, "").is_none());
      assert!(NativeError::new(ffi::SQLITE_ROW, "").is_none());
      assert!(NativeError::new(ffi::SQLITE_DONE, "").is_none());
      assert!(NativeError::new(ffi::SQLITE_ERROR, "near \"SELEC\": syntax error").is_some());
   }

   #[test]
   fn test_lock_codes() {
      let busy = NativeError::new(ffi::SQLITE_BUSY, "database is locked").unwrap();
      assert!(busy.is_lock());

      // SQLITE_LOCKED_SHAREDCACHE is an extended form of SQLITE_LOCKED
      let shared = NativeError::new(ffi::SQLITE_LOCKED_SHAREDCACHE, "table locked").unwrap();
      assert_eq!(shared.primary_code(), ffi::SQLITE_LOCKED);
      assert!(shared.is_lock());

      let constraint = NativeError::new(ffi::SQLITE_CONSTRAINT, "NOT NULL").unwrap();
      assert!(!constraint.is_lock());
   }

   #[test]
   fn test_description_uses_engine_text() {
      let err = NativeError::new(ffi::SQLITE_BUSY, "database is locked").unwrap();
      assert_eq!(err.description(), "database is locked");

      let err = NativeError::new(ffi::SQLITE_CANTOPEN, "unable to open database file").unwrap();
      assert!(err.to_string().contains("code 14"));
   }

   #[test]
   fn test_error_codes() {
      let native = NativeError::new(ffi::SQLITE_CONSTRAINT_NOTNULL, "NOT NULL").unwrap();
      assert_eq!(Error::Sql(native).error_code(), "SQLITE_1299");
      assert_eq!(Error::DatabaseClosed.error_code(), "DATABASE_CLOSED");
      assert_eq!(
         Error::MissingParameter("name".into()).error_code(),
         "MISSING_PARAMETER"
      );
      assert_eq!(
         Error::Sqlx(sqlx::Error::RowNotFound).error_code(),
         "SQLX_ERROR"
      );
   }

   #[test]
   fn test_non_native_sqlx_errors_are_not_lock_errors() {
      let err = Error::from_statement(sqlx::Error::RowNotFound);
      assert!(matches!(err, Error::Sqlx(_)));
      assert!(err.native().is_none());
      assert!(!err.is_lock());
   }
}
