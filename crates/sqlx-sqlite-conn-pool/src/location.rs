//! Where a database lives

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteConnectOptions;
use uuid::Uuid;

use crate::{Error, Result};

/// Storage location of a logical database.
///
/// The writer and every reader of one database must be opened against the
/// same location value. The constructors for the in-memory and temporary
/// variants generate a unique name once, so clones of a location always refer
/// to the same database.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StorageLocation {
   /// Named shared-cache memory database. Lives as long as one connection to
   /// it stays open.
   InMemory { name: String },

   /// Database file under the OS temp directory, deleted when the owning
   /// [`Database`](crate::Database) closes.
   Temporary { path: PathBuf },

   /// Database file at a caller-chosen path
   Persistent(PathBuf),
}

impl StorageLocation {
   pub fn in_memory() -> Self {
      Self::InMemory {
         name: format!("sqlx-conn-pool-{}", Uuid::new_v4()),
      }
   }

   pub fn temporary() -> Self {
      Self::Temporary {
         path: std::env::temp_dir().join(format!("sqlx-conn-pool-{}.db", Uuid::new_v4())),
      }
   }

   pub fn persistent(path: impl Into<PathBuf>) -> Self {
      Self::Persistent(path.into())
   }

   /// Path of the main database file, `None` for in-memory databases
   pub fn path(&self) -> Option<&Path> {
      match self {
         Self::InMemory { .. } => None,
         Self::Temporary { path } | Self::Persistent(path) => Some(path),
      }
   }

   pub fn is_on_disk(&self) -> bool {
      self.path().is_some()
   }

   /// Base connect options for this location. Callers layer access flags on top.
   pub(crate) fn connect_options(&self) -> Result<SqliteConnectOptions> {
      match self {
         Self::InMemory { name } => {
            SqliteConnectOptions::from_str(&format!("sqlite:file:{name}?mode=memory&cache=shared"))
               .map_err(Error::from_open)
         }
         Self::Temporary { path } | Self::Persistent(path) => {
            Ok(SqliteConnectOptions::new().filename(path))
         }
      }
   }

   /// The main file plus the side files the engine may create next to it
   pub(crate) fn database_files(&self) -> Vec<PathBuf> {
      let Some(path) = self.path() else {
         return Vec::new();
      };

      let mut files = vec![path.to_path_buf()];
      for suffix in ["-wal", "-shm", "-journal"] {
         let mut side = path.as_os_str().to_owned();
         side.push(suffix);
         files.push(PathBuf::from(side));
      }
      files
   }
}

impl fmt::Display for StorageLocation {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      match self {
         Self::InMemory { name } => write!(f, "memory:{name}"),
         Self::Temporary { path } | Self::Persistent(path) => write!(f, "{}", path.display()),
      }
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_generated_locations_are_unique() {
      assert_ne!(StorageLocation::in_memory(), StorageLocation::in_memory());
      assert_ne!(StorageLocation::temporary(), StorageLocation::temporary());

      let location = StorageLocation::in_memory();
      assert_eq!(location.clone(), location);
   }

   #[test]
   fn test_in_memory_has_no_files() {
      let location = StorageLocation::in_memory();
      assert!(!location.is_on_disk());
      assert!(location.database_files().is_empty());
   }

   #[test]
   fn test_database_files_include_side_files() {
      let location = StorageLocation::persistent("/data/app.db");
      let files = location.database_files();

      assert_eq!(
         files,
         vec![
            PathBuf::from("/data/app.db"),
            PathBuf::from("/data/app.db-wal"),
            PathBuf::from("/data/app.db-shm"),
            PathBuf::from("/data/app.db-journal"),
         ]
      );
   }

   #[test]
   fn test_temporary_lives_in_temp_dir() {
      let location = StorageLocation::temporary();
      let path = location.path().unwrap();
      assert!(path.starts_with(std::env::temp_dir()));
   }
}
