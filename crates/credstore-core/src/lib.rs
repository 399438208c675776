//! Password-protected credential databases.
//!
//! Each database is a salt file plus a token file holding the encrypted
//! account map. Keys come from PBKDF2 and are cached per password and salt.

pub mod account;
pub mod archive;
pub mod error;
pub mod file_store;
pub mod kdf;
pub mod key_cache;
pub mod password_gen;
pub mod paths;
pub mod records;
pub mod service;
pub mod settings;
pub mod token;
pub mod validation;

pub use account::{Account, Database, RecordMap};
pub use error::{ErrorKind, Result, StoreError};
pub use file_store::FileStore;
pub use key_cache::{KeyCache, SharedKeyCache};
pub use service::{DatabaseService, PromptOutcome};
pub use settings::StoreSettings;
