use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::error::{Result, StoreError};
use crate::kdf::Salt;

/// Account name → account. Ordered so the encoded form is canonical.
pub type RecordMap = BTreeMap<String, Account>;

/// One set of credentials. Field names on the wire are fixed; existing
/// databases depend on them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    #[serde(rename = "account")]
    pub account_name: String,
    #[serde(rename = "name")]
    pub username: String,
    pub email: String,
    pub password: String,
    pub date: String,
    pub comment: String,
    /// Whether the front end copies the email instead of the username.
    #[serde(rename = "copyEmail", default)]
    pub copy_email: bool,
    /// File name → base64url encoded content.
    #[serde(
        default,
        alias = "attachedFiles",
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub attached_files: BTreeMap<String, String>,
}

impl Account {
    pub fn new(
        account_name: impl Into<String>,
        username: impl Into<String>,
        email: impl Into<String>,
        password: impl Into<String>,
        date: impl Into<String>,
        comment: impl Into<String>,
    ) -> Self {
        Self {
            account_name: account_name.into(),
            username: username.into(),
            email: email.into(),
            password: password.into(),
            date: date.into(),
            comment: comment.into(),
            copy_email: false,
            attached_files: BTreeMap::new(),
        }
    }

    pub fn with_attachment(mut self, file_name: impl Into<String>, content: &[u8]) -> Self {
        use base64::{engine::general_purpose, Engine as _};
        self.attached_files
            .insert(file_name.into(), general_purpose::URL_SAFE.encode(content));
        self
    }

    pub fn attachment(&self, file_name: &str) -> Option<Result<Vec<u8>>> {
        use base64::{engine::general_purpose, Engine as _};
        self.attached_files.get(file_name).map(|encoded| {
            general_purpose::URL_SAFE
                .decode(encoded)
                .map_err(|e| StoreError::Corrupted(format!("attachment {file_name}: {e}")))
        })
    }
}

/// A named credential database. Locked databases carry only their name;
/// open ones also hold the password, the salt and the decrypted records.
#[derive(Clone)]
pub struct Database {
    pub name: String,
    password: Option<Zeroizing<String>>,
    pub salt: Option<Salt>,
    pub records: RecordMap,
}

impl Database {
    /// A locked catalog entry.
    pub fn locked(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            password: None,
            salt: None,
            records: RecordMap::new(),
        }
    }

    /// A database ready to be written: password, salt and records present.
    pub fn new(
        name: impl Into<String>,
        password: impl Into<String>,
        salt: Salt,
        records: RecordMap,
    ) -> Self {
        Self {
            name: name.into(),
            password: Some(Zeroizing::new(password.into())),
            salt: Some(salt),
            records,
        }
    }

    pub fn is_open(&self) -> bool {
        self.password.is_some()
    }

    pub fn password(&self) -> Option<&str> {
        self.password.as_deref().map(String::as_str)
    }

    pub fn set_password(&mut self, password: impl Into<String>) {
        self.password = Some(Zeroizing::new(password.into()));
    }

    /// Forgets the password and the decrypted records.
    pub fn close(&mut self) {
        self.password = None;
        self.records.clear();
    }

    /// Password and salt of an open database.
    pub(crate) fn credentials(&self) -> Result<(&str, &Salt)> {
        match (self.password(), self.salt.as_ref()) {
            (Some(password), Some(salt)) => Ok((password, salt)),
            _ => Err(StoreError::Locked(self.name.clone())),
        }
    }

    pub fn insert_account(&mut self, account: Account) -> Result<()> {
        if self.records.contains_key(&account.account_name) {
            return Err(StoreError::AccountExists(account.account_name));
        }
        self.records.insert(account.account_name.clone(), account);
        Ok(())
    }

    /// Replaces `old_name` with `account`, which may carry a new name as long
    /// as that name is not used by another account.
    pub fn replace_account(&mut self, old_name: &str, account: Account) -> Result<()> {
        if !self.records.contains_key(old_name) {
            return Err(StoreError::AccountNotFound(old_name.to_string()));
        }
        if account.account_name != old_name && self.records.contains_key(&account.account_name) {
            return Err(StoreError::AccountExists(account.account_name));
        }
        self.records.remove(old_name);
        self.records.insert(account.account_name.clone(), account);
        Ok(())
    }

    pub fn remove_account(&mut self, name: &str) -> Result<Account> {
        self.records
            .remove(name)
            .ok_or_else(|| StoreError::AccountNotFound(name.to_string()))
    }
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("name", &self.name)
            .field("is_open", &self.is_open())
            .field("accounts", &self.records.len())
            .finish()
    }
}
