//! Flat credential store: username → optional plaintext password.
//!
//! Loaded once at startup and written back wholesale on clean shutdown.
//! A `null` password means the user registered without one and may log in
//! without a password.

use log::info;
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;

use crate::error::StoreError;

#[derive(Debug)]
pub struct UserStore {
    path: PathBuf,
    users: BTreeMap<String, Option<String>>,
}

impl UserStore {
    /// Loads the store from `path`. A missing file yields an empty store.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let users = match fs::read_to_string(&path) {
            Ok(contents) if contents.trim().is_empty() => BTreeMap::new(),
            Ok(contents) => {
                serde_json::from_str(&contents).map_err(|source| StoreError::Json {
                    path: path.clone(),
                    source,
                })?
            }
            Err(e) if e.kind() == ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(StoreError::io(path, e)),
        };

        info!("Loaded {} registered users from {}", users.len(), path.display());
        Ok(Self { path, users })
    }

    /// Writes every registered user back to disk.
    pub fn save(&self) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
            }
        }

        let contents =
            serde_json::to_string_pretty(&self.users).map_err(|source| StoreError::Json {
                path: self.path.clone(),
                source,
            })?;
        fs::write(&self.path, contents).map_err(|e| StoreError::io(&self.path, e))?;

        info!("Saved {} users to {}", self.users.len(), self.path.display());
        Ok(())
    }

    pub fn is_registered(&self, username: &str) -> bool {
        self.users.contains_key(username)
    }

    /// Registers a new user. Returns false if the name is already taken.
    pub fn register(&mut self, username: &str, password: Option<String>) -> bool {
        if self.users.contains_key(username) {
            return false;
        }
        info!("Registered new user {}", username);
        self.users.insert(username.to_string(), password);
        true
    }

    /// Checks a login attempt against the stored password.
    ///
    /// Unknown users never validate. Users stored without a password accept
    /// any attempt.
    pub fn check_password(&self, username: &str, password: Option<&str>) -> bool {
        match self.users.get(username) {
            Some(Some(stored)) => password == Some(stored.as_str()),
            Some(None) => true,
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}
