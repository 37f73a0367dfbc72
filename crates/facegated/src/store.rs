//! Flat-file user store.
//!
//! Users live in one JSON document (`{"users": [...]}`) with SHA-256 hashed
//! passwords. Registration photos are written next to it under
//! `faces/<user id>/<n>.jpg`.

use chrono::{DateTime, Utc};
use facegate_core::sink::{
    Identity, RegistrationRequest, RegistrationSink, SinkFuture, SubmissionError,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::Mutex;

pub const FACES_DIR: &str = "faces";
pub const DEFAULT_ROLE: &str = "mahasiswa";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("{0} is already registered")]
    Duplicate(String),
    #[error("{0} is required")]
    MissingField(&'static str),
    #[error("store io: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt user store: {0}")]
    Corrupt(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: String,
    #[serde(rename = "email")]
    pub identifier: String,
    /// Hex SHA-256 of the password.
    #[serde(rename = "password")]
    pub password_hash: String,
    pub name: String,
    pub role: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Photo paths relative to the store directory.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub photos: Vec<PathBuf>,
}

impl UserRecord {
    pub fn identity(&self) -> Identity {
        Identity {
            id: self.id.clone(),
            identifier: self.identifier.clone(),
            display_name: self.name.clone(),
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct UsersFile {
    #[serde(default)]
    users: Vec<UserRecord>,
}

pub fn hash_password(password: &str) -> String {
    Sha256::digest(password.as_bytes())
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

pub fn verify_password(password: &str, hash: &str) -> bool {
    hash_password(password) == hash
}

pub struct FileUserStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileUserStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn root(&self) -> &Path {
        self.path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."))
    }

    async fn read(&self) -> Result<UsersFile, StoreError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Ok(UsersFile::default()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(UsersFile::default()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, file: &UsersFile) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(self.root()).await?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(file)?).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    pub async fn list(&self) -> Result<Vec<UserRecord>, StoreError> {
        Ok(self.read().await?.users)
    }

    pub async fn find_by_identifier(&self, identifier: &str) -> Result<Option<UserRecord>, StoreError> {
        Ok(self
            .read()
            .await?
            .users
            .into_iter()
            .find(|u| u.identifier == identifier))
    }

    /// Check a login. `Ok(None)` when the identifier is unknown or the
    /// password does not match.
    pub async fn authenticate(
        &self,
        identifier: &str,
        password: &str,
    ) -> Result<Option<UserRecord>, StoreError> {
        if identifier.trim().is_empty() {
            return Err(StoreError::MissingField("identifier"));
        }
        if password.is_empty() {
            return Err(StoreError::MissingField("password"));
        }

        let user = self
            .find_by_identifier(identifier)
            .await?
            .filter(|u| verify_password(password, &u.password_hash));
        if user.is_none() {
            tracing::info!(identifier, "login rejected");
        }
        Ok(user)
    }

    async fn write_photos(
        &self,
        photo_dir: &Path,
        request: &RegistrationRequest,
    ) -> Result<Vec<PathBuf>, StoreError> {
        tokio::fs::create_dir_all(self.root().join(photo_dir)).await?;

        let mut photos = Vec::with_capacity(request.photos.len());
        for (n, photo) in request.photos.iter().enumerate() {
            let relative = photo_dir.join(format!("{}.jpg", n + 1));
            tokio::fs::write(self.root().join(&relative), &photo.jpeg).await?;
            photos.push(relative);
        }
        Ok(photos)
    }

    /// Remove photos of a user that was never committed.
    async fn discard_photos(&self, photo_dir: &Path) {
        let dir = self.root().join(photo_dir);
        if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
            tracing::warn!(error = %e, dir = %dir.display(), "failed to remove orphaned photos");
        }
    }

    /// Create a user from a registration request, saving its photos.
    pub async fn create(&self, request: &RegistrationRequest) -> Result<UserRecord, StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut file = self.read().await?;

        if file.users.iter().any(|u| u.identifier == request.identifier) {
            return Err(StoreError::Duplicate(request.identifier.clone()));
        }

        let id = uuid::Uuid::new_v4().to_string();
        let photo_dir = Path::new(FACES_DIR).join(&id);
        let photos = match self.write_photos(&photo_dir, request).await {
            Ok(photos) => photos,
            Err(e) => {
                self.discard_photos(&photo_dir).await;
                return Err(e);
            }
        };

        let now = Utc::now();
        let record = UserRecord {
            id,
            identifier: request.identifier.clone(),
            password_hash: hash_password(&request.credential),
            name: request.display_name.clone(),
            role: DEFAULT_ROLE.to_string(),
            created_at: now,
            updated_at: now,
            photos,
        };
        file.users.push(record.clone());
        if let Err(e) = self.write(&file).await {
            self.discard_photos(&photo_dir).await;
            return Err(e);
        }

        tracing::info!(id = %record.id, identifier = %record.identifier, photos = record.photos.len(), "user created");
        Ok(record)
    }
}

impl RegistrationSink for FileUserStore {
    fn register<'a>(&'a self, request: &'a RegistrationRequest) -> SinkFuture<'a, Identity> {
        Box::pin(async move {
            match self.create(request).await {
                Ok(record) => Ok(record.identity()),
                Err(StoreError::Duplicate(identifier)) => {
                    Err(SubmissionError::DuplicateIdentity(identifier))
                }
                Err(e) => {
                    tracing::error!(error = %e, path = %self.path.display(), "user store failure");
                    Err(SubmissionError::SubmissionFailed(e.to_string()))
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use facegate_core::types::CapturedImage;
    use std::time::Instant;

    fn request(identifier: &str) -> RegistrationRequest {
        let photo = |tag: u8| CapturedImage {
            jpeg: vec![0xFF, 0xD8, tag, 0xFF, 0xD9],
            width: 640,
            height: 480,
            captured_at: Instant::now(),
        };
        RegistrationRequest {
            identifier: identifier.into(),
            credential: "abcdef".into(),
            display_name: "Jane Doe".into(),
            photos: vec![photo(1), photo(2), photo(3)],
        }
    }

    #[test]
    fn test_hash_password_is_hex_sha256() {
        assert_eq!(
            hash_password("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert!(verify_password("abc", &hash_password("abc")));
        assert!(!verify_password("abd", &hash_password("abc")));
    }

    #[tokio::test]
    async fn test_register_creates_user_and_photos() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileUserStore::new(dir.path().join("users.json"));

        let identity = store.register(&request("jdoe")).await.unwrap();
        assert_eq!(identity.identifier, "jdoe");
        assert_eq!(identity.display_name, "Jane Doe");

        let record = store.find_by_identifier("jdoe").await.unwrap().unwrap();
        assert_eq!(record.id, identity.id);
        assert_eq!(record.role, "mahasiswa");
        assert!(verify_password("abcdef", &record.password_hash));
        assert_eq!(record.photos.len(), 3);
        let second = std::fs::read(dir.path().join(&record.photos[1])).unwrap();
        assert_eq!(second[2], 2);
        assert!(record.photos[0].ends_with("1.jpg"));

        let raw: serde_json::Value =
            serde_json::from_slice(&std::fs::read(store.path()).unwrap()).unwrap();
        assert_eq!(raw["users"][0]["email"], "jdoe");
        assert_eq!(raw["users"][0]["role"], "mahasiswa");
        assert_ne!(raw["users"][0]["password"], "abcdef");
    }

    #[tokio::test]
    async fn test_duplicate_identifier_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileUserStore::new(dir.path().join("users.json"));

        store.register(&request("jdoe")).await.unwrap();
        let err = store.register(&request("jdoe")).await.unwrap_err();
        assert_eq!(err, SubmissionError::DuplicateIdentity("jdoe".into()));
        assert_eq!(store.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_or_empty_file_is_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("users.json");
        let store = FileUserStore::new(&path);
        assert!(store.list().await.unwrap().is_empty());

        std::fs::write(&path, "\n").unwrap();
        assert!(store.list().await.unwrap().is_empty());
        assert!(store.find_by_identifier("jdoe").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_corrupt_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("users.json");
        std::fs::write(&path, "{not json").unwrap();
        let store = FileUserStore::new(&path);

        assert!(matches!(store.list().await, Err(StoreError::Corrupt(_))));
        let err = store.register(&request("jdoe")).await.unwrap_err();
        assert!(matches!(err, SubmissionError::SubmissionFailed(_)));
    }

    #[tokio::test]
    async fn test_authenticate() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileUserStore::new(dir.path().join("users.json"));
        let identity = store.register(&request("jdoe")).await.unwrap();

        let user = store.authenticate("jdoe", "abcdef").await.unwrap().unwrap();
        assert_eq!(user.id, identity.id);
        assert!(store.authenticate("jdoe", "abcdeg").await.unwrap().is_none());
        assert!(store.authenticate("asmith", "abcdef").await.unwrap().is_none());

        assert!(matches!(
            store.authenticate("", "abcdef").await,
            Err(StoreError::MissingField("identifier"))
        ));
        assert!(matches!(
            store.authenticate("jdoe", "").await,
            Err(StoreError::MissingField("password"))
        ));
    }

    #[tokio::test]
    async fn test_failed_commit_removes_photos() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileUserStore::new(dir.path().join("users.json"));
        // a directory where the temp file should go makes the commit fail
        std::fs::create_dir(dir.path().join("users.json.tmp")).unwrap();

        let err = store.register(&request("jdoe")).await.unwrap_err();
        assert!(matches!(err, SubmissionError::SubmissionFailed(_)));

        let leftover = std::fs::read_dir(dir.path().join(FACES_DIR)).unwrap().count();
        assert_eq!(leftover, 0);
        assert!(store.list().await.unwrap().is_empty());
    }
}
