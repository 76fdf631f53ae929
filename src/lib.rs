//! KDBX3 password vault kept on a detachable Bluetooth card.
//!
//! [`VaultSession`] is the open vault: the decrypted tree together with the
//! composite key and header settings needed to write it back. Containers
//! reach the card through [`sync::SyncHandle`], which drives a
//! [`transport::CardTransport`] from a single worker task.

pub mod codec;
pub mod config;
pub mod crypto;
pub mod error;
pub mod format;
pub mod generate;
pub mod secret;
pub mod storage;
pub mod sync;
pub mod transport;
pub mod tree;

use std::fmt;
use std::path::PathBuf;

use anyhow::{Context, Result};
use directories::ProjectDirs;
use tracing::info;

pub use crate::crypto::{CompositeKey, KdfParams, MIN_TRANSFORM_ROUNDS};
pub use crate::error::KdbxError;
pub use crate::format::{Compression, Header};
pub use crate::storage::Storage;
pub use crate::tree::VaultTree;

/// Name given to the root group of a new vault.
pub const DEFAULT_VAULT_NAME: &str = "Passwords";

/// An open vault.
///
/// All tree changes go through [`VaultSession::tree_mut`]; protected values
/// are only ever stored in plaintext inside the session and are re-protected
/// on every [`VaultSession::encrypt`].
#[derive(Clone)]
pub struct VaultSession {
    tree: VaultTree,
    key: CompositeKey,
    header: Header,
}

impl VaultSession {
    /// New empty vault with the default key derivation and gzip compression.
    pub fn create(password: &str) -> Result<Self, KdbxError> {
        Self::create_with(
            password,
            DEFAULT_VAULT_NAME,
            KdfParams::default(),
            Compression::Gzip,
        )
    }

    pub fn create_with(
        password: &str,
        name: &str,
        kdf: KdfParams,
        compression: Compression,
    ) -> Result<Self, KdbxError> {
        Ok(Self {
            tree: VaultTree::new(name),
            key: CompositeKey::from_password(password),
            header: Header::new(kdf, compression)?,
        })
    }

    /// Decrypts a raw container.
    ///
    /// # Errors
    ///
    /// `AuthenticationFailed` for a wrong password, `CorruptedPayload` for
    /// damaged data and a format error (`UnsupportedVersion` and friends)
    /// for anything that is not a KDBX3 container.
    pub fn open(raw: &[u8], password: &str) -> Result<Self, KdbxError> {
        Self::open_with_key(raw, CompositeKey::from_password(password))
    }

    pub fn open_with_key(raw: &[u8], key: CompositeKey) -> Result<Self, KdbxError> {
        let (mut header, tree) = format::decode(raw, &key)?;

        let rounds = header.kdf().transform_rounds();
        if rounds < MIN_TRANSFORM_ROUNDS {
            info!(
                rounds,
                minimum = MIN_TRANSFORM_ROUNDS,
                "legacy key transform, raising rounds for the next save"
            );
            header.set_kdf(KdfParams::default());
        }

        Ok(Self { tree, key, header })
    }

    /// Serializes the vault into a fresh container. Seeds, IV, stream key
    /// and stream start bytes are redrawn on every call.
    pub fn encrypt(&mut self) -> Result<Vec<u8>, KdbxError> {
        format::encode(&self.tree, &mut self.header, &self.key)
    }

    pub fn tree(&self) -> &VaultTree {
        &self.tree
    }

    pub fn tree_mut(&mut self) -> &mut VaultTree {
        &mut self.tree
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn set_password(&mut self, password: &str) {
        self.key = CompositeKey::from_password(password);
    }

    pub fn set_transform_rounds(&mut self, rounds: u64) -> Result<(), KdbxError> {
        self.header.set_kdf(KdfParams::new(rounds)?);
        Ok(())
    }

    pub fn set_compression(&mut self, compression: Compression) {
        self.header.set_compression(compression);
    }

    pub fn info(&self) -> VaultInfo {
        VaultInfo {
            name: self.tree.meta.database_name.clone(),
            generator: self.tree.meta.generator.clone(),
            version: format!(
                "{}.{}",
                format::header::VERSION_MAJOR,
                self.header.version_minor()
            ),
            transform_rounds: self.header.kdf().transform_rounds(),
            compression: self.header.compression(),
            groups: count_groups(self.tree.root()),
            entries: self.tree.entries().len(),
        }
    }
}

fn count_groups(group: &tree::Group) -> usize {
    group.groups.iter().map(|g| 1 + count_groups(g)).sum()
}

/// Summary printed by `cardvault info`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VaultInfo {
    pub name: String,
    pub generator: String,
    pub version: String,
    pub transform_rounds: u64,
    pub compression: Compression,
    pub groups: usize,
    pub entries: usize,
}

impl fmt::Display for VaultInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let compression = match self.compression {
            Compression::None => "none",
            Compression::Gzip => "gzip",
        };
        writeln!(f, "Name:         {}", self.name)?;
        writeln!(f, "Format:       KDBX {}", self.version)?;
        writeln!(f, "Generator:    {}", self.generator)?;
        writeln!(f, "Rounds:       {}", self.transform_rounds)?;
        writeln!(f, "Compression:  {compression}")?;
        writeln!(f, "Groups:       {}", self.groups)?;
        write!(f, "Entries:      {}", self.entries)
    }
}

fn project_dirs() -> Result<ProjectDirs> {
    ProjectDirs::from("", "", "cardvault").context("could not determine platform directories")
}

/// Local container used when neither `--file` nor `--card` is given.
pub fn default_storage() -> Result<Storage> {
    Ok(Storage::new(project_dirs()?.data_dir().join("vault.kdbx")))
}

pub fn default_config_path() -> Result<PathBuf> {
    Ok(project_dirs()?.config_dir().join("config.json"))
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;
    use crate::tree::{Entry, Group, PASSWORD};

    fn session_with_entry() -> VaultSession {
        let mut session = VaultSession::create("pw").unwrap();
        let root = session.tree().root().uuid;
        let mut entry = Entry::new("github");
        entry.set_field(PASSWORD, "hunter2", true);
        session.tree_mut().add_entry(root, entry);
        session
    }

    #[test]
    fn create_encrypt_open_roundtrip() {
        let mut session = session_with_entry();
        let raw = session.encrypt().unwrap();

        let reopened = VaultSession::open(&raw, "pw").unwrap();
        let entries = reopened.tree().find_entries("github");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].password(), "hunter2");
    }

    #[test]
    fn wrong_password_fails() {
        let raw = session_with_entry().encrypt().unwrap();
        assert!(matches!(
            VaultSession::open(&raw, "nope"),
            Err(KdbxError::AuthenticationFailed)
        ));
    }

    #[test]
    fn changed_password_applies_to_next_save() {
        let mut session = session_with_entry();
        session.set_password("new");
        let raw = session.encrypt().unwrap();

        assert!(VaultSession::open(&raw, "pw").is_err());
        assert!(VaultSession::open(&raw, "new").is_ok());
    }

    #[test]
    fn rounds_below_policy_are_rejected() {
        let mut session = VaultSession::create("pw").unwrap();
        assert!(matches!(
            session.set_transform_rounds(6_000),
            Err(KdbxError::RoundsBelowPolicy { .. })
        ));
        session.set_transform_rounds(100_000).unwrap();
        assert_eq!(session.header().kdf().transform_rounds(), 100_000);
    }

    #[test]
    fn legacy_rounds_are_raised_on_open() {
        let session = session_with_entry();
        let mut header = session.header().clone();
        header.set_kdf(KdfParams::legacy(6_000));
        let raw = encode_legacy(
            session.tree(),
            &mut header,
            &CompositeKey::from_password("pw"),
        );

        let reopened = VaultSession::open(&raw, "pw").unwrap();
        assert_eq!(
            reopened.header().kdf().transform_rounds(),
            MIN_TRANSFORM_ROUNDS
        );
        assert_eq!(reopened.tree().find_entries("github").len(), 1);
    }

    /// Writes a container the way older clients did, below today's policy.
    fn encode_legacy(tree: &VaultTree, header: &mut Header, key: &CompositeKey) -> Vec<u8> {
        use crate::crypto::{ProtectedStreamCipher, kdf};
        use crate::format::{payload, xml};

        header.regenerate().unwrap();
        let mut out = header.to_bytes().unwrap();
        let mut cipher =
            ProtectedStreamCipher::new(header.inner_algorithm(), header.protected_stream_key())
                .unwrap();
        let mut tree = tree.clone();
        tree.meta.header_hash = None;
        let tree = tree.map_protected(|v| Ok(cipher.protect(v))).unwrap();
        let document = xml::write(&tree).unwrap();
        let master =
            kdf::master_key(key, header.master_seed(), header.transform_seed(), header.kdf())
                .unwrap();
        out.extend_from_slice(&payload::encrypt(header, master.as_slice(), &document).unwrap());
        out
    }

    #[test]
    fn info_counts_groups_and_entries() {
        let mut session = session_with_entry();
        let root = session.tree().root().uuid;
        let email = Group::new("Email");
        let email_id = email.uuid;
        session.tree_mut().add_group(root, email);
        session.tree_mut().add_group(email_id, Group::new("Work"));

        let info = session.info();
        assert_eq!(info.groups, 2);
        assert_eq!(info.entries, 1);
        assert_eq!(info.version, "3.1");
        assert!(info.to_string().contains("Rounds:       80000"));
    }

    #[test]
    fn session_persists_through_storage() {
        let dir = tempdir().unwrap();
        let storage = Storage::new(dir.path().join("vault.kdbx"));

        storage.save(&session_with_entry().encrypt().unwrap()).unwrap();
        let reopened = VaultSession::open(&storage.load().unwrap(), "pw").unwrap();
        assert_eq!(reopened.tree().entries().len(), 1);
    }
}
