//! Single-database tar bundles used to move a database between devices.
//!
//! An export holds exactly `src/<name>.db` and `src/<name>.bin`. Import is
//! allow-list based: only regular files named like that are read, every other
//! member is skipped without touching the filesystem.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Component, Path};

use tar::{Archive, Builder, EntryType, Header};
use tracing::{debug, info, warn};

use crate::error::{IoContext, Result, StoreError};
use crate::file_store::{FileStore, DB_EXTENSION, SALT_EXTENSION};
use crate::kdf::SALT_LEN;
use crate::validation::is_valid_name;

pub const ARCHIVE_ROOT: &str = "src";
pub const ARCHIVE_MEDIA_TYPE: &str = "application/x-tar";
pub const ARCHIVE_EXTENSION: &str = "tar";

const MAX_MEMBER_BYTES: u64 = 64 * 1024 * 1024;

/// File name offered to the user when exporting `name`.
pub fn default_archive_name(name: &str) -> String {
    format!("{name}.{ARCHIVE_EXTENSION}")
}

/// Streams the archive for `name` into `writer` and hands the writer back.
pub fn export_to<W: Write>(store: &FileStore, name: &str, writer: W) -> Result<W> {
    if !store.exists(name) {
        return Err(StoreError::NotFound(name.to_string()));
    }
    let mut builder = Builder::new(writer);
    for (extension, path) in [
        (DB_EXTENSION, store.db_path(name)),
        (SALT_EXTENSION, store.salt_path(name)),
    ] {
        let data = std::fs::read(&path).io_context(|| format!("read {}", path.display()))?;
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Regular);
        header.set_size(data.len() as u64);
        header.set_mode(0o600);
        header.set_mtime(0);
        let member = format!("{ARCHIVE_ROOT}/{name}.{extension}");
        builder
            .append_data(&mut header, &member, data.as_slice())
            .io_context(|| format!("archive {member}"))?;
    }
    let writer = builder
        .into_inner()
        .io_context(|| format!("finish archive for {name}"))?;
    info!(database = %name, "database exported");
    Ok(writer)
}

pub fn export_bytes(store: &FileStore, name: &str) -> Result<Vec<u8>> {
    export_to(store, name, Vec::new())
}

pub fn export_to_file(store: &FileStore, name: &str, dest: &Path) -> Result<()> {
    let file = File::create(dest).io_context(|| format!("create {}", dest.display()))?;
    let file = export_to(store, name, file)?;
    file.sync_all()
        .io_context(|| format!("sync {}", dest.display()))
}

#[derive(Default)]
struct Pair {
    token: Option<Vec<u8>>,
    salt: Option<Vec<u8>>,
}

enum Member {
    Token,
    Salt,
}

struct Bundled {
    name: String,
    token: String,
    salt: Vec<u8>,
}

/// The complete databases found in an archive, read but not yet installed.
pub struct Bundle {
    databases: Vec<Bundled>,
}

impl Bundle {
    /// Names carried by the archive, sorted.
    pub fn names(&self) -> Vec<String> {
        self.databases.iter().map(|db| db.name.clone()).collect()
    }
}

/// Reads every `src/<name>.db` / `src/<name>.bin` pair out of `reader`.
/// Fails when the archive holds no complete pair.
pub fn read_bundle<R: Read>(reader: R) -> Result<Bundle> {
    let mut archive = Archive::new(reader);
    let mut pairs: BTreeMap<String, Pair> = BTreeMap::new();

    let entries = archive
        .entries()
        .map_err(|e| StoreError::Archive(format!("unreadable archive: {e}")))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| StoreError::Archive(format!("bad member: {e}")))?;
        let path = entry
            .path()
            .map_err(|e| StoreError::Archive(format!("bad member path: {e}")))?
            .into_owned();
        if !entry.header().entry_type().is_file() {
            debug!(member = %path.display(), "skipping non-file archive member");
            continue;
        }
        let Some((name, member)) = classify(&path) else {
            debug!(member = %path.display(), "skipping unrecognized archive member");
            continue;
        };
        if entry.size() > MAX_MEMBER_BYTES {
            return Err(StoreError::Archive(format!(
                "{} is larger than {MAX_MEMBER_BYTES} bytes",
                path.display()
            )));
        }
        let mut data = Vec::new();
        entry
            .read_to_end(&mut data)
            .map_err(|e| StoreError::Archive(format!("read {}: {e}", path.display())))?;
        let pair = pairs.entry(name).or_default();
        match member {
            Member::Token => pair.token = Some(data),
            Member::Salt => pair.salt = Some(data),
        }
    }

    let mut databases = Vec::new();
    for (name, pair) in pairs {
        match (pair.token, pair.salt) {
            (Some(token), Some(salt)) => {
                if salt.len() != SALT_LEN {
                    return Err(StoreError::Archive(format!(
                        "{name}.{SALT_EXTENSION} holds {} bytes, expected {SALT_LEN}",
                        salt.len()
                    )));
                }
                let token = String::from_utf8(token).map_err(|_| {
                    StoreError::Archive(format!("{name}.{DB_EXTENSION} is not UTF-8"))
                })?;
                databases.push(Bundled { name, token, salt });
            }
            _ => warn!(database = %name, "archive holds only half of a database, skipping"),
        }
    }
    if databases.is_empty() {
        return Err(StoreError::Archive("no database found in archive".into()));
    }
    Ok(Bundle { databases })
}

/// Installs every database of `bundle` and returns their names. Names already
/// present in the store are rejected before anything is written.
pub fn install_bundle(store: &FileStore, bundle: Bundle) -> Result<Vec<String>> {
    if let Some(taken) = bundle.databases.iter().find(|db| store.exists(&db.name)) {
        return Err(StoreError::NameTaken(taken.name.clone()));
    }
    let mut imported = Vec::with_capacity(bundle.databases.len());
    for db in bundle.databases {
        store.install_pair(&db.name, &db.salt, &db.token)?;
        info!(database = %db.name, "database imported");
        imported.push(db.name);
    }
    Ok(imported)
}

pub fn import_from<R: Read>(store: &FileStore, reader: R) -> Result<Vec<String>> {
    install_bundle(store, read_bundle(reader)?)
}

pub fn import_bytes(store: &FileStore, bytes: &[u8]) -> Result<Vec<String>> {
    import_from(store, bytes)
}

pub fn import_from_file(store: &FileStore, src: &Path) -> Result<Vec<String>> {
    let file = File::open(src).io_context(|| format!("open {}", src.display()))?;
    import_from(store, file)
}

/// Maps `src/<name>.db` / `src/<name>.bin` to the database name; anything
/// else is not ours.
fn classify(path: &Path) -> Option<(String, Member)> {
    let mut components = path.components();
    let (Some(Component::Normal(root)), Some(Component::Normal(file)), None) =
        (components.next(), components.next(), components.next())
    else {
        return None;
    };
    if root != ARCHIVE_ROOT {
        return None;
    }
    let file = file.to_str()?;
    let (stem, member) = if let Some(stem) = file.strip_suffix(&format!(".{DB_EXTENSION}")) {
        (stem, Member::Token)
    } else if let Some(stem) = file.strip_suffix(&format!(".{SALT_EXTENSION}")) {
        (stem, Member::Salt)
    } else {
        return None;
    };
    is_valid_name(stem).then(|| (stem.to_string(), member))
}
