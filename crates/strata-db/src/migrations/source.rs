//! Discovery and parsing of migration files.
//!
//! One file per migration, named `<id>_<name>.sql` where `<id>` is a
//! sortable run of digits (normally a `YYYYMMDDHHMMSS` timestamp). The body
//! is split by marker lines:
//!
//! ```sql
//! -- migrate:up
//! CREATE TABLE users (id TEXT PRIMARY KEY);
//!
//! -- migrate:down
//! DROP TABLE users;
//! ```
//!
//! Files with any other extension are ignored.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use super::error::MigrationError;

const UP_MARKER: &str = "migrate:up";
const DOWN_MARKER: &str = "migrate:down";

/// Sortable migration identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct MigrationId(u64);

impl MigrationId {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for MigrationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MigrationId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(format!("migration id must be digits, got {s:?}"));
        }
        s.parse::<u64>()
            .map(Self)
            .map_err(|e| format!("migration id {s:?} out of range: {e}"))
    }
}

/// Hex-encoded SHA-256 of an `up` script.
///
/// Surrounding whitespace is ignored so that trailing-newline churn from
/// editors does not register as a change.
pub fn checksum(up: &str) -> String {
    hex::encode(Sha256::digest(up.trim().as_bytes()))
}

/// A single migration loaded from disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Migration {
    pub id: MigrationId,
    pub name: String,
    pub up: String,
    pub down: Option<String>,
    pub checksum: String,
    pub path: PathBuf,
}

impl Migration {
    /// Parses a migration from its file name and contents.
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::Parse` if the name is malformed, the `up`
    /// section is missing or empty, or the markers are out of order.
    pub fn parse(path: &Path, contents: &str) -> Result<Self, MigrationError> {
        let parse_err = |reason: String| MigrationError::Parse {
            path: path.to_path_buf(),
            reason,
        };

        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| parse_err("file name is not valid UTF-8".to_string()))?;
        let (id, name) = stem
            .split_once('_')
            .ok_or_else(|| parse_err("file name must look like <id>_<name>.sql".to_string()))?;
        let id = MigrationId::from_str(id).map_err(parse_err)?;
        if name.is_empty() {
            return Err(parse_err("migration name is empty".to_string()));
        }

        let (up, down) = split_sections(contents).map_err(parse_err)?;

        Ok(Self {
            id,
            name: name.to_string(),
            checksum: checksum(&up),
            up,
            down,
            path: path.to_path_buf(),
        })
    }
}

#[derive(PartialEq)]
enum Section {
    Preamble,
    Up,
    Down,
}

fn marker(line: &str) -> Option<&'static str> {
    let body = line.trim().strip_prefix("--")?.trim();
    if body.eq_ignore_ascii_case(UP_MARKER) {
        Some(UP_MARKER)
    } else if body.eq_ignore_ascii_case(DOWN_MARKER) {
        Some(DOWN_MARKER)
    } else {
        None
    }
}

fn split_sections(contents: &str) -> Result<(String, Option<String>), String> {
    let mut section = Section::Preamble;
    let mut up = String::new();
    let mut down = String::new();

    for (idx, line) in contents.lines().enumerate() {
        match marker(line) {
            Some(UP_MARKER) => {
                if section != Section::Preamble {
                    return Err(format!("unexpected `-- {UP_MARKER}` on line {}", idx + 1));
                }
                section = Section::Up;
            }
            Some(_) => {
                if section != Section::Up {
                    return Err(format!(
                        "`-- {DOWN_MARKER}` on line {} must follow the up section",
                        idx + 1
                    ));
                }
                section = Section::Down;
            }
            None => match section {
                Section::Preamble => {
                    let trimmed = line.trim();
                    if !trimmed.is_empty() && !trimmed.starts_with("--") {
                        return Err(format!(
                            "statement on line {} appears before `-- {UP_MARKER}`",
                            idx + 1
                        ));
                    }
                }
                Section::Up => {
                    up.push_str(line);
                    up.push('\n');
                }
                Section::Down => {
                    down.push_str(line);
                    down.push('\n');
                }
            },
        }
    }

    if section == Section::Preamble {
        return Err(format!("missing `-- {UP_MARKER}` section"));
    }
    let up = up.trim().to_string();
    if up.is_empty() {
        return Err("up section is empty".to_string());
    }
    let down = down.trim();
    Ok((up, (!down.is_empty()).then(|| down.to_string())))
}

/// All migrations found in a directory, in ascending id order.
#[derive(Debug, Clone, Default)]
pub struct MigrationSet {
    migrations: Vec<Migration>,
}

impl MigrationSet {
    /// Reads and parses every `.sql` file in `dir`.
    ///
    /// Parsing happens entirely before any database interaction, so a
    /// malformed file aborts the caller's operation up front.
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::Io` if the directory or a file cannot be
    /// read, `MigrationError::Parse` for malformed files, and
    /// `MigrationError::DuplicateId` if two files share an id.
    pub fn load(dir: &Path) -> Result<Self, MigrationError> {
        let io_err = |path: &Path, source| MigrationError::Io {
            path: path.to_path_buf(),
            source,
        };

        let mut migrations = Vec::new();
        for entry in fs::read_dir(dir).map_err(|e| io_err(dir, e))? {
            let path = entry.map_err(|e| io_err(dir, e))?.path();
            if !path.is_file() || path.extension().and_then(|e| e.to_str()) != Some("sql") {
                tracing::trace!(path = %path.display(), "ignoring non-migration file");
                continue;
            }
            let contents = fs::read_to_string(&path).map_err(|e| io_err(&path, e))?;
            migrations.push(Migration::parse(&path, &contents)?);
        }

        Self::from_migrations(migrations)
    }

    /// Builds a set from already-parsed migrations, sorting by id.
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::DuplicateId` if two migrations share an id.
    pub fn from_migrations(mut migrations: Vec<Migration>) -> Result<Self, MigrationError> {
        migrations.sort_by_key(|m| m.id);
        for pair in migrations.windows(2) {
            if pair[0].id == pair[1].id {
                return Err(MigrationError::DuplicateId {
                    id: pair[0].id,
                    first: pair[0].path.clone(),
                    second: pair[1].path.clone(),
                });
            }
        }
        Ok(Self { migrations })
    }

    pub fn len(&self) -> usize {
        self.migrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Migration> {
        self.migrations.iter()
    }

    pub fn get(&self, id: MigrationId) -> Option<&Migration> {
        self.migrations
            .binary_search_by_key(&id, |m| m.id)
            .ok()
            .map(|idx| &self.migrations[idx])
    }

    /// Writes a new migration file named after `now` and `name`.
    ///
    /// Both sections hold a placeholder comment, so the file loads (and
    /// applies as a no-op) before it is filled in.
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::Parse` if `name` has no usable characters
    /// and `MigrationError::Io` if the file cannot be created (including when
    /// it already exists).
    pub fn scaffold(dir: &Path, name: &str, now: DateTime<Utc>) -> Result<PathBuf, MigrationError> {
        let slug = slugify(name);
        let path = dir.join(format!("{}_{}.sql", now.format("%Y%m%d%H%M%S"), slug));
        if slug.is_empty() {
            return Err(MigrationError::Parse {
                path,
                reason: format!("migration name {name:?} has no usable characters"),
            });
        }

        fs::create_dir_all(dir).map_err(|source| MigrationError::Io {
            path: dir.to_path_buf(),
            source,
        })?;

        let body = format!(
            "-- {name}\n-- created {}\n\n-- {UP_MARKER}\n-- forward statements go here\n\n-- {DOWN_MARKER}\n-- statements undoing the up section go here\n",
            now.to_rfc3339()
        );
        fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .and_then(|mut file| std::io::Write::write_all(&mut file, body.as_bytes()))
            .map_err(|source| MigrationError::Io {
                path: path.clone(),
                source,
            })?;

        tracing::info!(path = %path.display(), "created migration file");
        Ok(path)
    }
}

fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    for c in name.trim().chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.ends_with('_') && !slug.is_empty() {
            slug.push('_');
        }
    }
    slug.trim_end_matches('_').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn write(dir: &Path, name: &str, body: &str) {
        fs::write(dir.join(name), body).expect("should write migration file");
    }

    #[test]
    fn parses_up_and_down_sections() {
        let m = Migration::parse(
            Path::new("20240101120000_create_users.sql"),
            "-- users table\n-- migrate:up\nCREATE TABLE users (id TEXT);\n\n-- Migrate:Down\nDROP TABLE users;\n",
        )
        .expect("should parse");

        assert_eq!(m.id, MigrationId::new(20240101120000));
        assert_eq!(m.name, "create_users");
        assert_eq!(m.up, "CREATE TABLE users (id TEXT);");
        assert_eq!(m.down.as_deref(), Some("DROP TABLE users;"));
        assert_eq!(m.checksum.len(), 64);
        assert_eq!(m.checksum, checksum("CREATE TABLE users (id TEXT);\n"));
    }

    #[test]
    fn down_section_is_optional() {
        let m = Migration::parse(Path::new("1_seed.sql"), "-- migrate:up\nSELECT 1;")
            .expect("should parse");
        assert_eq!(m.down, None);
    }

    #[test]
    fn missing_up_section_is_a_parse_error() {
        let err = Migration::parse(Path::new("1_broken.sql"), "-- migrate:down\nDROP TABLE x;")
            .expect_err("down without up should fail");
        assert!(matches!(err, MigrationError::Parse { .. }));

        let err = Migration::parse(Path::new("2_empty.sql"), "-- migrate:up\n\n-- migrate:down\n")
            .expect_err("empty up should fail");
        assert!(matches!(err, MigrationError::Parse { reason, .. } if reason.contains("empty")));
    }

    #[test]
    fn statements_before_up_marker_are_rejected() {
        let err = Migration::parse(Path::new("1_x.sql"), "CREATE TABLE x (a);\n-- migrate:up\nSELECT 1;")
            .expect_err("stray statement should fail");
        assert!(matches!(err, MigrationError::Parse { .. }));
    }

    #[test]
    fn malformed_names_are_rejected() {
        for name in ["create_users.sql", "abc_users.sql", "123.sql", "123_.sql"] {
            let err = Migration::parse(Path::new(name), "-- migrate:up\nSELECT 1;")
                .expect_err("malformed name should fail");
            assert!(matches!(err, MigrationError::Parse { .. }), "{name}");
        }
    }

    #[test]
    fn load_sorts_and_ignores_other_extensions() {
        let dir = tempfile::tempdir().expect("tempdir");
        write(dir.path(), "3_c.sql", "-- migrate:up\nSELECT 3;");
        write(dir.path(), "1_a.sql", "-- migrate:up\nSELECT 1;");
        write(dir.path(), "2_b.sql", "-- migrate:up\nSELECT 2;");
        write(dir.path(), "README.md", "not a migration");
        write(dir.path(), "4_d.sql.bak", "-- migrate:up\nSELECT 4;");

        let set = MigrationSet::load(dir.path()).expect("should load");
        let ids: Vec<u64> = set.iter().map(|m| m.id.value()).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(set.get(MigrationId::new(2)).map(|m| m.name.as_str()), Some("b"));
        assert!(set.get(MigrationId::new(4)).is_none());
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        write(dir.path(), "1_a.sql", "-- migrate:up\nSELECT 1;");
        write(dir.path(), "01_b.sql", "-- migrate:up\nSELECT 1;");

        let err = MigrationSet::load(dir.path()).expect_err("duplicate ids should fail");
        assert!(matches!(err, MigrationError::DuplicateId { .. }));
    }

    #[test]
    fn scaffold_writes_a_parseable_template() {
        let dir = tempfile::tempdir().expect("tempdir");
        let now = Utc.with_ymd_and_hms(2024, 3, 9, 8, 7, 6).unwrap();
        let path = MigrationSet::scaffold(dir.path(), "Add user emails!", now).expect("scaffold");

        assert_eq!(
            path.file_name().and_then(|n| n.to_str()),
            Some("20240309080706_add_user_emails.sql")
        );
        let contents = fs::read_to_string(&path).expect("read back");
        assert!(contents.contains("-- migrate:up"));
        assert!(contents.contains("-- migrate:down"));

        let migration = Migration::parse(&path, &contents).expect("fresh template parses");
        assert_eq!(migration.name, "add_user_emails");
        assert!(migration.down.is_some());
        assert_eq!(MigrationSet::load(dir.path()).expect("directory loads").len(), 1);

        let again = MigrationSet::scaffold(dir.path(), "Add user emails!", now);
        assert!(matches!(again, Err(MigrationError::Io { .. })));
    }
}
