//! `known_hosts` trust store
//!
//! Instead of pinning each container's host key, the client trusts the CA
//! for every host matching a pattern:
//!
//! ```text
//! @cert-authority dev-*,[10.0.0.5]:* ssh-ed25519 AAAA... devbox-ca@laptop
//! ```
//!
//! Writes are idempotent and serialized across processes; see [`crate::files`].

use std::path::{Path, PathBuf};

use ssh_key::PublicKey;
use tracing::{debug, info};

use super::address::RemoteHost;
use super::sanitize::validate_alias_pattern;
use crate::error::{DevboxError, Result};
use crate::files::{self, FileLock, PRIVATE_FILE_MODE};

/// known_hosts marker for CA trust lines
pub const CERT_AUTHORITY_MARKER: &str = "@cert-authority";

/// Default wildcard covering all container aliases
pub const DEFAULT_ALIAS_PATTERN: &str = "dev-*";

/// One `@cert-authority` line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustEntry {
    patterns: Vec<String>,
    ca_public_key: String,
}

impl TrustEntry {
    /// Entry trusting `ca_public_key` for `alias_pattern` and `remote`
    pub fn new(alias_pattern: &str, remote: &RemoteHost, ca_public_key: &str) -> Result<Self> {
        let alias_pattern = validate_alias_pattern(alias_pattern)?;
        let ca_public_key = normalize_public_key(ca_public_key)?;

        Ok(Self {
            patterns: vec![alias_pattern.to_string(), remote.known_hosts_pattern()],
            ca_public_key,
        })
    }

    /// Parse a known_hosts line; `None` unless it is a `@cert-authority` line
    pub fn parse(line: &str) -> Option<Self> {
        let mut fields = line.split_whitespace();
        if fields.next()? != CERT_AUTHORITY_MARKER {
            return None;
        }
        let patterns = fields.next()?.split(',').map(str::to_string).collect();
        let key: Vec<&str> = fields.collect();
        if key.len() < 2 {
            return None;
        }
        Some(Self {
            patterns,
            ca_public_key: key.join(" "),
        })
    }

    /// Host patterns this entry applies to
    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    /// CA public key line (`ssh-ed25519 <base64> <comment>`)
    pub fn ca_public_key(&self) -> &str {
        &self.ca_public_key
    }

    /// The exact known_hosts line, without newline
    pub fn render(&self) -> String {
        format!(
            "{} {} {}",
            CERT_AUTHORITY_MARKER,
            self.patterns.join(","),
            self.ca_public_key
        )
    }
}

/// Validate a CA public key line and return it as a single trimmed line
fn normalize_public_key(line: &str) -> Result<String> {
    let line = line.trim();
    if line.contains('\n') {
        return Err(DevboxError::trust_store("CA public key spans multiple lines"));
    }
    PublicKey::from_openssh(line)
        .map_err(|e| DevboxError::trust_store(format!("invalid CA public key: {}", e)))?;
    Ok(line.to_string())
}

/// The client-side known_hosts file holding CA trust lines
#[derive(Debug, Clone)]
pub struct TrustStore {
    path: PathBuf,
    alias_pattern: String,
}

impl TrustStore {
    /// Trust store at `path` using [`DEFAULT_ALIAS_PATTERN`]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            alias_pattern: DEFAULT_ALIAS_PATTERN.to_string(),
        }
    }

    /// Set the container-alias wildcard written into each entry
    pub fn with_alias_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.alias_pattern = pattern.into();
        self
    }

    /// Path of the known_hosts file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The entry [`write_entry`](Self::write_entry) would write
    pub fn entry_for(&self, ca_public_key: &str, remote: &RemoteHost) -> Result<TrustEntry> {
        TrustEntry::new(&self.alias_pattern, remote, ca_public_key)
    }

    /// Record that the CA is authoritative for containers on `remote`
    ///
    /// Appends the line only if an identical one is not already present.
    /// Returns whether the file changed.
    pub fn write_entry(&self, ca_public_key: &str, remote: &RemoteHost) -> Result<bool> {
        let line = self.entry_for(ca_public_key, remote)?.render();

        let target = files::resolve_target(&self.path)?;
        if let Some(parent) = target.parent() {
            files::create_private_dir(parent)?;
        }

        let _lock = FileLock::acquire(&target)?;
        let mut contents = read_text(&target)?;

        if contains_line(&contents, &line) {
            debug!("Trust entry for {} already present", remote);
            return Ok(false);
        }

        if !contents.is_empty() && !contents.ends_with('\n') {
            contents.push('\n');
        }
        contents.push_str(&line);
        contents.push('\n');

        files::write_atomic(&target, contents.as_bytes(), None)
            .map_err(|e| DevboxError::trust_store(format!("{}: {}", target.display(), e)))?;
        ensure_not_world_writable(&target)?;

        info!(
            "Trusted CA for {} in {}",
            remote.known_hosts_pattern(),
            target.display()
        );
        Ok(true)
    }

    /// Whether the exact entry for `remote` is present
    pub fn has_entry(&self, ca_public_key: &str, remote: &RemoteHost) -> Result<bool> {
        let line = self.entry_for(ca_public_key, remote)?.render();
        let contents = read_text(&files::resolve_target(&self.path)?)?;
        Ok(contains_line(&contents, &line))
    }

    /// All `@cert-authority` entries in the file
    pub fn entries(&self) -> Result<Vec<TrustEntry>> {
        let contents = read_text(&files::resolve_target(&self.path)?)?;
        Ok(contents.lines().filter_map(TrustEntry::parse).collect())
    }
}

/// Append a CA trust line for `remote_host_address` to the known_hosts file
/// at `path`, using the default alias pattern
pub fn write_entry(path: &Path, remote_host_address: &str, ca_public_key: &str) -> Result<bool> {
    let remote: RemoteHost = remote_host_address.parse()?;
    TrustStore::new(path).write_entry(ca_public_key, &remote)
}

fn contains_line(contents: &str, line: &str) -> bool {
    contents.lines().any(|existing| existing.trim_end() == line)
}

fn read_text(path: &Path) -> Result<String> {
    match files::read_optional(path)? {
        None => Ok(String::new()),
        Some(bytes) => String::from_utf8(bytes).map_err(|_| {
            DevboxError::trust_store(format!("{} is not valid UTF-8", path.display()))
        }),
    }
}

/// Existing trust stores keep their mode unless group or others could
/// rewrite them
#[cfg(unix)]
fn ensure_not_world_writable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mode = std::fs::metadata(path)?.permissions().mode() & 0o777;
    if mode & 0o022 != 0 {
        files::set_mode(path, PRIVATE_FILE_MODE)?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn ensure_not_world_writable(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    const CA_KEY: &str =
        "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIOMqqnkVzrm0SdG6UOoqKLsabgH5C9okWi0dh2l9GKJl devbox-ca@laptop";

    fn store_in(dir: &TempDir) -> TrustStore {
        TrustStore::new(dir.path().join("known_hosts"))
    }

    fn remote(addr: &str) -> RemoteHost {
        addr.parse().unwrap()
    }

    fn count(path: &Path, needle: &str) -> usize {
        fs::read_to_string(path)
            .unwrap()
            .lines()
            .filter(|l| *l == needle)
            .count()
    }

    #[test]
    fn test_entry_render_with_custom_port() {
        let entry = TrustEntry::new("dev-*", &remote("10.0.0.5:2201"), CA_KEY).unwrap();
        assert_eq!(
            entry.render(),
            format!("@cert-authority dev-*,[10.0.0.5]:* {}", CA_KEY)
        );
    }

    #[test]
    fn test_entry_render_default_port() {
        let entry = TrustEntry::new("dev-*", &remote("build.example.com"), CA_KEY).unwrap();
        assert_eq!(
            entry.render(),
            format!("@cert-authority dev-*,build.example.com {}", CA_KEY)
        );
    }

    #[test]
    fn test_entry_parse() {
        let line = format!("@cert-authority dev-*,[10.0.0.5]:* {}", CA_KEY);
        let entry = TrustEntry::parse(&line).unwrap();
        assert_eq!(entry.patterns(), ["dev-*", "[10.0.0.5]:*"]);
        assert_eq!(entry.ca_public_key(), CA_KEY);
        assert_eq!(entry.render(), line);

        assert!(TrustEntry::parse("10.0.0.5 ssh-ed25519 AAAA").is_none());
    }

    #[test]
    fn test_entry_rejects_invalid_key() {
        assert!(TrustEntry::new("dev-*", &remote("10.0.0.5"), "not a key").is_err());
    }

    #[test]
    fn test_write_entry_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        let line = format!("@cert-authority dev-*,[10.0.0.5]:* {}", CA_KEY);

        assert!(store.write_entry(CA_KEY, &remote("10.0.0.5:2201")).unwrap());
        assert!(!store.write_entry(CA_KEY, &remote("10.0.0.5:2201")).unwrap());
        assert_eq!(count(store.path(), &line), 1);

        assert!(store.write_entry(CA_KEY, &remote("10.0.0.6:2201")).unwrap());
        let other = format!("@cert-authority dev-*,[10.0.0.6]:* {}", CA_KEY);
        assert_eq!(count(store.path(), &line), 1);
        assert_eq!(count(store.path(), &other), 1);
    }

    #[test]
    fn test_other_container_port_on_same_host_reuses_entry() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);

        store.write_entry(CA_KEY, &remote("10.0.0.5:2201")).unwrap();
        assert!(!store.write_entry(CA_KEY, &remote("10.0.0.5:2202")).unwrap());
        assert_eq!(store.entries().unwrap().len(), 1);
    }

    #[test]
    fn test_write_entry_preserves_existing_lines() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        let existing = "github.com ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIOMqqnkVzrm0SdG6UOoqKLsabgH5C9okWi0dh2l9GKJl";
        fs::write(store.path(), existing).unwrap();

        store.write_entry(CA_KEY, &remote("10.0.0.5:2201")).unwrap();

        let contents = fs::read_to_string(store.path()).unwrap();
        assert!(contents.starts_with(&format!("{}\n", existing)));
        assert!(contents.ends_with('\n'));
        assert_eq!(contents.lines().count(), 2);
    }

    #[test]
    fn test_has_entry() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        assert!(!store.has_entry(CA_KEY, &remote("10.0.0.5:2201")).unwrap());

        store.write_entry(CA_KEY, &remote("10.0.0.5:2201")).unwrap();
        assert!(store.has_entry(CA_KEY, &remote("10.0.0.5:2201")).unwrap());
    }

    #[test]
    fn test_custom_alias_pattern() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir).with_alias_pattern("box-*");
        store.write_entry(CA_KEY, &remote("10.0.0.5")).unwrap();

        let entries = store.entries().unwrap();
        assert_eq!(entries[0].patterns(), ["box-*", "10.0.0.5"]);
    }

    #[test]
    fn test_concurrent_writers_produce_one_line() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("known_hosts");

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let path = path.clone();
                std::thread::spawn(move || write_entry(&path, "10.0.0.5:2201", CA_KEY).unwrap())
            })
            .collect();
        let appended = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|changed| *changed)
            .count();

        assert_eq!(appended, 1);
        let line = format!("@cert-authority dev-*,[10.0.0.5]:* {}", CA_KEY);
        assert_eq!(count(&path, &line), 1);
    }

    #[cfg(unix)]
    #[test]
    fn test_new_trust_store_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        store.write_entry(CA_KEY, &remote("10.0.0.5")).unwrap();

        let mode = fs::metadata(store.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
