//! Known hosts trust store for gateway host keys
//!
//! OpenSSH-style `known_hosts` file: one `host keytype base64key` entry per
//! line. The file is append-only, existing lines are never rewritten.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use parking_lot::RwLock;
use russh::keys::{PublicKey, PublicKeyBase64};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::error::SshError;

/// Result of host key verification
#[derive(Debug, Clone, PartialEq)]
pub enum HostKeyVerification {
    /// Key matches a trusted entry
    Verified,
    /// Host not in the store (first connection)
    Unknown { fingerprint: String },
    /// Key differs from the trusted entry (potential MITM)
    Changed {
        expected_fingerprint: String,
        actual_fingerprint: String,
    },
}

/// Entry in known_hosts: (key_type, base64_key)
#[derive(Clone, Debug)]
struct HostKeyEntry {
    key_type: String,
    key_data: String,
}

/// Append-only trust store
pub struct KnownHostsStore {
    /// Cache of host -> list of keys (supports multiple key types per host)
    hosts: RwLock<HashMap<String, Vec<HostKeyEntry>>>,
    /// Path to known_hosts file
    path: PathBuf,
}

impl KnownHostsStore {
    /// Default store location (~/.ssh/known_hosts)
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .map(|h| h.join(".ssh").join("known_hosts"))
            .unwrap_or_else(|| PathBuf::from("known_hosts"))
    }

    /// Open the store at `path`, loading existing entries
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let store = Self {
            hosts: RwLock::new(HashMap::new()),
            path: path.into(),
        };

        if let Err(e) = store.load() {
            warn!("Failed to load known_hosts {:?}: {}", store.path, e);
        }

        store
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<(), SshError> {
        if !self.path.exists() {
            debug!("Known hosts file {:?} does not exist yet", self.path);
            return Ok(());
        }

        let file = fs::File::open(&self.path)?;
        let reader = BufReader::new(file);
        let mut hosts = self.hosts.write();
        let mut entry_count = 0;

        for line in reader.lines() {
            let line = line?;
            let line = line.trim();

            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            // hostname[,alias] keytype base64key [comment]
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 3 {
                continue;
            }

            let entry = HostKeyEntry {
                key_type: parts[1].to_string(),
                key_data: parts[2].to_string(),
            };

            for hostname in parts[0].split(',') {
                // Hashed hostnames are not supported
                if hostname.starts_with('|') {
                    continue;
                }
                hosts
                    .entry(hostname.to_lowercase())
                    .or_default()
                    .push(entry.clone());
                entry_count += 1;
            }
        }

        info!(
            "Loaded {} known host entries ({} unique hosts)",
            entry_count,
            hosts.len()
        );
        Ok(())
    }

    /// Create lookup key for host:port
    fn make_key(host: &str, port: u16) -> String {
        let host = host.to_lowercase();
        if port == 22 {
            host
        } else {
            format!("[{}]:{}", host, port)
        }
    }

    /// Compute SHA256 fingerprint of public key
    pub fn fingerprint(key: &PublicKey) -> String {
        fingerprint_bytes(&key.public_key_bytes())
    }

    /// Get key type name for known_hosts format
    pub fn key_type_name(key: &PublicKey) -> String {
        key.algorithm().as_str().to_string()
    }

    /// Entries for host:port, falling back to the bare host name
    fn entries_for(&self, host: &str, port: u16) -> Option<Vec<HostKeyEntry>> {
        let hosts = self.hosts.read();
        hosts
            .get(&Self::make_key(host, port))
            .or_else(|| hosts.get(&host.to_lowercase()))
            .cloned()
    }

    /// Every trusted key for host:port, in file order.
    ///
    /// A host may carry one key per algorithm (rsa, ecdsa, ed25519), and the
    /// gateway is free to present any of them.
    pub fn trusted_keys(&self, host: &str, port: u16) -> Vec<PublicKey> {
        let Some(entries) = self.entries_for(host, port) else {
            return Vec::new();
        };

        entries
            .into_iter()
            .filter_map(|entry| {
                match russh::keys::parse_public_key_base64(&entry.key_data) {
                    Ok(key) => Some(key),
                    Err(e) => {
                        warn!(
                            "Ignoring unparsable {} key for {}: {}",
                            entry.key_type, host, e
                        );
                        None
                    }
                }
            })
            .collect()
    }

    /// Verify a host's public key
    pub fn verify(&self, host: &str, port: u16, key: &PublicKey) -> HostKeyVerification {
        let actual_key_b64 = BASE64.encode(key.public_key_bytes());
        let actual_key_type = Self::key_type_name(key);
        let fingerprint = Self::fingerprint(key);

        let Some(entries) = self.entries_for(host, port) else {
            debug!("Unknown host: {}", Self::make_key(host, port));
            return HostKeyVerification::Unknown { fingerprint };
        };

        for entry in entries.iter().filter(|e| e.key_type == actual_key_type) {
            if entry.key_data == actual_key_b64 {
                return HostKeyVerification::Verified;
            }
            let expected_fingerprint = BASE64
                .decode(&entry.key_data)
                .map(|bytes| fingerprint_bytes(&bytes))
                .unwrap_or_else(|_| "unknown".to_string());
            warn!(
                "HOST KEY CHANGED for {}:{} (type: {})! Expected {}, got {}",
                host, port, actual_key_type, expected_fingerprint, fingerprint
            );
            return HostKeyVerification::Changed {
                expected_fingerprint,
                actual_fingerprint: fingerprint,
            };
        }

        debug!(
            "Host {}:{} known but no {} key stored",
            host, port, actual_key_type
        );
        HostKeyVerification::Unknown { fingerprint }
    }

    /// Append a host key; an identical entry already present is not duplicated
    pub fn add_host(&self, host: &str, port: u16, key: &PublicKey) -> Result<(), SshError> {
        if self.verify(host, port, key) == HostKeyVerification::Verified {
            debug!("Host key for {}:{} already trusted", host, port);
            return Ok(());
        }

        let lookup_key = Self::make_key(host, port);
        let key_b64 = BASE64.encode(key.public_key_bytes());
        let key_type = Self::key_type_name(key);

        self.append_to_file(&lookup_key, &key_type, &key_b64)?;

        self.hosts
            .write()
            .entry(lookup_key.clone())
            .or_default()
            .push(HostKeyEntry {
                key_type: key_type.clone(),
                key_data: key_b64,
            });

        info!(
            "Added host key for {} (type: {}) to {:?}",
            lookup_key, key_type, self.path
        );
        Ok(())
    }

    fn append_to_file(&self, host: &str, key_type: &str, key_b64: &str) -> Result<(), SshError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let needs_newline = fs::read(&self.path)
            .map(|bytes| !bytes.is_empty() && !bytes.ends_with(b"\n"))
            .unwrap_or(false);

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;

        if needs_newline {
            writeln!(file)?;
        }
        writeln!(file, "{} {} {}", host, key_type, key_b64)?;

        Ok(())
    }
}

fn fingerprint_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let hash = hasher.finalize();
    format!("SHA256:{}", BASE64.encode(hash).trim_end_matches('='))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tempfile::tempdir;

    pub(crate) const TEST_PUBLIC_KEY_B64: &str =
        "AAAAC3NzaC1lZDI1NTE5AAAAIEsfvm+qagM6OZcMlOnoqG2/9PWRihV/wNb3emHi7UsM";

    pub(crate) fn test_public_key() -> PublicKey {
        russh::keys::parse_public_key_base64(TEST_PUBLIC_KEY_B64).unwrap()
    }

    /// A second ed25519 key, never presented by the test gateway
    pub(crate) const OTHER_ED25519_KEY_B64: &str =
        "AAAAC3NzaC1lZDI1NTE5AAAAIOMqqnkVzrm0SdG6UOoqKLsabgH5C9okWi0dh2l9GKJl";

    pub(crate) const TEST_RSA_KEY_B64: &str = "AAAAB3NzaC1yc2EAAAADAQABAAABAQDEHzJM9UxcRKbLMspBrBzmAbSTA1/bfGD9E6ti4mK78ff9tmn5zcIYyzOwTloK8+GS+3sQ+tSrcT14o6kzkAsMkBZEmr8DYVkE9dHaI77OAtdouAilXmKihjyCj1CSJXZW9YdPTA6LwqjE17S895pEBMiJD6WwzTBs95/p3YqTtCAFUujEBu6BT0zGn9TR6o11N4jI4bZ9+Gi/FBIAYexnkLKYswxGWm9GqU5XOd3a0RmRocDA3ZDEXqHNpwW7LiohgJtbYqb447iw2DzoLtreCXA7SbRop/vhLr/1BIOgHB6REUvWjlgaFgT42wGzGzCUlstyHvE4psjEGQwqC5Od";

    /// `bastion` with an rsa key listed ahead of the ed25519 key
    pub(crate) fn multi_key_known_hosts() -> String {
        format!(
            "bastion ssh-rsa {}\nbastion ssh-ed25519 {}\n",
            TEST_RSA_KEY_B64, TEST_PUBLIC_KEY_B64
        )
    }

    #[test]
    fn test_make_key() {
        assert_eq!(KnownHostsStore::make_key("Gateway.com", 22), "gateway.com");
        assert_eq!(
            KnownHostsStore::make_key("server.com", 2222),
            "[server.com]:2222"
        );
    }

    #[test]
    fn test_unknown_then_added() {
        let dir = tempdir().unwrap();
        let store = KnownHostsStore::open(dir.path().join("known_hosts"));
        let key = test_public_key();

        assert!(matches!(
            store.verify("bastion", 22, &key),
            HostKeyVerification::Unknown { .. }
        ));
        store.add_host("bastion", 22, &key).unwrap();
        assert_eq!(store.verify("bastion", 22, &key), HostKeyVerification::Verified);

        // Reload from disk
        let reopened = KnownHostsStore::open(dir.path().join("known_hosts"));
        assert_eq!(
            reopened.verify("bastion", 22, &key),
            HostKeyVerification::Verified
        );
        assert_eq!(reopened.trusted_keys("BASTION", 22), vec![key]);
    }

    #[test]
    fn test_trusted_keys_returns_every_algorithm() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("known_hosts");
        fs::write(&path, multi_key_known_hosts()).unwrap();

        let store = KnownHostsStore::open(&path);
        let keys = store.trusted_keys("bastion", 22);
        assert_eq!(keys.len(), 2);
        assert_eq!(KnownHostsStore::key_type_name(&keys[0]), "ssh-rsa");
        assert_eq!(keys[1], test_public_key());

        // Non-default port falls back to the bare host entries
        assert_eq!(store.trusted_keys("bastion", 2222).len(), 2);
        assert!(store.trusted_keys("elsewhere", 22).is_empty());
    }

    #[test]
    fn test_append_preserves_existing_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("known_hosts");
        let existing = "# managed by hand\nother.example ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIOMqqnkVzrm0SdG6UOoqKLsabgH5C9okWi0dh2l9GKJl";
        fs::write(&path, existing).unwrap();

        let store = KnownHostsStore::open(&path);
        store.add_host("bastion", 2222, &test_public_key()).unwrap();
        store.add_host("bastion", 2222, &test_public_key()).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert!(content.starts_with(existing));
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[2].starts_with("[bastion]:2222 ssh-ed25519 "));
    }

    #[test]
    fn test_changed_key_detected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("known_hosts");
        fs::write(
            &path,
            "bastion ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIOMqqnkVzrm0SdG6UOoqKLsabgH5C9okWi0dh2l9GKJl\n",
        )
        .unwrap();

        let store = KnownHostsStore::open(&path);
        assert!(matches!(
            store.verify("bastion", 22, &test_public_key()),
            HostKeyVerification::Changed { .. }
        ));
    }

    #[test]
    fn test_fingerprint_format() {
        let fp = KnownHostsStore::fingerprint(&test_public_key());
        assert!(fp.starts_with("SHA256:"));
        assert!(!fp.ends_with('='));
    }
}
