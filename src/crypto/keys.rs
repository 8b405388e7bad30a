//! Key material loading, generation and persistence
//!
//! The key and IV live in a `key=value` properties file:
//! ```text
//! key=<base58 of 32 bytes>
//! iv=<base58 of 16 bytes>
//! ```
//! Values use the Bitcoin base58 alphabet. Unknown lines and `#`/`!`
//! comments are preserved on rewrite.

use super::{CtrCipher, DigestRng, IV_SIZE, KEY_SIZE};
use crate::config::Config;
use crate::error::{Error, Result};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use zeroize::Zeroizing;

/// Properties key holding the AES key
pub const SETTING_KEY: &str = "key";

/// Properties key holding the IV
pub const SETTING_IV: &str = "iv";

/// Key and IV for one mount lifetime
pub struct KeyManager {
    /// AES-256 key (zeroized on drop)
    key: Zeroizing<[u8; KEY_SIZE]>,
    /// Initial counter block
    iv: [u8; IV_SIZE],
}

impl KeyManager {
    /// Build from known material, e.g. in tests
    pub fn from_parts(key: [u8; KEY_SIZE], iv: [u8; IV_SIZE]) -> Self {
        KeyManager {
            key: Zeroizing::new(key),
            iv,
        }
    }

    /// Load the persisted key and IV, generating and saving them if absent
    ///
    /// Malformed or wrong-length material is an `InitializationFailure`;
    /// it is never silently replaced.
    pub fn load_or_generate(config: &Config) -> Result<Self> {
        let mut file = KeyFile::open(&config.key_file)?;

        match (file.get(SETTING_KEY), file.get(SETTING_IV)) {
            (Some(key), Some(iv)) => {
                let manager = Self::decode(key, iv)?;
                info!(
                    path = %config.key_file.display(),
                    fingerprint = %manager.fingerprint(),
                    "Keys loaded"
                );
                Ok(manager)
            }
            (None, None) => {
                info!(path = %config.key_file.display(), "No keys found, generating");
                let manager = Self::generate();
                file.set(SETTING_KEY, &bs58::encode(manager.key()).into_string());
                file.set(SETTING_IV, &bs58::encode(manager.iv()).into_string());
                file.save()?;
                info!(fingerprint = %manager.fingerprint(), "Keys generated and saved");
                Ok(manager)
            }
            (Some(_), None) | (None, Some(_)) => Err(Error::InitializationFailure(format!(
                "{} holds only one of '{}' and '{}'",
                config.key_file.display(),
                SETTING_KEY,
                SETTING_IV
            ))),
        }
    }

    /// Load existing material only; a missing file is an error
    pub fn load(config: &Config) -> Result<Self> {
        let file = KeyFile::open(&config.key_file)?;
        match (file.get(SETTING_KEY), file.get(SETTING_IV)) {
            (Some(key), Some(iv)) => Self::decode(key, iv),
            _ => Err(Error::InitializationFailure(format!(
                "No key material in {}",
                config.key_file.display()
            ))),
        }
    }

    /// Fresh key and IV from the digest generator
    pub fn generate() -> Self {
        let mut rng = DigestRng::new();

        let mut key = Zeroizing::new([0u8; KEY_SIZE]);
        rng.add_randomness();
        rng.fill_bytes(&mut key[..]);

        let mut iv = [0u8; IV_SIZE];
        rng.add_randomness();
        rng.fill_bytes(&mut iv);

        KeyManager { key, iv }
    }

    fn decode(key: &str, iv: &str) -> Result<Self> {
        let key_bytes = Zeroizing::new(bs58::decode(key.trim()).into_vec().map_err(|e| {
            Error::InitializationFailure(format!("Key is not valid base58: {}", e))
        })?);
        let iv_bytes = bs58::decode(iv.trim()).into_vec().map_err(|e| {
            Error::InitializationFailure(format!("IV is not valid base58: {}", e))
        })?;

        if key_bytes.len() != KEY_SIZE {
            warn!(found = key_bytes.len(), "invalid key length");
            return Err(Error::InitializationFailure(format!(
                "Key length is invalid (expected: {} is: {})",
                KEY_SIZE,
                key_bytes.len()
            )));
        }
        if iv_bytes.len() != IV_SIZE {
            warn!(found = iv_bytes.len(), "invalid IV length");
            return Err(Error::InitializationFailure(format!(
                "IV length is invalid (expected: {} is: {})",
                IV_SIZE,
                iv_bytes.len()
            )));
        }

        let mut key = Zeroizing::new([0u8; KEY_SIZE]);
        key.copy_from_slice(&key_bytes);
        let mut iv = [0u8; IV_SIZE];
        iv.copy_from_slice(&iv_bytes);

        Ok(KeyManager { key, iv })
    }

    pub fn key(&self) -> &[u8; KEY_SIZE] {
        &self.key
    }

    pub fn iv(&self) -> &[u8; IV_SIZE] {
        &self.iv
    }

    /// New cipher context positioned at the start of the keystream
    pub fn new_cipher(&self) -> Result<CtrCipher> {
        CtrCipher::new(&self.key[..], &self.iv)
    }

    /// Short non-secret identifier of the key material
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(&self.key[..]);
        hasher.update(self.iv);
        hex::encode(&hasher.finalize()[..8])
    }
}

/// Line-oriented `key=value` properties file
pub struct KeyFile {
    path: PathBuf,
    lines: Vec<String>,
}

impl KeyFile {
    /// Read the file; a missing file yields an empty one
    pub fn open(path: &Path) -> Result<Self> {
        let lines = match std::fs::read_to_string(path) {
            Ok(content) => content.lines().map(str::to_string).collect(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                return Err(Error::InitializationFailure(format!(
                    "Failed to read {}: {}",
                    path.display(),
                    e
                )))
            }
        };

        Ok(KeyFile {
            path: path.to_path_buf(),
            lines,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Value of `name`, if present
    pub fn get(&self, name: &str) -> Option<&str> {
        self.lines
            .iter()
            .filter_map(|line| parse_line(line))
            .find(|(k, _)| *k == name)
            .map(|(_, v)| v)
    }

    /// Set `name`, replacing an existing entry or appending a new one
    pub fn set(&mut self, name: &str, value: &str) {
        let entry = format!("{}={}", name, value);
        match self
            .lines
            .iter()
            .position(|line| parse_line(line).map(|(k, _)| k == name).unwrap_or(false))
        {
            Some(idx) => self.lines[idx] = entry,
            None => self.lines.push(entry),
        }
    }

    /// Write the file back, owner read/write only on unix
    pub fn save(&self) -> Result<()> {
        let mut content = self.lines.join("\n");
        content.push('\n');

        write_private(&self.path, content.as_bytes()).map_err(|e| {
            Error::InitializationFailure(format!(
                "Failed to save settings file {}: {}",
                self.path.display(),
                e
            ))
        })
    }
}

/// Split a properties line into `(key, value)`, skipping blanks and comments
fn parse_line(line: &str) -> Option<(&str, &str)> {
    let line = line.trim_start();
    if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
        return None;
    }
    let (key, value) = line.split_once('=')?;
    Some((key.trim(), value.trim()))
}

#[cfg(unix)]
fn write_private(path: &Path, data: &[u8]) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

    let mut f = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    f.set_permissions(std::fs::Permissions::from_mode(0o600))?;
    f.write_all(data)?;
    f.sync_all()
}

#[cfg(not(unix))]
fn write_private(path: &Path, data: &[u8]) -> std::io::Result<()> {
    std::fs::write(path, data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn encode(bytes: impl AsRef<[u8]>) -> String {
        bs58::encode(bytes).into_string()
    }

    fn config_in(dir: &Path) -> Config {
        Config::new(dir.join("plain"), dir.join("keys.properties"))
    }

    #[test]
    fn test_generate_then_reload() {
        let dir = tempdir().unwrap();
        let config = config_in(dir.path());

        let generated = KeyManager::load_or_generate(&config).unwrap();
        let loaded = KeyManager::load_or_generate(&config).unwrap();

        assert_eq!(generated.key(), loaded.key());
        assert_eq!(generated.iv(), loaded.iv());
        assert_eq!(generated.fingerprint(), loaded.fingerprint());
    }

    #[test]
    fn test_generated_file_format() {
        let dir = tempdir().unwrap();
        let config = config_in(dir.path());
        let manager = KeyManager::load_or_generate(&config).unwrap();

        let content = std::fs::read_to_string(&config.key_file).unwrap();
        assert!(content.contains(&format!("key={}", bs58::encode(manager.key()).into_string())));
        assert!(content.contains(&format!("iv={}", bs58::encode(manager.iv()).into_string())));
    }

    #[cfg(unix)]
    #[test]
    fn test_key_file_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let config = config_in(dir.path());
        KeyManager::load_or_generate(&config).unwrap();

        let mode = std::fs::metadata(&config.key_file).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_wrong_length_is_fatal() {
        let dir = tempdir().unwrap();
        let config = config_in(dir.path());
        std::fs::write(
            &config.key_file,
            format!(
                "key={}\niv={}\n",
                encode([1u8; 16]),
                encode([2u8; 16])
            ),
        )
        .unwrap();

        assert!(matches!(
            KeyManager::load_or_generate(&config),
            Err(Error::InitializationFailure(_))
        ));

        std::fs::write(
            &config.key_file,
            format!(
                "key={}\niv={}\n",
                encode([1u8; 32]),
                encode([2u8; 8])
            ),
        )
        .unwrap();

        assert!(matches!(
            KeyManager::load_or_generate(&config),
            Err(Error::InitializationFailure(_))
        ));
    }

    #[test]
    fn test_bad_encoding_is_fatal() {
        let dir = tempdir().unwrap();
        let config = config_in(dir.path());
        std::fs::write(&config.key_file, "key=0OIl+/not-base58\niv=1111\n").unwrap();

        assert!(matches!(
            KeyManager::load_or_generate(&config),
            Err(Error::InitializationFailure(_))
        ));
    }

    #[test]
    fn test_half_present_is_fatal() {
        let dir = tempdir().unwrap();
        let config = config_in(dir.path());
        std::fs::write(&config.key_file, format!("key={}\n", encode([1u8; 32])))
            .unwrap();

        assert!(matches!(
            KeyManager::load_or_generate(&config),
            Err(Error::InitializationFailure(_))
        ));
        // The half-written file is left alone
        assert!(!std::fs::read_to_string(&config.key_file)
            .unwrap()
            .contains("iv="));
    }

    #[test]
    fn test_load_requires_existing_material() {
        let dir = tempdir().unwrap();
        let config = config_in(dir.path());

        assert!(matches!(
            KeyManager::load(&config),
            Err(Error::InitializationFailure(_))
        ));
        assert!(!config.key_file.exists());
    }

    #[test]
    fn test_other_lines_preserved() {
        let dir = tempdir().unwrap();
        let config = config_in(dir.path());
        std::fs::write(&config.key_file, "# rcryptfs settings\nowner=alice\n").unwrap();

        KeyManager::load_or_generate(&config).unwrap();

        let file = KeyFile::open(&config.key_file).unwrap();
        assert_eq!(file.get("owner"), Some("alice"));
        assert!(file.get(SETTING_KEY).is_some());
        assert!(file.get(SETTING_IV).is_some());
        assert!(std::fs::read_to_string(&config.key_file)
            .unwrap()
            .starts_with("# rcryptfs settings"));
    }

    #[test]
    fn test_loads_existing_base58_file() {
        let dir = tempdir().unwrap();
        let config = config_in(dir.path());
        // As written by a properties store: timestamp comment, then entries
        std::fs::write(
            &config.key_file,
            format!(
                "#Sat Jan 05 12:00:00 CET 2013\nkey={}\niv={}\n",
                "1".repeat(KEY_SIZE),
                "1".repeat(IV_SIZE)
            ),
        )
        .unwrap();

        let manager = KeyManager::load_or_generate(&config).unwrap();
        assert_eq!(manager.key(), &[0u8; KEY_SIZE]);
        assert_eq!(manager.iv(), &[0u8; IV_SIZE]);
    }

    #[test]
    fn test_base58_alphabet() {
        assert_eq!(encode(b"Hello World!"), "2NEpo7TZRRrLZSi2U");
        assert_eq!(encode([0x51u8, 0x6b, 0x6f, 0xcd, 0x0f]), "ABnLTmg");
        assert_eq!(encode([0x57u8, 0x2e, 0x47, 0x94]), "3EFU7m");
        // Leading zero bytes map to leading '1's
        assert_eq!(encode([0u8; 10]), "1111111111");
    }

    #[test]
    fn test_parse_line() {
        assert_eq!(parse_line("key=abc=="), Some(("key", "abc==")));
        assert_eq!(parse_line("  iv = xyz "), Some(("iv", "xyz")));
        assert_eq!(parse_line("# key=abc"), None);
        assert_eq!(parse_line("! comment"), None);
        assert_eq!(parse_line(""), None);
        assert_eq!(parse_line("novalue"), None);
    }

    #[test]
    fn test_from_parts_cipher() {
        let manager = KeyManager::from_parts([7u8; KEY_SIZE], [9u8; IV_SIZE]);
        let cipher = manager.new_cipher().unwrap();
        assert_eq!(cipher.counter(), &[9u8; IV_SIZE]);
    }
}
