use std::{
    collections::HashMap,
    fmt,
    fs::{self, File, OpenOptions},
    io::{self, Read, Write},
    path::{Path, PathBuf},
    sync::Arc,
};

use arc_swap::ArcSwap;
use base64::{Engine, engine::general_purpose::STANDARD};
use jsonwebtoken::{DecodingKey, EncodingKey};
use rsa::{
    RsaPrivateKey, RsaPublicKey,
    pkcs1::{DecodeRsaPrivateKey, EncodeRsaPrivateKey},
    pkcs8::{DecodePrivateKey, EncodePublicKey, LineEnding},
};
use thiserror::Error;

/// Size of freshly generated RSA moduli.
pub const KEY_BITS: usize = 2048;

/// Upper bound on a single PEM read. Keeps a symlink to /dev/random or a
/// stray multi-gigabyte file from stalling startup.
const MAX_PEM_BYTES: u64 = 1024 * 1024;

const PRIVATE_SUFFIX: &str = ".pem";
const PUBLIC_SUFFIX: &str = ".pub.pem";

/// KeyStoreError
///
/// Failures raised while loading, generating or resolving key material.
#[derive(Debug, Error)]
pub enum KeyStoreError {
    #[error("key not found: {kid}")]
    NotFound { kid: String },

    #[error("key {kid} has no private half on this node")]
    NoPrivateKey { kid: String },

    #[error("invalid key id {kid:?}: only ASCII alphanumerics, '-' and '_' are allowed")]
    InvalidKeyId { kid: String },

    #[error("key file already exists: {}", path.display())]
    AlreadyExists { path: PathBuf },

    #[error("invalid key material for {kid}: {reason}")]
    InvalidKey { kid: String, reason: String },

    #[error("generating key {kid}: {source}")]
    Generate {
        kid: String,
        #[source]
        source: rsa::Error,
    },

    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl KeyStoreError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    fn invalid(kid: &str, reason: impl fmt::Display) -> Self {
        Self::InvalidKey {
            kid: kid.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// KeyPair
///
/// One signing identity, addressed by `kid`. The public half is always
/// present. The private half exists only on nodes that mint tokens; it never
/// leaves this crate except as an opaque `EncodingKey` handed to the issuer.
#[derive(Clone)]
pub struct KeyPair {
    kid: String,
    public_pem: String,
    decoding: DecodingKey,
    encoding: Option<EncodingKey>,
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("kid", &self.kid)
            .field("has_private", &self.encoding.is_some())
            .finish()
    }
}

impl KeyPair {
    /// Builds a full pair from a private key PEM, deriving the public half
    /// from it. Accepts PKCS#1 (`RSA PRIVATE KEY`), PKCS#8 (`PRIVATE KEY`) and
    /// PKCS#1 DER under a `PRIVATE KEY` label, which older tooling wrote.
    pub fn from_private_pem(kid: &str, pem: &str) -> Result<Self, KeyStoreError> {
        validate_kid(kid)?;

        let private = parse_private_pem(pem).map_err(|e| KeyStoreError::invalid(kid, e))?;
        let public_pem = RsaPublicKey::from(&private)
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| KeyStoreError::invalid(kid, e))?;

        let private_der = private
            .to_pkcs1_der()
            .map_err(|e| KeyStoreError::invalid(kid, e))?;
        let encoding = EncodingKey::from_rsa_der(private_der.as_bytes());
        let decoding = DecodingKey::from_rsa_pem(public_pem.as_bytes())
            .map_err(|e| KeyStoreError::invalid(kid, e))?;

        Ok(Self {
            kid: kid.to_string(),
            public_pem,
            decoding,
            encoding: Some(encoding),
        })
    }

    /// Builds a verification-only entry from a public key PEM.
    pub fn from_public_pem(kid: &str, pem: &str) -> Result<Self, KeyStoreError> {
        validate_kid(kid)?;

        let decoding =
            DecodingKey::from_rsa_pem(pem.as_bytes()).map_err(|e| KeyStoreError::invalid(kid, e))?;

        Ok(Self {
            kid: kid.to_string(),
            public_pem: pem.to_string(),
            decoding,
            encoding: None,
        })
    }

    pub fn kid(&self) -> &str {
        &self.kid
    }

    /// The SPKI PEM of the public half, suitable for distribution to verifiers.
    pub fn public_key_pem(&self) -> &str {
        &self.public_pem
    }

    pub fn has_private_key(&self) -> bool {
        self.encoding.is_some()
    }

    pub(crate) fn decoding_key(&self) -> &DecodingKey {
        &self.decoding
    }

    pub(crate) fn encoding_key(&self) -> Option<&EncodingKey> {
        self.encoding.as_ref()
    }

    /// Strips the private half, leaving what a verifier is allowed to hold.
    pub fn public_only(&self) -> Self {
        Self {
            kid: self.kid.clone(),
            public_pem: self.public_pem.clone(),
            decoding: self.decoding.clone(),
            encoding: None,
        }
    }
}

/// KeySet
///
/// An immutable index of key pairs by `kid`. The store publishes whole sets;
/// a set is never edited once readers can see it.
#[derive(Clone, Debug, Default)]
pub struct KeySet {
    pairs: HashMap<String, Arc<KeyPair>>,
}

impl KeySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, pair: KeyPair) -> Self {
        self.pairs.insert(pair.kid.clone(), Arc::new(pair));
        self
    }

    pub fn get(&self, kid: &str) -> Option<&Arc<KeyPair>> {
        self.pairs.get(kid)
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Sorted key ids, for logs and diagnostics.
    pub fn kids(&self) -> Vec<String> {
        let mut kids: Vec<String> = self.pairs.keys().cloned().collect();
        kids.sort();
        kids
    }
}

impl FromIterator<KeyPair> for KeySet {
    fn from_iter<I: IntoIterator<Item = KeyPair>>(iter: I) -> Self {
        iter.into_iter().fold(KeySet::new(), KeySet::with)
    }
}

/// KeyStore
///
/// Resolves key material by `kid` for signing and verification.
///
/// Reads go through a lock-free snapshot load, so any number of concurrent
/// verifiers can resolve keys while an administrator publishes a new set.
/// Writers (`insert`, `replace`) build the next set off to the side and swap
/// it in atomically. A verifier sees either the old set or the new one, never
/// a mix.
pub struct KeyStore {
    keys: ArcSwap<KeySet>,
}

impl Default for KeyStore {
    fn default() -> Self {
        Self::new(KeySet::new())
    }
}

impl fmt::Debug for KeyStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyStore")
            .field("kids", &self.snapshot().kids())
            .finish()
    }
}

impl KeyStore {
    pub fn new(keys: KeySet) -> Self {
        Self {
            keys: ArcSwap::from_pointee(keys),
        }
    }

    /// load_dir
    ///
    /// Reads every `<kid>.pem` (full pair) and `<kid>.pub.pem`
    /// (verification-only) file in `dir`. A private file wins over a public
    /// one with the same kid, since the public half is derived from it anyway.
    /// Any file that fails to parse fails the whole load.
    pub fn load_dir(dir: impl AsRef<Path>) -> Result<Self, KeyStoreError> {
        let dir = dir.as_ref();
        let entries = fs::read_dir(dir).map_err(|e| KeyStoreError::io(dir, e))?;

        let mut private = Vec::new();
        let mut public = Vec::new();
        for entry in entries {
            let path = entry.map_err(|e| KeyStoreError::io(dir, e))?.path();
            if !path.is_file() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let (kid, bucket) = if let Some(kid) = name.strip_suffix(PUBLIC_SUFFIX) {
                (kid, &mut public)
            } else if let Some(kid) = name.strip_suffix(PRIVATE_SUFFIX) {
                (kid, &mut private)
            } else {
                continue;
            };
            if validate_kid(kid).is_err() {
                tracing::warn!(path = %path.display(), "skipping key file with invalid key id");
                continue;
            }
            bucket.push((kid.to_string(), path.clone()));
        }

        let mut set = KeySet::new();
        for (kid, path) in public {
            let pem = read_pem(&path)?;
            set = set.with(KeyPair::from_public_pem(&kid, &pem)?);
        }
        for (kid, path) in private {
            let pem = read_pem(&path)?;
            set = set.with(KeyPair::from_private_pem(&kid, &pem)?);
        }

        if set.is_empty() {
            tracing::warn!(dir = %dir.display(), "no key files found");
        } else {
            tracing::info!(dir = %dir.display(), kids = ?set.kids(), "keys loaded");
        }

        Ok(Self::new(set))
    }

    /// The current key set. Holding the returned `Arc` pins that version.
    pub fn snapshot(&self) -> Arc<KeySet> {
        self.keys.load_full()
    }

    pub fn resolve(&self, kid: &str) -> Result<Arc<KeyPair>, KeyStoreError> {
        self.keys
            .load()
            .get(kid)
            .cloned()
            .ok_or_else(|| KeyStoreError::NotFound {
                kid: kid.to_string(),
            })
    }

    /// resolve_public_key
    ///
    /// The verification key for `kid`.
    pub fn resolve_public_key(&self, kid: &str) -> Result<DecodingKey, KeyStoreError> {
        Ok(self.resolve(kid)?.decoding_key().clone())
    }

    /// resolve_private_key
    ///
    /// The signing key for `kid`. Crate-private: only the issuer signs.
    pub(crate) fn resolve_private_key(&self, kid: &str) -> Result<EncodingKey, KeyStoreError> {
        self.resolve(kid)?
            .encoding_key()
            .cloned()
            .ok_or_else(|| KeyStoreError::NoPrivateKey {
                kid: kid.to_string(),
            })
    }

    /// Publishes a copy of the current set with `pair` added (or replacing the
    /// entry with the same kid).
    pub fn insert(&self, pair: KeyPair) {
        let pair = Arc::new(pair);
        self.keys.rcu(|current| {
            let mut next = KeySet::clone(current);
            next.pairs.insert(pair.kid.clone(), pair.clone());
            next
        });
    }

    /// Swaps in an entirely new set, returning the one it replaced.
    pub fn replace(&self, keys: KeySet) -> Arc<KeySet> {
        self.keys.swap(Arc::new(keys))
    }

    /// Generates a pair on disk and publishes it in this store.
    pub fn generate(&self, dir: impl AsRef<Path>, kid: &str) -> Result<Arc<KeyPair>, KeyStoreError> {
        let pair = generate_key_pair(dir, kid)?;
        self.insert(pair);
        self.resolve(kid)
    }

    pub fn is_empty(&self) -> bool {
        self.keys.load().is_empty()
    }
}

/// generate_key_pair
///
/// Creates a fresh RSA key and writes it to `dir` as `<kid>.pem` (PKCS#1,
/// mode 0600) and `<kid>.pub.pem` (SPKI, mode 0644).
///
/// Both files are created with create-new semantics: an existing key is never
/// overwritten. If the public file cannot be written the private file is
/// removed again, so a failed call leaves nothing behind that `load_dir` would
/// pick up.
pub fn generate_key_pair(dir: impl AsRef<Path>, kid: &str) -> Result<KeyPair, KeyStoreError> {
    validate_kid(kid)?;
    let dir = dir.as_ref();
    let (private_path, public_path) = key_paths(dir, kid);

    for path in [&private_path, &public_path] {
        if path.exists() {
            return Err(KeyStoreError::AlreadyExists { path: path.clone() });
        }
    }

    let mut rng = rand::rngs::OsRng;
    let private = RsaPrivateKey::new(&mut rng, KEY_BITS).map_err(|source| {
        KeyStoreError::Generate {
            kid: kid.to_string(),
            source,
        }
    })?;
    let private_pem = private
        .to_pkcs1_pem(LineEnding::LF)
        .map_err(|e| KeyStoreError::invalid(kid, e))?;
    let public_pem = RsaPublicKey::from(&private)
        .to_public_key_pem(LineEnding::LF)
        .map_err(|e| KeyStoreError::invalid(kid, e))?;

    fs::create_dir_all(dir).map_err(|e| KeyStoreError::io(dir, e))?;

    write_pair(
        (private_path.as_path(), private_pem.as_bytes()),
        (public_path.as_path(), public_pem.as_bytes()),
        write_new,
    )?;

    tracing::info!(kid, dir = %dir.display(), "key pair generated");

    KeyPair::from_private_pem(kid, &private_pem)
}

/// Writes the private file, then the public one. If the public write fails
/// the private file is removed again.
fn write_pair(
    (private_path, private): (&Path, &[u8]),
    (public_path, public): (&Path, &[u8]),
    write: impl Fn(&Path, &[u8], u32) -> Result<(), KeyStoreError>,
) -> Result<(), KeyStoreError> {
    write(private_path, private, 0o600)?;
    if let Err(err) = write(public_path, public, 0o644) {
        remove_quietly(private_path);
        return Err(err);
    }
    Ok(())
}

/// Paths of the private and public files for `kid` under `dir`.
pub fn key_paths(dir: &Path, kid: &str) -> (PathBuf, PathBuf) {
    (
        dir.join(format!("{kid}{PRIVATE_SUFFIX}")),
        dir.join(format!("{kid}{PUBLIC_SUFFIX}")),
    )
}

fn validate_kid(kid: &str) -> Result<(), KeyStoreError> {
    let valid = !kid.is_empty()
        && kid
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(KeyStoreError::InvalidKeyId {
            kid: kid.to_string(),
        })
    }
}

/// PKCS#1, then PKCS#8, then the PEM body read as PKCS#1 DER whatever the
/// label says.
fn parse_private_pem(pem: &str) -> Result<RsaPrivateKey, String> {
    if let Ok(key) = RsaPrivateKey::from_pkcs1_pem(pem) {
        return Ok(key);
    }
    let pkcs8_err = match RsaPrivateKey::from_pkcs8_pem(pem) {
        Ok(key) => return Ok(key),
        Err(err) => err,
    };

    let body: String = pem
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with("-----"))
        .collect();
    let der = STANDARD.decode(body).map_err(|_| pkcs8_err.to_string())?;
    RsaPrivateKey::from_pkcs1_der(&der).map_err(|_| pkcs8_err.to_string())
}

fn read_pem(path: &Path) -> Result<String, KeyStoreError> {
    let file = File::open(path).map_err(|e| KeyStoreError::io(path, e))?;
    let mut pem = String::new();
    file.take(MAX_PEM_BYTES)
        .read_to_string(&mut pem)
        .map_err(|e| KeyStoreError::io(path, e))?;
    Ok(pem)
}

fn write_new(path: &Path, contents: &[u8], mode: u32) -> Result<(), KeyStoreError> {
    write_new_with(path, mode, |file| {
        file.write_all(contents)?;
        file.sync_all()
    })
}

/// Creates `path` (create-new, `mode`) and lets `fill` write it. A file that
/// `fill` fails on is removed, so no truncated key is ever left behind.
fn write_new_with(
    path: &Path,
    mode: u32,
    fill: impl FnOnce(&mut File) -> io::Result<()>,
) -> Result<(), KeyStoreError> {
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(mode);
    }
    #[cfg(not(unix))]
    let _ = mode;

    let mut file = options.open(path).map_err(|e| match e.kind() {
        io::ErrorKind::AlreadyExists => KeyStoreError::AlreadyExists {
            path: path.to_path_buf(),
        },
        _ => KeyStoreError::io(path, e),
    })?;

    if let Err(err) = fill(&mut file) {
        drop(file);
        remove_quietly(path);
        return Err(KeyStoreError::io(path, err));
    }
    Ok(())
}

fn remove_quietly(path: &Path) {
    if let Err(err) = fs::remove_file(path) {
        tracing::error!(path = %path.display(), error = %err, "failed to remove partial key file");
    }
}
