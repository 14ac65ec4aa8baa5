//! Short-lived credentials issued by the shared-secret service.
//!
//! Each credential is a username derived from the issue time and a 20-byte
//! password. The registry is a single mutex around the whole map; inserts
//! come from the accept loop, lookups from integrity checks, and the sweep
//! evicts anything older than the TTL.

use rand::RngCore;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use stunprobe_core::{AttributeType, ErrorCode, MessageHeader, hmac_sha1_with_block_size};
use zeroize::Zeroizing;

/// How long an issued credential stays valid
pub const CREDENTIAL_TTL: Duration = Duration::from_secs(600);

/// Block size of the keyed hash used to derive passwords
const PASSWORD_BLOCK_SIZE: usize = 8;

/// An issued username/password pair
#[derive(Clone)]
pub struct Credential {
    username: String,
    password: Zeroizing<Vec<u8>>,
    created: SystemTime,
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("created", &self.created)
            .finish()
    }
}

impl Credential {
    /// Mint a credential for the given issue time
    ///
    /// The username is `USER-` followed by the lowercase hex millisecond
    /// timestamp, padded with `'0'` to a multiple of four characters. The
    /// password is an 8-byte-block HMAC-SHA1 of the big-endian timestamp
    /// keyed with eight random bytes.
    #[must_use]
    pub fn mint(created: SystemTime) -> Self {
        let now_ms = created
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_millis() as u64);

        let mut username = format!("USER-{now_ms:x}");
        while username.len() % 4 != 0 {
            username.push('0');
        }

        let mut key = [0u8; PASSWORD_BLOCK_SIZE];
        rand::thread_rng().fill_bytes(&mut key);
        let password = hmac_sha1_with_block_size(&key, &now_ms.to_be_bytes(), PASSWORD_BLOCK_SIZE);

        Self {
            username,
            password: Zeroizing::new(password.to_vec()),
            created,
        }
    }

    /// Username
    #[must_use]
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Password bytes
    #[must_use]
    pub fn password(&self) -> &[u8] {
        &self.password
    }

    /// Issue time
    #[must_use]
    pub fn created(&self) -> SystemTime {
        self.created
    }

    fn is_expired(&self, now: SystemTime, ttl: Duration) -> bool {
        now.duration_since(self.created)
            .is_ok_and(|age| age > ttl)
    }
}

/// In-memory store of issued credentials
#[derive(Debug)]
pub struct CredentialRegistry {
    credentials: Mutex<HashMap<String, Credential>>,
    ttl: Duration,
}

impl Default for CredentialRegistry {
    fn default() -> Self {
        Self::new(CREDENTIAL_TTL)
    }
}

impl CredentialRegistry {
    /// Create an empty registry with the given TTL
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            credentials: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Credential>> {
        self.credentials
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Mint and register a new credential
    ///
    /// Usernames are unique within the registry. When the current
    /// millisecond's username is taken the issue time is advanced one
    /// millisecond at a time until a free name comes up.
    pub fn issue(&self) -> Credential {
        let mut created = SystemTime::now();
        let mut credentials = self.lock();
        loop {
            let credential = Credential::mint(created);
            if let Entry::Vacant(slot) = credentials.entry(credential.username.clone()) {
                slot.insert(credential.clone());
                return credential;
            }
            created += Duration::from_millis(1);
        }
    }

    /// Register an existing credential
    ///
    /// Returns false, leaving the registered one in place, if the username
    /// is already taken.
    pub fn insert(&self, credential: Credential) -> bool {
        match self.lock().entry(credential.username.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(credential);
                true
            }
            Entry::Occupied(_) => {
                tracing::debug!(username = %credential.username, "Credential name already issued");
                false
            }
        }
    }

    /// Password for `username`, if it is registered
    #[must_use]
    pub fn lookup(&self, username: &str) -> Option<Zeroizing<Vec<u8>>> {
        self.lock()
            .get(username)
            .map(|c| Zeroizing::new(c.password.to_vec()))
    }

    /// Drop every credential older than the TTL at `now`
    ///
    /// Returns the number of evicted entries.
    pub fn sweep(&self, now: SystemTime) -> usize {
        let mut credentials = self.lock();
        let before = credentials.len();
        credentials.retain(|_, c| !c.is_expired(now, self.ttl));
        before - credentials.len()
    }

    /// Number of registered credentials
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// True if nothing is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Check a request's MESSAGE-INTEGRITY against the registry
    ///
    /// On success returns the password so the caller can sign its reply.
    ///
    /// # Errors
    ///
    /// - 432 when USERNAME is missing
    /// - 401 when MESSAGE-INTEGRITY is missing
    /// - 430 when the username is unknown or expired
    /// - 431 (or 400) when the integrity check itself fails
    pub fn check_integrity(&self, request: &MessageHeader) -> Result<Zeroizing<Vec<u8>>, ErrorCode> {
        let username = request
            .attribute(AttributeType::Username)
            .and_then(|a| a.username_str())
            .ok_or(ErrorCode::MissingUsername)?;

        if !request.has_attribute(AttributeType::MessageIntegrity) {
            return Err(ErrorCode::Unauthorized);
        }

        let password = self.lookup(&username).ok_or(ErrorCode::StaleCredentials)?;

        request
            .verify_message_integrity(&password)
            .map_err(|e| e.error_code())?;

        Ok(password)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stunprobe_core::{Attribute, MessageClass};

    #[test]
    fn test_username_format() {
        let created = UNIX_EPOCH + Duration::from_millis(0x18c2_b1a7_e0f0);
        let credential = Credential::mint(created);
        assert!(credential.username().starts_with("USER-18c2b1a7e0f0"));
        assert_eq!(credential.username().len() % 4, 0);
        assert_eq!(credential.password().len(), 20);
    }

    #[test]
    fn test_username_padding_uses_zero_chars() {
        let created = UNIX_EPOCH + Duration::from_millis(0xabc);
        let credential = Credential::mint(created);
        assert_eq!(credential.username(), "USER-abc");

        let created = UNIX_EPOCH + Duration::from_millis(0xabcd);
        let credential = Credential::mint(created);
        assert_eq!(credential.username(), "USER-abcd000");
        assert_eq!(credential.username().len(), 12);
    }

    #[test]
    fn test_passwords_differ() {
        let now = SystemTime::now();
        let a = Credential::mint(now);
        let b = Credential::mint(now);
        assert_eq!(a.username(), b.username());
        assert_ne!(a.password(), b.password());
    }

    #[test]
    fn test_issue_and_lookup() {
        let registry = CredentialRegistry::default();
        let credential = registry.issue();
        assert_eq!(registry.len(), 1);
        assert_eq!(
            registry.lookup(credential.username()).as_deref().map(Vec::as_slice),
            Some(credential.password())
        );
        assert!(registry.lookup("USER-unknown").is_none());
    }

    #[test]
    fn test_sweep_expired() {
        let registry = CredentialRegistry::default();
        let now = SystemTime::now();
        let old = Credential::mint(now - Duration::from_secs(601));
        let fresh = Credential::mint(now - Duration::from_secs(1));
        let old_name = old.username().to_string();
        let fresh_name = fresh.username().to_string();
        assert!(registry.insert(old));
        assert!(registry.insert(fresh));

        assert_eq!(registry.sweep(now), 1);
        assert!(registry.lookup(&old_name).is_none());
        assert!(registry.lookup(&fresh_name).is_some());
    }

    fn signed_binding(credential: &Credential) -> MessageHeader {
        let mut request = MessageHeader::with_generated_id(MessageClass::BindingRequest);
        request.add_attribute(Attribute::username(credential.username()));
        request.with_message_integrity(credential.password()).unwrap()
    }

    #[test]
    fn test_same_millisecond_keeps_first_credential() {
        let registry = CredentialRegistry::default();
        let now = SystemTime::now();
        let first = Credential::mint(now);
        let second = Credential::mint(now);

        assert!(registry.insert(first.clone()));
        assert!(!registry.insert(second));
        assert_eq!(registry.len(), 1);
        assert!(registry.check_integrity(&signed_binding(&first)).is_ok());
    }

    #[test]
    fn test_issue_never_displaces() {
        let registry = CredentialRegistry::default();
        let issued: Vec<Credential> = (0..50).map(|_| registry.issue()).collect();

        assert_eq!(registry.len(), issued.len());
        for credential in &issued {
            assert_eq!(credential.username().len() % 4, 0);
            let password = registry.check_integrity(&signed_binding(credential)).unwrap();
            assert_eq!(password.as_slice(), credential.password());
        }
    }

    #[test]
    fn test_issue_skips_name_taken_by_earlier_mint() {
        let registry = CredentialRegistry::default();
        let ahead = Credential::mint(SystemTime::now() + Duration::from_millis(5));
        assert!(registry.insert(ahead.clone()));

        for _ in 0..20 {
            let issued = registry.issue();
            assert_ne!(issued.username(), ahead.username());
        }
        assert!(registry.check_integrity(&signed_binding(&ahead)).is_ok());
    }

    #[test]
    fn test_check_integrity_codes() {
        let registry = CredentialRegistry::default();
        let credential = registry.issue();

        let bare = MessageHeader::with_generated_id(MessageClass::BindingRequest);
        assert_eq!(
            registry.check_integrity(&bare).unwrap_err(),
            ErrorCode::MissingUsername
        );

        let mut unsigned = bare.clone();
        unsigned.add_attribute(Attribute::username(credential.username()));
        assert_eq!(
            registry.check_integrity(&unsigned).unwrap_err(),
            ErrorCode::Unauthorized
        );

        let mut stranger = bare.clone();
        stranger.add_attribute(Attribute::username("USER-ffffffff"));
        stranger.add_message_integrity(b"whatever").unwrap();
        assert_eq!(
            registry.check_integrity(&stranger).unwrap_err(),
            ErrorCode::StaleCredentials
        );

        let mut forged = unsigned.clone();
        forged.add_message_integrity(b"wrong password").unwrap();
        assert_eq!(
            registry.check_integrity(&forged).unwrap_err(),
            ErrorCode::IntegrityCheckFailure
        );

        let signed = unsigned
            .with_message_integrity(credential.password())
            .unwrap();
        let password = registry.check_integrity(&signed).unwrap();
        assert_eq!(password.as_slice(), credential.password());
    }
}
