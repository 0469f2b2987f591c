//! Bearer-token authentication.
//!
//! The daemon mints one 256-bit token per user, persisted mode 0600 in the
//! data directory. Every request except the status probe must present it.
//! Comparison is constant-time.

use std::fs;
use std::path::Path;

use uuid::Uuid;

use crate::error::{Error, Result};

/// Environment variable overriding the persisted token.
pub const TOKEN_ENV: &str = "BERTH_AUTH_TOKEN";

/// A shared bearer token.
#[derive(Clone)]
pub struct AuthToken {
    token: String,
}

impl std::fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never expose the secret through Debug output.
        f.debug_struct("AuthToken").finish_non_exhaustive()
    }
}

impl AuthToken {
    /// Load the token from `path`, minting and persisting a fresh one if the
    /// file does not exist. `BERTH_AUTH_TOKEN` overrides the file.
    ///
    /// # Errors
    ///
    /// Returns an error if the token file cannot be read or written.
    pub fn load_or_generate(path: &Path) -> Result<Self> {
        if let Ok(token) = std::env::var(TOKEN_ENV) {
            let token = token.trim().to_string();
            if !token.is_empty() {
                return Ok(Self { token });
            }
        }

        if path.exists() {
            let token = fs::read_to_string(path)?.trim().to_string();
            if token.is_empty() {
                return Err(Error::Validation {
                    field: "auth.token".into(),
                    message: format!("{} exists but is empty", path.display()),
                });
            }
            return Ok(Self { token });
        }

        let token = mint_token();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, &token)?;
        restrict_permissions(path)?;
        Ok(Self { token })
    }

    /// Constant-time comparison against a presented token.
    ///
    /// # Examples
    ///
    /// ```
    /// use berth::auth::AuthToken;
    ///
    /// let dir = tempfile::tempdir().unwrap();
    /// std::env::remove_var(berth::auth::TOKEN_ENV);
    /// let token = AuthToken::load_or_generate(&dir.path().join("auth.token")).unwrap();
    /// assert!(!token.verify("wrong"));
    /// ```
    #[must_use]
    pub fn verify(&self, presented: &str) -> bool {
        constant_time_eq(self.token.as_bytes(), presented.as_bytes())
    }

    /// The token value, for client-side use (CLI, tests).
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.token
    }
}

/// 32 random bytes, hex-encoded: the concatenated bytes of two UUID v4s.
fn mint_token() -> String {
    let mut token = String::with_capacity(64);
    for uuid in [Uuid::new_v4(), Uuid::new_v4()] {
        for byte in uuid.as_bytes() {
            use std::fmt::Write;
            let _ = write!(token, "{byte:02x}");
        }
    }
    token
}

/// Byte-wise comparison that does not short-circuit on the first mismatch.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = fs::metadata(path)?.permissions();
    perms.set_mode(0o600);
    fs::set_permissions(path, perms)?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<()> {
    Ok(())
}
