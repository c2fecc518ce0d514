//! Authentication plugins.
//!
//! - `mysql_native_password`: `SHA1(pw) XOR SHA1(seed + SHA1(SHA1(pw)))`
//! - `caching_sha2_password`: `SHA256(pw) XOR SHA256(SHA256(SHA256(pw)) + seed)`
//!   for fast auth; full auth sends the password RSA-encrypted with the
//!   server's public key.
//! - `mysql_clear_password`: the password itself, NUL-terminated.

use sha1::Sha1;
use sha2::{Digest, Sha256};

use rand::rngs::OsRng;

use rsa::RsaPublicKey;
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::DecodePublicKey;

/// Well-known authentication plugin names.
pub mod plugins {
    pub const MYSQL_NATIVE_PASSWORD: &str = "mysql_native_password";
    pub const CACHING_SHA2_PASSWORD: &str = "caching_sha2_password";
    pub const SHA256_PASSWORD: &str = "sha256_password";
    pub const MYSQL_CLEAR_PASSWORD: &str = "mysql_clear_password";
}

/// Status bytes of the caching_sha2_password exchange.
pub mod caching_sha2 {
    /// Client asks for the server's RSA public key
    pub const REQUEST_PUBLIC_KEY: u8 = 0x02;
    /// Server found the scramble in its cache
    pub const FAST_AUTH_SUCCESS: u8 = 0x03;
    /// Server wants the full password
    pub const PERFORM_FULL_AUTH: u8 = 0x04;
}

/// Scramble seeds are 20 bytes; servers often append a NUL.
fn trim_seed(seed: &[u8]) -> &[u8] {
    match seed {
        [head @ .., 0] if head.len() == 20 => head,
        _ if seed.len() > 20 => &seed[..20],
        _ => seed,
    }
}

fn xor<const N: usize>(a: [u8; N], b: [u8; N]) -> Vec<u8> {
    a.iter().zip(b.iter()).map(|(x, y)| x ^ y).collect()
}

/// Compute the mysql_native_password response (20 bytes, empty for no password).
pub fn mysql_native_password(password: &str, seed: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }
    let seed = trim_seed(seed);

    let stage1: [u8; 20] = Sha1::digest(password.as_bytes()).into();
    let stage2: [u8; 20] = Sha1::digest(stage1).into();

    let mut hasher = Sha1::new();
    hasher.update(seed);
    hasher.update(stage2);
    let stage3: [u8; 20] = hasher.finalize().into();

    xor(stage1, stage3)
}

/// Compute the caching_sha2_password fast-auth response (32 bytes).
pub fn caching_sha2_password(password: &str, seed: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }
    let seed = trim_seed(seed);

    let hashed: [u8; 32] = Sha256::digest(password.as_bytes()).into();
    let double: [u8; 32] = Sha256::digest(hashed).into();

    let mut hasher = Sha256::new();
    hasher.update(double);
    hasher.update(seed);
    let scramble: [u8; 32] = hasher.finalize().into();

    xor(hashed, scramble)
}

/// Response for `plugin` given the server scramble.
///
/// Unknown plugins fall back to mysql_native_password, which every server in
/// the family accepts as a switch target.
pub fn scramble_for(plugin: &str, password: &str, seed: &[u8]) -> Vec<u8> {
    match plugin {
        plugins::CACHING_SHA2_PASSWORD => caching_sha2_password(password, seed),
        plugins::MYSQL_CLEAR_PASSWORD => {
            let mut clear = password.as_bytes().to_vec();
            clear.push(0);
            clear
        }
        plugins::SHA256_PASSWORD if password.is_empty() => vec![0],
        // sha256_password without a password asks for the public key
        plugins::SHA256_PASSWORD => vec![caching_sha2::REQUEST_PUBLIC_KEY],
        plugins::MYSQL_NATIVE_PASSWORD => mysql_native_password(password, seed),
        other => {
            tracing::warn!(plugin = other, "unknown auth plugin; using mysql_native_password");
            mysql_native_password(password, seed)
        }
    }
}

/// Encrypt the password with the server's RSA public key.
///
/// The NUL-terminated password is XORed with the rotating seed first.
/// caching_sha2_password uses OAEP padding; legacy sha256_password servers
/// may expect PKCS#1 v1.5.
pub fn sha256_password_rsa(
    password: &str,
    seed: &[u8],
    public_key_pem: &[u8],
    use_oaep: bool,
) -> Result<Vec<u8>, String> {
    let seed = trim_seed(seed);
    if seed.is_empty() {
        return Err("Seed is empty".to_string());
    }

    let mut plain = password.as_bytes().to_vec();
    plain.push(0);
    for (i, b) in plain.iter_mut().enumerate() {
        *b ^= seed[i % seed.len()];
    }

    let pem = std::str::from_utf8(public_key_pem)
        .map_err(|e| format!("Public key is not valid UTF-8 PEM: {e}"))?;
    let key = RsaPublicKey::from_public_key_pem(pem)
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
        .map_err(|e| format!("Failed to parse RSA public key PEM: {e}"))?;

    if use_oaep {
        key.encrypt(&mut OsRng, rsa::Oaep::new::<Sha1>(), &plain)
            .map_err(|e| format!("RSA OAEP encryption failed: {e}"))
    } else {
        key.encrypt(&mut OsRng, rsa::Pkcs1v15Encrypt, &plain)
            .map_err(|e| format!("RSA PKCS1v1.5 encryption failed: {e}"))
    }
}
