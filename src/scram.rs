// SCRAM-SHA-256 authentication for the replay target
// Implements RFC 5802 (SCRAM) with SHA-256; the wire conversation
// (saslStart/saslContinue) is driven by the target connection.

use anyhow::{Result, anyhow};
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::{Digest, Sha256};

pub const SCRAM_MECHANISM: &str = "SCRAM-SHA-256";
const CLIENT_NONCE_LEN: usize = 24;
// base64 of the "n,," gs2 header sent in client-first
const GS2_CHANNEL_BINDING: &str = "biws";

/// Client side of one SCRAM-SHA-256 conversation. Pure state machine: the
/// caller exchanges the produced and received payloads over saslStart /
/// saslContinue and feeds them back in order.
pub struct ScramConversation {
    username: String,
    password: String,
    client_nonce: String,
    auth_message: Option<String>,
    server_signature: Option<Vec<u8>>,
}

impl ScramConversation {
    pub fn new(username: String, password: String) -> Self {
        Self::with_nonce(username, password, generate_nonce())
    }

    /// Fixed-nonce constructor for deterministic tests.
    pub fn with_nonce(username: String, password: String, client_nonce: String) -> Self {
        Self {
            username,
            password,
            client_nonce,
            auth_message: None,
            server_signature: None,
        }
    }

    /// client-first-message, the saslStart payload.
    pub fn client_first(&self) -> String {
        format!("n,,{}", self.client_first_bare())
    }

    fn client_first_bare(&self) -> String {
        let username = self.username.replace("=", "=3D").replace(",", "=2C");
        format!("n={},r={}", username, self.client_nonce)
    }

    /// Consume the server-first-message and produce the client-final-message
    /// (the saslContinue payload).
    pub fn handle_server_first(&mut self, server_first: &str) -> Result<String> {
        let mut server_nonce = None;
        let mut salt = None;
        let mut iterations = None;
        for part in server_first.split(',') {
            if let Some(rest) = part.strip_prefix("r=") {
                server_nonce = Some(rest.to_string());
            } else if let Some(rest) = part.strip_prefix("s=") {
                salt = Some(
                    BASE64
                        .decode(rest)
                        .map_err(|e| anyhow!("invalid base64 salt: {e}"))?,
                );
            } else if let Some(rest) = part.strip_prefix("i=") {
                iterations = Some(
                    rest.parse::<u32>()
                        .map_err(|e| anyhow!("invalid iteration count: {e}"))?,
                );
            }
        }
        let (Some(server_nonce), Some(salt), Some(iterations)) = (server_nonce, salt, iterations)
        else {
            return Err(anyhow!("missing required fields in server-first"));
        };
        if !server_nonce.starts_with(&self.client_nonce) {
            return Err(anyhow!("server nonce does not start with client nonce"));
        }

        let client_final_without_proof = format!("c={},r={}", GS2_CHANNEL_BINDING, server_nonce);
        let auth_message = format!(
            "{},{},{}",
            self.client_first_bare(),
            server_first,
            client_final_without_proof
        );

        let salted_password = pbkdf2_hmac_sha256(&self.password, &salt, iterations);
        let client_key = hmac_sha256(&salted_password, b"Client Key");
        let stored_key = sha256(&client_key);
        let client_signature = hmac_sha256(&stored_key, auth_message.as_bytes());
        let client_proof: Vec<u8> = client_key
            .iter()
            .zip(client_signature.iter())
            .map(|(a, b)| a ^ b)
            .collect();

        let server_key = hmac_sha256(&salted_password, b"Server Key");
        self.server_signature = Some(hmac_sha256(&server_key, auth_message.as_bytes()));
        self.auth_message = Some(auth_message);

        Ok(format!(
            "{},p={}",
            client_final_without_proof,
            BASE64.encode(&client_proof)
        ))
    }

    /// Verify the server-final-message signature.
    pub fn handle_server_final(&self, server_final: &str) -> Result<()> {
        if let Some(err) = server_final.strip_prefix("e=") {
            return Err(anyhow!("server returned error: {err}"));
        }
        let Some(verifier) = server_final.strip_prefix("v=") else {
            return Err(anyhow!("expected server verifier, got: {server_final}"));
        };
        let Some(expected) = self.server_signature.as_ref() else {
            return Err(anyhow!("server-final before server-first"));
        };
        let received = BASE64
            .decode(verifier)
            .map_err(|e| anyhow!("invalid base64 server signature: {e}"))?;
        if &received != expected {
            return Err(anyhow!("server signature mismatch"));
        }
        Ok(())
    }
}

/// Generate a random nonce
fn generate_nonce() -> String {
    let mut bytes = vec![0u8; CLIENT_NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut bytes);
    BASE64.encode(&bytes)
}

/// PBKDF2 with HMAC-SHA-256
fn pbkdf2_hmac_sha256(password: &str, salt: &[u8], iterations: u32) -> Vec<u8> {
    let mut result = vec![0u8; 32];
    pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, iterations, &mut result);
    result
}

/// HMAC-SHA-256
fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    type HmacSha256 = Hmac<Sha256>;
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// SHA-256 hash
fn sha256(data: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().to_vec()
}
