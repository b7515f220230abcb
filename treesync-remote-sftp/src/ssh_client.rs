use russh::client::Handler;
use russh::keys::PublicKeyBase64;
use tracing::{info, warn};

pub(crate) struct Client {
    pub host: String,
    pub allowed_fingerprints: Option<Vec<String>>, // OpenSSH SHA256 fingerprints or raw base64 keys
}

impl Handler for Client {
    type Error = anyhow::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        let fp_sha256 = server_public_key
            .fingerprint(russh::keys::HashAlg::Sha256)
            .to_string();
        let Some(allowed) = &self.allowed_fingerprints else {
            info!(host = %self.host, fingerprint = %fp_sha256, "accepting host key, no allow-list configured");
            return Ok(true);
        };
        let key_b64 = server_public_key.public_key_base64();
        let ok = allowed.iter().any(|s| s == &fp_sha256 || s == &key_b64);
        if !ok {
            warn!(host = %self.host, fingerprint = %fp_sha256, "host key not in allow-list");
        }
        Ok(ok)
    }
}
