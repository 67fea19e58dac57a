//! On-disk persistence for device identities: PKCS#1 RSA private PEM at
//! `<data>/keys/<deviceIdHex>.pem`.

use std::path::Path;

use anyhow::{Context, Result};
use devswarm_core::crypto::{export_private_pem, random_bytes, rsa_generate_1024, rsa_load_private};
use devswarm_core::DeviceIdentity;
use tracing::info;

fn keys_dir(data_dir: &Path) -> std::path::PathBuf {
    data_dir.join("keys")
}

fn key_path(data_dir: &Path, device_id_hex: &str) -> std::path::PathBuf {
    keys_dir(data_dir).join(format!("{device_id_hex}.pem"))
}

/// Loads an existing identity for `device_id_hex` if its key file exists,
/// otherwise generates a fresh keypair (and, if `device_id_hex` is `None`,
/// a fresh random id) and persists it.
pub fn load_or_generate_identity(data_dir: &Path, device_id_hex: Option<&str>) -> Result<DeviceIdentity> {
    if let Some(hex_id) = device_id_hex {
        let path = key_path(data_dir, hex_id);
        if path.exists() {
            let pem = std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
            let private_key = rsa_load_private(&pem)?;
            let mut id = [0u8; 12];
            let decoded = hex::decode(hex_id).context("device id hex is not valid hex")?;
            id.copy_from_slice(&decoded);
            info!(device = hex_id, "loaded identity from disk");
            return Ok(DeviceIdentity::from_parts(id, private_key));
        }
    }

    let mut id = [0u8; 12];
    random_bytes(&mut id);
    let private_key = rsa_generate_1024()?;
    let identity = DeviceIdentity::from_parts(id, private_key);
    save_identity(data_dir, &identity)?;
    info!(device = %identity.id_hex(), "generated new identity");
    Ok(identity)
}

/// Writes `identity`'s private key to `<data_dir>/keys/<deviceIdHex>.pem`.
pub fn save_identity(data_dir: &Path, identity: &DeviceIdentity) -> Result<()> {
    let dir = keys_dir(data_dir);
    std::fs::create_dir_all(&dir).with_context(|| format!("creating keys dir {}", dir.display()))?;
    let path = key_path(data_dir, &identity.id_hex());
    let pem = export_private_pem(&identity.private_key)?;
    std::fs::write(&path, pem).with_context(|| format!("writing {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_identity_persists_and_reloads() {
        let dir = std::env::temp_dir().join(format!("devswarm-keystore-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();

        let identity = load_or_generate_identity(&dir, None).unwrap();
        let hex_id = identity.id_hex();

        let reloaded = load_or_generate_identity(&dir, Some(&hex_id)).unwrap();
        assert_eq!(reloaded.id, identity.id);

        std::fs::remove_dir_all(&dir).ok();
    }
}
