//! Thin REST client for the cloud-side orchestrator API. Outside the
//! transport stack's scope entirely — spec.md calls this a thin external
//! collaborator, so every call here is logged and non-fatal: a failed
//! claim or webhook registration never brings a device session down.

use serde::{Deserialize, Serialize};
use tracing::{error, info};

#[derive(Debug, Clone, Serialize)]
struct ClaimDeviceRequest<'a> {
    device_id_hex: &'a str,
    public_key_pem: &'a str,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClaimDeviceResponse {
    pub claimed: bool,
}

#[derive(Debug, Clone, Serialize)]
struct RegisterWebhookRequest<'a> {
    device_id_hex: &'a str,
    webhook_url: &'a str,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerPublicKeyResponse {
    pub public_key_pem: String,
}

pub struct CloudClient {
    base_url: String,
    http: reqwest::Client,
}

impl CloudClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self { base_url: base_url.into(), http: reqwest::Client::new() }
    }

    pub async fn claim_device(&self, device_id_hex: &str, public_key_pem: &str) -> Option<ClaimDeviceResponse> {
        let url = format!("{}/devices/claim", self.base_url);
        let body = ClaimDeviceRequest { device_id_hex, public_key_pem };
        match self.http.post(&url).json(&body).send().await {
            Ok(resp) => match resp.json::<ClaimDeviceResponse>().await {
                Ok(parsed) => {
                    info!(device = device_id_hex, claimed = parsed.claimed, "device claim request completed");
                    Some(parsed)
                }
                Err(e) => {
                    error!(device = device_id_hex, error = %e, "claim_device response was not valid json");
                    None
                }
            },
            Err(e) => {
                error!(device = device_id_hex, error = %e, "claim_device request failed");
                None
            }
        }
    }

    pub async fn register_webhook(&self, device_id_hex: &str, webhook_url: &str) -> bool {
        let url = format!("{}/devices/webhook", self.base_url);
        let body = RegisterWebhookRequest { device_id_hex, webhook_url };
        match self.http.post(&url).json(&body).send().await {
            Ok(resp) if resp.status().is_success() => {
                info!(device = device_id_hex, "webhook registered");
                true
            }
            Ok(resp) => {
                error!(device = device_id_hex, status = %resp.status(), "webhook registration rejected");
                false
            }
            Err(e) => {
                error!(device = device_id_hex, error = %e, "webhook registration request failed");
                false
            }
        }
    }

    pub async fn fetch_server_public_key(&self) -> Option<String> {
        let url = format!("{}/server/public-key", self.base_url);
        match self.http.get(&url).send().await {
            Ok(resp) => match resp.json::<ServerPublicKeyResponse>().await {
                Ok(parsed) => Some(parsed.public_key_pem),
                Err(e) => {
                    error!(error = %e, "server public key response was not valid json");
                    None
                }
            },
            Err(e) => {
                error!(error = %e, "fetch_server_public_key request failed");
                None
            }
        }
    }
}
