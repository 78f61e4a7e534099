//! hCaptcha verification for claim requests.

use crate::config::CaptchaConfig;
use crate::error::{FaucetError, FaucetResult};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

/// Default hCaptcha verification endpoint.
pub const HCAPTCHA_VERIFY_URL: &str = "https://api.hcaptcha.com/siteverify";

/// Deadline for a verification round trip; a hung verifier must not
/// stall a claim indefinitely.
const VERIFY_TIMEOUT: Duration = Duration::from_secs(10);

/// Client for the hCaptcha siteverify API.
///
/// An empty secret disables verification and every token passes.
#[derive(Debug)]
pub struct CaptchaVerifier {
    client: reqwest::Client,
    verify_url: String,
    site_key: String,
    secret: String,
}

#[derive(Debug, Deserialize)]
struct VerifyResponse {
    success: bool,
    #[serde(default, rename = "error-codes")]
    error_codes: Vec<String>,
}

impl CaptchaVerifier {
    pub fn new(config: &CaptchaConfig) -> FaucetResult<Self> {
        Self::with_timeout(config, VERIFY_TIMEOUT)
    }

    fn with_timeout(config: &CaptchaConfig, timeout: Duration) -> FaucetResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| {
                FaucetError::Internal(anyhow::anyhow!("Failed to build captcha client: {}", e))
            })?;

        Ok(Self {
            client,
            verify_url: config.verify_url.clone(),
            site_key: config.site_key.clone(),
            secret: config.secret.clone(),
        })
    }

    /// The site key the frontend embeds in its widget.
    pub fn site_key(&self) -> &str {
        &self.site_key
    }

    pub fn is_enabled(&self) -> bool {
        !self.secret.is_empty()
    }

    /// Check a user-supplied captcha token with the verification service.
    ///
    /// Transport failures surface as gateway errors; only an explicit
    /// negative verdict maps to [`FaucetError::CaptchaRejected`].
    pub async fn verify(&self, token: &str) -> FaucetResult<()> {
        if !self.is_enabled() {
            return Ok(());
        }

        let params = [("secret", self.secret.as_str()), ("response", token)];
        let response = self
            .client
            .post(&self.verify_url)
            .form(&params)
            .send()
            .await
            .map_err(|e| FaucetError::Gateway(format!("captcha verification request failed: {}", e)))?;

        let verdict: VerifyResponse = response
            .json()
            .await
            .map_err(|e| FaucetError::Gateway(format!("captcha verification response malformed: {}", e)))?;

        if verdict.success {
            Ok(())
        } else {
            debug!(error_codes = ?verdict.error_codes, "captcha token rejected");
            Err(FaucetError::CaptchaRejected)
        }
    }
}
