//! One-shot WebRTC offer/answer relay to the provider's negotiation endpoint.
//!
//! Independent of the session registry: the browser talks to the provider
//! directly once the answer is back.

use crate::{
    config::Provider,
    error::{RealtimeError, RealtimeResult, sanitize_detail},
};
use reqwest::{Client, header};
use secrecy::{ExposeSecret, SecretString};
use std::time::Duration;
use tracing::{info, instrument, warn};

/// Upstream error bodies are cut to this many characters.
const MAX_ERROR_BODY_CHARS: usize = 512;

pub struct SdpRelay {
    client: Client,
    sdp_url: String,
}

impl SdpRelay {
    pub fn new(sdp_url: impl Into<String>, timeout: Duration) -> RealtimeResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RealtimeError::InternalFailure(format!("http client: {e}")))?;
        Ok(Self {
            client,
            sdp_url: sdp_url.into(),
        })
    }

    /// Forwards `offer` and returns the provider's SDP answer verbatim.
    ///
    /// Checks run before any network call: provider support, then offer shape,
    /// then the credential.
    #[instrument(skip_all, fields(%provider, %model))]
    pub async fn negotiate(
        &self,
        offer: &str,
        provider: Provider,
        model: &str,
        credential: Option<&SecretString>,
    ) -> RealtimeResult<String> {
        provider.ensure_supported()?;
        validate_offer(offer)?;
        let credential =
            credential.ok_or_else(|| RealtimeError::MissingCredential(provider.to_string()))?;

        let response = self
            .client
            .post(&self.sdp_url)
            .query(&[("model", model)])
            .bearer_auth(credential.expose_secret())
            .header(header::CONTENT_TYPE, "application/sdp")
            .body(offer.to_owned())
            .send()
            .await
            .map_err(|e| {
                warn!(error = %e, "SDP negotiation request failed");
                RealtimeError::UpstreamUnavailable(format!("SDP endpoint unreachable: {e}"))
            })?;

        let status = response.status();
        let body = response.text().await.map_err(|e| {
            RealtimeError::UpstreamUnavailable(format!("failed to read SDP answer: {e}"))
        })?;
        if !status.is_success() {
            warn!(status = status.as_u16(), "SDP negotiation rejected");
            return Err(RealtimeError::BadGateway {
                status: status.as_u16(),
                message: sanitize_detail(&body, MAX_ERROR_BODY_CHARS),
            });
        }
        info!(answer_len = body.len(), "SDP negotiated");
        Ok(body)
    }
}

/// A cheap shape check: version line first and at least one media section.
fn validate_offer(offer: &str) -> RealtimeResult<()> {
    let offer = offer.trim_start();
    if offer.is_empty() {
        return Err(RealtimeError::InvalidInput("SDP offer is empty".to_string()));
    }
    if !offer.starts_with("v=0") {
        return Err(RealtimeError::InvalidInput(
            "SDP offer must start with a v=0 line".to_string(),
        ));
    }
    if !offer.lines().any(|line| line.starts_with("m=")) {
        return Err(RealtimeError::InvalidInput(
            "SDP offer has no media section".to_string(),
        ));
    }
    Ok(())
}
