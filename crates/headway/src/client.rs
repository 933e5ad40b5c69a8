use std::sync::Arc;

use reqwest::Client;
use rustls::{ClientConfig, crypto::ring};
use rustls_platform_verifier::BuilderVerifierExt;

use crate::config::HttpConfig;
use crate::error::PrefetchError;

/// Create the shared reqwest client with the provided configuration.
///
/// TLS is preconfigured with the ring provider and the platform certificate
/// verifier so segment hosts are validated against the native root store.
pub fn create_client(config: &HttpConfig) -> Result<Client, PrefetchError> {
    let provider = Arc::new(ring::default_provider());

    let tls_config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| PrefetchError::configuration(format!("TLS protocol versions: {e}")))?
        .with_platform_verifier()
        .map_err(|e| PrefetchError::configuration(format!("platform verifier: {e}")))?
        .with_no_client_auth();

    let mut client_builder = Client::builder()
        .pool_max_idle_per_host(5)
        .user_agent(&config.user_agent)
        .use_preconfigured_tls(tls_config)
        .redirect(if config.follow_redirects {
            reqwest::redirect::Policy::limited(10)
        } else {
            reqwest::redirect::Policy::none()
        });

    if !config.timeout.is_zero() {
        client_builder = client_builder.timeout(config.timeout);
    }

    if !config.connect_timeout.is_zero() {
        client_builder = client_builder.connect_timeout(config.connect_timeout);
    }

    client_builder.build().map_err(PrefetchError::from)
}
