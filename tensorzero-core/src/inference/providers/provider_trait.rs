use reqwest::Client;
use secrecy::SecretString;

use crate::error::Error;
use crate::inference::types::{
    ModelInferenceRequest, ProviderInferenceResponse, ProviderInferenceResponseStream,
};

/// Credentials a provider needs to authenticate a call, resolved once at config-load time
/// from a `CredentialLocation`.
pub trait HasCredentials {
    fn has_credentials(&self) -> bool;
}

/// The narrow contract every provider adapter implements. Kept as a trait over a closed
/// `ProviderConfig` enum rather than a dispatch
/// map, so adding a provider is a compile-time-enforced, reviewable change.
pub trait InferenceProvider {
    fn infer(
        &self,
        request: &ModelInferenceRequest<'_>,
        client: &Client,
        dynamic_api_key: Option<&SecretString>,
    ) -> impl std::future::Future<Output = Result<ProviderInferenceResponse, Error>> + Send;

    fn infer_stream(
        &self,
        request: &ModelInferenceRequest<'_>,
        client: &Client,
        dynamic_api_key: Option<&SecretString>,
    ) -> impl std::future::Future<
        Output = Result<(ProviderInferenceResponseStream, String), Error>,
    > + Send;
}
