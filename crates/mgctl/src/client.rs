use anyhow::Context;
use anyhow::Result;
use api_types::AUTHORIZATION_METADATA_KEY;
use api_types::BEARER_PREFIX;
use device_api::DeviceServiceClient;
use tonic::metadata::AsciiMetadataValue;
use tonic::service::interceptor::InterceptedService;
use tonic::service::Interceptor;
use tonic::transport::Channel;
use tonic::transport::Endpoint;
use tonic::Request;
use tonic::Status;
use tracing::debug;

/// Adds the bearer token to every outgoing call.
#[derive(Clone)]
pub struct BearerAuth {
    header: Option<AsciiMetadataValue>,
}

impl BearerAuth {
    pub fn new(token: Option<&str>) -> Result<Self> {
        let header = token
            .map(|token| format!("{BEARER_PREFIX}{}", token.trim()).parse())
            .transpose()
            .context("Token is not a valid metadata value")?;
        Ok(Self { header })
    }
}

impl Interceptor for BearerAuth {
    fn call(&mut self, mut request: Request<()>) -> Result<Request<()>, Status> {
        if let Some(header) = &self.header {
            request
                .metadata_mut()
                .insert(AUTHORIZATION_METADATA_KEY, header.clone());
        }
        Ok(request)
    }
}

pub type ManagementClient = DeviceServiceClient<InterceptedService<Channel, BearerAuth>>;

/// `host:port` or a full URI.
pub fn endpoint_uri(addr: &str) -> String {
    if addr.contains("://") {
        addr.to_string()
    } else {
        format!("http://{addr}")
    }
}

pub async fn connect(addr: &str, token: Option<&str>) -> Result<ManagementClient> {
    let uri = endpoint_uri(addr);
    debug!(%uri, "connecting to management API");
    let channel = Endpoint::from_shared(uri.clone())
        .with_context(|| format!("Invalid management API address {addr}"))?
        .connect()
        .await
        .with_context(|| format!("Failed to connect to {uri}"))?;
    Ok(DeviceServiceClient::with_interceptor(
        channel,
        BearerAuth::new(token)?,
    ))
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn bare_address_gets_http_scheme() {
        assert_eq!(endpoint_uri("localhost:50052"), "http://localhost:50052");
        assert_eq!(endpoint_uri("https://node:50052"), "https://node:50052");
    }

    #[test]
    fn interceptor_sets_bearer_header() {
        let mut auth = BearerAuth::new(Some("abc")).expect("valid token");

        let request = auth.call(Request::new(())).expect("intercepted");

        assert_eq!(
            request
                .metadata()
                .get(AUTHORIZATION_METADATA_KEY)
                .and_then(|v| v.to_str().ok()),
            Some("Bearer abc")
        );
    }

    #[test]
    fn no_token_sends_no_header() {
        let mut auth = BearerAuth::new(None).expect("no token");

        let request = auth.call(Request::new(())).expect("intercepted");

        assert!(request.metadata().get(AUTHORIZATION_METADATA_KEY).is_none());
    }
}
