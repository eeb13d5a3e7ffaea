//! Managed-cloud (EKS) connector flavor
//!
//! Starts from the ambient AWS credential chain, optionally assumes a role,
//! describes the target cluster to learn its endpoint and CA, and installs a
//! [`TokenCell`] as the authentication wrapper. Tokens are presigned STS
//! caller-identity URLs in the `k8s-aws-v1.` format the EKS API server
//! accepts, minted under lock so concurrent requests crossing a refresh
//! boundary observe a single mint.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_credential_types::provider::{ProvideCredentials, SharedCredentialsProvider};
use aws_sigv4::http_request::{
    sign, SignableBody, SignableRequest, SignatureLocation, SigningSettings,
};
use aws_sigv4::sign::v4;
use aws_smithy_runtime_api::client::identity::Identity;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hyper_util::client::legacy::Client as HyperClient;
use hyper_util::rt::TokioExecutor;
use kube::client::ConfigExt;
use kube::config::{
    AuthInfo, Cluster, Context, KubeConfigOptions, Kubeconfig, NamedAuthInfo, NamedCluster,
    NamedContext,
};
use tokio::sync::Mutex;
use tower::{filter::AsyncFilterLayer, BoxError, ServiceBuilder};
use tracing::debug;

use super::{Connector, ConnectorAuth};
use crate::config::{ClusterConfig, EksConfig};
use crate::error::Error;
use crate::PRODUCT_NAME;

/// Scheme tag prepended to the encoded presigned URL.
const TOKEN_PREFIX: &str = "k8s-aws-v1.";

/// Header binding the cluster handle into the presigned URL signature.
const CLUSTER_ID_HEADER: &str = "x-k8s-aws-id";

/// EKS issues 15-minute tokens; treat them as valid for 14.
const TOKEN_LIFETIME: Duration = Duration::from_secs(14 * 60);

/// Refresh once a token is within this margin of its expiry.
const REFRESH_MARGIN: Duration = Duration::from_secs(60);

/// Validity window requested for the presigned URL itself.
const PRESIGN_EXPIRES: Duration = Duration::from_secs(60);

pub(super) async fn build(cfg: &ClusterConfig) -> Result<Connector, Error> {
    let eks_cfg = cfg
        .eks
        .as_ref()
        .ok_or_else(|| Error::cluster("eks config is required for managed-cloud type"))?;

    let sdk_config = load_aws_config(eks_cfg).await;
    let credentials = sdk_config
        .credentials_provider()
        .ok_or_else(|| Error::cluster("no AWS credentials provider available"))?;

    let (endpoint, ca_data) = describe_cluster(&sdk_config, &eks_cfg.cluster_name).await?;

    let cell = Arc::new(TokenCell::new(Arc::new(StsTokenMinter {
        cluster_name: eks_cfg.cluster_name.clone(),
        region: eks_cfg.region.clone(),
        credentials,
    })));

    // Resolve endpoint and CA through a synthetic kubeconfig so certificate
    // handling matches the static-config flavor exactly.
    let kubeconfig = synthetic_kubeconfig(&cfg.name, &endpoint, &ca_data);
    let kube_config = kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| Error::cluster(format!("failed to assemble EKS client config: {e}")))?;

    let base_url = kube_config.cluster_url.to_string();
    let base_url = base_url.trim_end_matches('/').to_string();

    let kube = build_kube_client(&kube_config, cell.clone())?;
    let http = tunnel_client(&ca_data)?;

    Ok(Connector::from_parts(
        cfg,
        kube,
        http,
        base_url,
        ConnectorAuth::Eks(cell),
    ))
}

/// Load the AWS SDK configuration, wrapping the ambient chain with a role
/// assumption provider when one is configured.
async fn load_aws_config(eks_cfg: &EksConfig) -> aws_config::SdkConfig {
    let region = Region::new(eks_cfg.region.clone());
    let base = aws_config::defaults(BehaviorVersion::latest())
        .region(region.clone())
        .load()
        .await;

    let Some(assume) = &eks_cfg.assume_role else {
        return base;
    };

    let session_name = assume
        .session_name
        .clone()
        .unwrap_or_else(|| PRODUCT_NAME.to_string());

    let mut builder = aws_config::sts::AssumeRoleProvider::builder(&assume.role_arn)
        .configure(&base)
        .session_name(session_name);
    if let Some(external_id) = &assume.external_id {
        builder = builder.external_id(external_id);
    }
    let provider = builder.build().await;

    aws_config::defaults(BehaviorVersion::latest())
        .region(region)
        .credentials_provider(provider)
        .load()
        .await
}

/// Describe the EKS cluster, returning its endpoint URL and base64 CA data.
async fn describe_cluster(
    sdk_config: &aws_config::SdkConfig,
    cluster_name: &str,
) -> Result<(String, String), Error> {
    let eks = aws_sdk_eks::Client::new(sdk_config);
    let output = eks
        .describe_cluster()
        .name(cluster_name)
        .send()
        .await
        .map_err(|e| Error::cluster(format!("failed to describe EKS cluster: {e}")))?;

    let cluster = output
        .cluster()
        .ok_or_else(|| Error::cluster("DescribeCluster returned no cluster"))?;
    let endpoint = cluster
        .endpoint()
        .ok_or_else(|| Error::cluster("EKS cluster has no endpoint"))?
        .to_string();
    let ca_data = cluster
        .certificate_authority()
        .and_then(|ca| ca.data())
        .ok_or_else(|| Error::cluster("EKS cluster has no certificate authority data"))?
        .to_string();

    Ok((endpoint, ca_data))
}

/// In-memory kubeconfig carrying only the server URL and CA; authentication
/// comes from the token layer, never from this document.
fn synthetic_kubeconfig(name: &str, endpoint: &str, ca_data: &str) -> Kubeconfig {
    Kubeconfig {
        clusters: vec![NamedCluster {
            name: name.to_string(),
            cluster: Some(Cluster {
                server: Some(endpoint.to_string()),
                certificate_authority_data: Some(ca_data.to_string()),
                ..Default::default()
            }),
        }],
        auth_infos: vec![NamedAuthInfo {
            name: name.to_string(),
            auth_info: Some(AuthInfo::default()),
        }],
        contexts: vec![NamedContext {
            name: name.to_string(),
            context: Some(Context {
                cluster: name.to_string(),
                user: Some(name.to_string()),
                ..Default::default()
            }),
        }],
        current_context: Some(name.to_string()),
        ..Default::default()
    }
}

/// Build a kube client whose service stack injects a fresh bearer token from
/// the cell on every request, the same shape kube uses for refreshable
/// credentials.
fn build_kube_client(
    kube_config: &kube::Config,
    cell: Arc<TokenCell>,
) -> Result<kube::Client, Error> {
    let connector = kube_config
        .rustls_https_connector()
        .map_err(|e| Error::cluster(format!("failed to build TLS connector: {e}")))?;
    let hyper_client =
        HyperClient::builder(TokioExecutor::new()).build::<_, kube::client::Body>(connector);

    let token_layer = AsyncFilterLayer::new(move |mut req: http::Request<kube::client::Body>| {
        let cell = cell.clone();
        async move {
            let token = cell.bearer_token().await.map_err(BoxError::from)?;
            let value = http::HeaderValue::try_from(format!("Bearer {token}"))
                .map_err(BoxError::from)?;
            req.headers_mut().insert(http::header::AUTHORIZATION, value);
            Ok::<_, BoxError>(req)
        }
    });

    let service = ServiceBuilder::new()
        .layer(kube_config.base_uri_layer())
        .layer(token_layer)
        .service(hyper_client);

    Ok(kube::Client::new(service, kube_config.default_namespace.clone()))
}

/// Build the raw tunnel transport trusting the cluster CA.
fn tunnel_client(ca_data: &str) -> Result<reqwest::Client, Error> {
    let ca_pem = base64::engine::general_purpose::STANDARD
        .decode(ca_data)
        .map_err(|e| Error::cluster(format!("failed to decode CA certificate: {e}")))?;
    let cert = reqwest::Certificate::from_pem(&ca_pem)
        .map_err(|e| Error::cluster(format!("invalid CA certificate: {e}")))?;

    super::http_client_builder()
        .add_root_certificate(cert)
        .build()
        .map_err(|e| Error::cluster(format!("failed to build tunnel client: {e}")))
}

/// Source of freshly minted bearer tokens.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TokenMinter: Send + Sync {
    /// Mint a new bearer token.
    async fn mint(&self) -> Result<String, Error>;
}

/// Mutually exclusive holder of `(token, expiry)`.
///
/// Every request round-trips through [`TokenCell::bearer_token`], which
/// returns the cached token while it is comfortably fresh and otherwise mints
/// a replacement while still holding the lock, so a refresh window produces
/// exactly one mint no matter how many requests race across it.
pub struct TokenCell {
    minter: Arc<dyn TokenMinter>,
    state: Mutex<Option<CachedToken>>,
}

impl std::fmt::Debug for TokenCell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCell").finish_non_exhaustive()
    }
}

struct CachedToken {
    token: String,
    expiry: tokio::time::Instant,
}

impl TokenCell {
    /// Create an empty cell backed by the given minter.
    pub fn new(minter: Arc<dyn TokenMinter>) -> TokenCell {
        TokenCell {
            minter,
            state: Mutex::new(None),
        }
    }

    /// Return a token valid for at least [`REFRESH_MARGIN`] from now, minting
    /// a fresh one when the cached token is absent or too close to expiry.
    pub async fn bearer_token(&self) -> Result<String, Error> {
        let mut state = self.state.lock().await;

        if let Some(cached) = state.as_ref() {
            if tokio::time::Instant::now() + REFRESH_MARGIN < cached.expiry {
                return Ok(cached.token.clone());
            }
        }

        let token = self.minter.mint().await?;
        *state = Some(CachedToken {
            token: token.clone(),
            expiry: tokio::time::Instant::now() + TOKEN_LIFETIME,
        });
        debug!(lifetime_secs = TOKEN_LIFETIME.as_secs(), "minted EKS token");
        Ok(token)
    }
}

/// Minter presigning an STS `GetCallerIdentity` call with the cluster handle
/// bound into the signature.
pub struct StsTokenMinter {
    cluster_name: String,
    region: String,
    credentials: SharedCredentialsProvider,
}

#[async_trait]
impl TokenMinter for StsTokenMinter {
    async fn mint(&self) -> Result<String, Error> {
        let credentials = self
            .credentials
            .provide_credentials()
            .await
            .map_err(|e| Error::token(format!("failed to resolve AWS credentials: {e}")))?;
        let identity: Identity = credentials.into();

        let host = format!("sts.{}.amazonaws.com", self.region);
        let url = format!("https://{host}/?Action=GetCallerIdentity&Version=2011-06-15");

        let mut settings = SigningSettings::default();
        settings.signature_location = SignatureLocation::QueryParams;
        settings.expires_in = Some(PRESIGN_EXPIRES);

        let params = v4::SigningParams::builder()
            .identity(&identity)
            .region(&self.region)
            .name("sts")
            .time(SystemTime::now())
            .settings(settings)
            .build()
            .map_err(|e| Error::token(format!("failed to build signing parameters: {e}")))?;
        let signing_params = params.into();

        let headers = [
            ("host", host.as_str()),
            (CLUSTER_ID_HEADER, self.cluster_name.as_str()),
        ];
        let signable = SignableRequest::new(
            "GET",
            url.as_str(),
            headers.into_iter(),
            SignableBody::Bytes(&[]),
        )
        .map_err(|e| Error::token(format!("failed to assemble signable request: {e}")))?;

        let (instructions, _signature) = sign(signable, &signing_params)
            .map_err(|e| Error::token(format!("failed to presign request: {e}")))?
            .into_parts();

        let mut request = http::Request::builder()
            .method("GET")
            .uri(&url)
            .body(())
            .map_err(|e| Error::token(format!("failed to build presigned request: {e}")))?;
        instructions.apply_to_request_http1x(&mut request);

        let presigned_url = request.uri().to_string();
        Ok(format!(
            "{TOKEN_PREFIX}{}",
            URL_SAFE_NO_PAD.encode(presigned_url.as_bytes())
        ))
    }
}
