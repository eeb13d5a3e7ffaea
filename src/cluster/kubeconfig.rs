//! Static-config connector flavor
//!
//! Builds a [`Connector`] from a standard multi-context kubeconfig document,
//! supplied either as a file path or an inline base64-encoded blob. The
//! currently selected context determines the server URL, CA data, and user
//! credential.

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use kube::config::{KubeConfigOptions, Kubeconfig};
use secrecy::ExposeSecret;

use super::{Connector, ConnectorAuth};
use crate::config::{ClusterConfig, KubeconfigConfig};
use crate::error::Error;

pub(super) async fn build(cfg: &ClusterConfig) -> Result<Connector, Error> {
    let source = cfg
        .kubeconfig
        .as_ref()
        .ok_or_else(|| Error::cluster("kubeconfig config is required for static-config type"))?;

    let kubeconfig = load_document(source)?;

    let kube_config = kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| Error::cluster(format!("failed to interpret kubeconfig: {e}")))?;

    let base_url = kube_config.cluster_url.to_string();
    let base_url = base_url.trim_end_matches('/').to_string();

    let (http, auth) = tunnel_client_from(&kube_config)?;

    let kube = kube::Client::try_from(kube_config)
        .map_err(|e| Error::cluster(format!("failed to create kubernetes client: {e}")))?;

    Ok(Connector::from_parts(cfg, kube, http, base_url, auth))
}

/// Read and parse the kubeconfig document from its configured source.
fn load_document(source: &KubeconfigConfig) -> Result<Kubeconfig, Error> {
    if let Some(data) = &source.data {
        let bytes = BASE64_STANDARD
            .decode(data)
            .map_err(|e| Error::cluster(format!("failed to decode kubeconfig data: {e}")))?;
        let text = String::from_utf8(bytes)
            .map_err(|e| Error::cluster(format!("kubeconfig data is not valid UTF-8: {e}")))?;
        Kubeconfig::from_yaml(&text)
            .map_err(|e| Error::cluster(format!("failed to parse kubeconfig data: {e}")))
    } else if let Some(path) = &source.path {
        Kubeconfig::read_from(path)
            .map_err(|e| Error::cluster(format!("failed to read kubeconfig file {path}: {e}")))
    } else {
        Err(Error::cluster(
            "either kubeconfig.path or kubeconfig.data is required",
        ))
    }
}

/// Build the raw tunnel transport from the resolved kube configuration,
/// carrying over CA roots, TLS client identity, and user credentials.
fn tunnel_client_from(config: &kube::Config) -> Result<(reqwest::Client, ConnectorAuth), Error> {
    let mut builder = super::http_client_builder();

    if let Some(chain) = &config.root_cert {
        for der in chain {
            let cert = reqwest::Certificate::from_der(der)
                .map_err(|e| Error::cluster(format!("invalid CA certificate: {e}")))?;
            builder = builder.add_root_certificate(cert);
        }
    }

    if config.accept_invalid_certs {
        builder = builder.danger_accept_invalid_certs(true);
    }

    let auth_info = &config.auth_info;
    if let Some(identity_pem) = client_identity_pem(auth_info)? {
        let identity = reqwest::Identity::from_pem(&identity_pem)
            .map_err(|e| Error::cluster(format!("invalid client certificate identity: {e}")))?;
        builder = builder.identity(identity);
    }

    let auth = if let Some(token) = &auth_info.token {
        ConnectorAuth::Bearer(token.expose_secret().to_string())
    } else if let Some(token_file) = &auth_info.token_file {
        let token = std::fs::read_to_string(token_file)
            .map_err(|e| Error::cluster(format!("failed to read token file {token_file}: {e}")))?;
        ConnectorAuth::Bearer(token.trim().to_string())
    } else if let (Some(username), Some(password)) = (&auth_info.username, &auth_info.password) {
        ConnectorAuth::Basic {
            username: username.clone(),
            password: password.expose_secret().to_string(),
        }
    } else {
        ConnectorAuth::None
    };

    let client = builder
        .build()
        .map_err(|e| Error::cluster(format!("failed to build tunnel client: {e}")))?;

    Ok((client, auth))
}

/// Assemble the PEM bundle (certificate + key) for the client identity, from
/// inline base64 data or file references.
fn client_identity_pem(auth_info: &kube::config::AuthInfo) -> Result<Option<Vec<u8>>, Error> {
    let cert_pem = if let Some(data) = &auth_info.client_certificate_data {
        Some(BASE64_STANDARD.decode(data).map_err(|e| {
            Error::cluster(format!("failed to decode client certificate data: {e}"))
        })?)
    } else if let Some(path) = &auth_info.client_certificate {
        Some(std::fs::read(path).map_err(|e| {
            Error::cluster(format!("failed to read client certificate {path}: {e}"))
        })?)
    } else {
        None
    };

    let key_pem = if let Some(data) = &auth_info.client_key_data {
        Some(
            BASE64_STANDARD
                .decode(data.expose_secret())
                .map_err(|e| Error::cluster(format!("failed to decode client key data: {e}")))?,
        )
    } else if let Some(path) = &auth_info.client_key {
        Some(
            std::fs::read(path)
                .map_err(|e| Error::cluster(format!("failed to read client key {path}: {e}")))?,
        )
    } else {
        None
    };

    match (cert_pem, key_pem) {
        (Some(cert), Some(key)) => {
            let mut bundle = cert;
            bundle.push(b'\n');
            bundle.extend_from_slice(&key);
            Ok(Some(bundle))
        }
        (None, None) => Ok(None),
        _ => Err(Error::cluster(
            "client certificate and key must be provided together",
        )),
    }
}
