//! Talking to the keyserver.

use std::error::Error as StdError;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Certificate, Client, Identity, RequestBuilder, Response};
use rustls::AlertDescription;
use serde::{Deserialize, Serialize};
use tracing::debug;

use keysystem_infra::read_optional;

use crate::config::KeygrantConfig;
use crate::error::ClientError;

/// How a request authenticates.
#[derive(Clone)]
pub enum Auth {
    /// Bootstrap token, sent as a bearer header.
    Token(String),
    /// Keygranting certificate and key, presented at the TLS handshake.
    Keygrant { cert_pem: String, key_pem: String },
}

impl std::fmt::Debug for Auth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Auth::Token(_) => f.write_str("Auth::Token(..)"),
            Auth::Keygrant { .. } => f.write_str("Auth::Keygrant(..)"),
        }
    }
}

impl Auth {
    /// The keygranting certificate and key currently on disk.
    pub fn from_keygrant(config: &KeygrantConfig) -> Result<Self, ClientError> {
        let missing = |path: &std::path::Path| {
            ClientError::key(format!("no keygranting material at {}", path.display()))
        };
        let cert_pem = read_optional(&config.cert)?.ok_or_else(|| missing(&config.cert))?;
        let key_pem = read_optional(&config.key)?.ok_or_else(|| missing(&config.key))?;
        Ok(Auth::Keygrant { cert_pem, key_pem })
    }
}

#[async_trait]
pub trait Keyserver: Send + Sync {
    /// The principal the keyserver sees for `auth`.
    async fn whoami(&self, auth: &Auth) -> Result<String, ClientError>;

    /// Invoke one grant and return its result.
    async fn invoke(&self, auth: &Auth, api: &str, body: &str) -> Result<String, ClientError>;

    async fn fetch_static(&self, name: &str) -> Result<String, ClientError>;

    async fn fetch_public(&self, authority: &str) -> Result<String, ClientError>;
}

#[derive(Serialize)]
struct ApiRequest<'a> {
    api: &'a str,
    body: &'a str,
}

#[derive(Deserialize)]
struct WhoamiResponse {
    principal: String,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: String,
}

/// [`Keyserver`] over HTTPS, trusting only the configured authority.
pub struct HttpKeyserver {
    base_url: String,
    root: Certificate,
    timeout: Duration,
    anonymous: Client,
    // Client bound to the last keygranting certificate we presented.
    keygrant: Mutex<Option<(String, Client)>>,
}

impl HttpKeyserver {
    pub fn new(base_url: &str, authority_pem: &str, timeout: Duration) -> Result<Self, ClientError> {
        let root = Certificate::from_pem(authority_pem.as_bytes())
            .map_err(|e| ClientError::config(format!("invalid keyserver authority: {e}")))?;
        let anonymous = builder(&root, timeout)
            .build()
            .map_err(|e| ClientError::config(e.to_string()))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            root,
            timeout,
            anonymous,
            keygrant: Mutex::new(None),
        })
    }

    fn client_for(&self, auth: &Auth) -> Result<Client, ClientError> {
        let Auth::Keygrant { cert_pem, key_pem } = auth else {
            return Ok(self.anonymous.clone());
        };

        let mut cached = self.keygrant.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some((cert, client)) = cached.as_ref() {
            if cert == cert_pem {
                return Ok(client.clone());
            }
        }

        let identity = Identity::from_pem(format!("{cert_pem}\n{key_pem}").as_bytes())
            .map_err(|e| ClientError::key(format!("unusable keygranting certificate: {e}")))?;
        let client = builder(&self.root, self.timeout)
            .identity(identity)
            .build()
            .map_err(|e| ClientError::key(e.to_string()))?;
        *cached = Some((cert_pem.clone(), client.clone()));
        Ok(client)
    }

    fn request(&self, auth: &Auth, req: RequestBuilder) -> RequestBuilder {
        match auth {
            Auth::Token(token) => req.bearer_auth(token),
            Auth::Keygrant { .. } => req,
        }
    }
}

fn builder(root: &Certificate, timeout: Duration) -> reqwest::ClientBuilder {
    Client::builder()
        .use_rustls_tls()
        .tls_built_in_root_certs(false)
        .add_root_certificate(root.clone())
        .timeout(timeout)
}

/// Connection failures, timeouts and 5xx are transient; certificate failures
/// during the handshake and other statuses are the keyserver's final answer.
async fn check(res: Result<Response, reqwest::Error>) -> Result<Response, ClientError> {
    let res = res.map_err(|e| match certificate_failure(&e) {
        Some(tls) => ClientError::Handshake(tls.to_string()),
        None => ClientError::transient(e.to_string()),
    })?;
    let status = res.status();
    if status.is_success() {
        return Ok(res);
    }

    let text = res.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorBody>(&text)
        .map(|body| body.message)
        .unwrap_or(text);
    debug!(status = status.as_u16(), %message, "keyserver returned an error");
    if status.is_server_error() {
        Err(ClientError::transient(format!("{status}: {message}")))
    } else {
        Err(ClientError::Rejected {
            status: status.as_u16(),
            message,
        })
    }
}

#[async_trait]
impl Keyserver for HttpKeyserver {
    async fn whoami(&self, auth: &Auth) -> Result<String, ClientError> {
        let client = self.client_for(auth)?;
        let req = self.request(auth, client.get(format!("{}/whoami", self.base_url)));
        let body: WhoamiResponse = check(req.send().await)
            .await?
            .json()
            .await
            .map_err(|e| ClientError::transient(e.to_string()))?;
        Ok(body.principal)
    }

    async fn invoke(&self, auth: &Auth, api: &str, body: &str) -> Result<String, ClientError> {
        let client = self.client_for(auth)?;
        let req = self
            .request(auth, client.post(format!("{}/apirequest", self.base_url)))
            .json(&[ApiRequest { api, body }]);
        let results: Vec<String> = check(req.send().await)
            .await?
            .json()
            .await
            .map_err(|e| ClientError::transient(e.to_string()))?;
        results
            .into_iter()
            .next()
            .ok_or_else(|| ClientError::transient("keyserver returned an empty batch"))
    }

    async fn fetch_static(&self, name: &str) -> Result<String, ClientError> {
        let url = format!("{}/static/{name}", self.base_url);
        check(self.anonymous.get(url).send().await)
            .await?
            .text()
            .await
            .map_err(|e| ClientError::transient(e.to_string()))
    }

    async fn fetch_public(&self, authority: &str) -> Result<String, ClientError> {
        let url = format!("{}/pub/{authority}", self.base_url);
        check(self.anonymous.get(url).send().await)
            .await?
            .text()
            .await
            .map_err(|e| ClientError::transient(e.to_string()))
    }
}

/// The rustls certificate error somewhere in `err`'s source chain, if any.
/// `io::Error` hides its payload from `source()`, so it is unwrapped here.
fn certificate_failure<'a>(err: &'a (dyn StdError + 'static)) -> Option<&'a rustls::Error> {
    let mut next = Some(err);
    while let Some(err) = next {
        let tls = err.downcast_ref::<rustls::Error>().or_else(|| {
            err.downcast_ref::<std::io::Error>()
                .and_then(|io| io.get_ref())
                .and_then(|inner| inner.downcast_ref::<rustls::Error>())
        });
        if let Some(tls) = tls.filter(|tls| is_certificate_failure(tls)) {
            return Some(tls);
        }
        next = err.source();
    }
    None
}

fn is_certificate_failure(err: &rustls::Error) -> bool {
    matches!(
        err,
        rustls::Error::InvalidCertificate(_)
            | rustls::Error::NoCertificatesPresented
            | rustls::Error::AlertReceived(
                AlertDescription::BadCertificate
                    | AlertDescription::UnsupportedCertificate
                    | AlertDescription::CertificateRevoked
                    | AlertDescription::CertificateExpired
                    | AlertDescription::CertificateUnknown
                    | AlertDescription::CertificateRequired
                    | AlertDescription::UnknownCA
                    | AlertDescription::AccessDenied
            )
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fmt;

    /// Stand-in for the hyper/reqwest layers wrapping the socket error.
    #[derive(Debug)]
    struct Wrapped(std::io::Error);

    impl fmt::Display for Wrapped {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("error sending request")
        }
    }

    impl StdError for Wrapped {
        fn source(&self) -> Option<&(dyn StdError + 'static)> {
            Some(&self.0)
        }
    }

    fn wrapped(tls: rustls::Error) -> Wrapped {
        Wrapped(std::io::Error::new(std::io::ErrorKind::InvalidData, tls))
    }

    #[test]
    fn refused_client_certificates_are_found_through_io_errors() {
        let err = wrapped(rustls::Error::AlertReceived(AlertDescription::BadCertificate));
        assert_eq!(
            certificate_failure(&err),
            Some(&rustls::Error::AlertReceived(AlertDescription::BadCertificate))
        );

        let err = wrapped(rustls::Error::InvalidCertificate(
            rustls::CertificateError::UnknownIssuer,
        ));
        assert!(certificate_failure(&err).is_some());
    }

    #[test]
    fn other_failures_stay_transient() {
        let err = wrapped(rustls::Error::AlertReceived(AlertDescription::HandshakeFailure));
        assert_eq!(certificate_failure(&err), None);

        let refused = Wrapped(std::io::Error::from(std::io::ErrorKind::ConnectionRefused));
        assert_eq!(certificate_failure(&refused), None);
    }
}
