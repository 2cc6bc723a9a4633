use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use tokio_util::sync::CancellationToken;
use x509_parser::pem::parse_x509_pem;

use keysystem_auth::test_utils::PolicyFixture;
use keysystem_auth::{AuthMethod, PolicyContext};
use keysystem_client::config::{DownloadConfig, DownloadKind, Span};
use keysystem_client::download::DownloadTask;
use keysystem_client::renewal::{Outcome, RenewalTask};
use keysystem_client::{Auth, ClientConfig, ClientError, ClientState, Keyclient, Keyserver, keys};
use keysystem_core::PolicyError;

/// The real policy engine behind the client's transport seam.
struct InProcessKeyserver {
    ctx: PolicyContext,
    calls: AtomicUsize,
    /// Number of upcoming calls that fail as if the server were down.
    outage: AtomicUsize,
    reject_all: AtomicBool,
    /// Makes every keygrant renewal panic inside the client's task.
    panic_on_renew: AtomicBool,
}

impl InProcessKeyserver {
    fn new(ctx: PolicyContext) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            calls: AtomicUsize::new(0),
            outage: AtomicUsize::new(0),
            reject_all: AtomicBool::new(false),
            panic_on_renew: AtomicBool::new(false),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn enter(&self) -> Result<(), ClientError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self
            .outage
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(ClientError::transient("connection refused"));
        }
        if self.reject_all.load(Ordering::SeqCst) {
            return Err(ClientError::Rejected {
                status: 403,
                message: "revoked".into(),
            });
        }
        Ok(())
    }

    fn caller(&self, auth: &Auth) -> Result<(String, AuthMethod), ClientError> {
        let found = match auth {
            Auth::Token(token) => self
                .ctx
                .authenticate_token(token)
                .map(|a| (a.principal.to_string(), AuthMethod::BootstrapToken)),
            Auth::Keygrant { cert_pem, .. } => {
                let (_, pem) = parse_x509_pem(cert_pem.as_bytes()).unwrap();
                let cert = pem.parse_x509().unwrap();
                let cn = cert
                    .subject()
                    .iter_common_name()
                    .next()
                    .and_then(|cn| cn.as_str().ok())
                    .unwrap_or_default()
                    .to_string();
                self.ctx
                    .authenticate_certificate(&cn)
                    .map(|a| (a.principal.to_string(), AuthMethod::ClientCertificate))
            }
        };
        found.map_err(|_| ClientError::Rejected {
            status: 401,
            message: "invalid credentials".into(),
        })
    }
}

fn to_client_error(err: PolicyError) -> ClientError {
    let status = match err.code() {
        "unauthorized" => 403,
        "not_found" => 404,
        "bad_request" => 400,
        _ => return ClientError::transient(err.to_string()),
    };
    ClientError::Rejected {
        status,
        message: err.to_string(),
    }
}

#[async_trait]
impl Keyserver for InProcessKeyserver {
    async fn whoami(&self, auth: &Auth) -> Result<String, ClientError> {
        self.enter()?;
        Ok(self.caller(auth)?.0)
    }

    async fn invoke(&self, auth: &Auth, api: &str, body: &str) -> Result<String, ClientError> {
        self.enter()?;
        if api == "renew-keygrant" && self.panic_on_renew.load(Ordering::SeqCst) {
            panic!("renewal blew up");
        }
        let (principal, method) = self.caller(auth)?;
        let account = self.ctx.account(&principal).map_err(to_client_error)?;
        self.ctx
            .invoke(account, method, api, body)
            .map_err(to_client_error)
    }

    async fn fetch_static(&self, name: &str) -> Result<String, ClientError> {
        self.enter()?;
        Err(ClientError::Rejected {
            status: 404,
            message: format!("no static file '{name}'"),
        })
    }

    async fn fetch_public(&self, authority: &str) -> Result<String, ClientError> {
        self.enter()?;
        self.ctx
            .authority(authority)
            .map(|a| a.public_material().to_string())
            .map_err(to_client_error)
    }
}

struct Host {
    dir: tempfile::TempDir,
}

impl Host {
    fn new() -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
        }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    fn config(&self, extra: &str) -> ClientConfig {
        self.config_for("https://keyserver.invalid:20557", extra)
    }

    fn config_for(&self, server: &str, extra: &str) -> ClientConfig {
        let root = self.dir.path().display();
        ClientConfig::parse(&format!(
            r#"
server: {server}
authority: {root}/keyserver.pem
keygrant:
  key: {root}/granting.key
  cert: {root}/granting.pem
  token: {root}/bootstrap.token
credentials:
  - kind: ssh
    key: {root}/ssh_host_ed25519_key
    cert: {root}/ssh_host_ed25519_key-cert.pub
    api: grant-ssh
retry:
  initial: 10ms
  max: 40ms
  max-failures: 3
{extra}"#
        ))
        .unwrap()
    }

    fn write_token(&self, ctx: &PolicyContext, principal: &str) {
        let token = ctx.issue_token(principal, Duration::hours(1)).unwrap();
        std::fs::write(self.path("bootstrap.token"), format!("{token}\n")).unwrap();
    }
}

fn common_name(path: &Path) -> String {
    let text = std::fs::read_to_string(path).unwrap();
    let (_, pem) = parse_x509_pem(text.as_bytes()).unwrap();
    let cert = pem.parse_x509().unwrap();
    let cn = cert.subject().iter_common_name().next().unwrap();
    cn.as_str().unwrap().to_string()
}

#[tokio::test]
async fn token_exchange_reaches_keygrant_obtained() {
    let fixture = PolicyFixture::new();
    let host = Host::new();
    let server = InProcessKeyserver::new(fixture.context());
    host.write_token(&server.ctx, "bare.mit.edu");

    let client = Keyclient::new(host.config(""), server.clone());
    client.bootstrap(&CancellationToken::new()).await.unwrap();

    assert_eq!(client.state().current(), ClientState::KeygrantObtained);
    assert!(!host.path("bootstrap.token").exists());
    assert_eq!(common_name(&host.path("granting.pem")), "bare.mit.edu");
    assert_eq!(server.calls(), 2);

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(host.path("granting.key"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}

#[tokio::test]
async fn existing_keygrant_skips_the_token() {
    let fixture = PolicyFixture::new();
    let host = Host::new();
    let server = InProcessKeyserver::new(fixture.context());
    host.write_token(&server.ctx, "bare.mit.edu");
    Keyclient::new(host.config(""), server.clone())
        .bootstrap(&CancellationToken::new())
        .await
        .unwrap();
    let calls = server.calls();

    let restarted = Keyclient::new(host.config(""), server.clone());
    restarted.bootstrap(&CancellationToken::new()).await.unwrap();
    assert_eq!(restarted.state().current(), ClientState::KeygrantObtained);
    assert_eq!(server.calls(), calls);
}

#[tokio::test]
async fn missing_token_fails() {
    let fixture = PolicyFixture::new();
    let host = Host::new();
    let server = InProcessKeyserver::new(fixture.context());

    let client = Keyclient::new(host.config(""), server.clone());
    let err = client.bootstrap(&CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, ClientError::Config(_)));
    assert!(client.state().current().is_failed());
    assert_eq!(server.calls(), 0);
}

#[tokio::test]
async fn rejected_token_is_not_retried() {
    let fixture = PolicyFixture::new();
    let host = Host::new();
    let server = InProcessKeyserver::new(fixture.context());
    std::fs::write(host.path("bootstrap.token"), "forged").unwrap();

    let client = Keyclient::new(host.config(""), server.clone());
    let err = client.bootstrap(&CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, ClientError::Rejected { status: 401, .. }));
    assert!(client.state().current().is_failed());
    assert_eq!(server.calls(), 1);
    assert!(host.path("bootstrap.token").exists());
}

#[tokio::test]
async fn outages_are_retried_until_the_limit() {
    let fixture = PolicyFixture::new();

    let host = Host::new();
    let server = InProcessKeyserver::new(fixture.context());
    host.write_token(&server.ctx, "bare.mit.edu");
    server.outage.store(2, Ordering::SeqCst);
    let client = Keyclient::new(host.config(""), server.clone());
    client.bootstrap(&CancellationToken::new()).await.unwrap();
    assert_eq!(client.state().current(), ClientState::KeygrantObtained);

    let host = Host::new();
    let server = InProcessKeyserver::new(fixture.context());
    host.write_token(&server.ctx, "bare.mit.edu");
    server.outage.store(100, Ordering::SeqCst);
    let client = Keyclient::new(host.config(""), server.clone());
    let err = client.bootstrap(&CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, ClientError::Exhausted { failures: 4, .. }));
    assert!(client.state().current().is_failed());
}

#[tokio::test]
async fn credentials_renew_only_when_due() {
    let fixture = PolicyFixture::new();
    let host = Host::new();
    let server = InProcessKeyserver::new(fixture.context());
    host.write_token(&server.ctx, "bare.mit.edu");
    let config = host.config("");
    Keyclient::new(config.clone(), server.clone())
        .bootstrap(&CancellationToken::new())
        .await
        .unwrap();

    let task = RenewalTask::credential(
        &config.credentials[0],
        &config.keygrant,
        server.clone(),
        config.renew_fraction,
        config.retry,
    );
    let now = Utc::now();
    let first = task.renew_if_due(now).await.unwrap();
    assert!(matches!(first, Outcome::Renewed { .. }));
    let cert = std::fs::read_to_string(host.path("ssh_host_ed25519_key-cert.pub")).unwrap();
    let cert = ssh_key::Certificate::from_openssh(cert.trim()).unwrap();
    assert_eq!(cert.valid_principals(), ["bare.mit.edu", "bare"]);

    let calls = server.calls();
    assert!(matches!(
        task.renew_if_due(now + Duration::hours(1)).await.unwrap(),
        Outcome::NotDue { .. }
    ));
    assert_eq!(server.calls(), calls);

    assert!(matches!(
        task.renew_if_due(now + Duration::hours(13)).await.unwrap(),
        Outcome::Renewed { .. }
    ));
    assert_eq!(server.calls(), calls + 1);
}

#[tokio::test]
async fn downloads_rewrite_only_on_change() {
    let fixture = PolicyFixture::new();
    let host = Host::new();
    let server = InProcessKeyserver::new(fixture.context());
    host.write_token(&server.ctx, "bare.mit.edu");
    let config = host.config("");
    Keyclient::new(config.clone(), server.clone())
        .bootstrap(&CancellationToken::new())
        .await
        .unwrap();

    let node_config = DownloadConfig {
        kind: DownloadKind::Grant,
        name: "node-config".into(),
        path: host.path("node.conf"),
        refresh_period: Span(Duration::hours(1)),
        mode: 0o644,
    };
    let task = DownloadTask::new(&node_config, &config.keygrant, server.clone(), config.retry);
    assert!(task.refresh_once().await.unwrap());
    assert!(!task.refresh_once().await.unwrap());
    assert_eq!(std::fs::read_to_string(host.path("node.conf")).unwrap(), "HOST_NODE=bare\n");

    let pubkey = DownloadConfig {
        kind: DownloadKind::Pubkey,
        name: "ssh-host".into(),
        path: host.path("ssh_host_ca.pub"),
        refresh_period: Span(Duration::hours(1)),
        mode: 0o644,
    };
    let task = DownloadTask::new(&pubkey, &config.keygrant, server.clone(), config.retry);
    assert!(task.refresh_once().await.unwrap());
    assert_eq!(
        std::fs::read_to_string(host.path("ssh_host_ca.pub")).unwrap(),
        fixture.authority("ssh-host").cert_pem
    );
}

async fn wait_for_state(client: &Keyclient, wanted: impl Fn(&ClientState) -> bool) {
    let mut rx = client.state().subscribe();
    tokio::time::timeout(StdDuration::from_secs(10), rx.wait_for(|s| wanted(s)))
        .await
        .expect("state not reached in time")
        .unwrap();
}

#[tokio::test]
async fn steady_renewal_runs_until_cancelled() {
    let fixture = PolicyFixture::new();
    let host = Host::new();
    let server = InProcessKeyserver::new(fixture.context());
    host.write_token(&server.ctx, "bare.mit.edu");

    let client = Arc::new(Keyclient::new(host.config(""), server.clone()));
    let cancel = CancellationToken::new();
    let running = {
        let client = Arc::clone(&client);
        let cancel = cancel.clone();
        tokio::spawn(async move { client.run(cancel).await })
    };

    wait_for_state(&client, |s| *s == ClientState::SteadyRenewal).await;
    let ssh_cert = host.path("ssh_host_ed25519_key-cert.pub");
    tokio::time::timeout(StdDuration::from_secs(10), async {
        while !ssh_cert.exists() {
            tokio::time::sleep(StdDuration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    cancel.cancel();
    running.await.unwrap().unwrap();
    assert_eq!(client.state().current(), ClientState::SteadyRenewal);
}

/// Bootstrap, then swap in a keygranting certificate that is due for renewal.
async fn install_aged_keygrant(host: &Host, server: &Arc<InProcessKeyserver>, config: &ClientConfig) {
    Keyclient::new(config.clone(), server.clone())
        .bootstrap(&CancellationToken::new())
        .await
        .unwrap();

    let csr = {
        let key = keys::load_or_generate_tls(&host.path("granting.key")).unwrap();
        keys::tls_request(&key, &[]).unwrap()
    };
    let account = server.ctx.account("bare.mit.edu").unwrap();
    let aged = server
        .ctx
        .invoke_at(
            account,
            AuthMethod::ClientCertificate,
            "renew-keygrant",
            &csr,
            Utc::now() - Duration::hours(20),
        )
        .unwrap();
    std::fs::write(host.path("granting.pem"), aged).unwrap();
}

#[tokio::test]
async fn losing_the_keygrant_stops_every_task() {
    let fixture = PolicyFixture::new();
    let host = Host::new();
    let server = InProcessKeyserver::new(fixture.context());
    host.write_token(&server.ctx, "bare.mit.edu");
    let config = host.config("");
    install_aged_keygrant(&host, &server, &config).await;
    server.reject_all.store(true, Ordering::SeqCst);

    let client = Keyclient::new(config, server.clone());
    let err = client.run(CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, ClientError::Rejected { status: 403, .. }));
    assert!(client.state().current().is_failed());
}

#[tokio::test]
async fn a_panicking_keygrant_task_is_fatal() {
    let fixture = PolicyFixture::new();
    let host = Host::new();
    let server = InProcessKeyserver::new(fixture.context());
    host.write_token(&server.ctx, "bare.mit.edu");
    let config = host.config("");
    install_aged_keygrant(&host, &server, &config).await;
    server.panic_on_renew.store(true, Ordering::SeqCst);

    let client = Keyclient::new(config, server.clone());
    let err = tokio::time::timeout(StdDuration::from_secs(10), client.run(CancellationToken::new()))
        .await
        .expect("run kept going after the keygrant task died")
        .unwrap_err();
    assert!(
        matches!(&err, ClientError::Panicked { task } if task == "renew-keygrant"),
        "{err}"
    );
    assert!(client.state().current().is_failed());
}

/// The whole exchange over mutual TLS against a running keyserver.
#[tokio::test]
async fn bootstraps_against_a_live_keyserver() {
    use keysystem_auth::PolicyHandle;
    use keysystem_server::tls::{self, ServerIdentity};
    use keysystem_server::{AppState, build_app, server};
    use tokio_rustls::TlsAcceptor;

    let _ = rustls::crypto::ring::default_provider().install_default();
    let fixture = PolicyFixture::new();
    let policy = Arc::new(PolicyHandle::new(fixture.context()));
    let identity = Arc::new(
        ServerIdentity::issue(
            &policy.snapshot(),
            vec!["localhost".into(), "127.0.0.1".into()],
            Duration::hours(1),
        )
        .unwrap(),
    );
    let acceptor = TlsAcceptor::from(Arc::new(
        tls::server_config(&policy.snapshot(), identity).unwrap(),
    ));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    let app = build_app(AppState::new(Arc::clone(&policy)));
    tokio::spawn(server::serve_tls(listener, acceptor, app, shutdown.clone()));

    let host = Host::new();
    std::fs::write(
        host.path("keyserver.pem"),
        &fixture.authority("servertls").cert_pem,
    )
    .unwrap();
    host.write_token(&policy.snapshot(), "bare.mit.edu");
    let config = host.config_for(
        &format!("https://{addr}"),
        &format!(
            "downloads:\n  - kind: grant\n    name: node-config\n    path: {}\n    refresh-period: 1h\n",
            host.path("node.conf").display()
        ),
    );

    let client = Arc::new(Keyclient::connect(config).unwrap());
    let cancel = CancellationToken::new();
    let running = {
        let client = Arc::clone(&client);
        let cancel = cancel.clone();
        tokio::spawn(async move { client.run(cancel).await })
    };

    wait_for_state(&client, |s| *s == ClientState::SteadyRenewal).await;
    let node_conf = host.path("node.conf");
    tokio::time::timeout(StdDuration::from_secs(10), async {
        while !node_conf.exists() {
            tokio::time::sleep(StdDuration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(std::fs::read_to_string(&node_conf).unwrap(), "HOST_NODE=bare\n");
    assert_eq!(common_name(&host.path("granting.pem")), "bare.mit.edu");

    cancel.cancel();
    running.await.unwrap().unwrap();
    shutdown.cancel();
}
