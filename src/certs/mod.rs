//! TLS certificate provisioning and the SNI serving hook.
//!
//! One certificate per unique `http_route` host, obtained through the
//! configured [`Issuer`], cached on disk under `<data>/certs` and in memory
//! for the handshake path. Renewal happens when less than thirty days of
//! validity remain; route deletion retains the certificate (it may cover
//! other routes or come back).

pub mod acme;
pub mod dns;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rcgen::{CertificateParams, KeyPair};
use rustls::pki_types::PrivateKeyDer;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use tracing::{info, warn};
use x509_parser::prelude::*;

use crate::context::Context;
use crate::entity::Id;
use crate::error::{Error, Result};
use crate::model::Kinded;
use crate::model::ingress::HttpRoute;
use crate::reconcile::{self, Controller, ControllerHandle, Meta};
use crate::store::EntityStore;

const RENEW_WINDOW_DAYS: i64 = 30;

/* ============================= ISSUER ============================= */

/// PEM material for one freshly issued host certificate (bundled chain).
pub struct IssuedCert {
    pub cert_pem: String,
    pub key_pem: String,
}

/// Obtains certificates; the production implementation is
/// [`acme::AcmeIssuer`].
#[async_trait]
pub trait Issuer: Send + Sync + 'static {
    async fn obtain(&self, ctx: &Context, host: &str) -> Result<IssuedCert>;
}

/// Self-signed issuance for development setups without ACME reachability.
pub struct SelfSignedIssuer;

#[async_trait]
impl Issuer for SelfSignedIssuer {
    async fn obtain(&self, ctx: &Context, host: &str) -> Result<IssuedCert> {
        ctx.check()?;
        let key = KeyPair::generate().map_err(Error::provider)?;
        let params = CertificateParams::new(vec![host.to_string()]).map_err(Error::provider)?;
        let cert = params.self_signed(&key).map_err(Error::provider)?;
        Ok(IssuedCert {
            cert_pem: cert.pem(),
            key_pem: key.serialize_pem(),
        })
    }
}

/// Issuer selection made at startup from the serve configuration.
pub enum AcmeOrSelfSigned {
    Acme(Arc<acme::AcmeIssuer>),
    SelfSigned(Arc<SelfSignedIssuer>),
}

impl AcmeOrSelfSigned {
    pub fn into_issuer(self) -> Arc<dyn Issuer> {
        match self {
            AcmeOrSelfSigned::Acme(issuer) => issuer,
            AcmeOrSelfSigned::SelfSigned(issuer) => issuer,
        }
    }
}

/// Build the configured issuer: ACME when a directory URL is given (failing
/// init on a bad DNS provider rather than starting half-configured),
/// self-signed otherwise.
pub async fn issuer_from_args(
    dir: &Path,
    acme_directory: Option<&str>,
    contacts: &[String],
    dns_provider: &str,
    dns_settle: std::time::Duration,
) -> Result<AcmeOrSelfSigned> {
    match acme_directory {
        Some(directory_url) => {
            let provider = dns::by_name(dns_provider, dns_settle)?;
            let issuer = acme::AcmeIssuer::init(dir, directory_url, contacts, provider).await?;
            Ok(AcmeOrSelfSigned::Acme(Arc::new(issuer)))
        }
        None => Ok(AcmeOrSelfSigned::SelfSigned(Arc::new(SelfSignedIssuer))),
    }
}

/* ============================= CACHE ============================= */

struct CachedCert {
    certified: Arc<CertifiedKey>,
    not_after: DateTime<Utc>,
}

pub struct CertStore {
    dir: PathBuf,
    issuer: Arc<dyn Issuer>,
    cache: RwLock<HashMap<String, CachedCert>>,
}

impl CertStore {
    pub fn new(dir: impl AsRef<Path>, issuer: Arc<dyn Issuer>) -> Arc<Self> {
        Arc::new(Self {
            dir: dir.as_ref().to_path_buf(),
            issuer,
            cache: RwLock::new(HashMap::new()),
        })
    }

    /// Create the state dir and load every `<host>.crt` + `<host>.key`
    /// pair on disk into the cache. Returns how many loaded.
    pub fn init(&self) -> Result<usize> {
        std::fs::create_dir_all(&self.dir)
            .map_err(|e| Error::Provider(format!("create cert dir: {e}")))?;
        let mut loaded = 0;
        let entries = std::fs::read_dir(&self.dir)
            .map_err(|e| Error::Provider(format!("read cert dir: {e}")))?;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("crt") {
                continue;
            }
            let Some(host) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
                continue;
            };
            let key_path = self.key_path(&host);
            if !key_path.exists() {
                warn!(host = %host, "cert_without_key_skipped");
                continue;
            }
            match self.load_pair(&path, &key_path) {
                Ok(cached) => {
                    self.cache
                        .write()
                        .expect("cert cache lock")
                        .insert(host.clone(), cached);
                    loaded += 1;
                }
                Err(err) => warn!(host = %host, error = %err, "cert_load_failed"),
            }
        }
        info!(loaded, dir = %self.dir.display(), "cert_cache_initialized");
        Ok(loaded)
    }

    fn cert_path(&self, host: &str) -> PathBuf {
        self.dir.join(format!("{host}.crt"))
    }

    fn key_path(&self, host: &str) -> PathBuf {
        self.dir.join(format!("{host}.key"))
    }

    /// Ensure a usable certificate for `host`: skip when the cached one is
    /// valid for more than thirty days, otherwise obtain, persist and cache.
    pub async fn reconcile_host(&self, ctx: &Context, host: &str) -> Result<()> {
        if host.is_empty() {
            return Ok(());
        }
        let host = host.to_lowercase();

        let renew_after = Utc::now() + ChronoDuration::days(RENEW_WINDOW_DAYS);
        {
            let cache = self.cache.read().expect("cert cache lock");
            if let Some(cached) = cache.get(&host)
                && cached.not_after > renew_after
            {
                return Ok(());
            }
        }

        let issued = self.issuer.obtain(ctx, &host).await?;

        let cert_path = self.cert_path(&host);
        let key_path = self.key_path(&host);
        std::fs::write(&cert_path, &issued.cert_pem)
            .map_err(|e| Error::Provider(format!("write {}: {e}", cert_path.display())))?;
        set_cert_permissions(&cert_path);
        std::fs::write(&key_path, &issued.key_pem)
            .map_err(|e| Error::Provider(format!("write {}: {e}", key_path.display())))?;
        acme::set_key_permissions(&key_path);

        let cached = build_cached(issued.cert_pem.as_bytes(), issued.key_pem.as_bytes())?;
        info!(host = %host, not_after = %cached.not_after, "cert_cached");
        self.cache
            .write()
            .expect("cert cache lock")
            .insert(host, cached);
        Ok(())
    }

    fn load_pair(&self, cert_path: &Path, key_path: &Path) -> Result<CachedCert> {
        let cert_pem = std::fs::read(cert_path)
            .map_err(|e| Error::Provider(format!("read {}: {e}", cert_path.display())))?;
        let key_pem = std::fs::read(key_path)
            .map_err(|e| Error::Provider(format!("read {}: {e}", key_path.display())))?;
        build_cached(&cert_pem, &key_pem)
    }

    /// The TLS `GetCertificate` hook, by SNI.
    pub fn get_certificate(&self, sni: &str) -> Result<Arc<CertifiedKey>> {
        let cache = self.cache.read().expect("cert cache lock");
        let Some(cached) = cache.get(&sni.to_lowercase()) else {
            return Err(Error::NotFound(Id::new(sni)));
        };
        if cached.not_after <= Utc::now() {
            return Err(Error::Provider(format!("certificate expired for {sni}")));
        }
        Ok(cached.certified.clone())
    }

    /// Expiry of the cached certificate for `host`, if any.
    pub fn not_after(&self, host: &str) -> Option<DateTime<Utc>> {
        self.cache
            .read()
            .expect("cert cache lock")
            .get(&host.to_lowercase())
            .map(|c| c.not_after)
    }

    #[cfg(test)]
    fn force_not_after(&self, host: &str, not_after: DateTime<Utc>) {
        if let Some(cached) = self
            .cache
            .write()
            .expect("cert cache lock")
            .get_mut(&host.to_lowercase())
        {
            cached.not_after = not_after;
        }
    }
}

fn build_cached(cert_pem: &[u8], key_pem: &[u8]) -> Result<CachedCert> {
    let certs: Vec<_> = rustls_pemfile::certs(&mut &cert_pem[..])
        .collect::<std::io::Result<_>>()
        .map_err(|e| Error::Provider(format!("parse certificate pem: {e}")))?;
    if certs.is_empty() {
        return Err(Error::Provider("certificate pem carries no certificates".into()));
    }
    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut &key_pem[..])
        .map_err(|e| Error::Provider(format!("parse key pem: {e}")))?
        .ok_or_else(|| Error::Provider("key pem carries no private key".into()))?;

    let (_, parsed) = parse_x509_certificate(certs[0].as_ref())
        .map_err(|e| Error::Provider(format!("parse certificate der: {e}")))?;
    let not_after = DateTime::from_timestamp(parsed.validity().not_after.timestamp(), 0)
        .ok_or_else(|| Error::Provider("certificate expiry out of range".into()))?;

    let signing_key = rustls::crypto::ring::sign::any_supported_type(&key)
        .map_err(|e| Error::Provider(format!("unsupported key type: {e}")))?;
    Ok(CachedCert {
        certified: Arc::new(CertifiedKey::new(certs, signing_key)),
        not_after,
    })
}

#[cfg(unix)]
fn set_cert_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o644));
}

#[cfg(not(unix))]
fn set_cert_permissions(_path: &Path) {}

/* ============================= TLS RESOLVER ============================= */

/// rustls server-side resolver backed by the cert cache. Lookup failures
/// surface as a TLS alert, never an HTTP response.
pub struct SniResolver {
    certs: Arc<CertStore>,
}

impl SniResolver {
    pub fn new(certs: Arc<CertStore>) -> Arc<Self> {
        Arc::new(Self { certs })
    }
}

impl std::fmt::Debug for SniResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SniResolver")
    }
}

impl ResolvesServerCert for SniResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let sni = client_hello.server_name()?;
        match self.certs.get_certificate(sni) {
            Ok(certified) => Some(certified),
            Err(err) => {
                warn!(sni = %sni, error = %err, "tls_certificate_lookup_failed");
                None
            }
        }
    }
}

/// A server config whose certificate selection runs through the cache.
pub fn server_config(certs: Arc<CertStore>) -> Result<rustls::ServerConfig> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::Provider(format!("tls protocol versions: {e}")))?
        .with_no_client_auth()
        .with_cert_resolver(SniResolver::new(certs));
    Ok(config)
}

/* ============================= CONTROLLER ============================= */

/// Reconciles `http_route` entities into cached certificates.
struct CertController {
    certs: Arc<CertStore>,
}

#[async_trait]
impl Controller<HttpRoute> for CertController {
    async fn create(&self, ctx: &Context, obj: HttpRoute, _meta: Meta) -> Result<()> {
        self.certs.reconcile_host(ctx, &obj.host).await
    }

    async fn delete(&self, _ctx: &Context, id: Id) -> Result<()> {
        // The certificate may cover other routes or be reused; retain it.
        info!(route = %id, "cert_retained_after_route_delete");
        Ok(())
    }
}

/// Keep certificates provisioned for every routed host.
pub fn watch(certs: Arc<CertStore>, store: &EntityStore, ctx: &Context) -> Result<ControllerHandle> {
    reconcile::run::<HttpRoute, _>(store, Arc::new(CertController { certs }), ctx)
}

/* ============================= TESTS ============================= */
