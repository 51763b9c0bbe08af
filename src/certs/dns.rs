//! DNS-01 record publication providers.
//!
//! Providers are wired by name at startup; an unknown name fails
//! certificate init so the process starts without HTTPS rather than
//! half-configured.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use crate::context::Context;
use crate::error::{Error, Result};

/// Publishes and withdraws the `_acme-challenge` TXT records that prove
/// domain control.
#[async_trait]
pub trait DnsProvider: std::fmt::Debug + Send + Sync + 'static {
    fn name(&self) -> &'static str;

    async fn set_txt(&self, ctx: &Context, fqdn: &str, value: &str) -> Result<()>;

    async fn clear_txt(&self, ctx: &Context, fqdn: &str) -> Result<()>;
}

/// Resolve a provider by its configured name.
pub fn by_name(name: &str, settle: Duration) -> Result<Arc<dyn DnsProvider>> {
    match name {
        "manual" => Ok(Arc::new(ManualDns { settle })),
        "memory" => Ok(Arc::new(MemoryDns::new())),
        other => Err(Error::Provider(format!("unknown dns provider {other}"))),
    }
}

/* ============================= MANUAL ============================= */

/// Logs the record for the operator to publish out of band, then waits a
/// settle period before the challenge is announced ready.
#[derive(Debug)]
pub struct ManualDns {
    settle: Duration,
}

#[async_trait]
impl DnsProvider for ManualDns {
    fn name(&self) -> &'static str {
        "manual"
    }

    async fn set_txt(&self, ctx: &Context, fqdn: &str, value: &str) -> Result<()> {
        info!(record = %fqdn, value = %value, "dns_txt_record_required");
        tokio::select! {
            _ = tokio::time::sleep(self.settle) => Ok(()),
            _ = ctx.cancelled() => Err(Error::Canceled),
        }
    }

    async fn clear_txt(&self, _ctx: &Context, fqdn: &str) -> Result<()> {
        info!(record = %fqdn, "dns_txt_record_removable");
        Ok(())
    }
}

/* ============================= MEMORY ============================= */

/// In-process record table; the test provider.
#[derive(Debug, Default)]
pub struct MemoryDns {
    records: Mutex<HashMap<String, String>>,
}

impl MemoryDns {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, fqdn: &str) -> Option<String> {
        self.records.lock().expect("dns records lock").get(fqdn).cloned()
    }
}

#[async_trait]
impl DnsProvider for MemoryDns {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn set_txt(&self, ctx: &Context, fqdn: &str, value: &str) -> Result<()> {
        ctx.check()?;
        self.records
            .lock()
            .expect("dns records lock")
            .insert(fqdn.to_string(), value.to_string());
        Ok(())
    }

    async fn clear_txt(&self, ctx: &Context, fqdn: &str) -> Result<()> {
        ctx.check()?;
        self.records.lock().expect("dns records lock").remove(fqdn);
        Ok(())
    }
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_by_name_resolves_known_providers() {
        assert_eq!(by_name("manual", Duration::ZERO).unwrap().name(), "manual");
        assert_eq!(by_name("memory", Duration::ZERO).unwrap().name(), "memory");
    }

    #[test]
    fn test_by_name_unknown_is_provider_error() {
        let err = by_name("route53", Duration::ZERO).unwrap_err();
        assert!(matches!(err, Error::Provider(_)));
        assert!(err.to_string().contains("route53"));
    }

    #[tokio::test]
    async fn test_memory_provider_roundtrip() {
        let dns = MemoryDns::new();
        let ctx = Context::background();
        dns.set_txt(&ctx, "_acme-challenge.example.test", "token-value")
            .await
            .unwrap();
        assert_eq!(
            dns.lookup("_acme-challenge.example.test").as_deref(),
            Some("token-value")
        );
        dns.clear_txt(&ctx, "_acme-challenge.example.test").await.unwrap();
        assert!(dns.lookup("_acme-challenge.example.test").is_none());
    }

    #[tokio::test]
    async fn test_manual_provider_respects_cancellation() {
        let dns = ManualDns {
            settle: Duration::from_secs(60),
        };
        let ctx = Context::background();
        ctx.cancel();
        let err = dns
            .set_txt(&ctx, "_acme-challenge.example.test", "v")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Canceled));
    }
}
