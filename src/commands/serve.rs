use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context as _, Result};
use axum::Router;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use ipnet::IpNet;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::info;

use crate::cli::ServeArgs;
use weft::certs::{self, AcmeOrSelfSigned, CertStore};
use weft::context::Context;
use weft::controllers::{endpoints, ipalloc, scheduler};
use weft::ingress::{self, IngressState, RouteTable, ServiceBackends};
use weft::model;
use weft::schema;
use weft::store::EntityStore;

/* ============================= ENTRY ============================= */

pub async fn run(args: ServeArgs) -> Result<()> {
    println!("Starting weft control plane...\n");
    info!("serve_starting");

    // Process-wide schema registration happens exactly once, before the
    // store opens.
    schema::register_global(model::compute::domain())
        .context("compute domain registers once")?;
    schema::register_global(model::network::domain())
        .context("network domain registers once")?;
    schema::register_global(model::ingress::domain())
        .context("ingress domain registers once")?;

    let data_dir = PathBuf::from(&args.data_dir);
    print!("  Entity store ................ ");
    let store = EntityStore::open_at(data_dir.join("store"), schema::global_snapshot())
        .context("Failed to open entity store")?;
    println!("{}", data_dir.join("store").display());

    let prefixes: Vec<IpNet> = args
        .service_prefixes
        .iter()
        .map(|p| p.parse().context("Invalid service prefix"))
        .collect::<Result<_>>()?;
    println!(
        "  Service prefixes ............ {}",
        args.service_prefixes.join(", ")
    );

    let http_addr: SocketAddr = args.http_addr.parse().context("Invalid --http-addr")?;
    let ops_addr: SocketAddr = args.ops_addr.parse().context("Invalid --ops-addr")?;

    let ctx = Context::background();

    // ── controllers ──

    let scheduler_handles = scheduler::start(&store, &ctx)?;
    println!("  Scheduler ................... running");

    let allocator = ipalloc::IpAllocator::new(prefixes);
    let allocator_handle = ipalloc::watch(allocator, &store, &ctx)?;
    println!("  IP allocator ................ running");

    let endpoints_handles = endpoints::start(&store, &ctx)?;
    println!("  Endpoints projector ......... running");

    let table = RouteTable::new();
    let routes_handle = ingress::watch_routes(table.clone(), &store, &ctx)?;
    println!("  Route table ................. running");

    // ── ingress listeners ──

    let resolver = ServiceBackends::new(store.clone());
    let state = IngressState::new(table, resolver, ctx.clone());
    let app = ingress::router(state);

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let http_handle = {
        let app = app.clone();
        let mut shutdown = shutdown_tx.subscribe();
        let listener = tokio::net::TcpListener::bind(http_addr)
            .await
            .context("Failed to bind HTTP ingress listener")?;
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown.recv().await;
                })
                .await
        })
    };
    println!("  HTTP ingress ................ http://{http_addr}");

    let mut cert_handle = None;
    let mut https_handle = None;
    if let Some(https_addr) = &args.https_addr {
        let https_addr: SocketAddr = https_addr.parse().context("Invalid --https-addr")?;
        let issuer = certs::issuer_from_args(
            &data_dir.join("certs"),
            args.acme_directory.as_deref(),
            &args.acme_contacts,
            &args.dns_provider,
            Duration::from_secs(args.dns_settle_secs),
        )
        .await?;
        let issuer_label = match issuer {
            AcmeOrSelfSigned::Acme(_) => "acme dns-01",
            AcmeOrSelfSigned::SelfSigned(_) => "self-signed",
        };
        let cert_store = CertStore::new(data_dir.join("certs"), issuer.into_issuer());
        let loaded = cert_store.init()?;
        cert_handle = Some(certs::watch(cert_store.clone(), &store, &ctx)?);

        let config = certs::server_config(cert_store)?;
        let rustls_config =
            axum_server::tls_rustls::RustlsConfig::from_config(Arc::new(config));
        let handle = axum_server::Handle::new();
        let shutdown_handle = handle.clone();
        let mut shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            let _ = shutdown.recv().await;
            shutdown_handle.graceful_shutdown(Some(Duration::from_secs(5)));
        });
        let app = app.clone();
        https_handle = Some(tokio::spawn(async move {
            axum_server::bind_rustls(https_addr, rustls_config)
                .handle(handle)
                .serve(app.into_make_service())
                .await
        }));
        println!("  HTTPS ingress ............... https://{https_addr} ({issuer_label}, {loaded} certs loaded)");
    }

    // ── ops surface ──

    let ready = Arc::new(AtomicBool::new(true));
    let ops_handle = {
        let app = build_ops_router(ready.clone());
        let mut shutdown = shutdown_tx.subscribe();
        let listener = tokio::net::TcpListener::bind(ops_addr)
            .await
            .context("Failed to bind ops listener")?;
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown.recv().await;
                })
                .await
        })
    };
    println!("  Ops server .................. http://{ops_addr}");
    println!();
    println!("  Available endpoints:");
    println!("    GET /healthz .............. Liveness probe");
    println!("    GET /readyz ............... Readiness probe");
    println!("    GET /metrics .............. Prometheus metrics");
    println!();
    println!("Control plane running. Press Ctrl+C to stop.\n");
    println!("{}", "=".repeat(70));

    info!("serve_started");

    signal::ctrl_c().await?;
    info!("shutdown_signal_received");
    println!("\n{}", "=".repeat(70));
    println!("Shutdown signal received. Stopping control plane...");
    println!("{}", "=".repeat(70));

    ready.store(false, Ordering::SeqCst);
    let _ = shutdown_tx.send(());
    ctx.cancel();

    scheduler_handles.close().await;
    allocator_handle.close().await;
    endpoints_handles.close().await;
    routes_handle.close().await;
    if let Some(handle) = cert_handle {
        handle.close().await;
    }
    let _ = http_handle.await?;
    let _ = ops_handle.await?;
    if let Some(handle) = https_handle {
        let _ = handle.await?;
    }

    info!("serve_stopped");
    println!("Control plane stopped.");
    Ok(())
}

/* ============================= OPS ROUTER ============================= */

pub(crate) fn build_ops_router(ready: Arc<AtomicBool>) -> Router {
    Router::new()
        .route("/healthz", get(|| async { (StatusCode::OK, "OK") }))
        .route(
            "/readyz",
            get({
                let ready = ready.clone();
                move || ready_handler(ready.clone())
            }),
        )
        .route("/metrics", get(metrics_handler))
}

async fn ready_handler(ready: Arc<AtomicBool>) -> impl IntoResponse {
    if ready.load(Ordering::SeqCst) {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

async fn metrics_handler() -> impl IntoResponse {
    (StatusCode::OK, weft::metrics::gather_text())
}

/* ============================= TESTS ============================= */
