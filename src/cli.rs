use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(name = "weft")]
#[command(about = "Entity-driven compute control plane")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Display application version
    Version,

    /// Run the control plane: entity store, controllers, ingress
    Serve(ServeArgs),
}

#[derive(Args)]
pub struct ServeArgs {
    /// State directory (entity store log, certificates)
    #[arg(long, default_value = "/var/lib/weft")]
    pub data_dir: String,

    /// HTTP ingress listener
    #[arg(long, default_value = "0.0.0.0:8080")]
    pub http_addr: String,

    /// HTTPS ingress listener; omit to serve plain HTTP only
    #[arg(long)]
    pub https_addr: Option<String>,

    /// Health/readiness/metrics listener
    #[arg(long, default_value = "0.0.0.0:9090")]
    pub ops_addr: String,

    /// Cluster-IP prefix for services (repeatable)
    #[arg(long = "service-prefix", default_value = "10.96.0.0/16")]
    pub service_prefixes: Vec<String>,

    /// ACME directory URL; omit to self-sign HTTPS certificates
    #[arg(long)]
    pub acme_directory: Option<String>,

    /// ACME account contact, e.g. mailto:ops@example.com (repeatable)
    #[arg(long = "acme-contact")]
    pub acme_contacts: Vec<String>,

    /// DNS-01 provider name
    #[arg(long, default_value = "manual")]
    pub dns_provider: String,

    /// Seconds to let published TXT records settle before validation
    #[arg(long, default_value_t = 60)]
    pub dns_settle_secs: u64,
}
