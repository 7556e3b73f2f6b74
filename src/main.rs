//! mpp: a dynamically configured proxy over multiple prometheus endpoints
//! which selects endpoints based on configurable criteria.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use clap::{CommandFactory, Parser};
use tracing::{error, info};

use crate::locator::Locator;
use crate::locator::endpoints_file::EndpointsFileLocator;
use crate::locator::kubernetes::KubernetesLocator;
use crate::locator::marathon::MarathonLocator;
use crate::observability::metrics::DEFAULT_NAMESPACE;
use crate::router::Router;
use crate::router::affinity::AffinityOption;
use crate::server::AppState;

mod locator;
mod observability;
mod prometheus;
mod router;
mod selector;
mod server;

#[cfg(test)]
mod tests;

#[derive(Parser, Debug)]
#[command(
    name = "mpp",
    version,
    about = "Launch a dynamically configured proxy over multiple prometheus endpoints \
             which selects endpoints based on configurable criteria."
)]
struct Args {
    /// The path to a kubeconfig file used to communicate with the kubernetes
    /// api server to locate prometheus instances
    #[arg(long, env = "MPP_KUBECONFIG")]
    kubeconfig: Option<PathBuf>,

    /// The service name used to locate prometheus endpoints; takes
    /// precedence over 'kube-pod-label-selector'
    #[arg(long, env = "MPP_KUBE_SERVICE_NAME")]
    kube_service_name: Option<String>,

    /// The label selector used to find prometheus pods
    #[arg(long, env = "MPP_KUBE_POD_LABEL_SELECTOR")]
    kube_pod_label_selector: Option<String>,

    /// The namespace in which prometheus pods/endpoints exist
    #[arg(long, env = "MPP_KUBE_NAMESPACE")]
    kube_namespace: Option<String>,

    /// The port (name or number) where prometheus is listening on individual
    /// pods/endpoints
    #[arg(long, env = "MPP_KUBE_PORT")]
    kube_port: Option<String>,

    /// The URL for the marathon API endpoint used to locate prometheus
    /// instances
    #[arg(long, env = "MPP_MARATHON_URL")]
    marathon_url: Option<String>,

    /// A comma-separated list of marathon app IDs whose tasks will be
    /// queried for prometheus endpoints
    #[arg(long, env = "MPP_MARATHON_APPS", value_delimiter = ',')]
    marathon_apps: Vec<String>,

    /// Whether connections to https endpoints with unverifiable certs are
    /// allowed
    #[arg(long, short = 'k', env = "MPP_INSECURE_CERTS")]
    insecure_certs: bool,

    /// The principal secret used to handle authentication with marathon
    #[arg(long, env = "MPP_MARATHON_PRINCIPAL_SECRET")]
    marathon_principal_secret: Option<String>,

    /// The authentication endpoint to use with the
    /// 'marathon-principal-secret', overriding the value contained within
    /// the secret
    #[arg(long, env = "MPP_MARATHON_AUTH_ENDPOINT")]
    marathon_auth_endpoint: Option<String>,

    /// A file path containing a list of endpoints to use, one per line; the
    /// file is re-read at every selection interval
    #[arg(long, env = "MPP_ENDPOINTS_FILE")]
    endpoints_file: Option<PathBuf>,

    /// The strategy used for choosing viable prometheus endpoint(s) from
    /// those located; valid choices include 'single-most-data', 'random',
    /// and 'minimum-history:{duration}'
    #[arg(long, env = "MPP_ROUTING_STRATEGY", default_value = "single-most-data")]
    routing_strategy: String,

    /// The interval at which selections are performed; selection is also
    /// performed automatically upon backend failures
    #[arg(
        long,
        env = "MPP_SELECTION_INTERVAL",
        default_value = "10s",
        value_parser = humantime::parse_duration
    )]
    selection_interval: Duration,

    /// A comma-separated list of sticky-session modes to enable, of which
    /// 'cookies' and 'sourceip' are valid options
    #[arg(
        long,
        env = "MPP_AFFINITY_OPTIONS",
        default_value = "cookies",
        value_delimiter = ',',
        value_parser = parse_affinity_option
    )]
    affinity_options: Vec<AffinityOption>,

    /// The port on which the proxy will listen
    #[arg(long, env = "MPP_PORT", default_value_t = 9090)]
    port: u16,

    /// Log debugging information
    #[arg(long, short = 'V', env = "MPP_VERBOSE")]
    verbose: bool,
}

fn parse_affinity_option(value: &str) -> Result<AffinityOption, String> {
    value.parse().map_err(|err| format!("{err}"))
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    observability::tracing_init::init_tracing(args.verbose);
    if let Err(err) = observability::metrics::init_metrics(DEFAULT_NAMESPACE) {
        eprintln!("failed to initialize metrics: {err}");
        std::process::exit(1);
    }

    if let Err(err) = run(args).await {
        error!(error = %err, "fatal error");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let client = build_http_client(args.insecure_certs)?;
    let locators = build_locators(&args, &client).await?;

    let strategy_args: Vec<String> = args
        .routing_strategy
        .split(':')
        .map(str::to_string)
        .collect();
    let router = Router::new(
        args.selection_interval,
        args.affinity_options.clone(),
        locators,
        &strategy_args,
        client,
        DEFAULT_NAMESPACE,
    )
    .await?;

    let state = AppState {
        router: router.clone(),
        started_at: Instant::now(),
    };
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", args.port)).await?;
    info!(port = args.port, "mpp is listening");
    axum::serve(
        listener,
        server::app(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(router))
    .await?;
    Ok(())
}

async fn shutdown_signal(router: std::sync::Arc<Router>) {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutting down");
    router.close();
}

fn build_http_client(insecure_certs: bool) -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder()
        .danger_accept_invalid_certs(insecure_certs)
        .build()
}

/// Assemble the configured locators, mirroring the CLI contract: kubernetes
/// needs a namespace plus either a service name or a pod label selector,
/// marathon needs a URL plus app ids, and at least one locator must exist.
async fn build_locators(
    args: &Args,
    client: &reqwest::Client,
) -> Result<Vec<Box<dyn Locator>>, Box<dyn std::error::Error>> {
    let mut locators: Vec<Box<dyn Locator>> = Vec::new();

    if let Some(endpoints_file) = &args.endpoints_file {
        locators.push(Box::new(EndpointsFileLocator::new(
            client.clone(),
            endpoints_file,
        )));
    }

    if let Some(namespace) = &args.kube_namespace {
        if args.kube_service_name.is_none() && args.kube_pod_label_selector.is_none() {
            arg_error(
                "Kubernetes locator requires one of either 'kube-service-name' or \
                 'kube-pod-label-selector'",
            );
        }
        let locator = KubernetesLocator::new(
            client.clone(),
            args.kubeconfig.as_deref(),
            namespace,
            args.kube_service_name.clone(),
            args.kube_pod_label_selector.clone(),
            args.kube_port.clone(),
        )
        .await
        .map_err(|err| format!("failed to create kubernetes locator: {err}"))?;
        locators.push(Box::new(locator));
    }

    if let Some(marathon_url) = &args.marathon_url {
        if args.marathon_apps.is_empty() {
            arg_error("'marathon-apps' is required when 'marathon-url' is specified");
        }
        let locator = MarathonLocator::new(
            client.clone(),
            marathon_url,
            args.marathon_apps.clone(),
            args.marathon_auth_endpoint.as_deref(),
            args.marathon_principal_secret.as_deref(),
        )
        .await
        .map_err(|err| format!("failed to create marathon locator: {err}"))?;
        locators.push(Box::new(locator));
    }

    if locators.is_empty() {
        arg_error(
            "At least one locator mechanism must be configured; specify at least one of: \
             --endpoints-file, --kube-namespace with --kube-service-name or \
             --kube-pod-label-selector, or --marathon-url with --marathon-apps",
        );
    }
    Ok(locators)
}

/// Report a configuration error, print usage, and exit non-zero.
fn arg_error(message: &str) -> ! {
    eprintln!("{message}\n");
    let _ = Args::command().print_help();
    std::process::exit(1);
}
