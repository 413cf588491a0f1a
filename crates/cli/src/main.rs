use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use serde_json::json;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{info, warn};
use walkthrough_core::{payload, Notification, NotificationSink, ResourceClient, User};
use walkthrough_kubehub::KubeClient;
use walkthrough_provision::dashboard::dashboard_url;
use walkthrough_provision::namespace::namespace_name_with_suffix;
use walkthrough_provision::{resources, MemoryClient, Walkthrough, WalkthroughConfig};
use walkthrough_store::StateStore;

#[derive(Parser, Debug)]
#[command(name = "walkthroughctl", version, about = "Per-user walkthrough provisioning")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the namespace a user's walkthrough services live in
    Namespace { username: String },
    /// Print the service instances that would be created
    Render {
        /// Username (default: the authenticated cluster user)
        #[arg(long = "user", env = "WALKTHROUGH_USER")]
        user: Option<String>,
        /// Service classes (default: WALKTHROUGH_SERVICES or the standard set)
        services: Vec<String>,
    },
    /// Provision the walkthrough and follow its watches until Ctrl-C
    Provision {
        /// Username (default: the authenticated cluster user)
        #[arg(long = "user", env = "WALKTHROUGH_USER")]
        user: Option<String>,
        /// Run against an in-process API seeded with a console route and broker
        #[arg(long = "in-memory", action = ArgAction::SetTrue)]
        in_memory: bool,
    },
}

fn init_tracing() {
    let env = std::env::var("WALKTHROUGH_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("WALKTHROUGH_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid WALKTHROUGH_METRICS_ADDR; expected host:port");
        }
    }
}

/// In-process API with what a provisioned cluster eventually shows: a console
/// route and a running broker.
fn seeded_memory_client(username: &str, cfg: &WalkthroughConfig) -> MemoryClient {
    let client = MemoryClient::new(username);
    let ns = namespace_name_with_suffix(username, &cfg.namespace_suffix);
    client.seed(
        &resources::routes(&ns),
        json!({"metadata": {"name": cfg.console_route.as_str()}, "spec": {"host": format!("{}.apps.local", ns)}}),
    );
    client.seed(
        &resources::stateful_sets(&ns),
        json!({
            "metadata": {"name": "broker-amq"},
            "spec": {"template": {"spec": {"containers": [{"name": "broker-amq", "env": [
                {"name": "AMQ_USER", "value": "admin"},
                {"name": "AMQ_PASSWORD", "value": "admin"}
            ]}]}}}
        }),
    );
    client
}

async fn kube_client() -> Result<Arc<dyn ResourceClient>> {
    let client = KubeClient::try_default().await.context("connecting to the cluster")?;
    Ok(Arc::new(client))
}

fn print_notification(output: Output, n: &Notification) -> Result<()> {
    match output {
        Output::Json => println!("{}", serde_json::to_string(n)?),
        Output::Human => {
            let name = n.resource().and_then(payload::name).unwrap_or("-");
            match n {
                Notification::Upserted { key, resource } => match dashboard_url(resource) {
                    Some(url) => println!("+ {:<28} {:<32} {}", key, name, url),
                    None => println!("+ {:<28} {}", key, name),
                },
                Notification::Removed { key, .. } => println!("- {:<28} {}", key, name),
                Notification::Credentials(creds) => println!("* {:<28} {}", n.key(), creds.username),
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let cfg = WalkthroughConfig::from_env();

    match cli.command {
        Commands::Namespace { username } => {
            let ns = namespace_name_with_suffix(&username, &cfg.namespace_suffix);
            match cli.output {
                Output::Human => println!("{}", ns),
                Output::Json => println!("{}", json!({"username": username, "namespace": ns})),
            }
        }
        Commands::Render { user, services } => {
            let mut cfg = cfg;
            if !services.is_empty() {
                cfg.services = services;
            }
            let user = match user {
                Some(u) => User::new(u),
                None => kube_client().await?.current_user().await.context("resolving current user")?,
            };
            info!(user = %user.username, services = ?cfg.services, "render invoked");
            let client: Arc<dyn ResourceClient> = Arc::new(MemoryClient::new(&user.username));
            let instances = Walkthrough::new(client, cfg).desired_instances(&user);
            match cli.output {
                Output::Human => {
                    for si in &instances {
                        println!(
                            "{:<28} {:<22} {}",
                            si.spec.cluster_service_class_external_name,
                            si.spec.cluster_service_plan_external_name,
                            si.metadata.namespace.as_deref().unwrap_or("-"),
                        );
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&instances)?),
            }
        }
        Commands::Provision { user, in_memory } => {
            let client: Arc<dyn ResourceClient> = if in_memory {
                let username = user.clone().unwrap_or_else(|| "developer".to_string());
                Arc::new(seeded_memory_client(&username, &cfg))
            } else {
                kube_client().await?
            };
            let cap = cfg.queue_cap;
            let store = StateStore::for_services(cap, cfg.services.len());
            let (tap_tx, mut tap_rx) = mpsc::channel::<Notification>(cap);
            let wt = Walkthrough::new(client, cfg);

            let done = match user {
                Some(u) => wt.provision_user(&User::new(u), Arc::new(tap_tx)).await,
                None => wt.provision_current_user(Arc::new(tap_tx)).await,
            }
            .context("provisioning walkthrough")?;
            info!(user = %done.user.username, ns = %done.namespace, instances = done.instances.len(), "provisioned; following watches");
            // Prime the state with what provisioning returned, ahead of the first watch events.
            store.seed(done.instances.clone()).await;

            loop {
                tokio::select! {
                    maybe = tap_rx.recv() => {
                        match maybe {
                            Some(n) => {
                                print_notification(cli.output, &n)?;
                                store.notify(n).await;
                            }
                            None => {
                                warn!("notification channel closed; exiting watch loop");
                                break;
                            }
                        }
                    }
                    _ = signal::ctrl_c() => {
                        info!("Ctrl-C received; cancelling subscriptions");
                        break;
                    }
                }
            }

            done.watches.cancel();
            done.watches.join().await;
            let state = store.current();
            match cli.output {
                Output::Human => {
                    println!("{} services tracked (epoch {})", state.len(), state.epoch);
                    if let Some(user) = state.messaging("username") {
                        println!("messaging user {}", user);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&*state)?),
            }
        }
    }
    Ok(())
}
