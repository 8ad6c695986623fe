use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use holyrig::{config, dispatch::Dispatcher, model, rig, rpc, schema, subscribe};
use holyrig_types::Schema;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Schema-driven CAT control daemon.
#[derive(Debug, Parser)]
#[command(name = "holyrigd", version)]
struct Args {
    /// Service configuration file.
    #[arg(default_value = "holyrig.toml")]
    config: PathBuf,

    /// Override the configured UDP listen address.
    #[arg(long)]
    listen: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let config = config::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    let listen = args.listen.unwrap_or_else(|| config.listen.clone());

    let (outbound_tx, outbound_rx) = mpsc::channel(256);
    let subscriptions = subscribe::spawn(outbound_tx, config.queue_limit);

    let mut schemas: BTreeMap<PathBuf, Arc<Schema>> = BTreeMap::new();
    let mut rigs = BTreeMap::new();
    let mut disabled = BTreeSet::new();

    for rig_config in &config.rigs {
        if !rig_config.enabled {
            info!(rig = %rig_config.id, "disabled by configuration");
            disabled.insert(rig_config.id.clone());
            continue;
        }

        match build_rig(rig_config, &mut schemas, &subscriptions) {
            Ok(handle) => {
                rigs.insert(rig_config.id.clone(), handle);
            }
            Err(error) => {
                error!(rig = %rig_config.id, "{error:#}");
                disabled.insert(rig_config.id.clone());
            }
        }
    }

    info!(rigs = rigs.len(), disabled = disabled.len(), %listen, "starting");

    let dispatcher = Arc::new(Dispatcher::new(rigs, disabled, subscriptions.requests.clone()));
    let socket = UdpSocket::bind(&listen)
        .await
        .with_context(|| format!("binding {listen}"))?;

    tokio::select! {
        result = rpc::serve(socket, dispatcher, outbound_rx) => {
            result.context("transport failed")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
        }
    }

    Ok(())
}

/// Compiles one rig's schema and model and spawns its runtime task.
fn build_rig(
    rig_config: &config::RigConfig,
    schemas: &mut BTreeMap<PathBuf, Arc<Schema>>,
    subscriptions: &subscribe::SubscriptionHandle,
) -> anyhow::Result<rig::RigHandle> {
    let schema = match schemas.get(&rig_config.schema) {
        Some(schema) => schema.clone(),
        None => {
            let source = std::fs::read_to_string(&rig_config.schema)
                .with_context(|| format!("reading {}", rig_config.schema.display()))?;
            let schema = schema::compile(&source).map_err(|errors| {
                compile_failure(&rig_config.schema, errors.iter().map(ToString::to_string))
            })?;
            let schema = Arc::new(schema);
            schemas.insert(rig_config.schema.clone(), schema.clone());
            schema
        }
    };

    let source = std::fs::read_to_string(&rig_config.model)
        .with_context(|| format!("reading {}", rig_config.model.display()))?;
    let model = model::compile(&source, schema).map_err(|errors| {
        compile_failure(&rig_config.model, errors.iter().map(ToString::to_string))
    })?;

    let opener = rig_config.opener()?;
    Ok(rig::spawn(
        rig_config.id.clone(),
        Arc::new(model),
        opener,
        rig_config.settings(),
        subscriptions.updates.clone(),
    ))
}

fn compile_failure(
    path: &std::path::Path,
    errors: impl Iterator<Item = String>,
) -> anyhow::Error {
    let details: Vec<String> = errors.collect();
    anyhow::anyhow!("{}: {}", path.display(), details.join("; "))
}
