//! `mued`: the multi-user endpoint manager binary.
//!
//! Wires together the components documented in `SPEC_FULL.md` §2: loads
//! config, registers with the control plane, resolves the manager's own
//! identity, spawns the signal/command-queue/result-publisher threads, and
//! runs the dispatch loop on the main thread until shutdown. Grounded on
//! `vinit/src/bin/simplevisor.rs`'s `main` (thread topology, signal
//! handling) and `vcontrol::server_main`'s `tracing_subscriber` setup.

mod capabilities;
mod cli;
mod config;
mod error;
mod failure_notice;
mod identity;
mod launch;
mod logging;
mod manager;
mod registration;
mod registry;
mod signals;
mod state;
mod transport;
mod user_config;
mod wire;

use std::collections::HashSet;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use nix::unistd::Uid;

use crate::config::Config;
use crate::error::ManagerError;
use crate::identity::{current_local_identity, IdentityMapper, PosixIdentityMapper};
use crate::manager::Manager;
use crate::signals::SignalFlags;
use crate::state::PersistedState;
use crate::transport::command_queue::{AmqpCommandQueueSubscriber, CommandQueueSubscriber};
use crate::transport::result_publisher::{AmqpResultPublisher, ResultPublisher};
use crate::user_config::{load_user_config_template, TemplateUserConfigRenderer};

fn main() -> ExitCode {
    let args = cli::Args::parse();
    logging::init(&args.config_dir, &args.log_level);

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "manager exiting");
            e.exit_code()
        }
    }
}

fn run(args: &cli::Args) -> Result<(), ManagerError> {
    let config = Config::load(&args.config_dir.join("config.toml"))
        .map_err(|e| ManagerError::Config(e.to_string()))?;
    let privileged = Uid::effective() == Uid::from_raw(0);

    let own_identity =
        current_local_identity().map_err(|e| ManagerError::Config(e.to_string()))?;

    let mut identity_mapper: Option<Box<dyn IdentityMapper>> = None;
    let mut parent_identities: HashSet<String> = HashSet::new();

    let http_client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .map_err(ManagerError::RegistrationTempFail)?;

    if privileged {
        let policy_path = config
            .identity_mapping_config_path
            .as_deref()
            .ok_or(ManagerError::IdentityMappingMissing)?;
        let mapper = PosixIdentityMapper::load(policy_path).map_err(|e| match e {
            crate::error::IdentityMapperError::Permission(io) => {
                ManagerError::IdentityMappingPermission(io)
            }
            other => ManagerError::IdentityMappingConfig(other.to_string()),
        })?;
        identity_mapper = Some(Box::new(mapper));
    } else {
        tracing::debug!("ascertaining user identity set");
        parent_identities = registration::fetch_parent_identity_set(&http_client, &config)?;
    }

    let persisted = PersistedState::load(&args.config_dir)
        .map_err(|e| ManagerError::Config(e.to_string()))?;
    let conf_dir_name = args
        .config_dir
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("mep")
        .to_string();

    let metadata = serde_json::json!({
        "display_name": config.display_name,
        "environment": config.environment,
    });
    let reg_info = registration::register_endpoint(
        &http_client,
        &config,
        &conf_dir_name,
        persisted.as_ref().map(|p| p.endpoint_id.as_str()),
        metadata,
    )?;
    PersistedState {
        endpoint_id: reg_info.endpoint_id.clone(),
    }
    .save(&args.config_dir)
    .map_err(|e| ManagerError::Config(e.to_string()))?;

    let command_queue_url = match config.amqp_port {
        Some(port) => registration::apply_amqp_port_override(
            &reg_info.command_queue_info.connection_url,
            port,
        ),
        None => reg_info.command_queue_info.connection_url.clone(),
    };

    let tokio_runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .map_err(ManagerError::Io)?;
    let runtime_handle = tokio_runtime.handle().clone();

    let subscriber = Arc::new(AmqpCommandQueueSubscriber::new(
        command_queue_url,
        reg_info.command_queue_info.queue.clone(),
        runtime_handle.clone(),
    ));
    let publisher = Arc::new(AmqpResultPublisher::new(
        reg_info.result_queue_info.connection_url.clone(),
        reg_info.result_queue_info.queue.clone(),
        runtime_handle,
    ));

    let (user_config_template, user_config_schema) =
        load_user_config_template(&args.config_dir).map_err(|e| {
            ManagerError::Config(format!(
                "{}/user_config_template.yaml: {e}",
                args.config_dir.display()
            ))
        })?;

    let signal_flags = SignalFlags::new();
    let (signal_join, signal_handle) =
        signals::spawn(signal_flags.clone()).map_err(ManagerError::Io)?;

    let (delivery_tx, delivery_rx) = crossbeam_channel::bounded(4096);
    let (stop_tx, stop_rx) = crossbeam_channel::bounded(0);
    let consumer_subscriber = Arc::clone(&subscriber);
    let consumer_join = std::thread::Builder::new()
        .name("command-queue".into())
        .spawn(move || {
            if let Err(e) = consumer_subscriber.run(delivery_tx, stop_rx) {
                tracing::error!(error = %e, "command queue consumer exited");
            }
        })
        .map_err(ManagerError::Io)?;

    let mut manager = Manager::new(
        config,
        args.config_dir.clone(),
        reg_info.endpoint_id.clone(),
        identity_mapper,
        own_identity,
        subscriber.clone() as Arc<dyn CommandQueueSubscriber>,
        publisher.clone() as Arc<dyn ResultPublisher>,
        reg_info.result_queue_info.queue.clone(),
        parent_identities,
        signal_flags,
        user_config_template,
        user_config_schema,
        Box::new(TemplateUserConfigRenderer),
    );

    tracing::info!(endpoint_id = %reg_info.endpoint_id, "manager started");
    manager.run(delivery_rx);
    tracing::info!("stop requested; shutting down");
    manager.shutdown();

    let _ = stop_tx.send(());
    join_with_timeout(consumer_join, Duration::from_secs(5));
    signal_handle.close();
    join_with_timeout(signal_join, Duration::from_secs(5));
    tokio_runtime.shutdown_timeout(Duration::from_secs(5));

    tracing::info!("shutdown complete");
    Ok(())
}

/// Waits up to `timeout` for `handle` to finish, then gives up. The
/// manager's own shutdown must always progress (`spec.md` §4.7/§7:
/// "shutdown always progresses"), so a worker thread that refuses to join
/// is logged and abandoned rather than blocking process exit forever.
fn join_with_timeout(handle: std::thread::JoinHandle<()>, timeout: Duration) {
    let deadline = std::time::Instant::now() + timeout;
    while !handle.is_finished() && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(50));
    }
    if handle.is_finished() {
        let _ = handle.join();
    } else {
        tracing::warn!("worker thread did not exit within shutdown timeout; abandoning");
    }
}
