pub mod sluicedb;
#[cfg(test)]
mod tests;

pub use crate::sluicedb::*;

use std::sync::Arc;
use std::thread;

use tokio::runtime::Builder;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::sluicedb::common::coarse_monotonic_clock_updater;
use crate::sluicedb::config::{Settings, load_config};
use crate::sluicedb::monitor::Monitor;
use crate::sluicedb::router::Service;
use crate::sluicedb::server::{Listener, load_tls_config};
use crate::sluicedb::users::{SqlUserLoader, UserManager};
use crate::sluicedb::worker::{Shared, Worker, WorkerCommand, worker_channels};


/// Installs the global subscriber. RUST_LOG overrides default_level, which takes
/// the same directives (e.g. "info" or "sluicedb=debug").
pub fn init_tracing(default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .expect("setting default subscriber failed");
}

/// Load the configuration settings from sluicedb.yaml
/// See sluicedb::config::load_config for more info.
pub fn init_settings() -> Result<&'static Settings> {
    load_config("sluicedb.yaml")
}

/// Starts the background threads (clock, monitor, user account updater) and runs
/// one worker thread per settings.num_workers until they all exit.
pub fn run_servers(settings: &'static Settings) -> Result<()> {
    let config = &settings.service;
    let service = Arc::new(Service::new(config)?);
    info!(service = service.name(), servers = service.servers().len(), "service created");

    // Update the coarse monotonic clock on a periodic basis
    let clock = Builder::new_current_thread().enable_time().build()?;
    thread::Builder::new()
        .name("coarse-clock".to_string())
        .spawn(move || clock.block_on(coarse_monotonic_clock_updater()))?;

    Monitor::new(service.clone()).start()?;

    let (handles, receivers) = worker_channels(settings.num_workers);
    let handles = Arc::new(handles);

    let loader = SqlUserLoader::new(service.servers().to_vec(), config.user.clone(), config.password.clone(), config.users.users_from_all);
    let users = Arc::new(UserManager::new(config.users.clone(), Box::new(loader)));
    let notify = handles.clone();
    users.set_on_update(move || {
        for handle in notify.iter() {
            handle.send(WorkerCommand::UsersUpdated);
        }
    });
    users.start()?;

    let shared = Arc::new(Shared {
        settings,
        service,
        users: users.clone(),
        tls: load_tls_config(&settings.client_tls)?,
        handles,
    });

    // If reuseport is false, all workers accept from a single listening socket.
    // Otherwise each worker binds its own and the kernel balances between them.
    let listener: Option<&'static std::net::TcpListener> = if settings.reuseport {
        None
    } else {
        info!("create shared listener socket");
        let shared_listener: &'static std::net::TcpListener = Box::leak(Box::new(Listener::bind_shared(&settings.listen_address())?));
        Some(shared_listener)
    };

    // Tasks spawned on a worker stay on it, sessions never cross threads.
    info!(num_workers = settings.num_workers, "starting workers");
    let mut threads = Vec::with_capacity(settings.num_workers as usize);
    for (id, commands) in receivers.into_iter().enumerate() {
        let worker = Worker::new(id as u32)?;
        let shared = shared.clone();
        threads.push(thread::Builder::new()
            .name(format!("worker-{}", id))
            .spawn(move || {
                info!(worker_id = id, "started worker thread");
                worker.run_forever(shared, commands, listener);
            })?);
    }

    for t in threads {
        if t.join().is_err() {
            error!("worker thread panicked");
        }
    }
    users.stop();
    Ok(())
}
