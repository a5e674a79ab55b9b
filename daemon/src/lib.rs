// SPDX-License-Identifier: Apache-2.0
// Copyright Arbor Project Authors

//! Daemon composition: wires the factory, discovery and the control
//! service kernels together, and runs until a graceful shutdown.

pub mod service;

use config::DaemonConfig;
use discovery::{DiscoveryConfig, DiscoveryState, NetworkWatcher};
use factory::{Factory, FactoryError};
use kernel::{ExitCode, Kernel, KernelError, TypeRegistry};
use service::ServiceContext;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum DaemonError {
    #[error(transparent)]
    Factory(#[from] FactoryError),

    #[error(transparent)]
    Kernel(#[from] KernelError),

    #[error("failed to install the signal handler: {0}")]
    Signal(#[from] ctrlc::Error),
}

fn discovery_config(config: &DaemonConfig) -> DiscoveryConfig {
    DiscoveryConfig {
        fanout: config.fanout,
        scan_interval: config.scan_interval,
        failure_timeout: config.scan_interval * 2,
        port: config.port,
        resource_tag: config.resource_tag,
        interface_update_interval: config.interface_update_interval,
    }
}

/// Compose and run the daemon; returns the process exit code.
pub fn run(config: &DaemonConfig) -> Result<i32, DaemonError> {
    let discovery = Arc::new(DiscoveryState::new(discovery_config(config)));
    let services = Arc::new(ServiceContext::new(Arc::clone(&discovery)));

    let mut types = TypeRegistry::new();
    service::register_discovery_kernels(&mut types, &discovery)?;
    service::register_service_kernels(&mut types, &services)?;

    let factory = Arc::new(Factory::for_daemon(config, types, Arc::clone(&discovery))?);
    services.attach(&factory);
    factory.start()?;

    // the network watcher gets a pre-assigned id so connection events can
    // reach it from the moment the socket pipeline is up
    if let Some(remote) = factory.remote() {
        let mut watcher = NetworkWatcher::new(Arc::clone(&discovery), Arc::clone(remote));
        let id = factory.allocate_id();
        watcher.base_mut().set_id(id);
        remote.set_event_principal(id);
        factory.send(Box::new(watcher));
    }

    let handle = Arc::clone(&factory);
    ctrlc::set_handler(move || {
        info!("interrupted, shutting down");
        handle.graceful_shutdown(ExitCode::Success);
    })?;

    let code = factory.wait();
    factory.stop();
    let sack = factory.clear();
    if !sack.is_empty() {
        info!(count = sack.len(), "kernels discarded at shutdown");
    }
    Ok(code.process_exit_code())
}
