use std::sync::{Arc, Once};

use bdev::{Bdev, BdevModule, OpenError, UnregisterError};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{error, info};

use crate::config::PassthruConfig;
use crate::device::{self, CreateError, PassthruDevice, MODULE_NAME};

/// Configured names, kept across base hot-remove so a device reattaches
/// when its base comes back. Entries leave only through `delete_disk` or
/// module teardown.
static PENDING: Lazy<Mutex<Vec<PassthruConfig>>> = Lazy::new(|| Mutex::new(Vec::new()));

/// Live virtual devices.
static NODES: Lazy<Mutex<Vec<Arc<PassthruDevice>>>> = Lazy::new(|| Mutex::new(Vec::new()));

#[derive(Debug, Error)]
pub enum DeleteError {
    #[error(transparent)]
    Unregister(#[from] UnregisterError),
}

struct PassthruModule;

impl BdevModule for PassthruModule {
    fn name(&self) -> &'static str {
        MODULE_NAME
    }

    fn examine(&self, bdev: &Bdev) {
        register_matching(bdev.name());
    }
}

fn ensure_module() {
    static INIT: Once = Once::new();
    INIT.call_once(|| bdev::registry::add_module(Arc::new(PassthruModule)));
}

/// Registers every pending name configured on top of `base_name` that is
/// not already live.
fn register_matching(base_name: &str) {
    let matches: Vec<PassthruConfig> = PENDING
        .lock()
        .iter()
        .filter(|c| c.base_bdev_name == base_name)
        .cloned()
        .collect();
    for config in matches {
        if bdev::registry::get(&config.name).is_some() {
            continue;
        }
        info!(base = %base_name, name = %config.name, "match on base bdev");
        if let Err(err) = device::register(&config) {
            error!(%err, name = %config.name, "deferred passthru registration failed");
        }
    }
}

/// Creates a virtual device over `config.base_bdev_name`. If the base is
/// not present yet the name is kept and registration happens when the
/// base appears; that case still returns `Ok`.
pub fn create_disk(config: PassthruConfig) -> Result<(), CreateError> {
    ensure_module();
    {
        let mut pending = PENDING.lock();
        if pending.iter().any(|c| c.name == config.name) {
            error!(name = %config.name, "passthru bdev already exists");
            return Err(CreateError::AlreadyExists(config.name));
        }
        pending.push(config.clone());
    }

    match device::register(&config) {
        Ok(()) => Ok(()),
        Err(CreateError::Open(OpenError::NotFound(_))) => {
            info!(
                base = %config.base_bdev_name,
                "vbdev creation deferred pending base bdev arrival"
            );
            Ok(())
        }
        Err(err) => Err(err),
    }
}

/// Unregisters a virtual device and drops its configured name. The
/// callback receives the outcome either way.
pub fn delete_disk(name: &str, cb: impl FnOnce(Result<(), DeleteError>) + Send + 'static) {
    let result = bdev::registry::unregister_by_name(name, MODULE_NAME).map_err(DeleteError::from);
    if result.is_ok() {
        PENDING.lock().retain(|c| c.name != name);
    }
    cb(result);
}

/// Emits one `bdev_passthru_create` record per live device, enough to
/// recreate the current state.
pub fn config_json() -> serde_json::Value {
    let nodes = NODES.lock();
    serde_json::Value::Array(
        nodes
            .iter()
            .map(|node| {
                serde_json::json!({
                    "method": "bdev_passthru_create",
                    "params": {
                        "base_bdev_name": node.base_name(),
                        "name": node.name(),
                        "uuid": node.uuid(),
                    }
                })
            })
            .collect(),
    )
}

/// Module teardown: forget every configured name.
pub fn finish() {
    PENDING.lock().clear();
}

pub(crate) fn insert_node(device: Arc<PassthruDevice>) {
    NODES.lock().push(device);
}

pub(crate) fn remove_node(name: &str) {
    NODES.lock().retain(|d| d.name() != name);
}

/// Base hot-remove: tear down every virtual device sitting on it.
pub(crate) fn handle_base_remove(base_name: &str) {
    let names: Vec<String> = NODES
        .lock()
        .iter()
        .filter(|d| d.base_name() == base_name)
        .map(|d| d.name().to_string())
        .collect();
    for name in names {
        info!(name = %name, base = %base_name, "base bdev removed, unregistering");
        if let Err(err) = bdev::registry::unregister(&name) {
            error!(%err, name = %name, "unregister after base removal failed");
        }
    }
}
