use dashmap::DashMap;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

use crate::device::{Bdev, BdevEvent};

/// A device module. Registered once per process; `examine` runs for every
/// device that appears afterwards so modules can attach to bases that
/// arrive late.
pub trait BdevModule: Send + Sync {
    fn name(&self) -> &'static str;

    fn examine(&self, bdev: &Bdev);
}

#[derive(Debug, Error)]
pub enum RegisterError {
    #[error("bdev {0} already exists")]
    AlreadyExists(String),
}

#[derive(Debug, Error)]
pub enum UnregisterError {
    #[error("no bdev named {0}")]
    NotFound(String),
    #[error("bdev {name} belongs to module {owner}, not {requested}")]
    WrongModule {
        name: String,
        owner: &'static str,
        requested: &'static str,
    },
}

struct Registry {
    bdevs: DashMap<String, Bdev>,
    modules: Mutex<Vec<Arc<dyn BdevModule>>>,
}

static REGISTRY: Lazy<Registry> = Lazy::new(|| Registry {
    bdevs: DashMap::new(),
    modules: Mutex::new(Vec::new()),
});

pub fn get(name: &str) -> Option<Bdev> {
    REGISTRY.bdevs.get(name).map(|b| b.clone())
}

pub fn names() -> Vec<String> {
    REGISTRY.bdevs.iter().map(|b| b.key().clone()).collect()
}

/// Registers a device and lets every module examine the newcomer.
pub fn register(bdev: Bdev) -> Result<(), RegisterError> {
    let name = bdev.name().to_string();
    {
        let entry = REGISTRY.bdevs.entry(name.clone());
        match entry {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(RegisterError::AlreadyExists(name));
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(bdev.clone());
            }
        }
    }
    info!(name = %name, product = bdev.product_name(), "bdev registered");

    // Examine outside the map so modules may register further bdevs.
    let modules: Vec<_> = REGISTRY.modules.lock().clone();
    for module in modules {
        module.examine(&bdev);
    }
    Ok(())
}

/// Unregisters a device: removes it from the table, delivers the remove
/// event to every open descriptor, then runs the module destructor.
pub fn unregister(name: &str) -> Result<(), UnregisterError> {
    let (_, bdev) = REGISTRY
        .bdevs
        .remove(name)
        .ok_or_else(|| UnregisterError::NotFound(name.to_string()))?;
    bdev.mark_removed();
    bdev.deliver_event(BdevEvent::Remove);
    bdev.destruct();
    info!(name = %name, "bdev unregistered");
    Ok(())
}

/// Unregister restricted to devices owned by `module`.
pub fn unregister_by_name(name: &str, module: &'static str) -> Result<(), UnregisterError> {
    let owner = {
        let bdev = REGISTRY
            .bdevs
            .get(name)
            .ok_or_else(|| UnregisterError::NotFound(name.to_string()))?;
        bdev.module()
    };
    if owner != module {
        return Err(UnregisterError::WrongModule {
            name: name.to_string(),
            owner,
            requested: module,
        });
    }
    unregister(name)
}

/// Adds a module to the examine chain. Devices registered before the
/// module are not re-examined; attachment to those goes through the
/// module's own control plane.
pub fn add_module(module: Arc<dyn BdevModule>) {
    let mut modules = REGISTRY.modules.lock();
    if modules.iter().any(|m| m.name() == module.name()) {
        return;
    }
    modules.push(module);
}
