//! Process-scoped device registry.
//!
//! Devices are registered by name at initialization; lookups never inspect
//! device types. Tests call [`reset_for_tests`] to get a clean table.

use std::sync::{Arc, Mutex, OnceLock};

use log::debug;
use rustc_hash::FxHashMap;

use super::{Device, HostDevice};
use crate::error::{Error, Result};

fn table() -> &'static Mutex<FxHashMap<String, Arc<dyn Device>>> {
    static TABLE: OnceLock<Mutex<FxHashMap<String, Arc<dyn Device>>>> = OnceLock::new();
    TABLE.get_or_init(|| Mutex::new(FxHashMap::default()))
}

/// Register the built-in backends. Idempotent.
pub fn init() {
    let mut table = table().lock().unwrap_or_else(|e| e.into_inner());
    if !table.contains_key("host") {
        debug!("registering host backend");
        table.insert("host".to_string(), Arc::new(HostDevice::new()));
    }
}

/// Register an additional device under `name`, replacing any previous one.
pub fn register(name: impl Into<String>, device: Arc<dyn Device>) {
    let name = name.into();
    debug!("registering backend '{name}'");
    table()
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .insert(name, device);
}

/// Look up a device by name.
pub fn get_device(name: &str) -> Result<Arc<dyn Device>> {
    init();
    table()
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .get(name)
        .cloned()
        .ok_or_else(|| Error::UnknownBackend(name.to_string()))
}

/// Clear the registry so a test starts from a known state.
pub fn reset_for_tests() {
    table().lock().unwrap_or_else(|e| e.into_inner()).clear();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_roundtrip() {
        reset_for_tests();
        assert!(matches!(
            get_device("nonsense"),
            Err(Error::UnknownBackend(_))
        ));
        // init() runs implicitly on lookup.
        let host = get_device("host").unwrap();
        assert_eq!(host.name(), "host");
    }
}
