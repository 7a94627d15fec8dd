//! Zone registry: named routing zones behind one lock
//!
//! Control-side only. Worker threads never touch the registry.

use std::collections::HashMap;

use parking_lot::Mutex;
use xb_core::{EngineConfig, XbError, XbResult};

use crate::zone::RoutingZone;

pub struct ZoneRegistry {
    config: EngineConfig,
    zones: Mutex<HashMap<String, RoutingZone>>,
}

impl ZoneRegistry {
    pub fn new(config: EngineConfig) -> XbResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            zones: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Create and initialize a zone
    pub fn create_zone(&self, name: &str) -> XbResult<()> {
        let mut zones = self.zones.lock();
        if zones.contains_key(name) {
            return Err(XbError::InvalidParam(format!("zone '{}' already exists", name)));
        }
        let mut zone = RoutingZone::new(name, &self.config);
        zone.init()?;
        zones.insert(name.to_string(), zone);
        log::debug!("zone '{}' registered", name);
        Ok(())
    }

    /// Stop and drop a zone. Zones with attached derived zones are refused.
    pub fn remove_zone(&self, name: &str) -> XbResult<()> {
        let mut zones = self.zones.lock();
        let zone = zones
            .get(name)
            .ok_or_else(|| XbError::InvalidParam(format!("unknown zone '{}'", name)))?;
        if zone.derived_zones().next().is_some() || zone.base_zone().is_some() {
            return Err(XbError::Failed(format!("zone '{}' has derived zone links", name)));
        }
        if let Some(mut zone) = zones.remove(name) {
            zone.stop()?;
        }
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.zones.lock().contains_key(name)
    }

    pub fn zone_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.zones.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Run `f` against one zone while holding the registry lock
    pub fn with_zone<R>(&self, name: &str, f: impl FnOnce(&mut RoutingZone) -> XbResult<R>) -> XbResult<R> {
        let mut zones = self.zones.lock();
        let zone = zones
            .get_mut(name)
            .ok_or_else(|| XbError::InvalidParam(format!("unknown zone '{}'", name)))?;
        f(zone)
    }

    pub fn add_derived_zone(&self, base: &str, derived: &str) -> XbResult<()> {
        self.with_pair(base, derived, |b, d| b.add_derived_zone(d))
    }

    pub fn delete_derived_zone(&self, base: &str, derived: &str) -> XbResult<()> {
        self.with_pair(base, derived, |b, d| b.delete_derived_zone(d))
    }

    fn with_pair(
        &self,
        base: &str,
        derived: &str,
        f: impl FnOnce(&mut RoutingZone, &mut RoutingZone) -> XbResult<()>,
    ) -> XbResult<()> {
        if base == derived {
            return Err(XbError::InvalidParam(format!("zone '{}' cannot be derived from itself", base)));
        }
        let mut zones = self.zones.lock();
        if !zones.contains_key(base) {
            return Err(XbError::InvalidParam(format!("unknown zone '{}'", base)));
        }
        let mut derived_zone = zones
            .remove(derived)
            .ok_or_else(|| XbError::InvalidParam(format!("unknown zone '{}'", derived)))?;
        let result = match zones.get_mut(base) {
            Some(base_zone) => f(base_zone, &mut derived_zone),
            None => Err(XbError::InvalidParam(format!("unknown zone '{}'", base))),
        };
        zones.insert(derived.to_string(), derived_zone);
        result
    }

    /// Stop every zone
    pub fn stop_all(&self) {
        let mut zones = self.zones.lock();
        for (name, zone) in zones.iter_mut() {
            if let Err(e) = zone.stop() {
                log::error!("failed to stop zone '{}': {}", name, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_lookup() {
        let registry = ZoneRegistry::new(EngineConfig::default()).unwrap();
        registry.create_zone("b").unwrap();
        registry.create_zone("a").unwrap();
        assert!(matches!(registry.create_zone("a"), Err(XbError::InvalidParam(_))));
        assert_eq!(registry.zone_names(), vec!["a".to_string(), "b".to_string()]);

        let initialized = registry.with_zone("a", |z| Ok(z.is_initialized())).unwrap();
        assert!(initialized);
        assert!(matches!(
            registry.with_zone("missing", |_| Ok(())),
            Err(XbError::InvalidParam(_))
        ));

        registry.remove_zone("a").unwrap();
        assert!(!registry.contains("a"));
    }

    #[test]
    fn test_derived_pair_validation() {
        let registry = ZoneRegistry::new(EngineConfig::default()).unwrap();
        registry.create_zone("base").unwrap();
        assert!(matches!(
            registry.add_derived_zone("base", "base"),
            Err(XbError::InvalidParam(_))
        ));
        assert!(matches!(
            registry.add_derived_zone("base", "nope"),
            Err(XbError::InvalidParam(_))
        ));

        registry.create_zone("derived").unwrap();
        // no sinks linked yet
        assert!(matches!(
            registry.add_derived_zone("base", "derived"),
            Err(XbError::Failed(_))
        ));
        assert!(registry.contains("derived"));
    }
}
