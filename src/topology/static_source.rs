//! Topology seeded from the `[[upstreams]]` config section.
//!
//! Tracks what it applied so a reload only touches upstreams the file owns;
//! upstreams added by plugins or the admin API are left alone.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use crate::config::{BackendConfig, UpstreamConfig};
use crate::error::{ErrorCollector, MultiError};
use crate::topology::manager::{Manager, TopologyError};
use crate::topology::types::{Backend, BackendId, UpstreamId};

type Applied = HashMap<UpstreamId, UpstreamConfig>;

#[derive(Debug)]
pub struct StaticSource {
    manager: Arc<Manager>,
    applied: Mutex<Applied>,
}

impl StaticSource {
    pub fn new(manager: Arc<Manager>) -> Self {
        Self {
            manager,
            applied: Mutex::new(HashMap::new()),
        }
    }

    /// Bring the manager in line with `desired`.
    ///
    /// Unchanged upstreams are skipped, changed ones replaced, vanished ones
    /// removed. Every failure is collected; successful steps are kept.
    pub fn apply(&self, desired: &[UpstreamConfig]) -> Result<(), MultiError<TopologyError>> {
        let mut applied = self.applied.lock().unwrap_or_else(|p| p.into_inner());
        let errors = ErrorCollector::new();

        let wanted: BTreeMap<UpstreamId, &UpstreamConfig> = desired
            .iter()
            .map(|u| (UpstreamId::from(u.id.as_str()), u))
            .collect();

        let vanished: Vec<UpstreamId> = applied
            .keys()
            .filter(|id| !wanted.contains_key(*id))
            .cloned()
            .collect();
        for id in vanished {
            applied.remove(&id);
            match self.manager.remove_upstream(&id) {
                Ok(_) | Err(TopologyError::UpstreamNotFound(_)) => {}
                Err(e) => errors.push(e),
            }
        }

        for (id, config) in wanted {
            let previous = applied.get(&id);
            if previous == Some(config) {
                continue;
            }
            let upstream_changed = previous.map_or(true, |p| p.to_upstream() != config.to_upstream());
            if upstream_changed {
                if let Err(e) = self.manager.add_upstream(config.to_upstream()) {
                    errors.push(e);
                    continue;
                }
            }

            let before: HashMap<&str, &BackendConfig> = previous
                .map(|p| p.backends.iter().map(|b| (b.id.as_str(), b)).collect())
                .unwrap_or_default();
            let after: HashMap<&str, &BackendConfig> =
                config.backends.iter().map(|b| (b.id.as_str(), b)).collect();

            for (backend_id, old) in &before {
                if after.get(backend_id) != Some(old) {
                    match self.manager.remove_backend(&BackendId::from(*backend_id)) {
                        Ok(_) | Err(TopologyError::BackendNotFound(_)) => {}
                        Err(e) => errors.push(e),
                    }
                }
            }
            for (backend_id, new) in &after {
                if before.get(backend_id) == Some(new) {
                    continue;
                }
                let result = Backend::new(*backend_id, &new.address)
                    .map_err(|e| TopologyError::InvalidBackendAddress {
                        address: new.address.clone(),
                        reason: e.to_string(),
                    })
                    .and_then(|backend| {
                        let backend = match &new.health_check {
                            Some(check) => backend.with_health_check(check.clone()),
                            None => backend,
                        };
                        self.manager.add_backend(&id, backend)
                    });
                if let Err(e) = result {
                    errors.push(e);
                }
            }

            applied.insert(id, config.clone());
        }

        let result = errors.into_result();
        if let Err(e) = &result {
            tracing::warn!(error = %e, "Static topology partially applied");
        }
        result
    }
}
