//! Rejects identical requests while one is still running

use std::collections::HashSet;
use std::fmt::Debug;

use parking_lot::Mutex;
use tracing::warn;

use crate::common::error::{DateraError, DateraResult};

/// Fingerprints of the requests being served
#[derive(Debug, Default)]
pub struct InFlight {
    /// `component|method|request`
    requests: Mutex<HashSet<String>>,
}

/// Releases its fingerprint when dropped
#[derive(Debug)]
pub struct InFlightGuard<'a> {
    /// Registry holding the fingerprint
    owner: &'a InFlight,
    /// The fingerprint
    key: String,
}

impl InFlight {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a request, an identical request in flight is
    /// `OperationInProgress`. Secrets are already stripped by `Debug`.
    pub fn enter<R: Debug>(
        &self,
        component: &str,
        method: &str,
        req: &R,
    ) -> DateraResult<InFlightGuard<'_>> {
        let key = format!("{component}|{method}|{req:?}");
        let mut requests = self.requests.lock();
        if requests.contains(&key) {
            warn!("{} {} rejected, an identical request is in flight", component, method);
            return Err(DateraError::OperationInProgress {
                context: vec![format!("{component} {method} is already running")],
            });
        }
        requests.insert(key.clone());
        Ok(InFlightGuard { owner: self, key })
    }

    /// Number of requests in flight
    #[must_use]
    pub fn len(&self) -> usize {
        self.requests.lock().len()
    }

    /// Whether nothing is in flight
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.requests.lock().is_empty()
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.owner.requests.lock().remove(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::csi::proto::csi::CreateVolumeRequest;

    #[test]
    fn test_duplicate_rejected_until_released() {
        let inflight = InFlight::new();
        let req = CreateVolumeRequest {
            name: "pvc-1".to_owned(),
            ..CreateVolumeRequest::default()
        };
        let guard = inflight.enter("controller", "create_volume", &req).unwrap();
        let err = inflight
            .enter("controller", "create_volume", &req)
            .unwrap_err();
        assert!(matches!(err, DateraError::OperationInProgress { .. }));

        // Other requests are not serialized
        let other = CreateVolumeRequest {
            name: "pvc-2".to_owned(),
            ..CreateVolumeRequest::default()
        };
        let _other_guard = inflight.enter("controller", "create_volume", &other).unwrap();
        assert!(inflight.enter("node", "create_volume", &req).is_ok());

        drop(guard);
        assert_eq!(inflight.len(), 1);
        assert!(inflight.enter("controller", "create_volume", &req).is_ok());
    }

    #[test]
    fn test_released_on_error_path() {
        fn failing(inflight: &InFlight) -> DateraResult<()> {
            let _guard = inflight.enter("node", "node_stage_volume", &"vol")?;
            Err(DateraError::ArgumentInvalid { context: vec![] })
        }
        let inflight = InFlight::new();
        assert!(failing(&inflight).is_err());
        assert!(inflight.is_empty());
    }
}
