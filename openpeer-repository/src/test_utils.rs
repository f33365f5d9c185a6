// SPDX-License-Identifier: MIT OR Apache-2.0

//! Helpers for exercising repositories in tests: an in-process network
//! routing peer messages between repositories, and a scripted transport for
//! driving a single repository against canned answers.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use openpeer_core::Location;
use openpeer_store::MemoryCacheStore;

use crate::config::RepositoryConfig;
use crate::message::{PeerRequest, PeerResult};
use crate::repository::Repository;
use crate::traits::{MessageTransport, TransportError};

static INIT: Once = Once::new();

/// Installs a tracing subscriber writing to the test output, once per
/// process. Respects `RUST_LOG`.
pub fn init_tracing() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .init();
    });
}

/// A peer location for tests.
pub fn peer(uri: &str) -> Location {
    Location::peer(uri, "main")
}

/// Repository configuration with intervals short enough for tests.
pub fn test_config() -> RepositoryConfig {
    RepositoryConfig {
        sweep_interval: Duration::from_secs(3600),
        disconnect_grace: Duration::from_secs(3600),
        document_idle: Duration::from_secs(3600),
        ..Default::default()
    }
}

/// An in-process network connecting repositories by their identity location.
///
/// Each repository sends through a [`TestTransport`] which looks the target
/// up in the shared routing table and calls straight into its request
/// handler.
#[derive(Clone, Default)]
pub struct TestNetwork {
    repositories: Arc<Mutex<HashMap<Location, Repository>>>,
}

impl TestNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawns a repository wired into this network under the given identity.
    pub fn spawn_peer(&self, identity: Location, config: RepositoryConfig) -> Repository {
        let transport = TestTransport {
            identity: identity.clone(),
            network: self.clone(),
        };
        let repository = Repository::spawn(
            identity.clone(),
            config,
            transport,
            MemoryCacheStore::default(),
        );
        self.lock().insert(identity, repository.clone());
        repository
    }

    /// Drops the route to a location; requests towards it fail from then on.
    pub fn drop_route(&self, location: &Location) {
        self.lock().remove(location);
    }

    fn route(&self, to: &Location) -> Option<Repository> {
        self.lock().get(to).cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Location, Repository>> {
        // Lock poisoning means a test already panicked.
        self.repositories.lock().expect("network lock poisoned")
    }
}

/// Transport delivering requests to the repositories registered in a
/// [`TestNetwork`].
#[derive(Clone)]
pub struct TestTransport {
    identity: Location,
    network: TestNetwork,
}

impl MessageTransport for TestTransport {
    fn request(
        &self,
        to: Location,
        request: PeerRequest,
    ) -> impl Future<Output = Result<PeerResult, TransportError>> + Send {
        let network = self.network.clone();
        let from = self.identity.clone();
        async move {
            let Some(target) = network.route(&to) else {
                return Err(TransportError::NoRoute(to));
            };
            let result = target
                .handle_request(from, request)
                .await
                .map_err(|_| TransportError::Disconnected)?;
            // A silently dropped request never answers.
            result.ok_or(TransportError::Timeout)
        }
    }

    fn notify(
        &self,
        to: Location,
        request: PeerRequest,
    ) -> impl Future<Output = Result<(), TransportError>> + Send {
        let network = self.network.clone();
        let from = self.identity.clone();
        async move {
            let Some(target) = network.route(&to) else {
                return Err(TransportError::NoRoute(to));
            };
            target
                .handle_request(from, request)
                .await
                .map_err(|_| TransportError::Disconnected)?;
            Ok(())
        }
    }
}

/// Transport answering every request from a scripted queue, recording what
/// was sent. Runs out of script answers with a timeout.
#[derive(Clone, Default)]
pub struct ScriptTransport {
    script: Arc<Mutex<VecDeque<Result<PeerResult, TransportError>>>>,
    sent: Arc<Mutex<Vec<(Location, PeerRequest)>>>,
}

impl ScriptTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues the answer for the next request.
    pub fn answer(&self, result: Result<PeerResult, TransportError>) {
        self.script
            .lock()
            .expect("script lock poisoned")
            .push_back(result);
    }

    /// Everything sent through this transport so far, requests and
    /// notifications alike.
    pub fn sent(&self) -> Vec<(Location, PeerRequest)> {
        self.sent.lock().expect("sent lock poisoned").clone()
    }
}

impl MessageTransport for ScriptTransport {
    fn request(
        &self,
        to: Location,
        request: PeerRequest,
    ) -> impl Future<Output = Result<PeerResult, TransportError>> + Send {
        let script = self.script.clone();
        let sent = self.sent.clone();
        async move {
            sent.lock().expect("sent lock poisoned").push((to, request));
            script
                .lock()
                .expect("script lock poisoned")
                .pop_front()
                .unwrap_or(Err(TransportError::Timeout))
        }
    }

    fn notify(
        &self,
        to: Location,
        request: PeerRequest,
    ) -> impl Future<Output = Result<(), TransportError>> + Send {
        let sent = self.sent.clone();
        async move {
            sent.lock().expect("sent lock poisoned").push((to, request));
            Ok(())
        }
    }
}
