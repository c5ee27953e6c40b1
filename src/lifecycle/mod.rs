//! Core lifecycle management.
//!
//! A Core is one mobile-network core instance described by free-form JSON
//! parameters. Its state moves only along these edges:
//!
//! ```text
//! Created ──deploy──▶ Deploying ──▶ Deployed ──stop──▶ Stopping ──▶ Stopped
//! ```
//!
//! Deletion is allowed only from `Stopped`. Transitions on the same Core are
//! serialized; different Cores proceed independently.

pub mod provisioner;
pub mod store;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use self::provisioner::Provisioner;
use self::store::{CoreStore, StoreError};

/// Lifecycle state of a Core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CoreState {
    /// Recorded, nothing running
    Created,
    /// Deployment in progress
    Deploying,
    /// Running
    Deployed,
    /// Shutdown in progress
    Stopping,
    /// Shut down; may be deleted
    Stopped,
}

impl fmt::Display for CoreState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Requested transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoreAction {
    /// `Created → Deploying → Deployed`
    Deploy,
    /// `Deployed → Stopping → Stopped`
    Stop,
}

impl CoreAction {
    /// State the Core must be in for this action to start.
    #[must_use]
    pub fn source(self) -> CoreState {
        match self {
            Self::Deploy => CoreState::Created,
            Self::Stop => CoreState::Deployed,
        }
    }

    /// State held while the action runs.
    #[must_use]
    pub fn intermediate(self) -> CoreState {
        match self {
            Self::Deploy => CoreState::Deploying,
            Self::Stop => CoreState::Stopping,
        }
    }

    /// State once the action completes.
    #[must_use]
    pub fn target(self) -> CoreState {
        match self {
            Self::Deploy => CoreState::Deployed,
            Self::Stop => CoreState::Stopped,
        }
    }
}

impl fmt::Display for CoreAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Deploy => "deploy",
            Self::Stop => "stop",
        })
    }
}

impl FromStr for CoreAction {
    type Err = LifecycleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "deploy" => Ok(Self::Deploy),
            "stop" => Ok(Self::Stop),
            other => Err(LifecycleError::UnknownAction(other.to_string())),
        }
    }
}

/// A network function belonging to a Core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkFunction {
    /// Function name, e.g. "amf"
    pub name: String,
    /// Function-specific settings
    #[serde(default)]
    pub settings: serde_json::Value,
}

/// A managed Core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Core {
    /// Stable identifier
    #[serde(rename = "uuid")]
    pub id: Uuid,
    /// Current lifecycle state
    pub state: CoreState,
    /// Free-form parameters supplied at creation
    pub parameters: serde_json::Value,
    /// Network functions, in order
    #[serde(default, rename = "networkFunctions", alias = "network_functions")]
    pub network_functions: Vec<NetworkFunction>,
}

impl Core {
    fn new(parameters: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            state: CoreState::Created,
            parameters,
            network_functions: Vec::new(),
        }
    }
}

/// Lifecycle failures.
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    /// No Core with this id.
    #[error("core {0} not found")]
    NotFound(Uuid),

    /// The Core's state does not allow the operation.
    #[error("trying to {operation} core {id} that is {state}")]
    InvalidState {
        /// Core id
        id: Uuid,
        /// Its current state
        state: CoreState,
        /// What was attempted
        operation: String,
    },

    /// Parameters are not a JSON object.
    #[error("core parameters must be a JSON object")]
    InvalidParameters,

    /// `action` is neither deploy nor stop.
    #[error("unknown action {0:?}, expected deploy or stop")]
    UnknownAction(String),

    /// The provisioning backend failed; the Core stays in its intermediate state.
    #[error("provisioning failed for core {id}: {reason}")]
    Provisioning {
        /// Core id
        id: Uuid,
        /// Backend message
        reason: String,
    },

    /// Persistence failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl LifecycleError {
    /// Stable error code for logs and clients.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "CORE_NOTFOUND",
            Self::InvalidState { .. } => "CORE_INVALIDSTATE",
            Self::InvalidParameters | Self::UnknownAction(_) => "CORE_BADREQUEST",
            Self::Provisioning { .. } => "CORE_PROVISIONING",
            Self::Store(_) => "CORE_STORE",
        }
    }

    /// HTTP status for this failure.
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::InvalidState { .. } => StatusCode::CONFLICT,
            Self::InvalidParameters | Self::UnknownAction(_) => StatusCode::BAD_REQUEST,
            Self::Provisioning { .. } | Self::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Creates, transitions, lists and deletes Cores.
pub struct LifecycleManager {
    store: Arc<dyn CoreStore>,
    provisioner: Arc<dyn Provisioner>,
    locks: parking_lot::Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
}

impl LifecycleManager {
    /// Create a manager over `store`, driving `provisioner` on transitions.
    pub fn new(store: Arc<dyn CoreStore>, provisioner: Arc<dyn Provisioner>) -> Self {
        Self {
            store,
            provisioner,
            locks: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    /// Name of the storage backend.
    #[must_use]
    pub fn backend(&self) -> &'static str {
        self.store.backend()
    }

    /// Record a new Core in `Created`.
    ///
    /// # Errors
    ///
    /// [`LifecycleError::InvalidParameters`] unless `parameters` is a JSON
    /// object; store errors otherwise.
    pub async fn create(&self, parameters: serde_json::Value) -> Result<Core, LifecycleError> {
        if !parameters.is_object() {
            return Err(LifecycleError::InvalidParameters);
        }
        let core = Core::new(parameters);
        self.store.upsert(&core).await?;
        info!(core = %core.id, "Core created");
        Ok(core)
    }

    /// Fetch one Core.
    ///
    /// # Errors
    ///
    /// [`LifecycleError::NotFound`] if absent.
    pub async fn get(&self, id: Uuid) -> Result<Core, LifecycleError> {
        self.store
            .get(id)
            .await?
            .ok_or(LifecycleError::NotFound(id))
    }

    /// All Cores by id.
    ///
    /// # Errors
    ///
    /// Store errors.
    pub async fn list(&self) -> Result<BTreeMap<Uuid, Core>, LifecycleError> {
        Ok(self
            .store
            .list()
            .await?
            .into_iter()
            .map(|core| (core.id, core))
            .collect())
    }

    /// Apply `action` to a Core.
    ///
    /// Repeating an action whose target state is already reached returns the
    /// Core unchanged.
    ///
    /// # Errors
    ///
    /// [`LifecycleError::NotFound`], [`LifecycleError::InvalidState`] when the
    /// Core is not in the action's source state, or
    /// [`LifecycleError::Provisioning`] when the backend fails.
    pub async fn transition(&self, id: Uuid, action: CoreAction) -> Result<Core, LifecycleError> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let mut core = self.get(id).await?;
        if core.state == action.target() {
            return Ok(core);
        }
        if core.state != action.source() {
            return Err(LifecycleError::InvalidState {
                id,
                state: core.state,
                operation: action.to_string(),
            });
        }

        core.state = action.intermediate();
        self.store.upsert(&core).await?;
        info!(core = %id, state = %core.state, "Core transition started");

        let outcome = match action {
            CoreAction::Deploy => self.provisioner.deploy(&core).await,
            CoreAction::Stop => self.provisioner.stop(&core).await,
        };
        if let Err(e) = outcome {
            warn!(core = %id, state = %core.state, error = %e, "Provisioning failed");
            return Err(LifecycleError::Provisioning {
                id,
                reason: e.to_string(),
            });
        }

        core.state = action.target();
        self.store.upsert(&core).await?;
        info!(core = %id, state = %core.state, "Core transition completed");
        Ok(core)
    }

    /// Remove a `Stopped` Core.
    ///
    /// # Errors
    ///
    /// [`LifecycleError::NotFound`], or [`LifecycleError::InvalidState`] if
    /// the Core is not `Stopped`; the record is left untouched.
    pub async fn delete(&self, id: Uuid) -> Result<Core, LifecycleError> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let core = self.get(id).await?;
        if core.state != CoreState::Stopped {
            return Err(LifecycleError::InvalidState {
                id,
                state: core.state,
                operation: "delete".to_string(),
            });
        }
        if !self.store.delete(id).await? {
            return Err(LifecycleError::NotFound(id));
        }
        self.locks.lock().remove(&id);
        info!(core = %id, "Core deleted");
        Ok(core)
    }

    fn lock_for(&self, id: Uuid) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(self.locks.lock().entry(id).or_default())
    }
}
