//! Grain connection manager
//!
//! Keeps one shared startup future per grain so concurrent openers wait on the
//! same supervisor instead of launching duplicates. Calls made through
//! [`GrainManager::use_grain`] survive a single backend death: a
//! `Disconnected` failure restarts the grain and the call is issued once more.

use crate::quota::excessively_over_quota;
use crate::rpc::{Backend, StartGrainParams, Supervisor};
use chrono::Utc;
use futures::future::{BoxFuture, FutureExt, Shared};
use grainhost_core::{
    Account, AccountId, ApiToken, AppId, Grain, GrainId, GrainhostConfig, GrainhostError,
    IdentityId, Result, Session, Store, StoreEvent, TokenOwner,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

/// A started grain
#[derive(Clone)]
pub struct RunningGrain {
    /// Owning account
    pub owner: AccountId,
    /// Supervisor capability
    pub supervisor: Arc<dyn Supervisor>,
}

impl std::fmt::Debug for RunningGrain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunningGrain")
            .field("owner", &self.owner)
            .finish_non_exhaustive()
    }
}

type StartFuture = Shared<BoxFuture<'static, Result<RunningGrain>>>;

struct Slot {
    generation: u64,
    future: StartFuture,
}

#[derive(Default)]
struct Running {
    next_generation: u64,
    slots: HashMap<GrainId, Slot>,
}

/// Starts grains and hands out their supervisors
pub struct GrainManager {
    store: Arc<dyn Store>,
    backend: Arc<dyn Backend>,
    config: Arc<GrainhostConfig>,
    running: Mutex<Running>,
}

impl GrainManager {
    /// Create a manager with no running grains
    pub fn new(store: Arc<dyn Store>, backend: Arc<dyn Backend>, config: Arc<GrainhostConfig>) -> Self {
        Self {
            store,
            backend,
            config,
            running: Mutex::new(Running::default()),
        }
    }

    /// Document store
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Configuration
    pub fn config(&self) -> &Arc<GrainhostConfig> {
        &self.config
    }

    /// Whether a startup is recorded for the grain
    pub fn is_running(&self, grain_id: &GrainId) -> bool {
        self.running.lock().slots.contains_key(grain_id)
    }

    /// Supervisor of a grain, starting it if needed.
    ///
    /// With `is_retry` the grain is restarted even if it is believed running.
    pub async fn open_grain(&self, grain_id: &GrainId, is_retry: bool) -> Result<RunningGrain> {
        let (generation, future) = {
            let mut running = self.running.lock();
            let existing = if is_retry {
                None
            } else {
                running
                    .slots
                    .get(grain_id)
                    .map(|slot| (slot.generation, slot.future.clone()))
            };
            match existing {
                Some(existing) => existing,
                None => self.start_locked(&mut running, grain_id)?,
            }
        };
        self.await_start(grain_id, generation, future).await
    }

    /// Start a grain from its installed package or overriding dev app
    pub async fn continue_grain(&self, grain_id: &GrainId) -> Result<RunningGrain> {
        let (generation, future) = {
            let mut running = self.running.lock();
            self.start_locked(&mut running, grain_id)?
        };
        self.await_start(grain_id, generation, future).await
    }

    /// Run `call` against the grain's supervisor, restarting the grain and
    /// retrying once if the backend disconnects.
    pub async fn use_grain<T, F, Fut>(&self, grain_id: &GrainId, call: F) -> Result<T>
    where
        F: Fn(Arc<dyn Supervisor>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let first = async {
            let grain = self.open_grain(grain_id, false).await?;
            call(grain.supervisor).await
        }
        .await;

        match first {
            Err(err) if err.is_disconnected() => {
                tracing::warn!(grain_id = %grain_id, error = %err, "grain disconnected; restarting");
                let grain = self.open_grain(grain_id, true).await?;
                let retried = call(grain.supervisor).await;
                if let Err(err) = &retried {
                    tracing::error!(grain_id = %grain_id, error = %err, "grain call failed after restart");
                }
                retried
            }
            other => other,
        }
    }

    /// Forget the running entry so the next open starts the grain again
    pub fn forget(&self, grain_id: &GrainId) {
        self.running.lock().slots.remove(grain_id);
    }

    /// Stop a grain.
    ///
    /// Unless `keep_sessions` is set, the grain's sessions are removed too.
    pub async fn shutdown_grain(&self, grain_id: &GrainId, owner: &AccountId, keep_sessions: bool) -> Result<()> {
        if !keep_sessions {
            let grain = grain_id.clone();
            self.store
                .remove_sessions_where(&|session: &Session| session.grain_id == grain)?;
            self.forget(grain_id);
        }

        let supervisor = self.backend.get_grain(owner, grain_id).await?;
        match supervisor.shutdown().await {
            Ok(()) => Err(GrainhostError::internal(
                "expected shutdown() to end in a disconnect",
            )),
            Err(err) if err.is_disconnected() => {
                tracing::info!(grain_id = %grain_id, "grain shut down");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Delete a grain's storage in the backend
    pub async fn delete_grain(&self, grain_id: &GrainId, owner: &AccountId) -> Result<()> {
        self.forget(grain_id);
        match self.backend.delete_grain(owner, grain_id).await {
            Ok(()) => {
                tracing::info!(grain_id = %grain_id, "grain deleted");
                Ok(())
            }
            Err(err) => {
                tracing::error!(grain_id = %grain_id, error = %err, "problem deleting grain");
                Err(err)
            }
        }
    }

    /// Shut down every grain of an app, used when its dev app changes
    pub async fn shutdown_app(&self, app_id: &AppId) -> Result<()> {
        for grain in self.store.grains_for_app(app_id)? {
            self.shutdown_grain(&grain.id, &grain.owner_account, false).await?;
        }
        Ok(())
    }

    /// Shut down an app's grains whenever a dev app for it is registered
    pub fn spawn_dev_app_watcher(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        let mut events = manager.store.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(StoreEvent::DevAppChanged(app_id)) => {
                        if let Err(err) = manager.shutdown_app(&app_id).await {
                            tracing::error!(app_id = %app_id, error = %err, "failed to shut down dev app grains");
                        }
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "dev app watcher lagged behind store events");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    /// Record activity on a grain by an account and identity.
    ///
    /// Stamps the grain, the account and the identity's user-owned grants on
    /// the grain; refreshes the owner's storage usage when quota is enforced.
    pub async fn update_last_active(
        &self,
        grain_id: &GrainId,
        account_id: Option<&AccountId>,
        identity_id: Option<&IdentityId>,
    ) -> Result<()> {
        let now = Utc::now();
        let grain = self
            .store
            .update_grain(grain_id, &mut |grain: &mut Grain| grain.last_used = Some(now))?;
        if let Some(account_id) = account_id {
            self.store
                .update_account(account_id, &mut |account: &mut Account| {
                    account.last_active = Some(now);
                })?;
        }
        if let Some(identity_id) = identity_id {
            let received: Vec<ApiToken> = self
                .store
                .tokens_for_grain(grain_id)?
                .into_iter()
                .filter(|token| token.recipient_identity() == Some(identity_id))
                .collect();
            for token in received {
                self.store.update_token(&token.id, &mut |token: &mut ApiToken| {
                    if let TokenOwner::User(user) = &mut token.owner {
                        user.last_used = Some(now);
                    }
                })?;
            }
        }

        if self.config.quota.enabled {
            if let Some(grain) = grain {
                match self.backend.user_storage_usage(&grain.owner_account).await {
                    Ok(size) => {
                        self.store.update_account(&grain.owner_account, &mut |account: &mut Account| {
                            account.storage_usage = Some(size);
                        })?;
                    }
                    Err(err) if err.is_unimplemented() => {}
                    Err(err) => {
                        tracing::error!(account_id = %grain.owner_account, error = %err, "error getting storage usage");
                    }
                }
            }
        }
        Ok(())
    }

    fn start_locked(&self, running: &mut Running, grain_id: &GrainId) -> Result<(u64, StartFuture)> {
        let params = self.start_params(grain_id)?;
        let generation = running.next_generation;
        running.next_generation += 1;

        let backend = Arc::clone(&self.backend);
        let future = async move {
            let owner = params.owner.clone();
            let supervisor = backend.start_grain(params).await?;
            Ok(RunningGrain { owner, supervisor })
        }
        .boxed()
        .shared();

        tracing::info!(grain_id = %grain_id, generation, "starting grain");
        running.slots.insert(
            grain_id.clone(),
            Slot {
                generation,
                future: future.clone(),
            },
        );
        Ok((generation, future))
    }

    fn start_params(&self, grain_id: &GrainId) -> Result<StartGrainParams> {
        let grain = self
            .store
            .get_grain(grain_id)?
            .ok_or_else(|| GrainhostError::not_found(format!("grain {grain_id}")))?;

        let (package_id, manifest, dev_mode) = match self.store.get_dev_app(&grain.app_id)? {
            Some(dev_app) => (dev_app.package_id, dev_app.manifest, true),
            None => {
                let package = self.store.get_package(&grain.package_id)?.ok_or_else(|| {
                    GrainhostError::internal(format!("grain's package {} not installed", grain.package_id))
                })?;
                (package.id, package.manifest, false)
            }
        };
        let command = manifest.continue_command.ok_or_else(|| {
            GrainhostError::internal(format!("package {package_id} defines no continue command"))
        })?;

        if let Some(owner) = self.store.get_account(&grain.owner_account)? {
            if excessively_over_quota(&self.config, self.store.as_ref(), &owner)?.is_exceeded() {
                return Err(GrainhostError::quota_exceeded(
                    "cannot start grain because owner's storage is exhausted",
                ));
            }
        }

        Ok(StartGrainParams {
            owner: grain.owner_account,
            grain_id: grain.id,
            package_id,
            command: command.normalized(),
            is_new: false,
            dev_mode,
        })
    }

    async fn await_start(&self, grain_id: &GrainId, generation: u64, future: StartFuture) -> Result<RunningGrain> {
        let result = future.await;
        if let Err(err) = &result {
            let mut running = self.running.lock();
            if running
                .slots
                .get(grain_id)
                .is_some_and(|slot| slot.generation == generation)
            {
                running.slots.remove(grain_id);
            }
            tracing::warn!(grain_id = %grain_id, error = %err, "grain failed to start");
        }
        result
    }
}
