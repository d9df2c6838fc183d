//! Store deployment and schema upgrades
//!
//! Each tier has an ordered list of steps from the script provider. A step
//! only applies when the store sits exactly at the step's `from` version,
//! so replaying the whole list is harmless.

use crate::client::StoreClient;
use shardmap_common::{Error, Result, ShardLocation, StoreVersion};
use shardmap_store::{ScriptProvider, StoreKind, StoreRequest, UpgradeStep};
use tracing::{debug, info};

/// Deploys and upgrades the global and local stores
pub struct UpgradeCoordinator<'a> {
    client: &'a StoreClient,
    scripts: &'a dyn ScriptProvider,
}

impl<'a> UpgradeCoordinator<'a> {
    #[must_use]
    pub fn new(client: &'a StoreClient, scripts: &'a dyn ScriptProvider) -> Self {
        Self { client, scripts }
    }

    /// Deployed global store version, `None` when not deployed
    pub fn global_version(&self) -> Result<Option<StoreVersion>> {
        Ok(self
            .client
            .global_unchecked("read global store version", StoreRequest::GetVersion)?
            .version())
    }

    /// Deployed local store version, `None` when not deployed
    pub fn local_version(&self, location: &ShardLocation) -> Result<Option<StoreVersion>> {
        Ok(self
            .client
            .local_unchecked(
                "read local store version",
                location,
                StoreRequest::GetVersion,
            )?
            .version())
    }

    /// Deploy or upgrade the global store up to `target` (latest when `None`)
    pub fn upgrade_global(&self, target: Option<StoreVersion>) -> Result<StoreVersion> {
        let steps = self.scripts.global_steps();
        let target = resolve_target(StoreKind::Global, &steps, target)?;
        for step in steps.into_iter().filter(|s| s.to <= target) {
            let (from, to) = (step.from, step.to);
            let applied = self
                .client
                .global_unchecked("upgrade global store", upgrade_request(step))?
                .affected;
            log_step(StoreKind::Global, None, from, to, applied);
        }
        self.global_version()?
            .ok_or_else(|| Error::illegal_state("global store has no version after upgrade"))
    }

    /// Deploy or upgrade a local store up to `target` (latest when `None`)
    pub fn upgrade_local(
        &self,
        location: &ShardLocation,
        target: Option<StoreVersion>,
    ) -> Result<StoreVersion> {
        let steps = self.scripts.local_steps();
        let target = resolve_target(StoreKind::Local, &steps, target)?;
        for step in steps.into_iter().filter(|s| s.to <= target) {
            let (from, to) = (step.from, step.to);
            let applied = self
                .client
                .local_unchecked("upgrade local store", location, upgrade_request(step))?
                .affected;
            log_step(StoreKind::Local, Some(location), from, to, applied);
        }
        self.local_version(location)?.ok_or_else(|| {
            Error::illegal_state(format!(
                "local store at {location} has no version after upgrade"
            ))
        })
    }

    /// Deploy a local store at the latest version unless one already exists
    pub fn ensure_local_deployed(&self, location: &ShardLocation) -> Result<()> {
        if self.local_version(location)?.is_none() {
            self.upgrade_local(location, None)?;
        }
        Ok(())
    }

    /// Drop every global table, leaving an undeployed store
    pub fn reset_global(&self) -> Result<()> {
        self.client.global_unchecked(
            "reset global store",
            StoreRequest::Reset {
                actions: self.scripts.drop_actions(StoreKind::Global),
            },
        )?;
        info!("global store reset");
        Ok(())
    }
}

fn upgrade_request(step: UpgradeStep) -> StoreRequest {
    StoreRequest::Upgrade {
        from: step.from,
        to: step.to,
        actions: step.actions,
    }
}

/// Target version a request resolves to; must be the end of some step
fn resolve_target(
    kind: StoreKind,
    steps: &[UpgradeStep],
    target: Option<StoreVersion>,
) -> Result<StoreVersion> {
    let latest = steps
        .last()
        .map(|s| s.to)
        .ok_or_else(|| Error::illegal_state(format!("no {kind:?} store schema steps")))?;
    match target {
        None => Ok(latest),
        Some(target) if steps.iter().any(|s| s.to == target) => Ok(target),
        Some(target) => Err(Error::invalid_argument(format!(
            "{kind:?} store version {target} is unknown, latest is {latest}"
        ))),
    }
}

fn log_step(
    kind: StoreKind,
    location: Option<&ShardLocation>,
    from: Option<StoreVersion>,
    to: StoreVersion,
    applied: u64,
) {
    let location = location.map(ToString::to_string).unwrap_or_default();
    if applied == 0 {
        debug!(?kind, %location, %to, "schema step already applied");
        return;
    }
    match from {
        None => info!(?kind, %location, %to, "store deployed"),
        Some(from) => info!(?kind, %location, %from, %to, "store upgraded"),
    }
}
