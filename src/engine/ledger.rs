use std::sync::Arc;

use tokio::sync::OwnedRwLockWriteGuard;
use tracing::debug;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability::{self, outcome_label};

use super::calendar::now_ms;
use super::coordinator::Plan;
use super::{Engine, EngineError};

/// Result of [`Engine::release_unit`]. Both variants carry the same record:
/// the one produced by the release that actually took effect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Release {
    Released(Released),
    AlreadyReleased(Released),
}

impl Release {
    pub fn record(&self) -> &Released {
        match self {
            Release::Released(r) | Release::AlreadyReleased(r) => r,
        }
    }

    pub fn was_already_released(&self) -> bool {
        matches!(self, Release::AlreadyReleased(_))
    }
}

pub(super) fn validate_holder(holder: &HolderRef) -> Result<(), EngineError> {
    if holder.as_str().trim().is_empty() {
        return Err(EngineError::LimitExceeded("holder id is empty"));
    }
    if holder.as_str().len() > MAX_HOLDER_ID_LEN {
        return Err(EngineError::LimitExceeded("holder id too long"));
    }
    Ok(())
}

pub(super) fn validate_name(name: &Option<String>) -> Result<(), EngineError> {
    match name {
        Some(n) if n.len() > MAX_NAME_LEN => Err(EngineError::LimitExceeded("name too long")),
        _ => Ok(()),
    }
}

fn unexpected(outcome: Outcome) -> EngineError {
    EngineError::AtomicityFailure(format!("commit produced unexpected outcome {outcome:?}"))
}

impl Engine {
    // ── Catalog ──────────────────────────────────────────────

    pub async fn create_inventory(
        &self,
        id: Ulid,
        name: Option<String>,
        total: u32,
    ) -> Result<(), EngineError> {
        validate_name(&name)?;
        if total > MAX_UNITS_PER_INVENTORY {
            return Err(EngineError::LimitExceeded("too many units"));
        }
        let _catalog = self.catalog.lock().await;
        let _commit = self.store.begin_commit().await;
        if self.store.resource_count() >= MAX_RESOURCES {
            return Err(EngineError::LimitExceeded("too many resources"));
        }
        if self.store.contains(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::InventoryCreated {
            id,
            name: name.clone(),
            total,
            available: total,
        };
        self.coordinator.persist(vec![event]).await?;
        self.store.insert_inventory(InventoryState::new(id, name, total));
        self.record_resource_gauge();
        debug!("inventory {id} created with {total} units");
        Ok(())
    }

    /// Change the number of units. `available` becomes `total - active claims`.
    pub async fn set_inventory_total(
        &self,
        id: Ulid,
        total: u32,
    ) -> Result<InventoryInfo, EngineError> {
        if total > MAX_UNITS_PER_INVENTORY {
            return Err(EngineError::LimitExceeded("too many units"));
        }
        let _commit = self.store.begin_commit().await;
        let mut guard = self.lock_inventory(id).await?;
        let active = guard.active_count();
        if total < active {
            return Err(EngineError::InvalidTotal { total, active });
        }
        self.coordinator
            .apply_unkeyed(&mut *guard, vec![Event::InventoryTotalChanged { id, total }])
            .await?;
        Ok(guard.info())
    }

    /// Remove an inventory. Refused while any unit is claimed.
    pub async fn delete_inventory(&self, id: Ulid) -> Result<(), EngineError> {
        let _catalog = self.catalog.lock().await;
        let _commit = self.store.begin_commit().await;
        let guard = self.lock_inventory(id).await?;
        let active = guard.active_count();
        if active > 0 {
            return Err(EngineError::HasActiveClaims { resource_id: id, active });
        }
        self.coordinator
            .persist(vec![Event::InventoryDeleted { id }])
            .await?;
        self.store.remove_inventory(&guard);
        self.record_resource_gauge();
        debug!("inventory {id} deleted");
        Ok(())
    }

    // ── Claims ───────────────────────────────────────────────

    /// Take one unit of `resource_id` for `holder`.
    ///
    /// `claim_id` is the idempotency key: calling again with the same id
    /// returns the original claim and changes nothing.
    pub async fn claim_unit(
        &self,
        claim_id: Ulid,
        resource_id: Ulid,
        holder: &HolderRef,
    ) -> Result<Claim, EngineError> {
        let result = self.try_claim_unit(claim_id, resource_id, holder).await;
        metrics::counter!(observability::CLAIMS_TOTAL, "outcome" => outcome_label(&result))
            .increment(1);
        match &result {
            Ok(claim) => debug!("claim {} on {resource_id} by {holder}", claim.id),
            Err(e) => debug!("claim {claim_id} on {resource_id} by {holder} rejected: {e}"),
        }
        result
    }

    async fn try_claim_unit(
        &self,
        claim_id: Ulid,
        resource_id: Ulid,
        holder: &HolderRef,
    ) -> Result<Claim, EngineError> {
        validate_holder(holder)?;
        let _commit = self.store.begin_commit().await;
        let mut guard = self.lock_inventory(resource_id).await?;

        let claimed_at = now_ms();
        let due_at = claimed_at.saturating_add(self.config.loan_period_ms);
        let key = CommitKey::new(CommitOp::Claim, claim_id);
        let committed = self
            .coordinator
            .run_atomic(key, &mut *guard, |inv: &InventoryState| {
                if let Some(existing) = inv.claims.get(&claim_id) {
                    return Ok(Plan::already_applied(Outcome::Claimed(existing.clone())));
                }
                if let Some(existing) = inv.active_claim_of(holder) {
                    return Err(EngineError::AlreadyClaimed {
                        resource_id,
                        holder: holder.clone(),
                        existing: existing.id,
                    });
                }
                if inv.available == 0 {
                    return Err(EngineError::OutOfStock {
                        resource_id,
                        total: inv.total,
                    });
                }
                let claim = Claim {
                    id: claim_id,
                    resource_id,
                    holder: holder.clone(),
                    claimed_at,
                    due_at,
                    status: ClaimStatus::Active,
                    released_at: None,
                };
                let steps = vec![
                    Event::ClaimOpened { claim: claim.clone() },
                    Event::AvailableAdjusted { resource_id, delta: -1 },
                ];
                Ok(Plan::commit(steps, Outcome::Claimed(claim)))
            })
            .await?;
        debug_assert!(guard.is_consistent());

        match committed.outcome {
            Outcome::Claimed(claim) => Ok(claim),
            other => Err(unexpected(other)),
        }
    }

    /// Return a claimed unit. The claim's status flip and the counter
    /// increment commit together or not at all.
    ///
    /// Releasing an already-released claim returns the original record as
    /// [`Release::AlreadyReleased`] and leaves `available` alone.
    pub async fn release_unit(&self, claim_id: Ulid) -> Result<Release, EngineError> {
        let result = self.try_release_unit(claim_id).await;
        let label = match &result {
            Ok(Release::AlreadyReleased(_)) => "already_released",
            other => outcome_label(other),
        };
        metrics::counter!(observability::RELEASES_TOTAL, "outcome" => label).increment(1);
        if let Err(e) = &result {
            debug!("release of {claim_id} rejected: {e}");
        }
        result
    }

    async fn try_release_unit(&self, claim_id: Ulid) -> Result<Release, EngineError> {
        let resource_id = self
            .store
            .inventory_for_claim(&claim_id)
            .ok_or(EngineError::ClaimNotFound(claim_id))?;
        let _commit = self.store.begin_commit().await;
        let mut guard = self
            .lock_inventory(resource_id)
            .await
            .map_err(|_| EngineError::ClaimNotFound(claim_id))?;

        let released_at = now_ms();
        let key = CommitKey::new(CommitOp::Release, claim_id);
        let committed = self
            .coordinator
            .run_atomic(key, &mut *guard, |inv: &InventoryState| {
                let claim = inv
                    .claims
                    .get(&claim_id)
                    .ok_or(EngineError::ClaimNotFound(claim_id))?;
                let record = |at| Released {
                    claim_id,
                    resource_id,
                    holder: claim.holder.clone(),
                    released_at: at,
                };
                if !claim.is_active() {
                    let at = claim.released_at.unwrap_or(released_at);
                    return Ok(Plan::already_applied(Outcome::Released(record(at))));
                }
                let steps = vec![
                    Event::ClaimClosed { claim_id, resource_id, released_at },
                    Event::AvailableAdjusted { resource_id, delta: 1 },
                ];
                Ok(Plan::commit(steps, Outcome::Released(record(released_at))))
            })
            .await?;
        debug_assert!(guard.is_consistent());

        match committed.outcome {
            Outcome::Released(r) if committed.replayed => Ok(Release::AlreadyReleased(r)),
            Outcome::Released(r) => {
                debug!("claim {claim_id} released, {} of {} available", guard.available, guard.total);
                Ok(Release::Released(r))
            }
            other => Err(unexpected(other)),
        }
    }

    // ── Queries ──────────────────────────────────────────────

    pub async fn get_inventory(&self, id: Ulid) -> Result<InventoryInfo, EngineError> {
        let shared = self
            .store
            .inventory(&id)
            .ok_or(EngineError::ResourceNotFound(id))?;
        let guard = shared.read().await;
        Ok(guard.info())
    }

    pub async fn list_inventories(&self) -> Vec<InventoryInfo> {
        let mut infos = Vec::new();
        for shared in self.store.inventories() {
            infos.push(shared.read().await.info());
        }
        infos.sort_by_key(|i| i.id);
        infos
    }

    pub async fn get_claim(&self, claim_id: Ulid) -> Result<Claim, EngineError> {
        let not_found = EngineError::ClaimNotFound(claim_id);
        let shared = self
            .store
            .inventory_for_claim(&claim_id)
            .and_then(|rid| self.store.inventory(&rid))
            .ok_or_else(|| not_found.clone())?;
        let guard = shared.read().await;
        guard.claims.get(&claim_id).cloned().ok_or(not_found)
    }

    /// Every claim `holder` currently holds, across all inventories, oldest first.
    pub async fn active_claims_for(&self, holder: &HolderRef) -> Vec<Claim> {
        let mut active = Vec::new();
        for claim_id in self.store.claims_of(holder) {
            if let Ok(claim) = self.get_claim(claim_id).await
                && claim.is_active()
            {
                active.push(claim);
            }
        }
        active.sort_by_key(|c| (c.claimed_at, c.id));
        active
    }

    /// Active claims whose due time is before `now`.
    pub async fn collect_overdue_claims(&self, now: Ms) -> Vec<Claim> {
        let mut overdue = Vec::new();
        for shared in self.store.inventories() {
            let guard = shared.read().await;
            overdue.extend(
                guard
                    .claims
                    .values()
                    .filter(|c| c.is_active() && c.due_at < now)
                    .cloned(),
            );
        }
        overdue.sort_by_key(|c| (c.due_at, c.id));
        overdue
    }

    /// Write-lock an inventory, failing if it was deleted while we waited.
    async fn lock_inventory(
        &self,
        id: Ulid,
    ) -> Result<OwnedRwLockWriteGuard<InventoryState>, EngineError> {
        let shared = self
            .store
            .inventory(&id)
            .ok_or(EngineError::ResourceNotFound(id))?;
        let guard = shared.clone().write_owned().await;
        match self.store.inventory(&id) {
            Some(current) if Arc::ptr_eq(&current, &shared) => Ok(guard),
            _ => Err(EngineError::ResourceNotFound(id)),
        }
    }
}
