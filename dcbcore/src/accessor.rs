//! Resolution of actor instances.
//!
//! The core never creates actors itself. An [`ActorAccessor`] hands out the
//! one logical instance per id and capability within its scope, whether that
//! is an in-process map or a distributed actor host.

use crate::actors::multi_projection::MultiProjectionActor;
use crate::actors::tag_reservation::TagConsistency;
use crate::actors::tag_state::TagStateAccess;
use crate::errors::{ActorAccessError, ActorResult};
use crate::projection::MultiProjector;
use crate::tag::{TagKey, TagStateId};
use async_trait::async_trait;
use std::any::Any;
use std::sync::Arc;

/// Capability name used in errors for multi-projection actors.
pub const MULTI_PROJECTION: &str = "multi-projection";

/// Hands out actor instances by id.
#[async_trait]
pub trait ActorAccessor: Send + Sync {
    /// The reservation actor of `tag`.
    async fn tag_consistent_actor(&self, tag: &TagKey) -> ActorResult<Arc<dyn TagConsistency>>;

    /// The state actor of one tag under one projector.
    async fn tag_state_actor(&self, id: &TagStateId) -> ActorResult<Arc<dyn TagStateAccess>>;

    /// The multi-projection actor registered under `projector`, type erased.
    /// Use [`resolve_multi_projection`] for typed access.
    async fn multi_projection_actor(
        &self,
        projector: &str,
    ) -> ActorResult<Arc<dyn Any + Send + Sync>>;
}

/// The multi-projection actor of `P`.
pub async fn resolve_multi_projection<P: MultiProjector>(
    accessor: &dyn ActorAccessor,
) -> ActorResult<Arc<MultiProjectionActor<P>>> {
    accessor
        .multi_projection_actor(P::NAME)
        .await?
        .downcast::<MultiProjectionActor<P>>()
        .map_err(|_| ActorAccessError::TypeMismatch {
            capability: MULTI_PROJECTION,
            id: P::NAME.to_string(),
        })
}
