use crate::domain::{Pipeline, PipelineId};
use crate::store::{PipelineStore, Relation, StoreResult};

/// Loads the pipelines among `ids` that are safe to auto-cancel: every build
/// that has not finished yet is interruptible. Pipelines without builds pass.
pub fn filter_interruptible<S>(store: &S, ids: &[PipelineId]) -> StoreResult<Vec<Pipeline>>
where
    S: PipelineStore + ?Sized,
{
    if ids.is_empty() {
        return Ok(Vec::new());
    }

    store.pipelines(
        &Relation::all()
            .id_in(ids.to_vec())
            .with_only_interruptible_builds(),
    )
}
