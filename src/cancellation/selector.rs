use chrono::{DateTime, Duration, Utc};
use log::debug;
use serde::Serialize;

use crate::domain::{Pipeline, PipelineSource};
use crate::policy::Policy;
use crate::store::{PipelineStore, Relation, StoreResult};

/// How far back same-ref pipelines are considered by default.
pub fn default_lookback() -> Duration {
    Duration::weeks(1)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Same-ref top-level pipelines only
    Flat,
    /// Older same-ref pipelines plus all of their same-project descendants
    Hierarchy,
}

impl Strategy {
    pub fn for_policy(policy: &Policy) -> Self {
        if policy.use_hierarchy_strategy {
            Strategy::Hierarchy
        } else {
            Strategy::Flat
        }
    }
}

/// Describes which pipelines a newly created pipeline makes redundant.
///
/// The result is a [`Relation`]: nothing is loaded here, and every read of the
/// relation sees the current state of the store.
pub struct CandidateSelector<'a, S: ?Sized> {
    store: &'a S,
    lookback: Duration,
}

impl<'a, S: PipelineStore + ?Sized> CandidateSelector<'a, S> {
    pub fn new(store: &'a S, lookback: Duration) -> Self {
        Self { store, lookback }
    }

    pub fn select_candidates(
        &self,
        pipeline: &Pipeline,
        policy: &Policy,
        now: DateTime<Utc>,
    ) -> StoreResult<Relation> {
        if pipeline.is_child() {
            debug!("Pipeline {} is a child pipeline, nothing to select", pipeline.id);
            return Ok(Relation::empty());
        }

        if !policy.auto_cancel_pending_pipelines {
            debug!(
                "Auto-cancel disabled for project {}, nothing to select",
                pipeline.project_id
            );
            return Ok(Relation::empty());
        }

        let same_ref = self.same_ref_pipelines(pipeline, now)?;

        let candidates = match Strategy::for_policy(policy) {
            Strategy::Flat => same_ref
                .excluding(pipeline.id)
                .with_source_in(PipelineSource::ci_and_parent_sources())
                .not_child()
                .alive_or_scheduled(),
            Strategy::Hierarchy => Relation::hierarchy_of(
                same_ref
                    .created_before(pipeline.created_at)
                    .with_source_in(PipelineSource::ci_sources()),
            )
            .alive_or_scheduled(),
        };

        Ok(candidates)
    }

    fn same_ref_pipelines(&self, pipeline: &Pipeline, now: DateTime<Utc>) -> StoreResult<Relation> {
        let head_sha = self
            .store
            .current_head_sha(pipeline.project_id, &pipeline.ref_)?;

        Ok(Relation::pipelines_for(pipeline.project_id, &pipeline.ref_)
            .created_after(now - self.lookback)
            .where_not_sha(head_sha.as_deref()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Status;
    use crate::store::MemoryStore;
    use crate::test_support::{create_child, create_pipeline, create_store};

    fn flat() -> Policy {
        Policy {
            auto_cancel_pending_pipelines: true,
            use_hierarchy_strategy: false,
        }
    }

    fn hierarchy() -> Policy {
        Policy {
            use_hierarchy_strategy: true,
            ..flat()
        }
    }

    fn selected(store: &MemoryStore, new_id: u64, policy: Policy) -> Vec<u64> {
        let new = store.pipeline(new_id).unwrap().unwrap();
        let relation = CandidateSelector::new(store, default_lookback())
            .select_candidates(&new, &policy, Utc::now())
            .unwrap();
        store.pipeline_ids(&relation).unwrap()
    }

    fn newest(id: u64) -> Pipeline {
        let mut pipeline = create_pipeline(id, "main", Status::Created);
        pipeline.sha = "head".to_string();
        pipeline.created_at = Utc::now();
        pipeline
    }

    #[cfg(test)]
    mod flat_strategy {
        use super::*;

        #[test]
        fn selects_alive_same_ref_pipelines() {
            let store = create_store(
                vec![
                    create_pipeline(1, "main", Status::Running),
                    create_pipeline(2, "main", Status::Pending),
                    create_pipeline(3, "main", Status::Success),
                    create_pipeline(4, "develop", Status::Running),
                    create_pipeline(5, "main", Status::Scheduled),
                    newest(6),
                ],
                vec![],
            );

            assert_eq!(selected(&store, 6, flat()), vec![1, 2, 5]);
        }

        #[test]
        fn never_selects_the_new_pipeline() {
            let mut new = newest(2);
            new.sha = "other".to_string();
            let store = create_store(vec![create_pipeline(1, "main", Status::Running), new], vec![]);

            assert_eq!(selected(&store, 2, flat()), vec![1]);
        }

        #[test]
        fn protects_pipelines_on_the_head_sha() {
            let mut on_head = create_pipeline(1, "main", Status::Running);
            on_head.sha = "head".to_string();
            let store = create_store(
                vec![on_head, create_pipeline(2, "main", Status::Running), newest(3)],
                vec![],
            );

            assert_eq!(selected(&store, 3, flat()), vec![2]);
        }

        #[test]
        fn skips_pipelines_outside_the_lookback_window() {
            let mut old = create_pipeline(1, "main", Status::Running);
            old.created_at = Utc::now() - Duration::days(8);
            let store = create_store(
                vec![old, create_pipeline(2, "main", Status::Running), newest(3)],
                vec![],
            );

            assert_eq!(selected(&store, 3, flat()), vec![2]);
        }

        #[test]
        fn skips_dangling_sources_and_children() {
            let mut webide = create_pipeline(1, "main", Status::Running);
            webide.source = PipelineSource::Webide;
            let store = create_store(
                vec![
                    webide,
                    create_pipeline(2, "main", Status::Running),
                    create_child(3, 2, Status::Running),
                    newest(4),
                ],
                vec![],
            );

            assert_eq!(selected(&store, 4, flat()), vec![2]);
        }

        #[test]
        fn unknown_head_excludes_nothing_by_sha() {
            let mut pipeline = create_pipeline(1, "feature", Status::Running);
            pipeline.sha = "head".to_string();
            let mut new = newest(2);
            new.ref_ = "feature".to_string();
            new.sha = "newer".to_string();
            let store = create_store(vec![pipeline, new], vec![]);

            assert_eq!(selected(&store, 2, flat()), vec![1]);
        }
    }

    #[cfg(test)]
    mod hierarchy_strategy {
        use super::*;

        #[test]
        fn includes_descendants_of_older_pipelines() {
            let mut grandchild = create_child(3, 2, Status::Pending);
            grandchild.ref_ = "unrelated".to_string();
            let store = create_store(
                vec![
                    create_pipeline(1, "main", Status::Running),
                    create_child(2, 1, Status::Running),
                    grandchild,
                    create_child(4, 1, Status::Success),
                    newest(5),
                ],
                vec![],
            );

            assert_eq!(selected(&store, 5, hierarchy()), vec![1, 2, 3]);
        }

        #[test]
        fn ignores_pipelines_created_after_the_new_one() {
            let mut later = create_pipeline(2, "main", Status::Running);
            later.created_at = Utc::now() + Duration::seconds(5);
            let store = create_store(
                vec![create_pipeline(1, "main", Status::Running), later, newest(3)],
                vec![],
            );

            assert_eq!(selected(&store, 3, hierarchy()), vec![1]);
        }
    }

    #[test]
    fn test_child_pipeline_selects_nothing() {
        let store = create_store(
            vec![
                create_pipeline(1, "main", Status::Running),
                create_pipeline(2, "main", Status::Running),
                create_child(3, 2, Status::Created),
            ],
            vec![],
        );

        assert!(selected(&store, 3, flat()).is_empty());
        assert!(selected(&store, 3, hierarchy()).is_empty());
    }

    #[test]
    fn test_disabled_policy_selects_nothing() {
        let store = create_store(
            vec![create_pipeline(1, "main", Status::Running), newest(2)],
            vec![],
        );
        let policy = Policy {
            auto_cancel_pending_pipelines: false,
            use_hierarchy_strategy: false,
        };

        assert!(selected(&store, 2, policy).is_empty());
    }

    #[test]
    fn test_strategy_follows_policy() {
        assert_eq!(Strategy::for_policy(&flat()), Strategy::Flat);
        assert_eq!(Strategy::for_policy(&hierarchy()), Strategy::Hierarchy);
    }
}
