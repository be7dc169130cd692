//! Routing of enqueued tasks to shards

use std::fmt;

use super::equality::DynEq;
use super::task::EnqueueParams;
use crate::settings::QueueShardId;

/// Picks the shard a task is written to
///
/// Consumers use the same router to learn which shards to poll, so
/// `shard_ids` must list every shard `resolve_shard_id` can return.
pub trait QueueShardRouter<T>: DynEq + Send + Sync {
    fn resolve_shard_id(&self, params: &EnqueueParams<T>) -> QueueShardId;

    fn shard_ids(&self) -> Vec<QueueShardId>;
}

impl<T: 'static> PartialEq for dyn QueueShardRouter<T> {
    fn eq(&self, other: &Self) -> bool {
        self.dyn_eq(other.as_any())
    }
}

impl<T: 'static> fmt::Debug for dyn QueueShardRouter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueShardRouter")
            .field("shard_ids", &self.shard_ids())
            .finish()
    }
}

/// Sends every task to one shard
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SingleShardRouter {
    shard_id: QueueShardId,
}

impl SingleShardRouter {
    pub fn new(shard_id: QueueShardId) -> Self {
        Self { shard_id }
    }
}

impl<T> QueueShardRouter<T> for SingleShardRouter {
    fn resolve_shard_id(&self, _params: &EnqueueParams<T>) -> QueueShardId {
        self.shard_id.clone()
    }

    fn shard_ids(&self) -> Vec<QueueShardId> {
        vec![self.shard_id.clone()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_single_shard_router() {
        let router = SingleShardRouter::new(QueueShardId::new("main"));
        let params = EnqueueParams::new(1u8);

        assert_eq!(router.resolve_shard_id(&params), QueueShardId::new("main"));
        assert_eq!(
            QueueShardRouter::<u8>::shard_ids(&router),
            vec![QueueShardId::new("main")]
        );
    }

    #[test]
    fn test_routers_compare_by_value() {
        let a: Arc<dyn QueueShardRouter<u8>> =
            Arc::new(SingleShardRouter::new(QueueShardId::new("s1")));
        let b: Arc<dyn QueueShardRouter<u8>> =
            Arc::new(SingleShardRouter::new(QueueShardId::new("s1")));
        let c: Arc<dyn QueueShardRouter<u8>> =
            Arc::new(SingleShardRouter::new(QueueShardId::new("s2")));

        assert!(*a == *b);
        assert!(*a != *c);
    }
}
