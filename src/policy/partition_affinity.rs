use super::{least_occupied, Assignment, SchedulingContext, SchedulingPolicy};
use crate::config::SchedulingPolicyKind;
use crate::error::{ApplierError, ProtocolError};
use crate::event::EventGroup;
use crate::partition::OVERFLOW_PARTITION;
use tracing::debug;

/// Pins every partition key to one worker while groups on it are in flight.
#[derive(Debug)]
pub struct PartitionAffinityPolicy {
    max_partitions: usize,
    /// The previous group ran on the overflow key and must run alone.
    isolate_next: bool,
    pending: Vec<String>,
}

impl PartitionAffinityPolicy {
    pub fn new(max_partitions: usize) -> Self {
        Self {
            max_partitions: max_partitions.max(1),
            isolate_next: false,
            pending: Vec::new(),
        }
    }

    /// Keys a group is scheduled under; too many (or none) collapse to the overflow key.
    pub fn keys_for(&self, group: &EventGroup) -> Result<Vec<String>, ProtocolError> {
        let partitions = group.partitions();
        if partitions.iter().any(|partition| partition.is_empty()) {
            return Err(ProtocolError::UndefinedPartition {
                group_id: group.id.clone(),
            });
        }
        if partitions.is_empty() || partitions.len() > self.max_partitions {
            return Ok(vec![OVERFLOW_PARTITION.to_string()]);
        }
        Ok(partitions.into_iter().map(str::to_string).collect())
    }
}

impl SchedulingPolicy for PartitionAffinityPolicy {
    fn kind(&self) -> SchedulingPolicyKind {
        SchedulingPolicyKind::PartitionAffinity
    }

    fn needs_barrier(&mut self, group: &EventGroup) -> Result<bool, ApplierError> {
        let keys = self.keys_for(group)?;
        let overflow = keys.len() == 1 && keys[0] == OVERFLOW_PARTITION;
        let barrier = overflow || self.isolate_next;
        if overflow {
            debug!(group = %group.id, "group isolated on the overflow partition");
        }
        self.isolate_next = overflow;
        self.pending = keys;
        Ok(barrier)
    }

    fn select_worker(
        &mut self,
        group: &EventGroup,
        ctx: &SchedulingContext<'_>,
    ) -> Result<Assignment, ApplierError> {
        let keys = if self.pending.is_empty() {
            self.keys_for(group)?
        } else {
            std::mem::take(&mut self.pending)
        };
        let owned = keys.iter().find_map(|key| ctx.partitions.owner(key));
        let worker = match owned {
            Some(worker) => worker,
            None => least_occupied(ctx.queues, 0)
                .ok_or_else(|| ApplierError::Resource("worker pool is empty".into()))?,
        };
        let mut assignment = Assignment::to(worker);
        for key in keys {
            let blocked = ctx.partitions.owner(&key).is_some_and(|owner| owner != worker);
            let parked = ctx.partitions.acquire(&key, worker, ctx.wake)?;
            if blocked {
                debug!(group = %group.id, partition = %key, worker = %worker, "waited for partition conflict");
                assignment.waited = true;
            }
            if !parked.is_empty() {
                assignment.handoff.push((key.clone(), parked));
            }
            assignment.partitions.push(key);
        }
        Ok(assignment)
    }

    fn reset(&mut self) {
        self.isolate_next = false;
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wide_groups_are_isolated_with_their_successor() {
        let mut policy = PartitionAffinityPolicy::new(2);
        let narrow = EventGroup::new("a").with_record("t1", "k", Vec::new());
        let wide = EventGroup::new("b")
            .with_record("t1", "k", Vec::new())
            .with_record("t2", "k", Vec::new())
            .with_record("t3", "k", Vec::new());
        assert!(!policy.needs_barrier(&narrow).unwrap());
        assert!(policy.needs_barrier(&wide).unwrap());
        assert_eq!(policy.keys_for(&wide).unwrap(), vec!["*".to_string()]);
        assert!(policy.needs_barrier(&narrow).unwrap());
        assert!(!policy.needs_barrier(&narrow).unwrap());
    }

    #[test]
    fn empty_partition_names_are_rejected() {
        let mut policy = PartitionAffinityPolicy::new(4);
        let group = EventGroup::new("bad").with_record("", "k", Vec::new());
        assert!(matches!(
            policy.needs_barrier(&group),
            Err(ApplierError::Protocol(ProtocolError::UndefinedPartition { .. }))
        ));
    }
}
