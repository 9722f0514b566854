//! Distributed pipeline join.
//!
//! Each join stage has a router that ships chunks of binding sets to one
//! worker per index partition the access path touches. Workers read only
//! their partition and send extended binding sets downstream, so only
//! bindings and final solutions cross partition boundaries.

use std::collections::HashMap;
use std::thread::{self, Scope, ScopedJoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender};

use crate::buffer::UnsynchronizedBuffer;
use crate::error::{QuadlogError, QuadlogResult};
use crate::model::{BindingSet, Predicate, Rule, SolutionFlags};
use crate::nexus::EvaluationNexus;
use crate::runtime::CancelToken;
use crate::storage::{PartitionId, RelationView};

use super::{local, JoinInput};

type Partitions<'scope> = HashMap<PartitionId, (Sender<Vec<BindingSet>>, ScopedJoinHandle<'scope, QuadlogResult<()>>)>;

pub(crate) fn run(
    input: &JoinInput<'_>,
    flags: SolutionFlags,
    out: &mut UnsynchronizedBuffer,
    token: &CancelToken,
) -> QuadlogResult<()> {
    let JoinInput {
        nexus,
        rule,
        plan,
        views,
    } = *input;
    let capacity = nexus.config().chunk_capacity.max(1);
    let queue = nexus.config().chunk_of_chunks_capacity.max(1);

    thread::scope(|s| {
        let (seed_tx, mut upstream) = bounded::<Vec<BindingSet>>(1);
        let mut routers = Vec::with_capacity(plan.len());
        for &tail_index in plan {
            let (tx, rx) = bounded::<Vec<BindingSet>>(queue);
            let input = std::mem::replace(&mut upstream, rx);
            let stage = Stage {
                nexus,
                rule,
                predicate: &rule.tail()[tail_index],
                view: views[tail_index].as_ref(),
                capacity,
                queue,
                token,
            };
            routers.push(s.spawn(move || stage.route(s, &input, &tx)));
        }

        let seed = nexus.new_binding_set(rule);
        let emitted = if rule.is_consistent(&seed) && seed_tx.send(vec![seed]).is_ok() {
            drop(seed_tx);
            local::emit(rule, flags, upstream, out, token)
        } else {
            drop(seed_tx);
            drop(upstream);
            Ok(())
        };

        let mut first_err = emitted.err();
        for handle in routers {
            let result = handle
                .join()
                .unwrap_or_else(|_| Err(QuadlogError::internal("join router panicked")));
            if let Err(e) = result {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    })
}

#[derive(Clone, Copy)]
struct Stage<'a> {
    nexus: &'a EvaluationNexus,
    rule: &'a Rule,
    predicate: &'a Predicate,
    view: &'a dyn RelationView,
    capacity: usize,
    queue: usize,
    token: &'a CancelToken,
}

impl<'a> Stage<'a> {
    fn route<'scope>(
        self,
        s: &'scope Scope<'scope, '_>,
        input: &Receiver<Vec<BindingSet>>,
        output: &Sender<Vec<BindingSet>>,
    ) -> QuadlogResult<()>
    where
        'a: 'scope,
    {
        let mut partitions: Partitions<'scope> = HashMap::new();
        let mut first_err = self.feed(s, input, output, &mut partitions).err();

        for (partition, (tx, handle)) in partitions {
            drop(tx);
            let result = handle.join().unwrap_or_else(|_| {
                Err(QuadlogError::internal(format!("partition worker {partition} panicked")))
            });
            if let Err(e) = result {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    fn feed<'scope>(
        self,
        s: &'scope Scope<'scope, '_>,
        input: &Receiver<Vec<BindingSet>>,
        output: &Sender<Vec<BindingSet>>,
        partitions: &mut Partitions<'scope>,
    ) -> QuadlogResult<()>
    where
        'a: 'scope,
    {
        let relation = self.predicate.relation();
        let index_manager = self.nexus.index_manager()?;
        let mut batches: HashMap<PartitionId, Vec<BindingSet>> = HashMap::new();
        for chunk in input {
            self.token.check(self.rule.name())?;
            for bindings in chunk {
                let pattern = self.predicate.pattern(&bindings);
                for partition in index_manager.partitions(relation, &pattern) {
                    let batch = batches.entry(partition).or_default();
                    batch.push(bindings.clone());
                    if batch.len() >= self.capacity {
                        let full = std::mem::take(batch);
                        if !self.ship(s, partitions, partition, full, output) {
                            return Ok(());
                        }
                    }
                }
            }
        }
        for (partition, batch) in batches {
            if !batch.is_empty() && !self.ship(s, partitions, partition, batch, output) {
                return Ok(());
            }
        }
        Ok(())
    }

    /// Sends a batch to the worker for `partition`, starting it on first touch.
    fn ship<'scope>(
        self,
        s: &'scope Scope<'scope, '_>,
        partitions: &mut Partitions<'scope>,
        partition: PartitionId,
        batch: Vec<BindingSet>,
        output: &Sender<Vec<BindingSet>>,
    ) -> bool
    where
        'a: 'scope,
    {
        let (tx, _) = partitions.entry(partition).or_insert_with(|| {
            let (tx, rx) = bounded::<Vec<BindingSet>>(self.queue);
            let output = output.clone();
            let handle = s.spawn(move || self.partition(partition, &rx, &output));
            (tx, handle)
        });
        tx.send(batch).is_ok()
    }

    fn partition(
        self,
        partition: PartitionId,
        input: &Receiver<Vec<BindingSet>>,
        output: &Sender<Vec<BindingSet>>,
    ) -> QuadlogResult<()> {
        let mut batch = Vec::with_capacity(self.capacity);
        for chunk in input {
            self.token.check(self.rule.name())?;
            for bindings in chunk {
                let pattern = self.predicate.pattern(&bindings);
                for element in self.view.partition_access_path(partition, &pattern)? {
                    let mut next = bindings.clone();
                    if self.nexus.bind(self.predicate, self.rule.constraints(), &element, &mut next) {
                        batch.push(next);
                        if batch.len() >= self.capacity && output.send(std::mem::take(&mut batch)).is_err() {
                            return Ok(());
                        }
                    }
                }
            }
        }
        if !batch.is_empty() {
            let _ = output.send(batch);
        }
        Ok(())
    }
}
