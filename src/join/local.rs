//! Local pipeline join.
//!
//! One scoped worker per join dimension. Stage `i` reads chunks of binding
//! sets from stage `i - 1`, extends each with the matches of its tail
//! predicate and passes the survivors on. The calling thread drains the
//! last stage and turns the binding sets into solutions.

use std::sync::Arc;
use std::thread;

use crossbeam_channel::{bounded, Receiver, Sender};

use crate::buffer::UnsynchronizedBuffer;
use crate::error::{QuadlogError, QuadlogResult};
use crate::model::{BindingSet, Predicate, Rule, Solution, SolutionFlags};
use crate::nexus::EvaluationNexus;
use crate::runtime::CancelToken;
use crate::storage::RelationView;

use super::JoinInput;

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
        let mut stages = Vec::with_capacity(plan.len());
        for &tail_index in plan {
            let (tx, rx) = bounded::<Vec<BindingSet>>(queue);
            let input = std::mem::replace(&mut upstream, rx);
            let predicate = &rule.tail()[tail_index];
            let view = &views[tail_index];
            stages.push(s.spawn(move || stage(nexus, rule, predicate, view.as_ref(), &input, &tx, capacity, token)));
        }

        let seed = nexus.new_binding_set(rule);
        let emitted = if rule.is_consistent(&seed) && seed_tx.send(vec![seed]).is_ok() {
            drop(seed_tx);
            emit(rule, flags, upstream, out, token)
        } else {
            drop(seed_tx);
            drop(upstream);
            Ok(())
        };

        let mut first_err = emitted.err();
        for handle in stages {
            let result = handle
                .join()
                .unwrap_or_else(|_| Err(QuadlogError::internal("join stage panicked")));
            if let Err(e) = result {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    })
}

#[allow(clippy::too_many_arguments)]
fn stage(
    nexus: &EvaluationNexus,
    rule: &Rule,
    predicate: &Predicate,
    view: &dyn RelationView,
    input: &Receiver<Vec<BindingSet>>,
    output: &Sender<Vec<BindingSet>>,
    capacity: usize,
    token: &CancelToken,
) -> QuadlogResult<()> {
    let mut batch = Vec::with_capacity(capacity);
    for chunk in input {
        token.check(rule.name())?;
        for bindings in chunk {
            for element in view.access_path(&predicate.pattern(&bindings))? {
                let mut next = bindings.clone();
                if nexus.bind(predicate, rule.constraints(), &element, &mut next) {
                    batch.push(next);
                    if batch.len() >= capacity && output.send(std::mem::take(&mut batch)).is_err() {
                        // Downstream went away.
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

/// Drains the last stage into `out`.
pub(super) fn emit(
    rule: &Arc<Rule>,
    flags: SolutionFlags,
    last: Receiver<Vec<BindingSet>>,
    out: &mut UnsynchronizedBuffer,
    token: &CancelToken,
) -> QuadlogResult<()> {
    for chunk in last {
        token.check(rule.name())?;
        for bindings in &chunk {
            out.add(Solution::new(flags, rule, bindings))?;
        }
    }
    out.flush()
}
