//! Filter, project, limit, and union kernels.

use std::sync::Arc;

use arrow::compute::filter_record_batch;
use arrow::record_batch::RecordBatch;
use arrow_schema::{Field, Schema};
use ffr_common::Result;
use ffr_planner::ScalarExpr;
use tracing::debug;

use crate::eval::{evaluate, evaluate_predicate};
use crate::exchange::Exchange;
use crate::kernel::{KernelCore, PORT_DEFAULT, input_port};

/// Row predicate kernel.
pub struct FilterKernel {
    predicate: ScalarExpr,
}

impl FilterKernel {
    /// Create a filter from a parsed predicate.
    pub fn new(predicate: ScalarExpr) -> Self {
        Self { predicate }
    }

    pub(crate) fn detail(&self) -> String {
        String::new()
    }

    pub(crate) fn run(&self, core: &KernelCore) -> Result<()> {
        let input = core.input(PORT_DEFAULT)?;
        while let Some(batch) = input.pull()? {
            core.check_cancelled()?;
            let mask = evaluate_predicate(&self.predicate, &batch)?;
            let filtered = filter_record_batch(&batch, &mask)
                .map_err(|e| core.err(format!("filter failed: {e}")))?;
            core.note_batch();
            if filtered.num_rows() > 0 {
                core.emit(PORT_DEFAULT, filtered)?;
            }
        }
        Ok(())
    }
}

/// Column projection/computation kernel.
pub struct ProjectKernel {
    exprs: Vec<(String, ScalarExpr)>,
}

impl ProjectKernel {
    /// Create a projection from `(output name, expression)` pairs.
    pub fn new(exprs: Vec<(String, ScalarExpr)>) -> Self {
        Self { exprs }
    }

    pub(crate) fn detail(&self) -> String {
        format!("columns={}", self.exprs.len())
    }

    pub(crate) fn run(&self, core: &KernelCore) -> Result<()> {
        let input = core.input(PORT_DEFAULT)?;
        while let Some(batch) = input.pull()? {
            core.check_cancelled()?;
            let mut fields = Vec::with_capacity(self.exprs.len());
            let mut columns = Vec::with_capacity(self.exprs.len());
            for (name, expr) in &self.exprs {
                let column = evaluate(expr, &batch)?;
                fields.push(Field::new(
                    name,
                    column.data_type().clone(),
                    column.null_count() > 0 || column.is_empty(),
                ));
                columns.push(column);
            }
            let schema = Arc::new(Schema::new(fields));
            let projected = RecordBatch::try_new(schema, columns)
                .map_err(|e| core.err(format!("projected batch build failed: {e}")))?;
            core.note_batch();
            core.emit(PORT_DEFAULT, projected)?;
        }
        Ok(())
    }
}

/// Row limit kernel; in a cluster it claims only this node's share of the
/// global limit, based on the row counts of lower-indexed peers.
pub struct LimitKernel {
    fetch: u64,
    exchange: Option<Arc<Exchange>>,
}

impl LimitKernel {
    /// Create a limit kernel for a global `fetch` row count.
    pub fn new(fetch: u64, exchange: Option<Arc<Exchange>>) -> Self {
        Self { fetch, exchange }
    }

    pub(crate) fn detail(&self) -> String {
        format!("fetch={}", self.fetch)
    }

    pub(crate) fn run(&self, core: &KernelCore) -> Result<()> {
        let input = core.input(PORT_DEFAULT)?;

        if core.ctx().num_nodes() == 1 {
            // Streaming path: truncate at the boundary, then drain.
            let mut remaining = self.fetch;
            while let Some(batch) = input.pull()? {
                core.check_cancelled()?;
                core.note_batch();
                if remaining == 0 {
                    continue;
                }
                let rows = batch.num_rows() as u64;
                let emitted = if rows <= remaining {
                    batch
                } else {
                    batch.slice(0, remaining as usize)
                };
                remaining -= emitted.num_rows() as u64;
                core.emit(PORT_DEFAULT, emitted)?;
            }
            return Ok(());
        }

        // Distributed limits need every local row counted before the prefix
        // split can be agreed, so the input is staged first.
        let mut staged = Vec::new();
        let mut local_rows = 0u64;
        while let Some(batch) = input.pull()? {
            core.check_cancelled()?;
            local_rows += batch.num_rows() as u64;
            staged.push(batch);
        }

        let local_limit =
            determine_local_limit(core, self.exchange.as_deref(), local_rows, self.fetch)?;

        let mut remaining = local_limit;
        for batch in staged {
            core.check_cancelled()?;
            core.note_batch();
            if remaining == 0 {
                continue;
            }
            let rows = batch.num_rows() as u64;
            let emitted = if rows <= remaining {
                batch
            } else {
                batch.slice(0, remaining as usize)
            };
            remaining -= emitted.num_rows() as u64;
            core.emit(PORT_DEFAULT, emitted)?;
        }
        Ok(())
    }
}

/// Compute this node's share of a global row limit.
///
/// `prev_total_rows` is the sum of row counts on peers with a lower node
/// index, gathered over the transport; the local share is
/// `clamp(global_limit − prev_total_rows, 0, local_rows)`.
pub fn determine_local_limit(
    core: &KernelCore,
    exchange: Option<&Exchange>,
    local_rows: u64,
    global_limit: u64,
) -> Result<u64> {
    let ctx = core.ctx();
    let Some(exchange) = exchange.filter(|_| ctx.num_nodes() > 1) else {
        return Ok(global_limit.min(local_rows));
    };

    let route = format!("limit_rows_{}", core.id());
    let counts = exchange.gather_num_rows(&route, local_rows)?;
    let prev_total_rows: u64 = counts[..ctx.self_node_index()].iter().sum();

    let local_limit = global_limit
        .saturating_sub(prev_total_rows)
        .min(local_rows);
    debug!(
        query_id = ctx.token().0,
        step = ctx.step(),
        substep = ctx.substep(),
        local_rows,
        prev_total_rows,
        local_limit,
        "determined local limit"
    );
    Ok(local_limit)
}

/// Bag union preserving per-input batch order.
pub struct UnionAllKernel {
    num_inputs: usize,
}

impl UnionAllKernel {
    /// Create a union over `num_inputs` input ports.
    pub fn new(num_inputs: usize) -> Self {
        Self { num_inputs }
    }

    pub(crate) fn detail(&self) -> String {
        format!("inputs={}", self.num_inputs)
    }

    pub(crate) fn run(&self, core: &KernelCore) -> Result<()> {
        for i in 0..self.num_inputs {
            let input = core.input(&input_port(i))?;
            while let Some(batch) = input.pull()? {
                core.check_cancelled()?;
                core.note_batch();
                core.emit(PORT_DEFAULT, batch)?;
            }
        }
        Ok(())
    }
}
