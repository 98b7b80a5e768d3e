//! Graph construction from a textual plan.
//!
//! The builder walks the parsed operator tree bottom-up, instantiates one
//! or more kernels per operator, and wires edges with cache settings:
//! simple caches by default, concatenating caches into batch-hungry
//! consumers on a single node. A sort expands into the four-kernel
//! order-by pipeline; on a cluster, aggregates, joins, and windows get a
//! hash redistribution upstream and the sort pipeline's partitioner
//! becomes the range distributor.

use std::sync::Arc;

use ffr_common::{FfrError, KernelId, Result};
use ffr_planner::{
    OperatorKind, PlanNode, aggregate_vars, equi_join_keys, extract_projects, filter_condition,
    named_expression, parse_plan, parse_scalar, project_exprs, sort_vars, window_calls,
    window_vars,
};
use ffr_storage::BatchProvider;
use tracing::{debug, info};

use crate::cache::CacheSettings;
use crate::context::QueryContext;
use crate::exchange::Exchange;
use crate::graph::Graph;
use crate::kernel::{
    Kernel, KernelCore, KernelVariant, PORT_BUILD, PORT_DEFAULT, PORT_PARTITIONS, PORT_PIVOTS,
    PORT_PROBE, PORT_SAMPLES, input_port,
};
use crate::kernels::aggregate::AggregateKernel;
use crate::kernels::distribute::DistributeByHashKernel;
use crate::kernels::join::JoinKernel;
use crate::kernels::orderby::{
    DistributeByRangeKernel, MergeKernel, PartitionKernel, PartitionPlanKernel, SharedLayout,
    SharedPopulation, SortSampleKernel,
};
use crate::kernels::output::OutputKernel;
use crate::kernels::row_ops::{FilterKernel, LimitKernel, ProjectKernel, UnionAllKernel};
use crate::kernels::scan::{BindableScanKernel, TableScanKernel};
use crate::kernels::window::WindowKernel;

/// Build the execution graph for one query on this node.
///
/// Providers bind positionally to the plan's scans in line order; the
/// exchange is required for multi-node contexts.
pub fn build_graph(
    plan_text: &str,
    ctx: QueryContext,
    providers: Vec<Arc<dyn BatchProvider>>,
    exchange: Option<Arc<Exchange>>,
) -> Result<Arc<Graph>> {
    info!(
        query_id = ctx.token().0,
        step = ctx.step(),
        substep = ctx.substep(),
        plan = plan_text,
        "query start"
    );
    debug!(
        query_id = ctx.token().0,
        options = %ctx.config().describe(),
        "config options"
    );
    if ctx.num_nodes() > 1 && exchange.is_none() {
        return Err(FfrError::PlanParse {
            line: 0,
            reason: "multi-node query without a transport exchange".to_string(),
        });
    }

    let plan = parse_plan(plan_text)?;
    let mut builder = GraphBuilder {
        graph: Graph::new(ctx.clone()),
        ctx,
        providers,
        next_provider: 0,
        scan_bindings: std::collections::HashMap::new(),
        next_id: 0,
        exchange: exchange.clone(),
    };

    let (last_kernel, last_port) = builder.build_node(&plan)?;

    // The output cache concatenates on a single node; in a cluster the
    // final concatenation is the client's job.
    let output_settings = if builder.ctx.num_nodes() == 1 {
        CacheSettings::concatenating()
    } else {
        CacheSettings::simple()
    };
    let output_id = builder.add_kernel("OutputKernel", KernelVariant::Output(OutputKernel::new()))?;
    builder
        .graph
        .add_edge(last_kernel, output_id, &last_port, PORT_DEFAULT, output_settings)?;
    builder.graph.set_output_kernel(output_id);

    builder.check_for_simple_scan_with_limit_query(&plan);

    if let Some(exchange) = exchange {
        builder.graph.set_exchange(exchange);
    }
    builder.graph.set_kernels_order()?;
    builder.graph.check_and_complete_workflow()?;

    let graph = Arc::new(builder.graph);
    graph.show();
    Ok(graph)
}

struct GraphBuilder {
    graph: Graph,
    ctx: QueryContext,
    providers: Vec<Arc<dyn BatchProvider>>,
    next_provider: usize,
    scan_bindings: std::collections::HashMap<usize, usize>,
    next_id: i32,
    exchange: Option<Arc<Exchange>>,
}

impl GraphBuilder {
    fn add_kernel(&mut self, name: &str, variant: KernelVariant) -> Result<KernelId> {
        let id = KernelId(self.next_id);
        self.next_id += 1;
        let core = KernelCore::new(id, name, self.ctx.clone());
        self.graph.add_node(Kernel::new(core, variant))
    }

    fn next_provider(&mut self, node: &PlanNode) -> Result<Arc<dyn BatchProvider>> {
        let provider = self.providers.get(self.next_provider).cloned().ok_or_else(|| {
            FfrError::PlanParse {
                line: node.line,
                reason: "plan has more scans than bound providers".to_string(),
            }
        })?;
        self.scan_bindings.insert(node.line, self.next_provider);
        self.next_provider += 1;
        Ok(provider)
    }

    /// Settings for an edge feeding `consumer`: concatenate into
    /// batch-hungry consumers when the cluster is a single node.
    fn edge_settings(&self, consumer: OperatorKind) -> CacheSettings {
        let wants_fused = matches!(
            consumer,
            OperatorKind::Aggregate | OperatorKind::Join | OperatorKind::Window
        );
        if wants_fused && self.ctx.num_nodes() == 1 {
            CacheSettings::concatenating()
        } else {
            CacheSettings::simple()
        }
    }

    /// Build the kernel(s) for one plan node; returns the kernel and output
    /// port a parent should consume.
    fn build_node(&mut self, node: &PlanNode) -> Result<(KernelId, String)> {
        match node.kind {
            OperatorKind::TableScan => {
                let provider = self.next_provider(node)?;
                debug!(
                    query_id = self.ctx.token().0,
                    table_handles = provider.num_handles(),
                    estimated_rows = provider.estimated_rows().unwrap_or(0),
                    "binding table scan"
                );
                let id = self.add_kernel(
                    "TableScan",
                    KernelVariant::TableScan(TableScanKernel::new(provider)),
                )?;
                self.graph
                    .add_edge(KernelId::HEAD, id, PORT_DEFAULT, PORT_DEFAULT, CacheSettings::simple())?;
                Ok((id, PORT_DEFAULT.to_string()))
            }
            OperatorKind::BindableTableScan => {
                let provider = self.next_provider(node)?;
                let projection = extract_projects(&node.expr)?.unwrap_or_default();
                let filter = match named_expression(&node.expr, "filters") {
                    Some(raw) => Some(parse_scalar(&raw)?),
                    None => None,
                };
                let id = self.add_kernel(
                    "BindableScan",
                    KernelVariant::BindableScan(BindableScanKernel::new(
                        provider, projection, filter,
                    )),
                )?;
                self.graph
                    .add_edge(KernelId::HEAD, id, PORT_DEFAULT, PORT_DEFAULT, CacheSettings::simple())?;
                Ok((id, PORT_DEFAULT.to_string()))
            }
            OperatorKind::Filter => {
                let (child, child_port) = self.build_single_child(node)?;
                let id = self.add_kernel(
                    "Filter",
                    KernelVariant::Filter(FilterKernel::new(filter_condition(&node.expr)?)),
                )?;
                self.graph
                    .add_edge(child, id, &child_port, PORT_DEFAULT, CacheSettings::simple())?;
                Ok((id, PORT_DEFAULT.to_string()))
            }
            OperatorKind::Project => {
                let (child, child_port) = self.build_single_child(node)?;
                let id = self.add_kernel(
                    "Project",
                    KernelVariant::Project(ProjectKernel::new(project_exprs(&node.expr)?)),
                )?;
                self.graph
                    .add_edge(child, id, &child_port, PORT_DEFAULT, CacheSettings::simple())?;
                Ok((id, PORT_DEFAULT.to_string()))
            }
            OperatorKind::Limit => {
                let (child, child_port) = self.build_single_child(node)?;
                let fetch = sort_vars(&node.expr)?.fetch.ok_or_else(|| FfrError::PlanParse {
                    line: node.line,
                    reason: "limit line without fetch".to_string(),
                })?;
                let id = self.add_kernel(
                    "Limit",
                    KernelVariant::Limit(LimitKernel::new(fetch, self.exchange.clone())),
                )?;
                self.graph
                    .add_edge(child, id, &child_port, PORT_DEFAULT, CacheSettings::simple())?;
                Ok((id, PORT_DEFAULT.to_string()))
            }
            OperatorKind::Sort => self.build_sort_pipeline(node),
            OperatorKind::Aggregate => {
                let (mut child, mut child_port) = self.build_single_child(node)?;
                let vars = aggregate_vars(&node.expr)?;
                if self.ctx.num_nodes() > 1 {
                    (child, child_port) =
                        self.insert_hash_distribution(child, &child_port, vars.group_columns.clone())?;
                }
                let id = self.add_kernel(
                    "Aggregate",
                    KernelVariant::Aggregate(AggregateKernel::new(vars)),
                )?;
                self.graph.add_edge(
                    child,
                    id,
                    &child_port,
                    PORT_DEFAULT,
                    self.edge_settings(OperatorKind::Aggregate),
                )?;
                Ok((id, PORT_DEFAULT.to_string()))
            }
            OperatorKind::Join => {
                if node.children.len() != 2 {
                    return Err(FfrError::PlanParse {
                        line: node.line,
                        reason: format!("join expects two inputs, found {}", node.children.len()),
                    });
                }
                let (mut build, mut build_port) = self.build_node(&node.children[0])?;
                let (mut probe, mut probe_port) = self.build_node(&node.children[1])?;

                let condition_raw =
                    named_expression(&node.expr, "condition").ok_or_else(|| FfrError::PlanParse {
                        line: node.line,
                        reason: "join line without condition".to_string(),
                    })?;
                let condition = parse_scalar(&condition_raw)?;
                let left_width = self.plan_output_width(&node.children[0]);
                let (build_keys, probe_keys) = equi_join_keys(&condition, left_width)?;

                if self.ctx.num_nodes() > 1 {
                    (build, build_port) =
                        self.insert_hash_distribution(build, &build_port, build_keys.clone())?;
                    (probe, probe_port) =
                        self.insert_hash_distribution(probe, &probe_port, probe_keys.clone())?;
                }

                let id = self.add_kernel(
                    "Join",
                    KernelVariant::Join(JoinKernel::new(build_keys, probe_keys)),
                )?;
                let settings = self.edge_settings(OperatorKind::Join);
                self.graph.add_edge(build, id, &build_port, PORT_BUILD, settings)?;
                self.graph.add_edge(probe, id, &probe_port, PORT_PROBE, settings)?;
                Ok((id, PORT_DEFAULT.to_string()))
            }
            OperatorKind::Window => {
                let (mut child, mut child_port) = self.build_single_child(node)?;
                let vars = window_vars(&node.expr)?;
                if self.ctx.num_nodes() > 1 {
                    // No partition keys routes the whole input to one node.
                    (child, child_port) = self.insert_hash_distribution(
                        child,
                        &child_port,
                        vars.partition_columns.clone(),
                    )?;
                }
                let id = self.add_kernel(
                    "Window",
                    KernelVariant::Window(WindowKernel::new(vars, window_calls(&node.expr)?)),
                )?;
                self.graph.add_edge(
                    child,
                    id,
                    &child_port,
                    PORT_DEFAULT,
                    self.edge_settings(OperatorKind::Window),
                )?;
                Ok((id, PORT_DEFAULT.to_string()))
            }
            OperatorKind::Union => {
                if node.children.is_empty() {
                    return Err(FfrError::PlanParse {
                        line: node.line,
                        reason: "union without inputs".to_string(),
                    });
                }
                let children: Vec<(KernelId, String)> = node
                    .children
                    .iter()
                    .map(|child| self.build_node(child))
                    .collect::<Result<_>>()?;
                let id = self.add_kernel(
                    "UnionAll",
                    KernelVariant::UnionAll(UnionAllKernel::new(children.len())),
                )?;
                for (i, (child, child_port)) in children.iter().enumerate() {
                    self.graph.add_edge(
                        *child,
                        id,
                        child_port,
                        &input_port(i),
                        CacheSettings::simple(),
                    )?;
                }
                Ok((id, PORT_DEFAULT.to_string()))
            }
        }
    }

    fn build_single_child(&mut self, node: &PlanNode) -> Result<(KernelId, String)> {
        if node.children.len() != 1 {
            return Err(FfrError::PlanParse {
                line: node.line,
                reason: format!(
                    "operator expects one input, found {}",
                    node.children.len()
                ),
            });
        }
        self.build_node(&node.children[0])
    }

    /// The order-by pipeline: sort+sample, partition plan, partition (or
    /// range distribute), merge.
    fn build_sort_pipeline(&mut self, node: &PlanNode) -> Result<(KernelId, String)> {
        let (child, child_port) = self.build_single_child(node)?;
        let vars = sort_vars(&node.expr)?;

        let population = SharedPopulation::new();
        let layout = SharedLayout::new();
        let multi_node = self.ctx.num_nodes() > 1;

        let sample_id = self.add_kernel(
            "SortAndSample",
            KernelVariant::SortSample(SortSampleKernel::new(vars.clone(), Arc::clone(&population))),
        )?;
        let plan_id = self.add_kernel(
            "PartitionPlan",
            KernelVariant::PartitionPlan(PartitionPlanKernel::new(
                vars.clone(),
                population,
                self.exchange.clone(),
            )),
        )?;
        let partition_id = if multi_node {
            let exchange = self.exchange.clone().ok_or_else(|| FfrError::PlanParse {
                line: node.line,
                reason: "distributed sort without a transport exchange".to_string(),
            })?;
            self.add_kernel(
                "DistributeByRange",
                KernelVariant::DistributeByRange(DistributeByRangeKernel::new(
                    vars.clone(),
                    Arc::clone(&layout),
                    exchange,
                )),
            )?
        } else {
            self.add_kernel(
                "Partition",
                KernelVariant::Partition(PartitionKernel::new(vars.clone(), Arc::clone(&layout))),
            )?
        };
        let merge_id = self.add_kernel(
            "MergeStream",
            KernelVariant::Merge(MergeKernel::new(vars, layout, self.exchange.clone())),
        )?;

        let partition_queues = self.ctx.config().max_num_order_by_partitions_per_node;
        self.graph
            .add_edge(child, sample_id, &child_port, PORT_DEFAULT, CacheSettings::simple())?;
        self.graph.add_edge(
            sample_id,
            partition_id,
            PORT_DEFAULT,
            PORT_DEFAULT,
            CacheSettings::simple(),
        )?;
        self.graph.add_edge(
            sample_id,
            plan_id,
            PORT_SAMPLES,
            PORT_SAMPLES,
            CacheSettings::simple(),
        )?;
        self.graph.add_edge(
            plan_id,
            partition_id,
            PORT_PIVOTS,
            PORT_PIVOTS,
            CacheSettings::simple(),
        )?;
        self.graph.add_edge(
            partition_id,
            merge_id,
            PORT_PARTITIONS,
            PORT_PARTITIONS,
            CacheSettings::for_each(partition_queues),
        )?;
        Ok((merge_id, PORT_DEFAULT.to_string()))
    }

    fn insert_hash_distribution(
        &mut self,
        child: KernelId,
        child_port: &str,
        key_columns: Vec<usize>,
    ) -> Result<(KernelId, String)> {
        let exchange = self.exchange.clone().ok_or_else(|| FfrError::PlanParse {
            line: 0,
            reason: "distributed operator without a transport exchange".to_string(),
        })?;
        let id = self.add_kernel(
            "DistributeByHash",
            KernelVariant::DistributeByHash(DistributeByHashKernel::new(key_columns, exchange)),
        )?;
        self.graph
            .add_edge(child, id, child_port, PORT_DEFAULT, CacheSettings::simple())?;
        Ok((id, PORT_DEFAULT.to_string()))
    }

    /// Output column count of a subtree, used to rebase join key indexes.
    ///
    /// Scans and projections determine widths; other operators pass their
    /// child's width through.
    fn plan_output_width(&self, node: &PlanNode) -> usize {
        match node.kind {
            OperatorKind::Project => project_exprs(&node.expr).map(|e| e.len()).unwrap_or(0),
            OperatorKind::BindableTableScan => extract_projects(&node.expr)
                .ok()
                .flatten()
                .map(|p| p.len())
                .unwrap_or(0),
            OperatorKind::TableScan => self.scan_provider_width(node.line),
            OperatorKind::Aggregate => aggregate_vars(&node.expr)
                .map(|v| v.group_columns.len() + v.calls.len())
                .unwrap_or(0),
            _ => node
                .children
                .first()
                .map(|child| self.plan_output_width(child))
                .unwrap_or(0),
        }
    }

    fn scan_provider_width(&self, line: usize) -> usize {
        self.scan_bindings
            .get(&line)
            .and_then(|i| self.providers.get(*i))
            .map(|p| p.schema().fields().len())
            .unwrap_or(0)
    }

    /// Simple scan+limit plans let the scan stop early.
    fn check_for_simple_scan_with_limit_query(&self, plan: &PlanNode) {
        if plan.num_operators() != 2 || plan.kind != OperatorKind::Limit {
            return;
        }
        let child = &plan.children[0];
        if !matches!(
            child.kind,
            OperatorKind::TableScan | OperatorKind::BindableTableScan
        ) {
            return;
        }
        let Some(fetch) = ffr_planner::limit_rows(&plan.expr) else {
            return;
        };
        // The scan kernel is the first one built.
        if let Some(kernel) = self.graph.get_node(KernelId(0)) {
            if kernel.set_scan_stop_after(fetch) {
                debug!(
                    query_id = self.ctx.token().0,
                    fetch, "enabled scan short-circuit for simple scan+limit plan"
                );
            }
        }
    }
}
