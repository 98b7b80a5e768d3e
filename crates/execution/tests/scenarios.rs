//! End-to-end single-node scenarios over the full graph pipeline.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use arrow::array::{Array, Float64Array, Int64Array, StringArray};
use arrow::record_batch::RecordBatch;
use arrow_schema::{DataType, Field, Schema, SchemaRef};
use ffr_common::{ContextToken, FfrError};
use ffr_execution::{QueryContext, build_graph};
use ffr_storage::{BatchProvider, MemBatchProvider};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn int_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![Field::new("k", DataType::Int64, false)]))
}

fn int_batch(schema: &SchemaRef, values: Vec<i64>) -> RecordBatch {
    RecordBatch::try_new(schema.clone(), vec![Arc::new(Int64Array::from(values))]).expect("batch")
}

fn int_column(batch: &RecordBatch, idx: usize) -> Vec<i64> {
    batch
        .column(idx)
        .as_any()
        .downcast_ref::<Int64Array>()
        .expect("int column")
        .values()
        .to_vec()
}

fn run_single_node(
    token: u32,
    plan: &str,
    providers: Vec<Arc<dyn BatchProvider>>,
    options: HashMap<String, String>,
) -> ffr_common::Result<Vec<RecordBatch>> {
    let ctx = QueryContext::single_node(ContextToken(token), options);
    let graph = build_graph(plan, ctx.clone(), providers, None)?;
    graph.start_execute(ctx.config().max_kernel_run_threads)?;
    graph.finish_execute()?;
    graph.release_results()
}

#[test]
fn scan_limit_short_circuit_opens_few_files() {
    let schema = int_schema();
    let handles: Vec<Vec<RecordBatch>> = (0..10)
        .map(|file| {
            vec![int_batch(
                &schema,
                (0..1000).map(|i| file * 1000 + i).collect(),
            )]
        })
        .collect();
    let provider = Arc::new(MemBatchProvider::new(schema, handles));

    let plan = "LogicalLimit(fetch=50)\n  LogicalTableScan(table=[[main, t]])\n";
    let results =
        run_single_node(1, plan, vec![provider.clone()], HashMap::new()).expect("query");

    let total_rows: usize = results.iter().map(|b| b.num_rows()).sum();
    assert_eq!(total_rows, 50);
    assert!(
        provider.handles_opened() <= 2,
        "opened {} files for a 50-row limit",
        provider.handles_opened()
    );
}

#[test]
fn single_node_sort_produces_non_decreasing_output() {
    let schema = int_schema();
    let mut rng = StdRng::seed_from_u64(7);
    let total_rows = 300_000usize;
    let batch_rows = 8192usize;

    let mut batches = Vec::new();
    let mut remaining = total_rows;
    while remaining > 0 {
        let rows = batch_rows.min(remaining);
        remaining -= rows;
        batches.push(int_batch(
            &schema,
            (0..rows).map(|_| rng.gen_range(0..1_000_000_000i64)).collect(),
        ));
    }
    let provider = Arc::new(MemBatchProvider::single(schema, batches));

    let plan = "LogicalSort(sort0=[$0], dir0=[ASC])\n  LogicalTableScan(table=[[main, t]])\n";
    let results = run_single_node(2, plan, vec![provider], HashMap::new()).expect("query");

    let mut count = 0usize;
    let mut previous = i64::MIN;
    for batch in &results {
        for value in int_column(batch, 0) {
            assert!(value >= previous, "output regressed: {previous} then {value}");
            previous = value;
            count += 1;
        }
    }
    assert_eq!(count, total_rows);
}

#[test]
fn sort_with_fetch_truncates_globally() {
    let schema = int_schema();
    let batches = vec![
        int_batch(&schema, vec![5, 3, 9, 1]),
        int_batch(&schema, vec![8, 2, 7, 4]),
    ];
    let provider = Arc::new(MemBatchProvider::single(schema, batches));

    let plan =
        "LogicalSort(sort0=[$0], dir0=[ASC], fetch=[3])\n  LogicalTableScan(table=[[main, t]])\n";
    let results = run_single_node(3, plan, vec![provider], HashMap::new()).expect("query");

    let values: Vec<i64> = results.iter().flat_map(|b| int_column(b, 0)).collect();
    assert_eq!(values, vec![1, 2, 3]);
}

#[test]
fn filter_project_pipeline_transforms_rows() {
    let schema = Arc::new(Schema::new(vec![
        Field::new("a", DataType::Int64, false),
        Field::new("b", DataType::Int64, false),
    ]));
    let batch = RecordBatch::try_new(
        schema.clone(),
        vec![
            Arc::new(Int64Array::from(vec![1_i64, 5, 10, 20])),
            Arc::new(Int64Array::from(vec![100_i64, 200, 300, 400])),
        ],
    )
    .expect("batch");
    let provider = Arc::new(MemBatchProvider::single(schema, vec![batch]));

    let plan = "LogicalProject(sum=[+($0, $1)])\n  LogicalFilter(condition=[>($0, 4)])\n    LogicalTableScan(table=[[main, t]])\n";
    let results = run_single_node(4, plan, vec![provider], HashMap::new()).expect("query");

    let values: Vec<i64> = results.iter().flat_map(|b| int_column(b, 0)).collect();
    assert_eq!(values, vec![205, 310, 420]);
    assert_eq!(results[0].schema().field(0).name(), "sum");
}

#[test]
fn aggregate_groups_and_sums() {
    let schema = Arc::new(Schema::new(vec![
        Field::new("g", DataType::Utf8, false),
        Field::new("v", DataType::Int64, false),
    ]));
    let batch = RecordBatch::try_new(
        schema.clone(),
        vec![
            Arc::new(StringArray::from(vec!["x", "y", "x", "y", "x"])),
            Arc::new(Int64Array::from(vec![1_i64, 10, 2, 20, 3])),
        ],
    )
    .expect("batch");
    let provider = Arc::new(MemBatchProvider::single(schema, vec![batch]));

    let plan = "LogicalAggregate(group=[{0}], s=[SUM($1)], c=[COUNT()])\n  LogicalTableScan(table=[[main, t]])\n";
    let results = run_single_node(5, plan, vec![provider], HashMap::new()).expect("query");

    assert_eq!(results.len(), 1);
    let batch = &results[0];
    assert_eq!(batch.num_rows(), 2);
    let groups: Vec<&str> = batch
        .column(0)
        .as_any()
        .downcast_ref::<StringArray>()
        .expect("groups")
        .iter()
        .map(|v| v.expect("group"))
        .collect();
    let sums = int_column(batch, 1);
    let counts = int_column(batch, 2);
    // First-seen group order.
    assert_eq!(groups, vec!["x", "y"]);
    assert_eq!(sums, vec![6, 30]);
    assert_eq!(counts, vec![3, 2]);
}

#[test]
fn join_matches_equal_keys() {
    let left_schema = Arc::new(Schema::new(vec![
        Field::new("id", DataType::Int64, false),
        Field::new("name", DataType::Utf8, false),
    ]));
    let left = RecordBatch::try_new(
        left_schema.clone(),
        vec![
            Arc::new(Int64Array::from(vec![1_i64, 2, 3])),
            Arc::new(StringArray::from(vec!["one", "two", "three"])),
        ],
    )
    .expect("left");

    let right_schema = Arc::new(Schema::new(vec![
        Field::new("ref_id", DataType::Int64, false),
        Field::new("v", DataType::Int64, false),
    ]));
    let right = RecordBatch::try_new(
        right_schema.clone(),
        vec![
            Arc::new(Int64Array::from(vec![2_i64, 3, 3, 4])),
            Arc::new(Int64Array::from(vec![20_i64, 30, 31, 40])),
        ],
    )
    .expect("right");

    let plan = "LogicalJoin(condition=[=($0, $2)], joinType=[inner])\n  LogicalTableScan(table=[[main, l]])\n  LogicalTableScan(table=[[main, r]])\n";
    let results = run_single_node(
        6,
        plan,
        vec![
            Arc::new(MemBatchProvider::single(left_schema, vec![left])),
            Arc::new(MemBatchProvider::single(right_schema, vec![right])),
        ],
        HashMap::new(),
    )
    .expect("query");

    let mut joined: Vec<(i64, i64)> = results
        .iter()
        .flat_map(|b| {
            let ids = int_column(b, 0);
            let vs = int_column(b, 3);
            ids.into_iter().zip(vs).collect::<Vec<_>>()
        })
        .collect();
    joined.sort_unstable();
    assert_eq!(joined, vec![(2, 20), (3, 30), (3, 31)]);
}

#[test]
fn union_all_preserves_input_order() {
    let schema = int_schema();
    let first = Arc::new(MemBatchProvider::single(
        schema.clone(),
        vec![int_batch(&schema, vec![1, 2])],
    ));
    let second = Arc::new(MemBatchProvider::single(
        schema.clone(),
        vec![int_batch(&schema, vec![3, 4])],
    ));

    let plan = "LogicalUnion(all=[true])\n  LogicalTableScan(table=[[main, a]])\n  LogicalTableScan(table=[[main, b]])\n";
    let results = run_single_node(7, plan, vec![first, second], HashMap::new()).expect("query");
    let values: Vec<i64> = results.iter().flat_map(|b| int_column(b, 0)).collect();
    assert_eq!(values, vec![1, 2, 3, 4]);
}

#[test]
fn window_over_order_only_runs_as_single_partition() {
    let schema = Arc::new(Schema::new(vec![
        Field::new("g", DataType::Int64, false),
        Field::new("v", DataType::Int64, false),
    ]));
    let batch = RecordBatch::try_new(
        schema.clone(),
        vec![
            Arc::new(Int64Array::from(vec![1_i64, 1, 2, 2])),
            Arc::new(Int64Array::from(vec![9_i64, 7, 8, 6])),
        ],
    )
    .expect("batch");
    let provider = Arc::new(MemBatchProvider::single(schema, vec![batch]));

    let plan = "LogicalProject(v=[$1], rn=[ROW_NUMBER() OVER (ORDER BY $1)])\n  LogicalTableScan(table=[[main, t]])\n";
    let results = run_single_node(8, plan, vec![provider], HashMap::new()).expect("query");

    assert_eq!(results.len(), 1);
    let values = int_column(&results[0], 0);
    let row_numbers = int_column(&results[0], 1);
    assert_eq!(values, vec![6, 7, 8, 9]);
    assert_eq!(row_numbers, vec![1, 2, 3, 4]);
}

#[test]
fn window_partitioned_aggregates_per_partition() {
    let schema = Arc::new(Schema::new(vec![
        Field::new("g", DataType::Int64, false),
        Field::new("v", DataType::Float64, false),
    ]));
    let batch = RecordBatch::try_new(
        schema.clone(),
        vec![
            Arc::new(Int64Array::from(vec![1_i64, 2, 1, 2])),
            Arc::new(Float64Array::from(vec![1.0_f64, 10.0, 3.0, 30.0])),
        ],
    )
    .expect("batch");
    let provider = Arc::new(MemBatchProvider::single(schema, vec![batch]));

    let plan = "LogicalProject(g=[$0], mx=[MAX($1) OVER (PARTITION BY $0)])\n  LogicalTableScan(table=[[main, t]])\n";
    let results = run_single_node(9, plan, vec![provider], HashMap::new()).expect("query");

    let batch = &results[0];
    let groups = int_column(batch, 0);
    let maxima: Vec<f64> = batch
        .column(1)
        .as_any()
        .downcast_ref::<Float64Array>()
        .expect("maxima")
        .values()
        .to_vec();
    assert_eq!(groups, vec![1, 1, 2, 2]);
    assert_eq!(maxima, vec![3.0, 3.0, 30.0, 30.0]);
}

#[test]
fn cancellation_mid_sort_terminates_quickly_and_release_reports_it() {
    let schema = int_schema();
    let mut rng = StdRng::seed_from_u64(11);
    let batches: Vec<RecordBatch> = (0..64)
        .map(|_| {
            int_batch(
                &schema,
                (0..8192).map(|_| rng.gen_range(0..1_000_000_000i64)).collect(),
            )
        })
        .collect();
    let provider = Arc::new(MemBatchProvider::single(schema, batches));

    let ctx = QueryContext::single_node(ContextToken(10), HashMap::new());
    let plan = "LogicalSort(sort0=[$0], dir0=[ASC])\n  LogicalTableScan(table=[[main, t]])\n";
    let graph = build_graph(plan, ctx.clone(), vec![provider], None).expect("graph");
    graph
        .start_execute(ctx.config().max_kernel_run_threads)
        .expect("start");

    std::thread::sleep(Duration::from_millis(100));
    let cancelled_at = Instant::now();
    graph.cancel();
    let finish = graph.finish_execute();
    assert!(
        cancelled_at.elapsed() < Duration::from_secs(2),
        "kernels took {:?} to wind down",
        cancelled_at.elapsed()
    );
    assert!(finish.is_ok(), "cancellation should not be a failure");
    assert!(matches!(
        graph.release_results(),
        Err(FfrError::Cancelled)
    ));
}

#[test]
fn backpressure_delivers_every_byte_in_order() {
    use ffr_execution::{BatchCache, CacheSettings, batch_bytes};

    let schema = int_schema();
    // 256 KiB of Int64 payload per batch.
    let rows_per_batch = 32 * 1024;
    let template = int_batch(&schema, (0..rows_per_batch).collect());
    let payload_bytes = batch_bytes(&template);

    let ctx = QueryContext::single_node(ContextToken(20), HashMap::new());
    let cache = Arc::new(BatchCache::new(
        "pipe",
        ctx,
        CacheSettings::simple().with_capacity(1024 * 1024),
    ));

    let producer_cache = Arc::clone(&cache);
    let producer_schema = schema.clone();
    let producer = std::thread::spawn(move || {
        for i in 0..100i64 {
            let batch = int_batch(
                &producer_schema,
                (i * rows_per_batch..(i + 1) * rows_per_batch).collect(),
            );
            producer_cache.put(batch).expect("put");
        }
        producer_cache.close();
    });

    let mut pulled_bytes = 0u64;
    let mut next_expected = 0i64;
    while let Some(batch) = cache.pull().expect("pull") {
        pulled_bytes += batch_bytes(&batch);
        let values = int_column(&batch, 0);
        assert_eq!(values[0], next_expected, "out-of-order delivery");
        next_expected = values[values.len() - 1] + 1;
        std::thread::sleep(Duration::from_millis(1));
    }
    producer.join().expect("producer");

    assert_eq!(pulled_bytes, payload_bytes * 100);
    assert!(cache.put_wait_count() > 0, "producer never blocked");
}

#[test]
fn release_twice_fails_with_already_released() {
    let schema = int_schema();
    let provider = Arc::new(MemBatchProvider::single(
        schema.clone(),
        vec![int_batch(&schema, vec![1, 2, 3])],
    ));

    let ctx = QueryContext::single_node(ContextToken(11), HashMap::new());
    let plan = "LogicalTableScan(table=[[main, t]])\n";
    let graph = build_graph(plan, ctx.clone(), vec![provider], None).expect("graph");
    graph
        .start_execute(ctx.config().max_kernel_run_threads)
        .expect("start");
    graph.finish_execute().expect("finish");

    let first = graph.release_results().expect("first release");
    assert_eq!(first.iter().map(|b| b.num_rows()).sum::<usize>(), 3);
    assert!(matches!(
        graph.release_results(),
        Err(FfrError::AlreadyReleased)
    ));
}

#[test]
fn progress_snapshot_reports_every_kernel_finished() {
    let schema = int_schema();
    let provider = Arc::new(MemBatchProvider::single(
        schema.clone(),
        vec![int_batch(&schema, vec![4, 2, 1, 3])],
    ));

    let ctx = QueryContext::single_node(ContextToken(12), HashMap::new());
    let plan = "LogicalSort(sort0=[$0], dir0=[ASC])\n  LogicalTableScan(table=[[main, t]])\n";
    let graph = build_graph(plan, ctx.clone(), vec![provider], None).expect("graph");

    // Sort pipeline (4) + scan + output.
    assert_eq!(graph.get_progress().kernels.len(), 6);

    graph
        .start_execute(ctx.config().max_kernel_run_threads)
        .expect("start");
    graph.finish_execute().expect("finish");

    let progress = graph.get_progress();
    assert!(progress.kernels.iter().all(|k| k.finished));
    assert!(progress.kernels.iter().any(|k| k.batches_completed > 0));
    assert!(graph.query_is_complete());
}
