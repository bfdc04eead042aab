//! Merge operators for per-node results
//!
//! Node results arrive in whatever order nodes finish. A [`ResultCollector`]
//! keys them by node index and a [`Merge`] reduces them once every node has
//! answered.

use crate::error::{DistributedError, Result};
use arrow::array::{Array, ArrayRef};
use arrow::compute::{self, SortOptions};
use arrow::record_batch::RecordBatch;
use arrow::row::{RowConverter, Rows, SortField as RowSortField};
use query_core::SortField;
use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap};

/// Strategy for merging node results
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeStrategy {
    /// Node order concatenation
    Concat,
    /// k-way merge of node runs that are each sorted by `sort`
    SortedMerge { sort: Vec<SortField> },
}

/// Merge operator for combining results from multiple nodes
#[derive(Debug, Clone)]
pub struct Merge {
    strategy: MergeStrategy,
    /// Maximum rows in the merged output
    limit: Option<usize>,
}

impl Merge {
    pub fn new(strategy: MergeStrategy) -> Self {
        Self {
            strategy,
            limit: None,
        }
    }

    /// Concatenation in node order
    pub fn concat() -> Self {
        Self::new(MergeStrategy::Concat)
    }

    /// k-way merge by `sort`
    pub fn sorted(sort: Vec<SortField>) -> Self {
        Self::new(MergeStrategy::SortedMerge { sort })
    }

    /// Cap the number of merged rows; a sorted merge becomes a top-K merge
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn strategy(&self) -> &MergeStrategy {
        &self.strategy
    }

    pub fn limit(&self) -> Option<usize> {
        self.limit
    }

    /// Merge per-node results, given in node order
    pub fn execute(&self, partitions: Vec<Vec<RecordBatch>>) -> Result<Vec<RecordBatch>> {
        match &self.strategy {
            MergeStrategy::Concat => Ok(truncate(
                partitions.into_iter().flatten().collect(),
                self.limit,
            )),
            MergeStrategy::SortedMerge { sort } => sorted_merge(partitions, sort, self.limit),
        }
    }
}

fn truncate(batches: Vec<RecordBatch>, limit: Option<usize>) -> Vec<RecordBatch> {
    let Some(mut remaining) = limit else {
        return batches;
    };
    let mut out = Vec::new();
    for batch in batches {
        if remaining == 0 {
            break;
        }
        if batch.num_rows() <= remaining {
            remaining -= batch.num_rows();
            out.push(batch);
        } else {
            out.push(batch.slice(0, remaining));
            remaining = 0;
        }
    }
    out
}

/// k-way merge of locally sorted runs. Each node's batches form one run; the
/// heap holds one cursor per run, so only the emitted rows are compared.
/// Equal keys keep node order.
fn sorted_merge(
    partitions: Vec<Vec<RecordBatch>>,
    sort: &[SortField],
    limit: Option<usize>,
) -> Result<Vec<RecordBatch>> {
    let mut runs = Vec::with_capacity(partitions.len());
    for batches in partitions {
        let batches: Vec<RecordBatch> = batches.into_iter().filter(|b| b.num_rows() > 0).collect();
        match batches.len() {
            0 => {}
            1 => runs.extend(batches),
            _ => runs.push(compute::concat_batches(&batches[0].schema(), &batches)?),
        }
    }
    let Some(first) = runs.first() else {
        return Ok(Vec::new());
    };
    let schema = first.schema();

    if sort.is_empty() {
        return Ok(truncate(runs, limit));
    }

    let mut key_columns = Vec::with_capacity(sort.len());
    let mut fields = Vec::with_capacity(sort.len());
    for key in sort {
        let idx = schema.index_of(&key.field).map_err(|_| {
            DistributedError::MergeError(format!(
                "sort column '{}' missing from node results",
                key.field
            ))
        })?;
        key_columns.push(idx);
        fields.push(RowSortField::new_with_options(
            schema.field(idx).data_type().clone(),
            SortOptions {
                descending: key.order.is_descending(),
                nulls_first: false,
            },
        ));
    }

    let converter = RowConverter::new(fields)?;
    let rows: Vec<Rows> = runs
        .iter()
        .map(|run| {
            let keys: Vec<ArrayRef> = key_columns.iter().map(|&i| run.column(i).clone()).collect();
            converter.convert_columns(&keys)
        })
        .collect::<std::result::Result<_, _>>()?;

    let total: usize = runs.iter().map(RecordBatch::num_rows).sum();
    let wanted = limit.map_or(total, |l| l.min(total));
    if wanted == 0 {
        return Ok(Vec::new());
    }

    let mut heap = BinaryHeap::with_capacity(runs.len());
    for (run, run_rows) in rows.iter().enumerate() {
        heap.push(Reverse((run_rows.row(0), run, 0usize)));
    }

    let mut picks: Vec<(usize, usize)> = Vec::with_capacity(wanted);
    while picks.len() < wanted {
        let Some(Reverse((_, run, row))) = heap.pop() else {
            break;
        };
        picks.push((run, row));
        if row + 1 < rows[run].num_rows() {
            heap.push(Reverse((rows[run].row(row + 1), run, row + 1)));
        }
    }

    let columns = (0..schema.fields().len())
        .map(|c| {
            let arrays: Vec<&dyn Array> = runs.iter().map(|run| run.column(c).as_ref()).collect();
            compute::interleave(&arrays, &picks)
        })
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(vec![RecordBatch::try_new(schema, columns)?])
}

/// Gathers per-node results keyed by node index
#[derive(Debug)]
pub struct ResultCollector {
    expected: usize,
    results: BTreeMap<usize, Vec<RecordBatch>>,
    merge: Merge,
}

impl ResultCollector {
    pub fn new(expected: usize, merge: Merge) -> Self {
        Self {
            expected,
            results: BTreeMap::new(),
            merge,
        }
    }

    /// Record the result of node `node`
    pub fn add_result(&mut self, node: usize, batches: Vec<RecordBatch>) {
        self.results.insert(node, batches);
    }

    pub fn is_complete(&self) -> bool {
        self.results.len() >= self.expected
    }

    pub fn collected_count(&self) -> usize {
        self.results.len()
    }

    /// Rows collected so far, before merging
    pub fn row_count(&self) -> usize {
        self.results
            .values()
            .flatten()
            .map(RecordBatch::num_rows)
            .sum()
    }

    /// Merge collected results in node-index order
    pub fn finalize(self) -> Result<Vec<RecordBatch>> {
        if !self.is_complete() {
            return Err(DistributedError::MergeError(format!(
                "only {} of {} nodes answered",
                self.results.len(),
                self.expected
            )));
        }
        self.merge.execute(self.results.into_values().collect())
    }
}
