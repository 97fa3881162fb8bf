//! Hash-segmented bisection diff.
//!
//! Locates all differing rows between two table segments while minimising
//! bytes transferred: one `(count, sum)` checksum round trip per side
//! proves large segments equal; unequal segments split at shared pivot
//! keys and recurse until they fit under the leaf threshold, where rows
//! are materialised and merge-joined.
//!
//! Guarantees: every differing row is reported at least once, no matching
//! row is ever reported, and the emitted multiset is invariant under
//! bisection factor and worker count. Child recursions run on a bounded
//! permit pool; cancellation is checked at every descent and before every
//! round trip.

use std::sync::atomic::Ordering as AtomicOrdering;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::diff::{
    self, CancelFlag, DiffCounters, DiffKind, DiffRow, DiffSink,
};
use crate::error::DiffError;
use crate::hash::SegmentChecksum;
use crate::segment::TableSegment;
use crate::types::ValueCompareOptions;

/// Tunables for one hash-diff run.
#[derive(Debug, Clone)]
pub struct HashDiffOptions {
    /// Segment size below which rows are materialised and merge-joined.
    pub bisection_threshold: u64,
    /// Number of children per recursive split.
    pub bisection_factor: usize,
    /// Concurrent SQL round trips across both sides combined.
    pub threads: usize,
    /// Value-equality semantics at the leaves.
    pub compare: ValueCompareOptions,
    /// Rows per batch handed to the persistence writer.
    pub batch_size: usize,
}

impl Default for HashDiffOptions {
    fn default() -> Self {
        Self {
            bisection_threshold: crate::config::DEFAULT_BISECTION_THRESHOLD,
            bisection_factor: crate::config::DEFAULT_BISECTION_FACTOR,
            threads: 8,
            compare: ValueCompareOptions::default(),
            batch_size: 1_000,
        }
    }
}

struct DiffCtx {
    opts: HashDiffOptions,
    cancel: CancelFlag,
    sink: DiffSink,
    counters: Arc<DiffCounters>,
    permits: Semaphore,
}

/// Run the bisection diff over one segment pair. Diff rows stream into
/// `sink`; aggregate counts accumulate in `counters`.
pub async fn hash_diff(
    source: TableSegment,
    target: TableSegment,
    opts: HashDiffOptions,
    cancel: CancelFlag,
    sink: DiffSink,
    counters: Arc<DiffCounters>,
) -> Result<(), DiffError> {
    let threads = opts.threads.max(1);
    let ctx = Arc::new(DiffCtx {
        opts,
        cancel,
        sink,
        counters,
        permits: Semaphore::new(threads),
    });
    diff_pair(ctx, source, target, 0).await
}

/// Recursive bisection over an aligned segment pair.
fn diff_pair(
    ctx: Arc<DiffCtx>,
    source: TableSegment,
    target: TableSegment,
    depth: u32,
) -> BoxFuture<'static, Result<(), DiffError>> {
    Box::pin(async move {
        ctx.cancel.check()?;

        let (source_sum, target_sum) = tokio::try_join!(
            segment_checksum(&ctx, &source),
            segment_checksum(&ctx, &target),
        )?;

        // Equal (count, sum): the segments are identical, stop here.
        if source_sum == target_sum {
            ctx.counters.record_matched(source_sum.count);
            return Ok(());
        }

        // Equal aggregate with differing counts cannot come out of a
        // correct driver; surface it instead of silently succeeding.
        if source_sum.sum == target_sum.sum
            && source_sum.count != target_sum.count
            && source_sum.count.min(target_sum.count) > 0
        {
            return Err(DiffError::Internal(format!(
                "checksum collision across differing row counts ({} vs {})",
                source_sum.count, target_sum.count
            )));
        }

        // One side empty: everything on the non-empty side is exclusive,
        // no bisection needed. Large segments are paged by key so no
        // single round trip materialises more than a threshold of rows.
        if source_sum.count == 0 {
            return emit_exclusive_segment(
                &ctx,
                &target,
                target_sum.count,
                DiffKind::ExclusiveTarget,
            )
            .await;
        }
        if target_sum.count == 0 {
            return emit_exclusive_segment(
                &ctx,
                &source,
                source_sum.count,
                DiffKind::ExclusiveSource,
            )
            .await;
        }

        let larger = source_sum.count.max(target_sum.count);
        if larger <= ctx.opts.bisection_threshold {
            return leaf_compare(&ctx, &source, &target).await;
        }

        // Pivots come from the source; the target splits at the identical
        // keys so child pairs stay aligned.
        let mut pivots = sample_pivots(&ctx, &source, source_sum.count).await?;

        // A source too small or too uniform to yield a usable pivot
        // cannot bound the leaf fetch; resample from the target before
        // conceding, so an oversized target never materialises whole.
        if source.split_at(&pivots).len() < 2
            && target_sum.count > ctx.opts.bisection_threshold
        {
            pivots = sample_pivots(&ctx, &target, target_sum.count).await?;
        }

        let source_children = source.split_at(&pivots);
        // No usable pivot on either side (all keys equal, or the bounds
        // have collapsed): compared directly regardless of size.
        if source_children.len() < 2 {
            return leaf_compare(&ctx, &source, &target).await;
        }
        let target_children = target.split_at(&pivots);
        if source_children.len() != target_children.len() {
            return Err(DiffError::Internal(format!(
                "misaligned split: {} source children vs {} target children",
                source_children.len(),
                target_children.len()
            )));
        }

        let mut tasks: JoinSet<Result<(), DiffError>> = JoinSet::new();
        for (s_child, t_child) in source_children.into_iter().zip(target_children) {
            let ctx = Arc::clone(&ctx);
            tasks.spawn(diff_pair(ctx, s_child, t_child, depth + 1));
        }
        while let Some(joined) = tasks.join_next().await {
            joined.map_err(|e| DiffError::Internal(format!("diff worker panicked: {e}")))??;
        }
        Ok(())
    })
}

async fn acquire<'a>(
    ctx: &'a DiffCtx,
) -> Result<tokio::sync::SemaphorePermit<'a>, DiffError> {
    ctx.permits
        .acquire()
        .await
        .map_err(|_| DiffError::Internal("diff permit pool closed".into()))
}

async fn segment_checksum(
    ctx: &DiffCtx,
    segment: &TableSegment,
) -> Result<SegmentChecksum, DiffError> {
    ctx.cancel.check()?;
    let _permit = acquire(ctx).await?;
    ctx.counters.record_round_trip();
    segment.driver.checksum(segment).await
}

/// One systematic key-sampling round trip against one side.
async fn sample_pivots(
    ctx: &DiffCtx,
    segment: &TableSegment,
    count: u64,
) -> Result<Vec<crate::segment::KeyTuple>, DiffError> {
    ctx.cancel.check()?;
    let _permit = acquire(ctx).await?;
    ctx.counters.record_round_trip();
    segment
        .driver
        .fetch_keys(
            segment,
            ctx.opts.bisection_factor.saturating_sub(1) as u64,
            count.max(1),
        )
        .await
}

/// Materialise both sides and merge-join on the key tuple.
async fn leaf_compare(
    ctx: &DiffCtx,
    source: &TableSegment,
    target: &TableSegment,
) -> Result<(), DiffError> {
    let columns = source.compared_columns();
    let (source_rows, target_rows) = tokio::try_join!(
        fetch_segment_rows(ctx, source, &columns),
        fetch_segment_rows(ctx, target, &columns),
    )?;
    diff::merge_compare(
        &source.key_columns,
        &source.value_columns,
        source_rows,
        target_rows,
        ctx.opts.compare,
        &ctx.counters,
        &ctx.sink,
        ctx.opts.batch_size,
    )
    .await
}

async fn fetch_segment_rows(
    ctx: &DiffCtx,
    segment: &TableSegment,
    columns: &[crate::segment::SegmentColumn],
) -> Result<Vec<Vec<serde_json::Value>>, DiffError> {
    ctx.cancel.check()?;
    let _permit = acquire(ctx).await?;
    ctx.counters.record_round_trip();
    segment.driver.fetch_rows(segment, columns).await
}

/// Everything in `segment` is exclusive to its side. Segments under the
/// threshold fetch their keys in one round trip; larger ones are carved
/// into threshold-sized key ranges at sampled pivots first, keeping every
/// fetch bounded.
async fn emit_exclusive_segment(
    ctx: &DiffCtx,
    segment: &TableSegment,
    count: u64,
    kind: DiffKind,
) -> Result<(), DiffError> {
    if count <= ctx.opts.bisection_threshold {
        return emit_all_exclusive(ctx, segment, kind).await;
    }

    let chunks = count.div_ceil(ctx.opts.bisection_threshold);
    let pivots = {
        ctx.cancel.check()?;
        let _permit = acquire(ctx).await?;
        ctx.counters.record_round_trip();
        segment.driver.fetch_keys(segment, chunks - 1, count).await?
    };
    // A degenerate key distribution can leave no usable pivot; split_at
    // then returns the segment whole and the fetch below is unchunked.
    for child in segment.split_at(&pivots) {
        ctx.cancel.check()?;
        emit_all_exclusive(ctx, &child, kind).await?;
    }
    Ok(())
}

/// Fetch one bounded segment's keys and emit them all as exclusive rows.
async fn emit_all_exclusive(
    ctx: &DiffCtx,
    segment: &TableSegment,
    kind: DiffKind,
) -> Result<(), DiffError> {
    let rows = fetch_segment_rows(ctx, segment, &segment.key_columns).await?;
    let count = rows.len() as u64;
    let counter = match kind {
        DiffKind::ExclusiveSource => &ctx.counters.exclusive_source,
        DiffKind::ExclusiveTarget => &ctx.counters.exclusive_target,
        DiffKind::ValueMismatch => {
            return Err(DiffError::Internal(
                "emit_all_exclusive called with a mismatch kind".into(),
            ));
        }
    };
    counter.fetch_add(count, AtomicOrdering::Relaxed);
    ctx.counters
        .rows_compared
        .fetch_add(count, AtomicOrdering::Relaxed);

    for chunk in rows.chunks(ctx.opts.batch_size.max(1)) {
        let batch: Vec<DiffRow> = chunk
            .iter()
            .map(|key| DiffRow {
                kind,
                key: key.clone(),
                column: None,
                source_value: None,
                target_value: None,
            })
            .collect();
        diff::send_batch(&ctx.sink, batch).await?;
    }
    Ok(())
}
