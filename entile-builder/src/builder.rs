//! Point ingestion: the construction pipeline from sources to chunks.
//!
//! A build runs three phases:
//!
//! 1. **Scan** — analyze sources that lack info, then derive the root
//!    bounds (cubified union), schema and quantization.
//! 2. **Ingest** — a fixed pool of OS threads pulls batches from the
//!    reader, worker-per-source. Each point descends from the root key
//!    until a cell accepts it; base cells drain their overflow region in
//!    bulk one level down. All cell access goes through the per-worker
//!    clipper so a batch's pins release in one pass.
//! 3. **Flush** — drain the cache, write hierarchy blocks, write the
//!    manifest last.
//!
//! Cancellation is cooperative: one atomic flag checked at batch
//! boundaries. A cancelled or resumed build picks up from the per-source
//! statuses recorded in the manifest.

use crate::cache::{CacheConfig, ChunkCache};
use crate::cell::InsertResult;
use crate::clipper::Clipper;
use crate::config::BuildConfig;
use crate::reader::{ReadOptions, SourceReader, SourceStream};
use crate::store::{ChunkStore, RetryPolicy};
use entile_core::hierarchy::{block_to_json, Hierarchy};
use entile_core::manifest::layout;
use entile_core::{
    join_key, Bounds, Dimension, Endpoint, Error, Manifest, Point, PointKey, Result, ScaleOffset,
    Schema, Source, SourceInfo, SourceStatus, Subset, FORMAT_VERSION,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Cooperative cancellation flag shared with the caller.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Per-point anomaly and progress counters, shared across workers.
#[derive(Debug, Default)]
struct Counters {
    inserted: AtomicU64,
    out_of_bounds: AtomicU64,
    invalid: AtomicU64,
    duplicate_points: AtomicU64,
}

impl Counters {
    /// A relocated point lost a race against an identical coordinate:
    /// reclassify it from inserted to duplicate.
    fn relocated_duplicate(&self) {
        let _ = self
            .inserted
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(1))
            });
        self.duplicate_points.fetch_add(1, Ordering::Relaxed);
    }
}

/// Batch-local counters, flushed into the shared atomics at clip time so
/// the hot loop touches no shared cache lines.
#[derive(Debug, Default, Clone, Copy)]
struct LocalCounters {
    inserted: u64,
    out_of_bounds: u64,
    invalid: u64,
    duplicate_points: u64,
}

impl LocalCounters {
    fn flush_into(&mut self, shared: &Counters) {
        shared.inserted.fetch_add(self.inserted, Ordering::Relaxed);
        shared
            .out_of_bounds
            .fetch_add(self.out_of_bounds, Ordering::Relaxed);
        shared.invalid.fetch_add(self.invalid, Ordering::Relaxed);
        shared
            .duplicate_points
            .fetch_add(self.duplicate_points, Ordering::Relaxed);
        *self = LocalCounters::default();
    }
}

/// What a finished (or cancelled) build produced.
#[derive(Debug, Clone)]
pub struct BuildSummary {
    pub points: u64,
    pub out_of_bounds: u64,
    pub invalid: u64,
    pub duplicate_points: u64,
    pub chunks: usize,
    pub sources: Vec<Source>,
}

/// Build-wide shared state handed to every worker.
struct BuildContext {
    config: BuildConfig,
    bounds: Bounds,
    subset: Option<Subset>,
    null_depth: u32,
    schema: Schema,
    cache: ChunkCache,
    hierarchy: Hierarchy,
    counters: Counters,
    cancel: CancelToken,
    sources: Mutex<Vec<Source>>,
    queue: Mutex<VecDeque<usize>>,
    fatal: Mutex<Option<Error>>,
}

impl BuildContext {
    fn aborted(&self) -> bool {
        self.cancel.cancelled() || self.fatal.lock().is_some()
    }

    /// Snap coordinates onto the quantization grid so descent, duplicate
    /// detection and the persisted form all see identical values.
    fn snap(&self, mut point: Point) -> Point {
        if let Some(so) = &self.schema.scale_offset {
            point.x = so.backward(0, so.forward(0, point.x));
            point.y = so.backward(1, so.forward(1, point.y));
            point.z = so.backward(2, so.forward(2, point.z));
        }
        point
    }
}

/// Drives one build from configuration to manifest.
pub struct Builder {
    config: BuildConfig,
    endpoint: Arc<dyn Endpoint>,
    reader: Arc<dyn SourceReader>,
    cancel: CancelToken,
}

impl Builder {
    pub fn new(
        config: BuildConfig,
        endpoint: Arc<dyn Endpoint>,
        reader: Arc<dyn SourceReader>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Builder {
            config,
            endpoint,
            reader,
            cancel: CancelToken::default(),
        })
    }

    /// Token for cancelling this build from another thread.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    fn postfix(&self) -> String {
        self.config
            .subset
            .as_ref()
            .map(|s| format!("-{}", s.id))
            .unwrap_or_default()
    }

    fn read_options(&self) -> ReadOptions {
        ReadOptions {
            reprojection: self.config.reprojection.clone(),
        }
    }

    /// Run the build to completion (or cancellation; the partial output
    /// is flushed and resumable either way).
    pub fn build(&self) -> Result<BuildSummary> {
        let postfix = self.postfix();
        let prefix = self.config.output.clone();

        // Resume: pick up statuses, bounds and schema from a prior run.
        let previous = if self.config.reset_files {
            None
        } else {
            Manifest::load(self.endpoint.as_ref(), &prefix, &postfix)?
        };
        let resumed = previous.is_some();

        let mut sources = self.collect_sources(previous.as_ref());
        self.scan(&mut sources)?;

        let (bounds, bounds_conforming, schema, srs) =
            self.derive_build_frame(previous.as_ref(), &sources)?;

        let subset = match &self.config.subset {
            Some(spec) => Some(Subset::new(&bounds, spec.id, spec.of)?),
            None => None,
        };
        let null_depth = subset.as_ref().map_or(0, |s| s.minimum_null_depth());

        let store = ChunkStore::new(
            Arc::clone(&self.endpoint),
            prefix.clone(),
            postfix.clone(),
            schema.clone(),
            self.config.data_type,
            RetryPolicy {
                attempts: self.config.retry_attempts,
                base_delay: Duration::from_millis(self.config.retry_base_delay_ms),
            },
        );
        let cache = ChunkCache::new(
            store,
            CacheConfig {
                chunk_capacity: self.config.chunk_capacity() as usize,
                base_depth_end: null_depth + self.config.base_depth,
                soft_cap: self.config.cache_soft_cap,
                load_existing: resumed,
            },
        );

        let hierarchy = Hierarchy::new();
        let counters = Counters::default();
        if let Some(m) = &previous {
            self.rehydrate_hierarchy(&hierarchy, &prefix, &postfix)?;
            counters.inserted.store(m.points, Ordering::Relaxed);
            counters.out_of_bounds.store(m.out_of_bounds, Ordering::Relaxed);
            counters.invalid.store(m.invalid, Ordering::Relaxed);
            counters
                .duplicate_points
                .store(m.duplicate_points, Ordering::Relaxed);
        }

        let queue: VecDeque<usize> = sources
            .iter()
            .enumerate()
            .filter(|(_, s)| s.status == SourceStatus::Pending)
            .map(|(i, _)| i)
            .collect();

        let ctx = BuildContext {
            config: self.config.clone(),
            bounds,
            subset,
            null_depth,
            schema: schema.clone(),
            cache,
            hierarchy,
            counters,
            cancel: self.cancel.clone(),
            sources: Mutex::new(sources),
            queue: Mutex::new(queue),
            fatal: Mutex::new(None),
        };

        self.ingest(&ctx);

        // Flush even after cancellation or a fatal error so the partial
        // build stays resumable; a fatal error wins over flush failures.
        let flush_result = self.flush(&ctx, &prefix, &postfix, bounds_conforming, srs);
        if let Some(fatal) = ctx.fatal.lock().take() {
            if let Err(e) = flush_result {
                tracing::warn!(error = %e, "flush failed after fatal error");
            }
            return Err(fatal);
        }
        flush_result?;

        if self.cancel.cancelled() {
            return Err(Error::Cancelled);
        }

        let sources = ctx.sources.lock().clone();
        Ok(BuildSummary {
            points: ctx.counters.inserted.load(Ordering::Relaxed),
            out_of_bounds: ctx.counters.out_of_bounds.load(Ordering::Relaxed),
            invalid: ctx.counters.invalid.load(Ordering::Relaxed),
            duplicate_points: ctx.counters.duplicate_points.load(Ordering::Relaxed),
            chunks: ctx.hierarchy.len(),
            sources,
        })
    }

    /// Merge configured inputs with statuses from a prior manifest.
    fn collect_sources(&self, previous: Option<&Manifest>) -> Vec<Source> {
        self.config
            .input
            .iter()
            .map(|path| {
                previous
                    .and_then(|m| m.sources.iter().find(|s| &s.path == path))
                    .cloned()
                    .unwrap_or_else(|| Source::new(path.clone()))
            })
            .collect()
    }

    /// Analyze every source that still lacks info, fanned out over the
    /// worker pool. The reader serializes its own preparation substep
    /// under the prepare lock; the decode-heavy part of analysis runs
    /// unlocked and in parallel.
    fn scan(&self, sources: &mut [Source]) -> Result<()> {
        let pending: VecDeque<(usize, String)> = sources
            .iter()
            .enumerate()
            .filter(|(_, s)| s.info.is_none() && s.status == SourceStatus::Pending)
            .map(|(i, s)| (i, s.path.clone()))
            .collect();
        if pending.is_empty() {
            return Ok(());
        }

        let _span = tracing::info_span!("scan", sources = pending.len()).entered();
        let options = self.read_options();
        let workers = self.config.threads.min(pending.len());
        let queue = Mutex::new(pending);
        let results: Mutex<Vec<(usize, Result<SourceInfo>)>> = Mutex::new(Vec::new());
        std::thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| loop {
                    let Some((index, path)) = queue.lock().pop_front() else {
                        break;
                    };
                    let info = self.reader.info(&path, &options);
                    results.lock().push((index, info));
                });
            }
        });

        for (index, info) in results.into_inner() {
            let source = &mut sources[index];
            match info {
                Ok(info) => {
                    tracing::info!(source = %source.path, points = info.points, "source analyzed");
                    source.info = Some(info);
                }
                Err(e) => {
                    tracing::warn!(source = %source.path, error = %e, "source analysis failed");
                    source.status = SourceStatus::Error;
                    source.info = Some(SourceInfo {
                        errors: vec![e.to_string()],
                        ..SourceInfo::default()
                    });
                }
            }
        }
        Ok(())
    }

    /// Root bounds, conforming bounds, schema and SRS — reused verbatim
    /// from a prior manifest so a resumed build places points identically.
    fn derive_build_frame(
        &self,
        previous: Option<&Manifest>,
        sources: &[Source],
    ) -> Result<(Bounds, Bounds, Schema, Option<String>)> {
        if let Some(m) = previous {
            return Ok((m.bounds, m.bounds_conforming, m.schema.clone(), m.srs.clone()));
        }

        let infos: Vec<&SourceInfo> = sources.iter().filter_map(|s| s.info.as_ref()).collect();
        let conforming = infos
            .iter()
            .filter_map(|i| i.bounds)
            .reduce(|a, b| a.union(&b))
            .ok_or_else(|| Error::invalid_input("no source reported bounds"))?;
        let bounds = conforming.cubeify();

        let srs = match &self.config.reprojection {
            Some(r) => Some(r.out_srs.clone()),
            None => infos.iter().find_map(|i| i.srs.clone()),
        };

        // Quantization: configuration wins; otherwise the coarsest scale
        // any source declares, anchored at the rounded center.
        let scale = self.config.scale.or_else(|| {
            let mut scale = [0.0f64; 3];
            for (axis, name) in ["X", "Y", "Z"].into_iter().enumerate() {
                for info in &infos {
                    if let Some(s) = info
                        .dimensions
                        .iter()
                        .find(|d| d.name == name)
                        .and_then(|d| d.scale)
                    {
                        scale[axis] = scale[axis].max(s);
                    }
                }
            }
            (scale.iter().all(|s| *s > 0.0)).then_some(scale)
        });
        let scale_offset = match scale {
            Some(scale) => {
                let offset = self.config.offset.unwrap_or_else(|| {
                    let c = conforming.center();
                    [c[0].round(), c[1].round(), c[2].round()]
                });
                Some(ScaleOffset::new(scale, offset)?)
            }
            None => None,
        };

        // Dimension list: coordinates first, then every auxiliary
        // dimension in order of first appearance.
        let mut schema = Schema::xyz();
        schema.scale_offset = scale_offset;
        for info in &infos {
            for stat in &info.dimensions {
                if matches!(stat.name.as_str(), "X" | "Y" | "Z") {
                    continue;
                }
                if !schema.dims.iter().any(|d| d.name == stat.name) {
                    schema.dims.push(Dimension::new(stat.name.clone(), stat.dtype));
                }
            }
        }
        schema.validate()?;

        Ok((bounds, conforming, schema, srs))
    }

    /// Reload hierarchy counts persisted by the run being resumed.
    fn rehydrate_hierarchy(
        &self,
        hierarchy: &Hierarchy,
        prefix: &str,
        postfix: &str,
    ) -> Result<()> {
        let id = self.config.subset.as_ref().map(|s| s.id);
        let dir = join_key(prefix, layout::HIERARCHY_DIR);
        for object in self.endpoint.list(&format!("{}/", dir))? {
            let name = object.rsplit('/').next().unwrap_or(&object);
            let Some((_root, block_id)) = layout::parse_hierarchy_block(name) else {
                continue;
            };
            if block_id != id {
                continue;
            }
            let bytes = self.endpoint.get(&object)?;
            for (key, count) in entile_core::hierarchy::block_from_json(&bytes)? {
                hierarchy.increment(key, count);
            }
        }
        tracing::info!(nodes = hierarchy.len(), points = hierarchy.total_points(), "hierarchy rehydrated");
        Ok(())
    }

    /// The worker pool. Each worker owns a clipper and pulls whole
    /// sources from the queue until it drains or the build aborts.
    fn ingest(&self, ctx: &BuildContext) {
        let _span = tracing::info_span!("ingest", threads = self.config.threads).entered();
        std::thread::scope(|scope| {
            for _ in 0..self.config.threads {
                scope.spawn(|| {
                    let mut clipper = Clipper::new(&ctx.cache);
                    let mut evict_budget = ctx.config.evict_interval;
                    loop {
                        if ctx.aborted() {
                            break;
                        }
                        let Some(index) = ctx.queue.lock().pop_front() else {
                            break;
                        };
                        if let Err(e) =
                            self.process_source(ctx, index, &mut clipper, &mut evict_budget)
                        {
                            let mut fatal = ctx.fatal.lock();
                            if fatal.is_none() {
                                tracing::error!(error = %e, "fatal error, aborting build");
                                *fatal = Some(e);
                            }
                            break;
                        }
                    }
                    clipper.clip();
                });
            }
        });
    }

    /// Ingest one source. Reader failures isolate to the source; cache
    /// and store failures are fatal and propagate.
    fn process_source(
        &self,
        ctx: &BuildContext,
        index: usize,
        clipper: &mut Clipper<'_>,
        evict_budget: &mut u64,
    ) -> Result<()> {
        let (path, skip) = {
            let sources = ctx.sources.lock();
            (sources[index].path.clone(), sources[index].points_inserted)
        };
        let _span = tracing::info_span!("source", path = %path).entered();

        let options = self.read_options();
        let mut stream = match self.reader.open(&path, &options) {
            Ok(s) => s,
            Err(e) => {
                self.fail_source(ctx, index, e);
                return Ok(());
            }
        };

        // Fast-forward a partially ingested source to where it stopped.
        let mut consumed = 0u64;
        while consumed < skip {
            let want = (skip - consumed).min(self.config.batch_size as u64) as usize;
            match stream.next_batch(want) {
                Ok(batch) if batch.is_empty() => break,
                Ok(batch) => consumed += batch.len() as u64,
                Err(e) => {
                    self.fail_source(ctx, index, e);
                    return Ok(());
                }
            }
        }
        if consumed > 0 {
            tracing::info!(points = consumed, "fast-forwarded previously ingested points");
        }

        let mut local = LocalCounters::default();
        loop {
            if ctx.aborted() {
                // Leave the source pending with its progress recorded.
                return Ok(());
            }
            let batch = match stream.next_batch(self.config.batch_size) {
                Ok(batch) => batch,
                Err(e) => {
                    self.fail_source(ctx, index, e);
                    return Ok(());
                }
            };
            if batch.is_empty() {
                break;
            }

            let batch_len = batch.len() as u64;
            for point in batch {
                self.insert_point(ctx, clipper, &mut local, point)?;
            }

            // Batch commit: release pins, publish counters and progress.
            clipper.clip();
            local.flush_into(&ctx.counters);
            consumed += batch_len;
            ctx.sources.lock()[index].points_inserted = consumed;

            *evict_budget = evict_budget.saturating_sub(batch_len);
            if *evict_budget == 0 {
                ctx.cache.maybe_evict()?;
                *evict_budget = ctx.config.evict_interval;
            }
        }

        let mut sources = ctx.sources.lock();
        sources[index].status = SourceStatus::Inserted;
        sources[index].points_inserted = consumed;
        tracing::info!(points = consumed, "source inserted");
        Ok(())
    }

    fn fail_source(&self, ctx: &BuildContext, index: usize, error: Error) {
        tracing::warn!(error = %error, "source failed");
        let mut sources = ctx.sources.lock();
        let source = &mut sources[index];
        source.status = SourceStatus::Error;
        source
            .info
            .get_or_insert_with(SourceInfo::default)
            .errors
            .push(error.to_string());
    }

    /// Insert one point: validate, snap, descend until a cell accepts it.
    fn insert_point(
        &self,
        ctx: &BuildContext,
        clipper: &mut Clipper<'_>,
        local: &mut LocalCounters,
        point: Point,
    ) -> Result<()> {
        if !point.is_finite() {
            local.invalid += 1;
            return Ok(());
        }
        if !ctx.bounds.contains(point.position()) {
            local.out_of_bounds += 1;
            return Ok(());
        }
        let point = ctx.snap(point);

        // Subset builds own one column of cells starting at the null
        // depth; descent decides membership so boundary ties land exactly
        // one shard, matching the low-side octant rule.
        let mut start = PointKey::root(ctx.bounds);
        for _ in 0..ctx.null_depth {
            start.step(point.position());
        }
        if let Some(subset) = &ctx.subset {
            if !subset.owns(&start.key()) {
                local.out_of_bounds += 1;
                return Ok(());
            }
        }

        // Worklist of (position in the tree, point, relocated). Relocated
        // entries are drained base-cell overflow: already counted, only
        // moving deeper.
        let mut work: Vec<(PointKey, Point, bool)> = vec![(start, point, false)];
        while let Some((mut pk, mut pt, relocated)) = work.pop() {
            loop {
                let at_max = pk.depth() >= ctx.config.max_depth;
                let cell = clipper.acquire(pk.key())?;
                let moved = pt;
                match cell.with(move |c| c.insert(moved, at_max)) {
                    InsertResult::Inserted => {
                        ctx.hierarchy.increment(pk.key(), 1);
                        if !relocated {
                            local.inserted += 1;
                        }
                        break;
                    }
                    InsertResult::Duplicate(_) => {
                        if relocated {
                            // Lost a drain race against an identical
                            // coordinate inserted concurrently below.
                            local.flush_into(&ctx.counters);
                            ctx.counters.relocated_duplicate();
                        } else {
                            local.duplicate_points += 1;
                        }
                        break;
                    }
                    InsertResult::Full(p) => {
                        pk.step(p.position());
                        pt = p;
                    }
                    InsertResult::Drained(drained, p) => {
                        ctx.hierarchy.decrement(pk.key(), drained.len() as u64);
                        for d in drained {
                            let mut child = pk;
                            child.step(d.position());
                            work.push((child, d, true));
                        }
                        pk.step(p.position());
                        pt = p;
                    }
                }
            }
        }
        Ok(())
    }

    /// Drain the cache and make the build durable: chunks, hierarchy
    /// blocks, source objects, manifest last.
    fn flush(
        &self,
        ctx: &BuildContext,
        prefix: &str,
        postfix: &str,
        bounds_conforming: Bounds,
        srs: Option<String>,
    ) -> Result<()> {
        let _span = tracing::info_span!("flush").entered();
        ctx.cache.flush()?;

        let retry = RetryPolicy {
            attempts: self.config.retry_attempts,
            base_delay: Duration::from_millis(self.config.retry_base_delay_ms),
        };
        for (root, entries) in ctx.hierarchy.to_blocks(self.config.hierarchy_step) {
            let object = join_key(prefix, &layout::hierarchy_block(&root, postfix));
            let bytes = block_to_json(&entries)?;
            retry.run(&object, || self.endpoint.put(&object, &bytes))?;
        }

        let manifest = Manifest {
            version: FORMAT_VERSION.to_string(),
            bounds: ctx.bounds,
            bounds_conforming,
            points: ctx.hierarchy.total_points(),
            span: self.config.span,
            chunk_capacity: self.config.chunk_capacity(),
            hierarchy_step: self.config.hierarchy_step,
            data_type: self.config.data_type,
            schema: ctx.schema.clone(),
            srs,
            out_of_bounds: ctx.counters.out_of_bounds.load(Ordering::Relaxed),
            invalid: ctx.counters.invalid.load(Ordering::Relaxed),
            duplicate_points: ctx.counters.duplicate_points.load(Ordering::Relaxed),
            subset: ctx.subset,
            sources: ctx.sources.lock().clone(),
            software: concat!("entile ", env!("CARGO_PKG_VERSION")).to_string(),
        };
        manifest.save(self.endpoint.as_ref(), prefix, postfix)?;
        tracing::info!(
            points = manifest.points,
            chunks = ctx.hierarchy.len(),
            "build flushed"
        );
        Ok(())
    }
}
