//! Upsert engine: writes an [`EntityBatch`] in bounded chunks.
//!
//! Kinds are written in foreign-key order (studies, analyses, samples,
//! sample factors, features, measurements). Each chunk is one multi-row
//! `INSERT .. ON CONFLICT` statement inside its own transaction, so a
//! failure or cancellation leaves earlier chunks committed and re-running
//! converges on the same state.
//!
//! Created vs. updated is decided per chunk by counting keys that already
//! exist before the write. "Updated" therefore means "key was present";
//! studies are never modified, so theirs is an unchanged count.
//!
//! In dry-run mode the whole batch runs inside one outer transaction, each
//! chunk in a savepoint, and the outer transaction is rolled back. Counts are
//! identical to a real run.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use sqlx::query_builder::Separated;
use sqlx::{Connection, QueryBuilder, Sqlite, SqlitePool, Transaction};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::UpsertConfig;
use crate::error::{Error, Result, Warning};
use crate::models::{
    AnalysisRow, FeatureRow, MeasurementRow, SampleFactorRow, SampleRow, StudyRow,
};
use crate::normalize::EntityBatch;

/// Largest accepted chunk. Measurement rows bind 7 parameters each and
/// SQLite allows 32766 per statement.
pub const MAX_BATCH_SIZE: usize = 4000;

#[derive(Debug, Clone)]
pub struct UpsertOptions {
    /// Rows per chunk.
    pub batch_size: usize,
    pub dry_run: bool,
    /// Checked before every chunk.
    pub cancel: Option<Arc<AtomicBool>>,
}

impl Default for UpsertOptions {
    fn default() -> Self {
        Self::from_config(&UpsertConfig::default())
    }
}

impl UpsertOptions {
    pub fn from_config(config: &UpsertConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            dry_run: false,
            cancel: None,
        }
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_cancel(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    fn cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Relaxed))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KindCounts {
    pub processed: usize,
    pub created: usize,
    pub updated: usize,
}

impl KindCounts {
    fn add(&mut self, other: KindCounts) {
        self.processed += other.processed;
        self.created += other.created;
        self.updated += other.updated;
    }
}

#[derive(Debug, Clone, Default)]
pub struct UpsertReport {
    pub studies: KindCounts,
    pub analyses: KindCounts,
    pub samples: KindCounts,
    pub sample_factors: KindCounts,
    pub features: KindCounts,
    pub measurements: KindCounts,
    pub dry_run: bool,
    /// Warnings handed in from parsing and normalization.
    pub warnings: Vec<Warning>,
}

impl UpsertReport {
    /// `(kind, counts)` pairs in write order.
    pub fn kinds(&self) -> [(&'static str, KindCounts); 6] {
        [
            (StudyRow::KIND, self.studies),
            (AnalysisRow::KIND, self.analyses),
            (SampleRow::KIND, self.samples),
            (SampleFactorRow::KIND, self.sample_factors),
            (FeatureRow::KIND, self.features),
            (MeasurementRow::KIND, self.measurements),
        ]
    }

    pub fn total_created(&self) -> usize {
        self.kinds().iter().map(|(_, c)| c.created).sum()
    }

    /// Fold another report's counts and warnings into this one.
    pub fn absorb(&mut self, other: UpsertReport) {
        self.studies.add(other.studies);
        self.analyses.add(other.analyses);
        self.samples.add(other.samples);
        self.sample_factors.add(other.sample_factors);
        self.features.add(other.features);
        self.measurements.add(other.measurements);
        self.warnings.extend(other.warnings);
    }
}

/// Write `batch`, carrying `warnings` into the report.
pub async fn upsert(
    pool: &SqlitePool,
    batch: &EntityBatch,
    warnings: Vec<Warning>,
    options: &UpsertOptions,
) -> Result<UpsertReport> {
    if options.batch_size == 0 || options.batch_size > MAX_BATCH_SIZE {
        return Err(Error::InvalidInput(format!(
            "batch size must be between 1 and {}, got {}",
            MAX_BATCH_SIZE, options.batch_size
        )));
    }

    let mut report = UpsertReport {
        dry_run: options.dry_run,
        warnings,
        ..UpsertReport::default()
    };

    if options.dry_run {
        let mut target = Target::Preview(pool.begin().await?);
        let outcome = write_batch(&mut target, batch, options, &mut report).await;
        if let Target::Preview(tx) = target {
            tx.rollback().await?;
        }
        outcome?;
    } else {
        write_batch(&mut Target::Commit(pool), batch, options, &mut report).await?;
    }

    info!(
        dry_run = options.dry_run,
        created = report.total_created(),
        measurements = report.measurements.processed,
        warnings = report.warnings.len(),
        "upsert finished"
    );
    Ok(report)
}

enum Target<'p> {
    Commit(&'p SqlitePool),
    Preview(Transaction<'static, Sqlite>),
}

impl Target<'_> {
    async fn begin_chunk(&mut self) -> Result<Transaction<'_, Sqlite>> {
        Ok(match self {
            Target::Commit(pool) => pool.begin().await?,
            Target::Preview(tx) => Connection::begin(&mut **tx).await?,
        })
    }
}

async fn write_batch(
    target: &mut Target<'_>,
    batch: &EntityBatch,
    options: &UpsertOptions,
    report: &mut UpsertReport,
) -> Result<()> {
    report.studies = write_kind(target, &batch.studies, options).await?;
    report.analyses = write_kind(target, &batch.analyses, options).await?;
    report.samples = write_kind(target, &batch.samples, options).await?;
    report.sample_factors = write_kind(target, &batch.sample_factors, options).await?;
    report.features = write_kind(target, &batch.features, options).await?;
    report.measurements = write_kind(target, &batch.measurements, options).await?;
    Ok(())
}

async fn write_kind<T: Entity>(
    target: &mut Target<'_>,
    rows: &[T],
    options: &UpsertOptions,
) -> Result<KindCounts> {
    let mut counts = KindCounts::default();
    let now = chrono::Utc::now().timestamp();

    for chunk in rows.chunks(options.batch_size) {
        if options.cancelled() {
            info!(kind = T::KIND, processed = counts.processed, "upsert cancelled");
            return Err(Error::Cancelled);
        }

        let mut tx = target.begin_chunk().await?;

        let mut existing_query = QueryBuilder::<Sqlite>::new(format!(
            "SELECT COUNT(*) FROM {} WHERE ({}) IN (",
            T::TABLE,
            T::KEY
        ));
        existing_query.push_values(chunk, |mut b, row| row.push_key(&mut b));
        existing_query.push(")");
        let existing: i64 = existing_query
            .build_query_scalar()
            .fetch_one(&mut *tx)
            .await?;

        let mut insert = QueryBuilder::<Sqlite>::new(T::INSERT);
        insert.push_values(chunk, |mut b, row| row.push_row(&mut b, now));
        insert.push(T::ON_CONFLICT);
        insert.build().execute(&mut *tx).await?;

        tx.commit().await?;

        let existing = existing as usize;
        counts.add(KindCounts {
            processed: chunk.len(),
            created: chunk.len().saturating_sub(existing),
            updated: existing,
        });
        debug!(kind = T::KIND, rows = chunk.len(), existing, "chunk written");
    }
    Ok(counts)
}

type Row<'qb, 'args> = Separated<'qb, 'args, Sqlite, &'static str>;

/// A normalized row kind and how it maps onto its table.
trait Entity: Sync {
    const KIND: &'static str;
    const TABLE: &'static str;
    /// Unique key columns, comma separated.
    const KEY: &'static str;
    const INSERT: &'static str;
    const ON_CONFLICT: &'static str;

    fn push_key<'args>(&'args self, b: &mut Row<'_, 'args>);
    fn push_row<'args>(&'args self, b: &mut Row<'_, 'args>, now: i64);
}

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

impl Entity for StudyRow {
    const KIND: &'static str = "studies";
    const TABLE: &'static str = "studies";
    const KEY: &'static str = "study_id";
    const INSERT: &'static str = "INSERT INTO studies (id, study_id, created_at) ";
    const ON_CONFLICT: &'static str = " ON CONFLICT(study_id) DO NOTHING";

    fn push_key<'args>(&'args self, b: &mut Row<'_, 'args>) {
        b.push_bind(&self.study_id);
    }

    fn push_row<'args>(&'args self, b: &mut Row<'_, 'args>, now: i64) {
        b.push_bind(new_id()).push_bind(&self.study_id).push_bind(now);
    }
}

impl Entity for AnalysisRow {
    const KIND: &'static str = "analyses";
    const TABLE: &'static str = "analyses";
    const KEY: &'static str = "study_id, analysis_id";
    const INSERT: &'static str =
        "INSERT INTO analyses (id, study_id, analysis_id, file_id, created_at) ";
    // Keep the first file that produced the analysis.
    const ON_CONFLICT: &'static str = " ON CONFLICT(study_id, analysis_id) DO UPDATE SET \
         file_id = COALESCE(analyses.file_id, excluded.file_id)";

    fn push_key<'args>(&'args self, b: &mut Row<'_, 'args>) {
        b.push_bind(&self.study_id).push_bind(&self.analysis_id);
    }

    fn push_row<'args>(&'args self, b: &mut Row<'_, 'args>, now: i64) {
        b.push_bind(new_id())
            .push_bind(&self.study_id)
            .push_bind(&self.analysis_id)
            .push_bind(&self.file_id)
            .push_bind(now);
    }
}

impl Entity for SampleRow {
    const KIND: &'static str = "samples";
    const TABLE: &'static str = "samples";
    const KEY: &'static str = "sample_uid";
    const INSERT: &'static str = "INSERT INTO samples \
         (id, sample_uid, study_id, sample_label, subject, factors_raw, created_at) ";
    const ON_CONFLICT: &'static str = " ON CONFLICT(sample_uid) DO UPDATE SET \
         sample_label = excluded.sample_label, \
         subject = excluded.subject, \
         factors_raw = COALESCE(excluded.factors_raw, samples.factors_raw)";

    fn push_key<'args>(&'args self, b: &mut Row<'_, 'args>) {
        b.push_bind(&self.sample_uid);
    }

    fn push_row<'args>(&'args self, b: &mut Row<'_, 'args>, now: i64) {
        b.push_bind(new_id())
            .push_bind(&self.sample_uid)
            .push_bind(&self.study_id)
            .push_bind(&self.sample_label)
            .push_bind(&self.subject)
            .push_bind(&self.factors_raw)
            .push_bind(now);
    }
}

impl Entity for SampleFactorRow {
    const KIND: &'static str = "sample_factors";
    const TABLE: &'static str = "sample_factors";
    const KEY: &'static str = "sample_uid, factor_key";
    const INSERT: &'static str = "INSERT INTO sample_factors \
         (id, sample_uid, factor_key, factor_value, created_at) ";
    const ON_CONFLICT: &'static str = " ON CONFLICT(sample_uid, factor_key) DO UPDATE SET \
         factor_value = excluded.factor_value";

    fn push_key<'args>(&'args self, b: &mut Row<'_, 'args>) {
        b.push_bind(&self.sample_uid).push_bind(&self.factor_key);
    }

    fn push_row<'args>(&'args self, b: &mut Row<'_, 'args>, now: i64) {
        b.push_bind(new_id())
            .push_bind(&self.sample_uid)
            .push_bind(&self.factor_key)
            .push_bind(&self.factor_value)
            .push_bind(now);
    }
}

impl Entity for FeatureRow {
    const KIND: &'static str = "features";
    const TABLE: &'static str = "features";
    const KEY: &'static str = "feature_uid";
    const INSERT: &'static str = "INSERT INTO features \
         (id, feature_uid, analysis_id, feature_type, name_raw, refmet_name, created_at) ";
    const ON_CONFLICT: &'static str = " ON CONFLICT(feature_uid) DO UPDATE SET \
         name_raw = excluded.name_raw, \
         refmet_name = COALESCE(excluded.refmet_name, features.refmet_name)";

    fn push_key<'args>(&'args self, b: &mut Row<'_, 'args>) {
        b.push_bind(&self.feature_uid);
    }

    fn push_row<'args>(&'args self, b: &mut Row<'_, 'args>, now: i64) {
        b.push_bind(new_id())
            .push_bind(&self.feature_uid)
            .push_bind(&self.analysis_id)
            .push_bind(&self.feature_type)
            .push_bind(&self.name_raw)
            .push_bind(&self.refmet_name)
            .push_bind(now);
    }
}

impl Entity for MeasurementRow {
    const KIND: &'static str = "measurements";
    const TABLE: &'static str = "measurements";
    const KEY: &'static str = "sample_uid, feature_uid";
    const INSERT: &'static str = "INSERT INTO measurements \
         (id, sample_uid, feature_uid, value, unit, created_at, updated_at) ";
    // Last write wins, including a missing reading replacing a value.
    const ON_CONFLICT: &'static str = " ON CONFLICT(sample_uid, feature_uid) DO UPDATE SET \
         value = excluded.value, \
         unit = excluded.unit, \
         updated_at = excluded.updated_at";

    fn push_key<'args>(&'args self, b: &mut Row<'_, 'args>) {
        b.push_bind(&self.sample_uid).push_bind(&self.feature_uid);
    }

    fn push_row<'args>(&'args self, b: &mut Row<'_, 'args>, now: i64) {
        b.push_bind(new_id())
            .push_bind(&self.sample_uid)
            .push_bind(&self.feature_uid)
            .push_bind(self.value)
            .push_bind(&self.unit)
            .push_bind(now)
            .push_bind(now);
    }
}
