//! Summary metric backed by a bounded sample window.
//!
//! The `prometheus` crate does not ship a summary type, so this module
//! implements one as a custom [`Collector`]. Each label combination
//! keeps the last [`WINDOW_SIZE`] observations; configured quantiles
//! are computed over that window at gather time. The error tolerance
//! attached to each objective is reported for exposition compatibility
//! but the window itself is exact.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use prometheus::core::{Collector, Desc};
use prometheus::proto;

/// Observations retained per label combination.
const WINDOW_SIZE: usize = 1024;

/// Default objectives, matching common client-library defaults:
/// median within 5%, p90 within 1%, p99 within 0.1%.
pub(crate) const DEFAULT_OBJECTIVES: &[(f64, f64)] = &[(0.5, 0.05), (0.9, 0.01), (0.99, 0.001)];

struct SummarySeries {
    count: u64,
    sum: f64,
    window: Vec<f64>,
    /// Next slot to overwrite once the window is full.
    cursor: usize,
}

impl SummarySeries {
    fn observe(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        if self.window.len() < WINDOW_SIZE {
            self.window.push(value);
        } else {
            self.window[self.cursor] = value;
            self.cursor = (self.cursor + 1) % WINDOW_SIZE;
        }
    }

    /// Nearest-rank quantile over the current window.
    fn quantile(sorted: &[f64], q: f64) -> f64 {
        if sorted.is_empty() {
            return f64::NAN;
        }
        let rank = (q * sorted.len() as f64).ceil() as usize;
        sorted[rank.clamp(1, sorted.len()) - 1]
    }
}

struct Inner {
    desc: Desc,
    label_names: Vec<String>,
    objectives: Vec<(f64, f64)>,
    series: RwLock<HashMap<Vec<String>, Mutex<SummarySeries>>>,
}

/// A labeled summary metric, collected through an owned registry.
#[derive(Clone)]
pub(crate) struct SummaryVec {
    inner: Arc<Inner>,
}

impl SummaryVec {
    pub(crate) fn new(
        name: &str,
        help: &str,
        label_names: &[String],
        objectives: Vec<(f64, f64)>,
    ) -> Result<Self, prometheus::Error> {
        let desc = Desc::new(
            name.to_string(),
            help.to_string(),
            label_names.to_vec(),
            HashMap::new(),
        )?;
        Ok(Self {
            inner: Arc::new(Inner {
                desc,
                label_names: label_names.to_vec(),
                objectives,
                series: RwLock::new(HashMap::new()),
            }),
        })
    }

    /// Record one observation for the given label combination.
    ///
    /// # Errors
    /// Rejects label-value tuples whose arity does not match the
    /// registered label names; the observation is dropped in that case.
    pub(crate) fn observe(
        &self,
        label_values: &[&str],
        value: f64,
    ) -> Result<(), prometheus::Error> {
        if label_values.len() != self.inner.label_names.len() {
            return Err(prometheus::Error::InconsistentCardinality {
                expect: self.inner.label_names.len(),
                got: label_values.len(),
            });
        }
        let key: Vec<String> = label_values.iter().map(|v| (*v).to_string()).collect();

        {
            let series = self.inner.series.read().expect("summary series lock poisoned");
            if let Some(existing) = series.get(&key) {
                existing
                    .lock()
                    .expect("summary series lock poisoned")
                    .observe(value);
                return Ok(());
            }
        }

        let mut series = self.inner.series.write().expect("summary series lock poisoned");
        series
            .entry(key)
            .or_insert_with(|| {
                Mutex::new(SummarySeries {
                    count: 0,
                    sum: 0.0,
                    window: Vec::new(),
                    cursor: 0,
                })
            })
            .lock()
            .expect("summary series lock poisoned")
            .observe(value);
        Ok(())
    }
}

impl Collector for SummaryVec {
    fn desc(&self) -> Vec<&Desc> {
        vec![&self.inner.desc]
    }

    fn collect(&self) -> Vec<proto::MetricFamily> {
        let series = self.inner.series.read().expect("summary series lock poisoned");

        let mut family = proto::MetricFamily::default();
        family.set_name(self.inner.desc.fq_name.clone());
        family.set_help(self.inner.desc.help.clone());
        family.set_field_type(proto::MetricType::SUMMARY);

        for (label_values, locked) in series.iter() {
            let snapshot = locked.lock().expect("summary series lock poisoned");
            let mut sorted = snapshot.window.clone();
            sorted.sort_by(|a, b| a.total_cmp(b));

            let mut summary = proto::Summary::default();
            summary.set_sample_count(snapshot.count);
            summary.set_sample_sum(snapshot.sum);
            for (q, _error) in &self.inner.objectives {
                let mut quantile = proto::Quantile::default();
                quantile.set_quantile(*q);
                quantile.set_value(SummarySeries::quantile(&sorted, *q));
                summary.mut_quantile().push(quantile);
            }

            let mut metric = proto::Metric::default();
            for (name, value) in self.inner.label_names.iter().zip(label_values) {
                let mut pair = proto::LabelPair::default();
                pair.set_name(name.clone());
                pair.set_value(value.clone());
                metric.mut_label().push(pair);
            }
            metric.set_summary(summary);
            family.mut_metric().push(metric);
        }

        vec![family]
    }
}
