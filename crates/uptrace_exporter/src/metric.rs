//! Metric aggregations as handed over by the instrumentation API.
//!
//! One [`MetricData`] is produced per instrument and attribute set on every
//! collection interval.

use crate::span::{KeyValue, Resource};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Numeric measurement in the precision the instrument was declared with.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Number {
    I64(i64),
    U64(u64),
    F64(f64),
}

impl Number {
    /// Widens to `f64`, the wire representation of every metric value.
    pub fn as_f64(self) -> f64 {
        match self {
            Number::I64(v) => v as f64,
            Number::U64(v) => v as f64,
            Number::F64(v) => v,
        }
    }
}

impl From<i64> for Number {
    fn from(v: i64) -> Self {
        Number::I64(v)
    }
}

impl From<u64> for Number {
    fn from(v: u64) -> Self {
        Number::U64(v)
    }
}

impl From<f64> for Number {
    fn from(v: f64) -> Self {
        Number::F64(v)
    }
}

/// Whether a value covers the last interval only or everything since start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Temporality {
    Delta,
    #[default]
    Cumulative,
}

/// Instrument that produced the measurements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InstrumentKind {
    #[default]
    Counter,
    UpDownCounter,
    Histogram,
    Gauge,
    ObservableCounter,
    ObservableUpDownCounter,
    ObservableGauge,
}

impl InstrumentKind {
    pub fn as_str(self) -> &'static str {
        match self {
            InstrumentKind::Counter => "counter",
            InstrumentKind::UpDownCounter => "up_down_counter",
            InstrumentKind::Histogram => "histogram",
            InstrumentKind::Gauge => "gauge",
            InstrumentKind::ObservableCounter => "observable_counter",
            InstrumentKind::ObservableUpDownCounter => "observable_up_down_counter",
            InstrumentKind::ObservableGauge => "observable_gauge",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Descriptor {
    pub name: String,
    pub description: String,
    pub unit: String,
    pub instrument: InstrumentKind,
}

impl Descriptor {
    pub fn new(name: impl Into<String>, instrument: InstrumentKind) -> Self {
        Self {
            name: name.into(),
            instrument,
            ..Default::default()
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = unit.into();
        self
    }
}

/// Explicit-bucket histogram state.
///
/// `counts[i]` counts values in `(boundaries[i-1], boundaries[i]]`; the last
/// count is the overflow bucket.
#[derive(Debug, Clone, PartialEq)]
pub struct HistogramData {
    pub sum: Number,
    pub count: u64,
    pub boundaries: Vec<f64>,
    pub counts: Vec<u64>,
}

/// Aggregated state, one variant per aggregation kind.
#[derive(Debug, Clone, PartialEq)]
pub enum Aggregation {
    Sum(Number),
    Histogram(HistogramData),
    MinMaxSumCount {
        min: Number,
        max: Number,
        sum: Number,
        count: u64,
    },
    LastValue {
        value: Number,
        /// Unix nanoseconds of the observation
        time: u64,
    },
}

/// One aggregation for one instrument and attribute set.
#[derive(Debug, Clone)]
pub struct MetricData {
    pub descriptor: Descriptor,
    pub temporality: Temporality,
    pub resource: Arc<Resource>,
    pub attributes: Vec<KeyValue>,
    /// Unix nanoseconds at the end of the collection interval
    pub time: u64,
    pub aggregation: Aggregation,
}

impl MetricData {
    pub fn new(descriptor: Descriptor, aggregation: Aggregation, time: u64) -> Self {
        Self {
            descriptor,
            temporality: Temporality::default(),
            resource: Arc::new(Resource::empty()),
            attributes: Vec::new(),
            time,
            aggregation,
        }
    }

    pub fn with_temporality(mut self, temporality: Temporality) -> Self {
        self.temporality = temporality;
        self
    }

    pub fn with_resource(mut self, resource: Arc<Resource>) -> Self {
        self.resource = resource;
        self
    }

    pub fn with_attributes(mut self, attributes: Vec<KeyValue>) -> Self {
        self.attributes = attributes;
        self
    }
}
