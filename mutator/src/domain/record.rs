//! Uniform record abstraction
//!
//! The five OTLP metric point types and spans share no common type. This
//! trait exposes the one capability the pipeline needs from each of them:
//! their attribute list, plus whether they are metric or trace records.

use opentelemetry_proto::tonic::common::v1::KeyValue;
use opentelemetry_proto::tonic::metrics::v1::{
    ExponentialHistogramDataPoint, HistogramDataPoint, NumberDataPoint, SummaryDataPoint,
};
use opentelemetry_proto::tonic::trace::v1::Span;

/// Classification of a record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Metric,
    Trace,
}

impl RecordKind {
    pub fn is_trace(self) -> bool {
        matches!(self, RecordKind::Trace)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RecordKind::Metric => "metric",
            RecordKind::Trace => "trace",
        }
    }
}

/// A telemetry record carrying its own attribute set
pub trait Record {
    const KIND: RecordKind;

    fn attributes(&self) -> &[KeyValue];

    fn attributes_mut(&mut self) -> &mut Vec<KeyValue>;
}

macro_rules! impl_record {
    ($kind:expr => $($ty:ty),+ $(,)?) => {
        $(
            impl Record for $ty {
                const KIND: RecordKind = $kind;

                fn attributes(&self) -> &[KeyValue] {
                    &self.attributes
                }

                fn attributes_mut(&mut self) -> &mut Vec<KeyValue> {
                    &mut self.attributes
                }
            }
        )+
    };
}

impl_record!(RecordKind::Metric =>
    NumberDataPoint,
    HistogramDataPoint,
    ExponentialHistogramDataPoint,
    SummaryDataPoint,
);

impl_record!(RecordKind::Trace => Span);
