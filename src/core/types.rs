use crate::core::error::{Result, TallyError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Type tag of a metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    /// Last write replaces the stored value
    Gauge,
    /// Writes carry a delta added to the running total
    Counter,
}

impl MetricKind {
    /// Wire name of the kind
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Gauge => "gauge",
            MetricKind::Counter => "counter",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricKind {
    type Err = TallyError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "gauge" => Ok(MetricKind::Gauge),
            "counter" => Ok(MetricKind::Counter),
            other => Err(TallyError::UnknownMetricType(other.to_string())),
        }
    }
}

/// Payload of a metric, tagged by kind.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MetricValue {
    /// Gauge reading
    Gauge(f64),
    /// Counter delta on write, running total on read
    Counter(i64),
}

impl MetricValue {
    /// Kind of this value
    pub fn kind(&self) -> MetricKind {
        match self {
            MetricValue::Gauge(_) => MetricKind::Gauge,
            MetricValue::Counter(_) => MetricKind::Counter,
        }
    }

    /// Gauge payload; NaN and infinities have no JSON form and are rejected.
    pub fn gauge(name: &str, value: f64) -> Result<Self> {
        if value.is_finite() {
            Ok(MetricValue::Gauge(value))
        } else {
            Err(TallyError::value_parse(format!("gauge {name} is not finite: {value}")))
        }
    }

    /// Parses the URL form of a value for the given kind.
    pub fn parse(kind: MetricKind, raw: &str) -> Result<Self> {
        match kind {
            MetricKind::Gauge => raw
                .parse::<f64>()
                .map_err(|e| TallyError::value_parse(format!("gauge value {raw:?}: {e}")))
                .and_then(|v| MetricValue::gauge("value", v)),
            MetricKind::Counter => raw
                .parse::<i64>()
                .map(MetricValue::Counter)
                .map_err(|e| TallyError::value_parse(format!("counter value {raw:?}: {e}"))),
        }
    }
}

impl fmt::Display for MetricValue {
    /// Counters print as decimal integers, gauges use the shortest
    /// representation that round-trips.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricValue::Gauge(v) => write!(f, "{v}"),
            MetricValue::Counter(d) => write!(f, "{d}"),
        }
    }
}

/// A named metric, identified by `(name, kind)`.
#[derive(Debug, Clone, PartialEq)]
pub struct Metric {
    /// Metric name, never empty
    pub name: String,
    /// Typed payload
    pub value: MetricValue,
}

impl Metric {
    /// Creates a gauge metric
    pub fn gauge(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            value: MetricValue::Gauge(value),
        }
    }

    /// Creates a counter metric
    pub fn counter(name: impl Into<String>, delta: i64) -> Self {
        Self {
            name: name.into(),
            value: MetricValue::Counter(delta),
        }
    }

    /// Creates a metric after validating the name
    pub fn new(name: impl Into<String>, value: MetricValue) -> Result<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(TallyError::EmptyName);
        }
        if let MetricValue::Gauge(v) = value {
            MetricValue::gauge(&name, v)?;
        }
        Ok(Self { name, value })
    }

    /// Kind of this metric
    pub fn kind(&self) -> MetricKind {
        self.value.kind()
    }

    /// Key used by stores that index by a single string.
    pub fn key(&self) -> String {
        storage_key(self.kind(), &self.name)
    }

    /// Converts into the wire representation
    pub fn to_dto(&self) -> MetricDto {
        MetricDto::from(self)
    }
}

/// Builds the `name-type` key used by the in-memory store.
pub fn storage_key(kind: MetricKind, name: &str) -> String {
    format!("{}-{}", name, kind.as_str())
}

/// Wire DTO shared by the HTTP API, the RPC surface, the agent and the
/// snapshot file.
///
/// Exactly one of `value` (gauge) and `delta` (counter) is present on
/// encode. The `type` field is kept as a raw string so an unknown type
/// surfaces as [`TallyError::UnknownMetricType`] rather than a generic
/// decode error.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MetricDto {
    /// Metric name
    pub id: String,
    /// `gauge` or `counter`
    #[serde(rename = "type")]
    pub kind: String,
    /// Gauge payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    /// Counter payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<i64>,
}

impl MetricDto {
    /// DTO used to query a metric: only `id` and `type` are set.
    pub fn query(kind: MetricKind, name: impl Into<String>) -> Self {
        Self {
            id: name.into(),
            kind: kind.as_str().to_string(),
            value: None,
            delta: None,
        }
    }

    /// Parses the type tag.
    pub fn metric_kind(&self) -> Result<MetricKind> {
        self.kind.parse()
    }
}

impl From<&Metric> for MetricDto {
    fn from(metric: &Metric) -> Self {
        let (value, delta) = match metric.value {
            MetricValue::Gauge(v) => (Some(v), None),
            MetricValue::Counter(d) => (None, Some(d)),
        };
        Self {
            id: metric.name.clone(),
            kind: metric.kind().as_str().to_string(),
            value,
            delta,
        }
    }
}

impl From<Metric> for MetricDto {
    fn from(metric: Metric) -> Self {
        MetricDto::from(&metric)
    }
}

impl TryFrom<MetricDto> for Metric {
    type Error = TallyError;

    fn try_from(dto: MetricDto) -> Result<Self> {
        let kind = dto.metric_kind()?;
        if dto.id.is_empty() {
            return Err(TallyError::EmptyName);
        }
        let value = match kind {
            MetricKind::Gauge => {
                let v = dto
                    .value
                    .ok_or_else(|| TallyError::value_parse(format!("gauge {} has no value", dto.id)))?;
                MetricValue::gauge(&dto.id, v)?
            },
            MetricKind::Counter => dto
                .delta
                .map(MetricValue::Counter)
                .ok_or_else(|| TallyError::value_parse(format!("counter {} has no delta", dto.id)))?,
        };
        Ok(Metric {
            name: dto.id,
            value,
        })
    }
}

/// Decodes a JSON DTO into a typed metric.
///
/// Malformed JSON and ill-typed payload fields are reported as
/// [`TallyError::ValueParse`].
pub fn decode_metric(body: &[u8]) -> Result<Metric> {
    let dto: MetricDto = serde_json::from_slice(body)
        .map_err(|e| TallyError::value_parse(format!("invalid metric payload: {e}")))?;
    Metric::try_from(dto)
}

/// Decodes a JSON array of DTOs.
pub fn decode_metrics(body: &[u8]) -> Result<Vec<Metric>> {
    let dtos: Vec<MetricDto> = serde_json::from_slice(body)
        .map_err(|e| TallyError::value_parse(format!("invalid metrics payload: {e}")))?;
    dtos.into_iter().map(Metric::try_from).collect()
}
