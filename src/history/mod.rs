//! Alert history reconstructed from append-only CSV segments.

pub mod csv;

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use self::csv::{CsvRow, CsvTable};
use crate::dedupe::{dedupe_by, same_alert};
use crate::model::telemetry::JerkReading;
use crate::store::{BlobBackend, BlobError};

const DEVICE_ID_COLUMN: &str = "deviceid";
const VERTICAL_THRESHOLD_COLUMN: &str = "verticalthreshold";
const LATERAL_THRESHOLD_COLUMN: &str = "lateralthreshold";
const RULE_OUTPUT_COLUMN: &str = "ruleoutput";
const JERKS_COLUMN: &str = "jerks";

/// Errors from the history reader.
#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    #[error("invalid argument: {reason}")]
    InvalidArgument { reason: String },

    #[error(transparent)]
    Storage(#[from] BlobError),
}

/// One alert: the strongest threshold-exceeding jerks of one record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertHistoryItem {
    pub device_id: String,
    /// Signed vertical jerk with the largest magnitude above threshold, or 0.
    pub vertical_magnitude: f64,
    /// Signed lateral jerk with the largest magnitude above threshold, or 0.
    pub lateral_magnitude: f64,
    pub rule_output: String,
    /// Time of the last peak found; `None` if nothing exceeded a threshold.
    pub timestamp: Option<DateTime<Utc>>,
}

/// One historical segment.
#[derive(Debug, Clone)]
pub struct Segment {
    pub name: String,
    pub data: Vec<u8>,
}

/// Yields segments one at a time.
pub trait SegmentReader: Send {
    /// Next segment, `None` when exhausted. An `Err` concerns only that
    /// segment; reading may continue.
    fn next_segment(
        &mut self,
    ) -> impl Future<Output = Option<Result<Segment, HistoryError>>> + Send;
}

/// Opens a fresh pass over the historical segments.
pub trait SegmentSource: Send + Sync {
    type Reader: SegmentReader;

    fn open(&self) -> impl Future<Output = Result<Self::Reader, HistoryError>> + Send;
}

/// Segments stored as blobs under a prefix, newest name first.
pub struct BlobSegmentSource<B> {
    backend: Arc<B>,
    prefix: String,
}

impl<B: BlobBackend> BlobSegmentSource<B> {
    pub fn new(backend: Arc<B>, prefix: impl Into<String>) -> Self {
        Self {
            backend,
            prefix: prefix.into(),
        }
    }
}

impl<B: BlobBackend> SegmentSource for BlobSegmentSource<B> {
    type Reader = BlobSegmentReader<B>;

    async fn open(&self) -> Result<Self::Reader, HistoryError> {
        let mut names = self.backend.list(&self.prefix).await?;
        names.reverse();
        debug!(prefix = %self.prefix, segments = names.len(), "opened alert history");
        Ok(BlobSegmentReader {
            backend: Arc::clone(&self.backend),
            names: names.into(),
        })
    }
}

/// Reads blob segments lazily, one per call.
pub struct BlobSegmentReader<B> {
    backend: Arc<B>,
    names: VecDeque<String>,
}

impl<B: BlobBackend> SegmentReader for BlobSegmentReader<B> {
    async fn next_segment(&mut self) -> Option<Result<Segment, HistoryError>> {
        while let Some(name) = self.names.pop_front() {
            match self.backend.get(&name).await {
                Ok(Some(blob)) => {
                    return Some(Ok(Segment {
                        name,
                        data: blob.data,
                    }))
                }
                // Removed since listing.
                Ok(None) => continue,
                Err(e) => return Some(Err(e.into())),
            }
        }
        None
    }
}

/// Fixed in-memory segments, yielded in order.
#[derive(Debug, Clone, Default)]
pub struct MemorySegmentSource {
    segments: Vec<Segment>,
}

impl MemorySegmentSource {
    pub fn new(segments: Vec<Segment>) -> Self {
        Self { segments }
    }
}

pub struct MemorySegmentReader {
    segments: VecDeque<Segment>,
}

impl SegmentSource for MemorySegmentSource {
    type Reader = MemorySegmentReader;

    async fn open(&self) -> Result<Self::Reader, HistoryError> {
        Ok(MemorySegmentReader {
            segments: self.segments.clone().into(),
        })
    }
}

impl SegmentReader for MemorySegmentReader {
    async fn next_segment(&mut self) -> Option<Result<Segment, HistoryError>> {
        self.segments.pop_front().map(Ok)
    }
}

/// Parse a jerk list, accepting any key casing.
fn parse_jerks(raw: &str) -> Option<Vec<JerkReading>> {
    let value: serde_json::Value = serde_json::from_str(raw).ok()?;
    let serde_json::Value::Array(entries) = value else {
        return None;
    };

    entries
        .into_iter()
        .map(|entry| {
            let serde_json::Value::Object(fields) = entry else {
                return None;
            };
            let lowered: serde_json::Map<String, serde_json::Value> = fields
                .into_iter()
                .map(|(k, v)| (k.to_ascii_lowercase(), v))
                .collect();
            serde_json::from_value(serde_json::Value::Object(lowered)).ok()
        })
        .collect()
}

fn parse_threshold(raw: Option<&str>) -> Option<f64> {
    raw.map(str::trim)
        .filter(|s| !s.is_empty())
        .and_then(|s| s.parse().ok())
}

/// Rebuild one alert from a segment row.
///
/// Rows without a device id, with unparseable thresholds or with an
/// unparseable jerk list yield `None`.
pub fn alert_from_row(row: &CsvRow<'_>) -> Option<AlertHistoryItem> {
    let device_id = row
        .get(DEVICE_ID_COLUMN)
        .map(str::trim)
        .filter(|d| !d.is_empty())?;
    let vertical_threshold = parse_threshold(row.get(VERTICAL_THRESHOLD_COLUMN))?;
    let lateral_threshold = parse_threshold(row.get(LATERAL_THRESHOLD_COLUMN))?;
    let jerks = parse_jerks(row.get(JERKS_COLUMN)?)?;

    let mut vertical = 0.0_f64;
    let mut lateral = 0.0_f64;
    let mut timestamp = None;
    for jerk in &jerks {
        if jerk.vertical.abs() > vertical_threshold && jerk.vertical.abs() > vertical.abs() {
            vertical = jerk.vertical;
            timestamp = jerk.timestamp;
        }
        if jerk.lateral.abs() > lateral_threshold && jerk.lateral.abs() > lateral.abs() {
            lateral = jerk.lateral;
            timestamp = jerk.timestamp;
        }
    }

    Some(AlertHistoryItem {
        device_id: device_id.to_string(),
        vertical_magnitude: vertical,
        lateral_magnitude: lateral,
        rule_output: row.get(RULE_OUTPUT_COLUMN).unwrap_or_default().to_string(),
        timestamp,
    })
}

/// All alerts in one segment, duplicates removed.
pub fn parse_segment(data: &[u8]) -> Vec<AlertHistoryItem> {
    let text = String::from_utf8_lossy(data);
    let table = CsvTable::parse(&text);
    let items = table.rows().filter_map(|row| alert_from_row(&row)).collect();
    dedupe_by(items, same_alert)
}

fn sort_newest_first(items: &mut [AlertHistoryItem]) {
    // `None` orders before `Some`, so timestamp-less items sort last.
    items.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
}

/// Reads recent alerts from a [`SegmentSource`].
pub struct AlertHistoryReader<S> {
    source: S,
}

impl<S: SegmentSource> AlertHistoryReader<S> {
    pub fn new(source: S) -> Self {
        Self { source }
    }

    /// Alerts newer than `min_time`, backfilled with older ones when fewer
    /// than `min_results` exist.
    ///
    /// Scanning stops early once a segment crosses `min_time` with enough
    /// recent items, or holds nothing recent while enough items overall
    /// were seen. Unreadable segments are skipped.
    pub async fn load_recent(
        &self,
        min_time: DateTime<Utc>,
        min_results: usize,
    ) -> Result<Vec<AlertHistoryItem>, HistoryError> {
        if min_results == 0 {
            return Err(HistoryError::InvalidArgument {
                reason: "min_results must be a positive integer".to_string(),
            });
        }

        let mut filtered: Vec<AlertHistoryItem> = Vec::new();
        let mut unfiltered: Vec<AlertHistoryItem> = Vec::new();
        let mut reader = self.source.open().await?;

        while let Some(next) = reader.next_segment().await {
            let segment = match next {
                Ok(segment) => segment,
                Err(e) => {
                    warn!(error = %e, "skipping unreadable alert segment");
                    continue;
                }
            };

            let items = parse_segment(&segment.data);
            let recent: Vec<AlertHistoryItem> = items
                .iter()
                .filter(|item| item.timestamp.is_some_and(|t| t > min_time))
                .cloned()
                .collect();
            let segment_total = items.len();
            let segment_recent = recent.len();

            unfiltered.extend(items);
            filtered.extend(recent);
            sort_newest_first(&mut unfiltered);
            sort_newest_first(&mut filtered);

            debug!(
                segment = %segment.name,
                items = segment_total,
                recent = segment_recent,
                "scanned alert segment",
            );

            if segment_recent != segment_total && filtered.len() >= min_results {
                break;
            }
            if segment_recent == 0 && unfiltered.len() >= min_results {
                break;
            }
        }

        if filtered.len() >= min_results {
            Ok(filtered)
        } else {
            unfiltered.truncate(min_results);
            Ok(unfiltered)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryBlobBackend, WriteCondition};
    use chrono::TimeZone;

    const HEADER: &str = "deviceid,verticalthreshold,lateralthreshold,ruleoutput,jerks\n";

    fn ts(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, hour, 0, 0).unwrap()
    }

    fn row(device: &str, vertical: f64, hour: u32) -> String {
        format!(
            "{device},20,30,Pothole,\"[{{\"\"verticaljerk\"\":{vertical},\"\"lateraljerk\"\":1,\"\"jerktimestamp\"\":\"\"2024-05-01T{hour:02}:00:00Z\"\"}}]\"\n"
        )
    }

    fn segment(name: &str, rows: &[String]) -> Segment {
        Segment {
            name: name.to_string(),
            data: format!("{HEADER}{}", rows.concat()).into_bytes(),
        }
    }

    #[test]
    fn test_alert_from_row_picks_peaks() {
        let text = format!(
            "{HEADER}car,20,30,Bump,\"[{{\"\"VerticalJerk\"\":-25,\"\"LateralJerk\"\":31,\"\"JerkTimeStamp\"\":\"\"2024-05-01T08:00:00Z\"\"}},{{\"\"verticaljerk\"\":22,\"\"lateraljerk\"\":0}}]\"\n"
        );
        let items = parse_segment(text.as_bytes());
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].vertical_magnitude, -25.0);
        assert_eq!(items[0].lateral_magnitude, 31.0);
        assert_eq!(items[0].timestamp, Some(ts(8)));
        assert_eq!(items[0].rule_output, "Bump");
    }

    #[test]
    fn test_rows_without_device_or_jerks_skipped() {
        let text = format!("{HEADER},20,30,Bump,[]\ncar,20,30,Bump,not-json\ncar,x,30,Bump,[]\nok,20,30,Bump,[]\n");
        let items = parse_segment(text.as_bytes());
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].device_id, "ok");
        assert_eq!(items[0].timestamp, None);
    }

    #[test]
    fn test_duplicates_within_segment_collapse() {
        let seg = segment("s", &[row("car", 40.0, 9), row("car", 40.0, 9)]);
        assert_eq!(parse_segment(&seg.data).len(), 1);
    }

    #[tokio::test]
    async fn test_zero_min_results_rejected() {
        let reader = AlertHistoryReader::new(MemorySegmentSource::default());
        let err = reader.load_recent(ts(0), 0).await.unwrap_err();
        assert!(matches!(err, HistoryError::InvalidArgument { .. }));
    }

    #[tokio::test]
    async fn test_stops_after_segment_with_nothing_recent() {
        // Segment 1 is entirely older than min_time and already satisfies
        // min_results; the remaining segments must not be read.
        let source = MemorySegmentSource::new(vec![
            segment("1", &[row("a", 40.0, 1), row("b", 41.0, 2)]),
            segment("2", &[row("c", 42.0, 20)]),
            segment("3", &[row("d", 43.0, 21)]),
        ]);
        let reader = AlertHistoryReader::new(source);

        let items = reader.load_recent(ts(10), 2).await.unwrap();
        let devices: Vec<_> = items.iter().map(|i| i.device_id.as_str()).collect();
        assert_eq!(devices, vec!["b", "a"]);
    }

    #[tokio::test]
    async fn test_returns_all_recent_when_enough() {
        let source = MemorySegmentSource::new(vec![
            segment("1", &[row("a", 40.0, 12), row("b", 41.0, 14)]),
            segment("2", &[row("c", 42.0, 13), row("old", 42.0, 1)]),
            segment("3", &[row("d", 43.0, 15)]),
        ]);
        let reader = AlertHistoryReader::new(source);

        let items = reader.load_recent(ts(10), 2).await.unwrap();
        let devices: Vec<_> = items.iter().map(|i| i.device_id.as_str()).collect();
        // Segment 2 crosses min_time with enough recent items; 3 is unread.
        assert_eq!(devices, vec!["b", "c", "a"]);
    }

    #[tokio::test]
    async fn test_backfills_from_unfiltered() {
        let source = MemorySegmentSource::new(vec![segment(
            "1",
            &[row("a", 40.0, 11), row("b", 41.0, 2), row("c", 42.0, 1)],
        )]);
        let reader = AlertHistoryReader::new(source);

        let items = reader.load_recent(ts(10), 2).await.unwrap();
        let devices: Vec<_> = items.iter().map(|i| i.device_id.as_str()).collect();
        assert_eq!(devices, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_blob_source_newest_name_first() {
        let backend = Arc::new(MemoryBlobBackend::new());
        for (name, hour) in [("alerts/2024-05-01.csv", 1), ("alerts/2024-05-02.csv", 2)] {
            let seg = segment(name, &[row(name, 40.0, hour)]);
            backend
                .put(name, seg.data, WriteCondition::Any)
                .await
                .unwrap();
        }

        let source = BlobSegmentSource::new(Arc::clone(&backend), "alerts/");
        let mut reader = source.open().await.unwrap();
        let first = reader.next_segment().await.unwrap().unwrap();
        assert_eq!(first.name, "alerts/2024-05-02.csv");
        let second = reader.next_segment().await.unwrap().unwrap();
        assert_eq!(second.name, "alerts/2024-05-01.csv");
        assert!(reader.next_segment().await.is_none());
    }
}
