// Aggregate trip statistics from completed simulation runs, and their comparison.
use std::fmt;
use std::path::Path;

use xml::reader::XmlEvent;

use super::config_utils;
use super::error::{SimError, SimResult};


#[derive(PartialEq, Debug, Clone, Copy)]
pub struct TripMetrics {
    pub trip_count: usize,
    pub avg_duration_s: f64,
    // total distance over total duration, not a mean of per-trip speeds
    pub avg_speed_mps: f64,
}

impl TripMetrics {
    /// Aggregates (duration, distance) pairs. Only pairs with a finite, positive duration and a
    /// finite distance count, toward every aggregate alike.
    pub fn from_trips<I>(trips: I) -> Option<TripMetrics>
        where I: IntoIterator<Item = (f64, f64)>
    {
        let mut trip_count = 0;
        let mut total_duration = 0.0;
        let mut total_distance = 0.0;
        for (duration, distance) in trips {
            if !duration.is_finite() || duration <= 0.0 || !distance.is_finite() {
                continue;
            }
            trip_count += 1;
            total_duration += duration;
            total_distance += distance;
        }

        if trip_count == 0 {
            return None;
        }
        let avg_speed_mps = if total_duration > 0.0 {
            total_distance / total_duration
        } else {
            0.0
        };
        Some(TripMetrics {
            trip_count,
            avg_duration_s: total_duration / trip_count as f64,
            avg_speed_mps,
        })
    }
}

/// Reads a tripinfo log. Records with a missing or unparseable duration or route length are
/// skipped; a log with no usable record gives None.
pub fn extract_metrics(tripinfo_path: &Path) -> SimResult<Option<TripMetrics>> {
    let context = tripinfo_path.display().to_string();
    let mut parser = config_utils::xml_parser_from_path(tripinfo_path)?;
    let mut trips = vec![];
    let mut skipped = 0;

    loop { match parser.next() {
        Err(err) => return Err(SimError::parse(context, err)),
        Ok(XmlEvent::EndDocument) => break,
        Ok(XmlEvent::StartElement {name, attributes, ..}) if name.local_name == "tripinfo" => {
            let duration = config_utils::get_xml_attribute_value(&attributes, "duration")
                .and_then(|dd| dd.trim().parse::<f64>().ok());
            let distance = config_utils::get_xml_attribute_value(&attributes, "routeLength")
                .and_then(|dd| dd.trim().parse::<f64>().ok());
            match (duration, distance) {
                (Some(duration), Some(distance)) => trips.push((duration, distance)),
                _ => skipped += 1,
            }
        }
        _ => {}
    }}

    if skipped > 0 {
        log::debug!("Skipped {} malformed trip records in {}", skipped, context);
    }
    let metrics = TripMetrics::from_trips(trips);
    if metrics.is_none() {
        log::warn!("No valid trip records in {}", context);
    }
    Ok(metrics)
}


#[derive(PartialEq, Debug, Clone, Copy)]
pub struct MetricDelta {
    pub unblocked: f64,
    pub blocked: f64,
    pub absolute: f64,
    // None when the unblocked value is zero
    pub percent: Option<f64>,
}

impl MetricDelta {
    pub fn new(unblocked: f64, blocked: f64) -> MetricDelta {
        let absolute = blocked - unblocked;
        let percent = if unblocked == 0.0 {
            None
        } else {
            Some(absolute / unblocked * 100.0)
        };
        MetricDelta { unblocked, blocked, absolute, percent }
    }
}

impl fmt::Display for MetricDelta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.percent {
            Some(percent) => write!(f, "{:+.2} ({:+.2}%)", self.absolute, percent),
            None => write!(f, "{:+.2} (N/A)", self.absolute),
        }
    }
}

#[derive(PartialEq, Debug, Clone, Copy)]
pub struct ComparisonReport {
    pub trip_count: MetricDelta,
    pub avg_duration_s: MetricDelta,
    pub avg_speed_mps: MetricDelta,
}

pub fn compare(unblocked: &TripMetrics, blocked: &TripMetrics) -> ComparisonReport {
    ComparisonReport {
        trip_count: MetricDelta::new(unblocked.trip_count as f64, blocked.trip_count as f64),
        avg_duration_s: MetricDelta::new(unblocked.avg_duration_s, blocked.avg_duration_s),
        avg_speed_mps: MetricDelta::new(unblocked.avg_speed_mps, blocked.avg_speed_mps),
    }
}

impl ComparisonReport {
    fn rows(&self) -> [(&'static str, &MetricDelta); 3] {
        [
            ("trips_completed", &self.trip_count),
            ("avg_travel_time_s", &self.avg_duration_s),
            ("avg_speed_mps", &self.avg_speed_mps),
        ]
    }

    pub fn write_csv(&self, path: &Path) -> SimResult<()> {
        let mut writer = csv::Writer::from_path(path)?;
        writer.write_record(&["metric", "unblocked", "blocked", "difference", "percent"])?;
        for (name, delta) in self.rows().iter() {
            let percent = match delta.percent {
                Some(pp) => format!("{:.4}", pp),
                None => String::from("N/A"),
            };
            writer.write_record(&[
                name.to_string(),
                format!("{:.4}", delta.unblocked),
                format!("{:.4}", delta.blocked),
                format!("{:.4}", delta.absolute),
                percent,
            ])?;
        }
        writer.flush()?;
        Ok(())
    }
}

impl fmt::Display for ComparisonReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Total trips completed:")?;
        writeln!(f, "  Unblocked: {}", self.trip_count.unblocked)?;
        writeln!(f, "  Blocked:   {}", self.trip_count.blocked)?;
        writeln!(f, "  Difference: {}", self.trip_count)?;
        writeln!(f, "Average trip travel time (s):")?;
        writeln!(f, "  Unblocked: {:.2}", self.avg_duration_s.unblocked)?;
        writeln!(f, "  Blocked:   {:.2}", self.avg_duration_s.blocked)?;
        writeln!(f, "  Difference: {} (positive means longer trips)", self.avg_duration_s)?;
        writeln!(f, "Average network speed (m/s):")?;
        writeln!(f, "  Unblocked: {:.2}", self.avg_speed_mps.unblocked)?;
        writeln!(f, "  Blocked:   {:.2}", self.avg_speed_mps.blocked)?;
        write!(f, "  Difference: {} (negative means slower traffic)", self.avg_speed_mps)
    }
}
