// Turns user-supplied "SEGMENT[_LANEINDEX]" tokens into validated lane targets.
use std::fmt;

use super::network_index::NetworkIndex;


/// Lane index meaning "every lane of the segment".
pub const ALL_LANES: i32 = -1;

static LANE_DELIMITER: char = '_';


#[derive(PartialEq, Eq, Debug, Clone)]
pub struct LaneTarget {
    pub segment: String,
    pub lane_index: i32,
}

/// A single concrete lane, as the control channel addresses it.
#[derive(PartialEq, Eq, Hash, Debug, Clone, PartialOrd, Ord)]
pub struct LaneRef {
    pub segment: String,
    pub index: u32,
}

impl LaneRef {
    pub fn new(segment: &str, index: u32) -> LaneRef {
        LaneRef { segment: String::from(segment), index }
    }

    pub fn lane_id(&self) -> String {
        format!("{}{}{}", self.segment, LANE_DELIMITER, self.index)
    }
}

impl fmt::Display for LaneRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.lane_id())
    }
}

impl LaneTarget {
    pub fn new(segment: &str, lane_index: i32) -> LaneTarget {
        LaneTarget { segment: String::from(segment), lane_index }
    }

    pub fn all_lanes(segment: &str) -> LaneTarget {
        LaneTarget::new(segment, ALL_LANES)
    }

    pub fn covers_all_lanes(&self) -> bool {
        self.lane_index == ALL_LANES
    }

    /// The concrete lanes this target stands for. A segment missing from the index yields none.
    pub fn expand(&self, index: &NetworkIndex) -> Vec<LaneRef> {
        let lane_count = match index.lane_count(&self.segment) {
            Some(count) => count,
            None => return vec![],
        };
        if self.covers_all_lanes() {
            (0..lane_count).map(|ii| LaneRef::new(&self.segment, ii)).collect()
        } else if self.lane_index >= 0 && (self.lane_index as u32) < lane_count {
            vec![LaneRef::new(&self.segment, self.lane_index as u32)]
        } else {
            vec![]
        }
    }

    /// Whether an agent at (segment, lane) is inside this target.
    pub fn matches(&self, segment: &str, lane_index: i32) -> bool {
        self.segment == segment && (self.covers_all_lanes() || self.lane_index == lane_index)
    }
}

impl fmt::Display for LaneTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.segment, LANE_DELIMITER, self.lane_index)
    }
}

#[derive(PartialEq, Debug, Clone)]
pub enum TargetDiagnostic {
    Empty,
    UnknownSegment { token: String },
    LaneOutOfRange { token: String, segment: String, lane_index: i64, lane_count: u32 },
    // the token names a segment, but so does its prefix; the longer match was used
    Ambiguous { token: String, prefix: String },
}

impl fmt::Display for TargetDiagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetDiagnostic::Empty => write!(f, "skipping empty lane token"),
            TargetDiagnostic::UnknownSegment { token } => {
                write!(f, "skipping '{}': no such segment in the network", token)
            }
            TargetDiagnostic::LaneOutOfRange { token, segment, lane_index, lane_count } => write!(
                f,
                "skipping '{}': lane {} is not valid for segment {} with {} lane(s)",
                token, lane_index, segment, lane_count
            ),
            TargetDiagnostic::Ambiguous { token, prefix } => write!(
                f,
                "'{}' could also mean a lane of segment {}; treating it as a whole segment",
                token, prefix
            ),
        }
    }
}

#[derive(Debug, Default)]
pub struct ParsedTargets {
    pub targets: Vec<LaneTarget>,
    pub diagnostics: Vec<TargetDiagnostic>,
}

fn split_lane_suffix(token: &str) -> Option<(&str, i64)> {
    let split_at = token.rfind(LANE_DELIMITER)?;
    let (prefix, suffix) = (&token[..split_at], &token[split_at + 1..]);
    if prefix.is_empty() {
        return None;
    }
    // an optional minus sign and digits only; "+1" is not a lane index
    let digits = suffix.strip_prefix('-').unwrap_or(suffix);
    if digits.is_empty() || !digits.bytes().all(|bb| bb.is_ascii_digit()) {
        return None;
    }
    match suffix.parse::<i64>() {
        Ok(lane) => Some((prefix, lane)),
        Err(_) => None,
    }
}

fn lane_in_range(lane_index: i64, lane_count: u32) -> bool {
    lane_index == ALL_LANES as i64 || (lane_index >= 0 && lane_index < lane_count as i64)
}

/// Validates each token against the index. Invalid tokens are reported in the diagnostics and
/// skipped; everything that validates is returned in input order, duplicates included.
pub fn parse_targets<S: AsRef<str>>(tokens: &[S], index: &NetworkIndex) -> ParsedTargets {
    let mut parsed = ParsedTargets::default();

    for token in tokens {
        let token = token.as_ref().trim();
        if token.is_empty() {
            parsed.diagnostics.push(TargetDiagnostic::Empty);
            continue;
        }

        let split = split_lane_suffix(token)
            .filter(|(prefix, _)| index.contains(prefix));

        if index.contains(token) {
            // only warn when the lane reading would have been accepted on its own
            let lane_reading = split.filter(|(prefix, lane_index)| {
                lane_in_range(*lane_index, index.lane_count(prefix).unwrap_or(0))
            });
            if let Some((prefix, _)) = lane_reading {
                parsed.diagnostics.push(TargetDiagnostic::Ambiguous {
                    token: String::from(token),
                    prefix: String::from(prefix),
                });
            }
            parsed.targets.push(LaneTarget::all_lanes(token));
            continue;
        }

        match split {
            Some((segment, lane_index)) => {
                // the prefix is known to be in the index here
                let lane_count = index.lane_count(segment).unwrap_or(0);
                if lane_in_range(lane_index, lane_count) {
                    parsed.targets.push(LaneTarget::new(segment, lane_index as i32));
                } else {
                    parsed.diagnostics.push(TargetDiagnostic::LaneOutOfRange {
                        token: String::from(token),
                        segment: String::from(segment),
                        lane_index,
                        lane_count,
                    });
                }
            }
            None => parsed.diagnostics.push(TargetDiagnostic::UnknownSegment {
                token: String::from(token),
            }),
        }
    }

    for diagnostic in &parsed.diagnostics {
        log::warn!("{}", diagnostic);
    }
    parsed
}

/// Tokens blocking every lane of the n busiest segments.
pub fn suggest_targets(index: &NetworkIndex, nn: usize) -> Vec<String> {
    index.most_used(nn).into_iter().map(|(id, usage, lanes)| {
        log::info!("Suggesting segment {} ({} lanes, used by {} trips)", id, lanes, usage);
        LaneTarget::all_lanes(&id).to_string()
    }).collect()
}
