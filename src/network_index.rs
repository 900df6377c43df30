// Lookup structure over a converted SUMO road network: lanes per segment and how many planned
// trips use each segment.
use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use xml::reader::EventReader;
use xml::reader::XmlEvent;

use super::config_utils;
use super::error::{SimError, SimResult};


// segment type tags that mark the large roads worth suggesting as restriction targets
static MAJOR_ROAD_TYPES: [&str; 6] = [
    "motorway",
    "trunk",
    "primary",
    "secondary",
    "primary_link",
    "secondary_link",
];

static INTERNAL_PREFIX: &str = ":";
static INTERNAL_FUNCTION: &str = "internal";


#[derive(PartialEq, Debug, Clone)]
pub struct RoadSegment {
    pub id: String,
    pub lane_count: u32,
    pub type_tag: String,
    pub usage_count: u64,
}

impl RoadSegment {
    pub fn new(id: &str, lane_count: u32, type_tag: &str) -> RoadSegment {
        RoadSegment {
            id: String::from(id),
            lane_count,
            type_tag: String::from(type_tag),
            usage_count: 0,
        }
    }

    pub fn is_major(&self) -> bool {
        let tag = self.type_tag.to_lowercase();
        MAJOR_ROAD_TYPES.iter().any(|major| tag.contains(major))
    }
}

pub struct NetworkIndex {
    // segments in the order they appear in the network file
    segments: Vec<RoadSegment>,
    idxs_by_id: HashMap<String, usize>,
    trip_count: usize,
}

impl NetworkIndex {
    pub fn from_xml_files(network_path: &Path, routes_path: &Path) -> SimResult<NetworkIndex> {
        let network_xml = read_document(network_path)?;
        let routes_xml = read_document(routes_path)?;
        Self::from_xml(&network_xml, &routes_xml)
    }

    pub fn from_xml(network_xml: &str, routes_xml: &str) -> SimResult<NetworkIndex> {
        let segments = parse_network_xml(network_xml)?;
        let mut idxs_by_id = HashMap::new();
        let mut unique_segments = Vec::with_capacity(segments.len());
        for segment in segments {
            if idxs_by_id.contains_key(&segment.id) {
                log::warn!("Segment {} is defined twice; keeping the first definition", segment.id);
                continue;
            }
            idxs_by_id.insert(segment.id.clone(), unique_segments.len());
            unique_segments.push(segment);
        }

        let mut index = NetworkIndex {
            segments: unique_segments,
            idxs_by_id,
            trip_count: 0,
        };

        let trips = parse_routes_xml(routes_xml)?;
        index.trip_count = trips.len();
        for edges in trips {
            for edge_id in edges {
                if let Some(&idx) = index.idxs_by_id.get(&edge_id) {
                    index.segments[idx].usage_count += 1;
                }
            }
        }

        log::info!("Indexed {} segments used by {} planned trips",
                   index.segments.len(), index.trip_count);
        Ok(index)
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn trip_count(&self) -> usize {
        self.trip_count
    }

    pub fn contains(&self, segment_id: &str) -> bool {
        self.idxs_by_id.contains_key(segment_id)
    }

    pub fn segment(&self, segment_id: &str) -> Option<&RoadSegment> {
        self.idxs_by_id.get(segment_id).map(|&idx| &self.segments[idx])
    }

    pub fn segments(&self) -> &[RoadSegment] {
        &self.segments
    }

    pub fn lane_count(&self, segment_id: &str) -> Option<u32> {
        self.segment(segment_id).map(|seg| seg.lane_count)
    }

    /// The n segments traversed by the most planned trips, as (id, usage count, lane count).
    /// Ties keep network order; segments no trip uses are never suggested.
    pub fn most_used(&self, nn: usize) -> Vec<(String, u64, u32)> {
        let mut used: Vec<&RoadSegment> = self.segments.iter()
                                              .filter(|seg| seg.usage_count > 0)
                                              .collect();
        // sort_by is stable, so equal counts stay in first-seen order
        used.sort_by(|aa, bb| bb.usage_count.cmp(&aa.usage_count));
        used.into_iter()
            .take(nn)
            .map(|seg| (seg.id.clone(), seg.usage_count, seg.lane_count))
            .collect()
    }

    pub fn major_segments(&self) -> Vec<&RoadSegment> {
        let mut major: Vec<&RoadSegment> = self.segments.iter()
                                               .filter(|seg| seg.is_major())
                                               .collect();
        major.sort_by(|aa, bb| aa.id.cmp(&bb.id));
        major
    }
}


fn read_document(path: &Path) -> SimResult<String> {
    let mut contents = String::new();
    let mut ff = File::open(path).map_err(|err| SimError::parse(path.display().to_string(), err))?;
    ff.read_to_string(&mut contents)?;
    Ok(contents)
}

fn is_internal(id: &str, function: Option<&str>) -> bool {
    id.starts_with(INTERNAL_PREFIX) || function == Some(INTERNAL_FUNCTION)
}

fn parse_network_xml(xml_string: &str) -> SimResult<Vec<RoadSegment>> {
    let mut segments = vec![];
    let mut parser = EventReader::new(xml_string.as_bytes());
    let mut curr_segment: Option<RoadSegment> = None;

    loop { match parser.next() {
        Err(err) => return Err(SimError::parse("network xml", err)),
        Ok(XmlEvent::EndDocument) => {
            log::debug!("Reached end of network xml");
            break;
        }
        Ok(XmlEvent::StartElement {name, attributes, ..}) => { match name.local_name.as_str() {
            "edge" => {
                let id = config_utils::get_xml_attribute_value(&attributes, "id")
                    .ok_or_else(|| SimError::parse("network xml", "edge without an id"))?;
                let function = config_utils::get_xml_attribute_value(&attributes, "function");
                if is_internal(&id, function.as_deref()) {
                    curr_segment = None;
                    continue;
                }
                // prefer the road type, then the function tag
                let type_tag = config_utils::get_xml_attribute_value(&attributes, "type")
                    .or(function)
                    .unwrap_or_default();
                curr_segment = Some(RoadSegment::new(&id, 0, &type_tag));
            }
            "lane" => {
                if let Some(segment) = curr_segment.as_mut() {
                    segment.lane_count += 1;
                    if segment.type_tag.is_empty() {
                        if let Some(lane_type) =
                            config_utils::get_xml_attribute_value(&attributes, "type") {
                            segment.type_tag = lane_type;
                        }
                    }
                }
            }
            _ => {}
        }}
        Ok(XmlEvent::EndElement {name}) => {
            if name.local_name == "edge" {
                if let Some(segment) = curr_segment.take() {
                    if segment.lane_count > 0 {
                        segments.push(segment);
                    } else {
                        log::debug!("Skipping segment {} with no lanes", segment.id);
                    }
                }
            }
        }
        _ => {}
    }}

    Ok(segments)
}

/// Returns the edge sequence of every planned trip in a routes document.
fn parse_routes_xml(xml_string: &str) -> SimResult<Vec<Vec<String>>> {
    let mut trips = vec![];
    let mut named_routes: HashMap<String, Vec<String>> = HashMap::new();
    let mut parser = EventReader::new(xml_string.as_bytes());

    // state for the vehicle (or flow) element currently open
    let mut in_vehicle = false;
    let mut route_ref: Option<String> = None;
    let mut inline_routes: Vec<Vec<String>> = vec![];
    let mut distribution_last: Option<usize> = None;

    let split_edges = |edges: &str| -> Vec<String> {
        edges.split_whitespace().map(String::from).collect()
    };

    loop { match parser.next() {
        Err(err) => return Err(SimError::parse("routes xml", err)),
        Ok(XmlEvent::EndDocument) => {
            log::debug!("Reached end of routes xml");
            break;
        }
        Ok(XmlEvent::StartElement {name, attributes, ..}) => { match name.local_name.as_str() {
            "vehicle" | "flow" => {
                in_vehicle = true;
                route_ref = config_utils::get_xml_attribute_value(&attributes, "route");
                inline_routes.clear();
                distribution_last = None;
            }
            "routeDistribution" if in_vehicle => {
                distribution_last = match config_utils::get_xml_attribute_value(&attributes,
                                                                              "last") {
                    Some(last) => Some(last.parse().map_err(|_| {
                        SimError::parse("routes xml", format!("bad routeDistribution last '{}'",
                                                              last))
                    })?),
                    None => None,
                };
            }
            "route" => {
                let edges = config_utils::get_xml_attribute_value(&attributes, "edges")
                    .ok_or_else(|| SimError::parse("routes xml", "route without edges"))?;
                if in_vehicle {
                    inline_routes.push(split_edges(&edges));
                } else if let Some(id) = config_utils::get_xml_attribute_value(&attributes,
                                                                              "id") {
                    named_routes.insert(id, split_edges(&edges));
                }
            }
            _ => {}
        }}
        Ok(XmlEvent::EndElement {name}) => {
            let local_name = name.local_name.as_str();
            if in_vehicle && (local_name == "vehicle" || local_name == "flow") {
                in_vehicle = false;
                // in a route distribution, "last" names the route that was actually assigned
                let chosen = match distribution_last {
                    Some(idx) if idx < inline_routes.len() => Some(inline_routes.swap_remove(idx)),
                    _ => inline_routes.pop(),
                };
                let edges = match (chosen, route_ref.take()) {
                    (Some(edges), _) => Some(edges),
                    (None, Some(rid)) => match named_routes.get(&rid) {
                        Some(edges) => Some(edges.clone()),
                        None => {
                            log::warn!("Planned trip references unknown route {}", rid);
                            None
                        }
                    },
                    (None, None) => None,
                };
                if let Some(edges) = edges {
                    trips.push(edges);
                }
                inline_routes.clear();
            }
        }
        _ => {}
    }}

    Ok(trips)
}
