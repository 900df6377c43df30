use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::path::PathBuf;
use std::convert::TryFrom;

use xml::attribute::OwnedAttribute;
use xml::reader::EventReader;
use yaml_rust::Yaml;

use super::error::{SimError, SimResult};


pub fn xml_parser_from_path(path: &Path) -> SimResult<EventReader<BufReader<File>>> {
    let file = File::open(path).map_err(|err| {
        SimError::parse(path.display().to_string(), err)
    })?;
    let file = BufReader::new(file);
    Ok(EventReader::new(file))
}

pub fn get_xml_attribute_value(attributes: &[OwnedAttribute], attr_name: &str)
                               -> Option<String> {
    attributes.iter()
              .find(|attr| attr.name.local_name == attr_name)
              .map(|attr| attr.value.clone())
}

pub fn str_to_absolute_path(path_str: &str, default_base_dir: &Path) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        return path;
    } else {
        return [default_base_dir, Path::new(&path)].iter().collect();
    }
}

/// Parses "H:MM:SS" (or a bare number of seconds) into seconds.
pub fn get_num_seconds_from_time_str(timestr: &str) -> Option<u32> {
    let parts: Vec<&str> = timestr.trim().split(':').collect();
    match parts.as_slice() {
        [seconds] => seconds.parse().ok(),
        [hours, minutes, seconds] => {
            let hours: u32 = hours.parse().ok()?;
            let minutes: u32 = minutes.parse().ok()?;
            let seconds: u32 = seconds.parse().ok()?;
            // times past the u32 range are rejected rather than wrapped
            hours.checked_mul(3600)?
                 .checked_add(minutes.checked_mul(60)?)?
                 .checked_add(seconds)
        }
        _ => None,
    }
}

/// Reads a non-negative time from a yaml value, which may be an integer or a time string.
pub fn yaml_time_s(yaml: &Yaml, key: &str) -> SimResult<Option<u32>> {
    let value = &yaml[key];
    if value.is_badvalue() || value.is_null() {
        return Ok(None);
    }
    let seconds = match value {
        Yaml::Integer(ii) => u32::try_from(*ii).ok(),
        Yaml::String(ss) => get_num_seconds_from_time_str(ss),
        _ => None,
    };
    match seconds {
        Some(ss) => Ok(Some(ss)),
        None => Err(SimError::config(format!("'{}' is not a valid time: {:?}", key, value))),
    }
}

pub fn yaml_string_list(yaml: &Yaml, key: &str) -> SimResult<Vec<String>> {
    match &yaml[key] {
        Yaml::Array(items) => items.iter().map(|item| match item {
            Yaml::String(ss) => Ok(ss.clone()),
            Yaml::Integer(ii) => Ok(ii.to_string()),
            other => Err(SimError::config(format!("bad entry in '{}': {:?}", key, other))),
        }).collect(),
        // allow a single whitespace- or comma-separated string as well
        Yaml::String(ss) => Ok(ss.split(|cc: char| cc == ',' || cc.is_whitespace())
                                 .filter(|tok| !tok.is_empty())
                                 .map(String::from)
                                 .collect()),
        Yaml::BadValue | Yaml::Null => Ok(vec![]),
        other => Err(SimError::config(format!("'{}' must be a list, got {:?}", key, other))),
    }
}
