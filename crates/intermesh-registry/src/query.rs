//! Device discovery queries.
//!
//! A query is a list of `key=value` filters joined by `&`; a device matches
//! when every filter matches. An empty query matches every device.
//!
//! | Key | Matches |
//! |---|---|
//! | `platformId` / `hostedBy` | hosting platform id |
//! | `deviceId` | device id |
//! | `deviceType` | one of the device's types (`DEVICE`, `SENSOR`, `ACTUATOR`) |
//! | `location` | location, exactly |
//! | `name` | name, exactly |
//!
//! The result shape follows the requested [`QueryType`]: `CONSTRUCT` returns
//! the matching devices, `SELECT` one attribute row per device, `ASK`
//! whether anything matched.

use std::collections::BTreeMap;

use intermesh_types::{DeviceType, IoTDevice, QueryResult, QueryType};

use crate::store::RegistryError;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Filter {
    PlatformId(String),
    DeviceId(String),
    DeviceType(DeviceType),
    Location(String),
    Name(String),
}

impl Filter {
    fn matches(&self, device: &IoTDevice) -> bool {
        match self {
            Filter::PlatformId(id) => &device.hosted_by == id,
            Filter::DeviceId(id) => &device.device_id == id,
            Filter::DeviceType(t) => device.device_types.contains(t),
            Filter::Location(l) => device.location.as_deref() == Some(l.as_str()),
            Filter::Name(n) => device.name.as_deref() == Some(n.as_str()),
        }
    }
}

/// A parsed discovery query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceFilter {
    filters: Vec<Filter>,
}

impl DeviceFilter {
    /// Parse `query`.
    ///
    /// # Errors
    ///
    /// [`RegistryError::InvalidQuery`] for a clause without `=`, an unknown
    /// key or an unknown device type.
    pub fn parse(query: &str) -> Result<Self, RegistryError> {
        let mut filters = Vec::new();
        for clause in query.split('&').map(str::trim).filter(|c| !c.is_empty()) {
            let (key, value) = clause
                .split_once('=')
                .ok_or_else(|| RegistryError::InvalidQuery(format!("expected key=value, got '{clause}'")))?;
            let value = value.trim().to_string();
            let filter = match key.trim() {
                "platformId" | "hostedBy" => Filter::PlatformId(value),
                "deviceId" => Filter::DeviceId(value),
                "deviceType" => Filter::DeviceType(
                    DeviceType::parse(&value)
                        .ok_or_else(|| RegistryError::InvalidQuery(format!("unknown device type '{value}'")))?,
                ),
                "location" => Filter::Location(value),
                "name" => Filter::Name(value),
                other => return Err(RegistryError::InvalidQuery(format!("unknown filter key '{other}'"))),
            };
            filters.push(filter);
        }
        Ok(Self { filters })
    }

    /// The platform this query is restricted to, when it names exactly one.
    pub fn platform_id(&self) -> Option<&str> {
        let mut ids = self.filters.iter().filter_map(|f| match f {
            Filter::PlatformId(id) => Some(id.as_str()),
            _ => None,
        });
        match (ids.next(), ids.next()) {
            (Some(id), None) => Some(id),
            _ => None,
        }
    }

    pub fn matches(&self, device: &IoTDevice) -> bool {
        self.filters.iter().all(|f| f.matches(device))
    }

    /// Apply the filter to `devices` and shape the result.
    pub fn evaluate(&self, devices: Vec<IoTDevice>, query_type: QueryType) -> QueryResult {
        let mut matching = devices.into_iter().filter(|d| self.matches(d));
        match query_type {
            QueryType::Ask => QueryResult::AskResult(matching.next().is_some()),
            QueryType::Construct => QueryResult::ConstructResult(matching.collect()),
            QueryType::Select => QueryResult::SelectResult(matching.map(|d| select_row(&d)).collect()),
        }
    }
}

fn select_row(device: &IoTDevice) -> BTreeMap<String, String> {
    let mut row = BTreeMap::new();
    row.insert("deviceId".to_string(), device.device_id.clone());
    row.insert("hostedBy".to_string(), device.hosted_by.clone());
    if let Some(name) = &device.name {
        row.insert("name".to_string(), name.clone());
    }
    if let Some(location) = &device.location {
        row.insert("location".to_string(), location.clone());
    }
    let types: Vec<&str> = device.device_types.iter().map(|t| t.as_str()).collect();
    row.insert("deviceTypes".to_string(), types.join(","));
    row
}

#[cfg(test)]
mod tests {
    use super::*;

    fn devices() -> Vec<IoTDevice> {
        let mut thermometer = IoTDevice::new("http://p1/thermo", "http://p1");
        thermometer.device_types.insert(DeviceType::Sensor);
        thermometer.location = Some("kitchen".into());
        let mut valve = IoTDevice::new("http://p1/valve", "http://p1");
        valve.device_types.insert(DeviceType::Actuator);
        let mut remote = IoTDevice::new("http://p2/thermo", "http://p2");
        remote.device_types.insert(DeviceType::Sensor);
        remote.name = Some("Remote thermometer".into());
        vec![thermometer, valve, remote]
    }

    #[test]
    fn empty_query_matches_everything() {
        let filter = DeviceFilter::parse("").unwrap();
        let QueryResult::ConstructResult(found) = filter.evaluate(devices(), QueryType::Construct) else {
            panic!("expected construct result");
        };
        assert_eq!(found.len(), 3);
    }

    #[test]
    fn filters_combine_with_and() {
        let filter = DeviceFilter::parse("platformId=http://p1&deviceType=sensor").unwrap();
        let QueryResult::ConstructResult(found) = filter.evaluate(devices(), QueryType::Construct) else {
            panic!("expected construct result");
        };
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].device_id, "http://p1/thermo");
    }

    #[test]
    fn select_rows_carry_device_attributes() {
        let filter = DeviceFilter::parse("location=kitchen").unwrap();
        let QueryResult::SelectResult(rows) = filter.evaluate(devices(), QueryType::Select) else {
            panic!("expected select result");
        };
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["hostedBy"], "http://p1");
        assert_eq!(rows[0]["deviceTypes"], "DEVICE,SENSOR");
    }

    #[test]
    fn ask_reports_whether_anything_matched() {
        let yes = DeviceFilter::parse("name=Remote thermometer").unwrap();
        assert_eq!(yes.evaluate(devices(), QueryType::Ask), QueryResult::AskResult(true));
        let no = DeviceFilter::parse("hostedBy=http://p9").unwrap();
        assert_eq!(no.evaluate(devices(), QueryType::Ask), QueryResult::AskResult(false));
    }

    #[test]
    fn platform_id_is_exposed_only_when_unambiguous() {
        assert_eq!(DeviceFilter::parse("platformId=http://p1").unwrap().platform_id(), Some("http://p1"));
        assert_eq!(DeviceFilter::parse("deviceType=SENSOR").unwrap().platform_id(), None);
        assert_eq!(
            DeviceFilter::parse("platformId=a&hostedBy=b").unwrap().platform_id(),
            None
        );
    }

    #[test]
    fn malformed_queries_are_rejected() {
        assert!(matches!(DeviceFilter::parse("colour=red"), Err(RegistryError::InvalidQuery(_))));
        assert!(matches!(DeviceFilter::parse("deviceType=toaster"), Err(RegistryError::InvalidQuery(_))));
        assert!(matches!(DeviceFilter::parse("justtext"), Err(RegistryError::InvalidQuery(_))));
    }
}
