#![allow(dead_code)]

use quick_xml::events::Event;
use quick_xml::Reader;
use thiserror::Error;
use tracing::warn;

use types::{Device, Reading};

/// The meter reports demand in kilowatts; published readings are watts.
pub const WATTS_PER_DEVICE_UNIT: f64 = 1000.0;
/// Component carrying the whole-home readings.
pub const MAIN_COMPONENT: &str = "Main";
/// Variable name for current power draw.
pub const DEMAND_VARIABLE: &str = "zigbee:InstantaneousDemand";

#[derive(Debug, Error)]
pub enum ParserError {
    #[error("xml parse error: {0}")]
    Xml(#[from] quick_xml::Error),
}

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("component {0:?} not present in query result")]
    MissingComponent(String),
    #[error("variable {0:?} not present in component")]
    MissingVariable(String),
    #[error("demand value {0:?} is not numeric")]
    NonNumeric(String),
}

#[derive(Debug, Clone, Default)]
pub struct QueryVariable {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Default)]
pub struct QueryComponent {
    pub name: String,
    pub variables: Vec<QueryVariable>,
}

/// Structured form of one `device_query` response.
#[derive(Debug, Clone, Default)]
pub struct DeviceQuery {
    pub components: Vec<QueryComponent>,
}

impl DeviceQuery {
    /// True when the device answered but had no data for the request;
    /// callers skip the tick rather than treat this as an error.
    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }
}

enum ListField {
    Name,
    HardwareAddress,
}

/// Parses a `device_list` response. Entries missing a name or hardware
/// address are skipped with a warning; an empty list is a valid result
/// meaning "not yet provisioned".
pub fn parse_device_list(data: &str) -> Result<Vec<Device>, ParserError> {
    let mut reader = Reader::from_str(data);
    reader.trim_text(true);

    let mut buf = Vec::new();
    let mut devices = Vec::new();
    let mut in_device = false;
    let mut field: Option<ListField> = None;
    let mut name: Option<String> = None;
    let mut hardware_address: Option<String> = None;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref event)) => match event.name().as_ref() {
                b"Device" => {
                    in_device = true;
                    name = None;
                    hardware_address = None;
                }
                b"Name" if in_device => field = Some(ListField::Name),
                b"HardwareAddress" if in_device => field = Some(ListField::HardwareAddress),
                _ => field = None,
            },
            Ok(Event::Text(ref text)) => {
                let value = text.unescape()?.into_owned();
                match field {
                    Some(ListField::Name) => name = Some(value),
                    Some(ListField::HardwareAddress) => hardware_address = Some(value),
                    None => {}
                }
            }
            Ok(Event::End(ref event)) => {
                if event.name().as_ref() == b"Device" {
                    in_device = false;
                    match (name.take(), hardware_address.take()) {
                        (Some(name), Some(hardware_address)) => devices.push(Device {
                            name,
                            hardware_address,
                        }),
                        _ => warn!("skipping device entry with missing name or hardware address"),
                    }
                }
                field = None;
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(err) => return Err(ParserError::Xml(err)),
        }

        buf.clear();
    }

    Ok(devices)
}

enum QueryField {
    ComponentName,
    VariableName,
    VariableValue,
}

/// Parses a `device_query` response into components and their variables.
/// Only structural failures are errors; absence of data is reported through
/// [`DeviceQuery::is_empty`].
pub fn parse_device_query(data: &str) -> Result<DeviceQuery, ParserError> {
    let mut reader = Reader::from_str(data);
    reader.trim_text(true);

    let mut buf = Vec::new();
    let mut query = DeviceQuery::default();
    let mut component: Option<QueryComponent> = None;
    let mut variable: Option<QueryVariable> = None;
    let mut field: Option<QueryField> = None;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref event)) => match event.name().as_ref() {
                b"Component" => component = Some(QueryComponent::default()),
                b"Variable" if component.is_some() => {
                    variable = Some(QueryVariable::default());
                }
                b"Name" if variable.is_some() => field = Some(QueryField::VariableName),
                b"Name" if component.is_some() => field = Some(QueryField::ComponentName),
                b"Value" if variable.is_some() => field = Some(QueryField::VariableValue),
                _ => field = None,
            },
            Ok(Event::Text(ref text)) => {
                let value = text.unescape()?.into_owned();
                match field {
                    Some(QueryField::ComponentName) => {
                        if let Some(component) = component.as_mut() {
                            component.name = value;
                        }
                    }
                    Some(QueryField::VariableName) => {
                        if let Some(variable) = variable.as_mut() {
                            variable.name = value;
                        }
                    }
                    Some(QueryField::VariableValue) => {
                        if let Some(variable) = variable.as_mut() {
                            variable.value = value;
                        }
                    }
                    None => {}
                }
            }
            Ok(Event::End(ref event)) => {
                match event.name().as_ref() {
                    b"Variable" => {
                        if let (Some(component), Some(variable)) =
                            (component.as_mut(), variable.take())
                        {
                            component.variables.push(variable);
                        }
                    }
                    b"Component" => {
                        if let Some(component) = component.take() {
                            query.components.push(component);
                        }
                    }
                    _ => {}
                }
                field = None;
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(err) => return Err(ParserError::Xml(err)),
        }

        buf.clear();
    }

    Ok(query)
}

/// Pulls the instantaneous demand out of a parsed query and converts it to
/// watts. Pure; zero and negative readings pass through unclamped.
pub fn extract_demand_watts(query: &DeviceQuery) -> Result<Reading, ExtractError> {
    let component = query
        .components
        .iter()
        .find(|component| component.name == MAIN_COMPONENT)
        .ok_or_else(|| ExtractError::MissingComponent(MAIN_COMPONENT.to_string()))?;

    let variable = component
        .variables
        .iter()
        .find(|variable| variable.name == DEMAND_VARIABLE)
        .ok_or_else(|| ExtractError::MissingVariable(DEMAND_VARIABLE.to_string()))?;

    let demand: f64 = variable
        .value
        .trim()
        .parse()
        .map_err(|_| ExtractError::NonNumeric(variable.value.clone()))?;

    Ok(Reading {
        watts: demand * WATTS_PER_DEVICE_UNIT,
    })
}
