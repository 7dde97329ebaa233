#![allow(dead_code)]

use serde::{Deserialize, Serialize};

/// A paired sub-device as reported by the Eagle-200 device list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub name: String,
    /// Opaque hardware identifier, e.g. "0xd8d5b9000000af3b".
    pub hardware_address: String,
}

/// One instantaneous power observation, already converted to watts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub watts: f64,
}
