//! Kubernetes resource quantity parsing
//!
//! Converts quantity strings ("250m", "1.5Gi", "2e3") into approximate
//! floating point values in base units: cores for CPU, bytes for memory.

use k8s_openapi::api::core::v1::ResourceRequirements;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use std::collections::BTreeMap;

/// Parse a quantity to its approximate value in base units.
///
/// Unparseable quantities count as zero so a single malformed request
/// cannot abort capacity planning.
///
/// # Examples
/// ```
/// use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
/// use prescaler_lib::cluster::quantity_value;
/// assert_eq!(quantity_value(&Quantity("500m".into())), 0.5);
/// assert_eq!(quantity_value(&Quantity("1Ki".into())), 1024.0);
/// ```
pub fn quantity_value(quantity: &Quantity) -> f64 {
    parse_quantity(&quantity.0).unwrap_or(0.0)
}

fn parse_quantity(value: &str) -> Option<f64> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }

    let split = value
        .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '+' || c == '-'))
        .unwrap_or(value.len());
    let (number, suffix) = value.split_at(split);
    let number: f64 = number.parse().ok()?;

    let multiplier = match suffix {
        "" => 1.0,
        "n" => 1e-9,
        "u" => 1e-6,
        "m" => 1e-3,
        "k" => 1e3,
        "M" => 1e6,
        "G" => 1e9,
        "T" => 1e12,
        "P" => 1e15,
        "E" => 1e18,
        "Ki" => 1024.0,
        "Mi" => 1024.0 * 1024.0,
        "Gi" => 1024.0 * 1024.0 * 1024.0,
        "Ti" => 1024.0_f64.powi(4),
        "Pi" => 1024.0_f64.powi(5),
        "Ei" => 1024.0_f64.powi(6),
        exp if exp.starts_with(['e', 'E']) => {
            let exponent: i32 = exp[1..].parse().ok()?;
            10.0_f64.powi(exponent)
        }
        _ => return None,
    };

    Some(number * multiplier)
}

/// Sum of CPU (cores) and memory (bytes) requests across containers
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RequestedResources {
    pub cpu: f64,
    pub memory: f64,
}

impl RequestedResources {
    pub fn add_requests(&mut self, resources: Option<&ResourceRequirements>) {
        let requests: Option<&BTreeMap<String, Quantity>> =
            resources.and_then(|r| r.requests.as_ref());
        if let Some(requests) = requests {
            self.cpu += requests.get("cpu").map(quantity_value).unwrap_or(0.0);
            self.memory += requests.get("memory").map(quantity_value).unwrap_or(0.0);
        }
    }
}
