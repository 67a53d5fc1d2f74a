//! Network discovery and device identification
//!
//! This module handles:
//! - Hostname and current IP address for status reports
//! - Primary MAC address detection with priority (Ethernet > WiFi > Other)
//! - Device id fallback when none is configured

use anyhow::{Context, Result};
use if_addrs::{get_if_addrs, IfAddr};
use mac_address::MacAddress;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Reported when no routable address can be found
pub const DEFAULT_IP: &str = "127.0.0.1";

/// Network interface information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkInterface {
    pub name: String,
    pub mac: String,
    pub ip: String,
    #[serde(rename = "type")]
    pub interface_type: InterfaceType,
}

/// Interface type classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterfaceType {
    Ethernet,
    Wireless,
    Loopback,
    Other,
}

/// Complete network discovery result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkInfo {
    pub primary_mac: String,
    pub interfaces: Vec<NetworkInterface>,
}

/// Host name as reported by the OS
pub fn hostname() -> String {
    gethostname::gethostname().to_string_lossy().to_string()
}

/// Current outbound IP address, or [`DEFAULT_IP`]
pub fn local_ip() -> String {
    match local_ip_address::local_ip() {
        Ok(ip) => ip.to_string(),
        Err(e) => {
            warn!("Failed to get IP: {}", e);
            DEFAULT_IP.to_string()
        }
    }
}

impl NetworkInfo {
    /// Discover network interfaces and determine primary MAC
    pub fn discover() -> Result<Self> {
        debug!("Enumerating network interfaces...");

        let if_addrs = get_if_addrs().context("Failed to enumerate network interfaces")?;

        let mut interfaces = Vec::new();
        for if_addr in if_addrs {
            if if_addr.is_loopback() {
                continue;
            }

            let ip = match if_addr.addr {
                IfAddr::V4(v4) => v4.ip.to_string(),
                IfAddr::V6(v6) => v6.ip.to_string(),
            };

            if let Some(mac) = Self::interface_mac(&if_addr.name) {
                let interface = NetworkInterface {
                    name: if_addr.name.clone(),
                    mac: format_mac(&mac),
                    ip,
                    interface_type: Self::classify_interface(&if_addr.name),
                };
                debug!("Found interface: {} ({})", interface.name, interface.mac);
                interfaces.push(interface);
            }
        }

        let primary_mac = Self::select_primary_mac(&interfaces)?;
        info!(
            "Selected primary MAC: {} from {} interfaces",
            primary_mac,
            interfaces.len()
        );

        Ok(NetworkInfo {
            primary_mac,
            interfaces,
        })
    }

    fn interface_mac(interface_name: &str) -> Option<MacAddress> {
        match mac_address::mac_address_by_name(interface_name) {
            Ok(Some(mac)) => Some(mac),
            Ok(None) => {
                debug!("No MAC found for interface: {}", interface_name);
                None
            }
            Err(e) => {
                debug!("Error getting MAC for {}: {}", interface_name, e);
                None
            }
        }
    }

    /// Classify interface type based on name patterns
    fn classify_interface(name: &str) -> InterfaceType {
        let name_lower = name.to_lowercase();

        if name_lower == "lo" || name_lower.starts_with("lo0") {
            return InterfaceType::Loopback;
        }

        if name_lower.contains("wlan")
            || name_lower.contains("wifi")
            || name_lower.starts_with("wlp")
            || name_lower.starts_with("wlo")
        {
            return InterfaceType::Wireless;
        }

        if name_lower.starts_with("eth") || name_lower.starts_with("en") {
            return InterfaceType::Ethernet;
        }

        InterfaceType::Other
    }

    /// Select primary MAC address based on interface priority
    fn select_primary_mac(interfaces: &[NetworkInterface]) -> Result<String> {
        let by_type = |wanted: InterfaceType| {
            interfaces
                .iter()
                .find(|interface| interface.interface_type == wanted)
        };

        if let Some(interface) = by_type(InterfaceType::Ethernet) {
            info!("Selected Ethernet interface as primary: {}", interface.name);
            return Ok(interface.mac.clone());
        }

        if let Some(interface) = by_type(InterfaceType::Wireless) {
            info!("Selected WiFi interface as primary: {}", interface.name);
            return Ok(interface.mac.clone());
        }

        if let Some(interface) = interfaces.first() {
            warn!(
                "No Ethernet/WiFi found, using first interface: {}",
                interface.name
            );
            return Ok(interface.mac.clone());
        }

        Err(anyhow::anyhow!("No suitable network interface found"))
    }
}

fn format_mac(mac: &MacAddress) -> String {
    let b = mac.bytes();
    format!(
        "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        b[0], b[1], b[2], b[3], b[4], b[5]
    )
}
