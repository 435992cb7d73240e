//! Serial port enumeration

use serialport::{available_ports, SerialPortType};
use tracing::info;

/// A serial port found on this machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortEntry {
    pub port: String,
    pub description: String,
}

impl PortEntry {
    fn from_serialport(port: String, port_type: &SerialPortType) -> Self {
        let description = match port_type {
            SerialPortType::UsbPort(usb) => {
                let product = usb.product.as_deref().unwrap_or("USB serial");
                format!("{} [{:04x}:{:04x}]", product, usb.vid, usb.pid)
            }
            SerialPortType::PciPort => "PCI".to_string(),
            SerialPortType::BluetoothPort => "Bluetooth".to_string(),
            SerialPortType::Unknown => "Unknown".to_string(),
        };
        Self { port, description }
    }
}

/// Enumerate the serial ports the OS reports
pub fn enumerate() -> anyhow::Result<Vec<PortEntry>> {
    let ports: Vec<_> = available_ports()?
        .into_iter()
        .map(|p| PortEntry::from_serialport(p.port_name, &p.port_type))
        .collect();
    info!("Found {} serial port(s)", ports.len());
    Ok(ports)
}
