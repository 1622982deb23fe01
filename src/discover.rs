//! Finding the keyboard on the bus.

use std::fmt;

use log::warn;
use rusb::{Device, Speed, UsbContext};

use crate::error::{KbdbootError, Result};

/// What discovery needs to know about an attached device.
#[derive(Debug, Clone, Copy)]
pub struct DeviceSummary {
    pub bus: u8,
    pub address: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    pub speed: Speed,
}

impl DeviceSummary {
    /// Reads bus, address, speed and IDs of a device.
    pub fn from_device<T: UsbContext>(device: &Device<T>) -> Result<Self> {
        let desc = device
            .device_descriptor()
            .map_err(KbdbootError::UsbDescriptorFailure)?;
        Ok(DeviceSummary {
            bus: device.bus_number(),
            address: device.address(),
            vendor_id: desc.vendor_id(),
            product_id: desc.product_id(),
            speed: device.speed(),
        })
    }

    fn location(&self) -> (u8, u8) {
        (self.bus, self.address)
    }
}

fn speed_name(speed: Speed) -> &'static str {
    match speed {
        Speed::Low => "1.5 Mbps",
        Speed::Full => "12 Mbps",
        Speed::High => "480 Mbps",
        Speed::Super => "5 Gbps",
        Speed::SuperPlus => "10 Gbps",
        _ => "Unknown",
    }
}

impl fmt::Display for DeviceSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Dev (bus {:02} address {:02}): {:#06x} - {:#06x} speed: {}",
            self.bus,
            self.address,
            self.vendor_id,
            self.product_id,
            speed_name(self.speed)
        )
    }
}

/// How to pick a device out of the enumeration.
///
/// With a pinned location the identity is only checked for warnings, since
/// the operator asked for that exact device. Otherwise the first device with
/// a matching identity wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSelector {
    pub location: Option<(u8, u8)>,
    pub vendor_id: u16,
    pub product_ids: Vec<u16>,
}

impl DeviceSelector {
    /// Any device with this vendor ID and one of the product IDs.
    pub fn by_identity(vendor_id: u16, product_ids: &[u16]) -> Self {
        DeviceSelector {
            location: None,
            vendor_id,
            product_ids: product_ids.to_vec(),
        }
    }

    /// Pins the selector to a bus and device address.
    pub fn at(mut self, location: Option<(u8, u8)>) -> Self {
        self.location = location;
        self
    }

    pub fn matches_identity(&self, device: &DeviceSummary) -> bool {
        device.vendor_id == self.vendor_id && self.product_ids.contains(&device.product_id)
    }

    fn product_list(&self) -> String {
        self.product_ids
            .iter()
            .map(|pid| format!("{pid:#06x}"))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Picks a device from a list sorted by (bus, address).
    pub fn select<'a>(&self, devices: &'a [DeviceSummary]) -> Result<&'a DeviceSummary> {
        let Some((bus, address)) = self.location else {
            return devices
                .iter()
                .find(|d| self.matches_identity(d))
                .ok_or_else(|| {
                    KbdbootError::DeviceNotFound(format!(
                        "Could not find device with idVendor {:#06x} and idProduct in {{ {} }}",
                        self.vendor_id,
                        self.product_list()
                    ))
                });
        };

        let device = devices
            .iter()
            .find(|d| d.location() == (bus, address))
            .ok_or_else(|| {
                KbdbootError::DeviceNotFound(format!(
                    "Could not find device at bus {bus} and device address {address}"
                ))
            })?;

        if device.vendor_id != self.vendor_id {
            warn!(
                "idVendor {:#06x} does not match expected value {:#06x}",
                device.vendor_id, self.vendor_id
            );
        }
        if !self.product_ids.contains(&device.product_id) {
            warn!(
                "idProduct {:#06x} does not match any expected value: {}",
                device.product_id,
                self.product_list()
            );
        }
        Ok(device)
    }
}

/// Enumerates attached devices, sorted by (bus, address).
pub fn list_devices<T: UsbContext>(ctx: &T) -> Result<Vec<(Device<T>, DeviceSummary)>> {
    let mut devices = ctx
        .devices()
        .map_err(KbdbootError::UsbListFailure)?
        .iter()
        .map(|device| DeviceSummary::from_device(&device).map(|summary| (device, summary)))
        .collect::<Result<Vec<_>>>()?;

    devices.sort_by_key(|(_, summary)| summary.location());
    Ok(devices)
}

/// Enumerates devices and returns the one `selector` picks.
pub fn select_device<T: UsbContext>(
    ctx: &T,
    selector: &DeviceSelector,
) -> Result<(Device<T>, DeviceSummary)> {
    let devices = list_devices(ctx)?;
    let summaries = devices.iter().map(|(_, s)| *s).collect::<Vec<_>>();
    let location = selector.select(&summaries)?.location();

    devices
        .into_iter()
        .find(|(_, s)| s.location() == location)
        .ok_or_else(|| KbdbootError::DeviceNotFound(format!("device at {location:?} vanished")))
}

/// Opens `device` and reads its descriptive strings.
pub fn describe_device<T: UsbContext>(device: &Device<T>) -> Result<String> {
    let desc = device
        .device_descriptor()
        .map_err(KbdbootError::UsbDescriptorFailure)?;
    let handle = device.open().map_err(KbdbootError::UsbOpenFailure)?;

    let mut text = String::new();
    if desc.manufacturer_string_index().is_some() {
        let manufacturer = handle
            .read_manufacturer_string_ascii(&desc)
            .map_err(KbdbootError::UsbDescriptorFailure)?;
        text.push_str(&format!("  Manufacturer:              {manufacturer}\n"));
    }
    if desc.product_string_index().is_some() {
        let product = handle
            .read_product_string_ascii(&desc)
            .map_err(KbdbootError::UsbDescriptorFailure)?;
        text.push_str(&format!("  Product:                   {product}\n"));
    }
    if desc.serial_number_string_index().is_some() {
        let serial = handle
            .read_serial_number_string_ascii(&desc)
            .map_err(KbdbootError::UsbDescriptorFailure)?;
        text.push_str(&format!("  Serial Number:             {serial}\n"));
    }
    Ok(text)
}
