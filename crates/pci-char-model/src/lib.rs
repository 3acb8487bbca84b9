//! Addressing model for the `pci-char` register access driver.
//!
//! This crate has **no hardware access** and depends only on `thiserror`.
//! It models the parts of PCI that the driver reasons about before it
//! touches a device: BAR slots and the sysfs `resource` table, device
//! addresses and the names derived from them, and the dynamic
//! `vendor:device` IDs used for binding.
//!
//! # Crate organisation
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`bar`] | BAR slot indices, slot masks, resource flags, `resource` table parsing |
//! | [`address`] | `domain:bus:slot.function` addresses, endpoint node names |
//! | [`id`] | Dynamic `vendor:device[:...]` ID strings and matching |

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod address;
pub mod bar;
mod error;
pub mod id;

pub use address::PciAddress;
pub use bar::{BarIndex, BarKind, BarMask, BarResource, ResourceTable, BAR_COUNT};
pub use error::ParseError;
pub use id::{DeviceIds, PciId, PCI_ANY_ID};
