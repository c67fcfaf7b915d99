// SPDX-FileCopyrightText: © 2023 Tenstorrent Inc.
// SPDX-License-Identifier: Apache-2.0

//! The cluster descriptor written by `create-ethernet-map`.
//!
//! It names every chip in the ethernet mesh, where it sits and which of them have a PCIe link.
//! Grayskull clusters and single cards get by without one, every device is then its own MMIO
//! chip.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use dbd_core::{Arch, ChipId, EthCoord};
use serde::Deserialize;

use crate::DeviceError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct Harvesting {
    pub noc_translation: bool,
    pub harvest_mask: u32,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ConnectionEntry {
    Endpoint { chip: ChipId, chan: u8 },
    Routing { routing_enabled: bool },
}

#[derive(Deserialize)]
#[serde(untagged)]
enum MmioEntry {
    Id(ChipId),
    Interface(BTreeMap<ChipId, usize>),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum HarvestingEntries {
    Map(BTreeMap<ChipId, Harvesting>),
    List(Vec<BTreeMap<ChipId, Harvesting>>),
}

#[derive(Deserialize, Default)]
struct RawClusterDescriptor {
    #[serde(default)]
    arch: BTreeMap<ChipId, String>,
    #[serde(default)]
    chips: BTreeMap<ChipId, EthCoord>,
    #[serde(default)]
    ethernet_connections: Vec<Vec<ConnectionEntry>>,
    #[serde(default)]
    chips_with_mmio: Vec<MmioEntry>,
    #[serde(default)]
    harvesting: Option<HarvestingEntries>,
    #[serde(default)]
    boardtype: BTreeMap<ChipId, Option<String>>,
}

/// One end of an ethernet link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct EthEndpoint {
    pub chip: ChipId,
    pub chan: u8,
}

#[derive(Debug, Clone, Default)]
pub struct ClusterDescriptor {
    chips: BTreeSet<ChipId>,
    arch: BTreeMap<ChipId, Arch>,
    locations: BTreeMap<ChipId, EthCoord>,
    // Value is the PCI interface when the descriptor names one.
    mmio: BTreeMap<ChipId, Option<usize>>,
    connections: BTreeMap<EthEndpoint, EthEndpoint>,
    harvesting: BTreeMap<ChipId, Harvesting>,
    boardtype: BTreeMap<ChipId, String>,
}

impl ClusterDescriptor {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, DeviceError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| DeviceError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        Self::from_yaml(&text)
    }

    pub fn from_yaml(text: &str) -> Result<Self, DeviceError> {
        let raw: Option<RawClusterDescriptor> = serde_yaml::from_str(text)?;
        let raw = raw.unwrap_or_default();

        let mut desc = ClusterDescriptor::default();

        for (chip, name) in raw.arch {
            let arch = name.parse::<Arch>().map_err(|name| {
                DeviceError::Descriptor(format!("chip {chip} has unknown arch {name}"))
            })?;
            desc.arch.insert(chip, arch);
            desc.chips.insert(chip);
        }

        for (chip, location) in raw.chips {
            desc.locations.insert(chip, location);
            desc.chips.insert(chip);
        }

        for connection in raw.ethernet_connections {
            let endpoints = connection
                .iter()
                .filter_map(|entry| match entry {
                    ConnectionEntry::Endpoint { chip, chan } => Some(EthEndpoint {
                        chip: *chip,
                        chan: *chan,
                    }),
                    ConnectionEntry::Routing { .. } => None,
                })
                .collect::<Vec<_>>();

            let &[a, b] = endpoints.as_slice() else {
                return Err(DeviceError::Descriptor(format!(
                    "an ethernet connection must join exactly two endpoints, found {}",
                    endpoints.len()
                )));
            };

            for (from, to) in [(a, b), (b, a)] {
                match desc.connections.get(&from) {
                    Some(existing) if *existing != to => {
                        return Err(DeviceError::Descriptor(format!(
                            "chip {} channel {} is connected twice",
                            from.chip, from.chan
                        )));
                    }
                    _ => {
                        desc.connections.insert(from, to);
                    }
                }
            }
        }

        for entry in raw.chips_with_mmio {
            match entry {
                MmioEntry::Id(chip) => {
                    desc.mmio.insert(chip, None);
                    desc.chips.insert(chip);
                }
                MmioEntry::Interface(map) => {
                    for (chip, interface) in map {
                        desc.mmio.insert(chip, Some(interface));
                        desc.chips.insert(chip);
                    }
                }
            }
        }

        match raw.harvesting {
            Some(HarvestingEntries::Map(map)) => desc.harvesting.extend(map),
            Some(HarvestingEntries::List(list)) => {
                for map in list {
                    desc.harvesting.extend(map);
                }
            }
            None => {}
        }

        desc.boardtype.extend(
            raw.boardtype
                .into_iter()
                .filter_map(|(chip, board)| board.map(|board| (chip, board))),
        );

        tracing::debug!(
            "cluster: chips {:?}, mmio {:?}",
            desc.chips,
            desc.mmio.keys().collect::<Vec<_>>()
        );

        Ok(desc)
    }

    /// A cluster of independent PCIe devices, chip `i` is PCI interface `i`.
    pub fn local(arch: Arch, interfaces: &[usize]) -> Self {
        let mut desc = ClusterDescriptor::default();
        for (chip, interface) in interfaces.iter().enumerate() {
            let chip = chip as ChipId;
            desc.chips.insert(chip);
            desc.arch.insert(chip, arch);
            desc.mmio.insert(chip, Some(*interface));
        }

        desc
    }

    pub fn chips(&self) -> impl Iterator<Item = ChipId> + '_ {
        self.chips.iter().copied()
    }

    pub fn contains(&self, chip: ChipId) -> bool {
        self.chips.contains(&chip)
    }

    pub fn arch(&self, chip: ChipId) -> Option<Arch> {
        self.arch.get(&chip).copied()
    }

    pub fn is_chip_mmio_capable(&self, chip: ChipId) -> bool {
        self.mmio.contains_key(&chip)
    }

    pub fn mmio_chips(&self) -> impl Iterator<Item = ChipId> + '_ {
        self.mmio.keys().copied()
    }

    /// The PCI interface of an MMIO chip, falling back to the chip id when not given.
    pub fn pci_interface(&self, chip: ChipId) -> Option<usize> {
        self.mmio
            .get(&chip)
            .map(|interface| interface.unwrap_or(chip as usize))
    }

    /// Chips are assumed to be connected to their neighbours by id, so the closest MMIO chip is
    /// the one with the nearest id.
    pub fn closest_mmio_chip(&self, chip: ChipId) -> Option<ChipId> {
        self.mmio
            .keys()
            .copied()
            .min_by_key(|mmio| (*mmio as i32 - chip as i32).abs())
    }

    pub fn location(&self, chip: ChipId) -> EthCoord {
        self.locations.get(&chip).copied().unwrap_or_default()
    }

    pub fn harvesting(&self, chip: ChipId) -> Option<Harvesting> {
        self.harvesting.get(&chip).copied()
    }

    pub fn connection(&self, from: EthEndpoint) -> Option<EthEndpoint> {
        self.connections.get(&from).copied()
    }

    pub fn boardtype(&self, chip: ChipId) -> Option<&str> {
        self.boardtype.get(&chip).map(String::as_str)
    }
}
