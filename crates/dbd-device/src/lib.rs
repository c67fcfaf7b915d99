// SPDX-FileCopyrightText: © 2023 Tenstorrent Inc.
// SPDX-License-Identifier: Apache-2.0

//! One handle on every chip of a cluster.
//!
//! Chips with a PCIe link are reached through TLB windows in their BAR. Every tensix and
//! ethernet core gets a static window when the device is opened, accesses that fit inside one
//! skip reprogramming. Everything else goes through one of a few dynamic windows, serialised
//! between processes by a named mutex. Chips without a PCIe link are reached through the
//! ethernet relay of their closest MMIO chip.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use dbd_core::{Arch, ChipId};
use dbd_pci::{tlb, BarIo, PciDevice, PciError, Tlb};
use dbd_relay::{EthCore, EthCoreIo, RelayConfig, RelayEngine, RemoteAddr, RELAY_CORES};

pub mod arc;
pub mod cluster;
mod error;
pub mod harvesting;
pub mod mutex;
pub mod soc;

use arc::{ArcComms, ArcMsgAddr};
pub use arc::{ArcMsg, ArcMsgOk, PowerState};
pub use cluster::ClusterDescriptor;
pub use error::DeviceError;
use harvesting::Translation;
use mutex::{NamedMutex, NamedMutexGuard};
pub use soc::SocDescriptor;

/// Soft reset register of every tensix core.
pub const TENSIX_SOFT_RESET_ADDR: u64 = 0xFFB1_21B0;

pub mod soft_reset {
    pub const BRISC: u32 = 1 << 11;
    pub const TRISCS: u32 = 0x7 << 12;
    pub const NCRISC: u32 = 1 << 18;
    pub const STAGGERED_START: u32 = 1 << 31;

    pub const ALL_TENSIX: u32 = BRISC | TRISCS | NCRISC | STAGGERED_START;
    pub const ASSERT: u32 = BRISC | TRISCS | NCRISC;
    /// Releases BRISC only, the other cores are started by it.
    pub const DEASSERT: u32 = NCRISC | TRISCS | STAGGERED_START;
}

/// Windows shared by every access that does not fit a static window.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DynamicTlb {
    LargeRead,
    LargeWrite,
    SmallReadWrite,
    Reg,
}

impl DynamicTlb {
    pub fn index(&self) -> u32 {
        match self {
            DynamicTlb::LargeWrite => tlb::TLB_BASE_INDEX_16M + 17,
            DynamicTlb::LargeRead => tlb::TLB_BASE_INDEX_16M + 18,
            DynamicTlb::Reg => tlb::TLB_BASE_INDEX_16M + 19,
            DynamicTlb::SmallReadWrite => tlb::TLB_BASE_INDEX_2M + 1,
        }
    }

    /// Name of the mutex guarding the window.
    pub fn name(&self) -> &'static str {
        match self {
            DynamicTlb::LargeRead => mutex::LARGE_READ_TLB,
            DynamicTlb::LargeWrite => mutex::LARGE_WRITE_TLB,
            DynamicTlb::SmallReadWrite => mutex::SMALL_READ_WRITE_TLB,
            DynamicTlb::Reg => mutex::REG_TLB,
        }
    }
}

/// Index of the 1M window that is pinned to core `x`-`y`, if it has one.
///
/// DRAM cores and anything outside the tensix and ethernet grid have none.
pub fn static_tlb_index(soc: &SocDescriptor, x: u8, y: u8) -> Option<u32> {
    match soc.arch {
        Arch::Grayskull => {
            if soc.dram.iter().flatten().any(|core| *core == (x, y)) {
                return None;
            }

            let flat = y as u32 * soc.grid_size.0 as u32 + x as u32;
            (flat != 0 && flat < tlb::TLB_COUNT_1M).then_some(flat)
        }
        Arch::Wormhole | Arch::WormholeB0 => {
            // Column 5 holds DRAM and is skipped.
            let compact_x = |x: u8| (if x >= 5 { x - 2 } else { x - 1 }) as u32;

            if soc.is_eth(x, y) {
                let row = if y == 6 { 1 } else { 0 };
                Some(row * 8 + compact_x(x))
            } else if soc.is_worker_location(x, y) {
                let row = (if y >= 6 { y - 2 } else { y - 1 }) as u32;
                Some(soc.eth.len() as u32 + row * 8 + compact_x(x))
            } else {
                None
            }
        }
    }
}

#[derive(Clone, Debug)]
pub struct DeviceConfig {
    /// Directory holding the named mutex files.
    pub mutex_dir: PathBuf,
    pub relay: RelayConfig,
    /// Host memory channels mapped per MMIO chip, one on grayskull and four on wormhole by
    /// default.
    pub sysmem_channels: Option<usize>,
    /// How long to wait on ARC messages sent while opening and closing.
    pub arc_timeout: Duration,
    /// Fused harvesting word to use instead of asking the ARC on grayskull.
    pub harvesting_override: Option<u32>,
    /// Pin a 1M window to every tensix and ethernet core at open. Ethernet cores used by the
    /// relay are pinned either way.
    pub static_tlbs: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            mutex_dir: PathBuf::from(mutex::DEFAULT_MUTEX_DIR),
            relay: RelayConfig::default(),
            sysmem_channels: None,
            arc_timeout: Duration::from_secs(1),
            harvesting_override: harvesting::harvesting_override(),
            static_tlbs: true,
        }
    }
}

fn default_sysmem_channels(arch: Arch) -> usize {
    match arch {
        Arch::Grayskull => 1,
        Arch::Wormhole | Arch::WormholeB0 => 4,
    }
}

struct ChipInfo {
    soc: SocDescriptor,
    translation: Translation,
    // Rows trimmed off the bottom of the reset broadcast rectangle.
    num_rows_harvested: u8,
}

/// A window pinned to one core, the device range it covers never changes after open.
#[derive(Clone, Copy, Debug)]
struct StaticWindow {
    bar_base: u64,
    start: u64,
    end: u64,
}

struct MmioChip {
    pci_id: usize,
    bar: Mutex<Box<dyn BarIo + Send>>,
    static_tlbs: HashMap<u32, StaticWindow>,
    mutexes: HashMap<&'static str, NamedMutex>,
    relay: Option<RelayEngine>,
}

impl MmioChip {
    // Only held for single BAR operations, never while waiting on another lock.
    fn bar(&self) -> MutexGuard<'_, Box<dyn BarIo + Send>> {
        self.bar.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock(&self, name: &'static str) -> Result<NamedMutexGuard<'_>, DeviceError> {
        match self.mutexes.get(name) {
            Some(mutex) => mutex.lock(),
            None => Err(DeviceError::Descriptor(format!(
                "no mutex named {name} for pci device {}",
                self.pci_id
            ))),
        }
    }

    /// BAR offset of `addr` if `[addr, addr + len)` lies inside the static window of `x`-`y`.
    fn static_window(&self, soc: &SocDescriptor, x: u8, y: u8, addr: u64, len: usize) -> Option<u64> {
        let index = static_tlb_index(soc, x, y)?;
        let window = self.static_tlbs.get(&index)?;

        let end = addr.checked_add(len as u64)?;
        (addr >= window.start && end <= window.end).then(|| window.bar_base + (addr - window.start))
    }
}

/// Relay core access on an MMIO chip.
struct RelayIo<'a> {
    mmio: &'a MmioChip,
    info: &'a ChipInfo,
}

impl RelayIo<'_> {
    /// BAR offset of `[addr, addr + len)` on ethernet core `core` through its pinned window.
    fn pinned(&self, (x, y): EthCore, addr: u64, len: usize) -> Result<u64, PciError> {
        self.mmio
            .static_window(&self.info.soc, x, y, addr, len)
            .ok_or(PciError::Unpinned { x, y, addr, len })
    }
}

impl EthCoreIo for RelayIo<'_> {
    // Relay callers hold NON_MMIO, taking a dynamic window's mutex here would nest the two.
    fn read_core(&mut self, core: EthCore, addr: u64, data: &mut [u8]) -> Result<(), PciError> {
        let offset = self.pinned(core, addr, data.len())?;
        self.mmio.bar().read_block(offset as u32, data)
    }

    fn write_core(&mut self, core: EthCore, addr: u64, data: &[u8]) -> Result<(), PciError> {
        let offset = self.pinned(core, addr, data.len())?;
        self.mmio.bar().write_block(offset as u32, data)
    }

    fn sysmem_write(&mut self, channel: usize, addr: u64, data: &[u8]) -> Result<(), PciError> {
        self.mmio.bar().sysmem_write(channel, addr, data)
    }

    fn sysmem_read(&mut self, channel: usize, addr: u64, data: &mut [u8]) -> Result<(), PciError> {
        self.mmio.bar().sysmem_read(channel, addr, data)
    }
}

struct MmioArc<'a> {
    mmio: &'a MmioChip,
}

impl ArcComms for MmioArc<'_> {
    fn arc_read32(&mut self, addr: u64) -> Result<u32, DeviceError> {
        Ok(self.mmio.bar().read32(addr as u32)?)
    }

    fn arc_write32(&mut self, addr: u64, value: u32) -> Result<(), DeviceError> {
        Ok(self.mmio.bar().write32(addr as u32, value)?)
    }
}

struct RemoteArc<'a> {
    device: &'a Device,
    chip: ChipId,
    arc: soc::Core,
}

impl ArcComms for RemoteArc<'_> {
    fn arc_read32(&mut self, addr: u64) -> Result<u32, DeviceError> {
        let mut value = [0u8; 4];
        self.device
            .remote_read(self.chip, self.arc.0, self.arc.1, addr, &mut value)?;
        Ok(u32::from_le_bytes(value))
    }

    fn arc_write32(&mut self, addr: u64, value: u32) -> Result<(), DeviceError> {
        self.device
            .remote_write(self.chip, self.arc.0, self.arc.1, addr, &value.to_le_bytes())
    }

    fn arc_barrier(&mut self) -> Result<(), DeviceError> {
        self.device.flush_relay(self.chip)
    }
}

pub struct Device {
    arch: Arch,
    config: DeviceConfig,
    cluster: ClusterDescriptor,
    targets: BTreeSet<ChipId>,
    chips: BTreeMap<ChipId, ChipInfo>,
    mmio: BTreeMap<ChipId, MmioChip>,
}

impl Device {
    /// Open the chips in `targets` along with the MMIO chips needed to reach them.
    pub fn open(
        arch: Arch,
        cluster: ClusterDescriptor,
        targets: &[ChipId],
        config: DeviceConfig,
    ) -> Result<Self, DeviceError> {
        let mut devices: Vec<(ChipId, Box<dyn BarIo + Send>)> = vec![];
        for chip in Self::needed_mmio_chips(&cluster, targets)? {
            let interface = cluster
                .pci_interface(chip)
                .ok_or(DeviceError::NoMmioPath(chip))?;

            let mut device = PciDevice::open(interface)?;
            device.init_sysmem(
                config
                    .sysmem_channels
                    .unwrap_or_else(|| default_sysmem_channels(arch)),
            )?;
            tracing::info!(
                "Opened pci device {interface} as chip {chip} with {} host memory channels",
                device.sysmem_channels()
            );

            let device: Box<dyn BarIo + Send> = Box::new(device);
            devices.push((chip, device));
        }

        Self::with_devices(arch, cluster, targets, devices, config)
    }

    fn needed_mmio_chips(
        cluster: &ClusterDescriptor,
        targets: &[ChipId],
    ) -> Result<BTreeSet<ChipId>, DeviceError> {
        let mut needed = BTreeSet::new();
        for &chip in targets {
            if !cluster.contains(chip) {
                return Err(DeviceError::ChipNotFound(chip));
            }

            if cluster.is_chip_mmio_capable(chip) {
                needed.insert(chip);
            } else {
                needed.insert(
                    cluster
                        .closest_mmio_chip(chip)
                        .ok_or(DeviceError::NoMmioPath(chip))?,
                );
            }
        }

        Ok(needed)
    }

    /// Bring up a cluster on already opened BARs, one per MMIO chip.
    pub fn with_devices(
        arch: Arch,
        cluster: ClusterDescriptor,
        targets: &[ChipId],
        devices: Vec<(ChipId, Box<dyn BarIo + Send>)>,
        config: DeviceConfig,
    ) -> Result<Self, DeviceError> {
        let needed = Self::needed_mmio_chips(&cluster, targets)?;

        let mut mmio = BTreeMap::new();
        for (chip, bar) in devices {
            let pci_id = bar.id();
            if bar.arch().is_wormhole() != arch.is_wormhole() {
                return Err(DeviceError::ArchMismatch {
                    chip,
                    expected: arch,
                    found: bar.arch(),
                });
            }

            let mut mutexes = HashMap::new();
            for name in mutex::ALL {
                mutexes.insert(name, NamedMutex::open(&config.mutex_dir, name, pci_id)?);
            }

            mmio.insert(
                chip,
                MmioChip {
                    pci_id,
                    bar: Mutex::new(bar),
                    static_tlbs: HashMap::new(),
                    mutexes,
                    relay: None,
                },
            );
        }

        if let Some(chip) = needed.iter().find(|chip| !mmio.contains_key(*chip)) {
            return Err(DeviceError::NoMmioPath(*chip));
        }

        let mut device = Device {
            arch,
            config,
            cluster,
            targets: targets.iter().copied().collect(),
            chips: BTreeMap::new(),
            mmio,
        };

        for chip in device.targets.iter().chain(needed.iter()) {
            if let Some(found) = device.cluster.arch(*chip) {
                if found.is_wormhole() != arch.is_wormhole() {
                    return Err(DeviceError::ArchMismatch {
                        chip: *chip,
                        expected: arch,
                        found,
                    });
                }
            }
        }

        let bring_up = device
            .targets
            .union(&needed)
            .copied()
            .collect::<BTreeSet<_>>();
        device.chips = device.bring_up(&bring_up)?;

        device.init_mmio_chips()?;

        Ok(device)
    }

    /// Work out harvesting and coordinate translation of every chip.
    fn bring_up(&self, chips: &BTreeSet<ChipId>) -> Result<BTreeMap<ChipId, ChipInfo>, DeviceError> {
        let mut infos = BTreeMap::new();

        if self.arch.is_wormhole() {
            let mut translation_enabled = None;
            for chip in chips {
                let enabled = self
                    .cluster
                    .harvesting(*chip)
                    .map(|harvesting| harvesting.noc_translation)
                    .unwrap_or(false);
                match translation_enabled {
                    Some(previous) if previous != enabled => {
                        return Err(DeviceError::InconsistentTranslation)
                    }
                    _ => translation_enabled = Some(enabled),
                }
            }
            let translation_enabled = translation_enabled.unwrap_or(false);

            for &chip in chips {
                let mask = self
                    .cluster
                    .harvesting(chip)
                    .map(|harvesting| harvesting.harvest_mask)
                    .unwrap_or(0);
                let rows = harvesting::harvested_rows(self.arch, mask);
                let soc = SocDescriptor::new(self.arch).with_harvested_rows(&rows);
                let translation = if translation_enabled {
                    Translation::wormhole(&soc)
                } else {
                    Translation::identity(&soc)
                };

                tracing::debug!("chip {chip}: harvested rows {rows:?}");
                infos.insert(
                    chip,
                    ChipInfo {
                        soc,
                        translation,
                        num_rows_harvested: mask.count_ones() as u8,
                    },
                );
            }
        } else {
            for &chip in chips {
                let raw = match self.config.harvesting_override {
                    Some(raw) => raw,
                    None => {
                        let mmio = self.mmio.get(&chip).ok_or(DeviceError::NoMmioPath(chip))?;
                        let _lock = mmio.lock(mutex::ARC_MSG)?;
                        arc::arc_msg(
                            &mut MmioArc { mmio },
                            chip,
                            &ArcMsg::GetHarvesting,
                            true,
                            self.config.arc_timeout,
                            &ArcMsgAddr::MMIO,
                        )?
                        .return_3
                    }
                };
                let rows = harvesting::harvested_rows(self.arch, harvesting::row_mask(raw));
                let soc = SocDescriptor::new(self.arch).with_harvested_rows(&rows);

                tracing::debug!("chip {chip}: harvested rows {rows:?}");
                infos.insert(
                    chip,
                    ChipInfo {
                        translation: Translation::identity(&soc),
                        soc,
                        num_rows_harvested: 0,
                    },
                );
            }
        }

        Ok(infos)
    }

    fn init_mmio_chips(&mut self) -> Result<(), DeviceError> {
        let static_tlbs = self.config.static_tlbs;
        for (chip, mmio) in self.mmio.iter_mut() {
            let info = self.chips.get(chip).ok_or(DeviceError::ChipNotFound(*chip))?;

            let relay = self.arch.is_wormhole() && info.soc.eth.len() >= RELAY_CORES;
            // The relay reaches ethernet cores through their pinned windows only.
            let workers = info.soc.workers.iter().filter(|_| static_tlbs);
            let eth = info.soc.eth.iter().filter(|_| static_tlbs || relay);

            {
                let bar = mmio.bar.get_mut().unwrap_or_else(PoisonError::into_inner);
                for &(x, y) in workers.chain(eth) {
                    let Some(index) = static_tlb_index(&info.soc, x, y) else {
                        continue;
                    };
                    let (tx, ty) = info
                        .translation
                        .translate(x, y)
                        .ok_or(DeviceError::UntranslatedCore { chip: *chip, x, y })?;

                    tlb::setup_tlb(bar.as_mut(), index, Tlb::unicast(tx, ty, 0, true))?;
                    let window = tlb::window(index)?;
                    mmio.static_tlbs.insert(
                        index,
                        StaticWindow {
                            bar_base: window.bar_base,
                            start: 0,
                            end: window.size,
                        },
                    );
                }
                tracing::debug!(
                    "chip {chip}: pinned {} static windows",
                    mmio.static_tlbs.len()
                );
            }

            if relay {
                mmio.relay = Some(RelayEngine::new(&info.soc.eth, self.config.relay.clone())?);
            }
        }

        Ok(())
    }

    pub fn arch(&self) -> Arch {
        self.arch
    }

    pub fn cluster(&self) -> &ClusterDescriptor {
        &self.cluster
    }

    /// The chips this device was opened for.
    pub fn target_devices(&self) -> impl Iterator<Item = ChipId> + '_ {
        self.targets.iter().copied()
    }

    pub fn is_mmio(&self, chip: ChipId) -> bool {
        self.mmio.contains_key(&chip)
    }

    pub fn soc_descriptor(&self, chip: ChipId) -> Result<&SocDescriptor, DeviceError> {
        Ok(&self.chip(chip)?.soc)
    }

    /// The logical to NOC translation of `chip` as `{ (x,y) : (x,y), ... }`.
    pub fn harvesting_translation(&self, chip: ChipId) -> Result<String, DeviceError> {
        Ok(self.chip(chip)?.translation.describe())
    }

    fn chip(&self, chip: ChipId) -> Result<&ChipInfo, DeviceError> {
        self.chips.get(&chip).ok_or(DeviceError::ChipNotFound(chip))
    }

    fn mmio_chip(&self, chip: ChipId) -> Result<&MmioChip, DeviceError> {
        self.mmio.get(&chip).ok_or(DeviceError::NotMmio(chip))
    }

    fn translate(&self, chip: ChipId, x: u8, y: u8) -> Result<(u8, u8), DeviceError> {
        self.chip(chip)?
            .translation
            .translate(x, y)
            .ok_or(DeviceError::UntranslatedCore { chip, x, y })
    }

    /// The MMIO chip, with its relay engine and bring-up info, that serves remote `chip`.
    fn relay_for(&self, chip: ChipId) -> Result<(&MmioChip, &ChipInfo, &RelayEngine), DeviceError> {
        let mmio_chip = self
            .cluster
            .closest_mmio_chip(chip)
            .ok_or(DeviceError::NoMmioPath(chip))?;
        let mmio = self
            .mmio
            .get(&mmio_chip)
            .ok_or(DeviceError::NoMmioPath(chip))?;
        let relay = mmio.relay.as_ref().ok_or(DeviceError::NoMmioPath(chip))?;

        Ok((mmio, self.chip(mmio_chip)?, relay))
    }

    /// Word aligned `[start, end)` around `[addr, addr + len)` on remote `chip`.
    fn remote_span(chip: ChipId, addr: u64, len: usize) -> Result<(u64, u64), DeviceError> {
        let end = addr
            .checked_add(len as u64)
            .and_then(|end| end.checked_add(3))
            .map(|end| end & !3)
            .filter(|end| *end <= 1 << RemoteAddr::OFFSET_BITS)
            .ok_or(DeviceError::AddressOverflow { chip, addr, len })?;

        Ok((addr & !3, end))
    }

    fn remote_addr(&self, chip: ChipId, x: u8, y: u8, addr: u64) -> Result<RemoteAddr, DeviceError> {
        let (x, y) = self.translate(chip, x, y)?;
        Ok(RemoteAddr::new(self.cluster.location(chip), x, y, addr))
    }

    pub fn write_to_device(
        &self,
        chip: ChipId,
        x: u8,
        y: u8,
        addr: u64,
        data: &[u8],
        tlb: DynamicTlb,
    ) -> Result<(), DeviceError> {
        self.chip(chip)?;
        dbd_pci::checked_end(addr, data.len())?;
        if data.is_empty() {
            return Ok(());
        }

        if self.is_mmio(chip) {
            self.mmio_write(chip, x, y, addr, data, tlb)
        } else {
            self.remote_write(chip, x, y, addr, data)
        }
    }

    pub fn read_from_device(
        &self,
        chip: ChipId,
        x: u8,
        y: u8,
        addr: u64,
        data: &mut [u8],
        tlb: DynamicTlb,
    ) -> Result<(), DeviceError> {
        self.chip(chip)?;
        dbd_pci::checked_end(addr, data.len())?;
        if data.is_empty() {
            return Ok(());
        }

        if self.is_mmio(chip) {
            self.mmio_read(chip, x, y, addr, data, tlb)
        } else {
            self.remote_read(chip, x, y, addr, data)
        }
    }

    fn mmio_write(
        &self,
        chip: ChipId,
        x: u8,
        y: u8,
        addr: u64,
        data: &[u8],
        tlb: DynamicTlb,
    ) -> Result<(), DeviceError> {
        let mmio = self.mmio_chip(chip)?;
        let info = self.chip(chip)?;

        if let Some(offset) = mmio.static_window(&info.soc, x, y, addr, data.len()) {
            mmio.bar().write_block(offset as u32, data)?;
            return Ok(());
        }

        let (tx, ty) = self.translate(chip, x, y)?;
        let _lock = mmio.lock(tlb.name())?;
        dbd_pci::noc_write(
            mmio.bar().as_mut(),
            tlb.index(),
            Tlb::unicast(tx, ty, addr, true),
            data,
        )?;

        Ok(())
    }

    fn mmio_read(
        &self,
        chip: ChipId,
        x: u8,
        y: u8,
        addr: u64,
        data: &mut [u8],
        tlb: DynamicTlb,
    ) -> Result<(), DeviceError> {
        let mmio = self.mmio_chip(chip)?;
        let info = self.chip(chip)?;

        if let Some(offset) = mmio.static_window(&info.soc, x, y, addr, data.len()) {
            mmio.bar().read_block(offset as u32, data)?;
            return Ok(());
        }

        let (tx, ty) = self.translate(chip, x, y)?;
        let _lock = mmio.lock(tlb.name())?;
        dbd_pci::noc_read(
            mmio.bar().as_mut(),
            tlb.index(),
            Tlb::unicast(tx, ty, addr, true),
            data,
        )?;

        Ok(())
    }

    /// The relay moves whole words, partial words at either end are read and merged first.
    fn remote_write(
        &self,
        chip: ChipId,
        x: u8,
        y: u8,
        addr: u64,
        data: &[u8],
    ) -> Result<(), DeviceError> {
        let (mmio, info, relay) = self.relay_for(chip)?;
        let mut io = RelayIo { mmio, info };

        let (start, end) = Self::remote_span(chip, addr, data.len())?;
        let base = self.remote_addr(chip, x, y, start)?;

        let _lock = mmio.lock(mutex::NON_MMIO)?;
        if start == addr && end - start == data.len() as u64 {
            relay.write(&mut io, base, data)?;
        } else {
            let mut words = vec![0u8; (end - start) as usize];
            let last = words.len() - 4;
            relay.read(&mut io, base, &mut words[..4])?;
            if last > 0 {
                relay.read(&mut io, base.add(last as u64), &mut words[last..])?;
            }

            let head = (addr - start) as usize;
            words[head..head + data.len()].copy_from_slice(data);
            relay.write(&mut io, base, &words)?;
        }

        Ok(())
    }

    fn remote_read(
        &self,
        chip: ChipId,
        x: u8,
        y: u8,
        addr: u64,
        data: &mut [u8],
    ) -> Result<(), DeviceError> {
        let (mmio, info, relay) = self.relay_for(chip)?;
        let mut io = RelayIo { mmio, info };

        let (start, end) = Self::remote_span(chip, addr, data.len())?;
        let base = self.remote_addr(chip, x, y, start)?;

        let _lock = mmio.lock(mutex::NON_MMIO)?;
        if start == addr && end - start == data.len() as u64 {
            relay.read(&mut io, base, data)?;
        } else {
            let mut words = vec![0u8; (end - start) as usize];
            relay.read(&mut io, base, &mut words)?;

            let head = (addr - start) as usize;
            data.copy_from_slice(&words[head..head + data.len()]);
        }

        Ok(())
    }

    /// Write one epoch command block. Remote chips use the dedicated epoch relay cores which
    /// only publish their write pointer when `last` is set.
    pub fn write_epoch_cmd(
        &self,
        chip: ChipId,
        x: u8,
        y: u8,
        addr: u64,
        data: &[u8],
        last: bool,
    ) -> Result<(), DeviceError> {
        self.chip(chip)?;
        if self.is_mmio(chip) {
            return self.write_to_device(chip, x, y, addr, data, DynamicTlb::LargeWrite);
        }

        Self::remote_span(chip, addr, data.len())?;
        let (mmio, info, relay) = self.relay_for(chip)?;
        let dest = self.remote_addr(chip, x, y, addr)?;
        relay.write_epoch(&mut RelayIo { mmio, info }, dest, data, last)?;

        Ok(())
    }

    /// Write `unroll_count` copies of `block` back to back from `addr`, the first word of each
    /// copy replaced by its index.
    pub fn rolled_write(
        &self,
        chip: ChipId,
        x: u8,
        y: u8,
        addr: u64,
        block: &[u8],
        unroll_count: u32,
    ) -> Result<(), DeviceError> {
        self.chip(chip)?;
        let len = block
            .len()
            .checked_mul(unroll_count as usize)
            .ok_or(PciError::AddressOverflow {
                addr,
                len: usize::MAX,
            })?;
        dbd_pci::checked_end(addr, len)?;

        if self.is_mmio(chip) {
            let mut copy = block.to_vec();
            for i in 0..unroll_count {
                if copy.len() >= 4 {
                    copy[..4].copy_from_slice(&i.to_le_bytes());
                }
                self.mmio_write(
                    chip,
                    x,
                    y,
                    addr + i as u64 * block.len() as u64,
                    &copy,
                    DynamicTlb::LargeWrite,
                )?;
            }
            return Ok(());
        }

        Self::remote_span(chip, addr, len)?;
        let (mmio, info, relay) = self.relay_for(chip)?;
        let dest = self.remote_addr(chip, x, y, addr)?;
        let _lock = mmio.lock(mutex::NON_MMIO)?;
        relay.rolled_write(&mut RelayIo { mmio, info }, dest, block, unroll_count)?;

        Ok(())
    }

    pub fn write_to_sysmem(
        &self,
        chip: ChipId,
        channel: usize,
        addr: u64,
        data: &[u8],
    ) -> Result<(), DeviceError> {
        self.chip(chip)?;
        self.mmio_chip(chip)?
            .bar()
            .sysmem_write(channel, addr, data)?;

        Ok(())
    }

    pub fn read_from_sysmem(
        &self,
        chip: ChipId,
        channel: usize,
        addr: u64,
        data: &mut [u8],
    ) -> Result<(), DeviceError> {
        self.chip(chip)?;
        self.mmio_chip(chip)?
            .bar()
            .sysmem_read(channel, addr, data)?;

        Ok(())
    }

    fn flush_relay(&self, chip: ChipId) -> Result<(), DeviceError> {
        let (mmio, info, relay) = self.relay_for(chip)?;
        relay.flush(&mut RelayIo { mmio, info })?;

        Ok(())
    }

    /// Wait until every write posted to a remote chip has landed.
    pub fn wait_for_non_mmio_flush(&self) -> Result<(), DeviceError> {
        for (chip, mmio) in &self.mmio {
            if let Some(relay) = mmio.relay.as_ref() {
                relay.flush(&mut RelayIo {
                    mmio,
                    info: self.chip(*chip)?,
                })?;
            }
        }

        Ok(())
    }

    pub fn arc_msg(
        &self,
        chip: ChipId,
        msg: &ArcMsg,
        wait_for_done: bool,
        timeout: Duration,
    ) -> Result<ArcMsgOk, DeviceError> {
        let info = self.chip(chip)?;

        if let Some(mmio) = self.mmio.get(&chip) {
            let _lock = mmio.lock(mutex::ARC_MSG)?;
            arc::arc_msg(
                &mut MmioArc { mmio },
                chip,
                msg,
                wait_for_done,
                timeout,
                &ArcMsgAddr::MMIO,
            )
        } else {
            let arc = info
                .soc
                .arc
                .first()
                .copied()
                .ok_or(DeviceError::Descriptor(format!("chip {chip} has no ARC core")))?;
            arc::arc_msg(
                &mut RemoteArc {
                    device: self,
                    chip,
                    arc,
                },
                chip,
                msg,
                wait_for_done,
                timeout,
                &ArcMsgAddr::REMOTE,
            )
        }
    }

    pub fn set_power_state(&self, state: PowerState) -> Result<(), DeviceError> {
        for chip in self.targets.iter().copied() {
            let result = self.arc_msg(
                chip,
                &ArcMsg::SetPowerState(state),
                true,
                self.config.arc_timeout,
            )?;
            if result.exit_code != 0 {
                return Err(DeviceError::PowerState {
                    state,
                    code: result.exit_code,
                });
            }
        }

        Ok(())
    }

    pub fn assert_risc_reset(&self) -> Result<(), DeviceError> {
        self.broadcast_tensix_risc_reset(soft_reset::ASSERT)
    }

    pub fn deassert_risc_reset(&self) -> Result<(), DeviceError> {
        self.broadcast_tensix_risc_reset(soft_reset::DEASSERT)
    }

    fn broadcast_tensix_risc_reset(&self, value: u32) -> Result<(), DeviceError> {
        let value = value & soft_reset::ALL_TENSIX;

        for chip in self.targets.iter().copied() {
            let info = self.chip(chip)?;

            if let Some(mmio) = self.mmio.get(&chip) {
                let (size_x, size_y) = info.soc.grid_size;
                let start = self.translate(chip, 0, 0)?;
                let end = self.translate(
                    chip,
                    size_x - 1,
                    size_y - 1 - info.num_rows_harvested,
                )?;

                let tlb = DynamicTlb::Reg;
                let _lock = mmio.lock(tlb.name())?;
                dbd_pci::noc_write32(
                    mmio.bar().as_mut(),
                    tlb.index(),
                    Tlb::multicast(start, end, TENSIX_SOFT_RESET_ADDR, true),
                    value,
                )?;
            } else {
                for &(x, y) in &info.soc.workers {
                    self.remote_write(chip, x, y, TENSIX_SOFT_RESET_ADDR, &value.to_le_bytes())?;
                }
            }
        }

        self.wait_for_non_mmio_flush()
    }

    pub fn bar_read32(&self, chip: ChipId, addr: u32) -> Result<u32, DeviceError> {
        Ok(self.mmio_chip(chip)?.bar().read32(addr)?)
    }

    pub fn bar_write32(&self, chip: ChipId, addr: u32, value: u32) -> Result<(), DeviceError> {
        Ok(self.mmio_chip(chip)?.bar().write32(addr, value)?)
    }

    /// Idle the chips, hold their cores in reset and remove the mutex files.
    pub fn close_device(&self) -> Result<(), DeviceError> {
        let result = self
            .set_power_state(PowerState::LongIdle)
            .and_then(|_| self.assert_risc_reset());

        for mmio in self.mmio.values() {
            for mutex in mmio.mutexes.values() {
                if let Err(err) = mutex.remove() {
                    tracing::warn!("{err}");
                }
            }
        }

        result
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use dbd_pci::fake::{BarEvent, FakeBar};
    use dbd_relay::queue::{self, RoutingCmd};

    use super::*;

    /// A fake the test keeps a handle on after the device took ownership.
    #[derive(Clone)]
    struct SharedBar(Arc<Mutex<FakeBar>>);

    impl SharedBar {
        fn with<T>(&self, f: impl FnOnce(&mut FakeBar) -> T) -> T {
            f(&mut self.0.lock().unwrap())
        }
    }

    impl BarIo for SharedBar {
        fn id(&self) -> usize {
            self.0.lock().unwrap().id()
        }

        fn arch(&self) -> Arch {
            self.0.lock().unwrap().arch()
        }

        fn read32(&mut self, addr: u32) -> Result<u32, PciError> {
            self.with(|bar| bar.read32(addr))
        }

        fn write32(&mut self, addr: u32, value: u32) -> Result<(), PciError> {
            self.with(|bar| bar.write32(addr, value))
        }

        fn write_tlb_reg(&mut self, addr: u32, value: u64) -> Result<(), PciError> {
            self.with(|bar| bar.write_tlb_reg(addr, value))
        }

        fn write_block(&mut self, addr: u32, data: &[u8]) -> Result<(), PciError> {
            self.with(|bar| bar.write_block(addr, data))
        }

        fn read_block(&mut self, addr: u32, data: &mut [u8]) -> Result<(), PciError> {
            self.with(|bar| bar.read_block(addr, data))
        }

        fn sysmem_write(&mut self, channel: usize, addr: u64, data: &[u8]) -> Result<(), PciError> {
            self.with(|bar| bar.sysmem_write(channel, addr, data))
        }

        fn sysmem_read(&mut self, channel: usize, addr: u64, data: &mut [u8]) -> Result<(), PciError> {
            self.with(|bar| bar.sysmem_read(channel, addr, data))
        }
    }

    const SCRATCH_5: u32 = 0x1FF3_0060 + 20;
    const SCRATCH_3: u32 = 0x1FF3_0060 + 12;
    const MISC_CNTL: u32 = 0x1FF3_0100;

    fn config(dir: &tempfile::TempDir) -> DeviceConfig {
        DeviceConfig {
            mutex_dir: dir.path().to_path_buf(),
            relay: RelayConfig {
                timeout: Some(Duration::from_millis(50)),
            },
            arc_timeout: Duration::from_millis(200),
            harvesting_override: Some(0),
            ..Default::default()
        }
    }

    /// Firmware that acknowledges every message and answers `return_3`.
    fn with_arc(mut bar: FakeBar, return_3: u32) -> FakeBar {
        let mut code = 0;
        bar.on_write32(move |addr, value| {
            if addr == SCRATCH_5 {
                code = value;
            }
            if addr == MISC_CNTL && value & (1 << 16) != 0 {
                vec![
                    (SCRATCH_5, code & 0xff),
                    (SCRATCH_3, return_3),
                    (MISC_CNTL, value & !(1 << 16)),
                ]
            } else {
                vec![]
            }
        });
        bar
    }

    fn open(arch: Arch, bar: FakeBar, config: DeviceConfig) -> (Device, SharedBar) {
        open_cluster(arch, ClusterDescriptor::local(arch, &[bar.id()]), &[0], bar, config)
    }

    fn open_cluster(
        arch: Arch,
        cluster: ClusterDescriptor,
        targets: &[ChipId],
        bar: FakeBar,
        config: DeviceConfig,
    ) -> (Device, SharedBar) {
        let fake = SharedBar(Arc::new(Mutex::new(bar)));
        let bar: Box<dyn BarIo + Send> = Box::new(fake.clone());
        let device = Device::with_devices(arch, cluster, targets, vec![(0, bar)], config).unwrap();
        (device, fake)
    }

    const MESH: &str = "
arch: {0: wormhole_b0, 1: wormhole_b0}
chips: {0: [0,0,0,0], 1: [1,0,0,0]}
ethernet_connections: [[{chip: 0, chan: 8}, {chip: 1, chan: 0}]]
chips_with_mmio: [0: 0]
";

    fn open_mesh(dir: &tempfile::TempDir) -> (Device, SharedBar) {
        open_cluster(
            Arch::WormholeB0,
            ClusterDescriptor::from_yaml(MESH).unwrap(),
            &[0, 1],
            FakeBar::new(Arch::WormholeB0, 0).with_sysmem(1, 1 << 16),
            config(dir),
        )
    }

    #[test]
    fn static_index_layout() {
        let wh = SocDescriptor::new(Arch::WormholeB0);
        assert_eq!(static_tlb_index(&wh, 1, 0), Some(0));
        assert_eq!(static_tlb_index(&wh, 9, 0), Some(7));
        assert_eq!(static_tlb_index(&wh, 4, 6), Some(11));
        assert_eq!(static_tlb_index(&wh, 1, 1), Some(16));
        assert_eq!(static_tlb_index(&wh, 9, 11), Some(95));
        assert_eq!(static_tlb_index(&wh, 5, 3), None);
        assert_eq!(static_tlb_index(&wh, 0, 10), None);

        let gs = SocDescriptor::new(Arch::Grayskull);
        assert_eq!(static_tlb_index(&gs, 1, 1), Some(14));
        assert_eq!(static_tlb_index(&gs, 12, 11), Some(155));
        assert_eq!(static_tlb_index(&gs, 0, 0), None);
        assert_eq!(static_tlb_index(&gs, 1, 0), None);

        assert_eq!(DynamicTlb::LargeWrite.index(), 183);
        assert_eq!(DynamicTlb::LargeRead.index(), 184);
        assert_eq!(DynamicTlb::Reg.index(), 185);
        assert_eq!(DynamicTlb::SmallReadWrite.index(), 157);

        assert_eq!(soft_reset::ASSERT, 0x47800);
        assert_eq!(soft_reset::DEASSERT, 0x8004_7000);
    }

    #[test]
    fn static_window_is_reused() {
        let dir = tempfile::tempdir().unwrap();
        let (device, fake) = open(Arch::WormholeB0, FakeBar::new(Arch::WormholeB0, 0), config(&dir));
        fake.with(|bar| bar.take_events());

        for value in [1u32, 2] {
            device
                .write_to_device(0, 1, 1, 0x100, &value.to_le_bytes(), DynamicTlb::SmallReadWrite)
                .unwrap();
        }

        let events = fake.with(|bar| bar.take_events());
        assert_eq!(events.len(), 2);
        assert!(events
            .iter()
            .all(|event| matches!(event, BarEvent::BlockWrite { len: 4, .. })));
        assert_eq!(fake.with(|bar| bar.noc_peek(1, 1, 0x100, 4)), [2, 0, 0, 0]);

        let mut value = [0u8; 4];
        device
            .read_from_device(0, 1, 1, 0x100, &mut value, DynamicTlb::SmallReadWrite)
            .unwrap();
        assert_eq!(value, [2, 0, 0, 0]);
    }

    #[test]
    fn dynamic_window_outside_static_range() {
        let dir = tempfile::tempdir().unwrap();
        let (device, fake) = open(Arch::WormholeB0, FakeBar::new(Arch::WormholeB0, 0), config(&dir));
        fake.with(|bar| bar.take_events());

        // Straddles the end of the 1M static window.
        let data = (0..64u8).collect::<Vec<_>>();
        device
            .write_to_device(0, 2, 2, (1 << 20) - 32, &data, DynamicTlb::LargeWrite)
            .unwrap();

        let config_addr = tlb::window(DynamicTlb::LargeWrite.index()).unwrap().config_addr;
        let events = fake.with(|bar| bar.take_events());
        assert!(events
            .iter()
            .any(|event| matches!(event, BarEvent::TlbConfig { addr, .. } if *addr == config_addr)));

        let mut readback = vec![0u8; 64];
        device
            .read_from_device(0, 2, 2, (1 << 20) - 32, &mut readback, DynamicTlb::LargeRead)
            .unwrap();
        assert_eq!(readback, data);

        // DRAM has no static window at all.
        device
            .write_to_device(0, 0, 0, 0x1000, &data, DynamicTlb::LargeWrite)
            .unwrap();
        assert_eq!(fake.with(|bar| bar.noc_peek(0, 0, 0x1000, 64)), data);
    }

    #[test]
    fn unknown_chip() {
        let dir = tempfile::tempdir().unwrap();
        let (device, _fake) = open(Arch::Grayskull, FakeBar::new(Arch::Grayskull, 0), config(&dir));

        assert!(matches!(
            device.write_to_device(3, 1, 1, 0, &[0; 4], DynamicTlb::LargeWrite),
            Err(DeviceError::ChipNotFound(3))
        ));
        assert!(matches!(
            device.read_from_device(0, 40, 40, 0, &mut [0; 4], DynamicTlb::LargeRead),
            Err(DeviceError::UntranslatedCore { x: 40, y: 40, .. })
        ));
    }

    #[test]
    fn grayskull_harvesting_from_arc() {
        let dir = tempfile::tempdir().unwrap();
        let config = DeviceConfig {
            harvesting_override: None,
            ..config(&dir)
        };
        let (device, _fake) = open(
            Arch::Grayskull,
            with_arc(FakeBar::new(Arch::Grayskull, 0), 1),
            config,
        );

        let soc = device.soc_descriptor(0).unwrap();
        assert_eq!(soc.harvested_workers.len(), 12);
        assert!(soc.harvested_workers.iter().all(|(_, y)| *y == 5));
        assert_eq!(soc.workers.len(), 108);
    }

    #[test]
    fn wormhole_translation_from_cluster() {
        let dir = tempfile::tempdir().unwrap();
        let cluster = ClusterDescriptor::from_yaml(
            "chips_with_mmio: [0]\nharvesting: {0: {noc_translation: true, harvest_mask: 1}}\n",
        )
        .unwrap();
        let (device, fake) = open_cluster(
            Arch::WormholeB0,
            cluster,
            &[0],
            FakeBar::new(Arch::WormholeB0, 0),
            config(&dir),
        );

        assert!(device
            .harvesting_translation(0)
            .unwrap()
            .contains("(1,1) : (18,18), "));
        assert_eq!(device.soc_descriptor(0).unwrap().workers.len(), 72);

        device
            .write_to_device(0, 1, 2, 0x40, &[1, 2, 3, 4], DynamicTlb::SmallReadWrite)
            .unwrap();
        assert_eq!(fake.with(|bar| bar.noc_peek(18, 19, 0x40, 4)), [1, 2, 3, 4]);
    }

    #[test]
    fn inconsistent_translation_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let cluster = ClusterDescriptor::from_yaml(
            "chips_with_mmio: [0]\nchips: {0: [0,0,0,0], 1: [1,0,0,0]}\nharvesting: {0: {noc_translation: true, harvest_mask: 0}, 1: {noc_translation: false, harvest_mask: 0}}\n",
        )
        .unwrap();

        let bar: Box<dyn BarIo + Send> = Box::new(FakeBar::new(Arch::WormholeB0, 0));
        let result =
            Device::with_devices(Arch::WormholeB0, cluster, &[0, 1], vec![(0, bar)], config(&dir));
        assert!(matches!(result, Err(DeviceError::InconsistentTranslation)));
    }

    #[test]
    fn remote_write_posts_relay_command() {
        let dir = tempfile::tempdir().unwrap();
        let (device, fake) = open_mesh(&dir);
        assert!(!device.is_mmio(1));

        let data = (0..64u8).collect::<Vec<_>>();
        device
            .write_to_device(1, 1, 1, 0x100, &data, DynamicTlb::LargeWrite)
            .unwrap();

        let (wptr, raw, staged) = fake.with(|bar| {
            (
                bar.noc_peek(9, 0, queue::REQUEST_WPTR_ADDR, 4),
                bar.noc_peek(9, 0, queue::request_slot_addr(0), 32),
                bar.noc_peek(9, 0, queue::ETH_ROUTING_DATA_BUFFER_ADDR, 64),
            )
        });
        assert_eq!(wptr, [1, 0, 0, 0]);
        assert_eq!(staged, data);

        let mut cmd = [0u8; 32];
        cmd.copy_from_slice(&raw);
        let cmd = RoutingCmd::from_bytes(&cmd);
        assert_eq!(
            cmd.sys_addr,
            RemoteAddr::new(device.cluster().location(1), 1, 1, 0x100).sys_addr()
        );
        assert_eq!(cmd.data, 64);
        assert_eq!(cmd.flags, queue::CMD_DATA_BLOCK | queue::CMD_WR_REQ);
    }

    #[test]
    fn remote_read_without_firmware_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let (device, _fake) = open_mesh(&dir);

        let mut data = [0u8; 8];
        let result = device.read_from_device(1, 1, 1, 0x100, &mut data, DynamicTlb::LargeRead);
        assert!(matches!(
            result,
            Err(DeviceError::Relay(dbd_relay::RelayError::Timeout(_)))
        ));

        // The failed read left nothing to flush.
        device.wait_for_non_mmio_flush().unwrap();
    }

    #[test]
    fn addresses_past_the_top_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (device, fake) = open_mesh(&dir);
        fake.with(|bar| bar.take_events());

        for chip in [0, 1] {
            assert!(matches!(
                device.write_to_device(
                    chip,
                    0,
                    0,
                    u64::MAX - 1,
                    &[1, 2, 3, 4],
                    DynamicTlb::LargeWrite
                ),
                Err(DeviceError::Pci(PciError::AddressOverflow { len: 4, .. }))
            ));
            assert!(matches!(
                device.read_from_device(
                    chip,
                    1,
                    1,
                    u64::MAX - 1,
                    &mut [0; 4],
                    DynamicTlb::LargeRead
                ),
                Err(DeviceError::Pci(PciError::AddressOverflow { len: 4, .. }))
            ));
            assert!(matches!(
                device.rolled_write(chip, 1, 1, u64::MAX - 8, &[0; 8], 2),
                Err(DeviceError::Pci(PciError::AddressOverflow { .. }))
            ));
        }

        // Remote offsets are 36 bits wide, rounding up to a word must stay inside.
        let top = 1u64 << RemoteAddr::OFFSET_BITS;
        assert!(matches!(
            device.write_to_device(1, 1, 1, top - 2, &[1, 2, 3], DynamicTlb::LargeWrite),
            Err(DeviceError::AddressOverflow { chip: 1, len: 3, .. })
        ));
        assert!(matches!(
            device.read_from_device(1, 1, 1, top, &mut [0; 4], DynamicTlb::LargeRead),
            Err(DeviceError::AddressOverflow { chip: 1, .. })
        ));
        assert!(matches!(
            device.write_epoch_cmd(1, 1, 1, top - 4, &[0; 8], true),
            Err(DeviceError::AddressOverflow { chip: 1, .. })
        ));

        // Nothing was sent to the device or queued for the relay.
        assert!(fake.with(|bar| bar.take_events()).is_empty());
        assert_eq!(
            fake.with(|bar| bar.noc_peek(9, 0, queue::REQUEST_WPTR_ADDR, 4)),
            [0, 0, 0, 0]
        );
    }

    #[test]
    fn relay_only_uses_pinned_windows() {
        let dir = tempfile::tempdir().unwrap();
        let config = DeviceConfig {
            static_tlbs: false,
            ..config(&dir)
        };
        let (device, fake) = open_cluster(
            Arch::WormholeB0,
            ClusterDescriptor::from_yaml(MESH).unwrap(),
            &[0, 1],
            FakeBar::new(Arch::WormholeB0, 0).with_sysmem(1, 1 << 16),
            config,
        );
        fake.with(|bar| bar.take_events());

        // Another process holding both dynamic windows must not stall the relay.
        let held = [mutex::LARGE_WRITE_TLB, mutex::LARGE_READ_TLB]
            .map(|name| NamedMutex::open(dir.path(), name, 0).unwrap());
        let _guards = held.iter().map(|mutex| mutex.lock().unwrap()).collect::<Vec<_>>();

        let (tx, rx) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            let result = device.write_to_device(1, 1, 1, 0x100, &[7; 64], DynamicTlb::LargeWrite);
            tx.send(result.map_err(|err| err.to_string())).unwrap();
        });
        rx.recv_timeout(Duration::from_secs(5))
            .expect("relay write blocked on a dynamic window")
            .unwrap();

        let dynamic = [DynamicTlb::LargeWrite, DynamicTlb::LargeRead]
            .map(|tlb| tlb::window(tlb.index()).unwrap().config_addr);
        assert!(!fake.with(|bar| bar.take_events()).iter().any(
            |event| matches!(event, BarEvent::TlbConfig { addr, .. } if dynamic.contains(addr))
        ));
        assert_eq!(
            fake.with(|bar| bar.noc_peek(9, 0, queue::REQUEST_WPTR_ADDR, 4)),
            [1, 0, 0, 0]
        );
    }

    #[test]
    fn relay_rejects_unpinned_core_ranges() {
        let dir = tempfile::tempdir().unwrap();
        let (device, _fake) = open_mesh(&dir);

        let mmio = device.mmio_chip(0).unwrap();
        let mut io = RelayIo {
            mmio,
            info: device.chip(0).unwrap(),
        };
        assert!(matches!(
            io.write_core((9, 0), (1 << 20) - 2, &[0; 4]),
            Err(PciError::Unpinned { x: 9, y: 0, len: 4, .. })
        ));
        let mut data = [0u8; 4];
        io.read_core((9, 0), 0x100, &mut data).unwrap();
    }

    #[test]
    fn sysmem_only_on_mmio_chips() {
        let dir = tempfile::tempdir().unwrap();
        let (device, _fake) = open_mesh(&dir);

        device.write_to_sysmem(0, 0, 0x40, &[9; 8]).unwrap();
        let mut data = [0u8; 8];
        device.read_from_sysmem(0, 0, 0x40, &mut data).unwrap();
        assert_eq!(data, [9; 8]);

        assert!(matches!(
            device.read_from_sysmem(1, 0, 0x40, &mut data),
            Err(DeviceError::NotMmio(1))
        ));
    }

    #[test]
    fn rolled_write_numbers_each_copy() {
        let dir = tempfile::tempdir().unwrap();
        let (device, fake) = open(Arch::WormholeB0, FakeBar::new(Arch::WormholeB0, 0), config(&dir));

        device.rolled_write(0, 2, 3, 0x200, &[0xff; 16], 3).unwrap();

        for i in 0..3u8 {
            let copy = fake.with(|bar| bar.noc_peek(2, 3, 0x200 + 16 * i as u64, 16));
            assert_eq!(copy[..4], [i, 0, 0, 0]);
            assert_eq!(copy[4..], [0xff; 12]);
        }
    }

    #[test]
    fn arc_message_through_bar() {
        let dir = tempfile::tempdir().unwrap();
        let (device, _fake) = open(
            Arch::WormholeB0,
            with_arc(FakeBar::new(Arch::WormholeB0, 0), 0x1234),
            config(&dir),
        );

        let result = device
            .arc_msg(0, &ArcMsg::Test { arg: 7 }, true, Duration::from_secs(1))
            .unwrap();
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.return_3, 0x1234);

        device.set_power_state(PowerState::Busy).unwrap();
    }

    #[test]
    fn broadcast_reset_reaches_workers() {
        let dir = tempfile::tempdir().unwrap();
        let (device, fake) = open(Arch::Grayskull, FakeBar::new(Arch::Grayskull, 0), config(&dir));

        device.assert_risc_reset().unwrap();
        for (x, y) in [(1, 1), (12, 11), (6, 5)] {
            assert_eq!(
                fake.with(|bar| bar.noc_peek(x, y, TENSIX_SOFT_RESET_ADDR, 4)),
                soft_reset::ASSERT.to_le_bytes()
            );
        }

        device.deassert_risc_reset().unwrap();
        assert_eq!(
            fake.with(|bar| bar.noc_peek(3, 3, TENSIX_SOFT_RESET_ADDR, 4)),
            soft_reset::DEASSERT.to_le_bytes()
        );
    }

    #[test]
    fn close_idles_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let (device, fake) = open(
            Arch::Grayskull,
            with_arc(FakeBar::new(Arch::Grayskull, 4), 0),
            config(&dir),
        );
        assert!(dir.path().join("NON_MMIO4").exists());

        device.close_device().unwrap();

        assert!(!dir.path().join("NON_MMIO4").exists());
        assert_eq!(
            fake.with(|bar| bar.reg_peek(SCRATCH_5)),
            0xaa54 & 0xff
        );
    }
}
