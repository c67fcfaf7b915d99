// SPDX-FileCopyrightText: © 2023 Tenstorrent Inc.
// SPDX-License-Identifier: Apache-2.0

//! Finds the devices on this machine and opens them for the debugger.
//!
//! Everything the debugger reads as a file (cluster map, per chip SoC descriptions) is written
//! to a temporary directory that lives as long as the backend.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use dbd_core::{Arch, ChipId};
use dbd_device::{ClusterDescriptor, Device, DeviceConfig, SocDescriptor};
use dbd_pci::PciDevice;
use tempfile::TempDir;

use super::{DebugImplementation, DebugResult, UmdImplementation};
use crate::ServerError;

pub const CREATE_ETHERNET_MAP: &str = "create-ethernet-map";

#[derive(Debug, Clone, Default)]
pub struct OpenOptions {
    /// Where `create-ethernet-map` lives, the directory of the running executable if unset.
    pub binary_directory: Option<PathBuf>,
    /// Served verbatim as the runtime data.
    pub runtime_yaml: Option<PathBuf>,
    /// Chips to open, all of them if empty.
    pub wanted_devices: Vec<ChipId>,
    pub device: DeviceConfig,
}

pub struct UmdWithOpen {
    umd: UmdImplementation,
    runtime_yaml: Option<PathBuf>,
    cluster_description: PathBuf,
    device_ids: Vec<ChipId>,
    soc_descriptions: BTreeMap<ChipId, PathBuf>,
    workdir: TempDir,
}

fn write_file(path: PathBuf, contents: &str) -> Result<PathBuf, ServerError> {
    match std::fs::write(&path, contents) {
        Ok(()) => Ok(path),
        Err(source) => Err(ServerError::Io { path, source }),
    }
}

fn detect_arch(interfaces: &[usize]) -> Result<Arch, ServerError> {
    let mut archs = interfaces
        .iter()
        .map(|&interface| PciDevice::open(interface).map(|device| device.arch));

    let arch = archs.next().ok_or(ServerError::NoDevices)??;
    for found in archs {
        if found? != arch {
            return Err(ServerError::MixedArch);
        }
    }

    Ok(arch)
}

fn executable_directory() -> Result<PathBuf, ServerError> {
    let exe = std::env::current_exe().map_err(|source| ServerError::Io {
        path: PathBuf::from("/proc/self/exe"),
        source,
    })?;

    Ok(exe.parent().map(Path::to_path_buf).unwrap_or_default())
}

/// Run `create-ethernet-map` to describe the cluster, returns the path of the description.
fn create_ethernet_map(binary_directory: &Path, workdir: &Path) -> Result<PathBuf, ServerError> {
    let tool = binary_directory.join(CREATE_ETHERNET_MAP);
    if !tool.exists() {
        return Err(ServerError::MissingEthernetMap(tool));
    }

    let output = workdir.join("cluster_desc.yaml");
    let status = Command::new(&tool)
        .arg(&output)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map_err(|source| ServerError::Io {
            path: tool.clone(),
            source,
        })?;

    if !status.success() {
        tracing::error!("{} exited with {status}", tool.display());
        return Err(ServerError::EthernetMapFailed);
    }

    Ok(output)
}

fn select_devices(available: &[ChipId], wanted: &[ChipId]) -> Result<Vec<ChipId>, ServerError> {
    if let Some(missing) = wanted.iter().find(|chip| !available.contains(chip)) {
        return Err(ServerError::DeviceUnavailable(*missing));
    }

    if wanted.is_empty() {
        Ok(available.to_vec())
    } else {
        Ok(wanted.to_vec())
    }
}

impl UmdWithOpen {
    pub fn open(options: OpenOptions) -> Result<Self, ServerError> {
        let interfaces = PciDevice::scan();
        if interfaces.is_empty() {
            return Err(ServerError::NoDevices);
        }
        let arch = detect_arch(&interfaces)?;
        tracing::info!("Found {} {arch} devices", interfaces.len());

        let workdir = tempfile::Builder::new()
            .prefix("debuda_server_")
            .tempdir()
            .map_err(|source| ServerError::Io {
                path: std::env::temp_dir(),
                source,
            })?;
        write_file(
            workdir.path().join("soc_descriptor.yaml"),
            &SocDescriptor::new(arch).to_yaml(),
        )?;

        let binary_directory = match options.binary_directory {
            Some(dir) => dir,
            None => executable_directory()?,
        };
        let cluster_description = create_ethernet_map(&binary_directory, workdir.path())?;

        // Grayskull has no ethernet, every chip is its own PCI device.
        let cluster = if arch.is_grayskull() {
            ClusterDescriptor::local(arch, &interfaces)
        } else {
            ClusterDescriptor::load(&cluster_description)?
        };

        let available = cluster.chips().collect::<Vec<_>>();
        let device_ids = select_devices(&available, &options.wanted_devices)?;

        let device = Device::open(arch, cluster, &device_ids, options.device)?;

        Self::with_device(
            device,
            workdir,
            cluster_description,
            device_ids,
            options.runtime_yaml,
        )
    }

    fn with_device(
        device: Device,
        workdir: TempDir,
        cluster_description: PathBuf,
        device_ids: Vec<ChipId>,
        runtime_yaml: Option<PathBuf>,
    ) -> Result<Self, ServerError> {
        let mut soc_descriptions = BTreeMap::new();
        for &chip in &device_ids {
            let path = write_file(
                workdir
                    .path()
                    .join(format!("device_desc_runtime_{chip}.yaml")),
                &device.soc_descriptor(chip)?.to_yaml(),
            )?;
            soc_descriptions.insert(chip, path);
        }

        Ok(Self {
            umd: UmdImplementation::new(device),
            runtime_yaml,
            cluster_description,
            device_ids,
            soc_descriptions,
            workdir,
        })
    }

    pub fn workdir(&self) -> &Path {
        self.workdir.path()
    }
}

impl DebugImplementation for UmdWithOpen {
    fn read4(&mut self, chip: ChipId, x: u8, y: u8, addr: u64) -> DebugResult<u32> {
        self.umd.read4(chip, x, y, addr)
    }

    fn write4(&mut self, chip: ChipId, x: u8, y: u8, addr: u64, data: u32) -> DebugResult<u32> {
        self.umd.write4(chip, x, y, addr, data)
    }

    fn read(&mut self, chip: ChipId, x: u8, y: u8, addr: u64, size: u32) -> DebugResult<Vec<u8>> {
        self.umd.read(chip, x, y, addr, size)
    }

    fn write(&mut self, chip: ChipId, x: u8, y: u8, addr: u64, data: &[u8]) -> DebugResult<u32> {
        self.umd.write(chip, x, y, addr, data)
    }

    fn read4_raw(&mut self, chip: ChipId, addr: u64) -> DebugResult<u32> {
        self.umd.read4_raw(chip, addr)
    }

    fn write4_raw(&mut self, chip: ChipId, addr: u64, data: u32) -> DebugResult<u32> {
        self.umd.write4_raw(chip, addr, data)
    }

    fn dma_buffer_read4(&mut self, chip: ChipId, addr: u64, channel: u16) -> DebugResult<u32> {
        self.umd.dma_buffer_read4(chip, addr, channel)
    }

    fn read_tile(
        &mut self,
        chip: ChipId,
        x: u8,
        y: u8,
        addr: u64,
        size: u32,
        data_format: u8,
    ) -> DebugResult<String> {
        self.umd.read_tile(chip, x, y, addr, size, data_format)
    }

    fn get_runtime_data(&mut self) -> DebugResult<String> {
        let Some(path) = self.runtime_yaml.as_ref() else {
            return Ok(None);
        };

        match std::fs::read_to_string(path) {
            Ok(text) => Ok(Some(text)),
            Err(err) => {
                tracing::warn!("Could not read runtime data {}: {err}", path.display());
                Ok(None)
            }
        }
    }

    fn get_cluster_description(&mut self) -> DebugResult<String> {
        Ok(Some(self.cluster_description.display().to_string()))
    }

    fn get_harvester_coordinate_translation(&mut self, chip: ChipId) -> DebugResult<String> {
        self.umd.get_harvester_coordinate_translation(chip)
    }

    fn get_device_ids(&mut self) -> DebugResult<Vec<u8>> {
        Ok(Some(self.device_ids.clone()))
    }

    fn get_device_arch(&mut self, chip: ChipId) -> DebugResult<String> {
        self.umd.get_device_arch(chip)
    }

    fn get_device_soc_description(&mut self, chip: ChipId) -> DebugResult<String> {
        Ok(self
            .soc_descriptions
            .get(&chip)
            .map(|path| path.display().to_string()))
    }
}

#[cfg(test)]
mod test {
    use std::os::unix::fs::PermissionsExt;

    use dbd_pci::{fake::FakeBar, BarIo};
    use serial_test::serial;

    use super::*;

    fn script(dir: &Path, body: &str) {
        let path = dir.join(CREATE_ETHERNET_MAP);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[test]
    fn wanted_devices() {
        assert_eq!(select_devices(&[0, 1, 2], &[]).unwrap(), vec![0, 1, 2]);
        assert_eq!(select_devices(&[0, 1, 2], &[2, 0]).unwrap(), vec![2, 0]);

        let err = select_devices(&[0, 1], &[1, 4]).unwrap_err();
        assert_eq!(err.to_string(), "Device 4 is not available.");
    }

    #[test]
    #[serial]
    fn ethernet_map_tool() {
        let bin = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();

        let err = create_ethernet_map(bin.path(), work.path()).unwrap_err();
        assert_eq!(
            err.to_string(),
            format!(
                "Couldn't find create-ethernet-map at {}.",
                bin.path().join(CREATE_ETHERNET_MAP).display()
            )
        );

        script(bin.path(), "exit 3");
        assert!(matches!(
            create_ethernet_map(bin.path(), work.path()),
            Err(ServerError::EthernetMapFailed)
        ));

        script(bin.path(), "echo 'chips: {0: [0,0,0,0]}' > \"$1\"");
        let path = create_ethernet_map(bin.path(), work.path()).unwrap();
        assert_eq!(path, work.path().join("cluster_desc.yaml"));
        assert!(ClusterDescriptor::load(&path).unwrap().contains(0));
    }

    #[test]
    fn serves_generated_files() {
        let dir = tempfile::tempdir().unwrap();
        let workdir = tempfile::Builder::new()
            .prefix("debuda_server_")
            .tempdir()
            .unwrap();

        let bar: Box<dyn BarIo + Send> = Box::new(FakeBar::new(Arch::Grayskull, 0));
        let device = Device::with_devices(
            Arch::Grayskull,
            ClusterDescriptor::local(Arch::Grayskull, &[0]),
            &[0],
            vec![(0, bar)],
            DeviceConfig {
                mutex_dir: dir.path().to_path_buf(),
                harvesting_override: Some(0),
                ..Default::default()
            },
        )
        .unwrap();

        let runtime = dir.path().join("runtime_data.yaml");
        std::fs::write(&runtime, "arch_name: grayskull\n").unwrap();
        let cluster = workdir.path().join("cluster_desc.yaml");

        let mut backend =
            UmdWithOpen::with_device(device, workdir, cluster.clone(), vec![0], Some(runtime))
                .unwrap();

        assert_eq!(
            backend.get_runtime_data().unwrap().as_deref(),
            Some("arch_name: grayskull\n")
        );
        assert_eq!(
            backend.get_cluster_description().unwrap(),
            Some(cluster.display().to_string())
        );
        assert_eq!(backend.get_device_ids().unwrap(), Some(vec![0]));

        let soc = backend.get_device_soc_description(0).unwrap().unwrap();
        assert_eq!(
            Path::new(&soc),
            backend.workdir().join("device_desc_runtime_0.yaml")
        );
        assert!(std::fs::read_to_string(&soc).unwrap().starts_with("grid:"));
        assert_eq!(backend.get_device_soc_description(1).unwrap(), None);

        // A runtime file that went away reads as unsupported.
        backend.runtime_yaml = Some(dir.path().join("missing.yaml"));
        assert_eq!(backend.get_runtime_data().unwrap(), None);
    }
}
