// SPDX-FileCopyrightText: © 2023 Tenstorrent Inc.
// SPDX-License-Identifier: Apache-2.0

//! Built in SoC layouts and the descriptor files the debugger client reads.

use std::fmt::Write;

use dbd_core::Arch;

pub type Core = (u8, u8);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocDescriptor {
    pub arch: Arch,
    pub grid_size: Core,
    pub arc: Vec<Core>,
    pub pcie: Vec<Core>,
    pub dram: Vec<Vec<Core>>,
    pub eth: Vec<Core>,
    pub router_only: Vec<Core>,

    /// Columns and rows that hold tensix cores before harvesting.
    pub worker_x: Vec<u8>,
    pub worker_y: Vec<u8>,

    pub workers: Vec<Core>,
    pub harvested_workers: Vec<Core>,

    pub worker_l1_size: u64,
    pub dram_bank_size: u64,
    pub eth_l1_size: u64,
    pub unpacker_version: u32,
    pub packer_version: u32,
    pub overlay_version: u32,
    pub dst_size_alignment: u32,
}

fn cores(list: &[(u8, u8)]) -> Vec<Core> {
    list.to_vec()
}

impl SocDescriptor {
    pub fn new(arch: Arch) -> Self {
        let mut soc = match arch {
            Arch::Grayskull => SocDescriptor {
                arch,
                grid_size: (13, 12),
                arc: cores(&[(0, 2)]),
                pcie: cores(&[(0, 4)]),
                dram: [(1, 0), (1, 6), (4, 0), (4, 6), (7, 0), (7, 6), (10, 0), (10, 6)]
                    .iter()
                    .map(|core| vec![*core])
                    .collect(),
                eth: vec![],
                router_only: vec![],
                worker_x: (1..=12).collect(),
                worker_y: (1..=5).chain(7..=11).collect(),
                workers: vec![],
                harvested_workers: vec![],
                worker_l1_size: 1048576,
                dram_bank_size: 1073741824,
                eth_l1_size: 0,
                unpacker_version: 1,
                packer_version: 1,
                overlay_version: 1,
                dst_size_alignment: 32768,
            },
            Arch::Wormhole | Arch::WormholeB0 => SocDescriptor {
                arch,
                grid_size: (10, 12),
                arc: cores(&[(0, 10)]),
                pcie: cores(&[(0, 3)]),
                dram: vec![
                    cores(&[(0, 0), (0, 1), (0, 11)]),
                    cores(&[(0, 5), (0, 6), (0, 7)]),
                    cores(&[(5, 0), (5, 1), (5, 11)]),
                    cores(&[(5, 2), (5, 9), (5, 10)]),
                    cores(&[(5, 3), (5, 4), (5, 8)]),
                    cores(&[(5, 5), (5, 6), (5, 7)]),
                ],
                eth: cores(&[
                    (9, 0),
                    (1, 0),
                    (8, 0),
                    (2, 0),
                    (7, 0),
                    (3, 0),
                    (6, 0),
                    (4, 0),
                    (9, 6),
                    (1, 6),
                    (8, 6),
                    (2, 6),
                    (7, 6),
                    (3, 6),
                    (6, 6),
                    (4, 6),
                ]),
                router_only: cores(&[(0, 2), (0, 4), (0, 8), (0, 9)]),
                worker_x: (1..=4).chain(6..=9).collect(),
                worker_y: (1..=5).chain(7..=11).collect(),
                workers: vec![],
                harvested_workers: vec![],
                worker_l1_size: if arch == Arch::WormholeB0 {
                    1499136
                } else {
                    1048576
                },
                dram_bank_size: 2147483648,
                eth_l1_size: 262144,
                unpacker_version: 2,
                packer_version: 2,
                overlay_version: 2,
                dst_size_alignment: 32768,
            },
        };

        soc.workers = soc.worker_cores(|_| true);
        soc
    }

    fn worker_cores(&self, mut keep_row: impl FnMut(u8) -> bool) -> Vec<Core> {
        let mut workers = vec![];
        for y in self.worker_y.iter().copied().filter(|y| keep_row(*y)) {
            for x in self.worker_x.iter().copied() {
                workers.push((x, y));
            }
        }
        workers
    }

    /// Drop the tensix cores on the given NOC rows.
    pub fn with_harvested_rows(mut self, rows: &[u8]) -> Self {
        self.workers = self.worker_cores(|y| !rows.contains(&y));
        self.harvested_workers = self.worker_cores(|y| rows.contains(&y));
        self
    }

    /// True for tensix locations, harvested or not.
    pub fn is_worker_location(&self, x: u8, y: u8) -> bool {
        self.worker_x.contains(&x) && self.worker_y.contains(&y)
    }

    pub fn is_eth(&self, x: u8, y: u8) -> bool {
        self.eth.contains(&(x, y))
    }

    pub fn grid(&self) -> impl Iterator<Item = Core> {
        let (size_x, size_y) = self.grid_size;
        (0..size_x).flat_map(move |x| (0..size_y).map(move |y| (x, y)))
    }

    /// The descriptor in the layout the runtime writes next to its output.
    pub fn to_yaml(&self) -> String {
        fn list(out: &mut String, cores: &[Core]) {
            for (x, y) in cores {
                let _ = write!(out, "{x}-{y}, ");
            }
        }

        let mut output = String::new();

        let _ = writeln!(output, "grid:");
        let _ = writeln!(output, "  x_size: {}", self.grid_size.0);
        let _ = writeln!(output, "  y_size: {}\n", self.grid_size.1);

        output.push_str("arc:\n  [\n");
        list(&mut output, &self.arc);
        output.push_str("\n  ]\n\n");

        output.push_str("pcie:\n  [\n");
        list(&mut output, &self.pcie);
        output.push_str("\n  ]\n\n");

        output.push_str("dram:\n  [\n");
        for channel in &self.dram {
            output.push('[');
            list(&mut output, channel);
            output.push_str("],\n");
        }
        output.push_str("\n]\n\n");

        output.push_str("eth:\n  [\n");
        let eth = self
            .eth
            .iter()
            .map(|(x, y)| format!("{x}-{y}"))
            .collect::<Vec<_>>();
        output.push_str(&eth.join(", "));
        output.push_str("\n]\n\n");

        output.push_str("harvested_workers:\n  [\n");
        list(&mut output, &self.harvested_workers);
        output.push_str("\n  ]\n\n");

        output.push_str("functional_workers:\n  [\n");
        list(&mut output, &self.workers);
        output.push_str("\n  ]\n\n");

        output.push_str("router_only:\n  []\n\n");

        let _ = writeln!(output, "worker_l1_size:\n  {}\n", self.worker_l1_size);
        let _ = writeln!(output, "dram_bank_size:\n  {}\n", self.dram_bank_size);
        let _ = writeln!(output, "eth_l1_size:\n  {}\n", self.eth_l1_size);
        let _ = writeln!(output, "arch_name: {}\n", self.arch.as_upper_str());

        output.push_str("features:\n");
        output.push_str("  noc:\n    translation_id_enabled: True\n");
        let _ = writeln!(
            output,
            "  unpacker:\n    version: {}\n    inline_srca_trans_without_srca_trans_instr: False",
            self.unpacker_version
        );
        let _ = writeln!(
            output,
            "  math:\n    dst_size_alignment: {}",
            self.dst_size_alignment
        );
        let _ = writeln!(output, "  packer:\n    version: {}", self.packer_version);
        let _ = writeln!(output, "  overlay:\n    version: {}\n", self.overlay_version);

        output
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn worker_counts() {
        assert_eq!(SocDescriptor::new(Arch::Grayskull).workers.len(), 120);
        assert_eq!(SocDescriptor::new(Arch::WormholeB0).workers.len(), 80);
        assert_eq!(SocDescriptor::new(Arch::Wormhole).worker_l1_size, 1 << 20);
    }

    #[test]
    fn harvested_rows_are_moved_out() {
        let soc = SocDescriptor::new(Arch::WormholeB0).with_harvested_rows(&[11, 1]);

        assert_eq!(soc.workers.len(), 64);
        assert_eq!(soc.harvested_workers.len(), 16);
        assert!(soc.harvested_workers.contains(&(6, 11)));
        assert!(!soc.workers.iter().any(|(_, y)| *y == 1 || *y == 11));
        assert!(soc.is_worker_location(6, 11));
    }

    #[test]
    fn descriptor_layout() {
        let soc = SocDescriptor::new(Arch::WormholeB0).with_harvested_rows(&[11]);
        let yaml = soc.to_yaml();

        assert!(yaml.starts_with("grid:\n  x_size: 10\n  y_size: 12\n\n"));
        assert!(yaml.contains("arc:\n  [\n0-10, \n  ]\n"));
        assert!(yaml.contains("[0-0, 0-1, 0-11, ],\n"));
        assert!(yaml.contains("eth:\n  [\n9-0, 1-0, 8-0"));
        assert!(yaml.contains("harvested_workers:\n  [\n1-11, 2-11, "));
        assert!(yaml.contains("router_only:\n  []\n"));
        assert!(yaml.contains("worker_l1_size:\n  1499136\n"));
        assert!(yaml.contains("arch_name: WORMHOLE_B0\n"));
        assert!(yaml.contains("    dst_size_alignment: 32768\n"));
    }
}
