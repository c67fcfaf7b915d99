// SPDX-FileCopyrightText: © 2023 Tenstorrent Inc.
// SPDX-License-Identifier: Apache-2.0

//! Messages to the ARC management core.
//!
//! The mailbox lives in the ARC reset unit scratch registers. Arguments go in scratch 3, the
//! message code in scratch 5, and bit 16 of the misc control register raises the firmware
//! interrupt. The firmware answers by writing the low byte of the code, plus an exit code in
//! the upper half, back into scratch 5.

use std::time::{Duration, Instant};

use dbd_core::ChipId;

use crate::DeviceError;

const MSG_ERROR_REPLY: u32 = 0xffff_ffff;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    Busy,
    ShortIdle,
    LongIdle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArcMsg {
    Nop,
    Test { arg: u32 },
    SetPowerState(PowerState),
    GetHarvesting,
    /// A message this crate has no name for, `code` is sent as is.
    Raw { code: u16, arg0: u16, arg1: u16 },
}

impl ArcMsg {
    pub fn msg_code(&self) -> u16 {
        let code = match self {
            ArcMsg::Nop => 0x11,
            ArcMsg::Test { .. } => 0x90,
            ArcMsg::SetPowerState(state) => match state {
                PowerState::Busy => 0x52,
                PowerState::ShortIdle => 0x53,
                PowerState::LongIdle => 0x54,
            },
            ArcMsg::GetHarvesting => 0x57,
            ArcMsg::Raw { code, .. } => return *code,
        };

        0xaa00 | code
    }

    pub fn args(&self) -> (u16, u16) {
        match self {
            ArcMsg::Test { arg } => ((arg & 0xFFFF) as u16, ((arg >> 16) & 0xFFFF) as u16),
            ArcMsg::Raw { arg0, arg1, .. } => (*arg0, *arg1),
            ArcMsg::Nop | ArcMsg::SetPowerState(_) | ArcMsg::GetHarvesting => (0, 0),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArcMsgOk {
    /// Upper half of the status word, `0xffffffff` when the firmware did not know the message.
    pub exit_code: u32,
    pub return_3: u32,
    pub return_4: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ArcMsgAddr {
    pub scratch_base: u64,
    pub arc_misc_cntl: u64,
}

impl ArcMsgAddr {
    /// BAR offsets of the ARC reset unit on a PCIe attached chip.
    pub const MMIO: ArcMsgAddr = ArcMsgAddr {
        scratch_base: 0x1FF3_0060,
        arc_misc_cntl: 0x1FF3_0100,
    };

    /// The same registers seen from the NOC of a remote chip.
    pub const REMOTE: ArcMsgAddr = ArcMsgAddr {
        scratch_base: 0x8_8003_0060,
        arc_misc_cntl: 0x8_8003_0100,
    };
}

/// Register access used to run the mailbox protocol, either straight through the BAR or relayed.
pub(crate) trait ArcComms {
    fn arc_read32(&mut self, addr: u64) -> Result<u32, DeviceError>;
    fn arc_write32(&mut self, addr: u64, value: u32) -> Result<(), DeviceError>;

    /// Make sure every write so far has landed.
    fn arc_barrier(&mut self) -> Result<(), DeviceError> {
        Ok(())
    }
}

/// Returns false if the firmware is still busy with the previous interrupt.
fn trigger_fw_int<T: ArcComms + ?Sized>(
    comms: &mut T,
    addrs: &ArcMsgAddr,
) -> Result<bool, DeviceError> {
    let misc = comms.arc_read32(addrs.arc_misc_cntl)?;

    if misc & (1 << 16) != 0 {
        return Ok(false);
    }

    comms.arc_write32(addrs.arc_misc_cntl, misc | (1 << 16))?;

    Ok(true)
}

pub(crate) fn arc_msg<T: ArcComms + ?Sized>(
    comms: &mut T,
    chip: ChipId,
    msg: &ArcMsg,
    wait_for_done: bool,
    timeout: Duration,
    addrs: &ArcMsgAddr,
) -> Result<ArcMsgOk, DeviceError> {
    let code = msg.msg_code();
    if code & 0xff00 != 0xaa00 {
        tracing::error!("Malformed message. msg_code is 0x{code:x} but should be 0xaa..");
    }

    let (arg0, arg1) = msg.args();

    comms.arc_write32(addrs.scratch_base + 3 * 4, arg0 as u32 | ((arg1 as u32) << 16))?;
    comms.arc_write32(addrs.scratch_base + 5 * 4, code as u32)?;
    comms.arc_barrier()?;

    if !trigger_fw_int(comms, addrs)? {
        tracing::error!("trigger_fw_int failed on device {chip}");
        return Ok(ArcMsgOk {
            exit_code: 1,
            ..Default::default()
        });
    }

    if !wait_for_done {
        return Ok(ArcMsgOk::default());
    }

    let start = Instant::now();
    loop {
        if start.elapsed() > timeout {
            return Err(DeviceError::ArcTimeout {
                chip,
                msg: code,
                timeout,
            });
        }

        let status = comms.arc_read32(addrs.scratch_base + 5 * 4)?;
        if status & 0xffff == (code & 0xff) as u32 {
            return Ok(ArcMsgOk {
                exit_code: status >> 16,
                return_3: comms.arc_read32(addrs.scratch_base + 3 * 4)?,
                return_4: comms.arc_read32(addrs.scratch_base + 4 * 4)?,
            });
        } else if status == MSG_ERROR_REPLY {
            tracing::warn!("On device {chip}, message code 0x{code:x} not recognized by FW");
            return Ok(ArcMsgOk {
                exit_code: MSG_ERROR_REPLY,
                ..Default::default()
            });
        }

        std::thread::sleep(Duration::from_millis(1));
    }
}
