// SPDX-FileCopyrightText: © 2023 Tenstorrent Inc.
// SPDX-License-Identifier: Apache-2.0

use super::DebugImplementation;

/// Supports nothing. Lets the server run without hardware.
#[derive(Debug, Default, Clone, Copy)]
pub struct NotImplemented;

impl DebugImplementation for NotImplemented {}
