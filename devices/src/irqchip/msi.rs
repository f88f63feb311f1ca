// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

// Message Signaled Interrupts are a 64-bit address and 32-bit data, but in
// the Intel encoding implemented here only the low 32 bits of the address
// are used.

use remain::sorted;
use thiserror::Error;

use super::DeliveryMode;
use super::DestinationMode;
use super::DestinationShorthand;
use super::InterruptData;
use super::InterruptDestination;
use super::Level;
use super::TriggerMode;

#[sorted]
#[derive(Error, Debug)]
pub enum MsiDecodeError {
    /// The address is not in the 0xFEExxxxx interrupt window.
    #[error("MSI address {0:#010x} is outside the interrupt address window")]
    AddressWindow(u32),
}

/// The address half of an MSI message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsiAddressMessage(u32);

impl MsiAddressMessage {
    pub fn new(address: u32) -> MsiAddressMessage {
        MsiAddressMessage(address)
    }

    pub fn destination_mode(&self) -> DestinationMode {
        if self.0 & (1 << 2) != 0 {
            DestinationMode::Logical
        } else {
            DestinationMode::Physical
        }
    }

    pub fn redirection_hint(&self) -> bool {
        self.0 & (1 << 3) != 0
    }

    pub fn destination_id(&self) -> u8 {
        (self.0 >> 12) as u8
    }

    /// According to Intel's implementation of MSI, these bits must always be
    /// 0xFEE.
    pub fn always_0xfee(&self) -> u32 {
        self.0 >> 20
    }
}

/// The data half of an MSI message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsiDataMessage(u32);

impl MsiDataMessage {
    pub fn new(data: u32) -> MsiDataMessage {
        MsiDataMessage(data)
    }

    pub fn vector(&self) -> u8 {
        self.0 as u8
    }

    pub fn delivery_mode(&self) -> DeliveryMode {
        DeliveryMode::from_bits(self.0 >> 8)
    }

    pub fn level(&self) -> Level {
        if self.0 & (1 << 14) != 0 {
            Level::Assert
        } else {
            Level::Deassert
        }
    }

    pub fn trigger(&self) -> TriggerMode {
        if self.0 & (1 << 15) != 0 {
            TriggerMode::Level
        } else {
            TriggerMode::Edge
        }
    }
}

impl TryFrom<&MsiAddressMessage> for InterruptDestination {
    type Error = MsiDecodeError;

    fn try_from(msi: &MsiAddressMessage) -> Result<Self, Self::Error> {
        if msi.always_0xfee() != 0xFEE {
            return Err(MsiDecodeError::AddressWindow(msi.0));
        }
        Ok(InterruptDestination {
            source_id: 0,
            dest_id: msi.destination_id(),
            shorthand: DestinationShorthand::None,
            mode: msi.destination_mode(),
        })
    }
}

impl From<&MsiDataMessage> for InterruptData {
    fn from(msi: &MsiDataMessage) -> Self {
        InterruptData {
            vector: msi.vector(),
            delivery: msi.delivery_mode(),
            trigger: msi.trigger(),
            level: msi.level(),
        }
    }
}
