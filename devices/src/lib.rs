// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Emulated interrupt-controller devices.

mod bus;
pub mod irqchip;
mod suspendable;

pub use self::bus::Bus;
pub use self::bus::BusAccessInfo;
pub use self::bus::BusDevice;
pub use self::bus::BusRange;
pub use self::bus::Error as BusError;
pub use self::irqchip::Apic;
pub use self::irqchip::ApicBusMsg;
pub use self::irqchip::ApicChip;
pub use self::irqchip::ApicChipError;
pub use self::irqchip::DeliveryMode;
pub use self::irqchip::DestinationMode;
pub use self::irqchip::DestinationShorthand;
pub use self::irqchip::Interrupt;
pub use self::irqchip::InterruptData;
pub use self::irqchip::InterruptDestination;
pub use self::irqchip::Level;
pub use self::irqchip::MsiAddressMessage;
pub use self::irqchip::MsiDataMessage;
pub use self::irqchip::TriggerMode;
pub use self::irqchip::Vcpu;
pub use self::irqchip::VcpuSignal;
pub use self::irqchip::VectorBitmap;
pub use self::irqchip::APIC_BASE_ADDRESS;
pub use self::irqchip::APIC_MEM_LENGTH_BYTES;
pub use self::irqchip::MAX_APICS;
pub use self::suspendable::Suspendable;
