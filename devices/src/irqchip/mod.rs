// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Emulation of the local APIC interrupt complex.
//!
//! Every virtual CPU owns one [`Apic`]; the [`ApicChip`] ties the APICs
//! together into the distributed delivery protocol (IPIs, MSIs, local
//! vector-table sources) and signals the owning CPUs through the [`Vcpu`]
//! trait. All register mutation, delivery, and timer callbacks run on the
//! single emulation thread; `ApicChip` methods take `&mut self` so the
//! borrow checker enforces that contract.

mod apic;
mod bitmap;
mod chip;
mod msi;

pub use apic::Apic;
pub use apic::APIC_SNAPSHOT_VERSION;
pub use apic::LVT_ERROR;
pub use apic::LVT_LINT0;
pub use apic::LVT_LINT1;
pub use apic::LVT_PERFORMANCE;
pub use apic::LVT_THERMAL;
pub use apic::LVT_TIMER;
pub use bitmap::VectorBitmap;
pub use chip::ApicChip;
pub use chip::ApicChipError;
pub use chip::MAX_APICS;
pub use msi::MsiAddressMessage;
pub use msi::MsiDataMessage;
pub use msi::MsiDecodeError;

/// Default physical base of the per-CPU APIC register window.
pub const APIC_BASE_ADDRESS: u64 = 0xFEE0_0000;
/// Length of the APIC MMIO window. Each CPU sees its own register page; the
/// accessing CPU is identified by `BusAccessInfo::id`, not by address.
pub const APIC_MEM_LENGTH_BYTES: u64 = 0x10_0000;

/// How an interrupt is addressed to one or more APICs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestinationMode {
    Physical,
    Logical,
}

/// Edge or level trigger semantics of an interrupt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerMode {
    Edge,
    Level,
}

/// Line state carried with level-triggered messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Deassert,
    Assert,
}

/// The architectural 3-bit delivery mode of an interrupt message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    Fixed = 0b000,
    Lowest = 0b001,
    SMI = 0b010,
    RemoteRead = 0b011, // No longer supported by Intel; accepted and dropped.
    NMI = 0b100,
    Init = 0b101,
    Startup = 0b110,
    External = 0b111,
}

impl DeliveryMode {
    /// Decodes the low three bits of `val`.
    pub fn from_bits(val: u32) -> DeliveryMode {
        match val & 0b111 {
            0b000 => DeliveryMode::Fixed,
            0b001 => DeliveryMode::Lowest,
            0b010 => DeliveryMode::SMI,
            0b011 => DeliveryMode::RemoteRead,
            0b100 => DeliveryMode::NMI,
            0b101 => DeliveryMode::Init,
            0b110 => DeliveryMode::Startup,
            _ => DeliveryMode::External,
        }
    }
}

/// The destination-shorthand field of the interrupt command register. A
/// shorthand other than `None` overrides the destination id and mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestinationShorthand {
    None = 0b00,
    SelfOnly = 0b01,
    All = 0b10,
    AllExcludingSelf = 0b11,
}

/// Where an interrupt is going.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterruptDestination {
    /// APIC id of the sender, used by the self and all-excluding-self
    /// shorthands.
    pub source_id: u8,
    /// APIC id (physical mode) or logical destination set (logical mode).
    pub dest_id: u8,
    pub shorthand: DestinationShorthand,
    pub mode: DestinationMode,
}

/// What interrupt is being sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterruptData {
    pub vector: u8,
    pub delivery: DeliveryMode,
    pub trigger: TriggerMode,
    pub level: Level,
}

/// An interrupt message on the APIC bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interrupt {
    pub dest: InterruptDestination,
    pub data: InterruptData,
}

/// Messages that an [`Apic`] sends back to the bus as a side effect of a
/// register write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApicBusMsg {
    /// Broadcast the end of interrupt for `vector`. Consumed by bus-level
    /// interrupt sources (I/O APIC remote-IRR); nothing in this crate does,
    /// see the design notes on EOI propagation.
    Eoi(u8),
    /// Send an IPI built from the interrupt command register.
    Ipi(Interrupt),
}

/// Interrupt lines into a virtual CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VcpuSignal {
    /// Maskable hardware interrupt. The CPU answers by calling
    /// [`ApicChip::acknowledge`] (or the legacy PIC when
    /// [`ApicChip::accepts_pic_interrupt`] says so).
    Intr,
    Smi,
    Nmi,
    Init,
    /// Startup IPI; the CPU consumes the vector via
    /// [`ApicChip::consume_sipi`].
    Startup,
}

/// Connection to the virtual CPU owning an APIC.
///
/// Raising and lowering are fire-and-forget; the chip guarantees a signal is
/// raised only after the interrupt state it announces is visible.
pub trait Vcpu {
    /// Whether this CPU is the bootstrap processor. Consulted at reset to
    /// decide the initial wait-for-SIPI state and LINT0 wiring.
    fn is_bootstrap(&self) -> bool;

    /// Asserts `signal`.
    fn raise(&mut self, signal: VcpuSignal);

    /// Deasserts `signal`.
    fn lower(&mut self, signal: VcpuSignal);
}
