// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

// The delivery engine tying the per-CPU local APICs together: it computes
// the target set of each interrupt message, updates every target's pending
// state, and only then signals the owning CPUs. All entry points run to
// completion on the emulation thread; `&mut self` is the locking contract.

use std::cell::RefCell;
use std::rc::Rc;

use anyhow::Context;
use base::Clock;
use base::TimerToken;
use log::debug;
use log::info;
use log::warn;
use remain::sorted;
use thiserror::Error;

use super::apic::LVT_LINT0;
use super::apic::LVT_TIMER;
use super::Apic;
use super::ApicBusMsg;
use super::DeliveryMode;
use super::DestinationMode;
use super::DestinationShorthand;
use super::Interrupt;
use super::InterruptData;
use super::InterruptDestination;
use super::Level;
use super::MsiAddressMessage;
use super::MsiDataMessage;
use super::TriggerMode;
use super::Vcpu;
use super::VcpuSignal;
use crate::BusAccessInfo;
use crate::BusDevice;
use crate::Suspendable;

// Local vector table entry bits needed for dispatch.
const LVT_MASKED: u32 = 1 << 16;
const LVT_LEVEL_TRIGGER: u32 = 1 << 15;

/// Fixed capacity of the APIC registry. One slot per virtual CPU, slots are
/// never reused.
pub const MAX_APICS: usize = 255;

#[sorted]
#[derive(Error, Debug)]
pub enum ApicChipError {
    /// More virtual CPUs were registered than the registry can hold.
    #[error("apic registry is full, capacity is {0}")]
    RegistryFull(usize),
}

pub type Result<T> = std::result::Result<T, ApicChipError>;

/// The interrupt controller complex of the virtual machine: one local APIC
/// per virtual CPU plus the bus-level delivery protocol between them.
pub struct ApicChip {
    clock: Rc<RefCell<Clock>>,
    apics: Vec<Apic>,
    vcpus: Vec<Box<dyn Vcpu>>,
    // Whether this chip currently asserts the hardware-interrupt line of
    // each CPU. Tracks only assertions made by the priority evaluator, not
    // the ExtINT wiring, so lowering never revokes the PIC's assertion.
    intr_line: Vec<bool>,
}

impl ApicChip {
    /// Constructs an empty chip. CPUs are registered with `add_vcpu` at
    /// machine build time.
    pub fn new(clock: Rc<RefCell<Clock>>) -> ApicChip {
        ApicChip {
            clock,
            apics: Vec::new(),
            vcpus: Vec::new(),
            intr_line: Vec::new(),
        }
    }

    /// Registers the next virtual CPU and creates its local APIC, reset and
    /// wired according to `vcpu.is_bootstrap()`. Returns the new slot index,
    /// which doubles as the CPU's initial APIC id.
    pub fn add_vcpu(&mut self, vcpu: Box<dyn Vcpu>) -> Result<usize> {
        if self.apics.len() >= MAX_APICS {
            return Err(ApicChipError::RegistryFull(MAX_APICS));
        }
        let slot = self.apics.len();
        let mut apic = Apic::new(slot as u8, self.clock.clone());
        apic.reset(vcpu.is_bootstrap());
        self.apics.push(apic);
        self.vcpus.push(vcpu);
        self.intr_line.push(false);
        Ok(slot)
    }

    pub fn num_vcpus(&self) -> usize {
        self.apics.len()
    }

    pub fn apic(&self, vcpu_id: usize) -> &Apic {
        &self.apics[vcpu_id]
    }

    pub fn apic_mut(&mut self, vcpu_id: usize) -> &mut Apic {
        &mut self.apics[vcpu_id]
    }

    /// The clock token that identifies `vcpu_id`'s APIC timer. The machine
    /// loop routes expired tokens back through `handle_timer_expiration`.
    pub fn timer_token(&self, vcpu_id: usize) -> TimerToken {
        self.apics[vcpu_id].timer_token()
    }

    /// Finds the registry slot answering to physical APIC id `id`. The slot
    /// whose index equals the id is probed first; a linear scan covers
    /// guests that rewrote their APIC ids. With duplicate ids the first
    /// match wins and delivery order is undefined.
    fn slot_by_id(&self, id: u8) -> Option<usize> {
        if let Some(apic) = self.apics.get(usize::from(id)) {
            if apic.id() == id {
                return Some(usize::from(id));
            }
        }
        self.apics.iter().position(|apic| apic.id() == id)
    }

    /// Computes the registry slots targeted by `dest`. A shorthand other
    /// than `None` overrides the id/mode addressing entirely.
    fn target_slots(&self, dest: &InterruptDestination) -> Vec<usize> {
        match dest.shorthand {
            DestinationShorthand::SelfOnly => {
                self.slot_by_id(dest.source_id).into_iter().collect()
            }
            DestinationShorthand::All => (0..self.apics.len()).collect(),
            DestinationShorthand::AllExcludingSelf => {
                let source = self.slot_by_id(dest.source_id);
                (0..self.apics.len())
                    .filter(|&slot| Some(slot) != source)
                    .collect()
            }
            DestinationShorthand::None => match dest.mode {
                // Physical unicast resolves by id; a miss means the
                // interrupt evaporates, matching the hardware's silence.
                DestinationMode::Physical if dest.dest_id != 0xFF => {
                    self.slot_by_id(dest.dest_id).into_iter().collect()
                }
                _ => (0..self.apics.len())
                    .filter(|&slot| self.apics[slot].match_dest(dest))
                    .collect(),
            },
        }
    }

    /// Sends an interrupt to one or more APICs. Used for IPIs and MSIs.
    pub fn send_irq_to_apics(&mut self, irq: &Interrupt) {
        match irq.data.delivery {
            DeliveryMode::Fixed | DeliveryMode::Lowest => {}
            _ => info!("delivering special interrupt: {:?}", irq),
        }

        let targets = self.target_slots(&irq.dest);
        if targets.is_empty() {
            debug!("interrupt dropped, no target apic: {:?}", irq);
            return;
        }

        match irq.data.delivery {
            DeliveryMode::Fixed => self.deliver_fixed(&targets, &irq.data),
            // Lowest-priority arbitration is approximated by the first
            // target in registry order; real hardware round-robins through
            // an arbitration-id exchange this model does not implement.
            DeliveryMode::Lowest => self.deliver_fixed(&targets[..1], &irq.data),
            DeliveryMode::SMI => self.raise_all(&targets, VcpuSignal::Smi),
            DeliveryMode::NMI => self.raise_all(&targets, VcpuSignal::Nmi),
            DeliveryMode::External => self.raise_all(&targets, VcpuSignal::Intr),
            DeliveryMode::Init => {
                if irq.data.trigger == TriggerMode::Level && irq.data.level == Level::Deassert {
                    // INIT level de-assert: no reset, every APIC resyncs its
                    // arbitration id.
                    for apic in &mut self.apics {
                        apic.sync_arbitration_id();
                    }
                } else {
                    self.raise_all(&targets, VcpuSignal::Init);
                }
            }
            DeliveryMode::Startup => {
                for &slot in &targets {
                    self.apics[slot].receive_sipi(irq.data.vector);
                }
                self.raise_all(&targets, VcpuSignal::Startup);
            }
            DeliveryMode::RemoteRead => warn!("remote read IPI is not supported: {:?}", irq),
        }
    }

    /// Fixed delivery: latch the request on every target, then signal the
    /// CPUs. All IRR/TMR updates happen before any CPU-line assertion.
    fn deliver_fixed(&mut self, targets: &[usize], data: &InterruptData) {
        for &slot in targets {
            self.apics[slot].accept_irq(data);
        }
        for &slot in targets {
            self.update_vcpu(slot);
        }
    }

    fn raise_all(&mut self, targets: &[usize], signal: VcpuSignal) {
        for &slot in targets {
            self.vcpus[slot].raise(signal);
        }
    }

    /// Recomputes `slot`'s pending-interrupt signal and updates the CPU's
    /// hardware-interrupt line on an edge: raised when a presentable request
    /// appears, lowered when the last one is gone. The line state is updated
    /// before the CPU is notified.
    fn update_vcpu(&mut self, slot: usize) {
        let pending = self.apics[slot].has_presentable_interrupt();
        if pending && !self.intr_line[slot] {
            self.intr_line[slot] = true;
            self.vcpus[slot].raise(VcpuSignal::Intr);
        } else if !pending && self.intr_line[slot] {
            self.intr_line[slot] = false;
            self.vcpus[slot].lower(VcpuSignal::Intr);
        }
    }

    /// Sends a Message Signaled Interrupt. MSIs are a 64-bit address and
    /// 32-bit data, but in the encoding implemented here only the low 32
    /// address bits are used.
    pub fn send_msi(&mut self, addr: u32, data: u32) {
        let msi_addr = MsiAddressMessage::new(addr);
        let dest = match InterruptDestination::try_from(&msi_addr) {
            Ok(dest) => dest,
            Err(e) => {
                warn!("invalid MSI message: {}", e);
                return;
            }
        };
        let data = InterruptData::from(&MsiDataMessage::new(data));
        self.send_irq_to_apics(&Interrupt { dest, data });
    }

    /// Handles a message an APIC produced as the side effect of a register
    /// write.
    fn handle_msg(&mut self, msg: ApicBusMsg) {
        match msg {
            ApicBusMsg::Eoi(vector) => {
                // Bus-level remote-IRR propagation belongs to the I/O APIC
                // collaborator; the EOI stops at the local ISR here.
                debug!("EOI for level-triggered vector {:#x}", vector);
            }
            ApicBusMsg::Ipi(interrupt) => self.send_irq_to_apics(&interrupt),
        }
    }

    /// The interrupt-acceptance point called from the CPU loop. Returns the
    /// vector to inject, the spurious vector when the best candidate is
    /// priority-masked, or None when the APIC is disabled or idle (the
    /// caller then consults the legacy PIC path).
    pub fn acknowledge(&mut self, vcpu_id: usize) -> Option<u8> {
        let vector = self.apics[vcpu_id].acknowledge();
        if vector.is_some() {
            // More requests may be pending above the new in-service level.
            self.update_vcpu(vcpu_id);
        }
        vector
    }

    /// Whether the legacy PIC path should be honored for `vcpu_id`: its
    /// APIC is disabled, or LINT0 is unmasked in ExtINT mode.
    pub fn accepts_pic_interrupt(&self, vcpu_id: usize) -> bool {
        let apic = &self.apics[vcpu_id];
        let lint0 = apic.lvt_entry(LVT_LINT0);
        !apic.enabled()
            || (lint0 & LVT_MASKED == 0
                && DeliveryMode::from_bits(lint0 >> 8) == DeliveryMode::External)
    }

    /// Drives one of the local interrupt pins (0 = LINT0, 1 = LINT1).
    /// Assertion dispatches the pin's local vector table entry; de-assertion
    /// withdraws a level-triggered request and lowers the CPU line for the
    /// ExtINT wiring.
    pub fn local_interrupt(&mut self, vcpu_id: usize, pin: usize, level: bool) {
        let lvt_index = LVT_LINT0 + pin;
        if level {
            self.local_deliver(vcpu_id, lvt_index);
        } else {
            let lvt = self.apics[vcpu_id].lvt_entry(lvt_index);
            match DeliveryMode::from_bits(lvt >> 8) {
                DeliveryMode::Fixed => {
                    if lvt & LVT_LEVEL_TRIGGER != 0 {
                        self.apics[vcpu_id].withdraw_irq(lvt as u8);
                        self.vcpus[vcpu_id].lower(VcpuSignal::Intr);
                    }
                }
                DeliveryMode::External => self.vcpus[vcpu_id].lower(VcpuSignal::Intr),
                _ => {}
            }
        }
    }

    /// Delivers one local vector table entry to its owning CPU. Masked
    /// entries are a no-op.
    pub fn local_deliver(&mut self, vcpu_id: usize, lvt_index: usize) {
        let lvt = self.apics[vcpu_id].lvt_entry(lvt_index);
        if lvt & LVT_MASKED != 0 {
            return;
        }
        match DeliveryMode::from_bits(lvt >> 8) {
            DeliveryMode::Fixed => {
                // Only the LINT pins honor the level-trigger configuration
                // bit; every other local source is edge.
                let is_lint = lvt_index == LVT_LINT0 || lvt_index == LVT_LINT0 + 1;
                let trigger = if is_lint && lvt & LVT_LEVEL_TRIGGER != 0 {
                    TriggerMode::Level
                } else {
                    TriggerMode::Edge
                };
                self.apics[vcpu_id].accept_irq(&InterruptData {
                    vector: lvt as u8,
                    delivery: DeliveryMode::Fixed,
                    trigger,
                    level: Level::Assert,
                });
                self.update_vcpu(vcpu_id);
            }
            DeliveryMode::SMI => self.vcpus[vcpu_id].raise(VcpuSignal::Smi),
            DeliveryMode::NMI => self.vcpus[vcpu_id].raise(VcpuSignal::Nmi),
            DeliveryMode::External => self.vcpus[vcpu_id].raise(VcpuSignal::Intr),
            mode => debug!(
                "cpu {} lvt {} ignoring local delivery mode {:?}",
                vcpu_id, lvt_index, mode
            ),
        }
    }

    /// Handles expiration of `vcpu_id`'s APIC timer: deliver the timer's
    /// local vector, then let the APIC rearm its periodic deadline.
    pub fn handle_timer_expiration(&mut self, vcpu_id: usize) {
        if self.apics[vcpu_id].handle_timer_expiration() {
            self.local_deliver(vcpu_id, LVT_TIMER);
        }
    }

    /// CPU-side consumption of a startup IPI: returns the vector whose
    /// `<< 12` is the startup instruction-pointer page and leaves the
    /// wait-for-SIPI state, or None when no SIPI is being waited for.
    pub fn consume_sipi(&mut self, vcpu_id: usize) -> Option<u8> {
        self.apics[vcpu_id].consume_sipi()
    }

    /// CPU-side completion of an INIT: the APIC returns to its wait-for-SIPI
    /// reset state, keeping only its id and base.
    pub fn init_reset(&mut self, vcpu_id: usize) {
        self.apics[vcpu_id].init_reset();
    }

    /// CR8 coupling: task priority as seen by the CPU.
    pub fn set_tpr(&mut self, vcpu_id: usize, value: u8) {
        self.apics[vcpu_id].set_tpr(value);
        self.update_vcpu(vcpu_id);
    }

    pub fn tpr(&self, vcpu_id: usize) -> u8 {
        self.apics[vcpu_id].tpr()
    }
}

impl Suspendable for ApicChip {
    fn snapshot(&self) -> anyhow::Result<serde_json::Value> {
        let apics = self
            .apics
            .iter()
            .enumerate()
            .map(|(i, apic)| {
                apic.snapshot()
                    .with_context(|| format!("failed to snapshot apic {}", i))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(serde_json::json!({ "apics": apics }))
    }

    fn restore(&mut self, data: serde_json::Value) -> anyhow::Result<()> {
        let mut snaps: Vec<serde_json::Value> = serde_json::from_value(
            data.get("apics")
                .context("ApicChip snapshot has no apics entry")?
                .clone(),
        )
        .context("failed to deserialize ApicChip snapshot")?;
        if snaps.len() != self.apics.len() {
            anyhow::bail!(
                "ApicChip snapshot has {} apics, expected {}",
                snaps.len(),
                self.apics.len()
            );
        }
        for (i, (apic, snap)) in self.apics.iter_mut().zip(snaps.drain(..)).enumerate() {
            apic.restore(snap)
                .with_context(|| format!("failed to restore apic {}", i))?;
        }
        Ok(())
    }
}

impl BusDevice for ApicChip {
    fn debug_label(&self) -> String {
        "userspace APIC".to_string()
    }

    fn read(&mut self, info: BusAccessInfo, data: &mut [u8]) {
        match self.apics.get_mut(info.id) {
            Some(apic) => apic.mmio_read(info.offset, data),
            None => warn!("apic read from non-existent vcpu {}", info.id),
        }
    }

    fn write(&mut self, info: BusAccessInfo, data: &[u8]) {
        let msg = match self.apics.get_mut(info.id) {
            Some(apic) => apic.mmio_write(info.offset, data),
            None => {
                warn!("apic write from non-existent vcpu {}", info.id);
                return;
            }
        };
        if let Some(msg) = msg {
            self.handle_msg(msg);
        }
        // A write may have unmasked a latched request (task priority,
        // software enable) or retired one (end of interrupt).
        self.update_vcpu(info.id);
    }
}
