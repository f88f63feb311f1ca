// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! End-to-end exercises of the APIC complex through the MMIO bus, the way
//! the surrounding machine drives it.

use std::cell::RefCell;
use std::rc::Rc;

use base::Clock;
use devices::ApicChip;
use devices::Bus;
use devices::DeliveryMode;
use devices::DestinationMode;
use devices::DestinationShorthand;
use devices::Interrupt;
use devices::InterruptData;
use devices::InterruptDestination;
use devices::Level;
use devices::Suspendable;
use devices::TriggerMode;
use devices::Vcpu;
use devices::VcpuSignal;
use devices::APIC_BASE_ADDRESS;
use devices::APIC_MEM_LENGTH_BYTES;

const APIC_ID: u64 = 0x20;
const TPR: u64 = 0x80;
const EOI: u64 = 0xB0;
const ICR_LOW: u64 = 0x300;
const ICR_HIGH: u64 = 0x310;
const LVT_TIMER: u64 = 0x320;
const TIMER_INITIAL_COUNT: u64 = 0x380;
const TIMER_CURRENT_COUNT: u64 = 0x390;
const TIMER_DIVIDE_CONTROL: u64 = 0x3E0;

/// Mock vcpu for observing interrupt signals, including the startup side
/// effects a real CPU loop would apply.
#[derive(Default)]
struct FakeVcpuState {
    raised: Vec<VcpuSignal>,
    lowered: Vec<VcpuSignal>,
    cs_base: u64,
}

struct FakeVcpu {
    bootstrap: bool,
    state: Rc<RefCell<FakeVcpuState>>,
}

impl Vcpu for FakeVcpu {
    fn is_bootstrap(&self) -> bool {
        self.bootstrap
    }

    fn raise(&mut self, signal: VcpuSignal) {
        self.state.borrow_mut().raised.push(signal);
    }

    fn lower(&mut self, signal: VcpuSignal) {
        self.state.borrow_mut().lowered.push(signal);
    }
}

struct TestMachine {
    chip: Rc<RefCell<ApicChip>>,
    mmio_bus: Bus,
    clock: Rc<RefCell<Clock>>,
    vcpu_states: Vec<Rc<RefCell<FakeVcpuState>>>,
}

/// Builds a machine with `num_vcpus` CPUs and the APIC window on the MMIO
/// bus.
fn get_machine(num_vcpus: usize) -> TestMachine {
    let clock = Rc::new(RefCell::new(Clock::new()));
    let mut chip = ApicChip::new(clock.clone());
    let mut vcpu_states = Vec::new();
    for i in 0..num_vcpus {
        let state = Rc::new(RefCell::new(FakeVcpuState::default()));
        chip.add_vcpu(Box::new(FakeVcpu {
            bootstrap: i == 0,
            state: state.clone(),
        }))
        .expect("failed to add vcpu");
        chip.apic_mut(i).set_enabled(true);
        vcpu_states.push(state);
    }

    let chip = Rc::new(RefCell::new(chip));
    let mut mmio_bus = Bus::new();
    mmio_bus
        .insert(chip.clone(), APIC_BASE_ADDRESS, APIC_MEM_LENGTH_BYTES)
        .expect("failed to insert apic window");

    TestMachine {
        chip,
        mmio_bus,
        clock,
        vcpu_states,
    }
}

impl TestMachine {
    /// A dword MMIO write to the APIC page, issued as `vcpu_id`.
    fn write_reg(&mut self, vcpu_id: usize, offset: u64, val: u32) {
        self.mmio_bus.set_access_id(vcpu_id);
        assert!(self
            .mmio_bus
            .write(APIC_BASE_ADDRESS + offset, &val.to_le_bytes()));
    }

    /// A dword MMIO read from the APIC page, issued as `vcpu_id`.
    fn read_reg(&mut self, vcpu_id: usize, offset: u64) -> u32 {
        self.mmio_bus.set_access_id(vcpu_id);
        let mut data = [0u8; 4];
        assert!(self.mmio_bus.read(APIC_BASE_ADDRESS + offset, &mut data));
        u32::from_le_bytes(data)
    }

    fn take_raised(&self, vcpu_id: usize) -> Vec<VcpuSignal> {
        std::mem::take(&mut self.vcpu_states[vcpu_id].borrow_mut().raised)
    }

    /// Mimics the CPU loop's SIPI handling: consume the vector, point the
    /// code segment at the startup page.
    fn deliver_startup(&self, vcpu_id: usize) -> Option<u8> {
        let vector = self.chip.borrow_mut().consume_sipi(vcpu_id)?;
        self.vcpu_states[vcpu_id].borrow_mut().cs_base = u64::from(vector) << 12;
        Some(vector)
    }
}

fn physical_fixed(dest_id: u8, vector: u8) -> Interrupt {
    Interrupt {
        dest: InterruptDestination {
            source_id: 0,
            dest_id,
            shorthand: DestinationShorthand::None,
            mode: DestinationMode::Physical,
        },
        data: InterruptData {
            vector,
            delivery: DeliveryMode::Fixed,
            trigger: TriggerMode::Edge,
            level: Level::Assert,
        },
    }
}

#[test]
fn apic_mmio_ids_follow_access_id() {
    let mut machine = get_machine(2);
    assert_eq!(machine.read_reg(0, APIC_ID), 0);
    assert_eq!(machine.read_reg(1, APIC_ID), 1 << 24);
}

#[test]
fn byte_access_to_apic_window_reads_zero() {
    let mut machine = get_machine(1);
    machine.write_reg(0, TPR, 0x20);

    machine.mmio_bus.set_access_id(0);
    let mut byte = [0xAAu8];
    assert!(machine.mmio_bus.read(APIC_BASE_ADDRESS + TPR, &mut byte));
    assert_eq!(byte, [0]);
    assert_eq!(machine.read_reg(0, TPR), 0x20);
}

#[test]
fn fixed_ipi_via_icr_reaches_target() {
    let mut machine = get_machine(2);
    machine.write_reg(0, ICR_HIGH, 1 << 24);
    machine.write_reg(0, ICR_LOW, 0x45);

    assert_eq!(machine.take_raised(0), vec![]);
    assert_eq!(machine.take_raised(1), vec![VcpuSignal::Intr]);
    assert_eq!(machine.chip.borrow_mut().acknowledge(1), Some(0x45));
    // Once the vector is consumed, the chip releases the interrupt line.
    assert_eq!(
        std::mem::take(&mut machine.vcpu_states[1].borrow_mut().lowered),
        vec![VcpuSignal::Intr]
    );
    machine.write_reg(1, EOI, 0);
    assert_eq!(machine.chip.borrow_mut().acknowledge(1), None);
}

#[test]
fn task_priority_defers_interrupt_until_lowered() {
    let mut machine = get_machine(1);
    machine.write_reg(0, TPR, 0x50);

    machine.chip.borrow_mut().send_irq_to_apics(&physical_fixed(0, 0x52));
    assert_eq!(machine.take_raised(0), vec![]);

    // The masked request is answered with the spurious vector and stays
    // latched.
    let spurious = machine.chip.borrow_mut().acknowledge(0).unwrap();
    assert_eq!(spurious, 0xFF);

    // Lowering the task priority makes the latched request presentable.
    machine.write_reg(0, TPR, 0);
    assert_eq!(machine.take_raised(0), vec![VcpuSignal::Intr]);
    assert_eq!(machine.chip.borrow_mut().acknowledge(0), Some(0x52));
}

#[test]
fn startup_sequence_boots_secondary_cpu() {
    let machine = get_machine(2);
    {
        let mut chip = machine.chip.borrow_mut();
        chip.send_irq_to_apics(&Interrupt {
            dest: InterruptDestination {
                source_id: 0,
                dest_id: 1,
                shorthand: DestinationShorthand::None,
                mode: DestinationMode::Physical,
            },
            data: InterruptData {
                vector: 2,
                delivery: DeliveryMode::Startup,
                trigger: TriggerMode::Edge,
                level: Level::Assert,
            },
        });
    }
    assert_eq!(machine.take_raised(1), vec![VcpuSignal::Startup]);

    assert_eq!(machine.deliver_startup(1), Some(2));
    assert_eq!(machine.vcpu_states[1].borrow().cs_base, 0x2000);
    assert!(!machine.chip.borrow().apic(1).waiting_for_sipi());
}

#[test]
fn periodic_timer_fires_on_clock_advance() {
    let mut machine = get_machine(1);
    // Divide by 2, periodic, vector 0xEC, count 999.
    machine.write_reg(0, TIMER_DIVIDE_CONTROL, 0);
    machine.write_reg(0, LVT_TIMER, 0xEC | (1 << 17));
    machine.write_reg(0, TIMER_INITIAL_COUNT, 999);

    let mut fires = 0;
    for _ in 0..2 {
        let expired = machine.clock.borrow_mut().add_ns(2 * 1000);
        for token in expired {
            assert_eq!(token, machine.chip.borrow().timer_token(0));
            machine.chip.borrow_mut().handle_timer_expiration(0);
            fires += 1;
        }
        assert_eq!(machine.read_reg(0, TIMER_CURRENT_COUNT), 999);
        assert_eq!(machine.take_raised(0), vec![VcpuSignal::Intr]);
        assert_eq!(machine.chip.borrow_mut().acknowledge(0), Some(0xEC));
        machine.write_reg(0, EOI, 0);
    }
    assert_eq!(fires, 2);
}

#[test]
fn machine_snapshot_restores_pending_interrupts() {
    let machine = get_machine(2);
    machine
        .chip
        .borrow_mut()
        .send_irq_to_apics(&physical_fixed(1, 0x3C));
    let snap = machine.chip.borrow().snapshot().unwrap();

    let restored = get_machine(2);
    restored.chip.borrow_mut().restore(snap).unwrap();
    assert_eq!(restored.chip.borrow_mut().acknowledge(1), Some(0x3C));
}
