use exiprobe::bus::{Channel, ClockSpeed, ExiBus};
use exiprobe::emu::{BusEvent, DmaMode, EmulatedBus, EmulatedCard};
use exiprobe::memcard::ramp_pattern;
use exiprobe::probe::{ChannelOutcome, Probe, ProbeConfig};
use exiprobe_hw::memcard::{PAGE_SIZE, card_id};
use std::sync::Arc;
use std::time::Duration;

fn completed(outcome: &ChannelOutcome) -> &exiprobe::probe::ChannelReport {
    match outcome {
        ChannelOutcome::Completed(report) => report,
        other => panic!("channel did not complete: {:?}", other),
    }
}

#[test]
fn round_trip_on_both_slots() {
    let bus = EmulatedBus::new()
        .with_card(Channel::Exi0, EmulatedCard::new(card_id::MEMCARD_251))
        .with_card(Channel::Exi1, EmulatedCard::new(card_id::MEMCARD_2043));
    let probe = Probe::new(Arc::new(bus), ProbeConfig::default());

    let report = probe.run().unwrap();
    assert!(report.passed());
    assert_eq!(report.channels.len(), 2);

    for (_, outcome) in &report.channels {
        let card = completed(outcome);
        assert!(card.cleared_status.is_ready());
        assert_eq!(card.speeds.len(), 1);
        assert_eq!(card.speeds[0].read_back, ramp_pattern().to_vec());
    }
    let (_, slot_b) = &report.channels[1];
    assert_eq!(completed(slot_b).geometry.size_mb, 16);
}

#[test]
fn every_clock_speed_reads_back() {
    let bus = Arc::new(
        EmulatedBus::new().with_card(Channel::Exi0, EmulatedCard::new(card_id::MEMCARD_1019)),
    );
    let config = ProbeConfig {
        channels: vec![Channel::Exi0],
        speeds: ClockSpeed::ALL.to_vec(),
        ..ProbeConfig::default()
    };
    let report = Probe::new(Arc::clone(&bus), config).run().unwrap();

    let card = completed(&report.channels[0].1);
    assert_eq!(card.speeds.len(), ClockSpeed::ALL.len());
    assert!(card.all_match());
    assert_eq!(
        bus.with_card_mut(Channel::Exi0, |card| card.pages_programmed()),
        Some(ClockSpeed::ALL.len() as u32)
    );
    // Probe detaches when done
    assert!(!bus.is_attached(Channel::Exi0));
}

#[test]
fn empty_slot_is_skipped() {
    let bus = EmulatedBus::new().with_card(Channel::Exi1, EmulatedCard::new(card_id::MEMCARD_59));
    let report = Probe::new(Arc::new(bus), ProbeConfig::default()).run().unwrap();

    assert_eq!(report.channels[0], (Channel::Exi0, ChannelOutcome::NotAttached));
    assert!(report.channels[1].1.is_ok());
    assert!(report.passed());
}

#[test]
fn undefined_sector_class_is_reported() {
    // Sector size class 6 in bits 11-13
    let id = 0x3080;
    let bus = Arc::new(EmulatedBus::new().with_card(Channel::Exi0, EmulatedCard::new(id)));
    let config = ProbeConfig {
        channels: vec![Channel::Exi0],
        ..ProbeConfig::default()
    };
    let report = Probe::new(Arc::clone(&bus), config).run().unwrap();

    assert_eq!(
        report.channels[0].1,
        ChannelOutcome::UndefinedGeometry { id, index: 6 }
    );
    assert!(!report.passed());
    // No transfer was attempted
    assert_eq!(bus.with_card_mut(Channel::Exi0, |card| card.pages_programmed()), Some(0));
}

#[test]
fn stalled_dma_marks_channel_unresponsive() {
    let bus = EmulatedBus::new()
        .with_dma_mode(DmaMode::Manual)
        .with_card(Channel::Exi0, EmulatedCard::new(card_id::MEMCARD_251));
    let config = ProbeConfig {
        channels: vec![Channel::Exi0],
        timeout: Some(Duration::from_millis(25)),
        enable_interrupts: false,
        ..ProbeConfig::default()
    };
    let report = Probe::new(Arc::new(bus), config).run().unwrap();

    assert!(matches!(
        report.channels[0].1,
        ChannelOutcome::Unresponsive { .. }
    ));
    assert!(!report.passed());
}

#[test]
fn locked_card_still_probes() {
    let bus = EmulatedBus::new().with_card(Channel::Exi0, EmulatedCard::new(card_id::MEMCARD_251).locked());
    let config = ProbeConfig {
        channels: vec![Channel::Exi0],
        enable_interrupts: false,
        ..ProbeConfig::default()
    };
    let report = Probe::new(Arc::new(bus), config).run().unwrap();

    let card = completed(&report.channels[0].1);
    assert!(!card.cleared_status.is_unlocked());
    assert!(card.all_match());
}

#[test]
fn interrupt_enabled_card_raises_on_program() {
    let bus = Arc::new(
        EmulatedBus::new().with_card(Channel::Exi0, EmulatedCard::new(card_id::MEMCARD_251)),
    );
    let config = ProbeConfig {
        channels: vec![Channel::Exi0],
        ..ProbeConfig::default()
    };
    let report = Probe::new(Arc::clone(&bus), config).run().unwrap();
    assert!(report.passed());

    let events = bus.take_events(Channel::Exi0);
    assert!(events.contains(&BusEvent::ImmWrite(vec![0x81, 0x01])));
    assert!(events.contains(&BusEvent::Interrupt));
}

#[test]
fn settling_card_still_round_trips() {
    let bus = EmulatedBus::new()
        .with_card(Channel::Exi0, EmulatedCard::new(card_id::MEMCARD_251).with_settle_polls(5));
    let config = ProbeConfig {
        channels: vec![Channel::Exi0],
        speeds: vec![ClockSpeed::Mhz4, ClockSpeed::Mhz8],
        ..ProbeConfig::default()
    };
    let report = Probe::new(Arc::new(bus), config).run().unwrap();
    assert!(report.passed());
}

#[test]
fn image_file_receives_programmed_page() {
    let path = std::env::temp_dir().join(format!("exiprobe-image-{}.raw", std::process::id()));
    let _ = std::fs::remove_file(&path);

    let card = EmulatedCard::new(card_id::MEMCARD_59).with_image(&path).unwrap();
    let bus = EmulatedBus::new().with_card(Channel::Exi0, card);
    let config = ProbeConfig {
        channels: vec![Channel::Exi0],
        enable_interrupts: false,
        ..ProbeConfig::default()
    };
    let report = Probe::new(Arc::new(bus), config).run().unwrap();
    assert!(report.passed());

    let image = std::fs::read(&path).unwrap();
    assert_eq!(&image[0xa000..0xa000 + PAGE_SIZE], ramp_pattern().as_slice());

    // A card opened on the same image starts with the page already written
    let reopened = EmulatedCard::new(card_id::MEMCARD_59).with_image(&path).unwrap();
    assert_eq!(&reopened.data()[0xa000..0xa000 + PAGE_SIZE], ramp_pattern().as_slice());

    let _ = std::fs::remove_file(&path);
}
