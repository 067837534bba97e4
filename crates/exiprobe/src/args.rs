use crate::bus::{Channel, ClockSpeed};
use crate::command::CardAddress;
use crate::emu::{EmulatedBus, EmulatedCard};
use crate::error::Error;
use crate::probe::ProbeConfig;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug, Clone)]
#[command(about = "Drive memory cards over the EXI bus and check their command protocol")]
pub struct Args {
    /// Channels to probe (0 = slot A, 1 = slot B). Defaults to both.
    #[arg(long = "channel", short = 'c', value_parser = parse_channel)]
    pub channels: Vec<Channel>,

    /// Clock speeds to test, as EXI clock selections 0-5 (1MHz-32MHz)
    #[arg(long = "speed", short = 's', value_parser = parse_speed, default_value = "0")]
    pub speeds: Vec<ClockSpeed>,

    /// Card offset to program and read back (hex: 0x1234 or decimal: 1234)
    #[arg(long, value_parser = parse_hex_or_dec, default_value = "0xa000")]
    pub offset: u64,

    /// Give up on a card that is not ready or does not finish a transfer
    /// within this many milliseconds. Without it the probe waits forever.
    #[arg(long)]
    pub timeout_ms: Option<u64>,

    /// Leave the card interrupt disabled
    #[arg(long)]
    pub no_interrupts: bool,

    /// Identification word of the emulated card in slot A (hex or decimal).
    /// Omit to leave the slot empty.
    #[arg(long, value_parser = parse_hex_or_dec)]
    pub card_a: Option<u64>,

    /// Identification word of the emulated card in slot B (hex or decimal)
    #[arg(long, value_parser = parse_hex_or_dec)]
    pub card_b: Option<u64>,

    /// Raw image file backing the slot A card
    #[arg(long)]
    pub image_a: Option<PathBuf>,

    /// Raw image file backing the slot B card
    #[arg(long)]
    pub image_b: Option<PathBuf>,

    /// Status polls the emulated cards report busy after each page program
    #[arg(long, default_value_t = 0)]
    pub settle_polls: u32,
}

impl Args {
    /// Validate that the arguments are consistent
    pub fn validate(&self) -> Result<(), String> {
        let fits = u32::try_from(self.offset).is_ok_and(|o| CardAddress::new(o).is_ok());
        if !fits {
            return Err(format!(
                "offset {:#x} does not fit the card address field",
                self.offset
            ));
        }
        for (name, id) in [("--card-a", self.card_a), ("--card-b", self.card_b)] {
            if let Some(id) = id
                && id > u16::MAX as u64
            {
                return Err(format!("{} {:#x} is wider than 16 bits", name, id));
            }
        }
        if self.image_a.is_some() && self.card_a.is_none() {
            return Err("--image-a requires --card-a to be specified".to_string());
        }
        if self.image_b.is_some() && self.card_b.is_none() {
            return Err("--image-b requires --card-b to be specified".to_string());
        }
        Ok(())
    }

    /// Convert Args to ProbeConfig
    pub fn to_probe_config(&self) -> ProbeConfig {
        let defaults = ProbeConfig::default();
        ProbeConfig {
            channels: if self.channels.is_empty() {
                defaults.channels
            } else {
                self.channels.clone()
            },
            speeds: if self.speeds.is_empty() {
                defaults.speeds
            } else {
                self.speeds.clone()
            },
            offset: CardAddress::masked(self.offset as u32),
            timeout: self.timeout_ms.map(Duration::from_millis),
            enable_interrupts: !self.no_interrupts,
        }
    }

    /// Build the emulated bus with the cards described on the command line
    pub fn build_bus(&self) -> Result<EmulatedBus, Error> {
        let bus = EmulatedBus::new();
        let slots = [
            (Channel::Exi0, self.card_a, &self.image_a),
            (Channel::Exi1, self.card_b, &self.image_b),
        ];
        for (channel, id, image) in slots {
            let Some(id) = id else { continue };
            let mut card = EmulatedCard::new(id as u16).with_settle_polls(self.settle_polls);
            if let Some(path) = image {
                card = card.with_image(path)?;
            }
            bus.insert_card(channel, card);
        }
        Ok(bus)
    }
}

pub fn parse_hex_or_dec(s: &str) -> Result<u64, std::num::ParseIntError> {
    if let Some(hex) = s.strip_prefix("0x") {
        u64::from_str_radix(hex, 16)
    } else {
        s.parse()
    }
}

fn parse_channel(s: &str) -> Result<Channel, String> {
    let index: usize = s.parse().map_err(|e| format!("{}", e))?;
    Channel::from_index(index).ok_or_else(|| format!("channel {} does not exist (0 or 1)", index))
}

fn parse_speed(s: &str) -> Result<ClockSpeed, String> {
    let raw: u8 = s.parse().map_err(|e| format!("{}", e))?;
    ClockSpeed::from_raw(raw).ok_or_else(|| format!("clock selection {} is not 0-5", raw))
}
