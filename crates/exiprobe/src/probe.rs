//! Probe run over the memory card channels.
//!
//! For every configured channel this attaches, identifies the card, decodes its
//! geometry, clears status, enables the card interrupt and then, at each
//! configured clock speed, programs the ramp page, reads it back and compares.
//! Only a bus failure stops the whole run; card-level problems are recorded per
//! channel and the next channel is probed.

use crate::bus::{Channel, ClockSpeed, ExiBus};
use crate::command::CardAddress;
use crate::error::{Error, Result};
use crate::geometry::CardGeometry;
use crate::memcard::{CardSession, CardStatus};
use exiprobe_hw::memcard::PAGE_SIZE;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Speed used for identification and status handling outside the test loop
const SETUP_SPEED: ClockSpeed = ClockSpeed::Mhz16;

/// Configuration for a probe run
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    pub channels: Vec<Channel>,
    pub speeds: Vec<ClockSpeed>,
    /// Card offset programmed and read back at each speed
    pub offset: CardAddress,
    /// Bound for ready polling and DMA completion; `None` waits forever
    pub timeout: Option<Duration>,
    pub enable_interrupts: bool,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            channels: Channel::ALL.to_vec(),
            speeds: vec![ClockSpeed::Mhz1],
            offset: CardAddress::masked(0xa000),
            timeout: None,
            enable_interrupts: true,
        }
    }
}

/// Result of one program/read cycle at a given speed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpeedReport {
    pub speed: ClockSpeed,
    /// First page of the read buffer
    pub read_back: Vec<u8>,
    pub matches: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelReport {
    pub geometry: CardGeometry,
    pub initial_status: CardStatus,
    pub cleared_status: CardStatus,
    pub speeds: Vec<SpeedReport>,
}

impl ChannelReport {
    pub fn all_match(&self) -> bool {
        self.speeds.iter().all(|s| s.matches)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelOutcome {
    NotAttached,
    UndefinedGeometry { id: u16, index: u8 },
    Unresponsive { waited: Duration },
    Completed(ChannelReport),
}

impl ChannelOutcome {
    /// True when nothing on this channel needs attention
    pub fn is_ok(&self) -> bool {
        match self {
            ChannelOutcome::NotAttached => true,
            ChannelOutcome::Completed(report) => report.all_match(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeReport {
    pub channels: Vec<(Channel, ChannelOutcome)>,
    pub elapsed: Duration,
}

impl ProbeReport {
    pub fn passed(&self) -> bool {
        self.channels.iter().all(|(_, outcome)| outcome.is_ok())
    }
}

/// Format bytes 16 to a line, the layout of the probe's read-data dump
pub fn hex_dump(data: &[u8]) -> Vec<String> {
    data.chunks(16)
        .map(|line| {
            line.iter()
                .map(|b| format!("{:#04x}", b))
                .collect::<Vec<_>>()
                .join(" ")
        })
        .collect()
}

pub struct Probe<B: ExiBus> {
    bus: Arc<B>,
    config: ProbeConfig,
}

impl<B: ExiBus> Probe<B> {
    pub fn new(bus: Arc<B>, config: ProbeConfig) -> Self {
        Self { bus, config }
    }

    pub fn config(&self) -> &ProbeConfig {
        &self.config
    }

    /// Probe every configured channel. Returns `Err` only for fatal bus errors.
    pub fn run(&self) -> Result<ProbeReport> {
        let start = Instant::now();
        let mut channels = Vec::with_capacity(self.config.channels.len());

        for &channel in &self.config.channels {
            let _span = tracing::info_span!("channel", index = channel.index()).entered();

            let attached = self.bus.attach(channel)?;
            info!(
                "{} state:{:#04x}",
                channel,
                if attached { exiprobe_hw::exi::state::ATTACH } else { 0 }
            );

            let outcome = if attached {
                let outcome = self.probe_card(channel);
                self.bus.detach(channel)?;
                match outcome {
                    Ok(report) => ChannelOutcome::Completed(report),
                    Err(Error::UndefinedGeometry { id, index }) => {
                        error!(
                            "{} undefined geometry; id:{:#06x} sector size class {}",
                            channel, id, index
                        );
                        ChannelOutcome::UndefinedGeometry { id, index }
                    }
                    Err(Error::NotAttached(_)) => {
                        warn!("{} card removed during probe", channel);
                        ChannelOutcome::NotAttached
                    }
                    Err(Error::DeviceUnresponsive { waited, .. }) => {
                        error!("{} device unresponsive after {:?}", channel, waited);
                        ChannelOutcome::Unresponsive { waited }
                    }
                    Err(e) => return Err(e),
                }
            } else {
                info!("{} nothing attached, skipping", channel);
                self.bus.detach(channel)?;
                ChannelOutcome::NotAttached
            };
            channels.push((channel, outcome));
        }

        Ok(ProbeReport {
            channels,
            elapsed: start.elapsed(),
        })
    }

    fn probe_card(&self, channel: Channel) -> Result<ChannelReport> {
        let mut session = CardSession::new(Arc::clone(&self.bus), channel, self.config.timeout);

        let id = session.identify(SETUP_SPEED)?;
        let initial_status = session.status(SETUP_SPEED)?;
        let geometry = CardGeometry::decode(id)?;
        info!("{} start; {}, status:{}", channel, geometry, initial_status);

        session.clear_status(SETUP_SPEED)?;
        let cleared_status = session.status(SETUP_SPEED)?;
        info!("{} status cleared; status:{}", channel, cleared_status);

        if !cleared_status.is_unlocked() {
            warn!("{} card needs unlocked;", channel);
        }

        if self.config.enable_interrupts {
            session.enable_interrupt(SETUP_SPEED, true)?;
            session.install_interrupt_handler()?;
        }

        let mut speeds = Vec::with_capacity(self.config.speeds.len());
        for &speed in &self.config.speeds {
            info!("{} speed:{:#04x}, testing...", channel, speed as u8);

            session.begin_program(speed, self.config.offset)?;
            session.join()?;

            session.begin_read(speed, geometry.latency, self.config.offset)?;
            session.join()?;

            let read_back = session
                .read_buffer()?
                .map(|data| data[..PAGE_SIZE].to_vec())
                .unwrap_or_default();

            info!("--Read Data Start--");
            for line in hex_dump(&read_back) {
                info!("{}", line);
            }
            info!("--Read Data End--");

            let matches = read_back == session.write_buffer();
            if !matches {
                warn!("{} read back differs from programmed page at {}", channel, speed);
            }
            speeds.push(SpeedReport {
                speed,
                read_back,
                matches,
            });
        }

        if self.config.enable_interrupts {
            self.bus.register_exi_handler(channel, None)?;
        }

        Ok(ChannelReport {
            geometry,
            initial_status,
            cleared_status,
            speeds,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_dump_sixteen_per_line() {
        let data: Vec<u8> = (0..20).collect();
        let lines = hex_dump(&data);
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("0x00 0x01 0x02"));
        assert!(lines[0].ends_with("0x0f"));
        assert_eq!(lines[1], "0x10 0x11 0x12 0x13");
    }

    #[test]
    fn default_config_matches_probe_defaults() {
        let config = ProbeConfig::default();
        assert_eq!(config.channels, vec![Channel::Exi0, Channel::Exi1]);
        assert_eq!(config.speeds, vec![ClockSpeed::Mhz1]);
        assert_eq!(config.offset.offset(), 0xa000);
        assert!(config.timeout.is_none());
    }

    #[test]
    fn outcome_health() {
        assert!(ChannelOutcome::NotAttached.is_ok());
        assert!(!ChannelOutcome::UndefinedGeometry { id: 0x3080, index: 6 }.is_ok());
        assert!(!ChannelOutcome::Unresponsive {
            waited: Duration::from_secs(1)
        }
        .is_ok());
    }
}
