//! Programming mode entry and teardown.
use crate::constants::{ENTRY_KEY, timing};
use crate::error::{Error, Result};
use crate::link::{
    BitLink, BitOrder, BitSequence, BitWidth, IcspPins, RailLevel, VddLevel, VppLevel, VppVolts,
};

/// Progress of the entry handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    Idle,
    LinesLow,
    PowerApplied,
    HighVoltageApplied,
    KeySent,
    Settling,
    Ready,
}

/// Drives the power-up / high-voltage entry handshake.
///
/// There is no resume: every entry starts from `Idle`, and a failed entry
/// is torn down completely before the error is returned.
#[derive(Debug)]
pub struct EntrySequencer {
    state: EntryState,
    volts: VppVolts,
}

impl Default for EntrySequencer {
    fn default() -> Self {
        Self::new()
    }
}

impl EntrySequencer {
    pub fn new() -> Self {
        EntrySequencer {
            state: EntryState::Idle,
            volts: VppVolts::default(),
        }
    }

    /// Check the VPP readback against these nominal levels.
    pub fn with_volts(mut self, volts: VppVolts) -> Self {
        self.volts = volts;
        self
    }

    pub fn volts(&self) -> VppVolts {
        self.volts
    }

    pub fn state(&self) -> EntryState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == EntryState::Ready
    }

    /// Bring the target into command mode with VPP at `level`.
    pub fn enter<P: IcspPins>(&mut self, link: &mut BitLink<P>, level: VppLevel) -> Result<()> {
        if self.state != EntryState::Idle {
            self.teardown(link)?;
        }
        match self.try_enter(link, level) {
            Ok(()) => Ok(()),
            Err(e) => {
                log::warn!("Programming mode entry failed in {:?}", self.state);
                self.teardown(link)?;
                Err(e)
            }
        }
    }

    fn try_enter<P: IcspPins>(&mut self, link: &mut BitLink<P>, level: VppLevel) -> Result<()> {
        if level == VppLevel::Off {
            return Err(Error::ProtocolMisuse("entry requires VPP"));
        }
        let half = link.timing().data_half_period;

        link.set_lines(false, false);
        link.delay(timing::LINES_LOW_HOLD);
        self.state = EntryState::LinesLow;

        link.set_rail(RailLevel::Vdd(VddLevel::On))?;
        link.delay(timing::VDD_SETTLE);
        self.state = EntryState::PowerApplied;

        link.set_rail(RailLevel::Vpp(level))?;
        link.delay(timing::VPP_SETTLE);
        if let Some(volts) = link.vpp_readback() {
            if volts < self.volts.of(level) * 0.9 {
                return Err(Error::EntryFailure {
                    state: self.state,
                    vpp_readback: Some(volts),
                });
            }
        }
        self.state = EntryState::HighVoltageApplied;

        log::debug!("Sending entry key {}", hex::encode(ENTRY_KEY));
        for byte in ENTRY_KEY {
            link.send(
                BitSequence::new(byte as u16, BitWidth::Byte, BitOrder::LsbFirst),
                half,
            );
        }
        self.state = EntryState::KeySent;

        self.state = EntryState::Settling;
        link.delay(timing::ENTRY_SETTLE);
        self.state = EntryState::Ready;
        log::debug!("Programming mode entered (VPP {}V)", self.volts.of(level));
        Ok(())
    }

    /// VPP off, then VDD off, lines left low.
    pub fn teardown<P: IcspPins>(&mut self, link: &mut BitLink<P>) -> Result<()> {
        link.set_rail(RailLevel::Vpp(VppLevel::Off))?;
        link.delay(timing::VPP_FALL);
        link.set_rail(RailLevel::Vdd(VddLevel::Off))?;
        link.delay(timing::VDD_FALL);
        link.set_lines(false, false);
        self.state = EntryState::Idle;
        log::debug!("Programming mode exited");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::LinkTiming;
    use crate::link::sim::{SimConfig, SimEvent, SimulatedTarget};

    fn link(sim: SimulatedTarget) -> BitLink<SimulatedTarget> {
        BitLink::new(sim, LinkTiming::default())
    }

    #[test]
    fn test_entry_reaches_ready() {
        let mut link = link(SimulatedTarget::new_default());
        let mut entry = EntrySequencer::new();
        entry.enter(&mut link, VppLevel::Read).unwrap();
        assert!(entry.is_ready());
        assert!(link.pins().now() > timing::ENTRY_SETTLE);
        assert!(!link.pins().events().contains(&SimEvent::LinesHighAtPowerUp));
        assert_eq!(
            link.pins().events(),
            &[SimEvent::Vdd(VddLevel::On), SimEvent::Vpp(VppLevel::Read)]
        );
    }

    #[test]
    fn test_teardown_order() {
        let mut link = link(SimulatedTarget::new_default());
        let mut entry = EntrySequencer::new();
        entry.enter(&mut link, VppLevel::Program).unwrap();
        entry.teardown(&mut link).unwrap();
        assert_eq!(entry.state(), EntryState::Idle);
        assert_eq!(
            link.pins().events(),
            &[
                SimEvent::Vdd(VddLevel::On),
                SimEvent::Vpp(VppLevel::Program),
                SimEvent::Vpp(VppLevel::Off),
                SimEvent::Vdd(VddLevel::Off),
            ]
        );
        assert_eq!(link.voltage().vpp, VppLevel::Off);
        assert_eq!(link.voltage().vdd, VddLevel::Off);
    }

    #[test]
    fn test_weak_vpp_fails_entry_and_tears_down() {
        let sim = SimulatedTarget::new(SimConfig {
            vpp_limit: 9.0,
            ..Default::default()
        });
        let mut link = link(sim);
        let mut entry = EntrySequencer::new();
        let err = entry.enter(&mut link, VppLevel::Program).unwrap_err();
        match err {
            Error::EntryFailure {
                state,
                vpp_readback,
            } => {
                assert_eq!(state, EntryState::PowerApplied);
                assert_eq!(vpp_readback, Some(9.0));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(entry.state(), EntryState::Idle);
        assert_eq!(link.voltage().vdd, VddLevel::Off);
    }

    #[test]
    fn test_readback_checked_against_part_levels() {
        // 15.5V is fine for the default levels but short of a 17.5V part
        let mut entry = EntrySequencer::new().with_volts(VppVolts {
            read: 12.0,
            program: 17.5,
        });
        let mut link = link(SimulatedTarget::new_default());
        assert!(matches!(
            entry.enter(&mut link, VppLevel::Program),
            Err(Error::EntryFailure {
                vpp_readback: Some(_),
                ..
            })
        ));
        entry.enter(&mut link, VppLevel::Read).unwrap();
        assert!(entry.is_ready());
    }

    #[test]
    fn test_reentry_restarts_from_idle() {
        let mut link = link(SimulatedTarget::new_default());
        let mut entry = EntrySequencer::new();
        entry.enter(&mut link, VppLevel::Read).unwrap();
        entry.enter(&mut link, VppLevel::Program).unwrap();
        assert!(entry.is_ready());
        assert_eq!(
            &link.pins().events()[2..],
            &[
                SimEvent::Vpp(VppLevel::Off),
                SimEvent::Vdd(VddLevel::Off),
                SimEvent::Vdd(VddLevel::On),
                SimEvent::Vpp(VppLevel::Program),
            ]
        );
        assert!(!link.pins().events().contains(&SimEvent::LinesHighAtPowerUp));
    }
}
