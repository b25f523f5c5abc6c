//! ICSP pins on a Linux GPIO character device.
//!
//! DATA and CLOCK are wired straight to the target. VDD and the two VPP
//! levels are switched by enable lines driving external supplies.
use std::time::{Duration, Instant};

use gpiocdev::line::{Offset, Value};
use gpiocdev::request::{Config, Request};

use crate::error::{Error, Result};

use super::{IcspPins, VddLevel, VppLevel};

/// Delays shorter than this are busy-waited; the scheduler cannot hit them.
const SPIN_LIMIT: Duration = Duration::from_millis(1);

#[derive(Debug, Clone)]
pub struct GpioPinsConfig {
    /// Device path (e.g., "/dev/gpiochip0")
    pub device: String,
    pub data: Offset,
    pub clock: Offset,
    /// Enables the VDD supply
    pub vdd: Offset,
    /// Enables the 12V VPP supply
    pub vpp_read: Offset,
    /// Enables the 15.5V VPP supply
    pub vpp_program: Offset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DataDirection {
    Output,
    Input,
}

fn level(high: bool) -> Value {
    if high { Value::Active } else { Value::Inactive }
}

pub struct GpioPins {
    request: Request,
    config: GpioPinsConfig,
    direction: DataDirection,
}

impl GpioPins {
    pub fn open(config: &GpioPinsConfig) -> Result<Self> {
        if config.device.is_empty() {
            return Err(Error::Transport("no GPIO chip given".into()));
        }
        log::debug!("Opening GPIO chip {}", config.device);

        // Everything low and every supply off until the entry sequence runs
        let mut req = Config::default();
        for line in [
            config.data,
            config.clock,
            config.vdd,
            config.vpp_read,
            config.vpp_program,
        ] {
            req.with_line(line).as_output(Value::Inactive);
        }
        let request = Request::from_config(req)
            .on_chip(&config.device)
            .with_consumer("scprog")
            .request()
            .map_err(|e| Error::Transport(format!("GPIO line request failed: {}", e)))?;

        log::info!(
            "Opened {} (dat={}, clk={}, vdd={}, vpp12={}, vpp15={})",
            config.device,
            config.data,
            config.clock,
            config.vdd,
            config.vpp_read,
            config.vpp_program
        );
        Ok(GpioPins {
            request,
            config: config.clone(),
            direction: DataDirection::Output,
        })
    }

    fn set(&self, line: Offset, high: bool) {
        if let Err(e) = self.request.set_value(line, level(high)) {
            log::error!("Failed to set line {}: {}", line, e);
        }
    }

    fn data_direction(&mut self, direction: DataDirection, high: bool) {
        if self.direction == direction {
            return;
        }
        let mut cfg = Config::default();
        match direction {
            DataDirection::Output => {
                cfg.with_line(self.config.data).as_output(level(high));
            }
            DataDirection::Input => {
                cfg.with_line(self.config.data).as_input();
            }
        }
        if let Err(e) = self.request.reconfigure(&cfg) {
            log::error!("Failed to turn DATA around to {:?}: {}", direction, e);
        }
        self.direction = direction;
    }
}

impl IcspPins for GpioPins {
    fn set_data(&mut self, high: bool) {
        if self.direction == DataDirection::Input {
            self.data_direction(DataDirection::Output, high);
        } else {
            self.set(self.config.data, high);
        }
    }

    fn release_data(&mut self) {
        self.data_direction(DataDirection::Input, false);
    }

    fn get_data(&mut self) -> bool {
        matches!(self.request.value(self.config.data), Ok(Value::Active))
    }

    fn set_clock(&mut self, high: bool) {
        self.set(self.config.clock, high);
    }

    fn set_vdd(&mut self, level: VddLevel) {
        self.set(self.config.vdd, level == VddLevel::On);
    }

    fn set_vpp(&mut self, level: VppLevel) {
        // break before make, the supplies must never be enabled together
        self.set(self.config.vpp_read, false);
        self.set(self.config.vpp_program, false);
        match level {
            VppLevel::Off => (),
            VppLevel::Read => self.set(self.config.vpp_read, true),
            VppLevel::Program => self.set(self.config.vpp_program, true),
        }
    }

    fn delay(&mut self, duration: Duration) {
        if duration >= SPIN_LIMIT {
            std::thread::sleep(duration);
            return;
        }
        let start = Instant::now();
        while start.elapsed() < duration {
            std::hint::spin_loop();
        }
    }
}

impl Drop for GpioPins {
    fn drop(&mut self) {
        self.set_vpp(VppLevel::Off);
        self.set(self.config.vdd, false);
    }
}
