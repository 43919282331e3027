//! ---
//! ems_section: "11-simulation-test-harness"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Simulated DSMR meter emitting telegrams line by line."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use p1_common::SimulationConfig;
use p1_transport::{LineSource, LineSourceError, Result};
use rand::prelude::*;
use tracing::{debug, info};

const METER_NAME: &str = "simulated-meter";
const INITIAL_REGISTER_KWH: f64 = 1234.567;
/// Upper bound of the per-telegram increment of each energy register.
const REGISTER_DRIFT_KWH: [f64; 4] = [5.0, 6.0, 7.0, 8.0];

/// Meter producing an endless stream of DSMR telegrams.
///
/// Each telegram advances the four energy registers by a random amount and
/// draws new instantaneous power, voltage and current readings. Lines are
/// handed out one per `read_line` call after a random line delay.
#[derive(Debug)]
pub struct SimulatedMeter {
    open: bool,
    rng: StdRng,
    registers: [f64; 4],
    pending: Vec<String>,
    cursor: usize,
    line_delay_ms: (u64, u64),
}

impl SimulatedMeter {
    pub fn new(config: &SimulationConfig) -> Self {
        let min = config.line_delay_min.as_millis() as u64;
        let max = (config.line_delay_max.as_millis() as u64).max(min);
        Self {
            open: false,
            rng: StdRng::seed_from_u64(config.random_seed),
            registers: [INITIAL_REGISTER_KWH; 4],
            pending: Vec::new(),
            cursor: 0,
            line_delay_ms: (min, max),
        }
    }

    /// Energy registers (tariff 1/2 delivered to client, tariff 1/2 delivered by client).
    pub fn registers(&self) -> [f64; 4] {
        self.registers
    }

    /// Render the next telegram and advance the registers.
    pub fn next_telegram(&mut self) -> Vec<String> {
        for (register, drift) in self.registers.iter_mut().zip(REGISTER_DRIFT_KWH) {
            *register += self.rng.gen::<f64>() * drift;
        }

        let draw: [f64; 3] = [
            self.rng.gen_range(0.0..3.0),
            self.rng.gen_range(0.0..3.0),
            self.rng.gen_range(0.0..3.0),
        ];
        let delivery = [
            self.rng.gen_range(0.0..1.5),
            self.rng.gen_range(0.0..1.5),
            self.rng.gen_range(0.0..1.5),
        ];
        let voltage: [f64; 3] = [
            self.rng.gen_range(218.0..242.0),
            self.rng.gen_range(218.0..242.0),
            self.rng.gen_range(218.0..242.0),
        ];
        let current: Vec<u32> = draw
            .iter()
            .zip(voltage.iter())
            .map(|(kw, volt)| (kw * 1000.0 / volt).round() as u32)
            .collect();
        let total_draw: f64 = draw.iter().sum();
        let total_delivery: f64 = delivery.iter().sum();
        let tariff = if self.rng.gen_bool(0.5) { 1 } else { 2 };
        let [t1_in, t2_in, t1_out, t2_out] = self.registers;

        vec![
            "/ISk5\\2MT382-1000".to_owned(),
            String::new(),
            "1-3:0.2.8(50)".to_owned(),
            format!("0-0:1.0.0({}W)", Utc::now().format("%y%m%d%H%M%S")),
            "0-0:96.1.1(4B384547303034303436333935353037)".to_owned(),
            format!("1-0:1.8.1({t1_in:010.3}*kWh)"),
            format!("1-0:1.8.2({t2_in:010.3}*kWh)"),
            format!("1-0:2.8.1({t1_out:010.3}*kWh)"),
            format!("1-0:2.8.2({t2_out:010.3}*kWh)"),
            format!("0-0:96.14.0({tariff:04})"),
            format!("1-0:1.7.0({total_draw:06.3}*kW)"),
            format!("1-0:2.7.0({total_delivery:06.3}*kW)"),
            "0-0:96.7.21(00004)".to_owned(),
            "0-0:96.7.9(00002)".to_owned(),
            "1-0:99.97.0(2)(0-0:96.7.19)(101208152415W)(0000000240*s)(101208151004W)(0000000301*s)"
                .to_owned(),
            "1-0:32.32.0(00002)".to_owned(),
            "1-0:52.32.0(00001)".to_owned(),
            "1-0:72.32.0(00000)".to_owned(),
            format!("1-0:32.7.0({:05.1}*V)", voltage[0]),
            format!("1-0:52.7.0({:05.1}*V)", voltage[1]),
            format!("1-0:72.7.0({:05.1}*V)", voltage[2]),
            format!("1-0:31.7.0({:03}*A)", current[0]),
            format!("1-0:51.7.0({:03}*A)", current[1]),
            format!("1-0:71.7.0({:03}*A)", current[2]),
            format!("1-0:21.7.0({:06.3}*kW)", draw[0]),
            format!("1-0:41.7.0({:06.3}*kW)", draw[1]),
            format!("1-0:61.7.0({:06.3}*kW)", draw[2]),
            format!("1-0:22.7.0({:06.3}*kW)", delivery[0]),
            format!("1-0:42.7.0({:06.3}*kW)", delivery[1]),
            format!("1-0:62.7.0({:06.3}*kW)", delivery[2]),
            "0-1:24.1.0(003)".to_owned(),
            "0-1:96.1.0(3232323241424344313233343536373839)".to_owned(),
            "0-1:24.2.1(101209112500W)(12785.123*m3)".to_owned(),
            "!EF2F".to_owned(),
        ]
    }

    fn line_delay(&mut self) -> Duration {
        let (min, max) = self.line_delay_ms;
        Duration::from_millis(self.rng.gen_range(min..=max))
    }
}

#[async_trait]
impl LineSource for SimulatedMeter {
    fn name(&self) -> &str {
        METER_NAME
    }

    fn is_open(&self) -> bool {
        self.open
    }

    async fn open(&mut self) -> Result<()> {
        if self.open {
            return Err(LineSourceError::AlreadyOpen(METER_NAME.to_owned()));
        }
        self.open = true;
        info!(source = METER_NAME, "simulated meter opened");
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if !self.open {
            return Err(LineSourceError::NotOpen(METER_NAME.to_owned()));
        }
        self.open = false;
        info!(source = METER_NAME, "simulated meter closed");
        Ok(())
    }

    async fn read_line(&mut self, timeout: Duration) -> Result<String> {
        if !self.open {
            return Err(LineSourceError::NotOpen(METER_NAME.to_owned()));
        }

        let delay = self.line_delay();
        if delay > timeout {
            tokio::time::sleep(timeout).await;
            return Err(LineSourceError::Timeout(timeout));
        }
        tokio::time::sleep(delay).await;

        if self.cursor >= self.pending.len() {
            self.pending = self.next_telegram();
            self.cursor = 0;
            debug!(source = METER_NAME, registers = ?self.registers, "generated telegram");
        }
        let line = std::mem::take(&mut self.pending[self.cursor]);
        self.cursor += 1;
        Ok(line)
    }
}
