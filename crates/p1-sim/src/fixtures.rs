//! ---
//! ems_section: "11-simulation-test-harness"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Reference P1 telegrams."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Reference telegrams captured from a DSMR 4 meter.

/// 24-line telegram. Delivery on L2/L3 is absent and must default to zero.
pub const SAMPLE_TELEGRAM: &str = "/ISk5\\2MT382-1000
1-3:0.2.8(50)
0-0:1.0.0(101209113020W)
0-0:96.1.1(4B384547303034303436333935353037)
1-0:1.8.1(123456.789*kWh)
1-0:1.8.2(123456.789*kWh)
1-0:2.8.1(123456.789*kWh)
1-0:2.8.2(123456.789*kWh)
0-0:96.14.0(0002)
1-0:1.7.0(01.193*kW)
1-0:2.7.0(00.000*kW)
0-0:96.7.21(00004)
0-0:96.7.9(00002)
1-0:32.7.0(220.1*V)
1-0:52.7.0(220.2*V)
1-0:72.7.0(220.3*V)
1-0:31.7.0(001*A)
1-0:51.7.0(002*A)
1-0:71.7.0(003*A)
1-0:21.7.0(01.111*kW)
1-0:41.7.0(02.222*kW)
1-0:61.7.0(03.333*kW)
1-0:22.7.0(04.444*kW)
!EF2F";

/// Lines of [`SAMPLE_TELEGRAM`].
pub fn sample_lines() -> Vec<String> {
    SAMPLE_TELEGRAM.lines().map(str::to_owned).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_is_a_single_complete_telegram() {
        let lines = sample_lines();
        assert_eq!(lines.len(), 24);
        assert_eq!(lines.last().map(String::as_str), Some("!EF2F"));
        assert_eq!(lines.iter().filter(|line| line.starts_with('!')).count(), 1);
    }
}
