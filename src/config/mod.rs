use crate::{
    args::Args,
    comms::{AxisMap, AxisSetError},
};
use anyhow::Result;
use figment::{
    providers::{Format, Toml},
    Figment,
};
use indexmap::IndexMap;
use serde::{
    de::{Unexpected, Visitor},
    Deserialize, Deserializer,
};
use thiserror::Error;
use tracing::Level;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    AxisSet(#[from] AxisSetError),
    #[error("missing [stepper.{}] section for configured axis {}", .0.to_ascii_lowercase(), .0)]
    MissingStepper(char),
}

struct LevelVisitor();

impl<'de> Visitor<'de> for LevelVisitor {
    type Value = Level;

    fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(formatter, "one of \"error\", \"warn\", \"info\", \"debug\" or \"trace\"")
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        match v {
            "error" => Ok(Level::ERROR),
            "warn" => Ok(Level::WARN),
            "info" => Ok(Level::INFO),
            "debug" => Ok(Level::DEBUG),
            "trace" => Ok(Level::TRACE),
            _ => Err(serde::de::Error::invalid_value(Unexpected::Str(v), &self)),
        }
    }
}

fn deserialize_level<'de, D>(deserializer: D) -> Result<Level, D::Error>
where
    D: Deserializer<'de>,
{
    deserializer.deserialize_str(LevelVisitor())
}

struct PositiveF64Visitor();

impl<'de> Visitor<'de> for PositiveF64Visitor {
    type Value = f64;

    fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(formatter, "a number > 0")
    }

    fn visit_f64<E>(self, v: f64) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        if v > 0. {
            Ok(v)
        } else {
            Err(serde::de::Error::invalid_value(Unexpected::Float(v), &self))
        }
    }

    // has to be there as well since toml deserializes whole numbers as i64
    fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        self.visit_f64(v as f64)
    }

    fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        self.visit_f64(v as f64)
    }
}

fn deserialize_positive<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    deserializer.deserialize_f64(PositiveF64Visitor())
}

//

fn default_homing_speed() -> f64 {
    5.0
}

fn default_retract_dist() -> f64 {
    5.0
}

fn default_max_extrude_only_distance() -> f64 {
    50.0
}

fn default_instant_corner_velocity() -> f64 {
    1.0
}

fn default_min_extrude_temp() -> f64 {
    170.0
}

//

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct Log {
    #[serde(deserialize_with = "deserialize_level")]
    pub level: Level,
}

impl Default for Log {
    fn default() -> Self {
        Self { level: Level::WARN }
    }
}

//

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct Printer {
    // contiguous prefix of XYZABC, e.g. "XYZ" or "XYZABC"
    pub axis: String,
    pub relative_e_restore: bool,
    pub max_velocity: f64,
    pub max_accel: f64,
    pub max_z_velocity: Option<f64>,
    pub max_z_accel: Option<f64>,
}

impl Default for Printer {
    fn default() -> Self {
        Self {
            axis: String::from("XYZ"),
            relative_e_restore: true,
            max_velocity: 500.,
            max_accel: 3000.,
            max_z_velocity: None,
            max_z_accel: None,
        }
    }
}

impl Printer {
    pub fn max_z_velocity(&self) -> f64 {
        self.max_z_velocity.unwrap_or(self.max_velocity)
    }

    pub fn max_z_accel(&self) -> f64 {
        self.max_z_accel.unwrap_or(self.max_accel)
    }
}

//

// rail parameters for one axis, table name is the lowercase axis letter,
// e.g. [stepper.x]
#[derive(Debug, Deserialize)]
pub struct Stepper {
    // distance in mm per single step
    #[serde(deserialize_with = "deserialize_positive")]
    pub step_distance: f64,
    #[serde(default)]
    pub position_min: f64,
    pub position_max: f64,
    pub position_endstop: f64,
    #[serde(
        default = "default_homing_speed",
        deserialize_with = "deserialize_positive"
    )]
    pub homing_speed: f64,
    #[serde(default = "default_retract_dist")]
    pub homing_retract_dist: f64,
    pub homing_retract_speed: Option<f64>,
    pub second_homing_speed: Option<f64>,
    // true if the endstop sits at position_max rather than position_min
    #[serde(default)]
    pub homing_positive_dir: bool,
}

impl Stepper {
    pub fn homing_retract_speed(&self) -> f64 {
        self.homing_retract_speed.unwrap_or(self.homing_speed)
    }

    pub fn second_homing_speed(&self) -> f64 {
        self.second_homing_speed.unwrap_or(self.homing_speed / 2.)
    }
}

//

// an [extruder.endstop] table makes the extruder home-able
#[derive(Debug, Deserialize)]
pub struct ExtruderEndstop {
    #[serde(default)]
    pub position_min: f64,
    pub position_max: f64,
    pub position_endstop: f64,
    #[serde(
        default = "default_homing_speed",
        deserialize_with = "deserialize_positive"
    )]
    pub homing_speed: f64,
    #[serde(default = "default_retract_dist")]
    pub homing_retract_dist: f64,
    pub homing_retract_speed: Option<f64>,
    pub second_homing_speed: Option<f64>,
    #[serde(default)]
    pub homing_positive_dir: bool,
}

#[derive(Debug, Deserialize)]
pub struct Extruder {
    #[serde(deserialize_with = "deserialize_positive")]
    pub step_distance: f64,
    #[serde(deserialize_with = "deserialize_positive")]
    pub nozzle_diameter: f64,
    #[serde(deserialize_with = "deserialize_positive")]
    pub filament_diameter: f64,
    pub max_extrude_cross_section: Option<f64>,
    pub max_extrude_only_velocity: Option<f64>,
    pub max_extrude_only_accel: Option<f64>,
    #[serde(default = "default_max_extrude_only_distance")]
    pub max_extrude_only_distance: f64,
    #[serde(default = "default_instant_corner_velocity")]
    pub instantaneous_corner_velocity: f64,
    #[serde(default)]
    pub symmetric_speed_limits: bool,
    #[serde(default = "default_min_extrude_temp")]
    pub min_extrude_temp: f64,
    pub endstop: Option<ExtruderEndstop>,
}

//

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub log: Log,
    #[serde(default)]
    pub printer: Printer,
    #[serde(default)]
    pub stepper: IndexMap<String, Stepper>,
    pub extruder: Option<Extruder>,
}

impl Config {
    pub fn axis_map(&self) -> Result<AxisMap, ConfigError> {
        AxisMap::new(&self.printer.axis).map_err(Into::into)
    }

    pub fn stepper(&self, letter: char) -> Option<&Stepper> {
        self.stepper
            .get(letter.to_ascii_lowercase().to_string().as_str())
    }
}

fn validate(cfg: &Config) -> Result<(), ConfigError> {
    let map = AxisMap::new(&cfg.printer.axis)?;
    for letter in map.names().chars() {
        if cfg.stepper(letter).is_none() {
            return Err(ConfigError::MissingStepper(letter));
        }
    }
    Ok(())
}

pub fn config(args: &Args) -> Result<Config> {
    let cfg: Config = Figment::new()
        .merge(Toml::file(&args.cfg))
        .merge(args)
        .extract()?;
    validate(&cfg)?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    fn extract(toml: &str) -> Result<Config, figment::Error> {
        Figment::new().merge(Toml::string(toml)).extract()
    }

    #[test]
    fn minimal_config_parses_with_defaults() {
        let cfg = extract(
            r#"
            [stepper.x]
            step_distance = 0.0125
            position_max = 200.0
            position_endstop = 0.0
            "#,
        )
        .unwrap();
        assert_eq!(cfg.printer.axis, "XYZ");
        assert!(cfg.printer.relative_e_restore);
        assert_eq!(cfg.log.level, Level::WARN);
        let x = cfg.stepper('X').unwrap();
        assert_eq!(x.homing_speed, 5.0);
        assert_eq!(x.second_homing_speed(), 2.5);
        assert_eq!(x.homing_retract_speed(), 5.0);
        assert!(!x.homing_positive_dir);
    }

    #[test]
    fn rejects_nonpositive_step_distance() {
        let res = extract(
            r#"
            [stepper.x]
            step_distance = 0.0
            position_max = 200.0
            position_endstop = 0.0
            "#,
        );
        assert!(res.is_err());
    }

    #[test]
    fn validate_requires_stepper_section_per_axis() {
        let cfg = extract(
            r#"
            [printer]
            axis = "XYZ"

            [stepper.x]
            step_distance = 0.0125
            position_max = 200.0
            position_endstop = 0.0
            "#,
        )
        .unwrap();
        assert!(matches!(
            validate(&cfg),
            Err(ConfigError::MissingStepper('Y'))
        ));
    }

    #[test]
    fn config_file_via_jail() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "config.toml",
                r#"
                [log]
                level = "info"

                [printer]
                axis = "XYZ"
                max_velocity = 300.0

                [stepper.x]
                step_distance = 0.01
                position_max = 200.0
                position_endstop = 200.0
                homing_positive_dir = true

                [stepper.y]
                step_distance = 0.01
                position_max = 200.0
                position_endstop = 0.0

                [stepper.z]
                step_distance = 0.0025
                position_max = 180.0
                position_endstop = 0.0

                [extruder]
                step_distance = 0.002
                nozzle_diameter = 0.4
                filament_diameter = 1.75
                "#,
            )?;
            let cfg: Config = Figment::new()
                .merge(Toml::file("config.toml"))
                .extract()?;
            assert_eq!(cfg.log.level, Level::INFO);
            assert_eq!(cfg.printer.max_velocity, 300.0);
            assert!(cfg.stepper('X').unwrap().homing_positive_dir);
            let e = cfg.extruder.as_ref().unwrap();
            assert_eq!(e.max_extrude_only_distance, 50.0);
            assert!(e.endstop.is_none());
            Ok(())
        });
    }
}
