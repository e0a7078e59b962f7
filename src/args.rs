use crate::{util::bail_own, APP_NAME};
use clap::Parser;
use figment::{
    value::{Dict, Map, Value},
    Metadata, Profile, Provider,
};
use tracing::Level;

fn parse_loglevel(arg: &str) -> Result<Level, String> {
    Ok(match arg {
        "error" => Level::ERROR,
        "warn" => Level::WARN,
        "info" => Level::INFO,
        "debug" => Level::DEBUG,
        "trace" => Level::TRACE,
        _ => bail_own!(String::from(
            "Allowed log-levels are error, warn, info, debug and trace"
        )),
    })
}

#[derive(Parser, Debug)]
#[clap(version)]
pub struct Args {
    /// Overrides the path to the config file
    #[clap(short, long, default_value_t = format!("/etc/{}/config.toml", APP_NAME))]
    pub cfg: String,
    /// Overrides the log-level set in the config file. If none is set there, "warn"
    /// is used. Must be "error", "warn", "info", "debug" or "trace"
    #[clap(short, long, value_parser = parse_loglevel)]
    pub log_level: Option<Level>,
}

impl Provider for Args {
    fn metadata(&self) -> Metadata {
        Metadata::named("program argument(s)").interpolater(|_, path| match path {
            ["log", "level"] => String::from("-l/--log-level"),
            _ => unreachable!(),
        })
    }

    fn data(&self) -> Result<Map<Profile, Dict>, figment::Error> {
        let mut log = Map::new();
        if let Some(l) = &self.log_level {
            log.insert(
                String::from("level"),
                Value::from(format!("{}", l).to_ascii_lowercase()),
            );
        }
        let mut vals = Map::new();
        vals.insert(String::from("log"), Value::from(log));
        let mut map = Map::new();
        map.insert(Profile::Global, vals);
        Ok(map)
    }
}

pub fn args() -> Args {
    Args::parse()
}
