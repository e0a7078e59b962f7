use anyhow::Result;
use motiond::{args, config, exec, log};
use std::io::{self, BufRead, Write};
use tracing::debug;

// rough outline of main:
//
// read config
// set up logging
// start the executor thread (which builds the whole motion core over the
// simulated rig)
// feed it command lines from stdin, print responses
// on EOF drop the ctrl, which stops and joins the executor thread
//
// the executor runs on its own thread so decoding input and executing
// motion stay decoupled, the same way they would be with a real command
// source in front
fn main() -> Result<()> {
    let args = args::args();
    let config = config::config(&args)?;
    log::setup(config.log.level);
    debug!("Args are: {:?}", args);
    debug!("Config is: {:?}", config);
    let ctrl = exec::start(config)?;
    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = line?;
        match ctrl.execute_line(&line) {
            Ok(lines) => {
                for line in lines {
                    println!("{}", line);
                }
                println!("ok");
            }
            Err(e) => println!("!! {}", e),
        }
        io::stdout().flush()?;
    }
    Ok(())
}
