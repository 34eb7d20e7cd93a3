use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

pub fn parse() -> Cli {
    Cli::parse()
}

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Turn console debugging information on
    #[arg(short, long)]
    pub console: bool,

    /// Log to a file
    #[arg(short, long, value_name = "FILE", default_value = "inkdash.log")]
    pub log_file: PathBuf,

    /// Verbosity (-v info, -vv debug)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Directory holding the daily sensor files
    #[arg(short, long, value_name = "DIR", env = "SENSOR_DATA_DIR", default_value = "sensorData")]
    pub data_dir: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Sample the sensors every second and maintain the store
    Run {
        /// Use synthetic readings instead of the real sensors
        #[arg(short, long, env = "DEV")]
        emulated: bool,

        #[command(flatten)]
        hardware: Hardware,
    },

    /// Print stored samples
    Query {
        /// How far back to look, in seconds (at most 7 days)
        #[arg(short, long, value_name = "SECS", default_value_t = 3600)]
        period: u64,

        /// Include every sample, not only the on-the-minute ones
        #[arg(short, long)]
        all: bool,

        /// One JSON object per line
        #[arg(short, long)]
        json: bool,
    },

    /// Run one thinning pass over old daily files and exit
    Thin {},

    /// Fill an empty store with a week of synthetic history and exit
    Bootstrap {},
}

#[derive(Args)]
pub struct Hardware {
    /// Serial port of the MH-Z19B CO2 sensor
    #[arg(long, value_name = "TTY", env = "CO2_TTY", default_value = "/dev/serial0")]
    pub co2_tty: String,

    /// I2C bus of the BME280 sensor
    #[arg(long, value_name = "DEV", env = "I2C_BUS", default_value = "/dev/i2c-1")]
    pub i2c_bus: PathBuf,

    /// I2C address of the BME280 sensor
    #[arg(long, value_name = "ADDR", env = "BME280_ADDRESS", default_value = "0x76", value_parser = parse_address)]
    pub bme280_address: u8,
}

fn parse_address(s: &str) -> Result<u8, String> {
    let digits = s.trim_start_matches("0x").trim_start_matches("0X");
    u8::from_str_radix(digits, 16).map_err(|e| format!("invalid I2C address {s}: {e}"))
}
