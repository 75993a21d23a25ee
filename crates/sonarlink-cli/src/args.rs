//! Command-line arguments.

use std::path::PathBuf;

pub const USAGE: &str = "\
Usage: sonarlink [OPTIONS]

Options:
  --config <PATH>   Configuration file (default: ~/.sonarlink/config.toml)
  --simulate        Run against a simulated bridge and an in-process bus
  --init-config     Write the default configuration to the config path and exit
  --list-ports      List serial ports visible to this host and exit
  -h, --help        Print this help";

#[derive(Debug, Default, PartialEq, Eq)]
pub struct Args {
    pub config: Option<PathBuf>,
    pub simulate: bool,
    pub init_config: bool,
    pub list_ports: bool,
    pub help: bool,
}

pub fn parse<I>(args: I) -> Result<Args, String>
where
    I: IntoIterator,
    I::Item: Into<String>,
{
    let mut parsed = Args::default();
    let mut iter = args.into_iter().map(Into::into);

    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--simulate" => parsed.simulate = true,
            "--init-config" => parsed.init_config = true,
            "--list-ports" => parsed.list_ports = true,
            "-h" | "--help" => parsed.help = true,
            "--config" => {
                let path = iter
                    .next()
                    .ok_or_else(|| "--config requires a path".to_string())?;
                parsed.config = Some(PathBuf::from(path));
            }
            other => match other.strip_prefix("--config=") {
                Some(path) if !path.is_empty() => parsed.config = Some(PathBuf::from(path)),
                Some(_) => return Err("--config requires a path".to_string()),
                None => return Err(format!("unrecognised argument '{other}'")),
            },
        }
    }
    Ok(parsed)
}
