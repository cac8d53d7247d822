//! A command-line front end for REPL modules.
//!
//! ## About
//!
//! Loads the REPL module named on the command line into a session worker and
//! feeds it standard input, one line per evaluation, printing whatever the
//! module writes.  The module may be a local path, a `file://` URL or an
//! `http(s)://` URL.  With `--format FILE` the file is formatted instead and
//! the result printed.  With `--json` every worker response is printed as a
//! single line of JSON rather than as plain text.
//!
//! To see verbose output of what is happening, set `RUST_LOG=info` before
//! executing.
//!
//! ## Authors
//!
//! The Veracruz Development Team.
//!
//! ## Licensing and copyright notice
//!
//! See the `LICENSE.md` file in the Veracruz root directory for
//! information on licensing and copyright.

use anyhow::{anyhow, Result};
use clap::{Arg, ArgAction};
use log::*;
use repl_engine::{ClockSource, HostConfig, Stream};
use repl_worker::{Response, SessionController, SessionWorker};
use std::{
    fs,
    io::{self, BufRead, Write},
};

////////////////////////////////////////////////////////////////////////////////
// Constants.
////////////////////////////////////////////////////////////////////////////////

/// About repl-host.
const ABOUT: &str = "Runs an interactive REPL module compiled to WebAssembly, reading one \
                     evaluation per line of standard input.";
/// The name of the application.
const APPLICATION_NAME: &str = "repl-host";
/// The authors list.
const AUTHORS: &str = "The Veracruz Development Team.  See the file `AUTHORS.markdown` in the \
                       Veracruz root directory for detailed authorship information.";
/// Application version number.
const VERSION: &str = env!("CARGO_PKG_VERSION");

////////////////////////////////////////////////////////////////////////////////
// Command line options and parsing.
////////////////////////////////////////////////////////////////////////////////

/// A struct capturing all of the command line options passed to the program.
struct CommandLineOptions {
    /// Where to load the module from.
    module: String,
    /// Path of the source the session is created from, if any.
    initial_source: Option<String>,
    /// Extra arguments reported to the module after the program name.
    program_arguments: Vec<String>,
    /// Extra environment variables reported to the module.
    environment_variables: Vec<(String, String)>,
    use_bigint: bool,
    coarse_clock: bool,
    /// Whether responses are printed as JSON lines.
    json: bool,
    /// A file to format instead of running a session.
    format_file: Option<String>,
}

/// Splits a `KEY=VALUE` pair at its first `=`.
fn parse_environment_variable(pair: &str) -> Result<(String, String)> {
    let n = pair.find('=').ok_or_else(|| {
        anyhow!(
            "Expecting an environment variable of the form KEY=VALUE, but found '{}'",
            pair
        )
    })?;
    Ok((pair[..n].to_string(), pair[n + 1..].to_string()))
}

/// Parses the command line options, building a `CommandLineOptions` struct out
/// of them.
fn parse_command_line() -> Result<CommandLineOptions> {
    let matches = clap::Command::new(APPLICATION_NAME)
        .version(VERSION)
        .author(AUTHORS)
        .about(ABOUT)
        .arg(
            Arg::new("module")
                .value_name("MODULE")
                .help("Path or URL of the REPL module (a path, file:// or http(s)://).")
                .required(true),
        )
        .arg(
            Arg::new("source")
                .short('s')
                .long("source")
                .value_name("FILE")
                .help("Source file the session is created from."),
        )
        .arg(
            Arg::new("arg")
                .long("arg")
                .value_name("ARG")
                .help(
                    "An argument reported to the module after its program name.  Multiple \
                     --arg flags may be provided.",
                )
                .num_args(1)
                .action(ArgAction::Append),
        )
        .arg(
            Arg::new("env")
                .long("env")
                .help("Specify an environment variable and value (VAR=VAL).")
                .value_name("VAR=VAL")
                .num_args(1)
                .action(ArgAction::Append),
        )
        .arg(
            Arg::new("no-bigint")
                .long("no-bigint")
                .help("Ask the module to use fixed-width rather than arbitrary-precision integers.")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("coarse-clock")
                .long("coarse-clock")
                .help("Serve every clock from the millisecond wall clock.")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("json")
                .long("json")
                .help("Print every worker response as one line of JSON.")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("format")
                .short('f')
                .long("format")
                .value_name("FILE")
                .help("Format FILE with the module's formatter, print the result and exit."),
        )
        .get_matches();

    info!("Parsed command line.");

    let module = matches
        .get_one::<String>("module")
        .ok_or_else(|| anyhow!("No module provided"))?
        .to_string();

    let program_arguments = matches
        .get_many::<String>("arg")
        .map_or(Vec::new(), |p| p.map(|s| s.to_string()).collect::<Vec<_>>());

    let environment_variables = match matches.get_many::<String>("env") {
        None => Vec::new(),
        Some(x) => x
            .map(|e| parse_environment_variable(e))
            .collect::<Result<Vec<_>>>()?,
    };

    Ok(CommandLineOptions {
        module,
        initial_source: matches.get_one::<String>("source").cloned(),
        program_arguments,
        environment_variables,
        use_bigint: !matches.get_flag("no-bigint"),
        coarse_clock: matches.get_flag("coarse-clock"),
        json: matches.get_flag("json"),
        format_file: matches.get_one::<String>("format").cloned(),
    })
}

/// Builds the host configuration the module runs with.
fn host_config(cmdline: &CommandLineOptions) -> Result<HostConfig> {
    let mut config = HostConfig::default().with_bigint(cmdline.use_bigint);

    let mut program_arguments = config.program_arguments.clone();
    program_arguments.extend(cmdline.program_arguments.iter().cloned());
    config = config.with_program_arguments(program_arguments);

    for (key, value) in &cmdline.environment_variables {
        config = config.with_environment_variable(key.as_str(), value.as_str());
    }
    if cmdline.coarse_clock {
        config = config.with_clock(ClockSource::Coarse);
    }
    if let Some(path) = &cmdline.initial_source {
        info!("Reading initial source from {}.", path);
        config = config.with_initial_source(fs::read_to_string(path)?);
    }
    Ok(config)
}

////////////////////////////////////////////////////////////////////////////////
// Printing responses.
////////////////////////////////////////////////////////////////////////////////

/// Prints one response, as JSON or as plain text.
fn print_response(response: &Response, json: bool) -> Result<()> {
    if json {
        println!("{}", response.to_json()?);
        return Ok(());
    }
    match response {
        Response::Output {
            stream: Stream::Stdout,
            data,
        } => {
            print!("{}", data);
            io::stdout().flush()?;
        }
        Response::Output {
            stream: Stream::Stderr,
            data,
        } => eprint!("{}", data),
        Response::Output {
            stream: Stream::Graphics,
            data,
        } => println!("{}", data),
        Response::Format { data: Some(text) } => print!("{}", text),
        Response::Progress { data } => debug!("Loaded {:.0}%.", data),
        Response::Format { data: None } | Response::Ready | Response::Error { .. } => (),
    }
    Ok(())
}

/// Waits for the current request to finish, printing everything that
/// arrives on the way, and returns the response that finished it.
fn drain(controller: &mut SessionController, json: bool) -> Result<Response> {
    let mut printed = Ok(());
    let last = controller.recv_until_ready(|response| {
        if printed.is_ok() {
            printed = print_response(response, json);
        }
    })?;
    printed?;
    print_response(&last, json)?;
    Ok(last)
}

/// Formats `path` and prints the result, or the original text when the
/// formatter leaves it unchanged.
fn format_file(controller: &mut SessionController, path: &str, json: bool) -> Result<()> {
    let source = fs::read_to_string(path)?;
    controller.format(&source)?;
    if let Response::Format { data: None } = drain(controller, json)? {
        if !json {
            print!("{}", source);
        }
    }
    Ok(())
}

/// Evaluates each line of standard input in turn.
fn run_lines(controller: &mut SessionController, json: bool) -> Result<()> {
    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        controller.run(&line)?;
        drain(controller, json)?;
    }
    info!("End of input.");
    Ok(())
}

/// Entry: parses the command line, starts the worker, waits for the session
/// to become ready, then either formats a file or runs standard input.
fn main() -> Result<()> {
    env_logger::init();
    let cmdline = parse_command_line()?;
    info!("Command line read successfully.");

    let config = host_config(&cmdline)?;
    let mut controller = SessionWorker::spawn(cmdline.module.clone(), config)?;
    if let Err(e) = drain(&mut controller, cmdline.json) {
        error!("Failed to start the REPL: {:#}", e);
        return Err(e);
    }
    info!("REPL ready.");

    let result = match &cmdline.format_file {
        Some(path) => format_file(&mut controller, path, cmdline.json),
        None => run_lines(&mut controller, cmdline.json),
    };
    controller.shutdown()?;
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> CommandLineOptions {
        CommandLineOptions {
            module: "repl.wasm".to_string(),
            initial_source: None,
            program_arguments: Vec::new(),
            environment_variables: Vec::new(),
            use_bigint: true,
            coarse_clock: false,
            json: false,
            format_file: None,
        }
    }

    #[test]
    fn environment_variables_split_at_first_equals() {
        assert_eq!(
            parse_environment_variable("A=b=c").unwrap(),
            ("A".to_string(), "b=c".to_string())
        );
        assert!(parse_environment_variable("novalue").is_err());
    }

    #[test]
    fn config_extends_the_defaults() {
        let mut cmdline = options();
        cmdline.program_arguments = vec!["--quiet".to_string()];
        cmdline.environment_variables = vec![("LANG".to_string(), "C".to_string())];
        cmdline.use_bigint = false;
        cmdline.coarse_clock = true;

        let config = host_config(&cmdline).unwrap();
        assert_eq!(config.program_arguments, vec!["sgleam", "--quiet"]);
        assert_eq!(
            config.environment_variables,
            vec![
                ("RUST_BACKTRACE".to_string(), "1".to_string()),
                ("LANG".to_string(), "C".to_string())
            ]
        );
        assert!(!config.use_bigint);
        assert_eq!(config.clock, ClockSource::Coarse);
    }

    #[test]
    fn initial_source_is_read_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "pub fn main() {{ 1 }}").unwrap();
        let mut cmdline = options();
        cmdline.initial_source = Some(file.path().to_str().unwrap().to_string());
        let config = host_config(&cmdline).unwrap();
        assert_eq!(config.initial_source, "pub fn main() { 1 }");
    }
}
