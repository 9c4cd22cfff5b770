use std::{fmt, time::Duration};

use quic_connect::{transport::DEFAULT_HANDSHAKE_TIMEOUT, TcpNetwork};

/// Gets a small string with this program's name and version.
pub fn get_version_string() -> String {
    format!(
        concat!(env!("CARGO_PKG_NAME"), " ", env!("CARGO_PKG_VERSION"), " ({} {})"),
        std::env::consts::OS,
        std::env::consts::ARCH
    )
}

/// Gets a string with this program's help documentation.
pub fn get_help_string() -> &'static str {
    concat!(
        "Usage: qconnect [options...] <proxy> <destination>\n",
        "Opens a TCP tunnel to <destination> through the HTTP/3 CONNECT proxy at <proxy>, piping\n",
        "stdin into the tunnel and the tunnel into stdout.\n",
        "\n",
        "The proxy is given as host[:port], the port defaults to 443. The destination is given\n",
        "as host:port.\n",
        "\n",
        "Options:\n",
        "  -h, --help                      Display this help menu and exit\n",
        "  -V, --version                   Display the version number and exit\n",
        "  -v, --verbose                   Display additional information while running\n",
        "  -s, --silent                    Only display errors\n",
        "  -4                              Only tunnel to IPv4 destinations\n",
        "  -6                              Only tunnel to IPv6 destinations\n",
        "  -u, --user <user>               The user to authenticate to the proxy as\n",
        "  -p, --password <password>       The password to authenticate to the proxy with\n",
        "      --proxy-auth                Send the credentials as a Proxy-Authorization header\n",
        "      --insecure                  Don't verify the proxy's certificate\n",
        "      --server-name <name>        The TLS server name to present, defaults to the proxy host\n",
        "      --handshake-timeout <secs>  How long a QUIC handshake may take, defaults to 5\n",
    )
}

/// The result of parsing the program's arguments.
#[derive(Debug, PartialEq)]
pub enum ArgumentsRequest {
    /// Print the help menu to stdout and exit.
    Help,

    /// Print this program's version to stdout and exit.
    Version,

    /// Run with the provided arguments.
    Run(StartupArguments),
}

/// Specifies how the program should run.
#[derive(Debug, PartialEq)]
pub struct StartupArguments {
    pub verbose: bool,
    pub silent: bool,

    /// The network passed to the dialer, which restricts the destination's address family.
    pub network: TcpNetwork,

    pub user: Option<String>,
    pub password: Option<String>,
    pub proxy_auth: bool,
    pub insecure: bool,
    pub server_name: Option<String>,
    pub handshake_timeout: Duration,

    /// The proxy's address, as host[:port].
    pub proxy: String,

    /// The address to tunnel to, as host:port.
    pub destination: String,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ArgumentsError {
    UnknownArgument(String),
    MissingValue(String),
    InvalidHandshakeTimeout(String),
    ConflictingFamilies,
    VerboseAndSilent,
    PasswordWithoutUser,
    MissingProxy,
    MissingDestination,
    UnexpectedPositional(String),
}

impl fmt::Display for ArgumentsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownArgument(arg) => write!(f, "Unknown argument: {arg}"),
            Self::MissingValue(arg) => write!(f, "Expected a value after {arg}"),
            Self::InvalidHandshakeTimeout(value) => write!(f, "Invalid handshake timeout, expected a positive amount of seconds: {value}"),
            Self::ConflictingFamilies => write!(f, "Cannot use -4 and -6 at the same time"),
            Self::VerboseAndSilent => write!(f, "Cannot use verbose and silent at the same time"),
            Self::PasswordWithoutUser => write!(f, "A password was given, but no user"),
            Self::MissingProxy => write!(f, "A proxy address must be specified"),
            Self::MissingDestination => write!(f, "A destination address must be specified"),
            Self::UnexpectedPositional(arg) => write!(f, "Unexpected extra argument: {arg}"),
        }
    }
}

struct StartupArgumentsParser {
    verbose: bool,
    silent: bool,
    network: Option<TcpNetwork>,
    user: Option<String>,
    password: Option<String>,
    proxy_auth: bool,
    insecure: bool,
    server_name: Option<String>,
    handshake_timeout: Option<Duration>,
    positionals: Vec<String>,
}

impl StartupArgumentsParser {
    const fn new() -> Self {
        Self {
            verbose: false,
            silent: false,
            network: None,
            user: None,
            password: None,
            proxy_auth: false,
            insecure: false,
            server_name: None,
            handshake_timeout: None,
            positionals: Vec::new(),
        }
    }

    fn set_network(&mut self, network: TcpNetwork) -> Result<(), ArgumentsError> {
        match self.network {
            Some(previous) if previous != network => Err(ArgumentsError::ConflictingFamilies),
            _ => {
                self.network = Some(network);
                Ok(())
            }
        }
    }

    fn complete(self) -> Result<StartupArguments, ArgumentsError> {
        if self.verbose && self.silent {
            return Err(ArgumentsError::VerboseAndSilent);
        }

        if self.password.is_some() && self.user.is_none() {
            return Err(ArgumentsError::PasswordWithoutUser);
        }

        let mut positionals = self.positionals.into_iter();
        let proxy = positionals.next().ok_or(ArgumentsError::MissingProxy)?;
        let destination = positionals.next().ok_or(ArgumentsError::MissingDestination)?;
        if let Some(extra) = positionals.next() {
            return Err(ArgumentsError::UnexpectedPositional(extra));
        }

        Ok(StartupArguments {
            verbose: self.verbose,
            silent: self.silent,
            network: self.network.unwrap_or(TcpNetwork::Tcp),
            user: self.user,
            password: self.password,
            proxy_auth: self.proxy_auth,
            insecure: self.insecure,
            server_name: self.server_name,
            handshake_timeout: self.handshake_timeout.unwrap_or(DEFAULT_HANDSHAKE_TIMEOUT),
            proxy,
            destination,
        })
    }
}

fn require_value(arg: String, maybe_value: Option<String>) -> Result<String, ArgumentsError> {
    match maybe_value {
        Some(value) if !value.is_empty() => Ok(value),
        _ => Err(ArgumentsError::MissingValue(arg)),
    }
}

fn parse_handshake_timeout(arg: String, maybe_value: Option<String>) -> Result<Duration, ArgumentsError> {
    let value = require_value(arg, maybe_value)?;

    match value.parse::<f64>() {
        Ok(secs) if secs.is_finite() && secs > 0.0 && secs <= u32::MAX as f64 => Ok(Duration::from_secs_f64(secs)),
        _ => Err(ArgumentsError::InvalidHandshakeTimeout(value)),
    }
}

fn try_parse_general_argument(result: &mut StartupArgumentsParser, maybe_arg: &mut Option<String>) -> Result<bool, ArgumentsError> {
    let arg = match maybe_arg.take() {
        Some(s) => s,
        None => return Ok(false),
    };

    if arg.eq("-v") || arg.eq_ignore_ascii_case("--verbose") {
        result.verbose = true;
    } else if arg.eq("-s") || arg.eq_ignore_ascii_case("--silent") {
        result.silent = true;
    } else if arg.eq("-4") {
        result.set_network(TcpNetwork::Tcp4)?;
    } else if arg.eq("-6") {
        result.set_network(TcpNetwork::Tcp6)?;
    } else {
        *maybe_arg = Some(arg);
    }

    Ok(maybe_arg.is_none())
}

fn try_parse_proxy_argument<F>(
    result: &mut StartupArgumentsParser,
    maybe_arg: &mut Option<String>,
    get_next_arg: F,
) -> Result<bool, ArgumentsError>
where
    F: FnOnce() -> Option<String>,
{
    let arg = match maybe_arg.take() {
        Some(s) => s,
        None => return Ok(false),
    };

    if arg.eq("-u") || arg.eq_ignore_ascii_case("--user") {
        result.user = Some(require_value(arg, get_next_arg())?);
    } else if arg.eq("-p") || arg.eq_ignore_ascii_case("--password") {
        result.password = Some(require_value(arg, get_next_arg())?);
    } else if arg.eq_ignore_ascii_case("--proxy-auth") {
        result.proxy_auth = true;
    } else if arg.eq_ignore_ascii_case("--insecure") {
        result.insecure = true;
    } else if arg.eq_ignore_ascii_case("--server-name") {
        result.server_name = Some(require_value(arg, get_next_arg())?);
    } else if arg.eq_ignore_ascii_case("--handshake-timeout") {
        result.handshake_timeout = Some(parse_handshake_timeout(arg, get_next_arg())?);
    } else {
        *maybe_arg = Some(arg);
    }

    Ok(maybe_arg.is_none())
}

pub fn parse_arguments<T>(mut args: T) -> Result<ArgumentsRequest, ArgumentsError>
where
    T: Iterator<Item = String>,
{
    let mut result = StartupArgumentsParser::new();

    // Ignore the first argument, as it's by convention the name of the program
    args.next();

    while let Some(arg) = args.next() {
        if arg.is_empty() {
            continue;
        } else if arg.eq("-h") || arg.eq_ignore_ascii_case("--help") {
            return Ok(ArgumentsRequest::Help);
        } else if arg.eq("-V") || arg.eq_ignore_ascii_case("--version") {
            return Ok(ArgumentsRequest::Version);
        }

        let mut maybe_arg = Some(arg);
        let _ = !try_parse_general_argument(&mut result, &mut maybe_arg)?
            && !try_parse_proxy_argument(&mut result, &mut maybe_arg, || args.next())?;

        match maybe_arg {
            Some(arg) if arg.starts_with('-') => return Err(ArgumentsError::UnknownArgument(arg)),
            Some(arg) => result.positionals.push(arg),
            None => {}
        }
    }

    let result = result.complete()?;
    Ok(ArgumentsRequest::Run(result))
}
