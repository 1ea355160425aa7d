//! Configuration Module - Database Tuning Parameters
//!
//! Every parameter the system reads is declared once in the `params!`
//! invocation below, which generates the `Params` struct, its defaults, the
//! by-name setter used by the file/environment/command-line layers, and the
//! `--show-params` listing.
//!
//! Sources are applied in order, later ones overriding earlier ones:
//! 1. the first parameter file found (`/usr/lib/.shadesrc`, `~/.shadesrc`,
//!    `./.shadesrc`),
//! 2. environment variables `SHADES_<UPPER_NAME>`,
//! 3. command-line arguments `--name=value`.
//!
//! Integer values accept the binary suffixes `k`/`M`/`G` and `^` for
//! exponentiation (`16M`, `2^20`, `2^7k`); doubles accept the decimal
//! suffixes `k`/`M`/`G`/`m`/`u`/`n`; booleans accept `yes`/`no`/`true`/
//! `false`/`1`/`0`.

use std::path::Path;

/// Error type for configuration parsing and validation
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Unknown parameter: {0}")]
    UnknownParameter(String),

    #[error("Invalid value for {name}: {value:?} ({reason})")]
    InvalidValue {
        name: String,
        value: String,
        reason: String,
    },

    #[error("Malformed line {line} in {file}: {text:?}")]
    MalformedLine {
        file: String,
        line: usize,
        text: String,
    },

    #[error("Cannot read parameter file {file}: {source}")]
    FileRead {
        file: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid configuration: {0}")]
    Validation(String),
}

macro_rules! params {
    ($( $(#[doc = $doc:literal])* $name:ident : $kind:ident = $default:expr ),* $(,)?) => {
        /// All tunable parameters of the database.
        ///
        /// Field names double as the external parameter names.
        #[derive(Debug, Clone)]
        pub struct Params {
            $( $(#[doc = $doc])* pub $name: params!(@ty $kind), )*
        }

        impl Default for Params {
            fn default() -> Self {
                Params { $( $name: $default, )* }
            }
        }

        impl Params {
            /// Set one parameter from its textual value.
            pub fn set_by_name(&mut self, name: &str, value: &str) -> Result<(), ConfigError> {
                match name {
                    $( stringify!($name) => {
                        self.$name = params!(@parse $kind, name, value)?;
                        Ok(())
                    } )*
                    _ => Err(ConfigError::UnknownParameter(name.to_string())),
                }
            }

            /// Render every parameter with its current value, one per line.
            pub fn show(&self) -> String {
                let mut out = String::new();
                $(
                    out.push_str(&format!("{} = {:?}\n", stringify!($name), self.$name));
                )*
                out
            }
        }
    };

    (@ty int) => { usize };
    (@ty double) => { f64 };
    (@ty bool) => { bool };
    (@ty string) => { String };

    (@parse int, $name:expr, $value:expr) => { parse_int($name, $value) };
    (@parse double, $name:expr, $value:expr) => { parse_double($name, $value) };
    (@parse bool, $name:expr, $value:expr) => { parse_bool($name, $value) };
    (@parse string, $name:expr, $value:expr) => { Ok::<String, ConfigError>($value.to_string()) };
}

params! {
    /// Database size in memory, in bytes. Must be a multiple of `page_size`.
    db_size: int = 20 * 1024 * 1024,
    /// Size of the first generation in bytes; also the upper limit of one
    /// commit group.
    first_generation_size: int = 1024 * 1024,
    /// Page size in bytes. Must be a power of two.
    page_size: int = 4 * 1024,
    /// Merge adjacent mature generations whose combined size before
    /// collection is below `first_generation_size * relative_mature_generation_size`.
    relative_mature_generation_size: double = 0.7,
    /// Maximum writing for mature garbage collection during each group
    /// commit, in bytes.
    max_gc_effort: int = 20 * 1024 * 1024,
    /// Amount of free memory at which the maximum mature collection effort
    /// is reached.
    max_gc_limit: int = 1536 * 1024,
    /// Amount of free memory at which mature collection is initiated.
    /// Idle-time collection happens regardless of this parameter.
    start_gc_limit: int = 2560 * 1024,
    /// Collect a mature generation if its previous shrinkage was below the
    /// average shrinkage plus this margin.
    generation_shrinkage_margin: double = 0.2,
    /// Name of the disk backup file. Empty means no durability (the commit
    /// engine skips all disk writes).
    disk_filename: string = String::new(),
    /// Size of the disk backup file in bytes.
    disk_filesize: int = 300 * 1024 * 1024,
    /// Number of bytes at the start of the disk left untouched, so that a
    /// raw device's partition table survives. Suggest 1 MiB for raw devices.
    disk_skip_nbytes: int = 1024 * 1024,
    /// Display root block timestamps on read and write.
    root_timestamp_is_displayed: bool = false,
    /// Display extra information during the recovery root search.
    root_search_is_verbose: bool = false,
    /// The port the server listens to.
    listen_port: int = 7777,
    /// How many byte code sequences to execute before a context switch.
    jiffies_between_yields: int = 100,
    /// How long to wait in the network poll when there are no runnable
    /// threads, in microseconds.
    usecs_for_network_select_when_idle: int = 1000,
    /// Verbose mode.
    be_verbose: bool = false,
    /// Disable the output of printing instructions.
    print_insns_are_disabled: bool = false,
}

impl Params {
    /// Apply the first parameter file found in the standard search order.
    ///
    /// Missing files are not an error; an unreadable or malformed file is.
    pub fn apply_first_param_file(&mut self) -> Result<(), ConfigError> {
        let home = std::env::var("HOME").unwrap_or_default();
        let candidates = [
            "/usr/lib/.shadesrc".to_string(),
            format!("{home}/.shadesrc"),
            "./.shadesrc".to_string(),
        ];
        for path in &candidates {
            if Path::new(path).exists() {
                return self.apply_file(path);
            }
        }
        Ok(())
    }

    /// Apply one `key=value` parameter file.
    pub fn apply_file(&mut self, path: &str) -> Result<(), ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::FileRead {
            file: path.to_string(),
            source,
        })?;
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((name, value)) = line.split_once('=') else {
                return Err(ConfigError::MalformedLine {
                    file: path.to_string(),
                    line: lineno + 1,
                    text: line.to_string(),
                });
            };
            self.set_by_name(name.trim(), value.trim())?;
        }
        Ok(())
    }

    /// Apply `SHADES_<UPPER_NAME>` environment variables.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        for (key, value) in std::env::vars() {
            if let Some(name) = key.strip_prefix("SHADES_") {
                let name = name.to_ascii_lowercase();
                // Unknown SHADES_* variables are someone else's business.
                match self.set_by_name(&name, &value) {
                    Ok(()) => {}
                    Err(ConfigError::UnknownParameter(_)) => {}
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(())
    }

    /// Apply `--name=value` command-line arguments.
    ///
    /// Returns the arguments that were not consumed (flags and positionals
    /// the caller handles itself).
    pub fn apply_cli<'a, I>(&mut self, args: I) -> Result<Vec<&'a str>, ConfigError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut rest = Vec::new();
        for arg in args {
            if let Some(body) = arg.strip_prefix("--") {
                if let Some((name, value)) = body.split_once('=') {
                    match self.set_by_name(&name.replace('-', "_"), value) {
                        Ok(()) => continue,
                        Err(ConfigError::UnknownParameter(_)) => {}
                        Err(e) => return Err(e),
                    }
                }
            }
            rest.push(arg);
        }
        Ok(rest)
    }

    /// Validate parameter ranges and mutual consistency.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.page_size.is_power_of_two() || self.page_size < 512 {
            return Err(ConfigError::Validation(
                "page_size must be a power of two, at least 512".to_string(),
            ));
        }
        if !self.db_size.is_multiple_of(self.page_size) {
            return Err(ConfigError::Validation(
                "db_size must be a multiple of page_size".to_string(),
            ));
        }
        if !self.first_generation_size.is_multiple_of(self.page_size) {
            return Err(ConfigError::Validation(
                "first_generation_size must be a multiple of page_size".to_string(),
            ));
        }
        if self.first_generation_size + 2 * self.page_size > self.db_size {
            return Err(ConfigError::Validation(
                "db_size must exceed first_generation_size by at least two pages".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.relative_mature_generation_size) {
            return Err(ConfigError::Validation(
                "relative_mature_generation_size must be between 0 and 1".to_string(),
            ));
        }
        if self.max_gc_limit > self.start_gc_limit {
            return Err(ConfigError::Validation(
                "max_gc_limit cannot exceed start_gc_limit".to_string(),
            ));
        }
        if self.listen_port == 0 || self.listen_port > u16::MAX as usize {
            return Err(ConfigError::Validation(
                "listen_port must be a valid TCP port".to_string(),
            ));
        }
        if self.jiffies_between_yields == 0 {
            return Err(ConfigError::Validation(
                "jiffies_between_yields must be > 0".to_string(),
            ));
        }
        if !self.disk_filename.is_empty() {
            let pages = self.disk_filesize / self.page_size;
            let needed = self.db_size / self.page_size * 2 + self.disk_skip_nbytes / self.page_size;
            if pages < needed {
                return Err(ConfigError::Validation(format!(
                    "disk_filesize of {} pages is too small, need at least {}",
                    pages, needed
                )));
            }
        }
        Ok(())
    }
}

// ============================================================================
// VALUE PARSERS
// ============================================================================

fn int_suffix(c: char) -> Option<usize> {
    match c {
        'k' => Some(1024),
        'M' => Some(1024 * 1024),
        'G' => Some(1024 * 1024 * 1024),
        _ => None,
    }
}

fn double_suffix(c: char) -> Option<f64> {
    match c {
        'k' => Some(1e3),
        'M' => Some(1e6),
        'G' => Some(1e9),
        'm' => Some(1e-3),
        'u' => Some(1e-6),
        'n' => Some(1e-9),
        _ => None,
    }
}

fn invalid(name: &str, value: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        name: name.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

/// Parse an integer with optional `^` exponentiation and a binary suffix:
/// `2`, `16M`, `2^20`, `2^7k`.
fn parse_int(name: &str, value: &str) -> Result<usize, ConfigError> {
    let (base_text, rest) = split_leading_digits(value);
    let base: usize = base_text
        .parse()
        .map_err(|_| invalid(name, value, "expected an integer"))?;
    let mut rest = rest;
    let mut result = base;
    if let Some(exp_text) = rest.strip_prefix('^') {
        let (digits, tail) = split_leading_digits(exp_text);
        let exp: u32 = digits
            .parse()
            .map_err(|_| invalid(name, value, "expected an exponent after '^'"))?;
        result = base
            .checked_pow(exp)
            .ok_or_else(|| invalid(name, value, "exponentiation overflows"))?;
        rest = tail;
    }
    match rest {
        "" => Ok(result),
        s if s.chars().count() == 1 => {
            let c = s.chars().next().unwrap();
            let mult =
                int_suffix(c).ok_or_else(|| invalid(name, value, "unknown integer suffix"))?;
            result
                .checked_mul(mult)
                .ok_or_else(|| invalid(name, value, "value overflows"))
        }
        _ => Err(invalid(name, value, "trailing junk")),
    }
}

/// Parse a double with an optional decimal suffix: `0.7`, `1.5M`, `250u`.
fn parse_double(name: &str, value: &str) -> Result<f64, ConfigError> {
    if value.is_empty() {
        return Err(invalid(name, value, "expected a number"));
    }
    let last = value.chars().last().unwrap();
    if let Some(mult) = double_suffix(last) {
        let body = &value[..value.len() - last.len_utf8()];
        let d: f64 = body
            .parse()
            .map_err(|_| invalid(name, value, "expected a number"))?;
        Ok(d * mult)
    } else {
        value
            .parse()
            .map_err(|_| invalid(name, value, "expected a number"))
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool, ConfigError> {
    match value {
        "yes" | "true" | "1" => Ok(true),
        "no" | "false" | "0" => Ok(false),
        _ => Err(invalid(name, value, "expected yes/no/true/false")),
    }
}

fn split_leading_digits(s: &str) -> (&str, &str) {
    let end = s
        .char_indices()
        .find(|(_, c)| !c.is_ascii_digit())
        .map(|(i, _)| i)
        .unwrap_or(s.len());
    s.split_at(end)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_params_validate() {
        let p = Params::default();
        assert!(p.validate().is_ok());
        assert_eq!(p.db_size, 20 * 1024 * 1024);
        assert_eq!(p.jiffies_between_yields, 100);
    }

    #[test]
    fn test_int_suffixes() {
        assert_eq!(parse_int("x", "2").unwrap(), 2);
        assert_eq!(parse_int("x", "16M").unwrap(), 16 * 1024 * 1024);
        assert_eq!(parse_int("x", "2^20").unwrap(), 1 << 20);
        assert_eq!(parse_int("x", "2^7k").unwrap(), 128 * 1024);
        assert!(parse_int("x", "2q").is_err());
        assert!(parse_int("x", "").is_err());
    }

    #[test]
    fn test_double_suffixes() {
        assert_eq!(parse_double("x", "0.7").unwrap(), 0.7);
        assert_eq!(parse_double("x", "1.5M").unwrap(), 1.5e6);
        assert_eq!(parse_double("x", "250u").unwrap(), 250e-6);
        assert!(parse_double("x", "abc").is_err());
    }

    #[test]
    fn test_set_by_name() {
        let mut p = Params::default();
        p.set_by_name("db_size", "1M").unwrap();
        assert_eq!(p.db_size, 1024 * 1024);
        p.set_by_name("be_verbose", "yes").unwrap();
        assert!(p.be_verbose);
        p.set_by_name("disk_filename", "/tmp/img").unwrap();
        assert_eq!(p.disk_filename, "/tmp/img");
        assert!(p.set_by_name("nonsense", "1").is_err());
    }

    #[test]
    fn test_cli_layer_keeps_unknown_flags() {
        let mut p = Params::default();
        let rest = p
            .apply_cli(["--db_size=2M", "--verbose", "--first-generation-size=256k"])
            .unwrap();
        assert_eq!(p.db_size, 2 * 1024 * 1024);
        assert_eq!(p.first_generation_size, 256 * 1024);
        assert_eq!(rest, vec!["--verbose"]);
    }

    #[test]
    fn test_validate_rejects_bad_geometry() {
        let mut p = Params::default();
        p.db_size = 3000;
        assert!(p.validate().is_err());
        let mut p = Params::default();
        p.first_generation_size = p.db_size;
        assert!(p.validate().is_err());
    }

    #[test]
    fn test_param_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shadesrc");
        std::fs::write(&path, "# comment\ndb_size = 4M\nbe_verbose=true\n").unwrap();
        let mut p = Params::default();
        p.apply_file(path.to_str().unwrap()).unwrap();
        assert_eq!(p.db_size, 4 * 1024 * 1024);
        assert!(p.be_verbose);
    }
}
