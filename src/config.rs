use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Default config file template with comments, used by `config init`.
const DEFAULT_CONFIG_TEMPLATE: &str = r#"# tabrelay configuration file
# See: https://github.com/Nunley-Media-Group/tabrelay

# Relay server defaults
# [server]
# host = "127.0.0.1"
# port = 9223
# token = "shared-bearer-token"          # required for non-loopback clients
# extension_origin = "chrome-extension://"

# Bridge defaults
# [bridge]
# chrome_host = "127.0.0.1"
# chrome_port = 9222
# url_filter = "example.com"             # only attach tabs matching this

# Logging
# [logging]
# level = "info"                         # trace, debug, info, warn, error
# dir = "/home/user/.tabrelay/logs"
"#;

// ---------------------------------------------------------------------------
// Config structs (parsed from TOML)
// ---------------------------------------------------------------------------

/// Represents the parsed TOML config file. All fields optional.
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ConfigFile {
    pub server: ServerConfig,
    pub bridge: BridgeFileConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub token: Option<String>,
    pub extension_origin: Option<String>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BridgeFileConfig {
    pub chrome_host: Option<String>,
    pub chrome_port: Option<u16>,
    pub url_filter: Option<String>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: Option<String>,
    pub dir: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Resolved config (all defaults filled in)
// ---------------------------------------------------------------------------

/// Fully resolved configuration with all defaults filled in.
#[derive(Debug, Serialize)]
pub struct ResolvedConfig {
    pub config_path: Option<PathBuf>,
    pub server: ResolvedServer,
    pub bridge: ResolvedBridge,
    pub logging: ResolvedLogging,
}

#[derive(Debug, Serialize)]
pub struct ResolvedServer {
    pub host: String,
    pub port: u16,
    pub token: Option<String>,
    pub extension_origin: String,
}

#[derive(Debug, Serialize)]
pub struct ResolvedBridge {
    pub chrome_host: String,
    pub chrome_port: u16,
    pub url_filter: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ResolvedLogging {
    pub level: String,
    pub dir: PathBuf,
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum ConfigError {
    /// I/O error reading/writing config file.
    Io(std::io::Error),
    /// Config file already exists (for `config init`).
    AlreadyExists(PathBuf),
    /// Could not determine config directory.
    NoConfigDir,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "config file error: {e}"),
            Self::AlreadyExists(p) => {
                write!(f, "Config file already exists: {}", p.display())
            }
            Self::NoConfigDir => write!(f, "could not determine config directory"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<ConfigError> for crate::error::AppError {
    fn from(e: ConfigError) -> Self {
        use crate::error::ExitCode;
        Self {
            message: e.to_string(),
            code: ExitCode::GeneralError,
        }
    }
}

// ---------------------------------------------------------------------------
// Config file search
// ---------------------------------------------------------------------------

/// Find the first config file that exists, checking locations in priority order.
///
/// Search order:
/// 1. `explicit_path` (from `--config` flag)
/// 2. `$TABRELAY_CONFIG` environment variable
/// 3. `./.tabrelay.toml` (project-local)
/// 4. `<config_dir>/tabrelay/config.toml` (XDG / platform config dir)
/// 5. `~/.tabrelay.toml` (home directory fallback)
#[must_use]
pub fn find_config_file(explicit_path: Option<&Path>) -> Option<PathBuf> {
    find_config_file_with(explicit_path, std::env::var("TABRELAY_CONFIG").ok())
}

/// Testable variant of [`find_config_file`] that accepts an explicit env value.
#[must_use]
pub fn find_config_file_with(
    explicit_path: Option<&Path>,
    env_config: Option<String>,
) -> Option<PathBuf> {
    // 1. Explicit --config path
    if let Some(p) = explicit_path {
        if p.exists() {
            return Some(p.to_path_buf());
        }
    }

    // 2. $TABRELAY_CONFIG
    if let Some(env_path) = env_config {
        let p = PathBuf::from(env_path);
        if p.exists() {
            return Some(p);
        }
    }

    // 3. ./.tabrelay.toml (project-local)
    let local = PathBuf::from(".tabrelay.toml");
    if local.exists() {
        return Some(local);
    }

    // 4. XDG / platform config dir
    if let Some(config_dir) = dirs::config_dir() {
        let xdg = config_dir.join("tabrelay").join("config.toml");
        if xdg.exists() {
            return Some(xdg);
        }
    }

    // 5. ~/.tabrelay.toml
    if let Some(home) = dirs::home_dir() {
        let home_config = home.join(".tabrelay.toml");
        if home_config.exists() {
            return Some(home_config);
        }
    }

    None
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Load and parse a config file. Returns the file path (if found) and the parsed config.
///
/// On parse errors, prints a warning to stderr and returns `ConfigFile::default()`.
#[must_use]
pub fn load_config(explicit_path: Option<&Path>) -> (Option<PathBuf>, ConfigFile) {
    let path = find_config_file(explicit_path);
    match &path {
        Some(p) => {
            let config = load_config_from(p);
            (path, config)
        }
        None => (None, ConfigFile::default()),
    }
}

/// Load and parse a config file from a specific path.
///
/// On parse errors, prints a warning to stderr and returns `ConfigFile::default()`.
#[must_use]
pub fn load_config_from(path: &Path) -> ConfigFile {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!(
                "warning: could not read config file {}: {e}",
                path.display()
            );
            return ConfigFile::default();
        }
    };

    parse_config(&contents, path)
}

/// Parse TOML content into a `ConfigFile`.
///
/// Uses a two-pass strategy: first tries strict parsing (to detect unknown keys),
/// then falls back to lenient parsing if strict fails due to unknown fields.
#[must_use]
pub fn parse_config(contents: &str, path: &Path) -> ConfigFile {
    match toml::from_str::<StrictConfigFile>(contents) {
        Ok(strict) => strict.into(),
        Err(strict_err) => match toml::from_str::<ConfigFile>(contents) {
            Ok(config) => {
                // Strict failed but lenient succeeded → unknown keys
                eprintln!(
                    "warning: unknown keys in config file {}: {strict_err}",
                    path.display()
                );
                config
            }
            Err(parse_err) => {
                eprintln!(
                    "warning: could not parse config file {}: {parse_err}",
                    path.display()
                );
                ConfigFile::default()
            }
        },
    }
}

/// Strict variant used for the first-pass parse to detect unknown keys.
#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct StrictConfigFile {
    #[serde(default)]
    server: StrictServerConfig,
    #[serde(default)]
    bridge: StrictBridgeConfig,
    #[serde(default)]
    logging: StrictLoggingConfig,
}

#[derive(Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct StrictServerConfig {
    host: Option<String>,
    port: Option<u16>,
    token: Option<String>,
    extension_origin: Option<String>,
}

#[derive(Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct StrictBridgeConfig {
    chrome_host: Option<String>,
    chrome_port: Option<u16>,
    url_filter: Option<String>,
}

#[derive(Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct StrictLoggingConfig {
    level: Option<String>,
    dir: Option<PathBuf>,
}

impl From<StrictConfigFile> for ConfigFile {
    fn from(s: StrictConfigFile) -> Self {
        Self {
            server: ServerConfig {
                host: s.server.host,
                port: s.server.port,
                token: s.server.token,
                extension_origin: s.server.extension_origin,
            },
            bridge: BridgeFileConfig {
                chrome_host: s.bridge.chrome_host,
                chrome_port: s.bridge.chrome_port,
                url_filter: s.bridge.url_filter,
            },
            logging: LoggingConfig {
                level: s.logging.level,
                dir: s.logging.dir,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Config resolution
// ---------------------------------------------------------------------------

/// Default port Chrome listens on for DevTools.
const DEFAULT_CHROME_PORT: u16 = 9222;

/// Default directory for log files: `~/.tabrelay/logs`.
#[must_use]
pub fn default_log_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".tabrelay")
        .join("logs")
}

/// Resolve a config file into a fully-populated `ResolvedConfig` with all defaults.
#[must_use]
pub fn resolve_config(file: &ConfigFile, config_path: Option<PathBuf>) -> ResolvedConfig {
    let port = file
        .server
        .port
        .unwrap_or(crate::relay::ownership::DEFAULT_RELAY_PORT);
    let port = if port == 0 {
        crate::relay::ownership::DEFAULT_RELAY_PORT
    } else {
        port
    };

    ResolvedConfig {
        config_path,
        server: ResolvedServer {
            host: file
                .server
                .host
                .clone()
                .unwrap_or_else(|| "127.0.0.1".to_string()),
            port,
            token: file.server.token.clone(),
            extension_origin: file
                .server
                .extension_origin
                .clone()
                .unwrap_or_else(|| "chrome-extension://".to_string()),
        },
        bridge: ResolvedBridge {
            chrome_host: file
                .bridge
                .chrome_host
                .clone()
                .unwrap_or_else(|| "127.0.0.1".to_string()),
            chrome_port: file.bridge.chrome_port.unwrap_or(DEFAULT_CHROME_PORT),
            url_filter: file.bridge.url_filter.clone(),
        },
        logging: ResolvedLogging {
            level: file
                .logging
                .level
                .clone()
                .unwrap_or_else(|| "info".to_string()),
            dir: file.logging.dir.clone().unwrap_or_else(default_log_dir),
        },
    }
}

// ---------------------------------------------------------------------------
// Config init
// ---------------------------------------------------------------------------

/// Default path for `config init`: `<config_dir>/tabrelay/config.toml`.
///
/// # Errors
///
/// Returns `ConfigError::NoConfigDir` if the platform config directory cannot be determined.
pub fn default_init_path() -> Result<PathBuf, ConfigError> {
    dirs::config_dir()
        .map(|d| d.join("tabrelay").join("config.toml"))
        .ok_or(ConfigError::NoConfigDir)
}

/// Create a default config file at the given path (or the default XDG path).
///
/// # Errors
///
/// - `ConfigError::AlreadyExists` if the file already exists
/// - `ConfigError::Io` on I/O failure
/// - `ConfigError::NoConfigDir` if no target path and platform config dir unknown
pub fn init_config(target_path: Option<&Path>) -> Result<PathBuf, ConfigError> {
    let path = match target_path {
        Some(p) => p.to_path_buf(),
        None => default_init_path()?,
    };

    init_config_to(&path)
}

/// Testable variant of [`init_config`] that writes to an explicit path.
///
/// # Errors
///
/// - `ConfigError::AlreadyExists` if the file already exists
/// - `ConfigError::Io` on I/O failure
pub fn init_config_to(path: &Path) -> Result<PathBuf, ConfigError> {
    if path.exists() {
        return Err(ConfigError::AlreadyExists(path.to_path_buf()));
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    std::fs::write(path, DEFAULT_CONFIG_TEMPLATE)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }

    Ok(path.to_path_buf())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_full_config() {
        let toml = r#"
            [server]
            host = "0.0.0.0"
            port = 9300
            token = "secret"

            [bridge]
            chrome_port = 9333
            url_filter = "example.com"

            [logging]
            level = "debug"
        "#;
        let config = parse_config(toml, Path::new("test.toml"));
        assert_eq!(config.server.host.as_deref(), Some("0.0.0.0"));
        assert_eq!(config.server.port, Some(9300));
        assert_eq!(config.server.token.as_deref(), Some("secret"));
        assert_eq!(config.bridge.chrome_port, Some(9333));
        assert_eq!(config.bridge.url_filter.as_deref(), Some("example.com"));
        assert_eq!(config.logging.level.as_deref(), Some("debug"));
    }

    #[test]
    fn parse_empty_config_gives_defaults() {
        let config = parse_config("", Path::new("test.toml"));
        assert!(config.server.host.is_none());
        assert!(config.bridge.chrome_host.is_none());
    }

    #[test]
    fn parse_unknown_keys_falls_back_to_lenient() {
        let toml = r#"
            [server]
            port = 9300
            does_not_exist = true
        "#;
        let config = parse_config(toml, Path::new("test.toml"));
        assert_eq!(config.server.port, Some(9300));
    }

    #[test]
    fn parse_invalid_toml_gives_defaults() {
        let config = parse_config("this is not [toml", Path::new("test.toml"));
        assert!(config.server.port.is_none());
    }

    #[test]
    fn resolve_fills_defaults() {
        let resolved = resolve_config(&ConfigFile::default(), None);
        assert_eq!(resolved.server.host, "127.0.0.1");
        assert_eq!(
            resolved.server.port,
            crate::relay::ownership::DEFAULT_RELAY_PORT
        );
        assert!(resolved.server.token.is_none());
        assert_eq!(resolved.server.extension_origin, "chrome-extension://");
        assert_eq!(resolved.bridge.chrome_port, 9222);
        assert_eq!(resolved.logging.level, "info");
    }

    #[test]
    fn resolve_port_zero_falls_back_to_default() {
        let mut file = ConfigFile::default();
        file.server.port = Some(0);
        let resolved = resolve_config(&file, None);
        assert_eq!(
            resolved.server.port,
            crate::relay::ownership::DEFAULT_RELAY_PORT
        );
    }

    #[test]
    fn find_config_prefers_explicit_path() {
        let dir = tempfile::tempdir().unwrap();
        let explicit = dir.path().join("explicit.toml");
        std::fs::write(&explicit, "").unwrap();

        let found = find_config_file_with(Some(&explicit), None);
        assert_eq!(found, Some(explicit));
    }

    #[test]
    fn find_config_uses_env_when_no_explicit() {
        let dir = tempfile::tempdir().unwrap();
        let env_path = dir.path().join("env.toml");
        std::fs::write(&env_path, "").unwrap();

        let found =
            find_config_file_with(None, Some(env_path.to_string_lossy().into_owned()));
        assert_eq!(found, Some(env_path));
    }

    #[test]
    fn find_config_ignores_missing_explicit() {
        let found = find_config_file_with(Some(Path::new("/does/not/exist.toml")), None);
        // Falls through to the other locations; whatever it finds, it must
        // not be the missing explicit path.
        assert_ne!(found, Some(PathBuf::from("/does/not/exist.toml")));
    }

    #[test]
    fn init_config_writes_template_and_refuses_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub").join("config.toml");

        let written = init_config_to(&path).unwrap();
        assert_eq!(written, path);
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("[server]"));

        let second = init_config_to(&path);
        assert!(matches!(second, Err(ConfigError::AlreadyExists(_))));
    }
}
