use std::{
    collections::{BTreeSet, HashSet},
    fs,
    path::{Path, PathBuf},
};

use anyhow::{anyhow, Context, Result};
use dispatch_orders::DispatchConfig;
use serde::Deserialize;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 8080;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub sse_enabled: bool,
    pub auth: Option<HttpAuthConfig>,
    pub cors: Option<HttpCorsConfig>,
}

#[derive(Debug, Clone)]
pub struct HttpAuthConfig {
    pub tokens: HashSet<String>,
}

#[derive(Debug, Clone)]
pub struct HttpCorsConfig {
    pub allowed_origins: Vec<String>,
}

/// Values coming from command-line flags; they win over the file.
#[derive(Debug, Default, Clone)]
pub struct CliServerOptions {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub enable_sse: Option<bool>,
    pub snapshot_path: Option<PathBuf>,
    pub tokens: Vec<String>,
    pub tokens_file: Option<PathBuf>,
    pub cors_origins: Vec<String>,
}

/// Parsed config file: the `[server]` table plus the `[dispatch]` core table.
#[derive(Debug, Clone, Default)]
pub struct FileConfig {
    pub server: FileServerConfig,
    pub dispatch: DispatchConfig,
}

#[derive(Debug, Clone, Default)]
pub struct FileServerConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub sse_enabled: Option<bool>,
    pub tokens: Vec<String>,
    pub tokens_file: Option<PathBuf>,
    pub allowed_origins: Vec<String>,
}

#[derive(Deserialize)]
struct RootConfig {
    #[serde(default)]
    server: Option<RawServerConfig>,
}

#[derive(Deserialize, Default)]
struct RawServerConfig {
    host: Option<String>,
    port: Option<u16>,
    sse_enabled: Option<bool>,
    auth: Option<RawAuthConfig>,
    cors: Option<RawCorsConfig>,
}

#[derive(Deserialize, Default)]
struct RawAuthConfig {
    #[serde(rename = "type")]
    auth_type: Option<String>,
    tokens_file: Option<String>,
    tokens: Option<Vec<String>>,
}

#[derive(Deserialize, Default)]
struct RawCorsConfig {
    allowed_origins: Option<Vec<String>>,
}

pub fn load_file_config(path: Option<&Path>) -> Result<FileConfig> {
    let Some(path) = path else {
        return Ok(FileConfig::default());
    };

    if !path.exists() {
        return Err(anyhow!("Config file {} does not exist", path.display()));
    }

    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config from {}", path.display()))?;
    let parsed: RootConfig = toml::from_str(&contents)
        .with_context(|| format!("Failed to parse TOML config {}", path.display()))?;
    let base = path.parent().unwrap_or(Path::new("."));

    let server = match parsed.server {
        Some(raw) => raw.into_file_config(base)?,
        None => FileServerConfig::default(),
    };

    Ok(FileConfig {
        server,
        dispatch: DispatchConfig::load(path)?,
    })
}

pub fn determine_server_config(
    cli: &CliServerOptions,
    file_cfg: &FileServerConfig,
    working_dir: &Path,
) -> Result<ServerConfig> {
    let host = cli
        .host
        .clone()
        .or_else(|| file_cfg.host.clone())
        .unwrap_or_else(|| DEFAULT_HOST.to_string());

    let port = cli.port.or(file_cfg.port).unwrap_or(DEFAULT_PORT);
    let sse_enabled = cli.enable_sse.or(file_cfg.sse_enabled).unwrap_or(true);

    Ok(ServerConfig {
        host,
        port,
        sse_enabled,
        auth: build_auth_config(cli, file_cfg, working_dir)?,
        cors: build_cors_config(cli, file_cfg),
    })
}

/// Applies CLI overrides that target the core rather than the transport.
pub fn apply_cli_overrides(cli: &CliServerOptions, dispatch: &mut DispatchConfig) {
    if let Some(path) = cli.snapshot_path.as_ref() {
        dispatch.store.snapshot_path = Some(path.clone());
    }
}

fn build_auth_config(
    cli: &CliServerOptions,
    file_cfg: &FileServerConfig,
    working_dir: &Path,
) -> Result<Option<HttpAuthConfig>> {
    let mut tokens: HashSet<String> = file_cfg
        .tokens
        .iter()
        .chain(&cli.tokens)
        .filter_map(|token| usable_token(token))
        .collect();

    let cli_file = cli.tokens_file.as_ref().map(|path| working_dir.join(path));
    for path in file_cfg.tokens_file.iter().chain(cli_file.iter()) {
        tokens.extend(read_tokens_file(path)?);
    }

    Ok((!tokens.is_empty()).then_some(HttpAuthConfig { tokens }))
}

/// Origins are compared exactly against the browser's `Origin` header, which
/// never carries a trailing slash.
fn build_cors_config(cli: &CliServerOptions, file_cfg: &FileServerConfig) -> Option<HttpCorsConfig> {
    let origins: BTreeSet<&str> = file_cfg
        .allowed_origins
        .iter()
        .chain(&cli.cors_origins)
        .map(|origin| origin.trim().trim_end_matches('/'))
        .filter(|origin| !origin.is_empty())
        .collect();

    (!origins.is_empty()).then(|| HttpCorsConfig {
        allowed_origins: origins.into_iter().map(str::to_owned).collect(),
    })
}

fn usable_token(raw: &str) -> Option<String> {
    let token = raw.trim();
    (!token.is_empty()).then(|| token.to_owned())
}

/// JSON tokens file: `{"tokens": ["abc", {"token": "def", "label": "ci"}]}`.
fn read_tokens_file(path: &Path) -> Result<Vec<String>> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read tokens file {}", path.display()))?;
    let parsed: TokensFile = serde_json::from_str(&contents)
        .with_context(|| format!("Failed to parse tokens file {}", path.display()))?;
    Ok(parsed
        .tokens
        .iter()
        .filter_map(|entry| usable_token(entry.token()))
        .collect())
}

impl RawServerConfig {
    fn into_file_config(self, base: &Path) -> Result<FileServerConfig> {
        let auth = self.auth.unwrap_or_default();
        if let Some(auth_type) = auth.auth_type.as_deref() {
            if auth_type != "bearer" {
                return Err(anyhow!(
                    "Unsupported auth type '{}'. Only 'bearer' is supported.",
                    auth_type
                ));
            }
        }

        Ok(FileServerConfig {
            host: self.host,
            port: self.port,
            sse_enabled: self.sse_enabled,
            tokens: auth.tokens.unwrap_or_default(),
            tokens_file: auth
                .tokens_file
                .map(|value| base.join(value)),
            allowed_origins: self
                .cors
                .and_then(|cors| cors.allowed_origins)
                .unwrap_or_default(),
        })
    }
}

#[derive(Deserialize)]
struct TokensFile {
    tokens: Vec<TokenSpec>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TokenSpec {
    Bare(String),
    Labelled { token: String },
}

impl TokenSpec {
    fn token(&self) -> &str {
        match self {
            TokenSpec::Bare(token) | TokenSpec::Labelled { token } => token,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn defaults_without_file_or_flags() {
        let config = determine_server_config(
            &CliServerOptions::default(),
            &FileServerConfig::default(),
            Path::new("."),
        )
        .expect("server config");
        assert_eq!(config.host, DEFAULT_HOST);
        assert_eq!(config.port, DEFAULT_PORT);
        assert!(config.sse_enabled);
        assert!(config.auth.is_none());
        assert!(config.cors.is_none());
    }

    #[test]
    fn file_drives_server_and_core_settings() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("dispatch.toml");
        fs::write(
            &path,
            r#"
            [server]
            host = "0.0.0.0"
            port = 9100
            sse_enabled = false

            [server.auth]
            type = "bearer"
            tokens = ["abc123"]

            [server.cors]
            allowed_origins = ["https://example.com"]

            [dispatch.store]
            snapshot_path = "orders.json"
            "#,
        )
        .expect("write config");

        let file = load_file_config(Some(&path)).expect("load config");
        let config = determine_server_config(&CliServerOptions::default(), &file.server, dir.path())
            .expect("server config");

        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9100);
        assert!(!config.sse_enabled);
        assert!(config.auth.expect("auth").tokens.contains("abc123"));
        assert_eq!(
            config.cors.expect("cors").allowed_origins,
            vec!["https://example.com".to_string()]
        );
        assert_eq!(
            file.dispatch.store.snapshot_path,
            Some(dir.path().join("orders.json"))
        );
    }

    #[test]
    fn cli_overrides_file() {
        let file = FileServerConfig {
            host: Some("0.0.0.0".into()),
            port: Some(9100),
            ..FileServerConfig::default()
        };
        let cli = CliServerOptions {
            port: Some(7000),
            enable_sse: Some(false),
            snapshot_path: Some(PathBuf::from("/tmp/orders.json")),
            ..CliServerOptions::default()
        };

        let config = determine_server_config(&cli, &file, Path::new(".")).expect("server config");
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 7000);
        assert!(!config.sse_enabled);

        let mut dispatch = DispatchConfig::default();
        apply_cli_overrides(&cli, &mut dispatch);
        assert_eq!(
            dispatch.store.snapshot_path,
            Some(PathBuf::from("/tmp/orders.json"))
        );
    }

    #[test]
    fn tokens_file_accepts_bare_and_labelled_entries() {
        let dir = tempdir().expect("tempdir");
        fs::write(
            dir.path().join("tokens.json"),
            r#"{"tokens":[" secret-token ",{"token":"ci-token","label":"ci"},{"token":""},"  "]}"#,
        )
        .expect("write tokens file");

        let cli = CliServerOptions {
            tokens_file: Some(PathBuf::from("tokens.json")),
            tokens: vec!["".into(), "flag-token".into()],
            ..CliServerOptions::default()
        };
        let config = determine_server_config(&cli, &FileServerConfig::default(), dir.path())
            .expect("server config");
        let tokens = config.auth.expect("auth").tokens;
        assert_eq!(
            tokens,
            HashSet::from(["secret-token", "ci-token", "flag-token"].map(String::from))
        );
    }

    #[test]
    fn blank_tokens_leave_auth_disabled() {
        let cli = CliServerOptions {
            tokens: vec!["   ".into()],
            ..CliServerOptions::default()
        };
        let config = determine_server_config(&cli, &FileServerConfig::default(), Path::new("."))
            .expect("server config");
        assert!(config.auth.is_none());
    }

    #[test]
    fn cors_origins_are_merged_and_normalised() {
        let file = FileServerConfig {
            allowed_origins: vec!["https://b.example/".into(), "https://a.example".into()],
            ..FileServerConfig::default()
        };
        let cli = CliServerOptions {
            cors_origins: vec!["https://b.example".into(), " ".into()],
            ..CliServerOptions::default()
        };
        let config = determine_server_config(&cli, &file, Path::new(".")).expect("server config");
        assert_eq!(
            config.cors.expect("cors").allowed_origins,
            vec!["https://a.example".to_string(), "https://b.example".to_string()]
        );
    }

    #[test]
    fn unsupported_auth_type_is_rejected() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("dispatch.toml");
        fs::write(&path, "[server.auth]\ntype = \"basic\"\n").expect("write config");
        assert!(load_file_config(Some(&path)).is_err());
    }
}
