//! Connection settings for the HTTP client.

use std::str::FromStr;
use std::time::Duration;

use envconfig::Envconfig;
use reqwest::Url;

const DEFAULT_URL: &str = "http://127.0.0.1:2113/";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors returned while building [`Settings`].
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    /// The connection string is not a valid url.
    #[error("invalid connection string: {0}")]
    InvalidUrl(String),

    /// Only `http` and `https` are supported.
    #[error("unsupported scheme '{0}', expected http or https")]
    UnsupportedScheme(String),

    /// A query parameter of the connection string has an invalid value.
    #[error("invalid value '{value}' for connection parameter '{name}'")]
    InvalidParameter {
        /// Name of the parameter.
        name: String,
        /// Value that could not be parsed.
        value: String,
    },

    /// Loading settings from the environment failed.
    #[error("failed to load settings from environment: {0}")]
    Env(#[from] envconfig::Error),
}

/// Credentials used for basic authentication against the server.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    /// The user name.
    pub username: String,
    /// The password.
    pub password: String,
}

impl Credentials {
    /// Creates new credentials.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Settings used by [`http::Client`](crate::http::Client) to reach the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Base url of the server HTTP API.
    pub base_url: Url,
    /// Default credentials, sent with every request.
    pub credentials: Option<Credentials>,
    /// Timeout applied to every request; keep it above any long-poll duration.
    pub request_timeout: Duration,
    /// Require the request to be served by the cluster master.
    pub require_master: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            base_url: Url::parse(DEFAULT_URL).expect("default url is valid"),
            credentials: None,
            request_timeout: DEFAULT_TIMEOUT,
            require_master: false,
        }
    }
}

impl Settings {
    /// Sets the default credentials.
    #[must_use]
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Sets the request timeout.
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Loads the settings from the environment:
    ///
    /// - `EVENTSTORE_URL`: connection string (default: `http://127.0.0.1:2113`)
    /// - `EVENTSTORE_USERNAME` / `EVENTSTORE_PASSWORD`: optional credentials
    /// - `EVENTSTORE_TIMEOUT_MS`: optional request timeout
    /// - `EVENTSTORE_REQUIRE_MASTER`: optional, `true` or `false`
    ///
    /// Values set explicitly in the environment override the ones
    /// embedded in the connection string.
    pub fn from_env() -> Result<Self, SettingsError> {
        EnvSettings::init_from_env()?.try_into()
    }
}

impl FromStr for Settings {
    type Err = SettingsError;

    /// Parses a connection string of the form
    /// `http[s]://[user:pass@]host[:port][?timeout=<ms>&requireMaster=<bool>]`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut url = Url::parse(s).map_err(|e| SettingsError::InvalidUrl(e.to_string()))?;

        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(SettingsError::UnsupportedScheme(url.scheme().to_owned()));
        }

        let mut settings = Settings::default();

        if !url.username().is_empty() {
            settings.credentials = Some(Credentials::new(
                url.username(),
                url.password().unwrap_or_default(),
            ));
        }

        for (name, value) in url.query_pairs() {
            match name.to_ascii_lowercase().as_str() {
                "timeout" => {
                    let millis: u64 = value.parse().map_err(|_| invalid(&name, &value))?;
                    settings.request_timeout = Duration::from_millis(millis);
                },
                "requiremaster" => {
                    settings.require_master = value.parse().map_err(|_| invalid(&name, &value))?;
                },
                _ => return Err(invalid(&name, &value)),
            }
        }

        // Credentials and options are kept out of the urls built from the base one.
        url.set_query(None);
        url.set_username("")
            .and_then(|_| url.set_password(None))
            .map_err(|_| SettingsError::InvalidUrl(s.to_owned()))?;

        settings.base_url = url;

        Ok(settings)
    }
}

fn invalid(name: &str, value: &str) -> SettingsError {
    SettingsError::InvalidParameter {
        name: name.to_owned(),
        value: value.to_owned(),
    }
}

#[derive(Envconfig)]
struct EnvSettings {
    #[envconfig(from = "EVENTSTORE_URL", default = "http://127.0.0.1:2113")]
    url: String,

    #[envconfig(from = "EVENTSTORE_USERNAME")]
    username: Option<String>,

    #[envconfig(from = "EVENTSTORE_PASSWORD")]
    password: Option<String>,

    #[envconfig(from = "EVENTSTORE_TIMEOUT_MS")]
    timeout_ms: Option<u64>,

    #[envconfig(from = "EVENTSTORE_REQUIRE_MASTER")]
    require_master: Option<bool>,
}

impl TryFrom<EnvSettings> for Settings {
    type Error = SettingsError;

    fn try_from(env: EnvSettings) -> Result<Self, Self::Error> {
        let mut settings: Settings = env.url.parse()?;

        if let Some(username) = env.username {
            settings.credentials = Some(Credentials::new(
                username,
                env.password.unwrap_or_default(),
            ));
        }

        if let Some(millis) = env.timeout_ms {
            settings.request_timeout = Duration::from_millis(millis);
        }

        if let Some(require_master) = env.require_master {
            settings.require_master = require_master;
        }

        Ok(settings)
    }
}
