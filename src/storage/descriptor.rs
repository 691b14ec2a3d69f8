//! Backend log connection descriptors
//!
//! Grammar: `{engine}://{host}:{port}/{path}`. A bare engine name uses the
//! engine defaults, a value that is not an engine name is a relational file
//! path, and an empty value is an ephemeral relational log.

use std::fmt;

use crate::error::{RelayError, Result};

use super::backend::Engine;

/// Parsed connection descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogDescriptor {
    pub engine: Engine,
    pub host: String,
    pub port: u16,
    /// Relational: file path (`None` = ephemeral). Document: database name.
    /// Stream: database number.
    pub path: Option<String>,
}

impl LogDescriptor {
    /// Parse a descriptor string
    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim();
        if input.is_empty() {
            return Ok(Self::defaults(Engine::Relational));
        }

        let Some((scheme, rest)) = input.split_once("://") else {
            return Ok(match Engine::from_name(input) {
                Some(engine) => Self::defaults(engine),
                None => Self::relational(input),
            });
        };

        let engine = Engine::from_name(scheme)
            .ok_or_else(|| RelayError::Config(format!("unknown log engine: {}", scheme)))?;

        match engine {
            Engine::Relational => Ok(if rest.is_empty() {
                Self::defaults(engine)
            } else {
                Self::relational(rest)
            }),
            Engine::Console | Engine::Memory => Ok(Self::defaults(engine)),
            Engine::Document | Engine::Stream => Self::parse_network(engine, rest),
        }
    }

    fn parse_network(engine: Engine, rest: &str) -> Result<Self> {
        let mut descriptor = Self::defaults(engine);
        let (authority, path) = match rest.split_once('/') {
            Some((authority, path)) => (authority, path),
            None => (rest, ""),
        };
        if !path.is_empty() {
            descriptor.path = Some(path.to_string());
        }

        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse::<u16>().map_err(|_| {
                    RelayError::Config(format!("invalid port in log descriptor: {}", port))
                })?;
                (host, Some(port))
            }
            None => (authority, None),
        };
        if !host.is_empty() {
            descriptor.host = host.to_string();
        }
        if let Some(port) = port {
            descriptor.port = port;
        }
        Ok(descriptor)
    }

    fn relational(path: &str) -> Self {
        Self {
            path: Some(shellexpand::tilde(path).to_string()),
            ..Self::defaults(Engine::Relational)
        }
    }

    /// Engine defaults: localhost and the engine's well-known port
    pub fn defaults(engine: Engine) -> Self {
        let port = match engine {
            Engine::Document => 27017,
            Engine::Stream => 6379,
            _ => 0,
        };
        Self {
            engine,
            host: "localhost".to_string(),
            port,
            path: None,
        }
    }

    /// Relational log without a file: lives in a temporary directory
    pub fn is_ephemeral(&self) -> bool {
        self.engine == Engine::Relational && self.path.is_none()
    }

    /// Driver connection URI for network engines
    pub fn connection_uri(&self) -> String {
        match self.engine {
            Engine::Document => format!("mongodb://{}:{}", self.host, self.port),
            Engine::Stream => format!(
                "redis://{}:{}/{}",
                self.host,
                self.port,
                self.path.as_deref().unwrap_or("0")
            ),
            _ => self.to_string(),
        }
    }
}

impl fmt::Display for LogDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.engine {
            Engine::Relational => write!(
                f,
                "relational://{}",
                self.path.as_deref().unwrap_or("")
            ),
            Engine::Console | Engine::Memory => write!(f, "{}://", self.engine),
            _ => write!(
                f,
                "{}://{}:{}/{}",
                self.engine,
                self.host,
                self.port,
                self.path.as_deref().unwrap_or("")
            ),
        }
    }
}
