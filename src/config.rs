//! Runtime configuration.
//!
//! Read once from the environment and carried in the request context under
//! [`CONFIG`](crate::context::CONFIG).
//!
//! | Variable | Effect |
//! |---|---|
//! | `WEFT_ENV` | `production` selects [`Mode::Production`]; anything else is development |
//! | `WEFT_ALLOW_INSECURE_HTTP_CREDENTIALS` | `1` / `true` lets bearer tokens travel over plain http |

use std::env;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Mode {
    #[default]
    Development,
    Production,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Config {
    pub mode: Mode,
    pub allow_insecure_http_credentials: bool,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let mode = match env::var("WEFT_ENV").as_deref() {
            Ok("production") => Mode::Production,
            _ => Mode::Development,
        };
        let allow_insecure_http_credentials = matches!(
            env::var("WEFT_ALLOW_INSECURE_HTTP_CREDENTIALS").as_deref(),
            Ok("1") | Ok("true")
        );
        let config = Self { mode, allow_insecure_http_credentials };
        config.validate()?;
        Ok(config)
    }

    pub fn production() -> Self {
        Self { mode: Mode::Production, ..Self::default() }
    }

    pub fn is_production(&self) -> bool {
        self.mode == Mode::Production
    }

    /// Rejects combinations that must never reach production.
    pub fn validate(&self) -> Result<()> {
        if self.is_production() && self.allow_insecure_http_credentials {
            return Err(Error::Config(
                "insecure http credentials cannot be allowed in production".into(),
            ));
        }
        Ok(())
    }
}
